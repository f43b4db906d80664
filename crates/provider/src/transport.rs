//! The process transport: drives a provider child over framed stdio RPC.
//!
//! Each message is a 4-byte big-endian length followed by a MessagePack
//! body. Values cross as [`WireEnvelope`]s, marks out-of-band. The first
//! exchange on a fresh process is a version handshake; a mismatch kills the
//! process before any real call. Stderr is drained into a bounded tail so a
//! crash can say something useful.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use gantry_core::addr::ProviderAddr;
use gantry_core::schema::ProviderSchema;
use gantry_core::value::wire::{self, WireEnvelope};
use gantry_core::value::Value;

use crate::broker::ProviderFactory;
use crate::{
  AppliedChange, ApplyRequest, PlanRequest, PlannedChange, Provider, ProviderError, PROTOCOL_VERSION,
};

/// How many trailing stderr lines a crash report carries.
const STDERR_TAIL_LINES: usize = 16;

/// Maximum accepted frame size; anything larger is a protocol violation.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
enum Request {
  Hello { version: u32 },
  GetSchema,
  ValidateProviderConfig { config: WireEnvelope },
  ConfigureProvider { config: WireEnvelope },
  ValidateResourceConfig { type_name: String, config: WireEnvelope },
  UpgradeResourceState { type_name: String, from_version: u64, raw: String },
  ReadResource { type_name: String, current: WireEnvelope, private: Option<Vec<u8>> },
  PlanResourceChange {
    type_name: String,
    prior: Option<WireEnvelope>,
    proposed: WireEnvelope,
    prior_private: Option<Vec<u8>>,
  },
  ApplyResourceChange {
    type_name: String,
    prior: Option<WireEnvelope>,
    planned: Option<WireEnvelope>,
    planned_private: Option<Vec<u8>>,
  },
  ImportResourceState { type_name: String, id: String },
  ReadDataSource { type_name: String, config: WireEnvelope },
  Stop,
  Close,
}

#[derive(Serialize, Deserialize)]
enum Response {
  Hello { version: u32 },
  Ok,
  Schema(ProviderSchema),
  Value(WireEnvelope),
  OptionalValue(Option<WireEnvelope>),
  Planned {
    planned: WireEnvelope,
    requires_replace: Vec<gantry_core::value::AttrPath>,
    planned_private: Option<Vec<u8>>,
  },
  Applied {
    new: Option<WireEnvelope>,
    private: Option<Vec<u8>>,
  },
  Error { message: String },
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, request: &Request) -> std::io::Result<()> {
  let body = rmp_serde::to_vec(request).map_err(std::io::Error::other)?;
  writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
  writer.write_all(&body).await?;
  writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Response> {
  let mut len_bytes = [0u8; 4];
  reader.read_exact(&mut len_bytes).await?;
  let len = u32::from_be_bytes(len_bytes);
  if len > MAX_FRAME {
    return Err(std::io::Error::other(format!("frame of {} bytes exceeds limit", len)));
  }
  let mut body = vec![0u8; len as usize];
  reader.read_exact(&mut body).await?;
  rmp_serde::from_slice(&body).map_err(std::io::Error::other)
}

struct Io {
  stdin: ChildStdin,
  stdout: BufReader<ChildStdout>,
  child: Child,
}

/// A provider backed by a child process.
pub struct ProcessProvider {
  addr: ProviderAddr,
  io: Mutex<Option<Io>>,
  stderr_tail: Arc<SyncMutex<VecDeque<String>>>,
}

impl ProcessProvider {
  /// Spawns the command, wires stderr collection and performs the version
  /// handshake.
  pub async fn spawn(addr: ProviderAddr, mut command: Command) -> Result<Self, ProviderError> {
    command
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| ProviderError::Start {
      addr: addr.clone(),
      message: e.to_string(),
    })?;

    let stdin = child.stdin.take().expect("stdin piped");
    let stdout = BufReader::new(child.stdout.take().expect("stdout piped"));
    let stderr = child.stderr.take().expect("stderr piped");

    let stderr_tail = Arc::new(SyncMutex::new(VecDeque::new()));
    let tail = stderr_tail.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(stderr).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
          tail.pop_front();
        }
        tail.push_back(line);
      }
    });

    let provider = ProcessProvider {
      addr,
      io: Mutex::new(Some(Io {
        stdin,
        stdout,
        child,
      })),
      stderr_tail,
    };

    match provider.call(Request::Hello { version: PROTOCOL_VERSION }).await? {
      Response::Hello { version } if version == PROTOCOL_VERSION => {
        debug!(provider = %provider.addr, version, "provider handshake complete");
        Ok(provider)
      }
      Response::Hello { version } => Err(ProviderError::ProtocolVersion {
        addr: provider.addr.clone(),
        want: PROTOCOL_VERSION,
        got: version,
      }),
      _ => Err(provider.protocol_error("unexpected handshake response")),
    }
  }

  fn tail(&self) -> Option<String> {
    let tail = self.stderr_tail.lock();
    if tail.is_empty() {
      None
    } else {
      Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
  }

  fn crash(&self) -> ProviderError {
    ProviderError::Crash {
      addr: self.addr.clone(),
      stderr_tail: self.tail(),
    }
  }

  fn protocol_error(&self, detail: &str) -> ProviderError {
    ProviderError::Protocol {
      addr: self.addr.clone(),
      detail: detail.to_string(),
    }
  }

  /// One request/response round trip. Calls are serialized per process;
  /// concurrency across resources comes from the walker, not the pipe.
  async fn call(&self, request: Request) -> Result<Response, ProviderError> {
    let mut guard = self.io.lock().await;
    let io = guard.as_mut().ok_or_else(|| ProviderError::Closed {
      addr: self.addr.clone(),
    })?;

    if write_frame(&mut io.stdin, &request).await.is_err() {
      *guard = None;
      return Err(self.crash());
    }
    match read_frame(&mut io.stdout).await {
      Ok(Response::Error { message }) => Err(ProviderError::Call {
        addr: self.addr.clone(),
        method: "rpc",
        message,
      }),
      Ok(response) => Ok(response),
      Err(_) => {
        *guard = None;
        Err(self.crash())
      }
    }
  }

  fn encode(&self, value: &Value) -> Result<WireEnvelope, ProviderError> {
    wire::encode(value).map_err(|e| self.protocol_error(&e.to_string()))
  }

  fn decode(&self, envelope: &WireEnvelope) -> Result<Value, ProviderError> {
    wire::decode(envelope).map_err(|e| self.protocol_error(&e.to_string()))
  }
}

#[async_trait]
impl Provider for ProcessProvider {
  async fn get_schema(&self) -> Result<ProviderSchema, ProviderError> {
    match self.call(Request::GetSchema).await? {
      Response::Schema(schema) => Ok(schema),
      _ => Err(self.protocol_error("expected schema response")),
    }
  }

  async fn validate_provider_config(&self, config: &Value) -> Result<(), ProviderError> {
    let config = self.encode(config)?;
    match self.call(Request::ValidateProviderConfig { config }).await? {
      Response::Ok => Ok(()),
      _ => Err(self.protocol_error("expected ok response")),
    }
  }

  async fn configure(&self, config: &Value) -> Result<(), ProviderError> {
    let config = self.encode(config)?;
    match self.call(Request::ConfigureProvider { config }).await? {
      Response::Ok => Ok(()),
      _ => Err(self.protocol_error("expected ok response")),
    }
  }

  async fn validate_resource_config(&self, type_name: &str, config: &Value) -> Result<(), ProviderError> {
    let config = self.encode(config)?;
    let request = Request::ValidateResourceConfig {
      type_name: type_name.to_string(),
      config,
    };
    match self.call(request).await? {
      Response::Ok => Ok(()),
      _ => Err(self.protocol_error("expected ok response")),
    }
  }

  async fn upgrade_resource_state(
    &self,
    type_name: &str,
    from_version: u64,
    raw: serde_json::Value,
  ) -> Result<Value, ProviderError> {
    let request = Request::UpgradeResourceState {
      type_name: type_name.to_string(),
      from_version,
      raw: raw.to_string(),
    };
    match self.call(request).await? {
      Response::Value(envelope) => self.decode(&envelope),
      _ => Err(self.protocol_error("expected value response")),
    }
  }

  async fn read_resource(
    &self,
    type_name: &str,
    current: &Value,
    private: Option<&[u8]>,
  ) -> Result<Option<Value>, ProviderError> {
    let request = Request::ReadResource {
      type_name: type_name.to_string(),
      current: self.encode(current)?,
      private: private.map(<[u8]>::to_vec),
    };
    match self.call(request).await? {
      Response::OptionalValue(None) => Ok(None),
      Response::OptionalValue(Some(envelope)) => Ok(Some(self.decode(&envelope)?)),
      _ => Err(self.protocol_error("expected optional value response")),
    }
  }

  async fn plan_resource_change(&self, request: PlanRequest) -> Result<PlannedChange, ProviderError> {
    let wire_request = Request::PlanResourceChange {
      type_name: request.type_name.clone(),
      prior: request.prior.as_ref().map(|v| self.encode(v)).transpose()?,
      proposed: self.encode(&request.proposed)?,
      prior_private: request.prior_private,
    };
    match self.call(wire_request).await? {
      Response::Planned {
        planned,
        requires_replace,
        planned_private,
      } => Ok(PlannedChange {
        planned: self.decode(&planned)?,
        requires_replace,
        planned_private,
      }),
      _ => Err(self.protocol_error("expected planned response")),
    }
  }

  async fn apply_resource_change(&self, request: ApplyRequest) -> Result<AppliedChange, ProviderError> {
    let wire_request = Request::ApplyResourceChange {
      type_name: request.type_name.clone(),
      prior: request.prior.as_ref().map(|v| self.encode(v)).transpose()?,
      planned: request.planned.as_ref().map(|v| self.encode(v)).transpose()?,
      planned_private: request.planned_private,
    };
    match self.call(wire_request).await? {
      Response::Applied { new, private } => Ok(AppliedChange {
        new: new.as_ref().map(|e| self.decode(e)).transpose()?,
        private,
      }),
      _ => Err(self.protocol_error("expected applied response")),
    }
  }

  async fn import_resource_state(&self, type_name: &str, id: &str) -> Result<Value, ProviderError> {
    let request = Request::ImportResourceState {
      type_name: type_name.to_string(),
      id: id.to_string(),
    };
    match self.call(request).await? {
      Response::Value(envelope) => self.decode(&envelope),
      _ => Err(self.protocol_error("expected value response")),
    }
  }

  async fn read_data_source(&self, type_name: &str, config: &Value) -> Result<Value, ProviderError> {
    let request = Request::ReadDataSource {
      type_name: type_name.to_string(),
      config: self.encode(config)?,
    };
    match self.call(request).await? {
      Response::Value(envelope) => self.decode(&envelope),
      _ => Err(self.protocol_error("expected value response")),
    }
  }

  async fn stop(&self) -> Result<(), ProviderError> {
    match self.call(Request::Stop).await? {
      Response::Ok => Ok(()),
      _ => Err(self.protocol_error("expected ok response")),
    }
  }

  async fn close(&self) -> Result<(), ProviderError> {
    // Best-effort goodbye, then reap the child. Errors past this point are
    // not interesting; the process is going away either way.
    let result = self.call(Request::Close).await;
    let mut guard = self.io.lock().await;
    if let Some(mut io) = guard.take() {
      if let Err(err) = io.child.wait().await {
        warn!(provider = %self.addr, error = %err, "failed to reap provider process");
      }
    }
    match result {
      Ok(_) | Err(ProviderError::Crash { .. }) => Ok(()),
      Err(other) => Err(other),
    }
  }
}

/// Starts provider binaries found under a plugin directory, named
/// `gantry-provider-<type>`.
pub struct ProcessFactory {
  plugin_dir: PathBuf,
}

impl ProcessFactory {
  pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
    ProcessFactory {
      plugin_dir: plugin_dir.into(),
    }
  }

  fn binary_path(&self, addr: &ProviderAddr) -> PathBuf {
    self.plugin_dir.join(format!("gantry-provider-{}", addr.type_name))
  }
}

#[async_trait]
impl ProviderFactory for ProcessFactory {
  async fn start(&self, addr: &ProviderAddr) -> Result<Arc<dyn Provider>, ProviderError> {
    let path = self.binary_path(addr);
    if !path.exists() {
      return Err(ProviderError::Start {
        addr: addr.clone(),
        message: format!("provider binary not found at {}", path.display()),
      });
    }
    let command = Command::new(&path);
    Ok(Arc::new(ProcessProvider::spawn(addr.clone(), command).await?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn frame_round_trip() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    write_frame(&mut client, &Request::Hello { version: 3 }).await.unwrap();
    let mut len = [0u8; 4];
    server.read_exact(&mut len).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    server.read_exact(&mut body).await.unwrap();
    let request: Request = rmp_serde::from_slice(&body).unwrap();
    assert!(matches!(request, Request::Hello { version: 3 }));

    let response = rmp_serde::to_vec(&Response::Hello { version: 3 }).unwrap();
    server.write_all(&(response.len() as u32).to_be_bytes()).await.unwrap();
    server.write_all(&response).await.unwrap();
    let got = read_frame(&mut client).await.unwrap();
    assert!(matches!(got, Response::Hello { version: 3 }));
  }

  #[tokio::test]
  async fn oversized_frame_rejected() {
    let (mut client, mut server) = tokio::io::duplex(64);
    tokio::spawn(async move {
      let huge = (MAX_FRAME + 1).to_be_bytes();
      let _ = server.write_all(&huge).await;
    });
    assert!(read_frame(&mut client).await.is_err());
  }

  #[test]
  fn factory_names_binaries_by_type() {
    let factory = ProcessFactory::new("/opt/gantry/plugins");
    let path = factory.binary_path(&ProviderAddr::default_registry("dns"));
    assert_eq!(path, PathBuf::from("/opt/gantry/plugins/gantry-provider-dns"));
  }
}
