//! gantry-provider: everything between the engine and provider plugins.
//!
//! A provider is an out-of-process plugin implementing CRUD for one remote
//! API. The engine sees only the [`Provider`] capability trait; the
//! [`broker`] starts processes, caches schemas, pools configured instances
//! and guarantees close-exactly-once; the [`transport`] speaks the framed
//! RPC to a child process; [`mock`] is the in-process stand-in every
//! plan/apply test drives.

pub mod broker;
pub mod mock;
pub mod transport;

use async_trait::async_trait;
use thiserror::Error;

use gantry_core::addr::ProviderAddr;
use gantry_core::schema::ProviderSchema;
use gantry_core::value::{AttrPath, Value};

/// The protocol version this engine handshakes with provider processes.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProviderError {
  #[error("provider {addr} failed to configure: {message}")]
  Configure { addr: ProviderAddr, message: String },

  #[error("provider {addr} failed during {method}: {message}")]
  Call {
    addr: ProviderAddr,
    method: &'static str,
    message: String,
  },

  #[error("provider {addr} crashed; stderr tail: {}", .stderr_tail.as_deref().unwrap_or("<none>"))]
  Crash {
    addr: ProviderAddr,
    stderr_tail: Option<String>,
  },

  #[error("provider {addr} spoke protocol version {got}, expected {want}")]
  ProtocolVersion {
    addr: ProviderAddr,
    want: u32,
    got: u32,
  },

  #[error("provider {addr} sent a malformed message: {detail}")]
  Protocol { addr: ProviderAddr, detail: String },

  #[error("provider {addr} has no schema for type {type_name:?}")]
  UnknownType {
    addr: ProviderAddr,
    type_name: String,
  },

  #[error("provider {addr} was used before Configure")]
  NotConfigured { addr: ProviderAddr },

  #[error("provider {addr} was used after Close")]
  Closed { addr: ProviderAddr },

  #[error("failed to start provider {addr}: {message}")]
  Start { addr: ProviderAddr, message: String },
}

/// Request to plan one resource change.
#[derive(Debug, Clone)]
pub struct PlanRequest {
  pub type_name: String,
  /// Refreshed prior object, absent on create.
  pub prior: Option<Value>,
  /// The proposed new object built from configuration.
  pub proposed: Value,
  pub prior_private: Option<Vec<u8>>,
}

/// A provider's answer to [`Provider::plan_resource_change`].
#[derive(Debug, Clone)]
pub struct PlannedChange {
  pub planned: Value,
  /// Attribute paths whose change forces replacement.
  pub requires_replace: Vec<AttrPath>,
  pub planned_private: Option<Vec<u8>>,
}

/// Request to apply one planned change. `planned: None` destroys.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
  pub type_name: String,
  pub prior: Option<Value>,
  pub planned: Option<Value>,
  pub planned_private: Option<Vec<u8>>,
}

/// A provider's answer to [`Provider::apply_resource_change`]. `new: None`
/// after a destroy.
#[derive(Debug, Clone)]
pub struct AppliedChange {
  pub new: Option<Value>,
  pub private: Option<Vec<u8>>,
}

/// The provider capability surface, one method per RPC.
///
/// Contract: `configure` happens before any resource call; `close` is
/// terminal and called exactly once (the broker enforces both).
#[async_trait]
pub trait Provider: Send + Sync {
  async fn get_schema(&self) -> Result<ProviderSchema, ProviderError>;

  async fn validate_provider_config(&self, config: &Value) -> Result<(), ProviderError>;

  async fn configure(&self, config: &Value) -> Result<(), ProviderError>;

  async fn validate_resource_config(&self, type_name: &str, config: &Value) -> Result<(), ProviderError>;

  /// Migrates an object written under an older schema version.
  async fn upgrade_resource_state(
    &self,
    type_name: &str,
    from_version: u64,
    raw: serde_json::Value,
  ) -> Result<Value, ProviderError>;

  /// Reads current reality for a managed object. `None` means the object is
  /// gone.
  async fn read_resource(
    &self,
    type_name: &str,
    current: &Value,
    private: Option<&[u8]>,
  ) -> Result<Option<Value>, ProviderError>;

  async fn plan_resource_change(&self, request: PlanRequest) -> Result<PlannedChange, ProviderError>;

  async fn apply_resource_change(&self, request: ApplyRequest) -> Result<AppliedChange, ProviderError>;

  /// Produces the object identified by an import id.
  async fn import_resource_state(&self, type_name: &str, id: &str) -> Result<Value, ProviderError>;

  async fn read_data_source(&self, type_name: &str, config: &Value) -> Result<Value, ProviderError>;

  /// Asks in-flight operations to return promptly.
  async fn stop(&self) -> Result<(), ProviderError>;

  /// Tears the provider down. Further calls fail.
  async fn close(&self) -> Result<(), ProviderError>;
}
