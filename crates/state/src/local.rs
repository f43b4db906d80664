//! The local filesystem backend.
//!
//! Layout under the backend root:
//!
//! ```text
//! {root}/states/
//! ├── default/
//! │   ├── state.json        # the document (or encryption envelope)
//! │   └── .lock             # flock target carrying LockInfo JSON
//! └── <workspace>/...
//! ```
//!
//! Writes are atomic: stage to `state.json.tmp`, fsync, rename into place.
//! Locking is an advisory file lock holding the lock-info document, so a
//! contending process can report who is in the way.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{
  check_write, Backend, LockRequest, LockToken, StateError, StateManager, DEFAULT_WORKSPACE,
};
use crate::crypto::{self, KeyProvider};
use crate::doc::{LockInfo, StateFile, STATE_VERSION};

const STATES_DIR: &str = "states";
const STATE_FILENAME: &str = "state.json";
const LOCK_FILENAME: &str = ".lock";

/// A backend rooted at a directory, one subdirectory per workspace.
pub struct LocalBackend {
  root: PathBuf,
  keys: Option<Arc<dyn KeyProvider>>,
}

impl LocalBackend {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    LocalBackend {
      root: root.into(),
      keys: None,
    }
  }

  /// Enables envelope encryption for every workspace of this backend.
  pub fn with_encryption(mut self, keys: Arc<dyn KeyProvider>) -> Self {
    self.keys = Some(keys);
    self
  }

  fn workspace_dir(&self, workspace: &str) -> PathBuf {
    self.root.join(STATES_DIR).join(workspace)
  }
}

#[async_trait]
impl Backend for LocalBackend {
  async fn state_mgr(&self, workspace: &str) -> Result<Arc<dyn StateManager>, StateError> {
    let dir = self.workspace_dir(workspace);
    fs::create_dir_all(&dir)?;
    Ok(Arc::new(FileStateManager {
      dir,
      keys: self.keys.clone(),
      inner: Mutex::new(Inner::default()),
    }))
  }

  async fn workspaces(&self) -> Result<Vec<String>, StateError> {
    let mut names = vec![DEFAULT_WORKSPACE.to_string()];
    let states = self.root.join(STATES_DIR);
    if states.is_dir() {
      for entry in fs::read_dir(&states)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
          let name = entry.file_name().to_string_lossy().into_owned();
          if name != DEFAULT_WORKSPACE {
            names.push(name);
          }
        }
      }
    }
    names.sort();
    Ok(names)
  }

  async fn delete_workspace(&self, name: &str, force: bool) -> Result<(), StateError> {
    if name == DEFAULT_WORKSPACE {
      return Err(StateError::DeleteDefaultWorkspace);
    }
    let dir = self.workspace_dir(name);
    if !dir.is_dir() {
      return Err(StateError::NoSuchWorkspace(name.to_string()));
    }
    if !force {
      let state_path = dir.join(STATE_FILENAME);
      if state_path.exists() {
        let state = read_document(&state_path, self.keys.as_deref())?;
        if !state.resources.is_empty() {
          return Err(StateError::WorkspaceNotEmpty(name.to_string()));
        }
      }
    }
    fs::remove_dir_all(&dir)?;
    info!(workspace = name, "deleted workspace");
    Ok(())
  }
}

#[derive(Default)]
struct Inner {
  cache: Option<StateFile>,
  dirty: bool,
  held: Option<HeldLock>,
}

struct HeldLock {
  token: String,
  file: File,
}

/// State manager for one workspace directory.
pub struct FileStateManager {
  dir: PathBuf,
  keys: Option<Arc<dyn KeyProvider>>,
  inner: Mutex<Inner>,
}

impl FileStateManager {
  fn state_path(&self) -> PathBuf {
    self.dir.join(STATE_FILENAME)
  }

  fn lock_path(&self) -> PathBuf {
    self.dir.join(LOCK_FILENAME)
  }

  fn load_current(&self, inner: &mut Inner) -> Result<StateFile, StateError> {
    if let Some(cached) = &inner.cache {
      return Ok(cached.clone());
    }
    let state = match self.state_path().exists() {
      true => read_document(&self.state_path(), self.keys.as_deref())?,
      false => StateFile::empty(),
    };
    inner.cache = Some(state.clone());
    Ok(state)
  }

  fn read_contention(&self) -> StateError {
    if let Ok(mut file) = File::open(self.lock_path()) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok() {
        if let Ok(holder) = serde_json::from_str::<LockInfo>(&contents) {
          return StateError::AlreadyLocked {
            holder: Box::new(holder),
          };
        }
      }
    }
    // Metadata unreadable; synthesize a holder so the caller still gets the
    // lock path in the message.
    StateError::AlreadyLocked {
      holder: Box::new(LockInfo::new(
        "unknown",
        "unknown",
        "",
        &self.lock_path().display().to_string(),
      )),
    }
  }
}

#[async_trait]
impl StateManager for FileStateManager {
  async fn lock(&self, request: &LockRequest) -> Result<LockToken, StateError> {
    let mut inner = self.inner.lock();
    if inner.held.is_some() {
      return Err(self.read_contention());
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(self.lock_path())?;

    if let Err(err) = try_lock_exclusive(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        drop(file);
        return Err(self.read_contention());
      }
      return Err(err.into());
    }

    let info = LockInfo::new(
      &request.operation,
      &request.who,
      &request.info,
      &self.state_path().display().to_string(),
    );
    file.set_len(0)?;
    let mut writer = io::BufWriter::new(&file);
    serde_json::to_writer_pretty(&mut writer, &info)?;
    writer.flush()?;
    drop(writer);

    let token = Uuid::new_v4().to_string();
    debug!(operation = %request.operation, who = %request.who, "acquired state lock");
    inner.held = Some(HeldLock {
      token: token.clone(),
      file,
    });
    Ok(LockToken(token))
  }

  async fn unlock(&self, token: LockToken) -> Result<(), StateError> {
    let mut inner = self.inner.lock();
    match &inner.held {
      Some(held) if held.token == token.0 => {
        held.file.set_len(0)?;
        inner.held = None; // dropping the handle releases the flock
        debug!("released state lock");
        Ok(())
      }
      _ => Err(StateError::InvalidLockToken),
    }
  }

  async fn read(&self) -> Result<StateFile, StateError> {
    let mut inner = self.inner.lock();
    self.load_current(&mut inner)
  }

  async fn write(&self, state: StateFile) -> Result<(), StateError> {
    let mut inner = self.inner.lock();
    let current = self.load_current(&mut inner)?;
    check_write(&current, &state)?;
    let mut next = state;
    next.serial += 1;
    inner.cache = Some(next);
    inner.dirty = true;
    Ok(())
  }

  async fn persist_if_dirty(&self) -> Result<bool, StateError> {
    let mut inner = self.inner.lock();
    if !inner.dirty {
      return Ok(false);
    }
    let state = inner.cache.as_ref().expect("dirty implies cached");

    let mut bytes = state.to_json()?;
    if let Some(keys) = &self.keys {
      bytes = crypto::encrypt(keys.as_ref(), &bytes)?;
    }

    let path = self.state_path();
    let tmp = self.dir.join(format!("{}.tmp", STATE_FILENAME));
    let mut file = File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;

    let serial = state.serial;
    inner.dirty = false;
    info!(serial = serial, path = %path.display(), "persisted state");
    Ok(true)
  }
}

fn read_document(path: &Path, keys: Option<&dyn KeyProvider>) -> Result<StateFile, StateError> {
  let bytes = fs::read(path)?;
  let plaintext = if crypto::is_envelope(&bytes) {
    match keys {
      Some(keys) => crypto::decrypt(keys, &bytes)?,
      None => return Err(StateError::EncryptedWithoutKeys),
    }
  } else {
    bytes
  };
  let state = StateFile::from_json(&plaintext)?;
  if state.version > STATE_VERSION {
    return Err(StateError::UnsupportedVersion(state.version));
  }
  Ok(state)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use rustix::fs::{flock, FlockOperation};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
  // Advisory locking is unix-only here; other platforms fall back to the
  // in-process mutex in FileStateManager.
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::StaticKeys;
  use crate::doc::StateInstance;
  use gantry_core::addr::InstanceAddr;
  use serde_json::json;
  use tempfile::TempDir;

  fn instance_addr() -> InstanceAddr {
    InstanceAddr::parse("null_resource.x").unwrap()
  }

  async fn write_one(mgr: &Arc<dyn StateManager>) {
    let mut state = mgr.read().await.unwrap();
    state.set_instance(
      &instance_addr(),
      "provider[\"registry.gantry.io/gantry/null\"]",
      StateInstance::new(None, json!({"id": "yes"})),
    );
    mgr.write(state).await.unwrap();
    mgr.persist_if_dirty().await.unwrap();
  }

  #[tokio::test]
  async fn write_persist_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(dir.path());
    let mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    write_one(&mgr).await;

    // A fresh manager over the same directory sees the persisted document.
    let mgr2 = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    let state = mgr2.read().await.unwrap();
    assert_eq!(state.serial, 1);
    assert!(state.instance(&instance_addr()).is_some());
  }

  #[tokio::test]
  async fn no_temp_file_left_behind() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(dir.path());
    let mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    write_one(&mgr).await;

    let files: Vec<String> = fs::read_dir(dir.path().join("states/default"))
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
    assert!(files.contains(&"state.json".to_string()));
    assert!(!files.iter().any(|f| f.ends_with(".tmp")), "files: {:?}", files);
  }

  #[tokio::test]
  async fn lock_excludes_second_manager() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(dir.path());
    let mgr1 = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    let mgr2 = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();

    let token = mgr1.lock(&LockRequest::new("alice@host", "apply")).await.unwrap();
    let err = mgr2.lock(&LockRequest::new("bob@host", "plan")).await.unwrap_err();
    match err {
      StateError::AlreadyLocked { holder } => assert_eq!(holder.who, "alice@host"),
      other => panic!("unexpected: {}", other),
    }

    mgr1.unlock(token).await.unwrap();
    let token2 = mgr2.lock(&LockRequest::new("bob@host", "plan")).await.unwrap();
    mgr2.unlock(token2).await.unwrap();
  }

  #[tokio::test]
  async fn encrypted_round_trip_and_key_requirement() {
    let dir = TempDir::new().unwrap();
    let keys = Arc::new(StaticKeys::new("k1", [7u8; 32]));
    let backend = LocalBackend::new(dir.path()).with_encryption(keys.clone());
    let mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    write_one(&mgr).await;

    // Raw bytes on disk are an envelope, not the document.
    let raw = fs::read(dir.path().join("states/default/state.json")).unwrap();
    assert!(crypto::is_envelope(&raw));
    assert!(!String::from_utf8_lossy(&raw).contains("null_resource"));

    // Reading without keys fails closed.
    let plain_backend = LocalBackend::new(dir.path());
    let plain_mgr = plain_backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    assert!(matches!(
      plain_mgr.read().await.unwrap_err(),
      StateError::EncryptedWithoutKeys
    ));

    // Reading with keys round-trips.
    let enc_mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    let state = enc_mgr.read().await.unwrap();
    assert!(state.instance(&instance_addr()).is_some());
  }

  #[tokio::test]
  async fn delete_workspace_honors_force() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(dir.path());
    let mgr = backend.state_mgr("staging").await.unwrap();
    write_one(&mgr).await;

    assert!(matches!(
      backend.delete_workspace("staging", false).await.unwrap_err(),
      StateError::WorkspaceNotEmpty(_)
    ));
    backend.delete_workspace("staging", true).await.unwrap();
    assert_eq!(backend.workspaces().await.unwrap(), vec!["default"]);
  }
}
