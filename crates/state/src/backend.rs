//! The state manager and backend traits, and the state error taxonomy.
//!
//! A backend owns named workspaces; each workspace yields one state manager.
//! The engine consumes only these traits. Serial/lineage discipline is the
//! manager's job: `write` takes a document whose serial equals the base the
//! caller read, and the manager stores it bumped by one; a mismatched base
//! is a stale write and is rejected.

use async_trait::async_trait;
use std::sync::Arc;

use crate::crypto::CryptoError;
use crate::doc::{LockInfo, StateFile};

/// Name of the workspace that always exists.
pub const DEFAULT_WORKSPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
  /// The write's base serial does not match the current document.
  #[error("state has changed since this operation started (expected serial {expected}, found {actual}); refresh and retry")]
  Stale { expected: u64, actual: u64 },

  #[error("state lineage changed from {was:?} to {now:?}; refusing to overwrite unrelated state")]
  LineageChanged { was: String, now: String },

  #[error("unsupported state format version {0}")]
  UnsupportedVersion(u64),

  #[error("state document is corrupted: {0}")]
  Corrupt(#[from] serde_json::Error),

  #[error("state encryption error: {0}")]
  Encryption(#[from] CryptoError),

  #[error("state is encrypted but no encryption keys are configured")]
  EncryptedWithoutKeys,

  #[error("state is locked by {} ({}, since {})", holder.who, holder.operation, holder.created)]
  AlreadyLocked { holder: Box<LockInfo> },

  #[error("lock token does not match the currently held lock")]
  InvalidLockToken,

  #[error("workspace {0:?} does not exist")]
  NoSuchWorkspace(String),

  #[error("workspace {0:?} is not empty; pass force to delete it anyway")]
  WorkspaceNotEmpty(String),

  #[error("the default workspace cannot be deleted")]
  DeleteDefaultWorkspace,

  #[error("state backend I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Who is locking, and why; becomes the persisted [`LockInfo`].
#[derive(Debug, Clone)]
pub struct LockRequest {
  pub who: String,
  pub operation: String,
  pub info: String,
}

impl LockRequest {
  pub fn new(who: impl Into<String>, operation: impl Into<String>) -> Self {
    LockRequest {
      who: who.into(),
      operation: operation.into(),
      info: String::new(),
    }
  }
}

/// Proof of a held lock; surrender it to [`StateManager::unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

/// Reads and writes one workspace's state.
#[async_trait]
pub trait StateManager: Send + Sync {
  /// Acquires the workspace lock. Contention returns
  /// [`StateError::AlreadyLocked`] carrying the holder's metadata.
  async fn lock(&self, request: &LockRequest) -> Result<LockToken, StateError>;

  async fn unlock(&self, token: LockToken) -> Result<(), StateError>;

  /// The current document; a fresh empty state when none has been written.
  async fn read(&self) -> Result<StateFile, StateError>;

  /// Stages a new document. `state.serial` must equal the serial of the
  /// current document (the base the caller read); the staged document is
  /// stored with the serial bumped by one. Lineage must be unchanged.
  async fn write(&self, state: StateFile) -> Result<(), StateError>;

  /// Flushes the staged document to durable storage if anything was staged
  /// since the last persist. Returns whether a write happened.
  async fn persist_if_dirty(&self) -> Result<bool, StateError>;
}

/// A named-workspace store.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Applies backend-specific settings. Backends with nothing to configure
  /// accept anything.
  async fn configure(&self, _options: &serde_json::Value) -> Result<(), StateError> {
    Ok(())
  }

  /// The state manager for one workspace, creating the slot if new.
  async fn state_mgr(&self, workspace: &str) -> Result<Arc<dyn StateManager>, StateError>;

  /// All known workspaces, always including the default, sorted.
  async fn workspaces(&self) -> Result<Vec<String>, StateError>;

  /// Deletes a workspace. Refuses the default workspace always, and
  /// non-empty workspaces unless `force`.
  async fn delete_workspace(&self, name: &str, force: bool) -> Result<(), StateError>;
}

/// Serial/lineage discipline shared by every manager implementation.
pub(crate) fn check_write(current: &StateFile, incoming: &StateFile) -> Result<(), StateError> {
  if current.serial > 0 || !current.resources.is_empty() || !current.outputs.is_empty() {
    if incoming.lineage != current.lineage {
      return Err(StateError::LineageChanged {
        was: current.lineage.clone(),
        now: incoming.lineage.clone(),
      });
    }
    if incoming.serial != current.serial {
      return Err(StateError::Stale {
        expected: current.serial,
        actual: incoming.serial,
      });
    }
  }
  Ok(())
}
