//! An in-memory backend for tests and ephemeral runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::backend::{
  check_write, Backend, LockRequest, LockToken, StateError, StateManager, DEFAULT_WORKSPACE,
};
use crate::doc::{LockInfo, StateFile};

#[derive(Default)]
struct Slot {
  current: Option<StateFile>,
  persisted: Option<StateFile>,
  dirty: bool,
  lock: Option<(String, LockInfo)>,
}

/// One workspace slot held entirely in memory.
pub struct MemStateManager {
  workspace: String,
  slot: Mutex<Slot>,
}

impl MemStateManager {
  fn new(workspace: &str) -> Self {
    MemStateManager {
      workspace: workspace.to_string(),
      slot: Mutex::new(Slot::default()),
    }
  }

  /// Test hook: the last persisted document, if any.
  pub fn persisted(&self) -> Option<StateFile> {
    self.slot.lock().persisted.clone()
  }
}

#[async_trait]
impl StateManager for MemStateManager {
  async fn lock(&self, request: &LockRequest) -> Result<LockToken, StateError> {
    let mut slot = self.slot.lock();
    if let Some((_, holder)) = &slot.lock {
      return Err(StateError::AlreadyLocked {
        holder: Box::new(holder.clone()),
      });
    }
    let info = LockInfo::new(&request.operation, &request.who, &request.info, &self.workspace);
    let token = Uuid::new_v4().to_string();
    slot.lock = Some((token.clone(), info));
    Ok(LockToken(token))
  }

  async fn unlock(&self, token: LockToken) -> Result<(), StateError> {
    let mut slot = self.slot.lock();
    match &slot.lock {
      Some((held, _)) if *held == token.0 => {
        slot.lock = None;
        Ok(())
      }
      _ => Err(StateError::InvalidLockToken),
    }
  }

  async fn read(&self) -> Result<StateFile, StateError> {
    let mut slot = self.slot.lock();
    Ok(slot.current.get_or_insert_with(StateFile::empty).clone())
  }

  async fn write(&self, state: StateFile) -> Result<(), StateError> {
    let mut slot = self.slot.lock();
    let current = slot.current.get_or_insert_with(StateFile::empty);
    check_write(current, &state)?;
    let mut next = state;
    next.serial += 1;
    slot.current = Some(next);
    slot.dirty = true;
    Ok(())
  }

  async fn persist_if_dirty(&self) -> Result<bool, StateError> {
    let mut slot = self.slot.lock();
    if !slot.dirty {
      return Ok(false);
    }
    slot.persisted = slot.current.clone();
    slot.dirty = false;
    Ok(true)
  }
}

/// A backend whose workspaces live for the life of the process.
#[derive(Default)]
pub struct MemBackend {
  workspaces: Mutex<HashMap<String, Arc<MemStateManager>>>,
}

impl MemBackend {
  pub fn new() -> Self {
    MemBackend::default()
  }

  /// Typed access to a workspace's manager, for test assertions.
  pub fn manager(&self, workspace: &str) -> Arc<MemStateManager> {
    self
      .workspaces
      .lock()
      .entry(workspace.to_string())
      .or_insert_with(|| Arc::new(MemStateManager::new(workspace)))
      .clone()
  }
}

#[async_trait]
impl Backend for MemBackend {
  async fn state_mgr(&self, workspace: &str) -> Result<Arc<dyn StateManager>, StateError> {
    Ok(self.manager(workspace))
  }

  async fn workspaces(&self) -> Result<Vec<String>, StateError> {
    let mut names: Vec<String> = self.workspaces.lock().keys().cloned().collect();
    if !names.iter().any(|n| n == DEFAULT_WORKSPACE) {
      names.push(DEFAULT_WORKSPACE.to_string());
    }
    names.sort();
    Ok(names)
  }

  async fn delete_workspace(&self, name: &str, force: bool) -> Result<(), StateError> {
    if name == DEFAULT_WORKSPACE {
      return Err(StateError::DeleteDefaultWorkspace);
    }
    let mut workspaces = self.workspaces.lock();
    let Some(manager) = workspaces.get(name) else {
      return Err(StateError::NoSuchWorkspace(name.to_string()));
    };
    let slot = manager.slot.lock();
    let empty = slot
      .current
      .as_ref()
      .map(|s| s.resources.is_empty())
      .unwrap_or(true);
    drop(slot);
    if !empty && !force {
      return Err(StateError::WorkspaceNotEmpty(name.to_string()));
    }
    workspaces.remove(name);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::doc::StateInstance;
  use gantry_core::addr::InstanceAddr;
  use serde_json::json;

  #[tokio::test]
  async fn serial_bumps_on_every_write() {
    let backend = MemBackend::new();
    let mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();

    let base = mgr.read().await.unwrap();
    assert_eq!(base.serial, 0);
    let lineage = base.lineage.clone();

    let mut next = base;
    next.set_instance(
      &InstanceAddr::parse("null_resource.x").unwrap(),
      "provider[\"registry.gantry.io/gantry/null\"]",
      StateInstance::new(None, json!({"id": "yes"})),
    );
    mgr.write(next).await.unwrap();

    let after = mgr.read().await.unwrap();
    assert_eq!(after.serial, 1);
    assert_eq!(after.lineage, lineage);

    mgr.write(after.clone()).await.unwrap();
    assert_eq!(mgr.read().await.unwrap().serial, 2);
  }

  #[tokio::test]
  async fn stale_write_rejected() {
    let backend = MemBackend::new();
    let mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();

    let base = mgr.read().await.unwrap();
    let mut first = base.clone();
    first.set_instance(
      &InstanceAddr::parse("null_resource.x").unwrap(),
      "p",
      StateInstance::new(None, json!({})),
    );
    mgr.write(first).await.unwrap();

    // A second write from the same stale base must fail.
    let mut second = base;
    second.set_instance(
      &InstanceAddr::parse("null_resource.y").unwrap(),
      "p",
      StateInstance::new(None, json!({})),
    );
    let err = mgr.write(second).await.unwrap_err();
    assert!(matches!(err, StateError::Stale { .. }));
  }

  #[tokio::test]
  async fn lock_contention_names_holder() {
    let backend = MemBackend::new();
    let mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();

    let token = mgr
      .lock(&LockRequest::new("alice@laptop", "apply"))
      .await
      .unwrap();
    let err = mgr
      .lock(&LockRequest::new("bob@desktop", "plan"))
      .await
      .unwrap_err();
    match err {
      StateError::AlreadyLocked { holder } => {
        assert_eq!(holder.who, "alice@laptop");
        assert_eq!(holder.operation, "apply");
      }
      other => panic!("unexpected error: {}", other),
    }

    mgr.unlock(token).await.unwrap();
    mgr.lock(&LockRequest::new("bob@desktop", "plan")).await.unwrap();
  }

  #[tokio::test]
  async fn unlock_requires_matching_token() {
    let backend = MemBackend::new();
    let mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
    mgr.lock(&LockRequest::new("a", "apply")).await.unwrap();
    let err = mgr.unlock(LockToken("bogus".into())).await.unwrap_err();
    assert!(matches!(err, StateError::InvalidLockToken));
  }

  #[tokio::test]
  async fn persist_tracks_dirtiness() {
    let backend = MemBackend::new();
    let manager = backend.manager(DEFAULT_WORKSPACE);

    assert!(!manager.persist_if_dirty().await.unwrap());
    let state = manager.read().await.unwrap();
    manager.write(state).await.unwrap();
    assert!(manager.persist_if_dirty().await.unwrap());
    assert!(!manager.persist_if_dirty().await.unwrap());
    assert_eq!(manager.persisted().unwrap().serial, 1);
  }

  #[tokio::test]
  async fn workspaces_listed_and_deleted() {
    let backend = MemBackend::new();
    backend.state_mgr("staging").await.unwrap();
    assert_eq!(backend.workspaces().await.unwrap(), vec!["default", "staging"]);

    assert!(matches!(
      backend.delete_workspace("default", true).await.unwrap_err(),
      StateError::DeleteDefaultWorkspace
    ));
    backend.delete_workspace("staging", false).await.unwrap();
    assert!(matches!(
      backend.delete_workspace("staging", false).await.unwrap_err(),
      StateError::NoSuchWorkspace(_)
    ));
  }
}
