//! gantry-state: state persistence for the gantry engine.
//!
//! A state document records what has already been created. This crate owns:
//! - `doc`: the version-4 JSON document model, round-tripping unknown keys
//! - `backend`: the backend and state-manager traits plus the error taxonomy
//! - `local`: the filesystem backend with lock files and atomic writes
//! - `mem`: an in-memory backend for tests
//! - `crypto`: optional envelope encryption with key rotation
//!
//! Everything above this crate consumes only the traits; engines never see a
//! filesystem path or a cipher.

pub mod backend;
pub mod crypto;
pub mod doc;
pub mod local;
pub mod mem;

pub use backend::{Backend, LockRequest, LockToken, StateError, StateManager};
pub use doc::{InstanceStatus, LockInfo, OutputState, StateFile, StateInstance, StateResource};
