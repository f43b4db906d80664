//! The persisted state document.
//!
//! The on-disk shape is the version-4 JSON format:
//!
//! ```json
//! {
//!   "version": 4,
//!   "terraform_version": "…",
//!   "serial": 7,
//!   "lineage": "uuid",
//!   "outputs": {"name": {"value": …, "type": …, "sensitive": true}},
//!   "resources": [{"mode": "managed", "type": "…", "name": "…",
//!                  "provider": "provider[\"…\"]", "instances": [...]}],
//!   "check_results": []
//! }
//! ```
//!
//! Keys this version does not understand are preserved and written back
//! unchanged, so newer engines can round-trip through older ones.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gantry_core::addr::{InstanceAddr, InstanceKey, ProviderConfigAddr, ResourceAddr, ResourceMode};
use gantry_core::value::{AttrPath, Ty};

/// The state format version this engine reads and writes.
pub const STATE_VERSION: u64 = 4;

/// Status of an instance object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
  #[default]
  #[serde(skip)]
  Ready,
  Tainted,
}

impl InstanceStatus {
  pub fn is_ready(&self) -> bool {
    *self == InstanceStatus::Ready
  }
}

/// One realized object of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInstance {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub index_key: Option<InstanceKey>,
  /// Set when this object is deposed: still owned by the resource address
  /// but displaced from the primary slot during create-before-destroy.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deposed: Option<String>,
  #[serde(default)]
  pub schema_version: u64,
  /// Attribute object as JSON; typed interpretation happens against the
  /// provider schema at the engine layer.
  pub attributes: serde_json::Value,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub sensitive_attributes: Vec<AttrPath>,
  /// Opaque provider-scoped payload, base64 in the document.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub private: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<String>,
  #[serde(default, skip_serializing_if = "InstanceStatus::is_ready")]
  pub status: InstanceStatus,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub create_before_destroy: bool,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StateInstance {
  pub fn new(index_key: Option<InstanceKey>, attributes: serde_json::Value) -> Self {
    StateInstance {
      index_key,
      deposed: None,
      schema_version: 0,
      attributes,
      sensitive_attributes: Vec::new(),
      private: None,
      dependencies: Vec::new(),
      status: InstanceStatus::Ready,
      create_before_destroy: false,
      extra: serde_json::Map::new(),
    }
  }

  pub fn is_primary(&self) -> bool {
    self.deposed.is_none()
  }
}

/// All instances of one resource block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResource {
  pub mode: ResourceMode,
  #[serde(rename = "type")]
  pub type_name: String,
  pub name: String,
  /// Rendered [`ProviderConfigAddr`].
  pub provider: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub instances: Vec<StateInstance>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StateResource {
  pub fn addr(&self) -> ResourceAddr {
    // Module-scoped resources carry their module in `extra["module"]` the
    // way the original format does; absent means root.
    let module = self
      .extra
      .get("module")
      .and_then(|m| m.as_str())
      .and_then(|m| InstanceAddr::parse(&format!("{}.x.x", m)).ok())
      .map(|a| a.resource.module)
      .unwrap_or_default();
    ResourceAddr {
      module,
      mode: self.mode,
      type_name: self.type_name.clone(),
      name: self.name.clone(),
    }
  }

  pub fn provider_addr(&self) -> Option<ProviderConfigAddr> {
    ProviderConfigAddr::parse(&self.provider).ok()
  }
}

/// A root output recorded in state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
  pub value: serde_json::Value,
  #[serde(rename = "type")]
  pub ty: Ty,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub sensitive: bool,
}

/// The lock file document, written next to (or instead of) remote locks:
/// `{"ID": …, "Operation": …, "Who": "user@host", "Created": RFC3339, …}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
  #[serde(rename = "ID")]
  pub id: String,
  #[serde(rename = "Operation")]
  pub operation: String,
  #[serde(rename = "Who")]
  pub who: String,
  #[serde(rename = "Version")]
  pub version: String,
  #[serde(rename = "Created")]
  pub created: DateTime<Utc>,
  #[serde(rename = "Info")]
  pub info: String,
  #[serde(rename = "Path")]
  pub path: String,
}

impl LockInfo {
  pub fn new(operation: &str, who: &str, info: &str, path: &str) -> Self {
    LockInfo {
      id: Uuid::new_v4().to_string(),
      operation: operation.to_string(),
      who: who.to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      created: Utc::now(),
      info: info.to_string(),
      path: path.to_string(),
    }
  }
}

/// The whole state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
  pub version: u64,
  pub terraform_version: String,
  pub serial: u64,
  pub lineage: String,
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub outputs: IndexMap<String, OutputState>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub resources: Vec<StateResource>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub check_results: Vec<serde_json::Value>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StateFile {
  /// A fresh, empty state with a new lineage and serial 0. The first
  /// persisted write bumps the serial to 1.
  pub fn empty() -> Self {
    StateFile {
      version: STATE_VERSION,
      terraform_version: env!("CARGO_PKG_VERSION").to_string(),
      serial: 0,
      lineage: Uuid::new_v4().to_string(),
      outputs: IndexMap::new(),
      resources: Vec::new(),
      check_results: Vec::new(),
      extra: serde_json::Map::new(),
    }
  }

  pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }

  pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = serde_json::to_vec_pretty(self)?;
    out.push(b'\n');
    Ok(out)
  }

  fn resource_entry(&self, addr: &ResourceAddr) -> Option<&StateResource> {
    self.resources.iter().find(|r| r.addr() == *addr)
  }

  fn resource_entry_mut(&mut self, addr: &ResourceAddr, provider: &str) -> &mut StateResource {
    if let Some(pos) = self.resources.iter().position(|r| r.addr() == *addr) {
      return &mut self.resources[pos];
    }
    let mut extra = serde_json::Map::new();
    if !addr.module.is_root() {
      extra.insert("module".to_string(), serde_json::Value::from(addr.module.to_string()));
    }
    self.resources.push(StateResource {
      mode: addr.mode,
      type_name: addr.type_name.clone(),
      name: addr.name.clone(),
      provider: provider.to_string(),
      instances: Vec::new(),
      extra,
    });
    self.resources.last_mut().expect("just pushed")
  }

  /// The primary (non-deposed) object at an instance address.
  pub fn instance(&self, addr: &InstanceAddr) -> Option<&StateInstance> {
    self
      .resource_entry(&addr.resource)?
      .instances
      .iter()
      .find(|i| i.index_key == addr.key && i.is_primary())
  }

  /// All deposed objects held by an instance address, keyed by deposed id.
  pub fn deposed(&self, addr: &InstanceAddr) -> Vec<(&str, &StateInstance)> {
    match self.resource_entry(&addr.resource) {
      None => Vec::new(),
      Some(resource) => resource
        .instances
        .iter()
        .filter(|i| i.index_key == addr.key)
        .filter_map(|i| i.deposed.as_deref().map(|d| (d, i)))
        .collect(),
    }
  }

  /// Writes the primary object at an address, replacing any previous
  /// primary. Instance addresses stay unique by construction.
  pub fn set_instance(&mut self, addr: &InstanceAddr, provider: &str, instance: StateInstance) {
    let entry = self.resource_entry_mut(&addr.resource, provider);
    entry.provider = provider.to_string();
    entry
      .instances
      .retain(|i| !(i.index_key == addr.key && i.is_primary()));
    entry.instances.push(instance);
    entry.instances.sort_by(|a, b| a.index_key.cmp(&b.index_key));
  }

  /// Removes the primary object at an address. Returns whether anything was
  /// removed. Empty resource entries are pruned.
  pub fn remove_instance(&mut self, addr: &InstanceAddr) -> bool {
    let mut removed = false;
    if let Some(pos) = self.resources.iter().position(|r| r.addr() == addr.resource) {
      let resource = &mut self.resources[pos];
      let before = resource.instances.len();
      resource
        .instances
        .retain(|i| !(i.index_key == addr.key && i.is_primary()));
      removed = resource.instances.len() != before;
      if resource.instances.is_empty() {
        self.resources.remove(pos);
      }
    }
    removed
  }

  /// Moves the primary object at an address into a deposed slot, returning
  /// the generated deposed key. No-op when there is no primary.
  pub fn depose_instance(&mut self, addr: &InstanceAddr) -> Option<String> {
    let resource = self.resources.iter_mut().find(|r| r.addr() == addr.resource)?;
    let instance = resource
      .instances
      .iter_mut()
      .find(|i| i.index_key == addr.key && i.is_primary())?;
    let key = format!("{:08x}", rand::random::<u32>());
    instance.deposed = Some(key.clone());
    Some(key)
  }

  /// Removes one deposed object by key.
  pub fn remove_deposed(&mut self, addr: &InstanceAddr, deposed_key: &str) -> bool {
    let mut removed = false;
    if let Some(pos) = self.resources.iter().position(|r| r.addr() == addr.resource) {
      let resource = &mut self.resources[pos];
      let before = resource.instances.len();
      resource
        .instances
        .retain(|i| !(i.index_key == addr.key && i.deposed.as_deref() == Some(deposed_key)));
      removed = resource.instances.len() != before;
      if resource.instances.is_empty() {
        self.resources.remove(pos);
      }
    }
    removed
  }

  /// Drops a whole resource (all instances, deposed included) from state
  /// without touching the remote object. This is the Forget action.
  pub fn forget_resource(&mut self, addr: &ResourceAddr) -> bool {
    let before = self.resources.len();
    self.resources.retain(|r| r.addr() != *addr);
    self.resources.len() != before
  }

  /// Every primary instance address currently in state, in address order.
  pub fn all_instances(&self) -> Vec<InstanceAddr> {
    let mut out: Vec<InstanceAddr> = self
      .resources
      .iter()
      .flat_map(|r| {
        let addr = r.addr();
        r.instances
          .iter()
          .filter(|i| i.is_primary())
          .map(move |i| addr.instance(i.index_key.clone()))
      })
      .collect();
    out.sort();
    out
  }

  /// Resource addresses that hold deposed objects.
  pub fn resources_with_deposed(&self) -> Vec<ResourceAddr> {
    let mut out: Vec<ResourceAddr> = self
      .resources
      .iter()
      .filter(|r| r.instances.iter().any(|i| !i.is_primary()))
      .map(|r| r.addr())
      .collect();
    out.sort();
    out.dedup();
    out
  }

  pub fn set_output(&mut self, name: &str, value: serde_json::Value, ty: Ty, sensitive: bool) {
    self.outputs.insert(
      name.to_string(),
      OutputState {
        value,
        ty,
        sensitive,
      },
    );
  }
}
