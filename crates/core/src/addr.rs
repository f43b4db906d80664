//! Canonical addresses for modules, resources, instances and named values.
//!
//! An address is a hierarchical name such as
//! `module.net["prod"].data.dns_record.www[0]`. Addresses are structural:
//! equality and ordering are component-wise, and the rendered form is
//! canonical (parsing then rendering is the identity). Wildcards (`*`) are
//! representable only in [`Target`] selectors; the core address types cannot
//! carry them, which keeps state and graph keys exact by construction.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The key of one expanded instance: an integer index (`count`) or a string
/// key (`for_each`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
  /// Index from a `count` expansion.
  Index(u64),
  /// Key from a `for_each` expansion.
  Str(String),
}

impl fmt::Display for InstanceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InstanceKey::Index(i) => write!(f, "[{}]", i),
      InstanceKey::Str(s) => write!(f, "[{:?}]", s),
    }
  }
}

/// One step of a module path: the call name plus the instance key if the
/// call was expanded with `for_each`/`count`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleStep {
  pub name: String,
  pub key: Option<InstanceKey>,
}

impl fmt::Display for ModuleStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "module.{}", self.name)?;
    if let Some(key) = &self.key {
      write!(f, "{}", key)?;
    }
    Ok(())
  }
}

/// A path from the root module down to a nested module. The root module is
/// the empty path.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModulePath(pub Vec<ModuleStep>);

impl ModulePath {
  /// The root module.
  pub fn root() -> Self {
    ModulePath(Vec::new())
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  /// Appends an unkeyed call step, as used before expansion.
  pub fn child(&self, name: impl Into<String>) -> Self {
    let mut steps = self.0.clone();
    steps.push(ModuleStep {
      name: name.into(),
      key: None,
    });
    ModulePath(steps)
  }

  /// Appends a keyed call step, as used after expansion.
  pub fn child_keyed(&self, name: impl Into<String>, key: Option<InstanceKey>) -> Self {
    let mut steps = self.0.clone();
    steps.push(ModuleStep { name: name.into(), key });
    ModulePath(steps)
  }

  /// The enclosing module, or `None` for the root.
  pub fn parent(&self) -> Option<Self> {
    if self.0.is_empty() {
      return None;
    }
    Some(ModulePath(self.0[..self.0.len() - 1].to_vec()))
  }

  /// Whether `other` is this module or nested somewhere beneath it.
  pub fn contains(&self, other: &ModulePath) -> bool {
    other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
  }
}

impl fmt::Display for ModulePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, step) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ".")?;
      }
      write!(f, "{}", step)?;
    }
    Ok(())
  }
}

/// Whether a resource is managed (created and destroyed by the engine) or a
/// read-only data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
  Managed,
  Data,
}

/// A resource block address, before `count`/`for_each` expansion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceAddr {
  pub module: ModulePath,
  pub mode: ResourceMode,
  pub type_name: String,
  pub name: String,
}

impl ResourceAddr {
  pub fn managed(module: ModulePath, type_name: impl Into<String>, name: impl Into<String>) -> Self {
    ResourceAddr {
      module,
      mode: ResourceMode::Managed,
      type_name: type_name.into(),
      name: name.into(),
    }
  }

  pub fn data(module: ModulePath, type_name: impl Into<String>, name: impl Into<String>) -> Self {
    ResourceAddr {
      module,
      mode: ResourceMode::Data,
      type_name: type_name.into(),
      name: name.into(),
    }
  }

  /// The module this resource is declared in.
  pub fn module_path(&self) -> &ModulePath {
    &self.module
  }

  /// The address of one realized instance of this resource.
  pub fn instance(&self, key: Option<InstanceKey>) -> InstanceAddr {
    InstanceAddr {
      resource: self.clone(),
      key,
    }
  }
}

impl fmt::Display for ResourceAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.module.is_root() {
      write!(f, "{}.", self.module)?;
    }
    if self.mode == ResourceMode::Data {
      write!(f, "data.")?;
    }
    write!(f, "{}.{}", self.type_name, self.name)
  }
}

/// The address of one realized resource instance. `key` is `None` when the
/// resource block has neither `count` nor `for_each`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceAddr {
  pub resource: ResourceAddr,
  pub key: Option<InstanceKey>,
}

impl InstanceAddr {
  /// The resource block this instance belongs to.
  pub fn parent(&self) -> &ResourceAddr {
    &self.resource
  }

  /// The same instance address under a different key.
  pub fn with_key(&self, key: Option<InstanceKey>) -> Self {
    InstanceAddr {
      resource: self.resource.clone(),
      key,
    }
  }

  pub fn module_path(&self) -> &ModulePath {
    &self.resource.module
  }
}

impl fmt::Display for InstanceAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.resource)?;
    if let Some(key) = &self.key {
      write!(f, "{}", key)?;
    }
    Ok(())
  }
}

/// A fully-qualified provider: `hostname/namespace/type`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderAddr {
  pub hostname: String,
  pub namespace: String,
  pub type_name: String,
}

impl ProviderAddr {
  /// Builds the default-registry address for a bare type name, mirroring how
  /// an unqualified `provider "null" {}` block resolves.
  pub fn default_registry(type_name: impl Into<String>) -> Self {
    ProviderAddr {
      hostname: "registry.gantry.io".to_string(),
      namespace: "gantry".to_string(),
      type_name: type_name.into(),
    }
  }

  /// Parses `type`, `namespace/type` or `hostname/namespace/type`.
  pub fn parse(src: &str) -> Result<Self, AddrParseError> {
    let parts: Vec<&str> = src.split('/').collect();
    let mk = |h: &str, n: &str, t: &str| ProviderAddr {
      hostname: h.to_string(),
      namespace: n.to_string(),
      type_name: t.to_string(),
    };
    match parts.as_slice() {
      [t] if !t.is_empty() => Ok(ProviderAddr::default_registry(*t)),
      [n, t] if !n.is_empty() && !t.is_empty() => Ok(mk("registry.gantry.io", n, t)),
      [h, n, t] if !h.is_empty() && !n.is_empty() && !t.is_empty() => Ok(mk(h, n, t)),
      _ => Err(AddrParseError::InvalidProvider(src.to_string())),
    }
  }
}

impl fmt::Display for ProviderAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.hostname, self.namespace, self.type_name)
  }
}

/// A provider configuration: a provider plus an optional alias. This is the
/// key under which resources bind to configured provider instances, rendered
/// as `provider["hostname/ns/type"].alias` in state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderConfigAddr {
  pub provider: ProviderAddr,
  pub alias: Option<String>,
}

impl ProviderConfigAddr {
  pub fn new(provider: ProviderAddr, alias: Option<String>) -> Self {
    ProviderConfigAddr { provider, alias }
  }

  /// Parses the state-file rendering `provider["host/ns/type"]` or
  /// `provider["host/ns/type"].alias`.
  pub fn parse(src: &str) -> Result<Self, AddrParseError> {
    let rest = src
      .strip_prefix("provider[\"")
      .ok_or_else(|| AddrParseError::InvalidProvider(src.to_string()))?;
    let (addr, tail) = rest
      .split_once("\"]")
      .ok_or_else(|| AddrParseError::InvalidProvider(src.to_string()))?;
    let alias = match tail {
      "" => None,
      _ => Some(
        tail
          .strip_prefix('.')
          .filter(|a| !a.is_empty())
          .ok_or_else(|| AddrParseError::InvalidProvider(src.to_string()))?
          .to_string(),
      ),
    };
    Ok(ProviderConfigAddr {
      provider: ProviderAddr::parse(addr)?,
      alias,
    })
  }
}

impl fmt::Display for ProviderConfigAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "provider[\"{}\"]", self.provider)?;
    if let Some(alias) = &self.alias {
      write!(f, ".{}", alias)?;
    }
    Ok(())
  }
}

/// Address of an output value within a module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputAddr {
  pub module: ModulePath,
  pub name: String,
}

impl fmt::Display for OutputAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.module.is_root() {
      write!(f, "{}.", self.module)?;
    }
    write!(f, "output.{}", self.name)
  }
}

/// Address of an input variable within a module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableAddr {
  pub module: ModulePath,
  pub name: String,
}

impl fmt::Display for VariableAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.module.is_root() {
      write!(f, "{}.", self.module)?;
    }
    write!(f, "var.{}", self.name)
  }
}

/// Address of a local value within a module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalAddr {
  pub module: ModulePath,
  pub name: String,
}

impl fmt::Display for LocalAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.module.is_root() {
      write!(f, "{}.", self.module)?;
    }
    write!(f, "local.{}", self.name)
  }
}

/// Errors from parsing textual addresses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
  #[error("empty address")]
  Empty,

  #[error("invalid address segment {0:?}")]
  InvalidSegment(String),

  #[error("unterminated instance key in {0:?}")]
  UnterminatedKey(String),

  #[error("invalid instance key {0:?}")]
  InvalidKey(String),

  #[error("wildcard keys are only valid in target selectors: {0:?}")]
  WildcardNotAllowed(String),

  #[error("address {0:?} names a module, not a resource")]
  NotAResource(String),

  #[error("invalid provider address {0:?}")]
  InvalidProvider(String),
}

/// A key position in a [`Target`]: a concrete key or the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
  Key(InstanceKey),
  Wildcard,
}

impl TargetKey {
  fn matches(&self, key: Option<&InstanceKey>) -> bool {
    match self {
      TargetKey::Wildcard => true,
      TargetKey::Key(want) => key == Some(want),
    }
  }
}

impl fmt::Display for TargetKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetKey::Key(k) => write!(f, "{}", k),
      TargetKey::Wildcard => write!(f, "[*]"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetModuleStep {
  name: String,
  key: Option<TargetKey>,
}

/// A user-facing selector: a module prefix, optionally narrowed to one
/// resource, either of which may use `*` in key position. Targets are the
/// only address form that may carry wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
  module: Vec<TargetModuleStep>,
  resource: Option<TargetResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetResource {
  mode: ResourceMode,
  type_name: String,
  name: String,
  key: Option<TargetKey>,
}

impl Target {
  /// Parses a selector such as `module.net[*].data.dns_record.www[0]`.
  pub fn parse(src: &str) -> Result<Self, AddrParseError> {
    let segments = lex_segments(src, true)?;
    let (module, rest) = split_module_prefix(segments, src)?;
    let module = module
      .into_iter()
      .map(|(name, key)| TargetModuleStep { name, key })
      .collect();

    let resource = match rest.as_slice() {
      [] => None,
      _ => {
        let parsed = parse_resource_segments(rest, src)?;
        Some(TargetResource {
          mode: parsed.0,
          type_name: parsed.1,
          name: parsed.2,
          key: parsed.3,
        })
      }
    };

    Ok(Target { module, resource })
  }

  /// Whether this selector matches the given resource instance. A
  /// module-only target matches everything in or below that module.
  pub fn matches_instance(&self, addr: &InstanceAddr) -> bool {
    if !self.matches_module(addr.module_path()) {
      return false;
    }
    match &self.resource {
      None => true,
      Some(res) => {
        // A resource target is exact about the module depth.
        addr.module_path().0.len() == self.module.len()
          && res.mode == addr.resource.mode
          && res.type_name == addr.resource.type_name
          && res.name == addr.resource.name
          && match &res.key {
            None => true,
            Some(tk) => tk.matches(addr.key.as_ref()),
          }
      }
    }
  }

  /// Whether this selector could match instances of the given resource
  /// block (used before expansion keys are known).
  pub fn matches_resource(&self, addr: &ResourceAddr) -> bool {
    if !self.matches_module(&addr.module) {
      return false;
    }
    match &self.resource {
      None => true,
      Some(res) => {
        addr.module.0.len() == self.module.len()
          && res.mode == addr.mode
          && res.type_name == addr.type_name
          && res.name == addr.name
      }
    }
  }

  fn matches_module(&self, path: &ModulePath) -> bool {
    if path.0.len() < self.module.len() {
      return false;
    }
    self.module.iter().zip(path.0.iter()).all(|(want, got)| {
      want.name == got.name
        && match &want.key {
          None => got.key.is_none(),
          Some(tk) => tk.matches(got.key.as_ref()),
        }
    })
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for step in &self.module {
      if !first {
        write!(f, ".")?;
      }
      first = false;
      write!(f, "module.{}", step.name)?;
      if let Some(key) = &step.key {
        write!(f, "{}", key)?;
      }
    }
    if let Some(res) = &self.resource {
      if !first {
        write!(f, ".")?;
      }
      if res.mode == ResourceMode::Data {
        write!(f, "data.")?;
      }
      write!(f, "{}.{}", res.type_name, res.name)?;
      if let Some(key) = &res.key {
        write!(f, "{}", key)?;
      }
    }
    Ok(())
  }
}

impl InstanceAddr {
  /// Parses an exact instance address. Wildcards are rejected; use
  /// [`Target::parse`] for selectors.
  pub fn parse(src: &str) -> Result<Self, AddrParseError> {
    let segments = lex_segments(src, false)?;
    let (module, rest) = split_module_prefix(segments, src)?;
    if rest.is_empty() {
      return Err(AddrParseError::NotAResource(src.to_string()));
    }
    let steps = module
      .into_iter()
      .map(|(name, key)| ModuleStep {
        name,
        key: key.map(|k| match k {
          TargetKey::Key(k) => k,
          TargetKey::Wildcard => unreachable!("wildcards rejected during lexing"),
        }),
      })
      .collect();
    let (mode, type_name, name, key) = parse_resource_segments(rest, src)?;
    let key = key.map(|k| match k {
      TargetKey::Key(k) => k,
      TargetKey::Wildcard => unreachable!("wildcards rejected during lexing"),
    });
    Ok(InstanceAddr {
      resource: ResourceAddr {
        module: ModulePath(steps),
        mode,
        type_name,
        name,
      },
      key,
    })
  }
}

impl ResourceAddr {
  /// Parses a resource block address (no instance key permitted).
  pub fn parse(src: &str) -> Result<Self, AddrParseError> {
    let inst = InstanceAddr::parse(src)?;
    if inst.key.is_some() {
      return Err(AddrParseError::InvalidKey(src.to_string()));
    }
    Ok(inst.resource)
  }
}

/// One lexed segment: an identifier plus an optional bracketed key.
type Segment = (String, Option<TargetKey>);

fn lex_segments(src: &str, allow_wildcard: bool) -> Result<Vec<Segment>, AddrParseError> {
  if src.is_empty() {
    return Err(AddrParseError::Empty);
  }
  let mut segments = Vec::new();
  let mut chars = src.chars().peekable();

  loop {
    let mut ident = String::new();
    while let Some(&c) = chars.peek() {
      if c == '.' || c == '[' {
        break;
      }
      ident.push(c);
      chars.next();
    }
    if ident.is_empty() || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
      return Err(AddrParseError::InvalidSegment(ident));
    }

    let mut key = None;
    if chars.peek() == Some(&'[') {
      chars.next();
      let mut raw = String::new();
      let mut closed = false;
      let mut in_str = false;
      for c in chars.by_ref() {
        if !in_str && c == ']' {
          closed = true;
          break;
        }
        if c == '"' {
          in_str = !in_str;
        }
        raw.push(c);
      }
      if !closed {
        return Err(AddrParseError::UnterminatedKey(src.to_string()));
      }
      key = Some(parse_key(&raw, allow_wildcard, src)?);
    }
    segments.push((ident, key));

    match chars.next() {
      None => break,
      Some('.') => continue,
      Some(_) => return Err(AddrParseError::InvalidSegment(src.to_string())),
    }
  }

  Ok(segments)
}

fn parse_key(raw: &str, allow_wildcard: bool, src: &str) -> Result<TargetKey, AddrParseError> {
  if raw == "*" {
    if allow_wildcard {
      return Ok(TargetKey::Wildcard);
    }
    return Err(AddrParseError::WildcardNotAllowed(src.to_string()));
  }
  if let Some(stripped) = raw.strip_prefix('"') {
    let inner = stripped
      .strip_suffix('"')
      .ok_or_else(|| AddrParseError::InvalidKey(raw.to_string()))?;
    return Ok(TargetKey::Key(InstanceKey::Str(inner.to_string())));
  }
  raw
    .parse::<u64>()
    .map(|i| TargetKey::Key(InstanceKey::Index(i)))
    .map_err(|_| AddrParseError::InvalidKey(raw.to_string()))
}

/// Splits `module.<name>[key]` pairs off the front of the segment list.
#[allow(clippy::type_complexity)]
fn split_module_prefix(
  segments: Vec<Segment>,
  src: &str,
) -> Result<(Vec<(String, Option<TargetKey>)>, Vec<Segment>), AddrParseError> {
  let mut module = Vec::new();
  let mut iter = segments.into_iter().peekable();
  while let Some((ident, key)) = iter.peek() {
    if ident != "module" {
      break;
    }
    if key.is_some() {
      return Err(AddrParseError::InvalidSegment(src.to_string()));
    }
    iter.next();
    let (name, key) = iter.next().ok_or_else(|| AddrParseError::InvalidSegment(src.to_string()))?;
    module.push((name, key));
  }
  Ok((module, iter.collect()))
}

/// Parses the trailing `[data.]type.name[key]` segments of an address.
fn parse_resource_segments(
  segments: Vec<Segment>,
  src: &str,
) -> Result<(ResourceMode, String, String, Option<TargetKey>), AddrParseError> {
  let mut iter = segments.into_iter();
  let first = iter.next().ok_or_else(|| AddrParseError::NotAResource(src.to_string()))?;

  let (mode, type_seg) = if first.0 == "data" {
    if first.1.is_some() {
      return Err(AddrParseError::InvalidSegment(src.to_string()));
    }
    let ty = iter.next().ok_or_else(|| AddrParseError::NotAResource(src.to_string()))?;
    (ResourceMode::Data, ty)
  } else {
    (ResourceMode::Managed, first)
  };
  if type_seg.1.is_some() {
    return Err(AddrParseError::InvalidKey(src.to_string()));
  }

  let name_seg = iter.next().ok_or_else(|| AddrParseError::NotAResource(src.to_string()))?;
  if iter.next().is_some() {
    return Err(AddrParseError::InvalidSegment(src.to_string()));
  }
  Ok((mode, type_seg.0, name_seg.0, name_seg.1))
}
