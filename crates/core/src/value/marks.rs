//! Value marks and attribute paths.
//!
//! A mark annotates a value without changing what the value is: sensitivity,
//! ephemerality, type-witness values, and deprecation. The fixed mark set
//! fits in one byte per value node; combining values unions the bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

const SENSITIVE: u8 = 1 << 0;
const EPHEMERAL: u8 = 1 << 1;
const TYPE_WITNESS: u8 = 1 << 2;
const DEPRECATED: u8 = 1 << 3;

/// The set of marks carried by one value node.
///
/// `note` holds the deprecation message when the deprecated bit is set; on
/// union the first message wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marks {
  bits: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  note: Option<String>,
}

impl Marks {
  pub fn none() -> Self {
    Marks::default()
  }

  pub fn sensitive() -> Self {
    Marks {
      bits: SENSITIVE,
      note: None,
    }
  }

  pub fn ephemeral() -> Self {
    Marks {
      bits: EPHEMERAL,
      note: None,
    }
  }

  pub fn type_witness() -> Self {
    Marks {
      bits: TYPE_WITNESS,
      note: None,
    }
  }

  pub fn deprecated(message: impl Into<String>) -> Self {
    Marks {
      bits: DEPRECATED,
      note: Some(message.into()),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.bits == 0
  }

  pub fn is_sensitive(&self) -> bool {
    self.bits & SENSITIVE != 0
  }

  pub fn is_ephemeral(&self) -> bool {
    self.bits & EPHEMERAL != 0
  }

  pub fn is_type_witness(&self) -> bool {
    self.bits & TYPE_WITNESS != 0
  }

  pub fn deprecation(&self) -> Option<&str> {
    if self.bits & DEPRECATED != 0 {
      self.note.as_deref()
    } else {
      None
    }
  }

  /// The union of two mark sets. Mark propagation under every value
  /// operation reduces to this.
  pub fn union(&self, other: &Marks) -> Marks {
    Marks {
      bits: self.bits | other.bits,
      note: self.note.clone().or_else(|| other.note.clone()),
    }
  }

  /// In-place union.
  pub fn absorb(&mut self, other: &Marks) {
    self.bits |= other.bits;
    if self.note.is_none() {
      self.note = other.note.clone();
    }
  }

  /// Removes the sensitive bit, keeping the others.
  pub fn without_sensitive(&self) -> Marks {
    Marks {
      bits: self.bits & !SENSITIVE,
      note: self.note.clone(),
    }
  }
}

impl fmt::Display for Marks {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names = Vec::new();
    if self.is_sensitive() {
      names.push("sensitive".to_string());
    }
    if self.is_ephemeral() {
      names.push("ephemeral".to_string());
    }
    if self.is_type_witness() {
      names.push("type-witness".to_string());
    }
    if self.bits & DEPRECATED != 0 {
      match &self.note {
        Some(msg) => names.push(format!("deprecated({})", msg)),
        None => names.push("deprecated".to_string()),
      }
    }
    write!(f, "{}", names.join("+"))
  }
}

/// One step into a structured value: an object attribute, a list/tuple
/// index, or a map key.
///
/// The serialized form matches the state file's path encoding: attributes as
/// `{"type":"get_attr","value":"name"}`, indices and keys both as
/// `{"type":"index","value":...}` distinguished by the JSON value kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "PathStepRepr", try_from = "PathStepRepr")]
pub enum PathStep {
  Attr(String),
  Index(u64),
  Key(String),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum PathStepRepr {
  GetAttr(String),
  Index(serde_json::Value),
}

impl From<PathStep> for PathStepRepr {
  fn from(step: PathStep) -> Self {
    match step {
      PathStep::Attr(name) => PathStepRepr::GetAttr(name),
      PathStep::Index(i) => PathStepRepr::Index(serde_json::Value::from(i)),
      PathStep::Key(k) => PathStepRepr::Index(serde_json::Value::from(k)),
    }
  }
}

impl TryFrom<PathStepRepr> for PathStep {
  type Error = String;

  fn try_from(repr: PathStepRepr) -> Result<Self, Self::Error> {
    match repr {
      PathStepRepr::GetAttr(name) => Ok(PathStep::Attr(name)),
      PathStepRepr::Index(serde_json::Value::Number(n)) => n
        .as_u64()
        .map(PathStep::Index)
        .ok_or_else(|| format!("invalid index {}", n)),
      PathStepRepr::Index(serde_json::Value::String(s)) => Ok(PathStep::Key(s)),
      PathStepRepr::Index(other) => Err(format!("invalid index step {}", other)),
    }
  }
}

impl fmt::Display for PathStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PathStep::Attr(name) => write!(f, ".{}", name),
      PathStep::Index(i) => write!(f, "[{}]", i),
      PathStep::Key(k) => write!(f, "[{:?}]", k),
    }
  }
}

/// A path from the root of a value down to one of its parts. The empty path
/// is the value itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttrPath(pub Vec<PathStep>);

impl AttrPath {
  pub fn root() -> Self {
    AttrPath(Vec::new())
  }

  pub fn attr(name: impl Into<String>) -> Self {
    AttrPath(vec![PathStep::Attr(name.into())])
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn join(&self, step: PathStep) -> AttrPath {
    let mut steps = self.0.clone();
    steps.push(step);
    AttrPath(steps)
  }

  /// Whether this path is `other` or a prefix of it. Used when deciding if a
  /// changed attribute falls under a requires-replace path.
  pub fn covers(&self, other: &AttrPath) -> bool {
    other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
  }
}

impl fmt::Display for AttrPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.0.is_empty() {
      return write!(f, "(root)");
    }
    for step in &self.0 {
      write!(f, "{}", step)?;
    }
    Ok(())
  }
}

/// A mark set attached to a sub-path of a value, used wherever marks travel
/// out-of-band: the wire codec and the state file's sensitive paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedPath {
  pub path: AttrPath,
  pub marks: Marks,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn union_is_bitwise() {
    let m = Marks::sensitive().union(&Marks::ephemeral());
    assert!(m.is_sensitive());
    assert!(m.is_ephemeral());
    assert!(!m.is_type_witness());
  }

  #[test]
  fn deprecated_first_message_wins() {
    let a = Marks::deprecated("use y instead");
    let b = Marks::deprecated("other");
    assert_eq!(a.union(&b).deprecation(), Some("use y instead"));
    assert_eq!(Marks::none().union(&b).deprecation(), Some("other"));
  }

  #[test]
  fn without_sensitive_keeps_others() {
    let m = Marks::sensitive().union(&Marks::ephemeral());
    let m = m.without_sensitive();
    assert!(!m.is_sensitive());
    assert!(m.is_ephemeral());
  }

  #[test]
  fn path_step_serde_matches_state_encoding() {
    let attr = serde_json::to_value(PathStep::Attr("password".into())).unwrap();
    assert_eq!(attr, serde_json::json!({"type": "get_attr", "value": "password"}));

    let idx = serde_json::to_value(PathStep::Index(3)).unwrap();
    assert_eq!(idx, serde_json::json!({"type": "index", "value": 3}));

    let key = serde_json::to_value(PathStep::Key("a".into())).unwrap();
    assert_eq!(key, serde_json::json!({"type": "index", "value": "a"}));

    let back: PathStep = serde_json::from_value(key).unwrap();
    assert_eq!(back, PathStep::Key("a".into()));
    let back: PathStep = serde_json::from_value(idx).unwrap();
    assert_eq!(back, PathStep::Index(3));
  }

  #[test]
  fn covers_is_prefix() {
    let region = AttrPath::attr("region");
    let nested = region.join(PathStep::Key("az".into()));
    assert!(region.covers(&nested));
    assert!(region.covers(&region));
    assert!(!nested.covers(&region));
    assert!(AttrPath::root().covers(&region));
  }

  #[test]
  fn path_display() {
    let p = AttrPath::attr("tags").join(PathStep::Key("env".into())).join(PathStep::Index(0));
    assert_eq!(p.to_string(), ".tags[\"env\"][0]");
    assert_eq!(AttrPath::root().to_string(), "(root)");
  }
}
