//! Dynamically typed values.
//!
//! A [`Value`] is a tagged union of null, unknown, primitives, collections
//! and structural types, where every node carries a [`Marks`] set. The two
//! rules everything else falls out of:
//!
//! - marks propagate: any operation over values yields a result carrying the
//!   union of the operand marks (deep marks included, so sensitivity is
//!   sticky across derivation), and
//! - unknown absorbs: any operation with an unknown operand yields unknown of
//!   the operation's result type.
//!
//! Numbers are arbitrary-precision rationals, so equality is exact and there
//! is no NaN. Structural `==` (the `PartialEq` impl) is for state comparison
//! and tests; the *operator* semantics of equality, where unknowns only ever
//! equal themselves under identity, is [`Value::equal`].

mod json;
mod marks;
mod ty;
pub mod wire;

use std::collections::BTreeMap;
use std::fmt;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use thiserror::Error;

pub use json::{value_from_json, value_to_json, JsonError};
pub use marks::{AttrPath, MarkedPath, Marks, PathStep};
pub use ty::{Ty, UnifyError};

/// The payload of a value node.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
  /// A known absence, typed so downstream unification still has something
  /// to work with.
  Null(Ty),
  /// A value that will only be known after some resource is applied.
  Unknown(Ty),
  Bool(bool),
  Number(BigRational),
  String(String),
  /// Element type plus elements; the type makes empty lists well-typed.
  List(Ty, Vec<Value>),
  Set(Ty, Vec<Value>),
  Map(Ty, BTreeMap<String, Value>),
  Tuple(Vec<Value>),
  Object(BTreeMap<String, Value>),
  /// Opaque provider-scoped payload.
  Capsule(String, Vec<u8>),
}

/// A dynamically typed, marked value.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
  kind: ValueKind,
  marks: Marks,
}

/// Errors from value operations. The evaluator turns these into diagnostics
/// carrying the source range of the offending expression.
#[derive(Debug, Error, PartialEq)]
pub enum OpError {
  #[error("value of type {ty} has no attribute {name:?}")]
  NoSuchAttr { ty: Ty, name: String },

  #[error("value of type {ty} cannot be indexed")]
  NotIndexable { ty: Ty },

  #[error("invalid index {index} for value of type {ty}")]
  InvalidIndex { ty: Ty, index: String },

  #[error("attempt to access attribute {name:?} on a null value")]
  NullAttr { name: String },

  #[error("attempt to index a null value")]
  NullIndex,

  #[error("operand of type {ty} where {want} is required")]
  WrongOperandType { ty: Ty, want: Ty },

  #[error("division by zero")]
  DivByZero,

  #[error("cannot render value of type {ty} into a string template")]
  NotTemplatable { ty: Ty },
}

/// A structural type-check failure, positioned by path.
#[derive(Debug, Error, PartialEq)]
pub enum TypeCheckError {
  #[error("at {path}: expected {want}, got {got}")]
  Mismatch { path: AttrPath, want: Ty, got: Ty },

  #[error("at {path}: required attribute {name:?} is missing")]
  MissingAttr { path: AttrPath, name: String },

  #[error("at {path}: unexpected attribute {name:?}")]
  ExtraAttr { path: AttrPath, name: String },

  #[error("at {path}: expected a tuple of {want} elements, got {got}")]
  TupleArity { path: AttrPath, want: usize, got: usize },
}

impl Value {
  // --- constructors ---

  pub fn null(ty: Ty) -> Value {
    Value::of(ValueKind::Null(ty))
  }

  pub fn unknown(ty: Ty) -> Value {
    Value::of(ValueKind::Unknown(ty))
  }

  pub fn bool(b: bool) -> Value {
    Value::of(ValueKind::Bool(b))
  }

  pub fn int(i: i64) -> Value {
    Value::of(ValueKind::Number(BigRational::from(BigInt::from(i))))
  }

  pub fn number(n: BigRational) -> Value {
    Value::of(ValueKind::Number(n))
  }

  pub fn string(s: impl Into<String>) -> Value {
    Value::of(ValueKind::String(s.into()))
  }

  pub fn list(elem: Ty, items: Vec<Value>) -> Value {
    Value::of(ValueKind::List(elem, items))
  }

  /// Builds a set, deduplicating structurally equal elements.
  pub fn set(elem: Ty, items: Vec<Value>) -> Value {
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
      if !unique.contains(&item) {
        unique.push(item);
      }
    }
    Value::of(ValueKind::Set(elem, unique))
  }

  pub fn map(elem: Ty, entries: BTreeMap<String, Value>) -> Value {
    Value::of(ValueKind::Map(elem, entries))
  }

  pub fn tuple(items: Vec<Value>) -> Value {
    Value::of(ValueKind::Tuple(items))
  }

  pub fn object(attrs: impl IntoIterator<Item = (String, Value)>) -> Value {
    Value::of(ValueKind::Object(attrs.into_iter().collect()))
  }

  pub fn empty_object() -> Value {
    Value::of(ValueKind::Object(BTreeMap::new()))
  }

  pub fn capsule(tag: impl Into<String>, payload: Vec<u8>) -> Value {
    Value::of(ValueKind::Capsule(tag.into(), payload))
  }

  fn of(kind: ValueKind) -> Value {
    Value {
      kind,
      marks: Marks::none(),
    }
  }

  // --- inspection ---

  pub fn kind(&self) -> &ValueKind {
    &self.kind
  }

  pub fn is_unknown(&self) -> bool {
    matches!(self.kind, ValueKind::Unknown(_))
  }

  pub fn is_null(&self) -> bool {
    matches!(self.kind, ValueKind::Null(_))
  }

  pub fn as_bool(&self) -> Option<bool> {
    match &self.kind {
      ValueKind::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match &self.kind {
      ValueKind::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_number(&self) -> Option<&BigRational> {
    match &self.kind {
      ValueKind::Number(n) => Some(n),
      _ => None,
    }
  }

  /// Non-negative integer view of a number value, used by `count`.
  pub fn as_u64(&self) -> Option<u64> {
    let n = self.as_number()?;
    if !n.is_integer() || n.is_negative() {
      return None;
    }
    u64::try_from(n.to_integer()).ok()
  }

  pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
    match &self.kind {
      ValueKind::Object(attrs) => Some(attrs),
      _ => None,
    }
  }

  /// The type of this value. Collections infer nothing: their stored element
  /// type is authoritative, so empty collections stay well-typed.
  pub fn ty(&self) -> Ty {
    match &self.kind {
      ValueKind::Null(ty) | ValueKind::Unknown(ty) => ty.clone(),
      ValueKind::Bool(_) => Ty::Bool,
      ValueKind::Number(_) => Ty::Number,
      ValueKind::String(_) => Ty::String,
      ValueKind::List(elem, _) => Ty::list(elem.clone()),
      ValueKind::Set(elem, _) => Ty::set(elem.clone()),
      ValueKind::Map(elem, _) => Ty::map(elem.clone()),
      ValueKind::Tuple(items) => Ty::Tuple(items.iter().map(Value::ty).collect()),
      ValueKind::Object(attrs) => Ty::object(attrs.iter().map(|(k, v)| (k.clone(), v.ty()))),
      ValueKind::Capsule(tag, _) => Ty::Capsule(tag.clone()),
    }
  }

  // --- marks ---

  pub fn marks(&self) -> &Marks {
    &self.marks
  }

  pub fn with_marks(mut self, marks: Marks) -> Value {
    self.marks.absorb(&marks);
    self
  }

  pub fn mark_sensitive(self) -> Value {
    self.with_marks(Marks::sensitive())
  }

  /// Removes this node's marks, returning them. Child marks are untouched.
  pub fn unmark(mut self) -> (Value, Marks) {
    let marks = std::mem::take(&mut self.marks);
    (self, marks)
  }

  /// The union of every mark in this value tree. Operators use this so that
  /// sensitivity on any sub-path of an operand makes the derived result
  /// sensitive.
  pub fn aggregate_marks(&self) -> Marks {
    let mut acc = self.marks.clone();
    self.for_each_child(&mut |child| acc.absorb(&child.aggregate_marks()));
    acc
  }

  pub fn has_sensitive(&self) -> bool {
    self.aggregate_marks().is_sensitive()
  }

  fn for_each_child(&self, f: &mut impl FnMut(&Value)) {
    match &self.kind {
      ValueKind::List(_, items) | ValueKind::Set(_, items) | ValueKind::Tuple(items) => {
        items.iter().for_each(&mut *f)
      }
      ValueKind::Map(_, entries) => entries.values().for_each(&mut *f),
      ValueKind::Object(attrs) => attrs.values().for_each(&mut *f),
      _ => {}
    }
  }

  /// Splits the value into an unmarked tree plus the (path, marks) pairs
  /// needed to reconstruct it. This is how marks travel out-of-band on the
  /// wire and into the state file's sensitive paths.
  pub fn strip_marks(&self) -> (Value, Vec<MarkedPath>) {
    let mut paths = Vec::new();
    let stripped = self.strip_marks_at(&AttrPath::root(), &mut paths);
    (stripped, paths)
  }

  fn strip_marks_at(&self, path: &AttrPath, out: &mut Vec<MarkedPath>) -> Value {
    if !self.marks.is_empty() {
      out.push(MarkedPath {
        path: path.clone(),
        marks: self.marks.clone(),
      });
    }
    let kind = match &self.kind {
      ValueKind::List(elem, items) => ValueKind::List(
        elem.clone(),
        items
          .iter()
          .enumerate()
          .map(|(i, v)| v.strip_marks_at(&path.join(PathStep::Index(i as u64)), out))
          .collect(),
      ),
      ValueKind::Set(elem, items) => ValueKind::Set(
        elem.clone(),
        items
          .iter()
          .enumerate()
          .map(|(i, v)| v.strip_marks_at(&path.join(PathStep::Index(i as u64)), out))
          .collect(),
      ),
      ValueKind::Tuple(items) => ValueKind::Tuple(
        items
          .iter()
          .enumerate()
          .map(|(i, v)| v.strip_marks_at(&path.join(PathStep::Index(i as u64)), out))
          .collect(),
      ),
      ValueKind::Map(elem, entries) => ValueKind::Map(
        elem.clone(),
        entries
          .iter()
          .map(|(k, v)| {
            (
              k.clone(),
              v.strip_marks_at(&path.join(PathStep::Key(k.clone())), out),
            )
          })
          .collect(),
      ),
      ValueKind::Object(attrs) => ValueKind::Object(
        attrs
          .iter()
          .map(|(k, v)| {
            (
              k.clone(),
              v.strip_marks_at(&path.join(PathStep::Attr(k.clone())), out),
            )
          })
          .collect(),
      ),
      other => other.clone(),
    };
    Value::of(kind)
  }

  /// Re-applies out-of-band marks produced by [`Value::strip_marks`]. Paths
  /// that no longer resolve are ignored; marks never invent structure.
  pub fn apply_marked_paths(self, paths: &[MarkedPath]) -> Value {
    let mut value = self;
    for mp in paths {
      value = value.mark_at(&mp.path.0, &mp.marks);
    }
    value
  }

  fn mark_at(mut self, steps: &[PathStep], marks: &Marks) -> Value {
    let Some((first, rest)) = steps.split_first() else {
      self.marks.absorb(marks);
      return self;
    };
    match (&mut self.kind, first) {
      (ValueKind::List(_, items), PathStep::Index(i))
      | (ValueKind::Set(_, items), PathStep::Index(i))
      | (ValueKind::Tuple(items), PathStep::Index(i)) => {
        if let Some(slot) = items.get_mut(*i as usize) {
          let taken = std::mem::replace(slot, Value::null(Ty::Dynamic));
          *slot = taken.mark_at(rest, marks);
        }
      }
      (ValueKind::Map(_, entries), PathStep::Key(k)) => {
        if let Some(slot) = entries.get_mut(k) {
          let taken = std::mem::replace(slot, Value::null(Ty::Dynamic));
          *slot = taken.mark_at(rest, marks);
        }
      }
      (ValueKind::Object(attrs), PathStep::Attr(name)) => {
        if let Some(slot) = attrs.get_mut(name) {
          let taken = std::mem::replace(slot, Value::null(Ty::Dynamic));
          *slot = taken.mark_at(rest, marks);
        }
      }
      _ => {}
    }
    self
  }

  // --- operations ---

  /// Attribute access on objects and maps. Unknown absorbs; null errors.
  pub fn get_attr(&self, name: &str) -> Result<Value, OpError> {
    match &self.kind {
      ValueKind::Object(attrs) => attrs
        .get(name)
        .cloned()
        .map(|v| v.with_marks(self.marks.clone()))
        .ok_or_else(|| OpError::NoSuchAttr {
          ty: self.ty(),
          name: name.to_string(),
        }),
      ValueKind::Map(_, entries) => entries
        .get(name)
        .cloned()
        .map(|v| v.with_marks(self.marks.clone()))
        .ok_or_else(|| OpError::NoSuchAttr {
          ty: self.ty(),
          name: name.to_string(),
        }),
      ValueKind::Unknown(ty) => {
        let attr_ty = match ty {
          Ty::Object { attrs, .. } => attrs.get(name).cloned().unwrap_or(Ty::Dynamic),
          Ty::Map(elem) => (**elem).clone(),
          _ => Ty::Dynamic,
        };
        Ok(Value::unknown(attr_ty).with_marks(self.marks.clone()))
      }
      ValueKind::Null(_) => Err(OpError::NullAttr {
        name: name.to_string(),
      }),
      _ => Err(OpError::NoSuchAttr {
        ty: self.ty(),
        name: name.to_string(),
      }),
    }
  }

  /// Index access on lists, tuples and maps.
  pub fn index(&self, key: &Value) -> Result<Value, OpError> {
    if key.is_unknown() {
      let marks = self.marks.union(key.marks());
      return Ok(Value::unknown(Ty::Dynamic).with_marks(marks));
    }
    let marks = self.marks.union(key.marks());
    match &self.kind {
      ValueKind::List(_, items) | ValueKind::Tuple(items) => {
        let idx = key.as_u64().ok_or_else(|| OpError::InvalidIndex {
          ty: self.ty(),
          index: key.display_brief(),
        })?;
        items
          .get(idx as usize)
          .cloned()
          .map(|v| v.with_marks(marks))
          .ok_or_else(|| OpError::InvalidIndex {
            ty: self.ty(),
            index: idx.to_string(),
          })
      }
      ValueKind::Map(_, entries) => {
        let k = key.as_str().ok_or_else(|| OpError::InvalidIndex {
          ty: self.ty(),
          index: key.display_brief(),
        })?;
        entries
          .get(k)
          .cloned()
          .map(|v| v.with_marks(marks))
          .ok_or_else(|| OpError::InvalidIndex {
            ty: self.ty(),
            index: k.to_string(),
          })
      }
      ValueKind::Object(_) => match key.as_str() {
        Some(name) => self.get_attr(name).map(|v| v.with_marks(key.marks().clone())),
        None => Err(OpError::InvalidIndex {
          ty: self.ty(),
          index: key.display_brief(),
        }),
      },
      ValueKind::Unknown(_) => Ok(Value::unknown(Ty::Dynamic).with_marks(marks)),
      ValueKind::Null(_) => Err(OpError::NullIndex),
      _ => Err(OpError::NotIndexable { ty: self.ty() }),
    }
  }

  /// The equality *operator*: null-safe, unknown-absorbing, mark-unioning.
  /// `null == null` is true; an unknown operand makes the result unknown.
  pub fn equal(&self, other: &Value) -> Value {
    let marks = self.aggregate_marks().union(&other.aggregate_marks());
    if self.is_unknown() || other.is_unknown() {
      return Value::unknown(Ty::Bool).with_marks(marks);
    }
    let (a, _) = self.strip_marks();
    let (b, _) = other.strip_marks();
    Value::bool(a == b).with_marks(marks)
  }

  /// Arithmetic on numbers. `op` names the operation for error reporting.
  pub fn arith(&self, other: &Value, op: ArithOp) -> Result<Value, OpError> {
    let marks = self.aggregate_marks().union(&other.aggregate_marks());
    if self.is_unknown() || other.is_unknown() {
      return Ok(Value::unknown(Ty::Number).with_marks(marks));
    }
    let a = self.require_number()?;
    let b = other.require_number()?;
    let n = match op {
      ArithOp::Add => a + b,
      ArithOp::Sub => a - b,
      ArithOp::Mul => a * b,
      ArithOp::Div => {
        if b.is_zero() {
          return Err(OpError::DivByZero);
        }
        a / b
      }
    };
    Ok(Value::number(n).with_marks(marks))
  }

  /// Ordering comparison on numbers or strings.
  pub fn compare(&self, other: &Value, op: CmpOp) -> Result<Value, OpError> {
    let marks = self.aggregate_marks().union(&other.aggregate_marks());
    if self.is_unknown() || other.is_unknown() {
      return Ok(Value::unknown(Ty::Bool).with_marks(marks));
    }
    let ord = match (&self.kind, &other.kind) {
      (ValueKind::Number(a), ValueKind::Number(b)) => a.cmp(b),
      (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
      _ => {
        return Err(OpError::WrongOperandType {
          ty: other.ty(),
          want: self.ty(),
        })
      }
    };
    let b = match op {
      CmpOp::Lt => ord.is_lt(),
      CmpOp::Le => ord.is_le(),
      CmpOp::Gt => ord.is_gt(),
      CmpOp::Ge => ord.is_ge(),
    };
    Ok(Value::bool(b).with_marks(marks))
  }

  /// Logical and/or. Unknown absorbs unless the known operand decides the
  /// result outright.
  pub fn logical(&self, other: &Value, and: bool) -> Result<Value, OpError> {
    let marks = self.aggregate_marks().union(&other.aggregate_marks());
    let known = |v: &Value| -> Result<Option<bool>, OpError> {
      if v.is_unknown() {
        return Ok(None);
      }
      v.as_bool().map(Some).ok_or_else(|| OpError::WrongOperandType {
        ty: v.ty(),
        want: Ty::Bool,
      })
    };
    let result = match (known(self)?, known(other)?) {
      (Some(a), Some(b)) => Some(if and { a && b } else { a || b }),
      // short-circuit: false && _ and true || _ are decided
      (Some(a), None) | (None, Some(a)) if a != and => Some(a),
      _ => None,
    };
    Ok(match result {
      Some(b) => Value::bool(b).with_marks(marks),
      None => Value::unknown(Ty::Bool).with_marks(marks),
    })
  }

  pub fn not(&self) -> Result<Value, OpError> {
    let marks = self.aggregate_marks();
    if self.is_unknown() {
      return Ok(Value::unknown(Ty::Bool).with_marks(marks));
    }
    let b = self.as_bool().ok_or_else(|| OpError::WrongOperandType {
      ty: self.ty(),
      want: Ty::Bool,
    })?;
    Ok(Value::bool(!b).with_marks(marks))
  }

  fn require_number(&self) -> Result<&BigRational, OpError> {
    self.as_number().ok_or_else(|| OpError::WrongOperandType {
      ty: self.ty(),
      want: Ty::Number,
    })
  }

  /// The string a value contributes to a template. Only primitives render.
  pub fn template_fragment(&self) -> Result<String, OpError> {
    match &self.kind {
      ValueKind::String(s) => Ok(s.clone()),
      ValueKind::Bool(b) => Ok(b.to_string()),
      ValueKind::Number(n) => Ok(render_number(n)),
      _ => Err(OpError::NotTemplatable { ty: self.ty() }),
    }
  }

  fn display_brief(&self) -> String {
    match &self.kind {
      ValueKind::String(s) => format!("{:?}", s),
      ValueKind::Number(n) => render_number(n),
      ValueKind::Bool(b) => b.to_string(),
      ValueKind::Null(_) => "null".to_string(),
      ValueKind::Unknown(_) => "(known after apply)".to_string(),
      other => format!("({})", Value::of(other.clone()).ty()),
    }
  }

  // --- type checking ---

  /// Structural subtyping check against a constraint. Unknown and null
  /// conform to any constraint their own type unifies with; objects reject
  /// extra attributes and tolerate missing ones only when declared optional;
  /// tuple arity must match exactly.
  pub fn check_type(&self, want: &Ty) -> Result<(), TypeCheckError> {
    self.check_type_at(want, &AttrPath::root())
  }

  fn check_type_at(&self, want: &Ty, path: &AttrPath) -> Result<(), TypeCheckError> {
    if want.is_dynamic() {
      return Ok(());
    }
    match &self.kind {
      ValueKind::Null(ty) | ValueKind::Unknown(ty) => {
        ty.unify(want).map(|_| ()).map_err(|_| TypeCheckError::Mismatch {
          path: path.clone(),
          want: want.clone(),
          got: ty.clone(),
        })
      }
      ValueKind::Bool(_) if *want == Ty::Bool => Ok(()),
      ValueKind::Number(_) if *want == Ty::Number => Ok(()),
      ValueKind::String(_) if *want == Ty::String => Ok(()),
      ValueKind::List(_, items) => match want {
        Ty::List(elem) => {
          for (i, item) in items.iter().enumerate() {
            item.check_type_at(elem, &path.join(PathStep::Index(i as u64)))?;
          }
          Ok(())
        }
        _ => self.mismatch(want, path),
      },
      ValueKind::Set(_, items) => match want {
        Ty::Set(elem) => {
          for (i, item) in items.iter().enumerate() {
            item.check_type_at(elem, &path.join(PathStep::Index(i as u64)))?;
          }
          Ok(())
        }
        _ => self.mismatch(want, path),
      },
      ValueKind::Map(_, entries) => match want {
        Ty::Map(elem) => {
          for (k, v) in entries {
            v.check_type_at(elem, &path.join(PathStep::Key(k.clone())))?;
          }
          Ok(())
        }
        _ => self.mismatch(want, path),
      },
      ValueKind::Tuple(items) => match want {
        Ty::Tuple(elems) => {
          if items.len() != elems.len() {
            return Err(TypeCheckError::TupleArity {
              path: path.clone(),
              want: elems.len(),
              got: items.len(),
            });
          }
          for (i, (item, ty)) in items.iter().zip(elems).enumerate() {
            item.check_type_at(ty, &path.join(PathStep::Index(i as u64)))?;
          }
          Ok(())
        }
        _ => self.mismatch(want, path),
      },
      ValueKind::Object(attrs) => match want {
        Ty::Object {
          attrs: want_attrs,
          optional,
        } => {
          for name in attrs.keys() {
            if !want_attrs.contains_key(name) {
              return Err(TypeCheckError::ExtraAttr {
                path: path.clone(),
                name: name.clone(),
              });
            }
          }
          for (name, ty) in want_attrs {
            match attrs.get(name) {
              Some(v) => v.check_type_at(ty, &path.join(PathStep::Attr(name.clone())))?,
              None if optional.contains(name) => {}
              None => {
                return Err(TypeCheckError::MissingAttr {
                  path: path.clone(),
                  name: name.clone(),
                })
              }
            }
          }
          Ok(())
        }
        _ => self.mismatch(want, path),
      },
      ValueKind::Capsule(tag, _) if *want == Ty::Capsule(tag.clone()) => Ok(()),
      _ => self.mismatch(want, path),
    }
  }

  fn mismatch(&self, want: &Ty, path: &AttrPath) -> Result<(), TypeCheckError> {
    Err(TypeCheckError::Mismatch {
      path: path.clone(),
      want: want.clone(),
      got: self.ty(),
    })
  }
}

/// Arithmetic operator selector for [`Value::arith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
  Add,
  Sub,
  Mul,
  Div,
}

/// Comparison operator selector for [`Value::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
  Lt,
  Le,
  Gt,
  Ge,
}

/// Renders a rational exactly: as an integer, as a terminating decimal, or
/// as `num/den` when the decimal would not terminate.
pub fn render_number(n: &BigRational) -> String {
  if n.is_integer() {
    return n.to_integer().to_string();
  }
  // A rational has a terminating decimal expansion iff its reduced
  // denominator is of the form 2^a * 5^b.
  let mut den = n.denom().clone();
  let two = BigInt::from(2);
  let five = BigInt::from(5);
  let mut scale = 0u32;
  while (&den % &two).is_zero() {
    den /= &two;
    scale += 1;
  }
  let mut scale5 = 0u32;
  while (&den % &five).is_zero() {
    den /= &five;
    scale5 += 1;
  }
  if den != BigInt::from(1) {
    return format!("{}/{}", n.numer(), n.denom());
  }
  let digits = scale.max(scale5);
  let pow10 = num_traits::pow(BigInt::from(10), digits as usize);
  let scaled = (n * BigRational::from(pow10)).to_integer();
  let neg = scaled.is_negative();
  let mut body = scaled.magnitude().to_string();
  while body.len() <= digits as usize {
    body.insert(0, '0');
  }
  body.insert(body.len() - digits as usize, '.');
  if neg {
    body.insert(0, '-');
  }
  body
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.marks.is_sensitive() {
      return write!(f, "(sensitive value)");
    }
    match &self.kind {
      ValueKind::Null(_) => write!(f, "null"),
      ValueKind::Unknown(_) => write!(f, "(known after apply)"),
      ValueKind::Bool(b) => write!(f, "{}", b),
      ValueKind::Number(n) => write!(f, "{}", render_number(n)),
      ValueKind::String(s) => write!(f, "{:?}", s),
      ValueKind::List(_, items) | ValueKind::Set(_, items) | ValueKind::Tuple(items) => {
        write!(f, "[")?;
        for (i, v) in items.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}", v)?;
        }
        write!(f, "]")
      }
      ValueKind::Map(_, entries) => {
        write!(f, "{{")?;
        for (i, (k, v)) in entries.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{:?} = {}", k, v)?;
        }
        write!(f, "}}")
      }
      ValueKind::Object(attrs) => {
        write!(f, "{{")?;
        for (i, (k, v)) in attrs.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{} = {}", k, v)?;
        }
        write!(f, "}}")
      }
      ValueKind::Capsule(tag, _) => write!(f, "(capsule {})", tag),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rational(num: i64, den: i64) -> BigRational {
    BigRational::new(BigInt::from(num), BigInt::from(den))
  }

  #[test]
  fn equal_is_null_safe() {
    let null = Value::null(Ty::String);
    assert_eq!(null.equal(&Value::null(Ty::String)).as_bool(), Some(true));
    assert_eq!(null.equal(&Value::string("x")).as_bool(), Some(false));
  }

  #[test]
  fn equal_absorbs_unknown() {
    let u = Value::unknown(Ty::String);
    let got = u.equal(&Value::string("x"));
    assert!(got.is_unknown());
    assert_eq!(got.ty(), Ty::Bool);
  }

  #[test]
  fn equal_ignores_marks_on_content() {
    let a = Value::string("pw").mark_sensitive();
    let b = Value::string("pw");
    let got = a.equal(&b);
    assert_eq!(got.as_bool(), Some(true));
    assert!(got.marks().is_sensitive());
  }

  #[test]
  fn arith_exact_rationals() {
    let third = Value::number(rational(1, 3));
    let two_thirds = third.arith(&third, ArithOp::Add).unwrap();
    assert_eq!(two_thirds.as_number().unwrap(), &rational(2, 3));

    let one = two_thirds.arith(&third, ArithOp::Add).unwrap();
    assert_eq!(one.as_number().unwrap(), &rational(1, 1));
  }

  #[test]
  fn arith_div_by_zero() {
    let err = Value::int(1).arith(&Value::int(0), ArithOp::Div).unwrap_err();
    assert_eq!(err, OpError::DivByZero);
  }

  #[test]
  fn arith_marks_propagate() {
    let a = Value::int(1).mark_sensitive();
    let got = a.arith(&Value::int(2), ArithOp::Add).unwrap();
    assert!(got.marks().is_sensitive());
    assert_eq!(got.as_number().unwrap(), &rational(3, 1));
  }

  #[test]
  fn sensitivity_is_sticky_through_deep_operands() {
    // The mark lives on an element, not the container; deriving from the
    // container still taints the result.
    let list = Value::list(Ty::String, vec![Value::string("pw").mark_sensitive()]);
    let got = list.equal(&list);
    assert!(got.marks().is_sensitive());
  }

  #[test]
  fn get_attr_carries_container_marks() {
    let obj = Value::object([("id".to_string(), Value::string("i-1"))]).mark_sensitive();
    let got = obj.get_attr("id").unwrap();
    assert!(got.marks().is_sensitive());
    assert_eq!(got.as_str(), Some("i-1"));
  }

  #[test]
  fn get_attr_on_unknown_object_types_the_result() {
    let ty = Ty::object([("id".to_string(), Ty::String)]);
    let u = Value::unknown(ty);
    let got = u.get_attr("id").unwrap();
    assert!(got.is_unknown());
    assert_eq!(got.ty(), Ty::String);
  }

  #[test]
  fn get_attr_on_null_errors() {
    let err = Value::null(Ty::Dynamic).get_attr("id").unwrap_err();
    assert!(matches!(err, OpError::NullAttr { .. }));
  }

  #[test]
  fn index_list_and_map() {
    let list = Value::list(Ty::String, vec![Value::string("a"), Value::string("b")]);
    assert_eq!(list.index(&Value::int(1)).unwrap().as_str(), Some("b"));
    assert!(list.index(&Value::int(2)).is_err());

    let map = Value::map(Ty::Number, [("n".to_string(), Value::int(1))].into());
    assert_eq!(map.index(&Value::string("n")).unwrap().as_u64(), Some(1));
  }

  #[test]
  fn index_with_unknown_key_absorbs() {
    let list = Value::list(Ty::String, vec![Value::string("a")]);
    assert!(list.index(&Value::unknown(Ty::Number)).unwrap().is_unknown());
  }

  #[test]
  fn logical_short_circuits_around_unknown() {
    let u = Value::unknown(Ty::Bool);
    let t = Value::bool(true);
    let f = Value::bool(false);
    // false && unknown is decidedly false; true || unknown decidedly true.
    assert_eq!(f.logical(&u, true).unwrap().as_bool(), Some(false));
    assert_eq!(t.logical(&u, false).unwrap().as_bool(), Some(true));
    // true && unknown stays unknown.
    assert!(t.logical(&u, true).unwrap().is_unknown());
  }

  #[test]
  fn set_dedupes() {
    let set = Value::set(Ty::Number, vec![Value::int(1), Value::int(1), Value::int(2)]);
    match set.kind() {
      ValueKind::Set(_, items) => assert_eq!(items.len(), 2),
      _ => unreachable!(),
    }
  }

  #[test]
  fn check_type_object_extra_attr_rejected() {
    let want = Ty::object([("a".to_string(), Ty::String)]);
    let v = Value::object([
      ("a".to_string(), Value::string("x")),
      ("b".to_string(), Value::string("y")),
    ]);
    assert!(matches!(v.check_type(&want), Err(TypeCheckError::ExtraAttr { .. })));
  }

  #[test]
  fn check_type_optional_attr_may_be_missing() {
    let want = Ty::object_opt([("a".to_string(), Ty::String)], ["a".to_string()]);
    assert!(Value::empty_object().check_type(&want).is_ok());

    let strict = Ty::object([("a".to_string(), Ty::String)]);
    assert!(matches!(
      Value::empty_object().check_type(&strict),
      Err(TypeCheckError::MissingAttr { .. })
    ));
  }

  #[test]
  fn check_type_tuple_arity() {
    let want = Ty::Tuple(vec![Ty::Bool, Ty::Bool]);
    let got = Value::tuple(vec![Value::bool(true)]).check_type(&want);
    assert!(matches!(got, Err(TypeCheckError::TupleArity { want: 2, got: 1, .. })));
  }

  #[test]
  fn check_type_unknown_conforms_when_unifiable() {
    assert!(Value::unknown(Ty::String).check_type(&Ty::String).is_ok());
    assert!(Value::unknown(Ty::Dynamic).check_type(&Ty::String).is_ok());
    assert!(Value::unknown(Ty::Bool).check_type(&Ty::String).is_err());
  }

  #[test]
  fn strip_and_reapply_marks_round_trip() {
    let v = Value::object([
      ("user".to_string(), Value::string("admin")),
      ("password".to_string(), Value::string("hunter2").mark_sensitive()),
    ]);
    let (stripped, paths) = v.strip_marks();
    assert!(!stripped.has_sensitive());
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].path.to_string(), ".password");

    let restored = stripped.apply_marked_paths(&paths);
    assert_eq!(restored, v);
  }

  #[test]
  fn render_number_forms() {
    assert_eq!(render_number(&rational(5, 1)), "5");
    assert_eq!(render_number(&rational(-3, 2)), "-1.5");
    assert_eq!(render_number(&rational(1, 400)), "0.0025");
    assert_eq!(render_number(&rational(1, 3)), "1/3");
  }

  #[test]
  fn display_masks_sensitive() {
    let v = Value::string("secret").mark_sensitive();
    assert_eq!(v.to_string(), "(sensitive value)");
  }
}
