//! The type system for dynamic values: concrete types, `dynamic`, and
//! unification.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value type constraint. `Dynamic` accepts any type; everything else is
/// concrete. Collection types carry their element type, `Tuple` and `Object`
/// their full shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ty {
  Dynamic,
  Bool,
  Number,
  String,
  List(Box<Ty>),
  Set(Box<Ty>),
  Map(Box<Ty>),
  Tuple(Vec<Ty>),
  Object {
    attrs: BTreeMap<String, Ty>,
    /// Attribute names that may be absent from conforming values.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    optional: BTreeSet<String>,
  },
  /// An opaque provider-scoped payload, identified by tag.
  Capsule(String),
}

/// Unification failure: the two types have no common supertype other than
/// abandoning type information entirely.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnifyError {
  #[error("type mismatch: {left} is not compatible with {right}")]
  Mismatch { left: Ty, right: Ty },

  #[error("tuple arity mismatch: {left} vs {right} elements")]
  TupleArity { left: usize, right: usize },

  #[error("capsule tag mismatch: {left:?} vs {right:?}")]
  CapsuleTag { left: String, right: String },
}

impl Ty {
  pub fn object(attrs: impl IntoIterator<Item = (String, Ty)>) -> Ty {
    Ty::Object {
      attrs: attrs.into_iter().collect(),
      optional: BTreeSet::new(),
    }
  }

  pub fn object_opt(
    attrs: impl IntoIterator<Item = (String, Ty)>,
    optional: impl IntoIterator<Item = String>,
  ) -> Ty {
    Ty::Object {
      attrs: attrs.into_iter().collect(),
      optional: optional.into_iter().collect(),
    }
  }

  pub fn list(elem: Ty) -> Ty {
    Ty::List(Box::new(elem))
  }

  pub fn set(elem: Ty) -> Ty {
    Ty::Set(Box::new(elem))
  }

  pub fn map(elem: Ty) -> Ty {
    Ty::Map(Box::new(elem))
  }

  pub fn is_dynamic(&self) -> bool {
    matches!(self, Ty::Dynamic)
  }

  /// The most specific common supertype of `self` and `other`.
  ///
  /// `dynamic` unifies with anything (to `dynamic`); identical types unify
  /// to themselves; collections unify element-wise; objects unify to the
  /// union of their attributes, with one-sided attributes becoming optional.
  /// Everything else has no common supertype and errors.
  pub fn unify(&self, other: &Ty) -> Result<Ty, UnifyError> {
    use Ty::*;
    match (self, other) {
      (a, b) if a == b => Ok(a.clone()),
      (Dynamic, _) | (_, Dynamic) => Ok(Dynamic),
      (List(a), List(b)) => Ok(Ty::list(a.unify(b)?)),
      (Set(a), Set(b)) => Ok(Ty::set(a.unify(b)?)),
      (Map(a), Map(b)) => Ok(Ty::map(a.unify(b)?)),
      (Tuple(a), Tuple(b)) => {
        if a.len() != b.len() {
          return Err(UnifyError::TupleArity {
            left: a.len(),
            right: b.len(),
          });
        }
        let elems = a.iter().zip(b).map(|(x, y)| x.unify(y)).collect::<Result<_, _>>()?;
        Ok(Tuple(elems))
      }
      (
        Object {
          attrs: left,
          optional: left_opt,
        },
        Object {
          attrs: right,
          optional: right_opt,
        },
      ) => {
        let mut attrs = BTreeMap::new();
        let mut optional: BTreeSet<std::string::String> = left_opt.union(right_opt).cloned().collect();
        for (name, lty) in left {
          match right.get(name) {
            Some(rty) => {
              attrs.insert(name.clone(), lty.unify(rty)?);
            }
            None => {
              attrs.insert(name.clone(), lty.clone());
              optional.insert(name.clone());
            }
          }
        }
        for (name, rty) in right {
          if !left.contains_key(name) {
            attrs.insert(name.clone(), rty.clone());
            optional.insert(name.clone());
          }
        }
        Ok(Object { attrs, optional })
      }
      (Capsule(a), Capsule(b)) => Err(UnifyError::CapsuleTag {
        left: a.clone(),
        right: b.clone(),
      }),
      (a, b) => Err(UnifyError::Mismatch {
        left: a.clone(),
        right: b.clone(),
      }),
    }
  }
}

impl fmt::Display for Ty {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Ty::Dynamic => write!(f, "dynamic"),
      Ty::Bool => write!(f, "bool"),
      Ty::Number => write!(f, "number"),
      Ty::String => write!(f, "string"),
      Ty::List(e) => write!(f, "list({})", e),
      Ty::Set(e) => write!(f, "set({})", e),
      Ty::Map(e) => write!(f, "map({})", e),
      Ty::Tuple(elems) => {
        write!(f, "tuple(")?;
        for (i, e) in elems.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}", e)?;
        }
        write!(f, ")")
      }
      Ty::Object { attrs, optional } => {
        write!(f, "object({{")?;
        for (i, (name, ty)) in attrs.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          let opt = if optional.contains(name) { "?" } else { "" };
          write!(f, "{}{} = {}", name, opt, ty)?;
        }
        write!(f, "}})")
      }
      Ty::Capsule(tag) => write!(f, "capsule({})", tag),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unify_identical() {
    assert_eq!(Ty::Bool.unify(&Ty::Bool).unwrap(), Ty::Bool);
    let l = Ty::list(Ty::String);
    assert_eq!(l.unify(&l).unwrap(), l);
  }

  #[test]
  fn unify_with_dynamic_is_dynamic() {
    assert_eq!(Ty::Dynamic.unify(&Ty::Bool).unwrap(), Ty::Dynamic);
    assert_eq!(Ty::list(Ty::String).unify(&Ty::Dynamic).unwrap(), Ty::Dynamic);
  }

  #[test]
  fn unify_lists_elementwise() {
    let got = Ty::list(Ty::Dynamic).unify(&Ty::list(Ty::Number)).unwrap();
    assert_eq!(got, Ty::list(Ty::Dynamic));
  }

  #[test]
  fn unify_primitive_mismatch_fails() {
    let err = Ty::Bool.unify(&Ty::String).unwrap_err();
    assert!(matches!(err, UnifyError::Mismatch { .. }));
  }

  #[test]
  fn unify_tuple_arity_fails() {
    let a = Ty::Tuple(vec![Ty::Bool]);
    let b = Ty::Tuple(vec![Ty::Bool, Ty::Bool]);
    assert_eq!(a.unify(&b).unwrap_err(), UnifyError::TupleArity { left: 1, right: 2 });
  }

  #[test]
  fn unify_objects_unions_attrs() {
    let a = Ty::object([("x".to_string(), Ty::String)]);
    let b = Ty::object([("x".to_string(), Ty::String), ("y".to_string(), Ty::Number)]);
    let got = a.unify(&b).unwrap();
    match got {
      Ty::Object { attrs, optional } => {
        assert_eq!(attrs.len(), 2);
        assert!(optional.contains("y"));
        assert!(!optional.contains("x"));
      }
      other => panic!("expected object, got {}", other),
    }
  }

  #[test]
  fn unify_capsules_never() {
    let a = Ty::Capsule("pem".into());
    assert_eq!(a.unify(&a).unwrap(), a);
    let err = a.unify(&Ty::Capsule("der".into())).unwrap_err();
    assert!(matches!(err, UnifyError::CapsuleTag { .. }));
  }

  #[test]
  fn display_forms() {
    assert_eq!(Ty::list(Ty::String).to_string(), "list(string)");
    assert_eq!(
      Ty::object_opt([("a".to_string(), Ty::Bool)], ["a".to_string()]).to_string(),
      "object({a? = bool})"
    );
    assert_eq!(Ty::Tuple(vec![Ty::Bool, Ty::Number]).to_string(), "tuple(bool, number)");
  }
}
