//! The self-describing binary encoding values use to cross the provider
//! boundary.
//!
//! The body is MessagePack (tag + payload per node); marks never enter the
//! body and travel out-of-band as `(path, marks)` pairs in the envelope, so
//! a provider cannot observe or strip sensitivity. Numbers are encoded as
//! numerator/denominator strings and stay exact in both directions.

use std::collections::BTreeMap;
use std::str::FromStr;

use num_bigint::BigInt;
use num_rational::BigRational;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{MarkedPath, Ty, Value, ValueKind};

/// Current envelope version; bumped only for incompatible layout changes.
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum WireError {
  #[error("failed to encode wire value: {0}")]
  Encode(#[from] rmp_serde::encode::Error),

  #[error("failed to decode wire value: {0}")]
  Decode(#[from] rmp_serde::decode::Error),

  #[error("unsupported wire version {0}")]
  Version(u8),

  #[error("invalid wire number {0:?}")]
  Number(String),
}

/// A serialized value plus its out-of-band marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
  pub version: u8,
  /// MessagePack-encoded [`WireVal`].
  pub body: Vec<u8>,
  pub marks: Vec<MarkedPath>,
}

impl WireEnvelope {
  pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec(self)?)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
    let env: WireEnvelope = rmp_serde::from_slice(bytes)?;
    if env.version != WIRE_VERSION {
      return Err(WireError::Version(env.version));
    }
    Ok(env)
  }
}

#[derive(Serialize, Deserialize)]
enum WireVal {
  Null(Ty),
  Unknown(Ty),
  Bool(bool),
  Number { num: String, den: String },
  Str(String),
  List(Ty, Vec<WireVal>),
  Set(Ty, Vec<WireVal>),
  Map(Ty, BTreeMap<String, WireVal>),
  Tuple(Vec<WireVal>),
  Object(BTreeMap<String, WireVal>),
  Capsule(String, Vec<u8>),
}

/// Encodes a value for the wire, splitting marks out of the body.
pub fn encode(value: &Value) -> Result<WireEnvelope, WireError> {
  let (stripped, marks) = value.strip_marks();
  let body = rmp_serde::to_vec(&to_wire(&stripped))?;
  Ok(WireEnvelope {
    version: WIRE_VERSION,
    body,
    marks,
  })
}

/// Decodes a wire envelope back into a marked value.
pub fn decode(envelope: &WireEnvelope) -> Result<Value, WireError> {
  if envelope.version != WIRE_VERSION {
    return Err(WireError::Version(envelope.version));
  }
  let wire: WireVal = rmp_serde::from_slice(&envelope.body)?;
  let value = from_wire(wire)?;
  Ok(value.apply_marked_paths(&envelope.marks))
}

fn to_wire(value: &Value) -> WireVal {
  match value.kind() {
    ValueKind::Null(ty) => WireVal::Null(ty.clone()),
    ValueKind::Unknown(ty) => WireVal::Unknown(ty.clone()),
    ValueKind::Bool(b) => WireVal::Bool(*b),
    ValueKind::Number(n) => WireVal::Number {
      num: n.numer().to_string(),
      den: n.denom().to_string(),
    },
    ValueKind::String(s) => WireVal::Str(s.clone()),
    ValueKind::List(elem, items) => WireVal::List(elem.clone(), items.iter().map(to_wire).collect()),
    ValueKind::Set(elem, items) => WireVal::Set(elem.clone(), items.iter().map(to_wire).collect()),
    ValueKind::Map(elem, entries) => WireVal::Map(
      elem.clone(),
      entries.iter().map(|(k, v)| (k.clone(), to_wire(v))).collect(),
    ),
    ValueKind::Tuple(items) => WireVal::Tuple(items.iter().map(to_wire).collect()),
    ValueKind::Object(attrs) => {
      WireVal::Object(attrs.iter().map(|(k, v)| (k.clone(), to_wire(v))).collect())
    }
    ValueKind::Capsule(tag, payload) => WireVal::Capsule(tag.clone(), payload.clone()),
  }
}

fn from_wire(wire: WireVal) -> Result<Value, WireError> {
  Ok(match wire {
    WireVal::Null(ty) => Value::null(ty),
    WireVal::Unknown(ty) => Value::unknown(ty),
    WireVal::Bool(b) => Value::bool(b),
    WireVal::Number { num, den } => {
      let numer = BigInt::from_str(&num).map_err(|_| WireError::Number(num.clone()))?;
      let denom = BigInt::from_str(&den).map_err(|_| WireError::Number(den.clone()))?;
      if denom == BigInt::from(0) {
        return Err(WireError::Number(format!("{}/{}", num, den)));
      }
      Value::number(BigRational::new(numer, denom))
    }
    WireVal::Str(s) => Value::string(s),
    WireVal::List(elem, items) => Value::list(elem, from_wire_vec(items)?),
    WireVal::Set(elem, items) => Value::set(elem, from_wire_vec(items)?),
    WireVal::Map(elem, entries) => Value::map(
      elem,
      entries
        .into_iter()
        .map(|(k, v)| Ok((k, from_wire(v)?)))
        .collect::<Result<_, WireError>>()?,
    ),
    WireVal::Tuple(items) => Value::tuple(from_wire_vec(items)?),
    WireVal::Object(attrs) => Value::object(
      attrs
        .into_iter()
        .map(|(k, v)| Ok((k, from_wire(v)?)))
        .collect::<Result<Vec<_>, WireError>>()?,
    ),
    WireVal::Capsule(tag, payload) => Value::capsule(tag, payload),
  })
}

fn from_wire_vec(items: Vec<WireVal>) -> Result<Vec<Value>, WireError> {
  items.into_iter().map(from_wire).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::Marks;

  #[test]
  fn round_trip_structured_value() {
    let value = Value::object([
      ("name".to_string(), Value::string("web")),
      (
        "ports".to_string(),
        Value::list(Ty::Number, vec![Value::int(80), Value::int(443)]),
      ),
      ("id".to_string(), Value::unknown(Ty::String)),
    ]);
    let env = encode(&value).unwrap();
    assert_eq!(decode(&env).unwrap(), value);
  }

  #[test]
  fn marks_travel_out_of_band() {
    let value = Value::object([(
      "password".to_string(),
      Value::string("hunter2").mark_sensitive(),
    )]);
    let env = encode(&value).unwrap();

    // The body alone carries no marks.
    let body: WireVal = rmp_serde::from_slice(&env.body).unwrap();
    let bare = from_wire(body).unwrap();
    assert!(!bare.has_sensitive());
    assert_eq!(env.marks.len(), 1);

    // Decoding restores them.
    let restored = decode(&env).unwrap();
    assert!(restored.get_attr("password").unwrap().marks().is_sensitive());
  }

  #[test]
  fn numbers_stay_exact() {
    let third = Value::number(BigRational::new(BigInt::from(1), BigInt::from(3)));
    let env = encode(&third).unwrap();
    assert_eq!(decode(&env).unwrap(), third);
  }

  #[test]
  fn envelope_bytes_round_trip() {
    let value = Value::string("x").with_marks(Marks::ephemeral());
    let bytes = encode(&value).unwrap().to_bytes().unwrap();
    let env = WireEnvelope::from_bytes(&bytes).unwrap();
    assert_eq!(decode(&env).unwrap(), value);
  }

  #[test]
  fn version_mismatch_rejected() {
    let mut env = encode(&Value::bool(true)).unwrap();
    env.version = 9;
    assert!(matches!(decode(&env).unwrap_err(), WireError::Version(9)));
    let bytes = env.to_bytes().unwrap();
    assert!(matches!(WireEnvelope::from_bytes(&bytes).unwrap_err(), WireError::Version(9)));
  }

  #[test]
  fn zero_denominator_rejected() {
    let bad = rmp_serde::to_vec(&WireVal::Number {
      num: "1".into(),
      den: "0".into(),
    })
    .unwrap();
    let env = WireEnvelope {
      version: WIRE_VERSION,
      body: bad,
      marks: Vec::new(),
    };
    assert!(matches!(decode(&env).unwrap_err(), WireError::Number(_)));
  }
}
