//! Conversion between [`Value`] and JSON for state persistence.
//!
//! Marks never travel through JSON; callers split them off with
//! [`Value::strip_marks`] and store them as sensitive paths. Unknown values
//! have no JSON form at all: state only ever holds applied objects.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::ToPrimitive;
use thiserror::Error;

use super::{render_number, Ty, Value, ValueKind};

#[derive(Debug, Error, PartialEq)]
pub enum JsonError {
  #[error("unknown values cannot be serialized to JSON")]
  Unknown,

  #[error("capsule values cannot be serialized to JSON")]
  Capsule,

  #[error("number {0} cannot be represented in JSON")]
  Number(String),

  #[error("JSON value {got} does not fit type {want}")]
  Mismatch { want: Ty, got: String },
}

/// Serializes a value to JSON. Integers stay exact; other rationals degrade
/// to the nearest double, which is how they later cross back in.
pub fn value_to_json(value: &Value) -> Result<serde_json::Value, JsonError> {
  use serde_json::Value as Json;
  Ok(match value.kind() {
    ValueKind::Null(_) => Json::Null,
    ValueKind::Unknown(_) => return Err(JsonError::Unknown),
    ValueKind::Capsule(..) => return Err(JsonError::Capsule),
    ValueKind::Bool(b) => Json::Bool(*b),
    ValueKind::Number(n) => number_to_json(n)?,
    ValueKind::String(s) => Json::String(s.clone()),
    ValueKind::List(_, items) | ValueKind::Set(_, items) | ValueKind::Tuple(items) => {
      Json::Array(items.iter().map(value_to_json).collect::<Result<_, _>>()?)
    }
    ValueKind::Map(_, entries) => Json::Object(
      entries
        .iter()
        .map(|(k, v)| Ok((k.clone(), value_to_json(v)?)))
        .collect::<Result<_, JsonError>>()?,
    ),
    ValueKind::Object(attrs) => Json::Object(
      attrs
        .iter()
        .map(|(k, v)| Ok((k.clone(), value_to_json(v)?)))
        .collect::<Result<_, JsonError>>()?,
    ),
  })
}

fn number_to_json(n: &BigRational) -> Result<serde_json::Value, JsonError> {
  if n.is_integer() {
    let int = n.to_integer();
    if let Some(i) = int.to_i64() {
      return Ok(serde_json::Value::from(i));
    }
    if let Some(u) = int.to_u64() {
      return Ok(serde_json::Value::from(u));
    }
  }
  let f = n.to_f64().filter(|f| f.is_finite()).ok_or_else(|| JsonError::Number(render_number(n)))?;
  serde_json::Number::from_f64(f)
    .map(serde_json::Value::Number)
    .ok_or_else(|| JsonError::Number(render_number(n)))
}

/// Deserializes JSON into a value of the given type. `Ty::Dynamic` infers:
/// arrays become tuples, objects become object values.
pub fn value_from_json(json: &serde_json::Value, ty: &Ty) -> Result<Value, JsonError> {
  use serde_json::Value as Json;

  let mismatch = || JsonError::Mismatch {
    want: ty.clone(),
    got: json.to_string(),
  };

  match (json, ty) {
    (Json::Null, _) => Ok(Value::null(ty.clone())),
    (Json::Bool(b), Ty::Bool | Ty::Dynamic) => Ok(Value::bool(*b)),
    (Json::Number(n), Ty::Number | Ty::Dynamic) => Ok(Value::number(json_number(n)?)),
    (Json::String(s), Ty::String | Ty::Dynamic) => Ok(Value::string(s.clone())),
    (Json::String(s), Ty::Capsule(tag)) => {
      // Capsules survive JSON only as opaque strings tagged by schema.
      Ok(Value::capsule(tag.clone(), s.clone().into_bytes()))
    }
    (Json::Array(items), Ty::List(elem)) => Ok(Value::list(
      (**elem).clone(),
      items.iter().map(|i| value_from_json(i, elem)).collect::<Result<_, _>>()?,
    )),
    (Json::Array(items), Ty::Set(elem)) => Ok(Value::set(
      (**elem).clone(),
      items.iter().map(|i| value_from_json(i, elem)).collect::<Result<_, _>>()?,
    )),
    (Json::Array(items), Ty::Tuple(elems)) => {
      if items.len() != elems.len() {
        return Err(mismatch());
      }
      Ok(Value::tuple(
        items
          .iter()
          .zip(elems)
          .map(|(i, t)| value_from_json(i, t))
          .collect::<Result<_, _>>()?,
      ))
    }
    (Json::Array(items), Ty::Dynamic) => Ok(Value::tuple(
      items
        .iter()
        .map(|i| value_from_json(i, &Ty::Dynamic))
        .collect::<Result<_, _>>()?,
    )),
    (Json::Object(entries), Ty::Map(elem)) => Ok(Value::map(
      (**elem).clone(),
      entries
        .iter()
        .map(|(k, v)| Ok((k.clone(), value_from_json(v, elem)?)))
        .collect::<Result<_, JsonError>>()?,
    )),
    (Json::Object(entries), Ty::Object { attrs, optional }) => {
      let mut out = std::collections::BTreeMap::new();
      for (name, want) in attrs {
        match entries.get(name) {
          Some(v) => {
            out.insert(name.clone(), value_from_json(v, want)?);
          }
          None if optional.contains(name) => {}
          None => {
            out.insert(name.clone(), Value::null(want.clone()));
          }
        }
      }
      Ok(Value::object(out))
    }
    (Json::Object(entries), Ty::Dynamic) => Ok(Value::object(
      entries
        .iter()
        .map(|(k, v)| Ok((k.clone(), value_from_json(v, &Ty::Dynamic)?)))
        .collect::<Result<Vec<_>, JsonError>>()?,
    )),
    _ => Err(mismatch()),
  }
}

fn json_number(n: &serde_json::Number) -> Result<BigRational, JsonError> {
  if let Some(i) = n.as_i64() {
    return Ok(BigRational::from(BigInt::from(i)));
  }
  if let Some(u) = n.as_u64() {
    return Ok(BigRational::from(BigInt::from(u)));
  }
  n.as_f64()
    .and_then(BigRational::from_float)
    .ok_or_else(|| JsonError::Number(n.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn round_trip_typed_object() {
    let ty = Ty::object([
      ("id".to_string(), Ty::String),
      ("count".to_string(), Ty::Number),
      ("tags".to_string(), Ty::map(Ty::String)),
    ]);
    let json = json!({"id": "i-1", "count": 3, "tags": {"env": "prod"}});
    let value = value_from_json(&json, &ty).unwrap();
    assert_eq!(value.get_attr("id").unwrap().as_str(), Some("i-1"));
    assert_eq!(value.get_attr("count").unwrap().as_u64(), Some(3));
    assert_eq!(value_to_json(&value).unwrap(), json);
  }

  #[test]
  fn missing_required_attr_becomes_null() {
    let ty = Ty::object([("id".to_string(), Ty::String)]);
    let value = value_from_json(&json!({}), &ty).unwrap();
    assert!(value.get_attr("id").unwrap().is_null());
  }

  #[test]
  fn unknown_refuses_json() {
    assert_eq!(value_to_json(&Value::unknown(Ty::String)).unwrap_err(), JsonError::Unknown);
  }

  #[test]
  fn dynamic_infers_structure() {
    let value = value_from_json(&json!([1, "a", true]), &Ty::Dynamic).unwrap();
    assert_eq!(value.ty(), Ty::Tuple(vec![Ty::Number, Ty::String, Ty::Bool]));
  }

  #[test]
  fn tuple_arity_checked() {
    let ty = Ty::Tuple(vec![Ty::Number]);
    assert!(value_from_json(&json!([1, 2]), &ty).is_err());
  }

  #[test]
  fn big_integers_stay_exact() {
    let v = Value::int(i64::MAX);
    let j = value_to_json(&v).unwrap();
    assert_eq!(j, json!(i64::MAX));
    let back = value_from_json(&j, &Ty::Number).unwrap();
    assert_eq!(back, v);
  }
}
