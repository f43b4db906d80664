//! Provider schemas: the shape of resource, data-source and provider
//! configuration blocks as reported by `GetSchema`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::{AttrPath, MarkedPath, Marks, Ty, TypeCheckError, Value};

/// One attribute of a block schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrSchema {
  pub ty: Ty,
  /// Must be set in configuration.
  #[serde(default)]
  pub required: bool,
  /// May be set in configuration.
  #[serde(default)]
  pub optional: bool,
  /// Decided by the provider; unknown until applied when not set in config.
  #[serde(default)]
  pub computed: bool,
  /// Values of this attribute are sensitive regardless of configuration.
  #[serde(default)]
  pub sensitive: bool,
}

impl AttrSchema {
  pub fn required(ty: Ty) -> Self {
    AttrSchema {
      ty,
      required: true,
      optional: false,
      computed: false,
      sensitive: false,
    }
  }

  pub fn optional(ty: Ty) -> Self {
    AttrSchema {
      ty,
      required: false,
      optional: true,
      computed: false,
      sensitive: false,
    }
  }

  pub fn computed(ty: Ty) -> Self {
    AttrSchema {
      ty,
      required: false,
      optional: false,
      computed: true,
      sensitive: false,
    }
  }

  pub fn sensitive(mut self) -> Self {
    self.sensitive = true;
    self
  }
}

/// The schema of one block kind: a resource type, a data source, or the
/// provider's own configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockSchema {
  /// Schema version, recorded per instance in state so providers can
  /// upgrade old objects.
  #[serde(default)]
  pub version: u64,
  pub attrs: IndexMap<String, AttrSchema>,
}

impl BlockSchema {
  pub fn new(version: u64, attrs: impl IntoIterator<Item = (String, AttrSchema)>) -> Self {
    BlockSchema {
      version,
      attrs: attrs.into_iter().collect(),
    }
  }

  /// The object type of a fully-populated block value, as providers return
  /// it: every attribute present.
  pub fn object_ty(&self) -> Ty {
    Ty::object(self.attrs.iter().map(|(name, attr)| (name.clone(), attr.ty.clone())))
  }

  /// The object type configuration must conform to: computed-only and
  /// optional attributes may be absent.
  pub fn config_ty(&self) -> Ty {
    Ty::object_opt(
      self.attrs.iter().map(|(name, attr)| (name.clone(), attr.ty.clone())),
      self
        .attrs
        .iter()
        .filter(|(_, attr)| !attr.required)
        .map(|(name, _)| name.clone()),
    )
  }

  /// Checks a provider-returned object against this schema.
  pub fn check_object(&self, value: &Value) -> Result<(), TypeCheckError> {
    value.check_type(&self.object_ty())
  }

  /// Checks a configuration body against this schema.
  pub fn check_config(&self, value: &Value) -> Result<(), TypeCheckError> {
    value.check_type(&self.config_ty())
  }

  /// The marks this schema imposes on conforming values: one sensitive path
  /// per schema-sensitive attribute.
  pub fn implied_marks(&self) -> Vec<MarkedPath> {
    self
      .attrs
      .iter()
      .filter(|(_, attr)| attr.sensitive)
      .map(|(name, _)| MarkedPath {
        path: AttrPath::attr(name.clone()),
        marks: Marks::sensitive(),
      })
      .collect()
  }
}

/// Everything one provider can do, as reported by its `GetSchema`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSchema {
  pub provider_config: BlockSchema,
  pub resources: IndexMap<String, BlockSchema>,
  pub data_sources: IndexMap<String, BlockSchema>,
}

impl ProviderSchema {
  pub fn resource(&self, type_name: &str) -> Option<&BlockSchema> {
    self.resources.get(type_name)
  }

  pub fn data_source(&self, type_name: &str) -> Option<&BlockSchema> {
    self.data_sources.get(type_name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn schema() -> BlockSchema {
    BlockSchema::new(
      1,
      [
        ("region".to_string(), AttrSchema::required(Ty::String)),
        ("tags".to_string(), AttrSchema::optional(Ty::map(Ty::String))),
        ("id".to_string(), AttrSchema::computed(Ty::String)),
        (
          "password".to_string(),
          AttrSchema::optional(Ty::String).sensitive(),
        ),
      ],
    )
  }

  #[test]
  fn config_ty_requires_only_required() {
    let config = Value::object([("region".to_string(), Value::string("eu"))]);
    schema().check_config(&config).unwrap();

    let missing = Value::empty_object();
    assert!(schema().check_config(&missing).is_err());
  }

  #[test]
  fn object_ty_requires_everything() {
    let config = Value::object([("region".to_string(), Value::string("eu"))]);
    assert!(schema().check_object(&config).is_err());
  }

  #[test]
  fn implied_marks_cover_sensitive_attrs() {
    let marks = schema().implied_marks();
    assert_eq!(marks.len(), 1);
    assert_eq!(marks[0].path.to_string(), ".password");
    assert!(marks[0].marks.is_sensitive());
  }

  #[test]
  fn unexpected_config_attr_rejected() {
    let config = Value::object([
      ("region".to_string(), Value::string("eu")),
      ("nope".to_string(), Value::bool(true)),
    ]);
    assert!(schema().check_config(&config).is_err());
  }
}
