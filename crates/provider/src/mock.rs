//! A scriptable in-process provider.
//!
//! Every plan/apply test in the workspace drives one of these instead of a
//! real child process. Behavior is canned declaratively: schemas, values for
//! computed attributes, requires-replace paths, and optional hooks for
//! refresh, data reads, imports and apply failures. Calls are logged so
//! tests can assert on lifecycle discipline.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use gantry_core::addr::ProviderAddr;
use gantry_core::schema::{BlockSchema, ProviderSchema};
use gantry_core::value::{AttrPath, Ty, Value, ValueKind};

use crate::broker::ProviderFactory;
use crate::{AppliedChange, ApplyRequest, PlanRequest, PlannedChange, Provider, ProviderError};

type ReadFn = Box<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;
type DataFn = Box<dyn Fn(&str, &Value) -> Result<Value, String> + Send + Sync>;
type ImportFn = Box<dyn Fn(&str, &str) -> Result<Value, String> + Send + Sync>;
/// Returning `None` falls through to the default apply behavior.
type ApplyHook = Box<dyn Fn(&ApplyRequest) -> Option<Result<Option<Value>, String>> + Send + Sync>;

#[derive(Default)]
struct MockState {
  configured: bool,
  closed: bool,
  stopped: bool,
  calls: Vec<String>,
}

pub struct MockProvider {
  addr: ProviderAddr,
  schema: ProviderSchema,
  replace_paths: HashMap<String, Vec<AttrPath>>,
  create_values: HashMap<String, BTreeMap<String, Value>>,
  read_fn: Option<ReadFn>,
  data_fn: Option<DataFn>,
  import_fn: Option<ImportFn>,
  apply_hook: Option<ApplyHook>,
  fail_configure: Option<String>,
  state: Mutex<MockState>,
}

impl Default for MockProvider {
  fn default() -> Self {
    MockProvider::new()
  }
}

impl MockProvider {
  pub fn new() -> Self {
    MockProvider {
      addr: ProviderAddr::default_registry("null"),
      schema: ProviderSchema::default(),
      replace_paths: HashMap::new(),
      create_values: HashMap::new(),
      read_fn: None,
      data_fn: None,
      import_fn: None,
      apply_hook: None,
      fail_configure: None,
      state: Mutex::new(MockState::default()),
    }
  }

  pub fn with_addr(mut self, addr: ProviderAddr) -> Self {
    self.addr = addr;
    self
  }

  pub fn with_resource(mut self, type_name: &str, schema: BlockSchema) -> Self {
    self.schema.resources.insert(type_name.to_string(), schema);
    self
  }

  pub fn with_data_source(mut self, type_name: &str, schema: BlockSchema) -> Self {
    self.schema.data_sources.insert(type_name.to_string(), schema);
    self
  }

  pub fn with_provider_config(mut self, schema: BlockSchema) -> Self {
    self.schema.provider_config = schema;
    self
  }

  /// Declares attribute paths whose change forces replacement of the given
  /// resource type.
  pub fn with_replace_path(mut self, type_name: &str, path: AttrPath) -> Self {
    self.replace_paths.entry(type_name.to_string()).or_default().push(path);
    self
  }

  /// Cans the value an unknown (computed) attribute resolves to on apply.
  pub fn with_create_value(mut self, type_name: &str, attr: &str, value: Value) -> Self {
    self
      .create_values
      .entry(type_name.to_string())
      .or_default()
      .insert(attr.to_string(), value);
    self
  }

  /// Overrides refresh. Return `None` to report the object gone.
  pub fn on_read(mut self, f: impl Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static) -> Self {
    self.read_fn = Some(Box::new(f));
    self
  }

  pub fn on_data(mut self, f: impl Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static) -> Self {
    self.data_fn = Some(Box::new(f));
    self
  }

  pub fn on_import(mut self, f: impl Fn(&str, &str) -> Result<Value, String> + Send + Sync + 'static) -> Self {
    self.import_fn = Some(Box::new(f));
    self
  }

  /// Intercepts apply. Return `Some(Err(_))` to inject a failure,
  /// `Some(Ok(_))` to dictate the result, `None` to use default behavior.
  pub fn on_apply(
    mut self,
    f: impl Fn(&ApplyRequest) -> Option<Result<Option<Value>, String>> + Send + Sync + 'static,
  ) -> Self {
    self.apply_hook = Some(Box::new(f));
    self
  }

  pub fn failing_configure(mut self, message: &str) -> Self {
    self.fail_configure = Some(message.to_string());
    self
  }

  /// The full ordered call log, entries like `"apply_resource_change null_resource"`.
  pub fn calls(&self) -> Vec<String> {
    self.state.lock().calls.clone()
  }

  pub fn calls_named(&self, method: &str) -> usize {
    self
      .state
      .lock()
      .calls
      .iter()
      .filter(|c| c.split_whitespace().next() == Some(method))
      .count()
  }

  pub fn was_stopped(&self) -> bool {
    self.state.lock().stopped
  }

  fn log(&self, method: &str, detail: &str) -> Result<(), ProviderError> {
    let mut state = self.state.lock();
    if state.closed {
      return Err(ProviderError::Closed {
        addr: self.addr.clone(),
      });
    }
    if detail.is_empty() {
      state.calls.push(method.to_string());
    } else {
      state.calls.push(format!("{} {}", method, detail));
    }
    Ok(())
  }

  fn require_configured(&self, method: &'static str) -> Result<(), ProviderError> {
    if !self.state.lock().configured {
      return Err(ProviderError::NotConfigured {
        addr: self.addr.clone(),
      });
    }
    let _ = method;
    Ok(())
  }

  /// Default apply: resolve every unknown attribute of the planned object,
  /// preferring canned create values, then a deterministic `mock-<attr>`
  /// string, then a typed null.
  fn resolve_unknowns(&self, type_name: &str, planned: &Value) -> Value {
    let fills = self.create_values.get(type_name);
    match planned.kind() {
      ValueKind::Object(attrs) => Value::object(attrs.iter().map(|(name, v)| {
        let resolved = if v.is_unknown() {
          match fills.and_then(|f| f.get(name)) {
            Some(filled) => filled.clone(),
            None if v.ty() == Ty::String => Value::string(format!("mock-{}", name)),
            None => Value::null(v.ty()),
          }
        } else {
          v.clone()
        };
        (name.clone(), resolved)
      })),
      _ => planned.clone(),
    }
  }
}

#[async_trait]
impl Provider for MockProvider {
  async fn get_schema(&self) -> Result<ProviderSchema, ProviderError> {
    self.log("get_schema", "")?;
    Ok(self.schema.clone())
  }

  async fn validate_provider_config(&self, _config: &Value) -> Result<(), ProviderError> {
    self.log("validate_provider_config", "")?;
    Ok(())
  }

  async fn configure(&self, _config: &Value) -> Result<(), ProviderError> {
    self.log("configure", "")?;
    if let Some(message) = &self.fail_configure {
      return Err(ProviderError::Configure {
        addr: self.addr.clone(),
        message: message.clone(),
      });
    }
    self.state.lock().configured = true;
    Ok(())
  }

  async fn validate_resource_config(&self, type_name: &str, _config: &Value) -> Result<(), ProviderError> {
    self.log("validate_resource_config", type_name)?;
    Ok(())
  }

  async fn upgrade_resource_state(
    &self,
    type_name: &str,
    _from_version: u64,
    raw: serde_json::Value,
  ) -> Result<Value, ProviderError> {
    self.log("upgrade_resource_state", type_name)?;
    let schema = self.schema.resource(type_name).ok_or_else(|| ProviderError::UnknownType {
      addr: self.addr.clone(),
      type_name: type_name.to_string(),
    })?;
    gantry_core::value::value_from_json(&raw, &schema.object_ty()).map_err(|e| ProviderError::Call {
      addr: self.addr.clone(),
      method: "upgrade_resource_state",
      message: e.to_string(),
    })
  }

  async fn read_resource(
    &self,
    type_name: &str,
    current: &Value,
    _private: Option<&[u8]>,
  ) -> Result<Option<Value>, ProviderError> {
    self.log("read_resource", type_name)?;
    self.require_configured("read_resource")?;
    Ok(match &self.read_fn {
      Some(f) => f(type_name, current),
      None => Some(current.clone()),
    })
  }

  async fn plan_resource_change(&self, request: PlanRequest) -> Result<PlannedChange, ProviderError> {
    self.log("plan_resource_change", &request.type_name)?;
    self.require_configured("plan_resource_change")?;
    Ok(PlannedChange {
      planned: request.proposed,
      requires_replace: self
        .replace_paths
        .get(&request.type_name)
        .cloned()
        .unwrap_or_default(),
      planned_private: request.prior_private,
    })
  }

  async fn apply_resource_change(&self, request: ApplyRequest) -> Result<AppliedChange, ProviderError> {
    self.log("apply_resource_change", &request.type_name)?;
    self.require_configured("apply_resource_change")?;

    if let Some(hook) = &self.apply_hook {
      if let Some(result) = hook(&request) {
        return match result {
          Ok(new) => Ok(AppliedChange {
            new,
            private: request.planned_private,
          }),
          Err(message) => Err(ProviderError::Call {
            addr: self.addr.clone(),
            method: "apply_resource_change",
            message,
          }),
        };
      }
    }

    let new = request
      .planned
      .as_ref()
      .map(|planned| self.resolve_unknowns(&request.type_name, planned));
    Ok(AppliedChange {
      new,
      private: request.planned_private,
    })
  }

  async fn import_resource_state(&self, type_name: &str, id: &str) -> Result<Value, ProviderError> {
    self.log("import_resource_state", type_name)?;
    self.require_configured("import_resource_state")?;

    if let Some(f) = &self.import_fn {
      return f(type_name, id).map_err(|message| ProviderError::Call {
        addr: self.addr.clone(),
        method: "import_resource_state",
        message,
      });
    }

    // Default: a full object with the id attribute set and everything else
    // null, shaped by the schema.
    let schema = self.schema.resource(type_name).ok_or_else(|| ProviderError::UnknownType {
      addr: self.addr.clone(),
      type_name: type_name.to_string(),
    })?;
    Ok(Value::object(schema.attrs.iter().map(|(name, attr)| {
      let value = if name == "id" {
        Value::string(id)
      } else {
        Value::null(attr.ty.clone())
      };
      (name.clone(), value)
    })))
  }

  async fn read_data_source(&self, type_name: &str, config: &Value) -> Result<Value, ProviderError> {
    self.log("read_data_source", type_name)?;
    self.require_configured("read_data_source")?;
    match &self.data_fn {
      Some(f) => f(type_name, config).map_err(|message| ProviderError::Call {
        addr: self.addr.clone(),
        method: "read_data_source",
        message,
      }),
      None => Ok(config.clone()),
    }
  }

  async fn stop(&self) -> Result<(), ProviderError> {
    self.log("stop", "")?;
    self.state.lock().stopped = true;
    Ok(())
  }

  async fn close(&self) -> Result<(), ProviderError> {
    self.log("close", "")?;
    self.state.lock().closed = true;
    Ok(())
  }
}

/// A factory over fixed mock instances.
pub struct MockFactory {
  providers: HashMap<ProviderAddr, Arc<dyn Provider>>,
  fallback: Option<Arc<dyn Provider>>,
}

impl MockFactory {
  /// Serves the same instance for every provider address.
  pub fn single(provider: Arc<dyn Provider>) -> Self {
    MockFactory {
      providers: HashMap::new(),
      fallback: Some(provider),
    }
  }

  pub fn with(providers: impl IntoIterator<Item = (ProviderAddr, Arc<dyn Provider>)>) -> Self {
    MockFactory {
      providers: providers.into_iter().collect(),
      fallback: None,
    }
  }
}

#[async_trait]
impl ProviderFactory for MockFactory {
  async fn start(&self, addr: &ProviderAddr) -> Result<Arc<dyn Provider>, ProviderError> {
    self
      .providers
      .get(addr)
      .or(self.fallback.as_ref())
      .cloned()
      .ok_or_else(|| ProviderError::Start {
        addr: addr.clone(),
        message: "no mock registered for this address".to_string(),
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use gantry_core::schema::AttrSchema;

  fn provider() -> MockProvider {
    MockProvider::new()
      .with_resource(
        "null_resource",
        BlockSchema::new(
          0,
          [
            ("id".to_string(), AttrSchema::computed(Ty::String)),
            ("region".to_string(), AttrSchema::optional(Ty::String)),
          ],
        ),
      )
      .with_create_value("null_resource", "id", Value::string("yes"))
  }

  #[tokio::test]
  async fn calls_before_configure_rejected() {
    let p = provider();
    let err = p.read_resource("null_resource", &Value::empty_object(), None).await.unwrap_err();
    assert!(matches!(err, ProviderError::NotConfigured { .. }));
  }

  #[tokio::test]
  async fn apply_resolves_unknowns_from_canned_values() {
    let p = provider();
    p.configure(&Value::empty_object()).await.unwrap();

    let planned = Value::object([
      ("id".to_string(), Value::unknown(Ty::String)),
      ("region".to_string(), Value::string("eu")),
    ]);
    let applied = p
      .apply_resource_change(ApplyRequest {
        type_name: "null_resource".into(),
        prior: None,
        planned: Some(planned),
        planned_private: None,
      })
      .await
      .unwrap();
    let new = applied.new.unwrap();
    assert_eq!(new.get_attr("id").unwrap().as_str(), Some("yes"));
    assert_eq!(new.get_attr("region").unwrap().as_str(), Some("eu"));
  }

  #[tokio::test]
  async fn destroy_returns_none() {
    let p = provider();
    p.configure(&Value::empty_object()).await.unwrap();
    let applied = p
      .apply_resource_change(ApplyRequest {
        type_name: "null_resource".into(),
        prior: Some(Value::empty_object()),
        planned: None,
        planned_private: None,
      })
      .await
      .unwrap();
    assert!(applied.new.is_none());
  }

  #[tokio::test]
  async fn closed_provider_rejects_everything() {
    let p = provider();
    p.close().await.unwrap();
    assert!(matches!(p.get_schema().await.unwrap_err(), ProviderError::Closed { .. }));
  }

  #[tokio::test]
  async fn default_import_shapes_by_schema() {
    let p = provider();
    p.configure(&Value::empty_object()).await.unwrap();
    let imported = p.import_resource_state("null_resource", "i-123").await.unwrap();
    assert_eq!(imported.get_attr("id").unwrap().as_str(), Some("i-123"));
    assert!(imported.get_attr("region").unwrap().is_null());
  }
}
