//! The provider broker: process lifecycle, schema cache, configured pool.
//!
//! One provider process is started per distinct provider address; its schema
//! is fetched once at handshake and served from cache afterwards. Configured
//! instances are pooled by (provider address, alias) so a walk configures
//! each binding exactly once. `Close` is issued exactly once per started
//! process no matter how many times teardown is requested.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gantry_core::addr::{ProviderAddr, ProviderConfigAddr};
use gantry_core::schema::{BlockSchema, ProviderSchema};
use gantry_core::value::Value;

use crate::{AppliedChange, ApplyRequest, PlanRequest, PlannedChange, Provider, ProviderError};

/// Starts provider instances for addresses. The process transport implements
/// this for real plugins; tests substitute in-process mocks.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
  async fn start(&self, addr: &ProviderAddr) -> Result<Arc<dyn Provider>, ProviderError>;
}

struct Started {
  provider: Arc<dyn Provider>,
  schema: ProviderSchema,
  closed: bool,
}

/// A provider that has been configured for one binding. Holding one of these
/// is the proof the engine needs that `Configure` already happened; resource
/// calls only exist on this handle.
pub struct ConfiguredProvider {
  addr: ProviderConfigAddr,
  provider: Arc<dyn Provider>,
  schema: ProviderSchema,
}

impl ConfiguredProvider {
  pub fn addr(&self) -> &ProviderConfigAddr {
    &self.addr
  }

  pub fn schema(&self) -> &ProviderSchema {
    &self.schema
  }

  /// The schema for a resource or data-source type, with a typed error
  /// naming the provider when absent.
  pub fn block_schema(&self, type_name: &str, data: bool) -> Result<&BlockSchema, ProviderError> {
    let block = match data {
      false => self.schema.resource(type_name),
      true => self.schema.data_source(type_name),
    };
    block.ok_or_else(|| ProviderError::UnknownType {
      addr: self.addr.provider.clone(),
      type_name: type_name.to_string(),
    })
  }

  pub async fn validate_resource_config(&self, type_name: &str, config: &Value) -> Result<(), ProviderError> {
    self.provider.validate_resource_config(type_name, config).await
  }

  pub async fn upgrade_resource_state(
    &self,
    type_name: &str,
    from_version: u64,
    raw: serde_json::Value,
  ) -> Result<Value, ProviderError> {
    self.provider.upgrade_resource_state(type_name, from_version, raw).await
  }

  pub async fn read_resource(
    &self,
    type_name: &str,
    current: &Value,
    private: Option<&[u8]>,
  ) -> Result<Option<Value>, ProviderError> {
    self.provider.read_resource(type_name, current, private).await
  }

  pub async fn plan_resource_change(&self, request: PlanRequest) -> Result<PlannedChange, ProviderError> {
    self.provider.plan_resource_change(request).await
  }

  pub async fn apply_resource_change(&self, request: ApplyRequest) -> Result<AppliedChange, ProviderError> {
    self.provider.apply_resource_change(request).await
  }

  pub async fn import_resource_state(&self, type_name: &str, id: &str) -> Result<Value, ProviderError> {
    self.provider.import_resource_state(type_name, id).await
  }

  pub async fn read_data_source(&self, type_name: &str, config: &Value) -> Result<Value, ProviderError> {
    self.provider.read_data_source(type_name, config).await
  }
}

/// Owns every provider a walk touches.
pub struct Broker {
  factory: Arc<dyn ProviderFactory>,
  started: Mutex<HashMap<ProviderAddr, Started>>,
  configured: Mutex<HashMap<ProviderConfigAddr, Arc<ConfiguredProvider>>>,
}

impl Broker {
  pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
    Broker {
      factory,
      started: Mutex::new(HashMap::new()),
      configured: Mutex::new(HashMap::new()),
    }
  }

  /// The cached schema for a provider, starting it on first use.
  pub async fn schema(&self, addr: &ProviderAddr) -> Result<ProviderSchema, ProviderError> {
    let mut started = self.started.lock().await;
    Ok(self.ensure_started(&mut started, addr).await?.schema.clone())
  }

  async fn ensure_started<'a>(
    &self,
    started: &'a mut HashMap<ProviderAddr, Started>,
    addr: &ProviderAddr,
  ) -> Result<&'a mut Started, ProviderError> {
    if !started.contains_key(addr) {
      info!(provider = %addr, "starting provider");
      let provider = self.factory.start(addr).await?;
      let schema = provider.get_schema().await?;
      started.insert(
        addr.clone(),
        Started {
          provider,
          schema,
          closed: false,
        },
      );
    }
    Ok(started.get_mut(addr).expect("just inserted"))
  }

  /// A configured provider instance for one binding, pooled by address.
  pub async fn configure(
    &self,
    addr: &ProviderConfigAddr,
    config: &Value,
  ) -> Result<Arc<ConfiguredProvider>, ProviderError> {
    {
      let configured = self.configured.lock().await;
      if let Some(existing) = configured.get(addr) {
        debug!(provider = %addr, "reusing configured provider");
        return Ok(existing.clone());
      }
    }

    let (provider, schema) = {
      let mut started = self.started.lock().await;
      let entry = self.ensure_started(&mut started, &addr.provider).await?;
      if entry.closed {
        return Err(ProviderError::Closed {
          addr: addr.provider.clone(),
        });
      }
      (entry.provider.clone(), entry.schema.clone())
    };

    provider.validate_provider_config(config).await?;
    provider.configure(config).await?;
    debug!(provider = %addr, "configured provider");

    let handle = Arc::new(ConfiguredProvider {
      addr: addr.clone(),
      provider,
      schema,
    });
    self.configured.lock().await.insert(addr.clone(), handle.clone());
    Ok(handle)
  }

  /// The already-configured instance for a binding, if any.
  pub async fn configured(&self, addr: &ProviderConfigAddr) -> Option<Arc<ConfiguredProvider>> {
    self.configured.lock().await.get(addr).cloned()
  }

  /// Closes one provider process. Idempotent: only the first call reaches
  /// the provider.
  pub async fn close_provider(&self, addr: &ProviderAddr) -> Result<(), ProviderError> {
    let provider = {
      let mut started = self.started.lock().await;
      match started.get_mut(addr) {
        Some(entry) if !entry.closed => {
          entry.closed = true;
          entry.provider.clone()
        }
        _ => return Ok(()),
      }
    };
    debug!(provider = %addr, "closing provider");
    provider.close().await
  }

  /// Asks every started provider to stop in-flight work (soft cancel).
  pub async fn stop_all(&self) {
    let providers: Vec<(ProviderAddr, Arc<dyn Provider>)> = {
      let started = self.started.lock().await;
      started
        .iter()
        .filter(|(_, s)| !s.closed)
        .map(|(a, s)| (a.clone(), s.provider.clone()))
        .collect()
    };
    for (addr, provider) in providers {
      if let Err(err) = provider.stop().await {
        warn!(provider = %addr, error = %err, "provider stop failed");
      }
    }
  }

  /// Closes everything still open, collecting failures.
  pub async fn close_all(&self) -> Vec<ProviderError> {
    let addrs: Vec<ProviderAddr> = self.started.lock().await.keys().cloned().collect();
    let mut errors = Vec::new();
    for addr in addrs {
      if let Err(err) = self.close_provider(&addr).await {
        errors.push(err);
      }
    }
    self.configured.lock().await.clear();
    errors
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mock::{MockFactory, MockProvider};
  use gantry_core::schema::AttrSchema;
  use gantry_core::value::Ty;

  fn mock() -> Arc<MockProvider> {
    Arc::new(MockProvider::new().with_resource(
      "null_resource",
      BlockSchema::new(0, [("id".to_string(), AttrSchema::computed(Ty::String))]),
    ))
  }

  fn null_addr() -> ProviderAddr {
    ProviderAddr::default_registry("null")
  }

  #[tokio::test]
  async fn schema_fetched_once_and_cached() {
    let provider = mock();
    let broker = Broker::new(Arc::new(MockFactory::single(provider.clone())));

    let addr = null_addr();
    broker.schema(&addr).await.unwrap();
    broker.schema(&addr).await.unwrap();
    assert_eq!(provider.calls_named("get_schema"), 1);
  }

  #[tokio::test]
  async fn configure_pools_by_binding() {
    let provider = mock();
    let broker = Broker::new(Arc::new(MockFactory::single(provider.clone())));

    let binding = ProviderConfigAddr::new(null_addr(), None);
    let a = broker.configure(&binding, &Value::empty_object()).await.unwrap();
    let b = broker.configure(&binding, &Value::empty_object()).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(provider.calls_named("configure"), 1);

    // A different alias is a different instance of the same process.
    let aliased = ProviderConfigAddr::new(null_addr(), Some("east".into()));
    broker.configure(&aliased, &Value::empty_object()).await.unwrap();
    assert_eq!(provider.calls_named("configure"), 2);
    assert_eq!(provider.calls_named("get_schema"), 1);
  }

  #[tokio::test]
  async fn close_called_exactly_once() {
    let provider = mock();
    let broker = Broker::new(Arc::new(MockFactory::single(provider.clone())));
    broker.schema(&null_addr()).await.unwrap();

    broker.close_provider(&null_addr()).await.unwrap();
    broker.close_provider(&null_addr()).await.unwrap();
    assert!(broker.close_all().await.is_empty());
    assert_eq!(provider.calls_named("close"), 1);
  }

  #[tokio::test]
  async fn unknown_type_is_typed_error() {
    let provider = mock();
    let broker = Broker::new(Arc::new(MockFactory::single(provider)));
    let binding = ProviderConfigAddr::new(null_addr(), None);
    let configured = broker.configure(&binding, &Value::empty_object()).await.unwrap();

    let err = configured.block_schema("nonexistent_thing", false).unwrap_err();
    assert!(matches!(err, ProviderError::UnknownType { .. }));
  }
}
