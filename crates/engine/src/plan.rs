//! The plan walker: traverses the graph to produce per-resource change
//! proposals.
//!
//! Planning never mutates persisted state. It works over a private copy of
//! the prior state that refresh updates in memory, consults providers for
//! proposed changes, and finishes with an ordered, serial-bound [`Plan`].
//! Any error means no plan artifact at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use gantry_core::addr::{
  InstanceAddr, InstanceKey, ModulePath, ProviderConfigAddr, ResourceAddr, ResourceMode, Target,
};
use gantry_core::config::{Config, Module, Resource};
use gantry_core::diags::{Diagnostic, Diagnostics};
use gantry_core::schema::BlockSchema;
use gantry_core::value::{
  value_from_json, value_to_json, AttrPath, MarkedPath, Marks, PathStep, Ty, Value, ValueKind,
};
use gantry_provider::broker::{Broker, ConfiguredProvider};
use gantry_provider::PlanRequest;
use gantry_state::{StateFile, StateInstance};

use crate::eval::{evaluate, for_each_keys, for_each_value, EvalContext, Expansion, Scope};
use crate::graph::{build_plan_graph, find_provider_block, ExpandNode, Node};
use crate::walk::{walk, NodeExecutor, NodeOutcome, WalkOptions};

/// What to do to one resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Action {
  NoOp,
  Read,
  Create,
  Update,
  Delete,
  CreateThenDelete,
  DeleteThenCreate,
  Forget,
}

impl Action {
  pub fn is_noop(&self) -> bool {
    *self == Action::NoOp
  }

  pub fn is_replace(&self) -> bool {
    matches!(self, Action::CreateThenDelete | Action::DeleteThenCreate)
  }

  pub fn destroys(&self) -> bool {
    matches!(self, Action::Delete | Action::CreateThenDelete | Action::DeleteThenCreate)
  }
}

/// Why an action was chosen, where the choice is not obvious from the
/// action itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChangeReason {
  Tainted,
  RequiresReplace,
  NoResourceConfig,
  Removed,
  DeferredRead,
}

/// One planned resource change.
#[derive(Debug, Clone)]
pub struct ResourceChange {
  pub addr: InstanceAddr,
  pub provider: ProviderConfigAddr,
  pub action: Action,
  pub prior: Option<Value>,
  pub planned: Option<Value>,
  pub requires_replace: Vec<AttrPath>,
  pub reason: Option<ChangeReason>,
  /// Set when an import block adopts this instance: the import id.
  pub importing: Option<String>,
  pub private: Option<Vec<u8>>,
  pub create_before_destroy: bool,
}

/// A projected root output value.
#[derive(Debug, Clone)]
pub struct OutputChange {
  pub name: String,
  pub value: Value,
  pub sensitive: bool,
}

/// A resource whose expansion could not be decided at plan time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredResource {
  pub addr: String,
  /// Which input was unknown, e.g. `count` or `for_each (var.n)`.
  pub input: String,
}

/// The product of a successful plan walk.
#[derive(Debug, Clone)]
pub struct Plan {
  /// Serial of the state this plan was computed against; applying against
  /// any other serial is rejected.
  pub base_serial: u64,
  pub base_lineage: String,
  pub config_hash: String,
  pub changes: Vec<ResourceChange>,
  pub output_changes: Vec<OutputChange>,
  pub variables: BTreeMap<String, Value>,
  pub deferred: Vec<DeferredResource>,
  /// False when the walk was cancelled part-way.
  pub complete: bool,
}

impl Plan {
  pub fn has_changes(&self) -> bool {
    self.changes.iter().any(|c| !c.action.is_noop()) || !self.deferred.is_empty()
  }

  pub fn change_for(&self, addr: &InstanceAddr) -> Option<&ResourceChange> {
    self.changes.iter().find(|c| c.addr == *addr)
  }
}

/// Options for one plan walk.
pub struct PlanOptions {
  /// Root input variable values, e.g. from CLI or var files.
  pub variables: BTreeMap<String, Value>,
  /// Address selectors limiting which resources may change; empty means
  /// everything.
  pub targets: Vec<Target>,
  /// Refresh prior objects from providers before planning (default true).
  pub refresh: bool,
  pub workspace: String,
  pub walk: WalkOptions,
}

impl Default for PlanOptions {
  fn default() -> Self {
    PlanOptions {
      variables: BTreeMap::new(),
      targets: Vec::new(),
      refresh: true,
      workspace: gantry_state::backend::DEFAULT_WORKSPACE.to_string(),
      walk: WalkOptions::default(),
    }
  }
}

/// A deterministic digest of the configuration, binding plans to the exact
/// IR they were computed from.
pub fn config_hash(config: &Config) -> String {
  let mut hasher = Sha256::new();
  hasher.update(format!("{:?}", config).as_bytes());
  let digest = hasher.finalize();
  digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Computes a plan. On any error the diagnostics carry the failures and no
/// plan is produced; cancellation yields a partial plan marked incomplete.
pub async fn plan(
  config: Arc<Config>,
  prior: &StateFile,
  broker: Arc<Broker>,
  options: PlanOptions,
) -> (Option<Plan>, Diagnostics) {
  let mut diags = config.validate();
  if diags.has_errors() {
    return (None, diags);
  }

  // Deposed objects owned by resources no longer configured: surface them,
  // never clean them up implicitly.
  for addr in prior.resources_with_deposed() {
    let configured = config
      .module(&addr.module)
      .and_then(|m| m.resource(addr.mode, &addr.type_name, &addr.name))
      .is_some();
    if !configured {
      diags.push(
        Diagnostic::warning("deposed objects left behind by a removed resource")
          .with_detail(
            "this state still holds deposed objects for a resource that is no longer configured; \
             re-add the resource or remove the objects explicitly",
          )
          .with_address(addr),
      );
    }
  }

  let graph = build_plan_graph(&config, prior);
  let cycle_diags = graph.check_cycles();
  if cycle_diags.has_errors() {
    diags.append(cycle_diags);
    return (None, diags);
  }

  let shared = Arc::new(PlanShared {
    config: config.clone(),
    broker,
    scope: Scope::new(options.workspace.clone()),
    working_state: Mutex::new(prior.clone()),
    providers: Mutex::new(std::collections::HashMap::new()),
    changes: Mutex::new(Vec::new()),
    output_changes: Mutex::new(Vec::new()),
    deferred: Mutex::new(Vec::new()),
    variable_values: Mutex::new(BTreeMap::new()),
    options,
  });

  // Cancellation reaches in-flight provider work as a Stop call; the
  // watcher ends when this walk returns and drops the guard.
  let (_stop_guard, stop_rx) = tokio::sync::oneshot::channel::<()>();
  {
    let broker = shared.broker.clone();
    let cancel = shared.options.walk.cancel.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = cancel.cancelled() => broker.stop_all().await,
        _ = stop_rx => {}
      }
    });
  }

  let executor = Arc::new(PlanExecutor {
    shared: shared.clone(),
  });
  let walk_options = shared.options.walk.clone();
  info!(nodes = graph.node_count(), "starting plan walk");
  let report = walk(graph, executor, &walk_options).await;
  diags.append(report.diags);
  for (skipped, cause) in &report.skipped {
    debug!(node = %skipped, cause = %cause, "node skipped");
  }

  // Hard-cancelled tasks may still hold clones of the shared context for a
  // moment, so results are copied out rather than unwrapped.
  let mut changes = shared.changes.lock().clone();

  // Forget actions from removed blocks: drop from state without touching
  // the remote objects.
  for removed in &config.root.removed {
    if removed.destroy {
      continue;
    }
    for inst in prior.all_instances() {
      if inst.resource == removed.from {
        changes.push(ResourceChange {
          addr: inst.clone(),
          provider: prior
            .resources
            .iter()
            .find(|r| r.addr() == inst.resource)
            .and_then(|r| r.provider_addr())
            .unwrap_or_else(|| ProviderConfigAddr::new(
              gantry_core::addr::ProviderAddr::default_registry("null"),
              None,
            )),
          action: Action::Forget,
          prior: None,
          planned: None,
          requires_replace: Vec::new(),
          reason: Some(ChangeReason::Removed),
          importing: None,
          private: None,
          create_before_destroy: false,
        });
      }
    }
  }

  changes.sort_by(|a, b| a.addr.cmp(&b.addr));
  let mut output_changes = shared.output_changes.lock().clone();
  output_changes.sort_by(|a, b| a.name.cmp(&b.name));
  let mut deferred = shared.deferred.lock().clone();
  deferred.sort_by(|a, b| a.addr.cmp(&b.addr));

  if diags.has_errors() {
    return (None, diags);
  }

  let plan = Plan {
    base_serial: prior.serial,
    base_lineage: prior.lineage.clone(),
    config_hash: config_hash(&config),
    changes,
    output_changes,
    variables: shared.variable_values.lock().clone(),
    deferred,
    complete: report.complete,
  };
  info!(
    changes = plan.changes.iter().filter(|c| !c.action.is_noop()).count(),
    deferred = plan.deferred.len(),
    complete = plan.complete,
    "plan walk finished"
  );
  (Some(plan), diags)
}

struct PlanShared {
  config: Arc<Config>,
  broker: Arc<Broker>,
  scope: Scope,
  working_state: Mutex<StateFile>,
  providers: Mutex<std::collections::HashMap<ProviderConfigAddr, Arc<ConfiguredProvider>>>,
  changes: Mutex<Vec<ResourceChange>>,
  output_changes: Mutex<Vec<OutputChange>>,
  deferred: Mutex<Vec<DeferredResource>>,
  variable_values: Mutex<BTreeMap<String, Value>>,
  options: PlanOptions,
}

impl PlanShared {
  fn module(&self, path: &ModulePath) -> Option<&Module> {
    self.config.module(path)
  }

  fn provider_handle(&self, addr: &ProviderConfigAddr) -> Option<Arc<ConfiguredProvider>> {
    self.providers.lock().get(addr).cloned()
  }

  fn record_change(&self, change: ResourceChange) {
    self.changes.lock().push(change);
  }

  fn record_deferred(&self, addr: String, input: String) {
    self.deferred.lock().push(DeferredResource { addr, input });
  }

  fn targeted(&self, addr: &ResourceAddr) -> bool {
    self.options.targets.is_empty() || self.options.targets.iter().any(|t| t.matches_resource(addr))
  }
}

struct PlanExecutor {
  shared: Arc<PlanShared>,
}

#[async_trait]
impl NodeExecutor for PlanExecutor {
  async fn execute(&self, node: Node) -> NodeOutcome {
    match self.execute_inner(node).await {
      Ok(outcome) => outcome,
      Err(diag) => NodeOutcome::Failed(diag),
    }
  }
}

impl PlanExecutor {
  async fn execute_inner(&self, node: Node) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    match node {
      Node::Root | Node::CloseProvider(_) => {
        // Plan walks keep providers alive; teardown belongs to whoever owns
        // the broker, after any apply that consumes this plan.
        Ok(NodeOutcome::Done)
      }
      Node::Variable { module, name } => self.execute_variable(&module, &name),
      Node::Local { module, name } => {
        let m = shared
          .module(&module)
          .ok_or_else(|| internal(format!("module {} missing from config", module)))?;
        let local = m
          .locals
          .get(&name)
          .ok_or_else(|| internal(format!("local {} missing from module", name)))?;
        let ctx = EvalContext::new(&shared.scope, module.clone());
        let value = evaluate(&local.expr, &ctx)?;
        shared.scope.publish_local(&module, &name, value);
        Ok(NodeOutcome::Done)
      }
      Node::Output { module, name } => self.execute_output(&module, &name),
      Node::ModuleCall { module, name } => self.execute_module_call(&module, &name),
      Node::ProviderConfig(addr) => self.execute_provider_config(addr).await,
      Node::ConfigResource(addr) => self.execute_config_resource(addr),
      Node::ResourceInstance(addr) => self.execute_instance(addr).await,
      Node::ResourceInstanceDestroy { addr, .. } => self.execute_orphan_destroy(addr).await,
    }
  }

  fn execute_variable(&self, module: &ModulePath, name: &str) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let m = shared
      .module(module)
      .ok_or_else(|| internal(format!("module {} missing from config", module)))?;
    let variable = m
      .variables
      .get(name)
      .ok_or_else(|| internal(format!("variable {} missing from module", name)))?;

    let provided = if module.is_root() {
      shared.options.variables.get(name).cloned()
    } else {
      shared.scope.module_arg(module, name)
    };

    let mut value = match provided {
      Some(value) => {
        if let Some(ty) = &variable.ty {
          value.check_type(ty).map_err(|e| {
            Diagnostic::error(format!("invalid value for variable {:?}", name)).with_detail(e.to_string())
          })?;
        }
        value
      }
      None => match &variable.default {
        Some(default) => default.clone(),
        None => Value::unknown(variable.ty.clone().unwrap_or(Ty::Dynamic)),
      },
    };
    if variable.sensitive {
      value = value.mark_sensitive();
    }

    shared.scope.publish_variable(module, name, value.clone());
    if module.is_root() {
      shared.variable_values.lock().insert(name.to_string(), value.clone());
    }

    // Validation blocks run after publication so conditions can reference
    // the variable itself.
    let ctx = EvalContext::new(&shared.scope, module.clone());
    for validation in &variable.validations {
      let result = evaluate(&validation.condition, &ctx)?;
      if result.is_unknown() {
        continue;
      }
      if result.as_bool() == Some(false) {
        return Err(
          Diagnostic::error(format!("invalid value for variable {:?}", name))
            .with_detail(validation.error_message.clone()),
        );
      }
    }
    Ok(NodeOutcome::Done)
  }

  fn execute_output(&self, module: &ModulePath, name: &str) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let m = shared
      .module(module)
      .ok_or_else(|| internal(format!("module {} missing from config", module)))?;
    let output = m
      .outputs
      .get(name)
      .ok_or_else(|| internal(format!("output {} missing from module", name)))?;

    let ctx = EvalContext::new(&shared.scope, module.clone());
    let mut value = evaluate(&output.expr, &ctx)?;

    // Sensitive derivations must be acknowledged at the output.
    if value.has_sensitive() && !output.sensitive {
      return Err(
        Diagnostic::error("output refers to sensitive values")
          .with_detail(format!(
            "output {:?} depends on a sensitive value; mark the output sensitive to allow this",
            name
          ))
          .with_address(format!("output.{}", name)),
      );
    }
    if output.sensitive {
      value = value.mark_sensitive();
    }
    if let Some(message) = &output.deprecated {
      value = value.with_marks(Marks::deprecated(message.clone()));
    }

    shared.scope.publish_output(module, name, value.clone());
    if module.is_root() {
      shared.output_changes.lock().push(OutputChange {
        name: name.to_string(),
        value: value.clone(),
        sensitive: output.sensitive,
      });
    }
    Ok(NodeOutcome::Done)
  }

  fn execute_module_call(&self, module: &ModulePath, name: &str) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let m = shared
      .module(module)
      .ok_or_else(|| internal(format!("module {} missing from config", module)))?;
    let call = m
      .module_calls
      .get(name)
      .ok_or_else(|| internal(format!("module call {} missing", name)))?;
    let call_key = Node::ModuleCall {
      module: module.clone(),
      name: name.to_string(),
    }
    .key();
    let ctx = EvalContext::new(&shared.scope, module.clone());

    if call.for_each.is_none() && call.count.is_none() {
      let child_path = module.child(name);
      for (arg, expr) in &call.args {
        let value = evaluate(expr, &ctx)?;
        shared.scope.publish_module_arg(&child_path, arg, value);
      }
      shared.scope.register_module_expansion(&call_key, Expansion::Single);
      return Ok(NodeOutcome::Done);
    }

    // Keyed module call: expansion decided now, child nodes appended.
    let keys: Vec<InstanceKey> = if let Some(for_each) = &call.for_each {
      let collection = evaluate(for_each, &ctx)?;
      if collection.is_unknown() {
        shared.scope.register_module_expansion(&call_key, Expansion::Deferred);
        shared.record_deferred(call_key.clone(), "for_each".to_string());
        return Ok(NodeOutcome::Done);
      }
      let keys = for_each_keys(&collection)
        .map_err(|e| Diagnostic::error("invalid for_each on module call").with_detail(e))?;
      shared
        .scope
        .register_module_expansion(&call_key, Expansion::Keys(keys.clone()));
      keys.into_iter().map(InstanceKey::Str).collect()
    } else {
      let count_expr = call.count.as_ref().expect("checked above");
      let count = evaluate(count_expr, &ctx)?;
      if count.is_unknown() {
        shared.scope.register_module_expansion(&call_key, Expansion::Deferred);
        shared.record_deferred(call_key.clone(), "count".to_string());
        return Ok(NodeOutcome::Done);
      }
      let n = count.as_u64().ok_or_else(|| {
        Diagnostic::error("invalid count on module call")
          .with_detail(format!("count must be a non-negative whole number, got {}", count))
      })?;
      shared.scope.register_module_expansion(&call_key, Expansion::Count(n));
      (0..n).map(InstanceKey::Index).collect()
    };

    let mut batch = Vec::new();
    for key in keys {
      let child_path = module.child_keyed(name, Some(key.clone()));
      let each_ctx = match &key {
        InstanceKey::Str(k) => {
          let collection = evaluate(call.for_each.as_ref().expect("keyed by for_each"), &ctx)?;
          ctx
            .clone()
            .with_each(Value::string(k.clone()), for_each_value(&collection, k))
        }
        InstanceKey::Index(i) => ctx.clone().with_count_index(*i),
      };
      for (arg, expr) in &call.args {
        let value = evaluate(expr, &each_ctx)?;
        shared.scope.publish_module_arg(&child_path, arg, value);
      }
      batch.extend(crate::graph::module_batch(&shared.config, &call.module, &child_path, None));
    }
    Ok(NodeOutcome::Expanded(batch))
  }

  async fn execute_provider_config(&self, addr: ProviderConfigAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let config_value = match find_provider_block(&shared.config, &addr) {
      Some((module_path, block)) => {
        let ctx = EvalContext::new(&shared.scope, module_path);
        evaluate(&block.config, &ctx)?
      }
      None => Value::empty_object(),
    };
    let (stripped, _) = config_value.strip_marks();
    let handle = shared
      .broker
      .configure(&addr, &stripped)
      .await
      .map_err(|e| Diagnostic::error("provider configuration failed").with_detail(e.to_string()).with_address(&addr))?;
    shared.providers.lock().insert(addr, handle);
    Ok(NodeOutcome::Done)
  }

  fn execute_config_resource(&self, addr: ResourceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let m = shared
      .module(&addr.module)
      .ok_or_else(|| internal(format!("module {} missing from config", addr.module)))?;
    let resource = m
      .resource(addr.mode, &addr.type_name, &addr.name)
      .ok_or_else(|| internal(format!("resource {} missing from config", addr)))?;
    let ctx = EvalContext::new(&shared.scope, addr.module.clone());

    if !shared.targeted(&addr) {
      // Untargeted resources contribute no changes; dependents see unknown
      // values, which keeps anything derived from them conservative.
      shared.scope.register_resource_expansion(&addr, Expansion::Deferred);
      return Ok(NodeOutcome::Done);
    }

    let expansion = if let Some(for_each) = &resource.for_each {
      let collection = evaluate(for_each, &ctx)?;
      if collection.is_unknown() {
        let input = describe_unknown_input("for_each", for_each);
        shared.scope.register_resource_expansion(&addr, Expansion::Deferred);
        shared.record_deferred(addr.to_string(), input);
        return Ok(NodeOutcome::Done);
      }
      Expansion::Keys(
        for_each_keys(&collection)
          .map_err(|e| Diagnostic::error("invalid for_each value").with_detail(e).with_address(&addr))?,
      )
    } else if let Some(count) = &resource.count {
      let count_value = evaluate(count, &ctx)?;
      if count_value.is_unknown() {
        let input = describe_unknown_input("count", count);
        shared.scope.register_resource_expansion(&addr, Expansion::Deferred);
        shared.record_deferred(addr.to_string(), input);
        return Ok(NodeOutcome::Done);
      }
      Expansion::Count(count_value.as_u64().ok_or_else(|| {
        Diagnostic::error("invalid count value")
          .with_detail(format!("count must be a non-negative whole number, got {}", count_value))
          .with_address(&addr)
      })?)
    } else {
      Expansion::Single
    };

    shared.scope.register_resource_expansion(&addr, expansion.clone());

    let desired = expansion.keys();
    let mut batch: Vec<ExpandNode> = desired
      .iter()
      .map(|key| ExpandNode {
        node: Node::ResourceInstance(addr.instance(key.clone())),
        deps: Vec::new(),
      })
      .collect();

    // Keys present in prior state but absent from the desired expansion are
    // destroyed (count shrank, for_each key removed).
    let state = shared.working_state.lock();
    for inst in state.all_instances() {
      if inst.resource == addr && !desired.contains(&inst.key) {
        batch.push(ExpandNode {
          node: Node::ResourceInstanceDestroy {
            addr: inst,
            deposed: false,
          },
          deps: Vec::new(),
        });
      }
    }
    drop(state);

    debug!(resource = %addr, instances = batch.len(), "expanded resource");
    Ok(NodeOutcome::Expanded(batch))
  }

  async fn execute_instance(&self, addr: InstanceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let m = shared
      .module(addr.module_path())
      .ok_or_else(|| internal(format!("module {} missing from config", addr.module_path())))?;
    let resource = m
      .resource(addr.resource.mode, &addr.resource.type_name, &addr.resource.name)
      .ok_or_else(|| internal(format!("resource {} missing from config", addr.resource)))?
      .clone();

    let provider_addr = shared.config.resolve_provider(addr.module_path(), &resource);
    let provider = shared
      .provider_handle(&provider_addr)
      .ok_or_else(|| internal(format!("provider {} not configured before {}", provider_addr, addr)))?;
    let schema = provider
      .block_schema(&addr.resource.type_name, addr.resource.mode == ResourceMode::Data)
      .map_err(|e| Diagnostic::error("unknown resource type").with_detail(e.to_string()).with_address(&addr))?
      .clone();

    let ctx = self.instance_ctx(&resource, &addr)?;
    let config_value = evaluate(&resource.body, &ctx)?;
    schema.check_config(&config_value).map_err(|e| {
      Diagnostic::error("resource configuration does not match schema")
        .with_detail(e.to_string())
        .with_address(&addr)
    })?;
    provider
      .validate_resource_config(&addr.resource.type_name, &config_value.strip_marks().0)
      .await
      .map_err(|e| {
        Diagnostic::error("provider rejected resource configuration")
          .with_detail(e.to_string())
          .with_address(&addr)
      })?;

    match addr.resource.mode {
      ResourceMode::Managed => {
        self
          .plan_managed(&addr, &resource, &provider_addr, &provider, &schema, config_value)
          .await
      }
      ResourceMode::Data => {
        self
          .plan_data(&addr, &resource, &provider_addr, &provider, &schema, config_value)
          .await
      }
    }
  }

  fn instance_ctx<'a>(
    &'a self,
    resource: &Resource,
    addr: &InstanceAddr,
  ) -> Result<EvalContext<'a>, Diagnostic> {
    let shared = &self.shared;
    let ctx = EvalContext::new(&shared.scope, addr.module_path().clone());
    match &addr.key {
      None => Ok(ctx),
      Some(InstanceKey::Index(i)) => Ok(ctx.with_count_index(*i)),
      Some(InstanceKey::Str(key)) => {
        let for_each = resource
          .for_each
          .as_ref()
          .ok_or_else(|| internal(format!("string key on resource without for_each: {}", addr)))?;
        let collection = evaluate(for_each, &ctx)?;
        Ok(ctx.with_each(Value::string(key.clone()), for_each_value(&collection, key)))
      }
    }
  }

  /// Loads and (optionally) refreshes the prior object for an address,
  /// updating the plan's working state with what the provider reported.
  async fn load_prior(
    &self,
    addr: &InstanceAddr,
    provider: &ConfiguredProvider,
    schema: &BlockSchema,
    refresh: bool,
  ) -> Result<Option<(Value, bool, Option<Vec<u8>>)>, Diagnostic> {
    let shared = &self.shared;
    let stored = {
      let state = shared.working_state.lock();
      state.instance(addr).cloned()
    };
    let Some(stored) = stored else {
      return Ok(None);
    };

    let tainted = stored.status == gantry_state::InstanceStatus::Tainted;
    let private = stored
      .private
      .as_ref()
      .and_then(|p| {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.decode(p).ok()
      });

    let mut prior = if stored.schema_version != schema.version {
      provider
        .upgrade_resource_state(&addr.resource.type_name, stored.schema_version, stored.attributes.clone())
        .await
        .map_err(|e| {
          Diagnostic::error("failed to upgrade resource state")
            .with_detail(e.to_string())
            .with_address(addr)
        })?
    } else {
      value_from_json(&stored.attributes, &schema.object_ty()).map_err(|e| {
        Diagnostic::error("stored state does not match resource schema")
          .with_detail(e.to_string())
          .with_address(addr)
      })?
    };
    let stored_marks: Vec<MarkedPath> = stored
      .sensitive_attributes
      .iter()
      .map(|path| MarkedPath {
        path: path.clone(),
        marks: Marks::sensitive(),
      })
      .collect();
    prior = prior.apply_marked_paths(&stored_marks);
    prior = prior.apply_marked_paths(&schema.implied_marks());

    if refresh {
      let (stripped, mark_paths) = prior.strip_marks();
      let refreshed = provider
        .read_resource(&addr.resource.type_name, &stripped, private.as_deref())
        .await
        .map_err(|e| Diagnostic::error("refresh failed").with_detail(e.to_string()).with_address(addr))?;
      match refreshed {
        None => {
          // The object is gone; planning proceeds as if it never existed.
          warn!(addr = %addr, "object no longer exists, removing from plan's prior state");
          shared.working_state.lock().remove_instance(addr);
          return Ok(None);
        }
        Some(current) => {
          prior = current.apply_marked_paths(&mark_paths);
          prior = prior.apply_marked_paths(&schema.implied_marks());
          let (bare, marks) = prior.strip_marks();
          let mut state = shared.working_state.lock();
          if let Ok(json) = value_to_json(&bare) {
            let mut updated = stored.clone();
            updated.attributes = json;
            updated.schema_version = schema.version;
            updated.sensitive_attributes = marks
              .into_iter()
              .filter(|mp| mp.marks.is_sensitive())
              .map(|mp| mp.path)
              .collect();
            state.set_instance(addr, &provider_key(provider), updated);
          }
        }
      }
    }

    Ok(Some((prior, tainted, private)))
  }

  async fn plan_managed(
    &self,
    addr: &InstanceAddr,
    resource: &Resource,
    provider_addr: &ProviderConfigAddr,
    provider: &ConfiguredProvider,
    schema: &BlockSchema,
    config_value: Value,
  ) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let refresh = shared.options.refresh;
    let mut prior_state = self.load_prior(addr, provider, schema, refresh).await?;
    let mut importing = None;

    // Import blocks adopt existing objects instead of creating new ones.
    if prior_state.is_none() {
      if let Some(import) = shared.config.root.imports.iter().find(|i| i.to == *addr) {
        let ctx = EvalContext::new(&shared.scope, ModulePath::root());
        let id_value = evaluate(&import.id, &ctx)?;
        let id = id_value.as_str().map(str::to_string).ok_or_else(|| {
          Diagnostic::error("import id must be a known string at plan time").with_address(addr)
        })?;
        let imported = provider
          .import_resource_state(&addr.resource.type_name, &id)
          .await
          .map_err(|e| Diagnostic::error("import failed").with_detail(e.to_string()).with_address(addr))?;
        schema.check_object(&imported).map_err(|e| {
          Diagnostic::error("imported object does not match schema")
            .with_detail(e.to_string())
            .with_address(addr)
        })?;
        prior_state = Some((imported.apply_marked_paths(&schema.implied_marks()), false, None));
        importing = Some(id);
      }
    }

    let (prior, tainted, prior_private) = match prior_state {
      Some((prior, tainted, private)) => (Some(prior), tainted, private),
      None => (None, false, None),
    };

    let mut proposed = proposed_new(schema, prior.as_ref(), &config_value);
    if let Some(prior_value) = &prior {
      for path in &resource.lifecycle.ignore_changes {
        if let Some(prior_at) = value_at_path(prior_value, path) {
          proposed = override_at_path(proposed, &path.0, prior_at);
        }
      }
    }
    let (proposed_stripped, proposed_marks) = proposed.strip_marks();
    let prior_stripped = prior.as_ref().map(|p| p.strip_marks().0);

    let planned_change = provider
      .plan_resource_change(PlanRequest {
        type_name: addr.resource.type_name.clone(),
        prior: prior_stripped.clone(),
        proposed: proposed_stripped,
        prior_private: prior_private.clone(),
      })
      .await
      .map_err(|e| Diagnostic::error("provider failed to plan change").with_detail(e.to_string()).with_address(addr))?;

    let mut planned = planned_change.planned.apply_marked_paths(&proposed_marks);
    if let Some(prior) = &prior {
      // Sensitivity recorded in state stays sticky on the planned object.
      let (_, prior_marks) = prior.strip_marks();
      planned = planned.apply_marked_paths(&prior_marks);
    }
    planned = planned.apply_marked_paths(&schema.implied_marks());

    let (mut action, reason) = match (&prior, tainted) {
      (None, _) => (Action::Create, None),
      (Some(_), true) => (
        replace_action(resource.lifecycle.create_before_destroy),
        Some(ChangeReason::Tainted),
      ),
      (Some(prior_value), false) => {
        if values_equal_unmarked(prior_value, &planned) {
          (Action::NoOp, None)
        } else if replace_required(prior_value, &planned, &planned_change.requires_replace) {
          (
            replace_action(resource.lifecycle.create_before_destroy),
            Some(ChangeReason::RequiresReplace),
          )
        } else {
          (Action::Update, None)
        }
      }
    };

    // Import matches rewrite a would-be create into read-then-adopt: the
    // imported object already stands in as the prior, so a clean match is a
    // Read and a mismatch remains an Update that adopts first.
    if importing.is_some() && action == Action::NoOp {
      action = Action::Read;
    }

    if resource.lifecycle.prevent_destroy && action.destroys() {
      return Err(
        Diagnostic::error("resource cannot be destroyed")
          .with_detail(
            "this resource has lifecycle.prevent_destroy set, but the plan calls for it to be \
             destroyed or replaced; remove prevent_destroy or adjust the configuration",
          )
          .with_address(addr),
      );
    }

    shared.scope.publish_resource_instance(addr, planned.clone());
    shared.record_change(ResourceChange {
      addr: addr.clone(),
      provider: provider_addr.clone(),
      action,
      prior,
      planned: Some(planned),
      requires_replace: planned_change.requires_replace,
      reason,
      importing,
      private: planned_change.planned_private,
      create_before_destroy: resource.lifecycle.create_before_destroy,
    });
    Ok(NodeOutcome::Done)
  }

  async fn plan_data(
    &self,
    addr: &InstanceAddr,
    resource: &Resource,
    provider_addr: &ProviderConfigAddr,
    provider: &ConfiguredProvider,
    schema: &BlockSchema,
    config_value: Value,
  ) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;

    // A data read happens now only when its configuration is fully known
    // and nothing it waits on has pending changes.
    let deps_pending = resource.depends_on.iter().any(|dep| {
      shared.changes.lock().iter().any(|c| {
        !c.action.is_noop() && reference_names_resource(dep, &c.addr.resource, addr.module_path())
      })
    });

    if is_fully_known(&config_value) && !deps_pending {
      let (stripped, mark_paths) = config_value.strip_marks();
      let result = provider
        .read_data_source(&addr.resource.type_name, &stripped)
        .await
        .map_err(|e| Diagnostic::error("data source read failed").with_detail(e.to_string()).with_address(addr))?;
      schema.check_object(&result).map_err(|e| {
        Diagnostic::error("data source result does not match schema")
          .with_detail(e.to_string())
          .with_address(addr)
      })?;
      let result = result
        .apply_marked_paths(&mark_paths)
        .apply_marked_paths(&schema.implied_marks());
      shared.scope.publish_resource_instance(addr, result.clone());

      // Data results live in state like everything else.
      let (bare, marks) = result.strip_marks();
      if let Ok(json) = value_to_json(&bare) {
        let mut inst = StateInstance::new(addr.key.clone(), json);
        inst.schema_version = schema.version;
        inst.sensitive_attributes = marks
          .into_iter()
          .filter(|mp| mp.marks.is_sensitive())
          .map(|mp| mp.path)
          .collect();
        shared
          .working_state
          .lock()
          .set_instance(addr, &provider_addr.to_string(), inst);
      }
      return Ok(NodeOutcome::Done);
    }

    // Deferred: read during apply, after dependencies settle.
    let planned = Value::unknown(schema.object_ty());
    shared.scope.publish_resource_instance(addr, planned.clone());
    shared.record_change(ResourceChange {
      addr: addr.clone(),
      provider: provider_addr.clone(),
      action: Action::Read,
      prior: None,
      planned: Some(planned),
      requires_replace: Vec::new(),
      reason: Some(ChangeReason::DeferredRead),
      importing: None,
      private: None,
      create_before_destroy: false,
    });
    Ok(NodeOutcome::Done)
  }

  /// Plans destruction of an instance that exists in state but not in the
  /// desired configuration.
  async fn execute_orphan_destroy(&self, addr: InstanceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let stored = {
      let state = shared.working_state.lock();
      state.instance(&addr).cloned()
    };
    let Some(stored) = stored else {
      return Ok(NodeOutcome::Done);
    };

    let provider_addr = {
      let state = shared.working_state.lock();
      state
        .resources
        .iter()
        .find(|r| r.addr() == addr.resource)
        .and_then(|r| r.provider_addr())
    }
    .ok_or_else(|| {
      Diagnostic::error("cannot destroy orphaned object")
        .with_detail("state does not record a parseable provider for this resource")
        .with_address(&addr)
    })?;

    let prior = match shared.provider_handle(&provider_addr) {
      Some(provider) => match provider.block_schema(&addr.resource.type_name, addr.resource.mode == ResourceMode::Data) {
        Ok(schema) => value_from_json(&stored.attributes, &schema.object_ty()),
        Err(_) => value_from_json(&stored.attributes, &Ty::Dynamic),
      },
      None => value_from_json(&stored.attributes, &Ty::Dynamic),
    }
    .map_err(|e| {
      Diagnostic::error("stored state is not decodable")
        .with_detail(e.to_string())
        .with_address(&addr)
    })?;
    let prior = prior.apply_marked_paths(
      &stored
        .sensitive_attributes
        .iter()
        .map(|path| MarkedPath {
          path: path.clone(),
          marks: Marks::sensitive(),
        })
        .collect::<Vec<_>>(),
    );

    if !shared.targeted(&addr.resource) {
      return Ok(NodeOutcome::Done);
    }

    shared.record_change(ResourceChange {
      addr: addr.clone(),
      provider: provider_addr,
      action: Action::Delete,
      prior: Some(prior),
      planned: None,
      requires_replace: Vec::new(),
      reason: Some(ChangeReason::NoResourceConfig),
      importing: None,
      private: stored.private.as_ref().and_then(|p| {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.decode(p).ok()
      }),
      create_before_destroy: stored.create_before_destroy,
    });
    Ok(NodeOutcome::Done)
  }
}

fn internal(detail: String) -> Diagnostic {
  Diagnostic::error("internal error in plan walk").with_detail(detail)
}

fn provider_key(provider: &ConfiguredProvider) -> String {
  provider.addr().to_string()
}

fn describe_unknown_input(kind: &str, expr: &gantry_core::expr::Expr) -> String {
  match expr.references().first() {
    Some(reference) => format!("{} ({})", kind, reference),
    None => kind.to_string(),
  }
}

fn replace_action(create_before_destroy: bool) -> Action {
  if create_before_destroy {
    Action::CreateThenDelete
  } else {
    Action::DeleteThenCreate
  }
}

/// Builds the proposed new object: configuration wins, computed attributes
/// fall back to the prior value or unknown, everything else nulls out.
pub fn proposed_new(schema: &BlockSchema, prior: Option<&Value>, config: &Value) -> Value {
  let attrs: Vec<(String, Value)> = schema
    .attrs
    .iter()
    .map(|(name, attr)| {
      let configured = config.get_attr(name).ok().filter(|v| !v.is_null());
      let value = match configured {
        Some(v) => v,
        None if attr.computed => match prior.and_then(|p| p.get_attr(name).ok()) {
          Some(prior_value) => prior_value,
          None => Value::unknown(attr.ty.clone()),
        },
        None => Value::null(attr.ty.clone()),
      };
      (name.clone(), value)
    })
    .collect();
  Value::object(attrs).apply_marked_paths(&schema.implied_marks())
}

/// Structural equality disregarding marks, the diff test for NoOp.
pub fn values_equal_unmarked(a: &Value, b: &Value) -> bool {
  a.strip_marks().0 == b.strip_marks().0
}

/// Whether a planned diff touches any requires-replace path.
pub fn replace_required(prior: &Value, planned: &Value, paths: &[AttrPath]) -> bool {
  paths.iter().any(|path| {
    let before = value_at_path(prior, path);
    let after = value_at_path(planned, path);
    match (before, after) {
      (Some(b), Some(a)) => !values_equal_unmarked(&b, &a),
      (None, None) => false,
      _ => true,
    }
  })
}

/// Replaces the value at a path, leaving the input untouched when the path
/// does not resolve. Used by `ignore_changes` to pin prior values into the
/// proposed object.
fn override_at_path(value: Value, steps: &[PathStep], replacement: Value) -> Value {
  use gantry_core::value::ValueKind as VK;
  let Some((first, rest)) = steps.split_first() else {
    return replacement;
  };
  let (mut kind, marks) = {
    let marks = value.marks().clone();
    (value.kind().clone(), marks)
  };
  match (&mut kind, first) {
    (VK::Object(attrs), PathStep::Attr(name)) => {
      if let Some(slot) = attrs.get_mut(name) {
        let taken = std::mem::replace(slot, Value::null(Ty::Dynamic));
        *slot = override_at_path(taken, rest, replacement);
      }
    }
    (VK::Map(_, entries), PathStep::Key(key)) => {
      if let Some(slot) = entries.get_mut(key) {
        let taken = std::mem::replace(slot, Value::null(Ty::Dynamic));
        *slot = override_at_path(taken, rest, replacement);
      }
    }
    (VK::List(_, items), PathStep::Index(i)) | (VK::Tuple(items), PathStep::Index(i)) => {
      if let Some(slot) = items.get_mut(*i as usize) {
        let taken = std::mem::replace(slot, Value::null(Ty::Dynamic));
        *slot = override_at_path(taken, rest, replacement);
      }
    }
    _ => {}
  }
  rebuild(kind, marks)
}

fn rebuild(kind: gantry_core::value::ValueKind, marks: Marks) -> Value {
  use gantry_core::value::ValueKind as VK;
  let value = match kind {
    VK::Null(ty) => Value::null(ty),
    VK::Unknown(ty) => Value::unknown(ty),
    VK::Bool(b) => Value::bool(b),
    VK::Number(n) => Value::number(n),
    VK::String(s) => Value::string(s),
    VK::List(ty, items) => Value::list(ty, items),
    VK::Set(ty, items) => Value::set(ty, items),
    VK::Map(ty, entries) => Value::map(ty, entries),
    VK::Tuple(items) => Value::tuple(items),
    VK::Object(attrs) => Value::object(attrs),
    VK::Capsule(tag, payload) => Value::capsule(tag, payload),
  };
  value.with_marks(marks)
}

/// Resolves a path inside a value, `None` when the structure is absent.
pub fn value_at_path(value: &Value, path: &AttrPath) -> Option<Value> {
  let mut current = value.clone();
  for step in &path.0 {
    current = match step {
      PathStep::Attr(name) => current.get_attr(name).ok()?,
      PathStep::Index(i) => current.index(&Value::int(*i as i64)).ok()?,
      PathStep::Key(k) => current.index(&Value::string(k.clone())).ok()?,
    };
  }
  Some(current)
}

/// Deep check that nothing in a value is unknown.
pub fn is_fully_known(value: &Value) -> bool {
  if value.is_unknown() {
    return false;
  }
  match value.kind() {
    ValueKind::List(_, items) | ValueKind::Set(_, items) | ValueKind::Tuple(items) => {
      items.iter().all(is_fully_known)
    }
    ValueKind::Map(_, entries) => entries.values().all(is_fully_known),
    ValueKind::Object(attrs) => attrs.values().all(is_fully_known),
    _ => true,
  }
}

fn reference_names_resource(
  reference: &gantry_core::expr::Reference,
  resource: &ResourceAddr,
  module: &ModulePath,
) -> bool {
  match reference {
    gantry_core::expr::Reference::Resource {
      mode,
      type_name,
      name,
    } => {
      *mode == resource.mode
        && *type_name == resource.type_name
        && *name == resource.name
        && *module == resource.module
    }
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use gantry_core::schema::AttrSchema;

  fn schema() -> BlockSchema {
    BlockSchema::new(
      0,
      [
        ("region".to_string(), AttrSchema::optional(Ty::String)),
        ("id".to_string(), AttrSchema::computed(Ty::String)),
      ],
    )
  }

  #[test]
  fn proposed_new_on_create() {
    let config = Value::object([("region".to_string(), Value::string("eu"))]);
    let proposed = proposed_new(&schema(), None, &config);
    assert_eq!(proposed.get_attr("region").unwrap().as_str(), Some("eu"));
    assert!(proposed.get_attr("id").unwrap().is_unknown());
  }

  #[test]
  fn proposed_new_keeps_prior_computed() {
    let prior = Value::object([
    ("region".to_string(), Value::string("eu")),
      ("id".to_string(), Value::string("i-1")),
    ]);
    let config = Value::object([("region".to_string(), Value::string("us"))]);
    let proposed = proposed_new(&schema(), Some(&prior), &config);
    assert_eq!(proposed.get_attr("region").unwrap().as_str(), Some("us"));
    assert_eq!(proposed.get_attr("id").unwrap().as_str(), Some("i-1"));
  }

  #[test]
  fn replace_required_only_on_covered_diffs() {
    let prior = Value::object([
      ("region".to_string(), Value::string("eu")),
      ("id".to_string(), Value::string("i-1")),
    ]);
    let changed_region = Value::object([
      ("region".to_string(), Value::string("us")),
      ("id".to_string(), Value::string("i-1")),
    ]);
    let paths = vec![AttrPath::attr("region")];
    assert!(replace_required(&prior, &changed_region, &paths));

    let changed_other = Value::object([
      ("region".to_string(), Value::string("eu")),
      ("id".to_string(), Value::string("i-2")),
    ]);
    assert!(!replace_required(&prior, &changed_other, &paths));
  }

  #[test]
  fn value_at_path_traverses() {
    let v = Value::object([(
      "tags".to_string(),
      Value::map(Ty::String, [("env".to_string(), Value::string("prod"))].into()),
    )]);
    let path = AttrPath::attr("tags").join(PathStep::Key("env".into()));
    assert_eq!(value_at_path(&v, &path).unwrap().as_str(), Some("prod"));
    assert!(value_at_path(&v, &AttrPath::attr("missing")).is_none());
  }

  #[test]
  fn fully_known_is_deep() {
    let known = Value::object([("a".to_string(), Value::string("x"))]);
    assert!(is_fully_known(&known));
    let unknown = Value::object([("a".to_string(), Value::unknown(Ty::String))]);
    assert!(!is_fully_known(&unknown));
  }

  #[test]
  fn plan_has_changes() {
    let base = Plan {
      base_serial: 0,
      base_lineage: "l".into(),
      config_hash: "h".into(),
      changes: vec![],
      output_changes: vec![],
      variables: BTreeMap::new(),
      deferred: vec![],
      complete: true,
    };
    assert!(!base.has_changes());

    let mut with_deferred = base.clone();
    with_deferred.deferred.push(DeferredResource {
      addr: "null_resource.x".into(),
      input: "count".into(),
    });
    assert!(with_deferred.has_changes());
  }
}
