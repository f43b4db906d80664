//! The apply walker: executes a plan's changes via providers and funnels
//! every state mutation through a single writer.
//!
//! The graph has the same static shape as the plan graph; expansion draws
//! on the plan's recorded changes instead of asking providers to plan
//! again. NoOp instances publish their values and are never walked. Every
//! mutation goes through the [`StateWriter`] task, which is the only code
//! that touches the state manager during an apply, giving single-writer
//! discipline without long-held locks. Failures mark their dependents
//! skipped and independent subgraphs keep going; state is persisted after
//! every meaningful transition, so a partial apply leaves reality recorded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use gantry_core::addr::{InstanceAddr, InstanceKey, ModulePath, ProviderConfigAddr, ResourceAddr, ResourceMode};
use gantry_core::config::{Config, Resource};
use gantry_core::diags::{Diagnostic, Diagnostics};
use gantry_core::schema::BlockSchema;
use gantry_core::value::{value_from_json, value_to_json, MarkedPath, Ty, Value};
use gantry_provider::broker::{Broker, ConfiguredProvider};
use gantry_provider::ApplyRequest;
use gantry_state::backend::{LockRequest, StateError, StateManager};
use gantry_state::{InstanceStatus, OutputState, StateFile, StateInstance};

use crate::eval::{evaluate, for_each_keys, for_each_value, EvalContext, Expansion, Scope};
use crate::graph::{build_plan_graph, find_provider_block, ExpandNode, Node, WalkGraph};
use crate::plan::{proposed_new, values_equal_unmarked, Action, Plan, ResourceChange};
use crate::walk::{walk, NodeExecutor, NodeOutcome, WalkOptions};

/// Options for one apply walk.
pub struct ApplyOptions {
  /// Recorded in the state lock, e.g. `user@host`.
  pub who: String,
  pub workspace: String,
  /// Deadline for each individual provider apply call; expiry taints the
  /// instance and the walk proceeds.
  pub per_resource_timeout: Option<Duration>,
  pub walk: WalkOptions,
}

impl Default for ApplyOptions {
  fn default() -> Self {
    ApplyOptions {
      who: "unknown".to_string(),
      workspace: gantry_state::backend::DEFAULT_WORKSPACE.to_string(),
      per_resource_timeout: None,
      walk: WalkOptions::default(),
    }
  }
}

/// What an apply run produced.
#[derive(Debug)]
pub struct ApplyOutcome {
  /// Serial of the state after the walk.
  pub serial: u64,
  /// Count of successfully applied non-NoOp changes.
  pub applied: usize,
  /// Node keys skipped because a dependency failed.
  pub skipped: Vec<String>,
}

/// Applies a plan. State is mutated up to any failure and always persisted;
/// the diagnostics carry everything that went wrong.
pub async fn apply(
  plan: Arc<Plan>,
  config: Arc<Config>,
  state_mgr: Arc<dyn StateManager>,
  broker: Arc<Broker>,
  options: ApplyOptions,
) -> (Option<ApplyOutcome>, Diagnostics) {
  let mut diags = Diagnostics::new();

  // Deferred expansions cannot be applied; the plan must be recomputed once
  // the unknown inputs are decidable.
  if !plan.deferred.is_empty() {
    for deferred in &plan.deferred {
      diags.push(
        Diagnostic::error("plan contains deferred resources")
          .with_detail(format!(
            "the expansion of this resource depends on {}, which was unknown at plan time; \
             provide the value and plan again",
            deferred.input
          ))
          .with_address(deferred.addr.clone()),
      );
    }
    return (None, diags);
  }
  if !plan.complete {
    diags.push(Diagnostic::error("plan is incomplete")
      .with_detail("this plan was interrupted before it finished and cannot be applied"));
    return (None, diags);
  }

  let token = match state_mgr.lock(&LockRequest::new(options.who.clone(), "apply")).await {
    Ok(token) => token,
    Err(err) => {
      diags.push(Diagnostic::error("failed to lock state").with_detail(err.to_string()));
      return (None, diags);
    }
  };

  let result = apply_locked(plan, config, state_mgr.clone(), broker, options, &mut diags).await;

  if let Err(err) = state_mgr.unlock(token).await {
    diags.push(Diagnostic::warning("failed to release state lock").with_detail(err.to_string()));
  }
  (result, diags)
}

async fn apply_locked(
  plan: Arc<Plan>,
  config: Arc<Config>,
  state_mgr: Arc<dyn StateManager>,
  broker: Arc<Broker>,
  options: ApplyOptions,
  diags: &mut Diagnostics,
) -> Option<ApplyOutcome> {
  let initial = match state_mgr.read().await {
    Ok(state) => state,
    Err(err) => {
      diags.push(Diagnostic::error("failed to read state").with_detail(err.to_string()));
      return None;
    }
  };
  if initial.serial != plan.base_serial || initial.lineage != plan.base_lineage {
    diags.push(
      Diagnostic::error("saved plan is stale")
        .with_detail(format!(
          "the plan was created against state serial {} (lineage {}), but the backend now holds \
           serial {} (lineage {}); plan again",
          plan.base_serial, plan.base_lineage, initial.serial, initial.lineage
        )),
    );
    return None;
  }

  let (writer, writer_task) = StateWriter::spawn(state_mgr, initial.clone());

  let shared = Arc::new(ApplyShared {
    config: config.clone(),
    plan: plan.clone(),
    broker,
    scope: Scope::new(options.workspace.clone()),
    providers: Mutex::new(std::collections::HashMap::new()),
    writer,
    applied: Mutex::new(0),
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

  // Resources the filtered graph will never visit still have settled
  // values the rest of the walk may reference.
  seed_settled_values(&shared.scope, &plan);

  let graph = build_apply_graph(&config, &initial, &plan);
  let executor = Arc::new(ApplyExecutor {
    shared: shared.clone(),
  });
  let walk_options = shared.options.walk.clone();
  info!(nodes = graph.node_count(), "starting apply walk");
  let report = walk(graph, executor, &walk_options).await;
  diags.append(report.diags);

  let mut skipped = Vec::new();
  for (node, cause) in &report.skipped {
    if node.contains('.') && !node.starts_with("close.") && *node != "root" {
      diags.push(
        Diagnostic::warning("skipped due to an upstream failure")
          .with_detail(format!("not applied because {} failed", cause))
          .with_address(node.clone()),
      );
    }
    skipped.push(node.clone());
  }

  // Forget actions and outputs settle after the resource walk.
  for change in plan.changes.iter().filter(|c| c.action == Action::Forget) {
    info!(addr = %change.addr, "forgetting resource from state");
    if let Err(err) = shared.writer.forget(change.addr.resource.clone()).await {
      diags.push(
        Diagnostic::error("failed to forget resource")
          .with_detail(err.to_string())
          .with_address(&change.addr),
      );
    }
  }

  finalize_outputs(&shared, &initial, diags).await;

  let applied = *shared.applied.lock();
  drop(shared);
  let final_state = match writer_task.await {
    Ok(state) => state,
    Err(join_err) => {
      diags.push(
        Diagnostic::error("internal error in state writer").with_detail(join_err.to_string()),
      );
      return None;
    }
  };

  Some(ApplyOutcome {
    serial: final_state.serial,
    applied,
    skipped,
  })
}

/// Re-evaluates root outputs against the applied scope and writes them to
/// state when they changed.
async fn finalize_outputs(shared: &Arc<ApplyShared>, initial: &StateFile, diags: &mut Diagnostics) {
  let mut outputs: IndexMap<String, OutputState> = IndexMap::new();
  for output in shared.config.root.outputs.values() {
    let ctx = EvalContext::new(&shared.scope, ModulePath::root());
    let mut value = match evaluate(&output.expr, &ctx) {
      Ok(value) => value,
      Err(diag) => {
        diags.push(diag);
        continue;
      }
    };
    if value.is_unknown() {
      // Fall back to the plan's projection; anything still unknown did not
      // get applied this run.
      match shared.plan.output_changes.iter().find(|o| o.name == output.name) {
        Some(projected) if !projected.value.is_unknown() => value = projected.value.clone(),
        _ => {
          warn!(output = %output.name, "output not yet known, leaving unrecorded");
          continue;
        }
      }
    }
    let sensitive = output.sensitive || value.has_sensitive();
    let (bare, _) = value.strip_marks();
    match value_to_json(&bare) {
      Ok(json) => {
        outputs.insert(
          output.name.clone(),
          OutputState {
            value: json,
            ty: bare.ty(),
            sensitive,
          },
        );
      }
      Err(err) => {
        diags.push(
          Diagnostic::error("output value cannot be recorded")
            .with_detail(err.to_string())
            .with_address(format!("output.{}", output.name)),
        );
      }
    }
  }

  if outputs != initial.outputs {
    if let Err(err) = shared.writer.set_outputs(outputs).await {
      diags.push(Diagnostic::error("failed to record outputs").with_detail(err.to_string()));
    }
  }
}

/// Whether the plan calls for real work on a resource block. Forget actions
/// are settled after the walk and count as no work here.
fn resource_has_work(plan: &Plan, addr: &ResourceAddr) -> bool {
  plan
    .changes
    .iter()
    .any(|c| c.addr.resource == *addr && !c.action.is_noop() && c.action != Action::Forget)
}

/// The apply graph: the plan graph filtered down to nodes with non-NoOp
/// actions plus their provider and module prerequisites.
///
/// Seeds are the resource (or orphan-destroy) nodes of every working change
/// and the provider bindings those changes recorded; the ancestor closure
/// then pulls in the variables, locals, module calls and data sources the
/// seeds depend on. Managed resources whose plan is entirely NoOp are cut:
/// their values come from the plan's records, so neither they nor the
/// providers behind them are touched during the apply.
fn build_apply_graph(config: &Config, state: &StateFile, plan: &Plan) -> WalkGraph {
  let full = build_plan_graph(config, state);
  let mut keep: HashSet<petgraph::graph::NodeIndex> = HashSet::new();
  let mut queue: Vec<petgraph::graph::NodeIndex> = Vec::new();

  let seed = |keep: &mut HashSet<petgraph::graph::NodeIndex>,
              queue: &mut Vec<petgraph::graph::NodeIndex>,
              key: &str| {
    if let Some(idx) = full.lookup(key) {
      if keep.insert(idx) {
        queue.push(idx);
      }
    }
  };

  for change in &plan.changes {
    if change.action.is_noop() || change.action == Action::Forget {
      continue;
    }
    let resource_key = Node::ConfigResource(change.addr.resource.clone()).key();
    let destroy_key = Node::ResourceInstanceDestroy {
      addr: change.addr.clone(),
      deposed: false,
    }
    .key();
    if full.lookup(&resource_key).is_some() {
      seed(&mut keep, &mut queue, &resource_key);
    } else if full.lookup(&destroy_key).is_some() {
      // Orphans destroy through their own static node.
      seed(&mut keep, &mut queue, &destroy_key);
    } else if let Some(call_key) = keyed_call_ancestor(&change.addr.resource.module) {
      // Resources inside keyed module calls only materialize when the call
      // expands; the call node is the static stand-in.
      seed(&mut keep, &mut queue, &call_key);
    }
    seed(&mut keep, &mut queue, &Node::ProviderConfig(change.provider.clone()).key());
  }

  // Ancestor closure. Managed resources without work are value-satisfied
  // from the plan and cut here, so nothing behind them is retained either;
  // data sources stay, since their results only exist by re-reading.
  while let Some(idx) = queue.pop() {
    for pred in full.predecessors(idx) {
      if keep.contains(&pred) {
        continue;
      }
      if let Node::ConfigResource(addr) = full.node(pred) {
        if addr.mode == ResourceMode::Managed && !resource_has_work(plan, addr) {
          continue;
        }
      }
      keep.insert(pred);
      queue.push(pred);
    }
  }

  // Every retained provider gets torn down once its work is done.
  let close_keys: Vec<String> = keep
    .iter()
    .filter_map(|&idx| match full.node(idx) {
      Node::ProviderConfig(addr) => Some(Node::CloseProvider(addr.provider.clone()).key()),
      _ => None,
    })
    .collect();
  for key in close_keys {
    if let Some(idx) = full.lookup(&key) {
      keep.insert(idx);
    }
  }

  let mut graph = full.retain(&keep);
  graph.seal();
  graph
}

/// The key of the static ModuleCall node standing in for the outermost
/// keyed call on a module path, if any.
fn keyed_call_ancestor(path: &ModulePath) -> Option<String> {
  let mut prefix = ModulePath::root();
  for step in &path.0 {
    if step.key.is_some() {
      return Some(
        Node::ModuleCall {
          module: prefix,
          name: step.name.clone(),
        }
        .key(),
      );
    }
    prefix = prefix.child_keyed(step.name.clone(), step.key.clone());
  }
  None
}

/// Publishes the values of resources the filtered graph skips: blocks whose
/// plan is entirely NoOp are already settled, so dependents read them
/// straight from the plan's records.
fn seed_settled_values(scope: &Scope, plan: &Plan) {
  let mut by_resource: std::collections::BTreeMap<String, Vec<&ResourceChange>> =
    std::collections::BTreeMap::new();
  for change in &plan.changes {
    by_resource
      .entry(change.addr.resource.to_string())
      .or_default()
      .push(change);
  }
  for changes in by_resource.values() {
    if !changes.iter().all(|c| c.action.is_noop()) {
      continue;
    }
    let keys: Vec<Option<InstanceKey>> = changes.iter().map(|c| c.addr.key.clone()).collect();
    scope.register_resource_expansion(&changes[0].addr.resource, expansion_from_keys(&keys));
    for change in changes {
      if let Some(value) = change.planned.clone().or_else(|| change.prior.clone()) {
        scope.publish_resource_instance(&change.addr, value);
      }
    }
  }
}

// --- single-writer state mutation ---

enum StateOp {
  SetInstance {
    addr: InstanceAddr,
    provider: String,
    instance: StateInstance,
    reply: oneshot::Sender<Result<(), StateError>>,
  },
  RemoveInstance {
    addr: InstanceAddr,
    reply: oneshot::Sender<Result<(), StateError>>,
  },
  Depose {
    addr: InstanceAddr,
    reply: oneshot::Sender<Result<Option<String>, StateError>>,
  },
  DeposedOf {
    addr: InstanceAddr,
    reply: oneshot::Sender<Vec<(String, StateInstance)>>,
  },
  RemoveDeposed {
    addr: InstanceAddr,
    key: String,
    reply: oneshot::Sender<Result<(), StateError>>,
  },
  Forget {
    resource: ResourceAddr,
    reply: oneshot::Sender<Result<(), StateError>>,
  },
  SetOutputs {
    outputs: IndexMap<String, OutputState>,
    reply: oneshot::Sender<Result<(), StateError>>,
  },
  Snapshot {
    reply: oneshot::Sender<StateFile>,
  },
}

/// Handle to the single state-mutator task. Cloneable; all clones feed the
/// same writer.
#[derive(Clone)]
pub struct StateWriter {
  tx: mpsc::Sender<StateOp>,
}

impl StateWriter {
  /// Spawns the writer task. The returned join handle yields the final
  /// state once every handle is dropped.
  fn spawn(mgr: Arc<dyn StateManager>, initial: StateFile) -> (StateWriter, tokio::task::JoinHandle<StateFile>) {
    let (tx, mut rx) = mpsc::channel::<StateOp>(64);
    let task = tokio::spawn(async move {
      let mut current = initial;
      while let Some(op) = rx.recv().await {
        match op {
          StateOp::Snapshot { reply } => {
            let _ = reply.send(current.clone());
          }
          StateOp::DeposedOf { addr, reply } => {
            let deposed = current
              .deposed(&addr)
              .into_iter()
              .map(|(key, inst)| (key.to_string(), inst.clone()))
              .collect();
            let _ = reply.send(deposed);
          }
          StateOp::SetInstance {
            addr,
            provider,
            instance,
            reply,
          } => {
            let mut next = current.clone();
            next.set_instance(&addr, &provider, instance);
            let _ = reply.send(commit(&mgr, &mut current, next).await);
          }
          StateOp::RemoveInstance { addr, reply } => {
            let mut next = current.clone();
            next.remove_instance(&addr);
            let _ = reply.send(commit(&mgr, &mut current, next).await);
          }
          StateOp::Depose { addr, reply } => {
            let mut next = current.clone();
            let key = next.depose_instance(&addr);
            let result = match key {
              None => Ok(None),
              Some(key) => commit(&mgr, &mut current, next).await.map(|_| Some(key)),
            };
            let _ = reply.send(result);
          }
          StateOp::RemoveDeposed { addr, key, reply } => {
            let mut next = current.clone();
            next.remove_deposed(&addr, &key);
            let _ = reply.send(commit(&mgr, &mut current, next).await);
          }
          StateOp::Forget { resource, reply } => {
            let mut next = current.clone();
            let changed = next.forget_resource(&resource);
            let result = if changed {
              commit(&mgr, &mut current, next).await
            } else {
              Ok(())
            };
            let _ = reply.send(result);
          }
          StateOp::SetOutputs { outputs, reply } => {
            let mut next = current.clone();
            next.outputs = outputs;
            let _ = reply.send(commit(&mgr, &mut current, next).await);
          }
        }
      }
      current
    });
    (StateWriter { tx }, task)
  }

  async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> StateOp) -> T
  where
    T: Send,
  {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(build(reply))
      .await
      .unwrap_or_else(|_| unreachable!("state writer outlives the walk"));
    rx.await.unwrap_or_else(|_| unreachable!("state writer always replies"))
  }

  pub async fn snapshot(&self) -> StateFile {
    self.request(|reply| StateOp::Snapshot { reply }).await
  }

  pub async fn set_instance(
    &self,
    addr: InstanceAddr,
    provider: String,
    instance: StateInstance,
  ) -> Result<(), StateError> {
    self
      .request(|reply| StateOp::SetInstance {
        addr,
        provider,
        instance,
        reply,
      })
      .await
  }

  pub async fn remove_instance(&self, addr: InstanceAddr) -> Result<(), StateError> {
    self.request(|reply| StateOp::RemoveInstance { addr, reply }).await
  }

  pub async fn depose(&self, addr: InstanceAddr) -> Result<Option<String>, StateError> {
    self.request(|reply| StateOp::Depose { addr, reply }).await
  }

  pub async fn deposed_of(&self, addr: InstanceAddr) -> Vec<(String, StateInstance)> {
    self.request(|reply| StateOp::DeposedOf { addr, reply }).await
  }

  pub async fn remove_deposed(&self, addr: InstanceAddr, key: String) -> Result<(), StateError> {
    self.request(|reply| StateOp::RemoveDeposed { addr, key, reply }).await
  }

  pub async fn forget(&self, resource: ResourceAddr) -> Result<(), StateError> {
    self.request(|reply| StateOp::Forget { resource, reply }).await
  }

  pub async fn set_outputs(&self, outputs: IndexMap<String, OutputState>) -> Result<(), StateError> {
    self.request(|reply| StateOp::SetOutputs { outputs, reply }).await
  }
}

/// Writes one staged document through the manager and refreshes the
/// writer's view of the current state.
async fn commit(
  mgr: &Arc<dyn StateManager>,
  current: &mut StateFile,
  next: StateFile,
) -> Result<(), StateError> {
  mgr.write(next).await?;
  mgr.persist_if_dirty().await?;
  *current = mgr.read().await?;
  debug!(serial = current.serial, "state committed");
  Ok(())
}

// --- the executor ---

struct ApplyShared {
  config: Arc<Config>,
  plan: Arc<Plan>,
  broker: Arc<Broker>,
  scope: Scope,
  providers: Mutex<std::collections::HashMap<ProviderConfigAddr, Arc<ConfiguredProvider>>>,
  writer: StateWriter,
  applied: Mutex<usize>,
  options: ApplyOptions,
}

struct ApplyExecutor {
  shared: Arc<ApplyShared>,
}

#[async_trait]
impl NodeExecutor for ApplyExecutor {
  async fn execute(&self, node: Node) -> NodeOutcome {
    match self.execute_inner(node).await {
      Ok(outcome) => outcome,
      Err(diag) => NodeOutcome::Failed(diag),
    }
  }
}

impl ApplyExecutor {
  async fn execute_inner(&self, node: Node) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    match node {
      Node::Root => Ok(NodeOutcome::Done),
      Node::CloseProvider(addr) => {
        if let Err(err) = shared.broker.close_provider(&addr).await {
          return Err(Diagnostic::error("failed to close provider").with_detail(err.to_string()));
        }
        Ok(NodeOutcome::Done)
      }
      Node::Variable { module, name } => self.execute_variable(&module, &name),
      Node::Local { module, name } => {
        let m = shared
          .config
          .module(&module)
          .ok_or_else(|| internal(format!("module {} missing", module)))?;
        let local = m
          .locals
          .get(&name)
          .ok_or_else(|| internal(format!("local {} missing", name)))?;
        let ctx = EvalContext::new(&shared.scope, module.clone());
        let value = evaluate(&local.expr, &ctx)?;
        shared.scope.publish_local(&module, &name, value);
        Ok(NodeOutcome::Done)
      }
      Node::Output { module, name } => {
        // Root outputs are finalized after the walk; module outputs publish
        // so parents can read them.
        let m = shared
          .config
          .module(&module)
          .ok_or_else(|| internal(format!("module {} missing", module)))?;
        let output = m
          .outputs
          .get(&name)
          .ok_or_else(|| internal(format!("output {} missing", name)))?;
        let ctx = EvalContext::new(&shared.scope, module.clone());
        let mut value = evaluate(&output.expr, &ctx)?;
        if output.sensitive {
          value = value.mark_sensitive();
        }
        shared.scope.publish_output(&module, &name, value);
        Ok(NodeOutcome::Done)
      }
      Node::ModuleCall { module, name } => self.execute_module_call(&module, &name),
      Node::ProviderConfig(addr) => self.execute_provider_config(addr).await,
      Node::ConfigResource(addr) => self.execute_config_resource(addr),
      Node::ResourceInstance(addr) => self.execute_instance(addr).await,
      Node::ResourceInstanceDestroy { addr, deposed } => {
        if deposed {
          self.destroy_deposed(addr).await
        } else {
          self.destroy_primary(addr).await
        }
      }
    }
  }

  fn execute_variable(&self, module: &ModulePath, name: &str) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let m = shared
      .config
      .module(module)
      .ok_or_else(|| internal(format!("module {} missing", module)))?;
    let variable = m
      .variables
      .get(name)
      .ok_or_else(|| internal(format!("variable {} missing", name)))?;

    let provided = if module.is_root() {
      shared.plan.variables.get(name).cloned()
    } else {
      shared.scope.module_arg(module, name)
    };
    let mut value = provided
      .or_else(|| variable.default.clone())
      .unwrap_or_else(|| Value::unknown(variable.ty.clone().unwrap_or(Ty::Dynamic)));
    if variable.sensitive {
      value = value.mark_sensitive();
    }
    shared.scope.publish_variable(module, name, value);
    Ok(NodeOutcome::Done)
  }

  fn execute_module_call(&self, module: &ModulePath, name: &str) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let m = shared
      .config
      .module(module)
      .ok_or_else(|| internal(format!("module {} missing", module)))?;
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

    // Keyed calls: expansion was decidable at plan time or the plan would
    // have been deferred, so evaluation here must succeed the same way.
    let keys: Vec<InstanceKey> = if let Some(for_each) = &call.for_each {
      let collection = evaluate(for_each, &ctx)?;
      let keys = for_each_keys(&collection)
        .map_err(|e| Diagnostic::error("invalid for_each on module call").with_detail(e))?;
      shared
        .scope
        .register_module_expansion(&call_key, Expansion::Keys(keys.clone()));
      keys.into_iter().map(InstanceKey::Str).collect()
    } else {
      let count = evaluate(call.count.as_ref().expect("keyed call"), &ctx)?;
      let n = count
        .as_u64()
        .ok_or_else(|| Diagnostic::error("invalid count on module call"))?;
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
    let handle = shared.broker.configure(&addr, &stripped).await.map_err(|e| {
      Diagnostic::error("provider configuration failed")
        .with_detail(e.to_string())
        .with_address(&addr)
    })?;
    shared.providers.lock().insert(addr, handle);
    Ok(NodeOutcome::Done)
  }

  /// Expansion at apply time: managed resources expand to the plan's
  /// changes; data resources re-read.
  fn execute_config_resource(&self, addr: ResourceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;

    if addr.mode == ResourceMode::Data {
      // Data instances always re-read during apply so results reflect the
      // objects applied earlier in this same run. The expansion was
      // decidable at plan time, so evaluating it again cannot defer.
      let resource = self
        .shared
        .config
        .module(&addr.module)
        .and_then(|m| m.resource(addr.mode, &addr.type_name, &addr.name))
        .cloned()
        .ok_or_else(|| internal(format!("data source {} missing from config", addr)))?;
      let ctx = EvalContext::new(&shared.scope, addr.module.clone());
      let expansion = if let Some(for_each) = &resource.for_each {
        let collection = evaluate(for_each, &ctx)?;
        Expansion::Keys(
          for_each_keys(&collection)
            .map_err(|e| Diagnostic::error("invalid for_each value").with_detail(e).with_address(&addr))?,
        )
      } else if let Some(count) = &resource.count {
        let count_value = evaluate(count, &ctx)?;
        Expansion::Count(
          count_value
            .as_u64()
            .ok_or_else(|| Diagnostic::error("invalid count value").with_address(&addr))?,
        )
      } else {
        Expansion::Single
      };
      shared.scope.register_resource_expansion(&addr, expansion.clone());
      let batch = expansion
        .keys()
        .into_iter()
        .map(|key| ExpandNode {
          node: Node::ResourceInstance(addr.instance(key)),
          deps: Vec::new(),
        })
        .collect();
      return Ok(NodeOutcome::Expanded(batch));
    }

    let changes: Vec<&ResourceChange> = shared
      .plan
      .changes
      .iter()
      .filter(|c| c.addr.resource == addr)
      .collect();

    if changes.is_empty() {
      // Untargeted or fully absent at plan time.
      shared.scope.register_resource_expansion(&addr, Expansion::Deferred);
      return Ok(NodeOutcome::Done);
    }

    let desired: Vec<Option<InstanceKey>> = changes
      .iter()
      .filter(|c| !matches!(c.action, Action::Delete | Action::Forget))
      .map(|c| c.addr.key.clone())
      .collect();
    shared
      .scope
      .register_resource_expansion(&addr, expansion_from_keys(&desired));

    let mut batch = Vec::new();
    for change in changes {
      match change.action {
        Action::NoOp => {
          // Nothing to execute; the value is already settled.
          if let Some(value) = change.planned.clone().or_else(|| change.prior.clone()) {
            shared.scope.publish_resource_instance(&change.addr, value);
          }
        }
        Action::Forget => {}
        Action::Delete => batch.push(ExpandNode {
          node: Node::ResourceInstanceDestroy {
            addr: change.addr.clone(),
            deposed: false,
          },
          deps: Vec::new(),
        }),
        _ => batch.push(ExpandNode {
          node: Node::ResourceInstance(change.addr.clone()),
          deps: Vec::new(),
        }),
      }
    }
    Ok(NodeOutcome::Expanded(batch))
  }

  async fn execute_instance(&self, addr: InstanceAddr) -> Result<NodeOutcome, Diagnostic> {
    match addr.resource.mode {
      ResourceMode::Data => self.apply_data_read(addr).await,
      ResourceMode::Managed => self.apply_managed(addr).await,
    }
  }

  fn provider_for(
    &self,
    provider_addr: &ProviderConfigAddr,
    addr: &InstanceAddr,
  ) -> Result<Arc<ConfiguredProvider>, Diagnostic> {
    self
      .shared
      .providers
      .lock()
      .get(provider_addr)
      .cloned()
      .ok_or_else(|| internal(format!("provider {} not configured before {}", provider_addr, addr)))
  }

  fn resource_config(&self, addr: &InstanceAddr) -> Result<Resource, Diagnostic> {
    self
      .shared
      .config
      .module(addr.module_path())
      .and_then(|m| m.resource(addr.resource.mode, &addr.resource.type_name, &addr.resource.name))
      .cloned()
      .ok_or_else(|| internal(format!("resource {} missing from config", addr.resource)))
  }

  fn instance_ctx(&self, resource: &Resource, addr: &InstanceAddr) -> Result<EvalContext<'_>, Diagnostic> {
    let ctx = EvalContext::new(&self.shared.scope, addr.module_path().clone());
    match &addr.key {
      None => Ok(ctx),
      Some(InstanceKey::Index(i)) => Ok(ctx.with_count_index(*i)),
      Some(InstanceKey::Str(key)) => {
        let for_each = resource
          .for_each
          .as_ref()
          .ok_or_else(|| internal(format!("string key without for_each: {}", addr)))?;
        let collection = evaluate(for_each, &ctx)?;
        Ok(ctx.with_each(Value::string(key.clone()), for_each_value(&collection, key)))
      }
    }
  }

  async fn apply_data_read(&self, addr: InstanceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let resource = self.resource_config(&addr)?;
    let provider_addr = shared.config.resolve_provider(addr.module_path(), &resource);
    let provider = self.provider_for(&provider_addr, &addr)?;
    let schema = provider
      .block_schema(&addr.resource.type_name, true)
      .map_err(|e| Diagnostic::error("unknown data source type").with_detail(e.to_string()).with_address(&addr))?
      .clone();

    let ctx = self.instance_ctx(&resource, &addr)?;
    let config_value = evaluate(&resource.body, &ctx)?;
    if !crate::plan::is_fully_known(&config_value) {
      return Err(
        Diagnostic::error("data source configuration still unknown during apply")
          .with_detail("a value this data source depends on was not produced by the apply")
          .with_address(&addr),
      );
    }

    let (stripped, mark_paths) = config_value.strip_marks();
    let result = provider
      .read_data_source(&addr.resource.type_name, &stripped)
      .await
      .map_err(|e| Diagnostic::error("data source read failed").with_detail(e.to_string()).with_address(&addr))?;
    schema.check_object(&result).map_err(|e| {
      Diagnostic::error("data source result does not match schema")
        .with_detail(e.to_string())
        .with_address(&addr)
    })?;
    let result = result
      .apply_marked_paths(&mark_paths)
      .apply_marked_paths(&schema.implied_marks());
    shared.scope.publish_resource_instance(&addr, result.clone());

    let instance = instance_for_state(&addr, &result, &schema, &resource, addr.module_path(), None);
    shared
      .writer
      .set_instance(addr.clone(), provider_addr.to_string(), instance)
      .await
      .map_err(|e| Diagnostic::error("failed to record data source").with_detail(e.to_string()).with_address(&addr))?;
    Ok(NodeOutcome::Done)
  }

  async fn apply_managed(&self, addr: InstanceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let change = shared
      .plan
      .change_for(&addr)
      .cloned()
      .ok_or_else(|| internal(format!("no planned change for {}", addr)))?;
    let resource = self.resource_config(&addr)?;
    let provider = self.provider_for(&change.provider, &addr)?;
    let schema = provider
      .block_schema(&addr.resource.type_name, false)
      .map_err(|e| Diagnostic::error("unknown resource type").with_detail(e.to_string()).with_address(&addr))?
      .clone();

    self.check_plan_current(&provider, &addr, &change).await?;

    // Adoption happens before anything else so even a failed follow-up
    // update leaves the imported object tracked.
    if let Some(id) = &change.importing {
      let prior = change
        .prior
        .clone()
        .ok_or_else(|| internal(format!("import change without imported object for {}", addr)))?;
      info!(addr = %addr, id = %id, "adopting imported object");
      let instance = instance_for_state(&addr, &prior, &schema, &resource, addr.module_path(), change.private.clone());
      shared
        .writer
        .set_instance(addr.clone(), change.provider.to_string(), instance)
        .await
        .map_err(|e| Diagnostic::error("failed to adopt imported object").with_detail(e.to_string()).with_address(&addr))?;
      if change.action == Action::Read {
        shared.scope.publish_resource_instance(&addr, prior);
        *shared.applied.lock() += 1;
        return Ok(NodeOutcome::Done);
      }
    }

    let ctx = self.instance_ctx(&resource, &addr)?;
    let config_value = evaluate(&resource.body, &ctx)?;

    match change.action {
      Action::Create | Action::Update => {
        let new = self
          .provider_apply(&provider, &schema, &addr, &change, change.prior.clone(), &config_value)
          .await?;
        self.record_applied(&addr, &change, &resource, &schema, new).await?;
        Ok(NodeOutcome::Done)
      }
      Action::DeleteThenCreate => {
        // Destroy the old object first, then create its successor.
        self.provider_destroy(&provider, &addr, &change).await?;
        shared
          .writer
          .remove_instance(addr.clone())
          .await
          .map_err(|e| state_diag(&addr, e))?;
        let new = self
          .provider_apply(&provider, &schema, &addr, &change, None, &config_value)
          .await?;
        self.record_applied(&addr, &change, &resource, &schema, new).await?;
        Ok(NodeOutcome::Done)
      }
      Action::CreateThenDelete => {
        // The old object moves to a deposed slot; destroying it is a
        // descendant node so a failure there leaves the new object intact.
        let deposed_key = shared.writer.depose(addr.clone()).await.map_err(|e| state_diag(&addr, e))?;
        if let Some(key) = &deposed_key {
          debug!(addr = %addr, deposed = %key, "deposed prior object");
        }
        let new = self
          .provider_apply(&provider, &schema, &addr, &change, None, &config_value)
          .await?;
        self.record_applied(&addr, &change, &resource, &schema, new).await?;
        Ok(NodeOutcome::Expanded(vec![ExpandNode {
          node: Node::ResourceInstanceDestroy {
            addr: addr.clone(),
            deposed: true,
          },
          deps: Vec::new(),
        }]))
      }
      other => Err(internal(format!("unexpected action {:?} on instance node {}", other, addr))),
    }
  }

  /// One provider apply call with the configured per-resource deadline.
  /// Timeout taints the instance and fails the node.
  async fn provider_apply(
    &self,
    provider: &ConfiguredProvider,
    schema: &BlockSchema,
    addr: &InstanceAddr,
    change: &ResourceChange,
    prior: Option<Value>,
    config_value: &Value,
  ) -> Result<Value, Diagnostic> {
    let planned = proposed_new(schema, prior.as_ref(), config_value);
    let (planned_stripped, planned_marks) = planned.strip_marks();
    let request = ApplyRequest {
      type_name: addr.resource.type_name.clone(),
      prior: prior.as_ref().map(|p| p.strip_marks().0),
      planned: Some(planned_stripped),
      planned_private: change.private.clone(),
    };

    let call = provider.apply_resource_change(request);
    let applied = match self.shared.options.per_resource_timeout {
      Some(deadline) => match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
          self.taint(addr, change).await;
          return Err(
            Diagnostic::error("provider call exceeded its deadline")
              .with_detail("the instance was marked tainted; the next plan will replace it")
              .with_address(addr),
          );
        }
      },
      None => call.await,
    }
    .map_err(|e| {
      Diagnostic::error("provider failed to apply change")
        .with_detail(e.to_string())
        .with_address(addr)
    })?;

    let new = applied.new.ok_or_else(|| {
      Diagnostic::error("provider returned no object for a non-destroy apply").with_address(addr)
    })?;
    schema.check_object(&new).map_err(|e| {
      Diagnostic::error("applied object does not match schema")
        .with_detail(e.to_string())
        .with_address(addr)
    })?;
    Ok(
      new
        .apply_marked_paths(&planned_marks)
        .apply_marked_paths(&schema.implied_marks()),
    )
  }

  async fn provider_destroy(
    &self,
    provider: &ConfiguredProvider,
    addr: &InstanceAddr,
    change: &ResourceChange,
  ) -> Result<(), Diagnostic> {
    let request = ApplyRequest {
      type_name: addr.resource.type_name.clone(),
      prior: change.prior.as_ref().map(|p| p.strip_marks().0),
      planned: None,
      planned_private: change.private.clone(),
    };
    provider.apply_resource_change(request).await.map_err(|e| {
      Diagnostic::error("provider failed to destroy object")
        .with_detail(e.to_string())
        .with_address(addr)
    })?;
    Ok(())
  }

  async fn record_applied(
    &self,
    addr: &InstanceAddr,
    change: &ResourceChange,
    resource: &Resource,
    schema: &BlockSchema,
    new: Value,
  ) -> Result<(), Diagnostic> {
    let shared = &self.shared;
    let instance = instance_for_state(addr, &new, schema, resource, addr.module_path(), change.private.clone());
    shared
      .writer
      .set_instance(addr.clone(), change.provider.to_string(), instance)
      .await
      .map_err(|e| state_diag(addr, e))?;
    shared.scope.publish_resource_instance(addr, new);
    *shared.applied.lock() += 1;
    info!(addr = %addr, action = ?change.action, "applied change");
    Ok(())
  }

  /// Records the prior object back with tainted status after a deadline
  /// expiry, so the next plan replaces it.
  async fn taint(&self, addr: &InstanceAddr, change: &ResourceChange) {
    let Some(prior) = &change.prior else { return };
    let (bare, marks) = prior.strip_marks();
    let Ok(json) = value_to_json(&bare) else { return };
    let mut instance = StateInstance::new(addr.key.clone(), json);
    instance.status = InstanceStatus::Tainted;
    instance.sensitive_attributes = sensitive_paths(marks);
    if let Err(err) = self
      .shared
      .writer
      .set_instance(addr.clone(), change.provider.to_string(), instance)
      .await
    {
      error!(addr = %addr, error = %err, "failed to record tainted instance");
    }
  }

  /// Stale-plan detection: reality must still match the prior this plan
  /// was computed against, whatever the action.
  async fn check_plan_current(
    &self,
    provider: &ConfiguredProvider,
    addr: &InstanceAddr,
    change: &ResourceChange,
  ) -> Result<(), Diagnostic> {
    let Some(prior) = &change.prior else {
      return Ok(());
    };
    let (stripped, _) = prior.strip_marks();
    let refreshed = provider
      .read_resource(&addr.resource.type_name, &stripped, change.private.as_deref())
      .await
      .map_err(|e| Diagnostic::error("refresh failed").with_detail(e.to_string()).with_address(addr))?;
    let matches = match &refreshed {
      Some(current) => values_equal_unmarked(current, prior),
      None => false,
    };
    if !matches {
      return Err(
        Diagnostic::error("saved plan is stale")
          .with_detail(
            "the object this plan was computed against has changed outside of this run; \
             plan again to pick up the drift",
          )
          .with_address(addr),
      );
    }
    Ok(())
  }

  async fn destroy_primary(&self, addr: InstanceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let change = shared
      .plan
      .change_for(&addr)
      .cloned()
      .ok_or_else(|| internal(format!("no planned change for {}", addr)))?;
    let provider = self.provider_for(&change.provider, &addr)?;

    self.check_plan_current(&provider, &addr, &change).await?;
    self.provider_destroy(&provider, &addr, &change).await?;
    shared
      .writer
      .remove_instance(addr.clone())
      .await
      .map_err(|e| state_diag(&addr, e))?;
    *shared.applied.lock() += 1;
    info!(addr = %addr, "destroyed object");
    Ok(NodeOutcome::Done)
  }

  /// Destroys every deposed object held by an address; the create that
  /// deposed them has already succeeded by the time this node runs.
  async fn destroy_deposed(&self, addr: InstanceAddr) -> Result<NodeOutcome, Diagnostic> {
    let shared = &self.shared;
    let change = shared
      .plan
      .change_for(&addr)
      .cloned()
      .ok_or_else(|| internal(format!("no planned change for {}", addr)))?;
    let provider = self.provider_for(&change.provider, &addr)?;

    for (key, instance) in shared.writer.deposed_of(addr.clone()).await {
      let prior = value_from_json(&instance.attributes, &Ty::Dynamic).map_err(|e| {
        Diagnostic::error("deposed object is not decodable")
          .with_detail(e.to_string())
          .with_address(&addr)
      })?;
      let request = ApplyRequest {
        type_name: addr.resource.type_name.clone(),
        prior: Some(prior),
        planned: None,
        planned_private: None,
      };
      provider.apply_resource_change(request).await.map_err(|e| {
        // The deposed object stays in state and is retried next apply.
        Diagnostic::error("failed to destroy deposed object")
          .with_detail(e.to_string())
          .with_address(&addr)
      })?;
      shared
        .writer
        .remove_deposed(addr.clone(), key)
        .await
        .map_err(|e| state_diag(&addr, e))?;
      info!(addr = %addr, "destroyed deposed object");
    }
    Ok(NodeOutcome::Done)
  }
}

fn internal(detail: String) -> Diagnostic {
  Diagnostic::error("internal error in apply walk").with_detail(detail)
}

fn state_diag(addr: &InstanceAddr, err: StateError) -> Diagnostic {
  Diagnostic::error("state write failed")
    .with_detail(err.to_string())
    .with_address(addr)
}

fn sensitive_paths(marks: Vec<MarkedPath>) -> Vec<gantry_core::value::AttrPath> {
  marks
    .into_iter()
    .filter(|mp| mp.marks.is_sensitive())
    .map(|mp| mp.path)
    .collect()
}

fn expansion_from_keys(keys: &[Option<InstanceKey>]) -> Expansion {
  if keys.len() == 1 && keys[0].is_none() {
    return Expansion::Single;
  }
  let mut strs = Vec::new();
  let mut max_index = None;
  for key in keys {
    match key {
      Some(InstanceKey::Str(s)) => strs.push(s.clone()),
      Some(InstanceKey::Index(i)) => max_index = Some(max_index.unwrap_or(0).max(*i)),
      None => {}
    }
  }
  if !strs.is_empty() {
    strs.sort();
    Expansion::Keys(strs)
  } else if let Some(max) = max_index {
    Expansion::Count(max + 1)
  } else if keys.is_empty() {
    Expansion::Count(0)
  } else {
    Expansion::Single
  }
}

/// Builds the state document entry for an applied or read object.
fn instance_for_state(
  addr: &InstanceAddr,
  value: &Value,
  schema: &BlockSchema,
  resource: &Resource,
  module: &ModulePath,
  private: Option<Vec<u8>>,
) -> StateInstance {
  let (bare, marks) = value.strip_marks();
  let attributes = value_to_json(&bare).unwrap_or(serde_json::Value::Null);
  let mut instance = StateInstance::new(addr.key.clone(), attributes);
  instance.schema_version = schema.version;
  instance.sensitive_attributes = sensitive_paths(marks);
  instance.private = private.map(|p| base64::engine::general_purpose::STANDARD.encode(p));
  instance.create_before_destroy = resource.lifecycle.create_before_destroy;

  // Dependencies captured at write time drive destroy ordering later.
  let mut deps: Vec<String> = resource
    .body
    .references()
    .into_iter()
    .chain(resource.depends_on.iter())
    .filter_map(|reference| match reference {
      gantry_core::expr::Reference::Resource {
        mode,
        type_name,
        name,
      } => Some(
        ResourceAddr {
          module: module.clone(),
          mode: *mode,
          type_name: type_name.clone(),
          name: name.clone(),
        }
        .to_string(),
      ),
      _ => None,
    })
    .collect();
  deps.sort();
  deps.dedup();
  instance.dependencies = deps;
  instance
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn expansion_inference() {
    assert_eq!(expansion_from_keys(&[None]), Expansion::Single);
    assert_eq!(
      expansion_from_keys(&[Some(InstanceKey::Index(0)), Some(InstanceKey::Index(1))]),
      Expansion::Count(2)
    );
    assert_eq!(
      expansion_from_keys(&[Some(InstanceKey::Str("b".into())), Some(InstanceKey::Str("a".into()))]),
      Expansion::Keys(vec!["a".into(), "b".into()])
    );
    assert_eq!(expansion_from_keys(&[]), Expansion::Count(0));
  }
}
