//! End-to-end plan/apply scenarios driven through a mock provider and the
//! in-memory backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::addr::{InstanceAddr, ProviderAddr, Target};
use gantry_core::config::{
  Config, ImportBlock, Module, Output, Resource, Variable,
};
use gantry_core::expr::Expr;
use gantry_core::schema::{AttrSchema, BlockSchema};
use gantry_core::value::{AttrPath, Ty, Value};
use gantry_engine::apply::{apply, ApplyOptions};
use gantry_engine::plan::{plan, Action, ChangeReason, Plan, PlanOptions};
use gantry_engine::{apply_exit_code, plan_exit_code};
use gantry_provider::broker::Broker;
use gantry_provider::mock::{MockFactory, MockProvider};
use gantry_state::backend::{StateManager, DEFAULT_WORKSPACE};
use gantry_state::mem::MemBackend;
use gantry_state::StateFile;

fn null_schema() -> BlockSchema {
  BlockSchema::new(
    0,
    [
      ("id".to_string(), AttrSchema::computed(Ty::String)),
      ("region".to_string(), AttrSchema::optional(Ty::String)),
      ("password".to_string(), AttrSchema::optional(Ty::String)),
    ],
  )
}

fn base_mock() -> MockProvider {
  MockProvider::new()
    .with_resource("null_resource", null_schema())
    .with_create_value("null_resource", "id", Value::string("yes"))
}

fn broker_with(mock: MockProvider) -> (Arc<Broker>, Arc<MockProvider>) {
  let mock = Arc::new(mock);
  let broker = Arc::new(Broker::new(Arc::new(MockFactory::single(mock.clone()))));
  (broker, mock)
}

fn single_resource_config(resource: Resource) -> Arc<Config> {
  let mut module = Module::root();
  module.add_resource(resource).unwrap();
  Arc::new(Config::new(module))
}

fn addr(src: &str) -> InstanceAddr {
  InstanceAddr::parse(src).unwrap()
}

async fn plan_ok(config: &Arc<Config>, prior: &StateFile, broker: Arc<Broker>) -> Plan {
  let (plan, diags) = plan(config.clone(), prior, broker, PlanOptions::default()).await;
  assert!(!diags.has_errors(), "unexpected plan errors: {:?}", diags);
  plan.expect("plan must be produced")
}

async fn apply_ok(
  plan_doc: Plan,
  config: &Arc<Config>,
  mgr: Arc<dyn StateManager>,
  broker: Arc<Broker>,
) -> gantry_engine::apply::ApplyOutcome {
  let (outcome, diags) = apply(Arc::new(plan_doc), config.clone(), mgr, broker, ApplyOptions::default()).await;
  assert!(!diags.has_errors(), "unexpected apply errors: {:?}", diags);
  outcome.expect("apply outcome")
}

// Scenario 1: create flow.
#[tokio::test]
async fn create_flow() {
  let config = single_resource_config(Resource::managed("null_resource", "x", Expr::object([])));
  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;

  let actions: Vec<(String, Action)> = plan_doc
    .changes
    .iter()
    .map(|c| (c.addr.to_string(), c.action))
    .collect();
  assert_eq!(actions, vec![("null_resource.x".to_string(), Action::Create)]);
  assert_eq!(plan_exit_code(Some(&plan_doc), &Default::default()), 2);

  let (broker, mock) = broker_with(base_mock());
  let outcome = apply_ok(plan_doc, &config, mgr.clone(), broker).await;
  assert_eq!(outcome.applied, 1);
  assert_eq!(outcome.serial, 1);

  let state = mgr.read().await.unwrap();
  assert_eq!(state.serial, 1);
  let instance = state.instance(&addr("null_resource.x")).expect("instance in state");
  assert_eq!(instance.attributes["id"], serde_json::json!("yes"));
  assert_eq!(mock.calls_named("apply_resource_change"), 1);
}

// Scenario 2: refresh-only NoOp.
#[tokio::test]
async fn refresh_noop() {
  let config = single_resource_config(Resource::managed("null_resource", "x", Expr::object([])));
  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);

  // Seed prior state through the create flow.
  let prior = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;

  let seeded = mgr.read().await.unwrap();
  assert_eq!(seeded.serial, 1);

  // Identical configuration, drift-free refresh: NoOp.
  let (broker, mock) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &seeded, broker).await;
  assert_eq!(plan_doc.changes.len(), 1);
  assert_eq!(plan_doc.changes[0].action, Action::NoOp);
  assert!(!plan_doc.has_changes());
  assert_eq!(plan_exit_code(Some(&plan_doc), &Default::default()), 0);
  assert_eq!(mock.calls_named("read_resource"), 1, "refresh happened");

  let (broker, mock) = broker_with(base_mock());
  let outcome = apply_ok(plan_doc, &config, mgr.clone(), broker).await;
  assert_eq!(outcome.applied, 0);
  assert_eq!(outcome.serial, 1, "serial unchanged by a no-op apply");
  assert_eq!(mock.calls_named("apply_resource_change"), 0);
}

// Scenario 3: replace on a requires-replace diff, delete-then-create, and
// failure during the create leg.
#[tokio::test]
async fn replace_delete_then_create() {
  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);

  // Seed with region=eu.
  let config_eu = single_resource_config(Resource::managed(
    "null_resource",
    "x",
    Expr::object([("region".to_string(), Expr::str("eu"))]),
  ));
  let prior = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config_eu, &prior, broker).await;
  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config_eu, mgr.clone(), broker).await;

  // Change the requires-replace attribute.
  let config_us = single_resource_config(Resource::managed(
    "null_resource",
    "x",
    Expr::object([("region".to_string(), Expr::str("us"))]),
  ));
  let seeded = mgr.read().await.unwrap();
  let replace_mock = || base_mock().with_replace_path("null_resource", AttrPath::attr("region"));
  let (broker, _) = broker_with(replace_mock());
  let plan_doc = plan_ok(&config_us, &seeded, broker).await;

  assert_eq!(plan_doc.changes.len(), 1);
  let change = &plan_doc.changes[0];
  assert_eq!(change.action, Action::DeleteThenCreate);
  assert_eq!(change.reason, Some(ChangeReason::RequiresReplace));

  // Apply with a mock that fails the create leg (prior None, planned Some).
  let failing = replace_mock().on_apply(|request| {
    if request.prior.is_none() && request.planned.is_some() {
      Some(Err("create exploded".to_string()))
    } else {
      None
    }
  });
  let (broker, _) = broker_with(failing);
  let (outcome, diags) = apply(
    Arc::new(plan_doc),
    config_us.clone(),
    mgr.clone(),
    broker,
    ApplyOptions::default(),
  )
  .await;
  assert!(diags.has_errors());
  assert_eq!(apply_exit_code(&diags), 1);
  let outcome = outcome.expect("partial outcome still reported");
  assert_eq!(outcome.applied, 0);

  // The old object was destroyed; nothing was deposed; no primary remains.
  let state = mgr.read().await.unwrap();
  assert!(state.instance(&addr("null_resource.x")).is_none());
  assert!(state.deposed(&addr("null_resource.x")).is_empty());
}

// Scenario 4: unknown count defers the resource; applying fails with a
// typed error naming the address and the unknown input.
#[tokio::test]
async fn unknown_count_defers() {
  let mut module = Module::root();
  module.add_variable(Variable::new("n").with_ty(Ty::Number)).unwrap();
  let mut resource = Resource::managed("null_resource", "x", Expr::object([]));
  resource.count = Some(Expr::var("n"));
  module.add_resource(resource).unwrap();
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let (broker, mock) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;

  assert_eq!(plan_doc.deferred.len(), 1);
  assert_eq!(plan_doc.deferred[0].addr, "null_resource.x");
  assert!(plan_doc.deferred[0].input.contains("var.n"));
  assert!(plan_doc.changes.is_empty());
  assert_eq!(mock.calls_named("plan_resource_change"), 0);

  let (broker, _) = broker_with(base_mock());
  let (outcome, diags) = apply(
    Arc::new(plan_doc),
    config.clone(),
    mgr,
    broker,
    ApplyOptions::default(),
  )
  .await;
  assert!(outcome.is_none());
  assert!(diags.has_errors());
  let diag = diags.errors().next().unwrap();
  assert_eq!(diag.address.as_deref(), Some("null_resource.x"));
  assert!(diag.detail.contains("var.n"), "detail: {}", diag.detail);
}

// Scenario 5: a reference cycle fails graph construction with both
// addresses named.
#[tokio::test]
async fn cycle_detected() {
  let mut module = Module::root();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "a",
      Expr::object([("x".to_string(), Expr::managed("null_resource", "b").attr("y"))]),
    ))
    .unwrap();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "b",
      Expr::object([("y".to_string(), Expr::managed("null_resource", "a").attr("x"))]),
    ))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let (broker, _) = broker_with(base_mock());
  let (plan_doc, diags) = plan(config, &StateFile::empty(), broker, PlanOptions::default()).await;

  assert!(plan_doc.is_none(), "no plan artifact on error");
  assert!(diags.has_errors());
  let detail = diags.errors().next().unwrap().detail.clone();
  assert!(detail.contains("null_resource.a"), "{}", detail);
  assert!(detail.contains("null_resource.b"), "{}", detail);
}

// Scenario 6: sensitivity propagates from variable to plan, state, and
// output policy.
#[tokio::test]
async fn sensitive_propagation() {
  let mut module = Module::root();
  module.add_variable(Variable::new("pw").with_ty(Ty::String).sensitive()).unwrap();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "y",
      Expr::object([("password".to_string(), Expr::var("pw"))]),
    ))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let mut options = PlanOptions::default();
  options.variables = BTreeMap::from([("pw".to_string(), Value::string("hunter2"))]);
  let (broker, _) = broker_with(base_mock());
  let (plan_doc, diags) = plan(config.clone(), &prior, broker, options).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  let plan_doc = plan_doc.unwrap();

  // The planned value masks the password when rendered.
  let planned = plan_doc.changes[0].planned.as_ref().unwrap();
  let password = planned.get_attr("password").unwrap();
  assert!(password.marks().is_sensitive());
  assert_eq!(password.to_string(), "(sensitive value)");
  assert!(!planned.to_string().contains("hunter2"));

  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;

  // The state marks the attribute sensitive.
  let state = mgr.read().await.unwrap();
  let instance = state.instance(&addr("null_resource.y")).unwrap();
  assert_eq!(instance.attributes["password"], serde_json::json!("hunter2"));
  assert!(
    instance
      .sensitive_attributes
      .iter()
      .any(|p| p.to_string() == ".password"),
    "sensitive paths: {:?}",
    instance.sensitive_attributes
  );
}

#[tokio::test]
async fn unmarked_output_of_sensitive_value_fails_plan() {
  let mut module = Module::root();
  module.add_variable(Variable::new("pw").with_ty(Ty::String).sensitive()).unwrap();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "y",
      Expr::object([("password".to_string(), Expr::var("pw"))]),
    ))
    .unwrap();
  module
    .add_output(Output::new(
      "leak",
      Expr::managed("null_resource", "y").attr("password"),
    ))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let mut options = PlanOptions::default();
  options.variables = BTreeMap::from([("pw".to_string(), Value::string("hunter2"))]);
  let (broker, _) = broker_with(base_mock());
  let (plan_doc, diags) = plan(config, &StateFile::empty(), broker, options).await;

  assert!(plan_doc.is_none());
  assert!(diags.has_errors());
  let diag = diags.errors().next().unwrap();
  assert!(diag.summary.contains("sensitive"), "{}", diag.summary);
  assert_eq!(diag.address.as_deref(), Some("output.leak"));

  // Acknowledging the sensitivity on the output makes the same plan valid.
  let mut module = Module::root();
  module.add_variable(Variable::new("pw").with_ty(Ty::String).sensitive()).unwrap();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "y",
      Expr::object([("password".to_string(), Expr::var("pw"))]),
    ))
    .unwrap();
  module
    .add_output(Output::new("ok", Expr::managed("null_resource", "y").attr("password")).sensitive())
    .unwrap();
  let config = Arc::new(Config::new(module));
  let mut options = PlanOptions::default();
  options.variables = BTreeMap::from([("pw".to_string(), Value::string("hunter2"))]);
  let (broker, _) = broker_with(base_mock());
  let (plan_doc, diags) = plan(config, &StateFile::empty(), broker, options).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  let plan_doc = plan_doc.unwrap();
  let output = plan_doc.output_changes.iter().find(|o| o.name == "ok").unwrap();
  assert!(output.sensitive);
}

// P5: prevent_destroy fails a plan that wants to replace.
#[tokio::test]
async fn prevent_destroy_fails_replace_plan() {
  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);

  let mut protected = Resource::managed(
    "null_resource",
    "x",
    Expr::object([("region".to_string(), Expr::str("eu"))]),
  );
  protected.lifecycle.prevent_destroy = true;
  let config_eu = single_resource_config(protected.clone());

  let prior = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config_eu, &prior, broker).await;
  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config_eu, mgr.clone(), broker).await;

  let mut changed = protected;
  changed.body = Expr::object([("region".to_string(), Expr::str("us"))]);
  let config_us = single_resource_config(changed);

  let seeded = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock().with_replace_path("null_resource", AttrPath::attr("region")));
  let (plan_doc, diags) = plan(config_us, &seeded, broker, PlanOptions::default()).await;

  assert!(plan_doc.is_none());
  assert!(diags.has_errors());
  let diag = diags.errors().next().unwrap();
  assert_eq!(diag.address.as_deref(), Some("null_resource.x"));
}

// P1/P7: identical inputs produce identical, address-ordered plans.
#[tokio::test]
async fn plans_are_deterministic_and_ordered() {
  let mut module = Module::root();
  for name in ["c", "a", "b"] {
    module
      .add_resource(Resource::managed("null_resource", name, Expr::object([])))
      .unwrap();
  }
  let config = Arc::new(Config::new(module));

  let mut runs = Vec::new();
  for _ in 0..2 {
    let (broker, _) = broker_with(base_mock());
    let plan_doc = plan_ok(&config, &StateFile::empty(), broker).await;
    let actions: Vec<(String, Action)> = plan_doc
      .changes
      .iter()
      .map(|c| (c.addr.to_string(), c.action))
      .collect();
    runs.push(actions);
  }
  assert_eq!(runs[0], runs[1]);
  assert_eq!(
    runs[0].iter().map(|(a, _)| a.as_str()).collect::<Vec<_>>(),
    vec!["null_resource.a", "null_resource.b", "null_resource.c"]
  );
}

// P2/P3: apply then re-plan is NoOp; serial strictly increases with
// constant lineage along the way.
#[tokio::test]
async fn apply_then_replan_is_noop() {
  let mut module = Module::root();
  module
    .add_resource(Resource::managed("null_resource", "a", Expr::object([])))
    .unwrap();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "b",
      Expr::object([("region".to_string(), Expr::managed("null_resource", "a").attr("id"))]),
    ))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();
  let lineage = prior.lineage.clone();

  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  assert_eq!(plan_doc.changes.len(), 2);

  let (broker, _) = broker_with(base_mock());
  let outcome = apply_ok(plan_doc, &config, mgr.clone(), broker).await;
  assert_eq!(outcome.applied, 2);

  let state = mgr.read().await.unwrap();
  assert!(state.serial >= 2, "one write per applied change, serial {}", state.serial);
  assert_eq!(state.lineage, lineage);

  // The dependent resource saw the applied id, not an unknown.
  let b = state.instance(&addr("null_resource.b")).unwrap();
  assert_eq!(b.attributes["region"], serde_json::json!("yes"));

  let (broker, _) = broker_with(base_mock());
  let replan = plan_ok(&config, &state, broker).await;
  assert!(
    replan.changes.iter().all(|c| c.action.is_noop()),
    "expected all NoOp, got {:?}",
    replan.changes.iter().map(|c| (c.addr.to_string(), c.action)).collect::<Vec<_>>()
  );
}

// Count expansion end to end.
#[tokio::test]
async fn count_expansion_creates_instances() {
  let mut resource = Resource::managed("null_resource", "x", Expr::object([]));
  resource.count = Some(Expr::int(2));
  let config = single_resource_config(resource);

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  let addrs: Vec<String> = plan_doc.changes.iter().map(|c| c.addr.to_string()).collect();
  assert_eq!(addrs, vec!["null_resource.x[0]", "null_resource.x[1]"]);

  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;
  let state = mgr.read().await.unwrap();
  assert!(state.instance(&addr("null_resource.x[0]")).is_some());
  assert!(state.instance(&addr("null_resource.x[1]")).is_some());

  // Shrinking the count plans a delete for the orphaned key.
  let mut resource = Resource::managed("null_resource", "x", Expr::object([]));
  resource.count = Some(Expr::int(1));
  let config_small = single_resource_config(resource);
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config_small, &state, broker).await;
  let delete = plan_doc.change_for(&addr("null_resource.x[1]")).unwrap();
  assert_eq!(delete.action, Action::Delete);
}

// Create-before-destroy goes through a deposed object.
#[tokio::test]
async fn create_before_destroy_deposes() {
  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);

  let mut resource = Resource::managed(
    "null_resource",
    "x",
    Expr::object([("region".to_string(), Expr::str("eu"))]),
  );
  resource.lifecycle.create_before_destroy = true;
  let config_eu = single_resource_config(resource.clone());

  let prior = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config_eu, &prior, broker).await;
  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config_eu, mgr.clone(), broker).await;

  let mut changed = resource;
  changed.body = Expr::object([("region".to_string(), Expr::str("us"))]);
  let config_us = single_resource_config(changed);

  let seeded = mgr.read().await.unwrap();
  let replace_mock = || base_mock().with_replace_path("null_resource", AttrPath::attr("region"));
  let (broker, _) = broker_with(replace_mock());
  let plan_doc = plan_ok(&config_us, &seeded, broker).await;
  assert_eq!(plan_doc.changes[0].action, Action::CreateThenDelete);

  // Track the order of apply calls: create (no prior) must precede the
  // destroy of the deposed object (no planned).
  let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let seen = order.clone();
  let tracking = replace_mock().on_apply(move |request| {
    seen.lock().push((request.prior.is_some(), request.planned.is_some()));
    None
  });
  let (broker, _) = broker_with(tracking);
  apply_ok(plan_doc, &config_us, mgr.clone(), broker).await;

  let calls = order.lock().clone();
  assert_eq!(calls, vec![(false, true), (true, false)], "create new, then destroy deposed");

  let state = mgr.read().await.unwrap();
  let instance = state.instance(&addr("null_resource.x")).unwrap();
  assert_eq!(instance.attributes["region"], serde_json::json!("us"));
  assert!(state.deposed(&addr("null_resource.x")).is_empty(), "deposed cleaned up");
}

// Deferred data reads execute during apply, after their dependencies.
#[tokio::test]
async fn deferred_data_read_runs_at_apply() {
  let data_schema = BlockSchema::new(
    0,
    [
      ("name".to_string(), AttrSchema::required(Ty::String)),
      ("value".to_string(), AttrSchema::computed(Ty::String)),
    ],
  );
  let data_mock = move || {
    base_mock()
      .with_data_source("null_lookup", data_schema.clone())
      .on_data(|_, config| {
        let name = config.get_attr("name").unwrap();
        Ok(Value::object([
          ("name".to_string(), name.clone()),
          ("value".to_string(), Value::string("resolved")),
        ]))
      })
  };

  let mut module = Module::root();
  module
    .add_resource(Resource::managed("null_resource", "a", Expr::object([])))
    .unwrap();
  module
    .add_resource(Resource::data(
      "null_lookup",
      "d",
      Expr::object([("name".to_string(), Expr::managed("null_resource", "a").attr("id"))]),
    ))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let (broker, mock) = broker_with(data_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  // The data read waits for apply because its argument is unknown.
  let data_change = plan_doc.change_for(&addr("data.null_lookup.d")).unwrap();
  assert_eq!(data_change.action, Action::Read);
  assert_eq!(data_change.reason, Some(ChangeReason::DeferredRead));
  assert_eq!(mock.calls_named("read_data_source"), 0);

  let (broker, mock) = broker_with(data_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;
  assert_eq!(mock.calls_named("read_data_source"), 1);

  let state = mgr.read().await.unwrap();
  let data_instance = state.instance(&addr("data.null_lookup.d")).unwrap();
  assert_eq!(data_instance.attributes["name"], serde_json::json!("yes"));
  assert_eq!(data_instance.attributes["value"], serde_json::json!("resolved"));
}

// Import blocks adopt without creating.
#[tokio::test]
async fn import_adopts_existing_object() {
  let mut module = Module::root();
  module
    .add_resource(Resource::managed("null_resource", "x", Expr::object([])))
    .unwrap();
  module.imports.push(ImportBlock {
    to: addr("null_resource.x"),
    id: Expr::str("i-909"),
  });
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let (broker, mock) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  assert_eq!(mock.calls_named("import_resource_state"), 1);
  let change = &plan_doc.changes[0];
  assert_eq!(change.action, Action::Read);
  assert_eq!(change.importing.as_deref(), Some("i-909"));

  let (broker, mock) = broker_with(base_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;
  assert_eq!(mock.calls_named("apply_resource_change"), 0, "no create during adoption");

  let state = mgr.read().await.unwrap();
  let instance = state.instance(&addr("null_resource.x")).unwrap();
  assert_eq!(instance.attributes["id"], serde_json::json!("i-909"));
}

// Failures propagate as skips; independent work continues; state records
// what succeeded.
#[tokio::test]
async fn partial_failure_keeps_independent_work() {
  let mut module = Module::root();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "bad",
      Expr::object([("region".to_string(), Expr::str("boom"))]),
    ))
    .unwrap();
  module
    .add_resource(Resource::managed(
      "null_resource",
      "child",
      Expr::object([("region".to_string(), Expr::managed("null_resource", "bad").attr("id"))]),
    ))
    .unwrap();
  module
    .add_resource(Resource::managed("null_resource", "solo", Expr::object([])))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;

  let failing = base_mock().on_apply(|request| {
    let region = request.planned.as_ref().and_then(|p| p.get_attr("region").ok());
    if region.as_ref().and_then(|r| r.as_str().map(str::to_string)).as_deref() == Some("boom") {
      Some(Err("injected".to_string()))
    } else {
      None
    }
  });
  let (broker, _) = broker_with(failing);
  let (outcome, diags) = apply(
    Arc::new(plan_doc),
    config.clone(),
    mgr.clone(),
    broker,
    ApplyOptions::default(),
  )
  .await;

  assert!(diags.has_errors());
  let outcome = outcome.unwrap();
  assert_eq!(outcome.applied, 1, "independent resource still applied");
  assert!(outcome.skipped.iter().any(|k| k == "null_resource.child"));

  let state = mgr.read().await.unwrap();
  assert!(state.instance(&addr("null_resource.solo")).is_some());
  assert!(state.instance(&addr("null_resource.bad")).is_none());
  assert!(state.instance(&addr("null_resource.child")).is_none());
}

// An orphaned state object plans a delete and is removed on apply.
#[tokio::test]
async fn orphan_destroyed() {
  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);

  // Seed with one resource, then plan with an empty configuration.
  let config = single_resource_config(Resource::managed("null_resource", "x", Expr::object([])));
  let prior = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;

  let empty_config = Arc::new(Config::new(Module::root()));
  let seeded = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&empty_config, &seeded, broker).await;
  let change = plan_doc.change_for(&addr("null_resource.x")).unwrap();
  assert_eq!(change.action, Action::Delete);
  assert_eq!(change.reason, Some(ChangeReason::NoResourceConfig));

  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &empty_config, mgr.clone(), broker).await;
  let state = mgr.read().await.unwrap();
  assert!(state.instance(&addr("null_resource.x")).is_none());
}

// A targeted plan leaves everything else alone at apply: the untargeted
// data source is not re-read and its provider is never even started.
#[tokio::test]
async fn targeted_apply_skips_unrelated_data_source() {
  let lookup_schema = BlockSchema::new(
    0,
    [
      ("name".to_string(), AttrSchema::required(Ty::String)),
      ("value".to_string(), AttrSchema::computed(Ty::String)),
    ],
  );
  let lookup_addr = ProviderAddr::default_registry("lookup");
  let null_addr = ProviderAddr::default_registry("null");
  let mocks = || {
    let null_mock = Arc::new(base_mock());
    let lookup_mock = Arc::new(
      MockProvider::new()
        .with_addr(lookup_addr.clone())
        .with_data_source("lookup_table", lookup_schema.clone()),
    );
    let broker = Arc::new(Broker::new(Arc::new(MockFactory::with([
      (null_addr.clone(), null_mock.clone() as Arc<dyn gantry_provider::Provider>),
      (lookup_addr.clone(), lookup_mock.clone() as Arc<dyn gantry_provider::Provider>),
    ]))));
    (broker, null_mock, lookup_mock)
  };

  let mut module = Module::root();
  module
    .add_resource(Resource::managed("null_resource", "x", Expr::object([])))
    .unwrap();
  module
    .add_resource(Resource::data(
      "lookup_table",
      "d",
      Expr::object([("name".to_string(), Expr::str("static"))]),
    ))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let mut options = PlanOptions::default();
  options.targets = vec![Target::parse("null_resource.x").unwrap()];
  let (broker, _, lookup_mock) = mocks();
  let (plan_doc, diags) = plan(config.clone(), &prior, broker, options).await;
  assert!(!diags.has_errors(), "{:?}", diags);
  let plan_doc = plan_doc.unwrap();

  // Only the targeted resource appears; the data source was neither read
  // nor planned.
  let actions: Vec<(String, Action)> = plan_doc
    .changes
    .iter()
    .map(|c| (c.addr.to_string(), c.action))
    .collect();
  assert_eq!(actions, vec![("null_resource.x".to_string(), Action::Create)]);
  assert_eq!(lookup_mock.calls_named("read_data_source"), 0);

  let (broker, null_mock, lookup_mock) = mocks();
  let outcome = apply_ok(plan_doc, &config, mgr.clone(), broker).await;
  assert_eq!(outcome.applied, 1);

  // The untargeted data source's provider was never configured, started,
  // or read during the apply.
  assert!(lookup_mock.calls().is_empty(), "calls: {:?}", lookup_mock.calls());
  assert_eq!(null_mock.calls_named("configure"), 1);

  let state = mgr.read().await.unwrap();
  assert!(state.instance(&addr("null_resource.x")).is_some());
  assert!(state.instance(&addr("data.lookup_table.d")).is_none());
}

// A provider whose resources are all NoOp this run is never configured or
// closed during the apply.
#[tokio::test]
async fn noop_provider_left_untouched() {
  let other_schema = BlockSchema::new(
    0,
    [
      ("id".to_string(), AttrSchema::computed(Ty::String)),
      ("region".to_string(), AttrSchema::optional(Ty::String)),
    ],
  );
  let other_addr = ProviderAddr::default_registry("other");
  let null_addr = ProviderAddr::default_registry("null");
  let mocks = || {
    let null_mock = Arc::new(base_mock());
    let other_mock = Arc::new(
      MockProvider::new()
        .with_addr(other_addr.clone())
        .with_resource("other_thing", other_schema.clone())
        .with_create_value("other_thing", "id", Value::string("ok")),
    );
    let broker = Arc::new(Broker::new(Arc::new(MockFactory::with([
      (null_addr.clone(), null_mock.clone() as Arc<dyn gantry_provider::Provider>),
      (other_addr.clone(), other_mock.clone() as Arc<dyn gantry_provider::Provider>),
    ]))));
    (broker, null_mock, other_mock)
  };

  let config_with = |region: &str| {
    let mut module = Module::root();
    module
      .add_resource(Resource::managed(
        "null_resource",
        "x",
        Expr::object([("region".to_string(), Expr::str(region))]),
      ))
      .unwrap();
    module
      .add_resource(Resource::managed("other_thing", "y", Expr::object([])))
      .unwrap();
    Arc::new(Config::new(module))
  };

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);

  // Seed both resources.
  let config_eu = config_with("eu");
  let prior = mgr.read().await.unwrap();
  let (broker, _, _) = mocks();
  let plan_doc = plan_ok(&config_eu, &prior, broker).await;
  let (broker, _, _) = mocks();
  apply_ok(plan_doc, &config_eu, mgr.clone(), broker).await;

  // Change only the null-provider resource.
  let config_us = config_with("us");
  let seeded = mgr.read().await.unwrap();
  let (broker, _, _) = mocks();
  let plan_doc = plan_ok(&config_us, &seeded, broker).await;
  assert_eq!(plan_doc.change_for(&addr("null_resource.x")).unwrap().action, Action::Update);
  assert_eq!(plan_doc.change_for(&addr("other_thing.y")).unwrap().action, Action::NoOp);

  let (broker, null_mock, other_mock) = mocks();
  let outcome = apply_ok(plan_doc, &config_us, mgr.clone(), broker).await;
  assert_eq!(outcome.applied, 1);

  // The NoOp provider saw no RPCs at all: no Configure, no Close, nothing.
  assert!(other_mock.calls().is_empty(), "calls: {:?}", other_mock.calls());
  assert_eq!(null_mock.calls_named("configure"), 1);
  assert_eq!(null_mock.calls_named("close"), 1);

  let state = mgr.read().await.unwrap();
  assert_eq!(
    state.instance(&addr("null_resource.x")).unwrap().attributes["region"],
    serde_json::json!("us")
  );
  assert_eq!(
    state.instance(&addr("other_thing.y")).unwrap().attributes["id"],
    serde_json::json!("ok")
  );
}

// A delete whose object drifted between plan and apply is rejected as
// stale, exactly like creates and updates.
#[tokio::test]
async fn out_of_band_drift_fails_delete() {
  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);

  // Seed one object, then plan its removal.
  let config = single_resource_config(Resource::managed("null_resource", "x", Expr::object([])));
  let prior = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;

  let empty_config = Arc::new(Config::new(Module::root()));
  let seeded = mgr.read().await.unwrap();
  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&empty_config, &seeded, broker).await;
  assert_eq!(plan_doc.change_for(&addr("null_resource.x")).unwrap().action, Action::Delete);

  // Between plan and apply the object changed out-of-band.
  let drifted = base_mock().on_read(|_, _| {
    Some(Value::object([
      ("id".to_string(), Value::string("drifted")),
      ("region".to_string(), Value::null(Ty::String)),
      ("password".to_string(), Value::null(Ty::String)),
    ]))
  });
  let (broker, mock) = broker_with(drifted);
  let (outcome, diags) = apply(
    Arc::new(plan_doc),
    empty_config.clone(),
    mgr.clone(),
    broker,
    ApplyOptions::default(),
  )
  .await;

  assert!(diags.has_errors());
  let diag = diags.errors().next().unwrap();
  assert!(diag.summary.contains("stale"), "{}", diag.summary);
  assert_eq!(diag.address.as_deref(), Some("null_resource.x"));

  // Nothing was destroyed; the object is still tracked.
  let outcome = outcome.unwrap();
  assert_eq!(outcome.applied, 0);
  assert_eq!(mock.calls_named("apply_resource_change"), 0);
  let state = mgr.read().await.unwrap();
  assert!(state.instance(&addr("null_resource.x")).is_some());
}

// Outputs flow into state, sensitivity included.
#[tokio::test]
async fn outputs_recorded_in_state() {
  let mut module = Module::root();
  module
    .add_resource(Resource::managed("null_resource", "x", Expr::object([])))
    .unwrap();
  module
    .add_output(Output::new("xid", Expr::managed("null_resource", "x").attr("id")))
    .unwrap();
  let config = Arc::new(Config::new(module));

  let backend = MemBackend::new();
  let mgr = backend.manager(DEFAULT_WORKSPACE);
  let prior = mgr.read().await.unwrap();

  let (broker, _) = broker_with(base_mock());
  let plan_doc = plan_ok(&config, &prior, broker).await;
  // At plan time the output is a projection of an unknown.
  assert_eq!(plan_doc.output_changes.len(), 1);
  assert!(plan_doc.output_changes[0].value.is_unknown());

  let (broker, _) = broker_with(base_mock());
  apply_ok(plan_doc, &config, mgr.clone(), broker).await;

  let state = mgr.read().await.unwrap();
  let output = state.outputs.get("xid").expect("output in state");
  assert_eq!(output.value, serde_json::json!("yes"));
  assert!(!output.sensitive);
}
