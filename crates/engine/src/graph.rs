//! The dependency graph: node kinds, the static build phase, and cycle
//! reporting.
//!
//! Nodes live in a petgraph arena addressed by index; a side table maps each
//! node's canonical key string to its index so edges can be wired by
//! address. The static phase creates everything knowable from the IR and
//! prior state; `count`/`for_each` expansion happens during the walk, which
//! appends instance nodes through [`WalkGraph::expand`] so edges into the
//! original fan out and edges out of it are inherited by every expansion.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use gantry_core::addr::{
  InstanceAddr, LocalAddr, ModulePath, OutputAddr, ProviderAddr, ProviderConfigAddr, ResourceAddr,
  VariableAddr,
};
use gantry_core::config::{Config, Module};
use gantry_core::diags::{Diagnostic, Diagnostics};
use gantry_core::expr::{Expr, Reference};
use gantry_state::StateFile;

/// One vertex of the walk graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
  /// The sink every terminal node feeds into.
  Root,
  Variable { module: ModulePath, name: String },
  Local { module: ModulePath, name: String },
  Output { module: ModulePath, name: String },
  /// Evaluates call arguments and, when keyed, expands the child module.
  ModuleCall { module: ModulePath, name: String },
  ProviderConfig(ProviderConfigAddr),
  /// Tears one provider process down once nothing needs it anymore.
  CloseProvider(ProviderAddr),
  /// A resource block before expansion.
  ConfigResource(ResourceAddr),
  /// One realized instance, created during expansion (plan) or taken from a
  /// plan's changes (apply).
  ResourceInstance(InstanceAddr),
  /// Destroys the primary object (plan orphans, apply deletes) or, with
  /// `deposed` set, the deposed objects of an address.
  ResourceInstanceDestroy { addr: InstanceAddr, deposed: bool },
}

impl Node {
  /// The canonical key: unique across the graph and usable as the
  /// deterministic tie-break in topological order.
  pub fn key(&self) -> String {
    match self {
      Node::Root => "root".to_string(),
      Node::Variable { module, name } => VariableAddr {
        module: module.clone(),
        name: name.clone(),
      }
      .to_string(),
      Node::Local { module, name } => LocalAddr {
        module: module.clone(),
        name: name.clone(),
      }
      .to_string(),
      Node::Output { module, name } => OutputAddr {
        module: module.clone(),
        name: name.clone(),
      }
      .to_string(),
      Node::ModuleCall { module, name } => {
        if module.is_root() {
          format!("module.{}", name)
        } else {
          format!("{}.module.{}", module, name)
        }
      }
      Node::ProviderConfig(addr) => addr.to_string(),
      Node::CloseProvider(addr) => format!("close.provider[\"{}\"]", addr),
      Node::ConfigResource(addr) => addr.to_string(),
      Node::ResourceInstance(addr) => addr.to_string(),
      Node::ResourceInstanceDestroy { addr, deposed } => {
        if *deposed {
          format!("destroy.{} (deposed)", addr)
        } else {
          format!("destroy.{}", addr)
        }
      }
    }
  }

  /// The user-facing address for diagnostics, when the node has one.
  pub fn address(&self) -> Option<String> {
    match self {
      Node::Root | Node::CloseProvider(_) => None,
      Node::ResourceInstance(addr) => Some(addr.to_string()),
      Node::ResourceInstanceDestroy { addr, .. } => Some(addr.to_string()),
      Node::ConfigResource(addr) => Some(addr.to_string()),
      Node::ProviderConfig(addr) => Some(addr.to_string()),
      other => Some(other.key()),
    }
  }
}

impl fmt::Display for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.key())
  }
}

/// A node to append during dynamic expansion, with dependencies named by
/// node key. Keys that resolve inside the batch become batch-internal
/// edges; keys naming existing incomplete nodes become edges from those;
/// unresolvable keys are ignored (their objects already completed or never
/// existed).
#[derive(Debug, Clone)]
pub struct ExpandNode {
  pub node: Node,
  pub deps: Vec<String>,
}

/// The walk graph plus its key index.
pub struct WalkGraph {
  graph: DiGraph<Node, ()>,
  index: HashMap<String, NodeIndex>,
}

impl Default for WalkGraph {
  fn default() -> Self {
    WalkGraph::new()
  }
}

impl WalkGraph {
  pub fn new() -> Self {
    WalkGraph {
      graph: DiGraph::new(),
      index: HashMap::new(),
    }
  }

  /// Adds a node, or returns the existing index for its key.
  pub fn add_node(&mut self, node: Node) -> NodeIndex {
    let key = node.key();
    if let Some(&idx) = self.index.get(&key) {
      return idx;
    }
    let idx = self.graph.add_node(node);
    self.index.insert(key, idx);
    idx
  }

  pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
    if from != to && !self.graph.contains_edge(from, to) {
      self.graph.add_edge(from, to, ());
    }
  }

  /// Wires an edge by keys, ignoring keys with no node.
  pub fn add_edge_keys(&mut self, from: &str, to: &str) {
    if let (Some(&from), Some(&to)) = (self.index.get(from), self.index.get(to)) {
      self.add_edge(from, to);
    }
  }

  pub fn lookup(&self, key: &str) -> Option<NodeIndex> {
    self.index.get(key).copied()
  }

  pub fn node(&self, idx: NodeIndex) -> &Node {
    &self.graph[idx]
  }

  pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.node_indices()
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
    self.graph.neighbors_directed(idx, Direction::Outgoing).collect()
  }

  pub fn predecessors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
    self.graph.neighbors_directed(idx, Direction::Incoming).collect()
  }

  /// Appends an expansion batch for `origin`. Every new node implicitly
  /// depends on `origin` and inherits `origin`'s successors, so the fan-out
  /// and fan-in edges the expansion contract requires come for free; batch
  /// deps add the edges inside the batch. Returns the new indices in batch
  /// order.
  pub fn expand(&mut self, origin: NodeIndex, batch: Vec<ExpandNode>, completed: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
    let succs = self.successors(origin);
    let mut added = Vec::with_capacity(batch.len());

    // First pass: create all nodes so batch-internal deps resolve.
    for entry in &batch {
      added.push(self.add_node(entry.node.clone()));
    }
    for (entry, &idx) in batch.iter().zip(&added) {
      self.add_edge(origin, idx);
      for succ in &succs {
        self.add_edge(idx, *succ);
      }
      for dep in &entry.deps {
        if let Some(&dep_idx) = self.index.get(dep.as_str()) {
          if dep_idx != idx && !completed.contains(&dep_idx) {
            self.add_edge(dep_idx, idx);
          }
        }
      }
    }
    added
  }

  /// The induced subgraph over `keep`: the kept nodes and every edge whose
  /// endpoints both survive. Node order (and so walk tie-breaking) is
  /// preserved.
  pub fn retain(&self, keep: &HashSet<NodeIndex>) -> WalkGraph {
    let mut out = WalkGraph::new();
    for idx in self.graph.node_indices() {
      if keep.contains(&idx) {
        out.add_node(self.graph[idx].clone());
      }
    }
    for edge in self.graph.edge_indices() {
      if let Some((from, to)) = self.graph.edge_endpoints(edge) {
        if keep.contains(&from) && keep.contains(&to) {
          out.add_edge_keys(&self.graph[from].key(), &self.graph[to].key());
        }
      }
    }
    out
  }

  /// Connects every sink to the root node.
  pub fn seal(&mut self) {
    let root = self.add_node(Node::Root);
    let sinks: Vec<NodeIndex> = self
      .graph
      .node_indices()
      .filter(|&idx| idx != root && self.graph.neighbors_directed(idx, Direction::Outgoing).count() == 0)
      .collect();
    for sink in sinks {
      self.add_edge(sink, root);
    }
  }

  /// Reports every cycle, naming all nodes on each. An acyclic graph
  /// returns empty diagnostics.
  pub fn check_cycles(&self) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for component in tarjan_scc(&self.graph) {
      let cyclic = component.len() > 1
        || (component.len() == 1 && self.graph.contains_edge(component[0], component[0]));
      if cyclic {
        let mut names: Vec<String> = component.iter().map(|&idx| self.graph[idx].key()).collect();
        names.sort();
        diags.push(
          Diagnostic::error("dependency cycle in configuration")
            .with_detail(format!("cycle through: {}", names.join(", "))),
        );
      }
    }
    diags
  }
}

/// Builds the static phase of the plan graph.
pub fn build_plan_graph(config: &Config, state: &StateFile) -> WalkGraph {
  let mut graph = WalkGraph::new();
  graph.add_node(Node::Root);

  // Provider configuration nodes for everything resolvable from the IR:
  // declared provider blocks plus the (possibly default) bindings of every
  // resource.
  let mut provider_addrs: Vec<ProviderConfigAddr> = Vec::new();
  collect_provider_addrs(config, &config.root, &mut provider_addrs);
  // Orphans in state may use providers the configuration no longer names.
  for resource in &state.resources {
    if let Some(addr) = resource.provider_addr() {
      provider_addrs.push(addr);
    }
  }
  provider_addrs.sort();
  provider_addrs.dedup();

  for addr in &provider_addrs {
    let node = graph.add_node(Node::ProviderConfig(addr.clone()));
    let close = graph.add_node(Node::CloseProvider(addr.provider.clone()));
    graph.add_edge(node, close);
  }

  // The root module tree.
  let batch = module_batch(config, &config.root, &ModulePath::root(), None);
  for entry in &batch {
    graph.add_node(entry.node.clone());
  }
  for entry in &batch {
    let key = entry.node.key();
    for dep in &entry.deps {
      graph.add_edge_keys(dep, &key);
    }
  }
  wire_close_edges(config, &mut graph, &batch);

  // Provider config expressions may reference values in their declaring
  // module; those nodes exist now.
  for addr in &provider_addrs {
    if let Some((module_path, pc)) = find_provider_block(config, addr) {
      for dep in expr_dep_keys(config, &module_path, &pc.config) {
        graph.add_edge_keys(&dep, &Node::ProviderConfig(addr.clone()).key());
      }
    }
  }

  // Orphan destroys: state instances whose resource no longer exists in
  // configuration. Resources named by a removed block with destroy=false
  // are forgotten at plan finalization instead.
  let forgotten: HashSet<String> = config
    .root
    .removed
    .iter()
    .filter(|r| !r.destroy)
    .map(|r| r.from.to_string())
    .collect();

  for inst in state.all_instances() {
    let in_config = config
      .module(&inst.resource.module)
      .and_then(|m| m.resource(inst.resource.mode, &inst.resource.type_name, &inst.resource.name))
      .is_some();
    if in_config || forgotten.contains(&inst.resource.to_string()) {
      continue;
    }
    let destroy = graph.add_node(Node::ResourceInstanceDestroy {
      addr: inst.clone(),
      deposed: false,
    });
    let provider = state
      .resources
      .iter()
      .find(|r| r.addr() == inst.resource)
      .and_then(|r| r.provider_addr());
    if let Some(provider) = provider {
      let destroy_key = Node::ResourceInstanceDestroy {
        addr: inst.clone(),
        deposed: false,
      }
      .key();
      graph.add_edge_keys(&Node::ProviderConfig(provider.clone()).key(), &destroy_key);
      let close = graph.add_node(Node::CloseProvider(provider.provider));
      graph.add_edge(destroy, close);
    }
  }

  // Destroy-before-destroy ordering between orphans, from recorded state
  // dependencies: a dependent is destroyed before its dependency.
  let orphan_keys: Vec<(InstanceAddr, Vec<String>)> = state
    .resources
    .iter()
    .flat_map(|r| {
      let addr = r.addr();
      r.instances
        .iter()
        .filter(|i| i.is_primary())
        .map(move |i| (addr.instance(i.index_key.clone()), i.dependencies.clone()))
    })
    .collect();
  for (inst, deps) in &orphan_keys {
    let this_key = Node::ResourceInstanceDestroy {
      addr: inst.clone(),
      deposed: false,
    }
    .key();
    if graph.lookup(&this_key).is_none() {
      continue;
    }
    for dep in deps {
      if let Ok(dep_addr) = gantry_core::addr::ResourceAddr::parse(dep) {
        for (other, _) in &orphan_keys {
          if other.resource == dep_addr {
            let dep_key = Node::ResourceInstanceDestroy {
              addr: other.clone(),
              deposed: false,
            }
            .key();
            graph.add_edge_keys(&this_key, &dep_key);
          }
        }
      }
    }
  }

  graph.seal();
  graph
}

/// Node batch for one module instance at `path` (keys included when the
/// instantiating call was expanded). `entry_dep` is the key of the
/// ModuleCall node that published this instance's arguments.
pub fn module_batch(
  config: &Config,
  module: &Module,
  path: &ModulePath,
  entry_dep: Option<&str>,
) -> Vec<ExpandNode> {
  let mut batch = Vec::new();
  let entry: Vec<String> = entry_dep.map(|d| vec![d.to_string()]).unwrap_or_default();

  for variable in module.variables.values() {
    batch.push(ExpandNode {
      node: Node::Variable {
        module: path.clone(),
        name: variable.name.clone(),
      },
      deps: entry.clone(),
    });
  }

  for local in module.locals.values() {
    batch.push(ExpandNode {
      node: Node::Local {
        module: path.clone(),
        name: local.name.clone(),
      },
      deps: expr_dep_keys(config, path, &local.expr),
    });
  }

  for output in module.outputs.values() {
    let mut deps = expr_dep_keys(config, path, &output.expr);
    for dep in &output.depends_on {
      deps.extend(reference_dep_keys(module, path, dep));
    }
    batch.push(ExpandNode {
      node: Node::Output {
        module: path.clone(),
        name: output.name.clone(),
      },
      deps,
    });
  }

  for resource in module.resources.values() {
    let addr = resource.addr(path);
    let mut deps = expr_dep_keys(config, path, &resource.body);
    if let Some(count) = &resource.count {
      deps.extend(expr_dep_keys(config, path, count));
    }
    if let Some(for_each) = &resource.for_each {
      deps.extend(expr_dep_keys(config, path, for_each));
    }
    for dep in &resource.depends_on {
      deps.extend(reference_dep_keys(module, path, dep));
    }
    deps.push(Node::ProviderConfig(config.resolve_provider(path, resource)).key());
    batch.push(ExpandNode {
      node: Node::ConfigResource(addr),
      deps,
    });
  }

  for call in module.module_calls.values() {
    let call_node = Node::ModuleCall {
      module: path.clone(),
      name: call.name.clone(),
    };
    let mut deps: Vec<String> = call
      .args
      .values()
      .flat_map(|expr| expr_dep_keys(config, path, expr))
      .collect();
    if let Some(for_each) = &call.for_each {
      deps.extend(expr_dep_keys(config, path, for_each));
    }
    if let Some(count) = &call.count {
      deps.extend(expr_dep_keys(config, path, count));
    }
    let call_key = call_node.key();
    batch.push(ExpandNode {
      node: call_node,
      deps,
    });

    // Single-instance calls inline the child statically; keyed calls
    // expand during the walk.
    if call.for_each.is_none() && call.count.is_none() {
      let child_path = path.child(&call.name);
      batch.extend(module_batch(config, &call.module, &child_path, Some(&call_key)));
    }
  }

  batch
}

/// Edges a module batch cannot wire itself: every resource in the batch
/// precedes the CloseProvider node of its provider, and a keyed module call
/// precedes the CloseProvider of every provider its subtree uses, so the
/// dynamically-expanded child nodes inherit those edges via fan-in.
pub fn wire_close_edges(config: &Config, graph: &mut WalkGraph, batch: &[ExpandNode]) {
  for entry in batch {
    match &entry.node {
      Node::ConfigResource(addr) => {
        let Some(module) = config.module(&addr.module) else { continue };
        let Some(resource) = module.resource(addr.mode, &addr.type_name, &addr.name) else {
          continue;
        };
        let provider = config.resolve_provider(&addr.module, resource);
        graph.add_edge_keys(&entry.node.key(), &Node::CloseProvider(provider.provider).key());
      }
      Node::ModuleCall { module, name } => {
        let keyed = config
          .module(module)
          .and_then(|m| m.module_calls.get(name))
          .map(|call| call.for_each.is_some() || call.count.is_some())
          .unwrap_or(false);
        if !keyed {
          continue;
        }
        let mut subtree = Vec::new();
        if let Some(call) = config.module(module).and_then(|m| m.module_calls.get(name)) {
          collect_provider_addrs(config, &call.module, &mut subtree);
        }
        for provider in subtree {
          graph.add_edge_keys(&entry.node.key(), &Node::CloseProvider(provider.provider).key());
        }
      }
      _ => {}
    }
  }
}

/// The dependency node keys an expression pulls in, in the scope of the
/// module instance at `path`.
pub fn expr_dep_keys(config: &Config, path: &ModulePath, expr: &Expr) -> Vec<String> {
  let Some(module) = config.module(path) else {
    return Vec::new();
  };
  expr
    .references()
    .into_iter()
    .flat_map(|reference| reference_dep_keys(module, path, reference))
    .collect()
}

fn reference_dep_keys(module: &Module, path: &ModulePath, reference: &Reference) -> Vec<String> {
  match reference {
    Reference::Var(name) => vec![Node::Variable {
      module: path.clone(),
      name: name.clone(),
    }
    .key()],
    Reference::Local(name) => vec![Node::Local {
      module: path.clone(),
      name: name.clone(),
    }
    .key()],
    Reference::Resource {
      mode,
      type_name,
      name,
    } => vec![Node::ConfigResource(ResourceAddr {
      module: path.clone(),
      mode: *mode,
      type_name: type_name.clone(),
      name: name.clone(),
    })
    .key()],
    Reference::ModuleCall(name) => module_ref_dep_keys(module, path, name),
    _ => Vec::new(),
  }
}

/// What a `module.<name>` reference depends on: the child's output nodes for
/// statically-inlined calls, or the call node itself when the child expands
/// dynamically (fan-in then covers the child's nodes).
fn module_ref_dep_keys(module: &Module, path: &ModulePath, name: &str) -> Vec<String> {
  let call_key = Node::ModuleCall {
    module: path.clone(),
    name: name.to_string(),
  }
  .key();
  let Some(call) = module.module_calls.get(name) else {
    return vec![call_key];
  };
  if call.for_each.is_some() || call.count.is_some() || call.module.outputs.is_empty() {
    return vec![call_key];
  }
  let child_path = path.child(name);
  call
    .module
    .outputs
    .values()
    .map(|o| {
      Node::Output {
        module: child_path.clone(),
        name: o.name.clone(),
      }
      .key()
    })
    .collect()
}

fn collect_provider_addrs(config: &Config, module: &Module, out: &mut Vec<ProviderConfigAddr>) {
  for provider in module.providers.values() {
    out.push(provider.addr());
  }
  for resource in module.resources.values() {
    out.push(config.resolve_provider(&module.path, resource));
  }
  for call in module.module_calls.values() {
    collect_provider_addrs(config, &call.module, out);
  }
}

/// Finds the provider block declaring a binding, searching the module tree.
pub fn find_provider_block<'a>(
  config: &'a Config,
  addr: &ProviderConfigAddr,
) -> Option<(ModulePath, &'a gantry_core::config::ProviderConfig)> {
  fn search<'a>(
    module: &'a Module,
    addr: &ProviderConfigAddr,
  ) -> Option<(ModulePath, &'a gantry_core::config::ProviderConfig)> {
    for pc in module.providers.values() {
      if pc.addr() == *addr {
        return Some((module.path.clone(), pc));
      }
    }
    for call in module.module_calls.values() {
      if let Some(found) = search(&call.module, addr) {
        return Some(found);
      }
    }
    None
  }
  search(&config.root, addr)
}
