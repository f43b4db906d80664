//! The post-parse configuration IR.
//!
//! The external parser desugars surface syntax into this tree; the core
//! takes over from there. What the core enforces about the tree (and nothing
//! more): referential integrity, no duplicate declarations within a module,
//! and that a module's locals admit a topological order among themselves.

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

use crate::addr::{
  InstanceAddr, ModulePath, ProviderAddr, ProviderConfigAddr, ResourceAddr, ResourceMode,
};
use crate::diags::{Diagnostic, Diagnostics};
use crate::expr::{Expr, Reference};
use crate::value::{AttrPath, Ty, Value};

/// An input variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
  pub name: String,
  pub ty: Option<Ty>,
  pub default: Option<Value>,
  pub sensitive: bool,
  pub validations: Vec<Validation>,
}

impl Variable {
  pub fn new(name: impl Into<String>) -> Self {
    Variable {
      name: name.into(),
      ty: None,
      default: None,
      sensitive: false,
      validations: Vec::new(),
    }
  }

  pub fn with_ty(mut self, ty: Ty) -> Self {
    self.ty = Some(ty);
    self
  }

  pub fn with_default(mut self, default: Value) -> Self {
    self.default = Some(default);
    self
  }

  pub fn sensitive(mut self) -> Self {
    self.sensitive = true;
    self
  }
}

/// A `validation` block on a variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
  pub condition: Expr,
  pub error_message: String,
}

/// A `locals` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Local {
  pub name: String,
  pub expr: Expr,
}

/// An output declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
  pub name: String,
  pub expr: Expr,
  pub sensitive: bool,
  pub depends_on: Vec<Reference>,
  pub deprecated: Option<String>,
}

impl Output {
  pub fn new(name: impl Into<String>, expr: Expr) -> Self {
    Output {
      name: name.into(),
      expr,
      sensitive: false,
      depends_on: Vec::new(),
      deprecated: None,
    }
  }

  pub fn sensitive(mut self) -> Self {
    self.sensitive = true;
    self
  }
}

/// A resource's `lifecycle` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lifecycle {
  pub create_before_destroy: bool,
  pub prevent_destroy: bool,
  pub ignore_changes: Vec<AttrPath>,
}

/// Binding from a resource to a provider configuration by local name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRef {
  pub local_name: String,
  pub alias: Option<String>,
}

/// A managed resource or data source block.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
  pub mode: ResourceMode,
  pub type_name: String,
  pub name: String,
  pub provider: Option<ProviderRef>,
  pub count: Option<Expr>,
  pub for_each: Option<Expr>,
  /// The block body as one object expression.
  pub body: Expr,
  pub lifecycle: Lifecycle,
  pub depends_on: Vec<Reference>,
}

impl Resource {
  pub fn managed(type_name: impl Into<String>, name: impl Into<String>, body: Expr) -> Self {
    Resource {
      mode: ResourceMode::Managed,
      type_name: type_name.into(),
      name: name.into(),
      provider: None,
      count: None,
      for_each: None,
      body,
      lifecycle: Lifecycle::default(),
      depends_on: Vec::new(),
    }
  }

  pub fn data(type_name: impl Into<String>, name: impl Into<String>, body: Expr) -> Self {
    Resource {
      mode: ResourceMode::Data,
      ..Resource::managed(type_name, name, body)
    }
  }

  /// The provider local name this resource binds to when no explicit
  /// `provider` argument is given: the type prefix up to the first `_`.
  pub fn provider_local_name(&self) -> &str {
    match &self.provider {
      Some(p) => &p.local_name,
      None => self.type_name.split('_').next().unwrap_or(&self.type_name),
    }
  }

  pub fn provider_alias(&self) -> Option<&str> {
    self.provider.as_ref().and_then(|p| p.alias.as_deref())
  }

  pub fn addr(&self, module: &ModulePath) -> ResourceAddr {
    ResourceAddr {
      module: module.clone(),
      mode: self.mode,
      type_name: self.type_name.clone(),
      name: self.name.clone(),
    }
  }

  fn local_key(&self) -> String {
    local_resource_key(self.mode, &self.type_name, &self.name)
  }
}

fn local_resource_key(mode: ResourceMode, type_name: &str, name: &str) -> String {
  match mode {
    ResourceMode::Managed => format!("{}.{}", type_name, name),
    ResourceMode::Data => format!("data.{}.{}", type_name, name),
  }
}

/// A call to a child module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleCall {
  pub name: String,
  pub source: String,
  pub version: Option<String>,
  pub count: Option<Expr>,
  pub for_each: Option<Expr>,
  pub args: IndexMap<String, Expr>,
  /// The child module, already loaded and desugared by the external loader.
  pub module: Module,
}

/// A provider configuration block.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
  pub local_name: String,
  pub source: ProviderAddr,
  pub alias: Option<String>,
  pub config: Expr,
  pub version_constraint: Option<String>,
}

impl ProviderConfig {
  pub fn new(local_name: impl Into<String>, config: Expr) -> Self {
    let local_name = local_name.into();
    ProviderConfig {
      source: ProviderAddr::default_registry(local_name.clone()),
      local_name,
      alias: None,
      config,
      version_constraint: None,
    }
  }

  pub fn addr(&self) -> ProviderConfigAddr {
    ProviderConfigAddr::new(self.source.clone(), self.alias.clone())
  }

  fn local_key(&self) -> String {
    match &self.alias {
      Some(alias) => format!("{}.{}", self.local_name, alias),
      None => self.local_name.clone(),
    }
  }
}

/// An `import { to, id }` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBlock {
  pub to: InstanceAddr,
  pub id: Expr,
}

/// A `removed { from, destroy }` block. `destroy = false` forgets the object
/// from state without destroying it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedBlock {
  pub from: ResourceAddr,
  pub destroy: bool,
}

/// Duplicate-declaration error from the module builder API.
#[derive(Debug, Error, PartialEq)]
#[error("duplicate {kind} declaration {name:?} in module {module}")]
pub struct DuplicateDecl {
  pub kind: &'static str,
  pub name: String,
  pub module: ModulePath,
}

/// One module of configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
  pub path: ModulePath,
  pub variables: IndexMap<String, Variable>,
  pub locals: IndexMap<String, Local>,
  pub outputs: IndexMap<String, Output>,
  pub resources: IndexMap<String, Resource>,
  pub module_calls: IndexMap<String, ModuleCall>,
  pub providers: IndexMap<String, ProviderConfig>,
  pub imports: Vec<ImportBlock>,
  pub removed: Vec<RemovedBlock>,
}

impl Module {
  pub fn new(path: ModulePath) -> Self {
    Module {
      path,
      variables: IndexMap::new(),
      locals: IndexMap::new(),
      outputs: IndexMap::new(),
      resources: IndexMap::new(),
      module_calls: IndexMap::new(),
      providers: IndexMap::new(),
      imports: Vec::new(),
      removed: Vec::new(),
    }
  }

  pub fn root() -> Self {
    Module::new(ModulePath::root())
  }

  pub fn add_variable(&mut self, variable: Variable) -> Result<(), DuplicateDecl> {
    let name = variable.name.clone();
    if self.variables.insert(name.clone(), variable).is_some() {
      return Err(self.duplicate("variable", name));
    }
    Ok(())
  }

  pub fn add_local(&mut self, local: Local) -> Result<(), DuplicateDecl> {
    let name = local.name.clone();
    if self.locals.insert(name.clone(), local).is_some() {
      return Err(self.duplicate("local", name));
    }
    Ok(())
  }

  pub fn add_output(&mut self, output: Output) -> Result<(), DuplicateDecl> {
    let name = output.name.clone();
    if self.outputs.insert(name.clone(), output).is_some() {
      return Err(self.duplicate("output", name));
    }
    Ok(())
  }

  pub fn add_resource(&mut self, resource: Resource) -> Result<(), DuplicateDecl> {
    let key = resource.local_key();
    if self.resources.insert(key.clone(), resource).is_some() {
      return Err(self.duplicate("resource", key));
    }
    Ok(())
  }

  pub fn add_module_call(&mut self, call: ModuleCall) -> Result<(), DuplicateDecl> {
    let name = call.name.clone();
    if self.module_calls.insert(name.clone(), call).is_some() {
      return Err(self.duplicate("module call", name));
    }
    Ok(())
  }

  pub fn add_provider(&mut self, provider: ProviderConfig) -> Result<(), DuplicateDecl> {
    let key = provider.local_key();
    if self.providers.insert(key.clone(), provider).is_some() {
      return Err(self.duplicate("provider configuration", key));
    }
    Ok(())
  }

  fn duplicate(&self, kind: &'static str, name: String) -> DuplicateDecl {
    DuplicateDecl {
      kind,
      name,
      module: self.path.clone(),
    }
  }

  pub fn resource(&self, mode: ResourceMode, type_name: &str, name: &str) -> Option<&Resource> {
    self.resources.get(&local_resource_key(mode, type_name, name))
  }

  /// The provider configuration a resource binds to within this module, if
  /// one is declared here.
  pub fn provider_config(&self, local_name: &str, alias: Option<&str>) -> Option<&ProviderConfig> {
    let key = match alias {
      Some(alias) => format!("{}.{}", local_name, alias),
      None => local_name.to_string(),
    };
    self.providers.get(&key)
  }
}

/// A whole configuration: the root module and everything reachable from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  pub root: Module,
}

impl Config {
  pub fn new(root: Module) -> Self {
    Config { root }
  }

  /// Finds the module at a static path (instance keys ignored).
  pub fn module(&self, path: &ModulePath) -> Option<&Module> {
    let mut module = &self.root;
    for step in &path.0 {
      module = &module.module_calls.get(&step.name)?.module;
    }
    Some(module)
  }

  /// Resolves the provider configuration a resource binds to, walking up the
  /// module tree the way implicit provider inheritance does. Falls back to a
  /// default (empty-config) address for providers never configured.
  pub fn resolve_provider(&self, module_path: &ModulePath, resource: &Resource) -> ProviderConfigAddr {
    let local_name = resource.provider_local_name();
    let alias = resource.provider_alias();

    let mut path = module_path.clone();
    loop {
      if let Some(module) = self.module(&path) {
        if let Some(pc) = module.provider_config(local_name, alias) {
          return pc.addr();
        }
      }
      match path.parent() {
        Some(parent) => path = parent,
        None => break,
      }
    }
    ProviderConfigAddr::new(
      ProviderAddr::default_registry(local_name),
      alias.map(str::to_string),
    )
  }

  /// Structural integrity of the whole tree: reference resolution, iteration
  /// symbol scoping, locals ordering, variable defaults, module call
  /// arguments. Returns all findings rather than stopping at the first.
  pub fn validate(&self) -> Diagnostics {
    let mut diags = Diagnostics::new();
    self.validate_module(&self.root, &mut diags);
    diags
  }

  fn validate_module(&self, module: &Module, diags: &mut Diagnostics) {
    // Variable defaults must conform to the declared type.
    for variable in module.variables.values() {
      if let (Some(ty), Some(default)) = (&variable.ty, &variable.default) {
        if let Err(err) = default.check_type(ty) {
          diags.push(
            Diagnostic::error(format!("invalid default for variable {:?}", variable.name))
              .with_detail(err.to_string()),
          );
        }
      }
      for validation in &variable.validations {
        self.check_references(module, &validation.condition, IterationScope::NONE, diags);
      }
    }

    // Locals may reference variables and other locals, nothing else, and
    // must admit a topological order among themselves.
    for local in module.locals.values() {
      for reference in local.expr.references() {
        match reference {
          Reference::Var(_) | Reference::Local(_) => {}
          other => diags.push(
            Diagnostic::error(format!("invalid reference in local {:?}", local.name))
              .with_detail(format!("locals may reference variables and locals only, found {}", other)),
          ),
        }
      }
      self.check_references(module, &local.expr, IterationScope::NONE, diags);
    }
    self.check_locals_order(module, diags);

    for output in module.outputs.values() {
      self.check_references(module, &output.expr, IterationScope::NONE, diags);
      for dep in &output.depends_on {
        self.check_reference(module, dep, IterationScope::NONE, None, diags);
      }
    }

    for resource in module.resources.values() {
      let scope = IterationScope::for_resource(resource);
      if let Some(count) = &resource.count {
        self.check_references(module, count, IterationScope::NONE, diags);
      }
      if let Some(for_each) = &resource.for_each {
        self.check_references(module, for_each, IterationScope::NONE, diags);
      }
      if resource.count.is_some() && resource.for_each.is_some() {
        diags.push(
          Diagnostic::error("resource uses both count and for_each")
            .with_address(resource.addr(&module.path)),
        );
      }
      self.check_references(module, &resource.body, scope, diags);
      for dep in &resource.depends_on {
        self.check_reference(module, dep, IterationScope::NONE, None, diags);
      }
    }

    for call in module.module_calls.values() {
      for (arg_name, expr) in &call.args {
        self.check_references(module, expr, IterationScope::NONE, diags);
        if !call.module.variables.contains_key(arg_name) {
          diags.push(Diagnostic::error(format!(
            "module {:?} has no input variable {:?}",
            call.name, arg_name
          )));
        }
      }
      for variable in call.module.variables.values() {
        if variable.default.is_none() && !call.args.contains_key(&variable.name) {
          diags.push(Diagnostic::error(format!(
            "missing required argument {:?} in call to module {:?}",
            variable.name, call.name
          )));
        }
      }
      self.validate_module(&call.module, diags);
    }

    for provider in module.providers.values() {
      self.check_references(module, &provider.config, IterationScope::NONE, diags);
    }
  }

  fn check_references(
    &self,
    module: &Module,
    expr: &Expr,
    scope: IterationScope,
    diags: &mut Diagnostics,
  ) {
    for reference in expr.references() {
      self.check_reference(module, reference, scope, expr.range(), diags);
    }
  }

  fn check_reference(
    &self,
    module: &Module,
    reference: &Reference,
    scope: IterationScope,
    range: Option<&crate::diags::SrcRange>,
    diags: &mut Diagnostics,
  ) {
    let missing: Option<String> = match reference {
      Reference::Var(name) if !module.variables.contains_key(name) => {
        Some(format!("undeclared input variable {:?}", name))
      }
      Reference::Local(name) if !module.locals.contains_key(name) => {
        Some(format!("undeclared local value {:?}", name))
      }
      Reference::Resource {
        mode,
        type_name,
        name,
      } if module.resource(*mode, type_name, name).is_none() => {
        Some(format!(
          "undeclared resource {}",
          local_resource_key(*mode, type_name, name)
        ))
      }
      Reference::ModuleCall(name) if !module.module_calls.contains_key(name) => {
        Some(format!("undeclared module call {:?}", name))
      }
      Reference::CountIndex if !scope.count => {
        Some("count.index is only valid inside a resource with count set".to_string())
      }
      Reference::EachKey | Reference::EachValue if !scope.for_each => {
        Some("each.* is only valid inside a resource with for_each set".to_string())
      }
      _ => None,
    };
    if let Some(detail) = missing {
      let mut diag = Diagnostic::error("reference to undeclared object").with_detail(detail);
      if let Some(range) = range {
        diag = diag.with_range(range.clone());
      }
      if !module.path.is_root() {
        diag = diag.with_address(module.path.clone());
      }
      diags.push(diag);
    }
  }

  /// Locals must form a DAG among themselves. The order itself is computed
  /// again by the graph builder; here it only has to exist.
  fn check_locals_order(&self, module: &Module, diags: &mut Diagnostics) {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = IndexMap::new();
    for name in module.locals.keys() {
      nodes.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for (name, local) in &module.locals {
      for reference in local.expr.references() {
        if let Reference::Local(dep) = reference {
          if let (Some(&from), Some(&to)) = (nodes.get(dep.as_str()), nodes.get(name.as_str())) {
            graph.add_edge(from, to, ());
          }
        }
      }
    }
    if toposort(&graph, None).is_err() {
      let involved: Vec<&str> = module.locals.keys().map(String::as_str).collect();
      diags.push(
        Diagnostic::error("dependency cycle between local values")
          .with_detail(format!("locals involved: {}", involved.join(", "))),
      );
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct IterationScope {
  count: bool,
  for_each: bool,
}

impl IterationScope {
  const NONE: IterationScope = IterationScope {
    count: false,
    for_each: false,
  };

  fn for_resource(resource: &Resource) -> IterationScope {
    IterationScope {
      count: resource.count.is_some(),
      for_each: resource.for_each.is_some(),
    }
  }
}
