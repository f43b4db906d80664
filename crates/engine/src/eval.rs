//! Expression evaluation against the walk scope.
//!
//! The scope is append-only: each graph node publishes its result exactly
//! once, and readers are ordered after writers by graph edges, so lookups
//! here never block. A name that is declared but not yet computed (a
//! resource deferred behind an unknown expansion, an instance still being
//! planned) evaluates to unknown of the best type available. Evaluation is
//! pure; failures surface as diagnostics carrying the expression's source
//! range.

use parking_lot::RwLock;
use std::collections::HashMap;

use gantry_core::addr::{InstanceAddr, InstanceKey, ModulePath, ResourceAddr};
use gantry_core::diags::Diagnostic;
use gantry_core::expr::{BinOp, Expr, Reference, UnOp};
use gantry_core::value::{ArithOp, CmpOp, Marks, Ty, Value};

/// How a resource or module call expanded.
#[derive(Debug, Clone, PartialEq)]
pub enum Expansion {
  /// No count/for_each: exactly one instance with no key.
  Single,
  Count(u64),
  Keys(Vec<String>),
  /// count/for_each not yet known; everything reads as unknown.
  Deferred,
}

impl Expansion {
  /// The instance keys this expansion produces.
  pub fn keys(&self) -> Vec<Option<InstanceKey>> {
    match self {
      Expansion::Single => vec![None],
      Expansion::Count(n) => (0..*n).map(|i| Some(InstanceKey::Index(i))).collect(),
      Expansion::Keys(keys) => keys.iter().map(|k| Some(InstanceKey::Str(k.clone()))).collect(),
      Expansion::Deferred => Vec::new(),
    }
  }
}

#[derive(Default)]
struct ScopeData {
  variables: HashMap<String, Value>,
  locals: HashMap<String, Value>,
  outputs: HashMap<String, Value>,
  /// Arguments a ModuleCall published for a child module instance, keyed by
  /// `<child path>|<variable name>`.
  module_args: HashMap<String, Value>,
  resource_expansions: HashMap<String, Expansion>,
  resource_instances: HashMap<String, Value>,
  module_expansions: HashMap<String, Expansion>,
}

/// The append-only evaluation environment of one walk.
pub struct Scope {
  workspace: String,
  data: RwLock<ScopeData>,
}

impl Scope {
  pub fn new(workspace: impl Into<String>) -> Self {
    Scope {
      workspace: workspace.into(),
      data: RwLock::new(ScopeData::default()),
    }
  }

  pub fn workspace(&self) -> &str {
    &self.workspace
  }

  fn named_key(module: &ModulePath, name: &str) -> String {
    format!("{}|{}", module, name)
  }

  pub fn publish_variable(&self, module: &ModulePath, name: &str, value: Value) {
    self.data.write().variables.insert(Self::named_key(module, name), value);
  }

  pub fn publish_local(&self, module: &ModulePath, name: &str, value: Value) {
    self.data.write().locals.insert(Self::named_key(module, name), value);
  }

  pub fn publish_output(&self, module: &ModulePath, name: &str, value: Value) {
    self.data.write().outputs.insert(Self::named_key(module, name), value);
  }

  pub fn publish_module_arg(&self, child: &ModulePath, name: &str, value: Value) {
    self.data.write().module_args.insert(Self::named_key(child, name), value);
  }

  pub fn module_arg(&self, child: &ModulePath, name: &str) -> Option<Value> {
    self.data.read().module_args.get(&Self::named_key(child, name)).cloned()
  }

  pub fn register_resource_expansion(&self, addr: &ResourceAddr, expansion: Expansion) {
    self
      .data
      .write()
      .resource_expansions
      .insert(addr.to_string(), expansion);
  }

  pub fn publish_resource_instance(&self, addr: &InstanceAddr, value: Value) {
    self
      .data
      .write()
      .resource_instances
      .insert(addr.to_string(), value);
  }

  pub fn register_module_expansion(&self, call_key: &str, expansion: Expansion) {
    self
      .data
      .write()
      .module_expansions
      .insert(call_key.to_string(), expansion);
  }

  pub fn module_expansion(&self, call_key: &str) -> Option<Expansion> {
    self.data.read().module_expansions.get(call_key).cloned()
  }

  pub fn resource_instance(&self, addr: &InstanceAddr) -> Option<Value> {
    self.data.read().resource_instances.get(&addr.to_string()).cloned()
  }

  /// The value of a whole resource block: the instance value for single
  /// expansion, a tuple for count, an object keyed by string for for_each.
  /// Unknown while deferred or unpublished.
  pub fn resource_value(&self, addr: &ResourceAddr) -> Value {
    let data = self.data.read();
    let Some(expansion) = data.resource_expansions.get(&addr.to_string()) else {
      return Value::unknown(Ty::Dynamic);
    };
    let instance = |key: Option<InstanceKey>| -> Value {
      let inst_addr = addr.instance(key);
      data
        .resource_instances
        .get(&inst_addr.to_string())
        .cloned()
        .unwrap_or_else(|| Value::unknown(Ty::Dynamic))
    };
    match expansion {
      Expansion::Deferred => Value::unknown(Ty::Dynamic),
      Expansion::Single => instance(None),
      Expansion::Count(n) => {
        Value::tuple((0..*n).map(|i| instance(Some(InstanceKey::Index(i)))).collect())
      }
      Expansion::Keys(keys) => Value::object(
        keys
          .iter()
          .map(|k| (k.clone(), instance(Some(InstanceKey::Str(k.clone())))))
          .collect::<Vec<_>>(),
      ),
    }
  }

  fn variable(&self, module: &ModulePath, name: &str) -> Option<Value> {
    self.data.read().variables.get(&Self::named_key(module, name)).cloned()
  }

  fn local(&self, module: &ModulePath, name: &str) -> Option<Value> {
    self.data.read().locals.get(&Self::named_key(module, name)).cloned()
  }

  fn output(&self, module: &ModulePath, name: &str) -> Option<Value> {
    self.data.read().outputs.get(&Self::named_key(module, name)).cloned()
  }
}

/// Per-expression evaluation context: where we are and which iteration
/// symbols are in scope.
#[derive(Clone)]
pub struct EvalContext<'a> {
  pub scope: &'a Scope,
  /// The module instance path (keys included) expressions resolve in.
  pub module: ModulePath,
  pub count_index: Option<u64>,
  pub each: Option<(Value, Value)>,
}

impl<'a> EvalContext<'a> {
  pub fn new(scope: &'a Scope, module: ModulePath) -> Self {
    EvalContext {
      scope,
      module,
      count_index: None,
      each: None,
    }
  }

  pub fn with_count_index(mut self, index: u64) -> Self {
    self.count_index = Some(index);
    self
  }

  pub fn with_each(mut self, key: Value, value: Value) -> Self {
    self.each = Some((key, value));
    self
  }
}

fn diag(expr: &Expr, summary: &str, detail: String) -> Diagnostic {
  let mut d = Diagnostic::error(summary).with_detail(detail);
  if let Some(range) = expr.range() {
    d = d.with_range(range.clone());
  }
  d
}

/// Evaluates one expression. Unknown operands absorb; marks propagate; any
/// failure is a positioned diagnostic.
pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value, Diagnostic> {
  match expr {
    Expr::Lit(value) => Ok(value.clone()),
    Expr::Ref(reference, _) => evaluate_reference(expr, reference, ctx),
    Expr::GetAttr(base, name) => {
      let base_value = evaluate(base, ctx)?;
      base_value
        .get_attr(name)
        .map_err(|e| diag(expr, "invalid attribute access", e.to_string()))
    }
    Expr::Index(base, key) => {
      let base_value = evaluate(base, ctx)?;
      let key_value = evaluate(key, ctx)?;
      base_value
        .index(&key_value)
        .map_err(|e| diag(expr, "invalid index", e.to_string()))
    }
    Expr::Seq(items) => {
      let values = items.iter().map(|e| evaluate(e, ctx)).collect::<Result<Vec<_>, _>>()?;
      Ok(Value::tuple(values))
    }
    Expr::Object(attrs) => {
      let mut out = Vec::with_capacity(attrs.len());
      for (name, value_expr) in attrs {
        out.push((name.clone(), evaluate(value_expr, ctx)?));
      }
      Ok(Value::object(out))
    }
    Expr::Template(parts) => {
      let values = parts.iter().map(|e| evaluate(e, ctx)).collect::<Result<Vec<_>, _>>()?;
      let mut marks = Marks::none();
      for v in &values {
        marks.absorb(&v.aggregate_marks());
      }
      if values.iter().any(Value::is_unknown) {
        return Ok(Value::unknown(Ty::String).with_marks(marks));
      }
      let mut rendered = String::new();
      for v in &values {
        rendered.push_str(
          &v.template_fragment()
            .map_err(|e| diag(expr, "invalid template interpolation", e.to_string()))?,
        );
      }
      Ok(Value::string(rendered).with_marks(marks))
    }
    Expr::Unary(op, operand) => {
      let value = evaluate(operand, ctx)?;
      match op {
        UnOp::Not => value.not().map_err(|e| diag(expr, "invalid operand", e.to_string())),
        UnOp::Neg => Value::int(0)
          .arith(&value, ArithOp::Sub)
          .map_err(|e| diag(expr, "invalid operand", e.to_string())),
      }
    }
    Expr::Binary(op, left, right) => {
      let lhs = evaluate(left, ctx)?;
      let rhs = evaluate(right, ctx)?;
      let result = match op {
        BinOp::Eq => Ok(lhs.equal(&rhs)),
        BinOp::NotEq => lhs.equal(&rhs).not(),
        BinOp::Add => lhs.arith(&rhs, ArithOp::Add),
        BinOp::Sub => lhs.arith(&rhs, ArithOp::Sub),
        BinOp::Mul => lhs.arith(&rhs, ArithOp::Mul),
        BinOp::Div => lhs.arith(&rhs, ArithOp::Div),
        BinOp::And => lhs.logical(&rhs, true),
        BinOp::Or => lhs.logical(&rhs, false),
        BinOp::Lt => lhs.compare(&rhs, CmpOp::Lt),
        BinOp::Le => lhs.compare(&rhs, CmpOp::Le),
        BinOp::Gt => lhs.compare(&rhs, CmpOp::Gt),
        BinOp::Ge => lhs.compare(&rhs, CmpOp::Ge),
      };
      result.map_err(|e| diag(expr, "invalid operation", e.to_string()))
    }
    Expr::Cond(cond, then, otherwise) => {
      let cond_value = evaluate(cond, ctx)?;
      if cond_value.is_unknown() {
        let then_value = evaluate(then, ctx)?;
        let else_value = evaluate(otherwise, ctx)?;
        let ty = then_value.ty().unify(&else_value.ty()).unwrap_or(Ty::Dynamic);
        let marks = cond_value
          .aggregate_marks()
          .union(&then_value.aggregate_marks())
          .union(&else_value.aggregate_marks());
        return Ok(Value::unknown(ty).with_marks(marks));
      }
      let marks = cond_value.aggregate_marks();
      match cond_value.as_bool() {
        Some(true) => Ok(evaluate(then, ctx)?.with_marks(marks)),
        Some(false) => Ok(evaluate(otherwise, ctx)?.with_marks(marks)),
        None => Err(diag(
          expr,
          "invalid condition",
          format!("condition must be bool, got {}", cond_value.ty()),
        )),
      }
    }
  }
}

fn evaluate_reference(
  expr: &Expr,
  reference: &Reference,
  ctx: &EvalContext<'_>,
) -> Result<Value, Diagnostic> {
  match reference {
    Reference::Var(name) => Ok(
      ctx
        .scope
        .variable(&ctx.module, name)
        .unwrap_or_else(|| Value::unknown(Ty::Dynamic)),
    ),
    Reference::Local(name) => Ok(
      ctx
        .scope
        .local(&ctx.module, name)
        .unwrap_or_else(|| Value::unknown(Ty::Dynamic)),
    ),
    Reference::Resource {
      mode,
      type_name,
      name,
    } => {
      let addr = ResourceAddr {
        module: ctx.module.clone(),
        mode: *mode,
        type_name: type_name.clone(),
        name: name.clone(),
      };
      Ok(ctx.scope.resource_value(&addr))
    }
    Reference::ModuleCall(name) => Ok(module_value(ctx, name)),
    Reference::PathRoot | Reference::PathCwd => Ok(Value::string(".")),
    Reference::PathModule => {
      if ctx.module.is_root() {
        Ok(Value::string("."))
      } else {
        Ok(Value::string(format!("./{}", ctx.module)))
      }
    }
    Reference::Workspace => Ok(Value::string(ctx.scope.workspace())),
    Reference::CountIndex => match ctx.count_index {
      Some(index) => Ok(Value::int(index as i64)),
      None => Err(diag(
        expr,
        "count.index outside counted resource",
        "count.index is only available inside a resource with count set".to_string(),
      )),
    },
    Reference::EachKey => match &ctx.each {
      Some((key, _)) => Ok(key.clone()),
      None => Err(diag(
        expr,
        "each.key outside for_each resource",
        "each values are only available inside a resource with for_each set".to_string(),
      )),
    },
    Reference::EachValue => match &ctx.each {
      Some((_, value)) => Ok(value.clone()),
      None => Err(diag(
        expr,
        "each.value outside for_each resource",
        "each values are only available inside a resource with for_each set".to_string(),
      )),
    },
  }
}

/// The value of `module.<name>`: an object of the child's outputs, or a map
/// of such objects for keyed expansion, unknown while unpublished.
fn module_value(ctx: &EvalContext<'_>, name: &str) -> Value {
  let call_key = if ctx.module.is_root() {
    format!("module.{}", name)
  } else {
    format!("{}.module.{}", ctx.module, name)
  };
  let Some(expansion) = ctx.scope.module_expansion(&call_key) else {
    return Value::unknown(Ty::Dynamic);
  };

  let outputs_of = |path: &ModulePath| -> Value {
    let data = ctx.scope.data.read();
    let prefix = format!("{}|", path);
    let attrs: Vec<(String, Value)> = data
      .outputs
      .iter()
      .filter(|(k, _)| k.starts_with(&prefix))
      .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
      .collect();
    Value::object(attrs)
  };

  match expansion {
    Expansion::Deferred => Value::unknown(Ty::Dynamic),
    Expansion::Single => outputs_of(&ctx.module.child(name)),
    Expansion::Count(n) => Value::tuple(
      (0..n)
        .map(|i| outputs_of(&ctx.module.child_keyed(name, Some(InstanceKey::Index(i)))))
        .collect(),
    ),
    Expansion::Keys(keys) => Value::object(
      keys
        .iter()
        .map(|k| {
          (
            k.clone(),
            outputs_of(&ctx.module.child_keyed(name, Some(InstanceKey::Str(k.clone())))),
          )
        })
        .collect::<Vec<_>>(),
    ),
  }
}

/// Instance keys from an evaluated `for_each` collection: map/object keys
/// or set-of-string elements, in deterministic order.
pub fn for_each_keys(value: &Value) -> Result<Vec<String>, String> {
  use gantry_core::value::ValueKind;
  match value.kind() {
    ValueKind::Map(_, entries) => Ok(entries.keys().cloned().collect()),
    ValueKind::Object(attrs) => Ok(attrs.keys().cloned().collect()),
    ValueKind::Set(_, items) => {
      let mut keys = Vec::with_capacity(items.len());
      for item in items {
        match item.as_str() {
          Some(s) => keys.push(s.to_string()),
          None => return Err(format!("for_each set elements must be strings, got {}", item.ty())),
        }
      }
      keys.sort();
      Ok(keys)
    }
    _ => Err(format!(
      "for_each requires a map or set of strings, got {}",
      value.ty()
    )),
  }
}

/// The element value for one for_each key.
pub fn for_each_value(value: &Value, key: &str) -> Value {
  value
    .index(&Value::string(key))
    .unwrap_or_else(|_| Value::bool(true))
}

#[cfg(test)]
mod tests {
  use super::*;
  use gantry_core::addr::ResourceMode;

  fn ctx(scope: &Scope) -> EvalContext<'_> {
    EvalContext::new(scope, ModulePath::root())
  }

  #[test]
  fn resolution_order_local_then_var() {
    let scope = Scope::new("default");
    scope.publish_variable(&ModulePath::root(), "n", Value::int(1));
    scope.publish_local(&ModulePath::root(), "n", Value::int(2));

    let ctx = ctx(&scope);
    assert_eq!(evaluate(&Expr::var("n"), &ctx).unwrap().as_u64(), Some(1));
    assert_eq!(evaluate(&Expr::local("n"), &ctx).unwrap().as_u64(), Some(2));
  }

  #[test]
  fn unpublished_names_evaluate_unknown() {
    let scope = Scope::new("default");
    let ctx = ctx(&scope);
    assert!(evaluate(&Expr::var("missing"), &ctx).unwrap().is_unknown());
    assert!(evaluate(&Expr::managed("null_resource", "x").attr("id"), &ctx)
      .unwrap()
      .is_unknown());
  }

  #[test]
  fn resource_value_by_expansion() {
    let scope = Scope::new("default");
    let addr = ResourceAddr {
      module: ModulePath::root(),
      mode: ResourceMode::Managed,
      type_name: "null_resource".into(),
      name: "x".into(),
    };
    scope.register_resource_expansion(&addr, Expansion::Count(2));
    scope.publish_resource_instance(
      &addr.instance(Some(InstanceKey::Index(0))),
      Value::object([("id".to_string(), Value::string("a"))]),
    );
    scope.publish_resource_instance(
      &addr.instance(Some(InstanceKey::Index(1))),
      Value::object([("id".to_string(), Value::string("b"))]),
    );

    let ctx = ctx(&scope);
    let expr = Expr::managed("null_resource", "x").index(Expr::int(1)).attr("id");
    assert_eq!(evaluate(&expr, &ctx).unwrap().as_str(), Some("b"));
  }

  #[test]
  fn template_concatenates_and_absorbs_unknown() {
    let scope = Scope::new("default");
    scope.publish_variable(&ModulePath::root(), "env", Value::string("prod"));
    let ctx = ctx(&scope);

    let expr = Expr::Template(vec![Expr::str("app-"), Expr::var("env")]);
    assert_eq!(evaluate(&expr, &ctx).unwrap().as_str(), Some("app-prod"));

    let unknown = Expr::Template(vec![Expr::str("app-"), Expr::var("missing")]);
    let got = evaluate(&unknown, &ctx).unwrap();
    assert!(got.is_unknown());
    assert_eq!(got.ty(), Ty::String);
  }

  #[test]
  fn sensitive_variable_taints_template() {
    let scope = Scope::new("default");
    scope.publish_variable(&ModulePath::root(), "pw", Value::string("hunter2").mark_sensitive());
    let ctx = ctx(&scope);
    let expr = Expr::Template(vec![Expr::str("pw="), Expr::var("pw")]);
    let got = evaluate(&expr, &ctx).unwrap();
    assert!(got.marks().is_sensitive());
  }

  #[test]
  fn conditional_with_unknown_condition() {
    let scope = Scope::new("default");
    let ctx = ctx(&scope);
    let expr = Expr::Cond(
      Box::new(Expr::var("missing")),
      Box::new(Expr::str("a")),
      Box::new(Expr::str("b")),
    );
    let got = evaluate(&expr, &ctx).unwrap();
    assert!(got.is_unknown());
    assert_eq!(got.ty(), Ty::String);
  }

  #[test]
  fn count_index_and_each() {
    let scope = Scope::new("default");
    let base = EvalContext::new(&scope, ModulePath::root());

    let counted = base.clone().with_count_index(3);
    assert_eq!(
      evaluate(&Expr::Ref(Reference::CountIndex, None), &counted).unwrap().as_u64(),
      Some(3)
    );

    let each = base
      .clone()
      .with_each(Value::string("k"), Value::int(9));
    assert_eq!(
      evaluate(&Expr::Ref(Reference::EachKey, None), &each).unwrap().as_str(),
      Some("k")
    );
    assert_eq!(
      evaluate(&Expr::Ref(Reference::EachValue, None), &each).unwrap().as_u64(),
      Some(9)
    );

    // Outside an iteration context they are errors.
    assert!(evaluate(&Expr::Ref(Reference::CountIndex, None), &base).is_err());
  }

  #[test]
  fn workspace_reference() {
    let scope = Scope::new("staging");
    let got = evaluate(&Expr::Ref(Reference::Workspace, None), &ctx(&scope)).unwrap();
    assert_eq!(got.as_str(), Some("staging"));
  }

  #[test]
  fn for_each_keys_from_collections() {
    let map = Value::map(
      Ty::Number,
      [("b".to_string(), Value::int(1)), ("a".to_string(), Value::int(2))].into(),
    );
    assert_eq!(for_each_keys(&map).unwrap(), vec!["a", "b"]);

    let set = Value::set(Ty::String, vec![Value::string("y"), Value::string("x")]);
    assert_eq!(for_each_keys(&set).unwrap(), vec!["x", "y"]);

    assert!(for_each_keys(&Value::int(3)).is_err());
  }
}
