//! The post-parse expression tree.
//!
//! Expressions arrive from the external parser already desugared; the core
//! only needs two things from them: the set of references they contain (for
//! dependency edges) and evaluability against a scope (the evaluator lives
//! in the engine crate). Everything else about the surface syntax is gone by
//! the time an `Expr` exists.

use std::fmt;

use crate::addr::ResourceMode;
use crate::diags::SrcRange;
use crate::value::Value;

/// A name an expression refers to, resolved against the scope of the module
/// the expression appears in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
  /// `var.<name>`
  Var(String),
  /// `local.<name>`
  Local(String),
  /// `<type>.<name>` or `data.<type>.<name>`
  Resource {
    mode: ResourceMode,
    type_name: String,
    name: String,
  },
  /// `module.<name>` (outputs are reached via attribute access)
  ModuleCall(String),
  /// `path.root`
  PathRoot,
  /// `path.module`
  PathModule,
  /// `path.cwd`
  PathCwd,
  /// `terraform.workspace`
  Workspace,
  /// `count.index` inside a counted resource body
  CountIndex,
  /// `each.key` inside a for_each resource body
  EachKey,
  /// `each.value` inside a for_each resource body
  EachValue,
}

impl fmt::Display for Reference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Reference::Var(name) => write!(f, "var.{}", name),
      Reference::Local(name) => write!(f, "local.{}", name),
      Reference::Resource {
        mode,
        type_name,
        name,
      } => {
        if *mode == ResourceMode::Data {
          write!(f, "data.")?;
        }
        write!(f, "{}.{}", type_name, name)
      }
      Reference::ModuleCall(name) => write!(f, "module.{}", name),
      Reference::PathRoot => write!(f, "path.root"),
      Reference::PathModule => write!(f, "path.module"),
      Reference::PathCwd => write!(f, "path.cwd"),
      Reference::Workspace => write!(f, "terraform.workspace"),
      Reference::CountIndex => write!(f, "count.index"),
      Reference::EachKey => write!(f, "each.key"),
      Reference::EachValue => write!(f, "each.value"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
  Not,
  Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
  Eq,
  NotEq,
  Add,
  Sub,
  Mul,
  Div,
  And,
  Or,
  Lt,
  Le,
  Gt,
  Ge,
}

/// A desugared expression. Opaque to everything but the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Lit(Value),
  Ref(Reference, Option<SrcRange>),
  GetAttr(Box<Expr>, String),
  Index(Box<Expr>, Box<Expr>),
  /// A sequence literal; evaluates to a tuple.
  Seq(Vec<Expr>),
  /// An object literal with statically-known keys.
  Object(Vec<(String, Expr)>),
  /// String interpolation: fragments concatenate left to right.
  Template(Vec<Expr>),
  Unary(UnOp, Box<Expr>),
  Binary(BinOp, Box<Expr>, Box<Expr>),
  Cond(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
  // Shorthand constructors, mainly for tests and IR builders.

  pub fn lit(value: Value) -> Expr {
    Expr::Lit(value)
  }

  pub fn str(s: impl Into<String>) -> Expr {
    Expr::Lit(Value::string(s))
  }

  pub fn int(i: i64) -> Expr {
    Expr::Lit(Value::int(i))
  }

  pub fn bool(b: bool) -> Expr {
    Expr::Lit(Value::bool(b))
  }

  pub fn var(name: impl Into<String>) -> Expr {
    Expr::Ref(Reference::Var(name.into()), None)
  }

  pub fn local(name: impl Into<String>) -> Expr {
    Expr::Ref(Reference::Local(name.into()), None)
  }

  pub fn managed(type_name: impl Into<String>, name: impl Into<String>) -> Expr {
    Expr::Ref(
      Reference::Resource {
        mode: ResourceMode::Managed,
        type_name: type_name.into(),
        name: name.into(),
      },
      None,
    )
  }

  pub fn data(type_name: impl Into<String>, name: impl Into<String>) -> Expr {
    Expr::Ref(
      Reference::Resource {
        mode: ResourceMode::Data,
        type_name: type_name.into(),
        name: name.into(),
      },
      None,
    )
  }

  pub fn module(name: impl Into<String>) -> Expr {
    Expr::Ref(Reference::ModuleCall(name.into()), None)
  }

  pub fn attr(self, name: impl Into<String>) -> Expr {
    Expr::GetAttr(Box::new(self), name.into())
  }

  pub fn index(self, key: Expr) -> Expr {
    Expr::Index(Box::new(self), Box::new(key))
  }

  pub fn object(attrs: impl IntoIterator<Item = (String, Expr)>) -> Expr {
    Expr::Object(attrs.into_iter().collect())
  }

  pub fn with_range(self, range: SrcRange) -> Expr {
    match self {
      Expr::Ref(reference, _) => Expr::Ref(reference, Some(range)),
      other => other,
    }
  }

  /// Every reference mentioned anywhere in this expression, in source order.
  /// Duplicates are preserved; callers dedupe if they care.
  pub fn references(&self) -> Vec<&Reference> {
    let mut out = Vec::new();
    self.collect_references(&mut out);
    out
  }

  fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
    match self {
      Expr::Lit(_) => {}
      Expr::Ref(reference, _) => out.push(reference),
      Expr::GetAttr(base, _) => base.collect_references(out),
      Expr::Index(base, key) => {
        base.collect_references(out);
        key.collect_references(out);
      }
      Expr::Seq(items) | Expr::Template(items) => {
        for item in items {
          item.collect_references(out);
        }
      }
      Expr::Object(attrs) => {
        for (_, value) in attrs {
          value.collect_references(out);
        }
      }
      Expr::Unary(_, operand) => operand.collect_references(out),
      Expr::Binary(_, left, right) => {
        left.collect_references(out);
        right.collect_references(out);
      }
      Expr::Cond(cond, then, otherwise) => {
        cond.collect_references(out);
        then.collect_references(out);
        otherwise.collect_references(out);
      }
    }
  }

  /// The source range of the first ranged node in this expression, used to
  /// position diagnostics when the failing sub-expression carries none.
  pub fn range(&self) -> Option<&SrcRange> {
    match self {
      Expr::Ref(_, range) => range.as_ref(),
      Expr::Lit(_) => None,
      Expr::GetAttr(base, _) => base.range(),
      Expr::Index(base, key) => base.range().or_else(|| key.range()),
      Expr::Seq(items) | Expr::Template(items) => items.iter().find_map(Expr::range),
      Expr::Object(attrs) => attrs.iter().find_map(|(_, e)| e.range()),
      Expr::Unary(_, operand) => operand.range(),
      Expr::Binary(_, left, right) => left.range().or_else(|| right.range()),
      Expr::Cond(cond, then, otherwise) => {
        cond.range().or_else(|| then.range()).or_else(|| otherwise.range())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn references_collects_in_order() {
    // "${var.a}-${local.b}" == null_resource.c.id
    let expr = Expr::Binary(
      BinOp::Eq,
      Box::new(Expr::Template(vec![Expr::var("a"), Expr::str("-"), Expr::local("b")])),
      Box::new(Expr::managed("null_resource", "c").attr("id")),
    );
    let refs: Vec<String> = expr.references().iter().map(|r| r.to_string()).collect();
    assert_eq!(refs, vec!["var.a", "local.b", "null_resource.c"]);
  }

  #[test]
  fn data_reference_renders_with_prefix() {
    let expr = Expr::data("dns_record", "www");
    assert_eq!(expr.references()[0].to_string(), "data.dns_record.www");
  }

  #[test]
  fn range_finds_first_ranged_node() {
    let range = SrcRange::new("main.gt", (7, 3), (7, 9));
    let expr = Expr::Seq(vec![Expr::int(1), Expr::var("n").with_range(range.clone())]);
    assert_eq!(expr.range(), Some(&range));
  }
}
