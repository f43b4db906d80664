//! gantry-engine: the plan-and-apply core.
//!
//! The engine compiles a validated configuration plus prior state into a
//! dependency graph (`graph`), walks it concurrently to produce a plan
//! (`plan`), and executes that plan against providers while feeding every
//! state mutation through a single writer (`apply`). Expressions are
//! evaluated against an append-only scope (`eval`); the ready-set scheduler
//! both walks share lives in `walk`; `planfile` is the zip-framed container
//! a plan travels in between the two.
//!
//! There is no global state: the broker, the state manager and the
//! diagnostics sink are all passed in explicitly.

pub mod apply;
pub mod eval;
pub mod graph;
pub mod plan;
pub mod planfile;
pub mod walk;

use gantry_core::diags::Diagnostics;

/// Exit status for a plan operation: 0 for success with no changes, 1 for
/// error, 2 for success with pending changes.
pub fn plan_exit_code(plan: Option<&plan::Plan>, diags: &Diagnostics) -> i32 {
  match plan {
    _ if diags.has_errors() => 1,
    None => 1,
    Some(plan) if plan.has_changes() => 2,
    Some(_) => 0,
  }
}

/// Exit status for an apply operation: 0 for success, 1 for any error.
pub fn apply_exit_code(diags: &Diagnostics) -> i32 {
  if diags.has_errors() {
    1
  } else {
    0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use gantry_core::diags::Diagnostic;

  #[test]
  fn exit_codes() {
    let clean = Diagnostics::new();
    let mut failed = Diagnostics::new();
    failed.push(Diagnostic::error("boom"));

    assert_eq!(plan_exit_code(None, &failed), 1);
    assert_eq!(apply_exit_code(&clean), 0);
    assert_eq!(apply_exit_code(&failed), 1);
  }
}
