//! The flat diagnostics collection walk results are reported through.
//!
//! Module boundaries use typed `thiserror` enums; anything that ultimately
//! reaches a user flows into a [`Diagnostics`] sequence of (severity,
//! summary, detail, source range, address) records, ordered by insertion.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open source region threaded through from the external parse tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcRange {
  pub file: String,
  pub start_line: u32,
  pub start_col: u32,
  pub end_line: u32,
  pub end_col: u32,
}

impl SrcRange {
  pub fn new(file: impl Into<String>, start: (u32, u32), end: (u32, u32)) -> Self {
    SrcRange {
      file: file.into(),
      start_line: start.0,
      start_col: start.1,
      end_line: end.0,
      end_col: end.1,
    }
  }
}

impl fmt::Display for SrcRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{},{}", self.file, self.start_line, self.start_col)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Warning,
  Error,
}

/// One user-facing finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
  pub severity: Severity,
  pub summary: String,
  pub detail: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub range: Option<SrcRange>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
}

impl Diagnostic {
  pub fn error(summary: impl Into<String>) -> Self {
    Diagnostic {
      severity: Severity::Error,
      summary: summary.into(),
      detail: String::new(),
      range: None,
      address: None,
    }
  }

  pub fn warning(summary: impl Into<String>) -> Self {
    Diagnostic {
      severity: Severity::Warning,
      summary: summary.into(),
      detail: String::new(),
      range: None,
      address: None,
    }
  }

  pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
    self.detail = detail.into();
    self
  }

  pub fn with_range(mut self, range: SrcRange) -> Self {
    self.range = Some(range);
    self
  }

  pub fn with_address(mut self, address: impl fmt::Display) -> Self {
    self.address = Some(address.to_string());
    self
  }
}

impl fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let sev = match self.severity {
      Severity::Warning => "warning",
      Severity::Error => "error",
    };
    write!(f, "{}: {}", sev, self.summary)?;
    if let Some(addr) = &self.address {
      write!(f, " ({})", addr)?;
    }
    if let Some(range) = &self.range {
      write!(f, " at {}", range)?;
    }
    if !self.detail.is_empty() {
      write!(f, "\n  {}", self.detail)?;
    }
    Ok(())
  }
}

/// An ordered sequence of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
  pub fn new() -> Self {
    Diagnostics::default()
  }

  pub fn push(&mut self, diag: Diagnostic) {
    self.0.push(diag);
  }

  pub fn append(&mut self, mut other: Diagnostics) {
    self.0.append(&mut other.0);
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn has_errors(&self) -> bool {
    self.0.iter().any(|d| d.severity == Severity::Error)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
    self.0.iter()
  }

  pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
    self.0.iter().filter(|d| d.severity == Severity::Warning)
  }

  pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
    self.0.iter().filter(|d| d.severity == Severity::Error)
  }
}

impl From<Diagnostic> for Diagnostics {
  fn from(diag: Diagnostic) -> Self {
    Diagnostics(vec![diag])
  }
}

impl IntoIterator for Diagnostics {
  type Item = Diagnostic;
  type IntoIter = std::vec::IntoIter<Diagnostic>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

impl FromIterator<Diagnostic> for Diagnostics {
  fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
    Diagnostics(iter.into_iter().collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn has_errors_ignores_warnings() {
    let mut diags = Diagnostics::new();
    diags.push(Diagnostic::warning("deposed objects present"));
    assert!(!diags.has_errors());
    diags.push(Diagnostic::error("cycle detected"));
    assert!(diags.has_errors());
    assert_eq!(diags.errors().count(), 1);
    assert_eq!(diags.warnings().count(), 1);
  }

  #[test]
  fn display_includes_address_and_range() {
    let diag = Diagnostic::error("invalid reference")
      .with_detail("no such resource")
      .with_address("null_resource.x")
      .with_range(SrcRange::new("main.gt", (3, 1), (3, 10)));
    let text = diag.to_string();
    assert!(text.contains("error: invalid reference"));
    assert!(text.contains("null_resource.x"));
    assert!(text.contains("main.gt:3,1"));
    assert!(text.contains("no such resource"));
  }
}
