//! The zip-framed plan container.
//!
//! A saved plan carries everything an apply needs to run exactly what was
//! reviewed: the change records (values as wire envelopes, marks intact),
//! the prior state document, the captured variable values, the provider
//! requirements, and optionally a raw configuration snapshot. A plan is
//! valid only against the exact state serial/lineage and configuration
//! hash it recorded.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use gantry_core::addr::{InstanceAddr, ProviderConfigAddr};
use gantry_core::value::wire::{self, WireEnvelope, WireError};
use gantry_core::value::{AttrPath, Value};
use gantry_state::StateFile;

use crate::plan::{Action, ChangeReason, DeferredResource, OutputChange, Plan, ResourceChange};

const ENTRY_PLAN: &str = "plan.json";
const ENTRY_STATE: &str = "prior-state.json";
const ENTRY_SNAPSHOT: &str = "config-snapshot.bin";
const ENTRY_PROVIDERS: &str = "provider-requirements.json";

#[derive(Debug, Error)]
pub enum PlanFileError {
  #[error("plan file I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("plan file archive error: {0}")]
  Zip(#[from] zip::result::ZipError),

  #[error("plan file JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("plan file value error: {0}")]
  Wire(#[from] WireError),

  #[error("plan file is missing entry {0:?}")]
  MissingEntry(&'static str),

  #[error("malformed address {0:?} in plan file")]
  Address(String),

  #[error("plan was created against state serial {expected}, found {actual}")]
  SerialMismatch { expected: u64, actual: u64 },

  #[error("plan was created against a different state lineage")]
  LineageMismatch,

  #[error("plan was created against a different configuration")]
  ConfigMismatch,
}

#[derive(Serialize, Deserialize)]
struct ChangeRecord {
  addr: String,
  provider: String,
  action: Action,
  prior: Option<WireEnvelope>,
  planned: Option<WireEnvelope>,
  requires_replace: Vec<AttrPath>,
  reason: Option<ChangeReason>,
  importing: Option<String>,
  private: Option<Vec<u8>>,
  create_before_destroy: bool,
}

#[derive(Serialize, Deserialize)]
struct OutputRecord {
  name: String,
  value: WireEnvelope,
  sensitive: bool,
}

#[derive(Serialize, Deserialize)]
struct PlanRecord {
  base_serial: u64,
  base_lineage: String,
  config_hash: String,
  changes: Vec<ChangeRecord>,
  output_changes: Vec<OutputRecord>,
  variables: BTreeMap<String, WireEnvelope>,
  deferred: Vec<(String, String)>,
  complete: bool,
}

/// A fully-loaded plan file.
#[derive(Debug)]
pub struct PlanFile {
  pub plan: Plan,
  pub prior: StateFile,
  pub config_snapshot: Option<Vec<u8>>,
  /// (provider source address, version constraint)
  pub provider_requirements: Vec<(String, Option<String>)>,
}

impl PlanFile {
  /// Checks this plan against the state and configuration an apply is
  /// about to use.
  pub fn verify(&self, state: &StateFile, config_hash: &str) -> Result<(), PlanFileError> {
    if state.serial != self.plan.base_serial {
      return Err(PlanFileError::SerialMismatch {
        expected: self.plan.base_serial,
        actual: state.serial,
      });
    }
    if state.lineage != self.plan.base_lineage {
      return Err(PlanFileError::LineageMismatch);
    }
    if config_hash != self.plan.config_hash {
      return Err(PlanFileError::ConfigMismatch);
    }
    Ok(())
  }
}

fn encode_value(value: &Value) -> Result<WireEnvelope, PlanFileError> {
  Ok(wire::encode(value)?)
}

fn decode_value(envelope: &WireEnvelope) -> Result<Value, PlanFileError> {
  Ok(wire::decode(envelope)?)
}

/// Serializes a plan with its companions into a zip-framed byte vector.
pub fn to_bytes(
  plan: &Plan,
  prior: &StateFile,
  config_snapshot: Option<&[u8]>,
  provider_requirements: &[(String, Option<String>)],
) -> Result<Vec<u8>, PlanFileError> {
  let record = PlanRecord {
    base_serial: plan.base_serial,
    base_lineage: plan.base_lineage.clone(),
    config_hash: plan.config_hash.clone(),
    changes: plan
      .changes
      .iter()
      .map(|change| {
        Ok(ChangeRecord {
          addr: change.addr.to_string(),
          provider: change.provider.to_string(),
          action: change.action,
          prior: change.prior.as_ref().map(encode_value).transpose()?,
          planned: change.planned.as_ref().map(encode_value).transpose()?,
          requires_replace: change.requires_replace.clone(),
          reason: change.reason,
          importing: change.importing.clone(),
          private: change.private.clone(),
          create_before_destroy: change.create_before_destroy,
        })
      })
      .collect::<Result<_, PlanFileError>>()?,
    output_changes: plan
      .output_changes
      .iter()
      .map(|output| {
        Ok(OutputRecord {
          name: output.name.clone(),
          value: encode_value(&output.value)?,
          sensitive: output.sensitive,
        })
      })
      .collect::<Result<_, PlanFileError>>()?,
    variables: plan
      .variables
      .iter()
      .map(|(name, value)| Ok((name.clone(), encode_value(value)?)))
      .collect::<Result<_, PlanFileError>>()?,
    deferred: plan
      .deferred
      .iter()
      .map(|d| (d.addr.clone(), d.input.clone()))
      .collect(),
    complete: plan.complete,
  };

  let mut buffer = Cursor::new(Vec::new());
  {
    let mut writer = ZipWriter::new(&mut buffer);
    let options = FileOptions::default();

    writer.start_file(ENTRY_PLAN, options)?;
    writer.write_all(&serde_json::to_vec_pretty(&record)?)?;

    writer.start_file(ENTRY_STATE, options)?;
    writer.write_all(&prior.to_json()?)?;

    writer.start_file(ENTRY_PROVIDERS, options)?;
    writer.write_all(&serde_json::to_vec_pretty(provider_requirements)?)?;

    if let Some(snapshot) = config_snapshot {
      writer.start_file(ENTRY_SNAPSHOT, options)?;
      writer.write_all(snapshot)?;
    }

    writer.finish()?;
  }
  Ok(buffer.into_inner())
}

/// Loads a plan file from bytes.
pub fn from_bytes(bytes: &[u8]) -> Result<PlanFile, PlanFileError> {
  let mut archive = ZipArchive::new(Cursor::new(bytes))?;

  let record: PlanRecord = {
    let mut entry = archive
      .by_name(ENTRY_PLAN)
      .map_err(|_| PlanFileError::MissingEntry(ENTRY_PLAN))?;
    let mut content = Vec::new();
    entry.read_to_end(&mut content)?;
    serde_json::from_slice(&content)?
  };

  let prior: StateFile = {
    let mut entry = archive
      .by_name(ENTRY_STATE)
      .map_err(|_| PlanFileError::MissingEntry(ENTRY_STATE))?;
    let mut content = Vec::new();
    entry.read_to_end(&mut content)?;
    StateFile::from_json(&content)?
  };

  let provider_requirements: Vec<(String, Option<String>)> = {
    let mut entry = archive
      .by_name(ENTRY_PROVIDERS)
      .map_err(|_| PlanFileError::MissingEntry(ENTRY_PROVIDERS))?;
    let mut content = Vec::new();
    entry.read_to_end(&mut content)?;
    serde_json::from_slice(&content)?
  };

  let config_snapshot = match archive.by_name(ENTRY_SNAPSHOT) {
    Ok(mut entry) => {
      let mut content = Vec::new();
      entry.read_to_end(&mut content)?;
      Some(content)
    }
    Err(_) => None,
  };

  let changes = record
    .changes
    .into_iter()
    .map(|change| {
      Ok(ResourceChange {
        addr: InstanceAddr::parse(&change.addr).map_err(|_| PlanFileError::Address(change.addr.clone()))?,
        provider: ProviderConfigAddr::parse(&change.provider)
          .map_err(|_| PlanFileError::Address(change.provider.clone()))?,
        action: change.action,
        prior: change.prior.as_ref().map(decode_value).transpose()?,
        planned: change.planned.as_ref().map(decode_value).transpose()?,
        requires_replace: change.requires_replace,
        reason: change.reason,
        importing: change.importing,
        private: change.private,
        create_before_destroy: change.create_before_destroy,
      })
    })
    .collect::<Result<_, PlanFileError>>()?;

  let output_changes = record
    .output_changes
    .into_iter()
    .map(|output| {
      Ok(OutputChange {
        name: output.name,
        value: decode_value(&output.value)?,
        sensitive: output.sensitive,
      })
    })
    .collect::<Result<_, PlanFileError>>()?;

  let variables = record
    .variables
    .into_iter()
    .map(|(name, envelope)| Ok((name, decode_value(&envelope)?)))
    .collect::<Result<BTreeMap<_, _>, PlanFileError>>()?;

  Ok(PlanFile {
    plan: Plan {
      base_serial: record.base_serial,
      base_lineage: record.base_lineage,
      config_hash: record.config_hash,
      changes,
      output_changes,
      variables,
      deferred: record
        .deferred
        .into_iter()
        .map(|(addr, input)| DeferredResource { addr, input })
        .collect(),
      complete: record.complete,
    },
    prior,
    config_snapshot,
    provider_requirements,
  })
}
