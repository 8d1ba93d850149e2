mod utils;

#[cfg(test)]
mod tests;

use std::path::Path;

use log::debug;
use saphyr::YamlOwned;
use thiserror::Error;

use crate::core::{
  database::models::DependencyType,
  distributor::DistributionPolicy,
  jobs::{JobRequest, SpaceContents, SpaceRequest},
  parsers::utils::{
    as_i32_sequence, lookup_flag, lookup_i32, lookup_i32_sequence, lookup_optional_i32,
    lookup_optional_str, lookup_sequence, lookup_str, yaml_lookup,
  },
  pipelines::{DraftDependency, DraftStage, PipelineDraft},
};

use utils::load_yaml_from_file;

#[derive(Error, Debug)]
pub enum ParserError {
  #[error("IO Error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("YAML parsing failed: {0}")]
  YamlParseFailed(#[from] saphyr::ScanError),
  #[error("YAML file is empty!")]
  YamlEmpty,
  #[error("Missing Key: {0}")]
  MissingKey(String),
  #[error("Wrong type for value \"{0}\", expected type {1}")]
  WrongType(String, String),
  #[error("Invalid value: {0}")]
  InvalidValue(String),
}

// ============================================================================
// Pipelines
// ============================================================================

fn parse_stage_input(node: &YamlOwned) -> Result<DraftDependency, ParserError> {
  let benchmark = lookup_optional_i32(node, "benchmark")?;
  let stage = lookup_optional_i32(node, "stage")?;
  match (benchmark, stage) {
    (Some(slot), None) => Ok(DraftDependency {
      dependency_type: DependencyType::Benchmark,
      dependency_id: slot,
    }),
    (None, Some(stage)) => Ok(DraftDependency {
      dependency_type: DependencyType::Artifact,
      dependency_id: stage,
    }),
    _ => Err(ParserError::InvalidValue(format!(
      "a stage input needs exactly one of `benchmark` or `stage`, got {:?}",
      node
    ))),
  }
}

fn parse_stage(node: &YamlOwned) -> Result<DraftStage, ParserError> {
  if lookup_flag(node, "noop")? {
    if yaml_lookup(node, "config").is_some() || yaml_lookup(node, "inputs").is_some() {
      return Err(ParserError::InvalidValue(
        "a noop stage cannot have a config or inputs".to_string(),
      ));
    }
    return Ok(DraftStage::default());
  }

  let dependencies = match yaml_lookup(node, "inputs") {
    Some(_) => lookup_sequence(node, "inputs")?
      .iter()
      .map(parse_stage_input)
      .collect::<Result<Vec<_>, _>>()?,
    None => Vec::new(),
  };
  Ok(DraftStage {
    config_id: Some(lookup_i32(node, "config")?),
    is_primary: lookup_flag(node, "primary")?,
    dependencies,
  })
}

/// Reads a pipeline definition. Stages are numbered from 1 in file order. Validation of the
/// dependency graph is left to `pipelines::create_pipeline`.
pub fn parse_pipeline(yaml: &YamlOwned) -> Result<PipelineDraft, ParserError> {
  let stages = lookup_sequence(yaml, "stages")?
    .iter()
    .map(parse_stage)
    .collect::<Result<Vec<_>, _>>()?;
  let draft = PipelineDraft {
    name: lookup_str(yaml, "name")?,
    owner_id: lookup_i32(yaml, "owner")?,
    stages,
  };
  debug!("Parsed pipeline '{}' with {} stages.", draft.name, draft.stages.len());
  Ok(draft)
}

pub fn parse_pipeline_from_file(path: &Path) -> Result<PipelineDraft, ParserError> {
  debug!("Loading pipeline definition from {:?}", path);
  parse_pipeline(&load_yaml_from_file(path)?)
}

// ============================================================================
// Jobs
// ============================================================================

fn parse_space(node: &YamlOwned) -> Result<SpaceRequest, ParserError> {
  let name = lookup_str(node, "name")?;
  let contents = match yaml_lookup(node, "inputs") {
    Some(_) => SpaceContents::Pipeline {
      inputs: lookup_sequence(node, "inputs")?
        .iter()
        .map(|tuple| as_i32_sequence("inputs", tuple))
        .collect::<Result<Vec<_>, _>>()?,
    },
    None => SpaceContents::Plain {
      benchmarks: lookup_i32_sequence(node, "benchmarks")?,
      configs: lookup_i32_sequence(node, "configs")?,
    },
  };
  Ok(SpaceRequest { name, contents })
}

/// Reads a job submission. `policy` defaults to round-robin; timeouts default to the queue's.
pub fn parse_job(yaml: &YamlOwned) -> Result<JobRequest, ParserError> {
  let policy = match lookup_optional_str(yaml, "policy")? {
    Some(policy) => policy
      .parse::<DistributionPolicy>()
      .map_err(|_| ParserError::InvalidValue(format!("unknown distribution policy '{}'", policy)))?,
    None => DistributionPolicy::default(),
  };
  let spaces = lookup_sequence(yaml, "spaces")?
    .iter()
    .map(parse_space)
    .collect::<Result<Vec<_>, _>>()?;

  Ok(JobRequest {
    name: lookup_str(yaml, "name")?,
    owner_id: lookup_i32(yaml, "owner")?,
    queue: lookup_str(yaml, "queue")?,
    policy,
    cpu_timeout: lookup_optional_i32(yaml, "cpu_timeout")?,
    wall_timeout: lookup_optional_i32(yaml, "wall_timeout")?,
    pipeline_id: lookup_optional_i32(yaml, "pipeline")?,
    spaces,
  })
}

pub fn parse_job_from_file(path: &Path) -> Result<JobRequest, ParserError> {
  debug!("Loading job definition from {:?}", path);
  parse_job(&load_yaml_from_file(path)?)
}
