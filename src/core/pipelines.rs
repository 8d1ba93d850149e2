
use std::{collections::BTreeSet, fmt};

use log::{debug, info};
use thiserror::Error;

use crate::core::database::{
  Database, StorageError,
  models::{DependencyType, PipelineDependency, PipelineStage, SolverPipeline},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("Pipeline '{0}' has no stages")]
  NoStages(String),
  #[error("Pipeline has {count} stages, the limit is {max}")]
  TooManyStages { count: usize, max: usize },
  #[error("Pipeline needs exactly one primary stage, found {0}")]
  PrimaryStageCount(usize),
  #[error("Stage {0} is a no-op stage and cannot be primary")]
  NoOpPrimary(i32),
  #[error("Stage {0} is a no-op stage and cannot have inputs")]
  NoOpWithInputs(i32),
  #[error("Stage {stage} depends on the output of stage {dependency}, which does not run before it")]
  InvalidArtifactDependency { stage: i32, dependency: i32 },
  #[error("Stage {stage} uses benchmark input {input}; inputs are numbered from 1")]
  InvalidBenchmarkInput { stage: i32, input: i32 },
  #[error("Benchmark inputs must be numbered 1 to {max} without gaps, missing {missing:?}")]
  BenchmarkInputGap { max: i32, missing: Vec<i32> },
  #[error("Pipeline has no stage {0}")]
  StageOutOfRange(i32),
  #[error("Stage {stage} needs benchmark input {input} but only {supplied} were supplied")]
  NotEnoughInputs {
    stage: i32,
    input: i32,
    supplied: usize,
  },
  #[error("Job pair {0} does not belong to a pipeline job")]
  PairWithoutPipeline(i32),
  #[error("Job pair {pair}: stored benchmark inputs are not a list of ids: {source}")]
  InvalidBenchInputs {
    pair: i32,
    source: serde_json::Error,
  },
  #[error("Storage Error: {0}")]
  StorageError(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftDependency {
  pub dependency_type: DependencyType,
  /// A benchmark input slot (from 1) or the index of an earlier stage.
  pub dependency_id: i32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DraftStage {
  /// `None` makes this a no-op stage.
  pub config_id: Option<i32>,
  pub is_primary: bool,
  /// Inputs in order; the position (from 1) is the input number.
  pub dependencies: Vec<DraftDependency>,
}

impl DraftStage {
  pub fn is_noop(&self) -> bool {
    self.config_id.is_none()
  }
}

/// A pipeline that has not been stored yet. A stage's index is its position in `stages`,
/// counting from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDraft {
  pub name: String,
  pub owner_id: i32,
  pub stages: Vec<DraftStage>,
}

impl PipelineDraft {
  pub fn primary_stage(&self) -> Option<i32> {
    self
      .stages
      .iter()
      .position(|stage| stage.is_primary)
      .map(|position| position as i32 + 1)
  }

  pub fn required_number_of_inputs(&self) -> i32 {
    required_inputs(
      self
        .stages
        .iter()
        .flat_map(|stage| stage.dependencies.iter())
        .map(|d| (d.dependency_type, d.dependency_id)),
    )
  }

  pub fn validate(&self, max_stages: usize) -> Result<(), PipelineError> {
    if self.stages.is_empty() {
      return Err(PipelineError::NoStages(self.name.clone()));
    }
    if self.stages.len() > max_stages {
      return Err(PipelineError::TooManyStages {
        count: self.stages.len(),
        max: max_stages,
      });
    }
    let primaries = self.stages.iter().filter(|s| s.is_primary).count();
    if primaries != 1 {
      return Err(PipelineError::PrimaryStageCount(primaries));
    }

    let mut benchmark_slots = BTreeSet::new();
    for (position, stage) in self.stages.iter().enumerate() {
      let index = position as i32 + 1;
      if stage.is_noop() {
        if stage.is_primary {
          return Err(PipelineError::NoOpPrimary(index));
        }
        if !stage.dependencies.is_empty() {
          return Err(PipelineError::NoOpWithInputs(index));
        }
      }
      for dependency in &stage.dependencies {
        match dependency.dependency_type {
          DependencyType::Artifact => {
            if dependency.dependency_id < 1 || dependency.dependency_id >= index {
              return Err(PipelineError::InvalidArtifactDependency {
                stage: index,
                dependency: dependency.dependency_id,
              });
            }
          }
          DependencyType::Benchmark => {
            if dependency.dependency_id < 1 {
              return Err(PipelineError::InvalidBenchmarkInput {
                stage: index,
                input: dependency.dependency_id,
              });
            }
            benchmark_slots.insert(dependency.dependency_id);
          }
        }
      }
    }

    let max = self.required_number_of_inputs();
    let missing: Vec<i32> = (1..=max).filter(|n| !benchmark_slots.contains(n)).collect();
    if !missing.is_empty() {
      return Err(PipelineError::BenchmarkInputGap { max, missing });
    }
    Ok(())
  }
}

fn required_inputs(dependencies: impl Iterator<Item = (DependencyType, i32)>) -> i32 {
  dependencies
    .filter(|(kind, _)| *kind == DependencyType::Benchmark)
    .map(|(_, id)| id)
    .max()
    .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullStage {
  pub stage: PipelineStage,
  /// Ordered by input number.
  pub dependencies: Vec<PipelineDependency>,
}

/// A stored pipeline with its stages in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct FullPipeline {
  pub pipeline: SolverPipeline,
  pub stages: Vec<FullStage>,
}

/// One runtime input of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
  /// A benchmark id taken from the pair's inputs.
  Benchmark(i32),
  /// The output produced by an earlier stage of the same pair.
  Artifact(i32),
}

impl fmt::Display for StageInput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StageInput::Benchmark(id) => write!(f, "benchmark {}", id),
      StageInput::Artifact(stage) => write!(f, "output of stage {}", stage),
    }
  }
}

impl FullPipeline {
  pub fn required_number_of_inputs(&self) -> i32 {
    required_inputs(
      self
        .stages
        .iter()
        .flat_map(|stage| stage.dependencies.iter())
        .map(|d| (d.dependency_type, d.dependency_id)),
    )
  }

  pub fn stage(&self, stage_index: i32) -> Option<&FullStage> {
    self
      .stages
      .iter()
      .find(|stage| stage.stage.stage_index == stage_index)
  }

  /// Config of every stage, in execution order. No-op stages have none.
  pub fn stage_configs(&self) -> Vec<Option<i32>> {
    self.stages.iter().map(|s| s.stage.config_id).collect()
  }

  /// Inputs of `stage_index` in input-number order, with benchmark slots resolved against the
  /// pair's `bench_inputs` (slot n is `bench_inputs[n - 1]`).
  pub fn resolve_stage_inputs(
    &self,
    stage_index: i32,
    bench_inputs: &[i32],
  ) -> Result<Vec<StageInput>, PipelineError> {
    let stage = self
      .stage(stage_index)
      .ok_or(PipelineError::StageOutOfRange(stage_index))?;

    stage
      .dependencies
      .iter()
      .map(|dependency| match dependency.dependency_type {
        DependencyType::Artifact => Ok(StageInput::Artifact(dependency.dependency_id)),
        DependencyType::Benchmark => usize::try_from(dependency.dependency_id - 1)
          .ok()
          .and_then(|slot| bench_inputs.get(slot))
          .map(|benchmark| StageInput::Benchmark(*benchmark))
          .ok_or(PipelineError::NotEnoughInputs {
            stage: stage_index,
            input: dependency.dependency_id,
            supplied: bench_inputs.len(),
          }),
      })
      .collect()
  }
}

pub fn create_pipeline(
  db: &mut Database,
  draft: &PipelineDraft,
  max_stages: usize,
) -> Result<FullPipeline, PipelineError> {
  draft.validate(max_stages)?;
  let pipeline = db.create_pipeline_graph(draft)?;
  info!(
    "Created pipeline '{}' (id {}) needing {} benchmark inputs.",
    pipeline.pipeline.name,
    pipeline.pipeline.id,
    pipeline.required_number_of_inputs()
  );
  Ok(pipeline)
}

pub fn get_full_pipeline(db: &mut Database, pipeline_id: i32) -> Result<FullPipeline, PipelineError> {
  Ok(db.get_full_pipeline(pipeline_id)?)
}

pub fn delete_pipeline(db: &mut Database, pipeline_id: i32) -> Result<(), PipelineError> {
  db.delete_pipeline(pipeline_id)?;
  debug!("Deleted pipeline {}.", pipeline_id);
  Ok(())
}

/// Inputs of one stage of a stored pair, for the execution driver about to run it.
pub fn resolve_pair_stage_inputs(
  db: &mut Database,
  pair_id: i32,
  stage_index: i32,
) -> Result<Vec<StageInput>, PipelineError> {
  let pair = db.get_pair(pair_id)?;
  let pipeline_id = db
    .get_job(pair.job_id)?
    .pipeline_id
    .ok_or(PipelineError::PairWithoutPipeline(pair_id))?;
  let bench_inputs: Vec<i32> = serde_json::from_value(pair.bench_inputs)
    .map_err(|source| PipelineError::InvalidBenchInputs {
      pair: pair_id,
      source,
    })?;
  db.get_full_pipeline(pipeline_id)?
    .resolve_stage_inputs(stage_index, &bench_inputs)
}
