#[cfg(test)]
mod tests;

use chrono::Utc;
use hashlink::LinkedHashMap;
use log::{debug, info, warn};
use thiserror::Error;

use crate::core::{
  backends::BackendClient,
  database::{
    Database, StorageError,
    models::{Job, JobStatus, NewJob, PairPlan, RegistryStatus, SpacePlan, StatusCode},
  },
  distributor::{DistributionPolicy, distribute},
  pipelines::FullPipeline,
};

#[derive(Error, Debug)]
pub enum JobError {
  #[error("Database Error: {0}")]
  DatabaseError(#[from] StorageError),
  #[error("Queue '{0}' does not exist")]
  QueueNotFound(String),
  #[error("Timeouts must be positive, got {0}")]
  InvalidTimeout(i32),
  #[error("Job '{0}' would not contain any job pair")]
  NoPairs(String),
  #[error("Space '{0}' lists benchmark and config ids but the job runs a pipeline")]
  PlainSpaceInPipelineJob(String),
  #[error("Space '{0}' lists pipeline inputs but the job has no pipeline")]
  PipelineSpaceInPlainJob(String),
  #[error("Space '{space}': an input tuple has {found} benchmarks, the pipeline needs {expected}")]
  InputCountMismatch {
    space: String,
    expected: usize,
    found: usize,
  },
  #[error("Job {0} is already {1}")]
  JobFinished(i32, JobStatus),
}

/// What a job space runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceContents {
  /// Every benchmark against every config, one stage per pair.
  Plain {
    benchmarks: Vec<i32>,
    configs: Vec<i32>,
  },
  /// One pair per tuple of benchmark inputs, run through the job's pipeline.
  Pipeline { inputs: Vec<Vec<i32>> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceRequest {
  pub name: String,
  pub contents: SpaceContents,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
  pub name: String,
  pub owner_id: i32,
  pub queue: String,
  pub policy: DistributionPolicy,
  /// Capped at the queue's timeout; the queue's value is used when absent.
  pub cpu_timeout: Option<i32>,
  pub wall_timeout: Option<i32>,
  pub pipeline_id: Option<i32>,
  pub spaces: Vec<SpaceRequest>,
}

fn cap_timeout(requested: Option<i32>, queue_timeout: i32) -> Result<i32, JobError> {
  match requested {
    Some(timeout) if timeout <= 0 => Err(JobError::InvalidTimeout(timeout)),
    Some(timeout) => Ok(timeout.min(queue_timeout)),
    None => Ok(queue_timeout),
  }
}

fn plan_space(
  space_index: usize,
  space: &SpaceRequest,
  pipeline: Option<&FullPipeline>,
) -> Result<Vec<PairPlan>, JobError> {
  match (&space.contents, pipeline) {
    (SpaceContents::Plain { benchmarks, configs }, None) => Ok(
      benchmarks
        .iter()
        .flat_map(|benchmark| {
          configs.iter().map(move |config| PairPlan {
            space_index,
            bench_inputs: vec![*benchmark],
            config_id: Some(*config),
            primary_stage: 1,
            stage_configs: vec![Some(*config)],
          })
        })
        .collect(),
    ),
    (SpaceContents::Pipeline { inputs }, Some(pipeline)) => {
      let expected = pipeline.required_number_of_inputs() as usize;
      let primary_stage = pipeline.pipeline.primary_stage;
      let primary_config = pipeline
        .stage(primary_stage)
        .and_then(|stage| stage.stage.config_id);
      let stage_configs = pipeline.stage_configs();

      inputs
        .iter()
        .map(|tuple| {
          if tuple.len() != expected {
            return Err(JobError::InputCountMismatch {
              space: space.name.clone(),
              expected,
              found: tuple.len(),
            });
          }
          Ok(PairPlan {
            space_index,
            bench_inputs: tuple.clone(),
            config_id: primary_config,
            primary_stage,
            stage_configs: stage_configs.clone(),
          })
        })
        .collect()
    }
    (SpaceContents::Plain { .. }, Some(_)) => {
      Err(JobError::PlainSpaceInPipelineJob(space.name.clone()))
    }
    (SpaceContents::Pipeline { .. }, None) => {
      Err(JobError::PipelineSpaceInPlainJob(space.name.clone()))
    }
  }
}

/// Creates the job and all of its pairs. Pairs are inserted in the order chosen by
/// `request.policy`, which is the order the dispatcher hands them to the backend.
pub fn submit_job(db: &mut Database, request: &JobRequest) -> Result<Job, JobError> {
  let queue = match db.get_queue_by_name(&request.queue) {
    Ok(queue) => queue,
    Err(StorageError::NotFound(_)) => return Err(JobError::QueueNotFound(request.queue.clone())),
    Err(e) => return Err(e.into()),
  };
  if queue.status == RegistryStatus::Inactive {
    warn!(
      "Queue '{}' is currently inactive; job '{}' will wait until it comes back.",
      queue.name, request.name
    );
  }
  let cpu_timeout = cap_timeout(request.cpu_timeout, queue.cpu_timeout)?;
  let wall_timeout = cap_timeout(request.wall_timeout, queue.wall_timeout)?;

  let pipeline = match request.pipeline_id {
    Some(pipeline_id) => Some(db.get_full_pipeline(pipeline_id)?),
    None => None,
  };

  let mut spaces = Vec::with_capacity(request.spaces.len());
  let mut groups: LinkedHashMap<usize, Vec<PairPlan>> = LinkedHashMap::new();
  for (space_index, space) in request.spaces.iter().enumerate() {
    let plans = plan_space(space_index, space, pipeline.as_ref())?;
    spaces.push(SpacePlan {
      name: space.name.clone(),
      max_stages: plans
        .iter()
        .map(|plan| plan.stage_configs.len() as i32)
        .max()
        .unwrap_or(0),
    });
    debug!("Space '{}' has {} pairs.", space.name, plans.len());
    groups.insert(space_index, plans);
  }

  let pairs = distribute(groups, request.policy);
  if pairs.is_empty() {
    return Err(JobError::NoPairs(request.name.clone()));
  }

  let job = db.create_job_with_pairs(
    &NewJob {
      name: &request.name,
      owner_id: request.owner_id,
      queue_id: Some(queue.id),
      pipeline_id: request.pipeline_id,
      status: JobStatus::Running,
      submitted: Utc::now().timestamp(),
      cpu_timeout,
      wall_timeout,
    },
    &spaces,
    &pairs,
  )?;
  info!(
    "Submitted job '{}' (id {}) on queue '{}' with {} pairs ({}).",
    job.name,
    job.id,
    queue.name,
    pairs.len(),
    request.policy
  );
  Ok(job)
}

fn ensure_not_finished(job: &Job) -> Result<(), JobError> {
  match job.status {
    JobStatus::Complete | JobStatus::Killed => Err(JobError::JobFinished(job.id, job.status)),
    JobStatus::Running | JobStatus::Paused => Ok(()),
  }
}

/// Marks the job PAUSED. Pairs not submitted yet are held back. Pairs that are enqueued or
/// running are cancelled on the backend and parked as PAUSED with all of their stages, so a
/// resume submits them again. Returns how many pairs were paused.
pub fn pause_job(
  db: &mut Database,
  backend: &dyn BackendClient,
  job_id: i32,
) -> Result<usize, JobError> {
  let job = db.get_job(job_id)?;
  ensure_not_finished(&job)?;

  let mut cancelled = 0;
  for pair in db.get_pairs_for_job(job_id)? {
    if !matches!(pair.status, StatusCode::Enqueued | StatusCode::Running) {
      continue;
    }
    if let Some(execution_id) = pair.backend_exec_id {
      if let Err(e) = backend.kill_pair(execution_id) {
        warn!(
          "Backend could not cancel execution {} of pair {}: {}",
          execution_id, pair.id, e
        );
      }
    }
    db.set_status_for_pair_and_stages(pair.id, StatusCode::Paused)?;
    db.update_backend_exec_id(pair.id, None)?;
    cancelled += 1;
  }

  let held = db.transition_job(
    job_id,
    JobStatus::Paused,
    StatusCode::PendingSubmit,
    StatusCode::Paused,
  )?;
  info!(
    "Paused job {} ({} pairs cancelled on the backend, {} held back).",
    job_id, cancelled, held
  );
  Ok(cancelled + held)
}

/// Undoes `pause_job`. Returns how many pairs are pending submission again.
pub fn resume_job(db: &mut Database, job_id: i32) -> Result<usize, JobError> {
  let job = db.get_job(job_id)?;
  ensure_not_finished(&job)?;
  let resumed = db.transition_job(
    job_id,
    JobStatus::Running,
    StatusCode::Paused,
    StatusCode::PendingSubmit,
  )?;
  info!("Resumed job {} ({} pairs released).", job_id, resumed);
  Ok(resumed)
}
