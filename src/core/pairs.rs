
use log::{debug, info, warn};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::core::{
  backends::{BackendClient, BackendError},
  database::{
    Database, StorageError,
    models::{JobPairStage, JobStatus, StatusCode},
  },
};

pub const RESULT_ATTRIBUTE: &str = "starexec-result";
pub const EXPECTED_RESULT_ATTRIBUTE: &str = "starexec-expected-result";
pub const UNKNOWN_RESULT: &str = "starexec-unknown";

#[derive(Error, Debug)]
pub enum PairError {
  #[error("Storage Error: {0}")]
  StorageError(#[from] StorageError),
  #[error("Backend Error: {0}")]
  BackendError(#[from] BackendError),
  #[error("Job pair {pair_id}{} cannot move from {from} to {to}", stage_label(.stage))]
  InvalidTransition {
    pair_id: i32,
    stage: Option<i32>,
    from: StatusCode,
    to: StatusCode,
  },
  #[error("Job pair {0} changed status while it was being updated")]
  StatusChanged(i32),
  #[error("Job pair {0} is still queued or running on the backend")]
  StillActive(i32),
}

fn stage_label(stage: &Option<i32>) -> String {
  stage.map(|s| format!(" (stage {})", s)).unwrap_or_default()
}

impl StatusCode {
  pub fn is_error(&self) -> bool {
    matches!(
      self,
      StatusCode::ErrorStats
        | StatusCode::ErrorRunscript
        | StatusCode::ErrorBenchmark
        | StatusCode::ErrorEnvironment
        | StatusCode::ErrorGeneral
        | StatusCode::ErrorSubmitFail
        | StatusCode::ErrorResults
    )
  }

  pub fn is_exceeded(&self) -> bool {
    matches!(
      self,
      StatusCode::ExceedRuntime
        | StatusCode::ExceedCpu
        | StatusCode::ExceedFileWrite
        | StatusCode::ExceedMem
    )
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      StatusCode::Complete | StatusCode::Killed | StatusCode::NotReached
    ) || self.is_error()
      || self.is_exceeded()
  }

  /// Whether a normal status update may move a pair or stage from `self` to `next`. Setting
  /// the current status again is always allowed.
  pub fn can_transition_to(&self, next: StatusCode) -> bool {
    use StatusCode::*;

    if *self == next {
      return true;
    }
    match self {
      StatusUnknown => true,
      PendingSubmit => matches!(
        next,
        Enqueued | Paused | ErrorSubmitFail | Killed | NotReached | StatusUnknown
      ),
      Paused => matches!(next, PendingSubmit | Killed | StatusUnknown),
      Enqueued => matches!(next, Running | ErrorSubmitFail | Killed | StatusUnknown),
      Running => {
        matches!(next, Processing | Killed | StatusUnknown) || next.is_error() || next.is_exceeded()
      }
      Processing => matches!(next, Complete | Killed | StatusUnknown) || next.is_error(),
      Complete | ErrorStats | ErrorRunscript | ErrorBenchmark | ErrorEnvironment | ErrorGeneral
      | ExceedRuntime | ExceedCpu | ExceedFileWrite | ExceedMem | ErrorSubmitFail
      | ErrorResults | Killed | NotReached => false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Correctness {
  Incomplete,
  Correct,
  Incorrect,
  Unknown,
}

fn attribute_text(attributes: &Value, key: &str) -> Option<String> {
  match attributes.get(key)? {
    Value::Null => None,
    Value::String(s) => Some(s.clone()),
    other => Some(other.to_string()),
  }
}

/// Judges a finished stage by comparing the solver's answer with the benchmark's expected
/// answer. Either side may say it does not know.
pub fn is_pair_correct(status: StatusCode, attributes: &Value) -> Correctness {
  if status != StatusCode::Complete {
    return Correctness::Incomplete;
  }
  let actual = attribute_text(attributes, RESULT_ATTRIBUTE);
  if actual.as_deref() == Some(UNKNOWN_RESULT) {
    return Correctness::Unknown;
  }
  let expected = match attribute_text(attributes, EXPECTED_RESULT_ATTRIBUTE) {
    None => return Correctness::Unknown,
    Some(expected) if expected == UNKNOWN_RESULT => return Correctness::Unknown,
    Some(expected) => expected,
  };
  match actual {
    Some(actual) if actual == expected => Correctness::Correct,
    _ => Correctness::Incorrect,
  }
}

impl JobPairStage {
  pub fn correctness(&self) -> Correctness {
    is_pair_correct(self.status, &self.attributes)
  }
}

fn check_transition(
  pair_id: i32,
  stage: Option<i32>,
  from: StatusCode,
  to: StatusCode,
) -> Result<(), PairError> {
  if from.can_transition_to(to) {
    Ok(())
  } else {
    Err(PairError::InvalidTransition {
      pair_id,
      stage,
      from,
      to,
    })
  }
}

/// Marks a running job COMPLETE once every one of its pairs has reached a terminal status.
fn finish_job_if_done(db: &mut Database, job_id: i32) -> Result<(), PairError> {
  if db.get_job(job_id)?.status != JobStatus::Running {
    return Ok(());
  }
  if db
    .get_pairs_for_job(job_id)?
    .iter()
    .all(|pair| pair.status.is_terminal())
  {
    db.set_job_status(job_id, JobStatus::Complete)?;
    info!("Job {} finished.", job_id);
  }
  Ok(())
}

/// Updates the pair's aggregate status, or one of its stages when `stage` is given. An update
/// of the primary stage is mirrored on the aggregate.
pub fn set_pair_status(
  db: &mut Database,
  pair_id: i32,
  stage: Option<i32>,
  status: StatusCode,
) -> Result<(), PairError> {
  let pair = db.get_pair(pair_id)?;
  let Some(stage_number) = stage else {
    check_transition(pair_id, None, pair.status, status)?;
    db.set_pair_status(pair_id, status)?;
    debug!("Pair {} is now {}.", pair_id, status);
    if status.is_terminal() {
      finish_job_if_done(db, pair.job_id)?;
    }
    return Ok(());
  };

  let current = db.get_pair_stage(pair_id, stage_number)?;
  check_transition(pair_id, stage, current.status, status)?;
  let mirrored = stage_number == pair.primary_stage;
  if mirrored {
    check_transition(pair_id, None, pair.status, status)?;
  }

  db.set_pair_stage_status(pair_id, stage_number, status)?;
  if mirrored {
    db.set_pair_status(pair_id, status)?;
  }
  debug!("Pair {} stage {} is now {}.", pair_id, stage_number, status);
  if mirrored && status.is_terminal() {
    finish_job_if_done(db, pair.job_id)?;
  }
  Ok(())
}

/// Administrative override: the pair and all of its stages get `status`, whatever they were.
pub fn set_status_for_pair_and_stages(
  db: &mut Database,
  pair_id: i32,
  status: StatusCode,
) -> Result<(), PairError> {
  db.set_status_for_pair_and_stages(pair_id, status)?;
  info!("Pair {} and all its stages forced to {}.", pair_id, status);
  if status.is_terminal() {
    let job_id = db.get_pair(pair_id)?.job_id;
    finish_job_if_done(db, job_id)?;
  }
  Ok(())
}

/// Sets every stage after `stage`, typically to NOT_REACHED once an early stage failed.
pub fn set_later_stage_status(
  db: &mut Database,
  pair_id: i32,
  stage: i32,
  status: StatusCode,
) -> Result<usize, PairError> {
  Ok(db.set_later_stage_status(pair_id, stage, status)?)
}

pub fn update_backend_exec_id(
  db: &mut Database,
  pair_id: i32,
  backend_exec_id: Option<i32>,
) -> Result<(), PairError> {
  db.update_backend_exec_id(pair_id, backend_exec_id)?;
  debug!("Pair {} bound to backend id {:?}.", pair_id, backend_exec_id);
  Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
  /// Pairs that were ENQUEUED or RUNNING when the sweep started.
  pub checked: usize,
  /// Pairs marked ERROR_SUBMIT_FAIL.
  pub broken: Vec<i32>,
  /// Pairs the backend had lost but that changed status before they could be marked.
  pub skipped: Vec<i32>,
}

/// Finds pairs the database believes are queued or running but that the backend no longer
/// knows about, and marks them ERROR_SUBMIT_FAIL.
///
/// The database is read before the backend: a pair submitted in between is then either not a
/// candidate or already in the live set, and never wrongly marked.
pub fn sweep_broken_pairs(
  db: &mut Database,
  backend: &dyn BackendClient,
) -> Result<SweepReport, PairError> {
  let candidates = db.get_pairs_by_status(&[StatusCode::Enqueued, StatusCode::Running])?;
  let mut report = SweepReport {
    checked: candidates.len(),
    ..SweepReport::default()
  };
  if candidates.is_empty() {
    return Ok(report);
  }

  let live = backend.get_active_execution_ids()?;
  for pair in candidates {
    if pair.backend_exec_id.is_some_and(|id| live.contains(&id)) {
      continue;
    }
    if db.compare_and_set_pair_status(pair.id, pair.status, StatusCode::ErrorSubmitFail)? {
      warn!(
        "Pair {} was {} with backend id {:?} but the backend has lost it.",
        pair.id, pair.status, pair.backend_exec_id
      );
      report.broken.push(pair.id);
      finish_job_if_done(db, pair.job_id)?;
    } else {
      debug!("Pair {} moved on during the sweep; leaving it alone.", pair.id);
      report.skipped.push(pair.id);
    }
  }

  info!(
    "Broken pair sweep checked {} pairs, marked {} as failed.",
    report.checked,
    report.broken.len()
  );
  Ok(report)
}

/// Cancels the pair on the backend (if it was ever bound) and marks it and its unfinished
/// stages KILLED.
pub fn kill_pair(
  db: &mut Database,
  backend: &dyn BackendClient,
  pair_id: i32,
) -> Result<(), PairError> {
  let pair = db.get_pair(pair_id)?;
  check_transition(pair_id, None, pair.status, StatusCode::Killed)?;

  if let Some(execution_id) = pair.backend_exec_id {
    if let Err(e) = backend.kill_pair(execution_id) {
      warn!(
        "Backend could not cancel execution {} of pair {}: {}",
        execution_id, pair_id, e
      );
    }
  }
  if !db.compare_and_set_pair_status(pair_id, pair.status, StatusCode::Killed)? {
    return Err(PairError::StatusChanged(pair_id));
  }
  info!("Killed pair {}.", pair_id);
  finish_job_if_done(db, pair.job_id)?;
  Ok(())
}

/// Puts a finished pair back in line for submission.
pub fn rerun_pair(db: &mut Database, pair_id: i32) -> Result<(), PairError> {
  let pair = db.get_pair(pair_id)?;
  if matches!(
    pair.status,
    StatusCode::Enqueued | StatusCode::Running | StatusCode::Processing
  ) {
    return Err(PairError::StillActive(pair_id));
  }
  db.reset_pair(pair_id)?;
  if db.get_job(pair.job_id)?.status == JobStatus::Complete {
    db.set_job_status(pair.job_id, JobStatus::Running)?;
  }
  info!("Pair {} will be rerun.", pair_id);
  Ok(())
}

pub fn add_stage_attributes(
  db: &mut Database,
  pair_id: i32,
  stage: i32,
  attributes: &Map<String, Value>,
) -> Result<Value, PairError> {
  Ok(db.merge_stage_attributes(pair_id, stage, attributes)?)
}

/// Correctness of `stage`, or of the pair's primary stage when none is given.
pub fn pair_correctness(
  db: &mut Database,
  pair_id: i32,
  stage: Option<i32>,
) -> Result<Correctness, PairError> {
  let stage_number = match stage {
    Some(stage) => stage,
    None => db.get_pair(pair_id)?.primary_stage,
  };
  Ok(db.get_pair_stage(pair_id, stage_number)?.correctness())
}
