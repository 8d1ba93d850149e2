mod local;
mod pbs;
mod slurm;
mod utils;


use std::{
  collections::{BTreeMap, HashSet},
  sync::Arc,
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

pub use local::LocalBackend;
pub use pbs::PbsBackend;
pub use slurm::SlurmBackend;

/// Everything the control plane needs from the batch scheduler that runs the pairs.
///
/// Implementations are shared between the caller and the cluster sync worker, so they must be
/// usable from several threads at once.
pub trait BackendClient: Send + Sync {
  fn get_worker_nodes(&self) -> Result<Vec<String>, BackendError>;
  fn get_queues(&self) -> Result<Vec<String>, BackendError>;
  /// Node name to queue name. A node that the backend lists in several queues keeps the
  /// first one reported.
  fn get_node_queue_associations(&self) -> Result<BTreeMap<String, String>, BackendError>;
  /// Execution ids of every job the backend currently knows about (queued or running).
  fn get_active_execution_ids(&self) -> Result<HashSet<i32>, BackendError>;
  fn move_node(&self, node: &str, queue: &str) -> Result<(), BackendError>;
  fn delete_queue(&self, queue: &str) -> Result<(), BackendError>;
  fn kill_pair(&self, execution_id: i32) -> Result<(), BackendError>;
}

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("Could not run `{command}`: {source}")]
  SpawnError {
    command: String,
    source: std::io::Error,
  },
  #[error("`{command}` exited with {status}: {stderr}")]
  CommandFailed {
    command: String,
    status: String,
    stderr: String,
  },
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  #[default]
  Local,
  Slurm,
  Pbs,
}

pub fn get_backend(kind: BackendKind, default_queue: &str) -> Arc<dyn BackendClient> {
  match kind {
    BackendKind::Local => Arc::new(LocalBackend::new(default_queue)),
    BackendKind::Slurm => Arc::new(SlurmBackend),
    BackendKind::Pbs => Arc::new(PbsBackend),
  }
}
