
use std::collections::BTreeMap;

use log::{debug, info, warn};
use thiserror::Error;

use crate::core::{
  backends::{BackendClient, BackendError},
  cluster::{ClusterError, ClusterReconciler, SyncReport},
  database::{Database, StorageError, models::Queue},
  jobs::{JobError, pause_job},
};

#[derive(Error, Debug)]
pub enum QueueError {
  #[error("Storage Error: {0}")]
  StorageError(#[from] StorageError),
  #[error("Backend Error: {0}")]
  BackendError(#[from] BackendError),
  #[error("Cluster Error: {0}")]
  ClusterError(#[from] ClusterError),
  #[error("Job Error: {0}")]
  JobError(#[from] JobError),
  #[error("Queue '{0}' is the default queue and cannot be removed")]
  DefaultQueueRemoval(String),
  #[error("Default queue '{0}' is not known yet, run a cluster sync first")]
  DefaultQueueMissing(String),
  #[error("Timeouts must be positive, got {0}")]
  InvalidTimeout(i32),
}

/// Handles to everything the queue workflows touch.
pub struct QueueLifecycle<'a> {
  pub db: &'a mut Database,
  pub backend: &'a dyn BackendClient,
  pub reconciler: &'a dyn ClusterReconciler,
  pub default_queue: &'a str,
}

impl QueueLifecycle<'_> {
  fn default_queue(&mut self) -> Result<Queue, QueueError> {
    match self.db.get_queue_by_name(self.default_queue) {
      Ok(queue) => Ok(queue),
      Err(StorageError::NotFound(_)) => {
        Err(QueueError::DefaultQueueMissing(self.default_queue.to_string()))
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Removes a queue from the backend and the database.
  ///
  /// Steps run in order and are not undone on failure: running jobs are paused (live
  /// executions are cancelled and parked for resubmission), nodes are handed to the default
  /// queue, the queue is deleted on the backend and then in the database, and a
  /// reconciliation pass refreshes the registry.
  pub fn remove_queue(&mut self, queue_id: i32) -> Result<SyncReport, QueueError> {
    let queue = self.db.get_queue(queue_id)?;
    if queue.name == self.default_queue {
      return Err(QueueError::DefaultQueueRemoval(queue.name));
    }
    let default_queue = self.default_queue()?;

    for job in self.db.get_jobs_running_on_queue(queue_id)? {
      pause_job(self.db, self.backend, job.id)?;
    }

    for node in self.db.get_nodes_for_queue(queue_id)? {
      self.backend.move_node(&node.name, &default_queue.name)?;
      self.db.set_node_queue(node.id, Some(default_queue.id))?;
      debug!("Moved node '{}' to '{}'.", node.name, default_queue.name);
    }

    self.backend.delete_queue(&queue.name)?;
    self.db.delete_queue(queue_id)?;
    info!("Removed queue '{}'.", queue.name);

    Ok(self.reconciler.sync_now()?)
  }

  /// `plan` maps a queue id to how many of its nodes are about to leave. Every queue that would
  /// be left without nodes has its running jobs paused. Returns the paused job ids.
  pub fn pause_jobs_if_no_remaining_nodes(
    &mut self,
    plan: &BTreeMap<i32, usize>,
  ) -> Result<Vec<i32>, QueueError> {
    let mut paused = Vec::new();
    for (queue_id, removing) in plan {
      let remaining = self.db.get_nodes_for_queue(*queue_id)?.len();
      if *removing < remaining {
        continue;
      }
      for job in self.db.get_jobs_running_on_queue(*queue_id)? {
        pause_job(self.db, self.backend, job.id)?;
        paused.push(job.id);
      }
      warn!(
        "Queue {} loses all of its {} nodes; its running jobs were paused.",
        queue_id, remaining
      );
    }
    Ok(paused)
  }

  /// Reassigns nodes to `dest_queue_id`, pausing jobs on any queue that would be emptied.
  pub fn move_nodes(
    &mut self,
    node_ids: &[i32],
    dest_queue_id: i32,
  ) -> Result<SyncReport, QueueError> {
    let destination = self.db.get_queue(dest_queue_id)?;
    let mut nodes = Vec::with_capacity(node_ids.len());
    for node_id in node_ids {
      nodes.push(self.db.get_node(*node_id)?);
    }

    let mut plan: BTreeMap<i32, usize> = BTreeMap::new();
    for source in nodes.iter().filter_map(|node| node.queue_id) {
      if source != destination.id {
        *plan.entry(source).or_default() += 1;
      }
    }
    self.pause_jobs_if_no_remaining_nodes(&plan)?;

    for node in &nodes {
      self.backend.move_node(&node.name, &destination.name)?;
      self.db.set_node_queue(node.id, Some(destination.id))?;
    }
    info!("Moved {} nodes to queue '{}'.", nodes.len(), destination.name);

    Ok(self.reconciler.sync_now()?)
  }

  /// Returns the test queue, making the default queue the test queue if none was chosen.
  pub fn get_test_queue(&mut self) -> Result<Queue, QueueError> {
    if let Some(queue) = self.db.get_test_queue()? {
      return Ok(queue);
    }
    let default_queue = self.default_queue()?;
    set_test_queue(self.db, default_queue.id)?;
    Ok(self.db.get_queue(default_queue.id)?)
  }
}

pub fn set_queue_community_access(
  db: &mut Database,
  queue_id: i32,
  community_ids: &[i32],
) -> Result<(), QueueError> {
  db.get_queue(queue_id)?;
  db.add_queue_community_access(queue_id, community_ids)?;
  debug!("Queue {} opened to communities {:?}.", queue_id, community_ids);
  Ok(())
}

pub fn make_global(db: &mut Database, queue_id: i32) -> Result<(), QueueError> {
  db.set_queue_global(queue_id, true)?;
  info!("Queue {} is now global.", queue_id);
  Ok(())
}

pub fn remove_global(db: &mut Database, queue_id: i32) -> Result<(), QueueError> {
  db.set_queue_global(queue_id, false)?;
  info!("Queue {} is no longer global.", queue_id);
  Ok(())
}

pub fn set_test_queue(db: &mut Database, queue_id: i32) -> Result<(), QueueError> {
  db.set_test_queue(queue_id)?;
  info!("Queue {} is now the test queue.", queue_id);
  Ok(())
}

/// Changes the timeouts given for future jobs. Pairs that already exist keep theirs.
pub fn update_queue_timeouts(
  db: &mut Database,
  queue_id: i32,
  cpu_timeout: Option<i32>,
  wall_timeout: Option<i32>,
) -> Result<Queue, QueueError> {
  for timeout in [cpu_timeout, wall_timeout].into_iter().flatten() {
    if timeout <= 0 {
      return Err(QueueError::InvalidTimeout(timeout));
    }
  }
  if let Some(timeout) = cpu_timeout {
    db.update_queue_cpu_timeout(queue_id, timeout)?;
  }
  if let Some(timeout) = wall_timeout {
    db.update_queue_wall_timeout(queue_id, timeout)?;
  }
  Ok(db.get_queue(queue_id)?)
}
