
use std::{
  collections::{BTreeMap, BTreeSet},
  sync::{
    Arc,
    mpsc::{self, RecvTimeoutError, Sender},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::core::{
  backends::{BackendClient, BackendError},
  database::{Database, StorageError, models::RegistryStatus},
};

#[derive(Error, Debug)]
pub enum ClusterError {
  #[error("Backend Error: {0}")]
  BackendError(#[from] BackendError),
  #[error("Storage Error: {0}")]
  StorageError(#[from] StorageError),
  #[error("Cluster sync worker is not running")]
  WorkerGone,
}

/// Name to liveness for every node (or queue) ever seen, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
  entries: BTreeMap<String, RegistryStatus>,
}

impl RegistrySnapshot {
  pub fn status(&self, name: &str) -> Option<RegistryStatus> {
    self.entries.get(name).copied()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, RegistryStatus)> {
    self
      .entries
      .iter()
      .map(|(name, status)| (name.as_str(), *status))
  }

  pub fn names_with(&self, status: RegistryStatus) -> Vec<&str> {
    self
      .iter()
      .filter(|(_, s)| *s == status)
      .map(|(name, _)| name)
      .collect()
  }
}

impl FromIterator<(String, RegistryStatus)> for RegistrySnapshot {
  fn from_iter<I: IntoIterator<Item = (String, RegistryStatus)>>(iter: I) -> Self {
    RegistrySnapshot {
      entries: iter.into_iter().collect(),
    }
  }
}

/// Everything previously known becomes inactive, then everything observed is active (and
/// added if new). Nothing is ever dropped.
pub fn reconcile(previous: &RegistrySnapshot, observed: &BTreeSet<String>) -> RegistrySnapshot {
  let mut entries: BTreeMap<String, RegistryStatus> = previous
    .entries
    .keys()
    .map(|name| (name.clone(), RegistryStatus::Inactive))
    .collect();
  for name in observed {
    entries.insert(name.clone(), RegistryStatus::Active);
  }
  RegistrySnapshot { entries }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub active_nodes: usize,
  pub inactive_nodes: usize,
  pub active_queues: usize,
  pub inactive_queues: usize,
  pub new_nodes: Vec<String>,
  pub new_queues: Vec<String>,
}

impl SyncReport {
  fn new(
    previous_nodes: &RegistrySnapshot,
    nodes: &RegistrySnapshot,
    previous_queues: &RegistrySnapshot,
    queues: &RegistrySnapshot,
  ) -> Self {
    let added = |previous: &RegistrySnapshot, next: &RegistrySnapshot| -> Vec<String> {
      next
        .iter()
        .filter(|(name, _)| previous.status(name).is_none())
        .map(|(name, _)| name.to_string())
        .collect()
    };
    SyncReport {
      active_nodes: nodes.names_with(RegistryStatus::Active).len(),
      inactive_nodes: nodes.names_with(RegistryStatus::Inactive).len(),
      active_queues: queues.names_with(RegistryStatus::Active).len(),
      inactive_queues: queues.names_with(RegistryStatus::Inactive).len(),
      new_nodes: added(previous_nodes, nodes),
      new_queues: added(previous_queues, queues),
    }
  }
}

/// One full pass: read everything from the backend, then write nodes, queues and
/// associations in a single transaction. A backend failure leaves the database untouched.
pub fn reconcile_cluster(
  db: &mut Database,
  backend: &dyn BackendClient,
  default_timeout: i32,
) -> Result<SyncReport, ClusterError> {
  let seen_nodes: BTreeSet<String> = backend.get_worker_nodes()?.into_iter().collect();
  let seen_queues: BTreeSet<String> = backend.get_queues()?.into_iter().collect();
  let associations = backend.get_node_queue_associations()?;
  debug!(
    "Backend reports {} nodes, {} queues and {} associations.",
    seen_nodes.len(),
    seen_queues.len(),
    associations.len()
  );

  let previous_nodes = db.load_node_snapshot()?;
  let previous_queues = db.load_queue_snapshot()?;
  let nodes = reconcile(&previous_nodes, &seen_nodes);
  let queues = reconcile(&previous_queues, &seen_queues);
  db.apply_cluster_snapshot(&nodes, &queues, &associations, default_timeout)?;

  let report = SyncReport::new(&previous_nodes, &nodes, &previous_queues, &queues);
  info!(
    "Cluster synced: {} active / {} inactive nodes, {} active / {} inactive queues.",
    report.active_nodes, report.inactive_nodes, report.active_queues, report.inactive_queues
  );
  Ok(report)
}

/// Anything that can run a reconciliation pass on request.
pub trait ClusterReconciler {
  fn sync_now(&self) -> Result<SyncReport, ClusterError>;
}

enum SyncMessage {
  SyncNow(Sender<Result<SyncReport, ClusterError>>),
  Shutdown,
}

/// Worker thread that owns every write to the node and queue registry. It runs a pass every
/// `period` (if any) and whenever `sync_now` is called.
pub struct ClusterSync {
  sender: Sender<SyncMessage>,
  handle: Option<JoinHandle<()>>,
}

impl ClusterSync {
  pub fn spawn(
    mut db: Database,
    backend: Arc<dyn BackendClient>,
    default_timeout: i32,
    period: Option<Duration>,
  ) -> Self {
    let (sender, receiver) = mpsc::channel::<SyncMessage>();
    let handle = thread::spawn(move || {
      loop {
        let message = match period {
          Some(period) => receiver.recv_timeout(period),
          None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match message {
          Ok(SyncMessage::SyncNow(reply)) => {
            let result = reconcile_cluster(&mut db, backend.as_ref(), default_timeout);
            if let Err(e) = &result {
              warn!("Requested cluster sync failed: {}", e);
            }
            let _ = reply.send(result);
          }
          Err(RecvTimeoutError::Timeout) => {
            if let Err(e) = reconcile_cluster(&mut db, backend.as_ref(), default_timeout) {
              error!("Periodic cluster sync failed, retrying next period: {}", e);
            }
          }
          Ok(SyncMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
      }
      debug!("Cluster sync worker stopped.");
    });

    ClusterSync {
      sender,
      handle: Some(handle),
    }
  }

  fn stop(&mut self) {
    let _ = self.sender.send(SyncMessage::Shutdown);
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        error!("Cluster sync worker panicked.");
      }
    }
  }
}

impl ClusterReconciler for ClusterSync {
  fn sync_now(&self) -> Result<SyncReport, ClusterError> {
    let (reply, result) = mpsc::channel();
    self
      .sender
      .send(SyncMessage::SyncNow(reply))
      .map_err(|_| ClusterError::WorkerGone)?;
    result.recv().map_err(|_| ClusterError::WorkerGone)?
  }
}

impl Drop for ClusterSync {
  fn drop(&mut self) {
    self.stop();
  }
}
