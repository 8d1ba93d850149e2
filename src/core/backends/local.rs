use std::collections::{BTreeMap, HashSet};

use log::{debug, warn};

use super::{
  BackendClient, BackendError,
  utils::{parse_execution_ids, run_command},
};

/// Single-host backend: the machine itself is the only node and it sits in one queue. Pairs
/// run as plain processes, so an execution id is a process id.
#[derive(Debug, PartialEq)]
pub struct LocalBackend {
  node_name: String,
  queue_name: String,
}

impl LocalBackend {
  pub fn new(queue_name: &str) -> Self {
    let node_name = match run_command("hostname", &[]) {
      Ok(output) if !output.trim().is_empty() => output.trim().to_string(),
      Ok(_) => "localhost".to_string(),
      Err(e) => {
        warn!("Could not read hostname ({}); using 'localhost'.", e);
        "localhost".to_string()
      }
    };
    LocalBackend {
      node_name,
      queue_name: queue_name.to_string(),
    }
  }
}

impl BackendClient for LocalBackend {
  fn get_worker_nodes(&self) -> Result<Vec<String>, BackendError> {
    Ok(vec![self.node_name.clone()])
  }

  fn get_queues(&self) -> Result<Vec<String>, BackendError> {
    Ok(vec![self.queue_name.clone()])
  }

  fn get_node_queue_associations(&self) -> Result<BTreeMap<String, String>, BackendError> {
    Ok(BTreeMap::from([(
      self.node_name.clone(),
      self.queue_name.clone(),
    )]))
  }

  fn get_active_execution_ids(&self) -> Result<HashSet<i32>, BackendError> {
    Ok(parse_execution_ids(&run_command("ps", &["-e", "-o", "pid="])?))
  }

  fn move_node(&self, node: &str, queue: &str) -> Result<(), BackendError> {
    debug!(
      "Local backend has a fixed layout; ignoring move of {} to {}.",
      node, queue
    );
    Ok(())
  }

  fn delete_queue(&self, queue: &str) -> Result<(), BackendError> {
    debug!("Local backend has a fixed layout; ignoring deletion of {}.", queue);
    Ok(())
  }

  fn kill_pair(&self, execution_id: i32) -> Result<(), BackendError> {
    run_command("kill", &["-9", &execution_id.to_string()])?;
    Ok(())
  }
}
