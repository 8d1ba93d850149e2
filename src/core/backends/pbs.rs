use std::collections::{BTreeMap, HashSet};

use log::info;

use super::{
  BackendClient, BackendError,
  utils::{parse_execution_ids, run_command},
};

/// Talks to PBS Professional / Torque through `pbsnodes`, `qstat`, `qmgr` and `qdel`.
#[derive(Debug, PartialEq, Default)]
pub struct PbsBackend;

/// A node as printed by `pbsnodes -a`: the name on its own line, then indented
/// `key = value` attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PbsNode {
  pub name: String,
  pub queue: Option<String>,
}

pub fn parse_pbsnodes(output: &str) -> Vec<PbsNode> {
  let mut nodes: Vec<PbsNode> = Vec::new();
  for line in output.lines() {
    if line.trim().is_empty() {
      continue;
    }
    if !line.starts_with(char::is_whitespace) {
      nodes.push(PbsNode {
        name: line.trim().to_string(),
        queue: None,
      });
      continue;
    }
    let Some((key, value)) = line.trim().split_once('=') else {
      continue;
    };
    if key.trim() == "queue" {
      if let Some(node) = nodes.last_mut() {
        node.queue = Some(value.trim().to_string());
      }
    }
  }
  nodes
}

/// Queue names from `qstat -Q`, skipping the header and the dashed separator.
pub fn parse_qstat_queues(output: &str) -> Vec<String> {
  output
    .lines()
    .skip_while(|line| !line.trim_start().starts_with("---"))
    .skip(1)
    .filter_map(|line| line.split_whitespace().next())
    .map(str::to_string)
    .collect()
}

impl BackendClient for PbsBackend {
  fn get_worker_nodes(&self) -> Result<Vec<String>, BackendError> {
    let output = run_command("pbsnodes", &["-a"])?;
    Ok(parse_pbsnodes(&output).into_iter().map(|n| n.name).collect())
  }

  fn get_queues(&self) -> Result<Vec<String>, BackendError> {
    Ok(parse_qstat_queues(&run_command("qstat", &["-Q"])?))
  }

  fn get_node_queue_associations(&self) -> Result<BTreeMap<String, String>, BackendError> {
    let output = run_command("pbsnodes", &["-a"])?;
    Ok(
      parse_pbsnodes(&output)
        .into_iter()
        .filter_map(|node| node.queue.map(|queue| (node.name, queue)))
        .collect(),
    )
  }

  fn get_active_execution_ids(&self) -> Result<HashSet<i32>, BackendError> {
    Ok(parse_execution_ids(&run_command("qstat", &[])?))
  }

  fn move_node(&self, node: &str, queue: &str) -> Result<(), BackendError> {
    let directive = format!("set node {} queue = {}", node, queue);
    run_command("qmgr", &["-c", &directive])?;
    info!("Moved node {} to queue {}.", node, queue);
    Ok(())
  }

  fn delete_queue(&self, queue: &str) -> Result<(), BackendError> {
    let directive = format!("delete queue {}", queue);
    run_command("qmgr", &["-c", &directive])?;
    info!("Deleted queue {}.", queue);
    Ok(())
  }

  fn kill_pair(&self, execution_id: i32) -> Result<(), BackendError> {
    run_command("qdel", &[&execution_id.to_string()])?;
    Ok(())
  }
}
