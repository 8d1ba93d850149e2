use std::collections::{BTreeMap, HashSet};

use log::{debug, info};

use super::{
  BackendClient, BackendError,
  utils::{parse_associations, parse_execution_ids, parse_names, run_command},
};

/// Talks to Slurm through `sinfo`, `squeue`, `scontrol` and `scancel`. Queues are partitions.
#[derive(Debug, PartialEq, Default)]
pub struct SlurmBackend;

impl SlurmBackend {
  fn partition_nodes(&self, partition: &str) -> Result<Vec<String>, BackendError> {
    Ok(parse_names(&run_command(
      "sinfo",
      &["-h", "-N", "-p", partition, "-o", "%N"],
    )?))
  }

  fn set_partition_nodes(&self, partition: &str, nodes: &[String]) -> Result<(), BackendError> {
    let assignment = format!("Nodes={}", nodes.join(","));
    let partition_arg = format!("PartitionName={}", partition);
    run_command("scontrol", &["update", &partition_arg, &assignment])?;
    debug!("Partition {} now holds [{}].", partition, nodes.join(", "));
    Ok(())
  }
}

impl BackendClient for SlurmBackend {
  fn get_worker_nodes(&self) -> Result<Vec<String>, BackendError> {
    Ok(parse_names(&run_command("sinfo", &["-h", "-N", "-o", "%N"])?))
  }

  fn get_queues(&self) -> Result<Vec<String>, BackendError> {
    // %R is the partition name without the trailing '*' that marks the default one.
    Ok(parse_names(&run_command("sinfo", &["-h", "-o", "%R"])?))
  }

  fn get_node_queue_associations(&self) -> Result<BTreeMap<String, String>, BackendError> {
    Ok(parse_associations(&run_command(
      "sinfo",
      &["-h", "-N", "-o", "%N %R"],
    )?))
  }

  fn get_active_execution_ids(&self) -> Result<HashSet<i32>, BackendError> {
    Ok(parse_execution_ids(&run_command(
      "squeue",
      &["-h", "-o", "%A"],
    )?))
  }

  fn move_node(&self, node: &str, queue: &str) -> Result<(), BackendError> {
    for partition in self.get_queues()? {
      if partition == queue {
        continue;
      }
      let members = self.partition_nodes(&partition)?;
      if members.iter().any(|member| member == node) {
        let remaining: Vec<String> = members.into_iter().filter(|m| m != node).collect();
        self.set_partition_nodes(&partition, &remaining)?;
      }
    }

    let mut members = self.partition_nodes(queue)?;
    if !members.iter().any(|member| member == node) {
      members.push(node.to_string());
    }
    self.set_partition_nodes(queue, &members)?;
    info!("Moved node {} to partition {}.", node, queue);
    Ok(())
  }

  fn delete_queue(&self, queue: &str) -> Result<(), BackendError> {
    let partition_arg = format!("PartitionName={}", queue);
    run_command("scontrol", &["delete", &partition_arg])?;
    info!("Deleted partition {}.", queue);
    Ok(())
  }

  fn kill_pair(&self, execution_id: i32) -> Result<(), BackendError> {
    run_command("scancel", &[&execution_id.to_string()])?;
    Ok(())
  }
}
