use std::{
  collections::{BTreeMap, HashSet},
  process::Command,
};

use log::{trace, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use super::BackendError;

static EXECUTION_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d+)").unwrap());

/// Runs `program` with `args` and returns its stdout. A non-zero exit is an error.
pub fn run_command(program: &str, args: &[&str]) -> Result<String, BackendError> {
  let command = format!("{} {}", program, args.join(" "));
  trace!("Running `{}`", command);

  let output = Command::new(program)
    .args(args)
    .output()
    .map_err(|source| BackendError::SpawnError {
      command: command.clone(),
      source,
    })?;

  if !output.status.success() {
    return Err(BackendError::CommandFailed {
      command,
      status: output.status.to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// One name per non-blank line, trimmed, without duplicates, in first-seen order.
pub fn parse_names(output: &str) -> Vec<String> {
  let mut seen = HashSet::new();
  output
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .filter(|line| seen.insert(line.to_string()))
    .map(str::to_string)
    .collect()
}

/// `node queue` pairs, one per line. The first queue reported for a node wins.
pub fn parse_associations(output: &str) -> BTreeMap<String, String> {
  let mut associations = BTreeMap::new();
  for line in output.lines() {
    let mut fields = line.split_whitespace();
    let (Some(node), Some(queue)) = (fields.next(), fields.next()) else {
      continue;
    };
    match associations.get(node) {
      Some(existing) if existing != queue => warn!(
        "Node '{}' is listed in queues '{}' and '{}'; keeping '{}'.",
        node, existing, queue, existing
      ),
      Some(_) => {}
      None => {
        associations.insert(node.to_string(), queue.to_string());
      }
    }
  }
  associations
}

/// Leading integer of each line, so `1234`, `1234_7` and `1234.server` all give 1234. Lines
/// that do not start with a number (headers, separators) are ignored.
pub fn parse_execution_ids(output: &str) -> HashSet<i32> {
  output
    .lines()
    .filter_map(|line| EXECUTION_ID.captures(line))
    .filter_map(|captures| captures[1].parse::<i32>().ok())
    .collect()
}
