use std::{collections::BTreeMap, env, path::PathBuf, sync::mpsc};

use anyhow::{Context, Result, bail};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use crate::core::{
  Stardispatch,
  backends::BackendKind,
  cluster::SyncReport,
  database::models::{Queue, StatusCode},
};

#[derive(Parser)]
#[command(version, about = "Cluster and job pair control plane", long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Create a .stardispatch project in the current directory
  Init {},
  /// Reconcile nodes and queues with the backend now
  Sync {},
  /// Keep reconciling and sweeping for broken pairs until killed
  Daemon {},
  /// Run one broken pair sweep
  Sweep {},
  /// Show the project configuration, changing the given settings first
  Config {
    #[arg(long)]
    backend: Option<BackendKind>,
    #[arg(long)]
    default_queue: Option<String>,
    #[arg(long)]
    default_timeout: Option<i32>,
    #[arg(long)]
    sync_period: Option<u64>,
    #[arg(long)]
    sweep_period: Option<u64>,
  },
  /// List queues; inactive ones only with --all
  Queues {
    #[arg(long)]
    all: bool,
  },
  Queue {
    name: String,
  },
  Nodes {},
  RemoveQueue {
    queue: String,
  },
  MoveNodes {
    #[arg(long)]
    to: String,
    #[arg(required = true)]
    nodes: Vec<String>,
  },
  SetTestQueue {
    queue: String,
  },
  TestQueue {},
  MakeGlobal {
    queue: String,
  },
  RemoveGlobal {
    queue: String,
  },
  CommunityAccess {
    queue: String,
    #[arg(required = true)]
    communities: Vec<i32>,
  },
  QueueTimeout {
    queue: String,
    #[arg(long)]
    cpu: Option<i32>,
    #[arg(long)]
    wall: Option<i32>,
  },
  DefinePipeline {
    file: PathBuf,
  },
  DeletePipeline {
    pipeline: i32,
  },
  /// Print the resolved inputs of one stage of a pipeline pair
  StageInputs {
    pair: i32,
    stage: i32,
  },
  SubmitJob {
    file: PathBuf,
  },
  /// Show a job, its spaces and how many pairs are in each status
  Job {
    job: i32,
  },
  PauseJob {
    job: i32,
  },
  ResumeJob {
    job: i32,
  },
  /// Show a pair and its stages
  Pair {
    pair: i32,
  },
  /// Report a pair (or stage) status, e.g. ENQUEUED or ERROR_RUNSCRIPT
  PairStatus {
    pair: i32,
    status: StatusCode,
    #[arg(long)]
    stage: Option<i32>,
    /// Overwrite the pair and all of its stages, skipping transition checks
    #[arg(long, conflicts_with_all = ["stage", "later_than"])]
    force: bool,
    /// Set every stage after this one instead
    #[arg(long, conflicts_with = "stage")]
    later_than: Option<i32>,
  },
  /// Bind a pair to its backend execution id; omit the id to unbind
  PairBind {
    pair: i32,
    exec_id: Option<i32>,
  },
  /// Merge key=value attributes into a stage
  PairAttributes {
    pair: i32,
    stage: i32,
    #[arg(required = true)]
    attributes: Vec<String>,
  },
  PairCorrectness {
    pair: i32,
    #[arg(long)]
    stage: Option<i32>,
  },
  KillPair {
    pair: i32,
  },
  RerunPair {
    pair: i32,
  },
}

fn print_report(report: &SyncReport) {
  println!(
    "Nodes: {} active, {} inactive. Queues: {} active, {} inactive.",
    report.active_nodes, report.inactive_nodes, report.active_queues, report.inactive_queues
  );
  if !report.new_nodes.is_empty() {
    println!("New nodes: {}", report.new_nodes.join(", "));
  }
  if !report.new_queues.is_empty() {
    println!("New queues: {}", report.new_queues.join(", "));
  }
}

fn print_queue(queue: &Queue) {
  let mut flags = Vec::new();
  if queue.global_access {
    flags.push("global");
  }
  if queue.is_test_queue {
    flags.push("test");
  }
  println!(
    "{} [{}] cpu {}s, wall {}s {}",
    queue.name,
    queue.status,
    queue.cpu_timeout,
    queue.wall_timeout,
    flags.join(" ")
  );
}

fn format_timestamp(timestamp: Option<i64>) -> String {
  timestamp
    .and_then(|t| DateTime::from_timestamp(t, 0))
    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "-".to_string())
}

fn parse_attributes(attributes: &[String]) -> Result<Map<String, Value>> {
  let mut map = Map::new();
  for attribute in attributes {
    let Some((key, value)) = attribute.split_once('=') else {
      bail!("Attribute '{}' is not of the form key=value", attribute);
    };
    map.insert(key.to_string(), Value::String(value.to_string()));
  }
  Ok(map)
}

fn open() -> Result<Stardispatch> {
  Stardispatch::new().context("Failed to open the stardispatch project")
}

pub fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Init {} => {
      let path = env::current_dir().context("Failed to get current directory")?;
      Stardispatch::init(&path).context("Failed to initialize .stardispatch directory")?;
      println!("✅ Stardispatch initialized successfully!");
    }
    Commands::Sync {} => {
      let report = open()?.sync_cluster().context("Cluster sync failed")?;
      print_report(&report);
    }
    Commands::Daemon {} => {
      let mut stardispatch = open()?;
      // The sender stays alive, so the daemon only stops with the process.
      let (_keep_alive, shutdown) = mpsc::channel();
      stardispatch.run_daemon(&shutdown)?;
    }
    Commands::Sweep {} => {
      let report = open()?.sweep_broken_pairs().context("Sweep failed")?;
      println!(
        "Checked {} pairs, marked {} as failed: {:?}",
        report.checked,
        report.broken.len(),
        report.broken
      );
    }
    Commands::Config {
      backend,
      default_queue,
      default_timeout,
      sync_period,
      sweep_period,
    } => {
      let mut stardispatch = open()?;
      let mut config = stardispatch.config().clone();
      let before = config.clone();
      if let Some(backend) = backend {
        config.backend = backend;
      }
      if let Some(default_queue) = default_queue {
        config.default_queue = default_queue;
      }
      if let Some(timeout) = default_timeout {
        config.default_timeout = timeout;
      }
      if let Some(period) = sync_period {
        config.cluster_update_period_secs = period;
      }
      if let Some(period) = sweep_period {
        config.broken_pair_sweep_period_secs = period;
      }
      if config != before {
        stardispatch
          .update_config(config)
          .context("Failed to store configuration")?;
        println!("✅ Configuration updated.");
      }
      println!("Project: {:?}", stardispatch.path());
      println!("{:#?}", stardispatch.config());
    }
    Commands::Queues { all } => {
      for queue in open()?.get_all_queues(all)? {
        print_queue(&queue);
      }
    }
    Commands::Queue { name } => {
      let mut stardispatch = open()?;
      let queue = stardispatch.get_queue(&name)?;
      print_queue(&queue);
      let communities = stardispatch.get_queue_communities(&name)?;
      if !queue.global_access && !communities.is_empty() {
        println!("  communities: {:?}", communities);
      }
      for node in stardispatch.get_all_nodes()? {
        if node.queue_id == Some(queue.id) {
          println!("  {} [{}]", node.name, node.status);
        }
      }
    }
    Commands::Nodes {} => {
      let mut stardispatch = open()?;
      let queues = stardispatch.get_all_queues(true)?;
      for node in stardispatch.get_all_nodes()? {
        let queue = node
          .queue_id
          .and_then(|id| queues.iter().find(|q| q.id == id))
          .map(|q| q.name.as_str())
          .unwrap_or("-");
        println!("{} [{}] {}", node.name, node.status, queue);
      }
    }
    Commands::RemoveQueue { queue } => {
      let report = open()?
        .remove_queue(&queue)
        .with_context(|| format!("Failed to remove queue '{}'", queue))?;
      println!("✅ Queue '{}' removed.", queue);
      print_report(&report);
    }
    Commands::MoveNodes { to, nodes } => {
      let report = open()?
        .move_nodes(&nodes, &to)
        .with_context(|| format!("Failed to move nodes to '{}'", to))?;
      println!("✅ Moved {} nodes to '{}'.", nodes.len(), to);
      print_report(&report);
    }
    Commands::SetTestQueue { queue } => {
      open()?.set_test_queue(&queue)?;
      println!("✅ '{}' is now the test queue.", queue);
    }
    Commands::TestQueue {} => {
      println!("{}", open()?.get_test_queue()?.name);
    }
    Commands::MakeGlobal { queue } => {
      open()?.set_global(&queue, true)?;
      println!("✅ '{}' is now global.", queue);
    }
    Commands::RemoveGlobal { queue } => {
      open()?.set_global(&queue, false)?;
      println!("✅ '{}' is no longer global.", queue);
    }
    Commands::CommunityAccess { queue, communities } => {
      open()?.set_queue_community_access(&queue, &communities)?;
      println!("✅ Communities {:?} can use '{}'.", communities, queue);
    }
    Commands::QueueTimeout { queue, cpu, wall } => {
      if cpu.is_none() && wall.is_none() {
        bail!("Give --cpu, --wall or both");
      }
      let updated = open()?.update_queue_timeouts(&queue, cpu, wall)?;
      println!(
        "✅ '{}' timeouts: cpu {}s, wall {}s.",
        updated.name, updated.cpu_timeout, updated.wall_timeout
      );
    }
    Commands::DefinePipeline { file } => {
      let pipeline = open()?
        .define_pipeline_from_file(&file)
        .with_context(|| format!("Failed to define pipeline from {:?}", file))?;
      println!(
        "✅ Pipeline '{}' stored with id {}.",
        pipeline.pipeline.name, pipeline.pipeline.id
      );
    }
    Commands::DeletePipeline { pipeline } => {
      open()?
        .delete_pipeline(pipeline)
        .with_context(|| format!("Failed to delete pipeline {}", pipeline))?;
      println!("✅ Pipeline {} deleted.", pipeline);
    }
    Commands::StageInputs { pair, stage } => {
      for (position, input) in open()?.stage_inputs(pair, stage)?.iter().enumerate() {
        println!("{}: {}", position + 1, input);
      }
    }
    Commands::SubmitJob { file } => {
      let job = open()?
        .submit_job_from_file(&file)
        .with_context(|| format!("Failed to submit job from {:?}", file))?;
      println!("✅ Job '{}' submitted with id {}.", job.name, job.id);
    }
    Commands::Job { job } => {
      let mut stardispatch = open()?;
      let (job, spaces) = stardispatch.get_job(job)?;
      println!(
        "Job {} '{}' [{}] owner {}, cpu {}s, wall {}s, submitted {}, finished {}",
        job.id,
        job.name,
        job.status,
        job.owner_id,
        job.cpu_timeout,
        job.wall_timeout,
        format_timestamp(Some(job.submitted)),
        format_timestamp(job.finished)
      );
      for space in spaces {
        println!("  space '{}' (up to {} stages)", space.name, space.max_stages);
      }
      let mut counts: BTreeMap<String, usize> = BTreeMap::new();
      for pair in stardispatch.get_pairs_for_job(job.id)? {
        *counts.entry(pair.status.to_string()).or_default() += 1;
      }
      for (status, count) in counts {
        println!("  {}: {}", status, count);
      }
    }
    Commands::PauseJob { job } => {
      let paused = open()?.pause_job(job)?;
      println!("✅ Job {} paused, {} pairs held back.", job, paused);
    }
    Commands::ResumeJob { job } => {
      let resumed = open()?.resume_job(job)?;
      println!("✅ Job {} resumed, {} pairs released.", job, resumed);
    }
    Commands::Pair { pair } => {
      let (pair, stages) = open()?.get_pair(pair)?;
      println!(
        "Pair {} of job {} [{}] inputs {} backend id {:?}",
        pair.id, pair.job_id, pair.status, pair.bench_inputs, pair.backend_exec_id
      );
      for stage in stages {
        let marker = if stage.stage_number == pair.primary_stage {
          " (primary)"
        } else {
          ""
        };
        println!(
          "  stage {}{} [{}] {} {}",
          stage.stage_number,
          marker,
          stage.status,
          stage.correctness(),
          stage.attributes
        );
      }
    }
    Commands::PairStatus {
      pair,
      status,
      stage,
      force,
      later_than,
    } => {
      let mut stardispatch = open()?;
      match later_than {
        Some(stage) => {
          let updated = stardispatch.set_later_stage_status(pair, stage, status)?;
          println!("✅ {} stages of pair {} set to {}.", updated, pair, status);
        }
        None => {
          stardispatch.set_pair_status(pair, stage, status, force)?;
          println!("✅ Pair {} set to {}.", pair, status);
        }
      }
    }
    Commands::PairBind { pair, exec_id } => {
      open()?.bind_pair(pair, exec_id)?;
      println!("✅ Pair {} bound to {:?}.", pair, exec_id);
    }
    Commands::PairAttributes {
      pair,
      stage,
      attributes,
    } => {
      let attributes = parse_attributes(&attributes)?;
      let merged = open()?.add_pair_attributes(pair, stage, &attributes)?;
      println!("{}", merged);
    }
    Commands::PairCorrectness { pair, stage } => {
      println!("{}", open()?.pair_correctness(pair, stage)?);
    }
    Commands::KillPair { pair } => {
      open()?.kill_pair(pair)?;
      println!("✅ Pair {} killed.", pair);
    }
    Commands::RerunPair { pair } => {
      open()?.rerun_pair(pair)?;
      println!("✅ Pair {} will be rerun.", pair);
    }
  }
  Ok(())
}
