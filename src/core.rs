pub mod backends;
pub mod cluster;
pub mod database;
pub mod distributor;
pub mod jobs;
pub mod pairs;
mod parsers;
pub mod pipelines;
pub mod queues;
pub mod stardispatch_configs;

#[cfg(test)]
mod tests;

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc,
    mpsc::{Receiver, RecvTimeoutError},
  },
  time::Duration,
};

use log::{error, info};
use serde_json::{Map, Value};

use crate::core::{
  backends::BackendClient,
  cluster::{ClusterReconciler, ClusterSync, SyncReport},
  database::{
    Database,
    models::{Job, JobPair, JobPairStage, JobSpace, Queue, StatusCode, WorkerNode},
  },
  jobs::JobRequest,
  pairs::{Correctness, SweepReport},
  pipelines::{FullPipeline, StageInput},
  queues::QueueLifecycle,
  stardispatch_configs::StardispatchConfig,
};

pub struct Stardispatch {
  db: Database,
  path: PathBuf,
  config: StardispatchConfig,
  backend: Arc<dyn BackendClient>,
  sync: ClusterSync,
}

#[derive(thiserror::Error, Debug)]
pub enum StardispatchError {
  #[error("Storage Error: {0}")]
  StorageError(#[from] database::StorageError),
  #[error("Parser Error: {0}")]
  ParserError(#[from] parsers::ParserError),
  #[error("Config Error: {0}")]
  ConfigError(#[from] stardispatch_configs::StardispatchConfigError),
  #[error("Cluster Error: {0}")]
  ClusterError(#[from] cluster::ClusterError),
  #[error("Pair Error: {0}")]
  PairError(#[from] pairs::PairError),
  #[error("Pipeline Error: {0}")]
  PipelineError(#[from] pipelines::PipelineError),
  #[error("Queue Error: {0}")]
  QueueError(#[from] queues::QueueError),
  #[error("Job Error: {0}")]
  JobError(#[from] jobs::JobError),
}

impl Stardispatch {
  /// Opens the project found by walking up from the current directory.
  pub fn new() -> Result<Self, StardispatchError> {
    let _ = env_logger::try_init();

    let path = stardispatch_configs::get_stardispatch_dir()?;
    let config = stardispatch_configs::get_stardispatch_config(&path)?;
    let backend = backends::get_backend(config.backend, &config.default_queue);
    Self::with_backend(&path, config, backend)
  }

  /// Opens the project stored in `path` (the `.stardispatch` directory itself) against an
  /// explicit backend.
  pub fn with_backend(
    path: &Path,
    config: StardispatchConfig,
    backend: Arc<dyn BackendClient>,
  ) -> Result<Self, StardispatchError> {
    config.validate()?;
    let db = Database::new(path)?;
    let sync = ClusterSync::spawn(
      Database::new(path)?,
      backend.clone(),
      config.default_timeout,
      Some(Duration::from_secs(config.cluster_update_period_secs)),
    );
    Ok(Stardispatch {
      db,
      path: path.to_path_buf(),
      config,
      backend,
      sync,
    })
  }

  pub fn init(path: &PathBuf) -> Result<(), StardispatchError> {
    stardispatch_configs::init_stardispatch_dir(path)?;
    Ok(())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn config(&self) -> &StardispatchConfig {
    &self.config
  }

  /// Validates and stores `config`. Periods and the backend take effect on the next start.
  pub fn update_config(&mut self, config: StardispatchConfig) -> Result<(), StardispatchError> {
    stardispatch_configs::set_stardispatch_config(&self.path, &config)?;
    self.config = config;
    Ok(())
  }

  fn lifecycle(&mut self) -> QueueLifecycle<'_> {
    QueueLifecycle {
      db: &mut self.db,
      backend: self.backend.as_ref(),
      reconciler: &self.sync,
      default_queue: &self.config.default_queue,
    }
  }

  // ===========================================================================
  // Cluster
  // ===========================================================================

  pub fn sync_cluster(&self) -> Result<SyncReport, StardispatchError> {
    Ok(self.sync.sync_now()?)
  }

  pub fn sweep_broken_pairs(&mut self) -> Result<SweepReport, StardispatchError> {
    Ok(pairs::sweep_broken_pairs(
      &mut self.db,
      self.backend.as_ref(),
    )?)
  }

  /// Syncs once, then sweeps for broken pairs every `broken_pair_sweep_period_secs` until a
  /// message arrives on `shutdown` or its sender is dropped. Reconciliation keeps running on
  /// the sync worker's own timer in the meantime.
  pub fn run_daemon(&mut self, shutdown: &Receiver<()>) -> Result<(), StardispatchError> {
    if let Err(e) = self.sync_cluster() {
      error!("Initial cluster sync failed: {}", e);
    }
    let period = Duration::from_secs(self.config.broken_pair_sweep_period_secs);
    info!(
      "Daemon started: syncing every {}s, sweeping every {}s.",
      self.config.cluster_update_period_secs, self.config.broken_pair_sweep_period_secs
    );

    loop {
      if let Err(e) = self.sweep_broken_pairs() {
        error!("Broken pair sweep failed, retrying next period: {}", e);
      }
      match shutdown.recv_timeout(period) {
        Err(RecvTimeoutError::Timeout) => continue,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
      }
    }
    info!("Daemon stopped.");
    Ok(())
  }

  // ===========================================================================
  // Queues
  // ===========================================================================

  pub fn get_queue(&mut self, name: &str) -> Result<Queue, StardispatchError> {
    Ok(self.db.get_queue_by_name(name)?)
  }

  pub fn get_all_queues(&mut self, include_inactive: bool) -> Result<Vec<Queue>, StardispatchError> {
    if include_inactive {
      Ok(self.db.get_all_queues()?)
    } else {
      Ok(self.db.get_all_active_queues()?)
    }
  }

  pub fn get_queue_communities(&mut self, name: &str) -> Result<Vec<i32>, StardispatchError> {
    let queue_id = self.db.get_queue_by_name(name)?.id;
    Ok(self.db.get_queue_communities(queue_id)?)
  }

  pub fn get_all_nodes(&mut self) -> Result<Vec<WorkerNode>, StardispatchError> {
    Ok(self.db.get_all_nodes()?)
  }

  pub fn remove_queue(&mut self, name: &str) -> Result<SyncReport, StardispatchError> {
    let queue_id = self.db.get_queue_by_name(name)?.id;
    Ok(self.lifecycle().remove_queue(queue_id)?)
  }

  pub fn move_nodes(
    &mut self,
    node_names: &[String],
    dest_queue: &str,
  ) -> Result<SyncReport, StardispatchError> {
    let dest_queue_id = self.db.get_queue_by_name(dest_queue)?.id;
    let mut node_ids = Vec::with_capacity(node_names.len());
    for name in node_names {
      node_ids.push(self.db.get_node_by_name(name)?.id);
    }
    Ok(self.lifecycle().move_nodes(&node_ids, dest_queue_id)?)
  }

  pub fn set_test_queue(&mut self, name: &str) -> Result<(), StardispatchError> {
    let queue_id = self.db.get_queue_by_name(name)?.id;
    Ok(queues::set_test_queue(&mut self.db, queue_id)?)
  }

  pub fn get_test_queue(&mut self) -> Result<Queue, StardispatchError> {
    Ok(self.lifecycle().get_test_queue()?)
  }

  pub fn set_global(&mut self, name: &str, global: bool) -> Result<(), StardispatchError> {
    let queue_id = self.db.get_queue_by_name(name)?.id;
    if global {
      queues::make_global(&mut self.db, queue_id)?;
    } else {
      queues::remove_global(&mut self.db, queue_id)?;
    }
    Ok(())
  }

  pub fn set_queue_community_access(
    &mut self,
    name: &str,
    community_ids: &[i32],
  ) -> Result<(), StardispatchError> {
    let queue_id = self.db.get_queue_by_name(name)?.id;
    Ok(queues::set_queue_community_access(
      &mut self.db,
      queue_id,
      community_ids,
    )?)
  }

  pub fn update_queue_timeouts(
    &mut self,
    name: &str,
    cpu_timeout: Option<i32>,
    wall_timeout: Option<i32>,
  ) -> Result<Queue, StardispatchError> {
    let queue_id = self.db.get_queue_by_name(name)?.id;
    Ok(queues::update_queue_timeouts(
      &mut self.db,
      queue_id,
      cpu_timeout,
      wall_timeout,
    )?)
  }

  // ===========================================================================
  // Pipelines and jobs
  // ===========================================================================

  pub fn define_pipeline_from_file(&mut self, path: &Path) -> Result<FullPipeline, StardispatchError> {
    let draft = parsers::parse_pipeline_from_file(path)?;
    Ok(pipelines::create_pipeline(
      &mut self.db,
      &draft,
      self.config.max_stages_per_pipeline,
    )?)
  }

  pub fn delete_pipeline(&mut self, pipeline_id: i32) -> Result<(), StardispatchError> {
    Ok(pipelines::delete_pipeline(&mut self.db, pipeline_id)?)
  }

  /// Inputs of one stage of a pipeline pair, resolved against the pair's benchmarks.
  pub fn stage_inputs(
    &mut self,
    pair_id: i32,
    stage: i32,
  ) -> Result<Vec<StageInput>, StardispatchError> {
    Ok(pipelines::resolve_pair_stage_inputs(
      &mut self.db,
      pair_id,
      stage,
    )?)
  }

  pub fn submit_job(&mut self, request: &JobRequest) -> Result<Job, StardispatchError> {
    Ok(jobs::submit_job(&mut self.db, request)?)
  }

  pub fn submit_job_from_file(&mut self, path: &Path) -> Result<Job, StardispatchError> {
    let request = parsers::parse_job_from_file(path)?;
    self.submit_job(&request)
  }

  pub fn get_job(&mut self, job_id: i32) -> Result<(Job, Vec<JobSpace>), StardispatchError> {
    let job = self.db.get_job(job_id)?;
    let spaces = self.db.get_job_spaces(&job)?;
    Ok((job, spaces))
  }

  pub fn get_pairs_for_job(&mut self, job_id: i32) -> Result<Vec<JobPair>, StardispatchError> {
    Ok(self.db.get_pairs_for_job(job_id)?)
  }

  pub fn pause_job(&mut self, job_id: i32) -> Result<usize, StardispatchError> {
    Ok(jobs::pause_job(
      &mut self.db,
      self.backend.as_ref(),
      job_id,
    )?)
  }

  pub fn resume_job(&mut self, job_id: i32) -> Result<usize, StardispatchError> {
    Ok(jobs::resume_job(&mut self.db, job_id)?)
  }

  // ===========================================================================
  // Pairs
  // ===========================================================================

  /// A normal update when `force` is false; otherwise the pair and every stage are overwritten.
  pub fn set_pair_status(
    &mut self,
    pair_id: i32,
    stage: Option<i32>,
    status: StatusCode,
    force: bool,
  ) -> Result<(), StardispatchError> {
    if force {
      pairs::set_status_for_pair_and_stages(&mut self.db, pair_id, status)?;
    } else {
      pairs::set_pair_status(&mut self.db, pair_id, stage, status)?;
    }
    Ok(())
  }

  pub fn set_later_stage_status(
    &mut self,
    pair_id: i32,
    stage: i32,
    status: StatusCode,
  ) -> Result<usize, StardispatchError> {
    Ok(pairs::set_later_stage_status(
      &mut self.db,
      pair_id,
      stage,
      status,
    )?)
  }

  pub fn get_pair(
    &mut self,
    pair_id: i32,
  ) -> Result<(JobPair, Vec<JobPairStage>), StardispatchError> {
    let pair = self.db.get_pair(pair_id)?;
    let stages = self.db.get_pair_stages(pair_id)?;
    Ok((pair, stages))
  }

  pub fn bind_pair(
    &mut self,
    pair_id: i32,
    backend_exec_id: Option<i32>,
  ) -> Result<(), StardispatchError> {
    Ok(pairs::update_backend_exec_id(
      &mut self.db,
      pair_id,
      backend_exec_id,
    )?)
  }

  pub fn add_pair_attributes(
    &mut self,
    pair_id: i32,
    stage: i32,
    attributes: &Map<String, Value>,
  ) -> Result<Value, StardispatchError> {
    Ok(pairs::add_stage_attributes(
      &mut self.db,
      pair_id,
      stage,
      attributes,
    )?)
  }

  pub fn pair_correctness(
    &mut self,
    pair_id: i32,
    stage: Option<i32>,
  ) -> Result<Correctness, StardispatchError> {
    Ok(pairs::pair_correctness(&mut self.db, pair_id, stage)?)
  }

  pub fn kill_pair(&mut self, pair_id: i32) -> Result<(), StardispatchError> {
    Ok(pairs::kill_pair(
      &mut self.db,
      self.backend.as_ref(),
      pair_id,
    )?)
  }

  pub fn rerun_pair(&mut self, pair_id: i32) -> Result<(), StardispatchError> {
    Ok(pairs::rerun_pair(&mut self.db, pair_id)?)
  }
}
