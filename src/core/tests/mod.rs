use std::{
  collections::{BTreeMap, HashSet},
  sync::{Arc, Mutex},
};

use tempfile::TempDir;

use crate::core::{
  Stardispatch,
  backends::{BackendClient, BackendError},
  database::{
    Database,
    models::{Job, JobPair, JobStatus, NewJob, NewQueue, PairPlan, Queue, RegistryStatus, SpacePlan},
  },
  stardispatch_configs::StardispatchConfig,
};

/// A fresh project directory with an initialised `.stardispatch` folder.
pub fn init_stardispatch_for_tests() -> TempDir {
  let dir = tempfile::tempdir().unwrap();
  Stardispatch::init(&dir.path().to_path_buf()).unwrap();
  dir
}

pub fn open_test_database() -> (TempDir, Database) {
  let dir = tempfile::tempdir().unwrap();
  let db = Database::new(dir.path()).unwrap();
  (dir, db)
}

pub fn create_test_queue(db: &mut Database, name: &str, timeout: i32) -> Queue {
  db.create_queue(&NewQueue {
    name,
    status: RegistryStatus::Active,
    cpu_timeout: timeout,
    wall_timeout: timeout,
  })
  .unwrap()
}

/// A running job with one space holding `pair_count` pairs of `stages` stages each.
pub fn create_test_job(
  db: &mut Database,
  queue_id: Option<i32>,
  pair_count: usize,
  stages: usize,
) -> (Job, Vec<JobPair>) {
  let new_job = NewJob {
    name: "test_job",
    owner_id: 1,
    queue_id,
    pipeline_id: None,
    status: JobStatus::Running,
    submitted: 1_700_000_000,
    cpu_timeout: 100,
    wall_timeout: 100,
  };
  let spaces = vec![SpacePlan {
    name: "space".to_string(),
    max_stages: stages as i32,
  }];
  let pairs: Vec<PairPlan> = (0..pair_count)
    .map(|i| PairPlan {
      space_index: 0,
      bench_inputs: vec![i as i32 + 1],
      config_id: Some(1),
      primary_stage: 1,
      stage_configs: vec![Some(1); stages],
    })
    .collect();
  let job = db.create_job_with_pairs(&new_job, &spaces, &pairs).unwrap();
  let pairs = db.get_pairs_for_job(job.id).unwrap();
  (job, pairs)
}

pub fn test_config() -> StardispatchConfig {
  StardispatchConfig {
    default_queue: "all.q".to_string(),
    default_timeout: 1000,
    ..StardispatchConfig::default()
  }
}

#[derive(Debug, Default)]
pub struct FakeCluster {
  pub nodes: Vec<String>,
  pub queues: Vec<String>,
  pub associations: BTreeMap<String, String>,
  pub active_ids: HashSet<i32>,
  pub unreachable: bool,
  pub moved_nodes: Vec<(String, String)>,
  pub deleted_queues: Vec<String>,
  pub killed: Vec<i32>,
}

/// In-memory backend that records every mutating call.
#[derive(Debug, Default)]
pub struct FakeBackend {
  pub state: Mutex<FakeCluster>,
}

impl FakeBackend {
  /// `layout` lists `(node, queue)`; queues are created on the fly.
  pub fn new(layout: &[(&str, &str)]) -> Self {
    let mut cluster = FakeCluster::default();
    for (node, queue) in layout {
      cluster.nodes.push(node.to_string());
      if !cluster.queues.iter().any(|q| q == queue) {
        cluster.queues.push(queue.to_string());
      }
      cluster
        .associations
        .insert(node.to_string(), queue.to_string());
    }
    FakeBackend {
      state: Mutex::new(cluster),
    }
  }

  pub fn shared(layout: &[(&str, &str)]) -> Arc<Self> {
    Arc::new(Self::new(layout))
  }

  pub fn set_active_ids(&self, ids: &[i32]) {
    self.state.lock().unwrap().active_ids = ids.iter().copied().collect();
  }

  pub fn set_unreachable(&self, unreachable: bool) {
    self.state.lock().unwrap().unreachable = unreachable;
  }

  pub fn remove_node(&self, node: &str) {
    let mut state = self.state.lock().unwrap();
    state.nodes.retain(|n| n != node);
    state.associations.remove(node);
  }

  pub fn deleted_queues(&self) -> Vec<String> {
    self.state.lock().unwrap().deleted_queues.clone()
  }

  pub fn moved_nodes(&self) -> Vec<(String, String)> {
    self.state.lock().unwrap().moved_nodes.clone()
  }

  pub fn killed(&self) -> Vec<i32> {
    self.state.lock().unwrap().killed.clone()
  }

  fn check_reachable(&self) -> Result<(), BackendError> {
    if self.state.lock().unwrap().unreachable {
      return Err(BackendError::CommandFailed {
        command: "fake".to_string(),
        status: "exit status: 1".to_string(),
        stderr: "backend unreachable".to_string(),
      });
    }
    Ok(())
  }
}

impl BackendClient for FakeBackend {
  fn get_worker_nodes(&self) -> Result<Vec<String>, BackendError> {
    self.check_reachable()?;
    Ok(self.state.lock().unwrap().nodes.clone())
  }

  fn get_queues(&self) -> Result<Vec<String>, BackendError> {
    self.check_reachable()?;
    Ok(self.state.lock().unwrap().queues.clone())
  }

  fn get_node_queue_associations(&self) -> Result<BTreeMap<String, String>, BackendError> {
    self.check_reachable()?;
    Ok(self.state.lock().unwrap().associations.clone())
  }

  fn get_active_execution_ids(&self) -> Result<HashSet<i32>, BackendError> {
    self.check_reachable()?;
    Ok(self.state.lock().unwrap().active_ids.clone())
  }

  fn move_node(&self, node: &str, queue: &str) -> Result<(), BackendError> {
    self.check_reachable()?;
    let mut state = self.state.lock().unwrap();
    state
      .associations
      .insert(node.to_string(), queue.to_string());
    state
      .moved_nodes
      .push((node.to_string(), queue.to_string()));
    Ok(())
  }

  fn delete_queue(&self, queue: &str) -> Result<(), BackendError> {
    self.check_reachable()?;
    let mut state = self.state.lock().unwrap();
    state.queues.retain(|q| q != queue);
    state.associations.retain(|_, q| q != queue);
    state.deleted_queues.push(queue.to_string());
    Ok(())
  }

  fn kill_pair(&self, execution_id: i32) -> Result<(), BackendError> {
    self.check_reachable()?;
    let mut state = self.state.lock().unwrap();
    state.active_ids.remove(&execution_id);
    state.killed.push(execution_id);
    Ok(())
  }
}

// ============================================================================
// Facade
// ============================================================================

mod facade {
  use std::{path::Path, sync::mpsc};

  use super::{FakeBackend, init_stardispatch_for_tests, test_config};
  use crate::core::{
    Stardispatch, StardispatchError,
    database::{
      Database,
      models::{JobStatus, StatusCode},
    },
    pairs::Correctness,
    pipelines::{PipelineError, StageInput},
    queues::QueueError,
    stardispatch_configs::{STARDISPATCH_DIR, get_stardispatch_config},
  };

  const FILES: &str = "src/core/parsers/tests/files";

  fn open(dir: &Path, backend: &std::sync::Arc<FakeBackend>) -> Stardispatch {
    Stardispatch::with_backend(&dir.join(STARDISPATCH_DIR), test_config(), backend.clone())
      .unwrap()
  }

  #[test]
  fn sync_and_queue_administration() {
    let dir = init_stardispatch_for_tests();
    let backend = FakeBackend::shared(&[("n1", "all.q"), ("n2", "Q")]);
    let mut stardispatch = open(dir.path(), &backend);

    let report = stardispatch.sync_cluster().unwrap();
    assert_eq!(report.new_queues, vec!["Q".to_string(), "all.q".to_string()]);
    assert_eq!(stardispatch.get_queue("Q").unwrap().cpu_timeout, 1000);

    stardispatch.set_global("Q", true).unwrap();
    assert!(stardispatch.get_queue("Q").unwrap().global_access);
    assert_eq!(stardispatch.get_test_queue().unwrap().name, "all.q");

    assert!(matches!(
      stardispatch.remove_queue("all.q"),
      Err(StardispatchError::QueueError(QueueError::DefaultQueueRemoval(_)))
    ));
    stardispatch
      .move_nodes(&["n2".to_string()], "all.q")
      .unwrap();
    stardispatch.remove_queue("Q").unwrap();
    let active: Vec<String> = stardispatch
      .get_all_queues(false)
      .unwrap()
      .into_iter()
      .map(|q| q.name)
      .collect();
    assert_eq!(active, vec!["all.q".to_string()]);
    assert_eq!(backend.deleted_queues(), vec!["Q".to_string()]);
  }

  #[test]
  fn submit_and_drive_pairs_from_files() {
    let dir = init_stardispatch_for_tests();
    let backend = FakeBackend::shared(&[("n1", "all.q")]);
    let mut stardispatch = open(dir.path(), &backend);
    stardispatch.sync_cluster().unwrap();

    let pipeline = stardispatch
      .define_pipeline_from_file(&Path::new(FILES).join("pipeline.yaml"))
      .unwrap();
    assert_eq!(pipeline.stages.len(), 3);

    let job = stardispatch
      .submit_job_from_file(&Path::new(FILES).join("job.yaml"))
      .unwrap();
    assert_eq!(job.cpu_timeout, 600);
    assert_eq!(job.wall_timeout, 1000);

    let mut db = Database::new(stardispatch.path()).unwrap();
    let pairs = db.get_pairs_for_job(job.id).unwrap();
    assert_eq!(pairs.len(), 7);
    let pair = pairs[0].id;

    stardispatch
      .set_pair_status(pair, Some(1), StatusCode::Enqueued, false)
      .unwrap();
    stardispatch.bind_pair(pair, Some(41)).unwrap();
    stardispatch
      .set_pair_status(pair, Some(1), StatusCode::Running, false)
      .unwrap();
    assert!(
      stardispatch
        .set_pair_status(pair, None, StatusCode::PendingSubmit, false)
        .is_err()
    );

    let attributes = serde_json::json!({
      "starexec-result": "SAT",
      "starexec-expected-result": "SAT",
    });
    stardispatch
      .add_pair_attributes(pair, 1, attributes.as_object().unwrap())
      .unwrap();
    for status in [StatusCode::Processing, StatusCode::Complete] {
      stardispatch
        .set_pair_status(pair, Some(1), status, false)
        .unwrap();
    }
    assert_eq!(
      stardispatch.pair_correctness(pair, None).unwrap(),
      Correctness::Correct
    );

    stardispatch.rerun_pair(pair).unwrap();
    assert_eq!(
      stardispatch.pair_correctness(pair, None).unwrap(),
      Correctness::Incomplete
    );

    assert_eq!(stardispatch.pause_job(job.id).unwrap(), 7);
    assert_eq!(db.get_job(job.id).unwrap().status, JobStatus::Paused);
    assert_eq!(stardispatch.resume_job(job.id).unwrap(), 7);
  }

  #[test]
  fn pipeline_pairs_resolve_their_stage_inputs() {
    let dir = init_stardispatch_for_tests();
    let backend = FakeBackend::shared(&[("n1", "all.q")]);
    let mut stardispatch = open(dir.path(), &backend);
    stardispatch.sync_cluster().unwrap();
    let pipeline = stardispatch
      .define_pipeline_from_file(&Path::new(FILES).join("pipeline.yaml"))
      .unwrap();
    let job = stardispatch
      .submit_job_from_file(&Path::new(FILES).join("pipeline_job.yaml"))
      .unwrap();

    let (stored, spaces) = stardispatch.get_job(job.id).unwrap();
    assert_eq!(stored.pipeline_id, Some(pipeline.pipeline.id));
    assert_eq!(spaces[0].max_stages, 3);
    let pairs = stardispatch.get_pairs_for_job(job.id).unwrap();
    assert_eq!(pairs.len(), 2);
    let (pair, stages) = stardispatch.get_pair(pairs[1].id).unwrap();
    assert_eq!(pair.primary_stage, 2);
    assert_eq!(stages.len(), 3);

    assert_eq!(
      stardispatch.stage_inputs(pairs[1].id, 2).unwrap(),
      vec![
        StageInput::Artifact(1),
        StageInput::Benchmark(4),
        StageInput::Benchmark(3),
      ]
    );
    assert_eq!(
      stardispatch.stage_inputs(pairs[0].id, 1).unwrap(),
      vec![StageInput::Benchmark(1)]
    );

    stardispatch.delete_pipeline(pipeline.pipeline.id).unwrap();
    assert!(matches!(
      stardispatch.stage_inputs(pairs[0].id, 1),
      Err(StardispatchError::PipelineError(
        PipelineError::PairWithoutPipeline(_)
      ))
    ));
  }

  #[test]
  fn config_updates_are_stored() {
    let dir = init_stardispatch_for_tests();
    let backend = FakeBackend::shared(&[("n1", "all.q")]);
    let mut stardispatch = open(dir.path(), &backend);

    let mut config = stardispatch.config().clone();
    config.broken_pair_sweep_period_secs = 60;
    stardispatch.update_config(config.clone()).unwrap();
    assert_eq!(stardispatch.config(), &config);
    assert_eq!(
      get_stardispatch_config(stardispatch.path()).unwrap(),
      config
    );

    config.default_timeout = 0;
    assert!(stardispatch.update_config(config).is_err());
    assert_eq!(stardispatch.config().broken_pair_sweep_period_secs, 60);
    assert_eq!(stardispatch.config().default_timeout, 1000);
  }

  #[test]
  fn daemon_sweeps_before_shutting_down() {
    let dir = init_stardispatch_for_tests();
    let backend = FakeBackend::shared(&[("n1", "all.q")]);
    let mut stardispatch = open(dir.path(), &backend);
    stardispatch.sync_cluster().unwrap();
    let job = stardispatch
      .submit_job_from_file(&Path::new(FILES).join("job.yaml"))
      .unwrap();

    let mut db = Database::new(stardispatch.path()).unwrap();
    let pairs = db.get_pairs_for_job(job.id).unwrap();
    for (pair, exec_id) in [(pairs[0].id, 5), (pairs[1].id, 6)] {
      stardispatch
        .set_pair_status(pair, None, StatusCode::Enqueued, false)
        .unwrap();
      stardispatch.bind_pair(pair, Some(exec_id)).unwrap();
    }
    backend.set_active_ids(&[6]);

    let (sender, receiver) = mpsc::channel();
    sender.send(()).unwrap();
    stardispatch.run_daemon(&receiver).unwrap();

    assert_eq!(
      db.get_pair(pairs[0].id).unwrap().status,
      StatusCode::ErrorSubmitFail
    );
    assert_eq!(db.get_pair(pairs[1].id).unwrap().status, StatusCode::Enqueued);
  }

  #[test]
  fn kill_pair_cancels_on_backend() {
    let dir = init_stardispatch_for_tests();
    let backend = FakeBackend::shared(&[("n1", "all.q")]);
    let mut stardispatch = open(dir.path(), &backend);
    stardispatch.sync_cluster().unwrap();
    let job = stardispatch
      .submit_job_from_file(&Path::new(FILES).join("job.yaml"))
      .unwrap();

    let mut db = Database::new(stardispatch.path()).unwrap();
    let pair = db.get_pairs_for_job(job.id).unwrap()[0].id;
    stardispatch
      .set_pair_status(pair, None, StatusCode::Enqueued, false)
      .unwrap();
    stardispatch.bind_pair(pair, Some(9)).unwrap();

    stardispatch.kill_pair(pair).unwrap();
    assert_eq!(backend.killed(), vec![9]);
    assert_eq!(db.get_pair(pair).unwrap().status, StatusCode::Killed);
  }
}
