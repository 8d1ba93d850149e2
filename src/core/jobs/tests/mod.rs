use crate::core::{
  database::models::{DependencyType, JobStatus, StatusCode},
  distributor::DistributionPolicy,
  jobs::{JobError, JobRequest, SpaceContents, SpaceRequest, pause_job, resume_job, submit_job},
  pipelines::{DraftDependency, DraftStage, PipelineDraft, create_pipeline},
  tests::{FakeBackend, create_test_queue, open_test_database},
};

fn plain_space(name: &str, benchmarks: &[i32], configs: &[i32]) -> SpaceRequest {
  SpaceRequest {
    name: name.to_string(),
    contents: SpaceContents::Plain {
      benchmarks: benchmarks.to_vec(),
      configs: configs.to_vec(),
    },
  }
}

fn request(queue: &str, spaces: Vec<SpaceRequest>) -> JobRequest {
  JobRequest {
    name: "job".to_string(),
    owner_id: 7,
    queue: queue.to_string(),
    policy: DistributionPolicy::RoundRobin,
    cpu_timeout: None,
    wall_timeout: None,
    pipeline_id: None,
    spaces,
  }
}

fn two_input_pipeline() -> PipelineDraft {
  PipelineDraft {
    name: "two-stage".to_string(),
    owner_id: 7,
    stages: vec![
      DraftStage {
        config_id: Some(11),
        is_primary: false,
        dependencies: vec![DraftDependency {
          dependency_type: DependencyType::Benchmark,
          dependency_id: 1,
        }],
      },
      DraftStage {
        config_id: Some(12),
        is_primary: true,
        dependencies: vec![
          DraftDependency {
            dependency_type: DependencyType::Artifact,
            dependency_id: 1,
          },
          DraftDependency {
            dependency_type: DependencyType::Benchmark,
            dependency_id: 2,
          },
        ],
      },
    ],
  }
}

#[test]
fn plain_job_is_benchmark_config_cross_product() {
  let (_dir, mut db) = open_test_database();
  create_test_queue(&mut db, "q", 100);

  let job = submit_job(
    &mut db,
    &request("q", vec![plain_space("s", &[1, 2], &[10, 20])]),
  )
  .unwrap();
  assert_eq!(job.status, JobStatus::Running);

  let pairs = db.get_pairs_for_job(job.id).unwrap();
  let combos: Vec<(serde_json::Value, Option<i32>)> = pairs
    .iter()
    .map(|p| (p.bench_inputs.clone(), p.config_id))
    .collect();
  assert_eq!(
    combos,
    vec![
      (serde_json::json!([1]), Some(10)),
      (serde_json::json!([1]), Some(20)),
      (serde_json::json!([2]), Some(10)),
      (serde_json::json!([2]), Some(20)),
    ]
  );
  for pair in &pairs {
    assert_eq!(pair.status, StatusCode::PendingSubmit);
    assert_eq!(db.get_pair_stages(pair.id).unwrap().len(), 1);
  }
  let spaces = db.get_job_spaces(&job).unwrap();
  assert_eq!(spaces.len(), 1);
  assert_eq!(spaces[0].max_stages, 1);
}

#[test]
fn timeouts_are_capped_by_the_queue() {
  let (_dir, mut db) = open_test_database();
  create_test_queue(&mut db, "q", 100);

  let mut req = request("q", vec![plain_space("s", &[1], &[1])]);
  req.cpu_timeout = Some(50);
  req.wall_timeout = Some(500);
  let job = submit_job(&mut db, &req).unwrap();
  assert_eq!((job.cpu_timeout, job.wall_timeout), (50, 100));

  let pair = &db.get_pairs_for_job(job.id).unwrap()[0];
  assert_eq!((pair.cpu_timeout, pair.wall_timeout), (50, 100));

  req.cpu_timeout = Some(0);
  assert!(matches!(
    submit_job(&mut db, &req),
    Err(JobError::InvalidTimeout(0))
  ));
}

#[test]
fn queue_timeout_change_does_not_touch_existing_pairs() {
  let (_dir, mut db) = open_test_database();
  let queue = create_test_queue(&mut db, "q", 100);
  let job = submit_job(&mut db, &request("q", vec![plain_space("s", &[1], &[1])])).unwrap();

  db.update_queue_cpu_timeout(queue.id, 10).unwrap();
  db.update_queue_wall_timeout(queue.id, 10).unwrap();

  let pair = &db.get_pairs_for_job(job.id).unwrap()[0];
  assert_eq!((pair.cpu_timeout, pair.wall_timeout), (100, 100));
  let later = submit_job(&mut db, &request("q", vec![plain_space("s", &[1], &[1])])).unwrap();
  assert_eq!(later.cpu_timeout, 10);
}

#[test]
fn pairs_are_inserted_in_distribution_order() {
  let (_dir, mut db) = open_test_database();
  create_test_queue(&mut db, "q", 100);
  let spaces = vec![
    plain_space("A", &[1, 2, 3], &[1]),
    plain_space("B", &[4, 5], &[1]),
  ];

  let job = submit_job(&mut db, &request("q", spaces.clone())).unwrap();
  let order: Vec<serde_json::Value> = db
    .get_pairs_for_job(job.id)
    .unwrap()
    .into_iter()
    .map(|p| p.bench_inputs)
    .collect();
  assert_eq!(
    order,
    [1, 4, 2, 5, 3]
      .iter()
      .map(|b| serde_json::json!([b]))
      .collect::<Vec<_>>()
  );

  let mut depth_first = request("q", spaces);
  depth_first.policy = DistributionPolicy::DepthFirst;
  let job = submit_job(&mut db, &depth_first).unwrap();
  let order: Vec<serde_json::Value> = db
    .get_pairs_for_job(job.id)
    .unwrap()
    .into_iter()
    .map(|p| p.bench_inputs)
    .collect();
  assert_eq!(
    order,
    [1, 2, 3, 4, 5]
      .iter()
      .map(|b| serde_json::json!([b]))
      .collect::<Vec<_>>()
  );
}

#[test]
fn missing_queue_is_rejected() {
  let (_dir, mut db) = open_test_database();
  assert!(matches!(
    submit_job(&mut db, &request("nope", vec![plain_space("s", &[1], &[1])])),
    Err(JobError::QueueNotFound(name)) if name == "nope"
  ));
}

#[test]
fn empty_job_is_rejected() {
  let (_dir, mut db) = open_test_database();
  create_test_queue(&mut db, "q", 100);
  assert!(matches!(
    submit_job(&mut db, &request("q", vec![plain_space("s", &[1], &[])])),
    Err(JobError::NoPairs(_))
  ));
}

#[test]
fn pipeline_job_creates_one_stage_row_per_pipeline_stage() {
  let (_dir, mut db) = open_test_database();
  create_test_queue(&mut db, "q", 100);
  let pipeline = create_pipeline(&mut db, &two_input_pipeline(), 10).unwrap();

  let mut req = request(
    "q",
    vec![SpaceRequest {
      name: "s".to_string(),
      contents: SpaceContents::Pipeline {
        inputs: vec![vec![1, 2], vec![3, 4]],
      },
    }],
  );
  req.pipeline_id = Some(pipeline.pipeline.id);
  let job = submit_job(&mut db, &req).unwrap();
  assert_eq!(job.pipeline_id, Some(pipeline.pipeline.id));

  let pairs = db.get_pairs_for_job(job.id).unwrap();
  assert_eq!(pairs.len(), 2);
  assert_eq!(pairs[1].bench_inputs, serde_json::json!([3, 4]));
  assert_eq!(pairs[0].primary_stage, 2);
  assert_eq!(pairs[0].config_id, Some(12));

  let stages = db.get_pair_stages(pairs[0].id).unwrap();
  let configs: Vec<Option<i32>> = stages.iter().map(|s| s.config_id).collect();
  assert_eq!(configs, vec![Some(11), Some(12)]);
  assert_eq!(db.get_job_spaces(&job).unwrap()[0].max_stages, 2);
}

#[test]
fn pipeline_inputs_must_match_required_count() {
  let (_dir, mut db) = open_test_database();
  create_test_queue(&mut db, "q", 100);
  let pipeline = create_pipeline(&mut db, &two_input_pipeline(), 10).unwrap();

  let mut req = request(
    "q",
    vec![SpaceRequest {
      name: "s".to_string(),
      contents: SpaceContents::Pipeline {
        inputs: vec![vec![1, 2], vec![3]],
      },
    }],
  );
  req.pipeline_id = Some(pipeline.pipeline.id);
  assert!(matches!(
    submit_job(&mut db, &req),
    Err(JobError::InputCountMismatch {
      expected: 2,
      found: 1,
      ..
    })
  ));

  let mut mixed = request("q", vec![plain_space("s", &[1], &[1])]);
  mixed.pipeline_id = Some(pipeline.pipeline.id);
  assert!(matches!(
    submit_job(&mut db, &mixed),
    Err(JobError::PlainSpaceInPipelineJob(_))
  ));
}

#[test]
fn pause_cancels_live_pairs_and_resume_resubmits_them() {
  let (_dir, mut db) = open_test_database();
  let backend = FakeBackend::new(&[]);
  create_test_queue(&mut db, "q", 100);
  let job = submit_job(&mut db, &request("q", vec![plain_space("s", &[1, 2, 3], &[1])])).unwrap();
  let pairs = db.get_pairs_for_job(job.id).unwrap();
  db.set_pair_status(pairs[0].id, StatusCode::Enqueued).unwrap();
  db.update_backend_exec_id(pairs[0].id, Some(41)).unwrap();
  db.set_status_for_pair_and_stages(pairs[1].id, StatusCode::Complete)
    .unwrap();
  backend.set_active_ids(&[41]);

  assert_eq!(pause_job(&mut db, &backend, job.id).unwrap(), 2);
  assert_eq!(backend.killed(), vec![41]);
  assert_eq!(db.get_job(job.id).unwrap().status, JobStatus::Paused);
  let statuses: Vec<StatusCode> = db
    .get_pairs_for_job(job.id)
    .unwrap()
    .iter()
    .map(|p| p.status)
    .collect();
  assert_eq!(
    statuses,
    vec![StatusCode::Paused, StatusCode::Complete, StatusCode::Paused]
  );
  let cancelled = db.get_pair(pairs[0].id).unwrap();
  assert_eq!(cancelled.backend_exec_id, None);
  assert_eq!(
    db.get_pair_stage(pairs[0].id, 1).unwrap().status,
    StatusCode::Paused
  );

  // Pausing again changes nothing.
  assert_eq!(pause_job(&mut db, &backend, job.id).unwrap(), 0);
  assert_eq!(backend.killed(), vec![41]);

  assert_eq!(resume_job(&mut db, job.id).unwrap(), 2);
  assert_eq!(db.get_job(job.id).unwrap().status, JobStatus::Running);
  for pair in [pairs[0].id, pairs[2].id] {
    assert_eq!(db.get_pair(pair).unwrap().status, StatusCode::PendingSubmit);
  }
  assert_eq!(
    db.get_pair(pairs[1].id).unwrap().status,
    StatusCode::Complete
  );
}

#[test]
fn pause_survives_unreachable_backend() {
  let (_dir, mut db) = open_test_database();
  let backend = FakeBackend::new(&[]);
  backend.set_unreachable(true);
  create_test_queue(&mut db, "q", 100);
  let job = submit_job(&mut db, &request("q", vec![plain_space("s", &[1], &[1])])).unwrap();
  let pair = db.get_pairs_for_job(job.id).unwrap()[0].id;
  db.set_pair_status(pair, StatusCode::Running).unwrap();
  db.update_backend_exec_id(pair, Some(9)).unwrap();

  assert_eq!(pause_job(&mut db, &backend, job.id).unwrap(), 1);
  assert_eq!(db.get_pair(pair).unwrap().status, StatusCode::Paused);
}

#[test]
fn finished_job_cannot_be_paused() {
  let (_dir, mut db) = open_test_database();
  create_test_queue(&mut db, "q", 100);
  let job = submit_job(&mut db, &request("q", vec![plain_space("s", &[1], &[1])])).unwrap();
  db.set_job_status(job.id, JobStatus::Complete).unwrap();

  assert!(matches!(
    pause_job(&mut db, &FakeBackend::new(&[]), job.id),
    Err(JobError::JobFinished(_, JobStatus::Complete))
  ));
  assert!(db.get_job(job.id).unwrap().finished.is_some());
}
