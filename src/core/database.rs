pub mod models;
pub mod schema;


use std::{
  collections::{BTreeMap, HashMap},
  path::Path,
};

use chrono::Utc;
use diesel::{connection::SimpleConnection, prelude::*};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::core::{
  cluster::RegistrySnapshot,
  pipelines::{FullPipeline, FullStage, PipelineDraft},
};

use self::{
  models::{
    Job, JobPair, JobPairStage, JobSpace, JobStatus, NewJob, NewJobPair, NewJobPairStage,
    NewJobSpace, NewPipelineDependency, NewPipelineStage, NewQueue, NewSolverPipeline,
    NewWorkerNode, PairPlan, PipelineDependency, PipelineStage, Queue, RegistryStatus,
    SolverPipeline, SpacePlan, StatusCode, WorkerNode,
  },
  schema::{
    job_pair_stages, job_pairs, job_spaces, jobs, pipeline_dependencies, pipeline_stages,
    queue_community_access, queues, solver_pipelines, worker_nodes,
  },
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("Database path is not valid UTF-8: {0}")]
  InvalidPath(String),
  #[error("Could not connect to database: {0}")]
  ConnectionError(#[from] diesel::ConnectionError),
  #[error("Database migration error: {0}")]
  MigrationError(#[from] Box<dyn std::error::Error + Send + Sync>),
  #[error("Database operation error: {0}")]
  OperationError(#[from] diesel::result::Error),
  #[error("{0} not found")]
  NotFound(String),
  #[error("Inconsistent data: {0}")]
  InvalidData(String),
}

pub struct Database {
  conn: SqliteConnection,
}

impl Database {
  pub fn new(path: &Path) -> Result<Self, StorageError> {
    let path = path.join("stardispatch.db");
    let database_url = path
      .to_str()
      .ok_or_else(|| StorageError::InvalidPath(path.display().to_string()))?;
    let mut conn = SqliteConnection::establish(database_url)?;
    // Two connections (the caller and the cluster sync worker) share this file.
    conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
    conn
      .run_pending_migrations(MIGRATIONS)
      .map_err(StorageError::MigrationError)?;

    debug!("Connected to database at {}.", database_url);
    Ok(Database { conn })
  }

  // ===========================================================================
  // Worker nodes
  // ===========================================================================

  pub fn get_all_nodes(&mut self) -> Result<Vec<WorkerNode>, StorageError> {
    Ok(
      worker_nodes::table
        .order(worker_nodes::name)
        .select(WorkerNode::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn get_node(&mut self, node_id: i32) -> Result<WorkerNode, StorageError> {
    worker_nodes::table
      .find(node_id)
      .select(WorkerNode::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Worker node {}", node_id)))
  }

  pub fn get_node_by_name(&mut self, node_name: &str) -> Result<WorkerNode, StorageError> {
    worker_nodes::table
      .filter(worker_nodes::name.eq(node_name))
      .select(WorkerNode::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Worker node '{}'", node_name)))
  }

  pub fn get_nodes_for_queue(&mut self, queue_id: i32) -> Result<Vec<WorkerNode>, StorageError> {
    Ok(
      worker_nodes::table
        .filter(worker_nodes::queue_id.eq(queue_id))
        .order(worker_nodes::name)
        .select(WorkerNode::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn set_node_queue(
    &mut self,
    node_id: i32,
    queue_id: Option<i32>,
  ) -> Result<(), StorageError> {
    let updated = diesel::update(worker_nodes::table.find(node_id))
      .set(worker_nodes::queue_id.eq(queue_id))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!("Worker node {}", node_id)));
    }
    Ok(())
  }

  pub fn load_node_snapshot(&mut self) -> Result<RegistrySnapshot, StorageError> {
    let rows = worker_nodes::table
      .select((worker_nodes::name, worker_nodes::status))
      .load::<(String, RegistryStatus)>(&mut self.conn)?;
    Ok(rows.into_iter().collect())
  }

  // ===========================================================================
  // Queues
  // ===========================================================================

  #[cfg(test)]
  pub fn create_queue(&mut self, new_queue: &NewQueue) -> Result<Queue, StorageError> {
    Ok(
      diesel::insert_into(queues::table)
        .values(new_queue)
        .returning(Queue::as_returning())
        .get_result(&mut self.conn)?,
    )
  }

  pub fn get_all_queues(&mut self) -> Result<Vec<Queue>, StorageError> {
    Ok(
      queues::table
        .order(queues::name)
        .select(Queue::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn get_all_active_queues(&mut self) -> Result<Vec<Queue>, StorageError> {
    Ok(
      queues::table
        .filter(queues::status.eq(RegistryStatus::Active))
        .order(queues::name)
        .select(Queue::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn get_queue(&mut self, queue_id: i32) -> Result<Queue, StorageError> {
    queues::table
      .find(queue_id)
      .select(Queue::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Queue {}", queue_id)))
  }

  pub fn get_queue_by_name(&mut self, queue_name: &str) -> Result<Queue, StorageError> {
    queues::table
      .filter(queues::name.eq(queue_name))
      .select(Queue::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Queue '{}'", queue_name)))
  }

  pub fn delete_queue(&mut self, queue_id: i32) -> Result<(), StorageError> {
    let deleted = diesel::delete(queues::table.find(queue_id)).execute(&mut self.conn)?;
    if deleted == 0 {
      return Err(StorageError::NotFound(format!("Queue {}", queue_id)));
    }
    debug!("Deleted queue {} from the database.", queue_id);
    Ok(())
  }

  pub fn update_queue_cpu_timeout(
    &mut self,
    queue_id: i32,
    timeout: i32,
  ) -> Result<(), StorageError> {
    let updated = diesel::update(queues::table.find(queue_id))
      .set(queues::cpu_timeout.eq(timeout))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!("Queue {}", queue_id)));
    }
    Ok(())
  }

  pub fn update_queue_wall_timeout(
    &mut self,
    queue_id: i32,
    timeout: i32,
  ) -> Result<(), StorageError> {
    let updated = diesel::update(queues::table.find(queue_id))
      .set(queues::wall_timeout.eq(timeout))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!("Queue {}", queue_id)));
    }
    Ok(())
  }

  pub fn set_queue_global(&mut self, queue_id: i32, global: bool) -> Result<(), StorageError> {
    let updated = diesel::update(queues::table.find(queue_id))
      .set(queues::global_access.eq(global))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!("Queue {}", queue_id)));
    }
    Ok(())
  }

  /// Clears the test flag on every queue and sets it on `queue_id`, atomically.
  pub fn set_test_queue(&mut self, queue_id: i32) -> Result<(), StorageError> {
    self.conn.transaction(|conn| {
      diesel::update(queues::table)
        .set(queues::is_test_queue.eq(false))
        .execute(conn)?;
      let updated = diesel::update(queues::table.find(queue_id))
        .set(queues::is_test_queue.eq(true))
        .execute(conn)?;
      if updated == 0 {
        return Err(StorageError::NotFound(format!("Queue {}", queue_id)));
      }
      Ok(())
    })
  }

  pub fn get_test_queue(&mut self) -> Result<Option<Queue>, StorageError> {
    Ok(
      queues::table
        .filter(queues::is_test_queue.eq(true))
        .select(Queue::as_select())
        .first(&mut self.conn)
        .optional()?,
    )
  }

  pub fn add_queue_community_access(
    &mut self,
    queue_id: i32,
    community_ids: &[i32],
  ) -> Result<(), StorageError> {
    self.conn.transaction(|conn| {
      for community in community_ids {
        diesel::insert_or_ignore_into(queue_community_access::table)
          .values((
            queue_community_access::queue_id.eq(queue_id),
            queue_community_access::community_id.eq(*community),
          ))
          .execute(conn)?;
      }
      Ok(())
    })
  }

  pub fn get_queue_communities(&mut self, queue_id: i32) -> Result<Vec<i32>, StorageError> {
    Ok(
      queue_community_access::table
        .filter(queue_community_access::queue_id.eq(queue_id))
        .select(queue_community_access::community_id)
        .order(queue_community_access::community_id)
        .load(&mut self.conn)?,
    )
  }

  pub fn load_queue_snapshot(&mut self) -> Result<RegistrySnapshot, StorageError> {
    let rows = queues::table
      .select((queues::name, queues::status))
      .load::<(String, RegistryStatus)>(&mut self.conn)?;
    Ok(rows.into_iter().collect())
  }

  /// Writes nodes, then queues, then node-queue associations as a single unit.
  pub fn apply_cluster_snapshot(
    &mut self,
    nodes: &RegistrySnapshot,
    queues: &RegistrySnapshot,
    associations: &BTreeMap<String, String>,
    default_timeout: i32,
  ) -> Result<(), StorageError> {
    self.conn.transaction(|conn| {
      write_node_snapshot(conn, nodes)?;
      write_queue_snapshot(conn, queues, default_timeout)?;
      write_queue_associations(conn, associations)
    })
  }

  // ===========================================================================
  // Jobs
  // ===========================================================================

  /// Inserts a job, its spaces and its pairs (in the given order) in one transaction.
  pub fn create_job_with_pairs(
    &mut self,
    new_job: &NewJob,
    spaces: &[SpacePlan],
    pairs: &[PairPlan],
  ) -> Result<Job, StorageError> {
    self.conn.transaction(|conn| {
      let job = diesel::insert_into(jobs::table)
        .values(new_job)
        .returning(Job::as_returning())
        .get_result(conn)?;

      let mut space_ids = Vec::with_capacity(spaces.len());
      for space in spaces {
        let space_id = diesel::insert_into(job_spaces::table)
          .values(NewJobSpace {
            job_id: job.id,
            name: &space.name,
            max_stages: space.max_stages,
          })
          .returning(job_spaces::id)
          .get_result::<i32>(conn)?;
        space_ids.push(space_id);
      }

      for plan in pairs {
        let job_space_id = *space_ids.get(plan.space_index).ok_or_else(|| {
          StorageError::InvalidData(format!(
            "pair refers to job space #{} but job '{}' only has {}",
            plan.space_index,
            job.name,
            space_ids.len()
          ))
        })?;
        let pair_id = diesel::insert_into(job_pairs::table)
          .values(NewJobPair {
            job_id: job.id,
            job_space_id,
            bench_inputs: serde_json::Value::from(plan.bench_inputs.clone()),
            config_id: plan.config_id,
            status: StatusCode::PendingSubmit,
            primary_stage: plan.primary_stage,
            cpu_timeout: job.cpu_timeout,
            wall_timeout: job.wall_timeout,
          })
          .returning(job_pairs::id)
          .get_result::<i32>(conn)?;

        for (position, stage_config) in plan.stage_configs.iter().enumerate() {
          diesel::insert_into(job_pair_stages::table)
            .values(NewJobPairStage {
              pair_id,
              stage_number: position as i32 + 1,
              config_id: *stage_config,
              status: StatusCode::PendingSubmit,
              attributes: serde_json::json!({}),
            })
            .execute(conn)?;
        }
        trace!("Created pair {} in job {}.", pair_id, job.id);
      }

      debug!(
        "Created job {} with {} spaces and {} pairs.",
        job.id,
        spaces.len(),
        pairs.len()
      );
      Ok(job)
    })
  }

  pub fn get_job(&mut self, job_id: i32) -> Result<Job, StorageError> {
    jobs::table
      .find(job_id)
      .select(Job::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Job {}", job_id)))
  }

  pub fn get_jobs_running_on_queue(&mut self, queue_id: i32) -> Result<Vec<Job>, StorageError> {
    Ok(
      jobs::table
        .filter(jobs::queue_id.eq(queue_id))
        .filter(jobs::status.eq(JobStatus::Running))
        .order(jobs::id)
        .select(Job::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn get_job_spaces(&mut self, job: &Job) -> Result<Vec<JobSpace>, StorageError> {
    Ok(
      JobSpace::belonging_to(job)
        .order(job_spaces::id)
        .select(JobSpace::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn set_job_status(&mut self, job_id: i32, status: JobStatus) -> Result<(), StorageError> {
    let finished = match status {
      JobStatus::Complete | JobStatus::Killed => Some(Utc::now().timestamp()),
      JobStatus::Running | JobStatus::Paused => None,
    };
    let updated = diesel::update(jobs::table.find(job_id))
      .set((jobs::status.eq(status), jobs::finished.eq(finished)))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!("Job {}", job_id)));
    }
    Ok(())
  }

  /// Sets the job to `job_status` and moves its pairs and stages that are in `from` to `to`.
  /// Returns how many pairs moved.
  pub fn transition_job(
    &mut self,
    job_id: i32,
    job_status: JobStatus,
    from: StatusCode,
    to: StatusCode,
  ) -> Result<usize, StorageError> {
    self.conn.transaction(|conn| {
      let updated = diesel::update(jobs::table.find(job_id))
        .set(jobs::status.eq(job_status))
        .execute(conn)?;
      if updated == 0 {
        return Err(StorageError::NotFound(format!("Job {}", job_id)));
      }

      let job_pair_ids = job_pairs::table
        .filter(job_pairs::job_id.eq(job_id))
        .select(job_pairs::id);
      diesel::update(
        job_pair_stages::table
          .filter(job_pair_stages::pair_id.eq_any(job_pair_ids))
          .filter(job_pair_stages::status.eq(from)),
      )
      .set(job_pair_stages::status.eq(to))
      .execute(conn)?;

      let moved = diesel::update(
        job_pairs::table
          .filter(job_pairs::job_id.eq(job_id))
          .filter(job_pairs::status.eq(from)),
      )
      .set(job_pairs::status.eq(to))
      .execute(conn)?;
      Ok(moved)
    })
  }

  // ===========================================================================
  // Job pairs
  // ===========================================================================

  pub fn get_pair(&mut self, pair_id: i32) -> Result<JobPair, StorageError> {
    job_pairs::table
      .find(pair_id)
      .select(JobPair::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Job pair {}", pair_id)))
  }

  pub fn get_pairs_for_job(&mut self, job_id: i32) -> Result<Vec<JobPair>, StorageError> {
    Ok(
      job_pairs::table
        .filter(job_pairs::job_id.eq(job_id))
        .order(job_pairs::id)
        .select(JobPair::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn get_pairs_by_status(
    &mut self,
    statuses: &[StatusCode],
  ) -> Result<Vec<JobPair>, StorageError> {
    Ok(
      job_pairs::table
        .filter(job_pairs::status.eq_any(statuses.to_vec()))
        .order(job_pairs::id)
        .select(JobPair::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn get_pair_stages(&mut self, pair_id: i32) -> Result<Vec<JobPairStage>, StorageError> {
    Ok(
      job_pair_stages::table
        .filter(job_pair_stages::pair_id.eq(pair_id))
        .order(job_pair_stages::stage_number)
        .select(JobPairStage::as_select())
        .load(&mut self.conn)?,
    )
  }

  pub fn get_pair_stage(
    &mut self,
    pair_id: i32,
    stage_number: i32,
  ) -> Result<JobPairStage, StorageError> {
    job_pair_stages::table
      .find((pair_id, stage_number))
      .select(JobPairStage::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Stage {} of job pair {}", stage_number, pair_id)))
  }

  pub fn set_pair_status(&mut self, pair_id: i32, status: StatusCode) -> Result<(), StorageError> {
    let updated = diesel::update(job_pairs::table.find(pair_id))
      .set(job_pairs::status.eq(status))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!("Job pair {}", pair_id)));
    }
    Ok(())
  }

  pub fn set_pair_stage_status(
    &mut self,
    pair_id: i32,
    stage_number: i32,
    status: StatusCode,
  ) -> Result<(), StorageError> {
    let updated = diesel::update(job_pair_stages::table.find((pair_id, stage_number)))
      .set(job_pair_stages::status.eq(status))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!(
        "Stage {} of job pair {}",
        stage_number, pair_id
      )));
    }
    Ok(())
  }

  /// Sets every stage numbered strictly after `stage_number`. Returns how many stages changed.
  pub fn set_later_stage_status(
    &mut self,
    pair_id: i32,
    stage_number: i32,
    status: StatusCode,
  ) -> Result<usize, StorageError> {
    Ok(
      diesel::update(
        job_pair_stages::table
          .filter(job_pair_stages::pair_id.eq(pair_id))
          .filter(job_pair_stages::stage_number.gt(stage_number)),
      )
      .set(job_pair_stages::status.eq(status))
      .execute(&mut self.conn)?,
    )
  }

  pub fn set_status_for_pair_and_stages(
    &mut self,
    pair_id: i32,
    status: StatusCode,
  ) -> Result<(), StorageError> {
    self.conn.transaction(|conn| {
      let updated = diesel::update(job_pairs::table.find(pair_id))
        .set(job_pairs::status.eq(status))
        .execute(conn)?;
      if updated == 0 {
        return Err(StorageError::NotFound(format!("Job pair {}", pair_id)));
      }
      diesel::update(job_pair_stages::table.filter(job_pair_stages::pair_id.eq(pair_id)))
        .set(job_pair_stages::status.eq(status))
        .execute(conn)?;
      Ok(())
    })
  }

  /// Moves the pair from `expected` to `status` only if it is still in `expected`, along with
  /// its stages that have not finished yet. Returns false when the pair had already moved on.
  pub fn compare_and_set_pair_status(
    &mut self,
    pair_id: i32,
    expected: StatusCode,
    status: StatusCode,
  ) -> Result<bool, StorageError> {
    self.conn.transaction(|conn| {
      let updated = diesel::update(
        job_pairs::table
          .find(pair_id)
          .filter(job_pairs::status.eq(expected)),
      )
      .set(job_pairs::status.eq(status))
      .execute(conn)?;
      if updated == 0 {
        return Ok(false);
      }

      let open_stages = job_pair_stages::table
        .filter(job_pair_stages::pair_id.eq(pair_id))
        .select(JobPairStage::as_select())
        .load(conn)?
        .into_iter()
        .filter(|stage| !stage.status.is_terminal())
        .map(|stage| stage.stage_number)
        .collect::<Vec<_>>();
      diesel::update(
        job_pair_stages::table
          .filter(job_pair_stages::pair_id.eq(pair_id))
          .filter(job_pair_stages::stage_number.eq_any(open_stages)),
      )
      .set(job_pair_stages::status.eq(status))
      .execute(conn)?;
      Ok(true)
    })
  }

  pub fn update_backend_exec_id(
    &mut self,
    pair_id: i32,
    backend_exec_id: Option<i32>,
  ) -> Result<(), StorageError> {
    let updated = diesel::update(job_pairs::table.find(pair_id))
      .set(job_pairs::backend_exec_id.eq(backend_exec_id))
      .execute(&mut self.conn)?;
    if updated == 0 {
      return Err(StorageError::NotFound(format!("Job pair {}", pair_id)));
    }
    Ok(())
  }

  /// Merges `attributes` into the stage's attribute object; existing keys are overwritten.
  pub fn merge_stage_attributes(
    &mut self,
    pair_id: i32,
    stage_number: i32,
    attributes: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<serde_json::Value, StorageError> {
    self.conn.transaction(|conn| {
      let current = job_pair_stages::table
        .find((pair_id, stage_number))
        .select(job_pair_stages::attributes)
        .first::<serde_json::Value>(conn)
        .optional()?
        .ok_or_else(|| {
          StorageError::NotFound(format!("Stage {} of job pair {}", stage_number, pair_id))
        })?;
      let mut merged = match current {
        serde_json::Value::Object(map) => map,
        other => {
          warn!(
            "Attributes of pair {} stage {} were not an object ({}); replacing them.",
            pair_id, stage_number, other
          );
          serde_json::Map::new()
        }
      };
      for (key, value) in attributes {
        merged.insert(key.clone(), value.clone());
      }
      let merged = serde_json::Value::Object(merged);
      diesel::update(job_pair_stages::table.find((pair_id, stage_number)))
        .set(job_pair_stages::attributes.eq(merged.clone()))
        .execute(conn)?;
      Ok(merged)
    })
  }

  /// Puts a pair back to PENDING_SUBMIT with no backend binding, no node and empty stage
  /// attributes.
  pub fn reset_pair(&mut self, pair_id: i32) -> Result<(), StorageError> {
    self.conn.transaction(|conn| {
      let updated = diesel::update(job_pairs::table.find(pair_id))
        .set((
          job_pairs::status.eq(StatusCode::PendingSubmit),
          job_pairs::backend_exec_id.eq(None::<i32>),
          job_pairs::node_id.eq(None::<i32>),
        ))
        .execute(conn)?;
      if updated == 0 {
        return Err(StorageError::NotFound(format!("Job pair {}", pair_id)));
      }
      diesel::update(job_pair_stages::table.filter(job_pair_stages::pair_id.eq(pair_id)))
        .set((
          job_pair_stages::status.eq(StatusCode::PendingSubmit),
          job_pair_stages::attributes.eq(serde_json::json!({})),
        ))
        .execute(conn)?;
      Ok(())
    })
  }

  // ===========================================================================
  // Solver pipelines
  // ===========================================================================

  /// Stores a pipeline with its stages and dependencies. Either everything is written or
  /// nothing is.
  pub fn create_pipeline_graph(
    &mut self,
    draft: &PipelineDraft,
  ) -> Result<FullPipeline, StorageError> {
    let primary_stage = draft.primary_stage().ok_or_else(|| {
      StorageError::InvalidData(format!("pipeline '{}' has no primary stage", draft.name))
    })?;

    self.conn.transaction(|conn| {
      let pipeline = diesel::insert_into(solver_pipelines::table)
        .values(NewSolverPipeline {
          owner_id: draft.owner_id,
          name: &draft.name,
          primary_stage,
          uploaded: Utc::now().timestamp(),
        })
        .returning(SolverPipeline::as_returning())
        .get_result(conn)?;

      let mut stages = Vec::with_capacity(draft.stages.len());
      for (position, draft_stage) in draft.stages.iter().enumerate() {
        let stage = diesel::insert_into(pipeline_stages::table)
          .values(NewPipelineStage {
            pipeline_id: pipeline.id,
            stage_index: position as i32 + 1,
            config_id: draft_stage.config_id,
            is_noop: draft_stage.is_noop(),
            is_primary: draft_stage.is_primary,
          })
          .returning(PipelineStage::as_returning())
          .get_result(conn)?;

        let mut dependencies = Vec::with_capacity(draft_stage.dependencies.len());
        for (slot, dependency) in draft_stage.dependencies.iter().enumerate() {
          let stored = diesel::insert_into(pipeline_dependencies::table)
            .values(NewPipelineDependency {
              stage_id: stage.id,
              dependency_id: dependency.dependency_id,
              dependency_type: dependency.dependency_type,
              input_number: slot as i32 + 1,
            })
            .returning(PipelineDependency::as_returning())
            .get_result(conn)?;
          dependencies.push(stored);
        }
        stages.push(FullStage {
          stage,
          dependencies,
        });
      }

      debug!(
        "Stored pipeline '{}' (id {}) with {} stages.",
        pipeline.name,
        pipeline.id,
        stages.len()
      );
      Ok(FullPipeline { pipeline, stages })
    })
  }

  pub fn get_full_pipeline(&mut self, pipeline_id: i32) -> Result<FullPipeline, StorageError> {
    let pipeline = solver_pipelines::table
      .find(pipeline_id)
      .select(SolverPipeline::as_select())
      .first(&mut self.conn)
      .optional()?
      .ok_or_else(|| StorageError::NotFound(format!("Solver pipeline {}", pipeline_id)))?;

    let stages = PipelineStage::belonging_to(&pipeline)
      .order(pipeline_stages::stage_index)
      .select(PipelineStage::as_select())
      .load(&mut self.conn)?;
    let dependencies = PipelineDependency::belonging_to(&stages)
      .order(pipeline_dependencies::input_number)
      .select(PipelineDependency::as_select())
      .load(&mut self.conn)?;

    let stages = dependencies
      .grouped_by(&stages)
      .into_iter()
      .zip(stages)
      .map(|(dependencies, stage)| FullStage {
        stage,
        dependencies,
      })
      .collect();
    Ok(FullPipeline { pipeline, stages })
  }

  pub fn delete_pipeline(&mut self, pipeline_id: i32) -> Result<(), StorageError> {
    let deleted =
      diesel::delete(solver_pipelines::table.find(pipeline_id)).execute(&mut self.conn)?;
    if deleted == 0 {
      return Err(StorageError::NotFound(format!("Solver pipeline {}", pipeline_id)));
    }
    Ok(())
  }
}

fn write_node_snapshot(
  conn: &mut SqliteConnection,
  snapshot: &RegistrySnapshot,
) -> Result<(), StorageError> {
  diesel::update(worker_nodes::table)
    .set(worker_nodes::status.eq(RegistryStatus::Inactive))
    .execute(conn)?;
  for (node_name, status) in snapshot.iter() {
    diesel::insert_or_ignore_into(worker_nodes::table)
      .values(NewWorkerNode {
        name: node_name,
        status,
      })
      .execute(conn)?;
    diesel::update(worker_nodes::table.filter(worker_nodes::name.eq(node_name)))
      .set(worker_nodes::status.eq(status))
      .execute(conn)?;
    trace!("Node {} is now {}.", node_name, status);
  }
  Ok(())
}

fn write_queue_snapshot(
  conn: &mut SqliteConnection,
  snapshot: &RegistrySnapshot,
  default_timeout: i32,
) -> Result<(), StorageError> {
  diesel::update(queues::table)
    .set(queues::status.eq(RegistryStatus::Inactive))
    .execute(conn)?;
  for (queue_name, status) in snapshot.iter() {
    diesel::insert_or_ignore_into(queues::table)
      .values(NewQueue {
        name: queue_name,
        status,
        cpu_timeout: default_timeout,
        wall_timeout: default_timeout,
      })
      .execute(conn)?;
    diesel::update(queues::table.filter(queues::name.eq(queue_name)))
      .set(queues::status.eq(status))
      .execute(conn)?;
    trace!("Queue {} is now {}.", queue_name, status);
  }
  Ok(())
}

fn write_queue_associations(
  conn: &mut SqliteConnection,
  associations: &BTreeMap<String, String>,
) -> Result<(), StorageError> {
  diesel::update(worker_nodes::table)
    .set(worker_nodes::queue_id.eq(None::<i32>))
    .execute(conn)?;

  let node_ids: HashMap<String, i32> = worker_nodes::table
    .select((worker_nodes::name, worker_nodes::id))
    .load::<(String, i32)>(conn)?
    .into_iter()
    .collect();
  let queue_ids: HashMap<String, i32> = queues::table
    .select((queues::name, queues::id))
    .load::<(String, i32)>(conn)?
    .into_iter()
    .collect();

  for (node_name, queue_name) in associations {
    match (node_ids.get(node_name), queue_ids.get(queue_name)) {
      (Some(node_id), Some(queue_id)) => {
        diesel::update(worker_nodes::table.find(*node_id))
          .set(worker_nodes::queue_id.eq(Some(*queue_id)))
          .execute(conn)?;
      }
      _ => warn!(
        "Skipping association of node '{}' with queue '{}': not registered.",
        node_name, queue_name
      ),
    }
  }
  Ok(())
}
