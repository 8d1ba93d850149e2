use super::schema::{
  job_pair_stages, job_pairs, job_spaces, jobs, pipeline_dependencies, pipeline_stages, queues,
  solver_pipelines, worker_nodes,
};
use diesel::{
  backend::Backend,
  deserialize::{FromSql, FromSqlRow},
  expression::AsExpression,
  prelude::*,
  serialize::{Output, ToSql},
  sql_types::Integer,
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Stores an enum as its integer code. Codes are part of the on-disk format and must never be
/// renumbered.
macro_rules! integer_sql_enum {
  ($name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
    impl $name {
      pub fn code(&self) -> i32 {
        match self {
          $($name::$variant => $code,)+
        }
      }

      pub fn from_code(code: i32) -> Option<Self> {
        match code {
          $($code => Some($name::$variant),)+
          _ => None,
        }
      }
    }

    impl<DB> FromSql<Integer, DB> for $name
    where
      DB: Backend,
      i32: FromSql<Integer, DB>,
    {
      fn from_sql(bytes: DB::RawValue<'_>) -> diesel::deserialize::Result<Self> {
        let code = i32::from_sql(bytes)?;
        $name::from_code(code)
          .ok_or_else(|| format!("Unrecognized {} variant {}", stringify!($name), code).into())
      }
    }

    impl<DB> ToSql<Integer, DB> for $name
    where
      DB: Backend,
      i32: ToSql<Integer, DB>,
    {
      fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, DB>) -> diesel::serialize::Result {
        match self {
          $($name::$variant => <i32 as ToSql<Integer, DB>>::to_sql(&$code, out),)+
        }
      }
    }
  };
}

/// Liveness of a node or queue as last observed on the backend.
#[derive(
  FromSqlRow, AsExpression, Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display,
)]
#[diesel(sql_type = Integer)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryStatus {
  Inactive,
  Active,
}

integer_sql_enum!(RegistryStatus {
  Inactive = 0,
  Active = 1,
});

#[derive(
  FromSqlRow,
  AsExpression,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  EnumString,
  Display,
  Serialize,
  Deserialize,
)]
#[diesel(sql_type = Integer)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
  Running,
  Paused,
  Killed,
  Complete,
}

integer_sql_enum!(JobStatus {
  Running = 0,
  Paused = 1,
  Killed = 2,
  Complete = 3,
});

/// Status of a job pair or of one of its stages. The allowed moves between codes live in
/// `core::pairs`.
#[derive(
  FromSqlRow,
  AsExpression,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  EnumString,
  Display,
  Serialize,
  Deserialize,
)]
#[diesel(sql_type = Integer)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
  StatusUnknown,
  PendingSubmit,
  Enqueued,
  Running,
  Complete,
  ErrorStats,
  ErrorRunscript,
  ErrorBenchmark,
  ErrorEnvironment,
  ErrorGeneral,
  ExceedRuntime,
  ExceedCpu,
  ExceedFileWrite,
  ExceedMem,
  ErrorSubmitFail,
  ErrorResults,
  Killed,
  Paused,
  NotReached,
  Processing,
}

integer_sql_enum!(StatusCode {
  StatusUnknown = 0,
  PendingSubmit = 1,
  Enqueued = 2,
  Running = 4,
  Complete = 7,
  ErrorStats = 8,
  ErrorRunscript = 9,
  ErrorBenchmark = 10,
  ErrorEnvironment = 11,
  ErrorGeneral = 12,
  ExceedRuntime = 13,
  ExceedCpu = 14,
  ExceedFileWrite = 15,
  ExceedMem = 16,
  ErrorSubmitFail = 17,
  ErrorResults = 18,
  Killed = 19,
  Paused = 20,
  NotReached = 21,
  Processing = 22,
});

#[derive(
  FromSqlRow,
  AsExpression,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  EnumString,
  Display,
  Serialize,
  Deserialize,
)]
#[diesel(sql_type = Integer)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
  Benchmark,
  Artifact,
}

integer_sql_enum!(DependencyType {
  Benchmark = 1,
  Artifact = 2,
});

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = queues)]
pub struct Queue {
  pub id: i32,
  pub name: String,
  pub status: RegistryStatus,
  pub cpu_timeout: i32,
  pub wall_timeout: i32,
  pub global_access: bool,
  pub is_test_queue: bool,
}

#[derive(Insertable)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = queues)]
pub struct NewQueue<'a> {
  pub name: &'a str,
  pub status: RegistryStatus,
  pub cpu_timeout: i32,
  pub wall_timeout: i32,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Queue))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = worker_nodes)]
pub struct WorkerNode {
  pub id: i32,
  pub name: String,
  pub status: RegistryStatus,
  pub queue_id: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = worker_nodes)]
pub struct NewWorkerNode<'a> {
  pub name: &'a str,
  pub status: RegistryStatus,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = jobs)]
pub struct Job {
  pub id: i32,
  pub name: String,
  pub owner_id: i32,
  pub queue_id: Option<i32>,
  pub pipeline_id: Option<i32>,
  pub status: JobStatus,
  pub submitted: i64,
  pub finished: Option<i64>,
  pub cpu_timeout: i32,
  pub wall_timeout: i32,
}

#[derive(Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob<'a> {
  pub name: &'a str,
  pub owner_id: i32,
  pub queue_id: Option<i32>,
  pub pipeline_id: Option<i32>,
  pub status: JobStatus,
  pub submitted: i64,
  pub cpu_timeout: i32,
  pub wall_timeout: i32,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Job))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = job_spaces)]
pub struct JobSpace {
  pub id: i32,
  pub job_id: i32,
  pub name: String,
  pub max_stages: i32,
}

#[derive(Insertable)]
#[diesel(table_name = job_spaces)]
pub struct NewJobSpace<'a> {
  pub job_id: i32,
  pub name: &'a str,
  pub max_stages: i32,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Job))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = job_pairs)]
pub struct JobPair {
  pub id: i32,
  pub job_id: i32,
  pub job_space_id: i32,
  pub bench_inputs: serde_json::Value,
  pub config_id: Option<i32>,
  pub backend_exec_id: Option<i32>,
  pub status: StatusCode,
  pub primary_stage: i32,
  // Copied from the job when the pair is created and never refreshed afterwards.
  pub cpu_timeout: i32,
  pub wall_timeout: i32,
  pub node_id: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = job_pairs)]
pub struct NewJobPair {
  pub job_id: i32,
  pub job_space_id: i32,
  pub bench_inputs: serde_json::Value,
  pub config_id: Option<i32>,
  pub status: StatusCode,
  pub primary_stage: i32,
  pub cpu_timeout: i32,
  pub wall_timeout: i32,
}

#[derive(Queryable, Selectable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(JobPair, foreign_key = pair_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = job_pair_stages)]
pub struct JobPairStage {
  pub pair_id: i32,
  pub stage_number: i32,
  pub config_id: Option<i32>,
  pub status: StatusCode,
  pub attributes: serde_json::Value,
}

#[derive(Insertable)]
#[diesel(table_name = job_pair_stages)]
pub struct NewJobPairStage {
  pub pair_id: i32,
  pub stage_number: i32,
  pub config_id: Option<i32>,
  pub status: StatusCode,
  pub attributes: serde_json::Value,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = solver_pipelines)]
pub struct SolverPipeline {
  pub id: i32,
  pub owner_id: i32,
  pub name: String,
  pub primary_stage: i32,
  pub uploaded: i64,
}

#[derive(Insertable)]
#[diesel(table_name = solver_pipelines)]
pub struct NewSolverPipeline<'a> {
  pub owner_id: i32,
  pub name: &'a str,
  pub primary_stage: i32,
  pub uploaded: i64,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(SolverPipeline, foreign_key = pipeline_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = pipeline_stages)]
pub struct PipelineStage {
  pub id: i32,
  pub pipeline_id: i32,
  pub stage_index: i32,
  pub config_id: Option<i32>,
  pub is_noop: bool,
  pub is_primary: bool,
}

#[derive(Insertable)]
#[diesel(table_name = pipeline_stages)]
pub struct NewPipelineStage {
  pub pipeline_id: i32,
  pub stage_index: i32,
  pub config_id: Option<i32>,
  pub is_noop: bool,
  pub is_primary: bool,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, PartialEq)]
#[diesel(belongs_to(PipelineStage, foreign_key = stage_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = pipeline_dependencies)]
pub struct PipelineDependency {
  pub id: i32,
  pub stage_id: i32,
  pub dependency_id: i32,
  pub dependency_type: DependencyType,
  pub input_number: i32,
}

#[derive(Insertable)]
#[diesel(table_name = pipeline_dependencies)]
pub struct NewPipelineDependency {
  pub stage_id: i32,
  pub dependency_id: i32,
  pub dependency_type: DependencyType,
  pub input_number: i32,
}

/// A job space to create alongside a job.
#[derive(Debug, Clone, PartialEq)]
pub struct SpacePlan {
  pub name: String,
  pub max_stages: i32,
}

/// A pair to create alongside a job. `space_index` points into the job's `SpacePlan` list
/// since space ids only exist once the spaces are inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct PairPlan {
  pub space_index: usize,
  pub bench_inputs: Vec<i32>,
  pub config_id: Option<i32>,
  pub primary_stage: i32,
  pub stage_configs: Vec<Option<i32>>,
}
