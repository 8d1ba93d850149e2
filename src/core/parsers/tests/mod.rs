use std::path::{Path, PathBuf};

use crate::core::{
  database::models::DependencyType,
  distributor::DistributionPolicy,
  jobs::SpaceContents,
  parsers::{
    ParserError, parse_job, parse_job_from_file, parse_pipeline, parse_pipeline_from_file,
    utils::load_yaml_from_str,
  },
};

fn test_file(name: &str) -> PathBuf {
  Path::new(file!()).parent().unwrap().join("files").join(name)
}

#[test]
fn parse_pipeline_file() {
  let draft = parse_pipeline_from_file(&test_file("pipeline.yaml")).unwrap();
  assert_eq!(draft.name, "preprocess-and-solve");
  assert_eq!(draft.owner_id, 3);
  assert_eq!(draft.stages.len(), 3);
  assert_eq!(draft.primary_stage(), Some(2));
  assert!(draft.stages[2].is_noop());

  let inputs: Vec<(DependencyType, i32)> = draft.stages[1]
    .dependencies
    .iter()
    .map(|d| (d.dependency_type, d.dependency_id))
    .collect();
  assert_eq!(
    inputs,
    vec![
      (DependencyType::Artifact, 1),
      (DependencyType::Benchmark, 2),
      (DependencyType::Benchmark, 1),
    ]
  );
  assert!(draft.validate(10).is_ok());
}

#[test]
fn stage_input_needs_exactly_one_kind() {
  let yaml = load_yaml_from_str(
    "name: p\nowner: 1\nstages:\n  - config: 1\n    primary: true\n    inputs:\n      - benchmark: 1\n        stage: 1\n",
  )
  .unwrap();
  assert!(matches!(
    parse_pipeline(&yaml),
    Err(ParserError::InvalidValue(_))
  ));
}

#[test]
fn noop_stage_with_config_is_rejected() {
  let yaml =
    load_yaml_from_str("name: p\nowner: 1\nstages:\n  - noop: true\n    config: 4\n").unwrap();
  assert!(parse_pipeline(&yaml).is_err());
}

#[test]
fn missing_and_mistyped_keys() {
  let yaml = load_yaml_from_str("owner: 1\nstages: []\n").unwrap();
  assert!(matches!(
    parse_pipeline(&yaml),
    Err(ParserError::MissingKey(key)) if key == "name"
  ));

  let yaml = load_yaml_from_str("name: p\nowner: one\nstages: []\n").unwrap();
  assert!(matches!(
    parse_pipeline(&yaml),
    Err(ParserError::WrongType(_, _))
  ));
}

#[test]
fn parse_plain_job_file() {
  let request = parse_job_from_file(&test_file("job.yaml")).unwrap();
  assert_eq!(request.name, "nightly-sat");
  assert_eq!(request.owner_id, 7);
  assert_eq!(request.queue, "all.q");
  assert_eq!(request.policy, DistributionPolicy::DepthFirst);
  assert_eq!(request.cpu_timeout, Some(600));
  assert_eq!(request.wall_timeout, None);
  assert_eq!(request.pipeline_id, None);
  assert_eq!(request.spaces.len(), 2);
  assert_eq!(
    request.spaces[0].contents,
    SpaceContents::Plain {
      benchmarks: vec![1, 2, 3],
      configs: vec![10, 11],
    }
  );
}

#[test]
fn parse_pipeline_job_file() {
  let request = parse_job_from_file(&test_file("pipeline_job.yaml")).unwrap();
  assert_eq!(request.policy, DistributionPolicy::RoundRobin);
  assert_eq!(request.pipeline_id, Some(1));
  assert_eq!(request.wall_timeout, Some(120));
  assert_eq!(
    request.spaces[0].contents,
    SpaceContents::Pipeline {
      inputs: vec![vec![1, 2], vec![3, 4]],
    }
  );
}

#[test]
fn unknown_policy_is_rejected() {
  let yaml =
    load_yaml_from_str("name: j\nowner: 1\nqueue: q\npolicy: random\nspaces: []\n").unwrap();
  assert!(matches!(parse_job(&yaml), Err(ParserError::InvalidValue(_))));
}

#[test]
fn empty_document_is_reported() {
  assert!(matches!(load_yaml_from_str(""), Err(ParserError::YamlEmpty)));
}
