use crate::core::{
  backends::BackendKind,
  stardispatch_configs::{
    STARDISPATCH_DIR, StardispatchConfig, StardispatchConfigError, get_stardispatch_config,
    init_stardispatch_config, init_stardispatch_dir, set_stardispatch_config,
  },
};

#[test]
fn stardispatch_init_test() {
  let temp_dir = tempfile::tempdir().unwrap();
  let path = init_stardispatch_dir(temp_dir.path()).unwrap();
  assert_eq!(path, temp_dir.path().join(STARDISPATCH_DIR));
  assert!(path.join("stardispatch.conf").exists());
  assert!(path.join("stardispatch.db").exists());
}

#[test]
fn defaults_are_written_on_init() {
  let temp_dir = tempfile::tempdir().unwrap();
  init_stardispatch_config(temp_dir.path()).unwrap();
  let config = get_stardispatch_config(temp_dir.path()).unwrap();
  assert_eq!(config, StardispatchConfig::default());
  assert_eq!(config.default_queue, "all.q");
  assert_eq!(config.default_timeout, 259_200);
  assert_eq!(config.backend, BackendKind::Local);
}

#[test]
fn set_and_get_config() {
  let temp_dir = tempfile::tempdir().unwrap();
  init_stardispatch_config(temp_dir.path()).unwrap();

  let config = StardispatchConfig {
    backend: BackendKind::Slurm,
    default_queue: "batch".to_string(),
    broken_pair_sweep_period_secs: 60,
    ..StardispatchConfig::default()
  };
  set_stardispatch_config(temp_dir.path(), &config).unwrap();
  assert_eq!(get_stardispatch_config(temp_dir.path()).unwrap(), config);
}

#[test]
fn init_keeps_existing_config() {
  let temp_dir = tempfile::tempdir().unwrap();
  let path = init_stardispatch_dir(temp_dir.path()).unwrap();
  let config = StardispatchConfig {
    default_queue: "batch".to_string(),
    ..StardispatchConfig::default()
  };
  set_stardispatch_config(&path, &config).unwrap();

  init_stardispatch_dir(temp_dir.path()).unwrap();
  assert_eq!(get_stardispatch_config(&path).unwrap().default_queue, "batch");
}

#[test]
fn missing_config_is_reported() {
  let temp_dir = tempfile::tempdir().unwrap();
  assert!(matches!(
    get_stardispatch_config(temp_dir.path()),
    Err(StardispatchConfigError::StardispatchConfigNotFound)
  ));
}

#[test]
fn invalid_values_are_rejected() {
  let temp_dir = tempfile::tempdir().unwrap();
  let config = StardispatchConfig {
    default_timeout: 0,
    ..StardispatchConfig::default()
  };
  assert!(matches!(
    set_stardispatch_config(temp_dir.path(), &config),
    Err(StardispatchConfigError::InvalidConfig(_))
  ));

  let config = StardispatchConfig {
    default_queue: " ".to_string(),
    ..StardispatchConfig::default()
  };
  assert!(config.validate().is_err());
}
