use std::io::Write;

use serial_test::serial;

use super::*;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.handler.max_produce_depth, DEFAULT_MAX_PRODUCE_DEPTH);
    assert_eq!(config.feed.redelivery, RetryConfig::for_redelivery());
    assert_eq!(config.feed.recovery_interval_ms, DEFAULT_RECOVERY_INTERVAL_MS);
    assert_eq!(config.retry, RetryConfig::for_commands());
    assert!(config.models.builtin);
    assert!(config.models.paths.is_empty());
}

#[test]
fn test_config_for_test() {
    let config = Config::for_test();
    assert!(!config.models.builtin);
    assert_eq!(config.feed.redelivery, RetryConfig::for_test());
}

#[test]
#[serial]
fn test_load_without_sources_uses_defaults() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let config = Config::load(None).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
#[serial]
fn test_load_from_path() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let file = write_config(
        r#"
models:
  paths: [models/account.yaml]
  builtin: false
handler:
  max_produce_depth: 4
feed:
  recovery_interval_ms: 250
  redelivery:
    min_delay_ms: 5
    max_delay_ms: 50
retry:
  max_attempts: 3
"#,
    );

    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.models.paths, vec![PathBuf::from("models/account.yaml")]);
    assert!(!config.models.builtin);
    assert_eq!(config.handler.max_produce_depth, 4);
    assert_eq!(config.feed.redelivery.min_delay_ms, 5);
    assert_eq!(config.feed.redelivery.max_delay_ms, 50);
    assert_eq!(config.feed.recovery_interval_ms, 250);
    // Unset keys keep their section defaults.
    assert_eq!(config.feed.redelivery.max_attempts, 10);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.min_delay_ms, 10);
}

#[test]
#[serial]
fn test_load_missing_path_fails() {
    std::env::remove_var(CONFIG_ENV_VAR);
    assert!(Config::load(Some("/nonexistent/estate.yaml")).is_err());
}

#[test]
#[serial]
fn test_load_from_env_var_path() {
    let file = write_config("handler:\n  max_produce_depth: 7\n");
    std::env::set_var(CONFIG_ENV_VAR, file.path());

    let result = Config::load(None);
    std::env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(result.unwrap().handler.max_produce_depth, 7);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let file = write_config("handler:\n  max_produce_depth: 7\n");
    std::env::set_var("ESTATE__HANDLER__MAX_PRODUCE_DEPTH", "9");

    let result = Config::load(file.path().to_str());
    std::env::remove_var("ESTATE__HANDLER__MAX_PRODUCE_DEPTH");

    assert_eq!(result.unwrap().handler.max_produce_depth, 9);
}
