use strata_core::config::AppConfig;
use strata_core::error::StrataError;
use strata_core::types::{DegradationLevel, OperationClass};
use strata_test_utils::{minimal_config_toml, temp_config};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[storage]
database_path = "/tmp/strata-test/strata.db"
state_ttl_secs = 120

[checkpoint]
batch_size = 25
max_age_ms = 2000

[executor]
tool_timeout_secs = 5
max_autonomous_steps = 4

[breakers.generation]
failure_threshold = 2
cooldown_ms = 250

[degradation]
window_secs = 60
pinned_level = "minimal"

[gateway]
bind = "0.0.0.0:9999"
batch_size = 5
inbound_per_minute = 30

[decision]
endpoint = "http://localhost:8000/decide"
api_key = "dk-test"
"#;
    let (_dir, path) = temp_config(toml_content);
    let config = AppConfig::load(&path).unwrap();

    assert_eq!(
        config.database_path().to_str().unwrap(),
        "/tmp/strata-test/strata.db"
    );
    assert_eq!(config.storage.state_ttl_secs, 120);
    assert_eq!(config.checkpoint.batch_size, 25);
    assert_eq!(config.executor.max_autonomous_steps, 4);

    let generation = config.breakers.for_class(OperationClass::Generation);
    assert_eq!(generation.failure_threshold, 2);
    assert_eq!(generation.cooldown().as_millis(), 250);
    // Unlisted classes keep their defaults
    assert_eq!(
        config.breakers.for_class(OperationClass::Decision).failure_threshold,
        3
    );

    assert_eq!(config.degradation.pinned_level, Some(DegradationLevel::Minimal));
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert_eq!(config.gateway.inbound_per_minute, 30);

    let decision = config.decision.unwrap();
    assert_eq!(decision.endpoint, "http://localhost:8000/decide");
    assert_eq!(decision.api_key.as_deref(), Some("dk-test"));
    assert_eq!(decision.timeout_secs, 30);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let (_dir, path) = temp_config(minimal_config_toml());
    let config = AppConfig::load(&path).unwrap();

    assert_eq!(config.gateway.bind, "127.0.0.1:0");
    assert_eq!(config.gateway.batch_size, 10);
    assert_eq!(config.checkpoint.batch_size, 10);
    assert_eq!(config.storage.state_ttl_secs, 3600);
    assert!(config.degradation.pinned_level.is_none());
    assert!(config.decision.is_none());
}

#[test]
fn test_env_vars_expand_in_file() {
    std::env::set_var("STRATA_TEST_DECISION_KEY", "from-env");
    let (_dir, path) = temp_config(
        "[decision]\nendpoint = \"http://localhost/decide\"\napi_key = \"${STRATA_TEST_DECISION_KEY}\"\n",
    );
    let config = AppConfig::load(&path).unwrap();
    std::env::remove_var("STRATA_TEST_DECISION_KEY");

    assert_eq!(config.decision.unwrap().api_key.as_deref(), Some("from-env"));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/strata.toml")).unwrap_err();
    assert!(matches!(err, StrataError::ConfigNotFound(_)));
}

#[test]
fn test_unordered_thresholds_rejected() {
    let (_dir, path) = temp_config("[degradation]\nreduced_threshold = 20.0\nminimal_threshold = 10.0\n");
    let err = AppConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("thresholds"));
}

#[test]
fn test_zero_batch_and_breaker_thresholds_rejected() {
    let (_dir, path) = temp_config("[checkpoint]\nbatch_size = 0\n");
    assert!(AppConfig::load(&path).is_err());

    let (_dir, path) = temp_config("[breakers.output]\nsuccess_threshold = 0\n");
    let err = AppConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("output"));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let (_dir, path) = temp_config("[gateway\nbind = ");
    let err = AppConfig::load(&path).unwrap_err();
    assert!(matches!(err, StrataError::Config(_)));
}
