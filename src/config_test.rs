// Unit tests for configuration loading and validation

use super::*;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[test]
fn test_defaults_are_valid() {
    let config = FlowConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.low_fill_threshold, 0.6);
    assert_eq!(config.timeouts.service_call(), Duration::from_secs(30));
    assert_eq!(config.breaker.failure_threshold, 5);
    assert!(!config.shaping.enabled);
    assert_eq!(config.cost_per_call, 0.002);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    fs::write(
        &path,
        r#"{"max_recover_cycles": 2, "breaker": {"failure_threshold": 3}}"#,
    )
    .unwrap();

    let config = FlowConfig::load(Some(&path)).unwrap();
    assert_eq!(config.max_recover_cycles, 2);
    assert_eq!(config.breaker.failure_threshold, 3);
    assert_eq!(config.breaker.cooldown_secs, 30);
    assert_eq!(config.pacing, PacingConfig::default());
}

#[test]
fn test_save_and_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("config.json");
    let mut config = FlowConfig::default();
    config.context = Some("A retired teacher from Lyon".to_string());
    config.save(&path).unwrap();

    assert_eq!(FlowConfig::load(Some(&path)).unwrap(), config);
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("absent.json");
    let err = FlowConfig::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = FlowConfig::default();
    config.low_fill_threshold = 1.5;
    assert_eq!(
        config.validate(),
        Err(ConfigError::NotARatio {
            field: "low_fill_threshold",
            value: 1.5
        })
    );

    let mut config = FlowConfig::default();
    config.pacing.min_delay_ms = 500;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::PacingRange { min: 500, max: 120 })
    ));

    let mut config = FlowConfig::default();
    config.max_concurrent_calls = 0;
    assert_eq!(
        config.validate(),
        Err(ConfigError::Zero {
            field: "max_concurrent_calls"
        })
    );

    let mut config = FlowConfig::default();
    config.shaping.hedging_rate = -0.1;
    assert_eq!(
        config.validate(),
        Err(ConfigError::NotARatio {
            field: "shaping.hedging_rate",
            value: -0.1
        })
    );

    let mut config = FlowConfig::default();
    config.cost_per_call = -0.002;
    assert_eq!(
        config.validate(),
        Err(ConfigError::Negative {
            field: "cost_per_call",
            value: -0.002
        })
    );

    let mut config = FlowConfig::default();
    config.service_url = "not a url".to_string();
    assert!(matches!(config.validate(), Err(ConfigError::ServiceUrl(_))));
}

#[test]
fn test_invalid_file_fails_validation() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.json");
    fs::write(&path, r#"{"max_phase_attempts": 0}"#).unwrap();
    assert!(FlowConfig::load(Some(&path)).is_err());
}
