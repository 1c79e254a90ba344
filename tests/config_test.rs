//! Configuration system tests.

use std::io::Write;
use std::time::Duration;
use tally_lib::core::{AccumulatorConfig, ConfigBuilder, RejectionPolicy, TallyError};
use tally_lib::metrics::DeltaPolicy;

#[test]
fn test_default_config() {
    let config = AccumulatorConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.shard_count >= 1);
    assert_eq!(config.queue_size, 1000);
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.flush_period, Duration::from_secs(15));
    assert_eq!(config.delta_policy, DeltaPolicy::Rebase);
    assert!(config.is_periodic());
}

#[test]
fn test_config_builder() {
    let config = ConfigBuilder::new()
        .shard_count(8)
        .queue_size(256)
        .batch_size(64)
        .flush_period(Duration::from_millis(500))
        .flush_timeout(Duration::from_secs(1))
        .map_capacity(32)
        .rejection_policy(RejectionPolicy::Block {
            timeout: Duration::from_millis(5),
        })
        .delta_policy(DeltaPolicy::Relative)
        .build()
        .unwrap();

    assert_eq!(config.shard_count, 8);
    assert_eq!(config.queue_size, 256);
    assert_eq!(config.batch_size, 64);
    assert_eq!(config.flush_period, Duration::from_millis(500));
    assert_eq!(config.flush_timeout, Duration::from_secs(1));
    assert_eq!(config.map_capacity, 32);
    assert_eq!(config.rejection_policy.as_str(), "block");
    assert_eq!(config.delta_policy, DeltaPolicy::Relative);
}

#[test]
fn test_yaml_config() {
    let yaml = r#"
shard_count: 2
queue_size: 4096
flush_period: 1m
rejection_policy:
  kind: block
  timeout: 25ms
delta_policy: relative
"#;

    let config = ConfigBuilder::new()
        .from_yaml(yaml)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(config.shard_count, 2);
    assert_eq!(config.queue_size, 4096);
    assert_eq!(config.flush_period, Duration::from_secs(60));
    assert_eq!(
        config.rejection_policy,
        RejectionPolicy::Block {
            timeout: Duration::from_millis(25)
        }
    );
    assert_eq!(config.delta_policy, DeltaPolicy::Relative);
    // Unspecified fields keep their defaults
    assert_eq!(config.batch_size, 10);
}

#[test]
fn test_yaml_manual_flush() {
    let config = ConfigBuilder::new()
        .from_yaml("flush_period: 0s\nrejection_policy:\n  kind: discard\n")
        .unwrap()
        .build()
        .unwrap();

    assert!(!config.is_periodic());
    assert_eq!(config.rejection_policy, RejectionPolicy::Discard);
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "shard_count: 3").unwrap();
    writeln!(file, "batch_size: 5").unwrap();

    let config = ConfigBuilder::new()
        .from_file(file.path())
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(config.shard_count, 3);
    assert_eq!(config.batch_size, 5);
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ConfigBuilder::new().from_file(&dir.path().join("absent.yaml"));
    assert!(matches!(result, Err(TallyError::Config(_))));
}

#[test]
fn test_config_validation() {
    let result = ConfigBuilder::new().shard_count(0).build();
    assert!(result.is_err());

    let result = ConfigBuilder::new().queue_size(0).build();
    assert!(result.is_err());

    let result = ConfigBuilder::new()
        .rejection_policy(RejectionPolicy::Block {
            timeout: Duration::ZERO,
        })
        .build();
    assert!(result.is_err());

    // Invalid values in YAML are caught at build time, not parse time
    let result = ConfigBuilder::new()
        .from_yaml("batch_size: 0")
        .unwrap()
        .build();
    match result {
        Err(TallyError::Config(msg)) => assert!(msg.contains("batch_size")),
        other => panic!("Expected config error, got {:?}", other),
    }
}

#[test]
fn test_config_yaml_roundtrip_preserves_policy() {
    let config = ConfigBuilder::new()
        .rejection_policy(RejectionPolicy::Block {
            timeout: Duration::from_millis(40),
        })
        .delta_policy(DeltaPolicy::Absolute)
        .build()
        .unwrap();

    let yaml = serde_yaml::to_string(&config).unwrap();
    let parsed = ConfigBuilder::new()
        .from_yaml(&yaml)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(parsed, config);
}
