use super::*;

#[test]
fn config_deserializes_full_env() {
    let env = vec![
        ("RUST_LOG".to_string(), "debug".to_string()),
        ("PIPELINE".to_string(), "api".to_string()),
        ("JOB".to_string(), "api-12".to_string()),
        ("STAGES".to_string(), "build,push".to_string()),
        ("LOG_DIR".to_string(), "/buildline".to_string()),
        ("START_SENTINEL".to_string(), "GO".to_string()),
        ("SUCCESS_SENTINEL".to_string(), "DONE".to_string()),
        ("FAILURE_SENTINEL".to_string(), "DEAD".to_string()),
        ("ITERATION".to_string(), "12".to_string()),
        ("POLL_INTERVAL_MS".to_string(), "250".to_string()),
        ("TIME_LIMIT_SECONDS".to_string(), "3600".to_string()),
        ("INFLUXDB_URL".to_string(), "http://influxdb:8086".to_string()),
        ("INFLUXDB_DATABASE".to_string(), "builds".to_string()),
    ];
    let config: Config = envy::from_iter(env).expect("full env must deserialize");

    assert_eq!(config.pipeline, "api");
    assert_eq!(config.job, "api-12");
    assert_eq!(config.stage_names(), vec!["build", "push"]);
    assert_eq!(config.start_sentinel, "GO");
    assert_eq!(config.success_sentinel, "DONE");
    assert_eq!(config.failure_sentinel, "DEAD");
    assert_eq!(config.iteration, 12);
    assert_eq!(config.poll_interval_ms, 250);
    assert_eq!(config.time_limit_seconds, Some(3600));
    assert_eq!(config.influxdb_url.as_deref(), Some("http://influxdb:8086"));
    assert_eq!(config.influxdb_database, "builds");
}

#[test]
fn config_applies_defaults_for_sparse_env() {
    let env = vec![
        ("RUST_LOG".to_string(), "info".to_string()),
        ("PIPELINE".to_string(), "api".to_string()),
        ("JOB".to_string(), "api-1".to_string()),
        ("STAGES".to_string(), "build".to_string()),
        ("LOG_DIR".to_string(), "/buildline".to_string()),
    ];
    let config: Config = envy::from_iter(env).expect("sparse env must deserialize");

    assert_eq!(config.start_sentinel, buildline_core::protocol::DEFAULT_START_SENTINEL);
    assert_eq!(config.success_sentinel, buildline_core::protocol::DEFAULT_SUCCESS_SENTINEL);
    assert_eq!(config.failure_sentinel, buildline_core::protocol::DEFAULT_FAILURE_SENTINEL);
    assert_eq!(config.iteration, 0);
    assert_eq!(config.poll_interval_ms, 100);
    assert_eq!(config.time_limit_seconds, None);
    assert!(config.influxdb_url.is_none());
    assert_eq!(config.influxdb_database, "buildline");
}

#[test]
fn stage_names_preserve_declared_order() {
    let env = vec![
        ("RUST_LOG".to_string(), "info".to_string()),
        ("PIPELINE".to_string(), "api".to_string()),
        ("JOB".to_string(), "api-1".to_string()),
        ("STAGES".to_string(), "zeta, alpha ,mid".to_string()),
        ("LOG_DIR".to_string(), "/buildline".to_string()),
    ];
    let config: Config = envy::from_iter(env).expect("env must deserialize");

    // Declared order is the execution order, never sorted.
    assert_eq!(config.stage_names(), vec!["zeta", "alpha", "mid"]);
}
