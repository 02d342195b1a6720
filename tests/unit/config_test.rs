//! Tests for configuration validation

use std::collections::HashMap;

use prometheus_process_pool::config::ENV_PREFIX;
use prometheus_process_pool::{PoolConfig, PoolsConfig, SchedulerKind};

#[test]
fn test_pool_config_validation() {
    let valid = PoolConfig::new().with_processes(2).with_max_tasks_per_child(5);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_processes() {
    let invalid = PoolConfig::new().with_processes(0);
    assert_eq!(
        invalid.validate().unwrap_err(),
        "processes must be greater than 0"
    );
}

#[test]
fn test_pool_config_invalid_concurrency() {
    let invalid = PoolConfig::new().with_child_concurrency(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_crash_limit() {
    let invalid = PoolConfig::new().with_max_consecutive_crashes(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_blank_prefix() {
    let invalid = PoolConfig::new().with_name_prefix("  ");
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_empty_initializer() {
    let invalid = PoolConfig::new().with_initializer("", Vec::new());
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_from_json() {
    let cfg = PoolConfig::from_json_str(
        r#"{
            "processes": 2,
            "scheduler": "least_outstanding",
            "initializer": { "task": "warm_up", "args": [1] },
            "process": { "name_prefix": "cpu" }
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.processes, 2);
    assert_eq!(cfg.scheduler, SchedulerKind::LeastOutstanding);
    assert_eq!(cfg.initializer.as_ref().unwrap().task, "warm_up");
    assert_eq!(cfg.process.name_prefix, "cpu");
    assert!(cfg.process.program.is_none());
}

#[test]
fn test_pool_config_from_json_rejects_invalid() {
    let err = PoolConfig::from_json_str(r#"{ "processes": 0 }"#).unwrap_err();
    assert!(err.contains("processes"));
    let err = PoolConfig::from_json_str("not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_pool_config_from_lookup() {
    let vars: HashMap<String, String> = [
        ("PROCESSES", "6"),
        ("SCHEDULER", "Least-Outstanding"),
        ("SHUTDOWN_TIMEOUT_MS", " 1500 "),
    ]
    .into_iter()
    .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
    .collect();

    let cfg = PoolConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
    assert_eq!(cfg.processes, 6);
    assert_eq!(cfg.scheduler, SchedulerKind::LeastOutstanding);
    assert_eq!(cfg.shutdown_timeout().as_millis(), 1500);
    assert_eq!(cfg.max_tasks_per_child, None);
}

#[test]
fn test_pool_config_from_lookup_unknown_scheduler() {
    let err = PoolConfig::from_lookup(|key| {
        (key == "PROCESS_POOL_SCHEDULER").then(|| "random".to_string())
    })
    .unwrap_err();
    assert!(err.contains("unknown scheduler"));
}

#[test]
fn test_pools_config_validation() {
    let mut pools = HashMap::new();
    pools.insert("cpu".to_string(), PoolConfig::new().with_processes(4));
    pools.insert("io".to_string(), PoolConfig::new().with_processes(1));
    let cfg = PoolsConfig { pools };
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_pools_config_names_bad_pool() {
    let mut pools = HashMap::new();
    pools.insert("broken".to_string(), PoolConfig::new().with_processes(0));
    let err = PoolsConfig { pools }.validate().unwrap_err();
    assert!(err.starts_with("pool `broken` invalid"));
}

#[test]
fn test_pools_config_empty() {
    assert!(PoolsConfig::default().validate().is_err());
    assert!(PoolsConfig::from_json_str(r#"{ "pools": {} }"#).is_err());
}
