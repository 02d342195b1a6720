//! Tests for error types

use prometheus_process_pool::PoolError;

#[test]
fn test_remote_execution_error() {
    let err = PoolError::RemoteExecution {
        kind: "ValueError".to_string(),
        message: "bad input".to_string(),
    };
    assert_eq!(
        format!("{}", err),
        "remote execution failed: ValueError: bad input"
    );
    assert!(err.is_remote());
}

#[test]
fn test_worker_lost_error() {
    let err = PoolError::WorkerLost { task_id: 42 };
    assert_eq!(format!("{}", err), "worker lost before task 42 completed");
    assert!(!err.is_remote());
}

#[test]
fn test_pool_closed_error() {
    assert_eq!(format!("{}", PoolError::PoolClosed), "pool has been closed");
}

#[test]
fn test_timeout_error() {
    assert_eq!(format!("{}", PoolError::Timeout), "operation timed out");
}

#[test]
fn test_json_error_converts() {
    let json_err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
    let err: PoolError = json_err.into();
    assert!(matches!(err, PoolError::Serialization(_)));
}

#[test]
fn test_io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err: PoolError = io.into();
    assert_eq!(format!("{}", err), "io error: pipe closed");
}
