//! Tests for the line-delimited wire format

use prometheus_process_pool::core::protocol::{
    ChildSpec, JobEnvelope, Outcome, ResultEnvelope, WireMessage, WorkRequest, WorkResponse,
};
use prometheus_process_pool::PoolError;
use serde_json::{json, Map};

#[test]
fn test_job_request_wire_shape() {
    let mut kwargs = Map::new();
    kwargs.insert("factor".into(), json!(2));
    let request = WorkRequest::Job(JobEnvelope::new(9, "scale", vec![json!(4)]).with_kwargs(kwargs));

    let line = request.to_line().unwrap();
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);

    let raw: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(
        raw,
        json!({"type": "job", "task_id": 9, "task": "scale", "args": [4], "kwargs": {"factor": 2}})
    );
}

#[test]
fn test_exit_request_wire_shape() {
    assert_eq!(WorkRequest::Exit.to_line().unwrap(), "{\"type\":\"exit\"}\n");
}

#[test]
fn test_job_without_arguments_decodes() {
    let request = WorkRequest::from_line(r#"{"type":"job","task_id":3,"task":"ping"}"#).unwrap();
    assert_eq!(request, WorkRequest::Job(JobEnvelope::new(3, "ping", Vec::new())));
}

#[test]
fn test_child_responses_decode() {
    let started = WorkResponse::from_line(r#"{"type":"started","task_id":5}"#).unwrap();
    assert_eq!(started, WorkResponse::Started { task_id: 5 });

    let failed = WorkResponse::from_line(
        r#"{"type":"result","task_id":5,"outcome":{"status":"err","kind":"ValueError","message":"no"}}"#,
    )
    .unwrap();
    let WorkResponse::Result(envelope) = failed else {
        panic!("Expected a result");
    };
    assert_eq!(envelope.task_id, 5);
    assert!(!envelope.outcome.is_ok());
    match envelope.outcome.into_result() {
        Err(PoolError::RemoteExecution { kind, message }) => {
            assert_eq!(kind, "ValueError");
            assert_eq!(message, "no");
        }
        other => panic!("Expected a remote error, got {other:?}"),
    }
}

#[test]
fn test_handshake_roles() {
    let run = ChildSpec::Run {
        name: "pool-process-1".into(),
        job: JobEnvelope::new(1, "mapper", vec![json!(2)]),
    };
    let raw: serde_json::Value = serde_json::from_str(&run.to_line().unwrap()).unwrap();
    assert_eq!(raw["role"], "run");
    assert_eq!(raw["job"]["task"], "mapper");

    let pool = ChildSpec::from_line(
        r#"{"role":"pool","name":"cpu-worker-2","worker_id":2,"max_tasks":null,"concurrency":1,"initializer":null}"#,
    )
    .unwrap();
    assert_eq!(pool.name(), "cpu-worker-2");
    assert!(matches!(pool, ChildSpec::Pool { worker_id: 2, max_tasks: None, .. }));
}

#[test]
fn test_malformed_lines_are_protocol_errors() {
    for line in ["", "null", "{\"type\":\"bogus\"}", "{\"type\":\"started\"}", "hello"] {
        let err = WorkResponse::from_line(line).unwrap_err();
        assert!(matches!(err, PoolError::Protocol(_)), "line {line:?} gave {err:?}");
    }
}

#[test]
fn test_result_envelope_standalone() {
    let envelope = ResultEnvelope {
        task_id: 1,
        outcome: Outcome::Ok { value: json!([1, 2]) },
    };
    let decoded = ResultEnvelope::from_line(&envelope.to_line().unwrap()).unwrap();
    assert_eq!(decoded, envelope);
}
