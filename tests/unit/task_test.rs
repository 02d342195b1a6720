//! Tests for the task registry and argument decoding

use prometheus_process_pool::core::Outcome;
use prometheus_process_pool::{ok, Args, TaskError, TaskRegistry};
use serde_json::{json, Map};

fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .with_task("add", |args| async move {
            let values: Vec<i64> = args.all()?;
            ok(values.iter().sum::<i64>())
        })
        .with_blocking_task("greet", |args| {
            let name: String = args.arg(0)?;
            let greeting: String = args.kwarg("greeting")?.unwrap_or_else(|| "hello".into());
            ok(format!("{greeting}, {name}"))
        })
        .with_task("reject", |_args| async move {
            Err(TaskError::new("ValueError", "rejected"))
        })
        .with_task("wrap", |_args| async move {
            Err(TaskError::from(anyhow::anyhow!("disk full").context("saving")))
        })
}

#[test]
fn test_registry_names() {
    let registry = registry();
    assert_eq!(registry.len(), 4);
    assert!(registry.contains("greet"));
    assert!(!registry.contains("missing"));
    assert_eq!(registry.names(), vec!["add", "greet", "reject", "wrap"]);
}

#[tokio::test]
async fn test_invoke_async_and_blocking() {
    let registry = registry();

    let sum = registry
        .invoke("add", Args::new(vec![json!(1), json!(2), json!(3)], Map::new()))
        .await;
    assert_eq!(sum, Outcome::Ok { value: json!(6) });

    let mut kwargs = Map::new();
    kwargs.insert("greeting".into(), json!("hi"));
    let greeting = registry
        .invoke("greet", Args::new(vec![json!("ada")], kwargs))
        .await;
    assert_eq!(greeting, Outcome::Ok { value: json!("hi, ada") });
}

#[tokio::test]
async fn test_invoke_failures() {
    let registry = registry();

    let outcome = registry.invoke("reject", Args::default()).await;
    assert_eq!(outcome, Outcome::failure("ValueError", "rejected"));

    let outcome = registry.invoke("greet", Args::default()).await;
    assert!(matches!(outcome, Outcome::Err { ref kind, .. } if kind == "TypeError"));

    let outcome = registry
        .invoke("add", Args::new(vec![json!("one")], Map::new()))
        .await;
    assert!(matches!(outcome, Outcome::Err { ref kind, .. } if kind == "TypeError"));

    let outcome = registry.invoke("wrap", Args::default()).await;
    assert_eq!(outcome, Outcome::failure("Error", "saving: disk full"));

    let outcome = registry.invoke("nope", Args::default()).await;
    assert!(matches!(outcome, Outcome::Err { ref kind, .. } if kind == "UnknownTask"));
}

#[test]
fn test_args_accessors() {
    let args = Args::new(vec![json!(1), json!("two")], Map::new());
    assert_eq!(args.len(), 2);
    assert_eq!(args.arg::<i32>(0).unwrap(), 1);
    assert!(args.arg::<i32>(1).is_err());
    assert!(args.arg::<i32>(5).is_err());
    assert_eq!(args.kwarg::<i32>("missing").unwrap(), None);
    assert!(Args::default().is_empty());
}
