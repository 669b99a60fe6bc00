//! DAG definition tests: wire format, write-time validation, schedules.

use std::collections::HashMap;

use cascade_core::dag::{
    Dag, DagGraph, DagSchedule, DelayTaskConfig, Edge, HttpTaskConfig, Node, NodeConfig,
    RetryPolicy, Schedule, TransformTaskConfig, WebhookTaskConfig,
};
use cascade_core::ErrorCode;
use uuid::Uuid;

fn sample_dag() -> Dag {
    let fetch = Node::new(
        "fetch",
        NodeConfig::Http(HttpTaskConfig {
            url: "https://api.example.com/items".to_string(),
            method: "GET".to_string(),
            headers: HashMap::from([("Accept".to_string(), "application/json".to_string())]),
            query: HashMap::new(),
            body: None,
            timeout_ms: Some(10_000),
        }),
    )
    .with_display_name("Fetch items");

    let shape = Node::new(
        "shape",
        NodeConfig::Transform(TransformTaskConfig {
            expression: "length(input.body)".to_string(),
        }),
    );

    let notify = Node::new(
        "notify",
        NodeConfig::Webhook(WebhookTaskConfig {
            url: "https://hooks.example.com/items".to_string(),
            payload: None,
            secret: Some("shhh".to_string()),
            signature_header: "X-Cascade-Signature".to_string(),
        }),
    )
    .with_retry(RetryPolicy {
        max_attempts: 5,
        backoff_ms: 1000,
    });

    Dag::new(
        Uuid::new_v4(),
        "item-sync",
        DagGraph::new(
            vec![fetch, shape, notify],
            vec![Edge::new("fetch", "shape"), Edge::new("shape", "notify")],
        ),
    )
    .unwrap()
    .with_schedule(DagSchedule::cron("0 6 * * *", Some("Europe/Oslo".to_string())))
}

#[test]
fn dag_json_round_trip_preserves_structure() {
    let dag = sample_dag();
    let json = serde_json::to_value(&dag).unwrap();

    // Node wire shape: {id, displayName, kind, config}.
    assert_eq!(json["graph"]["nodes"][0]["kind"], "http");
    assert_eq!(
        json["graph"]["nodes"][0]["config"]["url"],
        "https://api.example.com/items"
    );
    assert_eq!(json["schedule"]["type"], "cron");
    assert_eq!(json["schedule"]["expression"], "0 6 * * *");

    let parsed: Dag = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.graph.len(), 3);
    assert_eq!(parsed.graph.nodes[2].retry.as_ref().unwrap().max_attempts, 5);
    assert!(matches!(parsed.schedule.schedule, Schedule::Cron { .. }));
    parsed.validate().unwrap();
}

#[test]
fn unknown_kind_rejected_at_parse_time() {
    let raw = serde_json::json!({
        "id": Uuid::new_v4(),
        "owner": Uuid::new_v4(),
        "name": "bad",
        "graph": {
            "nodes": [{"id": "x", "kind": "quantum_leap", "config": {}}],
            "edges": []
        },
        "schedule": {"type": "manual", "enabled": true},
        "active": true,
        "createdAt": chrono::Utc::now(),
        "updatedAt": chrono::Utc::now()
    });
    assert!(serde_json::from_value::<Dag>(raw).is_err());
}

#[test]
fn write_time_validation_rejects_cycles() {
    let graph = DagGraph::new(
        vec![
            Node::new("a", NodeConfig::Delay(DelayTaskConfig { duration_ms: 1 })),
            Node::new("b", NodeConfig::Delay(DelayTaskConfig { duration_ms: 1 })),
        ],
        vec![Edge::new("a", "b"), Edge::new("b", "a")],
    );
    let err = Dag::new(Uuid::new_v4(), "cyclic", graph).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CycleDetected);
}

#[test]
fn write_time_validation_rejects_zero_attempts() {
    let graph = DagGraph::new(
        vec![Node::new(
            "a",
            NodeConfig::Delay(DelayTaskConfig { duration_ms: 1 }),
        )],
        vec![],
    );
    let dag = Dag::new(Uuid::new_v4(), "retry-zero", graph)
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_attempts: 0,
            backoff_ms: 100,
        });
    let err = dag.validate().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[test]
fn deleted_dag_leaves_runs_readable() {
    // Runs reference DAGs by id only; deleting the DAG must not corrupt
    // the run (the UI renders "deleted DAG" when the join misses).
    let dag = sample_dag();
    let run = cascade_core::run::Run::new(dag.id, dag.owner, "manual");
    let json = serde_json::to_value(&run).unwrap();
    assert_eq!(json["dagId"], serde_json::json!(dag.id));
}

#[test]
fn schedule_variants_serialize_with_type_tags() {
    for (schedule, tag) in [
        (DagSchedule::manual(), "manual"),
        (DagSchedule::interval(300), "interval"),
        (
            DagSchedule::cron("*/10 * * * *", None),
            "cron",
        ),
    ] {
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["type"], tag);
    }
}
