//! End-to-end engine scenarios: happy path, retries, fatal failures,
//! circuit breaking, cancellation, pause/resume.

mod common;

use common::TestHarness;
use serde_json::json;
use std::time::Duration;
use strand_workflow_engine::error::ErrorKind;
use strand_workflow_engine::model::{ExecutionStatus, LogLevel, NodeExecutionStatus};
use strand_workflow_engine::EngineConfig;

fn linear_calculator_workflow() -> serde_json::Value {
    json!({
        "name": "linear",
        "nodes": [
            {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "* * * * *", "emit": {"n": 2}}},
            {"id": "b", "blockType": "CALCULATOR", "config": {
                "operation": "multiply",
                "inputs": {"x": "{{n}}", "y": 3},
            }},
            {"id": "c", "blockType": "EMAIL", "config": {
                "to": "ops@example.com",
                "subject": "v={{result}}",
            }},
        ],
        "edges": [
            {"id": "e1", "source": "a", "target": "b"},
            {"id": "e2", "source": "b", "target": "c"},
        ],
    })
}

#[tokio::test]
async fn linear_happy_path_resolves_templates_downstream() {
    let h = TestHarness::default_start().await;
    let workflow = h.save_workflow(linear_calculator_workflow()).await;
    let id = h.execute(&workflow).await;

    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let rows = h.engine.node_executions(id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .all(|r| r.status == NodeExecutionStatus::Succeeded));

    // calculator coerced "{{n}}" -> "2" -> 2 and multiplied by 3
    let calc = rows.iter().find(|r| r.node_id == "b").unwrap();
    assert_eq!(calc.output, json!({"result": 6}));

    // the email subject template saw the calculator's output
    let sent = h.mailer.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "v=6");
}

#[tokio::test]
async fn flaky_node_retries_then_succeeds() {
    let h = TestHarness::default_start().await;
    let workflow = h
        .save_workflow(json!({
            "name": "retry",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*", "emit": {}}},
                {"id": "b", "blockType": "HTTP", "config": {
                    "url": "http://flaky.test",
                    "failTimes": 2,
                    "failMessage": "rate limit",
                    "maxAttempts": 3,
                    "baseDelayMs": 10,
                    "maxDelayMs": 50,
                }},
                {"id": "c", "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "done"}},
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b"},
                {"id": "e2", "source": "b", "target": "c"},
            ],
        }))
        .await;
    let id = h.execute(&workflow).await;

    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let rows = h.engine.node_executions(id).await.unwrap();
    let flaky = rows.iter().find(|r| r.node_id == "b").unwrap();
    assert_eq!(flaky.status, NodeExecutionStatus::Succeeded);
    assert_eq!(flaky.attempts, 3);

    // exactly two warn lines naming the retry
    let logs = h.engine.node_logs_by_node(id, "b").await.unwrap();
    let retries: Vec<_> = logs
        .iter()
        .filter(|l| l.level == LogLevel::Warn && l.message.contains("retrying"))
        .collect();
    assert_eq!(retries.len(), 2);
}

#[tokio::test]
async fn non_retryable_failure_stops_downstream_dispatch() {
    let h = TestHarness::default_start().await;
    let workflow = h
        .save_workflow(json!({
            "name": "fatal",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*", "emit": {}}},
                {"id": "b", "blockType": "HTTP", "config": {
                    "url": "http://broken.test",
                    "failTimes": 1000,
                    "failMessage": "invalid signature",
                }},
                {"id": "c", "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "s"}},
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b"},
                {"id": "e2", "source": "b", "target": "c"},
            ],
        }))
        .await;
    let id = h.execute(&workflow).await;

    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let last_error = execution.last_error.unwrap();
    assert_eq!(last_error.kind, ErrorKind::Execution);
    assert!(last_error.message.contains("invalid signature"));

    let rows = h.engine.node_executions(id).await.unwrap();
    let b = rows.iter().find(|r| r.node_id == "b").unwrap();
    assert_eq!(b.status, NodeExecutionStatus::Failed);
    // only one attempt: the classifier rejected a retry
    assert_eq!(b.attempts, 1);
    // c was never dispatched
    assert!(rows.iter().all(|r| r.node_id != "c"));
    assert_eq!(h.mailer.sent.lock().len(), 0);
}

fn transaction_workflow() -> serde_json::Value {
    json!({
        "name": "tx",
        "nodes": [
            {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*", "emit": {}}},
            {"id": "t", "blockType": "BLOCKCHAIN_TRANSACTION", "config": {
                "chainId": 1328,
                "from": "0xhot",
                "to": "0xcold",
                "maxAttempts": 1,
            }},
        ],
        "edges": [{"id": "e1", "source": "a", "target": "t"}],
    })
}

#[tokio::test]
async fn breaker_trips_after_threshold_and_recovers_via_probe() {
    let mut config = EngineConfig::default();
    config.breaker.threshold = 5;
    config.breaker.cooldown = Duration::from_millis(200);
    let h = TestHarness::start(config).await;
    h.chain.set_healthy(false);

    let workflow = h.save_workflow(transaction_workflow()).await;

    // five executions exhaust the scope's failure budget
    for _ in 0..5 {
        let id = h.execute(&workflow).await;
        let execution = h.wait_settled(id, Duration::from_secs(5)).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }
    assert_eq!(h.chain.call_count(), 5);

    // sixth fails fast without invoking the handler
    let id = h.execute(&workflow).await;
    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.last_error.unwrap().kind, ErrorKind::CircuitOpen);
    assert_eq!(h.chain.call_count(), 5, "open circuit must not call the rpc");

    // after the cooldown one probe runs and closes the circuit
    tokio::time::sleep(Duration::from_millis(250)).await;
    h.chain.set_healthy(true);
    let id = h.execute(&workflow).await;
    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.chain.call_count(), 6);
}

#[tokio::test]
async fn cancel_mid_flight_stops_descendants() {
    let h = TestHarness::default_start().await;
    let workflow = h
        .save_workflow(json!({
            "name": "cancel",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*", "emit": {}}},
                {"id": "slow", "blockType": "DELAY", "config": {"durationMs": 5000}},
                {"id": "after", "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "late"}},
                {"id": "fast", "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "fast"}},
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "slow"},
                {"id": "e2", "source": "slow", "target": "after"},
                {"id": "e3", "source": "a", "target": "fast"},
            ],
        }))
        .await;
    let id = h.execute(&workflow).await;

    // wait for the delay node to be running
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let rows = h.engine.node_executions(id).await.unwrap();
        if rows
            .iter()
            .any(|r| r.node_id == "slow" && r.status == NodeExecutionStatus::Running)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delay never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.engine.cancel_execution(id).await.unwrap();
    let execution = h.wait_settled(id, Duration::from_secs(2)).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    let rows = h.engine.node_executions(id).await.unwrap();
    let slow = rows.iter().find(|r| r.node_id == "slow").unwrap();
    assert_eq!(slow.status, NodeExecutionStatus::Failed);
    assert_eq!(slow.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    // nothing downstream of the cancelled node ever started
    assert!(rows.iter().all(|r| r.node_id != "after"));
}

#[tokio::test]
async fn pause_parks_the_node_and_resume_completes() {
    let h = TestHarness::default_start().await;
    // a delay in front of b leaves a window to write the pause record
    // before b becomes ready
    let workflow = h
        .save_workflow(json!({
            "name": "pause",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*", "emit": {"n": 2}}},
                {"id": "d", "blockType": "DELAY", "config": {"durationMs": 500}},
                {"id": "b", "blockType": "CALCULATOR", "config": {
                    "operation": "multiply",
                    "inputs": {"x": "{{n}}", "y": 3},
                }},
                {"id": "c", "blockType": "EMAIL", "config": {
                    "to": "ops@example.com",
                    "subject": "v={{result}}",
                }},
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "d"},
                {"id": "e2", "source": "a", "target": "b"},
                {"id": "e3", "source": "d", "target": "b"},
                {"id": "e4", "source": "b", "target": "c"},
            ],
        }))
        .await;

    let id = h.execute(&workflow).await;
    h.engine
        .pause_execution(id, Some("b".to_string()), "tests".to_string())
        .await
        .unwrap();

    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Paused);
    let rows = h.engine.node_executions(id).await.unwrap();
    let b = rows.iter().find(|r| r.node_id == "b").unwrap();
    assert_eq!(b.status, NodeExecutionStatus::Paused);
    // downstream never ran
    assert!(rows.iter().all(|r| r.node_id != "c"));

    h.engine
        .resume_execution(id, Some("b".to_string()))
        .await
        .unwrap();
    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.mailer.sent.lock()[0].1, "v=6");
}

#[tokio::test]
async fn condition_skips_the_untaken_branch() {
    let h = TestHarness::default_start().await;
    let workflow = h
        .save_workflow(json!({
            "name": "branch",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*", "emit": {"total": 250}}},
                {"id": "cond", "blockType": "CONDITION", "config": {"expression": "total > 100"}},
                {"id": "big", "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "big"}},
                {"id": "small", "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "small"}},
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "cond"},
                {"id": "e2", "source": "cond", "target": "big", "sourceHandle": "true"},
                {"id": "e3", "source": "cond", "target": "small", "sourceHandle": "false"},
            ],
        }))
        .await;
    let id = h.execute(&workflow).await;

    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let rows = h.engine.node_executions(id).await.unwrap();
    let big = rows.iter().find(|r| r.node_id == "big").unwrap();
    let small = rows.iter().find(|r| r.node_id == "small").unwrap();
    assert_eq!(big.status, NodeExecutionStatus::Succeeded);
    assert_eq!(small.status, NodeExecutionStatus::Skipped);

    let sent = h.mailer.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "big");
}

#[tokio::test]
async fn retry_endpoint_reruns_a_failed_execution() {
    let h = TestHarness::default_start().await;
    let workflow = h
        .save_workflow(json!({
            "name": "retry-exec",
            "nodes": [
                {"id": "a", "blockType": "SCHEDULE", "config": {"cron": "*", "emit": {}}},
                {"id": "b", "blockType": "HTTP", "config": {
                    "url": "http://x",
                    // fails every attempt of the first run (3), succeeds after
                    "failTimes": 3,
                    "failMessage": "connection reset",
                    "maxAttempts": 3,
                    "baseDelayMs": 5,
                }},
                {"id": "c", "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "s"}},
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b"},
                {"id": "e2", "source": "b", "target": "c"},
            ],
        }))
        .await;
    let id = h.execute(&workflow).await;
    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);

    h.engine.retry_execution(id).await.unwrap();
    let execution = h.wait_settled(id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(h.mailer.sent.lock().len(), 1);
}
