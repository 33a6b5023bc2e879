
use std::sync::Arc;

use axum::{http::StatusCode, Router};
use chrono::{TimeZone, Utc};

use executor_dispatch::api::queue_router;
use executor_dispatch::dispatch::{QueueHandler, SingleQueueDispatcher};
use executor_dispatch::error::{StoreError, TokenError};
use executor_dispatch::scheduler::job::ExecutionLogEntry;
use executor_dispatch::store::{ExecutionLogEntryOptions, HeartbeatOptions, MarkFinalOptions};

use test_harness::*;

struct Fixture {
    store: Arc<MockQueueStore>,
    tokens: Arc<MockTokenStore>,
    executors: Arc<MockExecutorStore>,
    app: Router,
}

fn fixture_with(handler_for: impl FnOnce(Arc<MockQueueStore>) -> QueueHandler<TestRecord>) -> Fixture {
    let store = MockQueueStore::new();
    let tokens = MockTokenStore::new();
    let executors = MockExecutorStore::new();

    let dispatcher = SingleQueueDispatcher::new(
        handler_for(store.clone()),
        context(tokens.clone(), executors.clone()),
    );
    Fixture {
        store,
        tokens,
        executors,
        app: queue_router(Arc::new(dispatcher)),
    }
}

fn fixture() -> Fixture {
    fixture_with(|store| handler("test", store))
}

const DEQUEUE_BODY: &str =
    r#"{"executorName": "test-executor", "numCPUs": 1, "memory": "1GB", "diskSpace": "10GB"}"#;

const V1_JOB: &str = r#"{"id":1,"token":"sometoken","repositoryName":"","repositoryDirectory":"","commit":"","fetchTags":false,"shallowClone":false,"sparseCheckout":null,"files":{},"dockerSteps":null,"cliSteps":null,"redactedValues":null}"#;

// =============================================================================
// Dequeue
// =============================================================================

#[tokio::test]
async fn test_dequeue_record() {
    let f = fixture();
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.tokens.create.push(Ok("sometoken".to_string()));

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&body, V1_JOB);
    assert_eq!(
        f.store.calls(),
        vec![StoreCall::Dequeue {
            hostname: "test-executor".to_string()
        }]
    );
    assert_eq!(
        f.tokens.calls(),
        vec![TokenCall::Create {
            job_id: 1,
            queue: "test".to_string(),
            repo: String::new(),
        }]
    );
}

#[tokio::test]
async fn test_dequeue_invalid_version() {
    let f = fixture();

    let (status, body) = post(
        &f.app,
        "/queue/test/dequeue",
        r#"{"executorName": "test-executor", "version":"\n1.2", "numCPUs": 1, "memory": "1GB", "diskSpace": "10GB"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(
        &body,
        r#"{"error":"failed to check version \"\\n1.2\": Invalid Semantic Version"}"#,
    );
    assert_eq!(f.store.dequeue_calls(), 0);
}

#[tokio::test]
async fn test_dequeue_empty_hostname() {
    let f = fixture();

    let (status, body) = post(&f.app, "/queue/test/dequeue", r#"{"executorName": ""}"#).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"worker hostname cannot be empty"}"#);
    assert_eq!(f.store.dequeue_calls(), 0);
}

#[tokio::test]
async fn test_dequeue_store_error() {
    let f = fixture();
    f.store
        .dequeue
        .push(Err(StoreError::Backend("failed to dequeue".to_string())));

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"store.dequeue: failed to dequeue"}"#);
    assert_eq!(f.tokens.create_calls(), 0);
}

#[tokio::test]
async fn test_dequeue_nothing_available() {
    let f = fixture();

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
    assert_eq!(f.store.dequeue_calls(), 1);
    assert_eq!(f.tokens.create_calls(), 0);
}

#[tokio::test]
async fn test_dequeue_transform_failure_marks_record_failed() {
    let f = fixture_with(|store| {
        QueueHandler::<TestRecord>::new("test", store, |_, _: &TestRecord, _| {
            Err(anyhow::anyhow!("failed"))
        })
    });
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.store.mark_failed.push(Ok(true));

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"RecordTransformer: failed"}"#);
    assert_eq!(
        f.store.mark_failed_calls(),
        vec![StoreCall::MarkFailed {
            id: 1,
            message: "failed to transform record: failed".to_string(),
            options: MarkFinalOptions::default(),
        }]
    );
    assert_eq!(f.tokens.create_calls(), 0);
}

#[tokio::test]
async fn test_dequeue_transform_failure_reports_mark_failure_too() {
    let f = fixture_with(|store| {
        QueueHandler::<TestRecord>::new("test", store, |_, _: &TestRecord, _| {
            Err(anyhow::anyhow!("failed"))
        })
    });
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.store
        .mark_failed
        .push(Err(StoreError::Backend("failed to mark".to_string())));

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(
        &body,
        r#"{"error":"RecordTransformer: failed; additionally failed to mark record as failed: failed to mark"}"#,
    );
    assert_eq!(f.store.mark_failed_calls().len(), 1);
    assert_eq!(f.tokens.create_calls(), 0);
}

#[tokio::test]
async fn test_dequeue_v2_job() {
    let f = fixture();
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.tokens.create.push(Ok("sometoken".to_string()));

    let (status, body) = post(
        &f.app,
        "/queue/test/dequeue",
        r#"{"executorName": "test-executor", "version": "dev", "numCPUs": 1, "memory": "1GB", "diskSpace": "10GB"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(
        &body,
        r#"{"version":2,"id":1,"token":"sometoken","repositoryName":"","repositoryDirectory":"","commit":"","fetchTags":false,"shallowClone":false,"sparseCheckout":null,"files":{},"dockerSteps":null,"cliSteps":null,"redactedValues":null,"dockerAuthConfig":{}}"#,
    );
}

#[tokio::test]
async fn test_dequeue_old_executor_gets_v1_job() {
    let f = fixture();
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.tokens.create.push(Ok("sometoken".to_string()));

    let (status, body) = post(
        &f.app,
        "/queue/test/dequeue",
        r#"{"executorName": "test-executor", "version": "4.2.0"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&body, V1_JOB);
}

#[tokio::test]
async fn test_dequeue_token_create_failure() {
    let f = fixture();
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.tokens
        .create
        .push(Err(TokenError::Backend("failed to create token".to_string())));

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"CreateToken: failed to create token"}"#);
    // The claim is not rolled back.
    assert!(f.store.mark_failed_calls().is_empty());
}

#[tokio::test]
async fn test_dequeue_existing_token_is_regenerated() {
    let f = fixture();
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.tokens.create.push(Err(TokenError::AlreadyCreated));
    f.tokens.regenerate.push(Ok("somenewtoken".to_string()));

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&body, &V1_JOB.replace("sometoken", "somenewtoken"));
    assert_eq!(
        f.tokens.calls()[1],
        TokenCall::Regenerate {
            job_id: 1,
            queue: "test".to_string()
        }
    );
}

#[tokio::test]
async fn test_dequeue_token_regenerate_failure() {
    let f = fixture();
    f.store.dequeue.push(Ok(Some(TestRecord { id: 1 })));
    f.tokens.create.push(Err(TokenError::AlreadyCreated));
    f.tokens
        .regenerate
        .push(Err(TokenError::Backend("failed to regen token".to_string())));

    let (status, body) = post(&f.app, "/queue/test/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"RegenerateToken: failed to regen token"}"#);
}

#[tokio::test]
async fn test_dequeue_malformed_json() {
    let f = fixture();

    let (status, body) = post(&f.app, "/queue/test/dequeue", "{not json").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("malformed request body"));
    assert_eq!(f.store.dequeue_calls(), 0);
}

// =============================================================================
// Execution logs
// =============================================================================

fn log_entry() -> ExecutionLogEntry {
    ExecutionLogEntry {
        key: "foo".to_string(),
        command: vec!["faz".to_string(), "baz".to_string()],
        start_time: Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap(),
        exit_code: Some(0),
        out: "done".to_string(),
        duration_ms: Some(100),
    }
}

const ADD_LOG_BODY: &str = r#"{"executorName": "test-executor", "jobId": 42, "key": "foo", "command": ["faz", "baz"], "startTime": "2023-01-02T03:04:05Z", "exitCode": 0, "out": "done", "durationMs":100}"#;

const UPDATE_LOG_BODY: &str = r#"{"entryId": 10, "executorName": "test-executor", "jobId": 42, "key": "foo", "command": ["faz", "baz"], "startTime": "2023-01-02T03:04:05Z", "exitCode": 0, "out": "done", "durationMs":100}"#;

#[tokio::test]
async fn test_add_execution_log_entry() {
    let f = fixture();
    f.store.add_log.push(Ok(10));

    let (status, body) = post(&f.app, "/queue/test/addExecutionLogEntry", ADD_LOG_BODY).await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&body, "10");
    assert_eq!(
        f.store.calls(),
        vec![StoreCall::AddLog {
            id: 42,
            entry: log_entry(),
            options: ExecutionLogEntryOptions {
                worker_hostname: "test-executor".to_string(),
                state: "processing".to_string(),
            },
        }]
    );
}

#[tokio::test]
async fn test_add_execution_log_entry_store_error() {
    let f = fixture();
    f.store
        .add_log
        .push(Err(StoreError::Backend("failed to add".to_string())));

    let (status, body) = post(&f.app, "/queue/test/addExecutionLogEntry", ADD_LOG_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"store.addExecutionLogEntry: failed to add"}"#);
}

#[tokio::test]
async fn test_add_execution_log_entry_unknown_job() {
    let f = fixture();
    f.store.add_log.push(Err(StoreError::LogEntryNotUpdated));

    let (status, body) = post(&f.app, "/queue/test/addExecutionLogEntry", ADD_LOG_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"unknown job"}"#);
}

#[tokio::test]
async fn test_update_execution_log_entry() {
    let f = fixture();

    let (status, body) =
        post(&f.app, "/queue/test/updateExecutionLogEntry", UPDATE_LOG_BODY).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
    assert_eq!(
        f.store.calls(),
        vec![StoreCall::UpdateLog {
            id: 42,
            entry_id: 10,
            entry: log_entry(),
            options: ExecutionLogEntryOptions::processing("test-executor"),
        }]
    );
}

#[tokio::test]
async fn test_update_execution_log_entry_store_error() {
    let f = fixture();
    f.store
        .update_log
        .push(Err(StoreError::Backend("failed to update".to_string())));

    let (status, body) =
        post(&f.app, "/queue/test/updateExecutionLogEntry", UPDATE_LOG_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(
        &body,
        r#"{"error":"store.updateExecutionLogEntry: failed to update"}"#,
    );
}

#[tokio::test]
async fn test_update_execution_log_entry_unknown_job() {
    let f = fixture();
    f.store.update_log.push(Err(StoreError::LogEntryNotUpdated));

    let (status, body) =
        post(&f.app, "/queue/test/updateExecutionLogEntry", UPDATE_LOG_BODY).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"unknown job"}"#);
}

#[tokio::test]
async fn test_execution_log_routes_require_executor_name() {
    let f = fixture();

    let (status, body) = post(
        &f.app,
        "/queue/test/addExecutionLogEntry",
        r#"{"executorName": "", "jobId": 42, "key": "step.0", "startTime": "2023-01-02T03:04:05Z"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"worker hostname cannot be empty"}"#);

    let (status, body) = post(
        &f.app,
        "/queue/test/updateExecutionLogEntry",
        r#"{"executorName": "", "jobId": 42, "entryId": 10, "key": "step.0", "startTime": "2023-01-02T03:04:05Z"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"worker hostname cannot be empty"}"#);

    assert!(f.store.calls().is_empty());
}

// =============================================================================
// Finalization
// =============================================================================

fn owner_options() -> MarkFinalOptions {
    MarkFinalOptions::owned_by("test-executor")
}

#[tokio::test]
async fn test_mark_complete() {
    let f = fixture();
    f.store.mark_complete.push(Ok(true));

    let (status, body) = post(
        &f.app,
        "/queue/test/markComplete",
        r#"{"executorName": "test-executor", "jobId": 42}"#,
    )
    .await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
    assert_eq!(
        f.store.calls(),
        vec![StoreCall::MarkComplete {
            id: 42,
            options: owner_options(),
        }]
    );
    assert_eq!(
        f.tokens.delete_calls(),
        vec![TokenCall::Delete {
            job_id: 42,
            queue: "test".to_string()
        }]
    );
}

#[tokio::test]
async fn test_mark_complete_store_error() {
    let f = fixture();
    f.store
        .mark_complete
        .push(Err(StoreError::Backend("failed".to_string())));

    let (status, body) = post(
        &f.app,
        "/queue/test/markComplete",
        r#"{"executorName": "test-executor", "jobId": 42}"#,
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"store.markComplete: failed"}"#);
    assert!(f.tokens.delete_calls().is_empty());
}

#[tokio::test]
async fn test_mark_complete_unknown_job_keeps_token() {
    let f = fixture();
    f.store.mark_complete.push(Ok(false));

    let (status, body) = post(
        &f.app,
        "/queue/test/markComplete",
        r#"{"executorName": "test-executor", "jobId": 42}"#,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_json_eq(&body, "null");
    assert!(f.tokens.delete_calls().is_empty());
}

#[tokio::test]
async fn test_mark_complete_token_delete_failure() {
    let f = fixture();
    f.store.mark_complete.push(Ok(true));
    f.tokens
        .delete
        .push(Err(TokenError::Backend("failed".to_string())));

    let (status, body) = post(
        &f.app,
        "/queue/test/markComplete",
        r#"{"executorName": "test-executor", "jobId": 42}"#,
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"jobTokenStore.Delete: failed"}"#);
}

#[tokio::test]
async fn test_mark_errored() {
    let f = fixture();
    f.store.mark_errored.push(Ok(true));

    let (status, _) = post(
        &f.app,
        "/queue/test/markErrored",
        r#"{"executorName": "test-executor", "jobId": 42, "errorMessage": "it failed"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        f.store.calls(),
        vec![StoreCall::MarkErrored {
            id: 42,
            message: "it failed".to_string(),
            options: owner_options(),
        }]
    );
    assert_eq!(f.tokens.delete_calls().len(), 1);
}

#[tokio::test]
async fn test_mark_errored_unknown_job() {
    let f = fixture();
    f.store.mark_errored.push(Ok(false));

    let (status, body) = post(
        &f.app,
        "/queue/test/markErrored",
        r#"{"executorName": "test-executor", "jobId": 42, "errorMessage": "it failed"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_json_eq(&body, "null");
    assert!(f.tokens.delete_calls().is_empty());
}

#[tokio::test]
async fn test_mark_errored_store_error() {
    let f = fixture();
    f.store
        .mark_errored
        .push(Err(StoreError::Backend("failed".to_string())));

    let (status, body) = post(
        &f.app,
        "/queue/test/markErrored",
        r#"{"executorName": "test-executor", "jobId": 42, "errorMessage": "it failed"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"store.markErrored: failed"}"#);
}

#[tokio::test]
async fn test_mark_failed() {
    let f = fixture();
    f.store.mark_failed.push(Ok(true));

    let (status, _) = post(
        &f.app,
        "/queue/test/markFailed",
        r#"{"executorName": "test-executor", "jobId": 42, "errorMessage": "it failed"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        f.store.calls(),
        vec![StoreCall::MarkFailed {
            id: 42,
            message: "it failed".to_string(),
            options: owner_options(),
        }]
    );
    assert_eq!(f.tokens.delete_calls().len(), 1);
}

#[tokio::test]
async fn test_mark_failed_unknown_job() {
    let f = fixture();
    f.store.mark_failed.push(Ok(false));

    let (status, body) = post(
        &f.app,
        "/queue/test/markFailed",
        r#"{"executorName": "test-executor", "jobId": 42, "errorMessage": "it failed"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_json_eq(&body, "null");
}

#[tokio::test]
async fn test_mark_failed_token_delete_failure() {
    let f = fixture();
    f.store.mark_failed.push(Ok(true));
    f.tokens
        .delete
        .push(Err(TokenError::Backend("failed".to_string())));

    let (status, body) = post(
        &f.app,
        "/queue/test/markFailed",
        r#"{"executorName": "test-executor", "jobId": 42, "errorMessage": "it failed"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&body, r#"{"error":"jobTokenStore.Delete: failed"}"#);
}

#[tokio::test]
async fn test_finalize_requires_executor_name() {
    let f = fixture();
    f.store.mark_complete.push(Ok(true));
    f.store.mark_errored.push(Ok(true));
    f.store.mark_failed.push(Ok(true));

    for (route, body) in [
        ("markComplete", r#"{"executorName": "", "jobId": 42}"#),
        ("markErrored", r#"{"executorName": "", "jobId": 42, "errorMessage": "x"}"#),
        ("markFailed", r#"{"executorName": "", "jobId": 42, "errorMessage": "x"}"#),
    ] {
        let (status, resp) = post(&f.app, &format!("/queue/test/{route}"), body).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{route}");
        assert_json_eq(&resp, r#"{"error":"worker hostname cannot be empty"}"#);
    }

    assert!(f.store.calls().is_empty());
    assert!(f.tokens.delete_calls().is_empty());
}

// =============================================================================
// Heartbeat
// =============================================================================

const HEARTBEAT_FIELDS: &str = r#""os": "test-os", "architecture": "test-arch", "dockerVersion": "1.0", "executorVersion": "2.0", "gitVersion": "3.0", "igniteVersion": "4.0", "srcCliVersion": "5.0", "prometheusMetrics": """#;

fn heartbeat_body(prefix: &str) -> String {
    format!("{{{prefix}, {HEARTBEAT_FIELDS}}}")
}

#[tokio::test]
async fn test_heartbeat_numeric_ids() {
    let f = fixture();
    f.store.heartbeat.push(Ok(reconciled(&["42", "7"], &[])));

    let body = heartbeat_body(r#""version":"V2", "executorName": "test-executor", "jobIds": [42, 7]"#);
    let (status, resp) = post(&f.app, "/queue/test/heartbeat", &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&resp, r#"{"knownIds":["42","7"],"cancelIds":null}"#);
    assert_eq!(
        f.store.heartbeat_calls(),
        vec![StoreCall::Heartbeat {
            ids: vec!["42".to_string(), "7".to_string()],
            options: HeartbeatOptions {
                worker_hostname: "test-executor".to_string()
            },
        }]
    );

    let upserts = f.executors.upserts();
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].hostname, "test-executor");
    assert_eq!(upserts[0].queue_name, "test");
    assert_eq!(upserts[0].os, "test-os");
    assert_eq!(upserts[0].src_cli_version, "5.0");
}

#[tokio::test]
async fn test_heartbeat_string_ids() {
    let f = fixture();
    f.store.heartbeat.push(Ok(reconciled(&["42", "7"], &[])));

    let body =
        heartbeat_body(r#""version":"V2", "executorName": "test-executor", "jobIds": ["42", "7"]"#);
    let (status, resp) = post(&f.app, "/queue/test/heartbeat", &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&resp, r#"{"knownIds":["42","7"],"cancelIds":null}"#);
}

#[tokio::test]
async fn test_heartbeat_empty_hostname() {
    let f = fixture();

    let body = heartbeat_body(r#""executorName": "", "jobIds": ["42", "7"]"#);
    let (status, resp) = post(&f.app, "/queue/test/heartbeat", &body).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&resp, r#"{"error":"worker hostname cannot be empty"}"#);
    assert!(f.executors.upserts().is_empty());
    assert!(f.store.heartbeat_calls().is_empty());
}

#[tokio::test]
async fn test_heartbeat_upsert_failure_is_not_fatal() {
    let f = fixture();
    f.executors
        .upsert
        .push(Err(StoreError::Backend("failed".to_string())));
    f.store.heartbeat.push(Ok(reconciled(&["42", "7"], &[])));

    let body = heartbeat_body(r#""executorName": "test-executor", "jobIds": ["42", "7"]"#);
    let (status, resp) = post(&f.app, "/queue/test/heartbeat", &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&resp, r#"{"knownIds":["42","7"],"cancelIds":null}"#);
}

#[tokio::test]
async fn test_heartbeat_store_error() {
    let f = fixture();
    f.store
        .heartbeat
        .push(Err(StoreError::Backend("failed".to_string())));

    let body = heartbeat_body(r#""executorName": "test-executor", "jobIds": ["42", "7"]"#);
    let (status, resp) = post(&f.app, "/queue/test/heartbeat", &body).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_json_eq(&resp, r#"{"error":"store.heartbeat: failed"}"#);
    assert_eq!(f.executors.upserts().len(), 1);
}

#[tokio::test]
async fn test_heartbeat_cancelled_ids() {
    let f = fixture();
    f.store.heartbeat.push(Ok(reconciled(&[], &["42", "7"])));

    let body =
        heartbeat_body(r#""version": "V2", "executorName": "test-executor", "jobIds": ["42", "7"]"#);
    let (status, resp) = post(&f.app, "/queue/test/heartbeat", &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_json_eq(&resp, r#"{"knownIds":null,"cancelIds":["42","7"]}"#);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let f = fixture();

    let (status, _) = post(&f.app, "/queue/other/dequeue", DEQUEUE_BODY).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
