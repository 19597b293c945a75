//! API integration tests.
//!
//! These tests drive the router in-process and check responses and the
//! resulting store state.

use crate::common::{fast_scheduler, wait_for_job_state};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use stint::api::{build_router, create_api_state};
use stint::demo::{Console, DemoHandlers};
use stint::{HandlerRegistry, InMemoryStore, JobId, JobState, JobStore, SchedulerHandle};
use tokio::task::JoinHandle;
use tower::ServiceExt;

struct TestApi {
    router: Router,
    store: Arc<InMemoryStore>,
    console: Console,
    handle: SchedulerHandle,
    task: JoinHandle<()>,
}

impl TestApi {
    async fn shutdown(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap();
    }
}

/// Start a scheduler with the demo handlers and build a router over it.
async fn create_test_api() -> TestApi {
    let console = Console::capture();
    let mut registry = HandlerRegistry::new();
    DemoHandlers::new()
        .with_console(console.clone())
        .with_print_time_body(Duration::from_millis(10))
        .with_create_person_body(Duration::from_millis(10))
        .register(&mut registry);

    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(Arc::clone(&store), registry);
    let client = scheduler.client();
    let recurring = scheduler.recurring();
    let (handle, task) = scheduler.start().await;

    TestApi {
        router: build_router(create_api_state(handle.clone(), client, recurring)),
        store,
        console,
        handle,
        task,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    // Extractor rejections answer in plain text.
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn job_id(body: &Value) -> JobId {
    JobId::parse(body["id"].as_str().unwrap()).unwrap()
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let api = create_test_api().await;

    let (status, json) = send(&api.router, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());

    api.shutdown().await;
}

/// Test: Submitting a job returns its id and the job runs.
#[tokio::test]
async fn test_create_job_runs_it() {
    let api = create_test_api().await;

    let (status, json) = send(
        &api.router,
        "POST",
        "/api/jobs",
        Some(json!({"type": "print", "arguments": "Alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["state"], "enqueued");

    let id = job_id(&json);
    wait_for_job_state(api.store.as_ref(), &id, JobState::Succeeded).await;
    assert_eq!(api.console.lines(), vec!["The name is Alice"]);

    let (status, json) = send(&api.router, "GET", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["type"], "print");
    assert_eq!(json["state"], "succeeded");
    assert_eq!(json["attempt"], 1);

    api.shutdown().await;
}

/// Test: Delayed submissions start scheduled.
#[tokio::test]
async fn test_create_delayed_job() {
    let api = create_test_api().await;

    let (status, json) = send(
        &api.router,
        "POST",
        "/api/jobs",
        Some(json!({"type": "print", "arguments": "Alice", "delay_secs": 3600})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["state"], "scheduled");

    api.shutdown().await;
}

/// Test: Invalid submissions are rejected with 422 and nothing is stored.
#[tokio::test]
async fn test_invalid_submissions_rejected() {
    let api = create_test_api().await;

    let cases = [
        json!({"type": "missing", "arguments": null}),
        json!({"type": "print", "arguments": "Alice", "queue": "nowhere"}),
        json!({"type": "print", "arguments": "Alice", "continuation_of": JobId::new()}),
    ];
    for body in cases {
        let (status, json) = send(&api.router, "POST", "/api/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["code"], "VALIDATION_ERROR");
    }

    assert_eq!(api.store.count_by_state().await.unwrap().total(), 0);

    api.shutdown().await;
}

/// Test: Unknown and malformed job ids return 404.
#[tokio::test]
async fn test_get_unknown_job() {
    let api = create_test_api().await;

    let (status, _) = send(&api.router, "GET", &format!("/api/jobs/{}", JobId::new()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = send(&api.router, "GET", "/api/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    api.shutdown().await;
}

/// Test: Deleting a scheduled job cancels it.
#[tokio::test]
async fn test_delete_job() {
    let api = create_test_api().await;

    let (_, json) = send(
        &api.router,
        "POST",
        "/api/jobs",
        Some(json!({"type": "print", "arguments": "Alice", "delay_secs": 3600})),
    )
    .await;
    let id = job_id(&json);

    let (status, json) = send(&api.router, "DELETE", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "deleted");

    let (status, json) = send(&api.router, "DELETE", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");

    api.shutdown().await;
}

/// Test: Listing jobs filters by state and type.
#[tokio::test]
async fn test_list_jobs_with_filters() {
    let api = create_test_api().await;

    for name in ["a", "b"] {
        send(
            &api.router,
            "POST",
            "/api/jobs",
            Some(json!({"type": "print", "arguments": name, "delay_secs": 3600})),
        )
        .await;
    }

    let (status, json) = send(&api.router, "GET", "/api/jobs?state=scheduled&type=print", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);

    let (_, json) = send(&api.router, "GET", "/api/jobs?state=failed", None).await;
    assert_eq!(json["count"], 0);

    let (_, json) = send(&api.router, "GET", "/api/jobs?limit=1", None).await;
    assert_eq!(json["count"], 1);

    let (status, _) = send(&api.router, "GET", "/api/jobs?state=bogus", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    api.shutdown().await;
}

/// Test: Recurring jobs can be registered, listed, triggered and removed.
#[tokio::test]
async fn test_recurring_lifecycle() {
    let api = create_test_api().await;
    let body = json!({
        "key": "print-time",
        "type": "print-time",
        "schedule_expression": "@yearly",
    });

    let (status, first) = send(&api.router, "POST", "/api/recurring", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["key"], "print-time");
    assert_eq!(first["timezone"], "UTC");

    let (_, second) = send(&api.router, "POST", "/api/recurring", Some(body)).await;
    assert_eq!(second["next_fire_at"], first["next_fire_at"]);

    let (_, list) = send(&api.router, "GET", "/api/recurring", None).await;
    assert_eq!(list["count"], 1);

    let (status, json) = send(&api.router, "POST", "/api/recurring/print-time/trigger", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = job_id(&json);
    wait_for_job_state(api.store.as_ref(), &id, JobState::Succeeded).await;

    let (status, _) = send(&api.router, "DELETE", "/api/recurring/print-time", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, list) = send(&api.router, "GET", "/api/recurring", None).await;
    assert_eq!(list["count"], 0);

    let (status, _) = send(&api.router, "POST", "/api/recurring/print-time/trigger", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The triggered job outlives its definition.
    let (status, _) = send(&api.router, "GET", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    api.shutdown().await;
}

/// Test: Invalid recurring registrations are rejected.
#[tokio::test]
async fn test_invalid_recurring_rejected() {
    let api = create_test_api().await;

    let cases = [
        json!({"key": "k", "type": "missing", "schedule_expression": "@daily"}),
        json!({"key": "k", "type": "print", "schedule_expression": "not a schedule"}),
        json!({"key": "k", "type": "print", "schedule_expression": "@daily", "timezone": "Mars/Base"}),
    ];
    for body in cases {
        let (status, _) = send(&api.router, "POST", "/api/recurring", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    api.shutdown().await;
}

/// Test: Stats report counts per state.
#[tokio::test]
async fn test_stats_endpoint() {
    let api = create_test_api().await;

    send(
        &api.router,
        "POST",
        "/api/jobs",
        Some(json!({"type": "print", "arguments": "later", "delay_secs": 3600})),
    )
    .await;
    let (_, json) = send(
        &api.router,
        "POST",
        "/api/jobs",
        Some(json!({"type": "print", "arguments": "now"})),
    )
    .await;
    wait_for_job_state(api.store.as_ref(), &job_id(&json), JobState::Succeeded).await;

    let (status, json) = send(&api.router, "GET", "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["scheduled"], 1);
    assert_eq!(json["succeeded"], 1);
    assert_eq!(json["total"], 2);
    assert_eq!(json["recurring"], 0);

    api.shutdown().await;
}

/// Test: Scheduler state, pause and resume endpoints.
#[tokio::test]
async fn test_scheduler_control_endpoints() {
    let api = create_test_api().await;

    let (status, json) = send(&api.router, "GET", "/api/scheduler/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["is_running"], true);

    let (status, json) = send(&api.router, "POST", "/api/scheduler/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "scheduler paused");

    let (_, json) = send(&api.router, "GET", "/api/scheduler/state", None).await;
    assert_eq!(json["state"], "paused");
    assert_eq!(json["is_paused"], true);

    let (status, _) = send(&api.router, "POST", "/api/scheduler/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&api.router, "GET", "/api/scheduler/state", None).await;
    assert_eq!(json["state"], "running");

    api.shutdown().await;
}

/// Test: The people endpoints enqueue and schedule the demo jobs.
#[tokio::test]
async fn test_people_endpoints() {
    let api = create_test_api().await;

    let (status, json) = send(&api.router, "POST", "/api/people/create?personName=Bob", None).await;
    assert_eq!(status, StatusCode::OK);
    wait_for_job_state(api.store.as_ref(), &job_id(&json), JobState::Succeeded).await;
    assert!(api.console.lines().contains(&"Added the person Bob".to_string()));

    let (status, json) = send(&api.router, "POST", "/api/people/schedule?personName=Alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "scheduled");
    let parent = job_id(&json);

    let continuations = api
        .store
        .list_jobs(&stint::JobFilter::default().with_state(JobState::Scheduled))
        .await
        .unwrap();
    let child = continuations
        .iter()
        .find(|job| job.continuation_of.as_ref() == Some(&parent))
        .expect("continuation was created");
    assert_eq!(
        child.arguments,
        json!({"message": format!("The job {} has finished", parent)})
    );

    api.shutdown().await;
}

/// Test: The people endpoints require a name.
#[tokio::test]
async fn test_people_endpoint_requires_name() {
    let api = create_test_api().await;

    let (status, _) = send(&api.router, "POST", "/api/people/create", None).await;
    assert!(status.is_client_error());

    api.shutdown().await;
}
