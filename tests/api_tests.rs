//! HTTP ingress tests wired to a live scheduler over the fake fleet.

mod test_harness;

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use scoot::api::{router, ApiState};
use scoot::cluster::{ClusterIngest, ClusterView, Node};
use test_harness::{assert_eventually, FakeWorker, TestScheduler};

const WAIT: Duration = Duration::from_secs(5);

async fn test_app() -> (
    Router,
    TestScheduler,
    tokio::sync::mpsc::Sender<ClusterIngest>,
) {
    let fixture = TestScheduler::start().await;
    fixture.add_worker(FakeWorker::auto("n1")).await;

    // The API's cluster handle is a separate view fed the same membership;
    // the returned ingest sender keeps it alive for the test's duration.
    let (cluster, ingest) = ClusterView::spawn(vec![Node::new("n1", "fake")]);

    let app = router(ApiState {
        scheduler: fixture.handle.clone(),
        cluster,
    });
    (app, fixture, ingest)
}

fn job_body() -> Value {
    json!({
        "priority": "P1",
        "tasks": [
            {
                "task_id": "t1",
                "command": { "argv": ["echo", "hi"], "snapshot_id": "empty" }
            }
        ]
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_schedule_and_status_round_trip() {
    let (app, fixture, _ingest) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(Body::from(job_body().to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let app_probe = app.clone();
    let id_probe = job_id.clone();
    assert_eventually(
        || {
            let app = app_probe.clone();
            let id = id_probe.clone();
            async move {
                let response = app
                    .oneshot(
                        Request::builder()
                            .uri(format!("/jobs/{}", id))
                            .body(Body::empty())
                            .unwrap(),
                    )
                    .await
                    .unwrap();
                let body = body_json(response).await;
                body["status"] == "completed"
            }
        },
        WAIT,
        "job should complete via the API",
    )
    .await;

    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_schedule_rejects_invalid_definition() {
    let (app, fixture, _ingest) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "tasks": [] }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("no tasks"));

    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_schedule_rejects_unknown_priority_with_error_envelope() {
    let (app, fixture, _ingest) = test_app().await;

    let mut bad = job_body();
    bad["priority"] = serde_json::json!("P9");
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(Body::from(bad.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    // Deserialization failures reject like any other invalid definition:
    // same status code, same error envelope.
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("malformed job definition"));

    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_of_unknown_job_is_not_found_state() {
    let (app, fixture, _ingest) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "not_found");

    // A malformed id is a client error.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/jobs/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_kill_unknown_job_is_404() {
    let (app, fixture, _ingest) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/jobs/{}/kill", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_cluster_endpoint_lists_members() {
    let (app, fixture, _ingest) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/cluster")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["nodes"][0]["id"], "n1");

    fixture.stop().await.unwrap();
}
