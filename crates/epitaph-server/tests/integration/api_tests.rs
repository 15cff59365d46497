use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};

use epitaph_core::traits::SubjectSource;

use crate::common::{authed, authed_json, setup_test_app, setup_test_app_no_auth};

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app(0, Duration::ZERO).await;

    let (status, json) = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app(0, Duration::ZERO).await;

    let (status, json) = app
        .send(Request::get("/v1/runs").body(Body::empty()).unwrap())
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn wrong_token_returns_401() {
    let app = setup_test_app(0, Duration::ZERO).await;

    let (status, _) = app
        .send(
            Request::get("/v1/runs")
                .header("authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth().await;

    let (status, json) = app
        .send(
            Request::get("/v1/runs")
                .header("authorization", "Bearer any-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "forbidden");
}

#[tokio::test]
async fn run_completes_and_writes_history() {
    let app = setup_test_app(3, Duration::ZERO).await;

    let (status, json) = app
        .send(authed_json(Request::post("/v1/runs"), serde_json::json!({})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["run_type"], "death_details");
    let run_id = json["run_id"].as_str().unwrap().to_string();

    let progress = app.wait_for_run(&run_id).await;
    assert_eq!(progress["status"], "completed");
    assert_eq!(progress["processed_count"], 3);
    assert_eq!(progress["counters"]["updated"], 3);

    let subject = app.db.get_subject(2).await.unwrap().unwrap();
    assert_eq!(subject.cause_of_death.as_deref(), Some("heart attack"));

    let (status, json) = app
        .send(authed(Request::get("/v1/subjects/2/history")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["subject_id"], 2);
    let entries = json["entries"].as_array().unwrap();
    let cause = entries
        .iter()
        .find(|e| e["field"] == "cause_of_death")
        .expect("cause_of_death history row");
    assert_eq!(cause["new_value"], "heart attack");
    assert_eq!(cause["source"], "mock_obits");
    assert_eq!(cause["run_id"], run_id.as_str());

    let (status, json) = app.send(authed(Request::get("/v1/runs"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        json["runs"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r["run_id"] == run_id.as_str())
    );
}

#[tokio::test]
async fn concurrent_run_of_same_type_conflicts_and_stop_halts_it() {
    let app = setup_test_app(40, Duration::from_millis(50)).await;

    let (status, json) = app
        .send(authed_json(Request::post("/v1/runs"), serde_json::json!({})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = json["run_id"].as_str().unwrap().to_string();

    let (status, json) = app
        .send(authed_json(Request::post("/v1/runs"), serde_json::json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "conflict");

    let (status, json) = app
        .send(authed(Request::delete(format!("/v1/runs/{run_id}"))))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["stop_requested"], true);

    let progress = app.wait_for_run(&run_id).await;
    assert_eq!(progress["status"], "stopped");
    assert!(progress["processed_count"].as_u64().unwrap() < 40);

    let (status, _) = app
        .send(authed(Request::delete(format!("/v1/runs/{run_id}"))))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_run_returns_404() {
    let app = setup_test_app(0, Duration::ZERO).await;
    let id = uuid::Uuid::new_v4();

    let (status, json) = app
        .send(authed(Request::get(format!("/v1/runs/{id}"))))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");

    let (status, _) = app
        .send(authed(Request::delete(format!("/v1/runs/{id}"))))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn history_of_unknown_subject_returns_404() {
    let app = setup_test_app(1, Duration::ZERO).await;

    let (status, _) = app
        .send(authed(Request::get("/v1/subjects/999/history")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = app
        .send(authed(Request::get("/v1/subjects/1/history")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 0);
}

#[tokio::test]
async fn invalid_start_request_returns_400() {
    let app = setup_test_app(1, Duration::ZERO).await;

    let (status, json) = app
        .send(authed_json(
            Request::post("/v1/runs"),
            serde_json::json!({"limit": 0}),
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "validation_error");
}
