use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tower::ServiceExt;

use epitaph_client::{FallbackConfig, FallbackFetchChain, HtmdCleaner, ReqwestFetcher};
use epitaph_core::control::BatchManager;
use epitaph_core::orchestrator::EnrichmentOrchestrator;
use epitaph_core::provider::ProviderRegistry;
use epitaph_core::testutil::{MockProvider, sample_details, sample_subject};
use epitaph_db::Database;
use epitaph_server::routes;
use epitaph_server::state::AppState;

pub const TEST_TOKEN: &str = "test-secret-token";

/// Router plus the handles a test needs. The container stops on drop.
pub struct TestApp {
    pub router: Router,
    pub db: Database,
    _container: ContainerAsync<GenericImage>,
}

impl TestApp {
    /// Send a request and decode the JSON body (`Null` when empty).
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    /// Poll a run until it leaves `running`.
    pub async fn wait_for_run(&self, run_id: &str) -> serde_json::Value {
        for _ in 0..100 {
            let (_, json) = self.send(authed(Request::get(format!("/v1/runs/{run_id}")))).await;
            let status = json["status"].as_str().unwrap_or_default();
            if status != "running" && status != "pending" {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("run {run_id} did not finish");
    }
}

pub fn authed(builder: axum::http::request::Builder) -> Request<Body> {
    builder
        .header("authorization", format!("Bearer {TEST_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

pub fn authed_json(builder: axum::http::request::Builder, body: serde_json::Value) -> Request<Body> {
    builder
        .header("authorization", format!("Bearer {TEST_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// App over a fresh database seeded with `subjects` sample subjects and a
/// single mock provider that answers after `latency`.
pub async fn setup_test_app(subjects: i64, latency: Duration) -> TestApp {
    build_app(subjects, latency, Some(TEST_TOKEN.to_string())).await
}

/// Same, with no admin token configured.
pub async fn setup_test_app_no_auth() -> TestApp {
    build_app(0, Duration::ZERO, None).await
}

async fn build_app(subjects: i64, latency: Duration, admin_token: Option<String>) -> TestApp {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "epitaph_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let url = format!("postgresql://postgres:postgres@{host}:{port}/epitaph_test");

    let db = Database::from_pool(retry_connect(&url).await);
    db.migrate().await.expect("Failed to run migrations");

    let seed: Vec<_> = (1..=subjects).map(sample_subject).collect();
    db.subject_repo()
        .upsert_subjects(&seed)
        .await
        .expect("Failed to seed subjects");

    let provider = MockProvider::succeeding("mock_obits", sample_details()).with_latency(latency);
    let registry = ProviderRegistry::new().with(Arc::new(provider));
    let fallback = FallbackFetchChain::new(
        ReqwestFetcher::new().expect("Failed to build fetcher"),
        HtmdCleaner::new(),
        FallbackConfig::unthrottled(),
    );
    let orchestrator = Arc::new(EnrichmentOrchestrator::new(Arc::new(registry), fallback));

    let state = Arc::new(AppState {
        db: db.clone(),
        runs: BatchManager::new(db.clone(), orchestrator),
        admin_token,
    });

    TestApp {
        router: routes::router(state),
        db,
        _container: container,
    }
}

async fn retry_connect(url: &str) -> sqlx::PgPool {
    for _ in 0..30 {
        if let Ok(pool) = PgPoolOptions::new().max_connections(5).connect(url).await {
            return pool;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to test database");
}
