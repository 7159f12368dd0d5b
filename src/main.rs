mod alerts;
mod browser;
mod config;
mod crypto;
mod decision;
mod http;
mod jobs;
mod metrics;
mod models;
mod pipeline;
mod profit;
mod security;
mod shopee;
mod store;

use alerts::WebhookAlerts;
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use browser::{Browser, BrowserAutomation, SelectorSet, SessionPool, WebDriverBrowser};
use config::{WorkerConfig, env_parse, non_empty_var};
use crypto::SecretBox;
use jobs::{Backoff, JobEnvelope, JobMessage, JobQueue, MemoryQueue, QueueError, RedisQueue, Worker};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::ApiError;
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_admin_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shopee::ShopeeClient;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{MemoryStore, Store, SupabaseStore};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "dropship.worker", "worker crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env();
    let secrets = SecretBox::from_key_material(config.credentials_key.as_deref())?;
    if !secrets.is_configured() {
        warn!(
            target = "dropship.worker",
            "CREDENTIALS_AES_KEY is not set; stored credentials cannot be decrypted"
        );
    }

    let store: Arc<dyn Store> = match SupabaseStore::from_env() {
        Some(store) => Arc::new(store),
        None => {
            warn!(
                target = "dropship.worker",
                "SUPABASE_URL or SUPABASE_SERVICE_ROLE_KEY missing; using in-memory store"
            );
            Arc::new(MemoryStore::new())
        }
    };

    let backoff = Backoff::new(config.job_backoff, config.job_attempts);
    let queue: Arc<dyn JobQueue> = match non_empty_var("REDIS_URL") {
        Some(url) => Arc::new(RedisQueue::connect(&url, backoff).await?),
        None => {
            warn!(
                target = "dropship.worker",
                "REDIS_URL missing; jobs are kept in memory and lost on restart"
            );
            Arc::new(MemoryQueue::new(backoff))
        }
    };

    let selectors = Arc::new(SelectorSet::load(config.selectors_path.as_deref())?);
    let browser: Arc<dyn Browser> = Arc::new(WebDriverBrowser::new(&config));
    let pool = Arc::new(SessionPool::new(
        browser.clone(),
        config.session_dir.clone(),
        config.session_idle,
    ));
    let automation = Arc::new(BrowserAutomation::new(
        browser,
        pool.clone(),
        selectors,
        &config,
    ));
    let pipeline = Arc::new(Pipeline::new(
        store,
        queue.clone(),
        automation,
        Arc::new(ShopeeClient::from_env()),
        Arc::new(WebhookAlerts::new(config.alert_webhook_url.clone())),
        secrets,
        config.poll_interval,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Worker::new(
        queue.clone(),
        pipeline.clone(),
        config.concurrency,
        config.queue_tick,
    )
    .spawn(shutdown_rx.clone());
    let sweeper = tokio::spawn(sweep_sessions(pool.clone(), shutdown_rx));

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        pipeline,
        queue,
        prometheus_handle,
    };
    let app = router(state, AuthState::from_env()).layer(TraceLayer::new_for_http());

    let port: u16 = env_parse("PORT", 8080);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(
        target = "dropship.worker",
        concurrency = config.concurrency,
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(target = "dropship.worker", "shutdown requested; draining jobs");
    let _ = shutdown_tx.send(true);
    if let Err(err) = worker.await {
        error!(target = "dropship.worker", error = %err, "worker_join_failed");
    }
    let _ = sweeper.await;
    pool.shutdown().await;
    info!(target = "dropship.worker", "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "dropship.worker", error = %err, "signal_listener_failed");
    }
}

async fn sweep_sessions(pool: Arc<SessionPool>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        let evicted = pool.evict_idle().await;
        if evicted > 0 {
            info!(target = "dropship.browser", evicted, "idle_sessions_evicted");
        }
        metrics::browser_contexts(pool.open_count());
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    queue: Arc<dyn JobQueue>,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState, auth: AuthState) -> Router {
    let protected = Router::new()
        .route("/jobs", post(enqueue_job))
        .route("/jobs/failed", get(failed_jobs))
        .route("/orders/{order_sn}/retry", post(retry_order))
        .route_layer(middleware::from_fn_with_state(auth, require_admin_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "dropship-worker",
    }))
}

/// Prometheus text exposition. Guarded by `X-Metrics-Key` when
/// `METRICS_KEY` is set.
async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = non_empty_var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: Uuid,
}

/// Put any job message on the queue.
///
/// - Method: `POST`
/// - Path: `/jobs`
/// - Body: `{"name": "poll-shop", "data": {"shopId": "..."}}`
async fn enqueue_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(message): Json<JobMessage>,
) -> Result<Json<EnqueueResponse>, AppError> {
    metrics::inc_requests("/jobs");
    let job = message.name();
    let job_id = state.queue.enqueue(message).await?;
    info!(
        target = "dropship.api",
        key_id = %context.key_id,
        job,
        %job_id,
        "job_enqueued"
    );
    Ok(Json(EnqueueResponse { job_id }))
}

#[derive(Debug, Deserialize)]
struct FailedQuery {
    limit: Option<usize>,
}

/// Retained failures, newest first.
async fn failed_jobs(
    State(state): State<AppState>,
    Query(query): Query<FailedQuery>,
) -> Result<Json<Vec<JobEnvelope>>, AppError> {
    metrics::inc_requests("/jobs/failed");
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.queue.failed(limit).await?))
}

/// Send a parked order (MANUAL_REVIEW or SKIPPED) back through the queue.
async fn retry_order(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(order_sn): Path<String>,
) -> Result<Json<EnqueueResponse>, AppError> {
    metrics::inc_requests("/orders/retry");
    let job_id = state.pipeline.retry_order(&order_sn).await?;
    info!(
        target = "dropship.api",
        key_id = %context.key_id,
        order_sn = %order_sn,
        %job_id,
        "order_retry_enqueued"
    );
    Ok(Json(EnqueueResponse { job_id }))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Queue(QueueError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<QueueError> for AppError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::Configuration if err.detail().contains("not found") => {
                        StatusCode::NOT_FOUND
                    }
                    PipelineErrorKind::Configuration => StatusCode::CONFLICT,
                    PipelineErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, payload)
            }
            AppError::Queue(err) => {
                error!(target = "dropship.api", error = %err, "queue_request_failed");
                let payload = ApiError {
                    error: "queue".to_string(),
                    detail: Some(err.to_string()),
                };
                (StatusCode::SERVICE_UNAVAILABLE, payload)
            }
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingStatus;
    use crate::pipeline::testing::Harness;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        harness_store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
    }

    fn test_app() -> TestApp {
        let harness = Harness::new();
        harness.put_order("SN-PARKED", ProcessingStatus::ManualReview);
        harness.put_order("SN-DONE", ProcessingStatus::Fulfilled);
        let store = harness.store.clone();
        let queue = harness.queue.clone();
        let state = AppState {
            pipeline: Arc::new(harness.pipeline),
            queue: queue.clone(),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        TestApp {
            app: router(state, AuthState::parse("ops:s3cret")),
            harness_store: store,
            queue,
        }
    }

    fn authed(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer s3cret")
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let t = test_app();
        let response = t
            .app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["service"], "dropship-worker");
    }

    #[tokio::test]
    async fn admin_routes_require_a_key() {
        let t = test_app();
        let response = t
            .app
            .oneshot(Request::get("/jobs/failed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "missing_api_key");
    }

    #[tokio::test]
    async fn enqueues_job_messages() {
        let t = test_app();
        let body = json!({"name": "poll-shop", "data": {"shopId": "shop-1"}}).to_string();
        let response = t
            .app
            .oneshot(authed("POST", "/jobs", Body::from(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["job_id"].is_string());

        let waiting = t.queue.waiting();
        assert_eq!(waiting.len(), 1);
        assert_eq!(
            waiting[0].message,
            JobMessage::PollShop {
                shop_id: "shop-1".into()
            }
        );
    }

    #[tokio::test]
    async fn retries_parked_orders() {
        let t = test_app();
        let response = t
            .app
            .oneshot(authed("POST", "/orders/SN-PARKED/retry", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            t.harness_store.order("SN-PARKED").unwrap().processing_status,
            ProcessingStatus::Queued
        );
        assert_eq!(t.queue.waiting().len(), 1);
    }

    #[tokio::test]
    async fn retry_rejects_fulfilled_and_unknown_orders() {
        let t = test_app();
        let response = t
            .app
            .clone()
            .oneshot(authed("POST", "/orders/SN-DONE/retry", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "retry");

        let response = t
            .app
            .oneshot(authed("POST", "/orders/SN-NOPE/retry", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(t.queue.waiting().is_empty());
    }

    #[tokio::test]
    async fn lists_failed_jobs() {
        let t = test_app();
        let response = t
            .app
            .oneshot(authed("GET", "/jobs/failed?limit=5", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!([]));
    }
}
