//! JSON/HTTP surface that lets a manager serve as the remote peer of
//! delegated pools.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::PoolManager;
use crate::backends::ErrorBody;
use crate::error::{ErrorClass, PoolError};
use crate::memory::{MemoryAggregator, SearchFilters};
use crate::pool::{PoolConfig, Task};
use crate::router::RoutingStrategy;

/// Upper bound on `limit` for `/api/search`.
const MAX_SEARCH_LIMIT: usize = 200;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PoolManager>,
    /// Serves `/api/search` when present.
    pub memory: Option<Arc<MemoryAggregator>>,
    /// Bearer token required on `/api` routes (None disables auth).
    pub token: Option<SecretString>,
}

/// Build the router. `/health` is always open; `/api` requires the token when set.
pub fn remote_manager_routes(manager: Arc<PoolManager>, token: Option<SecretString>) -> Router {
    routes(AppState {
        manager,
        memory: None,
        token,
    })
}

/// The remote-manager surface plus cross-pool memory search.
pub fn orchestrator_routes(
    manager: Arc<PoolManager>,
    memory: Arc<MemoryAggregator>,
    token: Option<SecretString>,
) -> Router {
    routes(AppState {
        manager,
        memory: Some(memory),
        token,
    })
}

fn routes(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/pools", get(list_pools).post(spawn_pool))
        .route("/api/pools/{id}", axum::routing::delete(close_pool))
        .route("/api/pools/{id}/execute", post(execute))
        .route("/api/pools/{id}/health", get(pool_health))
        .route("/api/pools/{id}/scale", post(scale))
        .route("/api/route", post(route_task))
        .route("/api/health", get(health_report))
        .route("/api/search", get(search))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `PoolError` rendered as `{ class, message, retryable, pool_id }`.
pub struct ApiError(pub PoolError);

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        Self(err)
    }
}

fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Configuration => StatusCode::BAD_REQUEST,
        ErrorClass::PoolNotFound => StatusCode::NOT_FOUND,
        ErrorClass::PoolUnavailable => StatusCode::CONFLICT,
        ErrorClass::BackendUnavailable | ErrorClass::NoAvailablePool => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorClass::Execution => StatusCode::BAD_GATEWAY,
        ErrorClass::CapabilityNotSupported => StatusCode::NOT_IMPLEMENTED,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self.0);
        (status_for(body.class), Json(body)).into_response()
    }
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.token else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.expose_secret()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "missing or invalid bearer token"})),
        )
            .into_response()
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pool-orchestrator",
        "pools": state.manager.list_pools().await.len(),
    }))
}

async fn health_report(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.health_report().await)
}

// ── Pools ───────────────────────────────────────────────────────────────

async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list_pools().await)
}

async fn spawn_pool(
    State(state): State<AppState>,
    Json(config): Json<PoolConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let pool_id = state.manager.spawn_pool(config).await?;
    let summary = state.manager.pool(&pool_id).await?.summary().await;
    info!(pool_id = %pool_id, "Pool spawned via API");
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(task): Json<Task>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.manager.execute_on_pool(&id, task).await?;
    Ok(Json(result))
}

async fn pool_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.manager.pool(&id).await?;
    Ok(Json(pool.health().await))
}

#[derive(Deserialize)]
struct ScaleRequest {
    target: usize,
}

async fn scale(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ScaleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ack = state.manager.scale_pool(&id, body.target).await?;
    Ok(Json(ack))
}

async fn close_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.close_pool(&id).await?;
    Ok(Json(serde_json::json!({"status": "closed", "pool_id": id})))
}

#[derive(Deserialize)]
struct RouteRequest {
    task: Task,
    #[serde(default)]
    strategy: RoutingStrategy,
    affinity_key: Option<String>,
}

async fn route_task(
    State(state): State<AppState>,
    Json(body): Json<RouteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let routed = state
        .manager
        .route_task(body.task, body.strategy, body.affinity_key.as_deref())
        .await?;
    Ok(Json(routed))
}

// ── Memory ──────────────────────────────────────────────────────────────

fn default_search_limit() -> usize {
    10
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
    pool_id: Option<String>,
    #[serde(default)]
    success_only: bool,
}

async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let Some(memory) = &state.memory else {
        return (
            StatusCode::NOT_IMPLEMENTED,
            Json(serde_json::json!({"error": "memory search is not configured"})),
        )
            .into_response();
    };
    let filters = SearchFilters {
        pool_id: params.pool_id,
        success_only: params.success_only,
    };
    let limit = params.limit.min(MAX_SEARCH_LIMIT);
    match memory
        .cross_pool_search_with(&params.q, &state.manager, &filters, limit, true)
        .await
    {
        Ok(hits) => Json(hits).into_response(),
        Err(e) => {
            warn!(error = %e, "Memory search failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::backends::BackendFactory;
    use crate::bus::MessageBus;
    use crate::config::{ManagerConfig, SyncConfig};
    use crate::memory::LibSqlMemoryStore;
    use crate::pool::{BackendType, PoolConfig, Task};
    use crate::runtime::CommandRuntime;

    fn app(token: Option<&str>) -> Router {
        let factory = BackendFactory::new(Arc::new(CommandRuntime::new("cat")));
        let manager = PoolManager::new(factory, Arc::new(MessageBus::default()), ManagerConfig::default());
        remote_manager_routes(manager, token.map(SecretString::from))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = app(Some("secret"))
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn api_requires_token() {
        let response = app(Some("secret"))
            .oneshot(HttpRequest::get("/api/pools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(Some("secret"))
            .oneshot(
                HttpRequest::get("/api/pools")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_pool_is_structured_404() {
        let response = app(None)
            .oneshot(
                HttpRequest::get("/api/pools/ghost/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = json_body(response).await;
        assert_eq!(body["class"], "pool_not_found");
        assert_eq!(body["pool_id"], "ghost");
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn bad_config_is_400() {
        let config = serde_json::json!({
            "name": "bad",
            "pool_type": "direct",
            "min_workers": 4,
            "max_workers": 1,
            "worker_type": "echo"
        });
        let response = app(None)
            .oneshot(
                HttpRequest::post("/api/pools")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(config.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["class"], "configuration");
    }

    #[tokio::test]
    async fn search_needs_memory() {
        let response = app(None)
            .oneshot(HttpRequest::get("/api/search?q=x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn search_covers_stored_and_live_results() {
        let factory = BackendFactory::new(Arc::new(CommandRuntime::new("cat")));
        let manager = PoolManager::new(factory, Arc::new(MessageBus::default()), ManagerConfig::default());
        let pool_id = manager
            .spawn_pool(PoolConfig::new("docs", BackendType::Direct, "echo"))
            .await
            .unwrap();
        manager
            .execute_on_pool(&pool_id, Task::prompt("rebuild search index"))
            .await
            .unwrap();

        let store = Arc::new(LibSqlMemoryStore::new_memory().await.unwrap());
        let memory = Arc::new(MemoryAggregator::new(store, SyncConfig::default()));
        memory.collect_and_sync(&manager).await;
        manager
            .execute_on_pool(&pool_id, Task::prompt("index cleanup"))
            .await
            .unwrap();

        let app = orchestrator_routes(manager, memory, None);
        let response = app
            .oneshot(
                HttpRequest::get("/api/search?q=index&limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let sources: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|hit| hit["source"].as_str().unwrap())
            .collect();
        assert_eq!(sources.len(), 2);
        assert!(sources.contains(&"store"));
        assert!(sources.contains(&"live"));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(ErrorClass::ExecutionTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorClass::CapabilityNotSupported), StatusCode::NOT_IMPLEMENTED);
    }
}
