// HTTP surface for the engine
//
// Routes:
// - POST /v1/rpc                          tagged EngineRequest
// - POST /v1/credentials                  issue
// - DELETE /v1/credentials/{id}           revoke
// - POST /v1/credentials/{id}/reactivate  reactivate
// - GET  /v1/credentials/{id}/validate    validate, optionally for ?owner_id=
// - POST /v1/admit                        check-and-admit (429 on deny)
// - GET  /v1/usage                        query with filter in the query string
// - GET  /v1/dashboard/{user_id}          server-sent snapshot stream
// - GET  /v1/audit/export                 audit entries, newest first
// - GET  /metrics, GET /health
//
// The caller's credential travels in `x-api-key` or `Authorization: Bearer`.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::{EngineRequest, EngineResponse, ErrorBody};
use crate::audit::{AuditAction, AuditFilter};
use crate::config::Config;
use crate::credentials::CredentialKind;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::ledger::UsageFilter;
use crate::metrics;
use crate::rate_limit::Admission;

const API_KEY_HEADER: &str = "x-api-key";

/// Engine error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !self.0.is_client_error() {
            error!("Request failed: {}", self.0);
        }
        let mut response = (status, Json(ErrorBody::from(&self.0))).into_response();
        if let EngineError::RateLimited { retry_after } = &self.0 {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Credential presented by the caller, if any
fn caller_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(key.trim().to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

/// Build the router; `/metrics` is mounted when `with_metrics` is set
pub fn router(engine: Arc<Engine>, with_metrics: bool) -> Router {
    let mut app = Router::new()
        .route("/v1/rpc", post(rpc_handler))
        .route("/v1/credentials", post(issue_handler))
        .route("/v1/credentials/{id}", delete(revoke_handler))
        .route("/v1/credentials/{id}/reactivate", post(reactivate_handler))
        .route("/v1/credentials/{id}/validate", get(validate_handler))
        .route("/v1/admit", post(admit_handler))
        .route("/v1/usage", get(usage_handler))
        .route("/v1/dashboard/{user_id}", get(dashboard_handler))
        .route("/v1/audit/export", get(audit_export_handler))
        .route("/health", get(health_handler));
    if with_metrics {
        app = app.route("/metrics", get(metrics_handler));
    }
    app.layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Serve the engine API until ctrl-c
pub async fn serve(engine: Arc<Engine>, config: &Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let dedicated_metrics = config.metrics.enabled && config.metrics.port != 0;
    if dedicated_metrics {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!("Metrics server stopped: {:#}", e);
            }
        });
    }

    let app = router(
        engine.clone(),
        config.metrics.enabled && !dedicated_metrics,
    );

    info!("Starting engine API on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind engine API on {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Engine API server error")?;

    engine.shutdown();
    Ok(())
}

/// Start a dedicated metrics HTTP server on `port`
pub async fn start_metrics_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind metrics server")?;
    axum::serve(listener, app)
        .await
        .context("Metrics server error")?;
    Ok(())
}

async fn rpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EngineRequest>,
) -> ApiResult<Json<EngineResponse>> {
    let caller = caller_credential(&headers);
    Ok(Json(state.engine.handle(caller.as_deref(), request).await?))
}

#[derive(Debug, Deserialize)]
struct IssueBody {
    owner_id: String,
    #[serde(default)]
    kind: Option<CredentialKind>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

async fn issue_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IssueBody>,
) -> ApiResult<(StatusCode, Json<EngineResponse>)> {
    let caller = caller_credential(&headers);
    let request = EngineRequest::IssueCredential {
        owner_id: body.owner_id,
        kind: body.kind.unwrap_or(CredentialKind::ApiKey),
        ttl_secs: body.ttl_secs,
    };
    let response = state.engine.handle(caller.as_deref(), request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn revoke_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let caller = caller_credential(&headers);
    state
        .engine
        .handle(caller.as_deref(), EngineRequest::RevokeCredential { id })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reactivate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let caller = caller_credential(&headers);
    state
        .engine
        .handle(caller.as_deref(), EngineRequest::ReactivateCredential { id })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ValidateParams {
    #[serde(default)]
    check_expiry: Option<bool>,
    #[serde(default)]
    owner_id: Option<String>,
}

async fn validate_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ValidateParams>,
) -> ApiResult<Json<EngineResponse>> {
    let request = EngineRequest::ValidateCredential {
        id,
        check_expiry: params.check_expiry.unwrap_or(true),
        owner_id: params.owner_id,
    };
    Ok(Json(state.engine.handle(None, request).await?))
}

#[derive(Debug, Deserialize)]
struct AdmitBody {
    credential_id: String,
    endpoint: String,
    #[serde(default)]
    identifier: String,
}

async fn admit_handler(
    State(state): State<AppState>,
    Json(body): Json<AdmitBody>,
) -> ApiResult<Json<Admission>> {
    let request = EngineRequest::CheckAndAdmit {
        credential_id: body.credential_id,
        endpoint: body.endpoint,
        identifier: body.identifier,
    };
    match state.engine.handle(None, request).await? {
        EngineResponse::Admission(admission) => Ok(Json(admission.into_result()?)),
        other => Err(ApiError(EngineError::Unavailable(format!(
            "unexpected response {:?}",
            other
        )))),
    }
}

async fn usage_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<UsageFilter>,
) -> ApiResult<Json<EngineResponse>> {
    let caller = caller_credential(&headers);
    let response = state
        .engine
        .handle(caller.as_deref(), EngineRequest::QueryUsage { filter })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuditExportParams {
    actor: Option<String>,
    action: Option<AuditAction>,
    target: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: usize,
}

async fn audit_export_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuditExportParams>,
) -> ApiResult<Json<EngineResponse>> {
    let caller = caller_credential(&headers);
    let request = EngineRequest::ExportAudit {
        filter: AuditFilter {
            actor: params.actor,
            action: params.action,
            target: params.target,
            from: params.from,
            to: params.to,
        },
        limit: params.limit,
        offset: params.offset,
    };
    Ok(Json(state.engine.handle(caller.as_deref(), request).await?))
}

/// Stream dashboard snapshots until the client goes away
///
/// The subscription lives inside the stream; when the connection drops,
/// the stream and with it the subscription are dropped.
async fn dashboard_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let caller = caller_credential(&headers);
    state.engine.authorize_user(caller.as_deref(), &user_id)?;
    let subscription = state.engine.subscribe_dashboard(&user_id)?;

    let events = stream::unfold(subscription, |subscription| async move {
        let snapshot = subscription.recv().await?;
        let event = Event::default()
            .event("snapshot")
            .json_data(&snapshot)
            .unwrap_or_else(|e| Event::default().comment(format!("encode error: {}", e)));
        Some((Ok(event), subscription))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Arc<Engine>, Router) {
        let mut config = Config::default();
        config.server.admin_role = None;
        let engine = Arc::new(
            Engine::in_memory(&config, Arc::new(ManualClock::at_unix(1_700_000_040))).unwrap(),
        );
        (engine.clone(), router(engine, true))
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_caller_credential_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_credential(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer kgt_abc"));
        assert_eq!(caller_credential(&headers).as_deref(), Some("kgt_abc"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("kg_xyz"));
        assert_eq!(caller_credential(&headers).as_deref(), Some("kg_xyz"));
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_issue_then_deny_with_retry_after() {
        let (engine, app) = app();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/v1/credentials", json!({"owner_id": "u1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["result"], "credential");
        let key = body["value"]["id"].as_str().unwrap().to_string();

        engine.limiter().upsert_config(&key, "/predict", 1, 10).unwrap();

        let admit = json!({"credential_id": key, "endpoint": "/predict"});
        let response = app
            .clone()
            .oneshot(json_request("POST", "/v1/admit", admit.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/v1/admit", admit))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        let body = body_json(response).await;
        assert_eq!(body["kind"], "rate_limited");
    }

    #[tokio::test]
    async fn test_rpc_errors_map_to_status() {
        let (_, app) = app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/rpc",
                json!({"op": "validate_credential", "id": "kg_missing"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/rpc",
                json!({"op": "upsert_rate_limit", "credential_id": "kg_1", "endpoint": "/x", "limit": 0, "period_secs": 10}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_audit_export_filters_by_action() {
        let (_, app) = app();
        for owner in ["u1", "u2"] {
            let response = app
                .clone()
                .oneshot(json_request("POST", "/v1/credentials", json!({"owner_id": owner})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/rpc",
                json!({"op": "create_role", "name": "analyst"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/v1/audit/export?action=credential_issued&limit=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"], "audit_entries");
        let entries = body["value"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["action"], "credential_issued");
        assert_eq!(entries[0]["actor"], "anonymous");
        assert_eq!(entries[0]["details"], "owner=u2 kind=api_key");
    }

    #[tokio::test]
    async fn test_validate_with_wrong_owner_is_forbidden() {
        let (engine, app) = app();
        let key = engine
            .credentials()
            .issue("u1", CredentialKind::ApiKey, None)
            .await
            .unwrap();
        let uri = format!("/v1/credentials/{}/validate?owner_id=u2", key.id);
        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let uri = format!("/v1/credentials/{}/validate?owner_id=u1", key.id);
        let response = app
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_route() {
        metrics::init().unwrap();
        let (_, app) = app();
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dashboard_stream_sends_primed_snapshot() {
        let (engine, app) = app();
        let response = app
            .oneshot(Request::get("/v1/dashboard/u1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(engine.telemetry().subscription_count(Some("u1")), 1);

        let mut frames = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(2), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("event: snapshot"));
        assert!(text.contains("\"user_id\":\"u1\""));

        drop(frames);
        assert_eq!(engine.telemetry().subscription_count(Some("u1")), 0);
    }
}
