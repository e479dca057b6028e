//! Public API consumed by the scraping client
//!
//! Endpoints:
//! - GET   /select-identity                : random healthy identity
//! - PATCH /update-identity-status/{id}    : report a status code for an identity
//! - GET   /health                         : pool health summary
//! - GET   /metrics                        : Prometheus exposition

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router, middleware};
use identity_pool::{Allocator, IdentityId, PoolStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};

use crate::error::{ApiError, not_found};

const IDENTITY_NOT_FOUND: &str = "Identity not found.";
const FIELD_REQUIRED: &str = "This field is required.";
const INVALID_INTEGER: &str = "A valid integer is required.";

/// Shared state for public handlers
#[derive(Clone)]
pub struct AppState {
    allocator: Arc<Allocator>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl AppState {
    pub fn new(allocator: Arc<Allocator>, prometheus: PrometheusHandle) -> Self {
        Self {
            allocator,
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the public router.
///
/// Applies a concurrency limit layer sized by `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/select-identity", get(select_identity))
        .route("/update-identity-status/{id}", patch(update_identity_status))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(crate::metrics::track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// GET /select-identity: one identity with status 200, chosen uniformly.
async fn select_identity(State(state): State<AppState>) -> Response {
    match state.allocator.select().await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(identity_pool::Error::NotFound(message)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "message": message }))).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// PATCH /update-identity-status/{id}: body `{"status": <integer>}`.
///
/// The identity is looked up before the body is validated, so an unknown id
/// is a 404 regardless of the payload.
async fn update_identity_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(id) = raw_id.parse::<u64>().map(IdentityId) else {
        return not_found(IDENTITY_NOT_FOUND);
    };

    match state.allocator.identity(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(IDENTITY_NOT_FOUND),
        Err(e) => return ApiError(e).into_response(),
    }

    let status = match parse_status(&body) {
        Ok(status) => status,
        Err(response) => return response,
    };

    match state.allocator.report_status(id, status).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        // Deleted between the lookup and the write
        Err(identity_pool::Error::NotFound(_)) => not_found(IDENTITY_NOT_FOUND),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Pull an integer `status` out of the request body.
///
/// Accepts JSON numbers with no fractional part and numeric strings, within
/// `i32` range. An empty body counts as an empty object.
fn parse_status(body: &[u8]) -> Result<i32, Response> {
    let payload: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(body).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": format!("JSON parse error - {e}") })),
            )
                .into_response()
        })?
    };

    let Value::Object(fields) = payload else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "non_field_errors": ["Invalid data. Expected a dictionary."] })),
        )
            .into_response());
    };

    let code = match fields.get("status") {
        None | Some(Value::Null) => {
            return Err(ApiError::field("status", FIELD_REQUIRED).into_response());
        }
        Some(Value::Number(n)) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };

    code.and_then(|c| i32::try_from(c).ok())
        .ok_or_else(|| ApiError::field("status", INVALID_INTEGER).into_response())
}

/// GET /health: 200 while any identity is selectable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> Response {
    let health = match state.allocator.health().await {
        Ok(h) => h,
        Err(e) => return ApiError(e).into_response(),
    };

    let status_code = if health.status == PoolStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let mut body = serde_json::to_value(&health).unwrap_or_else(|_| json!({}));
    body["uptime_seconds"] = json!(state.started_at.elapsed().as_secs());

    (status_code, Json(body)).into_response()
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use field_crypto::{FieldCipher, generate_key};
    use identity_pool::{
        FileStore, HealthStatus, IdentityStore, NewIdentity, NewProxy, SystemClock,
    };
    use tower::ServiceExt;

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn test_allocator() -> Arc<Allocator> {
        let codec = Arc::new(FieldCipher::from_base64_key(&generate_key()).unwrap());
        Arc::new(Allocator::new(
            Arc::new(FileStore::in_memory(codec)),
            Arc::new(SystemClock),
        ))
    }

    fn app(allocator: Arc<Allocator>) -> Router {
        build_router(AppState::new(allocator, test_prometheus_handle()), 1000)
    }

    /// Adds identities with the given statuses, each on its own proxy.
    async fn seed(allocator: &Allocator, statuses: &[i32]) -> Vec<IdentityId> {
        let store = allocator.store();
        let ua = store
            .create_user_agent("Mozilla/5.0 (Windows NT 10.0)".into())
            .await
            .unwrap();
        let mut ids = Vec::new();
        for (i, code) in statuses.iter().enumerate() {
            let proxy = store
                .create_proxy(NewProxy {
                    url: Some(format!("http://user:pw@10.0.1.{i}:3128")),
                    expire_at: None,
                })
                .await
                .unwrap();
            let identity = store
                .create_identity(
                    NewIdentity {
                        proxy_id: proxy.id,
                        user_agent_id: ua.id,
                        status: HealthStatus::from(*code),
                    },
                    chrono::Utc::now(),
                )
                .await
                .unwrap();
            ids.push(identity.id);
        }
        ids
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn patch_status(id: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("PATCH")
            .uri(format!("/update-identity-status/{id}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn select_on_empty_pool_returns_404_message() {
        let (status, json) = send(app(test_allocator()), get_req("/select-identity")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json, json!({ "message": "No identities with status 200" }));
    }

    #[tokio::test]
    async fn select_returns_nested_identity() {
        let allocator = test_allocator();
        let ids = seed(&allocator, &[200]).await;

        let (status, json) = send(app(allocator), get_req("/select-identity")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], ids[0].0);
        assert_eq!(json["status"], 200);
        assert_eq!(json["proxy"]["url"], "http://user:pw@10.0.1.0:3128");
        assert_eq!(json["user_agent"]["agent"], "Mozilla/5.0 (Windows NT 10.0)");
        assert!(json["updated_at"].is_string());
    }

    #[tokio::test]
    async fn select_never_returns_unhealthy_identities() {
        let allocator = test_allocator();
        let ids = seed(&allocator, &[429, 200, 503, 200]).await;
        let router = app(allocator);

        for _ in 0..50 {
            let (status, json) = send(router.clone(), get_req("/select-identity")).await;
            assert_eq!(status, StatusCode::OK);
            let id = json["id"].as_u64().unwrap();
            assert!(id == ids[1].0 || id == ids[3].0, "selected {id}");
        }
    }

    #[tokio::test]
    async fn update_status_stores_any_integer() {
        let allocator = test_allocator();
        let ids = seed(&allocator, &[200]).await;
        let id = ids[0].to_string();

        let (status, json) = send(
            app(allocator.clone()),
            patch_status(&id, r#"{"status": 409}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], 409);

        let (status, json) = send(app(allocator), patch_status(&id, r#"{"status": "429"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], 429);
    }

    #[tokio::test]
    async fn update_unknown_identity_is_404_before_validation() {
        let allocator = test_allocator();
        seed(&allocator, &[200]).await;

        for (id, body) in [
            ("999", r#"{"status": 200}"#),
            ("999", r#"{"oops": true}"#),
            ("999", "not json"),
            ("abc", r#"{"status": 200}"#),
        ] {
            let (status, json) = send(app(allocator.clone()), patch_status(id, body)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "id={id} body={body}");
            assert_eq!(json, json!({ "detail": "Identity not found." }));
        }
    }

    #[tokio::test]
    async fn update_with_missing_status_is_400() {
        let allocator = test_allocator();
        let ids = seed(&allocator, &[200]).await;
        let id = ids[0].to_string();

        for body in [r#"{}"#, r#"{"status": null}"#, ""] {
            let (status, json) = send(app(allocator.clone()), patch_status(&id, body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body={body}");
            assert_eq!(json, json!({ "status": ["This field is required."] }));
        }
    }

    #[tokio::test]
    async fn update_with_non_integer_status_is_400() {
        let allocator = test_allocator();
        let ids = seed(&allocator, &[200]).await;
        let id = ids[0].to_string();

        for body in [
            r#"{"status": "abc"}"#,
            r#"{"status": 4.5}"#,
            r#"{"status": [200]}"#,
            r#"{"status": 99999999999}"#,
        ] {
            let (status, json) = send(app(allocator.clone()), patch_status(&id, body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body={body}");
            assert_eq!(json, json!({ "status": ["A valid integer is required."] }));
        }

        // Nothing was written
        let current = allocator.identity(ids[0]).await.unwrap().unwrap();
        assert_eq!(current.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn update_with_malformed_json_is_400() {
        let allocator = test_allocator();
        let ids = seed(&allocator, &[200]).await;

        let (status, json) = send(
            app(allocator),
            patch_status(&ids[0].to_string(), r#"{"status": "#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            json["detail"]
                .as_str()
                .unwrap()
                .starts_with("JSON parse error")
        );
    }

    #[tokio::test]
    async fn rate_limited_report_removes_identity_from_selection() {
        let allocator = test_allocator();
        let ids = seed(&allocator, &[200]).await;

        let (status, _) = send(
            app(allocator.clone()),
            patch_status(&ids[0].to_string(), r#"{"status": 429}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(app(allocator), get_req("/select-identity")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_is_503_when_nothing_is_selectable() {
        let allocator = test_allocator();
        let (status, json) = send(app(allocator.clone()), get_req("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");

        seed(&allocator, &[200, 429]).await;
        let (status, json) = send(app(allocator), get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["identities_total"], 2);
        assert_eq!(json["identities_rate_limited"], 1);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let response = app(test_allocator())
            .oneshot(get_req("/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn requests_are_counted_by_route() {
        let (recorder, handle) = crate::metrics::isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        send(app(test_allocator()), get_req("/select-identity")).await;

        let output = handle.render();
        assert!(output.contains("http_requests_total"));
        assert!(output.contains("route=\"/select-identity\""));
        assert!(output.contains("status=\"404\""));
    }
}
