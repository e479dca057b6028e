//! Admin API for pool management
//!
//! Runs on a separate listener (default 9090) and is not meant to be exposed
//! to the scraping client. Proxy listings return decrypted URLs.
//!
//! Endpoints:
//! - GET    /admin/proxies             : list proxies
//! - POST   /admin/proxies             : create proxy `{url, expire_at}`
//! - PUT    /admin/proxies/{id}        : replace proxy url and expiry
//! - DELETE /admin/proxies/{id}        : delete proxy and its identities
//! - GET    /admin/user-agents         : list user agents
//! - POST   /admin/user-agents         : create user agent `{agent}`
//! - DELETE /admin/user-agents/{id}    : delete user agent and its identities
//! - GET    /admin/identities          : list identities
//! - POST   /admin/identities          : pair a proxy with a user agent
//! - DELETE /admin/identities/{id}     : delete identity
//! - GET    /admin/pool                : pool health summary
//! - POST   /admin/jobs/{name}/run     : run a background job now

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use identity_pool::{
    Allocator, Clock, IdentityId, IdentityStore, NewIdentity, NewProxy, ProxyId, Scheduler,
    UserAgentId,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{ApiError, not_found};

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    allocator: Arc<Allocator>,
    scheduler: Arc<Scheduler>,
}

impl AdminState {
    pub fn new(allocator: Arc<Allocator>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            allocator,
            scheduler,
        }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/proxies", get(list_proxies).post(create_proxy))
        .route("/admin/proxies/{id}", put(update_proxy).delete(delete_proxy))
        .route(
            "/admin/user-agents",
            get(list_user_agents).post(create_user_agent),
        )
        .route("/admin/user-agents/{id}", delete(delete_user_agent))
        .route("/admin/identities", get(list_identities).post(create_identity))
        .route("/admin/identities/{id}", delete(delete_identity))
        .route("/admin/pool", get(pool_status))
        .route("/admin/jobs/{name}/run", post(run_job))
        .route_layer(axum::middleware::from_fn(crate::metrics::track_requests))
        .with_state(state)
}

type ApiResult = Result<Response, ApiError>;

fn deleted(found: bool, what: &str) -> Response {
    if found {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(&format!("{what} not found."))
    }
}

async fn list_proxies(State(state): State<AdminState>) -> ApiResult {
    let proxies = state.allocator.store().list_proxies().await?;
    Ok((StatusCode::OK, Json(proxies)).into_response())
}

async fn create_proxy(
    State(state): State<AdminState>,
    Json(body): Json<NewProxy>,
) -> ApiResult {
    let proxy = state.allocator.store().create_proxy(body).await?;
    Ok((StatusCode::CREATED, Json(proxy)).into_response())
}

async fn update_proxy(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    Json(body): Json<NewProxy>,
) -> ApiResult {
    let proxy = state
        .allocator
        .store()
        .update_proxy(ProxyId(id), body)
        .await?;
    Ok((StatusCode::OK, Json(proxy)).into_response())
}

async fn delete_proxy(State(state): State<AdminState>, Path(id): Path<u64>) -> ApiResult {
    let found = state.allocator.store().delete_proxy(ProxyId(id)).await?;
    Ok(deleted(found, "Proxy"))
}

async fn list_user_agents(State(state): State<AdminState>) -> ApiResult {
    let user_agents = state.allocator.store().list_user_agents().await?;
    Ok((StatusCode::OK, Json(user_agents)).into_response())
}

#[derive(Deserialize)]
struct CreateUserAgentRequest {
    agent: String,
}

async fn create_user_agent(
    State(state): State<AdminState>,
    Json(body): Json<CreateUserAgentRequest>,
) -> ApiResult {
    let user_agent = state
        .allocator
        .store()
        .create_user_agent(body.agent)
        .await?;
    Ok((StatusCode::CREATED, Json(user_agent)).into_response())
}

async fn delete_user_agent(State(state): State<AdminState>, Path(id): Path<u64>) -> ApiResult {
    let found = state
        .allocator
        .store()
        .delete_user_agent(UserAgentId(id))
        .await?;
    Ok(deleted(found, "User agent"))
}

async fn list_identities(State(state): State<AdminState>) -> ApiResult {
    let identities = state.allocator.store().list_identities().await?;
    Ok((StatusCode::OK, Json(identities)).into_response())
}

/// POST /admin/identities: returns the identity with proxy and user agent resolved.
async fn create_identity(
    State(state): State<AdminState>,
    Json(body): Json<NewIdentity>,
) -> ApiResult {
    let now = state.allocator.clock().now();
    let identity = state.allocator.store().create_identity(body, now).await?;
    match state.allocator.identity(identity.id).await? {
        Some(record) => Ok((StatusCode::CREATED, Json(record)).into_response()),
        None => Ok(not_found("Identity not found.")),
    }
}

async fn delete_identity(State(state): State<AdminState>, Path(id): Path<u64>) -> ApiResult {
    let found = state
        .allocator
        .store()
        .delete_identity(IdentityId(id))
        .await?;
    Ok(deleted(found, "Identity"))
}

/// GET /admin/pool: same summary as the public health endpoint, always 200.
async fn pool_status(State(state): State<AdminState>) -> ApiResult {
    let health = state.allocator.health().await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "pool": health,
            "scheduler": {
                "running": state.scheduler.is_running(),
                "jobs": state.scheduler.job_names(),
            }
        })),
    )
        .into_response())
}

/// POST /admin/jobs/{name}/run: run a job now unless a run is in flight.
async fn run_job(State(state): State<AdminState>, Path(name): Path<String>) -> ApiResult {
    let outcome = state.scheduler.run_now(&name).await?;
    info!(job = %name, ?outcome, "job run requested by operator");
    Ok((StatusCode::OK, Json(outcome)).into_response())
}
