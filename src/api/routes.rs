/*
* Balancer HTTP API
* -----------------
* Control surface of the daemon. Every handler takes the single state lock, so
* requests are serialized with guest reports, periodic passes and balloon
* socket clients.
*
* Endpoints (under the configured prefix, `/api/v1` by default):
* POST   /domains/{id}          - start tracking a domain
* DELETE /domains/{id}          - stop tracking a domain
* PUT    /domains/{id}/meminfo  - guest usage report, triggers a balance pass
* POST   /balance               - run a balance pass now
* POST   /balloon               - free `amount` bytes for the host
* GET    /domains               - status of every tracked domain
* GET    /health                - liveness
*/

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::api::error::ApiError;
use crate::api::middleware::rate_limit::MeminfoLimiter;
use crate::core::{DomId, DomainStatus, IngestOutcome, SystemState};
use crate::errors::BalancerError;
use crate::AsyncMutex;

/// Upper bound on request bodies. Samples larger than the ingest limit still
/// get through so they are rejected with a reason.
const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<AsyncMutex<SystemState>>,
    pub limiter: Arc<MeminfoLimiter>,
}

impl AppState {
    pub fn new(balancer: Arc<AsyncMutex<SystemState>>, limiter: MeminfoLimiter) -> Self {
        Self {
            balancer,
            limiter: Arc::new(limiter),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BalloonRequest {
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalloonResponse {
    pub granted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeminfoResponse {
    pub domid: DomId,
    pub mem_used: u64,
}

pub fn create_router(state: AppState, prefix: &str) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/domains", get(list_domains))
        .route("/domains/{id}", post(add_domain).delete(remove_domain))
        .route("/domains/{id}/meminfo", put(report_meminfo))
        .route("/balance", post(balance))
        .route("/balloon", post(balloon));

    let prefix = prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(prefix, api)
    };

    router
        .fallback(fallback_handler)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let balancer = state.balancer.lock().await;
    Json(json!({
        "status": "ok",
        "domains": balancer.registry().len(),
        "balancing_disabled": balancer.balancing_disabled(),
    }))
}

async fn list_domains(State(state): State<AppState>) -> Json<Vec<DomainStatus>> {
    Json(state.balancer.lock().await.status())
}

async fn add_domain(State(state): State<AppState>, Path(id): Path<DomId>) -> StatusCode {
    state.balancer.lock().await.add_domain(id);
    StatusCode::CREATED
}

async fn remove_domain(
    State(state): State<AppState>,
    Path(id): Path<DomId>,
) -> Result<StatusCode, ApiError> {
    let removed = state.balancer.lock().await.del_domain(id);
    state.limiter.forget_stale();
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(BalancerError::UnknownDomain(id).into())
    }
}

async fn report_meminfo(
    State(state): State<AppState>,
    Path(id): Path<DomId>,
    body: String,
) -> Result<Response, ApiError> {
    if let Err(throttled) = state.limiter.check(id) {
        debug!(domid = id, "Throttled meminfo report");
        return Ok(throttled.into_response());
    }
    let mut balancer = state.balancer.lock().await;
    if !balancer.registry().contains(id) {
        return Err(BalancerError::UnknownDomain(id).into());
    }

    match balancer.report_meminfo(id, &body).await? {
        IngestOutcome::Accepted { mem_used } => Ok(Json(MeminfoResponse {
            domid: id,
            mem_used,
        })
        .into_response()),
        IngestOutcome::Rejected(reason) => Err(reason.into()),
    }
}

async fn balance(State(state): State<AppState>) -> Json<Vec<DomainStatus>> {
    let mut balancer = state.balancer.lock().await;
    balancer.balance().await;
    Json(balancer.status())
}

async fn balloon(
    State(state): State<AppState>,
    Json(request): Json<BalloonRequest>,
) -> (StatusCode, Json<BalloonResponse>) {
    let granted = state
        .balancer
        .lock()
        .await
        .request_balloon(request.amount)
        .await;
    info!(amount = request.amount, granted, "Balloon request over HTTP");

    let status = if granted {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(BalloonResponse { granted }))
}

async fn fallback_handler(req: Request) -> StatusCode {
    debug!(uri = %req.uri(), "No route");
    StatusCode::NOT_FOUND
}
