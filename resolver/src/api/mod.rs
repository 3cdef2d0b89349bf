//! HTTP API for order intake, status queries and monitoring

use crate::chain::{ChainInfo, Timelocks};
use crate::config::{ApiConfig, WithdrawalOrder};
use crate::coordination::{Backoff, EngineStats, LiquidityEntry, OrderRequest, SubmitReceipt, SwapEngine};
use crate::error::{ResolverError, ResolverResult, ValidationError};
use crate::state::{Order, OrderFilter, OrderHash, OrderStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// Timelocks advertised to clients building orders
pub const RECOMMENDED_TIMELOCKS: Timelocks = Timelocks {
    withdrawal: 30,
    public_withdrawal: 60,
    cancellation: 43_200,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SwapEngine>,
    pub started_at: Instant,
}

pub fn router(engine: Arc<SwapEngine>) -> Router {
    let state = AppState {
        engine,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/orders", post(submit_order).get(list_orders))
        .route("/orders/:hash", get(get_order))
        .route("/orders/:hash/cancel", post(cancel_order))
        .route("/liquidity", get(get_liquidity))
        .route("/stats", get(get_stats))
        .route("/health", get(health_check))
        .route("/info", get(get_info))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<SwapEngine>) -> ResolverResult<()> {
    let app = router(engine);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ResolverError::Config(format!("cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ResolverError::Internal(format!("API server stopped: {}", e)))?;

    Ok(())
}

/// Error body: machine-readable kind, message and the offending field
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

pub struct ApiError(ResolverError);

impl From<ResolverError> for ApiError {
    fn from(e: ResolverError) -> Self {
        ApiError(e)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError(e.into())
    }
}

pub fn status_for(error: &ResolverError) -> StatusCode {
    match error {
        ResolverError::Validation(_) => StatusCode::BAD_REQUEST,
        ResolverError::DuplicateOrder { .. } => StatusCode::CONFLICT,
        ResolverError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        ResolverError::OrderNotFound { .. } => StatusCode::NOT_FOUND,
        ResolverError::InsufficientLiquidity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ResolverError::ChainCall { .. } | ResolverError::Timing { .. } | ResolverError::Timeout { .. } => {
            StatusCode::BAD_GATEWAY
        }
        ResolverError::ChainNotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ResolverError::Config(_) | ResolverError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let field = match &self.0 {
            ResolverError::Validation(v) => Some(v.field().to_string()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
            field,
        };
        (status, Json(body)).into_response()
    }
}

fn parse_hash(raw: &str) -> Result<OrderHash, ApiError> {
    OrderHash::parse(raw).ok_or_else(|| {
        ValidationError::Format {
            field: "orderHash".to_string(),
            message: "expected 0x-prefixed 32-byte hex".to_string(),
        }
        .into()
    })
}

/// Order as returned to clients; the secret appears only once completed
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderView {
    #[serde(flatten)]
    order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        let secret = (order.status == OrderStatus::Completed).then(|| order.secret.to_hex());
        Self { order, secret }
    }
}

async fn submit_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    let receipt = state.engine.submit(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_hash = parse_hash(&hash)?;
    let order = state.engine.get(&order_hash).await?;
    Ok(Json(order.into()))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct OrderPage {
    orders: Vec<OrderView>,
    total: usize,
    offset: usize,
    limit: usize,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<OrderPage>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<OrderStatus>().map_err(|message| {
            ApiError::from(ValidationError::Format {
                field: "status".to_string(),
                message,
            })
        })?),
        None => None,
    };
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let (orders, total) = state
        .engine
        .list(&OrderFilter { status }, offset, limit)
        .await;

    Ok(Json(OrderPage {
        orders: orders.into_iter().map(OrderView::from).collect(),
        total,
        offset,
        limit,
    }))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_hash = parse_hash(&hash)?;
    let order = state.engine.cancel(&order_hash).await?;
    Ok(Json(order.into()))
}

#[derive(Serialize)]
struct LiquidityResponse {
    chains: Vec<LiquidityEntry>,
}

async fn get_liquidity(State(state): State<AppState>) -> impl IntoResponse {
    Json(LiquidityResponse {
        chains: state.engine.liquidity().await,
    })
}

async fn get_stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats().await)
}

/// Health check: per-chain adapter health
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let chains: Vec<ChainHealth> = state
        .engine
        .chains()
        .health_check()
        .await
        .into_iter()
        .map(|(chain, healthy)| ChainHealth { chain, healthy })
        .collect();
    let healthy = chains.iter().all(|c| c.healthy);

    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        chains,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn get_info(State(state): State<AppState>) -> Json<InfoResponse> {
    let engine = &state.engine;
    let config = engine.config();
    let retry = engine.retry_policy();

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        instance_id: config.instance_id.clone(),
        chains: engine.chains().describe(),
        supported_pairs: engine
            .chains()
            .supported_pairs()
            .into_iter()
            .map(|(src_chain, dst_chain)| ChainPair { src_chain, dst_chain })
            .collect(),
        recommended_timelocks: RECOMMENDED_TIMELOCKS,
        safety_deposit_percent: config.safety_deposit_percent,
        min_deadline_buffer_secs: config.min_deadline_buffer_secs,
        withdrawal_order: config.withdrawal_order,
        max_retries: retry.max_retries,
        retry_delay_secs: match retry.backoff {
            Backoff::Fixed(d) => d.as_secs(),
            Backoff::Exponential { base, .. } => base.as_secs(),
        },
    })
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: String,
    healthy: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainPair {
    src_chain: String,
    dst_chain: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    version: &'static str,
    instance_id: String,
    chains: Vec<ChainInfo>,
    supported_pairs: Vec<ChainPair>,
    recommended_timelocks: Timelocks,
    safety_deposit_percent: u64,
    min_deadline_buffer_secs: u64,
    withdrawal_order: WithdrawalOrder,
    max_retries: u32,
    retry_delay_secs: u64,
}
