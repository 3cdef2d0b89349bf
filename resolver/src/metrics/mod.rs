//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Order intake and outcomes
//! - Escrow creation and withdrawal steps
//! - Chain adapter health
//! - Resolver liquidity

use crate::error::{ResolverError, ResolverResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Order metrics
    pub static ref ORDERS_SUBMITTED: CounterVec = register_counter_vec!(
        "swap_resolver_orders_submitted_total",
        "Orders accepted for processing",
        &["direction"]
    ).unwrap();

    pub static ref ORDERS_REJECTED: CounterVec = register_counter_vec!(
        "swap_resolver_orders_rejected_total",
        "Orders rejected at submission by reason",
        &["reason"]
    ).unwrap();

    pub static ref ORDERS_FINISHED: CounterVec = register_counter_vec!(
        "swap_resolver_orders_finished_total",
        "Orders reaching a terminal status",
        &["status"]
    ).unwrap();

    pub static ref ACTIVE_ORDERS: Gauge = register_gauge!(
        "swap_resolver_active_orders",
        "Orders currently processing"
    ).unwrap();

    pub static ref ORDER_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_resolver_order_latency_seconds",
        "Submission to completion latency",
        &["direction"],
        vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // Step metrics
    pub static ref STEP_OUTCOMES: CounterVec = register_counter_vec!(
        "swap_resolver_step_outcomes_total",
        "Step results by step name and outcome",
        &["step", "outcome"]
    ).unwrap();

    pub static ref WITHDRAWAL_RETRIES: CounterVec = register_counter_vec!(
        "swap_resolver_withdrawal_retries_total",
        "Withdrawal retries scheduled",
        &["reason"]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "swap_resolver_chain_healthy",
        "Chain adapter health (1=healthy, 0=unhealthy or unconfigured)",
        &["chain"]
    ).unwrap();

    pub static ref RESOLVER_BALANCE: GaugeVec = register_gauge_vec!(
        "swap_resolver_balance",
        "Resolver balance in the chain's base unit",
        &["chain", "asset"]
    ).unwrap();

    pub static ref RESERVED_LIQUIDITY: GaugeVec = register_gauge_vec!(
        "swap_resolver_reserved_liquidity",
        "Liquidity reserved by open orders in the chain's base unit",
        &["chain", "asset"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> ResolverResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ResolverError::Config(format!("cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ResolverError::Internal(format!("metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_order_submitted(direction: &str) {
    ORDERS_SUBMITTED.with_label_values(&[direction]).inc();
    ACTIVE_ORDERS.inc();
}

pub fn record_order_rejected(reason: &str) {
    ORDERS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_order_completed(direction: &str, latency_secs: f64) {
    ORDERS_FINISHED.with_label_values(&["completed"]).inc();
    ORDER_LATENCY.with_label_values(&[direction]).observe(latency_secs);
    ACTIVE_ORDERS.dec();
}

pub fn record_order_failed() {
    ORDERS_FINISHED.with_label_values(&["failed"]).inc();
    ACTIVE_ORDERS.dec();
}

pub fn record_step(step: &str, success: bool) {
    let outcome = if success { "completed" } else { "failed" };
    STEP_OUTCOMES.with_label_values(&[step, outcome]).inc();
}

pub fn record_withdrawal_retry(reason: &str) {
    WITHDRAWAL_RETRIES.with_label_values(&[reason]).inc();
}

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_balance(chain: &str, asset: &str, balance: u128) {
    RESOLVER_BALANCE
        .with_label_values(&[chain, asset])
        .set(balance as f64);
}

pub fn record_reserved(chain: &str, asset: &str, reserved: u128) {
    RESERVED_LIQUIDITY
        .with_label_values(&[chain, asset])
        .set(reserved as f64);
}
