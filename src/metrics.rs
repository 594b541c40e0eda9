/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : metrics.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "execution ticks decoded").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "execution ticks per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static ORDERBOOKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orderbook_snapshots_total", "order book snapshots decoded").unwrap());

pub static PARSE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_parse_failures_total", "frames dropped by the decoder"),
        &["kind"],
    )
    .unwrap()
});

pub static WS_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_connected", "1 if the feed websocket is connected").unwrap());

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ws_reconnects_total", "feed reconnect attempts").unwrap());

// -------- Signals --------
pub static TICKS_FILTERED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_filtered_total", "ticks below volume/amount floor").unwrap());

pub static SIGNALS_EVALUATED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("signals_evaluated_total", "composite signal evaluations").unwrap());

pub static BUY_SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("buy_signals_total", "signals with all conditions met (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Orders / positions --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders by side and outcome"),
        &["side", "outcome"],
    )
    .unwrap()
});

pub static ENTRY_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("entry_rejects_total", "buy signals rejected before ordering"),
        &["reason"],
    )
    .unwrap()
});

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "active positions").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized_krw", "realized PnL (KRW)").unwrap());

pub static EXITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exits_total", "closed positions by reason"), &["reason"]).unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_DRY_RUN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_dry_run", "1 if fills are simulated").unwrap());

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(ORDERBOOKS.clone())),
        REGISTRY.register(Box::new(PARSE_FAILURES.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(TICKS_FILTERED.clone())),
        REGISTRY.register(Box::new(SIGNALS_EVALUATED.clone())),
        REGISTRY.register(Box::new(BUY_SIGNALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(ENTRY_REJECTS.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(EXITS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_DRY_RUN.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        // AlreadyReg saat init() dipanggil dua kali: aman diabaikan
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::from("not found\n")),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves `/metrics` until the process exits.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/metrics");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}
