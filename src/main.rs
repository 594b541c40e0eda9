// ===============================
// src/main.rs
// ===============================
/*
 # mock feed + dry run (default)
 cargo run --release -- --symbols 005930,000660 --dry-run

 # konfigurasi yang aktif
 curl -s localhost:9898/metrics | egrep '^config_(feed_mode|dry_run|symbol)'

 # aktivitas per symbol
 curl -s localhost:9898/metrics | grep '^ticks_total_by_symbol'
 curl -s localhost:9898/metrics | grep '^buy_signals_total'
*/
/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : main.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::{
    select,
    sync::{mpsc, mpsc::error::TrySendError, watch},
    task::JoinHandle,
    time::{interval, timeout, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use kis_scalper::config::{self, Cli, MarketMode};
use kis_scalper::domain::{Event, ExecutionTick, ExitReason, FeedEvent, Signal};
use kis_scalper::engine::{EngineError, ExecutionEngine};
use kis_scalper::feed::{self, WireProtocolClient};
use kis_scalper::gateway::{Broker, PaperBroker};
use kis_scalper::gateway_kis::KisBroker;
use kis_scalper::posttrade::{PostTrade, TradeHooks};
use kis_scalper::signal::SignalDetector;
use kis_scalper::{metrics, recorder};

/// One decoded tick plus whatever the detector made of it.
struct WorkItem {
    tick: ExecutionTick,
    signal: Option<Signal>,
}

/// Per-symbol worker: entry then monitoring, strictly in tick order.
async fn symbol_worker(
    engine: Arc<ExecutionEngine>,
    mut rx: mpsc::Receiver<WorkItem>,
    rec_tx: Option<mpsc::Sender<Event>>,
) {
    while let Some(item) = rx.recv().await {
        let now = Utc::now();
        if let Some(sig) = item.signal.as_ref().filter(|s| s.should_buy()) {
            if let Some(tx) = &rec_tx {
                let _ = tx.try_send(Event::Signal(sig.clone()));
            }
            match engine.on_buy_signal(sig, now).await {
                Ok(_) => {}
                Err(EngineError::Risk(e)) => debug!(symbol = %sig.symbol, reason = %e, "buy signal skipped"),
                Err(e) => warn!(symbol = %sig.symbol, error = %e, "buy signal failed"),
            }
        }
        if let Err(e) = engine.monitor_position(&item.tick.symbol, item.tick.price, now).await {
            warn!(symbol = %item.tick.symbol, error = %e, "exit attempt failed, will retry on next tick");
        }
    }
}

/// Stale-order expiry, time-stop sweep and balance refresh, off the receive loop.
async fn housekeeping(engine: Arc<ExecutionEngine>, refresh_balance_secs: u64) {
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut secs: u64 = 0;
    loop {
        tick.tick().await;
        let now = Utc::now();
        for r in engine.expire_stale_orders(now).await {
            if let Err(e) = r {
                warn!(error = %e, "stale order cancel failed");
            }
        }
        for r in engine.sweep(now).await {
            if let Err(e) = r {
                warn!(error = %e, "sweep exit failed");
            }
        }
        secs += 1;
        if !engine.config().dry_run && refresh_balance_secs > 0 && secs % refresh_balance_secs == 0 {
            if let Err(e) = engine.refresh_balance().await {
                warn!(error = %e, "balance refresh failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ---- Load config (.env dulu, agar RUST_LOG ikut terbaca) ----
    let cfg = config::load(&cli).context("config")?;

    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cfg.args.clone();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Human-friendly startup info + export config to metrics ----
    info!(
        feed_mode = args.feed_mode.as_str(),
        venue_mode = args.venue_mode.as_str(),
        symbols = ?args.symbols,
        dry_run = cfg.trading.dry_run,
        order_type = cfg.trading.order_type.code(),
        max_positions = cfg.trading.max_positions,
        stop_loss = cfg.trading.stop_loss_pct,
        take_profit = cfg.trading.take_profit_pct,
        tick_size = cfg.signal.tick_size,
        ws_url = %cfg.feed.ws_url,
        "startup config"
    );
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    metrics::CONFIG_DRY_RUN.set(cfg.trading.dry_run as i64);
    for s in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }

    // ---- Recorder (optional) ----
    let (rec_tx, rec_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            let task = tokio::spawn(async move {
                if let Err(e) = recorder::run(rx, path).await {
                    error!(error = %format!("{e:#}"), "recorder stopped");
                }
            });
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    // ---- Broker & engine ----
    let broker: Arc<dyn Broker> = match cfg.broker.mode {
        MarketMode::Mock => Arc::new(PaperBroker::new(cfg.broker.paper_latency_ms, cfg.broker.paper_cash)),
        MarketMode::KisVirtual | MarketMode::KisReal => Arc::new(KisBroker::new(cfg.broker.clone())?),
    };
    let hooks: Arc<dyn TradeHooks> = Arc::new(PostTrade::new(rec_tx.clone()));
    let engine = Arc::new(ExecutionEngine::new(cfg.trading.clone(), broker, hooks));
    if !cfg.trading.dry_run {
        match engine.refresh_balance().await {
            Ok(cash) => info!(cash, "account balance"),
            Err(e) => warn!(error = %e, "initial balance refresh failed; funds check disabled until next refresh"),
        }
    }
    let housekeeping_task = tokio::spawn(housekeeping(engine.clone(), cfg.broker.balance_refresh_secs));

    // ---- FEED (Market Data) ----
    let (feed_tx, mut feed_rx) = mpsc::channel::<FeedEvent>(args.symbol_queue.max(1) * 4);
    let (stop_tx, stop_rx) = watch::channel(false);
    let feed_task: JoinHandle<()> = match args.feed_mode {
        MarketMode::Mock => {
            let symbols = args.symbols.clone();
            let (ob, every) = (args.include_orderbook, args.mock_interval_ms);
            tokio::spawn(async move {
                let stats = feed::run_mock(feed_tx, symbols, ob, every, stop_rx).await;
                info!(?stats, "mock feed stats");
            })
        }
        MarketMode::KisVirtual | MarketMode::KisReal => {
            let mut client = WireProtocolClient::new(cfg.feed.clone(), feed_tx);
            // approval key / connect gagal = fatal
            client.connect().await.context("feed connect")?;
            client.subscribe(&args.symbols, args.include_orderbook).await.context("feed subscribe")?;
            tokio::spawn(async move {
                if let Err(e) = client.run_forever(stop_rx).await {
                    error!(error = %e, "feed loop ended");
                }
                if let Err(e) = client.unsubscribe_all().await {
                    warn!(error = %e, "unsubscribe failed");
                }
                client.disconnect().await;
                info!(stats = ?client.stats(), "feed closed");
            })
        }
    };

    // ---- Per-symbol workers ----
    let mut workers: HashMap<String, mpsc::Sender<WorkItem>> = HashMap::new();
    let mut worker_tasks = Vec::new();
    for sym in args.symbols.iter().cloned() {
        let (tx, rx) = mpsc::channel::<WorkItem>(args.symbol_queue.max(1));
        workers.insert(sym, tx);
        worker_tasks.push(tokio::spawn(symbol_worker(engine.clone(), rx, rec_tx.clone())));
    }

    // ---- Main loop: decode -> signal -> worker; heartbeat ----
    let mut detector = SignalDetector::new(cfg.signal.clone());
    let mut heartbeat = interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick_count: u64 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        select! {
            _ = &mut ctrl_c => {
                info!("ctrl-c received, shutting down");
                break;
            }
            ev = feed_rx.recv() => match ev {
                Some(FeedEvent::Tick(tick)) => {
                    tick_count += 1;
                    let outcome = detector.on_tick(&tick, Utc::now());
                    if let Some(c) = &outcome.candle {
                        debug!(symbol = %tick.symbol, o = c.open, h = c.high, l = c.low, c = c.close, vwap = c.vwap, "candle");
                    }
                    let Some(tx) = workers.get(&tick.symbol) else {
                        debug!(symbol = %tick.symbol, "tick for unconfigured symbol");
                        continue;
                    };
                    let symbol = tick.symbol.clone();
                    match tx.try_send(WorkItem { tick, signal: outcome.signal }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => warn!(%symbol, "worker queue full, tick dropped"),
                        Err(TrySendError::Closed(_)) => error!(%symbol, "worker stopped"),
                    }
                }
                Some(FeedEvent::OrderBook(book)) => detector.on_orderbook(book),
                Some(FeedEvent::Connected { attempt }) => info!(attempt, "feed connected"),
                Some(FeedEvent::Disconnected { reason }) => {
                    error!(%reason, "feed lost for good, liquidating");
                    break;
                }
                None => {
                    warn!("feed channel closed");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                let now = Utc::now();
                let stats = engine.stats();
                let silent = detector.silent_symbols(now);
                info!(
                    ticks = tick_count,
                    open = engine.active_positions().len(),
                    trades = stats.total_trades,
                    win_rate = %format!("{:.1}", stats.win_rate()),
                    pnl = stats.realized_pnl,
                    silent = ?silent,
                    "heartbeat"
                );
                tick_count = 0;
            }
        }
    }

    // ---- Shutdown: stop entries -> close_all -> unsubscribe & disconnect ----
    drop(feed_rx);
    drop(workers);
    for t in worker_tasks {
        let _ = t.await;
    }
    housekeeping_task.abort();

    for r in engine.close_all(ExitReason::Shutdown, Utc::now()).await {
        match r {
            Ok(p) => info!(symbol = %p.symbol, status = p.status.as_str(), "liquidated"),
            Err(e) => error!(error = %e, "liquidation failed, check the account manually"),
        }
    }

    let _ = stop_tx.send(true);
    if timeout(Duration::from_secs(5), feed_task).await.is_err() {
        warn!("feed did not stop within 5s");
    }

    let stats = engine.stats();
    info!(
        trades = stats.total_trades,
        wins = stats.wins,
        losses = stats.losses,
        win_rate = %format!("{:.1}", stats.win_rate()),
        pnl = stats.realized_pnl,
        "final stats"
    );

    // recorder selesai setelah semua sender (termasuk PostTrade di engine) hilang
    drop(engine);
    drop(rec_tx);
    if let Some(task) = rec_task {
        let _ = timeout(Duration::from_secs(2), task).await;
    }
    Ok(())
}
