/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : engine_flow.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// Wire frame -> decoder -> signal detector -> execution engine -> closed trade.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;

use kis_scalper::config::{SignalCfg, TradingCfg};
use kis_scalper::domain::{
    BookLevel, Event, ExecutionTick, ExitReason, OrderBookSnapshot, OrderType, PositionStatus, Signal,
};
use kis_scalper::engine::{EngineError, ExecutionEngine};
use kis_scalper::gateway::PaperBroker;
use kis_scalper::posttrade::PostTrade;
use kis_scalper::protocol::{decode_frame, encode_execution, encode_orderbook, ChannelIds, Frame};
use kis_scalper::risk::RiskError;
use kis_scalper::signal::SignalDetector;

fn t0() -> DateTime<Utc> {
    // 09:30:00 KST
    DateTime::<Utc>::from_timestamp(1_704_414_600, 0).unwrap()
}

fn signal_cfg() -> SignalCfg {
    SignalCfg {
        tick_size: 1,
        max_candles: 100,
        min_volume: 1,
        min_amount: 0.0,
        imbalance_threshold: 2.0,
        momentum_window_secs: 30,
        momentum_threshold: 10.0,
        strength_floor: 100.0,
        strength_history: 100,
        ma_period: 5,
        ma_lookback: 5,
        ma_tolerance_pct: 0.5,
        cooldown_secs: 60,
        vi_silence_secs: 5,
    }
}

fn tick(price: f64, strength: f64, ask: u64, bid: u64, at: DateTime<Utc>) -> ExecutionTick {
    ExecutionTick {
        symbol: "005930".into(),
        timestamp: at,
        price,
        change: 0.0,
        change_rate: 0.0,
        open: 70_000.0,
        high: price,
        low: price,
        best_ask: price + 100.0,
        best_bid: price,
        volume: 10,
        cumulative_volume: 1_000,
        cumulative_amount: 70_000_000.0,
        strength,
        halted: false,
        best_ask_qty: 500,
        best_bid_qty: 500,
        total_ask_qty: ask,
        total_bid_qty: bid,
        vi_reference_price: None,
    }
}

/// Encodes, decodes and returns the single tick of an execution frame.
fn through_wire(t: &ExecutionTick, ids: &ChannelIds) -> ExecutionTick {
    let frame = encode_execution(&ids.execution, t);
    match decode_frame(&frame, ids, t.timestamp).unwrap() {
        Frame::Executions(mut ticks) => {
            assert_eq!(ticks.len(), 1);
            ticks.remove(0)
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

/// Five flat ticks, then a heavy-ask book, then the tick that fires all three conditions.
fn buy_signal(det: &mut SignalDetector, ids: &ChannelIds) -> (Signal, DateTime<Utc>) {
    let mut at = t0();
    for i in 0..5 {
        let t = through_wire(&tick(70_000.0, 100.0 + i as f64, 100, 100, at), ids);
        let out = det.on_tick(&t, at);
        assert!(!out.signal.map(|s| s.should_buy()).unwrap_or(false));
        at += Duration::seconds(1);
    }

    let mut asks = [BookLevel::default(); 10];
    let mut bids = [BookLevel::default(); 10];
    for i in 0..10 {
        asks[i] = BookLevel { price: 70_100.0 + 100.0 * i as f64, qty: 30 };
        bids[i] = BookLevel { price: 70_000.0 - 100.0 * i as f64, qty: 10 };
    }
    let book = OrderBookSnapshot { symbol: "005930".into(), timestamp: at, asks, bids, total_ask_qty: 300, total_bid_qty: 100 };
    match decode_frame(&encode_orderbook(&ids.orderbook, &book), ids, at).unwrap() {
        Frame::OrderBooks(mut books) => det.on_orderbook(books.remove(0)),
        other => panic!("unexpected frame {other:?}"),
    }

    let t = through_wire(&tick(70_000.0, 120.0, 100, 100, at), ids);
    let sig = det.on_tick(&t, at).signal.expect("evaluated");
    assert!(sig.should_buy(), "{sig:?}");
    assert_eq!(sig.metrics.ask_bid_ratio, 3.0);
    (sig, at)
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(match ev {
            Event::Order(_) => "order",
            Event::Fill(_) => "fill",
            Event::Close(_) => "close",
            Event::Signal(_) => "signal",
            Event::Note(_) => "note",
        });
    }
    kinds
}

#[tokio::test]
async fn test_dry_run_take_profit_then_reentry_cooldown() {
    let ids = ChannelIds::default();
    let mut det = SignalDetector::new(signal_cfg());
    let (sig, at) = buy_signal(&mut det, &ids);

    let (rec_tx, mut rec_rx) = mpsc::channel(16);
    let cfg = TradingCfg { dry_run: true, order_type: OrderType::Limit, ..TradingCfg::default() };
    let engine = ExecutionEngine::new(cfg, Arc::new(PaperBroker::new(0, 0.0)), Arc::new(PostTrade::new(Some(rec_tx))));

    let pos = engine.on_buy_signal(&sig, at).await.unwrap();
    assert_eq!(pos.qty, 14); // floor(1_000_000 / 70_000)
    assert_eq!(pos.status, PositionStatus::Filled);
    assert!(pos.order_no.as_deref().unwrap_or("").starts_with("DRY-"));

    // belum ada exit
    let later = at + Duration::seconds(2);
    assert!(engine.monitor_position("005930", 70_300.0, later).await.unwrap().is_none());

    let exit_at = at + Duration::seconds(5);
    let closed = engine.monitor_position("005930", 71_100.0, exit_at).await.unwrap().expect("take profit");
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.close_reason, Some(ExitReason::TakeProfit));
    assert_eq!(closed.realized_pnl(), Some(1_100.0 * 14.0));
    assert!(engine.active_positions().is_empty());
    assert_eq!(engine.closed_positions().len(), 1);

    let stats = engine.stats();
    assert_eq!(stats.total_trades, 1);
    assert_eq!(stats.wins, 1);
    assert_eq!(stats.win_rate(), 100.0);
    assert_eq!(drain(&mut rec_rx), vec!["order", "fill", "close"]);

    // cooldown per saham masih aktif
    let retry_at = exit_at + Duration::seconds(10);
    let err = engine.on_buy_signal(&sig, retry_at).await.unwrap_err();
    assert!(matches!(err, EngineError::Risk(RiskError::SymbolCooldown { .. })), "{err:?}");
}

#[tokio::test]
async fn test_paper_market_entry_stop_loss_settles_cash() {
    let ids = ChannelIds::default();
    let mut det = SignalDetector::new(signal_cfg());
    let (sig, at) = buy_signal(&mut det, &ids);

    let cfg = TradingCfg { dry_run: false, order_type: OrderType::Market, ..TradingCfg::default() };
    let broker = Arc::new(PaperBroker::new(0, 10_000_000.0));
    let engine = ExecutionEngine::new(cfg, broker.clone(), Arc::new(PostTrade::new(None)));
    assert_eq!(engine.refresh_balance().await.unwrap(), 10_000_000.0);

    let pos = engine.on_buy_signal(&sig, at).await.unwrap();
    assert_eq!(pos.status, PositionStatus::Filled);
    assert_eq!(engine.cash(), Some(10_000_000.0 - 980_000.0));

    let drop_tick = through_wire(&tick(69_000.0, 90.0, 100, 300, at + Duration::seconds(3)), &ids);
    let closed = engine
        .monitor_position(&drop_tick.symbol, drop_tick.price, drop_tick.timestamp)
        .await
        .unwrap()
        .expect("stop loss");
    assert_eq!(closed.close_reason, Some(ExitReason::StopLoss));
    assert_eq!(closed.realized_pnl(), Some(-1_000.0 * 14.0));
    assert_eq!(engine.stats().losses, 1);

    assert_eq!(engine.cash(), Some(9_986_000.0));
    assert_eq!(engine.refresh_balance().await.unwrap(), 9_986_000.0);
    // market order langsung settle, tidak ada order yang menggantung
    assert_eq!(broker.open_orders(), 0);
}
