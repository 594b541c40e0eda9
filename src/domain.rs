/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : domain.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

/// Order type as understood by the broker (`ORD_DVSN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType { Limit, Market }

impl OrderType {
    /// KIS order division code: "00" limit, "01" market.
    pub fn code(&self) -> &'static str {
        match self {
            OrderType::Limit => "00",
            OrderType::Market => "01",
        }
    }
}

/// One trade print from the execution channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTick {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub change: f64,
    pub change_rate: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub best_ask: f64,
    pub best_bid: f64,
    pub volume: u64,
    pub cumulative_volume: u64,
    pub cumulative_amount: f64,
    /// 체결강도 (buy volume / sell volume * 100)
    pub strength: f64,
    pub halted: bool,
    pub best_ask_qty: u64,
    pub best_bid_qty: u64,
    pub total_ask_qty: u64,
    pub total_bid_qty: u64,
    pub vi_reference_price: Option<f64>,
}

impl ExecutionTick {
    pub fn amount(&self) -> f64 { self.price * self.volume as f64 }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookLevel { pub price: f64, pub qty: u64 }

/// Full 10-level order book, replaced wholesale on every snapshot frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub asks: [BookLevel; 10],
    pub bids: [BookLevel; 10],
    pub total_ask_qty: u64,
    pub total_bid_qty: u64,
}

impl OrderBookSnapshot {
    pub fn best_ask(&self) -> Option<BookLevel> { self.asks.iter().copied().find(|l| l.price > 0.0) }
    pub fn best_bid(&self) -> Option<BookLevel> { self.bids.iter().copied().find(|l| l.price > 0.0) }
}

/// Candle built from a fixed number of trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickCandle {
    pub tick_count: usize,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub amount: f64,
    pub vwap: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub prices: Vec<f64>,
}

impl TickCandle {
    pub fn is_bullish(&self) -> bool { self.close > self.open }
    pub fn body_pct(&self) -> f64 {
        if self.open > 0.0 { (self.close - self.open) / self.open * 100.0 } else { 0.0 }
    }
}

/// Raw numbers behind a signal evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetrics {
    pub ask_bid_ratio: f64,
    pub strength_start: f64,
    pub strength_end: f64,
    pub strength_delta: f64,
    pub ma: Option<f64>,
    pub ma_distance_pct: Option<f64>,
}

/// Result of a composite evaluation on one tick.
///
/// `should_buy` is derived, never stored: all three conditions and no VI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub orderbook_signal: bool,
    pub momentum_signal: bool,
    pub ma_support_signal: bool,
    pub vi_active: bool,
    pub metrics: SignalMetrics,
}

impl Signal {
    pub fn matched(&self) -> usize {
        [self.orderbook_signal, self.momentum_signal, self.ma_support_signal]
            .iter()
            .filter(|b| **b)
            .count()
    }

    /// Fraction of conditions met, 0.0..=1.0
    pub fn strength(&self) -> f64 { self.matched() as f64 / 3.0 }

    pub fn should_buy(&self) -> bool { self.matched() == 3 && !self.vi_active }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus { Pending, Ordered, Filled, Closing, Closed, Cancelled }

impl PositionStatus {
    pub fn is_terminal(&self) -> bool { matches!(self, PositionStatus::Closed | PositionStatus::Cancelled) }

    /// Statuses that still hold (or are about to hold) shares.
    pub fn is_active(&self) -> bool { !self.is_terminal() }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Ordered => "ORDERED",
            PositionStatus::Filled => "FILLED",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason { StopLoss, TakeProfit, TrailingStop, TimeStop, Shutdown, Manual }

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TimeStop => "TIME_STOP",
            ExitReason::Shutdown => "SHUTDOWN",
            ExitReason::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub status: PositionStatus,
    pub order_no: Option<String>,
    pub current_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: Option<f64>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_reason: Option<ExitReason>,
}

impl Position {
    pub fn new(symbol: &str, qty: i64, entry_price: f64, entry_time: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty,
            entry_price,
            entry_time,
            status: PositionStatus::Pending,
            order_no: None,
            current_price: entry_price,
            high_price: entry_price,
            low_price: entry_price,
            close_price: None,
            close_time: None,
            close_reason: None,
        }
    }

    /// Return in percent at `price`; multiply before dividing so round
    /// thresholds (e.g. -1.00%) compare exactly.
    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 { return 0.0; }
        (price - self.entry_price) * 100.0 / self.entry_price
    }

    pub fn pnl_pct(&self) -> f64 { self.pnl_pct_at(self.current_price) }

    pub fn pnl_amount_at(&self, price: f64) -> f64 { (price - self.entry_price) * self.qty as f64 }

    pub fn realized_pnl(&self) -> Option<f64> { self.close_price.map(|p| self.pnl_amount_at(p)) }

    pub fn notional(&self) -> f64 { self.entry_price * self.qty as f64 }

    pub fn holding_secs(&self, now: DateTime<Utc>) -> i64 { (now - self.entry_time).num_seconds() }

    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        if price > self.high_price { self.high_price = price; }
        if price < self.low_price { self.low_price = price; }
    }
}

/// Events emitted by the feed client to its owner.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick(ExecutionTick),
    OrderBook(OrderBookSnapshot),
    Connected { attempt: u32 },
    /// Reconnect attempts exhausted; the feed loop has stopped.
    Disconnected { reason: String },
}

/// Lines written by the JSONL recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Event {
    Order(Position),
    Fill(Position),
    Close(Position),
    Signal(Signal),
    Note(String),
}
