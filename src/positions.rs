/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : positions.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/positions.rs (posisi aktif, histori & statistik)
// ===============================
use std::collections::VecDeque;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{ExitReason, Position, PositionStatus};
use crate::metrics::{EXITS, OPEN_POSITIONS, PNL_REALIZED};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub realized_pnl: f64,
}

impl EngineStats {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 { 0.0 } else { self.wins as f64 / self.total_trades as f64 * 100.0 }
    }

    fn record(&mut self, pnl: f64) {
        self.total_trades += 1;
        // break-even dihitung loss (biaya transaksi belum masuk)
        if pnl > 0.0 { self.wins += 1 } else { self.losses += 1 }
        self.realized_pnl += pnl;
    }
}

/// Terminal positions kept for inspection; statistics cover all of them.
pub const CLOSED_HISTORY_CAP: usize = 1_000;

/// Active positions keyed by symbol plus the most recent terminal history.
#[derive(Debug)]
pub struct PositionBook {
    active: AHashMap<String, Position>,
    closed: VecDeque<Position>,
    history_cap: usize,
    stats: EngineStats,
}

impl Default for PositionBook {
    fn default() -> Self { Self::with_history(CLOSED_HISTORY_CAP) }
}

impl PositionBook {
    pub fn new() -> Self { Self::default() }

    pub fn with_history(history_cap: usize) -> Self {
        Self {
            active: AHashMap::new(),
            closed: VecDeque::new(),
            history_cap: history_cap.max(1),
            stats: EngineStats::default(),
        }
    }

    fn archive(&mut self, pos: Position) {
        if self.closed.len() == self.history_cap {
            self.closed.pop_front();
        }
        self.closed.push_back(pos);
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> { self.active.get(symbol) }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> { self.active.get_mut(symbol) }

    pub fn is_held(&self, symbol: &str) -> bool { self.active.contains_key(symbol) }

    pub fn active_count(&self) -> usize { self.active.len() }

    pub fn symbols(&self) -> Vec<String> { self.active.keys().cloned().collect() }

    pub fn active(&self) -> Vec<Position> {
        let mut v: Vec<Position> = self.active.values().cloned().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        v
    }

    /// Oldest first.
    pub fn closed(&self) -> &VecDeque<Position> { &self.closed }

    pub fn stats(&self) -> &EngineStats { &self.stats }

    /// Inserts a new reservation; returns false if the symbol is already tracked.
    pub fn reserve(&mut self, pos: Position) -> bool {
        if self.active.contains_key(&pos.symbol) { return false; }
        self.active.insert(pos.symbol.clone(), pos);
        OPEN_POSITIONS.set(self.active.len() as i64);
        true
    }

    /// Drops a reservation that never reached the broker.
    pub fn release(&mut self, symbol: &str) -> Option<Position> {
        let p = self.active.remove(symbol);
        OPEN_POSITIONS.set(self.active.len() as i64);
        p
    }

    /// Moves the position to history as CLOSED and updates statistics.
    pub fn close(&mut self, symbol: &str, price: f64, reason: ExitReason, now: DateTime<Utc>) -> Option<Position> {
        let mut pos = self.active.remove(symbol)?;
        pos.mark(price);
        pos.status = PositionStatus::Closed;
        pos.close_price = Some(price);
        pos.close_time = Some(now);
        pos.close_reason = Some(reason);

        self.stats.record(pos.pnl_amount_at(price));
        self.archive(pos.clone());

        // metrics
        OPEN_POSITIONS.set(self.active.len() as i64);
        PNL_REALIZED.set(self.stats.realized_pnl);
        EXITS.with_label_values(&[reason.as_str()]).inc();
        Some(pos)
    }

    /// Moves an unfilled entry to history as CANCELLED; not counted as a trade.
    pub fn cancel(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<Position> {
        let mut pos = self.active.remove(symbol)?;
        pos.status = PositionStatus::Cancelled;
        pos.close_time = Some(now);
        self.archive(pos.clone());
        OPEN_POSITIONS.set(self.active.len() as i64);
        Some(pos)
    }
}
