/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : risk.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/risk.rs
// ===============================
//
// Pre-trade checks untuk entry. Semua state cooldown ada di EntryGuard,
// dimiliki oleh ExecutionEngine (tidak ada state global).
//
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::config::TradingCfg;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskError {
    #[error("{0} already held")]
    AlreadyHeld(String),
    #[error("max positions reached ({0})")]
    Capacity(usize),
    #[error("order cooldown active ({remaining_secs}s left)")]
    OrderCooldown { remaining_secs: i64 },
    #[error("{symbol} in re-entry cooldown ({remaining_secs}s left)")]
    SymbolCooldown { symbol: String, remaining_secs: i64 },
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("investment too small for price {0}")]
    InvalidQuantity(f64),
    #[error("insufficient funds: need {need:.0}, have {have:.0}")]
    InsufficientFunds { need: f64, have: f64 },
}

impl RiskError {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            RiskError::AlreadyHeld(_) => "held",
            RiskError::Capacity(_) => "capacity",
            RiskError::OrderCooldown { .. } => "order_cooldown",
            RiskError::SymbolCooldown { .. } => "symbol_cooldown",
            RiskError::InvalidPrice(_) => "price",
            RiskError::InvalidQuantity(_) => "qty",
            RiskError::InsufficientFunds { .. } => "funds",
        }
    }
}

/// What the engine knows about the book at decision time.
#[derive(Debug, Clone, Copy)]
pub struct EntryContext<'a> {
    pub symbol: &'a str,
    pub price: f64,
    pub held: bool,
    pub active_count: usize,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct EntryGuard {
    last_order_at: Option<DateTime<Utc>>,
    reentry_after: AHashMap<String, DateTime<Utc>>,
    cash: Option<f64>,
}

impl EntryGuard {
    pub fn record_order(&mut self, now: DateTime<Utc>) { self.last_order_at = Some(now); }

    /// Arms the re-entry cooldown for `symbol` starting at `closed_at`.
    pub fn record_close(&mut self, symbol: &str, closed_at: DateTime<Utc>, cooldown_secs: i64) {
        self.reentry_after.insert(symbol.to_string(), closed_at + Duration::seconds(cooldown_secs));
    }

    pub fn set_cash(&mut self, cash: f64) { self.cash = Some(cash); }

    pub fn cash(&self) -> Option<f64> { self.cash }

    /// Reserve cash for a submitted entry so back-to-back signals see the reduced balance.
    pub fn spend(&mut self, amount: f64) {
        if let Some(c) = self.cash.as_mut() {
            *c = (*c - amount).max(0.0);
        }
    }

    pub fn credit(&mut self, amount: f64) {
        if let Some(c) = self.cash.as_mut() {
            *c += amount;
        }
    }

    pub fn reentry_after(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.reentry_after.get(symbol).copied()
    }
}

/// Shares bought for `investment` at `price` (whole shares only).
pub fn quantity_for(investment: f64, price: f64) -> i64 {
    if price <= 0.0 || !price.is_finite() { return 0; }
    (investment / price).floor() as i64
}

/// Pre-trade checks -> jika lolos, kembalikan qty yang boleh dibeli
pub fn check(ctx: &EntryContext<'_>, cfg: &TradingCfg, guard: &EntryGuard) -> Result<i64, RiskError> {
    // 1) Satu posisi per simbol
    if ctx.held {
        return Err(RiskError::AlreadyHeld(ctx.symbol.to_string()));
    }

    // 2) Kapasitas
    if ctx.active_count >= cfg.max_positions {
        return Err(RiskError::Capacity(cfg.max_positions));
    }

    // 3) Cooldown global antar order
    if let Some(last) = guard.last_order_at {
        let elapsed = (ctx.now - last).num_seconds();
        if elapsed < cfg.order_cooldown_secs {
            return Err(RiskError::OrderCooldown { remaining_secs: cfg.order_cooldown_secs - elapsed });
        }
    }

    // 4) Cooldown re-entry per simbol
    if let Some(until) = guard.reentry_after(ctx.symbol) {
        if ctx.now < until {
            return Err(RiskError::SymbolCooldown {
                symbol: ctx.symbol.to_string(),
                remaining_secs: (until - ctx.now).num_seconds().max(1),
            });
        }
    }

    // 5) Harga & qty
    if ctx.price <= 0.0 || !ctx.price.is_finite() {
        return Err(RiskError::InvalidPrice(ctx.price));
    }
    let qty = quantity_for(cfg.investment_per_symbol, ctx.price);
    if qty <= 0 {
        return Err(RiskError::InvalidQuantity(ctx.price));
    }

    // 6) Saldo (hanya live; dry-run tidak pernah set cash)
    if !cfg.dry_run {
        if let Some(have) = guard.cash {
            let need = ctx.price * qty as f64;
            if need > have {
                return Err(RiskError::InsufficientFunds { need, have });
            }
        }
    }

    Ok(qty)
}
