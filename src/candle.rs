/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : candle.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/candle.rs
// ===============================
//
// Tick candle: satu candle = N transaksi (bukan N detik).
// Candle yang sudah penuh bersifat immutable dan disimpan di ring buffer
// (candle tertua dibuang ketika kapasitas habis).
//
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::domain::TickCandle;

/// Share of recent closes that must sit above the MA for a support pattern.
const SUPPORT_ABOVE_RATIO: f64 = 0.6;

#[derive(Debug, Clone)]
struct Building {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    amount: f64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    prices: Vec<f64>,
}

impl Building {
    fn start(price: f64, volume: u64, ts: DateTime<Utc>, cap: usize) -> Self {
        let mut prices = Vec::with_capacity(cap);
        prices.push(price);
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            amount: price * volume as f64,
            start_time: ts,
            end_time: ts,
            prices,
        }
    }

    fn push(&mut self, price: f64, volume: u64, ts: DateTime<Utc>) {
        if price > self.high { self.high = price; }
        if price < self.low { self.low = price; }
        self.close = price;
        self.volume += volume;
        self.amount += price * volume as f64;
        self.end_time = ts;
        self.prices.push(price);
    }

    fn finish(self) -> TickCandle {
        // tanpa volume (mis. tick koreksi) VWAP jatuh ke close
        let vwap = if self.volume > 0 { self.amount / self.volume as f64 } else { self.close };
        TickCandle {
            tick_count: self.prices.len(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            amount: self.amount,
            vwap,
            start_time: self.start_time,
            end_time: self.end_time,
            prices: self.prices,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickAggregator {
    tick_size: usize,
    max_candles: usize,
    current: Option<Building>,
    candles: VecDeque<TickCandle>,
}

impl TickAggregator {
    pub fn new(tick_size: usize, max_candles: usize) -> Self {
        let tick_size = tick_size.max(1);
        let max_candles = max_candles.max(1);
        Self { tick_size, max_candles, current: None, candles: VecDeque::with_capacity(max_candles) }
    }

    pub fn tick_size(&self) -> usize { self.tick_size }

    /// Returns the candle completed by this tick, if any.
    pub fn add_tick(&mut self, price: f64, volume: u64, ts: DateTime<Utc>) -> Option<TickCandle> {
        match self.current.as_mut() {
            Some(b) => b.push(price, volume, ts),
            None => self.current = Some(Building::start(price, volume, ts, self.tick_size)),
        }

        let full = self.current.as_ref().map(|b| b.prices.len() >= self.tick_size).unwrap_or(false);
        if !full { return None; }

        let candle = self.current.take()?.finish();
        if self.candles.len() == self.max_candles {
            self.candles.pop_front();
        }
        self.candles.push_back(candle.clone());
        Some(candle)
    }

    pub fn candles(&self) -> &VecDeque<TickCandle> { &self.candles }

    pub fn len(&self) -> usize { self.candles.len() }

    pub fn is_empty(&self) -> bool { self.candles.is_empty() }

    pub fn last_candle(&self) -> Option<&TickCandle> { self.candles.back() }

    /// Ticks accumulated in the candle being built.
    pub fn pending_ticks(&self) -> usize { self.current.as_ref().map(|b| b.prices.len()).unwrap_or(0) }

    fn recent_closes(&self, n: usize) -> impl Iterator<Item = f64> + '_ {
        let skip = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(skip).map(|c| c.close)
    }

    /// Simple MA of the last `period` closes; `None` until enough candles exist.
    pub fn get_ma(&self, period: usize) -> Option<f64> {
        if period == 0 || self.candles.len() < period { return None; }
        let sum: f64 = self.recent_closes(period).sum();
        Some(sum / period as f64)
    }

    /// Percent change of the close over the last `n` candles.
    pub fn momentum(&self, n: usize) -> Option<f64> {
        if n == 0 || self.candles.len() < n + 1 { return None; }
        let last = self.candles.back()?.close;
        let base = self.candles.get(self.candles.len() - 1 - n)?.close;
        if base <= 0.0 { return None; }
        Some((last - base) / base * 100.0)
    }

    /// Population standard deviation of the last `n` closes.
    pub fn volatility(&self, n: usize) -> Option<f64> {
        if n < 2 || self.candles.len() < n { return None; }
        let closes: Vec<f64> = self.recent_closes(n).collect();
        let mean = closes.iter().sum::<f64>() / n as f64;
        let var = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n as f64;
        Some(var.sqrt())
    }

    /// MA support pattern:
    /// - at least 60% of the last `lookback` closes above the MA,
    /// - `price` within `threshold_pct` of the MA,
    /// - last candle bullish with its low touching the MA band, or price back above
    ///   the MA after the previous candle closed at/below it.
    pub fn is_ma_support(&self, price: f64, period: usize, lookback: usize, threshold_pct: f64) -> bool {
        let ma = match self.get_ma(period) {
            Some(ma) if ma > 0.0 => ma,
            _ => return false,
        };
        if lookback == 0 || self.candles.len() < lookback { return false; }

        let above = self.recent_closes(lookback).filter(|c| *c > ma).count();
        if (above as f64) < SUPPORT_ABOVE_RATIO * lookback as f64 { return false; }

        let distance_pct = (price - ma).abs() / ma * 100.0;
        if distance_pct > threshold_pct { return false; }

        let last = match self.candles.back() {
            Some(c) => c,
            None => return false,
        };
        let touch_band = ma * (1.0 + threshold_pct / 100.0);
        let bounced = last.is_bullish() && last.low <= touch_band;

        let prev_close = if self.candles.len() >= 2 {
            self.candles.get(self.candles.len() - 2).map(|c| c.close)
        } else {
            None
        };
        let reclaimed = price > ma && (last.close <= ma || prev_close.map(|c| c <= ma).unwrap_or(false));

        bounced || reclaimed
    }
}
