/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : signal.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/signal.rs
// ===============================
//
// Composite buy signal, dievaluasi per tick per symbol:
// 1) Order-book imbalance : total_ask / total_bid >= threshold
//    (banyak penjual menunggu di atas = tekanan beli akan menyerap)
// 2) Momentum acceleration: kenaikan 체결강도 dalam window detik terakhir
// 3) MA support           : harga dekat / memantul dari MA tick candle
//
// VI (volatility interruption): tick pertama setelah jeda > vi_silence_secs,
// atau tick dengan flag halt, memaksa should_buy = false.
//
use std::collections::VecDeque;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::candle::TickAggregator;
use crate::config::SignalCfg;
use crate::domain::{ExecutionTick, OrderBookSnapshot, Signal, SignalMetrics, TickCandle};
use crate::metrics::{BUY_SIGNALS, SIGNALS_EVALUATED, TICKS_FILTERED};

#[derive(Debug)]
struct SymbolState {
    aggregator: TickAggregator,
    strength: VecDeque<(DateTime<Utc>, f64)>,
    book: Option<OrderBookSnapshot>,
    last_tick_at: Option<DateTime<Utc>>,
    last_signal_at: Option<DateTime<Utc>>,
    vi_active: bool,
}

impl SymbolState {
    fn new(cfg: &SignalCfg) -> Self {
        Self {
            aggregator: TickAggregator::new(cfg.tick_size, cfg.max_candles),
            strength: VecDeque::with_capacity(cfg.strength_history),
            book: None,
            last_tick_at: None,
            last_signal_at: None,
            vi_active: false,
        }
    }
}

/// What one tick produced.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub candle: Option<TickCandle>,
    /// `None` when filtered out or cooling down.
    pub signal: Option<Signal>,
}

pub struct SignalDetector {
    cfg: SignalCfg,
    states: HashMap<String, SymbolState>,
}

impl SignalDetector {
    pub fn new(cfg: SignalCfg) -> Self { Self { cfg, states: HashMap::new() } }

    pub fn config(&self) -> &SignalCfg { &self.cfg }

    fn state(&mut self, symbol: &str) -> &mut SymbolState {
        let cfg = &self.cfg;
        self.states.entry(symbol.to_string()).or_insert_with(|| SymbolState::new(cfg))
    }

    /// Latest-wins cache; the previous snapshot is dropped.
    pub fn on_orderbook(&mut self, book: OrderBookSnapshot) {
        let symbol = book.symbol.clone();
        self.state(&symbol).book = Some(book);
    }

    pub fn aggregator(&self, symbol: &str) -> Option<&TickAggregator> {
        self.states.get(symbol).map(|s| &s.aggregator)
    }

    pub fn is_vi_active(&self, symbol: &str) -> bool {
        self.states.get(symbol).map(|s| s.vi_active).unwrap_or(false)
    }

    /// Symbols silent for longer than the VI threshold as of `now`.
    pub fn silent_symbols(&self, now: DateTime<Utc>) -> Vec<String> {
        let limit = Duration::seconds(self.cfg.vi_silence_secs);
        self.states
            .iter()
            .filter(|(_, s)| s.last_tick_at.map(|t| now - t > limit).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn on_tick(&mut self, tick: &ExecutionTick, now: DateTime<Utc>) -> TickOutcome {
        // Noise filter: tick kecil diabaikan, tidak di-queue
        if tick.volume < self.cfg.min_volume || tick.amount() < self.cfg.min_amount {
            TICKS_FILTERED.inc();
            return TickOutcome::default();
        }

        let cfg = &self.cfg;
        let st = self.states.entry(tick.symbol.clone()).or_insert_with(|| SymbolState::new(cfg));

        let candle = st.aggregator.add_tick(tick.price, tick.volume, tick.timestamp);

        if st.strength.len() == cfg.strength_history {
            st.strength.pop_front();
        }
        st.strength.push_back((now, tick.strength));

        // VI: jeda panjang sebelum tick ini, atau flag halt dari bursa
        let silent = st
            .last_tick_at
            .map(|t| now - t > Duration::seconds(cfg.vi_silence_secs))
            .unwrap_or(false);
        let vi_active = silent || tick.halted;
        if vi_active && !st.vi_active {
            info!(symbol = %tick.symbol, halted = tick.halted, "VI suspected, entries suppressed");
        }
        st.vi_active = vi_active;
        st.last_tick_at = Some(now);

        if let Some(last) = st.last_signal_at {
            if now - last < Duration::seconds(cfg.cooldown_secs) {
                return TickOutcome { candle, signal: None };
            }
        }

        // 1) imbalance: snapshot cache lebih akurat dari total di tick
        let (ask_total, bid_total) = match &st.book {
            Some(b) => (b.total_ask_qty, b.total_bid_qty),
            None => (tick.total_ask_qty, tick.total_bid_qty),
        };
        let ratio = if bid_total == 0 { f64::INFINITY } else { ask_total as f64 / bid_total as f64 };
        let orderbook_signal = ratio >= cfg.imbalance_threshold;

        // 2) momentum: strength di akhir window - strength di awal window
        let window_start = now - Duration::seconds(cfg.momentum_window_secs);
        let in_window: Vec<f64> = st.strength.iter().filter(|(t, _)| *t >= window_start).map(|(_, s)| *s).collect();
        let (s_start, s_end) = match (in_window.first(), in_window.last()) {
            (Some(a), Some(b)) => (*a, *b),
            _ => (tick.strength, tick.strength),
        };
        let delta = s_end - s_start;
        let momentum_signal = in_window.len() >= 2 && delta >= cfg.momentum_threshold && s_end >= cfg.strength_floor;

        // 3) MA support
        let ma = st.aggregator.get_ma(cfg.ma_period);
        let (ma_support_signal, ma_distance_pct) = match ma {
            Some(ma) if ma > 0.0 => {
                let dist = (tick.price - ma) / ma * 100.0;
                let near = dist.abs() <= cfg.ma_tolerance_pct;
                let pattern = st.aggregator.is_ma_support(tick.price, cfg.ma_period, cfg.ma_lookback, cfg.ma_tolerance_pct);
                let not_below = dist >= -cfg.ma_tolerance_pct;
                ((near || pattern) && not_below, Some(dist))
            }
            _ => (false, None),
        };

        let signal = Signal {
            symbol: tick.symbol.clone(),
            price: tick.price,
            timestamp: tick.timestamp,
            orderbook_signal,
            momentum_signal,
            ma_support_signal,
            vi_active,
            metrics: SignalMetrics {
                ask_bid_ratio: ratio,
                strength_start: s_start,
                strength_end: s_end,
                strength_delta: delta,
                ma,
                ma_distance_pct,
            },
        };

        // cooldown juga untuk partial match (>= 2 kondisi), untuk diagnosa
        if signal.matched() >= 2 {
            st.last_signal_at = Some(now);
        }

        SIGNALS_EVALUATED.inc();
        if signal.should_buy() {
            BUY_SIGNALS.with_label_values(&[&signal.symbol]).inc();
            info!(
                symbol = %signal.symbol,
                price = signal.price,
                ratio = %format!("{:.2}", ratio),
                strength_delta = %format!("{:.2}", delta),
                ma = ?ma,
                "BUY signal"
            );
        } else if signal.matched() >= 2 {
            debug!(
                symbol = %signal.symbol,
                ob = orderbook_signal,
                mom = momentum_signal,
                ma = ma_support_signal,
                vi = vi_active,
                "partial signal"
            );
        }

        TickOutcome { candle, signal: Some(signal) }
    }
}
