/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : engine.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/engine.rs
// ===============================
//
// State machine posisi:
//   PENDING -> ORDERED -> FILLED -> CLOSING -> CLOSED
//                    \-> CANCELLED
// Semua perubahan state dilakukan di bawah `state` (std Mutex, tidak pernah
// dipegang melewati .await). Penerbitan order diserialisasi oleh `order_lock`
// sehingga cek cooldown/kapasitas tidak basi saat order dikirim.
//
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TradingCfg;
use crate::domain::{ExitReason, OrderType, Position, PositionStatus, Side, Signal};
use crate::gateway::Broker;
use crate::metrics::{ENTRY_REJECTS, ORDERS};
use crate::positions::{EngineStats, PositionBook};
use crate::posttrade::TradeHooks;
use crate::rate_limit::{RateLimitError, TokenBucket};
use crate::risk::{self, EntryContext, EntryGuard, RiskError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("signal does not qualify for entry")]
    NotActionable,
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("order rejected: {0}")]
    Order(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),
    #[error("no active position for {0}")]
    NoPosition(String),
    #[error("{symbol} is {status}, expected {expected}")]
    InvalidState { symbol: String, status: &'static str, expected: &'static str },
}

#[derive(Debug, Clone, Copy)]
enum Hook { Order, Fill, Close }

/// First exit condition that holds, in priority order:
/// stop-loss, take-profit, trailing stop, max holding time.
pub fn evaluate_exit(pos: &Position, cfg: &TradingCfg, now: DateTime<Utc>) -> Option<ExitReason> {
    let pnl = pos.pnl_pct();
    if pnl <= cfg.stop_loss_pct {
        return Some(ExitReason::StopLoss);
    }
    if pnl >= cfg.take_profit_pct {
        return Some(ExitReason::TakeProfit);
    }
    // trailing hanya aktif jika harga pernah di atas entry
    if pos.high_price > pos.entry_price && pos.high_price > 0.0 {
        let drawdown = (pos.high_price - pos.current_price) * 100.0 / pos.high_price;
        if drawdown >= cfg.trailing_stop_pct {
            return Some(ExitReason::TrailingStop);
        }
    }
    if pos.holding_secs(now) >= cfg.max_holding_secs {
        return Some(ExitReason::TimeStop);
    }
    None
}

struct State {
    book: PositionBook,
    guard: EntryGuard,
    /// Symbols whose entry cancel is in flight at the broker.
    cancelling: AHashSet<String>,
}

pub struct ExecutionEngine {
    cfg: TradingCfg,
    broker: Arc<dyn Broker>,
    hooks: Arc<dyn TradeHooks>,
    state: Mutex<State>,
    limiter: AsyncMutex<TokenBucket>,
    order_lock: AsyncMutex<()>,
}

impl ExecutionEngine {
    pub fn new(cfg: TradingCfg, broker: Arc<dyn Broker>, hooks: Arc<dyn TradeHooks>) -> Self {
        let bucket = TokenBucket::new(cfg.rate_per_sec, cfg.rate_capacity);
        Self {
            cfg,
            broker,
            hooks,
            state: Mutex::new(State {
                book: PositionBook::new(),
                guard: EntryGuard::default(),
                cancelling: AHashSet::new(),
            }),
            limiter: AsyncMutex::new(bucket),
            order_lock: AsyncMutex::new(()),
        }
    }

    pub fn config(&self) -> &TradingCfg { &self.cfg }

    fn state(&self) -> MutexGuard<'_, State> {
        // poisoned hanya jika ada panic saat memegang lock; data tetap konsisten per critical section
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn acquire_token(&self) -> Result<(), RateLimitError> {
        let wait = Duration::from_millis(self.cfg.token_timeout_ms);
        let mut bucket = self.limiter.lock().await;
        bucket.acquire(wait).await
    }

    /// Sends the order (or synthesizes an ack in dry-run) and returns the order number.
    async fn submit(&self, symbol: &str, side: Side, qty: i64, price: f64, order_type: OrderType)
        -> Result<String, EngineError> {
        if self.cfg.dry_run {
            return Ok(format!("DRY-{:08}", rand::thread_rng().gen_range(0..100_000_000u32)));
        }
        let limit = Duration::from_millis(self.cfg.order_timeout_ms);
        match timeout(limit, self.broker.place_order(symbol, side, qty, price, order_type.code())).await {
            Ok(Ok(ack)) => Ok(ack.order_no),
            Ok(Err(e)) => Err(EngineError::Order(format!("{e:#}"))),
            Err(_) => Err(EngineError::Timeout(limit)),
        }
    }

    async fn notify(&self, hook: Hook, pos: &Position) {
        let res = match hook {
            Hook::Order => self.hooks.on_order(pos).await,
            Hook::Fill => self.hooks.on_fill(pos).await,
            Hook::Close => self.hooks.on_close(pos).await,
        };
        if let Err(e) = res {
            warn!(symbol = %pos.symbol, ?hook, error = %e, "trade hook failed (ignored)");
        }
    }

    /// Entry path: risk checks, PENDING reservation, token, order.
    /// Any failure after the reservation removes it again.
    pub async fn on_buy_signal(&self, sig: &Signal, now: DateTime<Utc>) -> Result<Position, EngineError> {
        if !sig.should_buy() {
            return Err(EngineError::NotActionable);
        }
        let issue = self.order_lock.lock().await;

        let qty = {
            let mut st = self.state();
            let ctx = EntryContext {
                symbol: &sig.symbol,
                price: sig.price,
                held: st.book.is_held(&sig.symbol),
                active_count: st.book.active_count(),
                now,
            };
            let qty = match risk::check(&ctx, &self.cfg, &st.guard) {
                Ok(q) => q,
                Err(e) => {
                    ENTRY_REJECTS.with_label_values(&[e.kind()]).inc();
                    debug!(symbol = %sig.symbol, reason = %e, "entry rejected");
                    return Err(e.into());
                }
            };
            if !st.book.reserve(Position::new(&sig.symbol, qty, sig.price, now)) {
                let e = RiskError::AlreadyHeld(sig.symbol.clone());
                ENTRY_REJECTS.with_label_values(&[e.kind()]).inc();
                return Err(e.into());
            }
            qty
        };

        if let Err(e) = self.acquire_token().await {
            self.state().book.release(&sig.symbol);
            ENTRY_REJECTS.with_label_values(&["rate_limit"]).inc();
            warn!(symbol = %sig.symbol, error = %e, "entry dropped: no order token");
            return Err(e.into());
        }

        let order_no = match self.submit(&sig.symbol, Side::Buy, qty, sig.price, self.cfg.order_type).await {
            Ok(no) => no,
            Err(e) => {
                self.state().book.release(&sig.symbol);
                ORDERS.with_label_values(&["buy", "error"]).inc();
                warn!(symbol = %sig.symbol, error = %e, "entry order failed, reservation released");
                return Err(e);
            }
        };

        // market order / dry-run dianggap langsung fill
        let filled_now = self.cfg.dry_run || self.cfg.order_type == OrderType::Market;
        let pos = {
            let mut st = self.state();
            st.guard.record_order(now);
            st.guard.spend(sig.price * qty as f64);
            match st.book.get_mut(&sig.symbol) {
                Some(p) => {
                    p.order_no = Some(order_no);
                    p.status = if filled_now { PositionStatus::Filled } else { PositionStatus::Ordered };
                    p.clone()
                }
                None => return Err(EngineError::NoPosition(sig.symbol.clone())),
            }
        };
        drop(issue);

        ORDERS.with_label_values(&["buy", "ok"]).inc();
        info!(symbol = %pos.symbol, qty, px = pos.entry_price, status = pos.status.as_str(),
              dry_run = self.cfg.dry_run, "entry submitted");
        self.notify(Hook::Order, &pos).await;
        if filled_now {
            self.notify(Hook::Fill, &pos).await;
        }
        Ok(pos)
    }

    /// Per-tick update: limit-fill detection, watermarks, exit evaluation.
    /// Returns the closed position when an exit order went through.
    pub async fn monitor_position(&self, symbol: &str, price: f64, now: DateTime<Utc>)
        -> Result<Option<Position>, EngineError> {
        if price <= 0.0 || !price.is_finite() {
            return Ok(None);
        }

        let (fill, exit) = {
            let mut st = self.state();
            let cancelling = st.cancelling.contains(symbol);
            let Some(pos) = st.book.get_mut(symbol) else { return Ok(None) };

            // limit beli terisi jika harga transaksi <= harga limit
            // (tidak selama cancel sedang menunggu broker)
            let mut fill = None;
            if pos.status == PositionStatus::Ordered && !cancelling && price <= pos.entry_price {
                pos.status = PositionStatus::Filled;
                pos.entry_time = now;
                fill = Some(pos.clone());
            }

            let mut exit = None;
            if pos.status == PositionStatus::Filled {
                pos.mark(price);
                exit = evaluate_exit(pos, &self.cfg, now);
                if exit.is_some() {
                    pos.status = PositionStatus::Closing;
                }
            }
            (fill, exit)
        };

        if let Some(p) = &fill {
            info!(symbol = %p.symbol, px = p.entry_price, "limit entry filled by trade");
            self.notify(Hook::Fill, p).await;
        }

        match exit {
            Some(reason) => self.close_position(symbol, price, reason, now).await.map(Some),
            None => Ok(None),
        }
    }

    /// Exit order for a position already marked CLOSING.
    /// On failure the position goes back to FILLED.
    async fn close_position(&self, symbol: &str, price: f64, reason: ExitReason, now: DateTime<Utc>)
        -> Result<Position, EngineError> {
        let issue = self.order_lock.lock().await;

        let qty = self.state().book.get(symbol).map(|p| p.qty);
        let Some(qty) = qty else { return Err(EngineError::NoPosition(symbol.to_string())) };

        // stop-loss selalu market order
        let order_type = if reason == ExitReason::StopLoss { OrderType::Market } else { self.cfg.order_type };
        let result = match self.acquire_token().await {
            Ok(()) => self.submit(symbol, Side::Sell, qty, price, order_type).await,
            Err(e) => Err(e.into()),
        };
        let order_no = match result {
            Ok(no) => no,
            Err(e) => {
                if let Some(p) = self.state().book.get_mut(symbol) {
                    p.status = PositionStatus::Filled;
                }
                ORDERS.with_label_values(&["sell", "error"]).inc();
                warn!(%symbol, reason = reason.as_str(), error = %e, "exit order failed, back to FILLED");
                return Err(e);
            }
        };

        let closed = {
            let mut st = self.state();
            let closed = st.book.close(symbol, price, reason, now);
            if closed.is_some() {
                st.guard.record_close(symbol, now, self.cfg.stock_cooldown_secs);
                st.guard.credit(price * qty as f64);
            }
            closed
        };
        drop(issue);

        let closed = closed.ok_or_else(|| EngineError::NoPosition(symbol.to_string()))?;
        ORDERS.with_label_values(&["sell", "ok"]).inc();
        info!(%symbol, reason = reason.as_str(), px = price, pnl = closed.realized_pnl().unwrap_or(0.0),
              %order_no, "position closed");
        self.notify(Hook::Close, &closed).await;
        Ok(closed)
    }

    /// Cancel request at the broker (no-op in dry-run).
    async fn send_cancel(&self, symbol: &str, order_no: Option<&str>, qty: i64) -> Result<(), EngineError> {
        let Some(no) = order_no.filter(|_| !self.cfg.dry_run) else { return Ok(()) };
        self.acquire_token().await?;
        let limit = Duration::from_millis(self.cfg.order_timeout_ms);
        match timeout(limit, self.broker.cancel_order(symbol, no, qty)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                ORDERS.with_label_values(&["cancel", "error"]).inc();
                Err(EngineError::Broker(format!("{e:#}")))
            }
            Err(_) => Err(EngineError::Timeout(limit)),
        }
    }

    /// Cancels an ORDERED entry. The position stays ORDERED if the cancel fails.
    /// A cancel confirmed by the broker always ends in CANCELLED.
    async fn cancel_entry(&self, symbol: &str, now: DateTime<Utc>) -> Result<Position, EngineError> {
        let issue = self.order_lock.lock().await;

        let (order_no, qty) = {
            let mut st = self.state();
            let (order_no, qty) = match st.book.get(symbol) {
                Some(p) if p.status == PositionStatus::Ordered => (p.order_no.clone(), p.qty),
                Some(p) => {
                    return Err(EngineError::InvalidState {
                        symbol: symbol.to_string(),
                        status: p.status.as_str(),
                        expected: PositionStatus::Ordered.as_str(),
                    })
                }
                None => return Err(EngineError::NoPosition(symbol.to_string())),
            };
            st.cancelling.insert(symbol.to_string());
            (order_no, qty)
        };

        let sent = self.send_cancel(symbol, order_no.as_deref(), qty).await;

        let cancelled = {
            let mut st = self.state();
            st.cancelling.remove(symbol);
            match sent {
                Err(e) => Err(e),
                Ok(()) => {
                    let status = st.book.get(symbol).map(|p| p.status);
                    match status {
                        Some(s) if s.is_active() => {
                            if s != PositionStatus::Ordered {
                                // broker sudah membatalkan: fill yang dilaporkan selama cancel tidak berlaku
                                warn!(%symbol, status = s.as_str(), "cancel confirmed after fill report, discarding fill");
                            }
                            let c = st.book.cancel(symbol, now);
                            if let Some(p) = &c {
                                st.guard.credit(p.notional());
                            }
                            c.ok_or_else(|| EngineError::NoPosition(symbol.to_string()))
                        }
                        _ => Err(EngineError::NoPosition(symbol.to_string())),
                    }
                }
            }
        };
        drop(issue);

        let pos = cancelled?;
        ORDERS.with_label_values(&["cancel", "ok"]).inc();
        info!(%symbol, order_no = ?pos.order_no, "entry cancelled");
        Ok(pos)
    }

    /// Forces liquidation of every held position and cancels unfilled entries.
    pub async fn close_all(&self, reason: ExitReason, now: DateTime<Utc>) -> Vec<Result<Position, EngineError>> {
        let (to_close, to_cancel) = {
            let mut st = self.state();
            let mut symbols = st.book.symbols();
            symbols.sort();
            let mut close = Vec::new();
            let mut cancel = Vec::new();
            for sym in symbols {
                if let Some(p) = st.book.get_mut(&sym) {
                    match p.status {
                        PositionStatus::Filled => {
                            p.status = PositionStatus::Closing;
                            close.push((sym, p.current_price));
                        }
                        PositionStatus::Ordered => cancel.push(sym),
                        _ => {}
                    }
                }
            }
            (close, cancel)
        };

        info!(closing = to_close.len(), cancelling = to_cancel.len(), reason = reason.as_str(), "close_all");
        let mut out = Vec::with_capacity(to_close.len() + to_cancel.len());
        for (sym, px) in to_close {
            out.push(self.close_position(&sym, px, reason, now).await);
        }
        for sym in to_cancel {
            out.push(self.cancel_entry(&sym, now).await);
        }
        out
    }

    /// Owner-reported fill of an ORDERED entry (e.g. from an execution notice).
    pub async fn mark_filled(&self, symbol: &str, fill_price: Option<f64>, now: DateTime<Utc>)
        -> Result<Position, EngineError> {
        let pos = {
            let mut st = self.state();
            let p = st.book.get_mut(symbol).ok_or_else(|| EngineError::NoPosition(symbol.to_string()))?;
            if p.status != PositionStatus::Ordered {
                return Err(EngineError::InvalidState {
                    symbol: symbol.to_string(),
                    status: p.status.as_str(),
                    expected: PositionStatus::Ordered.as_str(),
                });
            }
            if let Some(px) = fill_price.filter(|px| *px > 0.0) {
                p.entry_price = px;
                p.current_price = px;
                p.high_price = px;
                p.low_price = px;
            }
            p.status = PositionStatus::Filled;
            p.entry_time = now;
            p.clone()
        };
        self.notify(Hook::Fill, &pos).await;
        Ok(pos)
    }

    /// Cancels ORDERED entries older than `fill_timeout_secs`.
    pub async fn expire_stale_orders(&self, now: DateTime<Utc>) -> Vec<Result<Position, EngineError>> {
        let stale: Vec<String> = self
            .state()
            .book
            .active()
            .into_iter()
            .filter(|p| p.status == PositionStatus::Ordered && p.holding_secs(now) >= self.cfg.fill_timeout_secs)
            .map(|p| p.symbol)
            .collect();

        let mut out = Vec::with_capacity(stale.len());
        for sym in stale {
            out.push(self.cancel_entry(&sym, now).await);
        }
        out
    }

    /// Re-checks held positions at their last price (time stop for quiet symbols).
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<Result<Position, EngineError>> {
        let held: Vec<(String, f64)> = self
            .state()
            .book
            .active()
            .into_iter()
            .filter(|p| p.status == PositionStatus::Filled)
            .map(|p| (p.symbol, p.current_price))
            .collect();

        let mut out = Vec::new();
        for (sym, px) in held {
            match self.monitor_position(&sym, px, now).await {
                Ok(Some(p)) => out.push(Ok(p)),
                Ok(None) => {}
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Refreshes the cached cash balance used by the funds check.
    pub async fn refresh_balance(&self) -> Result<f64, EngineError> {
        let limit = Duration::from_millis(self.cfg.order_timeout_ms);
        let bal = match timeout(limit, self.broker.get_account_balance()).await {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => return Err(EngineError::Broker(format!("{e:#}"))),
            Err(_) => return Err(EngineError::Timeout(limit)),
        };
        self.state().guard.set_cash(bal.cash);
        debug!(cash = bal.cash, holdings = bal.holdings.len(), "balance refreshed");
        Ok(bal.cash)
    }

    pub fn cash(&self) -> Option<f64> { self.state().guard.cash() }

    pub fn stats(&self) -> EngineStats { self.state().book.stats().clone() }

    pub fn position(&self, symbol: &str) -> Option<Position> { self.state().book.get(symbol).cloned() }

    pub fn active_positions(&self) -> Vec<Position> { self.state().book.active() }

    pub fn closed_positions(&self) -> Vec<Position> { self.state().book.closed().iter().cloned().collect() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SignalMetrics;
    use crate::gateway::{AccountBalance, OrderAck, PaperBroker};
    use crate::posttrade::NoopHooks;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn at(sec: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + sec, 0).unwrap()
    }

    fn cfg() -> TradingCfg {
        TradingCfg {
            dry_run: true,
            rate_per_sec: 100.0,
            rate_capacity: 100.0,
            order_cooldown_secs: 0,
            ..Default::default()
        }
    }

    fn live(order_type: OrderType) -> TradingCfg {
        TradingCfg { dry_run: false, order_type, ..cfg() }
    }

    fn buy(symbol: &str, price: f64, now: DateTime<Utc>) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            price,
            timestamp: now,
            orderbook_signal: true,
            momentum_signal: true,
            ma_support_signal: true,
            vi_active: false,
            metrics: SignalMetrics::default(),
        }
    }

    fn dry_engine() -> ExecutionEngine {
        ExecutionEngine::new(cfg(), Arc::new(PaperBroker::new(0, 0.0)), Arc::new(NoopHooks))
    }

    #[derive(Default)]
    struct ScriptedBroker {
        fail_buys: AtomicBool,
        fail_sells: AtomicBool,
        placed: AtomicUsize,
        cancels: AtomicUsize,
        last_code: Mutex<String>,
        place_delay: Duration,
        cancel_delay: Duration,
    }

    #[async_trait::async_trait]
    impl Broker for ScriptedBroker {
        async fn place_order(&self, _symbol: &str, side: Side, _qty: i64, _price: f64, code: &str)
            -> anyhow::Result<OrderAck> {
            let fail = match side {
                Side::Buy => self.fail_buys.load(Ordering::SeqCst),
                Side::Sell => self.fail_sells.load(Ordering::SeqCst),
            };
            tokio::time::sleep(self.place_delay).await;
            if fail {
                anyhow::bail!("APBK0919 rejected");
            }
            let n = self.placed.fetch_add(1, Ordering::SeqCst);
            *self.last_code.lock().unwrap() = code.to_string();
            Ok(OrderAck { order_no: format!("{n:010}"), accepted_at: Utc::now() })
        }

        async fn cancel_order(&self, _symbol: &str, _order_no: &str, _qty: i64) -> anyhow::Result<()> {
            tokio::time::sleep(self.cancel_delay).await;
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_account_balance(&self) -> anyhow::Result<AccountBalance> {
            Ok(AccountBalance::default())
        }
    }

    #[derive(Default)]
    struct FailingHooks {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TradeHooks for FailingHooks {
        async fn on_order(&self, _pos: &Position) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("db down")
        }
        async fn on_fill(&self, _pos: &Position) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("db down")
        }
        async fn on_close(&self, _pos: &Position) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("db down")
        }
    }

    #[test]
    fn test_exit_priority_stop_loss_before_time_stop() {
        let c = cfg();
        let mut p = Position::new("A", 100, 10_000.0, at(0));
        p.status = PositionStatus::Filled;
        p.mark(9_900.0);
        assert_eq!(evaluate_exit(&p, &c, at(10_000)), Some(ExitReason::StopLoss));
        p.mark(10_000.0);
        assert_eq!(evaluate_exit(&p, &c, at(10_000)), Some(ExitReason::TimeStop));
        assert_eq!(evaluate_exit(&p, &c, at(10)), None);
    }

    #[tokio::test]
    async fn test_stop_loss_boundary_is_inclusive() {
        let eng = dry_engine();
        let pos = eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        assert_eq!(pos.status, PositionStatus::Filled);
        assert_eq!(pos.qty, 100);

        assert!(eng.monitor_position("A", 9_901.0, at(1)).await.unwrap().is_none());
        assert_eq!(eng.position("A").map(|p| p.status), Some(PositionStatus::Filled));

        let closed = eng.monitor_position("A", 9_900.0, at(2)).await.unwrap().unwrap();
        assert_eq!(closed.close_reason, Some(ExitReason::StopLoss));
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(eng.position("A").is_none());
        assert_eq!(eng.stats().losses, 1);
    }

    #[tokio::test]
    async fn test_fourth_symbol_rejected_at_capacity() {
        let eng = dry_engine();
        for s in ["A", "B", "C"] {
            eng.on_buy_signal(&buy(s, 10_000.0, at(0)), at(0)).await.unwrap();
        }
        let err = eng.on_buy_signal(&buy("D", 10_000.0, at(0)), at(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Risk(RiskError::Capacity(3))));
        assert!(eng.position("D").is_none());
        assert_eq!(eng.active_positions().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_entries_respect_capacity() {
        let broker = Arc::new(ScriptedBroker { place_delay: Duration::from_millis(30), ..Default::default() });
        let eng = Arc::new(ExecutionEngine::new(live(OrderType::Limit), broker.clone(), Arc::new(NoopHooks)));

        let tasks: Vec<_> = ["A", "B", "C", "D"]
            .into_iter()
            .map(|s| {
                let eng = eng.clone();
                tokio::spawn(async move { eng.on_buy_signal(&buy(s, 10_000.0, at(0)), at(0)).await })
            })
            .collect();
        let mut ok = 0;
        let mut at_capacity = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(p) => {
                    assert_eq!(p.status, PositionStatus::Ordered);
                    ok += 1;
                }
                Err(EngineError::Risk(RiskError::Capacity(3))) => at_capacity += 1,
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        assert_eq!((ok, at_capacity), (3, 1));
        assert_eq!(eng.active_positions().len(), 3);
        assert_eq!(broker.placed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reentry_blocked_during_stock_cooldown() {
        let eng = dry_engine();
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        let closed = eng.monitor_position("A", 10_150.0, at(10)).await.unwrap().unwrap();
        assert_eq!(closed.close_reason, Some(ExitReason::TakeProfit));

        let err = eng.on_buy_signal(&buy("A", 10_000.0, at(309)), at(309)).await.unwrap_err();
        assert!(matches!(err, EngineError::Risk(RiskError::SymbolCooldown { .. })));
        assert!(eng.position("A").is_none());

        assert!(eng.on_buy_signal(&buy("A", 10_000.0, at(310)), at(310)).await.is_ok());
    }

    #[tokio::test]
    async fn test_vi_signal_is_not_actionable() {
        let eng = dry_engine();
        let mut sig = buy("A", 10_000.0, at(0));
        sig.vi_active = true;
        assert!(matches!(eng.on_buy_signal(&sig, at(0)).await, Err(EngineError::NotActionable)));
        assert!(eng.position("A").is_none());
    }

    #[tokio::test]
    async fn test_entry_failure_rolls_back_reservation() {
        let broker = Arc::new(ScriptedBroker::default());
        broker.fail_buys.store(true, Ordering::SeqCst);
        let eng = ExecutionEngine::new(live(OrderType::Limit), broker.clone(), Arc::new(NoopHooks));

        let err = eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Order(_)));
        assert!(eng.position("A").is_none());
        assert!(eng.active_positions().is_empty());

        broker.fail_buys.store(false, Ordering::SeqCst);
        let pos = eng.on_buy_signal(&buy("A", 10_000.0, at(1)), at(1)).await.unwrap();
        assert_eq!(pos.status, PositionStatus::Ordered);
    }

    #[tokio::test]
    async fn test_exit_failure_rolls_back_to_filled() {
        let broker = Arc::new(ScriptedBroker::default());
        let eng = ExecutionEngine::new(live(OrderType::Market), broker.clone(), Arc::new(NoopHooks));
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();

        broker.fail_sells.store(true, Ordering::SeqCst);
        let err = eng.monitor_position("A", 9_900.0, at(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Order(_)));
        assert_eq!(eng.position("A").map(|p| p.status), Some(PositionStatus::Filled));

        broker.fail_sells.store(false, Ordering::SeqCst);
        let closed = eng.monitor_position("A", 9_900.0, at(2)).await.unwrap().unwrap();
        assert_eq!(closed.close_reason, Some(ExitReason::StopLoss));
    }

    #[tokio::test]
    async fn test_failing_hooks_do_not_change_state() {
        let hooks = Arc::new(FailingHooks::default());
        let eng = ExecutionEngine::new(cfg(), Arc::new(PaperBroker::new(0, 0.0)), hooks.clone());

        let pos = eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        assert_eq!(pos.status, PositionStatus::Filled);
        let closed = eng.monitor_position("A", 10_200.0, at(1)).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        // order + fill + close
        assert_eq!(hooks.calls.load(Ordering::SeqCst), 3);
        assert_eq!(eng.stats().wins, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_timeout_rejects_without_side_effects() {
        let c = TradingCfg { rate_per_sec: 0.01, rate_capacity: 1.0, token_timeout_ms: 50, ..cfg() };
        let eng = ExecutionEngine::new(c, Arc::new(PaperBroker::new(0, 0.0)), Arc::new(NoopHooks));

        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        let err = eng.on_buy_signal(&buy("B", 10_000.0, at(0)), at(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimit(RateLimitError::Timeout(_))));
        assert!(eng.position("B").is_none());
        assert_eq!(eng.active_positions().len(), 1);
    }

    #[tokio::test]
    async fn test_limit_entry_fills_when_trade_reaches_limit() {
        let broker = Arc::new(ScriptedBroker::default());
        let eng = ExecutionEngine::new(live(OrderType::Limit), broker.clone(), Arc::new(NoopHooks));
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();

        assert!(eng.monitor_position("A", 10_010.0, at(1)).await.unwrap().is_none());
        assert_eq!(eng.position("A").map(|p| p.status), Some(PositionStatus::Ordered));

        assert!(eng.monitor_position("A", 10_000.0, at(2)).await.unwrap().is_none());
        let p = eng.position("A").unwrap();
        assert_eq!(p.status, PositionStatus::Filled);
        assert_eq!(p.entry_time, at(2));
    }

    #[tokio::test]
    async fn test_stale_limit_entry_is_cancelled() {
        let broker = Arc::new(ScriptedBroker::default());
        let eng = ExecutionEngine::new(live(OrderType::Limit), broker.clone(), Arc::new(NoopHooks));
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();

        assert!(eng.expire_stale_orders(at(29)).await.is_empty());
        let res = eng.expire_stale_orders(at(30)).await;
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].as_ref().map(|p| p.status).ok(), Some(PositionStatus::Cancelled));
        assert_eq!(broker.cancels.load(Ordering::SeqCst), 1);
        assert!(eng.position("A").is_none());
        assert_eq!(eng.stats().total_trades, 0);
    }

    #[tokio::test]
    async fn test_trade_print_ignored_while_cancel_in_flight() {
        let broker = Arc::new(ScriptedBroker { cancel_delay: Duration::from_millis(100), ..Default::default() });
        let eng = Arc::new(ExecutionEngine::new(live(OrderType::Limit), broker.clone(), Arc::new(NoopHooks)));
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();

        let expiring = eng.clone();
        let expiry = tokio::spawn(async move { expiring.expire_stale_orders(at(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // trade di harga limit saat cancel masih di broker
        assert!(eng.monitor_position("A", 10_000.0, at(30)).await.unwrap().is_none());
        assert_eq!(eng.position("A").map(|p| p.status), Some(PositionStatus::Ordered));

        let res = expiry.await.unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].as_ref().map(|p| p.status).ok(), Some(PositionStatus::Cancelled));
        assert_eq!(broker.cancels.load(Ordering::SeqCst), 1);
        assert!(eng.position("A").is_none());

        // tidak ada sell untuk beli yang sudah batal
        let placed = broker.placed.load(Ordering::SeqCst);
        assert!(eng.monitor_position("A", 9_800.0, at(31)).await.unwrap().is_none());
        assert_eq!(broker.placed.load(Ordering::SeqCst), placed);
    }

    #[tokio::test]
    async fn test_confirmed_cancel_discards_fill_report() {
        let broker = Arc::new(ScriptedBroker { cancel_delay: Duration::from_millis(100), ..Default::default() });
        let eng = Arc::new(ExecutionEngine::new(live(OrderType::Limit), broker.clone(), Arc::new(NoopHooks)));
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();

        let expiring = eng.clone();
        let expiry = tokio::spawn(async move { expiring.expire_stale_orders(at(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        eng.mark_filled("A", None, at(30)).await.unwrap();

        let res = expiry.await.unwrap();
        assert_eq!(res[0].as_ref().map(|p| p.status).ok(), Some(PositionStatus::Cancelled));
        assert!(eng.position("A").is_none());
        assert_eq!(eng.stats().total_trades, 0);
    }

    #[tokio::test]
    async fn test_stop_loss_exit_uses_market_order() {
        let broker = Arc::new(ScriptedBroker::default());
        let eng = ExecutionEngine::new(live(OrderType::Limit), broker.clone(), Arc::new(NoopHooks));
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        assert_eq!(broker.last_code.lock().unwrap().as_str(), "00");

        let filled = eng.mark_filled("A", Some(10_000.0), at(1)).await.unwrap();
        assert_eq!(filled.status, PositionStatus::Filled);
        assert!(eng.mark_filled("A", None, at(1)).await.is_err());

        eng.monitor_position("A", 9_850.0, at(2)).await.unwrap().unwrap();
        assert_eq!(broker.last_code.lock().unwrap().as_str(), "01");
    }

    #[tokio::test]
    async fn test_trailing_stop_after_peak() {
        let eng = dry_engine();
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        assert!(eng.monitor_position("A", 10_100.0, at(1)).await.unwrap().is_none());
        let closed = eng.monitor_position("A", 10_049.0, at(2)).await.unwrap().unwrap();
        assert_eq!(closed.close_reason, Some(ExitReason::TrailingStop));
        assert_eq!(closed.high_price, 10_100.0);
    }

    #[tokio::test]
    async fn test_sweep_applies_time_stop() {
        let eng = dry_engine();
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        assert!(eng.sweep(at(599)).await.is_empty());
        let res = eng.sweep(at(600)).await;
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].as_ref().ok().and_then(|p| p.close_reason), Some(ExitReason::TimeStop));
    }

    #[tokio::test]
    async fn test_close_all_liquidates_everything() {
        let eng = dry_engine();
        eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap();
        eng.on_buy_signal(&buy("B", 20_000.0, at(0)), at(0)).await.unwrap();

        let res = eng.close_all(ExitReason::Shutdown, at(5)).await;
        assert_eq!(res.len(), 2);
        assert!(res.iter().all(|r| matches!(r, Ok(p) if p.close_reason == Some(ExitReason::Shutdown))));
        assert!(eng.active_positions().is_empty());
        assert_eq!(eng.closed_positions().len(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_cash_after_refresh() {
        let broker = Arc::new(PaperBroker::new(0, 500_000.0));
        let eng = ExecutionEngine::new(live(OrderType::Limit), broker, Arc::new(NoopHooks));
        assert_eq!(eng.refresh_balance().await.unwrap(), 500_000.0);

        let err = eng.on_buy_signal(&buy("A", 10_000.0, at(0)), at(0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Risk(RiskError::InsufficientFunds { .. })));
        // 40 saham * 12_000 = 480_000 masih cukup
        let c = TradingCfg { investment_per_symbol: 480_000.0, ..live(OrderType::Limit) };
        let eng = ExecutionEngine::new(c, Arc::new(PaperBroker::new(0, 500_000.0)), Arc::new(NoopHooks));
        eng.refresh_balance().await.unwrap();
        assert!(eng.on_buy_signal(&buy("A", 12_000.0, at(0)), at(0)).await.is_ok());
        assert_eq!(eng.cash(), Some(20_000.0));
    }
}
