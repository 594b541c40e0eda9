/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : gateway.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/gateway.rs (broker interface + paper venue)
// ===============================
use std::collections::VecDeque;
use std::sync::Mutex;

use ahash::AHashMap;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::domain::{OrderType, Side};

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    /// Broker order number (KIS `ODNO`)
    pub order_no: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountBalance {
    /// Cash available for new orders (KRW)
    pub cash: f64,
    pub total_eval: f64,
    pub holdings: Vec<Holding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub symbol: String,
    pub qty: i64,
    pub avg_price: f64,
}

/// Order entry surface consumed by the execution engine.
#[async_trait]
pub trait Broker: Send + Sync {
    /// `order_type_code` is the KIS `ORD_DVSN` ("00" limit, "01" market).
    async fn place_order(&self, symbol: &str, side: Side, qty: i64, price: f64, order_type_code: &str)
        -> Result<OrderAck>;
    async fn cancel_order(&self, symbol: &str, order_no: &str, qty: i64) -> Result<()>;
    async fn get_account_balance(&self) -> Result<AccountBalance>;
}

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    side: Side,
    qty: i64,
    price: f64,
}

/// Resting limit buys the engine may still cancel; oldest first.
#[derive(Debug, Default)]
struct OpenOrders {
    by_no: AHashMap<String, PaperOrder>,
    arrival: VecDeque<String>,
}

/// Oldest resting orders beyond this are treated as filled and forgotten.
const PAPER_OPEN_CAP: usize = 256;

impl OpenOrders {
    fn insert(&mut self, order_no: String, order: PaperOrder) {
        self.arrival.push_back(order_no.clone());
        self.by_no.insert(order_no, order);
        while self.by_no.len() > PAPER_OPEN_CAP {
            match self.arrival.pop_front() {
                Some(old) => { self.by_no.remove(&old); }
                None => break,
            }
        }
    }

    fn remove(&mut self, order_no: &str) -> Option<PaperOrder> {
        let o = self.by_no.remove(order_no)?;
        self.arrival.retain(|n| n != order_no);
        Some(o)
    }
}

/// In-process venue: acknowledges every order after `latency_ms`.
/// Market orders and sells settle on ack; only limit buys stay open.
pub struct PaperBroker {
    latency_ms: u64,
    cash: Mutex<f64>,
    open: Mutex<OpenOrders>,
}

impl PaperBroker {
    pub fn new(latency_ms: u64, cash: f64) -> Self {
        Self { latency_ms, cash: Mutex::new(cash), open: Mutex::new(OpenOrders::default()) }
    }

    pub fn open_orders(&self) -> usize {
        self.open.lock().map(|m| m.by_no.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(&self, symbol: &str, side: Side, qty: i64, price: f64, order_type_code: &str)
        -> Result<OrderAck> {
        if qty <= 0 { bail!("paper: qty must be positive"); }
        sleep(Duration::from_millis(self.latency_ms)).await;

        let order_no = format!("P{:010}", rand::thread_rng().gen_range(0..10_000_000_000u64));
        {
            let mut cash = self.cash.lock().map_err(|_| anyhow::anyhow!("paper: cash lock poisoned"))?;
            let notional = price * qty as f64;
            match side {
                Side::Buy => *cash -= notional,
                Side::Sell => *cash += notional,
            }
        }
        let resting = side == Side::Buy && order_type_code != OrderType::Market.code();
        if resting {
            if let Ok(mut open) = self.open.lock() {
                open.insert(order_no.clone(), PaperOrder { symbol: symbol.to_string(), side, qty, price });
            }
        }
        debug!(%symbol, side = side.as_str(), qty, price, ord_dvsn = order_type_code, %order_no, "paper ack");
        Ok(OrderAck { order_no, accepted_at: Utc::now() })
    }

    async fn cancel_order(&self, symbol: &str, order_no: &str, _qty: i64) -> Result<()> {
        sleep(Duration::from_millis(self.latency_ms)).await;
        let removed = self.open.lock().ok().and_then(|mut m| m.remove(order_no));
        match removed {
            Some(o) if o.symbol == symbol => {
                // kembalikan dana order beli yang batal
                if o.side == Side::Buy {
                    if let Ok(mut cash) = self.cash.lock() {
                        *cash += o.price * o.qty as f64;
                    }
                }
                Ok(())
            }
            Some(_) => bail!("paper: order {order_no} does not belong to {symbol}"),
            None => bail!("paper: unknown order {order_no}"),
        }
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        let cash = *self.cash.lock().map_err(|_| anyhow::anyhow!("paper: cash lock poisoned"))?;
        Ok(AccountBalance { cash, total_eval: cash, holdings: Vec::new() })
    }
}
