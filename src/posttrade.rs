/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : posttrade.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/posttrade.rs
// ===============================
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{Event, Position};

/// Audit callbacks invoked by the engine after each state change.
/// Errors are logged by the caller and never change trading state.
#[async_trait]
pub trait TradeHooks: Send + Sync {
    async fn on_order(&self, pos: &Position) -> Result<()>;
    async fn on_fill(&self, pos: &Position) -> Result<()>;
    async fn on_close(&self, pos: &Position) -> Result<()>;
}

pub struct NoopHooks;

#[async_trait]
impl TradeHooks for NoopHooks {
    async fn on_order(&self, _pos: &Position) -> Result<()> { Ok(()) }
    async fn on_fill(&self, _pos: &Position) -> Result<()> { Ok(()) }
    async fn on_close(&self, _pos: &Position) -> Result<()> { Ok(()) }
}

/// Logs every lifecycle event and forwards it to the JSONL recorder.
pub struct PostTrade {
    rec_tx: Option<mpsc::Sender<Event>>,
}

impl PostTrade {
    pub fn new(rec_tx: Option<mpsc::Sender<Event>>) -> Self { Self { rec_tx } }

    async fn forward(&self, ev: Event) -> Result<()> {
        if let Some(tx) = &self.rec_tx {
            tx.send(ev).await.map_err(|_| anyhow::anyhow!("recorder channel closed"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TradeHooks for PostTrade {
    async fn on_order(&self, pos: &Position) -> Result<()> {
        info!(symbol = %pos.symbol, qty = pos.qty, px = pos.entry_price, order_no = ?pos.order_no,
              status = pos.status.as_str(), "ORDER");
        self.forward(Event::Order(pos.clone())).await
    }

    async fn on_fill(&self, pos: &Position) -> Result<()> {
        info!(symbol = %pos.symbol, qty = pos.qty, px = pos.entry_price, "FILLED");
        self.forward(Event::Fill(pos.clone())).await
    }

    async fn on_close(&self, pos: &Position) -> Result<()> {
        let reason = pos.close_reason.map(|r| r.as_str()).unwrap_or("?");
        let pnl = pos.realized_pnl().unwrap_or(0.0);
        if pnl >= 0.0 {
            info!(symbol = %pos.symbol, reason, px = ?pos.close_price, pnl, "CLOSED");
        } else {
            warn!(symbol = %pos.symbol, reason, px = ?pos.close_price, pnl, "CLOSED");
        }
        self.forward(Event::Close(pos.clone())).await
    }
}
