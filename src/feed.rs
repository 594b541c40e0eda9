/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : feed.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/feed.rs
// ===============================
//
// Market Data adapters:
// - WireProtocolClient : KIS real-time WebSocket (H0STCNT0 / H0STASP0)
//                        approval key -> connect -> subscribe -> receive loop
// - run_mock           : random-walk generator yang meng-encode frame asli
//                        lalu melewati decoder yang sama
//
// Reconnect: delay tetap, jumlah percobaan dibatasi; setiap reconnect sukses
// mengirim ulang seluruh set subscription.
//
use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::FeedCfg;
use crate::domain::{BookLevel, ExecutionTick, FeedEvent, OrderBookSnapshot};
use crate::metrics::{ORDERBOOKS, PARSE_FAILURES, TICKS, TICKS_BY_SYMBOL, WS_CONNECTED, WS_RECONNECTS};
use crate::protocol::{
    decode_frame, encode_execution, encode_orderbook, subscription_message, Channel, ChannelIds, Frame,
    ProtocolError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("approval key request failed: {0}")]
    Approval(String),
    #[error("bad websocket url {0}")]
    Url(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket send failed: {0}")]
    Send(String),
    #[error("not connected")]
    NotConnected,
    #[error("reconnect attempts exhausted ({0})")]
    ReconnectExhausted(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedStats {
    pub frames: u64,
    pub ticks: u64,
    pub orderbooks: u64,
    pub parse_failures: u64,
    pub encrypted: u64,
    pub pings: u64,
    pub reconnects: u64,
}

#[derive(Debug, Deserialize)]
struct ApprovalResp {
    approval_key: String,
}

fn failure_label(e: &ProtocolError) -> &'static str {
    match e {
        ProtocolError::Empty => "empty",
        ProtocolError::Header(_) => "header",
        ProtocolError::TooShort { .. } => "short",
        ProtocolError::Field { .. } => "field",
        ProtocolError::Json(_) => "json",
    }
}

/// Decodes one text frame and forwards typed events.
/// Returns the text to echo back (PINGPONG), if any.
async fn dispatch(
    text: &str,
    ids: &ChannelIds,
    events: &mpsc::Sender<FeedEvent>,
    stats: &mut FeedStats,
    received_at: DateTime<Utc>,
) -> Option<String> {
    stats.frames += 1;
    match decode_frame(text, ids, received_at) {
        Ok(Frame::PingPong(raw)) => {
            stats.pings += 1;
            Some(raw)
        }
        Ok(Frame::SubscribeAck(ack)) => {
            if ack.ok {
                info!(tr_id = %ack.tr_id, tr_key = %ack.tr_key, msg = %ack.msg, "subscribe ack");
            } else {
                warn!(tr_id = %ack.tr_id, tr_key = %ack.tr_key, msg_cd = %ack.msg_cd, msg = %ack.msg, "subscribe refused");
            }
            None
        }
        Ok(Frame::Executions(ticks)) => {
            for t in ticks {
                stats.ticks += 1;
                TICKS.inc();
                TICKS_BY_SYMBOL.with_label_values(&[&t.symbol]).inc();
                let _ = events.send(FeedEvent::Tick(t)).await;
            }
            None
        }
        Ok(Frame::OrderBooks(books)) => {
            for b in books {
                stats.orderbooks += 1;
                ORDERBOOKS.inc();
                let _ = events.send(FeedEvent::OrderBook(b)).await;
            }
            None
        }
        Ok(Frame::Encrypted { tr_id }) => {
            stats.encrypted += 1;
            PARSE_FAILURES.with_label_values(&["encrypted"]).inc();
            debug!(%tr_id, "encrypted frame dropped");
            None
        }
        Ok(Frame::Other { tr_id }) => {
            debug!(%tr_id, "frame for unhandled channel");
            None
        }
        Err(e) => {
            stats.parse_failures += 1;
            PARSE_FAILURES.with_label_values(&[failure_label(&e)]).inc();
            debug!(error = %e, "frame dropped");
            None
        }
    }
}

enum Pump {
    Shutdown,
    Lost(String),
}

pub struct WireProtocolClient {
    cfg: FeedCfg,
    ids: ChannelIds,
    http: reqwest::Client,
    approval_key: Option<String>,
    ws: Option<WsStream>,
    subscriptions: BTreeSet<(Channel, String)>,
    events: mpsc::Sender<FeedEvent>,
    stats: FeedStats,
}

impl WireProtocolClient {
    pub fn new(cfg: FeedCfg, events: mpsc::Sender<FeedEvent>) -> Self {
        let ids = ChannelIds { execution: cfg.execution_tr_id.clone(), orderbook: cfg.orderbook_tr_id.clone() };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            cfg,
            ids,
            http,
            approval_key: None,
            ws: None,
            subscriptions: BTreeSet::new(),
            events,
            stats: FeedStats::default(),
        }
    }

    pub fn stats(&self) -> FeedStats { self.stats.clone() }

    pub fn is_connected(&self) -> bool { self.ws.is_some() }

    /// Current subscription set, ordered by (channel, symbol).
    pub fn subscriptions(&self) -> Vec<(Channel, String)> { self.subscriptions.iter().cloned().collect() }

    /// Exchanges app key/secret for a WebSocket approval key.
    pub async fn fetch_approval_key(&mut self) -> Result<String, FeedError> {
        let url = format!("{}/oauth2/Approval", self.cfg.rest_url.trim_end_matches('/'));
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.cfg.app_key,
            "secretkey": self.cfg.app_secret,
        });
        let rsp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FeedError::Approval(e.to_string()))?;
        let status = rsp.status();
        if !status.is_success() {
            let text = rsp.text().await.unwrap_or_default();
            return Err(FeedError::Approval(format!("http {status}: {text}")));
        }
        let parsed: ApprovalResp = rsp.json().await.map_err(|e| FeedError::Approval(e.to_string()))?;
        if parsed.approval_key.is_empty() {
            return Err(FeedError::Approval("empty approval_key".into()));
        }
        info!("approval key issued");
        self.approval_key = Some(parsed.approval_key.clone());
        Ok(parsed.approval_key)
    }

    async fn open_socket(&mut self) -> Result<(), FeedError> {
        let url = Url::parse(&self.cfg.ws_url).map_err(|e| FeedError::Url(format!("{}: {e}", self.cfg.ws_url)))?;
        info!(ws_url = %self.cfg.ws_url, "connecting KIS websocket");
        let (ws, _resp) = connect_async(url).await.map_err(|e| FeedError::Connect(e.to_string()))?;
        self.ws = Some(ws);
        WS_CONNECTED.set(1);
        Ok(())
    }

    /// Approval key (once) then the WebSocket connection.
    pub async fn connect(&mut self) -> Result<(), FeedError> {
        if self.approval_key.is_none() {
            self.fetch_approval_key().await?;
        }
        self.open_socket().await?;
        let _ = self.events.send(FeedEvent::Connected { attempt: 0 }).await;
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        let ws = self.ws.as_mut().ok_or(FeedError::NotConnected)?;
        ws.send(Message::Text(text)).await.map_err(|e| FeedError::Send(e.to_string()))
    }

    async fn send_control(&mut self, register: bool, channel: Channel, symbol: &str) -> Result<(), FeedError> {
        let key = self.approval_key.clone().unwrap_or_default();
        let msg = subscription_message(&key, &self.cfg.cust_type, register, self.ids.tr_id(channel), symbol);
        self.send_text(msg).await
    }

    /// One register message per (symbol, channel) not yet subscribed.
    /// Returns how many were sent.
    pub async fn subscribe(&mut self, symbols: &[String], include_orderbook: bool) -> Result<usize, FeedError> {
        if self.ws.is_none() {
            return Err(FeedError::NotConnected);
        }
        let mut channels = vec![Channel::Execution];
        if include_orderbook {
            channels.push(Channel::OrderBook);
        }

        let mut sent = 0;
        for symbol in symbols {
            for ch in &channels {
                let key = (*ch, symbol.clone());
                if self.subscriptions.contains(&key) {
                    continue;
                }
                self.send_control(true, *ch, symbol).await?;
                self.subscriptions.insert(key);
                sent += 1;
            }
        }
        info!(sent, total = self.subscriptions.len(), "subscribed");
        Ok(sent)
    }

    /// Unregisters everything; the set is cleared even if sending fails.
    pub async fn unsubscribe_all(&mut self) -> Result<(), FeedError> {
        let subs: Vec<(Channel, String)> = std::mem::take(&mut self.subscriptions).into_iter().collect();
        if self.ws.is_none() {
            return Ok(());
        }
        for (ch, symbol) in subs {
            self.send_control(false, ch, &symbol).await?;
        }
        Ok(())
    }

    async fn replay_subscriptions(&mut self) -> Result<(), FeedError> {
        let subs: Vec<(Channel, String)> = self.subscriptions.iter().cloned().collect();
        for (ch, symbol) in &subs {
            self.send_control(true, *ch, symbol).await?;
        }
        info!(count = subs.len(), "subscriptions replayed");
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
        WS_CONNECTED.set(0);
    }

    async fn pump(&mut self, shutdown: &mut watch::Receiver<bool>) -> Pump {
        let ids = &self.ids;
        let events = &self.events;
        let stats = &mut self.stats;
        let Some(ws) = self.ws.as_mut() else { return Pump::Lost("not connected".into()) };

        loop {
            if *shutdown.borrow() {
                return Pump::Shutdown;
            }
            let msg = tokio::select! {
                changed = shutdown.changed() => {
                    // sender hilang juga dianggap shutdown
                    if changed.is_err() || *shutdown.borrow() { return Pump::Shutdown; }
                    continue;
                }
                m = ws.next() => m,
            };

            match msg {
                None => return Pump::Lost("stream ended".into()),
                Some(Err(e)) => return Pump::Lost(e.to_string()),
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = dispatch(&text, ids, events, stats, Utc::now()).await {
                        if let Err(e) = ws.send(Message::Text(reply)).await {
                            return Pump::Lost(format!("pong send: {e}"));
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Pump::Lost(format!("closed by server: {frame:?}"));
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Single receive loop. Returns `Ok` on shutdown and
    /// `ReconnectExhausted` once the retry bound is hit.
    pub async fn run_forever(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        loop {
            let reason = match self.pump(&mut shutdown).await {
                Pump::Shutdown => {
                    info!("feed: shutdown requested");
                    return Ok(());
                }
                Pump::Lost(reason) => reason,
            };
            warn!(%reason, "feed disconnected");
            self.ws = None;
            WS_CONNECTED.set(0);

            let mut attempt: u32 = 0;
            loop {
                if attempt >= self.cfg.max_reconnect_attempts {
                    error!(attempts = attempt, "feed: reconnect attempts exhausted");
                    let _ = self
                        .events
                        .send(FeedEvent::Disconnected { reason: format!("{reason}; {attempt} reconnect attempts failed") })
                        .await;
                    return Err(FeedError::ReconnectExhausted(attempt));
                }
                attempt += 1;
                self.stats.reconnects += 1;
                WS_RECONNECTS.inc();

                tokio::select! {
                    _ = sleep(Duration::from_millis(self.cfg.reconnect_delay_ms)) => {}
                    _ = shutdown.changed() => return Ok(()),
                }

                let result = match self.open_socket().await {
                    Ok(()) => self.replay_subscriptions().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        info!(attempt, "feed reconnected");
                        let _ = self.events.send(FeedEvent::Connected { attempt }).await;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "reconnect failed");
                        self.ws = None;
                        WS_CONNECTED.set(0);
                    }
                }
            }
        }
    }
}

// ---------------- Mock feed ----------------

/// Random-walk state for one symbol.
#[derive(Debug, Clone)]
struct MockWalk {
    symbol: String,
    price: f64,
    open: f64,
    high: f64,
    low: f64,
    strength: f64,
    cum_volume: u64,
    cum_amount: f64,
}

// KRX tick unit untuk harga 50.000–200.000 KRW
const MOCK_TICK_UNIT: f64 = 100.0;

impl MockWalk {
    fn new(symbol: &str, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            open: price,
            high: price,
            low: price,
            strength: 100.0,
            cum_volume: 0,
            cum_amount: 0.0,
        }
    }

    fn next_tick<R: Rng>(&mut self, rng: &mut R, now: DateTime<Utc>) -> ExecutionTick {
        let step = rng.gen_range(-2..=2) as f64 * MOCK_TICK_UNIT;
        self.price = (self.price + step).max(MOCK_TICK_UNIT * 10.0);
        self.high = self.high.max(self.price);
        self.low = self.low.min(self.price);
        self.strength = (self.strength + rng.gen_range(-3.0..3.5)).clamp(20.0, 300.0);
        let volume: u64 = rng.gen_range(1..200);
        self.cum_volume += volume;
        self.cum_amount += self.price * volume as f64;

        let total_bid: u64 = rng.gen_range(50_000..150_000);
        let total_ask: u64 = (total_bid as f64 * rng.gen_range(0.5..3.0)) as u64;
        ExecutionTick {
            symbol: self.symbol.clone(),
            timestamp: now,
            price: self.price,
            change: self.price - self.open,
            change_rate: (self.price - self.open) / self.open * 100.0,
            open: self.open,
            high: self.high,
            low: self.low,
            best_ask: self.price + MOCK_TICK_UNIT,
            best_bid: self.price,
            volume,
            cumulative_volume: self.cum_volume,
            cumulative_amount: self.cum_amount,
            strength: self.strength,
            halted: false,
            best_ask_qty: rng.gen_range(100..2_000),
            best_bid_qty: rng.gen_range(100..2_000),
            total_ask_qty: total_ask,
            total_bid_qty: total_bid,
            vi_reference_price: None,
        }
    }

    fn book<R: Rng>(&self, rng: &mut R, now: DateTime<Utc>) -> OrderBookSnapshot {
        let mut asks = [BookLevel::default(); 10];
        let mut bids = [BookLevel::default(); 10];
        for i in 0..10 {
            asks[i] = BookLevel { price: self.price + MOCK_TICK_UNIT * (i + 1) as f64, qty: rng.gen_range(100..20_000) };
            bids[i] = BookLevel { price: self.price - MOCK_TICK_UNIT * i as f64, qty: rng.gen_range(100..20_000) };
        }
        let total_ask_qty = asks.iter().map(|l| l.qty).sum();
        let total_bid_qty = bids.iter().map(|l| l.qty).sum();
        OrderBookSnapshot { symbol: self.symbol.clone(), timestamp: now, asks, bids, total_ask_qty, total_bid_qty }
    }
}

/// Generator market data mock: satu tick per `interval_ms`, simbol bergiliran.
/// Setiap tick di-encode ke format wire lalu di-decode ulang.
pub async fn run_mock(
    events: mpsc::Sender<FeedEvent>,
    symbols: Vec<String>,
    include_orderbook: bool,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> FeedStats {
    let ids = ChannelIds::default();
    let mut walks: Vec<MockWalk> = symbols
        .iter()
        .enumerate()
        .map(|(i, s)| MockWalk::new(s, 70_000.0 + 10_000.0 * i as f64))
        .collect();
    let mut stats = FeedStats::default();
    let _ = events.send(FeedEvent::Connected { attempt: 0 }).await;
    info!(symbols = walks.len(), interval_ms, "mock feed started");

    let mut n: usize = 0;
    loop {
        if walks.is_empty() || *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        let idx = n % walks.len();

        // jangan simpan ThreadRng melewati .await
        let frames: Vec<String> = {
            let mut rng = rand::thread_rng();
            let walk = &mut walks[idx];
            let tick = walk.next_tick(&mut rng, now);
            let mut out = vec![encode_execution(&ids.execution, &tick)];
            if include_orderbook && n % 5 == 0 {
                out.push(encode_orderbook(&ids.orderbook, &walk.book(&mut rng, now)));
            }
            out
        };
        for f in frames {
            dispatch(&f, &ids, &events, &mut stats, now).await;
        }
        n += 1;

        tokio::select! {
            _ = sleep(Duration::from_millis(interval_ms)) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!(ticks = stats.ticks, "mock feed stopped");
    stats
}
