/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : protocol.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/protocol.rs
// ===============================
//
// KIS real-time WebSocket wire format.
//
// Control frames are JSON:
//   {"header":{"tr_id":"PINGPONG","datetime":"20240105093001"}}
//   {"header":{"tr_id":"H0STCNT0","tr_key":"005930","encrypt":"N"},
//    "body":{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS"}}
//
// Data frames are text: flag|tr_id|count|payload
//   flag 0 = plain, 1 = encrypted (AES, only used by execution notices)
//   payload = count records, each a fixed number of '^'-separated fields.
//
// Field offsets below are the feed contract; do not reorder.
//
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{BookLevel, ExecutionTick, OrderBookSnapshot};

pub const FIELD_SEP: char = '^';
pub const FRAME_SEP: char = '|';
pub const PINGPONG_TR_ID: &str = "PINGPONG";

/// Width of one H0STCNT0 record.
pub const EXEC_RECORD_WIDTH: usize = 46;
/// Fewer fields than this cannot carry total ask/bid quantities.
pub const EXEC_MIN_FIELDS: usize = 40;

mod exec {
    pub const SYMBOL: usize = 0;
    pub const TIME: usize = 1;
    pub const PRICE: usize = 2;
    pub const CHANGE: usize = 4;
    pub const CHANGE_RATE: usize = 5;
    pub const OPEN: usize = 7;
    pub const HIGH: usize = 8;
    pub const LOW: usize = 9;
    pub const ASK1: usize = 10;
    pub const BID1: usize = 11;
    pub const VOLUME: usize = 12;
    pub const CUM_VOLUME: usize = 13;
    pub const CUM_AMOUNT: usize = 14;
    pub const STRENGTH: usize = 18;
    pub const HALT: usize = 35;
    pub const ASK1_QTY: usize = 36;
    pub const BID1_QTY: usize = 37;
    pub const TOTAL_ASK_QTY: usize = 38;
    pub const TOTAL_BID_QTY: usize = 39;
    pub const VI_REF_PRICE: usize = 45;
}

/// Width of one H0STASP0 record.
pub const BOOK_RECORD_WIDTH: usize = 59;
pub const BOOK_MIN_FIELDS: usize = 45;

mod book {
    pub const SYMBOL: usize = 0;
    pub const TIME: usize = 1;
    pub const ASK_PRICE: usize = 3;
    pub const BID_PRICE: usize = 13;
    pub const ASK_QTY: usize = 23;
    pub const BID_QTY: usize = 33;
    pub const TOTAL_ASK_QTY: usize = 43;
    pub const TOTAL_BID_QTY: usize = 44;
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("bad frame header: {0}")]
    Header(String),
    #[error("record too short for {tr_id}: {got} fields, need {need}")]
    TooShort { tr_id: String, got: usize, need: usize },
    #[error("bad field {index} ({value:?})")]
    Field { index: usize, value: String },
    #[error("bad control frame: {0}")]
    Json(String),
}

/// Which data channel a tr_id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel { Execution, OrderBook }

/// Maps configured tr_ids to channels.
#[derive(Debug, Clone)]
pub struct ChannelIds {
    pub execution: String,
    pub orderbook: String,
}

impl Default for ChannelIds {
    fn default() -> Self { Self { execution: "H0STCNT0".into(), orderbook: "H0STASP0".into() } }
}

impl ChannelIds {
    pub fn tr_id(&self, ch: Channel) -> &str {
        match ch {
            Channel::Execution => &self.execution,
            Channel::OrderBook => &self.orderbook,
        }
    }

    pub fn channel(&self, tr_id: &str) -> Option<Channel> {
        if tr_id == self.execution { Some(Channel::Execution) }
        else if tr_id == self.orderbook { Some(Channel::OrderBook) }
        else { None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeAck {
    pub tr_id: String,
    pub tr_key: String,
    pub ok: bool,
    pub msg_cd: String,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Keepalive; echo the raw text back.
    PingPong(String),
    SubscribeAck(SubscribeAck),
    Executions(Vec<ExecutionTick>),
    OrderBooks(Vec<OrderBookSnapshot>),
    /// Encrypted payload (flag 1); not supported.
    Encrypted { tr_id: String },
    /// Well-formed frame for a channel we do not decode.
    Other { tr_id: String },
}

// ---- Control messages (outbound) ----

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlHeader {
    pub approval_key: String,
    pub custtype: String,
    /// "1" register, "2" unregister
    pub tr_type: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlInput { pub tr_id: String, pub tr_key: String }

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlBody { pub input: ControlInput }

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlMessage { pub header: ControlHeader, pub body: ControlBody }

pub fn subscription_message(approval_key: &str, cust_type: &str, register: bool, tr_id: &str, tr_key: &str) -> String {
    let msg = ControlMessage {
        header: ControlHeader {
            approval_key: approval_key.to_string(),
            custtype: cust_type.to_string(),
            tr_type: if register { "1" } else { "2" }.to_string(),
            content_type: "utf-8".to_string(),
        },
        body: ControlBody { input: ControlInput { tr_id: tr_id.to_string(), tr_key: tr_key.to_string() } },
    };
    // struct berisi String saja -> serialisasi tidak bisa gagal
    serde_json::to_string(&msg).unwrap_or_default()
}

// ---- Inbound control frames ----

#[derive(Debug, Deserialize)]
struct InHeader {
    tr_id: Option<String>,
    tr_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InBody {
    rt_cd: Option<String>,
    msg_cd: Option<String>,
    msg1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InControl {
    header: InHeader,
    body: Option<InBody>,
}

fn decode_control(text: &str) -> Result<Frame, ProtocolError> {
    let ctl: InControl = serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;
    let tr_id = ctl.header.tr_id.unwrap_or_default();
    if tr_id == PINGPONG_TR_ID {
        return Ok(Frame::PingPong(text.to_string()));
    }
    let body = ctl.body.ok_or_else(|| ProtocolError::Json(format!("no body for {tr_id}")))?;
    Ok(Frame::SubscribeAck(SubscribeAck {
        tr_id,
        tr_key: ctl.header.tr_key.unwrap_or_default(),
        ok: body.rt_cd.as_deref() == Some("0"),
        msg_cd: body.msg_cd.unwrap_or_default(),
        msg: body.msg1.unwrap_or_default(),
    }))
}

// ---- Field helpers ----

fn field<'a>(f: &[&'a str], index: usize) -> &'a str {
    f.get(index).copied().unwrap_or("").trim()
}

fn kst_hhmmss(ts: DateTime<Utc>) -> String {
    (ts + chrono::Duration::seconds(KST_OFFSET_SECS as i64)).format("%H%M%S").to_string()
}

fn num(f: &[&str], index: usize) -> Result<f64, ProtocolError> {
    let raw = field(f, index);
    raw.parse::<f64>().map_err(|_| ProtocolError::Field { index, value: raw.to_string() })
}

/// Numeric field that may legitimately be blank.
fn num_or_zero(f: &[&str], index: usize) -> Result<f64, ProtocolError> {
    if field(f, index).is_empty() { Ok(0.0) } else { num(f, index) }
}

fn qty(f: &[&str], index: usize) -> Result<u64, ProtocolError> {
    let raw = field(f, index);
    if raw.is_empty() { return Ok(0); }
    raw.parse::<u64>().map_err(|_| ProtocolError::Field { index, value: raw.to_string() })
}

const KST_OFFSET_SECS: i32 = 9 * 3600;

/// HHMMSS in KST on the trading date of `received_at`; falls back to `received_at`.
fn trade_timestamp(hhmmss: &str, received_at: DateTime<Utc>) -> DateTime<Utc> {
    let tz = match FixedOffset::east_opt(KST_OFFSET_SECS) {
        Some(tz) => tz,
        None => return received_at,
    };
    let date = received_at.with_timezone(&tz).date_naive();
    NaiveTime::parse_from_str(hhmmss, "%H%M%S")
        .ok()
        .and_then(|t| tz.from_local_datetime(&date.and_time(t)).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(received_at)
}

// ---- Record decoders ----

pub fn decode_execution(f: &[&str], received_at: DateTime<Utc>) -> Result<ExecutionTick, ProtocolError> {
    if f.len() < EXEC_MIN_FIELDS {
        return Err(ProtocolError::TooShort { tr_id: "execution".into(), got: f.len(), need: EXEC_MIN_FIELDS });
    }
    let price = num(f, exec::PRICE)?;
    if price <= 0.0 {
        return Err(ProtocolError::Field { index: exec::PRICE, value: field(f, exec::PRICE).to_string() });
    }
    let vi_ref = match f.get(exec::VI_REF_PRICE).map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.parse::<f64>().ok().filter(|p| *p > 0.0),
        _ => None,
    };
    Ok(ExecutionTick {
        symbol: field(f, exec::SYMBOL).to_string(),
        timestamp: trade_timestamp(field(f, exec::TIME), received_at),
        price,
        change: num_or_zero(f, exec::CHANGE)?,
        change_rate: num_or_zero(f, exec::CHANGE_RATE)?,
        open: num_or_zero(f, exec::OPEN)?,
        high: num_or_zero(f, exec::HIGH)?,
        low: num_or_zero(f, exec::LOW)?,
        best_ask: num_or_zero(f, exec::ASK1)?,
        best_bid: num_or_zero(f, exec::BID1)?,
        volume: qty(f, exec::VOLUME)?,
        cumulative_volume: qty(f, exec::CUM_VOLUME)?,
        cumulative_amount: num_or_zero(f, exec::CUM_AMOUNT)?,
        strength: num_or_zero(f, exec::STRENGTH)?,
        halted: field(f, exec::HALT).eq_ignore_ascii_case("Y"),
        best_ask_qty: qty(f, exec::ASK1_QTY)?,
        best_bid_qty: qty(f, exec::BID1_QTY)?,
        total_ask_qty: qty(f, exec::TOTAL_ASK_QTY)?,
        total_bid_qty: qty(f, exec::TOTAL_BID_QTY)?,
        vi_reference_price: vi_ref,
    })
}

pub fn decode_orderbook(f: &[&str], received_at: DateTime<Utc>) -> Result<OrderBookSnapshot, ProtocolError> {
    if f.len() < BOOK_MIN_FIELDS {
        return Err(ProtocolError::TooShort { tr_id: "orderbook".into(), got: f.len(), need: BOOK_MIN_FIELDS });
    }
    let mut asks = [BookLevel::default(); 10];
    let mut bids = [BookLevel::default(); 10];
    for i in 0..10 {
        asks[i] = BookLevel { price: num_or_zero(f, book::ASK_PRICE + i)?, qty: qty(f, book::ASK_QTY + i)? };
        bids[i] = BookLevel { price: num_or_zero(f, book::BID_PRICE + i)?, qty: qty(f, book::BID_QTY + i)? };
    }
    Ok(OrderBookSnapshot {
        symbol: field(f, book::SYMBOL).to_string(),
        timestamp: trade_timestamp(field(f, book::TIME), received_at),
        asks,
        bids,
        total_ask_qty: qty(f, book::TOTAL_ASK_QTY)?,
        total_bid_qty: qty(f, book::TOTAL_BID_QTY)?,
    })
}

/// Splits a payload into `count` records. A single record may be shorter than
/// the full width (older feed versions); a multi-record payload must divide
/// evenly into `count` records of at least `min` fields each.
fn records<'a>(fields: &'a [&'a str], count: usize, min: usize, tr_id: &str)
    -> Result<Vec<&'a [&'a str]>, ProtocolError> {
    if count <= 1 {
        return Ok(vec![fields]);
    }
    let width = fields.len() / count;
    if fields.len() % count != 0 || width < min {
        return Err(ProtocolError::TooShort { tr_id: tr_id.to_string(), got: fields.len(), need: count * min });
    }
    Ok(fields.chunks(width).collect())
}

/// Decodes one text frame. Never panics; short or malformed frames are errors
/// the caller counts and drops.
pub fn decode_frame(text: &str, ids: &ChannelIds, received_at: DateTime<Utc>) -> Result<Frame, ProtocolError> {
    let text = text.trim();
    if text.is_empty() { return Err(ProtocolError::Empty); }
    if text.starts_with('{') { return decode_control(text); }

    let mut parts = text.splitn(4, FRAME_SEP);
    let flag = parts.next().unwrap_or("");
    let tr_id = parts.next().ok_or_else(|| ProtocolError::Header(text.chars().take(32).collect()))?;
    let count_raw = parts.next().ok_or_else(|| ProtocolError::Header(text.chars().take(32).collect()))?;
    let payload = parts.next().ok_or_else(|| ProtocolError::Header(text.chars().take(32).collect()))?;
    let count: usize = count_raw.trim().parse().map_err(|_| ProtocolError::Header(format!("count {count_raw:?}")))?;

    match flag {
        "0" => {}
        "1" => return Ok(Frame::Encrypted { tr_id: tr_id.to_string() }),
        other => return Err(ProtocolError::Header(format!("flag {other:?}"))),
    }

    let fields: Vec<&str> = payload.split(FIELD_SEP).collect();
    match ids.channel(tr_id) {
        Some(Channel::Execution) => {
            let ticks = records(&fields, count, EXEC_MIN_FIELDS, tr_id)?
                .into_iter()
                .map(|r| decode_execution(r, received_at))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Frame::Executions(ticks))
        }
        Some(Channel::OrderBook) => {
            let books = records(&fields, count, BOOK_MIN_FIELDS, tr_id)?
                .into_iter()
                .map(|r| decode_orderbook(r, received_at))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Frame::OrderBooks(books))
        }
        None => Ok(Frame::Other { tr_id: tr_id.to_string() }),
    }
}

// ---- Encoders (mock feed & tests) ----

pub fn encode_execution(tr_id: &str, t: &ExecutionTick) -> String {
    let mut f = vec![String::new(); EXEC_RECORD_WIDTH];
    f[exec::SYMBOL] = t.symbol.clone();
    f[exec::TIME] = kst_hhmmss(t.timestamp);
    f[exec::PRICE] = format!("{}", t.price);
    f[exec::CHANGE] = format!("{}", t.change);
    f[exec::CHANGE_RATE] = format!("{:.2}", t.change_rate);
    f[exec::OPEN] = format!("{}", t.open);
    f[exec::HIGH] = format!("{}", t.high);
    f[exec::LOW] = format!("{}", t.low);
    f[exec::ASK1] = format!("{}", t.best_ask);
    f[exec::BID1] = format!("{}", t.best_bid);
    f[exec::VOLUME] = t.volume.to_string();
    f[exec::CUM_VOLUME] = t.cumulative_volume.to_string();
    f[exec::CUM_AMOUNT] = format!("{}", t.cumulative_amount);
    f[exec::STRENGTH] = format!("{:.2}", t.strength);
    f[exec::HALT] = if t.halted { "Y" } else { "N" }.to_string();
    f[exec::ASK1_QTY] = t.best_ask_qty.to_string();
    f[exec::BID1_QTY] = t.best_bid_qty.to_string();
    f[exec::TOTAL_ASK_QTY] = t.total_ask_qty.to_string();
    f[exec::TOTAL_BID_QTY] = t.total_bid_qty.to_string();
    f[exec::VI_REF_PRICE] = t.vi_reference_price.map(|p| format!("{p}")).unwrap_or_default();
    format!("0|{tr_id}|001|{}", f.join("^"))
}

pub fn encode_orderbook(tr_id: &str, b: &OrderBookSnapshot) -> String {
    let mut f = vec!["0".to_string(); BOOK_RECORD_WIDTH];
    f[book::SYMBOL] = b.symbol.clone();
    f[book::TIME] = kst_hhmmss(b.timestamp);
    for i in 0..10 {
        f[book::ASK_PRICE + i] = format!("{}", b.asks[i].price);
        f[book::BID_PRICE + i] = format!("{}", b.bids[i].price);
        f[book::ASK_QTY + i] = b.asks[i].qty.to_string();
        f[book::BID_QTY + i] = b.bids[i].qty.to_string();
    }
    f[book::TOTAL_ASK_QTY] = b.total_ask_qty.to_string();
    f[book::TOTAL_BID_QTY] = b.total_bid_qty.to_string();
    format!("0|{tr_id}|001|{}", f.join("^"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        // 2024-01-05 00:30:00 UTC = 09:30:00 KST
        DateTime::<Utc>::from_timestamp(1_704_414_600, 0).unwrap()
    }

    // Real H0STCNT0 sample (005930), 46 fields
    const EXEC_SAMPLE: &str = "0|H0STCNT0|001|005930^093001^71000^2^500^0.71^70950.12^70600^71200^70500^71000^70900^15^3250123^230456789000^12000^15000^3000^125.30^1200000^1500000^1^0.45^55.20^090000^5^400^091500^5^-200^090130^2^500^20240105^20^N^1500^2300^150000^300000^0.05^2800000^116.07^0^^70000";

    fn sample_book(total_ask: u64, total_bid: u64) -> String {
        let mut f = vec!["0".to_string(); BOOK_RECORD_WIDTH];
        f[0] = "005930".into();
        f[1] = "093001".into();
        for i in 0..10 {
            f[3 + i] = (71000 + 100 * i as i64).to_string();
            f[13 + i] = (70900 - 100 * i as i64).to_string();
            f[23 + i] = (1000 + i).to_string();
            f[33 + i] = (2000 + i).to_string();
        }
        f[43] = total_ask.to_string();
        f[44] = total_bid.to_string();
        format!("0|H0STASP0|001|{}", f.join("^"))
    }

    #[test]
    fn test_decode_execution_sample() {
        let ids = ChannelIds::default();
        let frame = decode_frame(EXEC_SAMPLE, &ids, now()).unwrap();
        let ticks = match frame { Frame::Executions(t) => t, other => panic!("unexpected {other:?}") };
        assert_eq!(ticks.len(), 1);
        let t = &ticks[0];
        assert_eq!(t.symbol, "005930");
        assert_eq!(t.price, 71000.0);
        assert_eq!(t.change, 500.0);
        assert_eq!(t.best_ask, 71000.0);
        assert_eq!(t.best_bid, 70900.0);
        assert_eq!(t.volume, 15);
        assert_eq!(t.cumulative_volume, 3_250_123);
        assert_eq!(t.strength, 125.30);
        assert!(!t.halted);
        assert_eq!(t.total_ask_qty, 150_000);
        assert_eq!(t.total_bid_qty, 300_000);
        assert_eq!(t.vi_reference_price, Some(70000.0));
        // 09:30:01 KST
        assert_eq!(t.timestamp, now() + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_short_execution_frame_is_error() {
        let ids = ChannelIds::default();
        let text = "0|H0STCNT0|001|005930^093001^71000^2^500";
        let err = decode_frame(text, &ids, now()).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { got: 5, need: EXEC_MIN_FIELDS, .. }));
    }

    #[test]
    fn test_garbage_never_panics() {
        let ids = ChannelIds::default();
        for text in ["", "|", "0|H0STCNT0", "0|H0STCNT0|x|a^b", "9|H0STCNT0|001|a", "{not json", "0|H0STASP0|001|^^^"] {
            assert!(decode_frame(text, &ids, now()).is_err(), "expected error for {text:?}");
        }
    }

    #[test]
    fn test_multi_record_payload() {
        let ids = ChannelIds::default();
        let payload = EXEC_SAMPLE.splitn(4, '|').nth(3).unwrap();
        let text = format!("0|H0STCNT0|002|{payload}^{payload}");
        match decode_frame(&text, &ids, now()).unwrap() {
            Frame::Executions(t) => assert_eq!(t.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_multi_record_without_optional_tail() {
        // dua record 45 field (tanpa VI reference price)
        let ids = ChannelIds::default();
        let payload = EXEC_SAMPLE.splitn(4, '|').nth(3).unwrap();
        let first: Vec<&str> = payload.split('^').take(45).collect();
        let mut second = first.clone();
        second[0] = "000660";
        let text = format!("0|H0STCNT0|002|{}^{}", first.join("^"), second.join("^"));
        let ticks = match decode_frame(&text, &ids, now()).unwrap() {
            Frame::Executions(t) => t,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].symbol, "005930");
        assert_eq!(ticks[0].vi_reference_price, None);
        assert_eq!(ticks[1].symbol, "000660");
        assert_eq!(ticks[1].price, 71000.0);
    }

    #[test]
    fn test_multi_record_uneven_payload_is_error() {
        let ids = ChannelIds::default();
        let payload = EXEC_SAMPLE.splitn(4, '|').nth(3).unwrap();
        let short: Vec<&str> = payload.split('^').take(41).collect();
        // 46 + 41 field tidak habis dibagi 2 record
        let text = format!("0|H0STCNT0|002|{payload}^{}", short.join("^"));
        let err = decode_frame(&text, &ids, now()).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { got: 87, .. }), "{err:?}");

        // count 3 tetapi hanya dua record
        let text = format!("0|H0STCNT0|003|{payload}^{payload}");
        assert!(matches!(decode_frame(&text, &ids, now()), Err(ProtocolError::TooShort { .. })));
    }

    #[test]
    fn test_decode_orderbook() {
        let ids = ChannelIds::default();
        let frame = decode_frame(&sample_book(500_000, 120_000), &ids, now()).unwrap();
        let books = match frame { Frame::OrderBooks(b) => b, other => panic!("unexpected {other:?}") };
        let b = &books[0];
        assert_eq!(b.asks[0], BookLevel { price: 71000.0, qty: 1000 });
        assert_eq!(b.asks[9], BookLevel { price: 71900.0, qty: 1009 });
        assert_eq!(b.bids[9], BookLevel { price: 70000.0, qty: 2009 });
        assert_eq!(b.total_ask_qty, 500_000);
        assert_eq!(b.total_bid_qty, 120_000);
    }

    #[test]
    fn test_pingpong_echoed_verbatim() {
        let ids = ChannelIds::default();
        let raw = r#"{"header":{"tr_id":"PINGPONG","datetime":"20240105093001"}}"#;
        assert_eq!(decode_frame(raw, &ids, now()).unwrap(), Frame::PingPong(raw.to_string()));
    }

    #[test]
    fn test_subscribe_ack_failure_code() {
        let ids = ChannelIds::default();
        let raw = r#"{"header":{"tr_id":"H0STCNT0","tr_key":"005930","encrypt":"N"},"body":{"rt_cd":"1","msg_cd":"OPSP0011","msg1":"invalid approval"}}"#;
        match decode_frame(raw, &ids, now()).unwrap() {
            Frame::SubscribeAck(ack) => {
                assert!(!ack.ok);
                assert_eq!(ack.tr_key, "005930");
                assert_eq!(ack.msg_cd, "OPSP0011");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_encrypted_frame_flagged() {
        let ids = ChannelIds::default();
        let frame = decode_frame("1|H0STCNI0|001|Zm9vYmFy", &ids, now()).unwrap();
        assert_eq!(frame, Frame::Encrypted { tr_id: "H0STCNI0".into() });
    }

    #[test]
    fn test_subscription_message_shape() {
        let raw = subscription_message("KEY", "P", true, "H0STCNT0", "005930");
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["header"]["approval_key"], "KEY");
        assert_eq!(v["header"]["custtype"], "P");
        assert_eq!(v["header"]["tr_type"], "1");
        assert_eq!(v["header"]["content-type"], "utf-8");
        assert_eq!(v["body"]["input"]["tr_id"], "H0STCNT0");
        assert_eq!(v["body"]["input"]["tr_key"], "005930");
    }

    #[test]
    fn test_encode_decode_execution_preserves_fields() {
        let ids = ChannelIds::default();
        let tick = match decode_frame(EXEC_SAMPLE, &ids, now()).unwrap() {
            Frame::Executions(mut t) => t.remove(0),
            other => panic!("unexpected {other:?}"),
        };
        let text = encode_execution("H0STCNT0", &tick);
        match decode_frame(&text, &ids, now()).unwrap() {
            Frame::Executions(t) => assert_eq!(t[0], tick),
            other => panic!("unexpected {other:?}"),
        }
    }
}
