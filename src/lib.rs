/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : lib.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
pub mod domain;
pub mod config;
pub mod metrics;
pub mod recorder;
pub mod protocol;     // KIS wire format (decode/encode)
pub mod feed;         // WebSocket client + mock generator
pub mod candle;
pub mod signal;
pub mod rate_limit;
pub mod risk;
pub mod positions;
pub mod engine;
pub mod gateway;      // Broker trait + paper venue
pub mod gateway_kis;  // KIS REST order API
pub mod posttrade;
