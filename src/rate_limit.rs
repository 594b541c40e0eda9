/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : rate_limit.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/rate_limit.rs
// ===============================
//
// Token bucket untuk membatasi laju order keluar (KIS REST membatasi
// jumlah request per detik per app key).
//
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("rate limit: no token within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::new_at(rate, capacity, Instant::now())
    }

    pub fn new_at(rate: f64, capacity: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self { rate: rate.max(0.0), capacity, tokens: capacity, last_update: now }
    }

    pub fn rate(&self) -> f64 { self.rate }
    pub fn capacity(&self) -> f64 { self.capacity }

    fn refill(&mut self, now: Instant) {
        // Instant mundur (clock lain) diabaikan
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_update = now;
        }
    }

    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn available(&mut self) -> f64 { self.available_at(Instant::now()) }

    pub fn try_consume_at(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn try_consume(&mut self, n: f64) -> bool { self.try_consume_at(n, Instant::now()) }

    /// Time until `n` tokens are available; `None` if never (rate 0 or n > capacity).
    pub fn time_until_at(&mut self, n: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= n { return Some(Duration::ZERO); }
        if self.rate <= 0.0 || n > self.capacity { return None; }
        Some(Duration::from_secs_f64((n - self.tokens) / self.rate))
    }

    /// Waits for one token, giving up after `timeout`.
    pub async fn acquire(&mut self, timeout: Duration) -> Result<(), RateLimitError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if self.try_consume_at(1.0, now) { return Ok(()); }
            let wait = match self.time_until_at(1.0, now) {
                Some(w) => w,
                None => return Err(RateLimitError::Timeout(timeout)),
            };
            if now + wait > deadline { return Err(RateLimitError::Timeout(timeout)); }
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
