/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : config.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/config.rs
// ===============================
use std::env;
use std::str::FromStr;

use ahash::AHashSet;
use clap::Parser;
use thiserror::Error;

use crate::domain::OrderType;

/// Sumber market data / akun trading
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    /// 모의투자 (virtual account)
    KisVirtual,
    /// 실전투자
    KisReal,
}

impl MarketMode {
    pub fn parse(s: &str) -> Option<MarketMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(MarketMode::Mock),
            "kis_virtual" | "virtual" | "paper" => Some(MarketMode::KisVirtual),
            "kis_real" | "real" | "live" => Some(MarketMode::KisReal),
            _ => None,
        }
    }

    pub fn from_env(key: &str, default_mode: MarketMode) -> MarketMode {
        env::var(key).ok().and_then(|v| Self::parse(&v)).unwrap_or(default_mode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock => "mock",
            MarketMode::KisVirtual => "kis_virtual",
            MarketMode::KisReal => "kis_real",
        }
    }

    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock | MarketMode::KisVirtual => "ws://ops.koreainvestment.com:31000",
            MarketMode::KisReal => "ws://ops.koreainvestment.com:21000",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            MarketMode::Mock | MarketMode::KisVirtual => "https://openapivts.koreainvestment.com:29443",
            MarketMode::KisReal => "https://openapi.koreainvestment.com:9443",
        }
    }
}

/// Command line overrides; everything else comes from the environment.
#[derive(Parser, Debug, Default)]
#[command(name = "kis_scalper", about = "Real-time scalping engine for KRX equities")]
pub struct Cli {
    /// Comma separated symbols, e.g. 005930,000660
    #[arg(long)]
    pub symbols: Option<String>,
    /// mock | kis_virtual | kis_real
    #[arg(long)]
    pub feed_mode: Option<String>,
    /// Simulate fills instead of sending orders
    #[arg(long)]
    pub dry_run: bool,
    /// Alternative .env file
    #[arg(long)]
    pub env_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<String>,
    pub include_orderbook: bool,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,

    pub feed_mode: MarketMode,
    pub venue_mode: MarketMode,
    pub symbol_queue: usize,
    /// Mock feed: delay between generated ticks
    pub mock_interval_ms: u64,
}

#[derive(Clone, Debug)]
pub struct FeedCfg {
    pub ws_url: String,
    pub rest_url: String,
    pub app_key: String,
    pub app_secret: String,
    /// "P" personal, "B" corporate
    pub cust_type: String,
    pub execution_tr_id: String,
    pub orderbook_tr_id: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub http_timeout_ms: u64,
}

/// Order venue: paper (in-process) or the KIS REST API.
#[derive(Clone, Debug)]
pub struct BrokerCfg {
    pub mode: MarketMode,
    pub rest_url: String,
    pub app_key: String,
    pub app_secret: String,
    pub cust_type: String,
    /// 종합계좌번호 (first 8 digits of the account)
    pub cano: String,
    /// 계좌상품코드 (last 2 digits)
    pub acnt_prdt_cd: String,
    pub http_timeout_ms: u64,
    pub paper_latency_ms: u64,
    pub paper_cash: f64,
    /// Cash balance refresh period (live only)
    pub balance_refresh_secs: u64,
}

impl BrokerCfg {
    pub fn is_virtual(&self) -> bool { self.mode != MarketMode::KisReal }
}

/// "12345678-01" atau "1234567801" -> ("12345678", "01")
pub fn split_account(raw: &str) -> Option<(String, String)> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 10 { return None; }
    Some((digits[..8].to_string(), digits[8..].to_string()))
}

#[derive(Clone, Debug)]
pub struct SignalCfg {
    pub tick_size: usize,
    pub max_candles: usize,
    pub min_volume: u64,
    pub min_amount: f64,
    pub imbalance_threshold: f64,
    pub momentum_window_secs: i64,
    pub momentum_threshold: f64,
    pub strength_floor: f64,
    pub strength_history: usize,
    pub ma_period: usize,
    pub ma_lookback: usize,
    pub ma_tolerance_pct: f64,
    pub cooldown_secs: i64,
    pub vi_silence_secs: i64,
}

#[derive(Clone, Debug)]
pub struct TradingCfg {
    pub dry_run: bool,
    pub investment_per_symbol: f64,
    pub max_positions: usize,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_stop_pct: f64,
    pub max_holding_secs: i64,
    pub order_cooldown_secs: i64,
    pub stock_cooldown_secs: i64,
    pub order_type: OrderType,
    pub rate_per_sec: f64,
    pub rate_capacity: f64,
    pub token_timeout_ms: u64,
    pub order_timeout_ms: u64,
    pub fill_timeout_secs: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be negative")]
    NotNegative(&'static str),
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("no symbols configured")]
    NoSymbols,
    #[error("KIS credentials (KIS_APP_KEY / KIS_APP_SECRET) are required for {0}")]
    MissingCredentials(&'static str),
    #[error("KIS_ACCOUNT must be 10 digits (e.g. 12345678-01)")]
    InvalidAccount,
}

impl TradingCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_loss_pct >= 0.0 { return Err(ConfigError::NotNegative("STOP_LOSS_PCT")); }
        if self.take_profit_pct <= 0.0 { return Err(ConfigError::NotPositive("TAKE_PROFIT_PCT")); }
        if self.trailing_stop_pct <= 0.0 { return Err(ConfigError::NotPositive("TRAILING_STOP_PCT")); }
        if self.investment_per_symbol <= 0.0 { return Err(ConfigError::NotPositive("INVESTMENT_PER_SYMBOL")); }
        if self.max_positions == 0 { return Err(ConfigError::NotPositive("MAX_POSITIONS")); }
        if self.rate_per_sec <= 0.0 { return Err(ConfigError::NotPositive("ORDER_RATE_PER_SEC")); }
        if self.rate_capacity < 1.0 { return Err(ConfigError::NotPositive("ORDER_RATE_CAPACITY")); }
        Ok(())
    }
}

impl SignalCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_size == 0 { return Err(ConfigError::NotPositive("TICK_SIZE")); }
        if self.max_candles == 0 { return Err(ConfigError::NotPositive("MAX_CANDLES")); }
        if self.ma_period == 0 { return Err(ConfigError::NotPositive("MA_PERIOD")); }
        if self.imbalance_threshold <= 0.0 { return Err(ConfigError::NotPositive("IMBALANCE_THRESHOLD")); }
        if self.strength_history < 2 { return Err(ConfigError::NotPositive("STRENGTH_HISTORY")); }
        Ok(())
    }
}

impl Default for SignalCfg {
    fn default() -> Self {
        Self {
            tick_size: 30,
            max_candles: 200,
            min_volume: 10,
            min_amount: 1_000_000.0,
            imbalance_threshold: 2.0,
            momentum_window_secs: 30,
            momentum_threshold: 10.0,
            strength_floor: 100.0,
            strength_history: 300,
            ma_period: 20,
            ma_lookback: 5,
            ma_tolerance_pct: 0.5,
            cooldown_secs: 60,
            vi_silence_secs: 5,
        }
    }
}

impl Default for TradingCfg {
    fn default() -> Self {
        Self {
            dry_run: true,
            investment_per_symbol: 1_000_000.0,
            max_positions: 3,
            stop_loss_pct: -1.0,
            take_profit_pct: 1.5,
            trailing_stop_pct: 0.5,
            max_holding_secs: 600,
            order_cooldown_secs: 3,
            stock_cooldown_secs: 300,
            order_type: OrderType::Limit,
            rate_per_sec: 2.0,
            rate_capacity: 2.0,
            token_timeout_ms: 2_000,
            order_timeout_ms: 5_000,
            fill_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub args: Args,
    pub feed: FeedCfg,
    pub broker: BrokerCfg,
    pub signal: SignalCfg,
    pub trading: TradingCfg,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => true,
        "0" | "false" | "no" | "n" => false,
        _ => default,
    }
}

/// Comma separated symbols, upper-cased, duplicates dropped (first one wins).
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut seen = AHashSet::new();
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .filter(|x| seen.insert(x.clone()))
        .collect()
}

pub fn load(cli: &Cli) -> Result<AppConfig, ConfigError> {
    // Pastikan .env dibaca (agar KIS_APP_KEY, SYMBOLS, dll ter-load)
    match &cli.env_file {
        Some(path) => { let _ = dotenvy::from_path(path); }
        None => { let _ = dotenvy::dotenv(); }
    }

    // ===== Basic =====
    // Multi-symbol: SYMBOLS=005930,000660
    let raw_symbols = cli.symbols.clone()
        .or_else(|| env::var("SYMBOLS").ok())
        .unwrap_or_else(|| "005930".to_string());
    let symbols = parse_symbols(&raw_symbols);
    if symbols.is_empty() { return Err(ConfigError::NoSymbols); }

    let feed_mode = cli.feed_mode.as_deref()
        .and_then(MarketMode::parse)
        .unwrap_or_else(|| MarketMode::from_env("FEED_MODE", MarketMode::Mock));
    let venue_mode = MarketMode::from_env("VENUE_MODE", MarketMode::Mock);

    let args = Args {
        symbols,
        include_orderbook: env_bool("INCLUDE_ORDERBOOK", true),
        record_file: env::var("RECORD_FILE").ok(),
        metrics_port: env_or("METRICS_PORT", 9898),
        feed_mode: feed_mode.clone(),
        venue_mode: venue_mode.clone(),
        symbol_queue: env_or("SYMBOL_QUEUE", 1024),
        mock_interval_ms: env_or("MOCK_INTERVAL_MS", 20),
    };

    // ===== Feed =====
    let feed = FeedCfg {
        ws_url: env::var("KIS_WS_URL").unwrap_or_else(|_| feed_mode.default_ws_url().to_string()),
        rest_url: env::var("KIS_REST_URL").unwrap_or_else(|_| feed_mode.default_rest_url().to_string()),
        app_key: env::var("KIS_APP_KEY").unwrap_or_default(),
        app_secret: env::var("KIS_APP_SECRET").unwrap_or_default(),
        cust_type: env::var("KIS_CUST_TYPE").unwrap_or_else(|_| "P".to_string()),
        execution_tr_id: env::var("KIS_EXEC_TR_ID").unwrap_or_else(|_| "H0STCNT0".to_string()),
        orderbook_tr_id: env::var("KIS_BOOK_TR_ID").unwrap_or_else(|_| "H0STASP0".to_string()),
        max_reconnect_attempts: env_or("WS_MAX_RECONNECT", 5),
        reconnect_delay_ms: env_or("WS_RECONNECT_DELAY_MS", 5_000),
        http_timeout_ms: env_or("HTTP_TIMEOUT_MS", 10_000),
    };
    if feed_mode != MarketMode::Mock && (feed.app_key.is_empty() || feed.app_secret.is_empty()) {
        return Err(ConfigError::MissingCredentials("live feed"));
    }

    // ===== Signal =====
    let d = SignalCfg::default();
    let signal = SignalCfg {
        tick_size: env_or("TICK_SIZE", d.tick_size),
        max_candles: env_or("MAX_CANDLES", d.max_candles),
        min_volume: env_or("MIN_TICK_VOLUME", d.min_volume),
        min_amount: env_or("MIN_TICK_AMOUNT", d.min_amount),
        imbalance_threshold: env_or("IMBALANCE_THRESHOLD", d.imbalance_threshold),
        momentum_window_secs: env_or("MOMENTUM_WINDOW_SECS", d.momentum_window_secs),
        momentum_threshold: env_or("MOMENTUM_THRESHOLD", d.momentum_threshold),
        strength_floor: env_or("STRENGTH_FLOOR", d.strength_floor),
        strength_history: env_or("STRENGTH_HISTORY", d.strength_history),
        ma_period: env_or("MA_PERIOD", d.ma_period),
        ma_lookback: env_or("MA_LOOKBACK", d.ma_lookback),
        ma_tolerance_pct: env_or("MA_TOLERANCE_PCT", d.ma_tolerance_pct),
        cooldown_secs: env_or("SIGNAL_COOLDOWN_SECS", d.cooldown_secs),
        vi_silence_secs: env_or("VI_SILENCE_SECS", d.vi_silence_secs),
    };
    signal.validate()?;

    // ===== Trading =====
    let t = TradingCfg::default();
    let order_type = match env::var("ORDER_TYPE").unwrap_or_default().to_ascii_lowercase().as_str() {
        "market" | "01" => OrderType::Market,
        _ => OrderType::Limit,
    };
    let trading = TradingCfg {
        dry_run: cli.dry_run || env_bool("DRY_RUN", t.dry_run),
        investment_per_symbol: env_or("INVESTMENT_PER_SYMBOL", t.investment_per_symbol),
        max_positions: env_or("MAX_POSITIONS", t.max_positions),
        stop_loss_pct: env_or("STOP_LOSS_PCT", t.stop_loss_pct),
        take_profit_pct: env_or("TAKE_PROFIT_PCT", t.take_profit_pct),
        trailing_stop_pct: env_or("TRAILING_STOP_PCT", t.trailing_stop_pct),
        max_holding_secs: env_or("MAX_HOLDING_SECS", t.max_holding_secs),
        order_cooldown_secs: env_or("ORDER_COOLDOWN_SECS", t.order_cooldown_secs),
        stock_cooldown_secs: env_or("STOCK_COOLDOWN_SECS", t.stock_cooldown_secs),
        order_type,
        rate_per_sec: env_or("ORDER_RATE_PER_SEC", t.rate_per_sec),
        rate_capacity: env_or("ORDER_RATE_CAPACITY", t.rate_capacity),
        token_timeout_ms: env_or("TOKEN_TIMEOUT_MS", t.token_timeout_ms),
        order_timeout_ms: env_or("ORDER_TIMEOUT_MS", t.order_timeout_ms),
        fill_timeout_secs: env_or("FILL_TIMEOUT_SECS", t.fill_timeout_secs),
    };
    trading.validate()?;

    // ===== Broker =====
    let (cano, acnt_prdt_cd) = match env::var("KIS_ACCOUNT") {
        Ok(raw) => split_account(&raw).ok_or(ConfigError::InvalidAccount)?,
        Err(_) => (String::new(), String::new()),
    };
    let broker = BrokerCfg {
        mode: venue_mode.clone(),
        rest_url: env::var("KIS_REST_URL").unwrap_or_else(|_| venue_mode.default_rest_url().to_string()),
        app_key: feed.app_key.clone(),
        app_secret: feed.app_secret.clone(),
        cust_type: feed.cust_type.clone(),
        cano,
        acnt_prdt_cd,
        http_timeout_ms: feed.http_timeout_ms,
        paper_latency_ms: env_or("PAPER_LATENCY_MS", 50),
        paper_cash: env_or("PAPER_CASH", 10_000_000.0),
        balance_refresh_secs: env_or("BALANCE_REFRESH_SECS", 60),
    };
    if !trading.dry_run && venue_mode != MarketMode::Mock {
        if broker.app_key.is_empty() || broker.app_secret.is_empty() {
            return Err(ConfigError::MissingCredentials("live orders"));
        }
        if broker.cano.is_empty() {
            return Err(ConfigError::InvalidAccount);
        }
    }

    Ok(AppConfig { args, feed, broker, signal, trading })
}
