/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : gateway_kis.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// ===============================
// src/gateway_kis.rs
// ===============================
//
// KIS Open API (REST) untuk order saham domestik:
// - access token OAuth (/oauth2/tokenP), di-cache sampai hampir expired
// - order-cash (beli/jual), order-rvsecncl (batal), inquire-balance
// - akun virtual (모의투자) memakai tr_id berawalan V
//
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::config::BrokerCfg;
use crate::domain::Side;
use crate::gateway::{AccountBalance, Broker, Holding, OrderAck};

const PATH_TOKEN: &str = "/oauth2/tokenP";
const PATH_ORDER: &str = "/uapi/domestic-stock/v1/trading/order-cash";
const PATH_CANCEL: &str = "/uapi/domestic-stock/v1/trading/order-rvsecncl";
const PATH_BALANCE: &str = "/uapi/domestic-stock/v1/trading/inquire-balance";

// tr_id akun real; akun virtual mengganti huruf pertama dengan 'V'
const TR_BUY: &str = "TTTC0802U";
const TR_SELL: &str = "TTTC0801U";
const TR_CANCEL: &str = "TTTC0803U";
const TR_BALANCE: &str = "TTTC8434R";

/// Refresh the token this long before it expires.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResp {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct KisResp<T> {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    output: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
struct OrderOutput {
    krx_fwdg_ord_orgno: String,
    odno: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResp {
    rt_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output1: Vec<HoldingRow>,
    #[serde(default)]
    output2: Vec<SummaryRow>,
}

#[derive(Debug, Deserialize)]
struct HoldingRow {
    pdno: String,
    hldg_qty: String,
    pchs_avg_pric: String,
}

#[derive(Debug, Deserialize)]
struct SummaryRow {
    dnca_tot_amt: String,
    #[serde(default)]
    tot_evlu_amt: String,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

fn num(s: &str) -> f64 { s.trim().parse().unwrap_or(0.0) }

pub struct KisBroker {
    cfg: BrokerCfg,
    http: reqwest::Client,
    token: AsyncMutex<Option<AccessToken>>,
    // ODNO -> KRX_FWDG_ORD_ORGNO (dibutuhkan untuk cancel)
    org_nos: Mutex<AHashMap<String, String>>,
}

impl KisBroker {
    pub fn new(cfg: BrokerCfg) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .context("build http client")?;
        Ok(Self { cfg, http, token: AsyncMutex::new(None), org_nos: Mutex::new(AHashMap::new()) })
    }

    fn tr_id(&self, real: &str) -> String {
        if self.cfg.is_virtual() { format!("V{}", &real[1..]) } else { real.to_string() }
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.cfg.rest_url.trim_end_matches('/'), path) }

    async fn access_token(&self) -> Result<String> {
        let mut slot = self.token.lock().await;
        if let Some(t) = slot.as_ref() {
            if Instant::now() + TOKEN_SLACK < t.expires_at {
                return Ok(t.value.clone());
            }
        }

        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.cfg.app_key,
            "appsecret": self.cfg.app_secret,
        });
        let rsp = self.http.post(self.url(PATH_TOKEN)).json(&body).send().await.context("token request")?;
        let status = rsp.status();
        if !status.is_success() {
            let text = rsp.text().await.unwrap_or_default();
            bail!("token request failed: {status} {text}");
        }
        let t: TokenResp = rsp.json().await.context("token response")?;
        let ttl = if t.expires_in > 0 { t.expires_in } else { 86_400 };
        info!(ttl_secs = ttl, "kis access token issued");
        let value = t.access_token.clone();
        *slot = Some(AccessToken { value: t.access_token, expires_at: Instant::now() + Duration::from_secs(ttl) });
        Ok(value)
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str, tr_id: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("content-type", "application/json; charset=utf-8")
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.cfg.app_key)
            .header("appsecret", &self.cfg.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", &self.cfg.cust_type)
    }

    async fn post_order(&self, path: &str, tr_id: &str, body: serde_json::Value) -> Result<OrderOutput> {
        let token = self.access_token().await?;
        let rsp = self
            .request(reqwest::Method::POST, path, &token, tr_id)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{tr_id} request"))?;
        let status = rsp.status();
        if !status.is_success() {
            let text = rsp.text().await.unwrap_or_default();
            bail!("{tr_id} http {status}: {text}");
        }
        let r: KisResp<OrderOutput> = rsp.json().await.with_context(|| format!("{tr_id} response"))?;
        if r.rt_cd != "0" {
            bail!("{tr_id} rejected [{}] {}", r.msg_cd, r.msg1.trim());
        }
        r.output.ok_or_else(|| anyhow!("{tr_id}: missing output"))
    }
}

#[async_trait]
impl Broker for KisBroker {
    async fn place_order(&self, symbol: &str, side: Side, qty: i64, price: f64, order_type_code: &str)
        -> Result<OrderAck> {
        let tr_id = self.tr_id(match side { Side::Buy => TR_BUY, Side::Sell => TR_SELL });
        // market order: harga wajib "0"
        let unit_price = if order_type_code == "01" { "0".to_string() } else { format!("{}", price.round() as i64) };
        let body = json!({
            "CANO": self.cfg.cano,
            "ACNT_PRDT_CD": self.cfg.acnt_prdt_cd,
            "PDNO": symbol,
            "ORD_DVSN": order_type_code,
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": unit_price,
        });
        let out = self.post_order(PATH_ORDER, &tr_id, body).await?;
        debug!(%symbol, side = side.as_str(), qty, odno = %out.odno, orgno = %out.krx_fwdg_ord_orgno, "kis order accepted");
        if let Ok(mut m) = self.org_nos.lock() {
            m.insert(out.odno.clone(), out.krx_fwdg_ord_orgno);
        }
        Ok(OrderAck { order_no: out.odno, accepted_at: Utc::now() })
    }

    async fn cancel_order(&self, symbol: &str, order_no: &str, _qty: i64) -> Result<()> {
        let org_no = self
            .org_nos
            .lock()
            .ok()
            .and_then(|m| m.get(order_no).cloned())
            .ok_or_else(|| anyhow!("unknown order {order_no} for {symbol}"))?;
        let tr_id = self.tr_id(TR_CANCEL);
        let body = json!({
            "CANO": self.cfg.cano,
            "ACNT_PRDT_CD": self.cfg.acnt_prdt_cd,
            "KRX_FWDG_ORD_ORGNO": org_no,
            "ORGN_ODNO": order_no,
            "ORD_DVSN": "00",
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": "0",
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });
        self.post_order(PATH_CANCEL, &tr_id, body).await?;
        if let Ok(mut m) = self.org_nos.lock() {
            m.remove(order_no);
        }
        Ok(())
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        let token = self.access_token().await?;
        let tr_id = self.tr_id(TR_BALANCE);
        let query = [
            ("CANO", self.cfg.cano.as_str()),
            ("ACNT_PRDT_CD", self.cfg.acnt_prdt_cd.as_str()),
            ("AFHR_FLPR_YN", "N"),
            ("OFL_YN", ""),
            ("INQR_DVSN", "02"),
            ("UNPR_DVSN", "01"),
            ("FUND_STTL_ICLD_YN", "N"),
            ("FNCG_AMT_AUTO_RDPT_YN", "N"),
            ("PRCS_DVSN", "01"),
            ("CTX_AREA_FK100", ""),
            ("CTX_AREA_NK100", ""),
        ];
        let rsp = self
            .request(reqwest::Method::GET, PATH_BALANCE, &token, &tr_id)
            .query(&query)
            .send()
            .await
            .context("balance request")?;
        let status = rsp.status();
        if !status.is_success() {
            let text = rsp.text().await.unwrap_or_default();
            bail!("balance http {status}: {text}");
        }
        let r: BalanceResp = rsp.json().await.context("balance response")?;
        if r.rt_cd != "0" {
            bail!("balance rejected: {}", r.msg1.trim());
        }

        let holdings = r
            .output1
            .iter()
            .map(|h| Holding { symbol: h.pdno.clone(), qty: num(&h.hldg_qty) as i64, avg_price: num(&h.pchs_avg_pric) })
            .filter(|h| h.qty > 0)
            .collect();
        let (cash, total_eval) = r
            .output2
            .first()
            .map(|s| (num(&s.dnca_tot_amt), num(&s.tot_evlu_amt)))
            .unwrap_or((0.0, 0.0));
        Ok(AccountBalance { cash, total_eval, holdings })
    }
}
