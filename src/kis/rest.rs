//! REST API client for the KIS domestic equities endpoints

use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::auth::{AccessToken, AuthHeaders, CredentialCache};
use super::messages::*;
use crate::common::errors::{BotError, Result};
use crate::common::traits::TradingApi;
use crate::common::types::{OrderId, RankingEntry, Side};
use crate::config::types::{AppSettings, KisConfig, KisEnv};

/// Order division code for an IOC limit order
const ORD_DVSN_IOC_LIMIT: &str = "11";

/// Order division code for a plain limit order, used for cash inquiries
const ORD_DVSN_LIMIT: &str = "00";

const TOKEN_PATH: &str = "/oauth2/tokenP";
const APPROVAL_PATH: &str = "/oauth2/Approval";
const HASHKEY_PATH: &str = "/uapi/hashkey";
const RANKING_PATH: &str = "/uapi/domestic-stock/v1/ranking/fluctuation";
const PSBL_ORDER_PATH: &str = "/uapi/domestic-stock/v1/trading/inquire-psbl-order";
const ORDER_CASH_PATH: &str = "/uapi/domestic-stock/v1/trading/order-cash";

/// REST API client for KIS
#[derive(Debug, Clone)]
pub struct KisRestClient {
    /// HTTP client
    client: Client,
    /// Account and endpoint configuration
    config: KisConfig,
    /// Base URL without trailing slash
    base_url: String,
    /// Extra attempts for idempotent requests
    retries: u32,
    /// Pause between attempts
    retry_delay: Duration,
    /// Token and approval key, shared between clones
    credentials: Arc<Mutex<CredentialCache>>,
}

impl KisRestClient {
    /// Create a new REST client
    pub fn new(config: &KisConfig, settings: &AppSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()
            .map_err(|e| BotError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            config: config.clone(),
            base_url: config.rest_base(),
            retries: settings.request_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            credentials: Arc::new(Mutex::new(CredentialCache::default())),
        })
    }

    /// Account configuration this client trades for
    pub fn config(&self) -> &KisConfig {
        &self.config
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Send one JSON request, retrying failures up to `retries` extra times
    async fn request_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        auth: Option<&AuthHeaders>,
        query: &[(&str, String)],
        body: Option<&B>,
        retries: u32,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }

            let mut request = self.client.request(method.clone(), &url);
            request = match auth {
                Some(headers) => headers.apply_to_request(request),
                None => request.header("content-type", "application/json"),
            };
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match Self::read_json(request).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(%method, path, attempt, error = %e, "REST request failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            BotError::Internal(format!("REST request never sent: {} {}", method, path))
        }))
    }

    async fn read_json(request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_client_error() || status.is_server_error() {
            return Err(BotError::InvalidResponse(format!(
                "Server returned status {}: {}",
                status, text
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn auth_headers(&self, tr_id: &str, hashkey: Option<String>) -> Result<AuthHeaders> {
        Ok(AuthHeaders {
            access_token: self.access_token().await?,
            app_key: self.config.app_key.clone(),
            app_secret: self.config.app_secret.clone(),
            tr_id: tr_id.to_string(),
            custtype: self.config.custtype.clone(),
            hashkey,
        })
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    /// Access token, fetched or reused from cache
    #[instrument(skip(self))]
    pub async fn access_token(&self) -> Result<String> {
        let mut cache = self.credentials.lock().await;
        if let Some(token) = cache.fresh_token() {
            return Ok(token.to_string());
        }

        let body = TokenRequest {
            grant_type: "client_credentials",
            appkey: &self.config.app_key,
            appsecret: &self.config.app_secret,
        };
        let value = self
            .request_json(Method::POST, TOKEN_PATH, None, &[], Some(&body), self.retries)
            .await?;
        let response: TokenResponse = serde_json::from_value(value.clone())?;

        let token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BotError::Authentication(format!("token issue failed: {}", value)))?;

        info!(expires_in = ?response.expires_in, "Access token issued");
        cache.access_token = Some(AccessToken::issued_now(
            token.clone(),
            response.expires_in.unwrap_or(0),
        ));
        Ok(token)
    }

    /// Websocket approval key, fetched once until the next forced refresh
    #[instrument(skip(self))]
    pub async fn approval_key(&self) -> Result<String> {
        let mut cache = self.credentials.lock().await;
        if let Some(key) = &cache.approval_key {
            return Ok(key.clone());
        }

        let body = ApprovalRequest {
            grant_type: "client_credentials",
            appkey: &self.config.app_key,
            secretkey: &self.config.app_secret,
            appsecret: &self.config.app_secret,
        };
        let value = self
            .request_json(Method::POST, APPROVAL_PATH, None, &[], Some(&body), self.retries)
            .await?;
        let response: ApprovalResponse = serde_json::from_value(value.clone())?;

        let key = response
            .approval_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BotError::Authentication(format!("approval key failed: {}", value)))?;

        info!("Approval key issued");
        cache.approval_key = Some(key.clone());
        Ok(key)
    }

    /// Drop cached credentials and acquire new ones
    pub async fn force_refresh_tokens(&self) -> Result<()> {
        self.credentials.lock().await.clear();
        self.access_token().await?;
        self.approval_key().await?;
        Ok(())
    }

    /// Server-computed hash of an order body
    #[instrument(skip(self, body))]
    pub async fn hashkey<B: Serialize + ?Sized>(&self, body: &B) -> Result<String> {
        let request = self
            .client
            .post(format!("{}{}", self.base_url, HASHKEY_PATH))
            .header("content-type", "application/json")
            .header("appKey", &self.config.app_key)
            .header("appSecret", &self.config.app_secret)
            .json(body);
        let value = Self::read_json(request).await?;
        let response: HashkeyResponse = serde_json::from_value(value.clone())?;
        response
            .hash
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BotError::InvalidResponse(format!("hashkey failed: {}", value)))
    }

    // ========================================================================
    // Market data and account
    // ========================================================================

    /// Raw fluctuation ranking for the `[min, max]` change band
    #[instrument(skip(self))]
    pub async fn ranking_fluctuation(&self, min_rate: Decimal, max_rate: Decimal) -> Result<Value> {
        let auth = self.auth_headers("FHPST01700000", None).await?;
        let query = [
            ("fid_rsfl_rate1", min_rate.normalize().to_string()),
            ("fid_rsfl_rate2", max_rate.normalize().to_string()),
            ("fid_cond_mrkt_div_code", "J".to_string()),
            ("fid_cond_scr_div_code", "20170".to_string()),
            ("fid_input_iscd", "0000".to_string()),
            ("fid_rank_sort_cls_code", "0".to_string()),
            ("fid_input_cnt_1", "0".to_string()),
            ("fid_prc_cls_code", "0".to_string()),
            ("fid_input_price_1", String::new()),
            ("fid_input_price_2", String::new()),
            ("fid_vol_cnt", String::new()),
            ("fid_trgt_cls_code", "0".to_string()),
            ("fid_trgt_exls_cls_code", "0".to_string()),
        ];
        self.request_json::<()>(Method::GET, RANKING_PATH, Some(&auth), &query, None, self.retries)
            .await
    }

    /// Cash available to buy `pdno` at `price`
    #[instrument(skip(self))]
    pub async fn inquire_psbl_cash(&self, pdno: &str, price: i64) -> Result<i64> {
        let tr_id = match self.config.env {
            KisEnv::Vts => "VTTC8908R",
            KisEnv::Prod => "TTTC8908R",
        };
        let auth = self.auth_headers(tr_id, None).await?;
        let query = [
            ("CANO", self.config.cano.clone()),
            ("ACNT_PRDT_CD", self.config.acnt_prdt_cd.clone()),
            ("PDNO", pdno.to_string()),
            ("ORD_UNPR", price.to_string()),
            ("ORD_DVSN", ORD_DVSN_LIMIT.to_string()),
            ("CMA_EVLU_AMT_ICLD_YN", "Y".to_string()),
            ("OVRS_ICLD_YN", "Y".to_string()),
        ];
        let value = self
            .request_json::<()>(Method::GET, PSBL_ORDER_PATH, Some(&auth), &query, None, self.retries)
            .await?;

        orderable_cash_from(&value).ok_or_else(|| {
            BotError::InvalidResponse(format!("orderable cash missing: {}", value))
        })
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Transaction id pairs (buy, sell), current ids first, legacy ids second
    fn order_tr_ids(&self) -> [(&'static str, &'static str); 2] {
        match self.config.env {
            KisEnv::Vts => [("VTTC0012U", "VTTC0011U"), ("VTTC0802U", "VTTC0801U")],
            KisEnv::Prod => [("TTTC0012U", "TTTC0011U"), ("TTTC0802U", "TTTC0801U")],
        }
    }

    /// Place one IOC limit order and return its order number
    ///
    /// Order placement is not idempotent, so it is never retried blindly;
    /// only the legacy transaction id is tried when the current one fails.
    #[instrument(skip(self))]
    pub async fn order_cash(&self, side: Side, pdno: &str, qty: i64, price: i64) -> Result<OrderId> {
        let body = OrderCashRequest {
            cano: self.config.cano.clone(),
            acnt_prdt_cd: self.config.acnt_prdt_cd.clone(),
            pdno: pdno.to_string(),
            ord_dvsn: ORD_DVSN_IOC_LIMIT.to_string(),
            ord_qty: qty.to_string(),
            ord_unpr: price.to_string(),
        };
        let hashkey = self.hashkey(&body).await?;

        let mut last_err = String::from("no transaction id tried");
        for (buy_tr, sell_tr) in self.order_tr_ids() {
            let tr_id = match side {
                Side::Buy => buy_tr,
                Side::Sell => sell_tr,
            };
            let auth = self.auth_headers(tr_id, Some(hashkey.clone())).await?;

            let result = self
                .request_json(Method::POST, ORDER_CASH_PATH, Some(&auth), &[], Some(&body), 0)
                .await
                .and_then(|value| {
                    let response: OrderCashResponse = serde_json::from_value(value.clone())?;
                    response.order_id().ok_or_else(|| {
                        BotError::OrderRejected(
                            response.msg1.unwrap_or_else(|| format!("no ODNO in {}", value)),
                        )
                    })
                });

            match result {
                Ok(order_id) => {
                    debug!(%side, pdno, qty, price, tr_id, order_id = %order_id, "Order accepted");
                    return Ok(order_id);
                }
                Err(e) => {
                    warn!(%side, pdno, tr_id, error = %e, "Order attempt failed");
                    last_err = e.to_string();
                }
            }
        }

        Err(BotError::OrderRejected(last_err))
    }
}

#[async_trait]
impl TradingApi for KisRestClient {
    async fn ranking_by_change_percent(
        &self,
        min: Decimal,
        max: Decimal,
    ) -> Result<Vec<RankingEntry>> {
        let value = self.ranking_fluctuation(min, max).await?;
        Ok(ranking_entries_from(&value))
    }

    async fn orderable_cash(&self, code: &str, price_hint: i64) -> Result<i64> {
        self.inquire_psbl_cash(code, price_hint).await
    }

    async fn place_ioc_order(
        &self,
        side: Side,
        code: &str,
        qty: i64,
        price: i64,
    ) -> Result<OrderId> {
        self.order_cash(side, code, qty, price).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KisConfig {
        KisConfig {
            app_key: "key".to_string(),
            app_secret: "secret".to_string(),
            cano: "12345678".to_string(),
            hts_id: "trader".to_string(),
            ..KisConfig::default()
        }
    }

    #[test]
    fn test_client_creation() {
        let client = KisRestClient::new(&config(), &AppSettings::default());
        assert!(client.is_ok());
    }

    #[test]
    fn test_url_normalization() {
        let mut cfg = config();
        cfg.rest_url = Some("http://localhost:9443/".to_string());
        let client = KisRestClient::new(&cfg, &AppSettings::default()).unwrap();
        assert!(!client.base_url.ends_with('/'));
    }

    #[test]
    fn test_order_tr_ids_follow_env() {
        let mut cfg = config();
        let prod = KisRestClient::new(&cfg, &AppSettings::default()).unwrap();
        assert_eq!(prod.order_tr_ids()[0], ("TTTC0012U", "TTTC0011U"));

        cfg.env = KisEnv::Vts;
        let vts = KisRestClient::new(&cfg, &AppSettings::default()).unwrap();
        assert_eq!(vts.order_tr_ids()[1], ("VTTC0802U", "VTTC0801U"));
    }
}
