//! KIS request/response bodies for the REST API and websocket control frames

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::types::RankingEntry;

// ============================================================================
// OAuth
// ============================================================================

/// Access token request body
#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest<'a> {
    pub grant_type: &'static str,
    pub appkey: &'a str,
    pub appsecret: &'a str,
}

/// Access token response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Websocket approval key request body
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest<'a> {
    pub grant_type: &'static str,
    pub appkey: &'a str,
    pub secretkey: &'a str,
    pub appsecret: &'a str,
}

/// Websocket approval key response
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalResponse {
    #[serde(default)]
    pub approval_key: Option<String>,
}

/// Hashkey response
#[derive(Debug, Clone, Deserialize)]
pub struct HashkeyResponse {
    #[serde(rename = "HASH", default)]
    pub hash: Option<String>,
}

// ============================================================================
// Trading
// ============================================================================

/// Cash order body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct OrderCashRequest {
    pub cano: String,
    pub acnt_prdt_cd: String,
    pub pdno: String,
    pub ord_dvsn: String,
    pub ord_qty: String,
    pub ord_unpr: String,
}

/// Cash order response
#[derive(Debug, Clone, Deserialize)]
pub struct OrderCashResponse {
    #[serde(default)]
    pub rt_cd: Option<String>,
    #[serde(default)]
    pub msg1: Option<String>,
    #[serde(default)]
    pub output: Option<OrderCashOutput>,
}

/// Accepted order identifiers
#[derive(Debug, Clone, Deserialize)]
pub struct OrderCashOutput {
    #[serde(rename = "ODNO", alias = "odno", default)]
    pub odno: Option<String>,
}

impl OrderCashResponse {
    /// The order number, if the venue accepted the order
    pub fn order_id(&self) -> Option<String> {
        self.output
            .as_ref()
            .and_then(|o| o.odno.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

/// Orderable cash from `inquire-psbl-order`
pub fn orderable_cash_from(response: &Value) -> Option<i64> {
    let output = response.get("output")?;
    ["ord_psbl_cash", "ORD_PSBL_CASH"]
        .iter()
        .find_map(|key| output.get(*key))
        .and_then(number_like)
        .map(|v| v.trunc() as i64)
}

/// Ranking rows from the fluctuation ranking response
///
/// The list lives under one of several keys depending on the endpoint
/// version; the first one holding an array wins. Rows without a code or
/// with an unparseable rate are skipped.
pub fn ranking_entries_from(response: &Value) -> Vec<RankingEntry> {
    let items = ["output", "output1", "Output", "Output1"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_array));

    let Some(items) = items else {
        return Vec::new();
    };

    items.iter().filter_map(ranking_entry_from).collect()
}

fn ranking_entry_from(item: &Value) -> Option<RankingEntry> {
    let item = item.as_object()?;
    let code = ["stck_shrn_iscd", "mksc_shrn_iscd", "code"]
        .iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|code| !code.is_empty())?
        .to_string();

    let rate = ["prdy_ctrt", "prdy_ctrt_1", "fluc_rt", "rate"]
        .iter()
        .filter_map(|key| item.get(*key))
        .find(|v| !v.is_null());

    let change_pct = match rate.and_then(decimal_like) {
        Some(rate) => rate,
        None => {
            tracing::warn!(code = %code, rate = ?rate, "ranking row has no numeric change rate");
            return None;
        }
    };

    Some(RankingEntry { code, change_pct })
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decimal_like(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Websocket control frames
// ============================================================================

/// `tr_type` of a subscription request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionAction {
    fn tr_type(self) -> &'static str {
        match self {
            SubscriptionAction::Subscribe => "1",
            SubscriptionAction::Unsubscribe => "2",
        }
    }
}

/// Subscribe/unsubscribe request frame
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    pub header: SubscriptionHeader,
    pub body: SubscriptionBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionHeader {
    pub approval_key: String,
    pub custtype: String,
    pub tr_type: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionBody {
    pub tr_id: String,
    pub tr_key: String,
}

impl SubscriptionRequest {
    pub fn new(
        action: SubscriptionAction,
        approval_key: &str,
        custtype: &str,
        tr_id: &str,
        tr_key: &str,
    ) -> Self {
        Self {
            header: SubscriptionHeader {
                approval_key: approval_key.to_string(),
                custtype: custtype.to_string(),
                tr_type: action.tr_type().to_string(),
                content_type: "utf-8".to_string(),
            },
            body: SubscriptionBody {
                tr_id: tr_id.to_string(),
                tr_key: tr_key.to_string(),
            },
        }
    }
}

/// JSON frame pushed by the server: subscription acks, key material, heartbeats
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlFrame {
    #[serde(default)]
    pub header: ControlHeader,
    #[serde(default)]
    pub body: Option<ControlBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlHeader {
    #[serde(default)]
    pub tr_id: Option<String>,
    #[serde(default)]
    pub tr_key: Option<String>,
    #[serde(default)]
    pub encrypt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlBody {
    #[serde(default)]
    pub rt_cd: Option<String>,
    #[serde(default)]
    pub msg1: Option<String>,
    #[serde(default)]
    pub output: Option<ControlOutput>,
}

/// AES key material for an encrypted topic
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlOutput {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub iv: Option<String>,
}
