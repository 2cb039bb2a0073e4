//! Configuration types

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Brokerage account and endpoint configuration
    pub kis: KisConfig,
    /// Strategy parameters
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Daily schedule
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// General application settings
    #[serde(default)]
    pub settings: AppSettings,
}

/// Trading environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KisEnv {
    /// Live trading
    Prod,
    /// Paper trading
    Vts,
}

impl std::str::FromStr for KisEnv {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prod" => Ok(KisEnv::Prod),
            "vts" => Ok(KisEnv::Vts),
            other => Err(format!("KIS_ENV must be 'prod' or 'vts', got '{}'", other)),
        }
    }
}

impl std::fmt::Display for KisEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KisEnv::Prod => write!(f, "prod"),
            KisEnv::Vts => write!(f, "vts"),
        }
    }
}

/// Brokerage account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KisConfig {
    /// Trading environment
    #[serde(default = "default_env")]
    pub env: KisEnv,
    /// Application key
    #[serde(default)]
    pub app_key: String,
    /// Application secret
    #[serde(default)]
    pub app_secret: String,
    /// Account number (first 8 digits)
    #[serde(default)]
    pub cano: String,
    /// Account product code
    #[serde(default = "default_product_code")]
    pub acnt_prdt_cd: String,
    /// HTS user id, the key of the execution-notice topic
    #[serde(default)]
    pub hts_id: String,
    /// Customer type
    #[serde(default = "default_custtype")]
    pub custtype: String,
    /// Override for the REST base URL
    #[serde(default)]
    pub rest_url: Option<String>,
    /// Override for the websocket URL
    #[serde(default)]
    pub ws_url: Option<String>,
}

impl KisConfig {
    /// REST base URL for the configured environment
    pub fn rest_base(&self) -> String {
        if let Some(url) = &self.rest_url {
            return url.trim_end_matches('/').to_string();
        }
        match self.env {
            KisEnv::Vts => "https://openapivts.koreainvestment.com:29443".to_string(),
            KisEnv::Prod => "https://openapi.koreainvestment.com:9443".to_string(),
        }
    }

    /// Websocket URL for the configured environment
    pub fn websocket_url(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }
        match self.env {
            KisEnv::Vts => "ws://ops.koreainvestment.com:31000".to_string(),
            KisEnv::Prod => "ws://ops.koreainvestment.com:21000".to_string(),
        }
    }

    /// Transaction id of the private execution-notice topic
    pub fn exec_tr_id(&self) -> &'static str {
        match self.env {
            KisEnv::Vts => "H0STCNI9",
            KisEnv::Prod => "H0STCNI0",
        }
    }

    /// Names of required fields that are empty
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("KIS_APP_KEY", &self.app_key),
            ("KIS_APP_SECRET", &self.app_secret),
            ("KIS_CANO", &self.cano),
            ("KIS_ACNT_PRDT_CD", &self.acnt_prdt_cd),
            ("KIS_HTS_ID", &self.hts_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

impl Default for KisConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            app_key: String::new(),
            app_secret: String::new(),
            cano: String::new(),
            acnt_prdt_cd: default_product_code(),
            hts_id: String::new(),
            custtype: default_custtype(),
            rest_url: None,
            ws_url: None,
        }
    }
}

fn default_env() -> KisEnv {
    KisEnv::Prod
}

fn default_product_code() -> String {
    "01".to_string()
}

fn default_custtype() -> String {
    "P".to_string()
}

/// Strategy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Lower bound of the change-percentage band
    #[serde(default = "default_min_change")]
    pub min_change_pct: Decimal,
    /// Upper bound of the change-percentage band
    #[serde(default = "default_max_change")]
    pub max_change_pct: Decimal,
    /// Minutes an instrument stays excluded after a trade attempt
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    /// Completed buy/sell cycles allowed per session
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Take-profit distance above the average buy price, in percent
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    /// Fraction of orderable cash committed per buy attempt
    #[serde(default = "default_cash_use_ratio")]
    pub cash_use_ratio: Decimal,
    /// IOC buy attempts per buy phase
    #[serde(default = "default_buy_attempts")]
    pub buy_max_attempts: u32,
    /// IOC sell attempts per sell phase
    #[serde(default = "default_sell_attempts")]
    pub sell_max_attempts: u32,
    /// Wait for the next order-book snapshot, in milliseconds
    #[serde(default = "default_quote_timeout_ms")]
    pub quote_timeout_ms: u64,
    /// Wait for the first fill of an IOC order, in milliseconds
    #[serde(default = "default_fill_total_ms")]
    pub fill_total_timeout_ms: u64,
    /// Gap after which no further fills are expected, in milliseconds
    #[serde(default = "default_fill_idle_ms")]
    pub fill_idle_timeout_ms: u64,
    /// Longest idle wait between trade-price checks, in milliseconds
    #[serde(default = "default_trade_poll_ms")]
    pub trade_poll_ms: u64,
    /// Ranking feed polls per second
    #[serde(default = "default_ranking_polls")]
    pub ranking_polls_per_sec: u32,
}

impl StrategyConfig {
    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }

    pub fn fill_total_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_total_timeout_ms)
    }

    pub fn fill_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_idle_timeout_ms)
    }

    pub fn trade_poll(&self) -> Duration {
        Duration::from_millis(self.trade_poll_ms)
    }

    /// Delay between ranking polls
    pub fn ranking_poll_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.ranking_polls_per_sec.max(1)))
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes)
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_change_pct: default_min_change(),
            max_change_pct: default_max_change(),
            cooldown_minutes: default_cooldown_minutes(),
            max_cycles: default_max_cycles(),
            take_profit_pct: default_take_profit_pct(),
            cash_use_ratio: default_cash_use_ratio(),
            buy_max_attempts: default_buy_attempts(),
            sell_max_attempts: default_sell_attempts(),
            quote_timeout_ms: default_quote_timeout_ms(),
            fill_total_timeout_ms: default_fill_total_ms(),
            fill_idle_timeout_ms: default_fill_idle_ms(),
            trade_poll_ms: default_trade_poll_ms(),
            ranking_polls_per_sec: default_ranking_polls(),
        }
    }
}

fn default_min_change() -> Decimal {
    dec!(20)
}

fn default_max_change() -> Decimal {
    dec!(28)
}

fn default_cooldown_minutes() -> i64 {
    20
}

fn default_max_cycles() -> u32 {
    5
}

fn default_take_profit_pct() -> Decimal {
    dec!(1)
}

fn default_cash_use_ratio() -> Decimal {
    dec!(0.98)
}

fn default_buy_attempts() -> u32 {
    20
}

fn default_sell_attempts() -> u32 {
    30
}

fn default_quote_timeout_ms() -> u64 {
    5000
}

fn default_fill_total_ms() -> u64 {
    3000
}

fn default_fill_idle_ms() -> u64 {
    500
}

fn default_trade_poll_ms() -> u64 {
    3000
}

fn default_ranking_polls() -> u32 {
    3
}

/// Daily schedule, all times in venue local time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Forced credential refresh, `HH:MM`
    #[serde(default = "default_refresh_at")]
    pub refresh_at: String,
    /// Session start, `HH:MM`
    #[serde(default = "default_session_start")]
    pub session_start: String,
    /// Session end, `HH:MM`
    #[serde(default = "default_session_end")]
    pub session_end: String,
}

impl ScheduleConfig {
    pub fn refresh(&self) -> crate::Result<(u32, u32)> {
        parse_hhmm(&self.refresh_at)
    }

    pub fn start(&self) -> crate::Result<(u32, u32)> {
        parse_hhmm(&self.session_start)
    }

    pub fn end(&self) -> crate::Result<(u32, u32)> {
        parse_hhmm(&self.session_end)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_at: default_refresh_at(),
            session_start: default_session_start(),
            session_end: default_session_end(),
        }
    }
}

fn default_refresh_at() -> String {
    "08:30".to_string()
}

fn default_session_start() -> String {
    "09:20".to_string()
}

fn default_session_end() -> String {
    "15:00".to_string()
}

/// Parse `HH:MM` into hour and minute
pub fn parse_hhmm(value: &str) -> crate::Result<(u32, u32)> {
    let bad = || crate::BotError::Configuration(format!("invalid HH:MM time: '{}'", value));
    let (h, m) = value.trim().split_once(':').ok_or_else(bad)?;
    let hour: u32 = h.parse().map_err(|_| bad())?;
    let minute: u32 = m.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok((hour, minute))
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Extra attempts for a failed REST request
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
    /// Pause between REST retries in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            request_timeout_seconds: default_request_timeout(),
            request_retries: default_request_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_request_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    200
}
