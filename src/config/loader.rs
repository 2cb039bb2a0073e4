//! Configuration loader

use config::{Config, Environment, File};
use std::path::Path;

use super::types::{AppConfig, AppSettings, KisConfig, KisEnv, ScheduleConfig, StrategyConfig};
use crate::common::errors::{BotError, Result};

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with APP_, `__` between sections)
/// 2. Configuration file (TOML format)
/// 3. Default values
///
/// Account fields left empty by both are then filled from the `KIS_*`
/// variables, so a bare `.env` file is enough.
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("APP")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| BotError::Configuration(e.to_string()))?;

    let mut app: AppConfig = match config.get::<KisConfig>("kis") {
        Ok(_) => config
            .try_deserialize()
            .map_err(|e| BotError::Configuration(e.to_string()))?,
        Err(_) => {
            // No [kis] section anywhere; fall back to the KIS_* variables
            let mut app = AppConfig {
                kis: KisConfig::default(),
                strategy: config.get("strategy").unwrap_or_default(),
                schedule: config.get("schedule").unwrap_or_default(),
                settings: config.get("settings").unwrap_or_default(),
            };
            app.kis = kis_from_env()?;
            app
        }
    };

    fill_from_env(&mut app.kis);
    validate(&app)?;
    Ok(app)
}

/// Load configuration from environment variables only
pub fn load_from_env() -> Result<AppConfig> {
    dotenvy::dotenv().ok();
    config_from_vars(env_var)
}

/// Default sections plus account fields read through `lookup`
fn config_from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<AppConfig> {
    let app = AppConfig {
        kis: kis_from_vars(&lookup)?,
        strategy: StrategyConfig::default(),
        schedule: ScheduleConfig::default(),
        settings: AppSettings::default(),
    };
    validate(&app)?;
    Ok(app)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn kis_from_env() -> Result<KisConfig> {
    kis_from_vars(env_var)
}

fn kis_from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<KisConfig> {
    let mut kis = KisConfig::default();
    if let Some(env) = lookup("KIS_ENV") {
        kis.env = env.parse::<KisEnv>().map_err(BotError::Configuration)?;
    }
    fill_from_vars(&mut kis, lookup);
    Ok(kis)
}

fn fill_from_env(kis: &mut KisConfig) {
    fill_from_vars(kis, env_var)
}

fn fill_from_vars(kis: &mut KisConfig, lookup: impl Fn(&str) -> Option<String>) {
    let slots: [(&str, &mut String); 6] = [
        ("KIS_APP_KEY", &mut kis.app_key),
        ("KIS_APP_SECRET", &mut kis.app_secret),
        ("KIS_CANO", &mut kis.cano),
        ("KIS_ACNT_PRDT_CD", &mut kis.acnt_prdt_cd),
        ("KIS_HTS_ID", &mut kis.hts_id),
        ("KIS_CUSTTYPE", &mut kis.custtype),
    ];
    for (name, slot) in slots {
        if slot.trim().is_empty() {
            if let Some(value) = lookup(name) {
                *slot = value;
            }
        }
    }
}

/// Reject configurations the bot cannot trade with
pub fn validate(app: &AppConfig) -> Result<()> {
    let missing = app.kis.missing_fields();
    if !missing.is_empty() {
        return Err(BotError::Configuration(format!(
            "missing environment variables: {:?}",
            missing
        )));
    }

    let strategy = &app.strategy;
    if strategy.min_change_pct > strategy.max_change_pct {
        return Err(BotError::Configuration(format!(
            "change band is inverted: {} > {}",
            strategy.min_change_pct, strategy.max_change_pct
        )));
    }
    if strategy.cash_use_ratio <= rust_decimal::Decimal::ZERO
        || strategy.cash_use_ratio > rust_decimal::Decimal::ONE
    {
        return Err(BotError::Configuration(format!(
            "cash_use_ratio must be in (0, 1], got {}",
            strategy.cash_use_ratio
        )));
    }

    app.schedule.refresh()?;
    let start = app.schedule.start()?;
    let end = app.schedule.end()?;
    if start >= end {
        return Err(BotError::Configuration(format!(
            "session start {} is not before end {}",
            app.schedule.session_start, app.schedule.session_end
        )));
    }

    url::Url::parse(&app.kis.rest_base())
        .map_err(|e| BotError::Configuration(format!("bad REST url: {}", e)))?;
    url::Url::parse(&app.kis.websocket_url())
        .map_err(|e| BotError::Configuration(format!("bad websocket url: {}", e)))?;

    Ok(())
}
