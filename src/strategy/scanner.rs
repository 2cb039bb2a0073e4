//! Candidate discovery over the change-percentage ranking feed

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::common::time;
use crate::common::traits::TradingApi;
use crate::common::types::RankingEntry;
use crate::config::types::StrategyConfig;

/// Last trade-attempt time per instrument
#[derive(Debug, Clone)]
pub struct CooldownTable {
    window: chrono::Duration,
    last_attempt: HashMap<String, DateTime<FixedOffset>>,
}

impl CooldownTable {
    pub fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            last_attempt: HashMap::new(),
        }
    }

    /// Record a buy or sell attempt on `code`
    pub fn record(&mut self, code: &str, at: DateTime<FixedOffset>) {
        debug!(code, %at, "Cooldown recorded");
        self.last_attempt.insert(code.to_string(), at);
    }

    /// Whether `code` was attempted less than one window before `now`
    pub fn is_cooling(&self, code: &str, now: DateTime<FixedOffset>) -> bool {
        self.last_attempt
            .get(code)
            .is_some_and(|last| now - *last < self.window)
    }

    pub fn last_attempt(&self, code: &str) -> Option<DateTime<FixedOffset>> {
        self.last_attempt.get(code).copied()
    }

    pub fn len(&self) -> usize {
        self.last_attempt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_attempt.is_empty()
    }
}

/// Whether a ranking row falls inside the inclusive change band
pub fn qualifies(entry: &RankingEntry, min: Decimal, max: Decimal) -> bool {
    !entry.code.is_empty() && entry.change_pct >= min && entry.change_pct <= max
}

/// First in-band entry not in cooldown
pub fn pick_candidate(
    entries: &[RankingEntry],
    cooldowns: &CooldownTable,
    config: &StrategyConfig,
    now: DateTime<FixedOffset>,
) -> Option<String> {
    entries
        .iter()
        .filter(|e| qualifies(e, config.min_change_pct, config.max_change_pct))
        .find(|e| {
            let cooling = cooldowns.is_cooling(&e.code, now);
            if cooling {
                debug!(code = %e.code, change_pct = %e.change_pct, "Skipping candidate in cooldown");
            }
            !cooling
        })
        .map(|e| e.code.clone())
}

/// Poll the ranking feed until a candidate appears or the session ends
///
/// Feed errors are logged and the next poll proceeds.
#[instrument(skip_all, fields(session_end = %session_end))]
pub async fn find_candidate(
    api: &dyn TradingApi,
    cooldowns: &CooldownTable,
    config: &StrategyConfig,
    session_end: DateTime<FixedOffset>,
) -> Option<String> {
    let mut interval = tokio::time::interval(config.ranking_poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls: u64 = 0;

    while time::kst_now() < session_end {
        interval.tick().await;
        polls += 1;

        let entries = match api
            .ranking_by_change_percent(config.min_change_pct, config.max_change_pct)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(polls, "Ranking poll failed: {}", e);
                continue;
            }
        };

        if let Some(code) = pick_candidate(&entries, cooldowns, config, time::kst_now()) {
            info!(code = %code, polls, "Candidate picked");
            return Some(code);
        }
        if polls % 300 == 1 {
            debug!(polls, rows = entries.len(), "No candidate yet");
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::traits::MockTradingApi;
    use crate::common::BotError;
    use rust_decimal_macros::dec;

    fn entry(code: &str, pct: Decimal) -> RankingEntry {
        RankingEntry {
            code: code.to_string(),
            change_pct: pct,
        }
    }

    #[test]
    fn test_band_is_inclusive() {
        let (min, max) = (dec!(20), dec!(28));
        assert!(qualifies(&entry("A", dec!(20)), min, max));
        assert!(qualifies(&entry("A", dec!(28)), min, max));
        assert!(!qualifies(&entry("A", dec!(28.01)), min, max));
        assert!(!qualifies(&entry("A", dec!(19.99)), min, max));
        assert!(!qualifies(&entry("", dec!(25)), min, max));
    }

    #[test]
    fn test_cooldown_expires_after_window() {
        let config = StrategyConfig::default();
        let mut table = CooldownTable::new(config.cooldown());
        let t0 = time::kst_now();
        table.record("005930", t0);

        assert!(table.is_cooling("005930", t0 + chrono::Duration::minutes(19)));
        assert!(!table.is_cooling("005930", t0 + chrono::Duration::minutes(20)));
        assert!(!table.is_cooling("000660", t0));
    }

    #[test]
    fn test_pick_skips_cooling_and_out_of_band() {
        let config = StrategyConfig::default();
        let mut table = CooldownTable::new(config.cooldown());
        let now = time::kst_now();
        table.record("111111", now - chrono::Duration::minutes(5));

        let entries = vec![
            entry("000001", dec!(30)),
            entry("111111", dec!(25)),
            entry("222222", dec!(21)),
        ];
        assert_eq!(
            pick_candidate(&entries, &table, &config, now),
            Some("222222".to_string())
        );
    }

    #[tokio::test]
    async fn test_find_candidate_retries_after_feed_error() {
        let mut api = MockTradingApi::new();
        let mut calls = 0;
        api.expect_ranking_by_change_percent()
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    Err(BotError::InvalidResponse("rt_cd=1".to_string()))
                } else {
                    Ok(vec![entry("005930", dec!(25))])
                }
            });

        let config = StrategyConfig::default();
        let table = CooldownTable::new(config.cooldown());
        let end = time::kst_now() + chrono::Duration::seconds(10);

        let found = find_candidate(&api, &table, &config, end).await;
        assert_eq!(found.as_deref(), Some("005930"));
    }

    #[tokio::test]
    async fn test_find_candidate_gives_up_at_session_end() {
        let api = MockTradingApi::new();
        let config = StrategyConfig::default();
        let table = CooldownTable::new(config.cooldown());
        let end = time::kst_now() - chrono::Duration::seconds(1);

        assert_eq!(find_candidate(&api, &table, &config, end).await, None);
    }
}
