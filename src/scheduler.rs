//! Daily driver: refresh credentials in the morning, then run one session

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::common::errors::{BotError, Result};
use crate::common::time;
use crate::common::types::SessionWindow;
use crate::config::types::AppConfig;
use crate::kis::{KisRestClient, KisStreamConnector};
use crate::strategy::scanner::CooldownTable;
use crate::strategy::session::run_trading_session;

/// A start this many minutes after the refresh time still refreshes immediately
const LATE_REFRESH_MINUTES: i64 = 60;

/// When to force the next credential refresh
///
/// `now` itself when it falls within an hour after today's refresh time,
/// otherwise the next occurrence of the refresh time.
pub fn next_refresh(
    now: DateTime<FixedOffset>,
    (hour, minute): (u32, u32),
) -> Option<DateTime<FixedOffset>> {
    let today = time::at_time(now, hour, minute)?;
    if today <= now && now < today + ChronoDuration::minutes(LATE_REFRESH_MINUTES) {
        return Some(now);
    }
    time::next_kst_datetime(hour, minute, now)
}

/// Today's session window as seen from `now`
///
/// The start is clamped to `now`; `None` when the session has already ended.
pub fn session_window(
    now: DateTime<FixedOffset>,
    (start_h, start_m): (u32, u32),
    (end_h, end_m): (u32, u32),
) -> Option<SessionWindow> {
    let start = time::at_time(now, start_h, start_m)?.max(now);
    let end = time::at_time(now, end_h, end_m)?;
    (end > start).then(|| SessionWindow::new(start, end))
}

/// Run sessions day after day until a fatal error
pub async fn run_daily(config: AppConfig) -> Result<()> {
    let rest = Arc::new(KisRestClient::new(&config.kis, &config.settings)?);
    let connector = KisStreamConnector::new(rest.clone());
    let mut cooldowns = CooldownTable::new(config.strategy.cooldown());
    let mut last_session_day: Option<NaiveDate> = None;

    let refresh_at = config.schedule.refresh()?;
    let start_at = config.schedule.start()?;
    let end_at = config.schedule.end()?;

    info!(
        env = %config.kis.env,
        rest = %config.kis.rest_base(),
        ws = %config.kis.websocket_url(),
        "Scheduler started"
    );

    loop {
        let now = time::kst_now();
        let refresh = if last_session_day == Some(now.date_naive()) {
            time::next_kst_datetime(refresh_at.0, refresh_at.1, now)
        } else {
            next_refresh(now, refresh_at)
        };
        let refresh = refresh
            .ok_or_else(|| BotError::Configuration("invalid refresh time".to_string()))?;
        if refresh > now {
            info!(at = %refresh, "Next token refresh");
            time::sleep_until(refresh).await;
        }

        info!("Refreshing access token and approval key (forced)");
        rest.force_refresh_tokens().await?;

        let now = time::kst_now();
        let Some(window) = session_window(now, start_at, end_at) else {
            info!("Market session already ended today. Skip to next day");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        };

        if window.start > now {
            info!(at = %window.start, "Session starts");
            time::sleep_until(window.start).await;
        }

        info!(start = %window.start, end = %window.end, "Session running");
        last_session_day = Some(window.start.date_naive());
        match run_trading_session(
            rest.as_ref(),
            &connector,
            &config.strategy,
            &mut cooldowns,
            window,
        )
        .await
        {
            Ok(report) => {
                if !report.unliquidated.is_empty() {
                    warn!(positions = ?report.unliquidated, "Positions left open after session");
                }
                info!(cycles = report.cycles_completed, "Session ended. Waiting for next schedule cycle");
            }
            Err(e) => {
                error!("Session aborted: {}", e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kst_at(h: u32, m: u32) -> DateTime<FixedOffset> {
        // A Wednesday
        time::kst().with_ymd_and_hms(2024, 1, 3, h, m, 0).unwrap()
    }

    #[test]
    fn test_refresh_immediately_when_started_late() {
        let now = kst_at(9, 0);
        assert_eq!(next_refresh(now, (8, 30)), Some(now));
    }

    #[test]
    fn test_refresh_waits_for_next_occurrence() {
        assert_eq!(next_refresh(kst_at(7, 0), (8, 30)), Some(kst_at(8, 30)));
        assert_eq!(
            next_refresh(kst_at(10, 0), (8, 30)),
            Some(kst_at(8, 30) + ChronoDuration::days(1))
        );
    }

    #[test]
    fn test_session_window_clamps_start() {
        let window = session_window(kst_at(8, 31), (9, 20), (15, 0)).unwrap();
        assert_eq!(window.start, kst_at(9, 20));

        let window = session_window(kst_at(11, 0), (9, 20), (15, 0)).unwrap();
        assert_eq!(window.start, kst_at(11, 0));
        assert_eq!(window.end, kst_at(15, 0));

        assert!(session_window(kst_at(15, 0), (9, 20), (15, 0)).is_none());
    }
}
