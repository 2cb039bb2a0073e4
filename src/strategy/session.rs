//! One trading session: scan, buy, hold, sell, repeat, then liquidate
//!
//! ```text
//!   ┌──────────► Scanning ──(no candidate / cap / deadline)──► ForceLiquidate
//!   │               │
//!   │            Buying ──(zero fill)──► Scanning
//!   │               │
//!   │            Holding (wait target, then IOC sell)
//!   │             │     │
//!   │   CycleDone ◄┘     └► CycleFailed (position carried forward)
//!   └─────┴────────────────────┘
//! ```

use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};

use super::execution::{Executor, HoldOutcome, SellOutcome, StopReason};
use super::scanner::{self, CooldownTable};
use super::sizing;
use crate::common::errors::{BotError, Result};
use crate::common::time;
use crate::common::traits::{StreamConnector, TradingApi};
use crate::common::types::SessionWindow;
use crate::config::types::StrategyConfig;
use crate::stream::StreamDispatcher;

/// Open exposure from one buy phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub code: String,
    pub quantity: i64,
    /// Volume-weighted average buy price
    pub average_price: Decimal,
}

impl Position {
    /// What is left after selling `sold` shares; the average buy price is kept
    pub fn after_selling(&self, sold: i64) -> Option<Position> {
        let quantity = self.quantity - sold.max(0);
        (quantity > 0).then(|| Position {
            code: self.code.clone(),
            quantity,
            average_price: self.average_price,
        })
    }
}

/// A sell that realised profit or loss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedTrade {
    pub code: String,
    /// Shares sold
    pub quantity: i64,
    pub avg_buy: Decimal,
    pub avg_sell: Decimal,
    /// `(avg_sell / avg_buy - 1) * 100`
    pub pnl_pct: Decimal,
}

impl ClosedTrade {
    /// None when the sell filled nothing
    pub fn from_sell(position: &Position, sell: &SellOutcome) -> Option<ClosedTrade> {
        let avg_sell = sell.fills.average_price()?;
        Some(ClosedTrade {
            code: position.code.clone(),
            quantity: sell.sold(),
            avg_buy: position.average_price,
            avg_sell,
            pnl_pct: sizing::pnl_pct(position.average_price, avg_sell).unwrap_or_default(),
        })
    }
}

/// States of the session loop
#[derive(Debug)]
pub enum SessionState {
    Scanning,
    Buying(String),
    Holding(Position),
    CycleDone {
        position: Position,
        hold: HoldOutcome,
    },
    CycleFailed(Position),
    ForceLiquidate,
}

/// What a session achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub cycles_completed: u32,
    /// Positions still open after forced liquidation; need manual handling
    pub unliquidated: Vec<Position>,
    /// Every sell that filled, in order, including partial and forced ones
    pub closed: Vec<ClosedTrade>,
}

/// Run one session inside `window`
///
/// The stream is opened once and closed on every exit path. Only a lost
/// stream ends the session with an error.
#[instrument(skip_all, fields(start = %window.start, end = %window.end))]
pub async fn run_trading_session(
    api: &dyn TradingApi,
    connector: &dyn StreamConnector,
    config: &StrategyConfig,
    cooldowns: &mut CooldownTable,
    window: SessionWindow,
) -> Result<SessionReport> {
    if time::is_weekend(window.start) {
        info!(date = %window.start.date_naive(), "Weekend. Skip session");
        return Ok(SessionReport::default());
    }

    let stream = connector.connect().await?;
    let mut session = Session {
        executor: Executor::new(api, &stream, config),
        api,
        stream: &stream,
        config,
        cooldowns,
        window,
        pending: Vec::new(),
        closed: Vec::new(),
        cycles: 0,
    };
    let result = session.run().await;

    if let Err(e) = &result {
        for position in &session.pending {
            error!(
                code = %position.code,
                qty = position.quantity,
                avg_buy = %position.average_price.round_dp(2),
                "Session aborted with open position (manual check needed): {}",
                e
            );
        }
    }
    drop(session);
    stream.close().await;
    result
}

struct Session<'a> {
    executor: Executor<'a>,
    api: &'a dyn TradingApi,
    stream: &'a StreamDispatcher,
    config: &'a StrategyConfig,
    cooldowns: &'a mut CooldownTable,
    window: SessionWindow,
    /// Positions a failed sell left behind
    pending: Vec<Position>,
    closed: Vec<ClosedTrade>,
    cycles: u32,
}

impl Session<'_> {
    async fn run(&mut self) -> Result<SessionReport> {
        let mut state = SessionState::Scanning;
        loop {
            state = match state {
                SessionState::Scanning => self.scan().await?,
                SessionState::Buying(code) => self.buy(code).await?,
                SessionState::Holding(position) => self.hold(position).await?,
                SessionState::CycleDone { position, hold } => {
                    self.finish_cycle(&position, &hold);
                    SessionState::Scanning
                }
                SessionState::CycleFailed(position) => {
                    warn!(
                        code = %position.code,
                        qty = position.quantity,
                        "SELL failed or not filled, position carried forward"
                    );
                    self.pending.push(position);
                    SessionState::Scanning
                }
                SessionState::ForceLiquidate => return self.force_liquidate().await,
            };
        }
    }

    async fn scan(&mut self) -> Result<SessionState> {
        if self.cycles >= self.config.max_cycles {
            info!(cycles = self.cycles, "Cycle cap reached");
            return Ok(SessionState::ForceLiquidate);
        }
        if self.window.is_over(time::kst_now()) {
            return Ok(SessionState::ForceLiquidate);
        }
        if !self.stream.is_alive() {
            return Err(self.connection_lost());
        }

        let state = self.stream.state();
        let candidate =
            scanner::find_candidate(self.api, &*self.cooldowns, self.config, self.window.end);
        let found = tokio::select! {
            lost = state.connection_lost() => return Err(lost),
            found = candidate => found,
        };
        match found {
            Some(code) => Ok(SessionState::Buying(code)),
            None => {
                info!("No candidate until session end");
                Ok(SessionState::ForceLiquidate)
            }
        }
    }

    async fn buy(&mut self, code: String) -> Result<SessionState> {
        let outcome = self
            .executor
            .buy_with_ioc(
                &code,
                self.window.end,
                self.config.buy_max_attempts,
                self.config.cash_use_ratio,
            )
            .await;
        self.cooldowns.record(&code, time::kst_now());
        let outcome = outcome?;

        let position = outcome.average_price().map(|average_price| Position {
            code: code.clone(),
            quantity: outcome.quantity(),
            average_price,
        });

        if let StopReason::ConnectionLost(reason) = &outcome.stop {
            self.pending.extend(position);
            return Err(BotError::ConnectionLost(reason.clone()));
        }

        match position {
            Some(position) => {
                info!(
                    code = %position.code,
                    qty = position.quantity,
                    avg_buy = %position.average_price.round_dp(2),
                    "BUY done"
                );
                Ok(SessionState::Holding(position))
            }
            None => {
                warn!(code = %code, "BUY failed, back to scanning");
                Ok(SessionState::Scanning)
            }
        }
    }

    async fn hold(&mut self, position: Position) -> Result<SessionState> {
        let outcome = self
            .executor
            .hold_for_target_then_sell(
                &position.code,
                position.quantity,
                position.average_price,
                self.window.end,
            )
            .await;
        self.cooldowns.record(&position.code, time::kst_now());

        let hold = match outcome {
            Ok(hold) => hold,
            Err(e) => {
                self.pending.push(position);
                return Err(e);
            }
        };

        if let StopReason::ConnectionLost(reason) = &hold.sell.stop {
            self.pending
                .extend(position.after_selling(hold.sell.sold()));
            return Err(BotError::ConnectionLost(reason.clone()));
        }

        if let Some(shortfall) = hold.sell.shortfall(&position.code) {
            warn!("{}", shortfall);
        }
        if hold.sell.sold() <= 0 {
            return Ok(SessionState::CycleFailed(position));
        }
        match position.after_selling(hold.sell.sold()) {
            Some(rest) => {
                self.record_trade(&position, &hold);
                Ok(SessionState::CycleFailed(rest))
            }
            None => Ok(SessionState::CycleDone { position, hold }),
        }
    }

    fn finish_cycle(&mut self, position: &Position, hold: &HoldOutcome) {
        self.record_trade(position, hold);
        self.cycles += 1;
        info!("Progress: {}/{}", self.cycles, self.config.max_cycles);
    }

    fn record_trade(&mut self, position: &Position, hold: &HoldOutcome) {
        let Some(trade) = ClosedTrade::from_sell(position, &hold.sell) else {
            return;
        };
        info!(
            code = %trade.code,
            qty = trade.quantity,
            avg_buy = %trade.avg_buy.round_dp(2),
            avg_sell = %trade.avg_sell.round_dp(2),
            pnl_pct = %trade.pnl_pct.round_dp(3),
            target_hit = hold.target_hit,
            "TRADE DONE"
        );
        self.closed.push(trade);
    }

    /// Sell every carried position; a lost stream puts the unsold ones
    /// back into `pending` and ends the session with an error
    async fn force_liquidate(&mut self) -> Result<SessionReport> {
        if !self.pending.is_empty() && !self.stream.is_alive() {
            return Err(self.connection_lost());
        }

        let mut unliquidated = Vec::new();
        let mut queue = std::mem::take(&mut self.pending).into_iter();

        while let Some(position) = queue.next() {
            warn!(
                code = %position.code,
                qty = position.quantity,
                "Force liquidation attempt"
            );
            let sell = match self
                .executor
                .sell_with_ioc(&position.code, position.quantity, self.config.sell_max_attempts)
                .await
            {
                Ok(sell) => sell,
                Err(e) if e.is_fatal() => {
                    unliquidated.push(position);
                    unliquidated.extend(queue);
                    self.pending = unliquidated;
                    return Err(e);
                }
                Err(e) => {
                    error!(code = %position.code, qty = position.quantity, "LIQUIDATION FAILED (manual check needed): {}", e);
                    unliquidated.push(position);
                    continue;
                }
            };
            self.cooldowns.record(&position.code, time::kst_now());

            if let Some(trade) = ClosedTrade::from_sell(&position, &sell) {
                info!(
                    code = %trade.code,
                    qty = trade.quantity,
                    avg_sell = %trade.avg_sell.round_dp(2),
                    pnl_pct = %trade.pnl_pct.round_dp(3),
                    "LIQUIDATED"
                );
                self.closed.push(trade);
            }
            if let StopReason::ConnectionLost(reason) = &sell.stop {
                unliquidated.extend(position.after_selling(sell.sold()));
                unliquidated.extend(queue);
                self.pending = unliquidated;
                return Err(BotError::ConnectionLost(reason.clone()));
            }
            if let Some(shortfall) = sell.shortfall(&position.code) {
                error!("LIQUIDATION FAILED (manual check needed): {}", shortfall);
                unliquidated.extend(position.after_selling(sell.sold()));
            }
        }

        Ok(SessionReport {
            cycles_completed: self.cycles,
            unliquidated,
            closed: std::mem::take(&mut self.closed),
        })
    }

    fn connection_lost(&self) -> BotError {
        BotError::ConnectionLost(
            self.stream
                .state()
                .connection_error()
                .unwrap_or_else(|| "receive loop stopped".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::FillSummary;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_after_selling() {
        let position = Position {
            code: "005930".to_string(),
            quantity: 20,
            average_price: dec!(1000),
        };
        let rest = position.after_selling(15).unwrap();
        assert_eq!(rest.quantity, 5);
        assert_eq!(rest.average_price, dec!(1000));
        assert!(position.after_selling(20).is_none());
        assert_eq!(position.after_selling(0), Some(position.clone()));
    }

    #[test]
    fn test_closed_trade_from_sell() {
        let position = Position {
            code: "005930".to_string(),
            quantity: 20,
            average_price: dec!(1000),
        };
        let sell = SellOutcome {
            requested: 20,
            fills: FillSummary::new(15, 15 * 990),
            stop: StopReason::AttemptsExhausted,
        };
        let trade = ClosedTrade::from_sell(&position, &sell).unwrap();
        assert_eq!(trade.quantity, 15);
        assert_eq!(trade.avg_sell, dec!(990));
        assert_eq!(trade.pnl_pct, dec!(-1));

        let nothing = SellOutcome {
            fills: FillSummary::default(),
            ..sell
        };
        assert!(ClosedTrade::from_sell(&position, &nothing).is_none());
    }
}
