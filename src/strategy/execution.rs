//! IOC execution loops
//!
//! Each loop subscribes the topic it needs through a scoped [`Subscription`],
//! so the topic is released on every exit path: normal return, attempt
//! exhaustion, early `?` return or panic.
//!
//! [`Subscription`]: crate::stream::Subscription

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};

use super::sizing;
use crate::common::errors::{BotError, Result};
use crate::common::time;
use crate::common::traits::TradingApi;
use crate::common::types::{FillSummary, QuoteSnapshot, Side, TopicKind};
use crate::config::types::StrategyConfig;
use crate::stream::{StreamDispatcher, TradeWait};

/// Why an execution loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Sell loop: nothing left to sell
    Completed,
    /// Buy loop: buying power is below one share
    NoBuyingPower,
    /// Every attempt was used
    AttemptsExhausted,
    /// Buy loop: the session deadline passed
    DeadlineReached,
    /// The stream died; fills up to this point are still reported
    ConnectionLost(String),
}

/// Result of one buy phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyOutcome {
    pub fills: FillSummary,
    pub stop: StopReason,
}

impl BuyOutcome {
    pub fn quantity(&self) -> i64 {
        self.fills.quantity
    }

    pub fn average_price(&self) -> Option<Decimal> {
        self.fills.average_price()
    }
}

/// Result of one sell phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellOutcome {
    pub requested: i64,
    pub fills: FillSummary,
    pub stop: StopReason,
}

impl SellOutcome {
    pub fn sold(&self) -> i64 {
        self.fills.quantity
    }

    pub fn remaining(&self) -> i64 {
        (self.requested - self.fills.quantity).max(0)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// `IncompleteLiquidation` when shares are left over, whatever the cause
    pub fn shortfall(&self, code: &str) -> Option<BotError> {
        (!self.is_complete()).then(|| BotError::IncompleteLiquidation {
            code: code.to_string(),
            requested: self.requested,
            sold: self.sold(),
        })
    }
}

/// Result of waiting for the take-profit target and selling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldOutcome {
    pub target: i64,
    /// Informational only; the sell runs either way
    pub target_hit: bool,
    pub sell: SellOutcome,
}

/// Runs the IOC loops against one stream and one trading API
pub struct Executor<'a> {
    api: &'a dyn TradingApi,
    stream: &'a StreamDispatcher,
    config: &'a StrategyConfig,
}

impl<'a> Executor<'a> {
    pub fn new(
        api: &'a dyn TradingApi,
        stream: &'a StreamDispatcher,
        config: &'a StrategyConfig,
    ) -> Self {
        Self {
            api,
            stream,
            config,
        }
    }

    /// Next snapshot newer than `last_seq`; `Ok(None)` when the wait timed out
    async fn next_quote(&self, code: &str, last_seq: u64) -> Result<Option<QuoteSnapshot>> {
        match self
            .stream
            .state()
            .await_next_quote(code, last_seq, self.config.quote_timeout())
            .await
        {
            Ok(quote) => Ok(Some(quote)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(code, "{}", e);
                Ok(None)
            }
        }
    }

    /// Buy with repeated IOC orders at the best ask
    ///
    /// One order per fresh order-book snapshot. Zero filled quantity is a
    /// valid outcome. Fails only when the order-book topic cannot be
    /// subscribed.
    #[instrument(skip(self))]
    pub async fn buy_with_ioc(
        &self,
        code: &str,
        deadline: DateTime<FixedOffset>,
        max_attempts: u32,
        cash_use_ratio: Decimal,
    ) -> Result<BuyOutcome> {
        let _book = self.stream.subscription(TopicKind::OrderBook, code)?;
        let state = self.stream.state();

        let mut fills = FillSummary::default();
        let mut last_seq = state.quote(code).seq;
        let mut stop = StopReason::AttemptsExhausted;

        for attempt in 1..=max_attempts {
            if time::until(deadline).is_zero() {
                info!(attempt, "Session deadline reached during buy");
                stop = StopReason::DeadlineReached;
                break;
            }

            let quote = match self.next_quote(code, last_seq).await {
                Ok(Some(quote)) => quote,
                Ok(None) => continue,
                Err(e) => {
                    stop = StopReason::ConnectionLost(e.to_string());
                    break;
                }
            };
            last_seq = quote.seq;
            if quote.ask_price <= 0 {
                continue;
            }

            let qty = match self
                .api
                .affordable_quantity(code, quote.ask_price, cash_use_ratio)
                .await
            {
                Ok(qty) => qty,
                Err(e) => {
                    warn!(attempt, "Buying power inquiry failed: {}", e);
                    continue;
                }
            };
            if qty <= 0 {
                info!(ask = quote.ask_price, "No more cash to buy");
                stop = StopReason::NoBuyingPower;
                break;
            }

            info!(attempt, max_attempts, ask = quote.ask_price, qty, "[BUY]");
            let order_id = match self
                .api
                .place_ioc_order(Side::Buy, code, qty, quote.ask_price)
                .await
            {
                Ok(order_id) => order_id,
                Err(e) => {
                    warn!(attempt, "BUY order failed: {}", e);
                    continue;
                }
            };

            let got = state
                .await_order_fills(
                    &order_id,
                    self.config.fill_total_timeout(),
                    self.config.fill_idle_timeout(),
                )
                .await;
            if got.is_empty() {
                warn!(order_id = %order_id, "BUY no fill, next order book");
                continue;
            }
            fills.absorb(got);
        }

        info!(
            qty = fills.quantity,
            avg = ?fills.average_price(),
            stop = ?stop,
            "Buy phase finished"
        );
        Ok(BuyOutcome { fills, stop })
    }

    /// Sell `qty` with repeated IOC orders at the best bid
    ///
    /// Not bounded by the session deadline: it also serves as the
    /// liquidation path after the deadline. A shortfall shows as
    /// `remaining() > 0` on the outcome.
    #[instrument(skip(self))]
    pub async fn sell_with_ioc(&self, code: &str, qty: i64, max_attempts: u32) -> Result<SellOutcome> {
        let _book = self.stream.subscription(TopicKind::OrderBook, code)?;
        let state = self.stream.state();

        let mut fills = FillSummary::default();
        let mut remaining = qty;
        let mut last_seq = state.quote(code).seq;
        let mut stop = StopReason::AttemptsExhausted;

        for attempt in 1..=max_attempts {
            if remaining <= 0 {
                break;
            }

            let quote = match self.next_quote(code, last_seq).await {
                Ok(Some(quote)) => quote,
                Ok(None) => continue,
                Err(e) => {
                    stop = StopReason::ConnectionLost(e.to_string());
                    break;
                }
            };
            last_seq = quote.seq;
            if quote.bid_price <= 0 {
                continue;
            }

            info!(attempt, max_attempts, bid = quote.bid_price, remaining, "[SELL]");
            let order_id = match self
                .api
                .place_ioc_order(Side::Sell, code, remaining, quote.bid_price)
                .await
            {
                Ok(order_id) => order_id,
                Err(e) => {
                    warn!(attempt, "SELL order failed: {}", e);
                    continue;
                }
            };

            let got = state
                .await_order_fills(
                    &order_id,
                    self.config.fill_total_timeout(),
                    self.config.fill_idle_timeout(),
                )
                .await;
            if got.is_empty() {
                warn!(order_id = %order_id, "SELL no fill, next order book");
                continue;
            }
            fills.absorb(got);
            remaining -= got.quantity;
        }

        if remaining <= 0 {
            stop = StopReason::Completed;
        }
        let outcome = SellOutcome {
            requested: qty,
            fills,
            stop,
        };
        info!(
            sold = outcome.sold(),
            remaining = outcome.remaining(),
            stop = ?outcome.stop,
            "Sell phase finished"
        );
        Ok(outcome)
    }

    /// Wait for the take-profit target on the trade stream, then sell everything
    ///
    /// The trade topic is released before selling. Reaching the deadline
    /// turns the sell into a liquidation attempt under the same IOC loop.
    #[instrument(skip(self))]
    pub async fn hold_for_target_then_sell(
        &self,
        code: &str,
        qty: i64,
        avg_buy: Decimal,
        deadline: DateTime<FixedOffset>,
    ) -> Result<HoldOutcome> {
        let target = sizing::target_price(avg_buy, self.config.take_profit_pct);
        info!(target, avg_buy = %avg_buy.round_dp(2), "Target set");

        let waited = {
            let _ticks = self.stream.subscription(TopicKind::TradeTick, code)?;
            self.stream
                .state()
                .await_trade_at_or_above(code, target, deadline, self.config.trade_poll())
                .await
        };

        let target_hit = match waited {
            Ok(TradeWait::Reached(last)) => {
                info!(last, target, "Reached target");
                true
            }
            Ok(TradeWait::DeadlineReached) => {
                warn!(target, "Session end reached before target, force sell attempt");
                false
            }
            Err(e) => {
                error!(target, "Trade wait aborted: {}", e);
                return Err(e);
            }
        };

        let sell = self
            .sell_with_ioc(code, qty, self.config.sell_max_attempts)
            .await?;
        Ok(HoldOutcome {
            target,
            target_hit,
            sell,
        })
    }
}
