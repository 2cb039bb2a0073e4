//! Trait definitions for the brokerage collaborators

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::errors::Result;
use super::types::{OrderId, RankingEntry, Side};
use crate::stream::StreamDispatcher;

/// Brokerage REST capabilities the strategy depends on
///
/// Authentication, retries and request signing are the implementor's
/// business; callers treat every method as already authorised.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingApi: Send + Sync {
    /// Instruments whose daily change percentage lies in `[min, max]`
    async fn ranking_by_change_percent(
        &self,
        min: Decimal,
        max: Decimal,
    ) -> Result<Vec<RankingEntry>>;

    /// Cash available to buy `code` at `price_hint`
    async fn orderable_cash(&self, code: &str, price_hint: i64) -> Result<i64>;

    /// Place one immediate-or-cancel limit order
    ///
    /// Fails with `BotError::OrderRejected` when the venue refuses it.
    async fn place_ioc_order(&self, side: Side, code: &str, qty: i64, price: i64)
        -> Result<OrderId>;

    /// Whole shares affordable at `price_hint` using `cash_use_ratio` of buying power
    async fn affordable_quantity(
        &self,
        code: &str,
        price_hint: i64,
        cash_use_ratio: Decimal,
    ) -> Result<i64> {
        let cash = self.orderable_cash(code, price_hint).await?;
        Ok(crate::strategy::sizing::affordable_quantity(
            cash,
            cash_use_ratio,
            price_hint,
        ))
    }
}

/// Duplex text transport under the stream dispatcher
///
/// `receive` must be cancel-safe: the dispatcher polls it inside `select!`.
#[async_trait]
pub trait FrameTransport: Send + 'static {
    /// Send one text frame
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame, or `None` once the peer has closed
    async fn receive(&mut self) -> Result<Option<String>>;

    /// Close the transport
    async fn close(&mut self) -> Result<()>;
}

/// Opens the streaming connection for one session
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<StreamDispatcher>;
}

