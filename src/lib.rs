//! KIS IOC momentum trading client
//!
//! Scans the change-percentage ranking for fast movers, buys with repeated
//! immediate-or-cancel orders driven by the live order book, waits for a
//! take-profit print on the trade stream and sells the same way. Every
//! session ends flat or reports what it could not liquidate.

pub mod common;
pub mod config;
pub mod kis;
pub mod scheduler;
pub mod stream;
pub mod strategy;

// Re-export commonly used types
pub use common::errors::{BotError, FrameDecodeError, Result};
pub use common::traits::{FrameTransport, StreamConnector, TradingApi};
pub use common::types::{
    FillEvent, FillSummary, OrderId, QuoteSnapshot, RankingEntry, SessionWindow, Side, TopicKind,
    TradeTick,
};
pub use config::types::AppConfig;
pub use kis::{KisRestClient, KisStreamConnector, KisWebSocketTransport};
pub use stream::{MarketState, StreamDispatcher, StreamSettings, Subscription, TradeWait};

// Strategy types
pub use strategy::{
    run_trading_session, BuyOutcome, ClosedTrade, CooldownTable, Executor, HoldOutcome,
    Position, SellOutcome, SessionReport, StopReason,
};
