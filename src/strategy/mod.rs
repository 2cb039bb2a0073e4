//! Strategy module: the IOC momentum cycle
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  session (state machine, one per trading day)               │
//! │    Scanning ─► Buying ─► Holding ─► CycleDone / Failed      │
//! │        ▲                                  │                 │
//! │        └──────────────────────────────────┘                 │
//! │    ForceLiquidate on exit                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  scanner      ranking feed polling + cooldown table         │
//! │  execution    IOC buy loop, IOC sell loop, hold-then-sell   │
//! │  sizing       affordable quantity, take-profit target       │
//! └─────────────────────────────────────────────────────────────┘
//!                      │ waits on
//!                      ▼
//!            stream::MarketState (quotes, trades, fills)
//! ```

pub mod execution;
pub mod scanner;
pub mod session;
pub mod sizing;

pub use execution::{BuyOutcome, Executor, HoldOutcome, SellOutcome, StopReason};
pub use scanner::{find_candidate, CooldownTable};
pub use session::{run_trading_session, ClosedTrade, Position, SessionReport, SessionState};
