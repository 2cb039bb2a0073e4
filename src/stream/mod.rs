//! Realtime stream: the dispatcher that owns the connection and the shared
//! state its waiters read from

pub mod dispatcher;
pub mod state;

pub use dispatcher::{FrameRouter, StreamDispatcher, StreamSettings, Subscription};
pub use state::{MarketState, TradeWait};
