//! Types, traits and helpers shared across the crate

pub mod errors;
pub mod time;
pub mod traits;
pub mod types;

pub use errors::{BotError, FrameDecodeError, Result};
