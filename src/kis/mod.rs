//! KIS (Korea Investment & Securities) Open API client

pub mod auth;
pub mod cipher;
pub mod codec;
pub mod messages;
pub mod rest;
pub mod websocket;

pub use rest::KisRestClient;
pub use websocket::{KisStreamConnector, KisWebSocketTransport};
