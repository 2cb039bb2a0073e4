//! Websocket transport and session connector for the KIS realtime API

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, instrument, warn};

use super::rest::KisRestClient;
use crate::common::errors::{BotError, Result};
use crate::common::traits::{FrameTransport, StreamConnector};
use crate::stream::{StreamDispatcher, StreamSettings};

/// Text-frame transport over a tungstenite websocket
pub struct KisWebSocketTransport {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl KisWebSocketTransport {
    /// Open the websocket
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to KIS websocket: {}", url);

        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| BotError::WebSocketConnection(e.to_string()))?;

        info!("WebSocket connection established");
        Ok(Self {
            url: url.to_string(),
            stream,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FrameTransport for KisWebSocketTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(e) => warn!("Dropping non UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the pong; it goes out with the next write
                    debug!("Received Ping");
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("Received Pong");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Err(BotError::ConnectionLost(e.to_string())),
                None => {
                    info!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Opens one dispatcher per session: approval key, websocket, notice topic
pub struct KisStreamConnector {
    rest: Arc<KisRestClient>,
}

impl KisStreamConnector {
    pub fn new(rest: Arc<KisRestClient>) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl StreamConnector for KisStreamConnector {
    async fn connect(&self) -> Result<StreamDispatcher> {
        let config = self.rest.config();
        let approval_key = self.rest.approval_key().await?;
        let transport = KisWebSocketTransport::connect(&config.websocket_url()).await?;

        let settings = StreamSettings {
            approval_key,
            custtype: config.custtype.clone(),
            exec_tr_id: config.exec_tr_id().to_string(),
            hts_id: config.hts_id.clone(),
        };
        StreamDispatcher::connect(transport, settings).await
    }
}
