//! Streaming connection owner: subscriptions, receive loop, frame routing

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::MarketState;
use crate::common::errors::{BotError, FrameDecodeError, Result};
use crate::common::traits::FrameTransport;
use crate::common::types::{FillEvent, TopicKind};
use crate::kis::cipher::TopicKey;
use crate::kis::codec::{self, Envelope, RawFrame};
use crate::kis::messages::{ControlFrame, SubscriptionAction, SubscriptionRequest};

/// How long `close` waits for the receive loop to shut the transport
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Credentials and ids the dispatcher needs to talk to the venue
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub approval_key: String,
    pub custtype: String,
    /// Execution-notice topic (`H0STCNI0` / `H0STCNI9`)
    pub exec_tr_id: String,
    /// Key of the execution-notice subscription
    pub hts_id: String,
}

impl StreamSettings {
    fn request(&self, action: SubscriptionAction, tr_id: &str, tr_key: &str) -> Result<String> {
        let request =
            SubscriptionRequest::new(action, &self.approval_key, &self.custtype, tr_id, tr_key);
        Ok(serde_json::to_string(&request)?)
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// Owns one streaming connection and the state it feeds
///
/// Subscribe and unsubscribe are fire-and-forget: the frame is queued for the
/// receive loop task, which owns the transport. They only fail once the loop
/// has stopped.
pub struct StreamDispatcher {
    state: Arc<MarketState>,
    settings: Arc<StreamSettings>,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Option<JoinHandle<()>>,
}

impl StreamDispatcher {
    /// Subscribe the execution-notice topic, then start the receive loop
    pub async fn connect<T: FrameTransport>(mut transport: T, settings: StreamSettings) -> Result<Self> {
        let exec = settings.request(
            SubscriptionAction::Subscribe,
            &settings.exec_tr_id,
            &settings.hts_id,
        )?;
        transport.send(exec).await?;
        info!(tr_id = %settings.exec_tr_id, "Subscribed execution notices");

        let state = Arc::new(MarketState::new());
        let (outbound, commands) = mpsc::unbounded_channel();
        let router = FrameRouter::new(state.clone(), settings.exec_tr_id.clone());
        let task = tokio::spawn(receive_loop(transport, commands, router));

        Ok(Self {
            state,
            settings: Arc::new(settings),
            outbound,
            task: Some(task),
        })
    }

    /// State maintained by this dispatcher
    pub fn state(&self) -> &Arc<MarketState> {
        &self.state
    }

    pub fn subscribe(&self, kind: TopicKind, code: &str) -> Result<()> {
        let frame = self
            .settings
            .request(SubscriptionAction::Subscribe, kind.tr_id(), code)?;
        self.enqueue(frame)?;
        info!(topic = %kind, code, "WS subscribe");
        Ok(())
    }

    pub fn unsubscribe(&self, kind: TopicKind, code: &str) -> Result<()> {
        let frame = self
            .settings
            .request(SubscriptionAction::Unsubscribe, kind.tr_id(), code)?;
        self.enqueue(frame)?;
        info!(topic = %kind, code, "WS unsubscribe");
        Ok(())
    }

    /// Subscribe and return a guard that unsubscribes when dropped
    pub fn subscription(&self, kind: TopicKind, code: &str) -> Result<Subscription> {
        let unsubscribe = self
            .settings
            .request(SubscriptionAction::Unsubscribe, kind.tr_id(), code)?;
        self.subscribe(kind, code)?;
        Ok(Subscription {
            kind,
            code: code.to_string(),
            unsubscribe: Some(unsubscribe),
            outbound: self.outbound.clone(),
        })
    }

    /// Whether the receive loop is still running
    pub fn is_alive(&self) -> bool {
        self.state.connection_error().is_none()
            && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Close the transport and stop the receive loop
    pub async fn close(mut self) {
        let _ = self.outbound.send(Outbound::Close);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("Receive loop did not stop in time; aborting");
                task.abort();
            }
        }
        info!("Stream dispatcher closed");
    }

    fn enqueue(&self, frame: String) -> Result<()> {
        self.outbound.send(Outbound::Frame(frame)).map_err(|_| {
            BotError::ConnectionLost(
                self.state
                    .connection_error()
                    .unwrap_or_else(|| "receive loop stopped".to_string()),
            )
        })
    }
}

impl Drop for StreamDispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Scoped topic subscription; unsubscribes on every exit path
pub struct Subscription {
    kind: TopicKind,
    code: String,
    unsubscribe: Option<String>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Subscription {
    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(frame) = self.unsubscribe.take() {
            if self.outbound.send(Outbound::Frame(frame)).is_ok() {
                info!(topic = %self.kind, code = %self.code, "WS unsubscribe");
            } else {
                debug!(topic = %self.kind, code = %self.code, "Stream already closed; nothing to unsubscribe");
            }
        }
    }
}

async fn receive_loop<T: FrameTransport>(
    mut transport: T,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    mut router: FrameRouter,
) {
    let reason = loop {
        tokio::select! {
            incoming = transport.receive() => match incoming {
                Ok(Some(text)) => match router.route(&text) {
                    Ok(Some(reply)) => {
                        if let Err(e) = transport.send(reply).await {
                            warn!("Failed to answer heartbeat: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping frame: {}", e),
                },
                Ok(None) => break "connection closed by peer".to_string(),
                Err(e) => break e.to_string(),
            },
            command = commands.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = transport.send(text).await {
                        if e.is_fatal() {
                            break e.to_string();
                        }
                        warn!("Failed to send control frame: {}", e);
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = transport.close().await {
                        debug!("Transport close failed: {}", e);
                    }
                    router.state.mark_connection_lost("closed by client");
                    return;
                }
            },
        }
    };

    error!(%reason, "Streaming connection lost");
    router.state.mark_connection_lost(reason);
}

/// Decodes frames and applies them to the market state
pub struct FrameRouter {
    state: Arc<MarketState>,
    exec_tr_id: String,
    keys: HashMap<String, TopicKey>,
}

impl FrameRouter {
    pub fn new(state: Arc<MarketState>, exec_tr_id: String) -> Self {
        Self {
            state,
            exec_tr_id,
            keys: HashMap::new(),
        }
    }

    /// Apply one text frame; returns a frame to send back, if any
    pub fn route(&mut self, text: &str) -> std::result::Result<Option<String>, FrameDecodeError> {
        match codec::classify(text)? {
            RawFrame::Control(frame) => Ok(self.on_control(text, frame)),
            RawFrame::Data(envelope) => {
                self.on_data(envelope)?;
                Ok(None)
            }
        }
    }

    fn on_control(&mut self, text: &str, frame: ControlFrame) -> Option<String> {
        let tr_id = frame.header.tr_id.unwrap_or_default();
        if tr_id == codec::PINGPONG_TR_ID {
            debug!("PINGPONG");
            return Some(text.to_string());
        }

        let body = frame.body.unwrap_or_default();
        if let Some(rt_cd) = body.rt_cd.as_deref().filter(|c| *c != "0") {
            warn!(
                tr_id = %tr_id,
                tr_key = ?frame.header.tr_key,
                rt_cd,
                msg = ?body.msg1,
                "Subscription not acknowledged"
            );
        } else {
            debug!(tr_id = %tr_id, msg = ?body.msg1, "Control frame");
        }

        if frame.header.encrypt.as_deref() == Some("Y") {
            let output = body.output.unwrap_or_default();
            if let (Some(key), Some(iv)) = (output.key, output.iv) {
                if !tr_id.is_empty() {
                    info!(tr_id = %tr_id, "WS encrypt set");
                    self.keys.insert(tr_id, TopicKey::new(key, iv));
                }
            }
        }
        None
    }

    fn on_data(&mut self, envelope: Envelope<'_>) -> std::result::Result<(), FrameDecodeError> {
        match TopicKind::from_tr_id(envelope.tr_id) {
            Some(TopicKind::OrderBook) => {
                let record = codec::decode_order_book(envelope.payload)?;
                self.state.apply_order_book(&record);
            }
            Some(TopicKind::TradeTick) => {
                for record in codec::decode_trades(envelope.payload, envelope.record_count())? {
                    self.state.apply_trade(&record);
                }
            }
            None if envelope.tr_id == self.exec_tr_id && envelope.is_encrypted() => {
                self.on_execution_notice(envelope)?;
            }
            None => debug!(tr_id = envelope.tr_id, "Ignoring frame for unknown topic"),
        }
        Ok(())
    }

    fn on_execution_notice(
        &mut self,
        envelope: Envelope<'_>,
    ) -> std::result::Result<(), FrameDecodeError> {
        let key = self
            .keys
            .get(envelope.tr_id)
            .ok_or_else(|| FrameDecodeError::MissingKey(envelope.tr_id.to_string()))?;
        let plain = key.decrypt(envelope.payload)?;
        let notice = codec::decode_execution_notice(&plain);

        if notice.is_fill() {
            info!(
                order_id = %notice.order_id,
                code = %notice.code,
                qty = notice.quantity,
                price = notice.price,
                rej = %notice.reject_flag,
                exec = %notice.executed_flag,
                acc = %notice.accepted_flag,
                "EXEC_FILL"
            );
            self.state.push_fill(FillEvent {
                order_id: notice.order_id,
                code: notice.code,
                quantity: notice.quantity,
                price: notice.price,
                raw_fields: notice.fields,
            });
        } else {
            info!(
                order_id = %notice.order_id,
                code = %notice.code,
                qty = notice.quantity,
                price = notice.price,
                rej = %notice.reject_flag,
                exec = %notice.executed_flag,
                acc = %notice.accepted_flag,
                "EXEC_NONFILL"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EXEC: &str = "H0STCNI9";

    fn router() -> FrameRouter {
        FrameRouter::new(Arc::new(MarketState::new()), EXEC.to_string())
    }

    fn order_book_frame(code: &str, ask: i64, bid: i64) -> String {
        let mut fields = vec!["0".to_string(); 43];
        fields[0] = code.to_string();
        fields[3] = ask.to_string();
        fields[13] = bid.to_string();
        fields[23] = "100".to_string();
        fields[33] = "200".to_string();
        format!("0|H0STASP0|001|{}", fields.join("^"))
    }

    #[test]
    fn test_pingpong_is_echoed() {
        let text = r#"{"header":{"tr_id":"PINGPONG","datetime":"20240101090000"}}"#;
        assert_eq!(router().route(text).unwrap(), Some(text.to_string()));
    }

    #[test]
    fn test_order_book_updates_state() {
        let mut router = router();
        router.route(&order_book_frame("005930", 1000, 995)).unwrap();
        router.route(&order_book_frame("005930", 1005, 1000)).unwrap();

        let quote = router.state.quote("005930");
        assert_eq!(quote.seq, 2);
        assert_eq!((quote.ask_price, quote.bid_price), (1005, 1000));
        assert_eq!((quote.ask_qty, quote.bid_qty), (100, 200));
    }

    #[test]
    fn test_multi_record_trade_frame_bumps_each() {
        let mut router = router();
        router
            .route("0|H0STCNT0|002|005930^090001^990^x^005930^090002^995^y")
            .unwrap();
        let tick = router.state.trade("005930");
        assert_eq!((tick.seq, tick.price), (2, 995));
    }

    #[test]
    fn test_notice_before_key_is_dropped() {
        let mut router = router();
        let err = router.route("1|H0STCNI9|001|AAAA").unwrap_err();
        assert_eq!(err, FrameDecodeError::MissingKey(EXEC.to_string()));
    }

    #[test]
    fn test_key_cached_only_when_encrypted() {
        let mut router = router();
        router
            .route(r#"{"header":{"tr_id":"H0STCNI9","encrypt":"N"},"body":{"rt_cd":"0","output":{"key":"k","iv":"i"}}}"#)
            .unwrap();
        assert!(router.keys.is_empty());

        router
            .route(r#"{"header":{"tr_id":"H0STCNI9","encrypt":"Y"},"body":{"rt_cd":"0","msg1":"SUBSCRIBE SUCCESS","output":{"key":"k","iv":"i"}}}"#)
            .unwrap();
        assert_eq!(router.keys.get(EXEC), Some(&TopicKey::new("k", "i")));
    }

    #[test]
    fn test_malformed_frames_are_errors_not_panics() {
        let mut router = router();
        assert!(router.route("0|H0STASP0|001|005930^1^2").is_err());
        assert!(router.route("garbage").is_err());
        assert!(router.route("0|UNKNOWN|001|a^b").unwrap().is_none());
    }
}
