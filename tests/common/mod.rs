//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use kis_ioc_bot::common::types::{OrderId, RankingEntry, Side};
use kis_ioc_bot::config::types::StrategyConfig;
use kis_ioc_bot::{BotError, FrameTransport, Result, StreamConnector, StreamDispatcher, StreamSettings, TradingApi};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Execution-notice topic used by every test (the paper-trading id)
pub const EXEC_TR_ID: &str = "H0STCNI9";
pub const HTS_ID: &str = "trader01";
pub const CODE: &str = "005930";

const KEY: &str = "0123456789abcdef0123456789abcdef";
const IV: &str = "fedcba9876543210";

// ============================================================================
// Transport
// ============================================================================

/// In-memory transport: the test pushes inbound frames and reads what was sent
pub struct ScriptedTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    sent: mpsc::UnboundedSender<String>,
    kill: watch::Receiver<bool>,
}

/// Test side of a [`ScriptedTransport`]
pub struct StreamHarness {
    pub inbound: mpsc::UnboundedSender<String>,
    pub sent: mpsc::UnboundedReceiver<String>,
    pub kill: watch::Sender<bool>,
}

impl StreamHarness {
    /// Drop the connection even while other senders are alive
    pub fn disconnect(&self) {
        self.kill.send_replace(true);
    }

    /// Push one frame to the dispatcher
    pub fn push(&self, frame: impl Into<String>) {
        self.inbound
            .send(frame.into())
            .expect("dispatcher dropped its transport");
    }

    /// Everything the dispatcher has sent so far
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Wait for the next frame the dispatcher sends
    pub async fn next_sent(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("nothing sent within 2s")
            .expect("transport dropped")
    }

    /// Skip sent frames until one is a subscription control frame for
    /// `tr_id` with `tr_type`; returns its `tr_key`
    pub async fn expect_control(&mut self, tr_type: &str, tr_id: &str) -> String {
        loop {
            let frame: serde_json::Value =
                serde_json::from_str(&self.next_sent().await).expect("sent frame is JSON");
            if frame["header"]["tr_type"] == tr_type && frame["body"]["tr_id"] == tr_id {
                return frame["body"]["tr_key"].as_str().unwrap_or_default().to_string();
            }
        }
    }

    /// `(tr_type, tr_id)` of every subscription frame sent so far
    pub fn sent_controls(&mut self) -> Vec<(String, String)> {
        self.drain_sent()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter_map(|frame| {
                Some((
                    frame["header"]["tr_type"].as_str()?.to_string(),
                    frame["body"]["tr_id"].as_str()?.to_string(),
                ))
            })
            .collect()
    }
}

pub fn scripted_transport() -> (ScriptedTransport, StreamHarness) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = watch::channel(false);
    (
        ScriptedTransport {
            inbound: inbound_rx,
            sent: sent_tx,
            kill: kill_rx,
        },
        StreamHarness {
            inbound: inbound_tx,
            sent: sent_rx,
            kill: kill_tx,
        },
    )
}

#[async_trait]
impl FrameTransport for ScriptedTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sent
            .send(text)
            .map_err(|_| BotError::ConnectionLost("test harness dropped".to_string()))
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        tokio::select! {
            biased;
            Ok(_) = self.kill.wait_for(|dead| *dead) => Ok(None),
            frame = self.inbound.recv() => Ok(frame),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inbound.close();
        Ok(())
    }
}

pub fn stream_settings() -> StreamSettings {
    StreamSettings {
        approval_key: "approval-key".to_string(),
        custtype: "P".to_string(),
        exec_tr_id: EXEC_TR_ID.to_string(),
        hts_id: HTS_ID.to_string(),
    }
}

/// Dispatcher over a scripted transport, with the notice key already delivered
pub async fn connected_dispatcher() -> (StreamDispatcher, StreamHarness) {
    let (transport, harness) = scripted_transport();
    let dispatcher = StreamDispatcher::connect(transport, stream_settings())
        .await
        .expect("connect over scripted transport");
    harness.push(frames::exec_key_ack());
    (dispatcher, harness)
}

/// Hands out one pre-built dispatcher
pub struct OnceConnector {
    transport: Mutex<Option<ScriptedTransport>>,
}

impl OnceConnector {
    pub fn new(transport: ScriptedTransport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }
}

#[async_trait]
impl StreamConnector for OnceConnector {
    async fn connect(&self) -> Result<StreamDispatcher> {
        let transport = self
            .transport
            .lock()
            .take()
            .ok_or_else(|| BotError::WebSocketConnection("already connected".to_string()))?;
        StreamDispatcher::connect(transport, stream_settings()).await
    }
}

// ============================================================================
// Frames
// ============================================================================

pub mod frames {
    use super::*;

    /// Subscription ack carrying the notice topic's AES key material
    pub fn exec_key_ack() -> String {
        format!(
            r#"{{"header":{{"tr_id":"{}","tr_key":"{}","encrypt":"Y"}},"body":{{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS","output":{{"iv":"{}","key":"{}"}}}}}}"#,
            EXEC_TR_ID, HTS_ID, IV, KEY
        )
    }

    pub fn pingpong() -> String {
        r#"{"header":{"tr_id":"PINGPONG","datetime":"20240103092000"}}"#.to_string()
    }

    pub fn order_book(code: &str, ask: i64, bid: i64) -> String {
        let mut fields = vec!["0".to_string(); 59];
        fields[0] = code.to_string();
        fields[1] = "092000".to_string();
        fields[3] = ask.to_string();
        fields[13] = bid.to_string();
        fields[23] = "500".to_string();
        fields[33] = "700".to_string();
        format!("0|H0STASP0|001|{}", fields.join("^"))
    }

    pub fn trade(code: &str, price: i64) -> String {
        let fields = [code, "092001", &price.to_string(), "5", "0.50"].join("^");
        format!("0|H0STCNT0|001|{}", fields)
    }

    fn notice_fields(order_id: &str, code: &str, qty: i64, price: i64, reject: &str) -> String {
        let mut fields = vec![String::new(); 23];
        fields[0] = HTS_ID.to_string();
        fields[1] = "5012345601".to_string();
        fields[2] = order_id.to_string();
        fields[4] = "02".to_string();
        fields[8] = code.to_string();
        fields[9] = qty.to_string();
        fields[10] = price.to_string();
        fields[11] = "092001".to_string();
        fields[12] = reject.to_string();
        fields[13] = if qty > 0 { "2" } else { "1" }.to_string();
        fields[14] = "Y".to_string();
        fields.join("^")
    }

    /// Encrypted execution notice in the wire envelope
    pub fn notice(order_id: &str, code: &str, qty: i64, price: i64, reject: &str) -> String {
        let plain = notice_fields(order_id, code, qty, price, reject);
        format!("1|{}|001|{}", EXEC_TR_ID, encrypt(&plain))
    }

    pub fn fill(order_id: &str, code: &str, qty: i64, price: i64) -> String {
        notice(order_id, code, qty, price, "0")
    }

    /// AES-256-CBC + PKCS7 + base64, matching what the venue sends
    pub fn encrypt(plain: &str) -> String {
        let cipher = cbc::Encryptor::<aes::Aes256>::new_from_slices(KEY.as_bytes(), IV.as_bytes())
            .expect("valid key and iv");
        BASE64.encode(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes()))
    }
}

/// Keeps pushing order-book and trade frames from a shared price board
pub struct MarketFeed {
    pub board: watch::Sender<PriceBoard>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceBoard {
    pub ask: i64,
    pub bid: i64,
    pub last: i64,
}

impl MarketFeed {
    pub fn start(inbound: mpsc::UnboundedSender<String>, code: &str, board: PriceBoard) -> Self {
        let (board_tx, board_rx) = watch::channel(board);
        let code = code.to_string();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(20));
            loop {
                tick.tick().await;
                let board = *board_rx.borrow();
                let book = frames::order_book(&code, board.ask, board.bid);
                let trade = frames::trade(&code, board.last);
                if inbound.send(book).is_err() || inbound.send(trade).is_err() {
                    return;
                }
            }
        });
        Self {
            board: board_tx,
            task,
        }
    }
}

impl Drop for MarketFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Trading API
// ============================================================================

/// What the fake venue does with the next order
#[derive(Debug, Clone)]
pub enum OrderScript {
    /// Accept and fill with these `(qty, price)` notices
    Fill(Vec<(i64, i64)>),
    /// Accept; the IOC is cancelled with nothing filled
    NoFill,
    /// Refuse synchronously
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub side: Side,
    pub code: String,
    pub qty: i64,
    pub price: i64,
}

/// Scripted venue: fixed cash, ranking rows, per-order fill scripts
///
/// Fills are delivered as encrypted notices through the stream harness,
/// the same way the venue delivers them.
pub struct FakeTradingApi {
    pub ranking: Mutex<Vec<RankingEntry>>,
    pub cash: Mutex<i64>,
    scripts: Mutex<VecDeque<OrderScript>>,
    orders: Mutex<Vec<PlacedOrder>>,
    placed: watch::Sender<usize>,
    notices: mpsc::UnboundedSender<String>,
}

impl FakeTradingApi {
    pub fn new(notices: mpsc::UnboundedSender<String>) -> Self {
        let (placed, _) = watch::channel(0);
        Self {
            ranking: Mutex::new(Vec::new()),
            cash: Mutex::new(0),
            scripts: Mutex::new(VecDeque::new()),
            orders: Mutex::new(Vec::new()),
            placed,
            notices,
        }
    }

    pub fn with_cash(self, cash: i64) -> Self {
        *self.cash.lock() = cash;
        self
    }

    pub fn with_ranking(self, rows: &[(&str, Decimal)]) -> Self {
        *self.ranking.lock() = rows
            .iter()
            .map(|(code, pct)| RankingEntry {
                code: code.to_string(),
                change_pct: *pct,
            })
            .collect();
        self
    }

    pub fn script(self, scripts: impl IntoIterator<Item = OrderScript>) -> Self {
        self.scripts.lock().extend(scripts);
        self
    }

    pub fn orders(&self) -> Vec<PlacedOrder> {
        self.orders.lock().clone()
    }

    /// Resolves once `n` orders have been submitted, rejected ones included
    pub async fn wait_for_orders(&self, n: usize) {
        let mut rx = self.placed.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|count| *count >= n))
            .await
            .expect("orders not placed within 5s")
            .expect("fake dropped");
    }
}

#[async_trait]
impl TradingApi for FakeTradingApi {
    async fn ranking_by_change_percent(
        &self,
        _min: Decimal,
        _max: Decimal,
    ) -> Result<Vec<RankingEntry>> {
        Ok(self.ranking.lock().clone())
    }

    async fn orderable_cash(&self, _code: &str, _price_hint: i64) -> Result<i64> {
        Ok(*self.cash.lock())
    }

    async fn place_ioc_order(&self, side: Side, code: &str, qty: i64, price: i64) -> Result<OrderId> {
        let script = self.scripts.lock().pop_front().unwrap_or(OrderScript::NoFill);
        self.placed.send_modify(|count| *count += 1);
        if let OrderScript::Reject = script {
            return Err(BotError::OrderRejected("APBK0919 insufficient balance".to_string()));
        }

        let order_id = {
            let mut orders = self.orders.lock();
            let order_id = format!("{:010}", orders.len() + 1);
            orders.push(PlacedOrder {
                order_id: order_id.clone(),
                side,
                code: code.to_string(),
                qty,
                price,
            });
            order_id
        };

        // Acceptance notice first: not a fill
        let _ = self.notices.send(frames::notice(&order_id, code, 0, 0, "0"));
        if let OrderScript::Fill(fills) = script {
            for (fill_qty, fill_price) in fills {
                let _ = self
                    .notices
                    .send(frames::fill(&order_id, code, fill_qty, fill_price));
            }
        }
        Ok(order_id)
    }
}

/// Strategy settings with waits shortened for tests
pub fn fast_strategy() -> StrategyConfig {
    StrategyConfig {
        buy_max_attempts: 2,
        sell_max_attempts: 2,
        quote_timeout_ms: 500,
        fill_total_timeout_ms: 200,
        fill_idle_timeout_ms: 50,
        trade_poll_ms: 50,
        ranking_polls_per_sec: 20,
        ..StrategyConfig::default()
    }
}
