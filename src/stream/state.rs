//! Shared market state and the waits built on it
//!
//! Every instrument gets a `watch` cell per topic. The dispatcher is the only
//! writer; it bumps the sequence number inside the same `send_modify` that
//! stores the prices, so readers never see a sequence without its data.
//! Waiters use `wait_for`, which re-checks the predicate after every wake and
//! therefore cannot miss an update landing between check and suspend.
//!
//! Fills are routed through one unbounded queue per order id. Either side may
//! create the queue first: the dispatcher when a notice beats the REST
//! response, the waiter when it starts listening before any notice arrives.

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::common::errors::{BotError, Result};
use crate::common::time;
use crate::common::types::{FillEvent, FillSummary, OrderId, QuoteSnapshot, TradeTick};
use crate::kis::codec::{OrderBookRecord, TradeRecord};

/// Outcome of waiting for a trade at or above a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeWait {
    /// A trade printed at this price, which is at or above the target
    Reached(i64),
    /// The session deadline passed first
    DeadlineReached,
}

struct FillQueue {
    tx: mpsc::UnboundedSender<FillEvent>,
    rx: Option<mpsc::UnboundedReceiver<FillEvent>>,
}

impl FillQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// Closed order ids remembered for dropping late fills; oldest forgotten first
const CLOSED_ORDER_LIMIT: usize = 1024;

#[derive(Default)]
struct FillBook {
    queues: HashMap<OrderId, FillQueue>,
    /// Orders whose collection window has closed
    closed: HashSet<OrderId>,
    /// `closed` in insertion order, for eviction
    closed_order: VecDeque<OrderId>,
}

impl FillBook {
    /// Drop the queue of `order_id` and remember it as closed
    fn close(&mut self, order_id: &str) {
        self.queues.remove(order_id);
        if self.closed.insert(order_id.to_string()) {
            self.closed_order.push_back(order_id.to_string());
        }
        while self.closed_order.len() > CLOSED_ORDER_LIMIT {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }
}

/// Per-instrument quotes and trades, per-order fill queues, connection status
pub struct MarketState {
    quotes: Mutex<HashMap<String, watch::Sender<QuoteSnapshot>>>,
    trades: Mutex<HashMap<String, watch::Sender<TradeTick>>>,
    fills: Mutex<FillBook>,
    /// `Some(reason)` once the streaming connection is gone
    connection: watch::Sender<Option<String>>,
}

impl Default for MarketState {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketState {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(None);
        Self {
            quotes: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
            fills: Mutex::new(FillBook::default()),
            connection,
        }
    }

    // ========================================================================
    // Writes (dispatcher only)
    // ========================================================================

    /// Store a top-of-book update and return its sequence number
    pub fn apply_order_book(&self, record: &OrderBookRecord) -> u64 {
        let mut quotes = self.quotes.lock();
        let cell = quotes
            .entry(record.code.clone())
            .or_insert_with(|| watch::channel(QuoteSnapshot::default()).0);

        let mut seq = 0;
        cell.send_modify(|quote| {
            quote.seq += 1;
            quote.ask_price = record.ask_price;
            quote.ask_qty = record.ask_qty;
            quote.bid_price = record.bid_price;
            quote.bid_qty = record.bid_qty;
            seq = quote.seq;
        });
        seq
    }

    /// Store a trade tick and return its sequence number
    pub fn apply_trade(&self, record: &TradeRecord) -> u64 {
        let mut trades = self.trades.lock();
        let cell = trades
            .entry(record.code.clone())
            .or_insert_with(|| watch::channel(TradeTick::default()).0);

        let mut seq = 0;
        cell.send_modify(|tick| {
            tick.seq += 1;
            tick.price = record.price;
            seq = tick.seq;
        });
        seq
    }

    /// Route a real fill to its order's queue
    pub fn push_fill(&self, fill: FillEvent) {
        let mut book = self.fills.lock();
        if book.closed.contains(&fill.order_id) {
            warn!(
                order_id = %fill.order_id,
                code = %fill.code,
                qty = fill.quantity,
                price = fill.price,
                "Fill arrived after its collection window closed"
            );
            return;
        }
        let queue = book
            .queues
            .entry(fill.order_id.clone())
            .or_insert_with(FillQueue::new);
        // The receiver lives in the same entry until the waiter removes both
        let _ = queue.tx.send(fill);
    }

    /// Mark the streaming connection as gone; wakes every waiter
    pub fn mark_connection_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.connection.send_if_modified(|status| {
            if status.is_some() {
                return false;
            }
            *status = Some(reason);
            true
        });
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Latest quote for `code`; sequence 0 when none has arrived
    pub fn quote(&self, code: &str) -> QuoteSnapshot {
        self.quotes
            .lock()
            .get(code)
            .map(|cell| *cell.borrow())
            .unwrap_or_default()
    }

    /// Latest trade for `code`; sequence 0 when none has arrived
    pub fn trade(&self, code: &str) -> TradeTick {
        self.trades
            .lock()
            .get(code)
            .map(|cell| *cell.borrow())
            .unwrap_or_default()
    }

    /// Reason the connection was lost, if it was
    pub fn connection_error(&self) -> Option<String> {
        self.connection.borrow().clone()
    }

    fn watch_quote(&self, code: &str) -> watch::Receiver<QuoteSnapshot> {
        self.quotes
            .lock()
            .entry(code.to_string())
            .or_insert_with(|| watch::channel(QuoteSnapshot::default()).0)
            .subscribe()
    }

    fn watch_trade(&self, code: &str) -> watch::Receiver<TradeTick> {
        self.trades
            .lock()
            .entry(code.to_string())
            .or_insert_with(|| watch::channel(TradeTick::default()).0)
            .subscribe()
    }

    /// Resolves once the connection is lost
    pub async fn connection_lost(&self) -> BotError {
        let mut status = self.connection.subscribe();
        let reason = match status.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "market state dropped".to_string(),
        };
        BotError::ConnectionLost(reason)
    }

    // ========================================================================
    // Waits
    // ========================================================================

    /// Wait for a quote newer than `last_seq`
    ///
    /// Returns the most recent snapshot at the time of wake. Fails with
    /// `WaitTimeout` after `timeout` and with `ConnectionLost` if the stream
    /// dies first.
    pub async fn await_next_quote(
        &self,
        code: &str,
        last_seq: u64,
        timeout: Duration,
    ) -> Result<QuoteSnapshot> {
        let mut rx = self.watch_quote(code);

        tokio::select! {
            lost = self.connection_lost() => Err(lost),
            waited = tokio::time::timeout(timeout, rx.wait_for(|q| q.seq > last_seq)) => {
                match waited {
                    Ok(Ok(snapshot)) => Ok(*snapshot),
                    Ok(Err(_)) => Err(BotError::ConnectionLost("quote cell closed".to_string())),
                    Err(_) => Err(BotError::WaitTimeout(format!(
                        "no quote for {} after seq {} within {:?}",
                        code, last_seq, timeout
                    ))),
                }
            }
        }
    }

    /// Wait until the last trade for `code` is at or above `target`
    ///
    /// Returns immediately when the latest trade already satisfies the
    /// target. Re-checks the wall-clock deadline at least every `poll`.
    pub async fn await_trade_at_or_above(
        &self,
        code: &str,
        target: i64,
        deadline: DateTime<FixedOffset>,
        poll: Duration,
    ) -> Result<TradeWait> {
        let mut rx = self.watch_trade(code);

        loop {
            let remaining = time::until(deadline);
            if remaining.is_zero() {
                return Ok(TradeWait::DeadlineReached);
            }
            let slice = remaining.min(poll);

            tokio::select! {
                lost = self.connection_lost() => return Err(lost),
                waited = async {
                    tokio::time::timeout(slice, rx.wait_for(|t| t.seq > 0 && t.price >= target))
                        .await
                        .map(|r| r.map(|tick| tick.price))
                } => {
                    match waited {
                        Ok(Ok(price)) => return Ok(TradeWait::Reached(price)),
                        Ok(Err(_)) => {
                            return Err(BotError::ConnectionLost("trade cell closed".to_string()))
                        }
                        Err(_) => {
                            let last = *rx.borrow();
                            debug!(code, target, last_price = last.price, seq = last.seq, "Target not reached yet");
                        }
                    }
                }
            }
        }
    }

    /// Collect the fills of one IOC order
    ///
    /// Waits up to `total` for the first fill; none is a valid outcome and
    /// yields an empty summary. After the first fill, keeps draining until
    /// no further fill arrives within `idle`.
    pub async fn await_order_fills(
        &self,
        order_id: &str,
        total: Duration,
        idle: Duration,
    ) -> FillSummary {
        let mut summary = FillSummary::default();

        let rx = {
            let mut book = self.fills.lock();
            book.queues
                .entry(order_id.to_string())
                .or_insert_with(FillQueue::new)
                .rx
                .take()
        };
        let Some(mut rx) = rx else {
            warn!(order_id, "Fill queue already has a waiter");
            return summary;
        };

        match tokio::time::timeout(total, rx.recv()).await {
            Ok(Some(fill)) => {
                summary.record(&fill);
                loop {
                    match tokio::time::timeout(idle, rx.recv()).await {
                        Ok(Some(fill)) => summary.record(&fill),
                        _ => break,
                    }
                }
            }
            _ => debug!(order_id, ?total, "No fill within total timeout"),
        }

        self.fills.lock().close(order_id);
        // Anything that raced in after the idle gap but before removal
        while let Ok(fill) = rx.try_recv() {
            summary.record(&fill);
        }

        if !summary.is_empty() {
            info!(
                order_id,
                qty = summary.quantity,
                notional = summary.notional,
                "Collected fills"
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn book(code: &str, ask: i64, bid: i64) -> OrderBookRecord {
        OrderBookRecord {
            code: code.to_string(),
            ask_price: ask,
            ask_qty: 10,
            bid_price: bid,
            bid_qty: 20,
        }
    }

    fn fill(order_id: &str, qty: i64, price: i64) -> FillEvent {
        FillEvent {
            order_id: order_id.to_string(),
            code: "005930".to_string(),
            quantity: qty,
            price,
            raw_fields: vec![],
        }
    }

    #[test]
    fn test_sequence_increments_per_instrument() {
        let state = MarketState::new();
        assert_eq!(state.apply_order_book(&book("A", 100, 99)), 1);
        assert_eq!(state.apply_order_book(&book("A", 101, 100)), 2);
        assert_eq!(state.apply_order_book(&book("B", 5, 4)), 1);
        assert_eq!(state.quote("A").ask_price, 101);
        assert_eq!(state.quote("missing").seq, 0);
    }

    #[tokio::test]
    async fn test_next_quote_returns_immediately_when_newer_exists() {
        let state = MarketState::new();
        state.apply_order_book(&book("A", 100, 99));
        state.apply_order_book(&book("A", 101, 100));

        let quote = state
            .await_next_quote("A", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(quote.seq, 2);
        assert_eq!(quote.ask_price, 101);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_quote_wakes_on_update() {
        let state = Arc::new(MarketState::new());
        state.apply_order_book(&book("A", 100, 99));

        let writer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.apply_order_book(&book("A", 102, 101));
        });

        let quote = state
            .await_next_quote("A", 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(quote.seq, 2);
        assert_eq!(quote.ask_price, 102);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_quote_times_out_on_stale_data() {
        let state = MarketState::new();
        state.apply_order_book(&book("A", 100, 99));

        let err = state
            .await_next_quote("A", 1, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::WaitTimeout(_)));
    }

    #[tokio::test]
    async fn test_connection_loss_ends_waits() {
        let state = MarketState::new();
        state.mark_connection_lost("peer closed");

        let err = state
            .await_next_quote("A", 0, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(state.connection_error().as_deref(), Some("peer closed"));
    }

    #[tokio::test]
    async fn test_trade_already_satisfied_returns_immediately() {
        let state = MarketState::new();
        state.apply_trade(&TradeRecord {
            code: "A".to_string(),
            price: 1010,
        });
        let deadline = time::kst_now() + chrono::Duration::seconds(30);

        let outcome = state
            .await_trade_at_or_above("A", 1001, deadline, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(outcome, TradeWait::Reached(1010));
    }

    #[tokio::test]
    async fn test_trade_deadline_in_past() {
        let state = MarketState::new();
        let deadline = time::kst_now() - chrono::Duration::seconds(1);

        let outcome = state
            .await_trade_at_or_above("A", 1001, deadline, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(outcome, TradeWait::DeadlineReached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fills_aggregate_until_idle_gap() {
        let state = Arc::new(MarketState::new());
        // Arrives before anyone waits
        state.push_fill(fill("0001", 10, 1000));

        let writer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.push_fill(fill("0001", 5, 995));
            tokio::time::sleep(Duration::from_secs(2)).await;
            writer.push_fill(fill("0001", 7, 990));
        });

        let summary = state
            .await_order_fills("0001", Duration::from_secs(3), Duration::from_millis(500))
            .await;
        assert_eq!(summary, FillSummary::new(15, 10 * 1000 + 5 * 995));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fill_is_empty_summary() {
        let state = MarketState::new();
        state.push_fill(fill("other", 1, 1));

        let summary = state
            .await_order_fills("0002", Duration::from_millis(300), Duration::from_millis(50))
            .await;
        assert!(summary.is_empty());
        assert_eq!(summary.notional, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fill_is_not_queued() {
        let state = MarketState::new();
        let _ = state
            .await_order_fills("0003", Duration::from_millis(10), Duration::from_millis(10))
            .await;
        state.push_fill(fill("0003", 1, 1));
        assert!(state.fills.lock().queues.is_empty());
    }

    #[test]
    fn test_closed_orders_are_bounded() {
        let mut book = FillBook::default();
        for i in 0..CLOSED_ORDER_LIMIT + 5 {
            book.close(&format!("{:010}", i));
        }
        book.close(&format!("{:010}", CLOSED_ORDER_LIMIT + 4));

        assert_eq!(book.closed.len(), CLOSED_ORDER_LIMIT);
        assert_eq!(book.closed_order.len(), CLOSED_ORDER_LIMIT);
        assert!(!book.closed.contains("0000000004"));
        assert!(book.closed.contains("0000000005"));
    }
}
