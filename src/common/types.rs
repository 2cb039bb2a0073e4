//! Shared types used by the stream, the REST client and the strategy

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Venue order identifier (`ODNO`)
pub type OrderId = String;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Public market-data topics that can be subscribed per instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Top-of-book quotes
    OrderBook,
    /// Trade ticks
    TradeTick,
}

impl TopicKind {
    /// Venue transaction id for this topic
    pub fn tr_id(&self) -> &'static str {
        match self {
            TopicKind::OrderBook => "H0STASP0",
            TopicKind::TradeTick => "H0STCNT0",
        }
    }

    /// Reverse lookup from a venue transaction id
    pub fn from_tr_id(tr_id: &str) -> Option<Self> {
        match tr_id {
            "H0STASP0" => Some(TopicKind::OrderBook),
            "H0STCNT0" => Some(TopicKind::TradeTick),
            _ => None,
        }
    }
}

impl std::fmt::Display for TopicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tr_id())
    }
}

/// Latest top-of-book for one instrument, tagged with its sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuoteSnapshot {
    /// Strictly increasing per instrument; 0 means "never updated"
    pub seq: u64,
    pub ask_price: i64,
    pub ask_qty: i64,
    pub bid_price: i64,
    pub bid_qty: i64,
}

/// Latest trade tick for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TradeTick {
    pub seq: u64,
    pub price: i64,
}

/// One real fill decoded from the private execution-notice channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillEvent {
    pub order_id: OrderId,
    pub code: String,
    pub quantity: i64,
    pub price: i64,
    /// All decrypted `^`-separated fields, kept for diagnostics
    pub raw_fields: Vec<String>,
}

/// Accumulated quantity and notional over a set of fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillSummary {
    pub quantity: i64,
    /// Sum of quantity x price
    pub notional: i64,
}

impl FillSummary {
    pub fn new(quantity: i64, notional: i64) -> Self {
        Self { quantity, notional }
    }

    /// Add one fill
    pub fn record(&mut self, fill: &FillEvent) {
        self.quantity += fill.quantity;
        self.notional += fill.quantity * fill.price;
    }

    /// Fold another summary into this one
    pub fn absorb(&mut self, other: FillSummary) {
        self.quantity += other.quantity;
        self.notional += other.notional;
    }

    pub fn is_empty(&self) -> bool {
        self.quantity <= 0
    }

    /// Volume-weighted average price, `None` when nothing filled
    pub fn average_price(&self) -> Option<Decimal> {
        if self.quantity <= 0 {
            return None;
        }
        Some(Decimal::from(self.notional) / Decimal::from(self.quantity))
    }
}

/// One row of the change-percentage ranking feed
#[derive(Debug, Clone, PartialEq)]
pub struct RankingEntry {
    pub code: String,
    pub change_pct: Decimal,
}

/// The active trading interval for one day, in venue local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl SessionWindow {
    pub fn new(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> Self {
        Self { start, end }
    }

    /// Whether `now` is at or past the session end
    pub fn is_over(&self, now: DateTime<FixedOffset>) -> bool {
        now >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(qty: i64, price: i64) -> FillEvent {
        FillEvent {
            order_id: "0001".to_string(),
            code: "005930".to_string(),
            quantity: qty,
            price,
            raw_fields: Vec::new(),
        }
    }

    #[test]
    fn test_fill_summary_vwap() {
        let mut summary = FillSummary::default();
        summary.record(&fill(10, 1000));
        summary.record(&fill(5, 995));
        assert_eq!(summary.quantity, 15);
        assert_eq!(summary.notional, 14_975);
        let avg = summary.average_price().unwrap();
        assert_eq!(avg.round_dp(2), dec!(998.33));
    }

    #[test]
    fn test_empty_summary_has_no_average() {
        assert!(FillSummary::default().average_price().is_none());
        assert!(FillSummary::default().is_empty());
    }

    #[test]
    fn test_topic_round_trip() {
        for kind in [TopicKind::OrderBook, TopicKind::TradeTick] {
            assert_eq!(TopicKind::from_tr_id(kind.tr_id()), Some(kind));
        }
        assert_eq!(TopicKind::from_tr_id("H0STCNI0"), None);
    }
}
