//! Decoders for the KIS websocket wire format
//!
//! Frames come in two shapes:
//!
//! ```text
//! {"header": {...}, "body": {...}}          control: acks, key material, PINGPONG
//! <flag>|<tr_id>|<count>|<f0>^<f1>^...      market data or encrypted notice
//! ```
//!
//! Each frame kind has exactly one decoder returning a structured record, so
//! field offsets never leak past this module.

use crate::common::errors::FrameDecodeError;
use crate::kis::messages::ControlFrame;

/// Flag marking an encrypted payload
pub const ENCRYPTED_FLAG: &str = "1";

/// tr_id of the server heartbeat
pub const PINGPONG_TR_ID: &str = "PINGPONG";

// Order-book payload offsets
const OB_CODE: usize = 0;
const OB_ASK1: usize = 3;
const OB_BID1: usize = 13;
const OB_ASK1_QTY: usize = 23;
const OB_BID1_QTY: usize = 33;

// Trade-tick payload offsets
const TR_CODE: usize = 0;
const TR_PRICE: usize = 2;

// Execution-notice offsets (after decryption)
const EX_ORDER_ID: usize = 2;
const EX_CODE: usize = 8;
const EX_QTY: usize = 9;
const EX_PRICE: usize = 10;
const EX_REJECT: usize = 12;
const EX_EXECUTED: usize = 13;
const EX_ACCEPTED: usize = 14;

/// A received text frame, split by shape
#[derive(Debug)]
pub enum RawFrame<'a> {
    Control(ControlFrame),
    Data(Envelope<'a>),
}

/// The `|`-delimited envelope of a data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub flag: &'a str,
    pub tr_id: &'a str,
    pub count: &'a str,
    pub payload: &'a str,
}

impl Envelope<'_> {
    pub fn is_encrypted(&self) -> bool {
        self.flag == ENCRYPTED_FLAG
    }

    /// Number of records in the payload, at least one
    pub fn record_count(&self) -> usize {
        self.count.trim().parse::<usize>().unwrap_or(1).max(1)
    }
}

/// Top-of-book fields of one order-book record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookRecord {
    pub code: String,
    pub ask_price: i64,
    pub ask_qty: i64,
    pub bid_price: i64,
    pub bid_qty: i64,
}

/// One trade-tick record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    pub code: String,
    pub price: i64,
}

/// A decrypted execution notice, fill or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionNotice {
    pub order_id: String,
    pub code: String,
    pub quantity: i64,
    pub price: i64,
    pub reject_flag: String,
    pub executed_flag: String,
    pub accepted_flag: String,
    pub fields: Vec<String>,
}

impl ExecutionNotice {
    pub fn is_rejected(&self) -> bool {
        is_truthy(&self.reject_flag)
    }

    /// Not rejected and carrying a concrete quantity and price
    pub fn is_fill(&self) -> bool {
        !self.is_rejected() && self.quantity > 0 && self.price > 0
    }
}

/// Split a text frame into control JSON or a data envelope
pub fn classify(text: &str) -> Result<RawFrame<'_>, FrameDecodeError> {
    if text.trim_start().starts_with('{') {
        let frame: ControlFrame = serde_json::from_str(text)
            .map_err(|e| FrameDecodeError::Control(e.to_string()))?;
        return Ok(RawFrame::Control(frame));
    }
    parse_envelope(text).map(RawFrame::Data)
}

/// Split `flag|tr_id|count|payload`; the payload may itself contain `|`
pub fn parse_envelope(text: &str) -> Result<Envelope<'_>, FrameDecodeError> {
    let parts: Vec<&str> = text.splitn(4, '|').collect();
    match parts.as_slice() {
        &[flag, tr_id, count, payload] => Ok(Envelope {
            flag,
            tr_id,
            count,
            payload,
        }),
        _ => Err(FrameDecodeError::Envelope(parts.len())),
    }
}

/// Decode one order-book payload
pub fn decode_order_book(payload: &str) -> Result<OrderBookRecord, FrameDecodeError> {
    let fields: Vec<&str> = payload.split('^').collect();
    require_fields("order book", &fields, OB_BID1_QTY + 1)?;

    Ok(OrderBookRecord {
        code: fields[OB_CODE].trim().to_string(),
        ask_price: parse_int("ask price", fields[OB_ASK1])?,
        ask_qty: parse_int("ask qty", fields[OB_ASK1_QTY])?,
        bid_price: parse_int("bid price", fields[OB_BID1])?,
        bid_qty: parse_int("bid qty", fields[OB_BID1_QTY])?,
    })
}

/// Decode every trade record in a payload, oldest first
///
/// A payload announcing `count` records carries them back to back, each
/// with the same number of fields.
pub fn decode_trades(payload: &str, count: usize) -> Result<Vec<TradeRecord>, FrameDecodeError> {
    let fields: Vec<&str> = payload.split('^').collect();
    let per_record = if count > 1 && fields.len() % count == 0 {
        fields.len() / count
    } else {
        fields.len()
    };
    require_fields("trade", &fields, TR_PRICE + 1)?;

    fields
        .chunks(per_record)
        .map(|record| {
            require_fields("trade", record, TR_PRICE + 1)?;
            Ok(TradeRecord {
                code: record[TR_CODE].trim().to_string(),
                price: parse_int("trade price", record[TR_PRICE])?,
            })
        })
        .collect()
}

/// Decode decrypted execution-notice text
///
/// Short or non-numeric fields degrade to empty/zero, which classifies the
/// notice as a non-fill instead of dropping it unseen.
pub fn decode_execution_notice(plain: &str) -> ExecutionNotice {
    let fields: Vec<String> = plain.split('^').map(str::to_string).collect();
    let text = |i: usize| fields.get(i).map(|s| s.trim().to_string()).unwrap_or_default();
    let number = |i: usize| fields.get(i).map_or(0, |s| lenient_int(s));

    ExecutionNotice {
        order_id: text(EX_ORDER_ID),
        code: text(EX_CODE),
        quantity: number(EX_QTY),
        price: number(EX_PRICE),
        reject_flag: text(EX_REJECT),
        executed_flag: text(EX_EXECUTED),
        accepted_flag: text(EX_ACCEPTED),
        fields: fields.clone(),
    }
}

/// `Y`, `1`, `T` or `TRUE`, ignoring case and surrounding whitespace
pub fn is_truthy(flag: &str) -> bool {
    matches!(
        flag.trim().to_ascii_uppercase().as_str(),
        "Y" | "1" | "T" | "TRUE"
    )
}

fn require_fields(topic: &str, fields: &[&str], need: usize) -> Result<(), FrameDecodeError> {
    if fields.len() < need {
        return Err(FrameDecodeError::FieldCount {
            topic: topic.to_string(),
            got: fields.len(),
            need,
        });
    }
    Ok(())
}

fn parse_int(field: &'static str, value: &str) -> Result<i64, FrameDecodeError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| FrameDecodeError::NotNumeric {
            field,
            value: value.to_string(),
        })
}

fn lenient_int(value: &str) -> i64 {
    let value = value.trim();
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|f| f.trunc() as i64))
        .unwrap_or(0)
}
