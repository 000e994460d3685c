//! Typed tick records the decoder produces (spec §3, §4.1).

use crate::exchange::ExchangeSegment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestFiveLevel {
    pub side: Side,
    pub quantity: i64,
    pub price: f64,
    pub order_count: i16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LtpTick {
    pub token: i64,
    pub exchange: ExchangeSegment,
    pub sequence: u64,
    pub exchange_timestamp_ms: u64,
    pub last_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteTick {
    pub ltp: LtpTick,
    pub last_qty: u64,
    pub avg_price: f64,
    pub volume: u64,
    pub total_buy_qty: f64,
    pub total_sell_qty: f64,
    pub ohlc: Ohlc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapQuoteTick {
    pub quote: QuoteTick,
    pub last_traded_time_ms: u64,
    pub open_interest: u64,
    pub oi_change_pct: f64,
    /// Price-descending, truncated to 5 entries (§4.1).
    pub buy_depth: Vec<BestFiveLevel>,
    /// Price-ascending, truncated to 5 entries (§4.1).
    pub sell_depth: Vec<BestFiveLevel>,
    pub upper_circuit: f64,
    pub lower_circuit: f64,
    pub week52_high: f64,
    pub week52_low: f64,
}

/// A successfully decoded tick, by mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Ltp(LtpTick),
    Quote(QuoteTick),
    SnapQuote(SnapQuoteTick),
}

impl Tick {
    pub fn token(&self) -> i64 {
        match self {
            Tick::Ltp(t) => t.token,
            Tick::Quote(t) => t.ltp.token,
            Tick::SnapQuote(t) => t.quote.ltp.token,
        }
    }

    pub fn exchange(&self) -> ExchangeSegment {
        match self {
            Tick::Ltp(t) => t.exchange,
            Tick::Quote(t) => t.ltp.exchange,
            Tick::SnapQuote(t) => t.quote.ltp.exchange,
        }
    }

    pub fn last_price(&self) -> f64 {
        match self {
            Tick::Ltp(t) => t.last_price,
            Tick::Quote(t) => t.ltp.last_price,
            Tick::SnapQuote(t) => t.quote.ltp.last_price,
        }
    }

    pub fn quote(&self) -> Option<&QuoteTick> {
        match self {
            Tick::Ltp(_) => None,
            Tick::Quote(t) => Some(t),
            Tick::SnapQuote(t) => Some(&t.quote),
        }
    }

    pub fn snap_quote(&self) -> Option<&SnapQuoteTick> {
        match self {
            Tick::SnapQuote(t) => Some(t),
            _ => None,
        }
    }
}

/// Acknowledgement / control frame (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub message_id: String,
    pub status: u16,
}

/// A per-field decode failure; captured rather than aborting the frame (§4.1, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

/// A frame that was partially decoded: at least the token was recovered but
/// one or more fields after it failed to extract.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialTick {
    pub mode: u8,
    pub token: Option<i64>,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Tick(Tick),
    Partial(PartialTick),
    Ack(AckFrame),
    /// First byte didn't match a known mode and wasn't an ack signature.
    Unrecognized { first_byte: u8 },
}
