//! Exchange-segment codes and the free-form-string detector (spec §3).

use serde::{Deserialize, Serialize};

/// Venue + market segment, carried as a single wire byte in every tick frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExchangeSegment {
    NseCm = 1,
    NseFo = 2,
    BseCm = 3,
    BseFo = 4,
    Mcx = 5,
    Ncdex = 7,
    Cds = 13,
}

impl ExchangeSegment {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::NseCm),
            2 => Some(Self::NseFo),
            3 => Some(Self::BseCm),
            4 => Some(Self::BseFo),
            5 => Some(Self::Mcx),
            7 => Some(Self::Ncdex),
            13 => Some(Self::Cds),
            _ => None,
        }
    }

    /// Divisor applied to the raw signed price integer when decoding (§4.1).
    pub fn price_divisor(self) -> f64 {
        match self {
            Self::Cds => 10_000_000.0,
            _ => 100.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NseCm => "NSE",
            Self::NseFo => "NFO",
            Self::BseCm => "BSE",
            Self::BseFo => "BFO",
            Self::Mcx => "MCX",
            Self::Ncdex => "NCDEX",
            Self::Cds => "CDS",
        }
    }
}

/// Maps a free-form exchange string (as stored on an order plan, or embedded
/// in a trading symbol like `NIFTY28AUG2524000PE`) to a segment code.
///
/// Defaults to NSE cash when nothing more specific is recognised.
pub fn detect(exchange_or_symbol: &str) -> ExchangeSegment {
    let s = exchange_or_symbol.trim().to_uppercase();
    match s.as_str() {
        "NSE" | "NSE_CM" | "NSE_EQ" => return ExchangeSegment::NseCm,
        "NFO" | "NSE_FO" => return ExchangeSegment::NseFo,
        "BSE" | "BSE_CM" | "BSE_EQ" => return ExchangeSegment::BseCm,
        "BFO" | "BSE_FO" => return ExchangeSegment::BseFo,
        "MCX" | "MCX_FO" => return ExchangeSegment::Mcx,
        "NCDEX" => return ExchangeSegment::Ncdex,
        "CDS" | "NSE_CD" | "BCD" => return ExchangeSegment::Cds,
        _ => {}
    }

    // Not a bare exchange code: treat it as a trading-symbol-like string and
    // sniff derivative suffixes (options/futures expiries live on F&O segments).
    let looks_like_option = s.ends_with("CE") || s.ends_with("PE");
    let looks_like_future = s.ends_with("FUT");
    if looks_like_option || looks_like_future {
        return ExchangeSegment::NseFo;
    }

    ExchangeSegment::NseCm
}
