//! Binary wire decoder (C1, spec §4.1).
//!
//! A pure function from bytes to [`DecodedFrame`]; never touches shared
//! state and never aborts the connection on a malformed frame.

pub mod types;

pub use types::{AckFrame, BestFiveLevel, DecodedFrame, FieldError, LtpTick, Ohlc, PartialTick, QuoteTick, Side, SnapQuoteTick, Tick};

use crate::exchange::ExchangeSegment;

const TOKEN_OFFSET: usize = 2;
const TOKEN_LEN: usize = 25;
const SEQUENCE_OFFSET: usize = 27;
const TIMESTAMP_OFFSET: usize = 35;
const LAST_PRICE_OFFSET: usize = 43;

const ACK_SIGNATURE_BYTE: u8 = 0x37;
const ACK_FRAME_LEN: usize = 51;
const ACK_MESSAGE_ID_OFFSET: usize = 3;
const ACK_MESSAGE_ID_LEN: usize = 4;
const ACK_STATUS_OFFSET: usize = 38;

const BEST_FIVE_OFFSET: usize = 147;
const BEST_FIVE_ENTRY_LEN: usize = 20;
const BEST_FIVE_ENTRIES: usize = 10;

/// Classify and decode one inbound vendor frame.
pub fn decode_frame(buf: &[u8]) -> DecodedFrame {
    if buf.len() >= 3 && buf[2] == ACK_SIGNATURE_BYTE {
        return decode_ack(buf);
    }

    let Some(mode) = buf.first().copied() else {
        return DecodedFrame::Unrecognized { first_byte: 0 };
    };

    match mode {
        1 => decode_ltp(buf),
        2 => decode_quote(buf),
        3 => decode_snap_quote(buf),
        other => DecodedFrame::Unrecognized { first_byte: other },
    }
}

fn decode_ack(buf: &[u8]) -> DecodedFrame {
    if buf.len() < ACK_FRAME_LEN {
        return DecodedFrame::Partial(PartialTick {
            mode: buf.first().copied().unwrap_or(0),
            token: None,
            errors: vec![FieldError {
                field: "ack_frame",
                reason: format!("frame too short for ack: {} bytes", buf.len()),
            }],
        });
    }

    let message_id = String::from_utf8_lossy(&buf[ACK_MESSAGE_ID_OFFSET..ACK_MESSAGE_ID_OFFSET + ACK_MESSAGE_ID_LEN])
        .trim_matches('\0')
        .to_string();
    let status = read_u16_le(buf, ACK_STATUS_OFFSET).unwrap_or(0);
    DecodedFrame::Ack(AckFrame { message_id, status })
}

/// Decode the common LTP header shared by every mode: token, exchange,
/// sequence, exchange timestamp, last price.
fn decode_ltp(buf: &[u8]) -> DecodedFrame {
    let mode = buf[0];
    let exchange_code = buf.get(1).copied().unwrap_or(0);
    let mut errors = Vec::new();

    let exchange = ExchangeSegment::from_code(exchange_code).unwrap_or_else(|| {
        errors.push(FieldError {
            field: "exchange",
            reason: format!("unknown exchange code {exchange_code}"),
        });
        ExchangeSegment::NseCm
    });

    let Some(token) = read_ascii_token(buf, TOKEN_OFFSET, TOKEN_LEN) else {
        return DecodedFrame::Partial(PartialTick {
            mode,
            token: None,
            errors: {
                errors.push(FieldError {
                    field: "token",
                    reason: "token field missing or not numeric".to_string(),
                });
                errors
            },
        });
    };

    let sequence = match read_u64_le(buf, SEQUENCE_OFFSET) {
        Some(v) => v,
        None => {
            errors.push(field_error("sequence", SEQUENCE_OFFSET));
            0
        }
    };
    let exchange_timestamp_ms = match read_u64_le(buf, TIMESTAMP_OFFSET) {
        Some(v) => v,
        None => {
            errors.push(field_error("exchange_timestamp", TIMESTAMP_OFFSET));
            0
        }
    };
    let last_price = match read_i32_le(buf, LAST_PRICE_OFFSET) {
        Some(raw) => raw as f64 / exchange.price_divisor(),
        None => {
            errors.push(field_error("last_price", LAST_PRICE_OFFSET));
            0.0
        }
    };

    if !errors.is_empty() {
        return DecodedFrame::Partial(PartialTick {
            mode,
            token: Some(token),
            errors,
        });
    }

    DecodedFrame::Tick(Tick::Ltp(LtpTick {
        token,
        exchange,
        sequence,
        exchange_timestamp_ms,
        last_price,
    }))
}

fn decode_quote(buf: &[u8]) -> DecodedFrame {
    let ltp = match decode_ltp(buf) {
        DecodedFrame::Tick(Tick::Ltp(t)) => t,
        other => return other,
    };

    let divisor = ltp.exchange.price_divisor();
    let mut errors = Vec::new();
    let last_qty = read_field(buf, 51, read_u64_le, &mut errors, "last_qty").unwrap_or(0);
    let avg_price = read_field(buf, 59, read_u64_le, &mut errors, "avg_price")
        .map(|v| v as f64 / divisor)
        .unwrap_or(0.0);
    let volume = read_field(buf, 67, read_u64_le, &mut errors, "volume").unwrap_or(0);
    let total_buy_qty = read_field(buf, 75, read_f64_le, &mut errors, "total_buy_qty").unwrap_or(0.0);
    let total_sell_qty = read_field(buf, 83, read_f64_le, &mut errors, "total_sell_qty").unwrap_or(0.0);
    let open = read_field(buf, 91, read_u64_le, &mut errors, "open")
        .map(|v| v as f64 / divisor)
        .unwrap_or(0.0);
    let high = read_field(buf, 99, read_u64_le, &mut errors, "high")
        .map(|v| v as f64 / divisor)
        .unwrap_or(0.0);
    let low = read_field(buf, 107, read_u64_le, &mut errors, "low")
        .map(|v| v as f64 / divisor)
        .unwrap_or(0.0);
    let close = read_field(buf, 115, read_u64_le, &mut errors, "close")
        .map(|v| v as f64 / divisor)
        .unwrap_or(0.0);

    if !errors.is_empty() {
        return DecodedFrame::Partial(PartialTick {
            mode: buf[0],
            token: Some(ltp.token),
            errors,
        });
    }

    DecodedFrame::Tick(Tick::Quote(QuoteTick {
        ltp,
        last_qty,
        avg_price,
        volume,
        total_buy_qty,
        total_sell_qty,
        ohlc: Ohlc { open, high, low, close },
    }))
}

fn decode_snap_quote(buf: &[u8]) -> DecodedFrame {
    let quote = match decode_quote(buf) {
        DecodedFrame::Tick(Tick::Quote(q)) => q,
        other => return other,
    };

    let mut errors = Vec::new();
    let last_traded_time_ms = read_field(buf, 123, read_u64_le, &mut errors, "last_traded_time").unwrap_or(0);
    let open_interest = read_field(buf, 131, read_u64_le, &mut errors, "open_interest").unwrap_or(0);
    let oi_change_pct = read_field(buf, 139, read_f64_le, &mut errors, "oi_change_pct").unwrap_or(0.0);

    let (buy_depth, sell_depth) = decode_best_five(buf, &mut errors);

    let upper_circuit = read_field(buf, 347, read_u64_le, &mut errors, "upper_circuit")
        .map(|v| v as f64 / 100.0)
        .unwrap_or(0.0);
    let lower_circuit = read_field(buf, 355, read_u64_le, &mut errors, "lower_circuit")
        .map(|v| v as f64 / 100.0)
        .unwrap_or(0.0);
    let week52_high = read_field(buf, 363, read_u64_le, &mut errors, "week52_high")
        .map(|v| v as f64 / 100.0)
        .unwrap_or(0.0);
    let week52_low = read_field(buf, 371, read_u64_le, &mut errors, "week52_low")
        .map(|v| v as f64 / 100.0)
        .unwrap_or(0.0);

    if !errors.is_empty() {
        return DecodedFrame::Partial(PartialTick {
            mode: buf[0],
            token: Some(quote.ltp.token),
            errors,
        });
    }

    DecodedFrame::Tick(Tick::SnapQuote(SnapQuoteTick {
        quote,
        last_traded_time_ms,
        open_interest,
        oi_change_pct,
        buy_depth,
        sell_depth,
        upper_circuit,
        lower_circuit,
        week52_high,
        week52_low,
    }))
}

fn decode_best_five(buf: &[u8], errors: &mut Vec<FieldError>) -> (Vec<BestFiveLevel>, Vec<BestFiveLevel>) {
    let mut buy = Vec::with_capacity(5);
    let mut sell = Vec::with_capacity(5);

    for i in 0..BEST_FIVE_ENTRIES {
        let off = BEST_FIVE_OFFSET + i * BEST_FIVE_ENTRY_LEN;
        let side_flag = match read_i16_le(buf, off) {
            Some(v) => v,
            None => {
                errors.push(field_error("best_five.side", off));
                continue;
            }
        };
        let quantity = match read_i64_le(buf, off + 2) {
            Some(v) => v,
            None => {
                errors.push(field_error("best_five.quantity", off + 2));
                continue;
            }
        };
        let price = match read_i64_le(buf, off + 10) {
            Some(v) => v as f64 / 100.0,
            None => {
                errors.push(field_error("best_five.price", off + 10));
                continue;
            }
        };
        let order_count = match read_i16_le(buf, off + 18) {
            Some(v) => v,
            None => {
                errors.push(field_error("best_five.order_count", off + 18));
                continue;
            }
        };

        let level = match side_flag {
            1 => BestFiveLevel {
                side: Side::Buy,
                quantity,
                price,
                order_count,
            },
            0 => BestFiveLevel {
                side: Side::Sell,
                quantity,
                price,
                order_count,
            },
            _ => continue, // side flag outside {0,1}: skip entry (§4.1)
        };

        match level.side {
            Side::Buy => buy.push(level),
            Side::Sell => sell.push(level),
        }
    }

    buy.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    sell.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
    buy.truncate(5);
    sell.truncate(5);

    (buy, sell)
}

fn field_error(field: &'static str, offset: usize) -> FieldError {
    FieldError {
        field,
        reason: format!("short buffer at offset {offset}"),
    }
}

fn read_field<T>(
    buf: &[u8],
    offset: usize,
    read: impl Fn(&[u8], usize) -> Option<T>,
    errors: &mut Vec<FieldError>,
    field: &'static str,
) -> Option<T> {
    match read(buf, offset) {
        Some(v) => Some(v),
        None => {
            errors.push(field_error(field, offset));
            None
        }
    }
}

fn read_ascii_token(buf: &[u8], offset: usize, len: usize) -> Option<i64> {
    let bytes = buf.get(offset..offset + len)?;
    let s = std::str::from_utf8(bytes).ok()?;
    let trimmed = s.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<i64>().ok()
}

fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let b = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn read_i16_le(buf: &[u8], offset: usize) -> Option<i16> {
    read_u16_le(buf, offset).map(|v| v as i16)
}

fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let b = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_i32_le(buf: &[u8], offset: usize) -> Option<i32> {
    read_u32_le(buf, offset).map(|v| v as i32)
}

fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    let b = buf.get(offset..offset + 8)?;
    Some(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

fn read_i64_le(buf: &[u8], offset: usize) -> Option<i64> {
    read_u64_le(buf, offset).map(|v| v as i64)
}

fn read_f64_le(buf: &[u8], offset: usize) -> Option<f64> {
    let b = buf.get(offset..offset + 8)?;
    Some(f64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_bytes(token: i64) -> [u8; TOKEN_LEN] {
        let mut out = [0u8; TOKEN_LEN];
        let s = token.to_string();
        out[..s.len()].copy_from_slice(s.as_bytes());
        out
    }

    /// Builds a synthetic mode-1/2/3 frame with the given field values so the
    /// round-trip law in spec §8 can be checked byte-for-byte.
    fn build_frame(mode: u8, exchange_code: u8, token: i64, last_price_raw: i32) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[0] = mode;
        buf[1] = exchange_code;
        buf[TOKEN_OFFSET..TOKEN_OFFSET + TOKEN_LEN].copy_from_slice(&token_bytes(token));
        buf[SEQUENCE_OFFSET..SEQUENCE_OFFSET + 8].copy_from_slice(&42u64.to_le_bytes());
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&1_700_000_000_000u64.to_le_bytes());
        buf[LAST_PRICE_OFFSET..LAST_PRICE_OFFSET + 4].copy_from_slice(&last_price_raw.to_le_bytes());

        if mode >= 2 {
            buf[51..59].copy_from_slice(&100u64.to_le_bytes());
            buf[59..67].copy_from_slice(&9950u64.to_le_bytes());
            buf[67..75].copy_from_slice(&5000u64.to_le_bytes());
            buf[75..83].copy_from_slice(&1234.0f64.to_le_bytes());
            buf[83..91].copy_from_slice(&4321.0f64.to_le_bytes());
            buf[91..99].copy_from_slice(&9900u64.to_le_bytes());
            buf[99..107].copy_from_slice(&10000u64.to_le_bytes());
            buf[107..115].copy_from_slice(&9800u64.to_le_bytes());
            buf[115..123].copy_from_slice(&9900u64.to_le_bytes());
        }

        if mode >= 3 {
            buf[123..131].copy_from_slice(&1_700_000_001_000u64.to_le_bytes());
            buf[131..139].copy_from_slice(&500u64.to_le_bytes());
            buf[139..147].copy_from_slice(&2.5f64.to_le_bytes());
            buf[347..355].copy_from_slice(&10500u64.to_le_bytes());
            buf[355..363].copy_from_slice(&9000u64.to_le_bytes());
            buf[363..371].copy_from_slice(&11000u64.to_le_bytes());
            buf[371..379].copy_from_slice(&8000u64.to_le_bytes());
        }

        buf
    }

    fn write_depth_entry(buf: &mut [u8], index: usize, side_flag: i16, qty: i64, price_raw: i64, orders: i16) {
        let off = BEST_FIVE_OFFSET + index * BEST_FIVE_ENTRY_LEN;
        buf[off..off + 2].copy_from_slice(&side_flag.to_le_bytes());
        buf[off + 2..off + 10].copy_from_slice(&qty.to_le_bytes());
        buf[off + 10..off + 18].copy_from_slice(&price_raw.to_le_bytes());
        buf[off + 18..off + 20].copy_from_slice(&orders.to_le_bytes());
    }

    #[test]
    fn decodes_ltp_frame_exactly() {
        let buf = build_frame(1, 1, 12345, 9950);
        match decode_frame(&buf) {
            DecodedFrame::Tick(Tick::Ltp(t)) => {
                assert_eq!(t.token, 12345);
                assert_eq!(t.sequence, 42);
                assert_eq!(t.exchange_timestamp_ms, 1_700_000_000_000);
                assert!((t.last_price - 99.50).abs() < 1e-9);
                assert_eq!(t.exchange, ExchangeSegment::NseCm);
            }
            other => panic!("expected ltp tick, got {other:?}"),
        }
    }

    #[test]
    fn currency_segment_uses_wide_divisor() {
        let buf = build_frame(1, 13, 1, 995_000_000);
        match decode_frame(&buf) {
            DecodedFrame::Tick(Tick::Ltp(t)) => assert!((t.last_price - 99.50).abs() < 1e-6),
            other => panic!("expected ltp tick, got {other:?}"),
        }
    }

    #[test]
    fn decodes_quote_frame_fields() {
        let buf = build_frame(2, 1, 999, 100_00);
        match decode_frame(&buf) {
            DecodedFrame::Tick(Tick::Quote(q)) => {
                assert_eq!(q.last_qty, 100);
                assert!((q.avg_price - 99.50).abs() < 1e-9);
                assert_eq!(q.volume, 5000);
                assert!((q.total_buy_qty - 1234.0).abs() < 1e-9);
                assert!((q.ohlc.open - 99.0).abs() < 1e-9);
                assert!((q.ohlc.close - 99.0).abs() < 1e-9);
            }
            other => panic!("expected quote tick, got {other:?}"),
        }
    }

    #[test]
    fn best_five_sorted_and_truncated() {
        let mut buf = build_frame(3, 1, 71933, 14_500);
        write_depth_entry(&mut buf, 0, 1, 10, 14_500, 3);
        write_depth_entry(&mut buf, 1, 1, 20, 14_495, 2);
        write_depth_entry(&mut buf, 2, 1, 30, 14_490, 1);
        write_depth_entry(&mut buf, 3, 0, 10, 14_510, 4);
        write_depth_entry(&mut buf, 4, 0, 20, 14_515, 1);
        // entries 5..10 left as all-zero side flag -> decoded as sell @ price 0, would pollute
        // sort order, so mark them with an out-of-range side flag to be skipped.
        for i in 5..10 {
            write_depth_entry(&mut buf, i, 9, 0, 0, 0);
        }

        match decode_frame(&buf) {
            DecodedFrame::Tick(Tick::SnapQuote(sq)) => {
                let buy_prices: Vec<f64> = sq.buy_depth.iter().map(|l| l.price).collect();
                let sell_prices: Vec<f64> = sq.sell_depth.iter().map(|l| l.price).collect();
                assert_eq!(buy_prices, vec![145.00, 144.95, 144.90]);
                assert_eq!(sell_prices, vec![145.10, 145.15]);
                assert!(sq.buy_depth.len() <= 5);
                assert!(sq.sell_depth.len() <= 5);
            }
            other => panic!("expected snap quote tick, got {other:?}"),
        }
    }

    #[test]
    fn ack_frame_classified_never_as_tick() {
        let mut buf = vec![0u8; ACK_FRAME_LEN];
        buf[0] = 1; // even with a mode-looking first byte
        buf[2] = 0x37;
        buf[ACK_MESSAGE_ID_OFFSET..ACK_MESSAGE_ID_OFFSET + ACK_MESSAGE_ID_LEN].copy_from_slice(b"1234");
        buf[ACK_STATUS_OFFSET..ACK_STATUS_OFFSET + 2].copy_from_slice(&307u16.to_le_bytes());

        match decode_frame(&buf) {
            DecodedFrame::Ack(ack) => {
                assert_eq!(ack.status, 307);
                assert_eq!(ack.message_id, "1234");
            }
            other => panic!("expected ack frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_mode_is_unrecognized_not_fatal() {
        let buf = vec![9u8; 64];
        assert_eq!(decode_frame(&buf), DecodedFrame::Unrecognized { first_byte: 9 });
    }

    #[test]
    fn short_frame_yields_partial_not_panic() {
        let buf = vec![1u8, 1u8];
        match decode_frame(&buf) {
            DecodedFrame::Partial(p) => assert!(p.token.is_none()),
            other => panic!("expected partial, got {other:?}"),
        }
    }
}
