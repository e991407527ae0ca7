//! Lossless canonicalizer.
//!
//! Volatile tokens (timestamps, UUIDs, long hex runs, long integers) are
//! replaced by per-class sentinels so the template miner sees a stable line
//! shape. The stripped originals travel in a typed side vector; each payload
//! is a compact reversible packing rather than the raw text, so even the
//! side channel compresses:
//!
//! - ISO timestamps become epoch seconds plus style flags (`T` vs space,
//!   trailing `Z`, fraction width + value),
//! - epoch-second runs and integer runs become digit-length + value
//!   (digit-length keeps leading zeros),
//! - UUID and hex runs become raw bytes plus a case bitmap (1 bit per hex
//!   char, so `DeadBeef` survives).
//!
//! The scan is a single left-to-right pass over one compiled alternation;
//! class precedence at equal start positions is TS > UUID > HEX > INT via
//! alternation order. `canonicalize` is total: anything that fails a
//! stricter packing falls back to a verbatim payload variant, and a line
//! that already contains a sentinel substring is passed through untouched so
//! reinflation can never mis-target.

use chrono::{TimeZone, Utc};
use regex::Regex;

use crate::error::{Result, UscError};
use crate::varint::{decode_uvarint, encode_uvarint, unzigzag, zigzag};

pub const TS_SENTINEL: &str = "<TS>";
pub const UUID_SENTINEL: &str = "<UUID>";
pub const HEX_SENTINEL: &str = "<HEX>";
pub const INT_SENTINEL: &str = "<INT>";

pub const SENTINELS: [&str; 4] = [TS_SENTINEL, UUID_SENTINEL, HEX_SENTINEL, INT_SENTINEL];

// Timestamp payload variants.
const TS_ISO: u64 = 0;
const TS_EPOCH: u64 = 1;
const TS_VERBATIM: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideKind {
    Ts,
    Uuid,
    Hex,
    Int,
}

impl SideKind {
    pub fn sentinel(self) -> &'static str {
        match self {
            SideKind::Ts => TS_SENTINEL,
            SideKind::Uuid => UUID_SENTINEL,
            SideKind::Hex => HEX_SENTINEL,
            SideKind::Int => INT_SENTINEL,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            SideKind::Ts => 1,
            SideKind::Uuid => 2,
            SideKind::Hex => 3,
            SideKind::Int => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SideKind::Ts),
            2 => Some(SideKind::Uuid),
            3 => Some(SideKind::Hex),
            4 => Some(SideKind::Int),
            _ => None,
        }
    }
}

/// One stripped original: the class plus its packed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideToken {
    pub kind: SideKind,
    pub payload: Vec<u8>,
}

const PATTERN: &str = r"\b(?:(?P<ts>\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?Z?)|(?P<uuid>[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})|(?P<epoch>\d{10,19})|(?P<hex>[0-9a-fA-F]{8,})|(?P<int>\d{6,}))\b";

/// Session-owned matcher; the alternation is compiled once and reused for
/// every line.
pub struct Canonicalizer {
    re: Regex,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Canonicalizer {
    pub fn new() -> Self {
        let re = Regex::new(PATTERN).expect("canonicalizer pattern is static");
        Canonicalizer { re }
    }

    /// Replaces volatile tokens with sentinels, returning the canonical line
    /// and the side vector in line order. Pure; never fails.
    pub fn canonicalize(&self, line: &str) -> (String, Vec<SideToken>) {
        if SENTINELS.iter().any(|s| line.contains(s)) {
            return (line.to_owned(), Vec::new());
        }

        let mut out = String::with_capacity(line.len());
        let mut tokens: Vec<SideToken> = Vec::new();
        let mut last = 0usize;

        for caps in self.re.captures_iter(line) {
            let m = caps.get(0).unwrap();
            out.push_str(&line[last..m.start()]);
            last = m.end();

            let text = m.as_str();
            let packed = if caps.name("ts").is_some() {
                Some(SideToken {
                    kind: SideKind::Ts,
                    payload: pack_ts_iso(text),
                })
            } else if caps.name("uuid").is_some() {
                Some(SideToken {
                    kind: SideKind::Uuid,
                    payload: pack_uuid(text),
                })
            } else if caps.name("epoch").is_some() {
                pack_digits(text, TS_EPOCH).map(|payload| SideToken {
                    kind: SideKind::Ts,
                    payload,
                })
            } else if caps.name("hex").is_some() {
                Some(SideToken {
                    kind: SideKind::Hex,
                    payload: pack_hex(text),
                })
            } else {
                pack_int(text).map(|payload| SideToken {
                    kind: SideKind::Int,
                    payload,
                })
            };

            match packed {
                Some(tok) => {
                    out.push_str(tok.kind.sentinel());
                    tokens.push(tok);
                }
                // Defensive: a run the packer cannot represent stays literal.
                None => out.push_str(text),
            }
        }
        out.push_str(&line[last..]);
        (out, tokens)
    }
}

/// Restores the original line from a canonical line and its side vector.
/// Each token replaces the first remaining occurrence of its own sentinel,
/// so per-class ordering is positional.
pub fn uncanonicalize(canon: &str, tokens: &[SideToken]) -> Result<String> {
    let mut out = canon.to_owned();
    for tok in tokens {
        let needle = tok.kind.sentinel();
        let rendered = render_side_token(tok)?;
        if let Some(idx) = out.find(needle) {
            out.replace_range(idx..idx + needle.len(), &rendered);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// payload packing
// ---------------------------------------------------------------------------

/// 1 bit per hex char, LSB-first: set = uppercase.
fn hex_case_bitmap(s: &str) -> Vec<u8> {
    let mut out = vec![0u8; s.len().div_ceil(8)];
    for (i, ch) in s.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn apply_hex_case_bitmap(lower: &str, bitmap: &[u8]) -> String {
    lower
        .chars()
        .enumerate()
        .map(|(i, ch)| {
            let upper = bitmap.get(i / 8).is_some_and(|b| b >> (i % 8) & 1 == 1);
            if upper {
                ch.to_ascii_uppercase()
            } else {
                ch
            }
        })
        .collect()
}

fn hex_value(nibble: u8) -> Option<u8> {
    match nibble {
        b'0'..=b'9' => Some(nibble - b'0'),
        b'a'..=b'f' => Some(nibble - b'a' + 10),
        b'A'..=b'F' => Some(nibble - b'A' + 10),
        _ => None,
    }
}

/// Hex chars -> raw bytes; odd lengths get a leading zero nibble.
fn hex_to_bytes(s: &str) -> Vec<u8> {
    let mut nibbles: Vec<u8> = Vec::with_capacity(s.len() + 1);
    if s.len() % 2 == 1 {
        nibbles.push(0);
    }
    nibbles.extend(s.bytes().filter_map(hex_value));
    nibbles.chunks(2).map(|p| (p[0] << 4) | p[1]).collect()
}

fn bytes_to_hex_lower(raw: &[u8]) -> String {
    let mut s = String::with_capacity(raw.len() * 2);
    for b in raw {
        s.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
        s.push(char::from_digit((b & 0x0F) as u32, 16).unwrap_or('0'));
    }
    s
}

fn pack_ts_iso(text: &str) -> Vec<u8> {
    // Shape is pinned by the regex: YYYY-MM-DD{T, }HH:MM:SS[.frac][Z]
    let b = text.as_bytes();
    let year: i32 = text[0..4].parse().unwrap_or(0);
    let mon: u32 = text[5..7].parse().unwrap_or(0);
    let day: u32 = text[8..10].parse().unwrap_or(0);
    let sep_t = b[10] == b'T';
    let hh: u32 = text[11..13].parse().unwrap_or(0);
    let mi: u32 = text[14..16].parse().unwrap_or(0);
    let ss: u32 = text[17..19].parse().unwrap_or(0);

    let z_flag = text.ends_with('Z');
    let frac_end = if z_flag { text.len() - 1 } else { text.len() };
    let frac = if b.len() > 19 && b[19] == b'.' {
        &text[20..frac_end]
    } else {
        ""
    };

    let dt = Utc.with_ymd_and_hms(year, mon, day, hh, mi, ss).single();
    let frac_val = if frac.is_empty() {
        Some(0u64)
    } else {
        frac.parse::<u64>().ok()
    };

    let mut out = Vec::new();
    match (dt, frac_val) {
        (Some(dt), Some(frac_val)) if frac.len() <= 19 => {
            encode_uvarint(TS_ISO, &mut out);
            encode_uvarint(zigzag(dt.timestamp()), &mut out);
            encode_uvarint(sep_t as u64, &mut out);
            encode_uvarint(z_flag as u64, &mut out);
            encode_uvarint(frac.len() as u64, &mut out);
            encode_uvarint(frac_val, &mut out);
        }
        // Matched the shape but is not a real datetime (month 99, 61st
        // second, oversized fraction): keep the bytes as-is.
        _ => {
            encode_uvarint(TS_VERBATIM, &mut out);
            out.extend_from_slice(text.as_bytes());
        }
    }
    out
}

/// Digit run -> digit count + value. `None` when the value exceeds u64
/// (cannot happen for the 6-19 digit runs the patterns admit).
fn pack_digits(text: &str, variant: u64) -> Option<Vec<u8>> {
    let val: u64 = text.parse().ok()?;
    let mut out = Vec::new();
    encode_uvarint(variant, &mut out);
    encode_uvarint(text.len() as u64, &mut out);
    encode_uvarint(val, &mut out);
    Some(out)
}

fn pack_int(text: &str) -> Option<Vec<u8>> {
    let val: u64 = text.parse().ok()?;
    let mut out = Vec::new();
    encode_uvarint(text.len() as u64, &mut out);
    encode_uvarint(val, &mut out);
    Some(out)
}

fn pack_uuid(text: &str) -> Vec<u8> {
    let hexchars: String = text.chars().filter(|&c| c != '-').collect();
    let raw = hex_to_bytes(&hexchars.to_ascii_lowercase());
    let bitmap = hex_case_bitmap(&hexchars);
    let mut out = Vec::with_capacity(16 + 1 + bitmap.len());
    out.extend_from_slice(&raw);
    encode_uvarint(bitmap.len() as u64, &mut out);
    out.extend_from_slice(&bitmap);
    out
}

fn pack_hex(text: &str) -> Vec<u8> {
    let raw = hex_to_bytes(&text.to_ascii_lowercase());
    let bitmap = hex_case_bitmap(text);
    let mut out = Vec::new();
    encode_uvarint(text.len() as u64, &mut out);
    encode_uvarint(raw.len() as u64, &mut out);
    out.extend_from_slice(&raw);
    encode_uvarint(bitmap.len() as u64, &mut out);
    out.extend_from_slice(&bitmap);
    out
}

// ---------------------------------------------------------------------------
// payload rendering
// ---------------------------------------------------------------------------

/// Renders a side token back to its original text.
pub fn render_side_token(tok: &SideToken) -> Result<String> {
    let p = &tok.payload;
    let mut pos = 0usize;
    match tok.kind {
        SideKind::Ts => {
            let variant = decode_uvarint(p, &mut pos)?;
            match variant {
                TS_ISO => {
                    let epoch = unzigzag(decode_uvarint(p, &mut pos)?);
                    let sep_t = decode_uvarint(p, &mut pos)? == 1;
                    let z_flag = decode_uvarint(p, &mut pos)? == 1;
                    let frac_digits = decode_uvarint(p, &mut pos)? as usize;
                    let frac_val = decode_uvarint(p, &mut pos)?;

                    let dt = Utc
                        .timestamp_opt(epoch, 0)
                        .single()
                        .ok_or_else(|| UscError::truncated(pos, "timestamp out of range"))?;
                    let fmt = if sep_t {
                        "%Y-%m-%dT%H:%M:%S"
                    } else {
                        "%Y-%m-%d %H:%M:%S"
                    };
                    let mut s = dt.format(fmt).to_string();
                    if frac_digits > 0 {
                        s.push('.');
                        s.push_str(&format!("{:0>width$}", frac_val, width = frac_digits));
                    }
                    if z_flag {
                        s.push('Z');
                    }
                    Ok(s)
                }
                TS_EPOCH => render_digits(p, &mut pos),
                TS_VERBATIM => String::from_utf8(p[pos..].to_vec())
                    .map_err(|_| UscError::truncated(pos, "timestamp payload not utf-8")),
                _ => Err(UscError::truncated(pos, "unknown timestamp variant")),
            }
        }
        SideKind::Uuid => {
            if p.len() < 16 {
                return Err(UscError::truncated(0, "uuid payload too short"));
            }
            let lower = bytes_to_hex_lower(&p[..16]);
            pos = 16;
            let blen = decode_uvarint(p, &mut pos)? as usize;
            let bitmap = p
                .get(pos..pos + blen)
                .ok_or_else(|| UscError::truncated(pos, "uuid bitmap truncated"))?;
            let cased = apply_hex_case_bitmap(&lower, bitmap);
            Ok(format!(
                "{}-{}-{}-{}-{}",
                &cased[0..8],
                &cased[8..12],
                &cased[12..16],
                &cased[16..20],
                &cased[20..32]
            ))
        }
        SideKind::Hex => {
            let char_len = decode_uvarint(p, &mut pos)? as usize;
            let raw_len = decode_uvarint(p, &mut pos)? as usize;
            let raw = p
                .get(pos..pos + raw_len)
                .ok_or_else(|| UscError::truncated(pos, "hex payload truncated"))?;
            pos += raw_len;
            let blen = decode_uvarint(p, &mut pos)? as usize;
            let bitmap = p
                .get(pos..pos + blen)
                .ok_or_else(|| UscError::truncated(pos, "hex bitmap truncated"))?;

            let mut lower = bytes_to_hex_lower(raw);
            if char_len % 2 == 1 && !lower.is_empty() {
                lower.remove(0);
            }
            if lower.len() != char_len {
                return Err(UscError::truncated(pos, "hex length mismatch"));
            }
            Ok(apply_hex_case_bitmap(&lower, bitmap))
        }
        SideKind::Int => render_digits(p, &mut pos),
    }
}

fn render_digits(p: &[u8], pos: &mut usize) -> Result<String> {
    let digit_len = decode_uvarint(p, pos)? as usize;
    let val = decode_uvarint(p, pos)?;
    Ok(format!("{:0>width$}", val, width = digit_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(line: &str) -> (String, Vec<SideToken>) {
        let canon = Canonicalizer::new();
        let (c, toks) = canon.canonicalize(line);
        assert_eq!(uncanonicalize(&c, &toks).unwrap(), line, "line: {line}");
        (c, toks)
    }

    #[test]
    fn mixed_line_canonical_form() {
        let line = "2024-01-01 00:00:00 uid=550e8400-e29b-41d4-a716-446655440000 v=1234567";
        let (c, toks) = roundtrip(line);
        assert_eq!(c, "<TS> uid=<UUID> v=<INT>");
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[0].kind, SideKind::Ts);
        assert_eq!(toks[1].kind, SideKind::Uuid);
        assert_eq!(toks[2].kind, SideKind::Int);
    }

    #[test]
    fn iso_styles_roundtrip() {
        roundtrip("ts=2023-06-05T01:02:03Z done");
        roundtrip("ts=2023-06-05 01:02:03 done");
        roundtrip("ts=2023-06-05T01:02:03.125Z done");
        roundtrip("ts=2023-06-05 23:59:59.000001 done");
    }

    #[test]
    fn invalid_calendar_date_is_verbatim() {
        let (c, toks) = roundtrip("bad=9999-99-99 99:99:99 end");
        assert_eq!(c, "bad=<TS> end");
        assert_eq!(toks.len(), 1);
    }

    #[test]
    fn epoch_run_is_timestamp_class() {
        let (c, toks) = roundtrip("t=1700000000 ok");
        assert_eq!(c, "t=<TS> ok");
        assert_eq!(toks[0].kind, SideKind::Ts);
    }

    #[test]
    fn leading_zeros_preserved() {
        roundtrip("v=0012345 pad");
        roundtrip("t=0170000000 pad");
    }

    #[test]
    fn hex_case_and_odd_length_roundtrip() {
        let (c, _) = roundtrip("blob=DeadBeef11 tail");
        assert_eq!(c, "blob=<HEX> tail");
        roundtrip("blob=abcdef123 odd");
        roundtrip("blk_-1608999687919862906");
    }

    #[test]
    fn uuid_uppercase_roundtrip() {
        let (c, toks) = roundtrip("id=550E8400-E29B-41D4-A716-446655440000");
        assert_eq!(c, "id=<UUID>");
        assert_eq!(toks[0].kind, SideKind::Uuid);
    }

    #[test]
    fn short_runs_stay_literal() {
        let canon = Canonicalizer::new();
        let (c, toks) = canon.canonicalize("n=12345 h=abc123");
        assert_eq!(c, "n=12345 h=abc123");
        assert!(toks.is_empty());
    }

    #[test]
    fn sentinel_collision_passes_through() {
        let canon = Canonicalizer::new();
        let line = "weird <TS> 1234567890 text";
        let (c, toks) = canon.canonicalize(line);
        assert_eq!(c, line);
        assert!(toks.is_empty());
        assert_eq!(uncanonicalize(&c, &toks).unwrap(), line);
    }

    #[test]
    fn digit_run_classes_by_length() {
        let canon = Canonicalizer::new();
        // 6-7 digits -> INT, 8-9 -> HEX (hex admits decimals), 10-19 -> TS.
        assert_eq!(canon.canonicalize("x 123456").0, "x <INT>");
        assert_eq!(canon.canonicalize("x 12345678").0, "x <HEX>");
        assert_eq!(canon.canonicalize("x 12345678901").0, "x <TS>");
        roundtrip("x 123456");
        roundtrip("x 12345678");
        roundtrip("x 12345678901");
    }

    #[test]
    fn word_boundary_guard() {
        let canon = Canonicalizer::new();
        let (c, toks) = canon.canonicalize("id_123456789012xyz literal");
        assert_eq!(c, "id_123456789012xyz literal");
        assert!(toks.is_empty());
    }
}
