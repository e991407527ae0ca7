//! Typed slot channels.
//!
//! Every `(template, slot)` pair gets one stream per window, encoded by the
//! slot's inferred type:
//!
//! | type | window encoding |
//! |------|-----------------|
//! | INT  | first value zigzag varint, then zigzag deltas |
//! | IP   | first value as 4 raw octets, then per-octet zigzag deltas |
//! | HEX  | shared char length + fixed-width bit-packed values |
//! | DICT | 1- or 2-byte indexes into the session dictionary |
//! | RAW  | length-prefixed value bytes |
//!
//! Inference is session-scoped: a slot starts untyped with INT/IP/HEX all
//! viable, each observation kills non-matching candidates, and the highest
//! surviving candidate is promoted (and locked) at the promotion threshold.
//! A slot that never promotes becomes DICT, or RAW once its distinct-value
//! count passes the 2-byte index limit. Promotion is monotone: values that
//! contradict a promoted type later only force that window's channel back to
//! RAW via the fallback flag, and the encoder independently falls back
//! whenever the typed payload would be larger than the RAW one.

use std::collections::HashMap;

use tracing::debug;

use crate::bits::{bitpack, bits_for_maxval, bitunpack};
use crate::error::{Result, UscError};
use crate::template::{is_strict_int, is_strict_ipv4};
use crate::varint::{
    decode_bytes, decode_signed_varint, decode_uvarint, encode_bytes, encode_signed_varint,
    encode_uvarint,
};

/// Flag bit: the channel payload is the RAW encoding (by slot type or by
/// fallback).
pub const FLAG_RAW: u8 = 0x01;

const DICT_MAX_ENTRIES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    Int,
    Ip,
    Hex,
    Dict,
    Raw,
}

impl SlotType {
    pub fn tag(self) -> u8 {
        match self {
            SlotType::Int => 0,
            SlotType::Ip => 1,
            SlotType::Hex => 2,
            SlotType::Dict => 3,
            SlotType::Raw => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SlotType::Int),
            1 => Some(SlotType::Ip),
            2 => Some(SlotType::Hex),
            3 => Some(SlotType::Dict),
            4 => Some(SlotType::Raw),
            _ => None,
        }
    }
}

fn int_value(s: &str) -> Option<i64> {
    if is_strict_int(s) {
        s.parse().ok()
    } else {
        None
    }
}

fn ip_octets(s: &str) -> Option<[u8; 4]> {
    if !is_strict_ipv4(s) {
        return None;
    }
    let mut out = [0u8; 4];
    for (i, part) in s.split('.').enumerate() {
        out[i] = part.parse().ok()?;
    }
    Some(out)
}

/// Lowercase hex of at most 16 chars; the render is width-padded, so the
/// value plus the char length reproduce the token exactly.
fn hex_value(s: &str) -> Option<u64> {
    if s.is_empty()
        || s.len() > 16
        || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

// ---------------------------------------------------------------------------
// session-side type inference
// ---------------------------------------------------------------------------

struct SlotStats {
    count: u32,
    int_viable: bool,
    ip_viable: bool,
    hex_viable: bool,
    promoted: Option<SlotType>,
    distinct: Vec<String>,
    distinct_index: HashMap<String, u32>,
    overflowed: bool,
}

impl SlotStats {
    fn new() -> Self {
        SlotStats {
            count: 0,
            int_viable: true,
            ip_viable: true,
            hex_viable: true,
            promoted: None,
            distinct: Vec::new(),
            distinct_index: HashMap::new(),
            overflowed: false,
        }
    }

    fn observe(&mut self, value: &str, threshold: u32) {
        self.count += 1;

        if self.promoted.is_none() {
            self.int_viable = self.int_viable && int_value(value).is_some();
            self.ip_viable = self.ip_viable && ip_octets(value).is_some();
            self.hex_viable = self.hex_viable && hex_value(value).is_some();

            if self.count >= threshold {
                self.promoted = if self.int_viable {
                    Some(SlotType::Int)
                } else if self.ip_viable {
                    Some(SlotType::Ip)
                } else if self.hex_viable {
                    Some(SlotType::Hex)
                } else {
                    None
                };
                if self.promoted.is_some() {
                    // Promoted slots never need a dictionary.
                    self.distinct.clear();
                    self.distinct_index.clear();
                }
            }
        }

        if self.promoted.is_none() && !self.overflowed && !self.distinct_index.contains_key(value) {
            if self.distinct.len() >= DICT_MAX_ENTRIES {
                self.overflowed = true;
                self.distinct.clear();
                self.distinct_index.clear();
            } else {
                self.distinct_index
                    .insert(value.to_owned(), self.distinct.len() as u32);
                self.distinct.push(value.to_owned());
            }
        }
    }

    fn final_type(&self) -> SlotType {
        match self.promoted {
            Some(t) => t,
            None if self.overflowed => SlotType::Raw,
            None => SlotType::Dict,
        }
    }
}

/// Per-session slot typing, built during the mining pass and frozen before
/// the DICT packet is emitted.
pub struct SlotTyper {
    threshold: u32,
    per_template: Vec<Vec<SlotStats>>,
}

impl SlotTyper {
    pub fn new(threshold: u32) -> Self {
        SlotTyper {
            threshold: threshold.max(1),
            per_template: Vec::new(),
        }
    }

    pub fn observe_row(&mut self, tid: u32, params: &[String]) {
        let tid = tid as usize;
        if self.per_template.len() <= tid {
            self.per_template.resize_with(tid + 1, Vec::new);
        }
        let slots = &mut self.per_template[tid];
        if slots.len() < params.len() {
            slots.resize_with(params.len(), SlotStats::new);
        }
        for (slot, value) in params.iter().enumerate() {
            slots[slot].observe(value, self.threshold);
        }
    }

    pub fn slot_type(&self, tid: u32, slot: usize) -> SlotType {
        self.per_template
            .get(tid as usize)
            .and_then(|s| s.get(slot))
            .map(|s| s.final_type())
            .unwrap_or(SlotType::Raw)
    }

    /// Types for all slots of one template.
    pub fn types_for(&self, tid: u32, arity: usize) -> Vec<SlotType> {
        (0..arity).map(|s| self.slot_type(tid, s)).collect()
    }

    pub fn dict_table(&self, tid: u32, slot: usize) -> &[String] {
        self.per_template
            .get(tid as usize)
            .and_then(|s| s.get(slot))
            .map(|s| s.distinct.as_slice())
            .unwrap_or(&[])
    }

    pub fn dict_index(&self, tid: u32, slot: usize, value: &str) -> Option<u32> {
        self.per_template
            .get(tid as usize)?
            .get(slot)?
            .distinct_index
            .get(value)
            .copied()
    }
}

// ---------------------------------------------------------------------------
// window channel encode
// ---------------------------------------------------------------------------

fn encode_raw(values: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        encode_bytes(v.as_bytes(), &mut out);
    }
    out
}

fn encode_int(values: &[&str]) -> Option<Vec<u8>> {
    let ints: Option<Vec<i64>> = values.iter().map(|v| int_value(v)).collect();
    let ints = ints?;
    let mut out = Vec::new();
    let mut prev = 0i64;
    for (i, &v) in ints.iter().enumerate() {
        if i == 0 {
            encode_signed_varint(v, &mut out);
        } else {
            encode_signed_varint(v.wrapping_sub(prev), &mut out);
        }
        prev = v;
    }
    Some(out)
}

fn encode_ip(values: &[&str]) -> Option<Vec<u8>> {
    let quads: Option<Vec<[u8; 4]>> = values.iter().map(|v| ip_octets(v)).collect();
    let quads = quads?;
    let mut out = Vec::new();
    let mut prev = [0u8; 4];
    for (i, q) in quads.iter().enumerate() {
        if i == 0 {
            out.extend_from_slice(q);
        } else {
            for o in 0..4 {
                encode_signed_varint(q[o] as i64 - prev[o] as i64, &mut out);
            }
        }
        prev = *q;
    }
    Some(out)
}

fn encode_hex(values: &[&str]) -> Option<Vec<u8>> {
    let char_len = values.first()?.len();
    let mut nums = Vec::with_capacity(values.len());
    for v in values {
        if v.len() != char_len {
            return None;
        }
        nums.push(hex_value(v)?);
    }
    let width = bits_for_maxval(nums.iter().copied().max().unwrap_or(0));
    let mut out = Vec::new();
    encode_uvarint(char_len as u64, &mut out);
    out.push(width as u8);
    out.extend_from_slice(&bitpack(&nums, width));
    Some(out)
}

fn encode_dict(values: &[&str], typer: &SlotTyper, tid: u32, slot: usize) -> Option<Vec<u8>> {
    let width = if typer.dict_table(tid, slot).len() <= 256 {
        1
    } else {
        2
    };
    let mut out = Vec::with_capacity(values.len() * width);
    for v in values {
        let idx = typer.dict_index(tid, slot, v)?;
        if width == 1 {
            out.push(idx as u8);
        } else {
            out.extend_from_slice(&(idx as u16).to_le_bytes());
        }
    }
    Some(out)
}

/// Encodes one slot's window column. Returns the channel flags byte and the
/// payload; the RAW fallback kicks in on any type contradiction and whenever
/// the typed payload is not strictly smaller than the RAW one.
pub fn encode_channel(
    slot_type: SlotType,
    values: &[&str],
    typer: &SlotTyper,
    tid: u32,
    slot: usize,
) -> (u8, Vec<u8>) {
    let raw = encode_raw(values);
    let typed = match slot_type {
        SlotType::Int => encode_int(values),
        SlotType::Ip => encode_ip(values),
        SlotType::Hex => encode_hex(values),
        SlotType::Dict => encode_dict(values, typer, tid, slot),
        SlotType::Raw => None,
    };
    match typed {
        Some(t) if t.len() <= raw.len() => (0, t),
        Some(_) | None => {
            if slot_type != SlotType::Raw {
                debug!(tid, slot, ?slot_type, "slot channel fell back to raw");
            }
            (FLAG_RAW, raw)
        }
    }
}

// ---------------------------------------------------------------------------
// window channel decode
// ---------------------------------------------------------------------------

fn decode_raw(payload: &[u8], count: usize) -> Result<Vec<String>> {
    let mut pos = 0usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let b = decode_bytes(payload, &mut pos)?;
        out.push(
            String::from_utf8(b.to_vec())
                .map_err(|_| UscError::truncated(pos, "raw slot value not utf-8"))?,
        );
    }
    Ok(out)
}

fn decode_int(payload: &[u8], count: usize) -> Result<Vec<String>> {
    let mut pos = 0usize;
    let mut out = Vec::with_capacity(count);
    let mut prev = 0i64;
    for i in 0..count {
        let d = decode_signed_varint(payload, &mut pos)?;
        let v = if i == 0 { d } else { prev.wrapping_add(d) };
        out.push(v.to_string());
        prev = v;
    }
    Ok(out)
}

fn decode_ip(payload: &[u8], count: usize) -> Result<Vec<String>> {
    let mut pos = 0usize;
    let mut out = Vec::with_capacity(count);
    let mut prev = [0i64; 4];
    for i in 0..count {
        let mut q = [0i64; 4];
        if i == 0 {
            for o in &mut q {
                *o = *payload
                    .get(pos)
                    .ok_or_else(|| UscError::truncated(pos, "ip channel truncated"))?
                    as i64;
                pos += 1;
            }
        } else {
            for (o, p) in q.iter_mut().zip(prev.iter()) {
                *o = p + decode_signed_varint(payload, &mut pos)?;
            }
        }
        out.push(format!("{}.{}.{}.{}", q[0], q[1], q[2], q[3]));
        prev = q;
    }
    Ok(out)
}

fn decode_hex(payload: &[u8], count: usize) -> Result<Vec<String>> {
    let mut pos = 0usize;
    let char_len = decode_uvarint(payload, &mut pos)? as usize;
    let width = *payload
        .get(pos)
        .ok_or_else(|| UscError::truncated(pos, "hex channel truncated"))? as u32;
    pos += 1;
    if width == 0 || width > 64 {
        return Err(UscError::truncated(pos, "hex channel width out of range"));
    }
    let nums = bitunpack(&payload[pos..], count, width)?;
    Ok(nums
        .iter()
        .map(|v| format!("{:0>width$x}", v, width = char_len))
        .collect())
}

fn decode_dict(payload: &[u8], count: usize, dict: &[String]) -> Result<Vec<String>> {
    let width = if dict.len() <= 256 { 1usize } else { 2 };
    if payload.len() < count * width {
        return Err(UscError::truncated(payload.len(), "dict channel truncated"));
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let idx = if width == 1 {
            payload[i] as usize
        } else {
            u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]) as usize
        };
        let v = dict
            .get(idx)
            .ok_or_else(|| UscError::truncated(i * width, "dict index out of range"))?;
        out.push(v.clone());
    }
    Ok(out)
}

/// Decodes one slot's window column back to its value strings.
pub fn decode_channel(
    slot_type: SlotType,
    flags: u8,
    payload: &[u8],
    count: usize,
    dict: &[String],
) -> Result<Vec<String>> {
    if flags & FLAG_RAW != 0 {
        return decode_raw(payload, count);
    }
    match slot_type {
        SlotType::Int => decode_int(payload, count),
        SlotType::Ip => decode_ip(payload, count),
        SlotType::Hex => decode_hex(payload, count),
        SlotType::Dict => decode_dict(payload, count, dict),
        SlotType::Raw => decode_raw(payload, count),
    }
}
