//! Packet assembly.
//!
//! Two-packet stateful protocol: one DICT packet carries the frozen template
//! bank, slot types, and slot dictionaries; every window of rows becomes one
//! DATA packet referencing them. DATA packets are independently decodable
//! given the DICT packet. Hot-lite-full adds a trailing INDEX packet mapping
//! row ranges to DATA packets.
//!
//! All integers on the wire are varints unless bit-packed; all byte blocks
//! are length-prefixed; no trailing padding.

use std::collections::HashMap;

use crate::bits::{bitpack, bits_for_count, bitunpack, pack_flags, unpack_flags};
use crate::canon::{uncanonicalize, SideKind, SideToken};
use crate::error::{Result, UscError};
use crate::mtf::MtfList;
use crate::slots::{decode_channel, encode_channel, SlotType, SlotTyper};
use crate::template::{Row, Template, TemplateBank, TemplateToken};
use crate::varint::{decode_bytes, decode_uvarint, encode_bytes, encode_uvarint};

pub const DICT_MAGIC: &[u8; 4] = b"USCD";
pub const DATA_MAGIC: &[u8; 4] = b"USCx";
pub const INDEX_MAGIC: &[u8; 4] = b"USCI";
pub const PACKET_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Dict,
    Data,
    Index,
}

pub fn packet_kind(bytes: &[u8]) -> Option<PacketKind> {
    match bytes.get(..4)? {
        m if m == DICT_MAGIC => Some(PacketKind::Dict),
        m if m == DATA_MAGIC => Some(PacketKind::Data),
        m if m == INDEX_MAGIC => Some(PacketKind::Index),
        _ => None,
    }
}

fn check_header(bytes: &[u8], magic: &[u8; 4], pos: &mut usize) -> Result<()> {
    if bytes.len() < 5 || &bytes[..4] != magic {
        return Err(UscError::truncated(0, "bad packet magic"));
    }
    if bytes[4] != PACKET_VERSION {
        return Err(UscError::VersionUnsupported {
            version: bytes[4],
            mode_tag: 0,
        });
    }
    *pos = 5;
    Ok(())
}

// ---------------------------------------------------------------------------
// DICT packet
// ---------------------------------------------------------------------------

/// Decoder-side session state rebuilt from a DICT packet.
pub struct SessionDict {
    pub bank: TemplateBank,
    slot_types: Vec<Vec<SlotType>>,
    dict_tables: Vec<Vec<Vec<String>>>,
}

impl SessionDict {
    pub fn slot_type(&self, tid: u32, slot: usize) -> SlotType {
        self.slot_types
            .get(tid as usize)
            .and_then(|s| s.get(slot))
            .copied()
            .unwrap_or(SlotType::Raw)
    }

    pub fn dict_table(&self, tid: u32, slot: usize) -> &[String] {
        self.dict_tables
            .get(tid as usize)
            .and_then(|s| s.get(slot))
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }
}

pub fn encode_dict_packet(bank: &TemplateBank, typer: &SlotTyper) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(DICT_MAGIC);
    out.push(PACKET_VERSION);
    encode_uvarint(bank.len() as u64, &mut out);

    for template in bank.templates() {
        let tokens = template.tokens();
        encode_uvarint(tokens.len() as u64, &mut out);
        let mut flags = Vec::with_capacity(tokens.len());
        for tok in tokens {
            match tok {
                TemplateToken::Literal(s) => {
                    encode_bytes(s.as_bytes(), &mut out);
                    flags.push(false);
                }
                TemplateToken::Slot => {
                    encode_bytes(&[], &mut out);
                    flags.push(true);
                }
            }
        }
        out.extend_from_slice(&pack_flags(&flags));
    }

    // Slot type table: arity bytes per template, arity inferred from the
    // placeholder flags above.
    for (tid, template) in bank.templates().iter().enumerate() {
        for ty in typer.types_for(tid as u32, template.arity()) {
            out.push(ty.tag());
        }
    }

    // Dictionaries for DICT-typed slots, in (tid, slot) order.
    for (tid, template) in bank.templates().iter().enumerate() {
        for slot in 0..template.arity() {
            if typer.slot_type(tid as u32, slot) == SlotType::Dict {
                let table = typer.dict_table(tid as u32, slot);
                encode_uvarint(table.len() as u64, &mut out);
                for entry in table {
                    encode_bytes(entry.as_bytes(), &mut out);
                }
            }
        }
    }

    out
}

pub fn decode_dict_packet(bytes: &[u8]) -> Result<SessionDict> {
    let mut pos = 0usize;
    check_header(bytes, DICT_MAGIC, &mut pos)?;

    let template_count = decode_uvarint(bytes, &mut pos)? as usize;
    let mut templates = Vec::with_capacity(template_count);
    for _ in 0..template_count {
        let token_count = decode_uvarint(bytes, &mut pos)? as usize;
        let mut texts = Vec::with_capacity(token_count);
        for _ in 0..token_count {
            texts.push(decode_bytes(bytes, &mut pos)?.to_vec());
        }
        let flag_len = token_count.div_ceil(8);
        let flag_bytes = bytes
            .get(pos..pos + flag_len)
            .ok_or_else(|| UscError::truncated(pos, "placeholder flags truncated"))?;
        let flags = unpack_flags(flag_bytes, token_count)?;
        pos += flag_len;

        let mut tokens = Vec::with_capacity(token_count);
        for (text, is_slot) in texts.into_iter().zip(flags) {
            if is_slot {
                tokens.push(TemplateToken::Slot);
            } else {
                let s = String::from_utf8(text)
                    .map_err(|_| UscError::truncated(pos, "template token not utf-8"))?;
                tokens.push(TemplateToken::Literal(s));
            }
        }
        templates.push(Template::from_tokens(tokens));
    }

    let mut slot_types = Vec::with_capacity(template_count);
    for template in &templates {
        let mut types = Vec::with_capacity(template.arity());
        for _ in 0..template.arity() {
            let tag = *bytes
                .get(pos)
                .ok_or_else(|| UscError::truncated(pos, "slot type table truncated"))?;
            pos += 1;
            types.push(
                SlotType::from_tag(tag)
                    .ok_or_else(|| UscError::truncated(pos, "unknown slot type tag"))?,
            );
        }
        slot_types.push(types);
    }

    let mut dict_tables = Vec::with_capacity(template_count);
    for types in &slot_types {
        let mut per_slot = Vec::with_capacity(types.len());
        for ty in types {
            if *ty == SlotType::Dict {
                let count = decode_uvarint(bytes, &mut pos)? as usize;
                let mut table = Vec::with_capacity(count);
                for _ in 0..count {
                    let entry = decode_bytes(bytes, &mut pos)?;
                    table.push(
                        String::from_utf8(entry.to_vec())
                            .map_err(|_| UscError::truncated(pos, "dict entry not utf-8"))?,
                    );
                }
                per_slot.push(table);
            } else {
                per_slot.push(Vec::new());
            }
        }
        dict_tables.push(per_slot);
    }

    Ok(SessionDict {
        bank: TemplateBank::from_templates(templates),
        slot_types,
        dict_tables,
    })
}

// ---------------------------------------------------------------------------
// DATA packet
// ---------------------------------------------------------------------------

pub fn encode_data_packet(rows: &[Row], bank: &TemplateBank, typer: &SlotTyper) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(DATA_MAGIC);
    out.push(PACKET_VERSION);
    encode_uvarint(rows.len() as u64, &mut out);

    let mask: Vec<bool> = rows.iter().map(|r| r.is_templated()).collect();
    out.extend_from_slice(&pack_flags(&mask));

    // MTF positions over templated rows, fresh identity list per window.
    let mut mtf = MtfList::identity(bank.len());
    let mut positions = Vec::new();
    let mut tids = Vec::new();
    for row in rows {
        if let Row::Templated { tid, .. } = row {
            // Ids always come from this bank; the identity list covers them.
            if let Some(pos) = mtf.encode(*tid) {
                positions.push(pos);
                tids.push(*tid);
            }
        }
    }
    let width = bits_for_count(bank.len() as u64);
    out.extend_from_slice(&bitpack(&positions, width));

    // Channel blocks in (tid asc, slot asc) order over templates present.
    let mut present: Vec<u32> = tids.clone();
    present.sort_unstable();
    present.dedup();
    for &tid in &present {
        let arity = bank.get(tid).map(|t| t.arity()).unwrap_or(0);
        for slot in 0..arity {
            let column: Vec<&str> = rows
                .iter()
                .filter_map(|r| match r {
                    Row::Templated { tid: t, params, .. } if *t == tid => {
                        params.get(slot).map(|s| s.as_str())
                    }
                    _ => None,
                })
                .collect();
            let (flags, payload) =
                encode_channel(typer.slot_type(tid, slot), &column, typer, tid, slot);
            out.push(flags);
            encode_bytes(&payload, &mut out);
        }
    }

    // Side-token section: window-local dictionary + per-row index lists.
    let mut side_dict: Vec<&SideToken> = Vec::new();
    let mut side_index: HashMap<(u8, &[u8]), u64> = HashMap::new();
    let mut per_row_ids: Vec<Vec<u64>> = Vec::new();
    for row in rows {
        if let Row::Templated { side, .. } = row {
            let mut ids = Vec::with_capacity(side.len());
            for tok in side {
                let key = (tok.kind.tag(), tok.payload.as_slice());
                let id = *side_index.entry(key).or_insert_with(|| {
                    side_dict.push(tok);
                    (side_dict.len() - 1) as u64
                });
                ids.push(id);
            }
            per_row_ids.push(ids);
        }
    }
    encode_uvarint(side_dict.len() as u64, &mut out);
    for tok in &side_dict {
        out.push(tok.kind.tag());
        encode_bytes(&tok.payload, &mut out);
    }
    for ids in &per_row_ids {
        encode_uvarint(ids.len() as u64, &mut out);
        for id in ids {
            encode_uvarint(*id, &mut out);
        }
    }

    // Raw rows, in row order.
    for row in rows {
        if let Row::Raw { bytes } = row {
            encode_bytes(bytes, &mut out);
        }
    }

    out
}

/// Decodes one DATA packet back to original line bytes.
pub fn decode_data_packet(bytes: &[u8], dict: &SessionDict) -> Result<Vec<Vec<u8>>> {
    let mut pos = 0usize;
    check_header(bytes, DATA_MAGIC, &mut pos)?;

    let row_count = decode_uvarint(bytes, &mut pos)? as usize;
    let mask_len = row_count.div_ceil(8);
    let mask_bytes = bytes
        .get(pos..pos + mask_len)
        .ok_or_else(|| UscError::truncated(pos, "row mask truncated"))?;
    let mask = unpack_flags(mask_bytes, row_count)?;
    pos += mask_len;

    let templated_count = mask.iter().filter(|&&b| b).count();
    let width = bits_for_count(dict.bank.len() as u64);
    let packed_len = (templated_count * width as usize).div_ceil(8);
    let packed = bytes
        .get(pos..pos + packed_len)
        .ok_or_else(|| UscError::truncated(pos, "mtf positions truncated"))?;
    let positions = bitunpack(packed, templated_count, width)?;
    pos += packed_len;

    let mut mtf = MtfList::identity(dict.bank.len());
    let mut tids = Vec::with_capacity(templated_count);
    for p in positions {
        tids.push(
            mtf.decode(p)
                .ok_or_else(|| UscError::truncated(pos, "mtf position out of range"))?,
        );
    }

    // Channels, (tid asc, slot asc) over templates present in this window.
    let mut per_tid_count: HashMap<u32, usize> = HashMap::new();
    for &tid in &tids {
        *per_tid_count.entry(tid).or_insert(0) += 1;
    }
    let mut present: Vec<u32> = per_tid_count.keys().copied().collect();
    present.sort_unstable();

    let mut columns: HashMap<(u32, usize), Vec<String>> = HashMap::new();
    for &tid in &present {
        let template = dict
            .bank
            .get(tid)
            .ok_or_else(|| UscError::truncated(pos, "template id out of range"))?;
        for slot in 0..template.arity() {
            let flags = *bytes
                .get(pos)
                .ok_or_else(|| UscError::truncated(pos, "channel flags truncated"))?;
            pos += 1;
            let payload = decode_bytes(bytes, &mut pos)?;
            let values = decode_channel(
                dict.slot_type(tid, slot),
                flags,
                payload,
                per_tid_count[&tid],
                dict.dict_table(tid, slot),
            )?;
            columns.insert((tid, slot), values);
        }
    }

    // Side tokens.
    let side_dict_len = decode_uvarint(bytes, &mut pos)? as usize;
    let mut side_dict = Vec::with_capacity(side_dict_len);
    for _ in 0..side_dict_len {
        let tag = *bytes
            .get(pos)
            .ok_or_else(|| UscError::truncated(pos, "side token tag truncated"))?;
        pos += 1;
        let kind = SideKind::from_tag(tag)
            .ok_or_else(|| UscError::truncated(pos, "unknown side token tag"))?;
        let payload = decode_bytes(bytes, &mut pos)?.to_vec();
        side_dict.push(SideToken { kind, payload });
    }
    let mut per_row_side: Vec<Vec<SideToken>> = Vec::with_capacity(templated_count);
    for _ in 0..templated_count {
        let n = decode_uvarint(bytes, &mut pos)? as usize;
        let mut toks = Vec::with_capacity(n);
        for _ in 0..n {
            let id = decode_uvarint(bytes, &mut pos)? as usize;
            let tok = side_dict
                .get(id)
                .ok_or_else(|| UscError::truncated(pos, "side token index out of range"))?;
            toks.push(tok.clone());
        }
        per_row_side.push(toks);
    }

    // Raw rows.
    let raw_count = row_count - templated_count;
    let mut raw_rows = Vec::with_capacity(raw_count);
    for _ in 0..raw_count {
        raw_rows.push(decode_bytes(bytes, &mut pos)?.to_vec());
    }

    // Reassemble in row order.
    let mut out = Vec::with_capacity(row_count);
    let mut next_templated = 0usize;
    let mut next_raw = 0usize;
    let mut cursors: HashMap<u32, usize> = HashMap::new();
    for is_templated in mask {
        if is_templated {
            let tid = tids[next_templated];
            let template = dict
                .bank
                .get(tid)
                .ok_or_else(|| UscError::truncated(pos, "template id out of range"))?;
            let cursor = cursors.entry(tid).or_insert(0);
            let mut params = Vec::with_capacity(template.arity());
            for slot in 0..template.arity() {
                let column = &columns[&(tid, slot)];
                let v = column
                    .get(*cursor)
                    .ok_or_else(|| UscError::truncated(pos, "channel shorter than rows"))?;
                params.push(v.clone());
            }
            *cursor += 1;
            let canonical = template.reconstruct(&params);
            let line = uncanonicalize(&canonical, &per_row_side[next_templated])?;
            out.push(line.into_bytes());
            next_templated += 1;
        } else {
            out.push(raw_rows[next_raw].clone());
            next_raw += 1;
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// INDEX packet (hot-lite-full)
// ---------------------------------------------------------------------------

pub fn encode_index_packet(entries: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(INDEX_MAGIC);
    out.push(PACKET_VERSION);
    encode_uvarint(entries.len() as u64, &mut out);
    for &(first_row, row_count) in entries {
        encode_uvarint(first_row, &mut out);
        encode_uvarint(row_count, &mut out);
    }
    out
}

pub fn decode_index_packet(bytes: &[u8]) -> Result<Vec<(u64, u64)>> {
    let mut pos = 0usize;
    check_header(bytes, INDEX_MAGIC, &mut pos)?;
    let count = decode_uvarint(bytes, &mut pos)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let first_row = decode_uvarint(bytes, &mut pos)?;
        let row_count = decode_uvarint(bytes, &mut pos)?;
        out.push((first_row, row_count));
    }
    Ok(out)
}
