//! Outer framing and the cold-mode entropy pass.
//!
//! Packets are concatenated with u32 length prefixes. Stream and
//! hot-lite-full containers carry that framing as-is; cold containers run
//! the whole framed stream through zstd, optionally primed with a
//! dictionary trained on the first 112 KiB of framed bytes (whole packets
//! only). The trained dictionary travels inside the envelope under its own
//! tag, so a cold file is self-contained.

use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, UscError};
use crate::varint::{decode_uvarint, encode_uvarint};

const ZSTD_LEVEL: i32 = 22;
const DICT_SAMPLE_BYTES: usize = 112 * 1024;
const DICT_MAX_SIZE: usize = 8 * 1024;

const TAG_PLAIN: u8 = 0;
const TAG_TRAINED_DICT: u8 = 1;

pub fn frame_packets(packets: &[Bytes]) -> Vec<u8> {
    let total: usize = packets.iter().map(|p| 4 + p.len()).sum();
    let mut out = Vec::with_capacity(total);
    for p in packets {
        out.extend_from_slice(&(p.len() as u32).to_le_bytes());
        out.extend_from_slice(p);
    }
    out
}

pub fn unframe_packets(bytes: &[u8], count: usize) -> Result<Vec<Bytes>> {
    let mut pos = 0usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len_bytes = bytes
            .get(pos..pos + 4)
            .ok_or_else(|| UscError::truncated(pos, "packet length prefix truncated"))?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        pos += 4;
        let body = bytes
            .get(pos..pos + len)
            .ok_or_else(|| UscError::truncated(pos, "packet body truncated"))?;
        out.push(Bytes::copy_from_slice(body));
        pos += len;
    }
    if pos != bytes.len() {
        return Err(UscError::truncated(pos, "trailing bytes after packets"));
    }
    Ok(out)
}

/// Trains a dictionary from whole packets within the sample region.
/// `None` when training is not worthwhile or zstd rejects the samples.
fn train_dictionary(packets: &[Bytes]) -> Option<Vec<u8>> {
    let mut sample = Vec::new();
    let mut sizes = Vec::new();
    for p in packets {
        if sample.len() >= DICT_SAMPLE_BYTES {
            break;
        }
        sample.extend_from_slice(p);
        sizes.push(p.len());
    }
    if sizes.len() < 8 {
        return None;
    }
    match zstd::dict::from_continuous(&sample, &sizes, DICT_MAX_SIZE) {
        Ok(dict) => Some(dict),
        Err(err) => {
            debug!(%err, "dictionary training failed, falling back to plain zstd");
            None
        }
    }
}

/// Entropy-codes a framed packet stream into a self-contained envelope.
/// `train_dict` gates dictionary training; plain zstd otherwise.
pub fn compress_framed(packets: &[Bytes], framed: &[u8], train_dict: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let dict = if train_dict {
        train_dictionary(packets)
    } else {
        None
    };
    match dict {
        Some(dict) => {
            let comp = zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, &dict)?
                .compress(framed)?;
            out.push(TAG_TRAINED_DICT);
            encode_uvarint(dict.len() as u64, &mut out);
            out.extend_from_slice(&dict);
            out.extend_from_slice(&(framed.len() as u32).to_le_bytes());
            out.extend_from_slice(&(comp.len() as u32).to_le_bytes());
            out.extend_from_slice(&comp);
        }
        None => {
            let comp = zstd::encode_all(framed, ZSTD_LEVEL)?;
            out.push(TAG_PLAIN);
            out.extend_from_slice(&(framed.len() as u32).to_le_bytes());
            out.extend_from_slice(&(comp.len() as u32).to_le_bytes());
            out.extend_from_slice(&comp);
        }
    }
    Ok(out)
}

/// Inverse of `compress_framed`; returns the framed packet stream.
pub fn decompress_framed(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let tag = *bytes
        .get(pos)
        .ok_or_else(|| UscError::truncated(0, "entropy envelope empty"))?;
    pos += 1;

    let dict = if tag == TAG_TRAINED_DICT {
        let len = decode_uvarint(bytes, &mut pos)? as usize;
        let d = bytes
            .get(pos..pos + len)
            .ok_or_else(|| UscError::truncated(pos, "trained dictionary truncated"))?;
        pos += len;
        Some(d)
    } else if tag == TAG_PLAIN {
        None
    } else {
        return Err(UscError::truncated(pos, "unknown entropy envelope tag"));
    };

    let header = bytes
        .get(pos..pos + 8)
        .ok_or_else(|| UscError::truncated(pos, "entropy envelope header truncated"))?;
    let raw_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let comp_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    pos += 8;
    let comp = bytes
        .get(pos..pos + comp_len)
        .ok_or_else(|| UscError::truncated(pos, "entropy payload truncated"))?;

    let raw = match dict {
        Some(d) => zstd::bulk::Decompressor::with_dictionary(d)
            .and_then(|mut dec| dec.decompress(comp, raw_len))
            .map_err(|_| UscError::truncated(pos, "entropy payload corrupt"))?,
        None => zstd::decode_all(comp)
            .map_err(|_| UscError::truncated(pos, "entropy payload corrupt"))?,
    };
    if raw.len() != raw_len {
        return Err(UscError::truncated(pos, "entropy payload length mismatch"));
    }
    Ok(raw)
}
