//! Session orchestration: encode/decode, modes, and the file container.
//!
//! Encoding is two passes over the session input. Pass one canonicalizes and
//! mines every line, growing the template bank and the slot-type statistics;
//! pass two freezes both into the DICT packet and emits one DATA packet per
//! window of rows. All state is owned by the session; nothing is shared
//! across sessions, and the decoder rebuilds its own bank from the DICT
//! packet.

use bytes::Bytes;
use tracing::debug;

use crate::canon::Canonicalizer;
use crate::error::{Result, UscError};
use crate::framer::{compress_framed, decompress_framed, frame_packets, unframe_packets};
use crate::packet::{
    decode_data_packet, decode_dict_packet, decode_index_packet, encode_data_packet,
    encode_dict_packet, encode_index_packet, packet_kind, PacketKind,
};
use crate::slots::SlotTyper;
use crate::template::{Miner, Row};

pub const CONTAINER_MAGIC: &[u8; 4] = b"USC\0";
pub const CONTAINER_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stream,
    HotLiteFull,
    Cold,
}

impl Mode {
    pub fn tag(self) -> u8 {
        match self {
            Mode::Stream => 1,
            Mode::HotLiteFull => 2,
            Mode::Cold => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Mode::Stream),
            2 => Some(Mode::HotLiteFull),
            3 => Some(Mode::Cold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub window_size: u32,
    pub mode: Mode,
    pub max_templates: u32,
    pub slot_promote_threshold: u32,
    pub canonicalize: bool,
    /// Gates dictionary training for the cold entropy pass; `None` = auto
    /// (train). Stream and hot-lite-full never take the entropy pass.
    pub outer_entropy: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window_size: 25,
            mode: Mode::Stream,
            max_templates: 65_535,
            slot_promote_threshold: 8,
            canonicalize: true,
            outer_entropy: None,
        }
    }
}

impl Config {
    /// Default config with `USC_WINDOW` / `USC_MAX_TEMPLATES` overrides
    /// applied.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Some(v) = std::env::var("USC_WINDOW").ok().and_then(|v| v.parse().ok()) {
            cfg.window_size = v;
        }
        if let Some(v) = std::env::var("USC_MAX_TEMPLATES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.max_templates = v;
        }
        cfg
    }

    fn train_outer_dict(&self) -> bool {
        self.outer_entropy.unwrap_or(true)
    }
}

/// One encoded packet, self-identified by its magic.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub bytes: Bytes,
}

impl Packet {
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        let kind =
            packet_kind(&bytes).ok_or_else(|| UscError::truncated(0, "unknown packet magic"))?;
        Ok(Packet { kind, bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

/// Encodes a session of lines into DICT + DATA (+ INDEX) packets.
///
/// Each line is a byte string including its terminator when present;
/// concatenating the decoded lines reproduces the input exactly.
pub fn encode<I, L>(lines: I, config: &Config) -> Result<Vec<Packet>>
where
    I: IntoIterator<Item = L>,
    L: AsRef<[u8]>,
{
    let canon = Canonicalizer::new();
    let mut miner = Miner::new(config.max_templates);
    let mut typer = SlotTyper::new(config.slot_promote_threshold);

    // Pass 1: canonicalize + mine everything, grow bank and slot stats.
    let mut rows: Vec<Row> = Vec::new();
    for line in lines {
        let raw = line.as_ref();
        let row = match std::str::from_utf8(raw) {
            Ok(text) if config.canonicalize => {
                let (canonical, side) = canon.canonicalize(text);
                miner.mine(raw, &canonical, side)
            }
            Ok(text) => miner.mine(raw, text, Vec::new()),
            // Opaque bytes pass through untouched.
            Err(_) => Row::Raw {
                bytes: raw.to_vec(),
            },
        };
        if let Row::Templated { tid, params, .. } = &row {
            typer.observe_row(*tid, params);
        }
        rows.push(row);
    }

    let bank = miner.into_bank();
    debug!(
        rows = rows.len(),
        templates = bank.len(),
        "mining pass complete"
    );

    // Pass 2: DICT once, then one DATA packet per window.
    let mut packets = Vec::new();
    packets.push(Packet {
        kind: PacketKind::Dict,
        bytes: Bytes::from(encode_dict_packet(&bank, &typer)),
    });

    let window = config.window_size.max(1) as usize;
    let mut index_entries = Vec::new();
    let mut first_row = 0u64;
    for chunk in rows.chunks(window) {
        let body = encode_data_packet(chunk, &bank, &typer);
        debug!(rows = chunk.len(), bytes = body.len(), "data packet emitted");
        index_entries.push((first_row, chunk.len() as u64));
        first_row += chunk.len() as u64;
        packets.push(Packet {
            kind: PacketKind::Data,
            bytes: Bytes::from(body),
        });
    }

    if config.mode == Mode::HotLiteFull {
        packets.push(Packet {
            kind: PacketKind::Index,
            bytes: Bytes::from(encode_index_packet(&index_entries)),
        });
    }

    Ok(packets)
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

/// Decodes packets back to the original lines. Packets must arrive in
/// emission order, DICT first.
pub fn decode<'a, I>(packets: I) -> Result<Vec<Vec<u8>>>
where
    I: IntoIterator<Item = &'a Packet>,
{
    let mut iter = packets.into_iter().enumerate();
    let (_, first) = iter
        .next()
        .ok_or_else(|| UscError::truncated(0, "no packets"))?;
    if first.kind != PacketKind::Dict {
        return Err(UscError::truncated(0, "first packet is not DICT"));
    }
    let dict = decode_dict_packet(&first.bytes)?;

    let mut lines = Vec::new();
    for (i, packet) in iter {
        match packet.kind {
            PacketKind::Data => {
                let decoded =
                    decode_data_packet(&packet.bytes, &dict).map_err(|e| e.in_packet(i))?;
                lines.extend(decoded);
            }
            PacketKind::Index => {
                decode_index_packet(&packet.bytes).map_err(|e| e.in_packet(i))?;
            }
            PacketKind::Dict => {
                return Err(UscError::MalformedInput {
                    packet: i,
                    offset: 0,
                    detail: "duplicate DICT packet",
                });
            }
        }
    }
    Ok(lines)
}

// ---------------------------------------------------------------------------
// container
// ---------------------------------------------------------------------------

/// Wraps packets into the on-disk container for the configured mode.
pub fn pack_container(packets: &[Packet], config: &Config) -> Result<Bytes> {
    let bodies: Vec<Bytes> = packets.iter().map(|p| p.bytes.clone()).collect();
    let framed = frame_packets(&bodies);

    let mut out = Vec::with_capacity(framed.len() + 10);
    out.extend_from_slice(CONTAINER_MAGIC);
    out.push(CONTAINER_VERSION);
    out.push(config.mode.tag());
    out.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    match config.mode {
        Mode::Stream | Mode::HotLiteFull => out.extend_from_slice(&framed),
        Mode::Cold => {
            let env = compress_framed(&bodies, &framed, config.train_outer_dict())?;
            debug!(
                framed = framed.len(),
                envelope = env.len(),
                "cold entropy pass"
            );
            out.extend_from_slice(&env);
        }
    }
    Ok(Bytes::from(out))
}

/// Reads a container back into its mode and packet list.
pub fn unpack_container(bytes: &[u8]) -> Result<(Mode, Vec<Packet>)> {
    if bytes.len() < 10 || &bytes[..4] != CONTAINER_MAGIC {
        return Err(UscError::truncated(0, "bad container magic"));
    }
    let version = bytes[4];
    let mode_tag = bytes[5];
    if version != CONTAINER_VERSION {
        return Err(UscError::VersionUnsupported { version, mode_tag });
    }
    let mode =
        Mode::from_tag(mode_tag).ok_or(UscError::VersionUnsupported { version, mode_tag })?;
    let count = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;

    let payload = &bytes[10..];
    let bodies = match mode {
        Mode::Stream | Mode::HotLiteFull => unframe_packets(payload, count)?,
        Mode::Cold => {
            let framed = decompress_framed(payload)?;
            unframe_packets(&framed, count)?
        }
    };
    let packets = bodies
        .into_iter()
        .map(Packet::from_bytes)
        .collect::<Result<Vec<_>>>()?;
    Ok((mode, packets))
}

/// Convenience: encode straight to container bytes.
pub fn encode_to_container<I, L>(lines: I, config: &Config) -> Result<Bytes>
where
    I: IntoIterator<Item = L>,
    L: AsRef<[u8]>,
{
    let packets = encode(lines, config)?;
    pack_container(&packets, config)
}

/// Convenience: decode container bytes straight to lines.
pub fn decode_container(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let (_, packets) = unpack_container(bytes)?;
    decode(packets.iter())
}

/// Range decode for hot-lite-full containers: touches only the DATA packets
/// overlapping `[start, start + count)`.
pub fn decode_rows(bytes: &[u8], start: u64, count: u64) -> Result<Vec<Vec<u8>>> {
    let (_, packets) = unpack_container(bytes)?;
    let first = packets
        .first()
        .ok_or_else(|| UscError::truncated(0, "no packets"))?;
    if first.kind != PacketKind::Dict {
        return Err(UscError::truncated(0, "first packet is not DICT"));
    }
    let dict = decode_dict_packet(&first.bytes)?;

    let index = packets
        .iter()
        .rev()
        .find(|p| p.kind == PacketKind::Index)
        .ok_or_else(|| UscError::truncated(0, "container has no row index"))?;
    let entries = decode_index_packet(&index.bytes)?;

    let data_packets: Vec<&Packet> = packets
        .iter()
        .filter(|p| p.kind == PacketKind::Data)
        .collect();
    if data_packets.len() != entries.len() {
        return Err(UscError::truncated(
            0,
            "row index does not match data packets",
        ));
    }

    let end = start.saturating_add(count);
    let mut out = Vec::new();
    for (entry, packet) in entries.iter().zip(data_packets) {
        let (first_row, rows) = *entry;
        let packet_end = first_row + rows;
        if packet_end <= start || first_row >= end {
            continue;
        }
        let decoded = decode_data_packet(&packet.bytes, &dict)?;
        let lo = start.saturating_sub(first_row) as usize;
        let hi = (end.min(packet_end) - first_row) as usize;
        out.extend_from_slice(&decoded[lo..hi]);
    }
    Ok(out)
}

/// Verification harness: byte-exact roundtrip or `RoundtripMismatch` with
/// the first differing line.
pub fn verify_roundtrip(lines: &[Vec<u8>], config: &Config) -> Result<()> {
    let packets = encode(lines.iter(), config)?;
    let decoded = decode(packets.iter())?;
    if decoded.len() != lines.len() {
        return Err(UscError::RoundtripMismatch {
            line: decoded.len().min(lines.len()),
        });
    }
    for (i, (a, b)) in lines.iter().zip(decoded.iter()).enumerate() {
        if a != b {
            return Err(UscError::RoundtripMismatch { line: i });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(strs: &[&str]) -> Vec<Vec<u8>> {
        strs.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn empty_session_roundtrip() {
        let cfg = Config::default();
        let packets = encode(Vec::<Vec<u8>>::new(), &cfg).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(decode(packets.iter()).unwrap().is_empty());
    }

    #[test]
    fn container_roundtrip_all_modes() {
        let input = lines(&[
            "svc request id=123456 ok\n",
            "svc request id=123457 ok\n",
            "!!! corrupted line\n",
            "svc request id=123460 ok\n",
        ]);
        for mode in [Mode::Stream, Mode::HotLiteFull, Mode::Cold] {
            let cfg = Config {
                mode,
                window_size: 2,
                ..Config::default()
            };
            let blob = encode_to_container(input.iter(), &cfg).unwrap();
            let (read_mode, _) = unpack_container(&blob).unwrap();
            assert_eq!(read_mode, mode);
            assert_eq!(decode_container(&blob).unwrap(), input, "mode {mode:?}");
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let cfg = Config::default();
        let blob = encode_to_container(lines(&["a b\n"]).iter(), &cfg).unwrap();
        let mut bad = blob.to_vec();
        bad[4] = 7;
        assert!(matches!(
            unpack_container(&bad),
            Err(UscError::VersionUnsupported { version: 7, .. })
        ));
        bad[4] = CONTAINER_VERSION;
        bad[5] = 9;
        assert!(matches!(
            unpack_container(&bad),
            Err(UscError::VersionUnsupported { mode_tag: 9, .. })
        ));
    }

    #[test]
    fn range_decode_matches_full_decode() {
        let input: Vec<Vec<u8>> = (0..100)
            .map(|i| format!("worker 10.0.0.{} job {}\n", i % 4 + 1, 100000 + i).into_bytes())
            .collect();
        let cfg = Config {
            mode: Mode::HotLiteFull,
            window_size: 10,
            ..Config::default()
        };
        let blob = encode_to_container(input.iter(), &cfg).unwrap();
        let full = decode_container(&blob).unwrap();
        assert_eq!(full, input);
        assert_eq!(decode_rows(&blob, 0, 100).unwrap(), input);
        assert_eq!(decode_rows(&blob, 35, 10).unwrap(), &input[35..45]);
        assert_eq!(decode_rows(&blob, 95, 50).unwrap(), &input[95..]);
    }

    #[test]
    fn env_overrides() {
        std::env::set_var("USC_WINDOW", "7");
        std::env::set_var("USC_MAX_TEMPLATES", "99");
        let cfg = Config::from_env();
        assert_eq!(cfg.window_size, 7);
        assert_eq!(cfg.max_templates, 99);
        std::env::remove_var("USC_WINDOW");
        std::env::remove_var("USC_MAX_TEMPLATES");
    }
}
