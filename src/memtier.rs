//! Tiered memory codec.
//!
//! An alternative mode for agent-memory blobs where a caller may accept an
//! approximate reconstruction but must never mistake it for an exact one.
//! A packet carries a skeleton (header + goal), witness lines, and — at the
//! lossless tier — the full residual text. Decoding verifies a truth-spine
//! checksum and a fingerprint, runs a plain probe predicate, and refuses to
//! return anything below the confidence floor. There is no runtime
//! reflection anywhere: the gate is a predicate, the result is a sum type,
//! and the commit history is an append-only log.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TIER_TINY: u8 = 0;
pub const TIER_LOSSLESS: u8 = 3;

const PACKET_VERSION: &str = "mem-v1";
const ZSTD_LEVEL: i32 = 19;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("memory packet corrupt: {0}")]
    Corrupt(&'static str),
    #[error("truth spine checksum mismatch")]
    ChecksumMismatch,
    #[error("fingerprint mismatch")]
    FingerprintMismatch,
    #[error("decode confidence {confidence:.2} below floor {floor:.2}, need a higher tier")]
    NeedsMoreBits { confidence: f64, floor: f64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decode result: exact bytes, or an approximation that must be labelled as
/// such.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Exact(Vec<u8>),
    Approximate { payload: Vec<u8>, confidence: f64 },
}

impl Decoded {
    pub fn payload(&self) -> &[u8] {
        match self {
            Decoded::Exact(p) => p,
            Decoded::Approximate { payload, .. } => payload,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Decoded::Exact(_) => 1.0,
            Decoded::Approximate { confidence, .. } => *confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Skeleton {
    header: String,
    goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemPacket {
    v: String,
    t: u8,
    sk: Skeleton,
    w: Vec<String>,
    r: String,
    /// Whether `r` is the remainder after the rendered skeleton prefix; when
    /// false `r` is the whole text (skeleton kept for verification only).
    p: bool,
    e: String,
    f: String,
}

fn extract_skeleton(text: &str) -> Skeleton {
    let mut nonempty = text.lines().map(str::trim).filter(|l| !l.is_empty());
    Skeleton {
        header: nonempty.next().unwrap_or("").to_owned(),
        goal: nonempty.next().unwrap_or("").to_owned(),
    }
}

fn render_skeleton(sk: &Skeleton) -> String {
    format!("{}\n{}\n", sk.header, sk.goal)
}

/// Witness lines are the decision trail: anything starting with
/// `Decision:` or `Note:`.
fn extract_witnesses(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("Decision:") || l.starts_with("Note:"))
        .map(str::to_owned)
        .collect()
}

/// Residual plus a flag saying whether the skeleton render is a literal
/// prefix (true) or the residual already carries the whole text (false).
fn extract_residual<'a>(full: &'a str, skeleton: &str) -> (&'a str, bool) {
    match full.strip_prefix(skeleton) {
        Some(rest) => (rest, true),
        None => (full, false),
    }
}

fn short_digest(blob: &str, len: usize) -> String {
    let digest = Sha256::digest(blob.as_bytes());
    let mut out = String::with_capacity(len);
    for b in digest.iter() {
        if out.len() >= len {
            break;
        }
        out.push_str(&format!("{:02x}", b));
    }
    out.truncate(len);
    out
}

fn spine_checksum(header: &str, goal: &str, witnesses: &[String]) -> String {
    let blob = format!("{}\n{}\n{}", header, goal, witnesses.join("\n"));
    short_digest(&blob, 10)
}

fn fingerprint(header: &str, goal: &str, witnesses: &[String]) -> String {
    let blob = format!("{}\n{}\n{}", header, goal, witnesses.join("\n"));
    short_digest(&blob, 12)
}

/// Probe predicate over the truth spine; no reconstruction without a
/// plausible spine.
fn probe_spine(header: &str, goal: &str, witnesses: &[String]) -> bool {
    if header.trim().is_empty() || goal.trim().is_empty() {
        return false;
    }
    witnesses
        .iter()
        .all(|w| w.starts_with("Decision:") || w.starts_with("Note:"))
}

fn confidence_score(tier: u8, probe_ok: bool) -> f64 {
    if !probe_ok {
        return 0.0;
    }
    match tier {
        TIER_LOSSLESS => 0.95,
        TIER_TINY => 0.70,
        _ => 0.50,
    }
}

/// Encodes `text` at the given tier. Tier 3 carries the residual and
/// reconstructs exactly; tier 0 keeps only the spine.
pub fn mem_encode(text: &str, tier: u8) -> Result<Vec<u8>, MemError> {
    if tier != TIER_TINY && tier != TIER_LOSSLESS {
        return Err(MemError::Corrupt("tier must be 0 or 3"));
    }
    let sk = extract_skeleton(text);
    let sk_text = render_skeleton(&sk);
    let witnesses = extract_witnesses(text);
    let (residual, prefixed) = if tier == TIER_LOSSLESS {
        let (r, p) = extract_residual(text, &sk_text);
        (r.to_owned(), p)
    } else {
        (String::new(), true)
    };

    let packet = MemPacket {
        v: PACKET_VERSION.to_owned(),
        t: tier,
        e: spine_checksum(&sk.header, &sk.goal, &witnesses),
        f: fingerprint(&sk.header, &sk.goal, &witnesses),
        sk,
        w: witnesses,
        r: residual,
        p: prefixed,
    };

    let json = serde_json::to_vec(&packet).map_err(|_| MemError::Corrupt("serialize failed"))?;
    Ok(zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?)
}

fn parse_packet(bytes: &[u8]) -> Result<MemPacket, MemError> {
    let json = zstd::decode_all(bytes).map_err(|_| MemError::Corrupt("not a zstd stream"))?;
    serde_json::from_slice(&json).map_err(|_| MemError::Corrupt("not a memory packet"))
}

/// Decodes one packet, verifying the truth spine and gating on confidence.
pub fn mem_decode(bytes: &[u8], min_confidence: f64) -> Result<Decoded, MemError> {
    let pkt = parse_packet(bytes)?;

    if pkt.e != spine_checksum(&pkt.sk.header, &pkt.sk.goal, &pkt.w) {
        return Err(MemError::ChecksumMismatch);
    }
    if pkt.f != fingerprint(&pkt.sk.header, &pkt.sk.goal, &pkt.w) {
        return Err(MemError::FingerprintMismatch);
    }

    let probe_ok = probe_spine(&pkt.sk.header, &pkt.sk.goal, &pkt.w);
    let confidence = confidence_score(pkt.t, probe_ok);
    if confidence < min_confidence {
        return Err(MemError::NeedsMoreBits {
            confidence,
            floor: min_confidence,
        });
    }

    let text = if pkt.p {
        format!("{}{}", render_skeleton(&pkt.sk), pkt.r)
    } else {
        pkt.r.clone()
    };
    if pkt.t == TIER_LOSSLESS {
        Ok(Decoded::Exact(text.into_bytes()))
    } else {
        Ok(Decoded::Approximate {
            payload: text.into_bytes(),
            confidence,
        })
    }
}

/// Walks packets low tier to high and returns the first decode that clears
/// the confidence floor, with the tier that produced it.
pub fn mem_decode_with_fallback(
    packets_low_to_high: &[Vec<u8>],
    min_confidence: f64,
) -> Result<(Decoded, u8), MemError> {
    let mut last_err = MemError::Corrupt("no packets");
    for bytes in packets_low_to_high {
        match mem_decode(bytes, min_confidence) {
            Ok(decoded) => {
                let tier = parse_packet(bytes)?.t;
                return Ok((decoded, tier));
            }
            Err(err @ MemError::NeedsMoreBits { .. }) => last_err = err,
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}

/// Append-only log of verified decodes; the drift guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitRecord {
    pub fingerprint: String,
    pub tier: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct CommitLog {
    records: Vec<CommitRecord>,
}

impl CommitLog {
    pub fn new() -> Self {
        CommitLog::default()
    }

    pub fn commit(&mut self, tier: u8, decoded: &Decoded) -> &CommitRecord {
        let payload = decoded.payload().to_vec();
        let fp = short_digest(&String::from_utf8_lossy(&payload), 12);
        self.records.push(CommitRecord {
            fingerprint: fp,
            tier,
            bytes: payload,
        });
        self.records.last().expect("just pushed")
    }

    pub fn last(&self) -> Option<&CommitRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_agent_log() -> String {
        [
            "Project: trace compactor",
            "Goal: keep session memory small without losing decisions.",
            "Decision: start from the template codec.",
            "Note: keep the roadmap file updated.",
            "",
            "Session recap:",
            "- mined templates from the worker log",
            "- verified roundtrip on 10k lines",
        ]
        .join("\n")
    }

    #[test]
    fn tier3_roundtrip_is_exact() {
        let raw = toy_agent_log();
        let pkt = mem_encode(&raw, TIER_LOSSLESS).unwrap();
        match mem_decode(&pkt, 0.6).unwrap() {
            Decoded::Exact(bytes) => assert_eq!(bytes, raw.as_bytes()),
            other => panic!("expected exact decode, got {other:?}"),
        }
    }

    #[test]
    fn tier0_is_approximate_but_valid() {
        let raw = toy_agent_log();
        let pkt = mem_encode(&raw, TIER_TINY).unwrap();
        match mem_decode(&pkt, 0.6).unwrap() {
            Decoded::Approximate {
                payload,
                confidence,
            } => {
                assert!(!payload.is_empty());
                assert!(confidence >= 0.6);
            }
            other => panic!("expected approximate decode, got {other:?}"),
        }
    }

    #[test]
    fn high_floor_escalates_to_tier3() {
        let raw = toy_agent_log();
        let pkt0 = mem_encode(&raw, TIER_TINY).unwrap();
        let pkt3 = mem_encode(&raw, TIER_LOSSLESS).unwrap();
        let (decoded, tier) = mem_decode_with_fallback(&[pkt0, pkt3], 0.8).unwrap();
        assert_eq!(tier, TIER_LOSSLESS);
        assert_eq!(decoded.payload(), raw.as_bytes());
    }

    #[test]
    fn tier3_exact_even_with_indented_header() {
        // The trimmed skeleton is not a literal prefix here.
        let raw = "   Project: indented\nGoal: still exact.\nbody line\n";
        let pkt = mem_encode(raw, TIER_LOSSLESS).unwrap();
        match mem_decode(&pkt, 0.6).unwrap() {
            Decoded::Exact(bytes) => assert_eq!(bytes, raw.as_bytes()),
            other => panic!("expected exact decode, got {other:?}"),
        }
    }

    #[test]
    fn tampered_spine_is_rejected() {
        let raw = toy_agent_log();
        let pkt = mem_encode(&raw, TIER_LOSSLESS).unwrap();
        let json = zstd::decode_all(pkt.as_slice()).unwrap();
        let tampered = String::from_utf8(json)
            .unwrap()
            .replace("trace compactor", "other project");
        let repacked = zstd::encode_all(tampered.as_bytes(), 3).unwrap();
        assert!(matches!(
            mem_decode(&repacked, 0.6),
            Err(MemError::ChecksumMismatch)
        ));
    }

    #[test]
    fn commit_log_appends() {
        let raw = toy_agent_log();
        let pkt = mem_encode(&raw, TIER_LOSSLESS).unwrap();
        let decoded = mem_decode(&pkt, 0.6).unwrap();
        let mut log = CommitLog::new();
        let fp = log.commit(TIER_LOSSLESS, &decoded).fingerprint.clone();
        assert_eq!(log.len(), 1);
        let last = log.last().unwrap();
        assert_eq!(last.fingerprint, fp);
        assert_eq!(last.tier, TIER_LOSSLESS);
        assert_eq!(last.bytes, raw.as_bytes());
    }
}
