//! Template mining.
//!
//! A canonical line is split into maximal runs of ASCII whitespace and
//! non-whitespace; separator runs stay part of the template so concatenating
//! tokens reproduces the line exactly. Word tokens that look parameter-like
//! (a canonicalizer sentinel, a strict decimal integer, a strict IPv4 quad)
//! become wildcard slots; everything else is literal. The shape fingerprint
//! over token categories and literal text keys the bank, and ids are dense
//! in first-seen order, so the same input always yields the same bank.

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::canon::{SideToken, SENTINELS};
use crate::error::UscError;
use crate::varint::encode_uvarint;

/// Wildcard rendering for display and logs; slots are flag bits on the wire.
pub const WILDCARD: &str = "<*>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateToken {
    Literal(String),
    Slot,
}

/// A parameterized line shape: literal runs (including separators)
/// interleaved with slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    tokens: Vec<TemplateToken>,
}

impl Template {
    pub fn from_tokens(tokens: Vec<TemplateToken>) -> Self {
        Template { tokens }
    }

    pub fn tokens(&self) -> &[TemplateToken] {
        &self.tokens
    }

    /// Number of slots.
    pub fn arity(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| matches!(t, TemplateToken::Slot))
            .count()
    }

    /// Rebuilds the canonical line; `params` must have exactly `arity`
    /// entries.
    pub fn reconstruct(&self, params: &[String]) -> String {
        let mut out = String::new();
        let mut next = 0usize;
        for tok in &self.tokens {
            match tok {
                TemplateToken::Literal(s) => out.push_str(s),
                TemplateToken::Slot => {
                    if let Some(p) = params.get(next) {
                        out.push_str(p);
                    }
                    next += 1;
                }
            }
        }
        out
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for tok in &self.tokens {
            match tok {
                TemplateToken::Literal(s) => f.write_str(s)?,
                TemplateToken::Slot => f.write_str(WILDCARD)?,
            }
        }
        Ok(())
    }
}

/// The ordered template set of one session. Grown monotonically while
/// mining, then frozen into the DICT packet.
pub struct TemplateBank {
    templates: Vec<Template>,
    index: HashMap<Vec<u8>, u32>,
    cap: u32,
}

impl TemplateBank {
    pub fn new(cap: u32) -> Self {
        TemplateBank {
            templates: Vec::new(),
            index: HashMap::new(),
            cap,
        }
    }

    /// Rebuilds a decoder-side bank from DICT templates; no fingerprints
    /// needed since the decoder never mines.
    pub fn from_templates(templates: Vec<Template>) -> Self {
        TemplateBank {
            templates,
            index: HashMap::new(),
            cap: u32::MAX,
        }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, tid: u32) -> Option<&Template> {
        self.templates.get(tid as usize)
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    fn intern(&mut self, fingerprint: Vec<u8>, template: Template) -> Result<u32, UscError> {
        if let Some(&tid) = self.index.get(&fingerprint) {
            return Ok(tid);
        }
        if self.templates.len() as u32 >= self.cap {
            return Err(UscError::TemplateBankOverflow { cap: self.cap });
        }
        let tid = self.templates.len() as u32;
        self.templates.push(template);
        self.index.insert(fingerprint, tid);
        Ok(tid)
    }
}

/// One input line after mining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Templated {
        tid: u32,
        params: Vec<String>,
        side: Vec<SideToken>,
    },
    Raw {
        bytes: Vec<u8>,
    },
}

impl Row {
    pub fn is_templated(&self) -> bool {
        matches!(self, Row::Templated { .. })
    }
}

/// Streaming miner; owns the bank for one encode session.
pub struct Miner {
    bank: TemplateBank,
    overflow_warned: bool,
}

impl Miner {
    pub fn new(max_templates: u32) -> Self {
        Miner {
            bank: TemplateBank::new(max_templates),
            overflow_warned: false,
        }
    }

    pub fn bank(&self) -> &TemplateBank {
        &self.bank
    }

    pub fn into_bank(self) -> TemplateBank {
        self.bank
    }

    /// Mines one line. `raw` is the original bytes (kept verbatim when the
    /// line cannot be templated), `canonical`/`side` its canonical form.
    pub fn mine(&mut self, raw: &[u8], canonical: &str, side: Vec<SideToken>) -> Row {
        let pieces = tokenize(canonical);
        let word_count = pieces.iter().filter(|p| !p.is_whitespace).count();
        if word_count < 2 {
            return Row::Raw {
                bytes: raw.to_vec(),
            };
        }

        let mut fingerprint = Vec::new();
        let mut tokens = Vec::with_capacity(pieces.len());
        let mut params = Vec::new();
        for piece in &pieces {
            if !piece.is_whitespace && is_param_like(piece.text) {
                fingerprint.push(0x01);
                tokens.push(TemplateToken::Slot);
                params.push(piece.text.to_owned());
            } else {
                fingerprint.push(0x00);
                encode_uvarint(piece.text.len() as u64, &mut fingerprint);
                fingerprint.extend_from_slice(piece.text.as_bytes());
                tokens.push(TemplateToken::Literal(piece.text.to_owned()));
            }
        }

        match self
            .bank
            .intern(fingerprint, Template::from_tokens(tokens))
        {
            Ok(tid) => Row::Templated { tid, params, side },
            Err(_) => {
                if !self.overflow_warned {
                    warn!(cap = self.bank.cap, "template bank full, demoting to raw rows");
                    self.overflow_warned = true;
                }
                Row::Raw {
                    bytes: raw.to_vec(),
                }
            }
        }
    }
}

struct Piece<'a> {
    text: &'a str,
    is_whitespace: bool,
}

/// Maximal runs of ASCII whitespace / non-whitespace, in order.
fn tokenize(line: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let bytes = line.as_bytes();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let ws = bytes[i].is_ascii_whitespace();
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() == ws {
            j += 1;
        }
        out.push(Piece {
            text: &line[start..j],
            is_whitespace: ws,
        });
        start = j;
        i = j;
    }
    out
}

fn is_param_like(token: &str) -> bool {
    SENTINELS.contains(&token) || is_strict_int(token) || is_strict_ipv4(token)
}

/// Decimal integer whose canonical rendering reproduces the token exactly:
/// optional sign, no redundant leading zero, i64 range.
pub fn is_strict_int(token: &str) -> bool {
    let digits = token.strip_prefix('-').unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return false;
    }
    if token.starts_with('-') && digits == "0" {
        return false;
    }
    token.parse::<i64>().is_ok()
}

/// Dotted quad with strict octets (0-255, no leading zeros).
pub fn is_strict_ipv4(token: &str) -> bool {
    let mut octets = 0u32;
    for part in token.split('.') {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        if part.len() > 1 && part.starts_with('0') {
            return false;
        }
        match part.parse::<u16>() {
            Ok(v) if v <= 255 => octets += 1,
            _ => return false,
        }
    }
    octets == 4 && token.split('.').count() == 4
}
