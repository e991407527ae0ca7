use thiserror::Error;

/// Codec-wide error taxonomy.
///
/// Encoder-side conditions degrade to `Raw` storage instead of erroring;
/// decoder-side conditions are fatal and carry the packet index and byte
/// offset where parsing stopped.
#[derive(Error, Debug)]
pub enum UscError {
    #[error("malformed input in packet {packet} at byte {offset}: {detail}")]
    MalformedInput {
        packet: usize,
        offset: usize,
        detail: &'static str,
    },
    #[error("unsupported version {version} (mode tag {mode_tag})")]
    VersionUnsupported { version: u8, mode_tag: u8 },
    #[error("template bank overflow (cap {cap})")]
    TemplateBankOverflow { cap: u32 },
    #[error("roundtrip mismatch at line {line}")]
    RoundtripMismatch { line: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UscError {
    /// Truncated-buffer error with no packet context yet; the session layer
    /// rewrites the packet index when it knows it.
    pub(crate) fn truncated(offset: usize, detail: &'static str) -> Self {
        UscError::MalformedInput {
            packet: 0,
            offset,
            detail,
        }
    }

    pub(crate) fn in_packet(self, packet: usize) -> Self {
        match self {
            UscError::MalformedInput { offset, detail, .. } => UscError::MalformedInput {
                packet,
                offset,
                detail,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, UscError>;
