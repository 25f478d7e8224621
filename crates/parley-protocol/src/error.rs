use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated header: expected 5 bytes, got {0}")]
    TruncatedHeader(usize),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("declared body size {0} exceeds the 10 MiB limit")]
    OversizeDeclared(u32),

    #[error("malformed voice payload ({0} bytes)")]
    MalformedVoice(usize),

    #[error("truncated report body: expected {expected} bytes, got {got}")]
    TruncatedReport { expected: usize, got: usize },

    #[error("malformed hello datagram ({0} bytes)")]
    MalformedHello(usize),

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
}
