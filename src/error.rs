//! Error types for the agent session core.
//!
//! Every fallible path in this crate returns [`AgentError`]. The variant
//! itself records *what* went wrong; whether that becomes a silent drop, a
//! logged-and-continue, or a surfaced failure is decided where the error is
//! handled (staging, the dispatcher), not baked into the type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport body shorter than the minimum routing header")]
    ShortPacket,

    #[error("routing packet header failed to authenticate")]
    MalformedRouting,

    #[error("HMAC verification failed")]
    HmacFail,

    #[error("invalid RSA key format")]
    InvalidKeyFormat,

    #[error("unsupported agent language: {0}")]
    UnsupportedLanguage(String),

    #[error("sysinfo payload malformed: expected 12 fields, got {0}")]
    MalformedSysinfo(usize),

    #[error("nonce replay detected")]
    NonceReplay,

    #[error("unknown agent: {0}")]
    AgentUnknown(String),

    #[error("persistence error: {0}")]
    DbError(#[from] rusqlite::Error),

    #[error("path escapes the downloads root")]
    PathEscape,

    #[error("CRC mismatch on downloaded chunk")]
    CrcMismatch,

    #[error("unknown response opcode: {0}")]
    UnknownOpcode(u16),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
