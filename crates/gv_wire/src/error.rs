use thiserror::Error;

/// Result alias for wire-level operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised by the token stream reader and writer.
///
/// Every variant means the byte stream cannot be interpreted under the
/// wire contract; none of them are recoverable mid-operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WireError {
    #[error("unknown token byte 0x{byte:02X}")]
    UnknownToken { byte: u8 },

    #[error("truncated stream: needed {needed} more byte(s) at offset {position}")]
    Truncated { position: usize, needed: usize },

    #[error("length prefix {length} exceeds the {remaining} remaining byte(s)")]
    BadLength { length: u32, remaining: usize },

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("0x{0:08X} is not a valid character scalar")]
    InvalidChar(u32),

    #[error("{0} is not a valid date kind byte")]
    InvalidDateKind(u8),

    #[error("tick count {0} is outside the representable date range")]
    TicksOutOfRange(i64),
}
