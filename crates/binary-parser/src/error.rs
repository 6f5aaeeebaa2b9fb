//! Error types for binary parsing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown binary format (magic {magic:#010x})")]
    UnknownFormat { magic: u32 },

    #[error("invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("malformed binary: {0}")]
    MalformedBinary(String),

    #[error("virtual address {0:#x} is outside all mapped segments")]
    UnmappedAddress(u64),

    #[error("truncated data: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unterminated string at {va:#x}")]
    UnterminatedString { va: u64 },
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl ParseError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedBinary(msg.into())
    }

    pub fn truncated(expected: usize, actual: usize) -> Self {
        Self::Truncated { expected, actual }
    }
}

impl From<ParseError> for cildump_core::Error {
    fn from(err: ParseError) -> Self {
        use cildump_core::Error;
        match err {
            ParseError::Io(e) => Error::Io(e),
            ParseError::UnknownFormat { magic } => Error::UnsupportedBinaryFormat(magic),
            ParseError::UnmappedAddress(va) => Error::UnmappedAddress(va),
            ParseError::UnterminatedString { va } => Error::MalformedString { offset: va },
            other => Error::MalformedBinary(other.to_string()),
        }
    }
}
