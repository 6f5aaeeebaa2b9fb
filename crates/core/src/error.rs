//! Error taxonomy for the dumper core

use thiserror::Error;

/// Main error type for the dumper core.
///
/// Every failure that crosses the `dump()` boundary is one of these
/// variants; partial output is never preserved.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata version {0} is not supported")]
    UnsupportedVersion(u32),

    #[error(
        "ambiguous metadata version: table {table} has {residual} trailing bytes at version {version}"
    )]
    AmbiguousVersion {
        table: &'static str,
        residual: usize,
        version: f64,
    },

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("unsupported binary format (magic {0:#010x})")]
    UnsupportedBinaryFormat(u32),

    #[error("malformed binary: {0}")]
    MalformedBinary(String),

    #[error("virtual address {0:#x} is outside all mapped segments")]
    UnmappedAddress(u64),

    #[error("could not locate CodeRegistration/MetadataRegistration")]
    RegistrationNotFound,

    #[error("index {index} is outside the {table} table (len {len})")]
    CorruptIndex {
        table: &'static str,
        index: i64,
        len: usize,
    },

    #[error("unexpected end of data at offset {offset:#x}")]
    UnexpectedEof { offset: usize },

    #[error("unterminated string at offset {offset:#x}")]
    MalformedString { offset: u64 },
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed_metadata(msg: impl Into<String>) -> Self {
        Self::MalformedMetadata(msg.into())
    }

    pub fn malformed_binary(msg: impl Into<String>) -> Self {
        Self::MalformedBinary(msg.into())
    }

    pub fn corrupt_index(table: &'static str, index: i64, len: usize) -> Self {
        Self::CorruptIndex { table, index, len }
    }
}
