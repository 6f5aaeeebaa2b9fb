//! Common types used throughout the dumper

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Represents a memory address (supports both 32 and 64 bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    pub const ZERO: Address = Address(0);

    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn offset(&self, offset: i64) -> Self {
        Self((self.0 as i64 + offset) as u64)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value as u64)
    }
}

/// Architecture type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86,
    X64,
    Arm32,
    Arm64,
    Wasm32,
    Unknown,
}

impl Architecture {
    pub fn pointer_size(&self) -> usize {
        match self {
            Architecture::X86 | Architecture::Arm32 | Architecture::Wasm32 => 4,
            Architecture::X64 | Architecture::Arm64 => 8,
            Architecture::Unknown => 8,
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, Architecture::X64 | Architecture::Arm64)
    }
}

/// Platform/OS type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    Linux,
    MacOS,
    Android,
    Ios,
    Switch,
    Web,
    Unknown,
}

/// Binary format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryFormat {
    Elf,
    Pe,
    MachO,
    Nso,
    Wasm,
}

/// The produced output files, keyed by filename.
///
/// A `BTreeMap` so iteration order (and any archive built from it) is
/// stable across runs.
pub type Artifacts = BTreeMap<String, Vec<u8>>;
