//! Core types and traits for cildump
//!
//! This crate provides the foundational types shared by the binary loader
//! and the IL2CPP dumper core.

pub mod config;
pub mod error;
pub mod types;

pub use config::DumpConfig;
pub use error::{Error, Result};
pub use types::*;
