//! Binary format loaders for IL2CPP dumping
//!
//! Supports ELF (Linux/Android), PE (Windows), Mach-O (macOS/iOS,
//! including FAT containers), NSO (Nintendo Switch) and WebAssembly
//! (WebGL). Every loader yields a [`BinaryFile`]: a common virtual-memory
//! view over segments, sections and (when present) symbols.

pub mod common;
pub mod elf;
pub mod error;
pub mod macho;
pub mod nso;
pub mod pe;
pub mod wasm;

pub use common::{BinaryFile, BinaryReader, Region, Section, SectionFlags, Segment, Symbol};
pub use error::{ParseError, ParseResult};

use cildump_core::BinaryFormat;
use tracing::info;

/// Detect binary format from the first bytes
pub fn detect_format(data: &[u8]) -> Option<BinaryFormat> {
    if data.len() < 8 {
        return None;
    }
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

    match magic {
        m if m & 0xFFFF == 0x5A4D => Some(BinaryFormat::Pe),
        0x464C457F => Some(BinaryFormat::Elf),
        macho::MH_MAGIC | macho::MH_MAGIC_64 => Some(BinaryFormat::MachO),
        // FAT headers are big-endian; accept either byte order
        0xCAFEBABE | 0xBEBAFECA => Some(BinaryFormat::MachO),
        nso::NSO_MAGIC => Some(BinaryFormat::Nso),
        wasm::WASM_MAGIC => Some(BinaryFormat::Wasm),
        _ => None,
    }
}

/// Parse binary data into the matching loader
pub fn parse_binary(data: &[u8]) -> ParseResult<Box<dyn BinaryFile>> {
    let magic = if data.len() >= 4 {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]])
    } else {
        0
    };
    let format = detect_format(data).ok_or(ParseError::UnknownFormat { magic })?;
    info!(?format, "detected binary format");

    Ok(match format {
        BinaryFormat::Pe => Box::new(pe::PeFile::parse(data)?),
        BinaryFormat::Elf => Box::new(elf::ElfFile::parse(data)?),
        BinaryFormat::MachO => Box::new(macho::MachOFile::parse(data)?),
        BinaryFormat::Nso => Box::new(nso::NsoFile::parse(data)?),
        BinaryFormat::Wasm => Box::new(wasm::WasmFile::parse(data)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_formats_by_magic() {
        assert_eq!(detect_format(b"\x7FELF\x02\x01\x01\x00"), Some(BinaryFormat::Elf));
        assert_eq!(detect_format(b"MZ\x90\x00\x03\x00\x00\x00"), Some(BinaryFormat::Pe));
        assert_eq!(
            detect_format(&[0xCF, 0xFA, 0xED, 0xFE, 0, 0, 0, 0]),
            Some(BinaryFormat::MachO)
        );
        assert_eq!(detect_format(b"NSO0\x00\x00\x00\x00"), Some(BinaryFormat::Nso));
        assert_eq!(detect_format(b"\x00asm\x01\x00\x00\x00"), Some(BinaryFormat::Wasm));
        assert_eq!(detect_format(b"\x00\x00\x00\x00\x00\x00\x00\x00"), None);
    }

    #[test]
    fn unknown_format_reports_magic() {
        let err = parse_binary(&[0x11, 0x22, 0x33, 0x44, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ParseError::UnknownFormat { magic: 0x44332211 }));
    }
}
