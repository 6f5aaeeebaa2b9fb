//! WebAssembly parser for Unity WebGL builds
//!
//! Data segments are addressed by their linear-memory offset, which is
//! what IL2CPP pointers mean inside a WASM build; the code section is
//! addressed by file offset.

use crate::common::{BinaryFile, BinaryReader, Section, SectionFlags, Segment, Symbol};
use crate::error::{ParseError, ParseResult};
use cildump_core::{Address, Architecture, BinaryFormat, Platform};

/// "\0asm" little-endian
pub const WASM_MAGIC: u32 = 0x6D736100;
const WASM_VERSION: u32 = 1;

const SECTION_CODE: u8 = 10;
const SECTION_DATA: u8 = 11;

const OP_I32_CONST: u8 = 0x41;
const OP_END: u8 = 0x0B;

/// Parsed WebAssembly module
#[derive(Debug)]
pub struct WasmFile {
    data: Vec<u8>,
    segments: Vec<Segment>,
    sections: Vec<Section>,
}

impl WasmFile {
    /// Parse a WebAssembly module from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, true);

        let magic = reader.read_u32()?;
        if magic != WASM_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: WASM_MAGIC,
                actual: magic,
            });
        }
        let version = reader.read_u32()?;
        if version != WASM_VERSION {
            return Err(ParseError::malformed(format!(
                "unsupported WebAssembly version {version}"
            )));
        }

        let mut segments = Vec::new();
        let mut sections = Vec::new();

        while reader.remaining() > 0 {
            let id = reader.read_u8()?;
            let size = reader.read_uleb128()? as usize;
            let content_start = reader.offset();

            match id {
                SECTION_CODE => {
                    // Function bodies are "executable" for the locator; they
                    // are addressed by file offset.
                    let flags = SectionFlags::READ | SectionFlags::EXECUTE;
                    segments.push(Segment {
                        file_offset: content_start as u64,
                        virtual_address: content_start as u64,
                        file_size: size as u64,
                        memory_size: size as u64,
                        flags,
                    });
                    sections.push(Section {
                        name: "code".to_string(),
                        virtual_address: Address::new(content_start as u64),
                        virtual_size: size as u64,
                        raw_offset: content_start as u64,
                        raw_size: size as u64,
                        characteristics: flags,
                    });
                }
                SECTION_DATA => {
                    Self::parse_data_section(&mut reader, &mut segments, &mut sections)?;
                }
                _ => {}
            }

            reader.set_offset(content_start + size);
        }

        Ok(Self {
            data: data.to_vec(),
            segments,
            sections,
        })
    }

    fn parse_data_section(
        reader: &mut BinaryReader,
        segments: &mut Vec<Segment>,
        sections: &mut Vec<Section>,
    ) -> ParseResult<()> {
        let count = reader.read_uleb128()?;
        for i in 0..count {
            let flags = reader.read_uleb128()?;
            let mut linear_offset = 0i64;

            match flags {
                0 | 2 => {
                    if flags == 2 {
                        let _memory_index = reader.read_uleb128()?;
                    }
                    let opcode = reader.read_u8()?;
                    if opcode == OP_I32_CONST {
                        linear_offset = reader.read_sleb128()?;
                    }
                    let end = reader.read_u8()?;
                    if end != OP_END {
                        return Err(ParseError::malformed("data segment init expr not terminated"));
                    }
                }
                1 => {
                    // passive segment, no linear address
                }
                other => {
                    return Err(ParseError::malformed(format!(
                        "unknown data segment flags {other}"
                    )));
                }
            }

            let size = reader.read_uleb128()? as usize;
            let data_offset = reader.offset();
            reader.skip(size)?;

            let section_flags = SectionFlags::READ | SectionFlags::WRITE;
            segments.push(Segment {
                file_offset: data_offset as u64,
                virtual_address: linear_offset as u64,
                file_size: size as u64,
                memory_size: size as u64,
                flags: section_flags,
            });
            sections.push(Section {
                name: format!("data{i}"),
                virtual_address: Address::new(linear_offset as u64),
                virtual_size: size as u64,
                raw_offset: data_offset as u64,
                raw_size: size as u64,
                characteristics: section_flags,
            });
        }
        Ok(())
    }
}

impl BinaryFile for WasmFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Wasm
    }

    fn architecture(&self) -> Architecture {
        Architecture::Wasm32
    }

    fn platform(&self) -> Platform {
        Platform::Web
    }

    fn image_base(&self) -> Address {
        Address::ZERO
    }

    fn entry_point(&self) -> Address {
        Address::ZERO
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn symbols(&self) -> &[Symbol] {
        &[]
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
    }

    fn sleb(mut v: i64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7F) as u8;
            v >>= 7;
            let sign = byte & 0x40 != 0;
            if (v == 0 && !sign) || (v == -1 && sign) {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Module with one code section and one active data segment.
    pub(crate) fn build_wasm(code: &[u8], data_seg: &[u8], linear_offset: i64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&WASM_MAGIC.to_le_bytes());
        out.extend_from_slice(&WASM_VERSION.to_le_bytes());

        out.push(SECTION_CODE);
        uleb(code.len() as u64, &mut out);
        out.extend_from_slice(code);

        let mut body = Vec::new();
        uleb(1, &mut body); // one segment
        uleb(0, &mut body); // active, memory 0
        body.push(OP_I32_CONST);
        sleb(linear_offset, &mut body);
        body.push(OP_END);
        uleb(data_seg.len() as u64, &mut body);
        body.extend_from_slice(data_seg);

        out.push(SECTION_DATA);
        uleb(body.len() as u64, &mut out);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn data_segments_use_linear_addresses() {
        let data = build_wasm(&[0u8; 8], b"il2cpp-data-here", 0x8000);
        let wasm = WasmFile::parse(&data).unwrap();

        assert_eq!(wasm.architecture().pointer_size(), 4);
        let off = wasm.va_to_offset(Address::new(0x8000)).unwrap();
        assert_eq!(&wasm.data()[off as usize..off as usize + 6], b"il2cpp");
        assert!(wasm.va_to_offset(Address::new(0x9000)).is_none());
    }

    #[test]
    fn code_section_is_executable_region() {
        let data = build_wasm(&[0xAB; 8], &[0; 4], 0x100);
        let wasm = WasmFile::parse(&data).unwrap();
        assert_eq!(wasm.exec_regions().len(), 1);
        assert_eq!(wasm.data_regions().len(), 1);
    }
}
