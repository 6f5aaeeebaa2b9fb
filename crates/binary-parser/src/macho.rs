//! Mach-O parser for macOS/iOS binaries
//!
//! Handles 32-bit and 64-bit images plus FAT (universal) containers. VA
//! translation goes through LC_SEGMENT commands; the locator's exec/data
//! split comes from section instruction attributes, mirroring how the
//! runtime protects pages.

use crate::common::{
    table_str, BinaryFile, BinaryReader, Region, Section, SectionFlags, Segment, Symbol, SymbolType,
};
use crate::error::{ParseError, ParseResult};
use cildump_core::{Address, Architecture, BinaryFormat, Platform};

pub const MH_MAGIC: u32 = 0xFEEDFACE;
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

const LC_SEGMENT: u32 = 0x1;
const LC_SYMTAB: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;
const LC_ENCRYPTION_INFO: u32 = 0x21;
const LC_ENCRYPTION_INFO_64: u32 = 0x2C;

const CPU_TYPE_X86: i32 = 7;
const CPU_TYPE_X86_64: i32 = 0x01000007;
const CPU_TYPE_ARM: i32 = 12;
const CPU_TYPE_ARM64: i32 = 0x0100000C;

const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x80000000;
const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x00000400;
const S_ZEROFILL: u32 = 0x1;

/// Parsed Mach-O file (one architecture slice)
#[derive(Debug)]
pub struct MachOFile {
    data: Vec<u8>,
    architecture: Architecture,
    is_64bit: bool,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    section_exec: Vec<bool>,
    symbols: Vec<Symbol>,
}

impl MachOFile {
    /// Parse a Mach-O image; FAT containers resolve to the preferred
    /// (64-bit if present) slice first.
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 8 {
            return Err(ParseError::truncated(8, data.len()));
        }
        let magic_le = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let magic_be = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);

        if magic_le == FAT_MAGIC || magic_be == FAT_MAGIC {
            let slice = Self::select_fat_slice(data)?;
            return Self::parse_thin(&slice);
        }
        if magic_le == MH_MAGIC || magic_le == MH_MAGIC_64 {
            return Self::parse_thin(data);
        }
        Err(ParseError::InvalidMagic {
            expected: MH_MAGIC_64,
            actual: magic_le,
        })
    }

    /// FAT headers are big-endian; prefer the 64-bit slice.
    fn select_fat_slice(data: &[u8]) -> ParseResult<Vec<u8>> {
        let mut reader = BinaryReader::new(data, false);
        reader.set_offset(4);
        let nfat_arch = reader.read_u32()? as usize;

        let mut slices = Vec::with_capacity(nfat_arch);
        for _ in 0..nfat_arch {
            let _cputype = reader.read_u32()?;
            let _cpusubtype = reader.read_u32()?;
            let offset = reader.read_u32()? as usize;
            let size = reader.read_u32()? as usize;
            let _align = reader.read_u32()?;
            if offset + size > data.len() {
                return Err(ParseError::malformed("FAT slice exceeds file"));
            }
            let slice_magic =
                u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);
            slices.push((slice_magic, offset, size));
        }
        if slices.is_empty() {
            return Err(ParseError::malformed("FAT file with no architectures"));
        }

        let &(_, offset, size) = slices
            .iter()
            .find(|(magic, _, _)| *magic == MH_MAGIC_64)
            .unwrap_or(&slices[0]);
        tracing::debug!(offset, size, "selected FAT slice");
        Ok(data[offset..offset + size].to_vec())
    }

    fn parse_thin(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, true);
        let magic = reader.read_u32()?;
        let is_64bit = match magic {
            MH_MAGIC => false,
            MH_MAGIC_64 => true,
            other => {
                return Err(ParseError::InvalidMagic {
                    expected: MH_MAGIC_64,
                    actual: other,
                });
            }
        };

        let cputype = reader.read_i32()?;
        let _cpusubtype = reader.read_i32()?;
        let _filetype = reader.read_u32()?;
        let ncmds = reader.read_u32()?;
        let _sizeofcmds = reader.read_u32()?;
        let _flags = reader.read_u32()?;
        if is_64bit {
            let _reserved = reader.read_u32()?;
        }

        let architecture = match cputype {
            CPU_TYPE_X86 => Architecture::X86,
            CPU_TYPE_X86_64 => Architecture::X64,
            CPU_TYPE_ARM => Architecture::Arm32,
            CPU_TYPE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        let mut segments = Vec::new();
        let mut sections = Vec::new();
        let mut section_exec = Vec::new();
        let mut symtab = None;

        for _ in 0..ncmds {
            let cmd_pos = reader.offset();
            let cmd = reader.read_u32()?;
            let cmdsize = reader.read_u32()? as usize;

            match cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let _segname = reader.read_bytes(16)?;
                    let vmaddr = reader.read_word(is_64bit)?;
                    let vmsize = reader.read_word(is_64bit)?;
                    let fileoff = reader.read_word(is_64bit)?;
                    let filesize = reader.read_word(is_64bit)?;
                    let _maxprot = reader.read_i32()?;
                    let initprot = reader.read_i32()?;
                    let nsects = reader.read_u32()?;
                    let _segflags = reader.read_u32()?;

                    if vmsize != 0 {
                        let mut flags = SectionFlags::empty();
                        if initprot & 0x1 != 0 {
                            flags |= SectionFlags::READ;
                        }
                        if initprot & 0x2 != 0 {
                            flags |= SectionFlags::WRITE;
                        }
                        if initprot & 0x4 != 0 {
                            flags |= SectionFlags::EXECUTE;
                        }
                        segments.push(Segment {
                            file_offset: fileoff,
                            virtual_address: vmaddr,
                            file_size: filesize,
                            memory_size: vmsize,
                            flags,
                        });
                    }

                    for _ in 0..nsects {
                        let sectname = reader.read_bytes(16)?;
                        let _segname = reader.read_bytes(16)?;
                        let addr = reader.read_word(is_64bit)?;
                        let size = reader.read_word(is_64bit)?;
                        let offset = reader.read_u32()? as u64;
                        let _align = reader.read_u32()?;
                        let _reloff = reader.read_u32()?;
                        let _nreloc = reader.read_u32()?;
                        let flags = reader.read_u32()?;
                        let _reserved1 = reader.read_u32()?;
                        let _reserved2 = reader.read_u32()?;
                        if is_64bit {
                            let _reserved3 = reader.read_u32()?;
                        }

                        let is_exec = flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS)
                            != 0;
                        let is_zerofill = flags & 0xFF == S_ZEROFILL;
                        let mut characteristics = SectionFlags::READ;
                        if is_exec {
                            characteristics |= SectionFlags::EXECUTE;
                        }
                        if is_zerofill {
                            characteristics |= SectionFlags::UNINITIALIZED;
                        }
                        sections.push(Section {
                            name: table_str(sectname, 0),
                            virtual_address: Address::new(addr),
                            virtual_size: size,
                            raw_offset: offset,
                            raw_size: if is_zerofill { 0 } else { size },
                            characteristics,
                        });
                        section_exec.push(is_exec);
                    }
                }
                LC_SYMTAB => {
                    let symoff = reader.read_u32()? as usize;
                    let nsyms = reader.read_u32()? as usize;
                    let stroff = reader.read_u32()? as usize;
                    let strsize = reader.read_u32()? as usize;
                    symtab = Some((symoff, nsyms, stroff, strsize));
                }
                LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                    let _cryptoff = reader.read_u32()?;
                    let _cryptsize = reader.read_u32()?;
                    let cryptid = reader.read_u32()?;
                    if cryptid != 0 {
                        tracing::warn!("binary is FairPlay-encrypted; pointers will not resolve");
                    }
                }
                _ => {}
            }

            reader.set_offset(cmd_pos + cmdsize);
        }

        let symbols = match symtab {
            Some((symoff, nsyms, stroff, strsize)) => {
                Self::parse_symbols(data, symoff, nsyms, stroff, strsize, is_64bit)?
            }
            None => Vec::new(),
        };

        Ok(Self {
            data: data.to_vec(),
            architecture,
            is_64bit,
            segments,
            sections,
            section_exec,
            symbols,
        })
    }

    fn parse_symbols(
        data: &[u8],
        symoff: usize,
        nsyms: usize,
        stroff: usize,
        strsize: usize,
        is_64bit: bool,
    ) -> ParseResult<Vec<Symbol>> {
        let strtab = data
            .get(stroff..stroff + strsize)
            .ok_or_else(|| ParseError::malformed("symbol string table exceeds file"))?;
        let mut reader = BinaryReader::new(data, true);
        reader.set_offset(symoff);

        let mut symbols = Vec::with_capacity(nsyms);
        for _ in 0..nsyms {
            let n_strx = reader.read_u32()? as usize;
            let n_type = reader.read_u8()?;
            let _n_sect = reader.read_u8()?;
            let _n_desc = reader.read_u16()?;
            let n_value = reader.read_word(is_64bit)?;

            let name = table_str(strtab, n_strx);
            if name.is_empty() {
                continue;
            }
            let symbol_type = if n_type & 0x0e == 0x0e {
                SymbolType::Object
            } else {
                SymbolType::Unknown
            };
            symbols.push(Symbol {
                name,
                address: Address::new(n_value),
                size: None,
                symbol_type,
            });
        }
        Ok(symbols)
    }
}

impl BinaryFile for MachOFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::MachO
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn platform(&self) -> Platform {
        match self.architecture {
            Architecture::Arm32 | Architecture::Arm64 => Platform::Ios,
            _ => Platform::MacOS,
        }
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn image_base(&self) -> Address {
        self.segments
            .iter()
            .filter(|s| s.virtual_address > 0)
            .map(|s| s.virtual_address)
            .min()
            .map(Address::new)
            .unwrap_or(Address::ZERO)
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
        &self.symbols
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    // Instruction attributes, not segment protections, decide what the
    // locator treats as code.
    fn exec_regions(&self) -> Vec<Region> {
        self.sections
            .iter()
            .zip(&self.section_exec)
            .filter(|(_, exec)| **exec)
            .map(|(s, _)| section_region(s))
            .collect()
    }

    fn data_regions(&self) -> Vec<Region> {
        self.sections
            .iter()
            .zip(&self.section_exec)
            .filter(|(s, exec)| !**exec && s.raw_size > 0)
            .map(|(s, _)| section_region(s))
            .collect()
    }
}

fn section_region(section: &Section) -> Region {
    Region {
        offset: section.raw_offset,
        offset_end: section.raw_offset + section.raw_size,
        address: section.virtual_address.as_u64(),
        address_end: section.virtual_address.as_u64() + section.virtual_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal Mach-O 64 with one RX segment holding one section.
    fn build_macho64(text: &[u8], text_va: u64) -> Vec<u8> {
        let seg_cmd_size = 72 + 80u32; // segment_command_64 + one section_64
        let text_off = (32 + seg_cmd_size) as u64;

        let mut out = Vec::new();
        out.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        out.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes()); // MH_EXECUTE
        out.extend_from_slice(&1u32.to_le_bytes()); // ncmds
        out.extend_from_slice(&seg_cmd_size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved

        out.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        out.extend_from_slice(&seg_cmd_size.to_le_bytes());
        out.extend_from_slice(b"__TEXT\0\0\0\0\0\0\0\0\0\0");
        out.extend_from_slice(&text_va.to_le_bytes());
        out.extend_from_slice(&(text.len() as u64).to_le_bytes());
        out.extend_from_slice(&text_off.to_le_bytes());
        out.extend_from_slice(&(text.len() as u64).to_le_bytes());
        out.extend_from_slice(&5i32.to_le_bytes()); // maxprot r-x
        out.extend_from_slice(&5i32.to_le_bytes()); // initprot r-x
        out.extend_from_slice(&1u32.to_le_bytes()); // nsects
        out.extend_from_slice(&0u32.to_le_bytes());

        out.extend_from_slice(b"__text\0\0\0\0\0\0\0\0\0\0");
        out.extend_from_slice(b"__TEXT\0\0\0\0\0\0\0\0\0\0");
        out.extend_from_slice(&text_va.to_le_bytes());
        out.extend_from_slice(&(text.len() as u64).to_le_bytes());
        out.extend_from_slice(&(text_off as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 12]); // align, reloff, nreloc
        out.extend_from_slice(&S_ATTR_PURE_INSTRUCTIONS.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]); // reserved1-3

        out.extend_from_slice(text);
        out
    }

    #[test]
    fn parses_thin_macho64() {
        let data = build_macho64(&[0xC0, 0x03, 0x5F, 0xD6], 0x100000000);
        let macho = MachOFile::parse(&data).unwrap();
        assert_eq!(macho.architecture(), Architecture::Arm64);
        assert_eq!(macho.segments().len(), 1);
        assert_eq!(macho.exec_regions().len(), 1);
        let off = macho.va_to_offset(Address::new(0x100000000)).unwrap();
        assert_eq!(macho.data()[off as usize], 0xC0);
    }

    #[test]
    fn fat_container_picks_64bit_slice() {
        let thin = build_macho64(&[0u8; 8], 0x100000000);
        let slice_offset = 4096u32;
        let mut fat = Vec::new();
        fat.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        fat.extend_from_slice(&1u32.to_be_bytes());
        fat.extend_from_slice(&CPU_TYPE_ARM64.to_be_bytes());
        fat.extend_from_slice(&0u32.to_be_bytes());
        fat.extend_from_slice(&slice_offset.to_be_bytes());
        fat.extend_from_slice(&(thin.len() as u32).to_be_bytes());
        fat.extend_from_slice(&14u32.to_be_bytes());
        fat.resize(slice_offset as usize, 0);
        fat.extend_from_slice(&thin);

        let macho = MachOFile::parse(&fat).unwrap();
        assert!(macho.is_64bit());
        assert_eq!(macho.architecture(), Architecture::Arm64);
    }
}
