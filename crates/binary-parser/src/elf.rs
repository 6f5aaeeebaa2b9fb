//! ELF (Executable and Linkable Format) parser for Linux/Android binaries
//!
//! Handles both ELF32 and ELF64. Virtual addresses are translated through
//! PT_LOAD program headers; search regions are classified from segment
//! permissions, matching how libil2cpp.so is actually mapped at runtime.

use crate::common::{
    table_str, BinaryFile, BinaryReader, Region, Section, SectionFlags, Segment, Symbol, SymbolType,
};
use crate::error::{ParseError, ParseResult};
use cildump_core::{Address, Architecture, BinaryFormat, Platform};

/// ELF magic
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF classes
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

/// ELF endianness
const ELFDATA2LSB: u8 = 1;

/// ELF machine types
const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Program header types
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

/// Program header flags
const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

/// Dynamic tags
const DT_NULL: i64 = 0;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_GNU_HASH: i64 = 0x6ffffef5;

/// Symbol types
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_SECTION: u8 = 3;
const STT_FILE: u8 = 4;

/// Parsed ELF file
#[derive(Debug)]
pub struct ElfFile {
    data: Vec<u8>,
    architecture: Architecture,
    is_64bit: bool,
    entry_point: Address,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl ElfFile {
    /// Parse an ELF file from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 16 {
            return Err(ParseError::truncated(16, data.len()));
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u32::from_le_bytes(ELF_MAGIC),
                actual: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            });
        }

        let is_64bit = match data[4] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            other => {
                return Err(ParseError::malformed(format!("invalid ELF class {other}")));
            }
        };
        if data[5] != ELFDATA2LSB {
            return Err(ParseError::malformed("big-endian ELF is not supported"));
        }

        let mut reader = BinaryReader::new(data, true);
        reader.set_offset(16);

        let _e_type = reader.read_u16()?;
        let e_machine = reader.read_u16()?;
        let _e_version = reader.read_u32()?;
        let e_entry = reader.read_word(is_64bit)?;
        let e_phoff = reader.read_word(is_64bit)?;
        let e_shoff = reader.read_word(is_64bit)?;
        let _e_flags = reader.read_u32()?;
        let _e_ehsize = reader.read_u16()?;
        let e_phentsize = reader.read_u16()?;
        let e_phnum = reader.read_u16()?;
        let e_shentsize = reader.read_u16()?;
        let e_shnum = reader.read_u16()?;
        let e_shstrndx = reader.read_u16()?;

        let architecture = match e_machine {
            EM_386 => Architecture::X86,
            EM_X86_64 => Architecture::X64,
            EM_ARM => Architecture::Arm32,
            EM_AARCH64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        let (segments, dynamic_range) =
            Self::parse_program_headers(data, e_phoff, e_phentsize, e_phnum, is_64bit)?;
        if segments.is_empty() {
            return Err(ParseError::malformed("no PT_LOAD segments"));
        }

        // Shipped libil2cpp.so files routinely carry stripped or bogus
        // section tables; segments alone are enough to operate.
        let sections =
            Self::parse_section_headers(data, e_shoff, e_shentsize, e_shnum, e_shstrndx, is_64bit)
                .unwrap_or_default();

        let symbols = match dynamic_range {
            Some((dyn_off, dyn_size)) => {
                Self::parse_dynamic_symbols(data, &segments, dyn_off, dyn_size, is_64bit)
                    .unwrap_or_default()
            }
            None => Vec::new(),
        };

        Ok(Self {
            data: data.to_vec(),
            architecture,
            is_64bit,
            entry_point: Address::new(e_entry),
            segments,
            sections,
            symbols,
        })
    }

    fn parse_program_headers(
        data: &[u8],
        e_phoff: u64,
        e_phentsize: u16,
        e_phnum: u16,
        is_64bit: bool,
    ) -> ParseResult<(Vec<Segment>, Option<(u64, u64)>)> {
        let mut segments = Vec::new();
        let mut dynamic = None;
        let mut reader = BinaryReader::new(data, true);

        for i in 0..e_phnum as usize {
            reader.set_offset(e_phoff as usize + i * e_phentsize as usize);

            let (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz) = if is_64bit {
                let p_type = reader.read_u32()?;
                let p_flags = reader.read_u32()?;
                let p_offset = reader.read_u64()?;
                let p_vaddr = reader.read_u64()?;
                let _p_paddr = reader.read_u64()?;
                let p_filesz = reader.read_u64()?;
                let p_memsz = reader.read_u64()?;
                (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz)
            } else {
                let p_type = reader.read_u32()?;
                let p_offset = reader.read_u32()? as u64;
                let p_vaddr = reader.read_u32()? as u64;
                let _p_paddr = reader.read_u32()?;
                let p_filesz = reader.read_u32()? as u64;
                let p_memsz = reader.read_u32()? as u64;
                let p_flags = reader.read_u32()?;
                (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz)
            };

            match p_type {
                PT_LOAD if p_memsz != 0 => {
                    let mut flags = SectionFlags::empty();
                    if p_flags & PF_R != 0 {
                        flags |= SectionFlags::READ;
                    }
                    if p_flags & PF_W != 0 {
                        flags |= SectionFlags::WRITE;
                    }
                    if p_flags & PF_X != 0 {
                        flags |= SectionFlags::EXECUTE;
                    }
                    segments.push(Segment {
                        file_offset: p_offset,
                        virtual_address: p_vaddr,
                        file_size: p_filesz,
                        memory_size: p_memsz,
                        flags,
                    });
                }
                PT_DYNAMIC => dynamic = Some((p_offset, p_filesz)),
                _ => {}
            }
        }

        Ok((segments, dynamic))
    }

    fn parse_section_headers(
        data: &[u8],
        e_shoff: u64,
        e_shentsize: u16,
        e_shnum: u16,
        e_shstrndx: u16,
        is_64bit: bool,
    ) -> ParseResult<Vec<Section>> {
        let mut raw = Vec::new();
        let mut reader = BinaryReader::new(data, true);

        for i in 0..e_shnum as usize {
            reader.set_offset(e_shoff as usize + i * e_shentsize as usize);
            let sh_name = reader.read_u32()?;
            let _sh_type = reader.read_u32()?;
            let sh_flags = reader.read_word(is_64bit)?;
            let sh_addr = reader.read_word(is_64bit)?;
            let sh_offset = reader.read_word(is_64bit)?;
            let sh_size = reader.read_word(is_64bit)?;
            raw.push((sh_name, sh_flags, sh_addr, sh_offset, sh_size));
        }

        let strtab: &[u8] = raw
            .get(e_shstrndx as usize)
            .and_then(|&(_, _, _, off, size)| {
                let (off, size) = (off as usize, size as usize);
                data.get(off..off + size)
            })
            .unwrap_or(&[]);

        Ok(raw
            .iter()
            .map(|&(sh_name, sh_flags, sh_addr, sh_offset, sh_size)| {
                let mut flags = SectionFlags::READ;
                if sh_flags & 0x1 != 0 {
                    flags |= SectionFlags::WRITE;
                }
                if sh_flags & 0x4 != 0 {
                    flags |= SectionFlags::EXECUTE;
                }
                Section {
                    name: table_str(strtab, sh_name as usize),
                    virtual_address: Address::new(sh_addr),
                    virtual_size: sh_size,
                    raw_offset: sh_offset,
                    raw_size: sh_size,
                    characteristics: flags,
                }
            })
            .collect())
    }

    /// Symbol count comes from DT_HASH nchain, or is reconstructed by
    /// walking the DT_GNU_HASH chains.
    fn parse_dynamic_symbols(
        data: &[u8],
        segments: &[Segment],
        dyn_offset: u64,
        dyn_size: u64,
        is_64bit: bool,
    ) -> ParseResult<Vec<Symbol>> {
        let entry_size = if is_64bit { 16 } else { 8 };
        let map_va = |va: u64| -> Option<u64> {
            segments.iter().find(|s| s.contains_va(va)).and_then(|s| {
                let delta = va - s.virtual_address;
                (delta < s.file_size).then(|| s.file_offset + delta)
            })
        };

        let mut reader = BinaryReader::new(data, true);
        let mut hash = None;
        let mut gnu_hash = None;
        let mut strtab = None;
        let mut symtab = None;

        for i in 0..(dyn_size / entry_size as u64) as usize {
            reader.set_offset(dyn_offset as usize + i * entry_size);
            let (d_tag, d_un) = if is_64bit {
                (reader.read_i64()?, reader.read_u64()?)
            } else {
                (reader.read_i32()? as i64, reader.read_u32()? as u64)
            };
            match d_tag {
                DT_NULL => break,
                DT_HASH => hash = Some(d_un),
                DT_GNU_HASH => gnu_hash = Some(d_un),
                DT_STRTAB => strtab = Some(d_un),
                DT_SYMTAB => symtab = Some(d_un),
                _ => {}
            }
        }

        let symbol_count = if let Some(hash_va) = hash {
            let off = map_va(hash_va).ok_or(ParseError::UnmappedAddress(hash_va))? as usize;
            reader.set_offset(off);
            let _nbucket = reader.read_u32()?;
            reader.read_u32()? as usize
        } else if let Some(gnu_va) = gnu_hash {
            let off = map_va(gnu_va).ok_or(ParseError::UnmappedAddress(gnu_va))? as usize;
            reader.set_offset(off);
            let nbuckets = reader.read_u32()? as usize;
            let symoffset = reader.read_u32()? as usize;
            let bloom_size = reader.read_u32()? as usize;
            let _bloom_shift = reader.read_u32()?;
            let bloom_entry = if is_64bit { 8 } else { 4 };
            let buckets_offset = off + 16 + bloom_entry * bloom_size;
            reader.set_offset(buckets_offset);
            let mut last_symbol = 0usize;
            for _ in 0..nbuckets {
                last_symbol = last_symbol.max(reader.read_u32()? as usize);
            }
            if last_symbol < symoffset {
                symoffset
            } else {
                let chains_offset = buckets_offset + 4 * nbuckets;
                reader.set_offset(chains_offset + (last_symbol - symoffset) * 4);
                loop {
                    let chain = reader.read_u32()?;
                    last_symbol += 1;
                    if chain & 1 != 0 {
                        break;
                    }
                }
                last_symbol
            }
        } else {
            0
        };

        let (Some(symtab_va), Some(strtab_va)) = (symtab, strtab) else {
            return Ok(Vec::new());
        };
        if symbol_count == 0 {
            return Ok(Vec::new());
        }

        let symtab_off = map_va(symtab_va).ok_or(ParseError::UnmappedAddress(symtab_va))? as usize;
        let strtab_off = map_va(strtab_va).ok_or(ParseError::UnmappedAddress(strtab_va))? as usize;
        let strtab_slice = &data[strtab_off.min(data.len())..];

        let sym_size = if is_64bit { 24 } else { 16 };
        let mut symbols = Vec::new();
        for i in 0..symbol_count {
            reader.set_offset(symtab_off + i * sym_size);
            let (st_name, st_value, st_size, st_info) = if is_64bit {
                let st_name = reader.read_u32()?;
                let st_info = reader.read_u8()?;
                let _st_other = reader.read_u8()?;
                let _st_shndx = reader.read_u16()?;
                let st_value = reader.read_u64()?;
                let st_size = reader.read_u64()?;
                (st_name, st_value, st_size, st_info)
            } else {
                let st_name = reader.read_u32()?;
                let st_value = reader.read_u32()? as u64;
                let st_size = reader.read_u32()? as u64;
                let st_info = reader.read_u8()?;
                (st_name, st_value, st_size, st_info)
            };

            let name = table_str(strtab_slice, st_name as usize);
            if name.is_empty() {
                continue;
            }

            let symbol_type = match st_info & 0xf {
                STT_FUNC => SymbolType::Function,
                STT_OBJECT => SymbolType::Object,
                STT_SECTION => SymbolType::Section,
                STT_FILE => SymbolType::File,
                _ => SymbolType::Unknown,
            };
            symbols.push(Symbol {
                name,
                address: Address::new(st_value),
                size: (st_size > 0).then_some(st_size),
                symbol_type,
            });
        }

        Ok(symbols)
    }
}

impl BinaryFile for ElfFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Elf
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn platform(&self) -> Platform {
        match self.architecture {
            Architecture::Arm32 | Architecture::Arm64 => Platform::Android,
            _ => Platform::Linux,
        }
    }

    fn image_base(&self) -> Address {
        self.segments
            .iter()
            .map(|s| s.virtual_address)
            .min()
            .map(Address::new)
            .unwrap_or(Address::ZERO)
    }

    fn entry_point(&self) -> Address {
        self.entry_point
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

    // Regions come from the load segments, not the section table: section
    // headers are routinely stripped from shipped libil2cpp.so files.
    fn exec_regions(&self) -> Vec<Region> {
        self.segments
            .iter()
            .filter(|s| s.flags.contains(SectionFlags::EXECUTE))
            .map(segment_region)
            .collect()
    }

    fn data_regions(&self) -> Vec<Region> {
        self.segments
            .iter()
            .filter(|s| !s.flags.contains(SectionFlags::EXECUTE))
            .map(segment_region)
            .collect()
    }

    fn bss_regions(&self) -> Vec<Region> {
        self.data_regions()
    }
}

fn segment_region(segment: &Segment) -> Region {
    Region {
        offset: segment.file_offset,
        offset_end: segment.file_offset + segment.file_size,
        address: segment.virtual_address,
        address_end: segment.virtual_address + segment.memory_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF64 with two PT_LOAD segments (one exec, one data).
    pub(crate) fn build_elf64(exec: &[u8], exec_va: u64, data_seg: &[u8], data_va: u64) -> Vec<u8> {
        let phoff = 64u64;
        let phentsize = 56u16;
        let phnum = 2u16;
        let exec_off = phoff + phentsize as u64 * phnum as u64;
        let data_off = exec_off + exec.len() as u64;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
        out.extend_from_slice(&183u16.to_le_bytes()); // EM_AARCH64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&exec_va.to_le_bytes()); // e_entry
        out.extend_from_slice(&phoff.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&phentsize.to_le_bytes());
        out.extend_from_slice(&phnum.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes());

        let mut phdr = |flags: u32, off: u64, va: u64, size: u64| {
            out.extend_from_slice(&PT_LOAD.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&off.to_le_bytes());
            out.extend_from_slice(&va.to_le_bytes());
            out.extend_from_slice(&va.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        };
        phdr(PF_R | PF_X, exec_off, exec_va, exec.len() as u64);
        phdr(PF_R | PF_W, data_off, data_va, data_seg.len() as u64);

        out.extend_from_slice(exec);
        out.extend_from_slice(data_seg);
        out
    }

    #[test]
    fn parses_synthetic_elf64() {
        let data = build_elf64(&[0x1F, 0x20, 0x03, 0xD5], 0x10000, &[0xAA; 32], 0x20000);
        let elf = ElfFile::parse(&data).unwrap();
        assert_eq!(elf.architecture(), Architecture::Arm64);
        assert!(elf.is_64bit());
        assert_eq!(elf.segments().len(), 2);
        assert_eq!(elf.exec_regions().len(), 1);
        assert_eq!(elf.data_regions().len(), 1);
    }

    #[test]
    fn va_translation_uses_load_segments() {
        let data = build_elf64(&[0u8; 16], 0x10000, &[0xAA; 32], 0x20000);
        let elf = ElfFile::parse(&data).unwrap();
        let off = elf.va_to_offset(Address::new(0x20004)).unwrap();
        assert_eq!(elf.data()[off as usize], 0xAA);
        assert_eq!(elf.offset_to_va(off).unwrap().as_u64(), 0x20004);
        assert!(elf.va_to_offset(Address::new(0x30000)).is_none());
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(matches!(
            ElfFile::parse(&[0u8; 64]),
            Err(ParseError::InvalidMagic { .. })
        ));
    }
}
