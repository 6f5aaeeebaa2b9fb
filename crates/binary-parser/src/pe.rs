//! PE (Portable Executable) parser for Windows binaries
//!
//! Handles PE32 and PE32+ (GameAssembly.dll). Section VAs are stored with
//! the image base already applied; `rva()` undoes it for output.

use crate::common::{
    BinaryFile, BinaryReader, Section, SectionFlags, Segment, Symbol, SymbolType,
};
use crate::error::{ParseError, ParseResult};
use cildump_core::{Address, Architecture, BinaryFormat, Platform};

/// DOS header magic ("MZ")
const DOS_MAGIC: u16 = 0x5A4D;

/// PE signature ("PE\0\0")
const PE_SIGNATURE: u32 = 0x00004550;

/// PE machine types
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM: u16 = 0x01c0;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// PE optional header magic
const PE32_MAGIC: u16 = 0x10b;
const PE32PLUS_MAGIC: u16 = 0x20b;

/// Section characteristics
const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x00000080;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x00000040;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x20000000;
const IMAGE_SCN_MEM_READ: u32 = 0x40000000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x80000000;

const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;

/// Parsed PE file
#[derive(Debug)]
pub struct PeFile {
    data: Vec<u8>,
    architecture: Architecture,
    is_64bit: bool,
    image_base: u64,
    entry_point: Address,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl PeFile {
    /// Parse a PE file from raw bytes
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, true);

        let dos_magic = reader.read_u16()?;
        if dos_magic != DOS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: DOS_MAGIC as u32,
                actual: dos_magic as u32,
            });
        }

        reader.set_offset(0x3C);
        let pe_offset = reader.read_u32()? as usize;

        reader.set_offset(pe_offset);
        let pe_sig = reader.read_u32()?;
        if pe_sig != PE_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: PE_SIGNATURE,
                actual: pe_sig,
            });
        }

        // COFF header
        let machine = reader.read_u16()?;
        let number_of_sections = reader.read_u16()?;
        let _time_date_stamp = reader.read_u32()?;
        let _pointer_to_symbol_table = reader.read_u32()?;
        let _number_of_symbols = reader.read_u32()?;
        let size_of_optional_header = reader.read_u16()?;
        let _characteristics = reader.read_u16()?;

        let architecture = match machine {
            IMAGE_FILE_MACHINE_I386 => Architecture::X86,
            IMAGE_FILE_MACHINE_AMD64 => Architecture::X64,
            IMAGE_FILE_MACHINE_ARM => Architecture::Arm32,
            IMAGE_FILE_MACHINE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        };

        // Optional header
        let optional_header_offset = reader.offset();
        let optional_magic = reader.read_u16()?;
        let is_64bit = match optional_magic {
            PE32_MAGIC => false,
            PE32PLUS_MAGIC => true,
            other => {
                return Err(ParseError::malformed(format!(
                    "invalid optional header magic {other:#x}"
                )));
            }
        };

        reader.skip(2)?; // linker versions
        reader.skip(12)?; // SizeOfCode, SizeOfInitializedData, SizeOfUninitializedData
        let address_of_entry_point = reader.read_u32()?;
        reader.skip(4)?; // BaseOfCode
        if !is_64bit {
            reader.skip(4)?; // BaseOfData (PE32 only)
        }
        let image_base = if is_64bit {
            reader.read_u64()?
        } else {
            reader.read_u32()? as u64
        };

        // Skip ahead to NumberOfRvaAndSizes, then the data directories
        reader.skip(4 + 4)?; // alignments
        reader.skip(2 * 6)?; // version fields
        reader.skip(4)?; // Win32VersionValue
        reader.skip(4 + 4 + 4)?; // SizeOfImage, SizeOfHeaders, CheckSum
        reader.skip(2 + 2)?; // Subsystem, DllCharacteristics
        reader.skip(if is_64bit { 8 * 4 } else { 4 * 4 })?; // stack/heap reserves
        reader.skip(4)?; // LoaderFlags
        let number_of_rva_and_sizes = reader.read_u32()?;

        let mut data_directories = Vec::new();
        for _ in 0..number_of_rva_and_sizes.min(16) {
            let virtual_address = reader.read_u32()?;
            let size = reader.read_u32()?;
            data_directories.push((virtual_address, size));
        }

        // Section headers
        reader.set_offset(optional_header_offset + size_of_optional_header as usize);
        let mut sections = Vec::with_capacity(number_of_sections as usize);
        let mut segments = Vec::with_capacity(number_of_sections as usize);
        for _ in 0..number_of_sections {
            let name_bytes = reader.read_bytes(8)?;
            let name = String::from_utf8_lossy(name_bytes)
                .trim_end_matches('\0')
                .to_string();

            let virtual_size = reader.read_u32()? as u64;
            let virtual_address = reader.read_u32()? as u64;
            let size_of_raw_data = reader.read_u32()? as u64;
            let pointer_to_raw_data = reader.read_u32()? as u64;
            reader.skip(12)?; // relocations/line numbers
            let characteristics = reader.read_u32()?;

            let mut flags = SectionFlags::empty();
            if characteristics & IMAGE_SCN_MEM_READ != 0 {
                flags |= SectionFlags::READ;
            }
            if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
                flags |= SectionFlags::WRITE;
            }
            if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
                flags |= SectionFlags::EXECUTE;
            }
            if characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
                flags |= SectionFlags::INITIALIZED;
            }
            if characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
                flags |= SectionFlags::UNINITIALIZED;
            }

            sections.push(Section {
                name,
                virtual_address: Address::new(image_base + virtual_address),
                virtual_size,
                raw_offset: pointer_to_raw_data,
                raw_size: size_of_raw_data,
                characteristics: flags,
            });
            segments.push(Segment {
                file_offset: pointer_to_raw_data,
                virtual_address: image_base + virtual_address,
                file_size: size_of_raw_data,
                memory_size: virtual_size.max(size_of_raw_data),
                flags,
            });
        }

        let mut pe = Self {
            data: data.to_vec(),
            architecture,
            is_64bit,
            image_base,
            entry_point: Address::new(image_base + address_of_entry_point as u64),
            segments,
            sections,
            symbols: Vec::new(),
        };
        pe.symbols = pe
            .parse_exports(data_directories.get(IMAGE_DIRECTORY_ENTRY_EXPORT).copied())
            .unwrap_or_default();
        Ok(pe)
    }

    /// Walk the export directory; development builds export
    /// g_CodeRegistration / g_MetadataRegistration.
    fn parse_exports(&self, export_dir: Option<(u32, u32)>) -> ParseResult<Vec<Symbol>> {
        let Some((dir_rva, _dir_size)) = export_dir else {
            return Ok(Vec::new());
        };
        if dir_rva == 0 {
            return Ok(Vec::new());
        }

        let dir_va = Address::new(self.image_base + dir_rva as u64);
        let dir_off = self
            .va_to_offset(dir_va)
            .ok_or(ParseError::UnmappedAddress(dir_va.as_u64()))? as usize;

        let mut reader = BinaryReader::new(&self.data, true);
        reader.set_offset(dir_off + 24); // skip to NumberOfFunctions
        let _number_of_functions = reader.read_u32()?;
        let number_of_names = reader.read_u32()?;
        let address_of_functions = reader.read_u32()?;
        let address_of_names = reader.read_u32()?;
        let address_of_name_ordinals = reader.read_u32()?;

        let to_off = |rva: u32| -> ParseResult<usize> {
            let va = self.image_base + rva as u64;
            self.va_to_offset(Address::new(va))
                .map(|o| o as usize)
                .ok_or(ParseError::UnmappedAddress(va))
        };
        let names_off = to_off(address_of_names)?;
        let ordinals_off = to_off(address_of_name_ordinals)?;
        let functions_off = to_off(address_of_functions)?;

        let mut symbols = Vec::new();
        for i in 0..number_of_names as usize {
            reader.set_offset(names_off + i * 4);
            let name_rva = reader.read_u32()?;
            let name = self.read_string_va(Address::new(self.image_base + name_rva as u64))?;

            reader.set_offset(ordinals_off + i * 2);
            let ordinal = reader.read_u16()? as usize;

            reader.set_offset(functions_off + ordinal * 4);
            let func_rva = reader.read_u32()?;

            symbols.push(Symbol {
                name,
                address: Address::new(self.image_base + func_rva as u64),
                size: None,
                symbol_type: SymbolType::Unknown,
            });
        }
        Ok(symbols)
    }
}

impl BinaryFile for PeFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Pe
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn image_base(&self) -> Address {
        Address::new(self.image_base)
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

    fn rva(&self, va: u64) -> u64 {
        va.wrapping_sub(self.image_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal PE32+ with a .text and a .data section.
    pub(crate) fn build_pe64(
        image_base: u64,
        text: &[u8],
        text_rva: u32,
        data_seg: &[u8],
        data_rva: u32,
    ) -> Vec<u8> {
        let pe_offset = 0x80u32;
        let opt_size = 112u16 + 16 * 8; // PE32+ fixed part + 16 data directories
        let mut out = vec![0u8; pe_offset as usize];
        out[0] = b'M';
        out[1] = b'Z';
        out[0x3C..0x40].copy_from_slice(&pe_offset.to_le_bytes());

        out.extend_from_slice(&PE_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // sections
        out.extend_from_slice(&[0u8; 12]); // stamp, symtab, nsyms
        out.extend_from_slice(&opt_size.to_le_bytes());
        out.extend_from_slice(&0x22u16.to_le_bytes());

        let opt_start = out.len();
        out.extend_from_slice(&PE32PLUS_MAGIC.to_le_bytes());
        out.extend_from_slice(&[14, 0]); // linker version
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(&text_rva.to_le_bytes()); // entry point
        out.extend_from_slice(&text_rva.to_le_bytes()); // BaseOfCode
        out.extend_from_slice(&image_base.to_le_bytes());
        out.extend_from_slice(&0x1000u32.to_le_bytes());
        out.extend_from_slice(&0x200u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]); // versions
        out.extend_from_slice(&[0u8; 4]); // Win32VersionValue
        out.extend_from_slice(&0x4000u32.to_le_bytes()); // SizeOfImage
        out.extend_from_slice(&0x400u32.to_le_bytes()); // SizeOfHeaders
        out.extend_from_slice(&[0u8; 4]); // CheckSum
        out.extend_from_slice(&[2, 0, 0, 0]); // Subsystem, DllCharacteristics
        out.extend_from_slice(&[0u8; 32]); // stack/heap
        out.extend_from_slice(&[0u8; 4]); // LoaderFlags
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 16 * 8]);
        assert_eq!(out.len() - opt_start, opt_size as usize);

        let text_off = 0x400u32;
        let data_off = text_off + text.len() as u32;
        let mut shdr = |name: &[u8; 8], vsize: u32, rva: u32, rsize: u32, off: u32, ch: u32| {
            out.extend_from_slice(name);
            out.extend_from_slice(&vsize.to_le_bytes());
            out.extend_from_slice(&rva.to_le_bytes());
            out.extend_from_slice(&rsize.to_le_bytes());
            out.extend_from_slice(&off.to_le_bytes());
            out.extend_from_slice(&[0u8; 12]);
            out.extend_from_slice(&ch.to_le_bytes());
        };
        shdr(
            b".text\0\0\0",
            text.len() as u32,
            text_rva,
            text.len() as u32,
            text_off,
            IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE,
        );
        shdr(
            b".data\0\0\0",
            data_seg.len() as u32,
            data_rva,
            data_seg.len() as u32,
            data_off,
            IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE | IMAGE_SCN_CNT_INITIALIZED_DATA,
        );

        out.resize(text_off as usize, 0);
        out.extend_from_slice(text);
        out.extend_from_slice(data_seg);
        out
    }

    #[test]
    fn parses_synthetic_pe64() {
        let data = build_pe64(0x180000000, &[0xC3; 16], 0x1000, &[0x11; 16], 0x2000);
        let pe = PeFile::parse(&data).unwrap();
        assert_eq!(pe.architecture(), Architecture::X64);
        assert!(pe.is_64bit());
        assert_eq!(pe.image_base().as_u64(), 0x180000000);
        assert_eq!(pe.sections().len(), 2);
    }

    #[test]
    fn va_includes_image_base() {
        let data = build_pe64(0x180000000, &[0xC3; 16], 0x1000, &[0x11; 16], 0x2000);
        let pe = PeFile::parse(&data).unwrap();
        let off = pe.va_to_offset(Address::new(0x180002000)).unwrap();
        assert_eq!(pe.data()[off as usize], 0x11);
        assert_eq!(pe.rva(0x180002000), 0x2000);
    }

    #[test]
    fn rejects_non_pe() {
        assert!(PeFile::parse(&[0u8; 0x100]).is_err());
    }
}
