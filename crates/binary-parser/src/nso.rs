//! NSO parser for Nintendo Switch binaries
//!
//! Segments are LZ4 block-compressed; the loader rebuilds the flat memory
//! image so that afterwards virtual addresses equal image offsets.

use crate::common::{BinaryFile, BinaryReader, Region, Section, SectionFlags, Segment, Symbol};
use crate::error::{ParseError, ParseResult};
use cildump_core::{Address, Architecture, BinaryFormat, Platform};

/// "NSO0" little-endian
pub const NSO_MAGIC: u32 = 0x304F534E;

struct NsoSegment {
    file_offset: u32,
    memory_offset: u32,
    decompressed_size: u32,
}

/// Parsed (and decompressed) NSO image
#[derive(Debug)]
pub struct NsoFile {
    image: Vec<u8>,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    bss_start: u64,
    bss_end: u64,
}

impl NsoFile {
    /// Parse an NSO file, decompressing segments into their memory layout
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        let mut reader = BinaryReader::new(data, true);

        let magic = reader.read_u32()?;
        if magic != NSO_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: NSO_MAGIC,
                actual: magic,
            });
        }
        let _version = reader.read_u32()?;
        let _reserved = reader.read_u32()?;
        let flags = reader.read_u32()?;

        fn read_segment(reader: &mut BinaryReader) -> ParseResult<NsoSegment> {
            Ok(NsoSegment {
                file_offset: reader.read_u32()?,
                memory_offset: reader.read_u32()?,
                decompressed_size: reader.read_u32()?,
            })
        }
        let text = read_segment(&mut reader)?;
        let _module_name_offset = reader.read_u32()?;
        let rodata = read_segment(&mut reader)?;
        let _module_name_size = reader.read_u32()?;
        let data_seg = read_segment(&mut reader)?;
        let bss_size = reader.read_u32()?;

        // Compressed sizes live past the module id, at 0x60.
        reader.set_offset(0x60);
        let compressed_sizes = [reader.read_u32()?, reader.read_u32()?, reader.read_u32()?];

        let image_size = data_seg.memory_offset as usize
            + data_seg.decompressed_size as usize
            + bss_size as usize;
        let mut image = vec![0u8; image_size];

        let specs = [&text, &rodata, &data_seg];
        for (i, seg) in specs.iter().enumerate() {
            let compressed = flags & (1 << i) != 0;
            let start = seg.file_offset as usize;
            let dest = seg.memory_offset as usize;
            let out_len = seg.decompressed_size as usize;
            if dest + out_len > image.len() {
                return Err(ParseError::malformed("NSO segment exceeds memory image"));
            }

            if compressed {
                let end = start + compressed_sizes[i] as usize;
                let chunk = data
                    .get(start..end)
                    .ok_or_else(|| ParseError::malformed("NSO compressed segment exceeds file"))?;
                let decompressed = lz4_flex::block::decompress(chunk, out_len)
                    .map_err(|e| ParseError::malformed(format!("LZ4: {e}")))?;
                image[dest..dest + decompressed.len()].copy_from_slice(&decompressed);
            } else {
                let end = start + out_len;
                let chunk = data
                    .get(start..end)
                    .ok_or_else(|| ParseError::malformed("NSO segment exceeds file"))?;
                image[dest..dest + out_len].copy_from_slice(chunk);
            }
        }

        let make = |seg: &NsoSegment, flags: SectionFlags, name: &str| {
            let (start, size) = (seg.memory_offset as u64, seg.decompressed_size as u64);
            (
                Segment {
                    file_offset: start,
                    virtual_address: start,
                    file_size: size,
                    memory_size: size,
                    flags,
                },
                Section {
                    name: name.to_string(),
                    virtual_address: Address::new(start),
                    virtual_size: size,
                    raw_offset: start,
                    raw_size: size,
                    characteristics: flags,
                },
            )
        };

        let (text_seg, text_sec) = make(&text, SectionFlags::READ | SectionFlags::EXECUTE, ".text");
        let (ro_seg, ro_sec) = make(&rodata, SectionFlags::READ, ".rodata");
        let (rw_seg, rw_sec) = make(
            &data_seg,
            SectionFlags::READ | SectionFlags::WRITE,
            ".data",
        );

        let bss_start = data_seg.memory_offset as u64 + data_seg.decompressed_size as u64;
        Ok(Self {
            image,
            segments: vec![text_seg, ro_seg, rw_seg],
            sections: vec![text_sec, ro_sec, rw_sec],
            bss_start,
            bss_end: bss_start + bss_size as u64,
        })
    }
}

impl BinaryFile for NsoFile {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Nso
    }

    fn architecture(&self) -> Architecture {
        Architecture::Arm64
    }

    fn platform(&self) -> Platform {
        Platform::Switch
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
        &self.image
    }

    fn bss_regions(&self) -> Vec<Region> {
        if self.bss_end > self.bss_start {
            vec![Region {
                offset: self.bss_start,
                offset_end: self.bss_end,
                address: self.bss_start,
                address_end: self.bss_end,
            }]
        } else {
            self.data_regions()
        }
    }
}
