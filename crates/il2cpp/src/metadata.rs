//! global-metadata.dat decoder
//!
//! Validates the header, pins down the minor version, then materializes
//! every table as a typed array. Strings stay in the blob and are handed
//! out as borrowed slices.

use crate::stream::{Stream, VersionedRecord};
use crate::structures::*;
use cildump_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Parsed IL2CPP metadata
pub struct Metadata {
    data: Vec<u8>,
    pub header: Il2CppGlobalMetadataHeader,
    /// Effective version including the minor part, e.g. 24.2
    pub version: f64,

    pub string_literals: Vec<Il2CppStringLiteral>,
    pub events: Vec<Il2CppEventDefinition>,
    pub properties: Vec<Il2CppPropertyDefinition>,
    pub methods: Vec<Il2CppMethodDefinition>,
    pub parameters: Vec<Il2CppParameterDefinition>,
    pub fields: Vec<Il2CppFieldDefinition>,
    pub generic_parameters: Vec<Il2CppGenericParameter>,
    pub generic_containers: Vec<Il2CppGenericContainer>,
    pub constraint_indices: Vec<i32>,
    pub nested_type_indices: Vec<i32>,
    pub interface_indices: Vec<i32>,
    pub vtable_methods: Vec<u32>,
    pub interface_offsets: Vec<Il2CppInterfaceOffsetPair>,
    pub type_definitions: Vec<Il2CppTypeDefinition>,
    pub images: Vec<Il2CppImageDefinition>,
    pub assemblies: Vec<Il2CppAssemblyDefinition>,
    pub field_refs: Vec<Il2CppFieldRef>,
    pub attribute_type_ranges: Vec<Il2CppCustomAttributeTypeRange>,
    pub attribute_type_indices: Vec<i32>,
    pub attribute_data_ranges: Vec<Il2CppCustomAttributeDataRange>,
    pub rgctx_entries: Vec<Il2CppRgctxDefinition>,

    field_default_values: HashMap<i32, Il2CppFieldDefaultValue>,
    parameter_default_values: HashMap<i32, Il2CppParameterDefaultValue>,
    /// kind -> destination slot -> decoded source index
    usage_map: BTreeMap<u32, BTreeMap<u32, u32>>,
    pub usages_count: usize,
    /// per-image token -> attribute range index, v24.1+
    attribute_token_lookup: Vec<HashMap<u32, i32>>,
}

impl Metadata {
    /// Parse a global-metadata.dat blob.
    ///
    /// `force_version` pins the effective version and skips refinement.
    pub fn parse(data: &[u8], force_version: Option<f64>) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::malformed_metadata("file too small for a header"));
        }

        let mut stream = Stream::new(data);
        let sanity = stream.read_u32()?;
        if sanity != METADATA_MAGIC {
            return Err(Error::malformed_metadata(format!(
                "wrong magic {sanity:#010x}"
            )));
        }
        let raw_version = stream.read_u32()?;
        if raw_version < MIN_METADATA_VERSION || raw_version > MAX_METADATA_VERSION {
            return Err(Error::UnsupportedVersion(raw_version));
        }

        let mut version = force_version.unwrap_or(raw_version as f64);
        info!(version, "parsing metadata");

        let mut header = Self::read_header(&mut stream, data, version)?;

        // 24.x cannot be told apart from the major number alone. The header
        // length (the first table offset) marks 24.2+, and image tokens give
        // away 24.1; 24.4 shows in the assembly record width below.
        if force_version.is_none() && version == 24.0 {
            if header.string_literal_offset == 264 {
                version = 24.2;
                header = Self::read_header(&mut stream, data, version)?;
            } else {
                // Lenient probe: a 24.1 table misreads at the 24.0 stride
                // and shows up as image tokens other than 1.
                let images = Self::probe_images(&mut stream, data, &header, version)?;
                if images.iter().any(|img| img.token != 1) {
                    version = 24.1;
                    header = Self::read_header(&mut stream, data, version)?;
                }
            }
            debug!(version, "refined 24.x metadata version");
        }

        stream.set_version(version);
        let mut images = Self::read_table::<Il2CppImageDefinition>(
            &mut stream,
            data,
            header.images_offset,
            header.images_size,
            "images",
            version,
        )?;

        if force_version.is_none()
            && version == 24.2
            && (header.assemblies_size / 68) < images.len() as u32
        {
            version = 24.4;
            stream.set_version(version);
            header = Self::read_header(&mut stream, data, version)?;
            images = Self::read_table(
                &mut stream,
                data,
                header.images_offset,
                header.images_size,
                "images",
                version,
            )?;
            debug!(version, "assembly record width implies 24.4");
        }

        let h = &header;
        let mut read = TableReader {
            stream: &mut stream,
            data,
            version,
        };

        let string_literals =
            read.table::<Il2CppStringLiteral>(h.string_literal_offset, h.string_literal_size, "string_literals")?;
        let events = read.table::<Il2CppEventDefinition>(h.events_offset, h.events_size, "events")?;
        let properties =
            read.table::<Il2CppPropertyDefinition>(h.properties_offset, h.properties_size, "properties")?;
        let methods = read.table::<Il2CppMethodDefinition>(h.methods_offset, h.methods_size, "methods")?;
        let parameters =
            read.table::<Il2CppParameterDefinition>(h.parameters_offset, h.parameters_size, "parameters")?;
        let fields = read.table::<Il2CppFieldDefinition>(h.fields_offset, h.fields_size, "fields")?;
        let generic_parameters = read.table::<Il2CppGenericParameter>(
            h.generic_parameters_offset,
            h.generic_parameters_size,
            "generic_parameters",
        )?;
        let generic_containers = read.table::<Il2CppGenericContainer>(
            h.generic_containers_offset,
            h.generic_containers_size,
            "generic_containers",
        )?;
        let type_definitions = read.table::<Il2CppTypeDefinition>(
            h.type_definitions_offset,
            h.type_definitions_size,
            "type_definitions",
        )?;
        let interface_offsets = read.table::<Il2CppInterfaceOffsetPair>(
            h.interface_offsets_offset,
            h.interface_offsets_size,
            "interface_offsets",
        )?;

        let constraint_indices = read.i32_table(
            h.generic_parameter_constraints_offset,
            h.generic_parameter_constraints_size,
        )?;
        let nested_type_indices = read.i32_table(h.nested_types_offset, h.nested_types_size)?;
        let interface_indices = read.i32_table(h.interfaces_offset, h.interfaces_size)?;
        let vtable_methods = read.u32_table(h.vtable_methods_offset, h.vtable_methods_size)?;

        let field_defaults = read.table::<Il2CppFieldDefaultValue>(
            h.field_default_values_offset,
            h.field_default_values_size,
            "field_default_values",
        )?;
        let parameter_defaults = read.table::<Il2CppParameterDefaultValue>(
            h.parameter_default_values_offset,
            h.parameter_default_values_size,
            "parameter_default_values",
        )?;

        let field_refs = if version >= 19.0 {
            read.table::<Il2CppFieldRef>(h.field_refs_offset, h.field_refs_size, "field_refs")?
        } else {
            Vec::new()
        };

        // The *_count header entries are byte lengths like every other
        // table, despite the name.
        let (usage_lists, usage_pairs) = if (19.0..=24.5).contains(&version) {
            (
                read.table::<Il2CppMetadataUsageList>(
                    h.metadata_usage_lists_offset,
                    h.metadata_usage_lists_count,
                    "metadata_usage_lists",
                )?,
                read.table::<Il2CppMetadataUsagePair>(
                    h.metadata_usage_pairs_offset,
                    h.metadata_usage_pairs_count,
                    "metadata_usage_pairs",
                )?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let (attribute_type_ranges, attribute_type_indices) = if version > 20.0 && version < 29.0 {
            (
                read.table::<Il2CppCustomAttributeTypeRange>(
                    h.attributes_info_offset,
                    h.attributes_info_count,
                    "attribute_type_ranges",
                )?,
                read.i32_table(h.attribute_types_offset, h.attribute_types_count)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let attribute_data_ranges = if version >= 29.0 {
            read.table::<Il2CppCustomAttributeDataRange>(
                h.attribute_data_range_offset,
                h.attribute_data_range_size,
                "attribute_data_ranges",
            )?
        } else {
            Vec::new()
        };

        let rgctx_entries = if version <= 24.1 {
            read.table::<Il2CppRgctxDefinition>(
                h.rgctx_entries_offset,
                h.rgctx_entries_count,
                "rgctx_entries",
            )?
        } else {
            Vec::new()
        };

        let assemblies =
            Self::read_assemblies(&mut stream, data, h.assemblies_offset, h.assemblies_size)?;

        let usage_map = Self::build_usage_map(&usage_lists, &usage_pairs, version);
        let usages_count = usage_map
            .values()
            .flat_map(|slots| slots.keys().copied().max())
            .max()
            .map(|max| max as usize + 1)
            .unwrap_or(0);

        let attribute_token_lookup = Self::build_attribute_lookup(
            version,
            &images,
            &attribute_type_ranges,
            &attribute_data_ranges,
        );

        let field_default_values = field_defaults
            .into_iter()
            .map(|v| (v.field_index, v))
            .collect();
        let parameter_default_values = parameter_defaults
            .into_iter()
            .map(|v| (v.parameter_index, v))
            .collect();

        info!(
            types = type_definitions.len(),
            methods = methods.len(),
            images = images.len(),
            literals = string_literals.len(),
            "metadata tables loaded"
        );

        Ok(Self {
            data: data.to_vec(),
            header,
            version,
            string_literals,
            events,
            properties,
            methods,
            parameters,
            fields,
            generic_parameters,
            generic_containers,
            constraint_indices,
            nested_type_indices,
            interface_indices,
            vtable_methods,
            interface_offsets,
            type_definitions,
            images,
            assemblies,
            field_refs,
            attribute_type_ranges,
            attribute_type_indices,
            attribute_data_ranges,
            rgctx_entries,
            field_default_values,
            parameter_default_values,
            usage_map,
            usages_count,
            attribute_token_lookup,
        })
    }

    fn read_header(
        stream: &mut Stream,
        data: &[u8],
        version: f64,
    ) -> Result<Il2CppGlobalMetadataHeader> {
        stream.set_version(version);
        let size = stream.record_size::<Il2CppGlobalMetadataHeader>();
        if data.len() < size {
            return Err(Error::malformed_metadata("header overruns file"));
        }
        stream.set_position(0);
        stream.read_record()
    }

    fn read_table<T: VersionedRecord + 'static>(
        stream: &mut Stream,
        data: &[u8],
        offset: u32,
        size: u32,
        table: &'static str,
        version: f64,
    ) -> Result<Vec<T>> {
        if offset == 0 || size == 0 {
            return Ok(Vec::new());
        }
        let (offset, size) = (offset as usize, size as usize);
        if offset + size > data.len() {
            return Err(Error::malformed_metadata(format!(
                "table {table} overruns file ({offset:#x}+{size:#x})"
            )));
        }
        stream.set_version(version);
        let record_size = stream.record_size::<T>();
        let residual = size % record_size;
        if residual != 0 {
            return Err(Error::AmbiguousVersion {
                table,
                residual,
                version,
            });
        }
        stream.set_position(offset);
        stream.read_record_array(size / record_size)
    }

    /// Floor-count image read used only by the 24.x refinement probe
    fn probe_images(
        stream: &mut Stream,
        data: &[u8],
        header: &Il2CppGlobalMetadataHeader,
        version: f64,
    ) -> Result<Vec<Il2CppImageDefinition>> {
        let (offset, size) = (header.images_offset as usize, header.images_size as usize);
        if offset == 0 || size == 0 || offset + size > data.len() {
            return Ok(Vec::new());
        }
        stream.set_version(version);
        let record_size = stream.record_size::<Il2CppImageDefinition>();
        stream.set_position(offset);
        stream.read_record_array(size / record_size)
    }

    /// Assembly records embed the name definition; the two schemas are
    /// decoded back to back.
    fn read_assemblies(
        stream: &mut Stream,
        data: &[u8],
        offset: u32,
        size: u32,
    ) -> Result<Vec<Il2CppAssemblyDefinition>> {
        if offset == 0 || size == 0 {
            return Ok(Vec::new());
        }
        let (offset, size) = (offset as usize, size as usize);
        if offset + size > data.len() {
            return Err(Error::malformed_metadata("assemblies table overruns file"));
        }
        let record_size = stream.record_size::<Il2CppAssemblyDefinitionHead>()
            + stream.record_size::<Il2CppAssemblyNameDefinition>();
        let residual = size % record_size;
        if residual != 0 {
            return Err(Error::AmbiguousVersion {
                table: "assemblies",
                residual,
                version: stream.version(),
            });
        }

        stream.set_position(offset);
        let mut out = Vec::with_capacity(size / record_size);
        for _ in 0..size / record_size {
            let head: Il2CppAssemblyDefinitionHead = stream.read_record()?;
            let aname: Il2CppAssemblyNameDefinition = stream.read_record()?;
            out.push(Il2CppAssemblyDefinition { head, aname });
        }
        Ok(out)
    }

    fn build_usage_map(
        lists: &[Il2CppMetadataUsageList],
        pairs: &[Il2CppMetadataUsagePair],
        version: f64,
    ) -> BTreeMap<u32, BTreeMap<u32, u32>> {
        let mut map: BTreeMap<u32, BTreeMap<u32, u32>> = BTreeMap::new();
        for list in lists {
            for i in 0..list.count {
                let Some(pair) = pairs.get((list.start + i) as usize) else {
                    continue;
                };
                let kind = (pair.encoded_source_index & 0xE000_0000) >> 29;
                let decoded = if version >= 27.0 {
                    (pair.encoded_source_index & 0x1FFF_FFFE) >> 1
                } else {
                    pair.encoded_source_index & 0x1FFF_FFFF
                };
                if (usage_kind::TYPE_INFO..=usage_kind::METHOD_REF).contains(&kind) {
                    map.entry(kind).or_default().insert(pair.destination_index, decoded);
                }
            }
        }
        map
    }

    fn build_attribute_lookup(
        version: f64,
        images: &[Il2CppImageDefinition],
        type_ranges: &[Il2CppCustomAttributeTypeRange],
        data_ranges: &[Il2CppCustomAttributeDataRange],
    ) -> Vec<HashMap<u32, i32>> {
        if version <= 24.0 {
            return Vec::new();
        }
        images
            .iter()
            .map(|image| {
                let mut lookup = HashMap::new();
                let start = image.custom_attribute_start;
                for i in start..start + image.custom_attribute_count as i32 {
                    if i < 0 {
                        continue;
                    }
                    let token = if version >= 29.0 {
                        data_ranges.get(i as usize).map(|r| r.token)
                    } else {
                        type_ranges.get(i as usize).map(|r| r.token)
                    };
                    if let Some(token) = token {
                        lookup.insert(token, i);
                    }
                }
                lookup
            })
            .collect()
    }

    // ========== Accessors ==========

    /// Resolve a metadata string by blob offset
    pub fn get_string(&self, index: u32) -> Result<&str> {
        let start = self.header.string_offset as usize + index as usize;
        let end = self.header.string_offset as usize + self.header.string_size as usize;
        if start >= end.min(self.data.len()) {
            return Err(Error::corrupt_index(
                "string",
                index as i64,
                self.header.string_size as usize,
            ));
        }
        Stream::new(&self.data).string_at(start, end)
    }

    /// Decode a string literal by table index
    pub fn get_string_literal(&self, index: usize) -> Result<String> {
        let literal = self
            .string_literals
            .get(index)
            .ok_or_else(|| Error::corrupt_index("string_literals", index as i64, self.string_literals.len()))?;
        let start =
            self.header.string_literal_data_offset as usize + literal.data_index as usize;
        let end = start + literal.length as usize;
        if end > self.data.len() {
            return Err(Error::malformed_metadata(format!(
                "string literal {index} overruns blob"
            )));
        }
        Ok(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }

    pub fn field_default_value(&self, field_index: i32) -> Option<&Il2CppFieldDefaultValue> {
        self.field_default_values.get(&field_index)
    }

    pub fn parameter_default_value(&self, parameter_index: i32) -> Option<&Il2CppParameterDefaultValue> {
        self.parameter_default_values.get(&parameter_index)
    }

    /// File offset of a default-value blob entry
    pub fn default_value_data_offset(&self, data_index: i32) -> usize {
        self.header.field_and_parameter_default_value_data_offset as usize + data_index as usize
    }

    /// A cursor positioned inside the metadata blob for default-value reads
    pub fn stream_at(&self, offset: usize) -> Stream<'_> {
        let mut stream = Stream::new(&self.data);
        stream.set_version(self.version);
        stream.set_position(offset);
        stream
    }

    /// kind -> destination slot -> decoded source index, v(16, 27) only
    pub fn usage_map(&self) -> &BTreeMap<u32, BTreeMap<u32, u32>> {
        &self.usage_map
    }

    /// Attribute range index for a member, resolved by token on v24.1+
    /// and by the legacy per-member index before that.
    pub fn custom_attribute_index(&self, image_index: usize, legacy_index: i32, token: u32) -> i32 {
        if self.version > 24.0 {
            self.attribute_token_lookup
                .get(image_index)
                .and_then(|lookup| lookup.get(&token).copied())
                .unwrap_or(-1)
        } else {
            legacy_index
        }
    }

    /// Number of methods carrying a global pointer index; the locator's
    /// seed constant.
    pub fn method_pointer_count(&self) -> usize {
        self.methods.iter().filter(|m| m.method_index >= 0).count()
    }
}

/// Bundles the recurring (stream, data, version) triple for table reads
struct TableReader<'s, 'a> {
    stream: &'s mut Stream<'a>,
    data: &'a [u8],
    version: f64,
}

impl<'s, 'a> TableReader<'s, 'a> {
    fn table<T: VersionedRecord + 'static>(
        &mut self,
        offset: u32,
        size: u32,
        name: &'static str,
    ) -> Result<Vec<T>> {
        Metadata::read_table(self.stream, self.data, offset, size, name, self.version)
    }

    fn i32_table(&mut self, offset: u32, size: u32) -> Result<Vec<i32>> {
        if offset == 0 || size == 0 {
            return Ok(Vec::new());
        }
        if offset as usize + size as usize > self.data.len() {
            return Err(Error::malformed_metadata("index table overruns file"));
        }
        self.stream.set_position(offset as usize);
        self.stream.read_i32_array(size as usize / 4)
    }

    fn u32_table(&mut self, offset: u32, size: u32) -> Result<Vec<u32>> {
        if offset == 0 || size == 0 {
            return Ok(Vec::new());
        }
        if offset as usize + size as usize > self.data.len() {
            return Err(Error::malformed_metadata("index table overruns file"));
        }
        self.stream.set_position(offset as usize);
        self.stream.read_u32_array(size as usize / 4)
    }
}
