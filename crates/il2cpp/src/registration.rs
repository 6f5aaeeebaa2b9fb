//! Runtime registration state
//!
//! Once the two root records are located, everything the executor needs is
//! pulled out of the image in one pass: pointer tables, the flattened
//! `Il2CppType*` array, generic instantiations and per-assembly code-gen
//! modules. Nothing here is mutated afterwards.

use crate::metadata::Metadata;
use crate::stream::Stream;
use crate::structures::*;
use cildump_binary_parser::BinaryFile;
use cildump_core::{Address, Error, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Counts over registration fields larger than this are treated as
/// misreads of a shifted layout.
pub(crate) const COUNT_LIMIT: u64 = 0x50000;

/// Decoded `Il2CppType.datapoint`, discriminated by the 8-bit tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeData {
    None,
    /// Class/Valuetype and primitives: type definition index
    TypeDefinition(i32),
    /// Ptr/Szarray: VA of the inner `Il2CppType`
    TypePointer(u64),
    /// Var/Mvar: generic parameter index
    GenericParameter(i32),
    /// Genericinst: VA of the `Il2CppGenericClass`
    GenericClass(u64),
    /// Array: VA of the `Il2CppArrayType` descriptor
    ArrayDescriptor(u64),
}

/// One decoded runtime type
#[derive(Debug, Clone, Copy)]
pub struct Il2CppType {
    pub data: TypeData,
    pub attrs: u16,
    pub ty: Il2CppTypeEnum,
    pub byref: bool,
    pub pinned: bool,
    pub valuetype: bool,
}

impl Il2CppType {
    fn decode(datapoint: u64, bits: u32, version: f64) -> Self {
        let attrs = (bits & 0xFFFF) as u16;
        let tag = ((bits >> 16) & 0xFF) as u8;
        let (byref, pinned, valuetype) = if version >= 27.2 {
            (
                (bits >> 29) & 1 != 0,
                (bits >> 30) & 1 != 0,
                bits >> 31 != 0,
            )
        } else {
            ((bits >> 30) & 1 != 0, bits >> 31 != 0, false)
        };

        let ty = Il2CppTypeEnum::from_tag(tag);
        let data = match ty {
            Il2CppTypeEnum::Var | Il2CppTypeEnum::Mvar => {
                TypeData::GenericParameter(datapoint as i32)
            }
            Il2CppTypeEnum::Ptr | Il2CppTypeEnum::Szarray => TypeData::TypePointer(datapoint),
            Il2CppTypeEnum::Array => TypeData::ArrayDescriptor(datapoint),
            Il2CppTypeEnum::Genericinst => TypeData::GenericClass(datapoint),
            Il2CppTypeEnum::Unknown(_) => TypeData::None,
            _ => TypeData::TypeDefinition(datapoint as i32),
        };

        Self {
            data,
            attrs,
            ty,
            byref,
            pinned,
            valuetype,
        }
    }
}

/// A generic argument list: `type_argc` pointers at `type_argv`
#[derive(Debug, Clone, Copy)]
pub struct GenericInst {
    pub type_argc: usize,
    pub type_argv: u64,
}

/// A code-gen module with its resolved name and pointer table
#[derive(Debug)]
pub struct CodeGenModule {
    pub name: String,
    pub module: Il2CppCodeGenModule,
    pub method_pointers: Vec<u64>,
}

/// Per-type field offset data; layout changed around v22
#[derive(Debug)]
pub enum FieldOffsets {
    /// One pointer per type to an i32 offset array
    Pointers(Vec<u64>),
    /// One flat offset per global field index
    Direct(Vec<u32>),
}

/// Everything read out of the binary once registration is located
pub struct Runtime {
    pub version: f64,
    pub code_registration_va: u64,
    pub metadata_registration_va: u64,
    pub code_registration: Il2CppCodeRegistration,
    pub metadata_registration: Il2CppMetadataRegistration,

    pub method_pointers: Vec<u64>,
    pub generic_method_pointers: Vec<u64>,
    pub invoker_pointers: Vec<u64>,
    pub custom_attribute_generators: Vec<u64>,
    pub metadata_usages: Vec<u64>,

    pub types: Vec<Il2CppType>,
    type_index_by_va: HashMap<u64, usize>,

    pub field_offsets: FieldOffsets,
    pub generic_inst_pointers: Vec<u64>,
    pub generic_insts: Vec<GenericInst>,
    pub generic_method_table: Vec<Il2CppGenericMethodFunctions>,
    pub method_specs: Vec<Il2CppMethodSpec>,
    /// method definition index -> spec indices
    pub method_specs_by_def: HashMap<i32, Vec<usize>>,
    /// spec index -> generic method pointer
    pub spec_pointers: HashMap<usize, u64>,

    pub modules: Vec<CodeGenModule>,
    module_by_name: HashMap<String, usize>,
}

/// A cursor into the image positioned at a virtual address
pub(crate) fn stream_at<'d>(
    binary: &'d dyn BinaryFile,
    va: u64,
    version: f64,
) -> Result<Stream<'d>> {
    let offset = binary
        .va_to_offset(Address::new(va))
        .ok_or(Error::UnmappedAddress(va))?;
    let mut stream = Stream::new(binary.data());
    stream.set_version(version);
    stream.set_pointer_size(binary.pointer_size());
    stream.set_position(offset as usize);
    Ok(stream)
}

pub(crate) fn read_ptr_array(
    binary: &dyn BinaryFile,
    va: u64,
    count: usize,
    version: f64,
) -> Result<Vec<u64>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    stream_at(binary, va, version)?.read_ptr_array(count)
}

pub(crate) fn read_code_registration(
    binary: &dyn BinaryFile,
    va: u64,
    version: f64,
) -> Result<Il2CppCodeRegistration> {
    stream_at(binary, va, version)?.read_record()
}

pub(crate) fn read_metadata_registration(
    binary: &dyn BinaryFile,
    va: u64,
    version: f64,
) -> Result<Il2CppMetadataRegistration> {
    stream_at(binary, va, version)?.read_record()
}

impl Runtime {
    /// Read the full registration graph at already-located, already
    /// version-adjusted addresses.
    pub fn read(
        binary: &dyn BinaryFile,
        version: f64,
        code_registration_va: u64,
        metadata_registration_va: u64,
        metadata: &Metadata,
    ) -> Result<Self> {
        info!(
            code = format_args!("{code_registration_va:#x}"),
            meta = format_args!("{metadata_registration_va:#x}"),
            version,
            "reading registration"
        );

        let code_registration = read_code_registration(binary, code_registration_va, version)?;
        let metadata_registration =
            read_metadata_registration(binary, metadata_registration_va, version)?;

        let mut runtime = Self {
            version,
            code_registration_va,
            metadata_registration_va,
            code_registration,
            metadata_registration,
            method_pointers: Vec::new(),
            generic_method_pointers: Vec::new(),
            invoker_pointers: Vec::new(),
            custom_attribute_generators: Vec::new(),
            metadata_usages: Vec::new(),
            types: Vec::new(),
            type_index_by_va: HashMap::new(),
            field_offsets: FieldOffsets::Direct(Vec::new()),
            generic_inst_pointers: Vec::new(),
            generic_insts: Vec::new(),
            generic_method_table: Vec::new(),
            method_specs: Vec::new(),
            method_specs_by_def: HashMap::new(),
            spec_pointers: HashMap::new(),
            modules: Vec::new(),
            module_by_name: HashMap::new(),
        };

        runtime.load_pointers(binary, metadata)?;
        runtime.load_types(binary)?;
        runtime.load_generics(binary)?;
        if runtime.version >= 24.2 {
            runtime.load_modules(binary)?;
        }
        Ok(runtime)
    }

    fn load_pointers(&mut self, binary: &dyn BinaryFile, metadata: &Metadata) -> Result<()> {
        let cr = &self.code_registration;
        let mr = &self.metadata_registration;
        let v = self.version;

        if v <= 24.1 && !cr.method_pointers.is_null() {
            self.method_pointers =
                read_ptr_array(binary, cr.method_pointers.va(), cr.method_pointers_count.count(), v)?;
        }
        if !cr.generic_method_pointers.is_null() {
            self.generic_method_pointers = read_ptr_array(
                binary,
                cr.generic_method_pointers.va(),
                cr.generic_method_pointers_count.count(),
                v,
            )?;
        }
        if !cr.invoker_pointers.is_null() {
            self.invoker_pointers = read_ptr_array(
                binary,
                cr.invoker_pointers.va(),
                cr.invoker_pointers_count.count(),
                v,
            )?;
        }
        if v < 27.0 && !cr.custom_attribute_generators.is_null() {
            self.custom_attribute_generators = read_ptr_array(
                binary,
                cr.custom_attribute_generators.va(),
                cr.custom_attribute_count.count(),
                v,
            )?;
        }

        // Usage slots are populated at runtime; in a file image they
        // usually sit in zero-fill and cannot be read back.
        if v > 16.0 && v < 27.0 && metadata.usages_count > 0 {
            self.metadata_usages =
                match read_ptr_array(binary, mr.metadata_usages.va(), metadata.usages_count, v) {
                    Ok(usages) => usages,
                    Err(_) => {
                        debug!("metadata usages are not file-backed, skipping");
                        vec![0; metadata.usages_count]
                    }
                };
        }
        Ok(())
    }

    fn load_types(&mut self, binary: &dyn BinaryFile) -> Result<()> {
        let mr = &self.metadata_registration;
        let type_pointers = read_ptr_array(binary, mr.types.va(), mr.types_count.count(), self.version)?;

        self.types = Vec::with_capacity(type_pointers.len());
        self.type_index_by_va = HashMap::with_capacity(type_pointers.len());
        for (i, &va) in type_pointers.iter().enumerate() {
            let mut stream = stream_at(binary, va, self.version)?;
            let datapoint = stream.read_ptr()?;
            let bits = stream.read_u32()?;
            self.types
                .push(Il2CppType::decode(datapoint, bits, self.version));
            self.type_index_by_va.insert(va, i);
        }

        let count = mr.field_offsets_count.count();
        if count == 0 || mr.field_offsets.is_null() {
            self.field_offsets = FieldOffsets::Direct(Vec::new());
            return Ok(());
        }
        let pointers = if self.version > 21.0 {
            true
        } else if self.version == 21.0 {
            // Null entries for the leading (fieldless) types followed by a
            // real pointer mark the per-type pointer layout.
            let sample = read_ptr_array(binary, mr.field_offsets.va(), count.min(6), self.version)?;
            sample.len() == 6 && sample[..5].iter().all(|&x| x == 0) && sample[5] > 0
        } else {
            false
        };
        self.field_offsets = if pointers {
            FieldOffsets::Pointers(read_ptr_array(
                binary,
                mr.field_offsets.va(),
                count,
                self.version,
            )?)
        } else {
            let mut stream = stream_at(binary, mr.field_offsets.va(), self.version)?;
            FieldOffsets::Direct(stream.read_u32_array(count)?)
        };
        Ok(())
    }

    fn load_generics(&mut self, binary: &dyn BinaryFile) -> Result<()> {
        let mr = &self.metadata_registration;
        let v = self.version;

        self.generic_inst_pointers =
            read_ptr_array(binary, mr.generic_insts.va(), mr.generic_insts_count.count(), v)?;
        self.generic_insts = Vec::with_capacity(self.generic_inst_pointers.len());
        for &va in &self.generic_inst_pointers {
            let mut stream = stream_at(binary, va, v)?;
            let type_argc = stream.read_ptr()? as usize;
            let type_argv = stream.read_ptr()?;
            self.generic_insts.push(GenericInst {
                type_argc,
                type_argv,
            });
        }

        if !mr.generic_method_table.is_null() {
            let mut stream = stream_at(binary, mr.generic_method_table.va(), v)?;
            self.generic_method_table =
                stream.read_record_array(mr.generic_method_table_count.count())?;
        }
        if !mr.method_specs.is_null() {
            let mut stream = stream_at(binary, mr.method_specs.va(), v)?;
            self.method_specs = stream.read_record_array(mr.method_specs_count.count())?;
        }

        for entry in &self.generic_method_table {
            let spec_index = entry.generic_method_index as usize;
            let Some(spec) = self.method_specs.get(spec_index) else {
                continue;
            };
            self.method_specs_by_def
                .entry(spec.method_definition_index)
                .or_default()
                .push(spec_index);
            if let Some(&pointer) = self.generic_method_pointers.get(entry.method_index as usize) {
                self.spec_pointers.insert(spec_index, pointer);
            }
        }
        Ok(())
    }

    fn load_modules(&mut self, binary: &dyn BinaryFile) -> Result<()> {
        let cr = &self.code_registration;
        let module_pointers = read_ptr_array(
            binary,
            cr.code_gen_modules.va(),
            cr.code_gen_modules_count.count(),
            self.version,
        )?;

        for va in module_pointers {
            let module: Il2CppCodeGenModule =
                stream_at(binary, va, self.version)?.read_record()?;
            let name = binary
                .read_string_va(Address::new(module.module_name.va()))
                .map_err(Error::from)?;

            let count = module.method_pointer_count.count();
            let method_pointers =
                match read_ptr_array(binary, module.method_pointers.va(), count, self.version) {
                    Ok(pointers) => pointers,
                    Err(_) => {
                        warn!(module = %name, "method pointer table not file-backed");
                        vec![0; count]
                    }
                };

            debug!(module = %name, methods = count, "loaded code-gen module");
            self.module_by_name.insert(name.clone(), self.modules.len());
            self.modules.push(CodeGenModule {
                name,
                module,
                method_pointers,
            });
        }
        Ok(())
    }

    // ========== Lookups ==========

    pub fn type_at(&self, index: i32) -> Result<&Il2CppType> {
        if index < 0 {
            return Err(Error::corrupt_index("types", index as i64, self.types.len()));
        }
        self.types
            .get(index as usize)
            .ok_or_else(|| Error::corrupt_index("types", index as i64, self.types.len()))
    }

    /// Look a runtime type up by the VA of its `Il2CppType`
    pub fn type_by_va(&self, va: u64) -> Option<&Il2CppType> {
        self.type_index_by_va.get(&va).map(|&i| &self.types[i])
    }

    pub fn module_named(&self, name: &str) -> Option<&CodeGenModule> {
        self.module_by_name.get(name).map(|&i| &self.modules[i])
    }

    /// Native entry point of a method, 0 when it has none
    pub fn method_pointer(&self, image_name: &str, method: &Il2CppMethodDefinition) -> u64 {
        if self.version >= 24.2 {
            let index = (method.token & 0x00FF_FFFF) as usize;
            if index == 0 {
                return 0;
            }
            self.module_named(image_name)
                .and_then(|module| module.method_pointers.get(index - 1))
                .copied()
                .unwrap_or(0)
        } else if method.method_index >= 0 {
            self.method_pointers
                .get(method.method_index as usize)
                .copied()
                .unwrap_or(0)
        } else {
            0
        }
    }

    /// Field offset within its declaring type, `None` when unavailable.
    /// Instance offsets of value types drop the object header.
    pub fn field_offset(
        &self,
        binary: &dyn BinaryFile,
        type_index: usize,
        field_index_in_type: usize,
        global_field_index: usize,
        is_value_type: bool,
        is_static: bool,
    ) -> Option<i32> {
        let mut offset = match &self.field_offsets {
            FieldOffsets::Pointers(pointers) => {
                let pointer = *pointers.get(type_index)?;
                if pointer == 0 {
                    return None;
                }
                let va = pointer + 4 * field_index_in_type as u64;
                let mut stream = stream_at(binary, va, self.version).ok()?;
                stream.read_i32().ok()?
            }
            FieldOffsets::Direct(offsets) => *offsets.get(global_field_index)? as i32,
        };
        if offset > 0 && is_value_type && !is_static {
            offset -= if binary.pointer_size() == 4 { 8 } else { 16 };
        }
        Some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_decode_pre27() {
        // tag 0x08 (int), attrs 0x16, byref bit set
        let bits = 0x16 | (0x08 << 16) | (1 << 30);
        let ty = Il2CppType::decode(42, bits, 24.2);
        assert_eq!(ty.ty, Il2CppTypeEnum::I4);
        assert_eq!(ty.attrs, 0x16);
        assert!(ty.byref);
        assert!(!ty.pinned);
        assert_eq!(ty.data, TypeData::TypeDefinition(42));
    }

    #[test]
    fn type_decode_27_2_moves_the_flag_bits() {
        let bits = (0x1d << 16) | (1 << 29) | (1 << 30);
        let ty = Il2CppType::decode(0x1000, bits, 27.2);
        assert_eq!(ty.ty, Il2CppTypeEnum::Szarray);
        assert!(ty.byref);
        assert!(ty.pinned);
        assert_eq!(ty.data, TypeData::TypePointer(0x1000));

        // same bits at an older version decode differently
        let old = Il2CppType::decode(0x1000, bits, 27.0);
        assert!(old.byref);
        assert!(!old.pinned);
    }

    #[test]
    fn generic_tags_pick_their_union_arm() {
        let genericinst = Il2CppType::decode(0xCAFE, 0x15 << 16, 29.0);
        assert_eq!(genericinst.data, TypeData::GenericClass(0xCAFE));

        let mvar = Il2CppType::decode(3, 0x1e << 16, 29.0);
        assert_eq!(mvar.data, TypeData::GenericParameter(3));

        let array = Il2CppType::decode(0xF00D, 0x14 << 16, 29.0);
        assert_eq!(array.data, TypeData::ArrayDescriptor(0xF00D));
    }
}
