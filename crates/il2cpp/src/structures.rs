//! IL2CPP record declarations
//!
//! These mirror the on-disk layouts of `global-metadata.dat` and the
//! runtime registration structures inside the binary. Version windows
//! follow `vm/GlobalMetadataFileInternals.h` across Unity releases;
//! a column marked `[a .. b]` only exists from metadata version `a`
//! through `b` inclusive.

use crate::stream::{versioned_record, Ptr};

/// Metadata header magic
pub const METADATA_MAGIC: u32 = 0xFAB11BAF;

/// Supported metadata versions
pub const MIN_METADATA_VERSION: u32 = 16;
pub const MAX_METADATA_VERSION: u32 = 31;

versioned_record! {
    /// Header of global-metadata.dat: magic, version, then `(offset, size)`
    /// pairs for every table.
    pub struct Il2CppGlobalMetadataHeader {
        sanity: u32,
        version: u32,
        string_literal_offset: u32,
        string_literal_size: u32,
        string_literal_data_offset: u32,
        string_literal_data_size: u32,
        string_offset: u32,
        string_size: u32,
        events_offset: u32,
        events_size: u32,
        properties_offset: u32,
        properties_size: u32,
        methods_offset: u32,
        methods_size: u32,
        parameter_default_values_offset: u32,
        parameter_default_values_size: u32,
        field_default_values_offset: u32,
        field_default_values_size: u32,
        field_and_parameter_default_value_data_offset: u32,
        field_and_parameter_default_value_data_size: u32,
        field_marshaled_sizes_offset: u32,
        field_marshaled_sizes_size: u32,
        parameters_offset: u32,
        parameters_size: u32,
        fields_offset: u32,
        fields_size: u32,
        generic_parameters_offset: u32,
        generic_parameters_size: u32,
        generic_parameter_constraints_offset: u32,
        generic_parameter_constraints_size: u32,
        generic_containers_offset: u32,
        generic_containers_size: u32,
        nested_types_offset: u32,
        nested_types_size: u32,
        interfaces_offset: u32,
        interfaces_size: u32,
        vtable_methods_offset: u32,
        vtable_methods_size: u32,
        interface_offsets_offset: u32,
        interface_offsets_size: u32,
        type_definitions_offset: u32,
        type_definitions_size: u32,
        [.. 24.1] rgctx_entries_offset: u32,
        [.. 24.1] rgctx_entries_count: u32,
        images_offset: u32,
        images_size: u32,
        assemblies_offset: u32,
        assemblies_size: u32,
        [19.0 .. 24.5] metadata_usage_lists_offset: u32,
        [19.0 .. 24.5] metadata_usage_lists_count: u32,
        [19.0 .. 24.5] metadata_usage_pairs_offset: u32,
        [19.0 .. 24.5] metadata_usage_pairs_count: u32,
        [19.0 ..] field_refs_offset: u32,
        [19.0 ..] field_refs_size: u32,
        [20.0 ..] referenced_assemblies_offset: u32,
        [20.0 ..] referenced_assemblies_size: u32,
        [21.0 .. 27.2] attributes_info_offset: u32,
        [21.0 .. 27.2] attributes_info_count: u32,
        [21.0 .. 27.2] attribute_types_offset: u32,
        [21.0 .. 27.2] attribute_types_count: u32,
        [29.0 ..] attribute_data_offset: u32,
        [29.0 ..] attribute_data_size: u32,
        [29.0 ..] attribute_data_range_offset: u32,
        [29.0 ..] attribute_data_range_size: u32,
        [22.0 ..] unresolved_virtual_call_parameter_types_offset: u32,
        [22.0 ..] unresolved_virtual_call_parameter_types_size: u32,
        [22.0 ..] unresolved_virtual_call_parameter_ranges_offset: u32,
        [22.0 ..] unresolved_virtual_call_parameter_ranges_size: u32,
        [23.0 ..] windows_runtime_type_names_offset: u32,
        [23.0 ..] windows_runtime_type_names_size: u32,
        [27.0 ..] windows_runtime_strings_offset: u32,
        [27.0 ..] windows_runtime_strings_size: u32,
        [24.0 ..] exported_type_definitions_offset: u32,
        [24.0 ..] exported_type_definitions_size: u32,
    }
}

versioned_record! {
    /// A C# string literal; UTF-8 bytes live in the literal data blob.
    pub struct Il2CppStringLiteral {
        length: u32,
        data_index: u32,
    }
}

versioned_record! {
    pub struct Il2CppEventDefinition {
        name_index: u32,
        type_index: i32,
        add: i32,
        remove: i32,
        raise: i32,
        [.. 24.0] custom_attribute_index: i32,
        [19.0 ..] token: u32,
    }
}

versioned_record! {
    pub struct Il2CppPropertyDefinition {
        name_index: u32,
        /// Index into the declaring type's method list, -1 if absent
        get: i32,
        /// Index into the declaring type's method list, -1 if absent
        set: i32,
        attrs: u32,
        [.. 24.0] custom_attribute_index: i32,
        [19.0 ..] token: u32,
    }
}

versioned_record! {
    pub struct Il2CppMethodDefinition {
        name_index: u32,
        declaring_type: i32,
        return_type: i32,
        [31.0 ..] return_parameter_token: u32,
        parameter_start: i32,
        [.. 24.0] custom_attribute_index: i32,
        generic_container_index: i32,
        /// Global method pointer index; replaced by per-module tables at 24.2
        [.. 24.1] method_index: i32,
        [.. 24.1] invoker_index: i32,
        [.. 24.1] delegate_wrapper_index: i32,
        [.. 24.1] rgctx_start_index: i32,
        [.. 24.1] rgctx_count: i32,
        token: u32,
        token2: u32,
        flags: u16,
        iflags: u16,
        slot: u16,
        parameter_count: u16,
    }
}

versioned_record! {
    pub struct Il2CppParameterDefinition {
        name_index: u32,
        token: u32,
        [.. 24.0] custom_attribute_index: i32,
        type_index: i32,
    }
}

versioned_record! {
    pub struct Il2CppFieldDefinition {
        name_index: u32,
        type_index: i32,
        [.. 24.0] custom_attribute_index: i32,
        [19.0 ..] token: u32,
    }
}

versioned_record! {
    pub struct Il2CppFieldDefaultValue {
        field_index: i32,
        type_index: i32,
        data_index: i32,
    }
}

versioned_record! {
    pub struct Il2CppParameterDefaultValue {
        parameter_index: i32,
        type_index: i32,
        data_index: i32,
    }
}

versioned_record! {
    pub struct Il2CppGenericParameter {
        /// Owning generic container
        owner_index: i32,
        name_index: u32,
        constraints_start: i16,
        constraints_count: i16,
        /// Position in the parameter list
        num: u16,
        flags: u16,
    }
}

versioned_record! {
    pub struct Il2CppGenericContainer {
        /// Type definition or method definition owning this container
        owner_index: i32,
        /// Number of generic parameters
        type_argc: i32,
        /// Nonzero for a generic method, zero for a generic type
        is_method: i32,
        generic_parameter_start: i32,
    }
}

versioned_record! {
    pub struct Il2CppTypeDefinition {
        name_index: u32,
        namespace_index: u32,
        [.. 24.0] custom_attribute_index: i32,
        byval_type_index: i32,
        [.. 24.5] byref_type_index: i32,
        declaring_type_index: i32,
        parent_index: i32,
        /// Only meaningful for enums
        element_type_index: i32,
        [.. 24.1] rgctx_start_index: i32,
        [.. 24.1] rgctx_count: i32,
        generic_container_index: i32,
        [.. 22.0] delegate_wrapper_from_managed_to_native_index: i32,
        [.. 22.0] marshaling_functions_index: i32,
        [21.0 .. 22.0] ccw_function_index: i32,
        [21.0 .. 22.0] guid_index: i32,
        flags: u32,
        field_start: i32,
        method_start: i32,
        event_start: i32,
        property_start: i32,
        nested_types_start: i32,
        interfaces_start: i32,
        vtable_start: i32,
        interface_offsets_start: i32,
        method_count: u16,
        property_count: u16,
        field_count: u16,
        event_count: u16,
        nested_type_count: u16,
        vtable_count: u16,
        interfaces_count: u16,
        interface_offsets_count: u16,
        bitfield: u32,
        [19.0 ..] token: u32,
    }
}

impl Il2CppTypeDefinition {
    pub fn is_value_type(&self) -> bool {
        self.bitfield & 0x1 != 0
    }

    pub fn is_enum(&self) -> bool {
        (self.bitfield >> 1) & 0x1 != 0
    }
}

versioned_record! {
    pub struct Il2CppImageDefinition {
        name_index: u32,
        assembly_index: i32,
        type_start: i32,
        type_count: u32,
        [24.0 ..] exported_type_start: i32,
        [24.0 ..] exported_type_count: u32,
        entry_point_index: i32,
        [19.0 ..] token: u32,
        [24.1 ..] custom_attribute_start: i32,
        [24.1 ..] custom_attribute_count: u32,
    }
}

versioned_record! {
    /// Assembly names never carry the `.dll` suffix.
    pub struct Il2CppAssemblyNameDefinition {
        name_index: u32,
        culture_index: u32,
        [.. 24.3] hash_value_index: i32,
        public_key_index: u32,
        hash_alg: u32,
        hash_len: u32,
        flags: u32,
        major: u32,
        minor: u32,
        build: u32,
        revision: u32,
        public_key_token: [u8; 8],
    }
}

versioned_record! {
    /// The fixed head of an assembly record; the embedded
    /// [`Il2CppAssemblyNameDefinition`] follows it on disk.
    pub struct Il2CppAssemblyDefinitionHead {
        image_index: i32,
        [24.1 ..] token: u32,
        [.. 24.0] custom_attribute_index: i32,
        [20.0 ..] referenced_assembly_start: i32,
        [20.0 ..] referenced_assembly_count: i32,
    }
}

/// Assembly record: head plus embedded name
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Il2CppAssemblyDefinition {
    pub head: Il2CppAssemblyDefinitionHead,
    pub aname: Il2CppAssemblyNameDefinition,
}

versioned_record! {
    pub struct Il2CppCustomAttributeTypeRange {
        [24.1 ..] token: u32,
        start: i32,
        count: i32,
    }
}

versioned_record! {
    /// Custom attribute blob range, v29+
    pub struct Il2CppCustomAttributeDataRange {
        token: u32,
        start_offset: u32,
    }
}

versioned_record! {
    pub struct Il2CppMetadataUsageList {
        start: u32,
        count: u32,
    }
}

versioned_record! {
    pub struct Il2CppMetadataUsagePair {
        destination_index: u32,
        encoded_source_index: u32,
    }
}

versioned_record! {
    pub struct Il2CppInterfaceOffsetPair {
        interface_type_index: i32,
        offset: u32,
    }
}

versioned_record! {
    pub struct Il2CppFieldRef {
        type_index: i32,
        /// Local offset into the type's field list
        field_index: i32,
    }
}

versioned_record! {
    pub struct Il2CppRgctxDefinition {
        [.. 27.1] type_pre29: i32,
        [29.0 ..] type_post29: i32,
        [.. 27.1] data: i32,
        [27.2 ..] data_post27: i32,
    }
}

// ============================================================
// Runtime structures (read out of the executable image)
// ============================================================

versioned_record! {
    /// Root table tying code pointers to metadata. All columns are
    /// pointer-sized.
    pub struct Il2CppCodeRegistration {
        [.. 24.1] method_pointers_count: Ptr,
        [.. 24.1] method_pointers: Ptr,
        [.. 21.0] delegate_wrappers_from_native_to_managed_count: Ptr,
        [.. 21.0] delegate_wrappers_from_native_to_managed: Ptr,
        [22.0 ..] reverse_pinvoke_wrapper_count: Ptr,
        [22.0 ..] reverse_pinvoke_wrappers: Ptr,
        [.. 22.0] delegate_wrappers_from_managed_to_native_count: Ptr,
        [.. 22.0] delegate_wrappers_from_managed_to_native: Ptr,
        [.. 22.0] marshaling_functions_count: Ptr,
        [.. 22.0] marshaling_functions: Ptr,
        [21.0 .. 22.0] ccw_marshaling_functions_count: Ptr,
        [21.0 .. 22.0] ccw_marshaling_functions: Ptr,
        generic_method_pointers_count: Ptr,
        generic_method_pointers: Ptr,
        [24.5 ..] generic_adjustor_thunks: Ptr,
        invoker_pointers_count: Ptr,
        invoker_pointers: Ptr,
        [.. 24.5] custom_attribute_count: Ptr,
        [.. 24.5] custom_attribute_generators: Ptr,
        [21.0 .. 22.0] guid_count: Ptr,
        [21.0 .. 22.0] guids: Ptr,
        [22.0 ..] unresolved_virtual_call_count: Ptr,
        [22.0 ..] unresolved_virtual_call_pointers: Ptr,
        [29.1 ..] unresolved_instance_call_pointers: Ptr,
        [29.1 ..] unresolved_static_call_pointers: Ptr,
        [23.0 ..] interop_data_count: Ptr,
        [23.0 ..] interop_data: Ptr,
        [24.3 ..] windows_runtime_factory_count: Ptr,
        [24.3 ..] windows_runtime_factory_table: Ptr,
        [24.2 ..] code_gen_modules_count: Ptr,
        [24.2 ..] code_gen_modules: Ptr,
    }
}

versioned_record! {
    /// Root table of the runtime type system. All columns are
    /// pointer-sized.
    pub struct Il2CppMetadataRegistration {
        generic_classes_count: Ptr,
        generic_classes: Ptr,
        generic_insts_count: Ptr,
        generic_insts: Ptr,
        generic_method_table_count: Ptr,
        generic_method_table: Ptr,
        types_count: Ptr,
        types: Ptr,
        method_specs_count: Ptr,
        method_specs: Ptr,
        [.. 16.0] method_references_count: Ptr,
        [.. 16.0] method_references: Ptr,
        field_offsets_count: Ptr,
        field_offsets: Ptr,
        type_definitions_sizes_count: Ptr,
        type_definitions_sizes: Ptr,
        [19.0 ..] metadata_usages_count: Ptr,
        [19.0 ..] metadata_usages: Ptr,
    }
}

versioned_record! {
    /// Per-assembly method pointer table. Module names keep their `.dll`
    /// suffix.
    pub struct Il2CppCodeGenModule {
        module_name: Ptr,
        method_pointer_count: Ptr,
        method_pointers: Ptr,
        [24.5 ..] adjustor_thunk_count: Ptr,
        [24.5 ..] adjustor_thunks: Ptr,
        invoker_indices: Ptr,
        reverse_pinvoke_wrapper_count: Ptr,
        reverse_pinvoke_wrapper_indices: Ptr,
        rgctx_ranges_count: Ptr,
        rgctx_ranges: Ptr,
        rgctxs_count: Ptr,
        rgctxs: Ptr,
        debugger_metadata: Ptr,
        [27.0 .. 27.2] custom_attribute_cache_generator: Ptr,
        [27.0 ..] module_initializer: Ptr,
        [27.0 ..] static_constructor_type_indices: Ptr,
        [27.0 ..] metadata_registration: Ptr,
        [27.0 ..] code_registration: Ptr,
    }
}

versioned_record! {
    pub struct Il2CppGenericClassRaw {
        [.. 24.5] type_definition_index: Ptr,
        [27.0 ..] type_ptr: Ptr,
        class_inst: Ptr,
        method_inst: Ptr,
        cached_class: Ptr,
    }
}

versioned_record! {
    /// One concrete instantiation of a generic method
    pub struct Il2CppMethodSpec {
        method_definition_index: i32,
        /// Index into the generic inst table, -1 when the class is not generic
        class_inst_index: i32,
        /// Index into the generic inst table, -1 when the method is not generic
        method_inst_index: i32,
    }
}

versioned_record! {
    /// Maps a method spec onto its generic method/invoker pointers
    pub struct Il2CppGenericMethodFunctions {
        generic_method_index: i32,
        method_index: i32,
        invoker_index: i32,
        [24.5 ..] adjustor_thunk: i32,
    }
}

versioned_record! {
    /// Compiler-calculated size values
    pub struct Il2CppTypeDefinitionSizes {
        instance_size: u32,
        native_size: i32,
        static_fields_size: u32,
        thread_static_fields_size: u32,
    }
}

// ============================================================
// Type tags and attribute flag tables
// ============================================================

/// Element type signatures, ECMA-335 II.23.1.16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Il2CppTypeEnum {
    End,
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    Ptr,
    Byref,
    Valuetype,
    Class,
    /// Class generic parameter
    Var,
    Array,
    Genericinst,
    Typedbyref,
    I,
    U,
    Fnptr,
    Object,
    /// Single-dimensional zero-based array
    Szarray,
    /// Method generic parameter
    Mvar,
    CmodReqd,
    CmodOpt,
    Internal,
    Modifier,
    Sentinel,
    Pinned,
    Enum,
    /// Anything outside the known tag set; rendered, never fatal
    Unknown(u8),
}

impl Il2CppTypeEnum {
    pub fn from_tag(tag: u8) -> Self {
        use Il2CppTypeEnum::*;
        match tag {
            0x00 => End,
            0x01 => Void,
            0x02 => Boolean,
            0x03 => Char,
            0x04 => I1,
            0x05 => U1,
            0x06 => I2,
            0x07 => U2,
            0x08 => I4,
            0x09 => U4,
            0x0a => I8,
            0x0b => U8,
            0x0c => R4,
            0x0d => R8,
            0x0e => String,
            0x0f => Ptr,
            0x10 => Byref,
            0x11 => Valuetype,
            0x12 => Class,
            0x13 => Var,
            0x14 => Array,
            0x15 => Genericinst,
            0x16 => Typedbyref,
            0x18 => I,
            0x19 => U,
            0x1b => Fnptr,
            0x1c => Object,
            0x1d => Szarray,
            0x1e => Mvar,
            0x1f => CmodReqd,
            0x20 => CmodOpt,
            0x21 => Internal,
            0x40 => Modifier,
            0x41 => Sentinel,
            0x45 => Pinned,
            0x55 => Enum,
            other => Unknown(other),
        }
    }

    /// C# keyword for primitives and well-known system types
    pub fn csharp_name(self) -> Option<&'static str> {
        use Il2CppTypeEnum::*;
        Some(match self {
            Void => "void",
            Boolean => "bool",
            Char => "char",
            I1 => "sbyte",
            U1 => "byte",
            I2 => "short",
            U2 => "ushort",
            I4 => "int",
            U4 => "uint",
            I8 => "long",
            U8 => "ulong",
            R4 => "float",
            R8 => "double",
            String => "string",
            Typedbyref => "TypedReference",
            I => "IntPtr",
            U => "UIntPtr",
            Object => "object",
            _ => return None,
        })
    }
}

/// Metadata-usage slot kinds
pub mod usage_kind {
    pub const TYPE_INFO: u32 = 1;
    pub const IL2CPP_TYPE: u32 = 2;
    pub const METHOD_DEF: u32 = 3;
    pub const FIELD_INFO: u32 = 4;
    pub const STRING_LITERAL: u32 = 5;
    pub const METHOD_REF: u32 = 6;
}

/// Type attribute flags, `il2cpp-tabledefs.h`
pub mod type_attributes {
    pub const VISIBILITY_MASK: u32 = 0x00000007;
    pub const NOT_PUBLIC: u32 = 0x00000000;
    pub const PUBLIC: u32 = 0x00000001;
    pub const NESTED_PUBLIC: u32 = 0x00000002;
    pub const NESTED_PRIVATE: u32 = 0x00000003;
    pub const NESTED_FAMILY: u32 = 0x00000004;
    pub const NESTED_ASSEMBLY: u32 = 0x00000005;
    pub const NESTED_FAM_AND_ASSEM: u32 = 0x00000006;
    pub const NESTED_FAM_OR_ASSEM: u32 = 0x00000007;

    pub const INTERFACE: u32 = 0x00000020;
    pub const ABSTRACT: u32 = 0x00000080;
    pub const SEALED: u32 = 0x00000100;
    pub const SERIALIZABLE: u32 = 0x00002000;
}

/// Field attribute flags, `il2cpp-tabledefs.h`
pub mod field_attributes {
    pub const FIELD_ACCESS_MASK: u16 = 0x0007;
    pub const PRIVATE: u16 = 0x0001;
    pub const FAM_AND_ASSEM: u16 = 0x0002;
    pub const ASSEMBLY: u16 = 0x0003;
    pub const FAMILY: u16 = 0x0004;
    pub const FAM_OR_ASSEM: u16 = 0x0005;
    pub const PUBLIC: u16 = 0x0006;

    pub const STATIC: u16 = 0x0010;
    pub const INIT_ONLY: u16 = 0x0020;
    pub const LITERAL: u16 = 0x0040;
}

/// Method attribute flags, `il2cpp-tabledefs.h`
pub mod method_attributes {
    pub const MEMBER_ACCESS_MASK: u16 = 0x0007;
    pub const PRIVATE: u16 = 0x0001;
    pub const FAM_AND_ASSEM: u16 = 0x0002;
    pub const ASSEMBLY: u16 = 0x0003;
    pub const FAMILY: u16 = 0x0004;
    pub const FAM_OR_ASSEM: u16 = 0x0005;
    pub const PUBLIC: u16 = 0x0006;

    pub const STATIC: u16 = 0x0010;
    pub const FINAL: u16 = 0x0020;
    pub const VIRTUAL: u16 = 0x0040;

    pub const VTABLE_LAYOUT_MASK: u16 = 0x0100;
    pub const NEW_SLOT: u16 = 0x0100;

    pub const ABSTRACT: u16 = 0x0400;
    pub const PINVOKE_IMPL: u16 = 0x2000;
}

/// Parameter attribute flags, `il2cpp-tabledefs.h`
pub mod param_attributes {
    pub const IN: u16 = 0x0001;
    pub const OUT: u16 = 0x0002;
    pub const OPTIONAL: u16 = 0x0010;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Layout, VersionedRecord};

    #[test]
    fn header_length_marks_the_24_2_boundary() {
        // The first table begins right after the header, so the first
        // offset column doubles as the header length.
        assert_eq!(
            Layout::compile(Il2CppGlobalMetadataHeader::FIELDS, 24.2, 8).size,
            264
        );
        assert_eq!(
            Layout::compile(Il2CppGlobalMetadataHeader::FIELDS, 24.0, 8).size,
            272
        );
    }

    #[test]
    fn type_definition_strides() {
        // v29 dropped byref_type_index relative to 24.x
        let v29 = Layout::compile(Il2CppTypeDefinition::FIELDS, 29.0, 8).size;
        let v24_2 = Layout::compile(Il2CppTypeDefinition::FIELDS, 24.2, 8).size;
        assert_eq!(v24_2 - v29, 4);

        // rgctx columns only exist through 24.1
        let v24_1 = Layout::compile(Il2CppTypeDefinition::FIELDS, 24.1, 8).size;
        assert_eq!(v24_1 - v24_2, 8);
    }

    #[test]
    fn code_registration_tail_grows_with_version() {
        let ptr = 8;
        let v29 = Layout::compile(Il2CppCodeRegistration::FIELDS, 29.0, ptr).size;
        let v29_1 = Layout::compile(Il2CppCodeRegistration::FIELDS, 29.1, ptr).size;
        assert_eq!(v29_1 - v29, 2 * ptr);
    }

    #[test]
    fn unknown_tags_are_preserved() {
        assert_eq!(Il2CppTypeEnum::from_tag(0x08), Il2CppTypeEnum::I4);
        assert_eq!(Il2CppTypeEnum::from_tag(0x7E), Il2CppTypeEnum::Unknown(0x7E));
        assert_eq!(Il2CppTypeEnum::I4.csharp_name(), Some("int"));
        assert_eq!(Il2CppTypeEnum::Genericinst.csharp_name(), None);
    }
}
