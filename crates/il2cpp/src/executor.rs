//! Type-graph executor
//!
//! Walks cross-references between the metadata tables and the runtime
//! type system to compose fully qualified C# names, resolve method
//! addresses and decode default values. Every resolution is memoized;
//! the caches live and die with one executor.

use crate::metadata::Metadata;
use crate::registration::{stream_at, GenericInst, Il2CppType, Runtime, TypeData};
use crate::structures::*;
use cildump_binary_parser::BinaryFile;
use cildump_core::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// A decoded field or parameter default value
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Bool(bool),
    Char(char),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    Str(String),
    Null,
    /// Not decodable from the blob; carries the metadata offset
    Unresolved(usize),
}

impl fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Bool(v) => write!(f, "{}", if *v { "true" } else { "false" }),
            DefaultValue::Char(v) => write!(f, "'{}'", escape_string(&v.to_string())),
            DefaultValue::I1(v) => write!(f, "{v}"),
            DefaultValue::U1(v) => write!(f, "{v}"),
            DefaultValue::I2(v) => write!(f, "{v}"),
            DefaultValue::U2(v) => write!(f, "{v}"),
            DefaultValue::I4(v) => write!(f, "{v}"),
            DefaultValue::U4(v) => write!(f, "{v}"),
            DefaultValue::I8(v) => write!(f, "{v}"),
            DefaultValue::U8(v) => write!(f, "{v}"),
            DefaultValue::R4(v) => write!(f, "{v}"),
            DefaultValue::R8(v) => write!(f, "{v}"),
            DefaultValue::Str(v) => write!(f, "\"{}\"", escape_string(v)),
            DefaultValue::Null => write!(f, "null"),
            DefaultValue::Unresolved(offset) => write!(f, "/*Metadata offset 0x{offset:X}*/"),
        }
    }
}

/// Escape a string for inclusion in C#-like output
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 32 || (c as u32) > 126 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

pub struct Executor<'a> {
    pub metadata: &'a Metadata,
    pub runtime: &'a Runtime,
    pub binary: &'a dyn BinaryFile,
    /// Attribute generator pointers, indexed by attribute range index
    pub custom_attribute_generators: Vec<u64>,

    type_name_cache: HashMap<(TypeData, Il2CppTypeEnum, bool, bool), String>,
    type_def_name_cache: HashMap<(usize, bool, bool), String>,
    generic_class_cache: HashMap<u64, Il2CppGenericClassRaw>,
    generic_inst_cache: HashMap<u64, GenericInst>,
    generic_inst_params_cache: HashMap<(u64, usize), String>,
    generic_container_params_cache: HashMap<(i32, i32), String>,
    method_spec_name_cache: HashMap<(usize, bool), (String, String)>,
}

impl<'a> Executor<'a> {
    pub fn new(metadata: &'a Metadata, runtime: &'a Runtime, binary: &'a dyn BinaryFile) -> Self {
        let mut executor = Self {
            metadata,
            runtime,
            binary,
            custom_attribute_generators: Vec::new(),
            type_name_cache: HashMap::new(),
            type_def_name_cache: HashMap::new(),
            generic_class_cache: HashMap::new(),
            generic_inst_cache: HashMap::new(),
            generic_inst_params_cache: HashMap::new(),
            generic_container_params_cache: HashMap::new(),
            method_spec_name_cache: HashMap::new(),
        };
        executor.load_attribute_generators();
        executor
    }

    /// Attribute generators moved from a flat table into the per-module
    /// records at v27, and disappeared entirely at v29.
    fn load_attribute_generators(&mut self) {
        let metadata = self.metadata;
        let runtime = self.runtime;
        let version = runtime.version;
        if version < 27.0 {
            self.custom_attribute_generators = runtime.custom_attribute_generators.clone();
            return;
        }
        if version >= 29.0 {
            return;
        }

        let total: usize = metadata
            .images
            .iter()
            .map(|img| img.custom_attribute_count as usize)
            .sum();
        self.custom_attribute_generators = vec![0; total];

        for image in &metadata.images {
            if image.custom_attribute_count == 0 || image.custom_attribute_start < 0 {
                continue;
            }
            let Ok(name) = metadata.get_string(image.name_index) else {
                continue;
            };
            let Some(module) = runtime.module_named(name) else {
                continue;
            };
            let generator_va = module.module.custom_attribute_cache_generator.va();
            let pointers = crate::registration::read_ptr_array(
                self.binary,
                generator_va,
                image.custom_attribute_count as usize,
                version,
            );
            if let Ok(pointers) = pointers {
                let start = image.custom_attribute_start as usize;
                for (i, pointer) in pointers.into_iter().enumerate() {
                    if let Some(slot) = self.custom_attribute_generators.get_mut(start + i) {
                        *slot = pointer;
                    }
                }
            } else {
                debug!(module = %name, "attribute generator table not file-backed");
            }
        }
    }

    // ========== Name composition ==========

    /// Fully qualified C#-style name of a runtime type.
    ///
    /// `is_nested` renders only the path of a declaring type (no generic
    /// suffix), used when composing nested names.
    pub fn get_type_name(&mut self, ty: Il2CppType, add_namespace: bool, is_nested: bool) -> String {
        let key = (ty.data, ty.ty, add_namespace, is_nested);
        if let Some(name) = self.type_name_cache.get(&key) {
            return name.clone();
        }
        let name = self.compose_type_name(ty, add_namespace, is_nested);
        self.type_name_cache.insert(key, name.clone());
        name
    }

    fn compose_type_name(&mut self, ty: Il2CppType, add_namespace: bool, is_nested: bool) -> String {
        let runtime = self.runtime;
        let metadata = self.metadata;

        match ty.ty {
            Il2CppTypeEnum::Array => {
                if let TypeData::ArrayDescriptor(va) = ty.data {
                    if let Some((element, rank)) = self.read_array_descriptor(va) {
                        let element_name = self.get_type_name(element, add_namespace, false);
                        let mut name = element_name;
                        name.push('[');
                        for _ in 1..rank.max(1) {
                            name.push(',');
                        }
                        name.push(']');
                        return name;
                    }
                }
                "object[]".to_string()
            }
            Il2CppTypeEnum::Szarray => {
                if let TypeData::TypePointer(va) = ty.data {
                    if let Some(element) = runtime.type_by_va(va) {
                        return format!("{}[]", self.get_type_name(*element, add_namespace, false));
                    }
                }
                "object[]".to_string()
            }
            Il2CppTypeEnum::Ptr => {
                if let TypeData::TypePointer(va) = ty.data {
                    if let Some(inner) = runtime.type_by_va(va) {
                        return format!("{}*", self.get_type_name(*inner, add_namespace, false));
                    }
                }
                "void*".to_string()
            }
            Il2CppTypeEnum::Var | Il2CppTypeEnum::Mvar => {
                if let TypeData::GenericParameter(index) = ty.data {
                    if let Some(param) = usize::try_from(index)
                        .ok()
                        .and_then(|i| metadata.generic_parameters.get(i))
                    {
                        if let Ok(name) = metadata.get_string(param.name_index) {
                            return name.to_string();
                        }
                    }
                }
                "T".to_string()
            }
            Il2CppTypeEnum::Class | Il2CppTypeEnum::Valuetype | Il2CppTypeEnum::Genericinst => {
                let generic_class = match ty.data {
                    TypeData::GenericClass(va) => self.read_generic_class(va),
                    _ => None,
                };
                let type_def_index = match ty.data {
                    TypeData::TypeDefinition(index) => Some(index),
                    TypeData::GenericClass(_) => generic_class
                        .as_ref()
                        .and_then(|gc| self.generic_class_type_def(gc)),
                    _ => None,
                };
                let Some(type_def_index) = type_def_index
                    .and_then(|i| usize::try_from(i).ok())
                    .filter(|&i| i < metadata.type_definitions.len())
                else {
                    return "UnknownType".to_string();
                };
                let type_def = &metadata.type_definitions[type_def_index];

                let mut result = String::new();
                if type_def.declaring_type_index != -1 {
                    if let Ok(declaring) = runtime.type_at(type_def.declaring_type_index) {
                        result.push_str(&self.get_type_name(*declaring, add_namespace, true));
                        result.push('.');
                    }
                } else if add_namespace {
                    if let Ok(namespace) = metadata.get_string(type_def.namespace_index) {
                        if !namespace.is_empty() {
                            result.push_str(namespace);
                            result.push('.');
                        }
                    }
                }

                let name = metadata.get_string(type_def.name_index).unwrap_or("?");
                result.push_str(strip_arity(name));

                if is_nested {
                    return result;
                }

                if let Some(gc) = generic_class {
                    if let Some(inst) = self.read_generic_inst(gc.class_inst.va()) {
                        result.push_str(&self.generic_inst_params(inst));
                    }
                } else if type_def.generic_container_index >= 0 {
                    if let Some(container) = metadata
                        .generic_containers
                        .get(type_def.generic_container_index as usize)
                    {
                        result.push_str(&self.generic_container_params(container));
                    }
                }
                result
            }
            other => match other.csharp_name() {
                Some(name) => name.to_string(),
                None => match other {
                    Il2CppTypeEnum::Unknown(tag) => format!("UnknownType({tag})"),
                    _ => format!("UnknownType({other:?})"),
                },
            },
        }
    }

    /// Name of a type definition by table index
    pub fn get_type_def_name(
        &mut self,
        type_def_index: usize,
        add_namespace: bool,
        generic_parameter: bool,
    ) -> String {
        let key = (type_def_index, add_namespace, generic_parameter);
        if let Some(name) = self.type_def_name_cache.get(&key) {
            return name.clone();
        }

        let metadata = self.metadata;
        let runtime = self.runtime;
        let Some(type_def) = metadata.type_definitions.get(type_def_index) else {
            return "UnknownType".to_string();
        };

        let mut prefix = String::new();
        if type_def.declaring_type_index != -1 {
            if let Ok(declaring) = runtime.type_at(type_def.declaring_type_index) {
                prefix = self.get_type_name(*declaring, add_namespace, true);
                prefix.push('.');
            }
        } else if add_namespace {
            if let Ok(namespace) = metadata.get_string(type_def.namespace_index) {
                if !namespace.is_empty() {
                    prefix = format!("{namespace}.");
                }
            }
        }

        let mut name = metadata
            .get_string(type_def.name_index)
            .unwrap_or("?")
            .to_string();
        if type_def.generic_container_index >= 0 {
            name = strip_arity(&name).to_string();
            if generic_parameter {
                if let Some(container) = metadata
                    .generic_containers
                    .get(type_def.generic_container_index as usize)
                {
                    name.push_str(&self.generic_container_params(container));
                }
            }
        }

        let result = format!("{prefix}{name}");
        self.type_def_name_cache.insert(key, result.clone());
        result
    }

    /// `<T1, T2>` from a generic container's declared parameters
    pub fn generic_container_params(&mut self, container: &Il2CppGenericContainer) -> String {
        let key = (container.generic_parameter_start, container.type_argc);
        if let Some(params) = self.generic_container_params_cache.get(&key) {
            return params.clone();
        }

        let metadata = self.metadata;
        let mut names = Vec::with_capacity(container.type_argc.max(0) as usize);
        for i in 0..container.type_argc {
            let index = (container.generic_parameter_start + i) as usize;
            let name = metadata
                .generic_parameters
                .get(index)
                .and_then(|p| metadata.get_string(p.name_index).ok())
                .unwrap_or("T");
            names.push(name.to_string());
        }
        let result = format!("<{}>", names.join(", "));
        self.generic_container_params_cache.insert(key, result.clone());
        result
    }

    /// `<int, string>` from an instantiation's argument list
    pub fn generic_inst_params(&mut self, inst: GenericInst) -> String {
        let key = (inst.type_argv, inst.type_argc);
        if let Some(params) = self.generic_inst_params_cache.get(&key) {
            return params.clone();
        }

        let runtime = self.runtime;
        let pointers =
            crate::registration::read_ptr_array(self.binary, inst.type_argv, inst.type_argc, runtime.version)
                .unwrap_or_default();
        let mut names = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            match runtime.type_by_va(pointer) {
                Some(ty) => names.push(self.get_type_name(*ty, false, false)),
                None => names.push("?".to_string()),
            }
        }
        let result = format!("<{}>", names.join(", "));
        self.generic_inst_params_cache.insert(key, result.clone());
        result
    }

    /// `(type name, method name)` of one generic method instantiation
    pub fn method_spec_name(&mut self, spec_index: usize, add_namespace: bool) -> (String, String) {
        let key = (spec_index, add_namespace);
        if let Some(names) = self.method_spec_name_cache.get(&key) {
            return names.clone();
        }

        let metadata = self.metadata;
        let runtime = self.runtime;
        let Some(spec) = runtime.method_specs.get(spec_index).cloned() else {
            return ("UnknownType".to_string(), "?".to_string());
        };
        let Some(method) = usize::try_from(spec.method_definition_index)
            .ok()
            .and_then(|i| metadata.methods.get(i))
        else {
            return ("UnknownType".to_string(), "?".to_string());
        };

        let mut type_name =
            self.get_type_def_name(method.declaring_type.max(0) as usize, add_namespace, false);
        if spec.class_inst_index != -1 {
            if let Some(inst) = runtime
                .generic_insts
                .get(spec.class_inst_index as usize)
                .copied()
            {
                type_name.push_str(&self.generic_inst_params(inst));
            }
        }

        let mut method_name = metadata.get_string(method.name_index).unwrap_or("?").to_string();
        if spec.method_inst_index != -1 {
            if let Some(inst) = runtime
                .generic_insts
                .get(spec.method_inst_index as usize)
                .copied()
            {
                method_name.push_str(&self.generic_inst_params(inst));
            }
        }

        let result = (type_name, method_name);
        self.method_spec_name_cache.insert(key, result.clone());
        result
    }

    // ========== Runtime reads behind caches ==========

    fn read_generic_class(&mut self, va: u64) -> Option<Il2CppGenericClassRaw> {
        if let Some(gc) = self.generic_class_cache.get(&va) {
            return Some(gc.clone());
        }
        let mut stream = stream_at(self.binary, va, self.runtime.version).ok()?;
        let gc: Il2CppGenericClassRaw = stream.read_record().ok()?;
        self.generic_class_cache.insert(va, gc.clone());
        Some(gc)
    }

    fn read_generic_inst(&mut self, va: u64) -> Option<GenericInst> {
        if va == 0 {
            return None;
        }
        if let Some(inst) = self.generic_inst_cache.get(&va) {
            return Some(*inst);
        }
        let mut stream = stream_at(self.binary, va, self.runtime.version).ok()?;
        let type_argc = stream.read_ptr().ok()? as usize;
        let type_argv = stream.read_ptr().ok()?;
        let inst = GenericInst {
            type_argc,
            type_argv,
        };
        self.generic_inst_cache.insert(va, inst);
        Some(inst)
    }

    fn generic_class_type_def(&self, gc: &Il2CppGenericClassRaw) -> Option<i32> {
        if self.runtime.version >= 27.0 {
            match self.runtime.type_by_va(gc.type_ptr.va())?.data {
                TypeData::TypeDefinition(index) => Some(index),
                _ => None,
            }
        } else {
            let index = gc.type_definition_index.0;
            if index == u64::MAX || index == u32::MAX as u64 {
                None
            } else {
                Some(index as i32)
            }
        }
    }

    fn read_array_descriptor(&mut self, va: u64) -> Option<(Il2CppType, u8)> {
        let mut stream = stream_at(self.binary, va, self.runtime.version).ok()?;
        let element_va = stream.read_ptr().ok()?;
        let rank = stream.read_u8().ok()?;
        let element = *self.runtime.type_by_va(element_va)?;
        Some((element, rank))
    }

    // ========== Addresses and default values ==========

    /// Native entry point of a method, 0 when it has none
    pub fn method_pointer(&self, image_name: &str, method: &Il2CppMethodDefinition) -> u64 {
        self.runtime.method_pointer(image_name, method)
    }

    pub fn rva(&self, va: u64) -> u64 {
        self.binary.rva(va)
    }

    pub fn file_offset(&self, va: u64) -> Option<u64> {
        self.binary.va_to_offset(cildump_core::Address::new(va))
    }

    /// Decode the default-value blob entry for a field or parameter
    pub fn default_value(&self, type_index: i32, data_index: i32) -> DefaultValue {
        let offset = self.metadata.default_value_data_offset(data_index);
        let Ok(ty) = self.runtime.type_at(type_index) else {
            return DefaultValue::Unresolved(offset);
        };
        let version = self.runtime.version;
        let mut stream = self.metadata.stream_at(offset);

        let decoded: Result<DefaultValue> = (|| {
            Ok(match ty.ty {
                Il2CppTypeEnum::Boolean => DefaultValue::Bool(stream.read_bool()?),
                Il2CppTypeEnum::U1 => DefaultValue::U1(stream.read_u8()?),
                Il2CppTypeEnum::I1 => DefaultValue::I1(stream.read_i8()?),
                Il2CppTypeEnum::Char => {
                    let code = stream.read_u16()? as u32;
                    DefaultValue::Char(char::from_u32(code).unwrap_or('\u{FFFD}'))
                }
                Il2CppTypeEnum::U2 => DefaultValue::U2(stream.read_u16()?),
                Il2CppTypeEnum::I2 => DefaultValue::I2(stream.read_i16()?),
                Il2CppTypeEnum::U4 => {
                    if version >= 29.0 {
                        DefaultValue::U4(stream.read_compressed_u32()?)
                    } else {
                        DefaultValue::U4(stream.read_u32()?)
                    }
                }
                Il2CppTypeEnum::I4 => {
                    if version >= 29.0 {
                        DefaultValue::I4(stream.read_compressed_i32()?)
                    } else {
                        DefaultValue::I4(stream.read_i32()?)
                    }
                }
                Il2CppTypeEnum::U8 => DefaultValue::U8(stream.read_u64()?),
                Il2CppTypeEnum::I8 => DefaultValue::I8(stream.read_i64()?),
                Il2CppTypeEnum::R4 => DefaultValue::R4(stream.read_f32()?),
                Il2CppTypeEnum::R8 => DefaultValue::R8(stream.read_f64()?),
                Il2CppTypeEnum::String => {
                    let length = if version >= 29.0 {
                        stream.read_compressed_i32()?
                    } else {
                        stream.read_i32()?
                    };
                    if length == -1 {
                        DefaultValue::Null
                    } else {
                        let bytes = stream.read_bytes(length.max(0) as usize)?;
                        DefaultValue::Str(String::from_utf8_lossy(bytes).into_owned())
                    }
                }
                _ => DefaultValue::Unresolved(offset),
            })
        })();

        decoded.unwrap_or(DefaultValue::Unresolved(offset))
    }
}

fn strip_arity(name: &str) -> &str {
    match name.find('`') {
        Some(at) => &name[..at],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_non_printables() {
        assert_eq!(escape_string("a\"b"), "a\\\"b");
        assert_eq!(escape_string("line\nbreak"), "line\\nbreak");
        assert_eq!(escape_string("nul\0"), "nul\\0");
        assert_eq!(escape_string("\u{1F}"), "\\x1f");
    }

    #[test]
    fn arity_suffix_is_stripped() {
        assert_eq!(strip_arity("List`1"), "List");
        assert_eq!(strip_arity("Plain"), "Plain");
    }

    #[test]
    fn default_value_rendering() {
        assert_eq!(DefaultValue::Bool(true).to_string(), "true");
        assert_eq!(DefaultValue::Null.to_string(), "null");
        assert_eq!(DefaultValue::I4(-5).to_string(), "-5");
        assert_eq!(DefaultValue::Str("a\"b".into()).to_string(), "\"a\\\"b\"");
        assert_eq!(
            DefaultValue::Unresolved(0x40).to_string(),
            "/*Metadata offset 0x40*/"
        );
    }
}
