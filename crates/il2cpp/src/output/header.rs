//! il2cpp.h writer
//!
//! One C struct per type with fields in declaration order. A struct that
//! embeds another (value-type field, or the `_base` of its parent) must
//! come after it, so definitions are emitted in dependency order;
//! forward declarations break reference cycles.

use crate::executor::{DefaultValue, Executor};
use crate::registration::{Il2CppType, TypeData};
use crate::structures::*;
use cildump_core::Result;
use std::collections::HashSet;

/// Render the full il2cpp.h header
pub fn write_header(executor: &mut Executor) -> Result<String> {
    let metadata = executor.metadata;
    let mut out = String::new();

    out.push_str("#ifndef IL2CPP_H\n");
    out.push_str("#define IL2CPP_H\n\n");
    out.push_str("#include <stdint.h>\n");
    out.push_str("#include <stdbool.h>\n\n");

    write_base_types(&mut out);

    let safe_names: Vec<String> = (0..metadata.type_definitions.len())
        .map(|i| safe_type_name(executor, i))
        .collect();

    out.push_str("// Forward declarations\n");
    let mut declared = HashSet::new();
    for name in &safe_names {
        if !name.is_empty() && declared.insert(name.clone()) {
            out.push_str(&format!("struct {name}_o;\n"));
        }
    }
    out.push('\n');

    out.push_str("// Type definitions\n");
    let mut emitted = HashSet::new();
    let mut in_progress = HashSet::new();
    for index in 0..metadata.type_definitions.len() {
        emit_type(
            executor,
            &mut out,
            index,
            &safe_names,
            &mut emitted,
            &mut in_progress,
        );
    }

    out.push_str("\n#endif // IL2CPP_H\n");
    Ok(out)
}

fn write_base_types(out: &mut String) {
    out.push_str("// Base IL2CPP types\n");
    out.push_str("typedef struct Il2CppObject {\n");
    out.push_str("    void* klass;\n");
    out.push_str("    void* monitor;\n");
    out.push_str("} Il2CppObject;\n\n");

    out.push_str("typedef struct System_String_o {\n");
    out.push_str("    Il2CppObject _base;\n");
    out.push_str("    int32_t length;\n");
    out.push_str("    uint16_t chars[1];\n");
    out.push_str("} System_String_o;\n\n");

    out.push_str("typedef struct Il2CppArray {\n");
    out.push_str("    Il2CppObject _base;\n");
    out.push_str("    void* bounds;\n");
    out.push_str("    uintptr_t max_length;\n");
    out.push_str("} Il2CppArray;\n\n");
}

/// Emit one type after its embedded dependencies (post-order DFS).
/// Reference fields only need the forward declaration, so cycles through
/// them never recurse.
fn emit_type(
    executor: &mut Executor,
    out: &mut String,
    index: usize,
    safe_names: &[String],
    emitted: &mut HashSet<usize>,
    in_progress: &mut HashSet<usize>,
) {
    if emitted.contains(&index) || !in_progress.insert(index) {
        return;
    }

    for dependency in embedded_dependencies(executor, index) {
        emit_type(executor, out, dependency, safe_names, emitted, in_progress);
    }

    in_progress.remove(&index);
    emitted.insert(index);

    let safe_name = &safe_names[index];
    if safe_name.is_empty() {
        return;
    }

    let type_def = &executor.metadata.type_definitions[index];
    if type_def.is_enum() {
        write_enum(executor, out, index, safe_name);
    } else if type_def.flags & type_attributes::INTERFACE == 0 {
        write_struct(executor, out, index, safe_name);
    }
}

/// Types whose full definition must precede this one: the embedded
/// parent of a reference type and every value-type instance field.
fn embedded_dependencies(executor: &mut Executor, index: usize) -> Vec<usize> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = &metadata.type_definitions[index];
    let mut deps = Vec::new();

    if !type_def.is_value_type() && !type_def.is_enum() && type_def.parent_index >= 0 {
        if let Ok(parent) = runtime.type_at(type_def.parent_index) {
            if let Some(parent_index) = definition_index(parent, metadata.type_definitions.len()) {
                let parent_name = executor.get_type_name(*parent, false, false);
                if parent_name != "object" && parent_name != "ValueType" && parent_name != "Enum" {
                    deps.push(parent_index);
                }
            }
        }
    }

    let field_end = type_def.field_start + type_def.field_count as i32;
    for i in type_def.field_start..field_end {
        let Some(field) = metadata.fields.get(i as usize) else {
            continue;
        };
        let Ok(field_type) = runtime.type_at(field.type_index) else {
            continue;
        };
        if field_type.attrs & field_attributes::STATIC != 0 {
            continue;
        }
        if field_type.ty == Il2CppTypeEnum::Valuetype {
            if let Some(dep) = definition_index(field_type, metadata.type_definitions.len()) {
                if dep != index {
                    deps.push(dep);
                }
            }
        }
    }
    deps
}

fn definition_index(ty: &Il2CppType, type_def_count: usize) -> Option<usize> {
    match ty.data {
        TypeData::TypeDefinition(i) if i >= 0 && (i as usize) < type_def_count => Some(i as usize),
        _ => None,
    }
}

fn write_struct(executor: &mut Executor, out: &mut String, index: usize, safe_name: &str) {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = &metadata.type_definitions[index];

    out.push_str(&format!("// TypeDefIndex: {index}\n"));
    out.push_str(&format!("typedef struct {safe_name}_o {{\n"));

    if !type_def.is_value_type() && type_def.parent_index >= 0 {
        if let Ok(parent) = runtime.type_at(type_def.parent_index) {
            let parent_name = executor.get_type_name(*parent, false, false);
            if parent_name == "object" || parent_name == "ValueType" {
                out.push_str("    Il2CppObject _base;\n");
            } else {
                out.push_str(&format!("    {}_o _base;\n", sanitize_name(&parent_name)));
            }
        }
    }

    let field_end = type_def.field_start + type_def.field_count as i32;
    for i in type_def.field_start..field_end {
        let Some(field) = metadata.fields.get(i as usize) else {
            continue;
        };
        let Ok(field_type) = runtime.type_at(field.type_index) else {
            continue;
        };
        if field_type.attrs & field_attributes::STATIC != 0
            || field_type.attrs & field_attributes::LITERAL != 0
        {
            continue;
        }

        let Ok(field_name) = metadata.get_string(field.name_index) else {
            continue;
        };
        let c_type = c_type_name(executor, *field_type);
        let offset = runtime
            .field_offset(
                executor.binary,
                index,
                (i - type_def.field_start) as usize,
                i as usize,
                type_def.is_value_type(),
                false,
            )
            .unwrap_or(-1);
        out.push_str(&format!(
            "    {} {}; // 0x{:X}\n",
            c_type,
            sanitize_name(field_name),
            offset.max(0)
        ));
    }

    out.push_str(&format!("}} {safe_name}_o;\n\n"));
}

fn write_enum(executor: &mut Executor, out: &mut String, index: usize, safe_name: &str) {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = &metadata.type_definitions[index];

    out.push_str(&format!("typedef enum {safe_name} {{\n"));
    let field_end = type_def.field_start + type_def.field_count as i32;
    for i in type_def.field_start..field_end {
        let Some(field) = metadata.fields.get(i as usize) else {
            continue;
        };
        let Ok(field_type) = runtime.type_at(field.type_index) else {
            continue;
        };
        if field_type.attrs & field_attributes::LITERAL == 0 {
            continue;
        }
        let Ok(field_name) = metadata.get_string(field.name_index) else {
            continue;
        };
        let member = format!("{safe_name}_{}", sanitize_name(field_name));

        let value = metadata
            .field_default_value(i)
            .filter(|d| d.data_index != -1)
            .map(|d| executor.default_value(d.type_index, d.data_index));
        match value {
            Some(DefaultValue::I4(v)) => out.push_str(&format!("    {member} = {v},\n")),
            Some(DefaultValue::U4(v)) => out.push_str(&format!("    {member} = {v},\n")),
            Some(DefaultValue::I2(v)) => out.push_str(&format!("    {member} = {v},\n")),
            Some(DefaultValue::U2(v)) => out.push_str(&format!("    {member} = {v},\n")),
            Some(DefaultValue::I1(v)) => out.push_str(&format!("    {member} = {v},\n")),
            Some(DefaultValue::U1(v)) => out.push_str(&format!("    {member} = {v},\n")),
            Some(DefaultValue::I8(v)) => out.push_str(&format!("    {member} = {v},\n")),
            _ => out.push_str(&format!("    {member},\n")),
        }
    }
    out.push_str(&format!("}} {safe_name};\n\n"));
}

fn c_type_name(executor: &mut Executor, ty: Il2CppType) -> String {
    use Il2CppTypeEnum::*;
    match ty.ty {
        Void => "void".to_string(),
        Boolean => "bool".to_string(),
        Char | U2 => "uint16_t".to_string(),
        I1 => "int8_t".to_string(),
        U1 => "uint8_t".to_string(),
        I2 => "int16_t".to_string(),
        I4 => "int32_t".to_string(),
        U4 => "uint32_t".to_string(),
        I8 => "int64_t".to_string(),
        U8 => "uint64_t".to_string(),
        R4 => "float".to_string(),
        R8 => "double".to_string(),
        String => "System_String_o*".to_string(),
        Object => "Il2CppObject*".to_string(),
        I => "intptr_t".to_string(),
        U => "uintptr_t".to_string(),
        Szarray => "Il2CppArray*".to_string(),
        Ptr => "void*".to_string(),
        Class | Valuetype => {
            let count = executor.metadata.type_definitions.len();
            let Some(index) = definition_index(&ty, count) else {
                return "void*".to_string();
            };
            let Some(type_def) = executor.metadata.type_definitions.get(index) else {
                return "void*".to_string();
            };
            let is_value_type = type_def.is_value_type();
            let safe = safe_type_name(executor, index);
            if safe.is_empty() {
                "void*".to_string()
            } else if is_value_type {
                format!("{safe}_o")
            } else {
                format!("{safe}_o*")
            }
        }
        _ => "void*".to_string(),
    }
}

fn safe_type_name(executor: &mut Executor, index: usize) -> String {
    let metadata = executor.metadata;
    let Some(type_def) = metadata.type_definitions.get(index) else {
        return String::new();
    };
    let namespace = metadata.get_string(type_def.namespace_index).unwrap_or("");
    let name = metadata.get_string(type_def.name_index).unwrap_or("");
    let name = match name.find('`') {
        Some(at) => &name[..at],
        None => name,
    };
    let full = if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}_{name}")
    };
    sanitize_name(&full)
}

/// Restrict a managed name to a valid C identifier
fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.push(c);
        } else if matches!(c, '.' | '/' | '<' | '>' | '[' | ']') {
            out.push('_');
        }
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_names_are_c_identifiers() {
        assert_eq!(sanitize_name("System.Collections.Generic_List"), "System_Collections_Generic_List");
        assert_eq!(sanitize_name("<Module>"), "_Module_");
        assert_eq!(sanitize_name("9Lives"), "_9Lives");
        assert_eq!(sanitize_name("Outer/Inner"), "Outer_Inner");
    }
}
