//! dump.cs writer
//!
//! A C#-like listing of every image, ordered by image then declaring
//! type, with flags rendered back into keywords and addresses attached
//! as comments. Indentation is two spaces per level.

use crate::executor::{DefaultValue, Executor};
use crate::structures::*;
use cildump_core::{DumpConfig, Error, Result};

/// Render the full dump.cs listing
pub fn write_dump_cs(executor: &mut Executor, config: &DumpConfig) -> Result<String> {
    let metadata = executor.metadata;
    let mut out = String::new();

    for (i, image) in metadata.images.iter().enumerate() {
        let name = metadata.get_string(image.name_index)?;
        out.push_str(&format!("// Image {}: {} - {}\n", i, name, image.type_start));
    }

    for (image_index, image) in metadata.images.iter().enumerate() {
        let image_name = metadata.get_string(image.name_index)?.to_string();
        let type_end = image.type_start + image.type_count as i32;
        for type_def_index in image.type_start..type_end {
            if type_def_index < 0 {
                continue;
            }
            dump_type(
                executor,
                &mut out,
                type_def_index as usize,
                image_index,
                &image_name,
                config,
            )?;
        }
    }

    Ok(out)
}

fn dump_type(
    executor: &mut Executor,
    out: &mut String,
    type_def_index: usize,
    image_index: usize,
    image_name: &str,
    config: &DumpConfig,
) -> Result<()> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = metadata
        .type_definitions
        .get(type_def_index)
        .ok_or_else(|| {
            Error::corrupt_index(
                "type_definitions",
                type_def_index as i64,
                metadata.type_definitions.len(),
            )
        })?;

    let mut extends: Vec<String> = Vec::new();
    if type_def.parent_index >= 0 {
        let parent = runtime.type_at(type_def.parent_index)?;
        let parent_name = executor.get_type_name(*parent, false, false);
        if !type_def.is_value_type() && !type_def.is_enum() && parent_name != "object" {
            extends.push(parent_name);
        }
    }
    for i in 0..type_def.interfaces_count as usize {
        let slot = type_def.interfaces_start as usize + i;
        let interface_index = *metadata.interface_indices.get(slot).ok_or_else(|| {
            Error::corrupt_index("interfaces", slot as i64, metadata.interface_indices.len())
        })?;
        let interface = runtime.type_at(interface_index)?;
        extends.push(executor.get_type_name(*interface, false, false));
    }

    let namespace = metadata.get_string(type_def.namespace_index)?;
    out.push_str(&format!("\n// Namespace: {namespace}\n"));

    if config.dump_attribute {
        write_custom_attributes(
            executor,
            out,
            image_index,
            type_def.custom_attribute_index,
            type_def.token,
            "",
        );
        if type_def.flags & type_attributes::SERIALIZABLE != 0 {
            out.push_str("[Serializable]\n");
        }
    }

    out.push_str(type_visibility(type_def.flags));

    let flags = type_def.flags;
    if flags & type_attributes::ABSTRACT != 0 && flags & type_attributes::SEALED != 0 {
        out.push_str("static ");
    } else if flags & type_attributes::INTERFACE == 0 && flags & type_attributes::ABSTRACT != 0 {
        out.push_str("abstract ");
    } else if !type_def.is_value_type()
        && !type_def.is_enum()
        && flags & type_attributes::SEALED != 0
    {
        out.push_str("sealed ");
    }

    if flags & type_attributes::INTERFACE != 0 {
        out.push_str("interface ");
    } else if type_def.is_enum() {
        out.push_str("enum ");
    } else if type_def.is_value_type() {
        out.push_str("struct ");
    } else {
        out.push_str("class ");
    }

    let type_name = executor.get_type_def_name(type_def_index, false, true);
    out.push_str(&type_name);

    if !extends.is_empty() {
        out.push_str(&format!(" : {}", extends.join(", ")));
    }

    if config.dump_type_def_index {
        out.push_str(&format!(" // TypeDefIndex: {type_def_index}\n{{"));
    } else {
        out.push_str("\n{");
    }

    if config.dump_field && type_def.field_count > 0 {
        dump_fields(executor, out, type_def_index, image_index, config)?;
    }
    if config.dump_property && type_def.property_count > 0 {
        dump_properties(executor, out, type_def_index, image_index, config)?;
    }
    if type_def.event_count > 0 {
        dump_events(executor, out, type_def_index)?;
    }
    if config.dump_method && type_def.method_count > 0 {
        dump_methods(executor, out, type_def_index, image_index, image_name, config)?;
    }
    if type_def.nested_type_count > 0 {
        dump_nested_types(executor, out, type_def_index)?;
    }

    out.push_str("}\n");
    Ok(())
}

fn dump_events(executor: &mut Executor, out: &mut String, type_def_index: usize) -> Result<()> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = &metadata.type_definitions[type_def_index];

    out.push_str("\n  // Events\n");
    let event_end = type_def.event_start + type_def.event_count as i32;
    for i in type_def.event_start..event_end {
        let event = metadata.events.get(i as usize).ok_or_else(|| {
            Error::corrupt_index("events", i as i64, metadata.events.len())
        })?;

        out.push_str("  ");
        // The add accessor carries the event's effective modifiers.
        if event.add >= 0 {
            let method_index = (type_def.method_start + event.add) as usize;
            if let Some(method) = metadata.methods.get(method_index) {
                out.push_str(&method_modifiers(method.flags));
            }
        }
        let event_type = runtime.type_at(event.type_index)?;
        let type_name = executor.get_type_name(*event_type, false, false);
        let event_name = metadata.get_string(event.name_index)?;
        out.push_str(&format!("event {type_name} {event_name};\n"));
    }
    Ok(())
}

fn dump_nested_types(executor: &mut Executor, out: &mut String, type_def_index: usize) -> Result<()> {
    let metadata = executor.metadata;
    let type_def = &metadata.type_definitions[type_def_index];

    out.push_str("\n  // Nested types\n");
    let nested_end = type_def.nested_types_start + type_def.nested_type_count as i32;
    for i in type_def.nested_types_start..nested_end {
        let slot = i as usize;
        let nested_index = *metadata.nested_type_indices.get(slot).ok_or_else(|| {
            Error::corrupt_index("nested_types", slot as i64, metadata.nested_type_indices.len())
        })?;
        if nested_index < 0 {
            continue;
        }
        let name = executor.get_type_def_name(nested_index as usize, false, true);
        out.push_str(&format!("  // {name}\n"));
    }
    Ok(())
}

fn dump_fields(
    executor: &mut Executor,
    out: &mut String,
    type_def_index: usize,
    image_index: usize,
    config: &DumpConfig,
) -> Result<()> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = &metadata.type_definitions[type_def_index];

    out.push_str("\n  // Fields\n");
    let field_end = type_def.field_start + type_def.field_count as i32;
    for i in type_def.field_start..field_end {
        let field = metadata.fields.get(i as usize).ok_or_else(|| {
            Error::corrupt_index("fields", i as i64, metadata.fields.len())
        })?;
        let field_type = runtime.type_at(field.type_index)?;
        let mut is_static = false;
        let mut is_const = false;

        if config.dump_attribute {
            write_custom_attributes(
                executor,
                out,
                image_index,
                field.custom_attribute_index,
                field.token,
                "  ",
            );
        }

        out.push_str("  ");
        out.push_str(field_visibility(field_type.attrs));

        if field_type.attrs & field_attributes::LITERAL != 0 {
            is_const = true;
            out.push_str("const ");
        } else {
            if field_type.attrs & field_attributes::STATIC != 0 {
                is_static = true;
                out.push_str("static ");
            }
            if field_type.attrs & field_attributes::INIT_ONLY != 0 {
                out.push_str("readonly ");
            }
        }

        let type_name = executor.get_type_name(*field_type, false, false);
        let field_name = metadata.get_string(field.name_index)?;
        out.push_str(&format!("{type_name} {field_name}"));

        if let Some(default) = metadata.field_default_value(i) {
            if default.data_index != -1 {
                let value = executor.default_value(default.type_index, default.data_index);
                match value {
                    DefaultValue::Unresolved(_) => out.push_str(&format!(" {value}")),
                    _ => out.push_str(&format!(" = {value}")),
                }
            }
        }

        if config.dump_field_offset && !is_const {
            let offset = runtime.field_offset(
                executor.binary,
                type_def_index,
                (i - type_def.field_start) as usize,
                i as usize,
                type_def.is_value_type(),
                is_static,
            );
            match offset {
                Some(offset) if offset >= 0 => {
                    out.push_str(&format!("; // 0x{offset:X}\n"));
                }
                _ => out.push_str("; // -1\n"),
            }
        } else {
            out.push_str(";\n");
        }
    }
    Ok(())
}

fn dump_properties(
    executor: &mut Executor,
    out: &mut String,
    type_def_index: usize,
    image_index: usize,
    config: &DumpConfig,
) -> Result<()> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = &metadata.type_definitions[type_def_index];

    out.push_str("\n  // Properties\n");
    let property_end = type_def.property_start + type_def.property_count as i32;
    for i in type_def.property_start..property_end {
        let property = metadata.properties.get(i as usize).ok_or_else(|| {
            Error::corrupt_index("properties", i as i64, metadata.properties.len())
        })?;

        if config.dump_attribute {
            write_custom_attributes(
                executor,
                out,
                image_index,
                property.custom_attribute_index,
                property.token,
                "  ",
            );
        }

        out.push_str("  ");

        // The property type comes from its getter's return or its
        // setter's value parameter.
        let property_type_name = if property.get >= 0 {
            let method_index = (type_def.method_start + property.get) as usize;
            let method = metadata.methods.get(method_index).ok_or_else(|| {
                Error::corrupt_index("methods", method_index as i64, metadata.methods.len())
            })?;
            out.push_str(&method_modifiers(method.flags));
            let property_type = runtime.type_at(method.return_type)?;
            executor.get_type_name(*property_type, false, false)
        } else if property.set >= 0 {
            let method_index = (type_def.method_start + property.set) as usize;
            let method = metadata.methods.get(method_index).ok_or_else(|| {
                Error::corrupt_index("methods", method_index as i64, metadata.methods.len())
            })?;
            out.push_str(&method_modifiers(method.flags));
            let parameter = metadata
                .parameters
                .get(method.parameter_start as usize)
                .ok_or_else(|| {
                    Error::corrupt_index(
                        "parameters",
                        method.parameter_start as i64,
                        metadata.parameters.len(),
                    )
                })?;
            let property_type = runtime.type_at(parameter.type_index)?;
            executor.get_type_name(*property_type, false, false)
        } else {
            "object".to_string()
        };

        let property_name = metadata.get_string(property.name_index)?;
        out.push_str(&format!("{property_type_name} {property_name} {{ "));
        if property.get >= 0 {
            out.push_str("get; ");
        }
        if property.set >= 0 {
            out.push_str("set; ");
        }
        out.push_str("}\n");
    }
    Ok(())
}

fn dump_methods(
    executor: &mut Executor,
    out: &mut String,
    type_def_index: usize,
    image_index: usize,
    image_name: &str,
    config: &DumpConfig,
) -> Result<()> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let type_def = &metadata.type_definitions[type_def_index];

    out.push_str("\n  // Methods\n");
    let method_end = type_def.method_start + type_def.method_count as i32;
    for i in type_def.method_start..method_end {
        out.push('\n');
        let method = metadata.methods.get(i as usize).ok_or_else(|| {
            Error::corrupt_index("methods", i as i64, metadata.methods.len())
        })?;
        let is_abstract = method.flags & method_attributes::ABSTRACT != 0;

        if config.dump_attribute {
            write_custom_attributes(
                executor,
                out,
                image_index,
                method.custom_attribute_index,
                method.token,
                "  ",
            );
        }

        if config.dump_method_offset {
            let pointer = executor.method_pointer(image_name, method);
            if !is_abstract && pointer > 0 {
                let rva = executor.rva(pointer);
                let offset = executor.file_offset(pointer).unwrap_or(0);
                out.push_str(&format!(
                    "  // RVA: 0x{rva:X} Offset: 0x{offset:X} VA: 0x{pointer:X}"
                ));
            } else {
                out.push_str("  // RVA: -1 Offset: -1");
            }
            if method.slot != 0xFFFF {
                out.push_str(&format!(" Slot: {}", method.slot));
            }
            out.push('\n');
        }

        out.push_str("  ");
        out.push_str(&method_modifiers(method.flags));

        let return_type = runtime.type_at(method.return_type)?;
        let mut method_name = metadata.get_string(method.name_index)?.to_string();
        if method.generic_container_index >= 0 {
            if let Some(container) = metadata
                .generic_containers
                .get(method.generic_container_index as usize)
            {
                method_name.push_str(&executor.generic_container_params(container));
            }
        }

        if return_type.byref {
            out.push_str("ref ");
        }
        let return_type_name = executor.get_type_name(*return_type, false, false);
        out.push_str(&format!("{return_type_name} {method_name}("));

        let mut rendered_params = Vec::with_capacity(method.parameter_count as usize);
        for j in 0..method.parameter_count as i32 {
            let parameter_index = method.parameter_start + j;
            let parameter = metadata.parameters.get(parameter_index as usize).ok_or_else(|| {
                Error::corrupt_index("parameters", parameter_index as i64, metadata.parameters.len())
            })?;
            rendered_params.push(render_parameter(executor, parameter, parameter_index)?);
        }
        out.push_str(&rendered_params.join(", "));

        if is_abstract {
            out.push_str(");\n");
        } else {
            out.push_str(") { }\n");
        }

        write_generic_instantiations(executor, out, i);
    }
    Ok(())
}

fn render_parameter(
    executor: &mut Executor,
    parameter: &Il2CppParameterDefinition,
    parameter_index: i32,
) -> Result<String> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let mut rendered = String::new();

    let parameter_name = metadata.get_string(parameter.name_index)?;
    let parameter_type = runtime.type_at(parameter.type_index)?;
    let attrs = parameter_type.attrs;

    if parameter_type.byref {
        if attrs & param_attributes::OUT != 0 && attrs & param_attributes::IN == 0 {
            rendered.push_str("out ");
        } else if attrs & param_attributes::OUT == 0 && attrs & param_attributes::IN != 0 {
            rendered.push_str("in ");
        } else {
            rendered.push_str("ref ");
        }
    } else {
        if attrs & param_attributes::IN != 0 {
            rendered.push_str("[In] ");
        }
        if attrs & param_attributes::OUT != 0 {
            rendered.push_str("[Out] ");
        }
    }

    let type_name = executor.get_type_name(*parameter_type, false, false);
    rendered.push_str(&format!("{type_name} {parameter_name}"));

    if let Some(default) = metadata.parameter_default_value(parameter_index) {
        if default.data_index != -1 {
            let value = executor.default_value(default.type_index, default.data_index);
            match value {
                DefaultValue::Unresolved(_) => rendered.push_str(&format!(" {value}")),
                _ => rendered.push_str(&format!(" = {value}")),
            }
        }
    }
    Ok(rendered)
}

/// Concrete generic instantiations of a method, grouped by their
/// compiled pointer.
fn write_generic_instantiations(executor: &mut Executor, out: &mut String, method_index: i32) {
    let runtime = executor.runtime;
    let Some(spec_indices) = runtime.method_specs_by_def.get(&method_index) else {
        return;
    };

    out.push_str("  /* GenericInstMethod :\n");
    let mut groups: std::collections::BTreeMap<u64, Vec<usize>> = std::collections::BTreeMap::new();
    for &spec_index in spec_indices {
        let pointer = runtime.spec_pointers.get(&spec_index).copied().unwrap_or(0);
        groups.entry(pointer).or_default().push(spec_index);
    }

    for (pointer, specs) in groups {
        out.push_str("  |\n");
        if pointer > 0 {
            let rva = executor.rva(pointer);
            let offset = executor.file_offset(pointer).unwrap_or(0);
            out.push_str(&format!(
                "  |-RVA: 0x{rva:X} Offset: 0x{offset:X} VA: 0x{pointer:X}\n"
            ));
        } else {
            out.push_str("  |-RVA: -1 Offset: -1\n");
        }
        for spec_index in specs {
            let (type_name, method_name) = executor.method_spec_name(spec_index, false);
            out.push_str(&format!("  |-{type_name}.{method_name}\n"));
        }
    }
    out.push_str("  */\n");
}

fn write_custom_attributes(
    executor: &mut Executor,
    out: &mut String,
    image_index: usize,
    legacy_index: i32,
    token: u32,
    padding: &str,
) {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    if runtime.version < 21.0 || runtime.version >= 29.0 {
        return;
    }

    let attr_index = metadata.custom_attribute_index(image_index, legacy_index, token);
    if attr_index < 0 {
        return;
    }
    let Some(pointer) = executor
        .custom_attribute_generators
        .get(attr_index as usize)
        .copied()
    else {
        return;
    };
    let rva = executor.rva(pointer);
    let offset = executor.file_offset(pointer).unwrap_or(0);

    let Some(range) = metadata.attribute_type_ranges.get(attr_index as usize) else {
        return;
    };
    for i in 0..range.count {
        let slot = (range.start + i) as usize;
        let Some(&type_index) = metadata.attribute_type_indices.get(slot) else {
            continue;
        };
        let Ok(attribute_type) = runtime.type_at(type_index) else {
            continue;
        };
        let name = executor.get_type_name(*attribute_type, false, false);
        out.push_str(&format!(
            "{padding}[{name}] // RVA: 0x{rva:X} Offset: 0x{offset:X} VA: 0x{pointer:X}\n"
        ));
    }
}

fn type_visibility(flags: u32) -> &'static str {
    match flags & type_attributes::VISIBILITY_MASK {
        type_attributes::PUBLIC | type_attributes::NESTED_PUBLIC => "public ",
        type_attributes::NOT_PUBLIC
        | type_attributes::NESTED_FAM_AND_ASSEM
        | type_attributes::NESTED_ASSEMBLY => "internal ",
        type_attributes::NESTED_PRIVATE => "private ",
        type_attributes::NESTED_FAMILY => "protected ",
        type_attributes::NESTED_FAM_OR_ASSEM => "protected internal ",
        _ => "",
    }
}

fn field_visibility(attrs: u16) -> &'static str {
    match attrs & field_attributes::FIELD_ACCESS_MASK {
        field_attributes::PRIVATE => "private ",
        field_attributes::PUBLIC => "public ",
        field_attributes::FAMILY => "protected ",
        field_attributes::ASSEMBLY | field_attributes::FAM_AND_ASSEM => "internal ",
        field_attributes::FAM_OR_ASSEM => "protected internal ",
        _ => "",
    }
}

fn method_modifiers(flags: u16) -> String {
    let mut out = String::new();
    match flags & method_attributes::MEMBER_ACCESS_MASK {
        method_attributes::PRIVATE => out.push_str("private "),
        method_attributes::PUBLIC => out.push_str("public "),
        method_attributes::FAMILY => out.push_str("protected "),
        method_attributes::ASSEMBLY | method_attributes::FAM_AND_ASSEM => {
            out.push_str("internal ")
        }
        method_attributes::FAM_OR_ASSEM => out.push_str("protected internal "),
        _ => {}
    }
    if flags & method_attributes::STATIC != 0 {
        out.push_str("static ");
    }
    if flags & method_attributes::ABSTRACT != 0 {
        out.push_str("abstract ");
        if flags & method_attributes::VTABLE_LAYOUT_MASK == 0 {
            out.push_str("override ");
        }
    } else if flags & method_attributes::FINAL != 0 {
        if flags & method_attributes::VTABLE_LAYOUT_MASK == 0 {
            out.push_str("sealed override ");
        }
    } else if flags & method_attributes::VIRTUAL != 0 {
        if flags & method_attributes::VTABLE_LAYOUT_MASK == method_attributes::NEW_SLOT {
            out.push_str("virtual ");
        } else {
            out.push_str("override ");
        }
    }
    if flags & method_attributes::PINVOKE_IMPL != 0 {
        out.push_str("extern ");
    }
    out
}
