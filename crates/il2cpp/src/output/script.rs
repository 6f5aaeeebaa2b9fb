//! script.json and stringliteral.json writers
//!
//! The script file feeds disassembler annotation scripts; field names are
//! part of that contract. Method records are sorted by ascending address
//! and the flat address list is deduplicated.

use crate::executor::Executor;
use crate::structures::{method_attributes, usage_kind};
use cildump_core::{Error, Result};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Default, Serialize)]
pub struct ScriptJson {
    #[serde(rename = "ScriptMethod")]
    pub script_method: Vec<ScriptMethod>,
    #[serde(rename = "ScriptString")]
    pub script_string: Vec<ScriptString>,
    #[serde(rename = "ScriptMetadata")]
    pub script_metadata: Vec<ScriptMetadata>,
    #[serde(rename = "ScriptMetadataMethod")]
    pub script_metadata_method: Vec<ScriptMetadataMethod>,
    #[serde(rename = "Addresses")]
    pub addresses: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub struct ScriptMethod {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Signature")]
    pub signature: String,
    #[serde(rename = "TypeSignature")]
    pub type_signature: String,
}

#[derive(Debug, Serialize)]
pub struct ScriptString {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct ScriptMetadata {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ScriptMetadataMethod {
    #[serde(rename = "Address")]
    pub address: u64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MethodAddress")]
    pub method_address: u64,
}

/// Build script.json
pub fn write_script_json(executor: &mut Executor) -> Result<Vec<u8>> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;
    let mut script = ScriptJson::default();
    let mut addresses: BTreeSet<u64> = BTreeSet::new();

    for image in &metadata.images {
        let image_name = metadata.get_string(image.name_index)?.to_string();
        let type_end = image.type_start + image.type_count as i32;

        for type_def_index in image.type_start..type_end {
            if type_def_index < 0 {
                continue;
            }
            let type_def = metadata
                .type_definitions
                .get(type_def_index as usize)
                .ok_or_else(|| {
                    Error::corrupt_index(
                        "type_definitions",
                        type_def_index as i64,
                        metadata.type_definitions.len(),
                    )
                })?;
            let type_name = executor.get_type_def_name(type_def_index as usize, true, false);

            let method_end = type_def.method_start + type_def.method_count as i32;
            for method_index in type_def.method_start..method_end {
                let Some(method) = metadata.methods.get(method_index as usize) else {
                    continue;
                };
                if method.flags & method_attributes::ABSTRACT != 0 {
                    continue;
                }
                let pointer = executor.method_pointer(&image_name, method);
                if pointer == 0 {
                    continue;
                }

                let rva = executor.rva(pointer);
                addresses.insert(rva);

                let method_name = metadata.get_string(method.name_index)?.to_string();
                let signature = method_signature(executor, method)?;
                script.script_method.push(ScriptMethod {
                    address: rva,
                    name: method_name,
                    signature: signature.clone(),
                    type_signature: type_name.clone(),
                });

                // Every compiled generic instantiation gets its own entry.
                if let Some(spec_indices) = runtime.method_specs_by_def.get(&method_index) {
                    for &spec_index in spec_indices {
                        let spec_pointer =
                            runtime.spec_pointers.get(&spec_index).copied().unwrap_or(0);
                        if spec_pointer == 0 {
                            continue;
                        }
                        let spec_rva = executor.rva(spec_pointer);
                        if !addresses.insert(spec_rva) {
                            continue;
                        }
                        let (spec_type_name, spec_method_name) =
                            executor.method_spec_name(spec_index, true);
                        script.script_method.push(ScriptMethod {
                            address: spec_rva,
                            name: spec_method_name,
                            signature: signature.clone(),
                            type_signature: spec_type_name,
                        });
                    }
                }
            }
        }
    }

    if runtime.version < 27.0 {
        add_metadata_usages(executor, &mut script)?;
    }

    script.script_method.sort_by(|a, b| {
        a.address
            .cmp(&b.address)
            .then_with(|| a.name.cmp(&b.name))
    });
    script.addresses = addresses.into_iter().collect();

    serde_json::to_vec_pretty(&script)
        .map_err(|e| Error::malformed_metadata(format!("script.json serialization: {e}")))
}

/// Runtime usage slots annotated with what the runtime will store there
fn add_metadata_usages(executor: &mut Executor, script: &mut ScriptJson) -> Result<()> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;

    for (&kind, slots) in metadata.usage_map() {
        for (&destination, &source) in slots {
            let Some(&address) = runtime.metadata_usages.get(destination as usize) else {
                continue;
            };
            if address == 0 {
                continue;
            }
            let rva = executor.rva(address);

            match kind {
                usage_kind::TYPE_INFO => {
                    let name = executor.get_type_def_name(source as usize, true, true);
                    script.script_metadata.push(ScriptMetadata {
                        address: rva,
                        name: format!("{name}_TypeInfo"),
                    });
                }
                usage_kind::IL2CPP_TYPE => {
                    let Ok(ty) = runtime.type_at(source as i32) else {
                        continue;
                    };
                    let name = executor.get_type_name(*ty, true, false);
                    script.script_metadata.push(ScriptMetadata {
                        address: rva,
                        name: format!("{name}_Type"),
                    });
                }
                usage_kind::METHOD_DEF => {
                    let Some(method) = metadata.methods.get(source as usize) else {
                        continue;
                    };
                    let type_name =
                        executor.get_type_def_name(method.declaring_type.max(0) as usize, true, true);
                    let method_name = metadata.get_string(method.name_index)?;
                    script.script_metadata_method.push(ScriptMetadataMethod {
                        address: rva,
                        name: format!("{type_name}.{method_name}"),
                        method_address: 0,
                    });
                }
                usage_kind::STRING_LITERAL => {
                    let Ok(value) = metadata.get_string_literal(source as usize) else {
                        continue;
                    };
                    script.script_string.push(ScriptString {
                        address: rva,
                        value,
                    });
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn method_signature(
    executor: &mut Executor,
    method: &crate::structures::Il2CppMethodDefinition,
) -> Result<String> {
    let metadata = executor.metadata;
    let runtime = executor.runtime;

    let return_type = runtime.type_at(method.return_type)?;
    let return_type_name = executor.get_type_name(*return_type, false, false);
    let method_name = metadata.get_string(method.name_index)?;

    let mut parameters = Vec::with_capacity(method.parameter_count as usize);
    for j in 0..method.parameter_count as i32 {
        let index = (method.parameter_start + j) as usize;
        let Some(parameter) = metadata.parameters.get(index) else {
            continue;
        };
        let parameter_type = runtime.type_at(parameter.type_index)?;
        let type_name = executor.get_type_name(*parameter_type, false, false);
        let name = metadata.get_string(parameter.name_index)?;
        parameters.push(format!("{type_name} {name}"));
    }

    Ok(format!(
        "{return_type_name} {method_name}({})",
        parameters.join(", ")
    ))
}

#[derive(Debug, Serialize)]
struct StringLiteralEntry {
    index: usize,
    offset: u32,
    length: u32,
    value: String,
}

/// Build stringliteral.json, ascending by index
pub fn write_string_literals(executor: &Executor) -> Result<Vec<u8>> {
    let metadata = executor.metadata;
    let mut entries = Vec::with_capacity(metadata.string_literals.len());
    for (index, literal) in metadata.string_literals.iter().enumerate() {
        let Ok(value) = metadata.get_string_literal(index) else {
            continue;
        };
        entries.push(StringLiteralEntry {
            index,
            offset: literal.data_index,
            length: literal.length,
            value,
        });
    }
    serde_json::to_vec_pretty(&entries)
        .map_err(|e| Error::malformed_metadata(format!("stringliteral.json serialization: {e}")))
}
