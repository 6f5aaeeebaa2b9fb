//! IL2CPP dumper core
//!
//! Reconstructs C#-level type and method information from a Unity IL2CPP
//! build: an executable image plus its `global-metadata.dat`. The
//! pipeline is strictly linear: metadata tables, then binary loading and
//! registration location, then the type-graph executor, then the output
//! writers. No stage calls back upstream and nothing is mutated once
//! built.

pub mod executor;
pub mod metadata;
pub mod output;
pub mod registration;
pub mod search;
pub mod stream;
pub mod structures;

pub use executor::Executor;
pub use metadata::Metadata;
pub use registration::Runtime;
pub use search::{Located, SearchCounts};

use cildump_core::{Artifacts, DumpConfig, Error, Result};
use tracing::info;

/// Run the full dump pipeline over in-memory inputs.
///
/// The returned artifact map holds `dump.cs`, `il2cpp.h` and, when
/// enabled, `script.json` and `stringliteral.json`. Output bytes are a
/// pure function of `(binary, metadata, config)`.
pub fn dump(binary: &[u8], metadata: &[u8], config: &DumpConfig) -> Result<Artifacts> {
    let metadata = Metadata::parse(metadata, config.force_version)?;
    let binary = cildump_binary_parser::parse_binary(binary).map_err(Error::from)?;

    let version = config.force_il2cpp_version.unwrap_or(metadata.version);
    let counts = SearchCounts {
        methods: metadata.method_pointer_count(),
        type_defs: metadata.type_definitions.len(),
        images: metadata.images.len(),
        usages: metadata.usages_count,
    };
    let located = search::locate(binary.as_ref(), version, &counts)?;
    let runtime = Runtime::read(
        binary.as_ref(),
        located.version,
        located.code_registration,
        located.metadata_registration,
        &metadata,
    )?;

    let mut executor = Executor::new(&metadata, &runtime, binary.as_ref());

    let mut artifacts = Artifacts::new();
    artifacts.insert(
        "dump.cs".to_string(),
        output::decompiler::write_dump_cs(&mut executor, config)?.into_bytes(),
    );
    artifacts.insert(
        "il2cpp.h".to_string(),
        output::header::write_header(&mut executor)?.into_bytes(),
    );
    if config.generate_script {
        artifacts.insert(
            "script.json".to_string(),
            output::script::write_script_json(&mut executor)?,
        );
        artifacts.insert(
            "stringliteral.json".to_string(),
            output::script::write_string_literals(&executor)?,
        );
    }

    info!(files = artifacts.len(), "dump complete");
    Ok(artifacts)
}
