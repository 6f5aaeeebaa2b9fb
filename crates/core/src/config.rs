//! Dump configuration
//!
//! A plain value threaded explicitly through every stage; the core keeps
//! no global state.

use serde::{Deserialize, Serialize};

/// Options controlling what the dumper emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Include methods in dump.cs
    pub dump_method: bool,
    /// Include fields in dump.cs
    pub dump_field: bool,
    /// Include properties in dump.cs
    pub dump_property: bool,
    /// Include custom attribute decoration lines
    pub dump_attribute: bool,
    /// Annotate field offsets
    pub dump_field_offset: bool,
    /// Annotate method VAs/RVAs
    pub dump_method_offset: bool,
    /// Annotate type definition indices
    pub dump_type_def_index: bool,
    /// Emit script.json and stringliteral.json
    pub generate_script: bool,
    /// Override the binary-side IL2CPP version
    pub force_il2cpp_version: Option<f64>,
    /// Override the detected metadata version
    pub force_version: Option<f64>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            dump_method: true,
            dump_field: true,
            dump_property: true,
            dump_attribute: true,
            dump_field_offset: true,
            dump_method_offset: true,
            dump_type_def_index: true,
            generate_script: true,
            force_il2cpp_version: None,
            force_version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_on() {
        let c = DumpConfig::default();
        assert!(c.dump_method && c.dump_field && c.dump_property);
        assert!(c.generate_script);
        assert!(c.force_il2cpp_version.is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: DumpConfig = serde_json::from_str(r#"{"dump_attribute": false}"#).unwrap();
        assert!(!c.dump_attribute);
        assert!(c.dump_method);
    }
}
