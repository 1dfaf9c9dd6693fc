//! Code generator configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::jit::label::{MAX_LABEL_USES, MIN_LABEL_USES};

/// How a function body is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// Interpreter only
    Off,
    /// Always compile; a translation error is fatal
    On,
    /// Compile when the host can run generated code, else interpret
    #[default]
    Auto,
}

/// Translation settings, loadable from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub mode: JitMode,
    /// Emit the inlined fast paths. When false every opcode calls its
    /// fallback routine.
    pub inline_fast_paths: bool,
    /// Backward branches taken before the scheduling hook runs.
    pub preempt_threshold: i32,
    /// Pending sites allowed per internal label, at least `MIN_LABEL_USES`.
    pub max_label_uses: usize,
    /// Pending sites allowed per bytecode branch target.
    pub max_branch_sites: usize,
    /// Store the bytecode pc into the frame before calls.
    pub update_pc: bool,
    /// Log every translated instruction.
    pub trace: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            mode: JitMode::Auto,
            inline_fast_paths: true,
            preempt_threshold: 1024,
            max_label_uses: MAX_LABEL_USES,
            max_branch_sites: 64,
            update_pc: true,
            trace: false,
        }
    }
}

impl JitConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let config: JitConfig =
            toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))?;
        if config.max_label_uses < MIN_LABEL_USES || config.max_branch_sites == 0 {
            return Err(format!(
                "label use bounds out of range: max_label_uses must be at least {}, \
                 max_branch_sites at least 1",
                MIN_LABEL_USES
            ));
        }
        Ok(config)
    }

    /// Every opcode through its fallback routine.
    pub fn generic() -> Self {
        Self {
            inline_fast_paths: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(config.inline_fast_paths);
        assert_eq!(config.preempt_threshold, 1024);
        assert_eq!(config.max_label_uses, 6);
        assert_eq!(config.max_branch_sites, 64);
        assert_eq!(config.mode, JitMode::Auto);
    }

    #[test]
    fn test_partial_toml() {
        let config = JitConfig::from_toml_str("inline_fast_paths = false\nmode = \"on\"\n").unwrap();
        assert!(!config.inline_fast_paths);
        assert_eq!(config.mode, JitMode::On);
        assert_eq!(config.preempt_threshold, 1024);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(JitConfig::from_toml_str("max_label_uses = 0").is_err());
        assert!(JitConfig::from_toml_str("max_branch_sites = 0").is_err());

        assert!(JitConfig::from_toml_str("preempt_threshold = \"x\"").is_err());
        assert!(JitConfig::from_toml_str("mode = \"sometimes\"").is_err());
    }

    #[test]
    fn test_label_bound_minimum() {
        let err = JitConfig::from_toml_str("max_label_uses = 2").unwrap_err();
        assert!(err.contains("label use bounds"), "{}", err);
        let config = JitConfig::from_toml_str("max_label_uses = 3").unwrap();
        assert_eq!(config.max_label_uses, MIN_LABEL_USES);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jit.toml");
        fs::write(&path, "preempt_threshold = 3\n").unwrap();
        assert_eq!(JitConfig::load(&path).unwrap().preempt_threshold, 3);
        assert!(JitConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
