//! Engine configuration.
//!
//! Loaded from a TOML file (`orca.toml`) or built in code. Every field has a
//! default, so an empty file is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for an [`Engine`](crate::jit::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of compile worker threads (None = half the available cores)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_workers: Option<usize>,
    /// Attach a generator that resolves symbols from the host process
    pub process_symbols: bool,
    /// Cap on bytes of JIT section memory (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<usize>,
    /// Log every published symbol at info level
    pub trace_jit: bool,
    /// Name of the library modules are added to by default
    #[serde(default = "default_main_library")]
    pub main_library: String,
    /// Operand stack bound enforced by the verifier
    #[serde(default = "default_max_stack")]
    pub max_stack: usize,
}

fn default_main_library() -> String {
    "main".to_string()
}

fn default_max_stack() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compile_workers: None,
            process_symbols: true,
            memory_limit: None,
            trace_jit: false,
            main_library: default_main_library(),
            max_stack: default_max_stack(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compile_workers == Some(0) {
            return Err(ConfigError::Invalid("compile_workers must be at least 1".into()));
        }
        if self.memory_limit == Some(0) {
            return Err(ConfigError::Invalid("memory_limit must be positive".into()));
        }
        if self.max_stack == 0 {
            return Err(ConfigError::Invalid("max_stack must be positive".into()));
        }
        if self.main_library.is_empty() {
            return Err(ConfigError::Invalid("main_library must not be empty".into()));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_parse_all_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
compile_workers = 3
process_symbols = false
memory_limit = 1048576
trace_jit = true
main_library = "app"
max_stack = 64
"#,
        )
        .unwrap();
        assert_eq!(config.compile_workers, Some(3));
        assert!(!config.process_symbols);
        assert_eq!(config.memory_limit, Some(1 << 20));
        assert!(config.trace_jit);
        assert_eq!(config.main_library, "app");
        assert_eq!(config.max_stack, 64);
    }

    #[test]
    fn test_invalid_values() {
        let err = EngineConfig::from_toml_str("compile_workers = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = EngineConfig::from_toml_str("main_library = \"\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = EngineConfig::from_toml_str("jit_threshold = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "trace_jit = true").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert!(config.trace_jit);

        let err = EngineConfig::load(Path::new("/nonexistent/orca.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = EngineConfig {
            memory_limit: Some(4096),
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("memory_limit = 4096"));
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
