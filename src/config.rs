/// `config.rs` — bridge configuration
///
/// Stored as JSON next to the patch or passed on the command line.
/// Every field has a default, so `{}` is a valid configuration.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{BridgeError, Result},
    host::FsResolver,
    scripting::sandbox::TrustLevel,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Standard libraries loaded into each execution context.
    pub trust: TrustLevel,
    /// Directories searched, in order, for script files.
    pub search_paths: Vec<PathBuf>,
    /// `env_logger` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            trust: TrustLevel::Basic,
            search_paths: Vec::new(),
            log_filter: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn resolver(&self) -> FsResolver {
        FsResolver::new(self.search_paths.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = BridgeConfig::from_json("{}").unwrap();
        assert_eq!(config.trust, TrustLevel::Basic);
        assert!(config.search_paths.is_empty());
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn parses_fields() {
        let config = BridgeConfig::from_json(
            r#"{ "trust": "file_read", "search_paths": ["/patches"], "log_filter": "debug" }"#,
        )
        .unwrap();
        assert_eq!(config.trust, TrustLevel::FileRead);
        assert_eq!(config.search_paths, vec![PathBuf::from("/patches")]);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn rejects_unknown_trust_level() {
        let err = BridgeConfig::from_json(r#"{ "trust": "root" }"#).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
