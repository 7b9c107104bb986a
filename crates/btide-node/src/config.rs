//! Node configuration (`SPEC_FULL.md` §4.9), loaded from a TOML file
//! the way a `ConfigFile` type loads `config.toml`.

use std::fs;
use std::path::Path;

use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "btide.toml";

/// Deployment-wide settings: bind address, peer/package bounds, and
/// the negotiated wire frame size.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bind_port: u16,
    pub npeers_max: usize,
    pub payload_max: usize,
    pub manifest_dir: String,
    pub handshake_timeout_ms: u64,
    pub recv_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_port: 9000,
            npeers_max: 32,
            payload_max: btide_wire::DEFAULT_PAYLOAD_MAX,
            manifest_dir: "manifests".to_owned(),
            handshake_timeout_ms: 3_000,
            recv_timeout_ms: 3_000,
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub fn exists(dir: &Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = fs::read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;
        toml::from_str(&content).wrap_err_with(|| format!("failed to parse {path:?}"))
    }

    pub fn save(&self, dir: &Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self).wrap_err("failed to serialize configuration")?;
        fs::write(&path, content).wrap_err_with(|| format!("failed to write configuration to {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let cfg = NodeConfig::default();
        let dir = tempfile::tempdir().unwrap();
        cfg.save(dir.path()).unwrap();
        assert!(NodeConfig::exists(dir.path()));
        let loaded = NodeConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.bind_port, cfg.bind_port);
        assert_eq!(loaded.npeers_max, cfg.npeers_max);
        assert_eq!(loaded.payload_max, cfg.payload_max);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!NodeConfig::exists(dir.path()));
        assert!(NodeConfig::load(dir.path()).is_err());
    }
}
