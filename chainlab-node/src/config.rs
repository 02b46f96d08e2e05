//! Node settings
//!
//! Settings come from an optional TOML file. Command-line flags are applied
//! on top of it.

use anyhow::{Context, Result};
use chainlab_core::NodeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub node: NodeConfig,
    pub data_dir: PathBuf,
    /// Private key file; defaults to `wallet.key` in the data directory
    pub wallet_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            data_dir: PathBuf::from("./chainlab-data"),
            wallet_file: None,
            request_timeout_secs: 10,
        }
    }
}

impl NodeSettings {
    /// Read settings from `path`, or use defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Invalid config file {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn with_overrides(
        mut self,
        data_dir: Option<PathBuf>,
        difficulty: Option<usize>,
        peers: Vec<String>,
    ) -> Self {
        if let Some(data_dir) = data_dir {
            self.data_dir = data_dir;
        }
        if let Some(difficulty) = difficulty {
            self.node.chain.difficulty = difficulty;
        }
        for peer in peers {
            if !self.node.bootstrap_peers.contains(&peer) {
                self.node.bootstrap_peers.push(peer);
            }
        }
        self
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.wallet_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wallet.key"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
