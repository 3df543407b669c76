//! TOML file configuration for the node binary.
//!
//! Values from the file are applied over the built-in defaults;
//! command-line flags win over both.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use bdn_config::{NetworkNum, NodeModel};
use bdn_network::NetworkConfig;

/// Optional settings read from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_addr: Option<IpAddr>,
    pub listen_port: Option<u16>,
    pub network_num: Option<NetworkNum>,
    pub node_model: Option<NodeModel>,
    pub peers: Option<Vec<SocketAddr>>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Applies the file's settings over `base`.
    pub fn apply(self, mut base: NetworkConfig) -> NetworkConfig {
        if let Some(addr) = self.listen_addr {
            base.listen_addr = addr;
        }
        if let Some(port) = self.listen_port {
            base.listen_port = port;
        }
        if let Some(network_num) = self.network_num {
            base.network_num = network_num;
        }
        if let Some(model) = self.node_model {
            base.node_model = model;
        }
        if let Some(peers) = self.peers {
            base.outbound_peers = peers;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_and_apply() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be ok");
        writeln!(
            file,
            "listen_port = 7100\nnetwork_num = 5\nnode_model = \"Gateway\"\npeers = [\"10.0.0.1:9001\"]"
        )
        .expect("write should be ok");

        let loaded = FileConfig::load(file.path()).expect("load should be ok");
        let config = loaded.apply(NetworkConfig::default());
        assert_eq!(config.listen_port, 7100);
        assert_eq!(config.network_num, 5);
        assert_eq!(config.node_model, NodeModel::Gateway);
        assert_eq!(config.outbound_peers.len(), 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be ok");
        writeln!(file, "listen_prot = 7100").expect("write should be ok");
        assert!(FileConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_empty_file_keeps_defaults() {
        let file = tempfile::NamedTempFile::new().expect("temp file should be ok");
        let loaded = FileConfig::load(file.path()).expect("load should be ok");
        let config = loaded.apply(NetworkConfig::default());
        assert_eq!(config.listen_port, NetworkConfig::default().listen_port);
    }
}
