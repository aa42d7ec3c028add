//! Configuration file support for NOCTUA
//!
//! Allows the substrate to be described in a TOML file instead of hardcoded
//! node numbers: fabric geometry, the well-known server nodes, and the data
//! path used by the remote memory service.

use crate::error::{NoctuaError, NoctuaResult};
use crate::topology::{NodeId, NR_IO_NODES, NR_NODES};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fabric geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Number of NoC nodes to wire up.
    #[serde(default = "default_nnodes")]
    pub nnodes: usize,
}

fn default_nnodes() -> usize {
    NR_NODES
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            nnodes: default_nnodes(),
        }
    }
}

/// Well-known nodes hosting the system services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMap {
    /// Name server node.
    #[serde(default = "default_name_node")]
    pub name: NodeId,

    /// Shared memory server node.
    #[serde(default = "default_shm_node")]
    pub shm: NodeId,

    /// Semaphore server node.
    #[serde(default = "default_semaphore_node")]
    pub semaphore: NodeId,

    /// Message queue server node.
    #[serde(default = "default_mqueue_node")]
    pub mqueue: NodeId,

    /// Remote memory server nodes, one server per node.
    #[serde(default = "default_rmem_nodes")]
    pub rmem: Vec<NodeId>,
}

fn default_name_node() -> NodeId {
    0
}

fn default_shm_node() -> NodeId {
    1
}

fn default_semaphore_node() -> NodeId {
    2
}

fn default_mqueue_node() -> NodeId {
    3
}

fn default_rmem_nodes() -> Vec<NodeId> {
    vec![4]
}

impl Default for ServerMap {
    fn default() -> Self {
        Self {
            name: default_name_node(),
            shm: default_shm_node(),
            semaphore: default_semaphore_node(),
            mqueue: default_mqueue_node(),
            rmem: default_rmem_nodes(),
        }
    }
}

/// Data path used by the remote memory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RmemDataPath {
    /// One portal transfer per block.
    Portal,
    /// Chunked mailbox frames.
    Mailbox,
}

impl Default for RmemDataPath {
    fn default() -> Self {
        RmemDataPath::Portal
    }
}

/// Top-level substrate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstrateConfig {
    #[serde(default)]
    pub fabric: FabricConfig,

    #[serde(default)]
    pub servers: ServerMap,

    #[serde(default)]
    pub rmem_data_path: RmemDataPath,
}

impl SubstrateConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> NoctuaResult<Self> {
        let config: SubstrateConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> NoctuaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Checks that every service sits on a distinct, valid I/O node.
    pub fn validate(&self) -> NoctuaResult<()> {
        let servers = &self.servers;
        let mut nodes = vec![servers.name, servers.shm, servers.semaphore, servers.mqueue];
        nodes.extend_from_slice(&servers.rmem);

        for &node in &nodes {
            if node >= self.fabric.nnodes {
                return Err(NoctuaError::config(format!(
                    "server node {node} is outside the fabric"
                )));
            }
            if self.fabric.nnodes == NR_NODES && node >= NR_IO_NODES {
                return Err(NoctuaError::config(format!(
                    "server node {node} is not an I/O node"
                )));
            }
        }
        for (i, &node) in nodes.iter().enumerate() {
            if nodes[i + 1..].contains(&node) {
                return Err(NoctuaError::config(format!(
                    "server node {node} assigned twice"
                )));
            }
        }
        if servers.rmem.is_empty() {
            return Err(NoctuaError::config("no remote memory server configured"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SubstrateConfig::default().validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SubstrateConfig::from_toml(
            r#"
            [fabric]
            nnodes = 24

            [servers]
            name = 0
            shm = 1
            semaphore = 2
            mqueue = 3
            rmem = [4, 5]

            rmem_data_path = "mailbox"
            "#,
        )
        .unwrap();
        assert_eq!(config.servers.rmem, vec![4, 5]);
        assert_eq!(config.rmem_data_path, RmemDataPath::Mailbox);
    }

    #[test]
    fn test_duplicate_server_nodes_are_rejected() {
        let err = SubstrateConfig::from_toml(
            r#"
            [servers]
            shm = 2
            semaphore = 2
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, NoctuaError::Config(_)));
    }

    #[test]
    fn test_compute_node_servers_are_rejected() {
        let err = SubstrateConfig::from_toml(
            r#"
            [servers]
            shm = 9
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, NoctuaError::Config(_)));
    }
}
