//! Server and cell configuration, loaded from a small serde-friendly file
//! with manual `Default` impls rather than pulling in a config-loading
//! crate.

use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// One peer in the replicated cell, as configured (not as currently probed
/// -- that live state lives in [`crate::vote::PeerState`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: Uuid,
    /// Addresses to try in order, primary first.
    pub addrs: Vec<SocketAddr>,
}

/// A cell: the full membership list a server's beacon/quorum logic needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    pub name: String,
    pub peers: Vec<PeerConfig>,
}

impl CellConfig {
    /// Quorum size for `n` configured peers.
    pub fn quorum_size(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}

/// Top-level server configuration: this server's own identity plus its
/// cell membership and storage location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: Uuid,
    pub listen_addr: SocketAddr,
    pub database_dir: std::path::PathBuf,
    pub backend: crate::storage::BackendKind,
    pub cell: CellConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_id: Uuid::nil(),
            listen_addr: "127.0.0.1:4562".parse().unwrap(),
            database_dir: std::path::PathBuf::from("."),
            backend: crate::storage::BackendKind::Flat,
            cell: CellConfig { name: "localcell".to_string(), peers: vec![] },
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::error::CResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| crate::error::Error::Parse(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> crate::error::CResult<()> {
        let raw = serde_json::to_string_pretty(self).map_err(|e| crate::error::Error::Parse(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_size_is_strict_majority() {
        let cell = CellConfig { name: "c".into(), peers: vec![] };
        assert_eq!(cell.quorum_size(), 1);

        let three = CellConfig {
            name: "c".into(),
            peers: (0..3)
                .map(|_| PeerConfig { id: Uuid::new_v4(), addrs: vec!["127.0.0.1:1".parse().unwrap()] })
                .collect(),
        };
        assert_eq!(three.quorum_size(), 2);
    }
}
