use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

/// Peer configuration, loaded from a TOML file:
///
/// ```toml
/// data_dir = "/var/lib/sporkfs"
/// mount_point = "/mnt/spork"
///
/// [peers]
/// all_peers = ["10.0.0.1:7340", "10.0.0.2:7340", "10.0.0.3:7340"]
/// this_peer = "10.0.0.1:7340"
/// redundancy = 2
/// data_dir = "/var/lib/sporkfs/raft"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub mount_point: PathBuf,
    pub peers: PeerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSettings {
    pub all_peers: Vec<String>,
    pub this_peer: String,
    pub redundancy: usize,
    /// Raft storage directory (entries / hardState / snapshot).
    pub data_dir: PathBuf,
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn write_default_config(path: &Path) -> anyhow::Result<()> {
        let sample = r#"data_dir = "/var/lib/sporkfs"
mount_point = "/mnt/spork"

[peers]
all_peers = ["10.0.0.1:7340", "10.0.0.2:7340", "10.0.0.3:7340"]
this_peer = "10.0.0.1:7340"
redundancy = 2
data_dir = "/var/lib/sporkfs/raft"
"#;
        std::fs::write(path, sample)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.peers.all_peers.is_empty() {
            bail!("peers.all_peers must not be empty");
        }
        if !self.peers.all_peers.contains(&self.peers.this_peer) {
            bail!(
                "peers.this_peer ({}) must be one of peers.all_peers",
                self.peers.this_peer
            );
        }
        if self.peers.redundancy == 0 || self.peers.redundancy > self.peers.all_peers.len() {
            bail!(
                "peers.redundancy must be between 1 and {}",
                self.peers.all_peers.len()
            );
        }
        Ok(())
    }

    /// Payloads this peer stores as a home peer.
    pub fn payload_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    /// Payloads cached as a non-home peer.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.peers.data_dir.clone()
    }

    /// The socket the peer endpoint binds.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.peers
            .this_peer
            .to_socket_addrs()
            .with_context(|| format!("resolving {}", self.peers.this_peer))?
            .next()
            .with_context(|| format!("no address for {}", self.peers.this_peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> anyhow::Result<Settings> {
        let settings: Settings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    #[test]
    fn test_parse_full_config() {
        let settings = parse(
            r#"
data_dir = "/tmp/spork"
mount_point = "/mnt/spork"

[peers]
all_peers = ["a:1", "b:1"]
this_peer = "b:1"
redundancy = 2
data_dir = "/tmp/spork/raft"
"#,
        )
        .unwrap();

        assert_eq!(settings.peers.redundancy, 2);
        assert_eq!(settings.payload_dir(), PathBuf::from("/tmp/spork/data"));
        assert_eq!(settings.cache_dir(), PathBuf::from("/tmp/spork/cache"));
        assert_eq!(settings.raft_dir(), PathBuf::from("/tmp/spork/raft"));
    }

    #[test]
    fn test_rejects_foreign_this_peer() {
        let result = parse(
            r#"
data_dir = "/tmp/spork"
mount_point = "/mnt/spork"

[peers]
all_peers = ["a:1", "b:1"]
this_peer = "c:1"
redundancy = 1
data_dir = "/tmp/spork/raft"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_bad_redundancy() {
        let result = parse(
            r#"
data_dir = "/tmp/spork"
mount_point = "/mnt/spork"

[peers]
all_peers = ["a:1"]
this_peer = "a:1"
redundancy = 2
data_dir = "/tmp/spork/raft"
"#,
        );
        assert!(result.is_err());
    }
}
