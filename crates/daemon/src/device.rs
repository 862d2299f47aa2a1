//! Tunnel device control
//!
//! Peers are read and updated through the WireGuard cross-platform UAPI
//! socket (`<socket_dir>/<device>.sock`). Keys travel hex encoded.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use meshconf_common::{Error, PublicKey, Result};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// A peer as currently configured on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub public_key: PublicKey,
    pub allowed_ips: Vec<IpNetwork>,
    /// Zero when keepalive is disabled
    pub keepalive: Duration,
}

impl PeerState {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            keepalive: Duration::ZERO,
        }
    }
}

/// Full peer configuration written to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub allowed_ips: Vec<IpNetwork>,
    pub keepalive: Duration,
    /// Drop every allowed range not listed in `allowed_ips`
    pub replace_allowed_ips: bool,
}

/// One step of a peer table update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    Remove { public_key: PublicKey },
    Replace(PeerConfig),
    Add(PeerConfig),
}

impl PeerChange {
    pub fn public_key(&self) -> &PublicKey {
        match self {
            PeerChange::Remove { public_key } => public_key,
            PeerChange::Replace(peer) | PeerChange::Add(peer) => &peer.public_key,
        }
    }
}

impl fmt::Display for PeerChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (action, peer) = match self {
            PeerChange::Remove { public_key } => return write!(f, "remove {public_key}"),
            PeerChange::Replace(peer) => ("replace", peer),
            PeerChange::Add(peer) => ("add", peer),
        };
        let ranges: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{action} {} allowed_ips=[{}] keepalive={}s",
            peer.public_key,
            ranges.join(", "),
            peer.keepalive.as_secs()
        )
    }
}

/// Read and update a device's peer table
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn list_peers(&self) -> Result<Vec<PeerState>>;

    /// Apply all changes as one update
    async fn apply(&self, changes: &[PeerChange]) -> Result<()>;
}

/// Device reached over its UAPI control socket
#[derive(Debug, Clone)]
pub struct UapiDevice {
    name: String,
    socket_path: PathBuf,
}

impl UapiDevice {
    pub fn new(name: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            socket_path: socket_path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn exchange(&self, request: &str) -> Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Device(format!("{}: connect {:?}: {}", self.name, self.socket_path, e))
        })?;
        stream.write_all(request.as_bytes()).await?;
        stream.shutdown().await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }
}

#[async_trait]
impl DeviceControl for UapiDevice {
    async fn list_peers(&self) -> Result<Vec<PeerState>> {
        let response = self.exchange("get=1\n\n").await?;
        let peers = parse_get_response(&response)?;
        debug!("{} has {} peers", self.name, peers.len());
        Ok(peers)
    }

    async fn apply(&self, changes: &[PeerChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let response = self.exchange(&format_set_request(changes)).await?;
        check_errno(&response)?;
        debug!("Applied {} peer changes to {}", changes.len(), self.name);
        Ok(())
    }
}

/// `set=1` request for `changes`, terminated by the blank line
pub fn format_set_request(changes: &[PeerChange]) -> String {
    let mut body = String::from("set=1\n");
    for change in changes {
        let _ = writeln!(body, "public_key={}", change.public_key().to_hex());
        match change {
            PeerChange::Remove { .. } => body.push_str("remove=true\n"),
            PeerChange::Replace(peer) | PeerChange::Add(peer) => {
                if peer.replace_allowed_ips {
                    body.push_str("replace_allowed_ips=true\n");
                }
                let _ = writeln!(
                    body,
                    "persistent_keepalive_interval={}",
                    peer.keepalive.as_secs()
                );
                for range in &peer.allowed_ips {
                    let _ = writeln!(body, "allowed_ip={range}");
                }
            }
        }
    }
    body.push('\n');
    body
}

/// Peers listed in a `get=1` response
pub fn parse_get_response(response: &str) -> Result<Vec<PeerState>> {
    let mut peers: Vec<PeerState> = Vec::new();

    for line in response.lines() {
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Device(format!("Malformed UAPI line {line:?}")));
        };

        match key {
            "public_key" => peers.push(PeerState::new(PublicKey::from_hex(value)?)),
            "allowed_ip" => {
                let peer = current_peer(&mut peers, line)?;
                let range = value
                    .parse::<IpNetwork>()
                    .map_err(|e| Error::Device(format!("Bad allowed_ip {value:?}: {e}")))?;
                peer.allowed_ips.push(range);
            }
            "persistent_keepalive_interval" => {
                let peer = current_peer(&mut peers, line)?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|e| Error::Device(format!("Bad keepalive {value:?}: {e}")))?;
                peer.keepalive = Duration::from_secs(secs);
            }
            "errno" => check_errno(line)?,
            // interface settings and per-peer counters
            _ => {}
        }
    }

    Ok(peers)
}

fn current_peer<'a>(peers: &'a mut [PeerState], line: &str) -> Result<&'a mut PeerState> {
    peers
        .last_mut()
        .ok_or_else(|| Error::Device(format!("{line:?} before any public_key")))
}

fn check_errno(response: &str) -> Result<()> {
    let errno = response
        .lines()
        .find_map(|line| line.strip_prefix("errno="))
        .ok_or_else(|| Error::Device(format!("UAPI response without errno: {:?}", response.trim())))?;

    if errno.trim() == "0" {
        Ok(())
    } else {
        Err(Error::Device(format!("UAPI request failed with errno={}", errno.trim())))
    }
}
