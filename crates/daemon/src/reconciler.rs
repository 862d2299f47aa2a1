//! Peer reconciliation loop
//!
//! Each pass reads every node record and the device's live peer table,
//! diffs them and applies the difference as one update. Nothing is cached
//! between passes, so a failed pass is repaired by the next one.

use crate::device::{DeviceControl, PeerChange, PeerConfig, PeerState};
use ipnetwork::IpNetwork;
use meshconf_common::{NodeRecord, NodeStore, PublicKey};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reconciler that keeps the device's peers in line with the node store
pub struct Reconciler {
    store: NodeStore,
    device: Arc<dyn DeviceControl>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(store: NodeStore, device: Arc<dyn DeviceControl>, interval: Duration) -> Self {
        Self {
            store,
            device,
            interval,
        }
    }

    /// Run the reconciliation loop
    pub async fn run(&self) {
        info!("Reconciler started, interval {:?}", self.interval);

        loop {
            if let Err(e) = self.reconcile_once().await {
                error!("Reconciliation error: {}", e);
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Changes that would bring the device in line right now
    pub async fn plan(&self) -> meshconf_common::Result<Vec<PeerChange>> {
        let (nodes, default) = self.store.get_all().await?;
        let peers = self.device.list_peers().await?;
        debug!("Diffing {} nodes against {} peers", nodes.len(), peers.len());
        Ok(compute_peer_changes(nodes, &default, &peers))
    }

    /// One fetch, diff and apply pass; returns the number of changes applied
    pub async fn reconcile_once(&self) -> meshconf_common::Result<usize> {
        let changes = self.plan().await?;
        if changes.is_empty() {
            debug!("Peers up to date");
            return Ok(0);
        }

        self.device.apply(&changes).await?;
        info!("Updated {} peers", changes.len());
        Ok(changes.len())
    }
}

/// Diff the desired node set against the device's current peers.
///
/// Current peers come first, in device order, as removals or replacements;
/// nodes without a peer follow as additions in key order.
pub fn compute_peer_changes(
    mut desired: BTreeMap<String, NodeRecord>,
    default: &NodeRecord,
    current: &[PeerState],
) -> Vec<PeerChange> {
    let mut changes = Vec::new();

    for peer in current {
        let Some(node) = desired.remove(&peer.public_key.to_store_key()) else {
            changes.push(PeerChange::Remove {
                public_key: peer.public_key,
            });
            continue;
        };

        let wanted = peer_config(peer.public_key, &node, default);
        if !same_ranges(&wanted.allowed_ips, &peer.allowed_ips) || wanted.keepalive != peer.keepalive {
            changes.push(PeerChange::Replace(wanted));
        }
    }

    for (key, node) in desired {
        match PublicKey::from_store_key(&key) {
            Ok(public_key) => changes.push(PeerChange::Add(peer_config(public_key, &node, default))),
            Err(e) => warn!("Skipping node {:?}: not a public key ({})", key, e),
        }
    }

    changes
}

fn peer_config(public_key: PublicKey, node: &NodeRecord, default: &NodeRecord) -> PeerConfig {
    let keepalive = node
        .keepalive()
        .or_else(|| default.keepalive())
        .unwrap_or(Duration::ZERO);

    PeerConfig {
        public_key,
        allowed_ips: node.allowed_ranges(),
        keepalive,
        replace_allowed_ips: true,
    }
}

fn same_ranges(a: &[IpNetwork], b: &[IpNetwork]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(range_order);
    b.sort_by(range_order);
    a == b
}

/// Address bytes descending, then mask bytes descending
fn range_order(a: &IpNetwork, b: &IpNetwork) -> Ordering {
    addr_bytes(b.ip())
        .cmp(&addr_bytes(a.ip()))
        .then_with(|| addr_bytes(b.mask()).cmp(&addr_bytes(a.mask())))
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshconf_common::{Error, KeyValue, KvBackend, MemoryKv};
    use parking_lot::Mutex;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; 32]).unwrap()
    }

    fn net(text: &str) -> IpNetwork {
        text.parse().unwrap()
    }

    fn node(range4: Option<&str>, range6: Option<&str>, keepalive: Option<u64>) -> NodeRecord {
        NodeRecord {
            id: Some(1),
            range4: range4.map(str::to_string),
            range6: range6.map(str::to_string),
            wg_keepalive: keepalive,
            ..Default::default()
        }
    }

    fn peer(public_key: PublicKey, ranges: &[&str], keepalive: u64) -> PeerState {
        PeerState {
            public_key,
            allowed_ips: ranges.iter().map(|r| net(r)).collect(),
            keepalive: Duration::from_secs(keepalive),
        }
    }

    /// Device whose peer table follows the applied changes
    #[derive(Default)]
    struct FakeDevice {
        peers: Mutex<Vec<PeerState>>,
        applied: Mutex<Vec<Vec<PeerChange>>>,
        fail_apply: Mutex<bool>,
    }

    #[async_trait]
    impl DeviceControl for FakeDevice {
        async fn list_peers(&self) -> meshconf_common::Result<Vec<PeerState>> {
            Ok(self.peers.lock().clone())
        }

        async fn apply(&self, changes: &[PeerChange]) -> meshconf_common::Result<()> {
            if *self.fail_apply.lock() {
                return Err(Error::Device("device busy".into()));
            }
            let mut peers = self.peers.lock();
            for change in changes {
                match change {
                    PeerChange::Remove { public_key } => peers.retain(|p| p.public_key != *public_key),
                    PeerChange::Replace(cfg) | PeerChange::Add(cfg) => {
                        let state = PeerState {
                            public_key: cfg.public_key,
                            allowed_ips: cfg.allowed_ips.clone(),
                            keepalive: cfg.keepalive,
                        };
                        match peers.iter_mut().find(|p| p.public_key == cfg.public_key) {
                            Some(existing) => *existing = state,
                            None => peers.push(state),
                        }
                    }
                }
            }
            self.applied.lock().push(changes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_replace_with_default_keepalive() {
        let a = key(0xa);
        let mut desired = BTreeMap::new();
        desired.insert(a.to_store_key(), node(Some("10.0.0.1/32"), Some("::/128"), None));
        let default = NodeRecord {
            wg_keepalive: Some(25),
            ..Default::default()
        };
        let current = vec![peer(a, &["10.0.0.2/32"], 0)];

        let changes = compute_peer_changes(desired, &default, &current);
        assert_eq!(changes.len(), 1);
        let PeerChange::Replace(cfg) = &changes[0] else {
            panic!("expected replace, got {:?}", changes[0]);
        };
        assert_eq!(cfg.public_key, a);
        assert!(same_ranges(&cfg.allowed_ips, &[net("10.0.0.1/32"), net("::/128")]));
        assert_eq!(cfg.keepalive, Duration::from_secs(25));
        assert!(cfg.replace_allowed_ips);
    }

    #[test]
    fn test_unknown_peer_is_removed() {
        let b = key(0xb);
        let changes = compute_peer_changes(
            BTreeMap::new(),
            &NodeRecord::default(),
            &[peer(b, &["10.0.0.8/29"], 25)],
        );
        assert_eq!(changes, vec![PeerChange::Remove { public_key: b }]);
    }

    #[test]
    fn test_new_node_is_added() {
        let c = key(0xc);
        let mut desired = BTreeMap::new();
        desired.insert(c.to_store_key(), node(Some("10.0.4.0/22"), None, Some(0)));
        let default = NodeRecord {
            wg_keepalive: Some(25),
            ..Default::default()
        };

        let changes = compute_peer_changes(desired, &default, &[]);
        assert_eq!(
            changes,
            vec![PeerChange::Add(PeerConfig {
                public_key: c,
                allowed_ips: vec![net("10.0.4.0/22")],
                // zero is disabled, not unset
                keepalive: Duration::ZERO,
                replace_allowed_ips: true,
            })]
        );
    }

    #[test]
    fn test_node_without_ranges_is_added_empty() {
        let c = key(0xc);
        let mut desired = BTreeMap::new();
        desired.insert(c.to_store_key(), node(None, None, None));

        let changes = compute_peer_changes(desired, &NodeRecord::default(), &[]);
        let PeerChange::Add(cfg) = &changes[0] else {
            panic!("expected add");
        };
        assert!(cfg.allowed_ips.is_empty());
        assert_eq!(cfg.keepalive, Duration::ZERO);
    }

    #[test]
    fn test_order_independent() {
        let a = key(0xa);
        let mut desired = BTreeMap::new();
        desired.insert(a.to_store_key(), node(Some("10.0.0.1/32"), Some("fd00::/64"), Some(25)));

        let forward = peer(a, &["10.0.0.1/32", "fd00::/64"], 25);
        let reversed = peer(a, &["fd00::/64", "10.0.0.1/32"], 25);

        assert!(compute_peer_changes(desired.clone(), &NodeRecord::default(), &[forward]).is_empty());
        assert!(compute_peer_changes(desired, &NodeRecord::default(), &[reversed]).is_empty());
    }

    #[test]
    fn test_same_network_in_both_ranges_settles() {
        let a = key(0xa);
        let mut desired = BTreeMap::new();
        desired.insert(
            a.to_store_key(),
            node(Some("fd00::1/64"), Some("fd00::/64"), Some(25)),
        );

        let changes = compute_peer_changes(desired.clone(), &NodeRecord::default(), &[]);
        let PeerChange::Add(cfg) = &changes[0] else {
            panic!("expected add");
        };
        assert_eq!(cfg.allowed_ips, vec![net("fd00::/64")]);

        // the device keeps the network once
        let current = [peer(a, &["fd00::/64"], 25)];
        assert!(compute_peer_changes(desired, &NodeRecord::default(), &current).is_empty());
    }

    #[test]
    fn test_node_keepalive_beats_default() {
        let a = key(0xa);
        let mut desired = BTreeMap::new();
        desired.insert(a.to_store_key(), node(Some("10.0.0.1/32"), None, Some(10)));
        let default = NodeRecord {
            wg_keepalive: Some(25),
            ..Default::default()
        };

        let changes = compute_peer_changes(desired, &default, &[peer(a, &["10.0.0.1/32"], 25)]);
        let PeerChange::Replace(cfg) = &changes[0] else {
            panic!("expected replace");
        };
        assert_eq!(cfg.keepalive, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_desired_key_skipped() {
        let mut desired = BTreeMap::new();
        desired.insert("not-a-key".to_string(), node(Some("10.0.0.1/32"), None, None));
        desired.insert(key(1).to_store_key(), node(Some("10.0.0.2/32"), None, None));

        let changes = compute_peer_changes(desired, &NodeRecord::default(), &[]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].public_key(), &key(1));
    }

    #[test]
    fn test_mixed_changes_order() {
        let (a, b, c) = (key(0xa), key(0xb), key(0xc));
        let mut desired = BTreeMap::new();
        desired.insert(a.to_store_key(), node(Some("10.0.0.1/32"), None, None));
        desired.insert(c.to_store_key(), node(Some("10.0.0.3/32"), None, None));
        let current = vec![peer(b, &[], 0), peer(a, &["10.0.0.9/32"], 0)];

        let changes = compute_peer_changes(desired, &NodeRecord::default(), &current);
        assert!(matches!(&changes[0], PeerChange::Remove { public_key } if *public_key == b));
        assert!(matches!(&changes[1], PeerChange::Replace(cfg) if cfg.public_key == a));
        assert!(matches!(&changes[2], PeerChange::Add(cfg) if cfg.public_key == c));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_range_order_is_descending() {
        let mut ranges = vec![net("10.0.0.1/32"), net("10.0.0.9/32"), net("10.0.0.9/24")];
        ranges.sort_by(range_order);
        assert_eq!(ranges, vec![net("10.0.0.9/32"), net("10.0.0.9/24"), net("10.0.0.1/32")]);
    }

    async fn store_with(nodes: &[(PublicKey, &str)]) -> NodeStore {
        let kv = Arc::new(MemoryKv::new());
        let mut puts = vec![KeyValue::new("/config/default/wg_keepalive", "25")];
        for (i, (public_key, range4)) in nodes.iter().enumerate() {
            let prefix = format!("/config/{}/", public_key.to_store_key());
            puts.push(KeyValue::new(format!("{prefix}id"), (i + 1).to_string()));
            puts.push(KeyValue::new(format!("{prefix}range4"), *range4));
        }
        kv.put_all(puts).await.unwrap();
        NodeStore::new(kv).unwrap()
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let store = store_with(&[(key(1), "10.0.4.0/22"), (key(2), "10.0.8.0/22")]).await;
        let device = Arc::new(FakeDevice::default());
        device.peers.lock().push(peer(key(9), &["10.0.0.0/8"], 0));
        device.peers.lock().push(peer(key(1), &["10.0.4.0/24"], 25));

        let reconciler = Reconciler::new(store, device.clone(), Duration::from_secs(60));
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 3);
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
        assert!(reconciler.plan().await.unwrap().is_empty());

        let peers = device.peers.lock().clone();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| p.keepalive == Duration::from_secs(25)));
        assert_eq!(device.applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_apply_is_retried_next_pass() {
        let store = store_with(&[(key(1), "10.0.4.0/22")]).await;
        let device = Arc::new(FakeDevice::default());
        *device.fail_apply.lock() = true;

        let reconciler = Reconciler::new(store, device.clone(), Duration::from_secs(60));
        assert!(reconciler.reconcile_once().await.is_err());
        assert!(device.peers.lock().is_empty());

        *device.fail_apply.lock() = false;
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 1);
        assert_eq!(device.peers.lock()[0].public_key, key(1));
    }
}
