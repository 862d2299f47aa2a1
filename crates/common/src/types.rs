//! Core types for meshconf

use crate::mapper::{Field, KvRecord};
use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Reserved node key holding the fallback values
pub const DEFAULT_NODE_KEY: &str = "default";

/// Highest concentrator index representable in the selection bitmask
pub const MAX_CONCENTRATORS: u64 = 64;

/// Per-node configuration stored below `<config prefix><node key>/`
///
/// Every field is independently present or absent; absence is distinct from
/// a zero value and is what lets a node inherit from the default record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: Option<u64>,
    /// JSON list of [`ConcentratorRecord`], kept opaque until requested
    pub concentrators: Option<Vec<u8>>,
    pub mtu: Option<u64>,
    pub retry: Option<u64>,
    /// Persistent keepalive in seconds, 0 disables it
    pub wg_keepalive: Option<u64>,
    pub range4: Option<String>,
    pub range6: Option<String>,
    pub address4: Option<String>,
    pub address6: Option<String>,
    /// Space separated, 1-based concentrator indices
    pub selected_concentrators: Option<String>,
}

impl KvRecord for NodeRecord {
    const FIELDS: &'static [Field<Self>] = crate::kv_fields!(NodeRecord {
        id => "id",
        concentrators => "concentrators",
        mtu => "mtu",
        retry => "retry",
        wg_keepalive => "wg_keepalive",
        range4 => "range4",
        range6 => "range6",
        address4 => "address4",
        address6 => "address6",
        selected_concentrators => "selected_concentrators",
    });
}

impl NodeRecord {
    /// Overlay this record on top of `default`, field by field
    pub fn with_defaults(&self, default: &NodeRecord) -> NodeRecord {
        NodeRecord {
            id: self.id.or(default.id),
            concentrators: self
                .concentrators
                .clone()
                .or_else(|| default.concentrators.clone()),
            mtu: self.mtu.or(default.mtu),
            retry: self.retry.or(default.retry),
            wg_keepalive: self.wg_keepalive.or(default.wg_keepalive),
            range4: self.range4.clone().or_else(|| default.range4.clone()),
            range6: self.range6.clone().or_else(|| default.range6.clone()),
            address4: self.address4.clone().or_else(|| default.address4.clone()),
            address6: self.address6.clone().or_else(|| default.address6.clone()),
            selected_concentrators: self
                .selected_concentrators
                .clone()
                .or_else(|| default.selected_concentrators.clone()),
        }
    }

    /// Parsed Range4/Range6 values; absent and unparsable ranges are omitted,
    /// a network listed twice appears once
    pub fn allowed_ranges(&self) -> Vec<IpNetwork> {
        let mut ranges: Vec<IpNetwork> = Vec::with_capacity(2);
        for range in [self.range4.as_deref(), self.range6.as_deref()]
            .into_iter()
            .flatten()
            .filter_map(parse_range)
        {
            if !ranges.contains(&range) {
                ranges.push(range);
            }
        }
        ranges
    }

    /// Keepalive interval, `None` when unset
    pub fn keepalive(&self) -> Option<Duration> {
        self.wg_keepalive.map(Duration::from_secs)
    }

    /// Bitmask of enabled concentrators, bit `n-1` for concentrator `n`.
    ///
    /// An absent or empty selection enables every concentrator. Tokens that
    /// are not numbers are ignored; index 0 or above 64 is rejected.
    pub fn selected_concentrators_bitmask(&self) -> Result<u64> {
        let Some(selection) = self.selected_concentrators.as_deref() else {
            return Ok(u64::MAX);
        };

        let mut mask = 0u64;
        for token in selection.split_whitespace() {
            let Ok(n) = token.parse::<u64>() else {
                continue;
            };
            if n == 0 || n > MAX_CONCENTRATORS {
                return Err(Error::malformed(
                    "selected_concentrators",
                    format!("concentrator index {n} outside 1..={MAX_CONCENTRATORS}"),
                ));
            }
            mask |= 1 << (n - 1);
        }

        Ok(if mask == 0 { u64::MAX } else { mask })
    }

    /// Decode the concentrator blob; an absent blob means no concentrators
    pub fn concentrators(&self) -> Result<Vec<ConcentratorRecord>> {
        match self.concentrators.as_deref() {
            None | Some([]) => Ok(Vec::new()),
            Some(blob) => Ok(serde_json::from_slice(blob)?),
        }
    }

    /// Concentrators enabled by the selection bitmask
    pub fn enabled_concentrators(&self) -> Result<Vec<ConcentratorRecord>> {
        let mask = self.selected_concentrators_bitmask()?;
        Ok(self
            .concentrators()?
            .into_iter()
            .filter(|c| c.is_selected(mask))
            .collect())
    }
}

/// Parse CIDR text into its network form (host bits cleared)
pub fn parse_range(text: &str) -> Option<IpNetwork> {
    let net = IpNetwork::from_str(text.trim()).ok()?;
    IpNetwork::new(net.network(), net.prefix()).ok()
}

/// Concentrator descriptor, JSON encoded inside [`NodeRecord::concentrators`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcentratorRecord {
    pub address4: String,
    pub address6: String,
    pub endpoint: String,
    pub pubkey: String,
    pub id: u32,
}

impl ConcentratorRecord {
    /// Whether `mask` enables this concentrator
    pub fn is_selected(&self, mask: u64) -> bool {
        let id = u64::from(self.id);
        if !(1..=MAX_CONCENTRATORS).contains(&id) {
            return false;
        }
        mask == u64::MAX || (mask >> (id - 1)) & 1 == 1
    }
}

/// WireGuard public key (Curve25519, 32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::Crypto(format!(
                "Expected the public key to have {} bytes, but it has {} bytes instead",
                Self::LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Parse the URL-safe base64 form used as node key in the store
    pub fn from_store_key(key: &str) -> Result<Self> {
        Self::from_bytes(&URL_SAFE.decode(key)?)
    }

    /// Parse the standard base64 form used by wg(8) and client requests
    pub fn from_base64(key: &str) -> Result<Self> {
        Self::from_bytes(&STANDARD.decode(key)?)
    }

    /// Parse the lower-case hex form used by the UAPI protocol
    pub fn from_hex(key: &str) -> Result<Self> {
        let bytes = hex::decode(key).map_err(|e| Error::Crypto(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_store_key(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_base64()).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mapper::{decode_record, encode_record};

    /// Every field set, each value distinct per `n`
    pub(crate) fn full_record(n: u32) -> NodeRecord {
        NodeRecord {
            id: Some(u64::from(n)),
            concentrators: Some(serde_json::to_vec(&vec![concentrator(n)]).unwrap()),
            mtu: Some(1300 + u64::from(n)),
            retry: Some(u64::from(n)),
            wg_keepalive: Some(20 + u64::from(n)),
            range4: Some(format!("10.{n}.0.0/16")),
            range6: Some(format!("fd00:{n}::/64")),
            address4: Some(format!("10.{n}.0.1")),
            address6: Some(format!("fd00:{n}::1")),
            selected_concentrators: Some(n.to_string()),
        }
    }

    /// A record holding only `field`, copied from `source`
    pub(crate) fn only_field(field: &Field<NodeRecord>, source: &NodeRecord) -> NodeRecord {
        let mut record = NodeRecord::default();
        if let Some(raw) = (field.encode)(source) {
            (field.decode)(&mut record, &raw).unwrap();
        }
        record
    }

    pub(crate) const PRESENCE: [(bool, bool); 4] =
        [(false, false), (false, true), (true, false), (true, true)];

    fn concentrator(id: u32) -> ConcentratorRecord {
        ConcentratorRecord {
            address4: format!("10.0.0.{id}"),
            address6: format!("fd00::{id}"),
            endpoint: format!("c{id}.example.net:10000"),
            pubkey: format!("key{id}"),
            id,
        }
    }

    #[test]
    fn test_node_record_round_trip() {
        let record = NodeRecord {
            id: Some(17),
            concentrators: Some(b"[]".to_vec()),
            mtu: Some(1374),
            retry: Some(0),
            wg_keepalive: Some(25),
            range4: Some("10.0.68.0/22".to_string()),
            range6: Some("2001:bf7:381:11::/64".to_string()),
            address4: Some("10.0.68.1".to_string()),
            address6: Some("2001:bf7:381:11::1".to_string()),
            selected_concentrators: Some("1 3".to_string()),
        };
        let pairs = encode_record(&record, "/config/k/");
        assert_eq!(pairs.len(), NodeRecord::FIELDS.len());

        let (decoded, applied) = decode_record::<NodeRecord>(&pairs, "/config/k/").unwrap();
        assert_eq!(decoded, record);
        assert_eq!(applied, NodeRecord::FIELDS.len());
    }

    #[test]
    fn test_overlay_is_per_field() {
        let default = NodeRecord {
            mtu: Some(1400),
            wg_keepalive: Some(25),
            range4: Some("10.0.0.0/8".to_string()),
            ..Default::default()
        };
        let node = NodeRecord {
            id: Some(3),
            wg_keepalive: Some(0),
            range6: Some("fd00::/64".to_string()),
            ..Default::default()
        };

        let merged = node.with_defaults(&default);
        assert_eq!(merged.id, Some(3));
        assert_eq!(merged.mtu, Some(1400));
        // zero is a value, not an absence
        assert_eq!(merged.wg_keepalive, Some(0));
        assert_eq!(merged.range4.as_deref(), Some("10.0.0.0/8"));
        assert_eq!(merged.range6.as_deref(), Some("fd00::/64"));
        assert!(merged.retry.is_none());
    }

    #[test]
    fn test_overlay_every_field_every_presence() {
        let node_values = full_record(1);
        let default_values = full_record(2);

        for field in NodeRecord::FIELDS {
            assert_ne!((field.encode)(&node_values), (field.encode)(&default_values));

            for (node_has, default_has) in PRESENCE {
                let node = if node_has {
                    only_field(field, &node_values)
                } else {
                    NodeRecord::default()
                };
                let default = if default_has {
                    only_field(field, &default_values)
                } else {
                    NodeRecord::default()
                };
                let expected = if node_has {
                    (field.encode)(&node_values)
                } else if default_has {
                    (field.encode)(&default_values)
                } else {
                    None
                };

                let merged = node.with_defaults(&default);
                assert_eq!(
                    (field.encode)(&merged),
                    expected,
                    "field {} node={} default={}",
                    field.suffix,
                    node_has,
                    default_has
                );
            }
        }
    }

    #[test]
    fn test_allowed_ranges_independent_and_normalized() {
        let mut node = NodeRecord::default();
        assert!(node.allowed_ranges().is_empty());

        node.range6 = Some("2001:db8::5/64".to_string());
        assert_eq!(
            node.allowed_ranges(),
            vec![parse_range("2001:db8::/64").unwrap()]
        );

        node.range4 = Some("not a range".to_string());
        assert_eq!(node.allowed_ranges().len(), 1);

        node.range4 = Some("10.0.0.1/32".to_string());
        assert_eq!(node.allowed_ranges().len(), 2);
    }

    #[test]
    fn test_allowed_ranges_collapse_duplicates() {
        let node = NodeRecord {
            range4: Some("2001:db8::1/64".to_string()),
            range6: Some("2001:db8::/64".to_string()),
            ..Default::default()
        };
        assert_eq!(node.allowed_ranges(), vec![parse_range("2001:db8::/64").unwrap()]);
    }

    #[test]
    fn test_out_of_range_concentrator_ids_never_selected() {
        for id in [0, 65, u32::MAX] {
            let c = concentrator(id);
            assert!(!c.is_selected(u64::MAX), "id {id} selected by all-ones mask");
            assert!(!c.is_selected(1));
        }
        assert!(concentrator(64).is_selected(u64::MAX));
        assert!(concentrator(1).is_selected(1));
        assert!(!concentrator(2).is_selected(1));
    }

    #[test]
    fn test_bitmask_selection() {
        let mut node = NodeRecord::default();
        assert_eq!(node.selected_concentrators_bitmask().unwrap(), u64::MAX);

        node.selected_concentrators = Some("1 3 x".to_string());
        assert_eq!(node.selected_concentrators_bitmask().unwrap(), 0b101);

        node.selected_concentrators = Some("".to_string());
        assert_eq!(node.selected_concentrators_bitmask().unwrap(), u64::MAX);

        node.selected_concentrators = Some("64".to_string());
        assert_eq!(node.selected_concentrators_bitmask().unwrap(), 1 << 63);

        node.selected_concentrators = Some("0".to_string());
        assert!(node.selected_concentrators_bitmask().is_err());

        node.selected_concentrators = Some("65".to_string());
        assert!(node.selected_concentrators_bitmask().is_err());
    }

    #[test]
    fn test_enabled_concentrators() {
        let all = vec![concentrator(1), concentrator(2), concentrator(3)];
        let mut node = NodeRecord {
            concentrators: Some(serde_json::to_vec(&all).unwrap()),
            ..Default::default()
        };
        assert_eq!(node.enabled_concentrators().unwrap(), all);

        node.selected_concentrators = Some("2".to_string());
        assert_eq!(node.enabled_concentrators().unwrap(), vec![concentrator(2)]);

        node.concentrators = None;
        assert!(node.enabled_concentrators().unwrap().is_empty());

        node.concentrators = Some(b"{broken".to_vec());
        assert!(node.concentrators().is_err());
    }

    #[test]
    fn test_public_key_encodings() {
        let key = PublicKey::from_bytes(&[0xfb; 32]).unwrap();
        let store_key = key.to_store_key();
        assert!(store_key.contains('-') || store_key.contains('_'));
        assert_eq!(PublicKey::from_store_key(&store_key).unwrap(), key);
        assert_eq!(PublicKey::from_base64(&key.to_base64()).unwrap(), key);
        assert_eq!(PublicKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(PublicKey::from_bytes(&[1; 31]).is_err());
    }
}
