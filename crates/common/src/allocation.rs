//! Address range allocation for newly created nodes
//!
//! A node's ranges are a pure function of its identifier, which keeps the
//! allocation safe to recompute on every create-node retry.

use crate::types::NodeRecord;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Parameters for deriving per-node IPv4/IPv6 ranges from the node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressPlan {
    /// First octet of every IPv4 range
    pub v4_base: u8,
    /// Host bits per IPv4 range (range prefix is `32 - v4_range_bits`)
    pub v4_range_bits: u8,
    /// Upper 48 bits of every IPv6 /64
    pub v6_base_high: u64,
}

impl Default for AddressPlan {
    fn default() -> Self {
        Self {
            v4_base: 10,
            v4_range_bits: 10,
            v6_base_high: 0x2001_0bf7_0381,
        }
    }
}

impl AddressPlan {
    /// Read the plan from `MESHCONF_V4_BASE`, `MESHCONF_V4_RANGE_SIZE` and
    /// `MESHCONF_V6_BASE_HIGH`, falling back to `self` for unset variables.
    pub fn with_env_overrides(self) -> Result<Self> {
        let v4_base = match std::env::var("MESHCONF_V4_BASE") {
            Ok(v) => parse_int(&v, "MESHCONF_V4_BASE")?,
            Err(_) => u64::from(self.v4_base),
        };
        let v4_range_bits = match std::env::var("MESHCONF_V4_RANGE_SIZE") {
            Ok(v) => parse_int(&v, "MESHCONF_V4_RANGE_SIZE")?,
            Err(_) => u64::from(self.v4_range_bits),
        };
        let v6_base_high = match std::env::var("MESHCONF_V6_BASE_HIGH") {
            Ok(v) => parse_int(&v, "MESHCONF_V6_BASE_HIGH")?,
            Err(_) => self.v6_base_high,
        };

        let plan = Self {
            v4_base: u8::try_from(v4_base)
                .map_err(|_| Error::InvalidConfig(format!("v4 base {v4_base} exceeds one octet")))?,
            v4_range_bits: u8::try_from(v4_range_bits).map_err(|_| {
                Error::InvalidConfig(format!("v4 range size {v4_range_bits} too large"))
            })?,
            v6_base_high,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.v4_range_bits > 24 {
            return Err(Error::InvalidConfig(format!(
                "v4 range size {} leaves no room below the base octet",
                self.v4_range_bits
            )));
        }
        if self.v6_base_high >> 48 != 0 {
            return Err(Error::InvalidConfig(format!(
                "v6 base {:#x} wider than 48 bits",
                self.v6_base_high
            )));
        }
        Ok(())
    }

    /// Fill range4/address4/range6/address6 for the record's identifier
    pub fn fill(&self, record: &mut NodeRecord) -> Result<()> {
        let id = record
            .id
            .ok_or_else(|| Error::Internal("address allocation needs an identifier".to_string()))?;

        let (range4, address4) = self.v4_for(id)?;
        let (range6, address6) = self.v6_for(id)?;

        record.range4 = Some(range4);
        record.address4 = Some(address4);
        record.range6 = Some(range6);
        record.address6 = Some(address6);
        Ok(())
    }

    /// IPv4 range and first host address for `id`
    pub fn v4_for(&self, id: u64) -> Result<(String, String)> {
        self.validate()?;
        let slots = 24 - u32::from(self.v4_range_bits);
        if id >> slots != 0 {
            return Err(Error::InvalidConfig(format!(
                "identifier {id} does not fit the IPv4 plan ({slots} bits available)"
            )));
        }

        let net = (u32::from(self.v4_base) << 24) | ((id as u32) << self.v4_range_bits);
        let mut octets = Ipv4Addr::from(net).octets();
        let range = format!("{}/{}", Ipv4Addr::from(octets), 32 - self.v4_range_bits);
        octets[3] = 1;
        Ok((range, Ipv4Addr::from(octets).to_string()))
    }

    /// IPv6 /64 and first host address for `id`
    pub fn v6_for(&self, id: u64) -> Result<(String, String)> {
        if id >> 16 != 0 {
            return Err(Error::InvalidConfig(format!(
                "identifier {id} does not fit the IPv6 plan (16 bits available)"
            )));
        }

        let high = (self.v6_base_high << 16) | id;
        let mut octets = Ipv6Addr::from(u128::from(high) << 64).octets();
        let range = format!("{}/64", Ipv6Addr::from(octets));
        octets[15] = 1;
        Ok((range, Ipv6Addr::from(octets).to_string()))
    }
}

fn parse_int(value: &str, name: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| Error::InvalidConfig(format!("{name}={value:?}: {e}")))
}
