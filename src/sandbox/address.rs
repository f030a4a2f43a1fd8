// src/sandbox/address.rs
//! Address classification for sandbox egress
//!
//! An address is *local* when it is unspecified, loopback, inside a private
//! range (RFC1918, `0.0.0.0/8`, IPv4 link-local, IPv6 unique-local and
//! link-local), or inside one of the vendor-reserved blocks configured by
//! policy. IPv6 addresses that embed an IPv4 address (mapped `::ffff:a.b.c.d`,
//! compatible `::a.b.c.d` and NAT64 `64:ff9b::a.b.c.d`) are classified by the
//! IPv4 address they carry.

use crate::utils::errors::RunnerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Local,
    Public,
}

/// A CIDR block such as `100.64.0.0/10` or `fd00:ec2::/32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    /// Shared address space used by carrier-grade NAT and several cloud vendors
    pub const CARRIER_GRADE_NAT: CidrBlock = CidrBlock {
        network: IpAddr::V4(Ipv4Addr::new(100, 64, 0, 0)),
        prefix: 10,
    };

    pub fn new(network: IpAddr, prefix: u8) -> Result<Self, RunnerError> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(RunnerError::Configuration(format!(
                "Prefix /{} is too long for {}",
                prefix, network
            )));
        }
        Ok(Self { network, prefix })
    }

    /// Whether `addr` falls inside this block (families must match)
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for CidrBlock {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| RunnerError::Configuration(format!("Invalid CIDR '{}': {}", s, e)))?;

        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .map_err(|e| RunnerError::Configuration(format!("Invalid CIDR '{}': {}", s, e)))?,
            None if network.is_ipv4() => 32,
            None => 128,
        };

        CidrBlock::new(network, prefix)
    }
}

impl Serialize for CidrBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CidrBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Egress address policy
#[derive(Debug, Clone, Default)]
pub struct AddressPolicy {
    blocked: Vec<CidrBlock>,
}

impl AddressPolicy {
    pub fn new(blocked: Vec<CidrBlock>) -> Self {
        Self { blocked }
    }

    /// Policy with the default vendor-reserved blocks
    pub fn with_defaults() -> Self {
        Self::new(vec![CidrBlock::CARRIER_GRADE_NAT])
    }

    pub fn classify(&self, addr: IpAddr) -> AddressClass {
        let addr = match addr {
            IpAddr::V6(v6) => match embedded_v4(v6) {
                Some(v4) => IpAddr::V4(v4),
                None => addr,
            },
            IpAddr::V4(_) => addr,
        };

        let builtin_local = match addr {
            IpAddr::V4(v4) => is_local_v4(v4),
            IpAddr::V6(v6) => is_local_v6(v6),
        };

        if builtin_local || self.blocked.iter().any(|block| block.contains(addr)) {
            AddressClass::Local
        } else {
            AddressClass::Public
        }
    }

    pub fn is_local(&self, addr: IpAddr) -> bool {
        self.classify(addr) == AddressClass::Local
    }
}

/// Classify with the built-in ranges only
pub fn classify_address(addr: IpAddr) -> AddressClass {
    AddressPolicy::default().classify(addr)
}

/// IPv4 address carried in the low 32 bits of a mapped, compatible or NAT64 address
fn embedded_v4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return Some(v4);
    }

    let segments = addr.segments();
    let compatible = segments[..6] == [0, 0, 0, 0, 0, 0];
    let nat64 = segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0];
    if !(compatible || nat64) {
        return None;
    }

    let [.., hi, lo] = segments;
    Some(Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo)))
}

fn is_local_v4(addr: Ipv4Addr) -> bool {
    // 0.0.0.0/8, "this network"
    let this_network = addr.octets()[0] == 0;

    this_network || addr.is_loopback() || addr.is_private() || addr.is_link_local()
}

fn is_local_v6(addr: Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;

    addr.is_unspecified() || addr.is_loopback() || unique_local || link_local
}
