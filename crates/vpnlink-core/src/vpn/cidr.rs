//! IPv4 CIDR value type used for routes and interface addresses.

use crate::vpn::types::VpnError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 address plus prefix length (0–32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CidrIp {
    pub ip: Ipv4Addr,
    pub len: u8,
}

impl CidrIp {
    pub fn new(ip: Ipv4Addr, len: u8) -> Self {
        Self { ip, len: len.min(32) }
    }

    /// Build from dotted address and dotted netmask.
    ///
    /// A non-contiguous netmask is treated as a host route (`/32`).
    pub fn from_ip_and_mask(ip: &str, mask: &str) -> Result<Self, VpnError> {
        let ip = parse_v4(ip)?;
        let mask = parse_v4(mask)?;
        Ok(Self::new(ip, mask_length(mask)))
    }

    pub fn as_u32(&self) -> u32 {
        u32::from(self.ip)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.len))
    }

    /// Clear host bits. Returns `true` when the address changed.
    pub fn normalise(&mut self) -> bool {
        let addr = self.as_u32();
        let normal = addr & prefix_mask(self.len);
        if normal != addr {
            self.ip = Ipv4Addr::from(normal);
            true
        } else {
            false
        }
    }

    /// Whether `other` lies inside this network.
    pub fn contains(&self, other: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.len);
        (u32::from(other) & mask) == (self.as_u32() & mask)
    }

    /// `"a.b.c.d m.m.m.m"` form used by `route`/`ifconfig` directives.
    pub fn to_ip_and_netmask(&self) -> String {
        format!("{} {}", self.ip, self.netmask())
    }
}

impl fmt::Display for CidrIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.len)
    }
}

impl FromStr for CidrIp {
    type Err = VpnError;

    /// Accepts `a.b.c.d/len` or a bare address (assumed `/32`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, len) = match s.split_once('/') {
            Some((ip, len)) => {
                let len: u8 = len
                    .parse()
                    .map_err(|_| VpnError::parse(format!("Invalid prefix length in {}", s)))?;
                if len > 32 {
                    return Err(VpnError::parse(format!("Invalid prefix length in {}", s)));
                }
                (ip, len)
            }
            None => (s, 32),
        };
        Ok(Self::new(parse_v4(ip)?, len))
    }
}

fn parse_v4(s: &str) -> Result<Ipv4Addr, VpnError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| VpnError::parse(format!("Invalid IPv4 address {}", s)))
}

fn prefix_mask(len: u8) -> u32 {
    match len {
        0 => 0,
        l if l >= 32 => u32::MAX,
        l => u32::MAX << (32 - l),
    }
}

/// Prefix length of a dotted netmask; non-contiguous masks yield 32.
pub fn mask_length(mask: Ipv4Addr) -> u8 {
    let m = u32::from(mask);
    let zeros = m.trailing_zeros().min(32);
    if zeros == 32 {
        return 0;
    }
    if m != (u32::MAX << zeros) {
        32
    } else {
        (32 - zeros) as u8
    }
}

/// Whether `mask` is a contiguous netmask.
pub fn is_cidr_mask(mask: Ipv4Addr) -> bool {
    let m = u32::from(mask);
    m.leading_ones() + m.trailing_zeros() == 32
}
