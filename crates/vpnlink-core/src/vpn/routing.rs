//! Interface configuration pushed by the engine through `NEED-OK` and
//! handed to the tunnel factory on `OPENTUN`.

use crate::vpn::cidr::CidrIp;
use crate::vpn::types::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Device name the engine reports for the tunnel we handed it.
pub const VPN_TUN_DEVICE: &str = "vpnservice-tun";

/// Default interface MTU until the engine says otherwise.
pub const DEFAULT_TUN_MTU: u32 = 1500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Route sink seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Receives the interface configuration the engine negotiates.
pub trait RouteSink: Send + Sync {
    fn add_dns(&mut self, server: &str);
    /// First domain wins.
    fn set_domain(&mut self, domain: &str);
    fn add_route(&mut self, dest: &str, mask: &str, gateway: &str, device: Option<&str>);
    fn add_route_v6(&mut self, network: &str, device: &str);
    fn set_mtu(&mut self, mtu: u32);
    fn set_local_ip(&mut self, local: &str, netmask: &str, mtu: u32, mode: &str);
    fn set_local_ipv6(&mut self, addr: &str);

    /// `NOACTION` when the pending configuration matches the last one
    /// opened, else `OPEN_BEFORE_CLOSE`.
    fn tun_reopen_status(&self) -> &'static str;

    /// Pending configuration for a tunnel open; the sink starts over.
    fn take_config(&mut self) -> TunConfig;

    /// Record a successfully opened configuration.
    fn mark_opened(&mut self, config: &TunConfig);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Accumulated configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub network: CidrIp,
    /// `false` routes bypass the tunnel.
    pub included: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route6Entry {
    pub network: Ipv6Addr,
    pub len: u8,
    pub included: bool,
}

/// Everything needed to bring up the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunConfig {
    pub local_ip: Option<CidrIp>,
    pub local_ipv6: Option<String>,
    pub routes: Vec<RouteEntry>,
    pub routes_v6: Vec<Route6Entry>,
    pub dns: Vec<String>,
    pub domain: Option<String>,
    pub mtu: u32,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            local_ip: None,
            local_ipv6: None,
            routes: Vec::new(),
            routes_v6: Vec::new(),
            dns: Vec::new(),
            domain: None,
            mtu: DEFAULT_TUN_MTU,
        }
    }
}

impl TunConfig {
    pub fn has_address(&self) -> bool {
        self.local_ip.is_some() || self.local_ipv6.is_some()
    }

    pub fn included_routes(&self) -> impl Iterator<Item = &CidrIp> {
        self.routes.iter().filter(|r| r.included).map(|r| &r.network)
    }

    pub fn excluded_routes(&self) -> impl Iterator<Item = &CidrIp> {
        self.routes.iter().filter(|r| !r.included).map(|r| &r.network)
    }

    /// Stable digest; equal configurations give equal fingerprints.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(b"ips:");
        if let Some(ip) = &self.local_ip {
            h.update(ip.to_string());
        }
        if let Some(ip6) = &self.local_ipv6 {
            h.update(ip6);
        }
        for included in [true, false] {
            h.update(if included { "routes:" } else { "excl:" });
            for r in self.routes.iter().filter(|r| r.included == included) {
                h.update(r.network.to_string());
                h.update("|");
            }
            for r in self.routes_v6.iter().filter(|r| r.included == included) {
                h.update(format!("{}/{}", r.network, r.len));
                h.update("|");
            }
        }
        h.update("dns:");
        for d in &self.dns {
            h.update(d);
            h.update("|");
        }
        h.update(format!("domain:{:?}", self.domain));
        h.update(format!("mtu:{}", self.mtu));
        hex::encode(h.finalize())
    }
}

/// The engine names our tunnel `tun*`, `(null)` or the service device.
fn is_vpn_device(device: Option<&str>) -> bool {
    device.is_some_and(|d| d.starts_with("tun") || d == "(null)" || d == VPN_TUN_DEVICE)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  TunSettings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Default `RouteSink`: accumulates configuration and remembers the
/// fingerprint of the last tunnel opened.
#[derive(Debug, Clone, Default)]
pub struct TunSettings {
    pending: TunConfig,
    remote_gw: Option<String>,
    last_opened: Option<String>,
    warnings: Vec<String>,
}

impl TunSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &TunConfig {
        &self.pending
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn warn(&mut self, msg: String) {
        log::warn!("{}", msg);
        self.warnings.push(msg);
    }

    pub fn add_cidr_route(&mut self, network: CidrIp, included: bool) {
        self.pending.routes.push(RouteEntry { network, included });
    }
}

impl RouteSink for TunSettings {
    fn add_dns(&mut self, server: &str) {
        self.pending.dns.push(server.to_string());
    }

    fn set_domain(&mut self, domain: &str) {
        if self.pending.domain.is_none() {
            self.pending.domain = Some(domain.to_string());
        }
    }

    fn add_route(&mut self, dest: &str, mask: &str, gateway: &str, device: Option<&str>) {
        let Some(local) = self.pending.local_ip else {
            log::error!(
                "Local IP address unset and received. Neither pushed server config nor local config specifies an IP address, dropping route {} {}",
                dest,
                mask
            );
            return;
        };

        let mut include = is_vpn_device(device);
        if let Ok(gw) = gateway.parse::<Ipv4Addr>() {
            if local.contains(gw) {
                include = true;
            }
        }
        if gateway == "255.255.255.255" || self.remote_gw.as_deref() == Some(gateway) {
            include = true;
        }

        let mut route = match CidrIp::from_ip_and_mask(dest, mask) {
            Ok(r) => r,
            Err(e) => {
                log::error!("Ignoring route {} {}: {}", dest, mask, e);
                return;
            }
        };
        if route.len == 32 && mask != "255.255.255.255" {
            self.warn(format!(
                "Route {} {} is not a CIDR route, using /32",
                dest, mask
            ));
        }
        if route.normalise() {
            self.warn(format!(
                "Route {}/{} is not a network address, using {}",
                dest, route.len, route.ip
            ));
        }
        self.add_cidr_route(route, include);
    }

    fn add_route_v6(&mut self, network: &str, device: &str) {
        let included = is_vpn_device(Some(device));
        let parsed = network.split_once('/').and_then(|(ip, len)| {
            Some((ip.parse::<Ipv6Addr>().ok()?, len.parse::<u8>().ok()?))
        });
        match parsed {
            Some((ip, len)) if len <= 128 => self.pending.routes_v6.push(Route6Entry {
                network: ip,
                len,
                included,
            }),
            _ => log::error!("Ignoring malformed IPv6 route {}", network),
        }
    }

    fn set_mtu(&mut self, mtu: u32) {
        self.pending.mtu = mtu;
    }

    fn set_local_ip(&mut self, local: &str, netmask: &str, mtu: u32, mode: &str) {
        let mut ip = match CidrIp::from_ip_and_mask(local, netmask) {
            Ok(ip) => ip,
            Err(e) => {
                log::error!("Ignoring interface address {} {}: {}", local, netmask, e);
                return;
            }
        };
        self.pending.mtu = mtu;

        // A /32 "netmask" that is really the peer address means a
        // net30 or point-to-point link.
        if ip.len == 32 && netmask != "255.255.255.255" {
            let (masklen, mask) = if mode == "net30" {
                (30u8, 0xffff_fffcu32)
            } else {
                (31u8, 0xffff_fffeu32)
            };
            let peer = netmask.parse::<Ipv4Addr>().map(u32::from).unwrap_or(0);
            if peer & mask == ip.as_u32() & mask {
                ip.len = masklen;
            } else if mode != "p2p" {
                self.warn(format!(
                    "Interface address {} with netmask {} in mode {} is not a CIDR network, using /32",
                    local, netmask, mode
                ));
            }
        }
        if (mode == "p2p" && ip.len < 32) || (mode == "net30" && ip.len < 30) {
            self.warn(format!(
                "Interface address {} netmask {} looks like a subnet in mode {}",
                local, netmask, mode
            ));
        }

        // Traffic to the interface's own network must go through the tunnel.
        if ip.len <= 31 {
            let mut net = ip;
            net.normalise();
            self.add_cidr_route(net, true);
        }

        self.pending.local_ip = Some(ip);
        self.remote_gw = Some(netmask.to_string());
    }

    fn set_local_ipv6(&mut self, addr: &str) {
        self.pending.local_ipv6 = Some(addr.to_string());
    }

    fn tun_reopen_status(&self) -> &'static str {
        if self.last_opened.as_deref() == Some(self.pending.fingerprint().as_str()) {
            "NOACTION"
        } else {
            "OPEN_BEFORE_CLOSE"
        }
    }

    fn take_config(&mut self) -> TunConfig {
        let mtu = self.pending.mtu;
        let config = std::mem::take(&mut self.pending);
        self.pending.mtu = mtu;
        config
    }

    fn mark_opened(&mut self, config: &TunConfig) {
        self.last_opened = Some(config.fingerprint());
    }
}

/// Parse a `ROUTE` need-ok payload (`net mask gw [metric device]`).
pub fn apply_route(sink: &mut dyn RouteSink, extra: &str) -> Result<(), VpnError> {
    let parts: Vec<&str> = extra.split(' ').collect();
    match parts.len() {
        5 => sink.add_route(parts[0], parts[1], parts[2], Some(parts[4])),
        n if n >= 3 => sink.add_route(parts[0], parts[1], parts[2], None),
        _ => {
            return Err(VpnError::new(
                VpnErrorKind::Protocol,
                format!("Unrecognized ROUTE cmd: {}", extra),
            ))
        }
    }
    Ok(())
}
