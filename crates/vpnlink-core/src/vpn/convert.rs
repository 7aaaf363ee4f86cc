//! Interpretation of the option multimap into a [`Profile`].

use crate::vpn::cidr::{is_cidr_mask, CidrIp};
use crate::vpn::config::{ConfigParser, OptionLine};
use crate::vpn::profile::{embedded_content, escape, insert_file_data, Connection, Profile};
use crate::vpn::types::*;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Options that abort the import.
const UNSUPPORTED_OPTIONS: &[&str] = &["config", "tls-server"];

/// Options dropped silently: scripts, management directives we set
/// ourselves, and platform knobs that do not apply.
const IGNORE_OPTIONS: &[&str] = &[
    "tls-client",
    "allow-recursive-routing",
    "askpass",
    "auth-nocache",
    "up",
    "down",
    "route-up",
    "ipchange",
    "route-pre-down",
    "auth-user-pass-verify",
    "block-outside-dns",
    "client-cert-not-required",
    "dhcp-release",
    "dhcp-renew",
    "dh",
    "group",
    "ip-win32",
    "ifconfig-nowarn",
    "management-hold",
    "management",
    "management-client",
    "management-query-remote",
    "management-query-passwords",
    "management-query-proxy",
    "management-external-key",
    "management-forget-disconnect",
    "management-signal",
    "management-log-cache",
    "management-up-down",
    "management-client-user",
    "management-client-group",
    "pause-exit",
    "preresolve",
    "plugin",
    "machine-readable-output",
    "persist-key",
    "push",
    "register-dns",
    "route-delay",
    "route-gateway",
    "route-metric",
    "route-method",
    "status",
    "script-security",
    "show-net-up",
    "suppress-timestamps",
    "tap-sleep",
    "tmp-dir",
    "tun-ipv6",
    "topology",
    "user",
    "verb",
    "push-peer-info",
    "win-sys",
    "capath",
    "cert",
    "key",
    "tls-version",
];

/// Option lines ignored when they start with these exact tokens.
const IGNORE_OPTIONS_WITH_ARG: &[&[&str]] = &[
    &["setenv", "IV_GUI_VER"],
    &["setenv", "IV_SSO"],
    &["setenv", "IV_PLAT_VER"],
    &["setenv", "IV_OPENVPN_GUI_VERSION"],
    &["engine", "dynamic"],
    &["setenv", "CLIENT_CERT"],
    &["resolv-retry", "60"],
];

/// Options scoped to a single connection rather than the whole profile.
const CONNECTION_OPTIONS: &[&str] = &[
    "local",
    "remote",
    "float",
    "port",
    "connect-retry",
    "connect-timeout",
    "connect-retry-max",
    "link-mtu",
    "tun-mtu",
    "tun-mtu-extra",
    "fragment",
    "mtu-disc",
    "local-port",
    "remote-port",
    "bind",
    "nobind",
    "proto",
    "http-proxy",
    "http-proxy-retry",
    "http-proxy-timeout",
    "http-proxy-option",
    "socks-proxy",
    "socks-proxy-retry",
    "http-proxy-user-pass",
    "explicit-exit-notify",
];

const CUSTOM_OPTIONS_HEADER: &str =
    "# These options found in the config file do not map to config settings:\n";

/// Parse config text straight into a profile.
pub fn parse_profile(text: &str) -> Result<Profile, VpnError> {
    let mut parser = ConfigParser::new();
    parser.parse_str(text)?;
    parser.convert_profile()
}

/// Map a `proto` token onto "is UDP".
pub fn is_udp_proto(proto: &str) -> Result<bool, VpnError> {
    match proto {
        "udp" | "udp4" | "udp6" => Ok(true),
        "tcp-client" | "tcp" | "tcp4" | "tcp6" => Ok(false),
        p if p.ends_with("tcp4-client") || p.ends_with("tcp6-client") => Ok(false),
        p => Err(VpnError::parse(format!("Unsupported option to --proto {}", p))),
    }
}

/// Whether a line matches one of the ignored `(option, arg)` prefixes.
pub fn ignore_this_option(line: &[String]) -> bool {
    IGNORE_OPTIONS_WITH_ARG.iter().any(|prefix| {
        line.len() >= prefix.len() && prefix.iter().zip(line).all(|(p, l)| *p == l.as_str())
    })
}

/// Serialise option lines back to config text, one per line.
pub fn option_strings(lines: &[OptionLine]) -> String {
    let mut custom = String::new();
    for line in lines.iter().filter(|l| !ignore_this_option(l)) {
        if line.len() == 2 && line[0] == "extra-certs" {
            custom.push_str(&insert_file_data(&line[0], Some(&line[1])));
        } else {
            for arg in line {
                custom.push_str(&escape(arg));
                custom.push(' ');
            }
            custom.push('\n');
        }
    }
    custom
}

/// First two lines of embedded content as (username, password).
fn embedded_user_pass(inline: &str) -> Option<(String, String)> {
    let mut parts = embedded_content(inline).split('\n');
    match (parts.next(), parts.next()) {
        (Some(user), Some(pass)) => Some((user.to_string(), pass.to_string())),
        _ => None,
    }
}

impl ConfigParser {
    /// Consume the option map and build the profile.
    pub fn convert_profile(&mut self) -> Result<Profile, VpnError> {
        let mut profile = Profile::new(CONVERTED_PROFILE);
        profile.clear_defaults();

        if self.options.contains("client") || self.options.contains("pull") {
            profile.use_pull = true;
            self.options.remove("pull");
            self.options.remove("client");
        }

        self.convert_routes(&mut profile)?;

        if self.get_option("route-nopull", 0, 0)?.is_some() {
            profile.route_no_pull = true;
        }

        // tls-auth [inline] direction is accepted too
        if let Some(lines) = self.get_all_option("tls-auth", 1, 2)? {
            for line in lines {
                if line[1] != "[inline]" {
                    profile.tls_auth_filename = Some(line[1].clone());
                    profile.use_tls_auth = true;
                }
                if line.len() == 3 {
                    profile.tls_auth_direction = Some(line[2].clone());
                }
            }
        }
        if let Some(line) = self.get_option("key-direction", 1, 1)? {
            profile.tls_auth_direction = Some(line[1].clone());
        }
        for crypt in ["tls-crypt", "tls-crypt-v2"] {
            if let Some(line) = self.get_option(crypt, 1, 1)? {
                profile.use_tls_auth = true;
                profile.tls_auth_filename = Some(line[1].clone());
                profile.tls_auth_direction = Some(crypt.to_string());
            }
        }

        if let Some(lines) = self.get_all_option("redirect-gateway", 0, 7)? {
            check_redirect_parameters(&mut profile, &lines, true);
        }
        if let Some(lines) = self.get_all_option("redirect-private", 0, 5)? {
            check_redirect_parameters(&mut profile, &lines, false);
        }

        let dev = self.get_option("dev", 1, 1)?;
        let dev_type = self.get_option("dev-type", 1, 1)?;
        let tun_ok = dev_type.as_ref().is_some_and(|l| l[1] == "tun")
            || dev.as_ref().is_some_and(|l| l[1].starts_with("tun"))
            || (dev_type.is_none() && dev.is_none());
        if !tun_ok {
            return Err(VpnError::parse(
                "Sorry. Only tun mode is supported. See the FAQ for more detail",
            ));
        }

        if let Some(line) = self.get_option("mssfix", 0, 2)? {
            profile.mss_fix = match line.get(1) {
                Some(v) => v
                    .parse()
                    .map_err(|_| VpnError::parse("Argument to --mssfix has to be an integer"))?,
                None => DEFAULT_MSSFIX,
            };
            if line.get(2).is_some_and(|v| v != "mtu") {
                return Err(VpnError::parse("Second argument to --mssfix unknown"));
            }
        }

        if let Some(line) = self.get_option("tun-mtu", 1, 1)? {
            profile.tun_mtu = line[1]
                .parse()
                .map_err(|_| VpnError::parse("Argument to --tun-mtu has to be an integer"))?;
        }

        if let Some(line) = self.get_option("mode", 1, 1)? {
            if line[1] != "p2p" {
                return Err(VpnError::parse("Invalid mode for --mode specified, need p2p"));
            }
        }

        if let Some(lines) = self.get_all_option("dhcp-option", 2, 2)? {
            for line in lines {
                match line[1].as_str() {
                    "DOMAIN" => profile.search_domain = line[2].clone(),
                    "DNS" => {
                        profile.override_dns = true;
                        if profile.dns1 == DEFAULT_DNS1 {
                            profile.dns1 = line[2].clone();
                        } else {
                            profile.dns2 = line[2].clone();
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(line) = self.get_option("ifconfig", 2, 2)? {
            let cidr = CidrIp::from_ip_and_mask(&line[1], &line[2]).map_err(|e| {
                VpnError::parse(format!("Could not parse ifconfig IP address: {}", e.message))
            })?;
            profile.ipv4_address = Some(cidr);
        }

        if self.get_option("remote-random-hostname", 0, 0)?.is_some() {
            profile.use_random_hostname = true;
        }
        if self.get_option("float", 0, 0)?.is_some() {
            profile.use_float = true;
        }
        if self.get_option("comp-lzo", 0, 1)?.is_some() {
            profile.use_lzo = true;
        }
        if let Some(line) = self.get_option("cipher", 1, 1)? {
            profile.cipher = Some(line[1].clone());
        }
        if let Some(line) = self.get_option("auth", 1, 1)? {
            profile.auth = Some(line[1].clone());
        }
        if let Some(line) = self.get_option("ca", 1, 1)? {
            profile.ca_filename = Some(line[1].clone());
        }

        self.convert_credentials(&mut profile)?;
        self.convert_x509(&mut profile)?;

        if self.get_option("nobind", 0, 0)?.is_some() {
            profile.nobind = true;
        }
        if self.get_option("persist-tun", 0, 0)?.is_some() {
            profile.persist_tun = true;
        }
        if let Some(line) = self.get_option("connect-retry", 1, 2)? {
            profile.connect_retry = line[1].clone();
            if let Some(max) = line.get(2) {
                profile.connect_retry_max_time = max.clone();
            }
        }
        if let Some(line) = self.get_option("connect-retry-max", 1, 1)? {
            profile.connect_retry_max = line[1].clone();
        }

        if let Some(lines) = self.get_all_option("remote-cert-tls", 1, 1)? {
            if lines[0][1] == "server" {
                profile.expect_tls_cert = true;
            } else {
                self.options.insert("remotetls", lines);
            }
        }

        if let Some(line) = self.get_option("crl-verify", 1, 2)? {
            // `crl-verify <dir> dir` is passed through untouched
            if line.len() == 3 && line[2] == "dir" {
                profile.custom_config_options.push_str(&line.join(" "));
                profile.custom_config_options.push('\n');
                profile.use_custom_config = true;
            } else {
                profile.crl_filename = Some(line[1].clone());
            }
        }

        self.convert_connections(&mut profile)?;

        if self.get_option("remote-random", 0, 0)?.is_some() {
            profile.remote_random = true;
        }

        if let Some(line) = self.get_option("proto-force", 1, 1)? {
            let disable_udp = match line[1].as_str() {
                "udp" => true,
                "tcp" => false,
                other => {
                    return Err(VpnError::parse(format!(
                        "Unknown protocol {} in proto-force",
                        other
                    )))
                }
            };
            for conn in profile.connections.iter_mut() {
                if conn.use_udp == disable_udp {
                    conn.enabled = false;
                }
            }
        }

        self.check_extension_options(&mut profile)?;
        self.check_ignore_and_invalid_options(&mut profile)?;

        Ok(profile)
    }

    fn convert_routes(&mut self, profile: &mut Profile) -> Result<(), VpnError> {
        if let Some(routes) = self.get_all_option("route", 1, 4)? {
            for route in routes {
                let netmask = route.get(2).map(String::as_str).unwrap_or("255.255.255.255");
                let gateway = route.get(3).map(String::as_str).unwrap_or("vpn_gateway");

                let parse_err =
                    || VpnError::parse(format!("Could not parse netmask of route {}", netmask));
                let mask: Ipv4Addr = netmask.parse().map_err(|_| parse_err())?;
                let mut cidr =
                    CidrIp::from_ip_and_mask(&route[1], netmask).map_err(|_| parse_err())?;

                if !is_cidr_mask(mask) {
                    self.warn(format!(
                        "Route netmask {} of {} is not a CIDR mask, using /{}",
                        netmask, route[1], cidr.len
                    ));
                }
                let original = cidr.ip;
                if cidr.normalise() {
                    self.warn(format!(
                        "Route {}/{} is not a network address, corrected to {}",
                        original, cidr.len, cidr
                    ));
                }

                if gateway == "net_gateway" {
                    profile.excluded_routes.push(cidr);
                } else {
                    profile.custom_routes.push(cidr);
                }
            }
        }

        if let Some(routes) = self.get_all_option("route-ipv6", 1, 4)? {
            profile
                .custom_routes_v6
                .extend(routes.into_iter().map(|r| r[1].clone()));
        }
        Ok(())
    }

    fn convert_credentials(&mut self, profile: &mut Profile) -> Result<(), VpnError> {
        let auth_user = self.get_option("auth-user-pass", 0, 1)?;
        if let Some(arg) = auth_user.as_ref().and_then(|l| l.get(1)) {
            if !arg.starts_with(INLINE_TAG) {
                self.auth_user_pass_file = Some(arg.clone());
                profile.auth_user_pass_file = Some(arg.clone());
            }
            profile.username = None;
            if let Some((user, pass)) = embedded_user_pass(arg) {
                profile.username = Some(user);
                profile.password = Some(pass);
            }
        }

        let pkcs12 = self.get_option("pkcs12", 1, 1)?;
        let cryptoapicert = self.get_option("cryptoapicert", 1, 1)?;
        if let Some(line) = &pkcs12 {
            profile.pkcs12_filename = Some(line[1].clone());
            profile.authentication_type = if auth_user.is_none() {
                AuthType::Pkcs12
            } else {
                AuthType::UserPassPkcs12
            };
        }
        if let Some(line) = &cryptoapicert {
            profile.alias = Some(line[1].clone());
            profile.authentication_type = if auth_user.is_none() {
                AuthType::Keystore
            } else {
                AuthType::UserPassKeystore
            };
        }
        if auth_user.is_some() && pkcs12.is_none() && cryptoapicert.is_none() {
            profile.authentication_type = AuthType::UserPass;
        }
        Ok(())
    }

    fn convert_x509(&mut self, profile: &mut Profile) -> Result<(), VpnError> {
        let compat_names = self.get_option("compat-names", 1, 2)?;
        let no_name_remapping = self.get_option("no-name-remapping", 1, 1)?;

        if let Some(line) = self.get_option("tls-remote", 1, 1)? {
            profile.remote_cn = Some(line[1].clone());
            profile.check_remote_cn = true;
            profile.x509_auth_type = X509VerifyMode::TlsRemote;
            let compat = compat_names
                .as_ref()
                .is_some_and(|l| l.len() > 2 || l.iter().any(|a| a == "no-remapping"));
            if compat || no_name_remapping.is_some() {
                profile.x509_auth_type = X509VerifyMode::TlsRemoteCompatNoRemapping;
            }
        }

        if let Some(line) = self.get_option("verify-x509-name", 1, 2)? {
            profile.remote_cn = Some(line[1].clone());
            profile.check_remote_cn = true;
            profile.x509_auth_type = match line.get(2).map(String::as_str) {
                None => X509VerifyMode::Dn,
                Some("name") => X509VerifyMode::Rdn,
                Some("subject") => X509VerifyMode::Dn,
                Some("name-prefix") => X509VerifyMode::RdnPrefix,
                Some(other) => {
                    return Err(VpnError::parse(format!(
                        "Unknown parameter to verify-x509-name: {}",
                        other
                    )))
                }
            };
        }

        if let Some(line) = self.get_option("x509-username-field", 1, 1)? {
            profile.x509_username_field = Some(line[1].clone());
        }
        Ok(())
    }

    fn convert_connections(&mut self, profile: &mut Profile) -> Result<(), VpnError> {
        let (defaults, remotes) = self.parse_connection_options(None)?;
        profile.connections = remotes;

        let Some(blocks) = self.get_all_option("connection", 1, 1)? else {
            return Ok(());
        };
        if !profile.connections.is_empty() {
            return Err(VpnError::parse(
                "Using a <connection> block and --remote is not allowed.",
            ));
        }

        let mut connections = Vec::with_capacity(blocks.len());
        for block in blocks {
            let (_, mut remotes) = parse_connection_block(&block[1], &defaults)?;
            if remotes.len() != 1 {
                return Err(VpnError::parse(
                    "A <connection> block must have exactly one remote",
                ));
            }
            connections.append(&mut remotes);
        }
        profile.connections = connections;
        Ok(())
    }

    /// Read connection-level options against `defaults` and expand
    /// each `remote` line into a clone of the resulting template.
    ///
    /// Returns the template and the expanded remotes.
    pub fn parse_connection_options(
        &mut self,
        defaults: Option<&Connection>,
    ) -> Result<(Connection, Vec<Connection>), VpnError> {
        let mut conn = defaults.cloned().unwrap_or_default();

        if let Some(line) = self.get_option("port", 1, 1)? {
            conn.server_port = line[1].clone();
        }
        if let Some(line) = self.get_option("rport", 1, 1)? {
            conn.server_port = line[1].clone();
        }
        if let Some(line) = self.get_option("proto", 1, 1)? {
            conn.use_udp = is_udp_proto(&line[1])?;
        }
        if let Some(line) = self.get_option("connect-timeout", 1, 1)? {
            conn.connect_timeout = line[1].parse().map_err(|e| {
                VpnError::parse(format!(
                    "Argument to connect-timeout ({}) must to be an integer: {}",
                    line[1], e
                ))
            })?;
        }

        let proxy = match self.get_option("socks-proxy", 1, 2)? {
            Some(p) => Some(p),
            None => self.get_option("http-proxy", 2, 2)?,
        };
        if let Some(line) = proxy {
            if line[0] == "socks-proxy" {
                conn.proxy_type = ProxyType::Socks5;
                conn.proxy_port = "1080".into();
            } else {
                conn.proxy_type = ProxyType::Http;
            }
            conn.proxy_name = Some(line[1].clone());
            if let Some(port) = line.get(2) {
                conn.proxy_port = port.clone();
            }
        }

        if let Some(line) = self.get_option("http-proxy-user-pass", 1, 1)? {
            if let Some((user, pass)) = embedded_user_pass(&line[1]) {
                conn.proxy_auth_username = Some(user);
                conn.proxy_auth_password = Some(pass);
                conn.use_proxy_auth = true;
            }
        }

        let remotes = self.get_all_option("remote", 1, 3)?.unwrap_or_default();

        // Inside a block everything left belongs to the connection.
        let scoped: Vec<String> = self
            .options
            .keys()
            .filter(|k| defaults.is_some() || CONNECTION_OPTIONS.contains(k))
            .map(str::to_string)
            .collect();
        for key in scoped {
            if let Some(lines) = self.options.remove(&key) {
                conn.custom_configuration.push_str(&option_strings(&lines));
            }
        }
        if !conn.custom_configuration.is_empty() {
            conn.use_custom_config = true;
        }

        let mut connections = Vec::with_capacity(remotes.len());
        for remote in remotes {
            let mut c = conn.clone();
            c.server_name = Some(remote[1].clone());
            if let Some(port) = remote.get(2) {
                c.server_port = port.clone();
            }
            if let Some(proto) = remote.get(3) {
                c.use_udp = is_udp_proto(proto)?;
            }
            connections.push(c);
        }

        Ok((conn, connections))
    }

    fn check_extension_options(&mut self, profile: &mut Profile) -> Result<(), VpnError> {
        let Some(exts) = self.get_all_option("#?", 1, 9)? else {
            return Ok(());
        };
        for ext in exts.iter().filter(|e| e.len() >= 3) {
            match ext[1].as_str() {
                "uuid" => {
                    profile.uuid = Uuid::parse_str(&ext[2])
                        .map_err(|e| VpnError::parse(format!("Invalid profile uuid {}: {}", ext[2], e)))?;
                }
                "name" => profile.name = ext[2].clone(),
                _ => {}
            }
        }
        Ok(())
    }

    fn check_ignore_and_invalid_options(&mut self, profile: &mut Profile) -> Result<(), VpnError> {
        if let Some(option) = UNSUPPORTED_OPTIONS.iter().find(|o| self.options.contains(o)) {
            return Err(VpnError::parse(format!(
                "Unsupported Option {} encountered in config file. Aborting",
                option
            )));
        }

        for option in IGNORE_OPTIONS {
            self.options.remove(option);
        }

        let custom_options = self
            .options
            .iter()
            .flat_map(|(_, lines)| lines.iter())
            .any(|line| !ignore_this_option(line));

        if custom_options {
            let mut custom = String::from(CUSTOM_OPTIONS_HEADER);
            custom.push_str(&profile.custom_config_options);
            for (_, lines) in self.options.iter() {
                custom.push_str(&option_strings(lines));
            }
            profile.custom_config_options = custom;
            profile.use_custom_config = true;
        }
        Ok(())
    }
}

/// Parse the inline text of a `<connection>` block with a fresh parser.
fn parse_connection_block(
    block: &str,
    defaults: &Connection,
) -> Result<(Connection, Vec<Connection>), VpnError> {
    let text = block.strip_prefix(INLINE_TAG).unwrap_or(block);
    let mut parser = ConfigParser::new();
    parser.parse_str(text)?;
    parser.parse_connection_options(Some(defaults))
}

fn check_redirect_parameters(profile: &mut Profile, lines: &[OptionLine], default_route: bool) {
    if !default_route {
        return;
    }
    let mut no_ipv4 = false;
    for line in lines {
        for flag in line.iter().skip(1) {
            match flag.as_str() {
                "block-local" => profile.allow_local_lan = false,
                "unblock-local" => profile.allow_local_lan = true,
                "!ipv4" => no_ipv4 = true,
                "ipv6" => profile.use_default_route_v6 = true,
                _ => {}
            }
        }
    }
    if !no_ipv4 {
        profile.use_default_route = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::profile::GenerateOptions;

    fn parse(text: &str) -> Profile {
        parse_profile(text).unwrap()
    }

    fn parse_err(text: &str) -> String {
        parse_profile(text).unwrap_err().message
    }

    const BASIC: &str = "\
client
dev tun
proto udp
remote vpn.example.com 1194
remote backup.example.com 443 tcp-client
cipher AES-256-GCM
auth SHA256
auth-user-pass
remote-cert-tls server
verb 3
";

    // ── Basics ───────────────────────────────────────────────────

    #[test]
    fn basic_profile() {
        let p = parse(BASIC);
        assert_eq!(p.name, CONVERTED_PROFILE);
        assert!(p.use_pull);
        assert_eq!(p.cipher.as_deref(), Some("AES-256-GCM"));
        assert_eq!(p.auth.as_deref(), Some("SHA256"));
        assert!(p.expect_tls_cert);
        assert_eq!(p.authentication_type, AuthType::UserPass);
        assert!(!p.use_custom_config);

        assert_eq!(p.connections.len(), 2);
        assert_eq!(p.connections[0].server_name.as_deref(), Some("vpn.example.com"));
        assert!(p.connections[0].use_udp);
        assert_eq!(p.connections[1].server_port, "443");
        assert!(!p.connections[1].use_udp);
    }

    #[test]
    fn arity_error_names_option() {
        assert_eq!(
            parse_err("cipher\n"),
            "Option cipher has 0 parameters, expected between 1 and 1"
        );
    }

    // ── Routes ───────────────────────────────────────────────────

    #[test]
    fn route_included_with_default_gateway() {
        let p = parse("route 10.0.0.0 255.255.255.0 vpn_gateway\n");
        assert_eq!(p.custom_routes, vec!["10.0.0.0/24".parse().unwrap()]);
        assert!(p.excluded_routes.is_empty());
    }

    #[test]
    fn route_defaults_to_host_route() {
        let p = parse("route 192.168.7.7\n");
        assert_eq!(p.custom_routes[0].to_string(), "192.168.7.7/32");
    }

    #[test]
    fn net_gateway_route_excluded() {
        let p = parse("route 172.16.0.0 255.240.0.0 net_gateway\n");
        assert_eq!(p.excluded_routes[0].to_string(), "172.16.0.0/12");
        assert!(p.custom_routes.is_empty());
    }

    #[test]
    fn odd_route_warns_instead_of_failing() {
        let mut parser = ConfigParser::new();
        parser
            .parse_str("route 10.0.0.1 255.255.255.1\nroute 10.1.2.3 255.255.0.0\n")
            .unwrap();
        let p = parser.convert_profile().unwrap();
        assert_eq!(p.custom_routes[0].to_string(), "10.0.0.1/32");
        assert_eq!(p.custom_routes[1].to_string(), "10.1.0.0/16");
        assert_eq!(parser.warnings().len(), 2);
    }

    #[test]
    fn bad_route_netmask_is_error() {
        assert_eq!(
            parse_err("route 10.0.0.0 255.255.x.0\n"),
            "Could not parse netmask of route 255.255.x.0"
        );
    }

    #[test]
    fn ipv6_routes_collected() {
        let p = parse("route-ipv6 2001:db8::/32\nroute-ipv6 fd00::/8 ::1\n");
        assert_eq!(p.custom_routes_v6, vec!["2001:db8::/32", "fd00::/8"]);
    }

    #[test]
    fn redirect_gateway_flags() {
        let p = parse("redirect-gateway def1 ipv6 unblock-local\n");
        assert!(p.use_default_route);
        assert!(p.use_default_route_v6);
        assert!(p.allow_local_lan);

        let p = parse("redirect-gateway !ipv4 ipv6\n");
        assert!(!p.use_default_route);

        let p = parse("redirect-private def1\n");
        assert!(!p.use_default_route);
    }

    // ── Device / tuning ──────────────────────────────────────────

    #[test]
    fn only_tun_accepted() {
        assert!(parse_profile("dev tun0\n").is_ok());
        assert!(parse_profile("dev-type tun\ndev mydev\n").is_ok());
        assert_eq!(
            parse_err("dev tap\n"),
            "Sorry. Only tun mode is supported. See the FAQ for more detail"
        );
    }

    #[test]
    fn mssfix_and_tun_mtu() {
        assert_eq!(parse("mssfix\n").mss_fix, DEFAULT_MSSFIX);
        assert_eq!(parse("mssfix 1300 mtu\n").mss_fix, 1300);
        assert_eq!(parse_err("mssfix abc\n"), "Argument to --mssfix has to be an integer");
        assert_eq!(parse_err("mssfix 1300 fast\n"), "Second argument to --mssfix unknown");
        assert_eq!(parse("tun-mtu 1400\n").tun_mtu, 1400);
        assert_eq!(parse_err("tun-mtu big\n"), "Argument to --tun-mtu has to be an integer");
    }

    #[test]
    fn mode_must_be_p2p() {
        assert!(parse_profile("mode p2p\n").is_ok());
        assert_eq!(parse_err("mode server\n"), "Invalid mode for --mode specified, need p2p");
    }

    #[test]
    fn dhcp_options_fill_dns_slots() {
        let p = parse("dhcp-option DNS 1.1.1.1\ndhcp-option DNS 9.9.9.9\ndhcp-option DOMAIN corp.example\n");
        assert!(p.override_dns);
        assert_eq!(p.dns1, "1.1.1.1");
        assert_eq!(p.dns2, "9.9.9.9");
        assert_eq!(p.search_domain, "corp.example");
    }

    #[test]
    fn ifconfig_builds_cidr() {
        let p = parse("ifconfig 10.8.0.2 255.255.255.0\n");
        assert_eq!(p.ipv4_address.unwrap().to_string(), "10.8.0.2/24");
        assert!(parse_err("ifconfig nope 255.255.255.0\n").starts_with("Could not parse ifconfig IP address"));
    }

    // ── TLS / auth ───────────────────────────────────────────────

    #[test]
    fn tls_auth_variants() {
        let p = parse("tls-auth ta.key 1\n");
        assert!(p.use_tls_auth);
        assert_eq!(p.tls_auth_filename.as_deref(), Some("ta.key"));
        assert_eq!(p.tls_auth_direction.as_deref(), Some("1"));

        let p = parse("tls-auth [inline] 1\n");
        assert!(!p.use_tls_auth);
        assert_eq!(p.tls_auth_direction.as_deref(), Some("1"));

        let p = parse("<tls-crypt>\nKEY\n</tls-crypt>\n");
        assert!(p.use_tls_auth);
        assert_eq!(p.tls_auth_direction.as_deref(), Some("tls-crypt"));
        assert_eq!(p.tls_auth_filename.unwrap(), format!("{}KEY", INLINE_TAG));
    }

    #[test]
    fn inline_auth_user_pass() {
        let p = parse("<auth-user-pass>\nalice\ns3cret\n</auth-user-pass>\n");
        assert_eq!(p.username.as_deref(), Some("alice"));
        assert_eq!(p.password.as_deref(), Some("s3cret"));
        assert!(p.auth_user_pass_file.is_none());
    }

    #[test]
    fn auth_user_pass_file_reference() {
        let mut parser = ConfigParser::new();
        parser.parse_str("auth-user-pass creds.txt\n").unwrap();
        let p = parser.convert_profile().unwrap();
        assert_eq!(parser.auth_user_pass_file(), Some("creds.txt"));
        assert_eq!(p.auth_user_pass_file.as_deref(), Some("creds.txt"));
        assert!(p.username.is_none());
    }

    #[test]
    fn pkcs12_and_keystore_auth_types() {
        assert_eq!(parse("pkcs12 c.p12\n").authentication_type, AuthType::Pkcs12);
        assert_eq!(
            parse("pkcs12 c.p12\nauth-user-pass\n").authentication_type,
            AuthType::UserPassPkcs12
        );
        let p = parse("cryptoapicert \"SUBJ:me\"\n");
        assert_eq!(p.authentication_type, AuthType::Keystore);
        assert_eq!(p.alias.as_deref(), Some("SUBJ:me"));
        assert_eq!(
            parse("cryptoapicert x\nauth-user-pass\n").authentication_type,
            AuthType::UserPassKeystore
        );
    }

    #[test]
    fn x509_match_modes() {
        assert_eq!(parse("tls-remote srv\n").x509_auth_type, X509VerifyMode::TlsRemote);
        assert_eq!(
            parse("tls-remote srv\ncompat-names no-remapping\n").x509_auth_type,
            X509VerifyMode::TlsRemoteCompatNoRemapping
        );
        assert_eq!(
            parse("tls-remote srv\nno-name-remapping x\n").x509_auth_type,
            X509VerifyMode::TlsRemoteCompatNoRemapping
        );
        assert_eq!(parse("verify-x509-name srv\n").x509_auth_type, X509VerifyMode::Dn);
        assert_eq!(parse("verify-x509-name srv name\n").x509_auth_type, X509VerifyMode::Rdn);
        assert_eq!(parse("verify-x509-name srv subject\n").x509_auth_type, X509VerifyMode::Dn);
        assert_eq!(
            parse("verify-x509-name srv name-prefix\n").x509_auth_type,
            X509VerifyMode::RdnPrefix
        );
        assert_eq!(
            parse_err("verify-x509-name srv bogus\n"),
            "Unknown parameter to verify-x509-name: bogus"
        );
        assert!(parse("verify-x509-name srv name\n").check_remote_cn);
    }

    #[test]
    fn crl_verify_dir_goes_to_custom() {
        let p = parse("crl-verify /etc/crl dir\n");
        assert!(p.crl_filename.is_none());
        assert!(p.custom_config_options.contains("crl-verify /etc/crl dir\n"));

        let p = parse("crl-verify crl.pem\n");
        assert_eq!(p.crl_filename.as_deref(), Some("crl.pem"));
    }

    #[test]
    fn remote_cert_tls_client_kept() {
        let p = parse("remote-cert-tls client\n");
        assert!(!p.expect_tls_cert);
        assert!(p.custom_config_options.contains("remote-cert-tls client \n"));
    }

    // ── Connections ──────────────────────────────────────────────

    #[test]
    fn remote_and_connection_block_conflict() {
        assert_eq!(
            parse_err("remote a.example\n<connection>\nremote b.example\n</connection>\n"),
            "Using a <connection> block and --remote is not allowed."
        );
    }

    #[test]
    fn connection_block_inherits_defaults() {
        let p = parse(
            "proto tcp\nport 443\nlocal 10.0.0.5\n\
             <connection>\nremote a.example\n</connection>\n\
             <connection>\nremote b.example 1195 udp\nexplicit-exit-notify 2\n</connection>\n",
        );
        assert_eq!(p.connections.len(), 2);
        let a = &p.connections[0];
        assert_eq!(a.server_name.as_deref(), Some("a.example"));
        assert_eq!(a.server_port, "443");
        assert!(!a.use_udp);
        assert!(a.custom_configuration.contains("local 10.0.0.5 \n"));

        let b = &p.connections[1];
        assert_eq!(b.server_port, "1195");
        assert!(b.use_udp);
        assert!(b.custom_configuration.contains("explicit-exit-notify 2 \n"));
        assert!(b.use_custom_config);
    }

    #[test]
    fn connection_block_needs_one_remote() {
        assert_eq!(
            parse_err("<connection>\nport 1\n</connection>\n"),
            "A <connection> block must have exactly one remote"
        );
        assert_eq!(
            parse_err("<connection>\nremote a\nremote b\n</connection>\n"),
            "A <connection> block must have exactly one remote"
        );
    }

    #[test]
    fn proxies_parsed() {
        let p = parse("remote a.example\nsocks-proxy socks.lan\n");
        assert_eq!(p.connections[0].proxy_type, ProxyType::Socks5);
        assert_eq!(p.connections[0].proxy_name.as_deref(), Some("socks.lan"));
        assert_eq!(p.connections[0].proxy_port, "1080");

        let p = parse(
            "remote a.example\nhttp-proxy web.lan 3128\n\
             <http-proxy-user-pass>\nbob\npw\n</http-proxy-user-pass>\n",
        );
        let c = &p.connections[0];
        assert_eq!(c.proxy_type, ProxyType::Http);
        assert_eq!(c.proxy_port, "3128");
        assert!(c.use_proxy_auth);
        assert_eq!(c.proxy_auth_username.as_deref(), Some("bob"));
    }

    #[test]
    fn connect_timeout_must_be_integer() {
        assert!(parse_err("connect-timeout soon\n")
            .starts_with("Argument to connect-timeout (soon) must to be an integer"));
        assert_eq!(parse("remote a\nconnect-timeout 7\n").connections[0].connect_timeout, 7);
    }

    #[test]
    fn unsupported_proto_rejected() {
        assert_eq!(parse_err("proto sctp\n"), "Unsupported option to --proto sctp");
        assert!(is_udp_proto("udp6").unwrap());
        assert!(!is_udp_proto("tcp6-client").unwrap());
    }

    #[test]
    fn proto_force_disables_connections() {
        let p = parse("remote a 1 udp\nremote b 2 tcp\nproto-force udp\n");
        assert!(!p.connections[0].enabled);
        assert!(p.connections[1].enabled);
        assert_eq!(parse_err("proto-force sctp\n"), "Unknown protocol sctp in proto-force");
    }

    // ── Extensions / leftovers ───────────────────────────────────

    #[test]
    fn extension_tags_restore_identity() {
        let id = Uuid::new_v4();
        let p = parse(&format!("#? uuid {}\n#? name \"Home VPN\"\n", id));
        assert_eq!(p.uuid, id);
        assert_eq!(p.name, "Home VPN");
    }

    #[test]
    fn unsupported_options_abort() {
        assert_eq!(
            parse_err("tls-server\n"),
            "Unsupported Option tls-server encountered in config file. Aborting"
        );
    }

    #[test]
    fn leftovers_become_custom_config() {
        let p = parse("verb 3\nsetenv IV_GUI_VER x\nreneg-sec 0\nsetenv FOO \"a b\"\n");
        assert!(p.use_custom_config);
        assert!(p.custom_config_options.starts_with(CUSTOM_OPTIONS_HEADER));
        assert!(p.custom_config_options.contains("reneg-sec 0 \n"));
        assert!(p.custom_config_options.contains("setenv FOO \"a b\" \n"));
        assert!(!p.custom_config_options.contains("IV_GUI_VER"));
        assert!(!p.custom_config_options.contains("verb"));
    }

    #[test]
    fn only_ignored_leftovers_leave_custom_empty() {
        let p = parse("verb 3\nsetenv IV_SSO openurl\nresolv-retry 60\n");
        assert!(!p.use_custom_config);
        assert!(p.custom_config_options.is_empty());
    }

    // ── Round trip ───────────────────────────────────────────────

    #[test]
    fn generate_then_parse_keeps_structure() {
        let text = "\
client
dev tun
remote vpn.example.com 1194 udp
remote vpn2.example.com 443 tcp-client
http-proxy-option AGENT foo
http-proxy web.lan 3128
nobind
persist-tun
auth-user-pass
cipher AES-256-GCM
tls-crypt tc.key
verify-x509-name server.example name
route 10.10.0.0 255.255.0.0
route 192.168.0.0 255.255.255.0 net_gateway
route-ipv6 fd00::/8
dhcp-option DNS 10.10.0.1
dhcp-option DOMAIN corp.example
mssfix 1400
tun-mtu 1400
reneg-sec 3600
remote-random
";
        let first = parse(text);
        let opts = GenerateOptions {
            management_socket: "/run/mgmt".into(),
            use_system_proxy: true,
            ..Default::default()
        };
        let generated = first.generate_config(&opts).unwrap();
        let second = parse(&generated);

        assert_eq!(second.uuid, first.uuid);
        assert_eq!(second.name, first.name);
        assert_eq!(second.connections, first.connections);
        assert_eq!(second.custom_routes, first.custom_routes);
        assert_eq!(second.excluded_routes, first.excluded_routes);
        assert_eq!(second.custom_routes_v6, first.custom_routes_v6);
        assert_eq!(second.use_pull, first.use_pull);
        assert_eq!(second.nobind, first.nobind);
        assert_eq!(second.persist_tun, first.persist_tun);
        assert_eq!(second.remote_random, first.remote_random);
        assert_eq!(second.authentication_type, first.authentication_type);
        assert_eq!(second.cipher, first.cipher);
        assert_eq!(second.use_tls_auth, first.use_tls_auth);
        assert_eq!(second.tls_auth_direction, first.tls_auth_direction);
        assert_eq!(second.x509_auth_type, first.x509_auth_type);
        assert_eq!(second.remote_cn, first.remote_cn);
        assert_eq!(second.override_dns, first.override_dns);
        assert_eq!(second.dns1, first.dns1);
        assert_eq!(second.search_domain, first.search_domain);
        assert_eq!(second.mss_fix, first.mss_fix);
        assert_eq!(second.tun_mtu, first.tun_mtu);
        assert!(second.custom_config_options.contains("reneg-sec 3600 \n"));
    }
}
