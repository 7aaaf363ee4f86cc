//! Profile and Connection data model, plus rendering back to engine
//! configuration text.

use crate::vpn::cidr::CidrIp;
use crate::vpn::types::*;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use uuid::Uuid;

/// Marks an embedded file that also carries a display name.
pub const DISPLAYNAME_TAG: &str = "[[NAME]]";

/// Default connect timeout reported when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: u32 = 120;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One remote endpoint plus its transport and proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub enabled: bool,
    pub server_name: Option<String>,
    pub server_port: String,
    pub use_udp: bool,
    /// Zero means "engine default".
    pub connect_timeout: u32,
    pub use_custom_config: bool,
    pub custom_configuration: String,
    pub proxy_type: ProxyType,
    pub proxy_name: Option<String>,
    pub proxy_port: String,
    pub use_proxy_auth: bool,
    pub proxy_auth_username: Option<String>,
    pub proxy_auth_password: Option<String>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            enabled: true,
            server_name: None,
            server_port: "1194".into(),
            use_udp: true,
            connect_timeout: 0,
            use_custom_config: false,
            custom_configuration: String::new(),
            proxy_type: ProxyType::None,
            proxy_name: None,
            proxy_port: "1080".into(),
            use_proxy_auth: false,
            proxy_auth_username: None,
            proxy_auth_password: None,
        }
    }
}

impl Connection {
    pub fn effective_connect_timeout(&self) -> u32 {
        if self.connect_timeout > 0 {
            self.connect_timeout
        } else {
            DEFAULT_CONNECT_TIMEOUT
        }
    }

    pub fn uses_extra_proxy_options(&self) -> bool {
        self.use_custom_config && self.custom_configuration.contains("http-proxy-option ")
    }

    /// Host and port present and numeric, proxy complete when configured.
    pub fn check(&self) -> bool {
        let host_ok = self.server_name.as_deref().is_some_and(|s| !s.is_empty());
        if !host_ok || self.server_port.parse::<u16>().is_err() {
            return false;
        }
        if self.proxy_type != ProxyType::None {
            let name_ok = self.proxy_name.as_deref().is_some_and(|s| !s.is_empty());
            if !name_ok || self.proxy_port.parse::<u16>().is_err() {
                return false;
            }
        }
        true
    }

    /// Render the body of a `<connection>` block.
    pub fn connection_block(&self) -> Result<String, VpnError> {
        if !self.check() {
            return Err(VpnError::new(
                VpnErrorKind::InvalidProfile,
                "connection block format error",
            ));
        }
        let host = self.server_name.as_deref().unwrap_or_default();
        let ipv6 = host.contains(':');
        let mut cfg = format!("remote {} {}", host, self.server_port);
        if self.use_udp {
            cfg.push_str(if ipv6 { " udp6\n" } else { " udp\n" });
        } else {
            cfg.push_str(if ipv6 { " tcp6-client\n" } else { " tcp-client\n" });
            if self.connect_timeout != 0 {
                let _ = writeln!(cfg, "connect-timeout {}", self.connect_timeout);
            }
        }

        // Plain HTTP proxies are answered over the management channel.
        if self.proxy_type == ProxyType::Http && self.uses_extra_proxy_options() {
            let _ = writeln!(
                cfg,
                "http-proxy {} {}",
                self.proxy_name.as_deref().unwrap_or_default(),
                self.proxy_port
            );
            if self.use_proxy_auth {
                let _ = write!(
                    cfg,
                    "<http-proxy-user-pass>\n{}\n{}\n</http-proxy-user-pass>\n",
                    self.proxy_auth_username.as_deref().unwrap_or_default(),
                    self.proxy_auth_password.as_deref().unwrap_or_default()
                );
            }
        }
        if self.proxy_type == ProxyType::Socks5 {
            let _ = writeln!(
                cfg,
                "socks-proxy {} {}",
                self.proxy_name.as_deref().unwrap_or_default(),
                self.proxy_port
            );
        }
        if self.use_custom_config && !self.custom_configuration.is_empty() {
            let _ = writeln!(cfg, "{}", self.custom_configuration);
        }
        Ok(cfg.trim().to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Profile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured result of parsing a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub uuid: Uuid,
    pub name: String,

    pub authentication_type: AuthType,
    pub ca_filename: Option<String>,
    pub crl_filename: Option<String>,
    pub pkcs12_filename: Option<String>,
    /// Keystore alias used by the signer for keystore auth types.
    pub alias: Option<String>,
    pub protect_password: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// External `auth-user-pass` file the caller still has to resolve.
    pub auth_user_pass_file: Option<String>,

    pub use_tls_auth: bool,
    /// `0`/`1` for tls-auth, or `tls-crypt`/`tls-crypt-v2`.
    pub tls_auth_direction: Option<String>,
    pub tls_auth_filename: Option<String>,

    pub connections: Vec<Connection>,
    pub remote_random: bool,
    pub use_random_hostname: bool,
    pub use_float: bool,

    pub connect_retry_max: String,
    pub connect_retry: String,
    pub connect_retry_max_time: String,

    pub use_pull: bool,
    pub nobind: bool,
    pub ipv4_address: Option<CidrIp>,
    pub ipv6_address: Option<String>,

    pub tun_mtu: u32,
    pub mss_fix: u32,
    pub persist_tun: bool,

    pub route_no_pull: bool,
    pub allow_local_lan: bool,
    pub use_default_route: bool,
    pub custom_routes: Vec<CidrIp>,
    pub excluded_routes: Vec<CidrIp>,
    pub use_default_route_v6: bool,
    pub custom_routes_v6: Vec<String>,

    pub override_dns: bool,
    pub dns1: String,
    pub dns2: String,
    pub search_domain: String,

    pub expect_tls_cert: bool,
    pub check_remote_cn: bool,
    pub remote_cn: Option<String>,
    pub x509_auth_type: X509VerifyMode,
    pub x509_username_field: Option<String>,

    pub use_custom_config: bool,
    pub custom_config_options: String,

    pub tls_version: Option<String>,
    pub cipher: Option<String>,
    pub auth: Option<String>,
    pub use_lzo: bool,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            authentication_type: AuthType::default(),
            ca_filename: None,
            crl_filename: None,
            pkcs12_filename: None,
            alias: None,
            protect_password: None,
            username: None,
            password: None,
            auth_user_pass_file: None,
            use_tls_auth: false,
            tls_auth_direction: Some("0".into()),
            tls_auth_filename: None,
            connections: vec![Connection::default()],
            remote_random: false,
            use_random_hostname: false,
            use_float: false,
            connect_retry_max: "-1".into(),
            connect_retry: "2".into(),
            connect_retry_max_time: "300".into(),
            use_pull: true,
            nobind: true,
            ipv4_address: None,
            ipv6_address: None,
            tun_mtu: 0,
            mss_fix: 0,
            persist_tun: false,
            route_no_pull: false,
            allow_local_lan: false,
            use_default_route: false,
            custom_routes: Vec::new(),
            excluded_routes: Vec::new(),
            use_default_route_v6: false,
            custom_routes_v6: Vec::new(),
            override_dns: false,
            dns1: DEFAULT_DNS1.into(),
            dns2: DEFAULT_DNS2.into(),
            search_domain: String::new(),
            expect_tls_cert: false,
            check_remote_cn: false,
            remote_cn: None,
            x509_auth_type: X509VerifyMode::default(),
            x509_username_field: None,
            use_custom_config: false,
            custom_config_options: String::new(),
            tls_version: None,
            cipher: None,
            auth: None,
            use_lzo: true,
        }
    }

    /// Reset the fields a freshly imported config must not inherit.
    pub fn clear_defaults(&mut self) {
        self.use_pull = true;
        self.use_lzo = true;
        self.use_tls_auth = false;
        self.expect_tls_cert = false;
        self.check_remote_cn = false;
        self.persist_tun = false;
        self.allow_local_lan = false;
        self.mss_fix = 0;
        self.nobind = true;
        self.use_default_route = false;
        self.use_default_route_v6 = false;
    }

    pub fn uuid_string(&self) -> String {
        self.uuid.to_string()
    }

    pub fn uses_extra_proxy_options(&self) -> bool {
        if self.use_custom_config && self.custom_config_options.contains("http-proxy-option ") {
            return true;
        }
        self.connections.iter().any(Connection::uses_extra_proxy_options)
    }

    /// Validate before launch.
    pub fn check(&self) -> Result<(), VpnError> {
        let invalid = |msg: &str| Err(VpnError::new(VpnErrorKind::InvalidProfile, msg));

        match self.connections.iter().find(|c| c.enabled) {
            None => return invalid("No server selected"),
            Some(c) if !c.check() => return invalid("Server address or port is invalid"),
            Some(_) => {}
        }
        if self.authentication_type.uses_keystore() && self.alias.is_none() {
            return invalid("No keystore certificate selected");
        }
        if self.authentication_type.uses_pkcs12()
            && self.pkcs12_filename.as_deref().map_or(true, str::is_empty)
        {
            return invalid("No PKCS12 file selected");
        }
        if self.check_remote_cn && self.x509_auth_type == X509VerifyMode::TlsRemote {
            return invalid("tls-remote is deprecated, use verify-x509-name");
        }
        if self.use_tls_auth && self.tls_auth_filename.as_deref().map_or(true, str::is_empty) {
            return invalid("TLS auth file is missing");
        }
        Ok(())
    }

    /// Render the full engine configuration.
    pub fn generate_config(&self, opts: &GenerateOptions) -> Result<String, VpnError> {
        let mut cfg = String::new();

        let _ = writeln!(cfg, "#? uuid {}", self.uuid);
        let _ = writeln!(cfg, "#? name {}", escape(&self.name));
        cfg.push_str("setenv FORWARD_COMPATIBLE 1\n\n");

        let _ = writeln!(cfg, "management {} unix", opts.management_socket.display());
        cfg.push_str("management-client\n");
        cfg.push_str("management-query-passwords\n");
        cfg.push_str("management-hold\n\n");

        let _ = writeln!(cfg, "setenv IV_PLAT_VER {}", escape(&opts.platform_version));
        let _ = writeln!(cfg, "setenv IV_GUI_VER {}", escape(&opts.gui_version));
        cfg.push_str("setenv IV_SSO openurl,crtext\n\n");

        cfg.push_str("machine-readable-output\n");
        cfg.push_str("allow-recursive-routing\n");
        cfg.push_str("dev tun\n");
        cfg.push_str("verb 4\n\n");

        cfg.push_str(if self.use_pull { "client\n" } else { "tls-client\n" });
        cfg.push_str("tls-exit\n");

        let mut cabuf = String::new();
        if self.authentication_type.uses_password() {
            cfg.push_str("auth-user-pass\n");
        }
        if self.authentication_type.uses_pkcs12() {
            cfg.push_str(&insert_file_data("pkcs12", self.pkcs12_filename.as_deref()));
        }
        if self.authentication_type.uses_keystore() {
            cfg.push_str("management-external-key nopadding\n");
            let chain = opts.cert_chain.as_ref().ok_or_else(|| {
                VpnError::new(
                    VpnErrorKind::InvalidProfile,
                    "Could not access the keystore certificate chain",
                )
            })?;
            if let Some(leaf) = chain.first() {
                cfg.push_str("<cert>\n");
                push_line(&mut cfg, leaf);
                cfg.push_str("</cert>\n");
            }
            for extra in chain.iter().skip(1) {
                push_line(&mut cabuf, extra);
            }
        }

        if let Some(ca) = self.ca_filename.as_deref().filter(|s| !s.is_empty()) {
            push_line(&mut cabuf, &insert_file_data("", Some(ca)));
        }
        if !cabuf.is_empty() {
            cfg.push_str("<ca>\n");
            push_line(&mut cfg, &cabuf);
            cfg.push_str("</ca>\n");
        }

        if let Some(crl) = self.crl_filename.as_deref().filter(|s| !s.is_empty()) {
            cfg.push_str(&insert_file_data("crl-verify", Some(crl)));
        }

        if self.use_tls_auth {
            match self.tls_auth_direction.as_deref() {
                Some(kind @ ("tls-crypt" | "tls-crypt-v2")) => {
                    cfg.push_str(&insert_file_data(kind, self.tls_auth_filename.as_deref()));
                }
                direction => {
                    cfg.push_str(&insert_file_data(
                        "tls-auth",
                        self.tls_auth_filename.as_deref(),
                    ));
                    if let Some(d) = direction.filter(|d| !d.is_empty()) {
                        let _ = writeln!(cfg, "key-direction {}", d);
                    }
                }
            }
        }

        if let Some(v) = self.tls_version.as_deref().filter(|s| !s.is_empty()) {
            let _ = writeln!(cfg, "tls-version {}", v);
        }

        if self.check_remote_cn {
            match self.remote_cn.as_deref().filter(|s| !s.is_empty()) {
                None => {
                    let server = self
                        .connections
                        .first()
                        .and_then(|c| c.server_name.as_deref())
                        .unwrap_or_default();
                    let _ = writeln!(cfg, "verify-x509-name {} name", escape(server));
                }
                Some(cn) => match self.x509_auth_type {
                    X509VerifyMode::TlsRemoteCompatNoRemapping => {
                        cfg.push_str("compat-names no-remapping\n");
                        let _ = writeln!(cfg, "tls-remote {}", escape(cn));
                    }
                    X509VerifyMode::TlsRemote => {
                        let _ = writeln!(cfg, "tls-remote {}", escape(cn));
                    }
                    X509VerifyMode::Rdn => {
                        let _ = writeln!(cfg, "verify-x509-name {} name", escape(cn));
                    }
                    X509VerifyMode::RdnPrefix => {
                        let _ = writeln!(cfg, "verify-x509-name {} name-prefix", escape(cn));
                    }
                    X509VerifyMode::Dn => {
                        let _ = writeln!(cfg, "verify-x509-name {}", escape(cn));
                    }
                },
            }
            if let Some(field) = self.x509_username_field.as_deref().filter(|s| !s.is_empty()) {
                let _ = writeln!(cfg, "x509-username-field {}", escape(field));
            }
        }
        if self.expect_tls_cert {
            cfg.push_str("remote-cert-tls server\n");
        }

        if let Some(cipher) = self.cipher.as_deref().filter(|s| !s.is_empty()) {
            let _ = writeln!(cfg, "cipher {}", cipher);
        }
        if let Some(auth) = self.auth.as_deref().filter(|s| !s.is_empty()) {
            let _ = writeln!(cfg, "auth {}", auth);
        }
        if self.use_lzo {
            cfg.push_str("comp-lzo\n");
        }
        if self.use_random_hostname {
            cfg.push_str("remote-random-hostname\n");
        }
        if self.use_float {
            cfg.push_str("float\n");
        }
        if self.persist_tun {
            cfg.push_str("persist-tun\n");
            cfg.push_str("preresolve\n");
        }
        if opts.use_system_proxy && !self.uses_extra_proxy_options() {
            cfg.push_str("management-query-proxy\n");
        }

        if self.mss_fix != 0 {
            if self.mss_fix != DEFAULT_MSSFIX {
                let _ = writeln!(cfg, "mssfix {}", self.mss_fix);
            } else {
                cfg.push_str("mssfix\n");
            }
        }
        if self.tun_mtu >= 48 && self.tun_mtu != 1500 {
            let _ = writeln!(cfg, "tun-mtu {}", self.tun_mtu);
        }
        if self.nobind {
            cfg.push_str("nobind\n");
        }

        if self.use_custom_config {
            cfg.push('\n');
            push_line(&mut cfg, &self.custom_config_options);
        }

        // Connection blocks go last so global options apply to them.
        let mut use_tcp = false;
        let mut connbuf = String::new();
        for conn in self.connections.iter().filter(|c| c.enabled && c.check()) {
            if !conn.use_udp {
                use_tcp = true;
            }
            connbuf.push_str("<connection>\n");
            push_line(&mut connbuf, &conn.connection_block()?);
            connbuf.push_str("</connection>\n");
        }
        if connbuf.is_empty() {
            return Err(VpnError::new(
                VpnErrorKind::InvalidProfile,
                "No server selected",
            ));
        }

        cfg.push('\n');
        if self.remote_random && self.connections.len() > 1 {
            cfg.push_str("remote-random\n");
        }
        if use_tcp {
            if self.connect_retry_max != "-1" && !self.connect_retry_max.is_empty() {
                let _ = writeln!(cfg, "connect-retry-max {}", self.connect_retry_max);
            }
            let retry = non_empty_or(&self.connect_retry, "2");
            let max_time = non_empty_or(&self.connect_retry_max_time, "300");
            let _ = writeln!(cfg, "connect-retry {} {}", retry, max_time);
        }
        cfg.push_str("resolv-retry 0\n");
        cfg.push_str(&connbuf);
        cfg.push_str("ifconfig-nowarn\n\n");

        if !self.use_pull {
            if let Some(addr) = &self.ipv4_address {
                let _ = writeln!(cfg, "ifconfig {}", addr.to_ip_and_netmask());
            }
            if let Some(v6) = self.ipv6_address.as_deref().filter(|s| !s.is_empty()) {
                let fake_gw = v6.split('/').next().unwrap_or(v6);
                let _ = writeln!(cfg, "ifconfig-ipv6 {} {}", v6, fake_gw);
            }
        }
        if self.use_pull && self.route_no_pull {
            cfg.push_str("route-nopull\n");
        }

        if self.use_default_route {
            cfg.push_str("route 0.0.0.0 0.0.0.0 vpn_gateway\n");
        } else {
            for route in &self.custom_routes {
                let _ = writeln!(cfg, "route {} vpn_gateway", route.to_ip_and_netmask());
            }
            for route in &self.excluded_routes {
                let _ = writeln!(cfg, "route {} net_gateway", route.to_ip_and_netmask());
            }
        }
        if self.use_default_route_v6 {
            cfg.push_str("route-ipv6 ::/0\n");
        } else {
            for route in &self.custom_routes_v6 {
                let _ = writeln!(cfg, "route-ipv6 {}", route);
            }
        }

        if self.override_dns || !self.use_pull {
            if !self.dns1.is_empty() {
                let _ = writeln!(cfg, "dhcp-option DNS {}", self.dns1);
            }
            if !self.dns2.is_empty() {
                let _ = writeln!(cfg, "dhcp-option DNS {}", self.dns2);
            }
            if !self.search_domain.is_empty() {
                let _ = writeln!(cfg, "dhcp-option DOMAIN {}", self.search_domain);
            }
        }

        Ok(cfg)
    }
}

/// Inputs to [`Profile::generate_config`] that come from the host, not the profile.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub management_socket: PathBuf,
    pub platform_version: String,
    pub gui_version: String,
    pub use_system_proxy: bool,
    /// PEM certificates for keystore auth, leaf first.
    pub cert_chain: Option<Vec<String>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Text helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Quote a token so the config tokenizer reads it back unchanged.
pub fn escape(unescaped: &str) -> String {
    let escaped = unescaped
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");

    if escaped == unescaped
        && !escaped.contains(' ')
        && !escaped.contains('#')
        && !escaped.contains(';')
        && !escaped.is_empty()
    {
        unescaped.to_string()
    } else {
        format!("\"{}\"", escaped)
    }
}

pub fn is_embedded(data: &str) -> bool {
    data.starts_with(INLINE_TAG) || data.starts_with(DISPLAYNAME_TAG)
}

/// Content after the inline tag, or the input unchanged.
pub fn embedded_content(data: &str) -> &str {
    match data.find(INLINE_TAG) {
        Some(i) => &data[i + INLINE_TAG.len()..],
        None => data,
    }
}

/// Render a file-valued option either inline or as a path reference.
pub fn insert_file_data(entry: &str, data: Option<&str>) -> String {
    match data {
        None => format!("{} file missing in config profile\n", entry),
        Some(d) if is_embedded(d) => {
            let content = embedded_content(d);
            if entry.is_empty() {
                content.to_string()
            } else {
                format!("<{e}>\n{c}\n</{e}>\n", e = entry, c = content)
            }
        }
        Some(d) => format!("{} {}\n", entry, escape(d)),
    }
}

fn push_line(buf: &mut String, text: &str) {
    buf.push_str(text);
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str) -> Connection {
        Connection {
            server_name: Some(host.into()),
            ..Default::default()
        }
    }

    // ── escape / file data ───────────────────────────────────────

    #[test]
    fn escape_plain_token_unchanged() {
        assert_eq!(escape("AES-256-GCM"), "AES-256-GCM");
    }

    #[test]
    fn escape_quotes_special_tokens() {
        assert_eq!(escape("a b"), "\"a b\"");
        assert_eq!(escape(""), "\"\"");
        assert_eq!(escape("x#y"), "\"x#y\"");
        assert_eq!(escape("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(escape("c:\\dir"), "\"c:\\\\dir\"");
        assert_eq!(escape("l1\nl2"), "\"l1\\nl2\"");
    }

    #[test]
    fn insert_file_data_variants() {
        assert_eq!(
            insert_file_data("ca", None),
            "ca file missing in config profile\n"
        );
        assert_eq!(insert_file_data("ca", Some("ca.crt")), "ca ca.crt\n");
        let inline = format!("{}-----BEGIN-----", INLINE_TAG);
        assert_eq!(
            insert_file_data("ca", Some(&inline)),
            "<ca>\n-----BEGIN-----\n</ca>\n"
        );
        assert_eq!(insert_file_data("", Some(&inline)), "-----BEGIN-----");
    }

    // ── Connection ───────────────────────────────────────────────

    #[test]
    fn connection_defaults() {
        let c = Connection::default();
        assert!(c.enabled);
        assert!(c.use_udp);
        assert_eq!(c.server_port, "1194");
        assert_eq!(c.effective_connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert!(!c.check());
    }

    #[test]
    fn connection_block_udp_and_tcp() {
        let c = server("vpn.example.com");
        assert_eq!(c.connection_block().unwrap(), "remote vpn.example.com 1194 udp");

        let mut tcp = server("2001:db8::1");
        tcp.use_udp = false;
        tcp.connect_timeout = 15;
        assert_eq!(
            tcp.connection_block().unwrap(),
            "remote 2001:db8::1 1194 tcp6-client\nconnect-timeout 15"
        );
    }

    #[test]
    fn connection_block_socks_proxy() {
        let mut c = server("vpn.example.com");
        c.proxy_type = ProxyType::Socks5;
        c.proxy_name = Some("proxy.lan".into());
        assert!(c
            .connection_block()
            .unwrap()
            .contains("socks-proxy proxy.lan 1080"));
    }

    #[test]
    fn connection_check_rejects_bad_proxy() {
        let mut c = server("vpn.example.com");
        c.proxy_type = ProxyType::Http;
        assert!(!c.check());
        c.proxy_name = Some("p".into());
        c.proxy_port = "nope".into();
        assert!(!c.check());
        assert!(c.connection_block().is_err());
    }

    // ── Profile ──────────────────────────────────────────────────

    #[test]
    fn check_requires_enabled_connection() {
        let mut p = Profile::new("t");
        p.authentication_type = AuthType::UserPass;
        assert!(p.check().is_err());
        p.connections = vec![server("a.example")];
        assert!(p.check().is_ok());
        p.connections[0].enabled = false;
        assert!(p.check().is_err());
    }

    #[test]
    fn check_keystore_needs_alias() {
        let mut p = Profile::new("t");
        p.connections = vec![server("a.example")];
        p.authentication_type = AuthType::Keystore;
        let err = p.check().unwrap_err();
        assert_eq!(err.kind, VpnErrorKind::InvalidProfile);
        p.alias = Some("client".into());
        assert!(p.check().is_ok());
    }

    #[test]
    fn generate_config_basic_layout() {
        let mut p = Profile::new("office");
        p.authentication_type = AuthType::UserPass;
        p.connections = vec![server("vpn.example.com")];
        p.custom_routes = vec!["10.0.0.0/24".parse().unwrap()];
        let opts = GenerateOptions {
            management_socket: PathBuf::from("/tmp/mgmt"),
            use_system_proxy: true,
            ..Default::default()
        };
        let cfg = p.generate_config(&opts).unwrap();
        assert!(cfg.starts_with(&format!("#? uuid {}\n#? name office\n", p.uuid)));
        assert!(cfg.contains("management /tmp/mgmt unix\n"));
        assert!(cfg.contains("management-hold\n"));
        assert!(cfg.contains("auth-user-pass\n"));
        assert!(cfg.contains("management-query-proxy\n"));
        assert!(cfg.contains("<connection>\nremote vpn.example.com 1194 udp\n</connection>\n"));
        assert!(cfg.contains("route 10.0.0.0 255.255.255.0 vpn_gateway\n"));
        assert!(!cfg.contains("dhcp-option"));
    }

    #[test]
    fn generate_config_without_server_fails() {
        let p = Profile::new("empty");
        let err = p.generate_config(&GenerateOptions::default()).unwrap_err();
        assert_eq!(err.kind, VpnErrorKind::InvalidProfile);
    }

    #[test]
    fn generate_config_keystore_needs_chain() {
        let mut p = Profile::new("ks");
        p.authentication_type = AuthType::Keystore;
        p.connections = vec![server("vpn.example.com")];
        assert!(p.generate_config(&GenerateOptions::default()).is_err());

        let opts = GenerateOptions {
            cert_chain: Some(vec!["LEAF".into(), "INTERMEDIATE".into()]),
            ..Default::default()
        };
        let cfg = p.generate_config(&opts).unwrap();
        assert!(cfg.contains("management-external-key nopadding\n<cert>\nLEAF\n</cert>\n"));
        assert!(cfg.contains("<ca>\nINTERMEDIATE\n</ca>\n"));
    }

    #[test]
    fn generate_config_tcp_retry_and_dns() {
        let mut p = Profile::new("tcp");
        p.authentication_type = AuthType::UserPass;
        let mut c = server("vpn.example.com");
        c.use_udp = false;
        p.connections = vec![c];
        p.override_dns = true;
        p.dns1 = "1.1.1.1".into();
        p.search_domain = "corp.example".into();
        let cfg = p.generate_config(&GenerateOptions::default()).unwrap();
        assert!(cfg.contains("connect-retry 2 300\n"));
        assert!(cfg.contains("dhcp-option DNS 1.1.1.1\n"));
        assert!(cfg.contains("dhcp-option DOMAIN corp.example\n"));
    }
}
