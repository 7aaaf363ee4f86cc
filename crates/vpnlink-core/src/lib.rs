//! # vpnlink-core
//!
//! Platform-neutral core of a mobile VPN client that drives an external
//! tunnel engine over its management channel.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Shared enums, status payloads, errors |
//! | **cidr** | IPv4 network arithmetic |
//! | **profile** | Profile and connection model, validation, config generation |
//! | **config** | Tokenizer and config-dialect parser |
//! | **convert** | Parsed options → `Profile` |
//! | **settings** | JSON runtime tunables |
//! | **logging** | Log entries, ring buffers, engine log parsing, redaction |
//! | **tunnel** | Tunnel metadata extraction and traffic history |
//! | **status** | Status hub: status, logs and byte counts fan-out |
//! | **auth** | Credential lookup, password cache, password notices |
//! | **routing** | Route, DNS and address collection for the tunnel interface |
//! | **platform** | Host capabilities: signing, tunnel device, prompts, proxies |
//! | **management** | Management channel client, hold/release |
//! | **pause** | Network / screen / user pause controller |
//! | **service** | Session registry, control socket bind and accept |

pub mod vpn;
