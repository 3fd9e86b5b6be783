//! Configuration
//!
//! Everything the dispatch and tree-building layers consult at runtime:
//! dynamic-protocol-detection switches, TCP content delivery, the
//! likely-server-ports table, stepping-stone exemptions, and tunnel
//! ports. Values come from a TOML file or are set programmatically;
//! hot-path lookups go through read-through mirror caches.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::packet::Transport;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dpd: DpdConfig,

    #[serde(default)]
    pub tcp: TcpContentConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Ports that likely belong to servers, stored with the transport
    /// mask already folded in (see [`Transport::server_port_mask`]).
    #[serde(default)]
    pub likely_server_ports: BTreeSet<u32>,

    /// Originator addresses exempt from stepping-stone analysis.
    #[serde(default)]
    pub stp_skip_src: BTreeSet<IpAddr>,
}

/// Dynamic protocol detection switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpdConfig {
    /// Disable port-based analyzer activation entirely.
    pub ignore_ports: bool,

    /// Turn on TCP reassembly from the very first packet of every
    /// connection rather than waiting for protocol detection.
    pub reassemble_first_packets: bool,
}

impl Default for DpdConfig {
    fn default() -> Self {
        Self {
            ignore_ports: false,
            reassemble_first_packets: false,
        }
    }
}

/// TCP content capture and delivery.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TcpContentConfig {
    /// Master switch for TCP content capture.
    pub contents: bool,

    /// Deliver originator-side contents for every connection.
    pub deliver_all_orig: bool,

    /// Deliver responder-side contents for every connection.
    pub deliver_all_resp: bool,

    /// Responder ports for which originator-side contents are wanted.
    pub content_delivery_ports_orig: BTreeSet<u16>,

    /// Responder ports for which responder-side contents are wanted.
    pub content_delivery_ports_resp: BTreeSet<u16>,
}

/// Session-table tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a TCP connection may sit idle before a fresh SYN on the
    /// same 5-tuple is treated as connection reuse.
    pub tcp_reuse_idle: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tcp_reuse_idle: 300.0,
        }
    }
}

/// Tunnel decoder ports, published to the packet-analysis side at
/// startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TunnelConfig {
    /// VXLAN UDP ports. Required: startup fails when unset.
    pub vxlan_ports: Option<Vec<u16>>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Insert a (transport, port) pair into the likely-server table,
    /// folding in the transport mask.
    pub fn add_likely_server_port(&mut self, transport: Transport, port: u16) {
        self.likely_server_ports
            .insert(transport.server_port_mask() | u32::from(port));
    }
}

/// Read-through caches over the script-visible tables.
///
/// Populated lazily on first lookup and dropped on
/// [`ScriptMirrors::invalidate`], so reconfiguration takes effect at the
/// next packet rather than mid-lookup.
#[derive(Debug, Default)]
pub struct ScriptMirrors {
    likely_server_ports: RwLock<Option<HashSet<u32>>>,
    stp_skip_src: RwLock<Option<HashSet<IpAddr>>>,
    content_ports_orig: RwLock<Option<HashSet<u16>>>,
    content_ports_resp: RwLock<Option<HashSet<u16>>>,
}

impl ScriptMirrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is (transport, port) in the likely-server-ports table? The
    /// transport mask is combined with the port before the lookup.
    pub fn is_likely_server_port(&self, config: &Config, transport: Transport, port: u16) -> bool {
        let masked = transport.server_port_mask() | u32::from(port);
        {
            let cache = self.likely_server_ports.read();
            if let Some(set) = cache.as_ref() {
                return set.contains(&masked);
            }
        }
        let set: HashSet<u32> = config.likely_server_ports.iter().copied().collect();
        let hit = set.contains(&masked);
        *self.likely_server_ports.write() = Some(set);
        hit
    }

    /// Is this originator exempt from stepping-stone analysis?
    pub fn stp_skip(&self, config: &Config, addr: IpAddr) -> bool {
        {
            let cache = self.stp_skip_src.read();
            if let Some(set) = cache.as_ref() {
                return set.contains(&addr);
            }
        }
        let set: HashSet<IpAddr> = config.stp_skip_src.iter().copied().collect();
        let hit = set.contains(&addr);
        *self.stp_skip_src.write() = Some(set);
        hit
    }

    pub fn content_port_orig(&self, config: &Config, port: u16) -> bool {
        {
            let cache = self.content_ports_orig.read();
            if let Some(set) = cache.as_ref() {
                return set.contains(&port);
            }
        }
        let set: HashSet<u16> = config.tcp.content_delivery_ports_orig.iter().copied().collect();
        let hit = set.contains(&port);
        *self.content_ports_orig.write() = Some(set);
        hit
    }

    pub fn content_port_resp(&self, config: &Config, port: u16) -> bool {
        {
            let cache = self.content_ports_resp.read();
            if let Some(set) = cache.as_ref() {
                return set.contains(&port);
            }
        }
        let set: HashSet<u16> = config.tcp.content_delivery_ports_resp.iter().copied().collect();
        let hit = set.contains(&port);
        *self.content_ports_resp.write() = Some(set);
        hit
    }

    /// Drop all caches; the next lookup repopulates from the config.
    pub fn invalidate(&self) {
        *self.likely_server_ports.write() = None;
        *self.stp_skip_src.write() = None;
        *self.content_ports_orig.write() = None;
        *self.content_ports_resp.write() = None;
    }
}
