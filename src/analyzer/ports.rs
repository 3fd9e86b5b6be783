//! Port-based analyzer activation
//!
//! Maps (transport, responder port) to the set of analyzer tags to try
//! on a new connection. One map per transport; ports are host order.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::core::packet::Transport;
use crate::runtime::Reporter;

use super::AnalyzerTag;

#[derive(Debug, Default)]
pub struct PortTable {
    tcp: HashMap<u16, BTreeSet<AnalyzerTag>>,
    udp: HashMap<u16, BTreeSet<AnalyzerTag>>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_mut(
        &mut self,
        transport: Transport,
        reporter: &Reporter,
    ) -> Option<&mut HashMap<u16, BTreeSet<AnalyzerTag>>> {
        match transport {
            Transport::Tcp => Some(&mut self.tcp),
            Transport::Udp => Some(&mut self.udp),
            _ => {
                reporter.internal_warning("unsupported transport protocol in port table");
                None
            }
        }
    }

    /// Register a tag for a port. Idempotent; inserting twice is one
    /// entry. Returns false only for an unsupported transport.
    pub fn register(
        &mut self,
        tag: AnalyzerTag,
        transport: Transport,
        port: u16,
        reporter: &Reporter,
    ) -> bool {
        let Some(map) = self.map_mut(transport, reporter) else {
            return false;
        };
        debug!("registering analyzer {} for port {}/{}", tag, port, transport);
        map.entry(port).or_default().insert(tag);
        true
    }

    /// Unregister a tag from a port. Removing a tag that was never
    /// registered is still a successful unregistration.
    pub fn unregister(
        &mut self,
        tag: AnalyzerTag,
        transport: Transport,
        port: u16,
        reporter: &Reporter,
    ) -> bool {
        let Some(map) = self.map_mut(transport, reporter) else {
            return true;
        };
        if let Some(set) = map.get_mut(&port) {
            debug!(
                "unregistering analyzer {} for port {}/{}",
                tag, port, transport
            );
            set.remove(&tag);
        }
        true
    }

    /// Look up the tag set for a port. Never creates an entry; an
    /// unsupported transport is reported and returns `None`.
    pub fn lookup(
        &self,
        transport: Transport,
        port: u16,
        reporter: &Reporter,
    ) -> Option<&BTreeSet<AnalyzerTag>> {
        let map = match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
            _ => {
                reporter.internal_warning("unsupported transport protocol in port table");
                return None;
            }
        };
        map.get(&port)
    }

    pub(crate) fn tcp_entries(&self) -> impl Iterator<Item = (&u16, &BTreeSet<AnalyzerTag>)> {
        self.tcp.iter()
    }

    pub(crate) fn udp_entries(&self) -> impl Iterator<Item = (&u16, &BTreeSet<AnalyzerTag>)> {
        self.udp.iter()
    }
}
