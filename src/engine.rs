//! Packet dispatch engine
//!
//! `Engine` is the explicit context tying the pieces together: the
//! analyzer registry, port table, scheduled-analyzer table, session
//! table, event hub, reporter, and the simulated clock. Lifecycle:
//! `new`, then `pre_script_init`, then startup registrations, then
//! `post_script_init`, then `process_packet` per packet, finally
//! `done`.
//!
//! Per packet the dispatcher forms the connection tuple, finds or
//! creates the connection (detecting 5-tuple reuse), and delivers the
//! packet to the connection's analyzer tree.

use std::collections::BTreeSet;
use std::net::IpAddr;

use tracing::{debug, info};

use crate::analyzer::adapters::{register_builtin_analyzers, BuiltinTags};
use crate::analyzer::ports::PortTable;
use crate::analyzer::registry::AnalyzerRegistry;
use crate::analyzer::scheduled::{ConnIndex, ScheduledTable};
use crate::analyzer::tree::{self, TreeContext};
use crate::analyzer::{Analyzer, AnalyzerCtx, AnalyzerTag};
use crate::config::{Config, ScriptMirrors};
use crate::core::connection::{ConnKey, Connection};
use crate::core::event::{EventHub, EventKind};
use crate::core::packet::{ConnTuple, Packet, TcpFlags, Transport};
use crate::core::time::{NetworkTime, RunState};
use crate::errors::Result;
use crate::runtime::Reporter;
use crate::session::SessionTable;

/// Borrow the tree-builder context out of the engine, field by field,
/// so a connection borrowed from the session table stays usable.
macro_rules! tree_context {
    ($engine:expr) => {
        TreeContext {
            registry: &$engine.registry,
            ports: &$engine.ports,
            scheduled: &$engine.scheduled,
            config: &$engine.config,
            mirrors: &$engine.mirrors,
            builtins: &$engine.builtins,
            run_state: &$engine.run_state,
            events: &$engine.events,
            reporter: &$engine.reporter,
        }
    };
}

pub struct Engine {
    pub config: Config,
    pub registry: AnalyzerRegistry,
    pub ports: PortTable,
    pub scheduled: ScheduledTable,
    pub sessions: SessionTable,
    pub events: EventHub,
    pub reporter: Reporter,
    pub run_state: RunState,
    mirrors: ScriptMirrors,
    builtins: BuiltinTags,
    vxlan_ports: Vec<u16>,
}

impl Engine {
    /// Build an engine with the built-in analyzers registered.
    pub fn new(config: Config) -> Result<Self> {
        let mut registry = AnalyzerRegistry::new();
        register_builtin_analyzers(&mut registry)?;

        Ok(Self {
            config,
            registry,
            ports: PortTable::new(),
            scheduled: ScheduledTable::new(),
            sessions: SessionTable::new(),
            events: EventHub::new(),
            reporter: Reporter::new(),
            run_state: RunState::new(),
            mirrors: ScriptMirrors::new(),
            builtins: BuiltinTags::default(),
            vxlan_ports: Vec::new(),
        })
    }

    /// Cache the built-in analyzer tags. Runs before startup scripts
    /// touch the registry.
    pub fn pre_script_init(&mut self) {
        self.builtins = BuiltinTags::cache(&self.registry);
    }

    /// Finish startup after all registrations are in. Publishes the
    /// VXLAN tunnel ports; their absence is fatal.
    pub fn post_script_init(&mut self) -> Result<()> {
        let Some(ports) = self.config.tunnel.vxlan_ports.clone() else {
            return Err(self.reporter.fatal("Tunnel::vxlan_ports"));
        };
        self.vxlan_ports = ports;
        self.mirrors.invalidate();

        info!(
            "analyzer engine ready, {} analyzer kinds registered",
            self.registry.len()
        );
        Ok(())
    }

    /// Tear down all live connections and drop pending expectations.
    pub fn done(&mut self) {
        let mut conns = self.sessions.drain();
        for conn in &mut conns {
            self.teardown_connection(conn);
        }
        self.scheduled.clear();
        debug!("analyzer engine done");
    }

    /// Ports the VXLAN tunnel decoder should listen on; available
    /// after `post_script_init`.
    pub fn vxlan_ports(&self) -> &[u16] {
        &self.vxlan_ports
    }

    pub fn builtins(&self) -> &BuiltinTags {
        &self.builtins
    }

    pub fn mirrors(&self) -> &ScriptMirrors {
        &self.mirrors
    }

    // ------------------------------------------------------------------
    // Registry surface
    // ------------------------------------------------------------------

    pub fn enable_analyzer(&mut self, tag: AnalyzerTag) -> bool {
        self.registry.enable(tag)
    }

    pub fn disable_analyzer(&mut self, tag: AnalyzerTag) -> bool {
        self.registry.disable(tag)
    }

    pub fn disable_all_analyzers(&mut self) {
        self.registry.disable_all()
    }

    pub fn is_enabled(&self, tag: AnalyzerTag) -> bool {
        self.registry.is_enabled(tag)
    }

    pub fn analyzer_tag(&self, name: &str) -> Option<AnalyzerTag> {
        self.registry.tag_of(name)
    }

    pub fn instantiate(&self, tag: AnalyzerTag, conn: &Connection) -> Option<Box<dyn Analyzer>> {
        self.registry.instantiate(tag, conn, &self.reporter)
    }

    pub fn instantiate_by_name(&self, name: &str, conn: &Connection) -> Option<Box<dyn Analyzer>> {
        self.registry.instantiate_by_name(name, conn, &self.reporter)
    }

    /// Register an analyzer for port-based activation. False when the
    /// tag names no registered component.
    pub fn register_for_port(&mut self, tag: AnalyzerTag, transport: Transport, port: u16) -> bool {
        if self.registry.lookup(tag).is_none() {
            return false;
        }
        self.ports.register(tag, transport, port, &self.reporter)
    }

    pub fn unregister_for_port(
        &mut self,
        tag: AnalyzerTag,
        transport: Transport,
        port: u16,
    ) -> bool {
        if self.registry.lookup(tag).is_none() {
            return false;
        }
        self.ports.unregister(tag, transport, port, &self.reporter)
    }

    /// Log the analyzer catalog and port maps at debug level.
    pub fn dump_debug(&self) {
        self.registry.dump_debug(&self.ports);
    }

    // ------------------------------------------------------------------
    // Scheduled analyzers
    // ------------------------------------------------------------------

    /// Expect a future connection and pre-attach `tag` when it shows
    /// up. An unspecified originator address matches any originator.
    pub fn schedule_analyzer(
        &mut self,
        orig: IpAddr,
        resp: IpAddr,
        resp_port: u16,
        transport: Transport,
        tag: AnalyzerTag,
        timeout_rel: f64,
    ) {
        let index = ConnIndex::new(orig, resp, resp_port, transport);
        self.scheduled
            .schedule(index, tag, timeout_rel, &self.run_state, &self.reporter);
    }

    /// Name-based scheduling; unknown names are a silent no-op.
    pub fn schedule_analyzer_by_name(
        &mut self,
        orig: IpAddr,
        resp: IpAddr,
        resp_port: u16,
        transport: Transport,
        name: &str,
        timeout_rel: f64,
    ) {
        let Some(tag) = self.registry.tag_of(name) else {
            return;
        };
        self.schedule_analyzer(orig, resp, resp_port, transport, tag, timeout_rel);
    }

    pub fn get_scheduled(&self, conn: &Connection) -> BTreeSet<AnalyzerTag> {
        let now = self
            .run_state
            .network_time()
            .unwrap_or(NetworkTime::ZERO);
        self.scheduled.get_scheduled(conn, now)
    }

    /// Attach scheduled analyzers to a live connection's tree.
    pub fn apply_scheduled(&mut self, key: &ConnKey, init: bool) -> bool {
        let Some(conn) = self.sessions.get_mut(key) else {
            return false;
        };
        let cx = tree_context!(self);
        tree::apply_scheduled(&cx, conn, init, None)
    }

    /// Assemble the analyzer tree for a connection that is not yet in
    /// the session table.
    pub fn build_initial_analyzer_tree(&self, conn: &mut Connection) -> bool {
        let cx = tree_context!(self);
        tree::build_initial_analyzer_tree(&cx, conn)
    }

    pub fn is_likely_server_port(&self, transport: Transport, port: u16) -> bool {
        self.mirrors
            .is_likely_server_port(&self.config, transport, port)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Per-packet entry point. Returns false when the packet was
    /// dropped (malformed, or no connection wanted it).
    pub fn process_packet(&mut self, pkt: &mut Packet) -> bool {
        self.run_state.advance(pkt.ts);
        let now = self.run_state.network_time().unwrap_or(pkt.ts);

        // Expired expectations go before anything can match them.
        self.scheduled.expire(now, &self.reporter);

        let min_hdr = pkt.transport.min_header_len();
        if pkt.ip_payload_len < min_hdr {
            self.reporter.weird("truncated_header", None);
            return false;
        }
        if pkt.cap_len < min_hdr {
            self.reporter.weird("internally_truncated_header", None);
            return false;
        }

        let tuple = pkt.conn_tuple();
        let key = ConnKey::from_tuple(&tuple);

        enum Action {
            Create,
            Reuse(u64),
            Deliver,
        }

        let action = match self.sessions.find(&key) {
            None => Action::Create,
            Some(conn) => {
                if conn.is_reuse(now, pkt.tcp_flags, self.config.session.tcp_reuse_idle) {
                    Action::Reuse(conn.id())
                } else {
                    Action::Deliver
                }
            }
        };

        match action {
            Action::Create => {
                if let Some(conn) = self.new_connection(&tuple, key.clone(), pkt) {
                    self.sessions.insert(conn);
                }
            }
            Action::Reuse(old_id) => {
                debug!(conn = old_id, "connection reused, rebuilding");
                self.events.emit(EventKind::ConnectionReused, old_id, None);
                self.sessions.stats.reuses += 1;
                if let Some(mut old) = self.sessions.remove(&key) {
                    self.teardown_connection(&mut old);
                }
                if let Some(conn) = self.new_connection(&tuple, key.clone(), pkt) {
                    self.sessions.insert(conn);
                }
            }
            Action::Deliver => {
                if let Some(conn) = self.sessions.get_mut(&key) {
                    conn.check_encapsulation(pkt.encap);
                }
            }
        }

        let Some(conn) = self.sessions.get_mut(&key) else {
            return false;
        };

        let is_orig = conn.is_orig(&tuple);
        conn.check_flow_label(is_orig, pkt.flow_label);
        conn.update_state(pkt.tcp_flags, is_orig, pkt.ts);

        if pkt.has_ip6_ext_headers() {
            self.events.emit(EventKind::Ipv6ExtHeaders, conn.id(), None);
        }
        self.events.emit(EventKind::NewPacket, conn.id(), None);

        if conn.skipping() {
            return true;
        }

        self.run_state.set_current_timestamp(Some(pkt.ts));

        let Some(mut adapter) = conn.adapter.take() else {
            self.reporter
                .internal_warning("connection without session adapter in dispatch");
            return false;
        };
        {
            let mut actx = AnalyzerCtx {
                conn: &mut *conn,
                events: &self.events,
                reporter: &self.reporter,
            };
            adapter.deliver_packet(&mut actx, pkt.ts, is_orig, pkt);
        }
        conn.adapter = Some(adapter);

        self.run_state.set_current_timestamp(None);

        // Reassembled packets cannot be dumped as captured bytes; for
        // wire packets honor the connection's recording wishes.
        if pkt.reassembled {
            pkt.dump_packet = false;
        } else if conn.record_packets() {
            pkt.dump_packet = true;
            if !conn.record_contents() {
                pkt.dump_size = pkt.header_len;
            }
        }

        true
    }

    /// Should we track a connection for this first packet, and should
    /// originator/responder roles be flipped? `None` declines the
    /// connection entirely.
    fn want_connection(&self, tuple: &ConnTuple, flags: Option<TcpFlags>) -> Option<bool> {
        match tuple.transport {
            Transport::Tcp => {
                if let Some(flags) = flags {
                    if flags.is_syn() {
                        return Some(false);
                    }
                    if flags.is_syn_ack() {
                        // First packet is the server's reply.
                        return Some(true);
                    }
                }
                // Mid-stream pickup: flip when the source looks like
                // the server side.
                Some(self.port_suggests_flip(tuple))
            }
            Transport::Udp => Some(self.port_suggests_flip(tuple)),
            Transport::Icmp => Some(false),
            // Let the tree builder report the unknown transport.
            Transport::Other(_) => Some(false),
        }
    }

    fn port_suggests_flip(&self, tuple: &ConnTuple) -> bool {
        self.is_likely_server_port(tuple.transport, tuple.src_port)
            && !self.is_likely_server_port(tuple.transport, tuple.dst_port)
    }

    fn new_connection(
        &mut self,
        tuple: &ConnTuple,
        key: ConnKey,
        pkt: &Packet,
    ) -> Option<Connection> {
        let flip = self.want_connection(tuple, pkt.tcp_flags)?;

        let id = self.sessions.next_id();
        let mut conn = Connection::new(id, key, tuple, pkt.ts, pkt.flow_label, pkt.tcp_flags);
        if flip {
            conn.flip_roles();
        }

        let cx = tree_context!(self);
        if !tree::build_initial_analyzer_tree(&cx, &mut conn) {
            self.teardown_connection(&mut conn);
            return None;
        }

        self.events.emit(EventKind::NewConnection, conn.id(), None);
        debug!(
            conn = conn.id(),
            "new {} connection to port {}",
            conn.transport(),
            conn.resp_port()
        );
        Some(conn)
    }

    fn teardown_connection(&self, conn: &mut Connection) {
        if let Some(mut adapter) = conn.adapter.take() {
            let mut actx = AnalyzerCtx {
                conn: &mut *conn,
                events: &self.events,
                reporter: &self.reporter,
            };
            adapter.done(&mut actx);
        }
    }
}
