//! Analyzer tree construction
//!
//! Builds the initial analyzer tree for a new connection. The
//! composition order is fixed and observable (it decides event
//! ordering): scheduled analyzers first, then port-based activation,
//! then the TCP reassembly decision and per-packet observers, then the
//! protocol-identification probe.

use tracing::debug;

use crate::config::{Config, ScriptMirrors};
use crate::core::connection::Connection;
use crate::core::event::{EventHub, EventKind};
use crate::core::packet::Transport;
use crate::core::time::{NetworkTime, RunState};
use crate::runtime::Reporter;

use super::Analyzer;
use super::adapters::{BuiltinTags, Pia, SessionAdapter};
use super::ports::PortTable;
use super::registry::AnalyzerRegistry;
use super::scheduled::ScheduledTable;
use super::{AnalyzerCtx, AnalyzerTag};

/// Everything the tree builder consults, borrowed from the engine.
pub struct TreeContext<'a> {
    pub registry: &'a AnalyzerRegistry,
    pub ports: &'a PortTable,
    pub scheduled: &'a ScheduledTable,
    pub config: &'a Config,
    pub mirrors: &'a ScriptMirrors,
    pub builtins: &'a BuiltinTags,
    pub run_state: &'a RunState,
    pub events: &'a EventHub,
    pub reporter: &'a Reporter,
}

/// Responder ports whose traffic is interactive enough for the
/// stepping-stone detector: ssh, telnet, rlogin.
const STEPPING_STONE_PORTS: [u16; 3] = [22, 23, 513];

/// Assemble and install the analyzer tree for a freshly created
/// connection. Returns false when no tree can be built; the caller
/// drops the connection.
pub fn build_initial_analyzer_tree(cx: &TreeContext<'_>, conn: &mut Connection) -> bool {
    let transport = conn.transport();

    let (mut root, pia_tag, check_port, has_pia) = match transport {
        Transport::Tcp => (
            SessionAdapter::new(Transport::Tcp),
            cx.builtins.pia_tcp,
            true,
            true,
        ),
        Transport::Udp => (
            SessionAdapter::new(Transport::Udp),
            cx.builtins.pia_udp,
            true,
            true,
        ),
        Transport::Icmp => (SessionAdapter::new(Transport::Icmp), None, false, false),
        Transport::Other(_) => {
            cx.reporter
                .internal_warning("unknown protocol can't build analyzer tree");
            return false;
        }
    };

    debug!(conn = conn.id(), "activated {} session adapter", transport);

    let scheduled_applied = apply_scheduled_to(cx, conn, false, &mut root);

    // Scheduled analyzers suppress port-based activation: we take just
    // the expected ones, not every other analyzer the port suggests.
    if !scheduled_applied && check_port && !cx.config.dpd.ignore_ports {
        let resp_port = conn.resp_port();
        let tags: Vec<AnalyzerTag> = cx
            .ports
            .lookup(transport, resp_port, cx.reporter)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for tag in tags {
            let Some(analyzer) = cx.registry.instantiate(tag, conn, cx.reporter) else {
                continue;
            };
            let mut actx = AnalyzerCtx {
                conn: &mut *conn,
                events: cx.events,
                reporter: cx.reporter,
            };
            root.add_child(analyzer, false, &mut actx);
            debug!(
                conn = conn.id(),
                "activated {} analyzer due to port {}",
                cx.registry.name_of(tag),
                resp_port
            );
        }
    }

    if transport == Transport::Tcp {
        // Reassembly goes on right away if an app-layer analyzer is
        // already attached or configuration asks for it; otherwise the
        // PIA may enable it later upon protocol detection.
        let mut reass = root.child_count() > 0
            || cx.config.dpd.reassemble_first_packets
            || cx.config.tcp.deliver_all_orig
            || cx.config.tcp.deliver_all_resp;

        if cx.config.tcp.contents && !reass {
            let resp_port = conn.resp_port();
            reass = cx.mirrors.content_port_orig(cx.config, resp_port)
                || cx.mirrors.content_port_resp(cx.config, resp_port);
        }

        if reass {
            root.enable_reassembly();
        }

        if let Some(stp) = cx.builtins.stepping_stone {
            // The port set is hardcoded: the detector handles
            // non-reassembled data, so it cannot wait for protocol
            // detection to identify interactive traffic.
            if cx.registry.is_enabled(stp)
                && STEPPING_STONE_PORTS.contains(&conn.resp_port())
                && !cx.mirrors.stp_skip(cx.config, conn.orig_addr())
            {
                if let Some(analyzer) = cx.registry.instantiate(stp, conn, cx.reporter) {
                    let mut actx = AnalyzerCtx {
                        conn: &mut *conn,
                        events: cx.events,
                        reporter: cx.reporter,
                    };
                    root.add_child(analyzer, false, &mut actx);
                }
            }
        }

        // The per-packet observers must see raw segments, not the
        // reassembled stream.
        if let Some(stats) = cx.builtins.tcp_stats {
            if cx.registry.is_enabled(stats) {
                if let Some(analyzer) = cx.registry.instantiate(stats, conn, cx.reporter) {
                    root.add_packet_child(analyzer);
                }
            }
        }

        if let Some(size) = cx.builtins.conn_size {
            if cx.registry.is_enabled(size) {
                if let Some(analyzer) = cx.registry.instantiate(size, conn, cx.reporter) {
                    root.add_packet_child(analyzer);
                }
            }
        }
    } else if let Some(size) = cx.builtins.conn_size {
        if cx.registry.is_enabled(size) {
            if let Some(analyzer) = cx.registry.instantiate(size, conn, cx.reporter) {
                let mut actx = AnalyzerCtx {
                    conn: &mut *conn,
                    events: cx.events,
                    reporter: cx.reporter,
                };
                root.add_child(analyzer, false, &mut actx);
            }
        }
    }

    let mut pia_child = None;
    if has_pia {
        let mut pia = Box::new(Pia::new());
        if let Some(tag) = pia_tag {
            pia.set_tag(tag);
        }
        let mut actx = AnalyzerCtx {
            conn: &mut *conn,
            events: cx.events,
            reporter: cx.reporter,
        };
        pia_child = Some(root.add_child(pia, false, &mut actx));
    }

    {
        let mut actx = AnalyzerCtx {
            conn: &mut *conn,
            events: cx.events,
            reporter: cx.reporter,
        };
        root.init(&mut actx);
        root.init_children(&mut actx);
    }
    conn.set_session_adapter(root, pia_child);

    cx.events.emit(EventKind::SetupAnalyzerTree, conn.id(), None);

    true
}

/// Attach every scheduled analyzer matching this connection to
/// `parent` (or the connection's current adapter). Returns whether any
/// analyzer was expected.
pub fn apply_scheduled(
    cx: &TreeContext<'_>,
    conn: &mut Connection,
    init: bool,
    parent: Option<&mut SessionAdapter>,
) -> bool {
    match parent {
        Some(parent) => apply_scheduled_to(cx, conn, init, parent),
        None => {
            let Some(mut adapter) = conn.adapter.take() else {
                return false;
            };
            let applied = apply_scheduled_to(cx, conn, init, &mut adapter);
            conn.adapter = Some(adapter);
            applied
        }
    }
}

fn apply_scheduled_to(
    cx: &TreeContext<'_>,
    conn: &mut Connection,
    init: bool,
    parent: &mut SessionAdapter,
) -> bool {
    let now = cx
        .run_state
        .network_time()
        .unwrap_or(NetworkTime::ZERO);
    let expected = cx.scheduled.get_scheduled(conn, now);

    for &tag in &expected {
        let Some(analyzer) = cx.registry.instantiate(tag, conn, cx.reporter) else {
            continue;
        };

        let mut actx = AnalyzerCtx {
            conn: &mut *conn,
            events: cx.events,
            reporter: cx.reporter,
        };
        parent.add_child(analyzer, init, &mut actx);

        cx.events
            .emit(EventKind::ScheduledAnalyzerApplied, conn.id(), Some(tag));

        debug!(
            conn = conn.id(),
            "activated {} analyzer as scheduled",
            cx.registry.name_of(tag)
        );
    }

    !expected.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::adapters::register_builtin_analyzers;
    use crate::analyzer::scheduled::ConnIndex;
    use crate::analyzer::Analyzer;
    use crate::core::connection::ConnKey;
    use crate::core::packet::{ConnTuple, TcpFlags};
    use std::net::{IpAddr, Ipv4Addr};

    struct Fixture {
        registry: AnalyzerRegistry,
        ports: PortTable,
        scheduled: ScheduledTable,
        config: Config,
        mirrors: ScriptMirrors,
        builtins: BuiltinTags,
        run_state: RunState,
        events: EventHub,
        reporter: Reporter,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = AnalyzerRegistry::new();
            register_builtin_analyzers(&mut registry).unwrap();
            let builtins = BuiltinTags::cache(&registry);

            let mut run_state = RunState::new();
            run_state.advance(NetworkTime::from_secs(100.0));

            Self {
                registry,
                ports: PortTable::new(),
                scheduled: ScheduledTable::new(),
                config: Config::default(),
                mirrors: ScriptMirrors::new(),
                builtins,
                run_state,
                events: EventHub::new(),
                reporter: Reporter::new(),
            }
        }

        fn cx(&self) -> TreeContext<'_> {
            TreeContext {
                registry: &self.registry,
                ports: &self.ports,
                scheduled: &self.scheduled,
                config: &self.config,
                mirrors: &self.mirrors,
                builtins: &self.builtins,
                run_state: &self.run_state,
                events: &self.events,
                reporter: &self.reporter,
            }
        }
    }

    struct NullAnalyzer {
        tag: AnalyzerTag,
    }

    impl Analyzer for NullAnalyzer {
        fn tag(&self) -> AnalyzerTag {
            self.tag
        }
        fn set_tag(&mut self, tag: AnalyzerTag) {
            self.tag = tag;
        }
    }

    fn null_factory(_conn: &Connection) -> Option<Box<dyn Analyzer>> {
        Some(Box::new(NullAnalyzer {
            tag: AnalyzerTag::NONE,
        }))
    }

    fn tcp_conn(resp_port: u16) -> Connection {
        let tuple = ConnTuple {
            src_addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 44321,
            dst_port: resp_port,
            transport: Transport::Tcp,
        };
        Connection::new(
            1,
            ConnKey::from_tuple(&tuple),
            &tuple,
            NetworkTime::from_secs(100.0),
            0,
            Some(TcpFlags::SYN),
        )
    }

    #[test]
    fn test_unknown_transport_fails() {
        let fixture = Fixture::new();
        let tuple = ConnTuple {
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 1,
            dst_port: 2,
            transport: Transport::Other(132),
        };
        let mut conn = Connection::new(
            1,
            ConnKey::from_tuple(&tuple),
            &tuple,
            NetworkTime::from_secs(100.0),
            0,
            None,
        );

        assert!(!build_initial_analyzer_tree(&fixture.cx(), &mut conn));
        assert!(conn.session_adapter().is_none());
        assert_eq!(fixture.reporter.internal_warning_count(), 1);
    }

    #[test]
    fn test_tcp_tree_has_pia_and_observers() {
        let fixture = Fixture::new();
        let mut conn = tcp_conn(8080);

        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));

        let adapter = conn.session_adapter().unwrap();
        assert!(adapter.initialized());
        // PIA is the only normal child; conn-size and TCP-stats are
        // packet-level.
        assert_eq!(adapter.child_count(), 1);
        assert_eq!(adapter.packet_child_count(), 2);
        assert_eq!(conn.pia_child(), Some(0));
        assert_eq!(
            adapter.child(0).unwrap().tag(),
            fixture.builtins.pia_tcp.unwrap()
        );
        // No app-layer analyzer, no reassembly yet.
        assert!(!adapter.reassembly_enabled());
    }

    #[test]
    fn test_port_activation_enables_reassembly() {
        let mut fixture = Fixture::new();
        let http = fixture.registry.register_factory("HTTP", null_factory).unwrap();
        fixture.ports.register(http, Transport::Tcp, 80, &fixture.reporter);

        let mut conn = tcp_conn(80);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));

        let adapter = conn.session_adapter().unwrap();
        let tags = adapter.child_tags();
        assert!(tags.contains(&http));
        assert!(adapter.reassembly_enabled());
    }

    #[test]
    fn test_disabled_analyzer_not_attached() {
        let mut fixture = Fixture::new();
        let http = fixture.registry.register_factory("HTTP", null_factory).unwrap();
        fixture.ports.register(http, Transport::Tcp, 80, &fixture.reporter);
        fixture.registry.disable(http);

        let mut conn = tcp_conn(80);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));

        let adapter = conn.session_adapter().unwrap();
        assert!(!adapter.child_tags().contains(&http));
        assert!(!adapter.reassembly_enabled());
    }

    #[test]
    fn test_dpd_ignore_ports_suppresses_activation() {
        let mut fixture = Fixture::new();
        let http = fixture.registry.register_factory("HTTP", null_factory).unwrap();
        fixture.ports.register(http, Transport::Tcp, 80, &fixture.reporter);
        fixture.config.dpd.ignore_ports = true;

        let mut conn = tcp_conn(80);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));
        assert!(!conn.session_adapter().unwrap().child_tags().contains(&http));
    }

    #[test]
    fn test_scheduled_suppresses_port_activation() {
        let mut fixture = Fixture::new();
        let http = fixture.registry.register_factory("HTTP", null_factory).unwrap();
        let ftp = fixture.registry.register_factory("FTP_DATA", null_factory).unwrap();
        fixture.ports.register(http, Transport::Tcp, 80, &fixture.reporter);

        fixture.events.subscribe(EventKind::ScheduledAnalyzerApplied);
        fixture.scheduled.schedule(
            ConnIndex::new(
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                80,
                Transport::Tcp,
            ),
            ftp,
            30.0,
            &fixture.run_state,
            &fixture.reporter,
        );

        let mut conn = tcp_conn(80);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));

        let tags = conn.session_adapter().unwrap().child_tags();
        assert!(tags.contains(&ftp));
        assert!(!tags.contains(&http));

        let events: Vec<_> = fixture.events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ScheduledAnalyzerApplied);
        assert_eq!(events[0].tag, Some(ftp));
    }

    #[test]
    fn test_content_port_enables_reassembly() {
        let mut fixture = Fixture::new();
        fixture.config.tcp.contents = true;
        fixture.config.tcp.content_delivery_ports_resp.insert(80);

        let mut conn = tcp_conn(80);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));
        assert!(conn.session_adapter().unwrap().reassembly_enabled());
    }

    #[test]
    fn test_stepping_stone_attachment_and_exemption() {
        let fixture = Fixture::new();
        let stp = fixture.builtins.stepping_stone.unwrap();

        let mut conn = tcp_conn(22);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));
        assert!(conn.session_adapter().unwrap().child_tags().contains(&stp));

        // Exempt originator.
        let mut fixture = Fixture::new();
        fixture
            .config
            .stp_skip_src
            .insert(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)));
        let mut conn = tcp_conn(22);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));
        assert!(!conn.session_adapter().unwrap().child_tags().contains(&stp));

        // Non-interactive port.
        let fixture = Fixture::new();
        let mut conn = tcp_conn(8080);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));
        assert!(!conn.session_adapter().unwrap().child_tags().contains(&stp));
    }

    #[test]
    fn test_udp_tree_conn_size_is_normal_child() {
        let fixture = Fixture::new();
        let tuple = ConnTuple {
            src_addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: 50000,
            dst_port: 53,
            transport: Transport::Udp,
        };
        let mut conn = Connection::new(
            1,
            ConnKey::from_tuple(&tuple),
            &tuple,
            NetworkTime::from_secs(100.0),
            0,
            None,
        );

        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));
        let adapter = conn.session_adapter().unwrap();
        assert_eq!(adapter.packet_child_count(), 0);
        assert!(adapter
            .child_tags()
            .contains(&fixture.builtins.conn_size.unwrap()));
        assert!(adapter
            .child_tags()
            .contains(&fixture.builtins.pia_udp.unwrap()));
    }

    #[test]
    fn test_apply_scheduled_falls_back_to_adapter() {
        let mut fixture = Fixture::new();
        let ftp = fixture.registry.register_factory("FTP_DATA", null_factory).unwrap();

        let mut conn = tcp_conn(21212);
        assert!(build_initial_analyzer_tree(&fixture.cx(), &mut conn));

        // Nothing scheduled yet.
        assert!(!apply_scheduled(&fixture.cx(), &mut conn, true, None));

        fixture.scheduled.schedule(
            ConnIndex::for_connection(&conn),
            ftp,
            30.0,
            &fixture.run_state,
            &fixture.reporter,
        );
        assert!(apply_scheduled(&fixture.cx(), &mut conn, true, None));
        assert!(conn.session_adapter().unwrap().child_tags().contains(&ftp));
    }
}
