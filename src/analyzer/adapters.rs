//! Session adapters and built-in analyzers
//!
//! A `SessionAdapter` is the transport-level root of a connection's
//! analyzer tree. It owns two groups of children: normal children (fed
//! per-packet payloads and, once reassembly runs, stream chunks) and
//! packet-level children (observers that must see every raw segment).
//!
//! Also here: the protocol-identification probe and the built-in
//! per-packet observers the tree builder attaches when enabled.

use std::fmt;

use tracing::debug;

use crate::core::connection::Connection;
use crate::core::packet::{Packet, Transport};
use crate::core::time::NetworkTime;
use crate::errors::Result;

use super::registry::AnalyzerRegistry;
use super::{Analyzer, AnalyzerCtx, AnalyzerTag};

pub const CONN_SIZE_NAME: &str = "CONNSIZE";
pub const TCP_STATS_NAME: &str = "TCPSTATS";
pub const STEPPING_STONE_NAME: &str = "STEPPINGSTONE";
pub const PIA_TCP_NAME: &str = "PIA_TCP";
pub const PIA_UDP_NAME: &str = "PIA_UDP";

/// Bytes of initial traffic the protocol-identification probe buffers
/// per direction.
pub const PROBE_BUFFER_CAP: usize = 1024;

struct Child {
    analyzer: Box<dyn Analyzer>,
    initialized: bool,
}

/// Transport-level root of an analyzer tree. The connection owns the
/// adapter; the adapter owns its subtree.
pub struct SessionAdapter {
    transport: Transport,
    children: Vec<Child>,
    packet_children: Vec<Child>,
    reassemble: bool,
    initialized: bool,
}

impl SessionAdapter {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            children: Vec::new(),
            packet_children: Vec::new(),
            reassemble: false,
            initialized: false,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Attach a normal child. With `init` set the child is initialized
    /// immediately; otherwise it waits for `init_children`. Returns the
    /// child's index.
    pub fn add_child(
        &mut self,
        mut analyzer: Box<dyn Analyzer>,
        init: bool,
        ctx: &mut AnalyzerCtx<'_>,
    ) -> usize {
        if init {
            analyzer.init(ctx);
        }
        self.children.push(Child {
            analyzer,
            initialized: init,
        });
        self.children.len() - 1
    }

    /// Attach a packet-level child; it sees raw per-packet data, never
    /// the reassembled stream. Initialized by `init_children`.
    pub fn add_packet_child(&mut self, analyzer: Box<dyn Analyzer>) {
        self.packet_children.push(Child {
            analyzer,
            initialized: false,
        });
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn packet_child_count(&self) -> usize {
        self.packet_children.len()
    }

    pub fn child_tags(&self) -> Vec<AnalyzerTag> {
        self.children.iter().map(|c| c.analyzer.tag()).collect()
    }

    pub fn packet_child_tags(&self) -> Vec<AnalyzerTag> {
        self.packet_children
            .iter()
            .map(|c| c.analyzer.tag())
            .collect()
    }

    pub fn child(&self, idx: usize) -> Option<&dyn Analyzer> {
        self.children.get(idx).map(|c| c.analyzer.as_ref())
    }

    /// Turn on TCP stream reassembly for this tree. The probe may call
    /// this later upon protocol detection.
    pub fn enable_reassembly(&mut self) {
        self.reassemble = true;
    }

    pub fn reassembly_enabled(&self) -> bool {
        self.reassemble
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn init(&mut self, _ctx: &mut AnalyzerCtx<'_>) {
        self.initialized = true;
    }

    /// Initialize every child that has not been initialized yet.
    pub fn init_children(&mut self, ctx: &mut AnalyzerCtx<'_>) {
        for child in self.children.iter_mut().chain(self.packet_children.iter_mut()) {
            if !child.initialized {
                child.analyzer.init(ctx);
                child.initialized = true;
            }
        }
    }

    /// Deliver one packet's payload down the tree.
    pub fn deliver_packet(
        &mut self,
        ctx: &mut AnalyzerCtx<'_>,
        ts: NetworkTime,
        is_orig: bool,
        pkt: &Packet,
    ) {
        for child in &mut self.packet_children {
            child.analyzer.deliver_packet(ctx, ts, is_orig, &pkt.payload);
        }
        for child in &mut self.children {
            child.analyzer.deliver_packet(ctx, ts, is_orig, &pkt.payload);
        }
    }

    /// Deliver a reassembled stream chunk to the normal children.
    pub fn deliver_stream(&mut self, ctx: &mut AnalyzerCtx<'_>, is_orig: bool, data: &[u8]) {
        for child in &mut self.children {
            child.analyzer.deliver_stream(ctx, is_orig, data);
        }
    }

    /// Tear the subtree down, depth-first, before the adapter drops.
    pub fn done(&mut self, ctx: &mut AnalyzerCtx<'_>) {
        for child in self.children.iter_mut().chain(self.packet_children.iter_mut()) {
            child.analyzer.done(ctx);
        }
        debug!(conn = ctx.conn.id(), "analyzer tree torn down");
    }
}

impl fmt::Debug for SessionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAdapter")
            .field("transport", &self.transport)
            .field("children", &self.children.len())
            .field("packet_children", &self.packet_children.len())
            .field("reassemble", &self.reassemble)
            .finish()
    }
}

/// Protocol-identification probe. Buffers the first bytes of each
/// direction for protocol detection; the matching logic itself lives
/// with the protocol analyzers, outside this crate.
pub struct Pia {
    tag: AnalyzerTag,
    orig_buf: Vec<u8>,
    resp_buf: Vec<u8>,
}

impl Pia {
    pub fn new() -> Self {
        Self {
            tag: AnalyzerTag::NONE,
            orig_buf: Vec::new(),
            resp_buf: Vec::new(),
        }
    }

    pub fn buffered(&self, is_orig: bool) -> &[u8] {
        if is_orig {
            &self.orig_buf
        } else {
            &self.resp_buf
        }
    }

    fn buffer(&mut self, is_orig: bool, data: &[u8]) {
        let buf = if is_orig {
            &mut self.orig_buf
        } else {
            &mut self.resp_buf
        };
        let room = PROBE_BUFFER_CAP.saturating_sub(buf.len());
        buf.extend_from_slice(&data[..data.len().min(room)]);
    }
}

impl Default for Pia {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for Pia {
    fn tag(&self) -> AnalyzerTag {
        self.tag
    }

    fn set_tag(&mut self, tag: AnalyzerTag) {
        self.tag = tag;
    }

    fn deliver_packet(
        &mut self,
        _ctx: &mut AnalyzerCtx<'_>,
        _ts: NetworkTime,
        is_orig: bool,
        data: &[u8],
    ) {
        self.buffer(is_orig, data);
    }

    fn deliver_stream(&mut self, _ctx: &mut AnalyzerCtx<'_>, is_orig: bool, data: &[u8]) {
        self.buffer(is_orig, data);
    }
}

/// Per-direction packet and byte counters.
#[derive(Default)]
pub struct ConnSizeAnalyzer {
    tag: AnalyzerTag,
    orig_pkts: u64,
    orig_bytes: u64,
    resp_pkts: u64,
    resp_bytes: u64,
}

impl ConnSizeAnalyzer {
    pub fn totals(&self) -> (u64, u64, u64, u64) {
        (self.orig_pkts, self.orig_bytes, self.resp_pkts, self.resp_bytes)
    }
}

impl Analyzer for ConnSizeAnalyzer {
    fn tag(&self) -> AnalyzerTag {
        self.tag
    }

    fn set_tag(&mut self, tag: AnalyzerTag) {
        self.tag = tag;
    }

    fn deliver_packet(
        &mut self,
        _ctx: &mut AnalyzerCtx<'_>,
        _ts: NetworkTime,
        is_orig: bool,
        data: &[u8],
    ) {
        if is_orig {
            self.orig_pkts += 1;
            self.orig_bytes += data.len() as u64;
        } else {
            self.resp_pkts += 1;
            self.resp_bytes += data.len() as u64;
        }
    }
}

/// Per-packet TCP segment statistics.
#[derive(Default)]
pub struct TcpStatsAnalyzer {
    tag: AnalyzerTag,
    orig_segments: u64,
    resp_segments: u64,
    min_segment: Option<usize>,
    max_segment: usize,
}

impl TcpStatsAnalyzer {
    pub fn segments(&self) -> (u64, u64) {
        (self.orig_segments, self.resp_segments)
    }
}

impl Analyzer for TcpStatsAnalyzer {
    fn tag(&self) -> AnalyzerTag {
        self.tag
    }

    fn set_tag(&mut self, tag: AnalyzerTag) {
        self.tag = tag;
    }

    fn deliver_packet(
        &mut self,
        _ctx: &mut AnalyzerCtx<'_>,
        _ts: NetworkTime,
        is_orig: bool,
        data: &[u8],
    ) {
        if is_orig {
            self.orig_segments += 1;
        } else {
            self.resp_segments += 1;
        }
        let len = data.len();
        self.min_segment = Some(self.min_segment.map_or(len, |m| m.min(len)));
        self.max_segment = self.max_segment.max(len);
    }
}

/// Interactive-session heuristic for detecting chained logins. Counts
/// keystroke-sized segments and the pauses between them; the
/// correlation across connections happens upstream.
pub struct SteppingStoneAnalyzer {
    tag: AnalyzerTag,
    last_ts: Option<NetworkTime>,
    keystroke_segments: u64,
    interactive_pauses: u64,
}

const KEYSTROKE_MAX_LEN: usize = 128;
const INTERACTIVE_PAUSE_SECS: f64 = 0.5;

impl SteppingStoneAnalyzer {
    pub fn new() -> Self {
        Self {
            tag: AnalyzerTag::NONE,
            last_ts: None,
            keystroke_segments: 0,
            interactive_pauses: 0,
        }
    }

    pub fn keystroke_segments(&self) -> u64 {
        self.keystroke_segments
    }
}

impl Default for SteppingStoneAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for SteppingStoneAnalyzer {
    fn tag(&self) -> AnalyzerTag {
        self.tag
    }

    fn set_tag(&mut self, tag: AnalyzerTag) {
        self.tag = tag;
    }

    fn deliver_packet(
        &mut self,
        _ctx: &mut AnalyzerCtx<'_>,
        ts: NetworkTime,
        _is_orig: bool,
        data: &[u8],
    ) {
        if !data.is_empty() && data.len() <= KEYSTROKE_MAX_LEN {
            self.keystroke_segments += 1;
            if let Some(last) = self.last_ts {
                if ts.since(last) > INTERACTIVE_PAUSE_SECS {
                    self.interactive_pauses += 1;
                }
            }
        }
        self.last_ts = Some(ts);
    }
}

fn conn_size_factory(_conn: &Connection) -> Option<Box<dyn Analyzer>> {
    Some(Box::new(ConnSizeAnalyzer::default()))
}

fn tcp_stats_factory(_conn: &Connection) -> Option<Box<dyn Analyzer>> {
    Some(Box::new(TcpStatsAnalyzer::default()))
}

fn stepping_stone_factory(_conn: &Connection) -> Option<Box<dyn Analyzer>> {
    Some(Box::new(SteppingStoneAnalyzer::new()))
}

fn pia_factory(_conn: &Connection) -> Option<Box<dyn Analyzer>> {
    Some(Box::new(Pia::new()))
}

/// Register the built-in analyzer components.
pub fn register_builtin_analyzers(registry: &mut AnalyzerRegistry) -> Result<()> {
    registry.register_factory(CONN_SIZE_NAME, conn_size_factory)?;
    registry.register_factory(TCP_STATS_NAME, tcp_stats_factory)?;
    registry.register_factory(STEPPING_STONE_NAME, stepping_stone_factory)?;
    registry.register_factory(PIA_TCP_NAME, pia_factory)?;
    registry.register_factory(PIA_UDP_NAME, pia_factory)?;
    Ok(())
}

/// Tags of the built-in components, resolved by name once before
/// packet processing starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTags {
    pub conn_size: Option<AnalyzerTag>,
    pub tcp_stats: Option<AnalyzerTag>,
    pub stepping_stone: Option<AnalyzerTag>,
    pub pia_tcp: Option<AnalyzerTag>,
    pub pia_udp: Option<AnalyzerTag>,
}

impl BuiltinTags {
    pub fn cache(registry: &AnalyzerRegistry) -> Self {
        Self {
            conn_size: registry.tag_of(CONN_SIZE_NAME),
            tcp_stats: registry.tag_of(TCP_STATS_NAME),
            stepping_stone: registry.tag_of(STEPPING_STONE_NAME),
            pia_tcp: registry.tag_of(PIA_TCP_NAME),
            pia_udp: registry.tag_of(PIA_UDP_NAME),
        }
    }
}
