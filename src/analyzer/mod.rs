//! Analyzer framework
//!
//! The unit of protocol analysis is an `Analyzer`: a node in a
//! per-connection tree that consumes packets or reassembled stream
//! chunks. This module defines the analyzer contract, the component
//! catalog entries the registry manages, and the delivery context
//! handed to analyzers during callbacks.
//!
//! # Architecture
//!
//! ```ignore
//! Connection
//!   └── SessionAdapter (transport root: TCP/UDP/ICMP)
//!         ├── packet children   (see raw packets: conn-size, TCP stats)
//!         ├── app-layer children (scheduled or port-activated)
//!         └── PIA               (protocol identification probe)
//! ```
//!
//! The connection owns its tree; children reach back to the connection
//! only through [`AnalyzerCtx`] during a callback, never by ownership.

pub mod adapters;
pub mod ports;
pub mod registry;
pub mod scheduled;
pub mod tree;

pub use adapters::SessionAdapter;
pub use ports::PortTable;
pub use registry::AnalyzerRegistry;
pub use scheduled::{ConnIndex, ScheduledTable};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::connection::Connection;
use crate::core::event::EventHub;
use crate::core::time::NetworkTime;
use crate::runtime::Reporter;

/// Opaque identity of an analyzer kind. Assigned at registration and
/// never changed afterwards; the human-readable name lives on the
/// component.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AnalyzerTag(u32);

impl AnalyzerTag {
    /// The null tag, carried by analyzers constructed outside the
    /// registry (e.g. transport roots).
    pub const NONE: AnalyzerTag = AnalyzerTag(0);

    pub const fn new(raw: u32) -> Self {
        AnalyzerTag(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AnalyzerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// Factory producing a fresh analyzer instance for a connection.
/// Returning `None` means the analyzer declined this connection.
pub type AnalyzerFactory = fn(&Connection) -> Option<Box<dyn Analyzer>>;

/// Catalog entry for one analyzer kind.
pub struct AnalyzerComponent {
    pub tag: AnalyzerTag,
    pub name: &'static str,

    /// `None` marks a kind that cannot be constructed dynamically (it
    /// is instantiated by other means); requesting it is a silent skip.
    pub factory: Option<AnalyzerFactory>,

    pub enabled: bool,
}

impl AnalyzerComponent {
    pub fn new(tag: AnalyzerTag, name: &'static str, factory: Option<AnalyzerFactory>) -> Self {
        Self {
            tag,
            name,
            factory,
            enabled: true,
        }
    }
}

/// Context handed to an analyzer during a callback: the connection it
/// serves (minus the tree, which is held by the caller) and the event
/// hub for signalling upstream.
pub struct AnalyzerCtx<'a> {
    pub conn: &'a mut Connection,
    pub events: &'a EventHub,
    pub reporter: &'a Reporter,
}

/// A node in a per-connection analyzer tree.
///
/// All callbacks have no-op defaults; an analyzer implements the subset
/// it cares about. `deliver_packet` sees per-packet payloads,
/// `deliver_stream` sees reassembled byte-stream chunks.
pub trait Analyzer {
    fn tag(&self) -> AnalyzerTag;

    /// Stamp the originating component tag; called once at
    /// instantiation.
    fn set_tag(&mut self, tag: AnalyzerTag);

    fn init(&mut self, _ctx: &mut AnalyzerCtx<'_>) {}

    fn done(&mut self, _ctx: &mut AnalyzerCtx<'_>) {}

    fn deliver_packet(
        &mut self,
        _ctx: &mut AnalyzerCtx<'_>,
        _ts: NetworkTime,
        _is_orig: bool,
        _data: &[u8],
    ) {
    }

    fn deliver_stream(&mut self, _ctx: &mut AnalyzerCtx<'_>, _is_orig: bool, _data: &[u8]) {}
}
