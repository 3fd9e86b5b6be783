//! connwatch: protocol-analyzer dispatch core for a passive network
//! monitor.
//!
//! Given a stream of decoded IP packets, the engine groups them into
//! connections, assembles a per-connection tree of protocol analyzers,
//! and routes each packet to the right subtree. Two subsystems do the
//! heavy lifting:
//!
//! - the connection demultiplexer: find-or-create by canonical 5-tuple,
//!   reuse detection, originator/responder role flipping;
//! - the analyzer registry and tree builder: a catalog of analyzer
//!   kinds, port-based activation, and a time-bounded table of
//!   scheduled (expected) analyzers that pre-attach to matching future
//!   connections.
//!
//! # Example
//!
//! ```ignore
//! use connwatch::{Config, Engine};
//!
//! let mut config = Config::default();
//! config.tunnel.vxlan_ports = Some(vec![4789]);
//!
//! let mut engine = Engine::new(config)?;
//! engine.pre_script_init();
//! // ... register analyzers, ports, subscriptions ...
//! engine.post_script_init()?;
//!
//! for mut pkt in packets {
//!     engine.process_packet(&mut pkt);
//! }
//! engine.done();
//! ```
//!
//! The core is single-threaded cooperative: one packet at a time
//! advances the system, and all timing runs on the simulated clock
//! carried by the packets themselves.

pub mod analyzer;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod runtime;
pub mod session;

pub use analyzer::adapters::{BuiltinTags, SessionAdapter};
pub use analyzer::{
    Analyzer, AnalyzerComponent, AnalyzerCtx, AnalyzerRegistry, AnalyzerTag, ConnIndex, PortTable,
    ScheduledTable,
};
pub use config::Config;
pub use core::connection::{ConnKey, ConnState, Connection};
pub use core::event::{Event, EventHub, EventKind};
pub use core::packet::{ConnTuple, Packet, TcpFlags, Transport};
pub use core::time::{NetworkTime, RunState};
pub use engine::Engine;
pub use errors::{Error, Result};
pub use runtime::Reporter;
pub use session::SessionTable;
