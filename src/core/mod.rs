//! Core data model: packets, connections, events, simulated time.

pub mod connection;
pub mod event;
pub mod packet;
pub mod time;

pub use connection::{ConnKey, ConnState, Connection};
pub use event::{Event, EventHub, EventKind};
pub use packet::{ConnTuple, Packet, TcpFlags, Transport};
pub use time::{NetworkTime, RunState};
