//! Event hub
//!
//! Connections and analyzers signal upstream by enqueuing events. The
//! hub only queues events someone has subscribed to; building an event
//! nobody listens for is wasted work on the packet path.

use std::collections::HashSet;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::analyzer::AnalyzerTag;

/// The events the core emits toward the script/notification layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewConnection,
    ConnectionReused,
    NewPacket,
    Ipv6ExtHeaders,
    ScheduledAnalyzerApplied,
    SetupAnalyzerTree,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::NewConnection => "new_connection",
            EventKind::ConnectionReused => "connection_reused",
            EventKind::NewPacket => "new_packet",
            EventKind::Ipv6ExtHeaders => "ipv6_ext_headers",
            EventKind::ScheduledAnalyzerApplied => "scheduled_analyzer_applied",
            EventKind::SetupAnalyzerTree => "setup_analyzer_tree",
        }
    }
}

/// A queued event. `tag` is set for `scheduled_analyzer_applied`.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub conn_id: u64,
    pub tag: Option<AnalyzerTag>,
}

/// Subscription-gated event queue.
pub struct EventHub {
    subscribed: HashSet<EventKind>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            subscribed: HashSet::new(),
            tx,
            rx,
        }
    }

    pub fn subscribe(&mut self, kind: EventKind) {
        self.subscribed.insert(kind);
    }

    pub fn unsubscribe(&mut self, kind: EventKind) {
        self.subscribed.remove(&kind);
    }

    /// Is anyone listening for this event?
    pub fn wants(&self, kind: EventKind) -> bool {
        self.subscribed.contains(&kind)
    }

    /// Enqueue an event if subscribed; otherwise a no-op.
    pub fn emit(&self, kind: EventKind, conn_id: u64, tag: Option<AnalyzerTag>) {
        if !self.wants(kind) {
            return;
        }
        // The receiver lives as long as the hub, so a send cannot fail.
        let _ = self.tx.send(Event { kind, conn_id, tag });
    }

    /// Drain all queued events.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_requires_subscription() {
        let mut hub = EventHub::new();
        hub.emit(EventKind::NewConnection, 1, None);
        assert!(hub.drain().is_empty());

        hub.subscribe(EventKind::NewConnection);
        hub.emit(EventKind::NewConnection, 1, None);
        hub.emit(EventKind::NewPacket, 1, None);

        let events = hub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::NewConnection);
        assert_eq!(events[0].conn_id, 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut hub = EventHub::new();
        hub.subscribe(EventKind::NewPacket);
        assert!(hub.wants(EventKind::NewPacket));
        hub.unsubscribe(EventKind::NewPacket);
        assert!(!hub.wants(EventKind::NewPacket));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::ScheduledAnalyzerApplied.name(), "scheduled_analyzer_applied");
        assert_eq!(EventKind::ConnectionReused.name(), "connection_reused");
    }
}
