//! Scheduled (expected) analyzers
//!
//! Earlier analysis can pre-declare that a future connection matching a
//! given index should come up with a specific analyzer already attached
//! (an FTP data channel, a media stream negotiated in signalling, ...).
//! Each expectation is valid until a timeout on the simulated clock.
//!
//! Records live in a slab arena indexed by two views at once: an
//! ordered multimap keyed by [`ConnIndex`] for lookup, and a min-heap
//! keyed by absolute timeout for expiration. A slot is freed exactly
//! once, after both views have dropped it.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::net::{IpAddr, Ipv6Addr};

use tracing::debug;

use crate::core::connection::Connection;
use crate::core::packet::Transport;
use crate::core::time::{NetworkTime, RunState};
use crate::runtime::Reporter;

use super::AnalyzerTag;

/// Index of an expected connection: originator, responder, transport,
/// responder port. The originator may be the unspecified address,
/// meaning "any originator"; an IPv4-unspecified originator is
/// normalized to the IPv6 unspecified form so lookups match the stored
/// form. Field order gives the derived total order used by the
/// multimap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnIndex {
    orig: IpAddr,
    resp: IpAddr,
    transport: Transport,
    resp_port: u16,
}

const WILDCARD: IpAddr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);

impl ConnIndex {
    pub fn new(orig: IpAddr, resp: IpAddr, resp_port: u16, transport: Transport) -> Self {
        let orig = if orig.is_unspecified() { WILDCARD } else { orig };
        Self {
            orig,
            resp,
            transport,
            resp_port,
        }
    }

    pub fn for_connection(conn: &Connection) -> Self {
        Self::new(
            conn.orig_addr(),
            conn.resp_addr(),
            conn.resp_port(),
            conn.transport(),
        )
    }

    /// The same index with the originator replaced by the wildcard.
    pub fn with_wildcard_orig(mut self) -> Self {
        self.orig = WILDCARD;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.orig == WILDCARD
    }
}

/// One expectation record. Never mutated after insertion.
#[derive(Debug, Clone, Copy)]
struct ScheduledAnalyzer {
    conn: ConnIndex,
    tag: AnalyzerTag,
    timeout: NetworkTime,
}

/// Heap key: earliest timeout first (through `Reverse`), slot as
/// tiebreaker for a total order.
#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    timeout: NetworkTime,
    slot: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timeout
            .total_cmp(&other.timeout)
            .then(self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct ScheduledTable {
    slots: Vec<Option<ScheduledAnalyzer>>,
    free: Vec<usize>,
    by_conn: BTreeMap<ConnIndex, Vec<usize>>,
    by_timeout: BinaryHeap<Reverse<HeapEntry>>,
    len: usize,
}

impl ScheduledTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Schedule `tag` for a future connection matching `conn`, valid
    /// for `timeout_rel` seconds from now.
    ///
    /// Rejected with a warning (and no state change) before network
    /// processing has begun or for a non-positive timeout. Takes the
    /// chance to expire anything already overdue.
    pub fn schedule(
        &mut self,
        conn: ConnIndex,
        tag: AnalyzerTag,
        timeout_rel: f64,
        run_state: &RunState,
        reporter: &Reporter,
    ) {
        let Some(now) = run_state.network_time() else {
            reporter.warning("cannot schedule analyzers before processing begins; ignored");
            return;
        };

        if timeout_rel <= 0.0 {
            reporter.warning("scheduled analyzer timeout must be positive; ignored");
            return;
        }

        self.expire(now, reporter);

        let record = ScheduledAnalyzer {
            conn,
            tag,
            timeout: now.offset(timeout_rel),
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(record);
                slot
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };

        self.by_conn.entry(conn).or_default().push(slot);
        self.by_timeout.push(Reverse(HeapEntry {
            timeout: record.timeout,
            slot,
        }));
        self.len += 1;

        debug!(
            "scheduled analyzer {} for expected connection (timeout {})",
            tag, record.timeout
        );
    }

    /// Drop every record whose timeout has passed. Returns how many
    /// were expired.
    pub fn expire(&mut self, now: NetworkTime, reporter: &Reporter) -> usize {
        let mut expired = 0;

        while let Some(&Reverse(top)) = self.by_timeout.peek() {
            if top.timeout.total_cmp(&now) == Ordering::Greater {
                break;
            }
            self.by_timeout.pop();

            let Some(record) = self.slots[top.slot].take() else {
                // Both views should drop a slot together; finding the
                // heap ahead of the arena means they diverged.
                debug_assert!(false, "scheduled-analyzer views diverged");
                reporter.internal_warning("expired scheduled analyzer missing from arena");
                continue;
            };

            let mut found = false;
            if let Some(slots) = self.by_conn.get_mut(&record.conn) {
                // Removal is by slot identity: several records may share
                // one index.
                if let Some(pos) = slots.iter().position(|&s| s == top.slot) {
                    slots.swap_remove(pos);
                    found = true;
                }
                if slots.is_empty() {
                    self.by_conn.remove(&record.conn);
                }
            }

            if !found {
                debug_assert!(found, "scheduled-analyzer views diverged");
                reporter.internal_warning("expired scheduled analyzer missing from index");
            }

            debug!("expiring expected analyzer {}", record.tag);
            self.free.push(top.slot);
            self.len -= 1;
            expired += 1;
        }

        expired
    }

    /// Tags expected for this connection: exact matches
    /// unconditionally, wildcard-originator matches only while still
    /// fresh. Records are not consumed; they expire on time.
    pub fn get_scheduled(&self, conn: &Connection, now: NetworkTime) -> BTreeSet<AnalyzerTag> {
        let index = ConnIndex::for_connection(conn);
        let mut result = BTreeSet::new();

        if let Some(slots) = self.by_conn.get(&index) {
            for &slot in slots {
                if let Some(record) = &self.slots[slot] {
                    result.insert(record.tag);
                }
            }
        }

        let wildcard = index.with_wildcard_orig();
        if wildcard != index {
            if let Some(slots) = self.by_conn.get(&wildcard) {
                for &slot in slots {
                    if let Some(record) = &self.slots[slot] {
                        if record.timeout.total_cmp(&now) == Ordering::Greater {
                            result.insert(record.tag);
                        }
                    }
                }
            }
        }

        result
    }

    /// Drop everything; used at shutdown.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_conn.clear();
        self.by_timeout.clear();
        self.len = 0;
    }

    #[cfg(test)]
    fn view_lens(&self) -> (usize, usize) {
        let map: usize = self.by_conn.values().map(|v| v.len()).sum();
        (map, self.by_timeout.len())
    }
}
