//! Session table
//!
//! Storage and lookup for live connections, keyed by the canonical
//! 5-tuple. Reuse detection itself lives on `Connection`; the table
//! only tracks membership and hands out connection ids.

use std::collections::HashMap;

use crate::core::connection::{ConnKey, Connection};

/// Table statistics.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub inserts: u64,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub removals: u64,
    pub reuses: u64,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    conns: HashMap<ConnKey, Connection>,
    next_id: u64,
    pub stats: SessionStats,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
            next_id: 1,
            stats: SessionStats::default(),
        }
    }

    pub fn find(&mut self, key: &ConnKey) -> Option<&Connection> {
        self.stats.lookups += 1;
        let hit = self.conns.get(key);
        if hit.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        hit
    }

    /// Lookup without touching the statistics.
    pub fn get(&self, key: &ConnKey) -> Option<&Connection> {
        self.conns.get(key)
    }

    pub fn get_mut(&mut self, key: &ConnKey) -> Option<&mut Connection> {
        self.conns.get_mut(key)
    }

    pub fn insert(&mut self, conn: Connection) {
        self.stats.inserts += 1;
        self.conns.insert(conn.key().clone(), conn);
    }

    pub fn remove(&mut self, key: &ConnKey) -> Option<Connection> {
        let removed = self.conns.remove(key);
        if removed.is_some() {
            self.stats.removals += 1;
        }
        removed
    }

    /// Allocate the next connection id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// Remove and return every connection; used at shutdown.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.conns.drain().map(|(_, conn)| conn).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{ConnTuple, TcpFlags, Transport};
    use crate::core::time::NetworkTime;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_conn(table: &mut SessionTable, src_port: u16, dst_port: u16) -> Connection {
        let tuple = ConnTuple {
            src_addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port,
            dst_port,
            transport: Transport::Tcp,
        };
        let id = table.next_id();
        Connection::new(
            id,
            ConnKey::from_tuple(&tuple),
            &tuple,
            NetworkTime::from_secs(0.0),
            0,
            Some(TcpFlags::SYN),
        )
    }

    #[test]
    fn test_insert_find_remove() {
        let mut table = SessionTable::new();
        let conn = make_conn(&mut table, 44321, 80);
        let key = conn.key().clone();

        assert!(table.find(&key).is_none());
        table.insert(conn);
        assert_eq!(table.len(), 1);
        assert!(table.find(&key).is_some());

        let removed = table.remove(&key).unwrap();
        assert_eq!(removed.key(), &key);
        assert!(table.is_empty());
        assert_eq!(table.stats.hits, 1);
        assert_eq!(table.stats.misses, 1);
        assert_eq!(table.stats.removals, 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let mut table = SessionTable::new();
        let a = make_conn(&mut table, 1000, 80);
        let b = make_conn(&mut table, 1001, 80);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_drain() {
        let mut table = SessionTable::new();
        let a = make_conn(&mut table, 1000, 80);
        let b = make_conn(&mut table, 1001, 80);
        table.insert(a);
        table.insert(b);

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
