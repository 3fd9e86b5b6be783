//! Decoded packet representation
//!
//! The dispatcher consumes packets already decoded down to the IP layer;
//! link-layer handling and header parsing live outside this crate. A
//! `Packet` carries the fields the dispatch and analyzer layers need,
//! plus the dump flags the dispatcher writes back for the capture side.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::time::NetworkTime;

/// Transport protocols the demultiplexer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Transport {
    /// Mask folded into a port number before consulting the
    /// likely-server-ports table, so that 80/tcp and 80/udp are distinct
    /// entries in a single set.
    pub fn server_port_mask(self) -> u32 {
        match self {
            Transport::Tcp => 0x1_0000,
            Transport::Udp => 0x2_0000,
            Transport::Icmp => 0x3_0000,
            Transport::Other(_) => 0,
        }
    }

    /// Minimum transport header length, for truncation checks.
    pub fn min_header_len(self) -> usize {
        match self {
            Transport::Tcp => 20,
            Transport::Udp => 8,
            Transport::Icmp => 8,
            Transport::Other(_) => 0,
        }
    }
}

impl From<u8> for Transport {
    fn from(val: u8) -> Self {
        match val {
            6 => Transport::Tcp,
            17 => Transport::Udp,
            1 | 58 => Transport::Icmp,
            other => Transport::Other(other),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
            Transport::Icmp => write!(f, "icmp"),
            Transport::Other(n) => write!(f, "proto({})", n),
        }
    }
}

/// TCP header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags {
        fin: false,
        syn: true,
        rst: false,
        psh: false,
        ack: false,
        urg: false,
    };

    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }

    /// Initial SYN, without ACK.
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn is_rst(&self) -> bool {
        self.rst
    }
}

/// 5-tuple as seen on the wire, before canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnTuple {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
}

/// A packet decoded down to the IP layer.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp, on the simulated clock.
    pub ts: NetworkTime,

    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,

    /// TCP flags; `None` for non-TCP packets.
    pub tcp_flags: Option<TcpFlags>,

    /// IPv6 flow label (0 for IPv4).
    pub flow_label: u32,

    /// Number of IP headers seen, including extension headers. More than
    /// one on an IPv6 packet means extension headers are present.
    pub ip_hdr_count: u8,

    /// Payload length claimed by the IP header.
    pub ip_payload_len: usize,

    /// Bytes actually captured past the IP header.
    pub cap_len: usize,

    /// Transport header length within the captured bytes.
    pub header_len: usize,

    /// Transport payload.
    pub payload: Vec<u8>,

    /// True when this packet was produced by stream reassembly rather
    /// than captured off the wire.
    pub reassembled: bool,

    /// Encapsulation key (tunnel id) when the packet arrived inside a
    /// tunnel, `None` otherwise.
    pub encap: Option<u32>,

    /// Written back by the dispatcher: whether the capture side should
    /// dump this packet, and how many bytes of it (0 means all).
    pub dump_packet: bool,
    pub dump_size: usize,
}

impl Packet {
    /// Minimal TCP packet, primarily for tests and replay tooling.
    pub fn tcp(
        ts: NetworkTime,
        src_addr: IpAddr,
        src_port: u16,
        dst_addr: IpAddr,
        dst_port: u16,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Self {
        let len = 20 + payload.len();
        Self {
            ts,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            transport: Transport::Tcp,
            tcp_flags: Some(flags),
            flow_label: 0,
            ip_hdr_count: 1,
            ip_payload_len: len,
            cap_len: len,
            header_len: 20,
            payload: payload.to_vec(),
            reassembled: false,
            encap: None,
            dump_packet: false,
            dump_size: 0,
        }
    }

    /// Minimal UDP packet.
    pub fn udp(
        ts: NetworkTime,
        src_addr: IpAddr,
        src_port: u16,
        dst_addr: IpAddr,
        dst_port: u16,
        payload: &[u8],
    ) -> Self {
        let len = 8 + payload.len();
        Self {
            ts,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            transport: Transport::Udp,
            tcp_flags: None,
            flow_label: 0,
            ip_hdr_count: 1,
            ip_payload_len: len,
            cap_len: len,
            header_len: 8,
            payload: payload.to_vec(),
            reassembled: false,
            encap: None,
            dump_packet: false,
            dump_size: 0,
        }
    }

    pub fn conn_tuple(&self) -> ConnTuple {
        ConnTuple {
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
            src_port: self.src_port,
            dst_port: self.dst_port,
            transport: self.transport,
        }
    }

    /// IPv6 extension headers present?
    pub fn has_ip6_ext_headers(&self) -> bool {
        self.ip_hdr_count > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_tcp_flags() {
        let flags = TcpFlags::from_u8(0x12); // SYN+ACK
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.is_syn());
        assert!(flags.is_syn_ack());

        let syn = TcpFlags::from_u8(0x02);
        assert!(syn.is_syn());
        assert!(!syn.is_syn_ack());
    }

    #[test]
    fn test_server_port_mask_distinguishes_transports() {
        assert_ne!(
            Transport::Tcp.server_port_mask() | 80,
            Transport::Udp.server_port_mask() | 80
        );
    }

    #[test]
    fn test_packet_ctor() {
        let pkt = Packet::tcp(
            NetworkTime::from_secs(1.0),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            44321,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            TcpFlags::SYN,
            b"GET ",
        );
        assert_eq!(pkt.transport, Transport::Tcp);
        assert_eq!(pkt.ip_payload_len, 24);
        assert_eq!(pkt.header_len, 20);
        assert!(!pkt.has_ip6_ext_headers());
    }
}
