//! Flow identity shared by the TCP and UDP tables.

use crate::codec::{TcpPacket, UdpPacket};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize)]
pub enum FlowProto {
    Tcp,
    Udp,
}

/// 5-tuple identity of a guest flow. `src` is the guest side, `dst` the
/// remote peer.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug)]
pub struct FlowKey {
    pub proto: FlowProto,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn from_tcp(packet: &TcpPacket<'_>) -> Self {
        FlowKey {
            proto: FlowProto::Tcp,
            src_ip: packet.src(),
            src_port: packet.src_port,
            dst_ip: packet.dst(),
            dst_port: packet.dst_port,
        }
    }

    pub fn from_udp(packet: &UdpPacket<'_>) -> Self {
        FlowKey {
            proto: FlowProto::Udp,
            src_ip: packet.src(),
            src_port: packet.src_port,
            dst_ip: packet.dst(),
            dst_port: packet.dst_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            FlowProto::Tcp => "tcp",
            FlowProto::Udp => "udp",
        };
        write!(
            f,
            "{} {}:{} -> {}:{}",
            proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}
