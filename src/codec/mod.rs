//! IPv4 + TCP/UDP packet codec.
//!
//! Pure value-in/value-out parsing and building over byte buffers. Decoded
//! views borrow from the datagram and live for one dispatch cycle; the
//! builder produces fresh buffers with recomputed checksums. Decode and
//! encode round-trip: for well-formed bytes, re-encoding a decoded packet
//! reproduces the input except for checksum fields, which recompute to the
//! same values when the input checksums were correct.

pub mod builder;
pub mod checksum;

use bitflags::bitflags;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const DEFAULT_TTL: u8 = 64;

/// Detailed error information for packet decode failures. The caller drops
/// the offending packet and counts it; nothing propagates further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty packet")]
    EmptyPacket,
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    #[error("malformed IPv4 header")]
    MalformedIpv4Header,
    #[error("IPv4 header checksum mismatch")]
    BadIpv4Checksum,
    #[error("malformed TCP segment")]
    MalformedTcpSegment,
    #[error("malformed UDP datagram")]
    MalformedUdpDatagram,
}

bitflags! {
    /// TCP control flags the gateway inspects. Everything else in the flag
    /// byte is preserved by the raw decode but ignored by the state machine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
    }
}

#[derive(Debug, Clone)]
pub enum ParsedPacket<'a> {
    Tcp(TcpPacket<'a>),
    Udp(UdpPacket<'a>),
    /// Valid IPv4 carrying a protocol the gateway does not forward.
    Other,
}

/// Decoded IPv4 header fields carried through to re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct TcpPacket<'a> {
    pub ip: Ipv4Header,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    /// Full flag byte as received, including bits outside [`TcpFlags`].
    pub raw_flags: u8,
    pub window: u16,
    pub urgent: u16,
    /// Raw option bytes, preserved verbatim for round-tripping.
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct UdpPacket<'a> {
    pub ip: Ipv4Header,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl TcpPacket<'_> {
    pub fn src(&self) -> Ipv4Addr {
        self.ip.src
    }

    pub fn dst(&self) -> Ipv4Addr {
        self.ip.dst
    }
}

impl UdpPacket<'_> {
    pub fn src(&self) -> Ipv4Addr {
        self.ip.src
    }

    pub fn dst(&self) -> Ipv4Addr {
        self.ip.dst
    }
}

/// Decode one IP datagram read from the tunnel.
pub fn parse_packet(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.is_empty() {
        return Err(ParseError::EmptyPacket);
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(ParseError::UnsupportedIpVersion(version));
    }
    parse_ipv4(packet)
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(ParseError::MalformedIpv4Header);
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    if !checksum::ipv4_header_valid(&packet[..header_len]) {
        return Err(ParseError::BadIpv4Checksum);
    }
    let header = Ipv4Header {
        tos: packet[1],
        identification: u16::from_be_bytes([packet[4], packet[5]]),
        flags_fragment: u16::from_be_bytes([packet[6], packet[7]]),
        ttl: packet[8],
        protocol: packet[9],
        src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
    };
    let payload = &packet[header_len..total_len];
    match header.protocol {
        6 => parse_tcp(header, payload),
        17 => parse_udp(header, payload),
        _ => Ok(ParsedPacket::Other),
    }
}

fn parse_tcp(ip: Ipv4Header, segment: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if segment.len() < TCP_HEADER_LEN {
        return Err(ParseError::MalformedTcpSegment);
    }
    let data_offset = usize::from(segment[12] >> 4) * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > segment.len() {
        return Err(ParseError::MalformedTcpSegment);
    }
    Ok(ParsedPacket::Tcp(TcpPacket {
        ip,
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        flags: TcpFlags::from_bits_truncate(segment[13]),
        raw_flags: segment[13],
        window: u16::from_be_bytes([segment[14], segment[15]]),
        urgent: u16::from_be_bytes([segment[18], segment[19]]),
        options: &segment[TCP_HEADER_LEN..data_offset],
        payload: &segment[data_offset..],
    }))
}

fn parse_udp(ip: Ipv4Header, segment: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if segment.len() < UDP_HEADER_LEN {
        return Err(ParseError::MalformedUdpDatagram);
    }
    let length = u16::from_be_bytes([segment[4], segment[5]]) as usize;
    if length < UDP_HEADER_LEN || length > segment.len() {
        return Err(ParseError::MalformedUdpDatagram);
    }
    Ok(ParsedPacket::Udp(UdpPacket {
        ip,
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        payload: &segment[UDP_HEADER_LEN..length],
    }))
}

#[cfg(test)]
mod tests;
