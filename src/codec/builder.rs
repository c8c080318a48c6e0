//! Packet building for synthesized replies: TCP segments, resets, and UDP
//! responses toward the guest.

use super::checksum;
use super::{
    Ipv4Header, TcpFlags, TcpPacket, UdpPacket, DEFAULT_TTL, IPV4_HEADER_LEN, TCP_HEADER_LEN,
    UDP_HEADER_LEN,
};
use crate::flow::FlowKey;
use std::net::Ipv4Addr;

/// Description of a TCP segment to synthesize toward the guest.
#[derive(Debug, Clone)]
pub struct TcpSegmentSpec<'a> {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option, carried on SYN-ACK only.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Build a TCP segment from a spec. Checksums are computed here; the caller
/// writes the result straight to the tunnel.
pub fn tcp_segment(spec: &TcpSegmentSpec<'_>) -> Vec<u8> {
    let options = spec.mss.map(|mss| {
        let bytes = mss.to_be_bytes();
        [0x02, 0x04, bytes[0], bytes[1]]
    });
    let options = options.as_ref().map(|o| o.as_slice()).unwrap_or(&[]);
    encode_tcp_parts(
        &Ipv4Header {
            tos: 0,
            identification: 0,
            flags_fragment: 0x4000, // DF
            ttl: DEFAULT_TTL,
            protocol: 6,
            src: spec.src,
            dst: spec.dst,
        },
        spec.src_port,
        spec.dst_port,
        spec.seq,
        spec.ack,
        spec.flags.bits(),
        spec.window,
        0,
        options,
        spec.payload,
    )
}

/// Build a RST in response to an offending guest packet. Sequence numbers
/// follow the classic rules: echo the acknowledgment when present, otherwise
/// acknowledge everything the offending segment consumed.
pub fn tcp_reset_for(packet: &TcpPacket<'_>) -> Vec<u8> {
    let seq = if packet.flags.contains(TcpFlags::ACK) {
        packet.ack
    } else {
        0
    };
    let ack = reset_ack_number(packet);
    tcp_segment(&TcpSegmentSpec {
        src: packet.dst(),
        src_port: packet.dst_port,
        dst: packet.src(),
        dst_port: packet.src_port,
        seq,
        ack,
        flags: TcpFlags::RST | TcpFlags::ACK,
        window: 0,
        mss: None,
        payload: &[],
    })
}

fn reset_ack_number(packet: &TcpPacket<'_>) -> u32 {
    (packet.payload.len() as u32)
        .wrapping_add(packet.seq)
        .wrapping_add(u32::from(packet.flags.contains(TcpFlags::SYN)))
        .wrapping_add(u32::from(packet.flags.contains(TcpFlags::FIN)))
}

/// Build a UDP response packet (remote -> guest) for the given flow key and
/// payload. The key has src = guest, dst = remote, so the reply swaps them.
pub fn udp_reply(key: &FlowKey, payload: &[u8]) -> Vec<u8> {
    udp_datagram(key.dst_ip, key.dst_port, key.src_ip, key.src_port, payload)
}

pub fn udp_datagram(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    encode_udp_parts(
        &Ipv4Header {
            tos: 0,
            identification: 0,
            flags_fragment: 0x4000, // DF
            ttl: DEFAULT_TTL,
            protocol: 17,
            src,
            dst,
        },
        src_port,
        dst_port,
        payload,
    )
}

/// Re-encode a decoded TCP packet. Together with `parse_packet` this
/// round-trips: header fields and options are reproduced verbatim and the
/// checksums recompute.
pub fn encode_tcp(packet: &TcpPacket<'_>) -> Vec<u8> {
    encode_tcp_parts(
        &packet.ip,
        packet.src_port,
        packet.dst_port,
        packet.seq,
        packet.ack,
        packet.raw_flags,
        packet.window,
        packet.urgent,
        packet.options,
        packet.payload,
    )
}

/// Re-encode a decoded UDP packet.
pub fn encode_udp(packet: &UdpPacket<'_>) -> Vec<u8> {
    encode_udp_parts(&packet.ip, packet.src_port, packet.dst_port, packet.payload)
}

#[allow(clippy::too_many_arguments)]
fn encode_tcp_parts(
    ip: &Ipv4Header,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    urgent: u16,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    debug_assert_eq!(options.len() % 4, 0);
    let tcp_len = TCP_HEADER_LEN + options.len() + payload.len();
    let total_len = IPV4_HEADER_LEN + tcp_len;
    let mut buffer = vec![0u8; total_len];
    write_ipv4_header(&mut buffer, ip, total_len);

    let offset = IPV4_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[offset + 4..offset + 8].copy_from_slice(&seq.to_be_bytes());
    buffer[offset + 8..offset + 12].copy_from_slice(&ack.to_be_bytes());
    let data_offset_words = ((TCP_HEADER_LEN + options.len()) / 4) as u8;
    buffer[offset + 12] = data_offset_words << 4;
    buffer[offset + 13] = flags;
    buffer[offset + 14..offset + 16].copy_from_slice(&window.to_be_bytes());
    // checksum placeholder at offset + 16..18
    buffer[offset + 18..offset + 20].copy_from_slice(&urgent.to_be_bytes());
    buffer[offset + TCP_HEADER_LEN..offset + TCP_HEADER_LEN + options.len()]
        .copy_from_slice(options);
    buffer[offset + TCP_HEADER_LEN + options.len()..].copy_from_slice(payload);

    let tcp_checksum = checksum::tcp_ipv4(ip.src, ip.dst, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    finish_ipv4_checksum(&mut buffer);
    buffer
}

fn encode_udp_parts(ip: &Ipv4Header, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];
    write_ipv4_header(&mut buffer, ip, total_len);

    let offset = IPV4_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[offset + 4..offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    // checksum placeholder at offset + 6..8
    buffer[offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv4(ip.src, ip.dst, &buffer[offset..]);
    buffer[offset + 6..offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());
    finish_ipv4_checksum(&mut buffer);
    buffer
}

fn write_ipv4_header(buffer: &mut [u8], ip: &Ipv4Header, total_len: usize) {
    buffer[0] = 0x45; // version 4, IHL 5
    buffer[1] = ip.tos;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[4..6].copy_from_slice(&ip.identification.to_be_bytes());
    buffer[6..8].copy_from_slice(&ip.flags_fragment.to_be_bytes());
    buffer[8] = ip.ttl;
    buffer[9] = ip.protocol;
    // checksum placeholder at 10..12
    buffer[12..16].copy_from_slice(&ip.src.octets());
    buffer[16..20].copy_from_slice(&ip.dst.octets());
}

fn finish_ipv4_checksum(buffer: &mut [u8]) {
    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}
