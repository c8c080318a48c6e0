use super::builder::{self, TcpSegmentSpec};
use super::*;
use std::net::Ipv4Addr;

const GUEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

fn sample_tcp_bytes() -> Vec<u8> {
    builder::tcp_segment(&TcpSegmentSpec {
        src: GUEST,
        src_port: 5555,
        dst: REMOTE,
        dst_port: 443,
        seq: 0x0102_0304,
        ack: 0x0a0b_0c0d,
        flags: TcpFlags::ACK | TcpFlags::PSH,
        window: 0x1234,
        mss: None,
        payload: b"client-bytes",
    })
}

fn sample_udp_bytes() -> Vec<u8> {
    builder::udp_datagram(GUEST, 40_000, REMOTE, 53, b"datagram-payload")
}

#[test]
fn parse_tcp_fields() {
    let bytes = sample_tcp_bytes();
    let ParsedPacket::Tcp(packet) = parse_packet(&bytes).expect("valid tcp") else {
        panic!("expected tcp");
    };
    assert_eq!(packet.src(), GUEST);
    assert_eq!(packet.dst(), REMOTE);
    assert_eq!(packet.src_port, 5555);
    assert_eq!(packet.dst_port, 443);
    assert_eq!(packet.seq, 0x0102_0304);
    assert_eq!(packet.ack, 0x0a0b_0c0d);
    assert_eq!(packet.flags, TcpFlags::ACK | TcpFlags::PSH);
    assert_eq!(packet.window, 0x1234);
    assert_eq!(packet.payload, b"client-bytes");
    assert!(packet.options.is_empty());
}

#[test]
fn parse_udp_fields() {
    let bytes = sample_udp_bytes();
    let ParsedPacket::Udp(packet) = parse_packet(&bytes).expect("valid udp") else {
        panic!("expected udp");
    };
    assert_eq!(packet.src(), GUEST);
    assert_eq!(packet.dst_port, 53);
    assert_eq!(packet.payload, b"datagram-payload");
}

#[test]
fn other_protocols_decode_as_other() {
    // ICMP echo: header only, protocol 1.
    let mut bytes = vec![0u8; 28];
    bytes[0] = 0x45;
    bytes[2..4].copy_from_slice(&28u16.to_be_bytes());
    bytes[8] = 64;
    bytes[9] = 1;
    bytes[12..16].copy_from_slice(&GUEST.octets());
    bytes[16..20].copy_from_slice(&REMOTE.octets());
    let cksum = checksum::ipv4_header(&bytes[..20]);
    bytes[10..12].copy_from_slice(&cksum.to_be_bytes());
    assert!(matches!(parse_packet(&bytes), Ok(ParsedPacket::Other)));
}

#[test]
fn malformed_inputs_are_rejected() {
    assert!(matches!(parse_packet(&[]), Err(ParseError::EmptyPacket)));
    assert!(matches!(
        parse_packet(&[0x60; 40]),
        Err(ParseError::UnsupportedIpVersion(6))
    ));
    assert!(matches!(
        parse_packet(&[0x45, 0x00, 0x00]),
        Err(ParseError::MalformedIpv4Header)
    ));

    // Total length larger than the buffer.
    let mut bytes = sample_tcp_bytes();
    let new_len = bytes.len() as u16 + 8;
    bytes[2..4].copy_from_slice(&new_len.to_be_bytes());
    assert!(matches!(
        parse_packet(&bytes),
        Err(ParseError::MalformedIpv4Header)
    ));

    // Corrupted header checksum.
    let mut bytes = sample_tcp_bytes();
    bytes[10] ^= 0xFF;
    assert!(matches!(
        parse_packet(&bytes),
        Err(ParseError::BadIpv4Checksum)
    ));

    // TCP data offset pointing past the segment.
    let mut bytes = builder::tcp_segment(&TcpSegmentSpec {
        src: GUEST,
        src_port: 1,
        dst: REMOTE,
        dst_port: 2,
        seq: 0,
        ack: 0,
        flags: TcpFlags::SYN,
        window: 0,
        mss: None,
        payload: &[],
    });
    bytes[20 + 12] = 0xF0;
    let cksum_zeroed = {
        bytes[10] = 0;
        bytes[11] = 0;
        checksum::ipv4_header(&bytes[..20])
    };
    bytes[10..12].copy_from_slice(&cksum_zeroed.to_be_bytes());
    assert!(matches!(
        parse_packet(&bytes),
        Err(ParseError::MalformedTcpSegment)
    ));

    // UDP length shorter than the header.
    let mut bytes = sample_udp_bytes();
    bytes[20 + 4..20 + 6].copy_from_slice(&4u16.to_be_bytes());
    assert!(matches!(
        parse_packet(&bytes),
        Err(ParseError::MalformedUdpDatagram)
    ));
}

#[test]
fn tcp_round_trip_reproduces_input() {
    let bytes = sample_tcp_bytes();
    let ParsedPacket::Tcp(packet) = parse_packet(&bytes).expect("valid tcp") else {
        panic!("expected tcp");
    };
    assert_eq!(builder::encode_tcp(&packet), bytes);
}

#[test]
fn tcp_round_trip_preserves_options() {
    let bytes = builder::tcp_segment(&TcpSegmentSpec {
        src: REMOTE,
        src_port: 443,
        dst: GUEST,
        dst_port: 5555,
        seq: 77,
        ack: 88,
        flags: TcpFlags::SYN | TcpFlags::ACK,
        window: 0xFFFF,
        mss: Some(1460),
        payload: &[],
    });
    let ParsedPacket::Tcp(packet) = parse_packet(&bytes).expect("valid syn-ack") else {
        panic!("expected tcp");
    };
    assert_eq!(packet.options, &[0x02, 0x04, 0x05, 0xB4]);
    assert_eq!(builder::encode_tcp(&packet), bytes);
}

#[test]
fn tcp_round_trip_preserves_unknown_flag_bits() {
    // Set ECE on the wire and rewrite the segment checksum to match.
    let mut bytes = sample_tcp_bytes();
    bytes[20 + 13] |= 0x40;
    bytes[20 + 16] = 0;
    bytes[20 + 17] = 0;
    let cksum = checksum::tcp_ipv4(GUEST, REMOTE, &bytes[20..]);
    bytes[20 + 16..20 + 18].copy_from_slice(&cksum.to_be_bytes());

    let ParsedPacket::Tcp(packet) = parse_packet(&bytes).expect("valid tcp") else {
        panic!("expected tcp");
    };
    assert_eq!(packet.flags, TcpFlags::ACK | TcpFlags::PSH);
    assert_eq!(packet.raw_flags, 0x58, "ECE survives in the raw byte");
    assert_eq!(builder::encode_tcp(&packet), bytes);
}

#[test]
fn udp_round_trip_reproduces_input() {
    let bytes = sample_udp_bytes();
    let ParsedPacket::Udp(packet) = parse_packet(&bytes).expect("valid udp") else {
        panic!("expected udp");
    };
    assert_eq!(builder::encode_udp(&packet), bytes);
}

#[test]
fn built_packets_carry_verifying_checksums() {
    let bytes = sample_tcp_bytes();
    assert!(checksum::ipv4_header_valid(&bytes[..20]));
    // A checksummed segment re-summed over the pseudo-header folds to zero.
    assert_eq!(checksum::tcp_ipv4(GUEST, REMOTE, &bytes[20..]), 0);

    let bytes = sample_udp_bytes();
    assert!(checksum::ipv4_header_valid(&bytes[..20]));
    assert_eq!(checksum::udp_ipv4(GUEST, REMOTE, &bytes[20..]), 0);
}

#[test]
fn reset_for_ack_segment_echoes_acknowledgment() {
    let bytes = sample_tcp_bytes();
    let ParsedPacket::Tcp(packet) = parse_packet(&bytes).expect("valid tcp") else {
        panic!("expected tcp");
    };
    let reset_bytes = builder::tcp_reset_for(&packet);
    let ParsedPacket::Tcp(reset) = parse_packet(&reset_bytes).expect("valid rst") else {
        panic!("expected tcp");
    };
    assert!(reset.flags.contains(TcpFlags::RST | TcpFlags::ACK));
    assert_eq!(reset.src(), REMOTE);
    assert_eq!(reset.dst(), GUEST);
    assert_eq!(reset.dst_port, 5555);
    assert_eq!(reset.seq, packet.ack, "RST seq echoes the offending ACK");
    assert_eq!(
        reset.ack,
        packet.seq.wrapping_add(packet.payload.len() as u32)
    );
    assert!(reset.payload.is_empty());
}

#[test]
fn reset_for_syn_acknowledges_the_syn() {
    let syn_bytes = builder::tcp_segment(&TcpSegmentSpec {
        src: GUEST,
        src_port: 5555,
        dst: REMOTE,
        dst_port: 443,
        seq: 1_000,
        ack: 0,
        flags: TcpFlags::SYN,
        window: 0xFFFF,
        mss: None,
        payload: &[],
    });
    let ParsedPacket::Tcp(syn) = parse_packet(&syn_bytes).expect("valid syn") else {
        panic!("expected tcp");
    };
    let reset_bytes = builder::tcp_reset_for(&syn);
    let ParsedPacket::Tcp(reset) = parse_packet(&reset_bytes).expect("valid rst") else {
        panic!("expected tcp");
    };
    assert_eq!(reset.seq, 0, "no ACK to echo on a bare SYN");
    assert_eq!(reset.ack, 1_001);
}

#[test]
fn udp_reply_reverses_the_flow_tuple() {
    let key = crate::flow::FlowKey {
        proto: crate::flow::FlowProto::Udp,
        src_ip: GUEST,
        src_port: 40_000,
        dst_ip: REMOTE,
        dst_port: 53,
    };
    let bytes = builder::udp_reply(&key, b"answer");
    let ParsedPacket::Udp(reply) = parse_packet(&bytes).expect("valid udp") else {
        panic!("expected udp");
    };
    assert_eq!(reply.src(), REMOTE);
    assert_eq!(reply.src_port, 53);
    assert_eq!(reply.dst(), GUEST);
    assert_eq!(reply.dst_port, 40_000);
    assert_eq!(reply.payload, b"answer");
}
