//! Shared helpers for the in-crate test suites: a recording host, guest
//! packet builders, and polling utilities.

use crate::codec::builder::{self, TcpSegmentSpec};
use crate::codec::{parse_packet, ParsedPacket, TcpFlags, TcpPacket, UdpPacket};
use crate::flow::FlowKey;
use crate::host::{HostError, TunnelConfig, TunnelHost};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub(crate) fn init_tracing() {
    static INIT: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
    Lazy::force(&INIT);
}

/// Host double that records every interaction and can be told to refuse
/// self-exclusion or socket protection.
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub fail_self_exclusion: AtomicBool,
    pub fail_protect: AtomicBool,
    pub protected: Mutex<Vec<RawFd>>,
    pub established: Mutex<Vec<TunnelConfig>>,
    pub uids: Mutex<FxHashMap<FlowKey, u32>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_uid(&self, key: FlowKey, uid: u32) {
        self.uids.lock().insert(key, uid);
    }

    pub fn protected_count(&self) -> usize {
        self.protected.lock().len()
    }

    pub fn establish_count(&self) -> usize {
        self.established.lock().len()
    }
}

impl TunnelHost for RecordingHost {
    fn install_self_exclusion(&self) -> Result<(), HostError> {
        if self.fail_self_exclusion.load(Ordering::Relaxed) {
            Err(HostError::SelfExclusionRejected("denied by test".into()))
        } else {
            Ok(())
        }
    }

    fn establish(&self, config: &TunnelConfig) -> Result<(), HostError> {
        self.established.lock().push(config.clone());
        Ok(())
    }

    fn protect(&self, fd: RawFd) -> bool {
        if self.fail_protect.load(Ordering::Relaxed) {
            return false;
        }
        self.protected.lock().push(fd);
        true
    }

    fn owner_uid(&self, key: &FlowKey) -> Option<u32> {
        self.uids.lock().get(key).copied()
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub(crate) async fn wait_for<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// Await the next outbound frame with a deadline.
pub(crate) async fn recv_frame(
    handle: &crate::tun::TunHandle,
    timeout: Duration,
) -> Option<Vec<u8>> {
    tokio::time::timeout(timeout, handle.next_outbound())
        .await
        .ok()
        .flatten()
}

pub(crate) fn parse_tcp(frame: &[u8]) -> TcpPacket<'_> {
    match parse_packet(frame) {
        Ok(ParsedPacket::Tcp(packet)) => packet,
        other => panic!("expected TCP frame, got {other:?}"),
    }
}

pub(crate) fn parse_udp(frame: &[u8]) -> UdpPacket<'_> {
    match parse_packet(frame) {
        Ok(ParsedPacket::Udp(packet)) => packet,
        other => panic!("expected UDP frame, got {other:?}"),
    }
}

/// Build a guest-originated TCP segment for `key` (guest = key.src).
pub(crate) fn guest_tcp(
    key: &FlowKey,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    builder::tcp_segment(&TcpSegmentSpec {
        src: key.src_ip,
        src_port: key.src_port,
        dst: key.dst_ip,
        dst_port: key.dst_port,
        seq,
        ack,
        flags,
        window: 0xFFFF,
        mss: None,
        payload,
    })
}

pub(crate) fn guest_syn(key: &FlowKey, isn: u32) -> Vec<u8> {
    guest_tcp(key, isn, 0, TcpFlags::SYN, &[])
}

/// Build a guest-originated UDP datagram for `key`.
pub(crate) fn guest_udp(key: &FlowKey, payload: &[u8]) -> Vec<u8> {
    builder::udp_datagram(key.src_ip, key.src_port, key.dst_ip, key.dst_port, payload)
}

pub(crate) fn encode_dns_name(name: &str) -> Vec<u8> {
    let mut encoded = Vec::new();
    for label in name.split('.') {
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);
    encoded
}

#[derive(Clone, Copy)]
pub(crate) enum DnsAnswerSpec {
    A([u8; 4], u32),
    Aaaa([u16; 8], u32),
}

impl DnsAnswerSpec {
    pub fn a(octets: [u8; 4], ttl: u32) -> Self {
        DnsAnswerSpec::A(octets, ttl)
    }

    pub fn aaaa(segments: [u16; 8], ttl: u32) -> Self {
        DnsAnswerSpec::Aaaa(segments, ttl)
    }
}

pub(crate) fn build_dns_query(host: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x00, 0x01]); // id
    payload.extend_from_slice(&[0x01, 0x00]); // recursion desired
    payload.extend_from_slice(&[0x00, 0x01]); // qdcount
    payload.extend_from_slice(&[0x00, 0x00]); // ancount
    payload.extend_from_slice(&[0x00, 0x00]); // nscount
    payload.extend_from_slice(&[0x00, 0x00]); // arcount
    payload.extend_from_slice(&encode_dns_name(host));
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // type A, class IN
    payload
}

/// Build a standard response: the question section plus one compressed
/// answer record per spec, each answer name pointing back at the question.
pub(crate) fn build_dns_response(host: &str, answers: &[DnsAnswerSpec]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x00, 0x01]); // id
    payload.extend_from_slice(&[0x81, 0x80]); // standard response
    payload.extend_from_slice(&[0x00, 0x01]); // qdcount
    payload.extend_from_slice(&(answers.len() as u16).to_be_bytes()); // ancount
    payload.extend_from_slice(&[0x00, 0x00]); // nscount
    payload.extend_from_slice(&[0x00, 0x00]); // arcount
    payload.extend_from_slice(&encode_dns_name(host));
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // type A, class IN
    for answer in answers {
        payload.extend_from_slice(&[0xC0, 0x0C]); // pointer to question name
        match answer {
            DnsAnswerSpec::A(octets, ttl) => {
                payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
                payload.extend_from_slice(&ttl.to_be_bytes());
                payload.extend_from_slice(&[0x00, 0x04]);
                payload.extend_from_slice(octets);
            }
            DnsAnswerSpec::Aaaa(segments, ttl) => {
                payload.extend_from_slice(&[0x00, 0x1C, 0x00, 0x01]); // AAAA, IN
                payload.extend_from_slice(&ttl.to_be_bytes());
                payload.extend_from_slice(&[0x00, 0x10]);
                for segment in segments {
                    payload.extend_from_slice(&segment.to_be_bytes());
                }
            }
        }
    }
    payload
}
