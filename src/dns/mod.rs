//! Passive DNS inspection: a read-only parser over UDP/53 payloads that
//! extracts the queried name plus A/AAAA answers and feeds the domain cache.

mod cache;

pub use cache::{DomainCache, MAX_TTL_SECONDS, MIN_TTL_SECONDS};

use crate::stats::GatewayStats;
use smallvec::SmallVec;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

const DNS_HEADER_LEN: usize = 12;
const MAX_LABELS: usize = 64;
const MAX_POINTER_JUMPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DnsParseError {
    #[error("truncated DNS message")]
    Truncated,
    #[error("malformed DNS name")]
    MalformedName,
    #[error("compression pointer loop")]
    PointerLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsAnswer {
    pub addr: IpAddr,
    pub ttl: u32,
}

/// The subset of a DNS message the gateway cares about.
#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub response: bool,
    pub qname: Option<String>,
    pub answers: SmallVec<[DnsAnswer; 4]>,
}

/// Parse a DNS message far enough to extract the question name and any
/// A/AAAA answers. Terminates on every input: label walks are bounded and
/// compression pointers are limited to [`MAX_POINTER_JUMPS`] jumps.
pub fn parse_message(payload: &[u8]) -> Result<DnsMessage, DnsParseError> {
    if payload.len() < DNS_HEADER_LEN {
        return Err(DnsParseError::Truncated);
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let response = (flags & 0x8000) != 0;
    let qd_count = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let an_count = u16::from_be_bytes([payload[6], payload[7]]) as usize;

    let mut offset = DNS_HEADER_LEN;
    let mut qname = None;
    for index in 0..qd_count {
        let name = read_name(payload, &mut offset)?;
        if index == 0 {
            qname = Some(name);
        }
        if offset + 4 > payload.len() {
            return Err(DnsParseError::Truncated);
        }
        offset += 4; // type + class
    }

    let mut answers = SmallVec::new();
    for _ in 0..an_count {
        read_name(payload, &mut offset)?;
        if offset + 10 > payload.len() {
            return Err(DnsParseError::Truncated);
        }
        let record_type = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let ttl = u32::from_be_bytes([
            payload[offset + 4],
            payload[offset + 5],
            payload[offset + 6],
            payload[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([payload[offset + 8], payload[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlength > payload.len() {
            return Err(DnsParseError::Truncated);
        }
        let rdata = &payload[offset..offset + rdlength];
        offset += rdlength;

        match record_type {
            1 if rdlength == 4 => answers.push(DnsAnswer {
                addr: IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
                ttl,
            }),
            28 if rdlength == 16 => {
                let mut segments = [0u16; 8];
                for (index, segment) in segments.iter_mut().enumerate() {
                    *segment = u16::from_be_bytes([rdata[index * 2], rdata[index * 2 + 1]]);
                }
                answers.push(DnsAnswer {
                    addr: IpAddr::V6(Ipv6Addr::new(
                        segments[0],
                        segments[1],
                        segments[2],
                        segments[3],
                        segments[4],
                        segments[5],
                        segments[6],
                        segments[7],
                    )),
                    ttl,
                });
            }
            _ => {}
        }
    }

    Ok(DnsMessage {
        response,
        qname,
        answers,
    })
}

fn read_name(buf: &[u8], offset: &mut usize) -> Result<String, DnsParseError> {
    let mut labels: Vec<String> = Vec::new();
    let mut position = *offset;
    let mut jumped = false;
    let mut jumps = 0usize;
    loop {
        if position >= buf.len() {
            return Err(DnsParseError::Truncated);
        }
        let len = buf[position] as usize;
        if len == 0 {
            position += 1;
            if !jumped {
                *offset = position;
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            if position + 1 >= buf.len() {
                return Err(DnsParseError::Truncated);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(DnsParseError::PointerLoop);
            }
            let pointer = (((len & 0x3F) as usize) << 8) | buf[position + 1] as usize;
            if !jumped {
                *offset = position + 2;
            }
            // Only strictly-backward targets make progress; a self- or
            // forward-pointing reference can never terminate a name.
            if pointer >= position {
                return Err(DnsParseError::PointerLoop);
            }
            position = pointer;
            jumped = true;
            continue;
        }
        if len & 0xC0 != 0 {
            return Err(DnsParseError::MalformedName);
        }
        position += 1;
        if position + len > buf.len() {
            return Err(DnsParseError::Truncated);
        }
        labels.push(String::from_utf8_lossy(&buf[position..position + len]).to_string());
        position += len;
        if labels.len() > MAX_LABELS {
            return Err(DnsParseError::MalformedName);
        }
    }
    if labels.is_empty() {
        return Err(DnsParseError::MalformedName);
    }
    Ok(labels.join(".").to_ascii_lowercase())
}

/// Observes UDP/53 payloads in both directions. Counters are pure
/// telemetry; parse failures are swallowed and never gate forwarding.
pub struct DnsInspector {
    cache: Arc<DomainCache>,
    stats: Arc<GatewayStats>,
}

impl DnsInspector {
    pub fn new(cache: Arc<DomainCache>, stats: Arc<GatewayStats>) -> Self {
        Self { cache, stats }
    }

    pub fn observe(&self, payload: &[u8]) {
        let message = match parse_message(payload) {
            Ok(message) => message,
            Err(error) => {
                self.stats.record_dns_parse_error();
                trace!(target: "tunwarden::dns", %error, "undecodable DNS payload");
                return;
            }
        };
        if !message.response {
            self.stats.record_dns_query();
            return;
        }
        self.stats.record_dns_response();
        let Some(qname) = message.qname else {
            return;
        };
        for answer in &message.answers {
            self.cache.insert(answer.addr, &qname, answer.ttl);
            trace!(
                target: "tunwarden::dns",
                domain = %qname,
                addr = %answer.addr,
                ttl = answer.ttl,
                "cached DNS answer"
            );
        }
    }
}
