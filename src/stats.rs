//! Traffic counters and the statistics surface exposed to the control
//! plane. Counters are plain atomics: snapshots are point-in-time and need
//! not be mutually consistent.

use crate::flow::FlowProto;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct GatewayStats {
    started_at: Instant,
    packets_in: AtomicU64,
    decode_errors: AtomicU64,
    unsupported_packets: AtomicU64,
    bytes_uplink: AtomicU64,
    bytes_downlink: AtomicU64,
    tcp_flows_opened: AtomicU64,
    udp_flows_opened: AtomicU64,
    rst_sent: AtomicU64,
    reflected_acks: AtomicU64,
    policy_blocks: AtomicU64,
    dns_queries: AtomicU64,
    dns_responses: AtomicU64,
    dns_parse_errors: AtomicU64,
    udp_flows_swept: AtomicU64,
}

/// Point-in-time copy of every counter plus the live gauges sampled at
/// snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_ms: u64,
    pub packets_in: u64,
    pub decode_errors: u64,
    pub unsupported_packets: u64,
    pub bytes_uplink: u64,
    pub bytes_downlink: u64,
    pub tcp_flows_opened: u64,
    pub tcp_flows_active: u64,
    pub udp_flows_opened: u64,
    pub udp_flows_active: u64,
    pub rst_sent: u64,
    pub reflected_acks: u64,
    pub policy_blocks: u64,
    pub dns_queries: u64,
    pub dns_responses: u64,
    pub dns_parse_errors: u64,
    pub udp_flows_swept: u64,
    pub domain_cache_entries: u64,
}

/// Per-flow line item in the diagnostic report.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub proto: FlowProto,
    pub flow: String,
    pub state: String,
    pub bytes_uplink: u64,
    pub bytes_downlink: u64,
    pub uid: Option<u32>,
    pub domain: Option<String>,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            packets_in: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            unsupported_packets: AtomicU64::new(0),
            bytes_uplink: AtomicU64::new(0),
            bytes_downlink: AtomicU64::new(0),
            tcp_flows_opened: AtomicU64::new(0),
            udp_flows_opened: AtomicU64::new(0),
            rst_sent: AtomicU64::new(0),
            reflected_acks: AtomicU64::new(0),
            policy_blocks: AtomicU64::new(0),
            dns_queries: AtomicU64::new(0),
            dns_responses: AtomicU64::new(0),
            dns_parse_errors: AtomicU64::new(0),
            udp_flows_swept: AtomicU64::new(0),
        }
    }

    pub fn record_packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsupported(&self) {
        self.unsupported_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_uplink(&self, bytes: u64) {
        self.bytes_uplink.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downlink(&self, bytes: u64) {
        self.bytes_downlink.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_flow_opened(&self, proto: FlowProto) {
        match proto {
            FlowProto::Tcp => self.tcp_flows_opened.fetch_add(1, Ordering::Relaxed),
            FlowProto::Udp => self.udp_flows_opened.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_rst(&self) {
        self.rst_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reflected_ack(&self) {
        self.reflected_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_block(&self) {
        self.policy_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_response(&self) {
        self.dns_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_parse_error(&self) {
        self.dns_parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_swept(&self) {
        self.udp_flows_swept.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        tcp_flows_active: usize,
        udp_flows_active: usize,
        domain_cache_entries: usize,
    ) -> StatsSnapshot {
        StatsSnapshot {
            uptime_ms: self.started_at.elapsed().as_millis().min(u64::MAX as u128) as u64,
            packets_in: self.packets_in.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unsupported_packets: self.unsupported_packets.load(Ordering::Relaxed),
            bytes_uplink: self.bytes_uplink.load(Ordering::Relaxed),
            bytes_downlink: self.bytes_downlink.load(Ordering::Relaxed),
            tcp_flows_opened: self.tcp_flows_opened.load(Ordering::Relaxed),
            tcp_flows_active: tcp_flows_active as u64,
            udp_flows_opened: self.udp_flows_opened.load(Ordering::Relaxed),
            udp_flows_active: udp_flows_active as u64,
            rst_sent: self.rst_sent.load(Ordering::Relaxed),
            reflected_acks: self.reflected_acks.load(Ordering::Relaxed),
            policy_blocks: self.policy_blocks.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            dns_responses: self.dns_responses.load(Ordering::Relaxed),
            dns_parse_errors: self.dns_parse_errors.load(Ordering::Relaxed),
            udp_flows_swept: self.udp_flows_swept.load(Ordering::Relaxed),
            domain_cache_entries: domain_cache_entries as u64,
        }
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}
