//! NAT-style UDP pseudo-connections.
//!
//! Each flow binds one protected datagram socket for its whole lifetime and
//! runs one receiver task that blocks on the socket, re-encodes replies
//! with the reversed 5-tuple, and writes them to the tunnel. A periodic
//! sweeper closes flows that have gone quiet; the idle bound deliberately
//! exceeds the keepalive cadence of common messaging protocols.

use crate::codec::builder;
use crate::codec::UdpPacket;
use crate::dns::{DnsInspector, DomainCache};
use crate::flow::{FlowKey, FlowProto};
use crate::host::TunnelHost;
use crate::policy::{Decision, PolicyStore};
use crate::stats::{FlowSummary, GatewayStats};
use crate::tun::TunDevice;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const RECV_BUFFER_LEN: usize = 65_535;

pub(crate) struct UdpFlow {
    key: FlowKey,
    socket: Arc<UdpSocket>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    last_activity: Mutex<Instant>,
    bytes_uplink: AtomicU64,
    bytes_downlink: AtomicU64,
    uid: Option<u32>,
    domain: Option<String>,
    active: AtomicBool,
}

impl UdpFlow {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.last_activity.lock()
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, instant: Instant) {
        *self.last_activity.lock() = instant;
    }
}

pub(crate) struct UdpForwarder {
    flows: Mutex<FxHashMap<FlowKey, Arc<UdpFlow>>>,
    device: TunDevice,
    host: Arc<dyn TunnelHost>,
    policy: Arc<PolicyStore>,
    cache: Arc<DomainCache>,
    inspector: Arc<DnsInspector>,
    stats: Arc<GatewayStats>,
    idle_timeout: Duration,
    dns_port: u16,
}

impl UdpForwarder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device: TunDevice,
        host: Arc<dyn TunnelHost>,
        policy: Arc<PolicyStore>,
        cache: Arc<DomainCache>,
        inspector: Arc<DnsInspector>,
        stats: Arc<GatewayStats>,
        idle_timeout: Duration,
        dns_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows: Mutex::new(FxHashMap::default()),
            device,
            host,
            policy,
            cache,
            inspector,
            stats,
            idle_timeout,
            dns_port,
        })
    }

    pub(crate) fn active_flows(&self) -> usize {
        self.flows.lock().len()
    }

    pub(crate) fn flow_summaries(&self) -> Vec<FlowSummary> {
        self.flows
            .lock()
            .values()
            .map(|flow| FlowSummary {
                proto: FlowProto::Udp,
                flow: flow.key.to_string(),
                state: if flow.active.load(Ordering::Relaxed) {
                    "active".to_string()
                } else {
                    "closing".to_string()
                },
                bytes_uplink: flow.bytes_uplink.load(Ordering::Relaxed),
                bytes_downlink: flow.bytes_downlink.load(Ordering::Relaxed),
                uid: flow.uid,
                domain: flow.domain.clone(),
            })
            .collect()
    }

    pub(crate) async fn handle_packet(self: &Arc<Self>, packet: &UdpPacket<'_>) {
        if packet.dst_port == self.dns_port {
            // Inspect before forwarding; parse failures are swallowed and
            // never gate the datagram.
            self.inspector.observe(packet.payload);
        }
        let key = FlowKey::from_udp(packet);
        let flow = self.flows.lock().get(&key).cloned();
        let flow = match flow {
            Some(flow) => flow,
            None => match self.open_flow(key).await {
                Some(flow) => flow,
                None => return,
            },
        };
        match flow.socket.send(packet.payload).await {
            Ok(_) => {
                flow.touch();
                flow.bytes_uplink
                    .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                self.stats.add_uplink(packet.payload.len() as u64);
            }
            Err(error) => {
                // Mid-flow failure stays silent toward the guest.
                debug!(target: "tunwarden::flow", %key, %error, "UDP send failed, closing flow");
                self.close_flow(&key);
            }
        }
    }

    async fn open_flow(self: &Arc<Self>, key: FlowKey) -> Option<Arc<UdpFlow>> {
        let uid = self.host.owner_uid(&key);
        let domain = self.cache.lookup(&IpAddr::V4(key.dst_ip));
        if self.policy.evaluate(uid, domain.as_deref()) == Decision::Block {
            self.stats.record_policy_block();
            debug!(
                target: "tunwarden::policy",
                %key,
                uid,
                domain = domain.as_deref().unwrap_or("-"),
                "UDP flow blocked by policy"
            );
            return None;
        }

        // Allocation and protection happen here, on the dispatch path,
        // before the first send.
        let socket = match std::net::UdpSocket::bind(("0.0.0.0", 0)) {
            Ok(socket) => socket,
            Err(error) => {
                warn!(target: "tunwarden::flow", %key, %error, "UDP socket allocation failed");
                return None;
            }
        };
        if !self.host.protect(socket.as_raw_fd()) {
            warn!(target: "tunwarden::flow", %key, "socket protection refused");
            return None;
        }
        if let Err(error) = socket.set_nonblocking(true) {
            warn!(target: "tunwarden::flow", %key, %error, "UDP socket setup failed");
            return None;
        }
        let socket = match UdpSocket::from_std(socket) {
            Ok(socket) => socket,
            Err(error) => {
                warn!(target: "tunwarden::flow", %key, %error, "UDP socket registration failed");
                return None;
            }
        };
        if let Err(error) = socket.connect((key.dst_ip, key.dst_port)).await {
            debug!(target: "tunwarden::flow", %key, %error, "UDP connect failed");
            return None;
        }

        let flow = Arc::new(UdpFlow {
            key,
            socket: Arc::new(socket),
            recv_task: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            bytes_uplink: AtomicU64::new(0),
            bytes_downlink: AtomicU64::new(0),
            uid,
            domain,
            active: AtomicBool::new(true),
        });
        self.flows.lock().insert(key, Arc::clone(&flow));
        self.stats.record_flow_opened(FlowProto::Udp);
        debug!(target: "tunwarden::flow", %key, "UDP flow admitted");

        let forwarder = Arc::clone(self);
        let recv_flow = Arc::clone(&flow);
        let task = tokio::spawn(async move {
            forwarder.run_receiver(recv_flow).await;
        });
        *flow.recv_task.lock() = Some(task);
        if !flow.active.load(Ordering::Acquire) {
            // Lost a race with a concurrent close.
            if let Some(task) = flow.recv_task.lock().take() {
                task.abort();
            }
        }
        Some(flow)
    }

    async fn run_receiver(self: Arc<Self>, flow: Arc<UdpFlow>) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let received = match flow.socket.recv(&mut buf).await {
                Ok(received) => received,
                Err(error) => {
                    debug!(target: "tunwarden::flow", key = %flow.key, %error, "UDP receive failed");
                    self.close_flow(&flow.key);
                    break;
                }
            };
            if flow.key.dst_port == self.dns_port {
                self.inspector.observe(&buf[..received]);
            }
            let reply = builder::udp_reply(&flow.key, &buf[..received]);
            self.device.send(&reply);
            flow.touch();
            flow.bytes_downlink
                .fetch_add(received as u64, Ordering::Relaxed);
            self.stats.add_downlink(received as u64);
        }
    }

    /// Close one flow: cancel the receiver, drop the socket, remove the
    /// table entry. Idempotent under concurrent observation.
    pub(crate) fn close_flow(&self, key: &FlowKey) -> bool {
        let Some(flow) = self.flows.lock().get(key).cloned() else {
            return false;
        };
        if !flow.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.flows.lock().remove(key);
        if let Some(task) = flow.recv_task.lock().take() {
            task.abort();
        }
        trace!(target: "tunwarden::flow", %key, "UDP flow closed");
        true
    }

    /// Close every flow idle strictly longer than the timeout. A flow idle
    /// for exactly the timeout survives until the next sweep.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let idle: Vec<FlowKey> = self
            .flows
            .lock()
            .iter()
            .filter_map(|(key, flow)| {
                now.checked_duration_since(flow.last_seen())
                    .map(|elapsed| elapsed > self.idle_timeout)
                    .unwrap_or(false)
                    .then_some(*key)
            })
            .collect();
        let mut swept = 0;
        for key in idle {
            if self.close_flow(&key) {
                self.stats.record_udp_swept();
                debug!(target: "tunwarden::flow", %key, "UDP idle timeout");
                swept += 1;
            }
        }
        swept
    }

    /// Drop every flow at gateway stop and wait for all receiver tasks.
    pub(crate) async fn shutdown(&self) {
        let flows: Vec<Arc<UdpFlow>> = self.flows.lock().drain().map(|(_, flow)| flow).collect();
        let mut tasks = Vec::new();
        for flow in flows {
            if !flow.active.swap(false, Ordering::SeqCst) {
                continue;
            }
            if let Some(task) = flow.recv_task.lock().take() {
                task.abort();
                tasks.push(task);
            }
        }
        let _ = futures::future::join_all(tasks).await;
    }

    #[cfg(test)]
    pub(crate) fn flow(&self, key: &FlowKey) -> Option<Arc<UdpFlow>> {
        self.flows.lock().get(key).cloned()
    }

    #[cfg(test)]
    pub(crate) fn socket_addr_of(&self, key: &FlowKey) -> Option<std::net::SocketAddr> {
        self.flows
            .lock()
            .get(key)
            .and_then(|flow| flow.socket.local_addr().ok())
    }
}
