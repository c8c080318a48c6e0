//! Virtual TCP connections bridging guest segments onto protected outbound
//! stream sockets.
//!
//! Each flow is created by a guest SYN, gated by policy, connected
//! asynchronously, and then serviced by a dedicated downlink reader task
//! ([`reader`]). The machine is deliberately fail-open: in `Established`
//! the only events that produce a RST toward the guest are a genuine error
//! from the outbound peer, a write failure, or explicit teardown. Sequence
//! gaps, unexpected acknowledgments, duplicates, and odd flag combinations
//! are accepted or silently discarded so TLS handshakes and long-lived
//! messaging sessions survive.

mod reader;

use crate::codec::builder::{self, TcpSegmentSpec};
use crate::codec::{TcpFlags, TcpPacket};
use crate::dns::DomainCache;
use crate::flow::{FlowKey, FlowProto};
use crate::host::TunnelHost;
use crate::policy::{Decision, PolicyStore};
use crate::stats::{FlowSummary, GatewayStats};
use crate::tun::TunDevice;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpSocket;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Readiness-wait bound for the downlink reader before it considers
/// reflecting an ACK.
pub(crate) const IDLE_PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Re-probe cadence once a flow has already reflected during the current
/// idle stretch.
pub(crate) const IDLE_REPROBE_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const TIME_WAIT_GRACE: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_WINDOW: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TcpState {
    Closed,
    /// SYN received from the guest, SYN-ACK pending on outbound connect.
    SynSent,
    Established,
    /// Remote sent FIN to the guest; waiting for the guest FIN.
    FinWaitApp,
    /// Guest sent FIN; waiting for the remote FIN.
    FinWaitServer,
    TimeWait,
    Reset,
}

impl TcpState {
    fn name(self) -> &'static str {
        match self {
            TcpState::Closed => "closed",
            TcpState::SynSent => "syn_sent",
            TcpState::Established => "established",
            TcpState::FinWaitApp => "fin_wait_app",
            TcpState::FinWaitServer => "fin_wait_server",
            TcpState::TimeWait => "time_wait",
            TcpState::Reset => "reset",
        }
    }
}

struct FlowCtl {
    state: TcpState,
    /// Next sequence number we will send toward the guest.
    local_seq: u32,
    /// Next acknowledgment we will send = guest ISN + 1 + bytes consumed.
    peer_ack: u32,
    last_guest_activity: Instant,
    /// Timestamp of the last byte observed from the outbound peer.
    last_peer_byte: Option<Instant>,
    /// Reflections emitted during the current idle stretch.
    idle_epochs: u32,
    time_wait_since: Option<Instant>,
}

pub(crate) struct TcpFlow {
    pub(crate) key: FlowKey,
    ctl: Mutex<FlowCtl>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    /// Nudged by the uplink path so the reader task acknowledges guest data.
    ack_nudge: Notify,
    bytes_uplink: AtomicU64,
    bytes_downlink: AtomicU64,
    uid: Option<u32>,
    domain: Option<String>,
    closed: AtomicBool,
}

impl TcpFlow {
    fn new(key: FlowKey, guest_isn: u32, uid: Option<u32>, domain: Option<String>) -> Self {
        Self {
            key,
            ctl: Mutex::new(FlowCtl {
                state: TcpState::SynSent,
                local_seq: rand::random::<u32>(),
                peer_ack: guest_isn.wrapping_add(1),
                last_guest_activity: Instant::now(),
                last_peer_byte: None,
                idle_epochs: 0,
                time_wait_since: None,
            }),
            writer: AsyncMutex::new(None),
            reader_task: Mutex::new(None),
            ack_nudge: Notify::new(),
            bytes_uplink: AtomicU64::new(0),
            bytes_downlink: AtomicU64::new(0),
            uid,
            domain,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> TcpState {
        self.ctl.lock().state
    }

    fn set_state(&self, state: TcpState) {
        self.ctl.lock().state = state;
    }

    fn seq_ack(&self) -> (u32, u32) {
        let ctl = self.ctl.lock();
        (ctl.local_seq, ctl.peer_ack)
    }

    fn advance_local(&self, bytes: u32) {
        let mut ctl = self.ctl.lock();
        ctl.local_seq = ctl.local_seq.wrapping_add(bytes);
    }

    fn advance_peer(&self, bytes: u32) {
        let mut ctl = self.ctl.lock();
        ctl.peer_ack = ctl.peer_ack.wrapping_add(bytes);
    }

    fn touch_guest(&self) {
        let mut ctl = self.ctl.lock();
        ctl.last_guest_activity = Instant::now();
        ctl.idle_epochs = 0;
    }

    fn note_peer_bytes(&self, bytes: usize) {
        self.bytes_downlink
            .fetch_add(bytes as u64, Ordering::Relaxed);
        let mut ctl = self.ctl.lock();
        ctl.last_peer_byte = Some(Instant::now());
        ctl.idle_epochs = 0;
    }

    fn idle_epochs(&self) -> u32 {
        self.ctl.lock().idle_epochs
    }

    /// Reflect only when the peer has actually sent bytes at some point and
    /// the guest has been quiet for the whole wait.
    fn should_reflect(&self, waited: Duration) -> bool {
        let ctl = self.ctl.lock();
        ctl.state == TcpState::Established
            && ctl.last_peer_byte.is_some()
            && ctl.last_guest_activity.elapsed() >= waited
    }

    fn bump_idle_epoch(&self) {
        let mut ctl = self.ctl.lock();
        ctl.idle_epochs = ctl.idle_epochs.saturating_add(1);
    }

    fn enter_time_wait(&self) {
        let mut ctl = self.ctl.lock();
        ctl.state = TcpState::TimeWait;
        ctl.time_wait_since = Some(Instant::now());
    }
}

pub(crate) struct TcpForwarder {
    flows: Mutex<FxHashMap<FlowKey, Arc<TcpFlow>>>,
    device: TunDevice,
    host: Arc<dyn TunnelHost>,
    policy: Arc<PolicyStore>,
    cache: Arc<DomainCache>,
    stats: Arc<GatewayStats>,
    mss: u16,
    connect_timeout: Duration,
    idle_probe: Duration,
    idle_reprobe: Duration,
}

impl TcpForwarder {
    pub(crate) fn new(
        device: TunDevice,
        host: Arc<dyn TunnelHost>,
        policy: Arc<PolicyStore>,
        cache: Arc<DomainCache>,
        stats: Arc<GatewayStats>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Self::with_idle_intervals(
            device,
            host,
            policy,
            cache,
            stats,
            connect_timeout,
            IDLE_PROBE_INTERVAL,
            IDLE_REPROBE_INTERVAL,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_idle_intervals(
        device: TunDevice,
        host: Arc<dyn TunnelHost>,
        policy: Arc<PolicyStore>,
        cache: Arc<DomainCache>,
        stats: Arc<GatewayStats>,
        connect_timeout: Duration,
        idle_probe: Duration,
        idle_reprobe: Duration,
    ) -> Arc<Self> {
        let mss = (device.mtu().saturating_sub(40)).min(usize::from(u16::MAX)) as u16;
        Arc::new(Self {
            flows: Mutex::new(FxHashMap::default()),
            device,
            host,
            policy,
            cache,
            stats,
            mss,
            connect_timeout,
            idle_probe,
            idle_reprobe,
        })
    }

    /// Readiness-wait bound for the reader: the full probe interval while
    /// fresh, the shorter re-probe cadence once reflecting.
    fn idle_wait(&self, flow: &TcpFlow) -> Duration {
        if flow.idle_epochs() == 0 {
            self.idle_probe
        } else {
            self.idle_reprobe
        }
    }

    pub(crate) fn active_flows(&self) -> usize {
        self.flows.lock().len()
    }

    pub(crate) fn flow_summaries(&self) -> Vec<FlowSummary> {
        self.flows
            .lock()
            .values()
            .map(|flow| FlowSummary {
                proto: FlowProto::Tcp,
                flow: flow.key.to_string(),
                state: flow.state().name().to_string(),
                bytes_uplink: flow.bytes_uplink.load(Ordering::Relaxed),
                bytes_downlink: flow.bytes_downlink.load(Ordering::Relaxed),
                uid: flow.uid,
                domain: flow.domain.clone(),
            })
            .collect()
    }

    pub(crate) async fn handle_packet(self: &Arc<Self>, packet: &TcpPacket<'_>) {
        let key = FlowKey::from_tcp(packet);
        let existing = self.flows.lock().get(&key).cloned();
        match existing {
            Some(flow) => self.drive_flow(&flow, packet).await,
            None => {
                if packet.flags.contains(TcpFlags::SYN) && !packet.flags.contains(TcpFlags::ACK) {
                    self.open_flow(key, packet).await;
                } else if packet.flags.contains(TcpFlags::RST) {
                    // Stray reset: nothing to tear down.
                } else if !packet.payload.is_empty() || packet.flags.contains(TcpFlags::FIN) {
                    debug!(target: "tunwarden::flow", %key, "RST for unknown flow");
                    self.send_rst_for_packet(packet);
                }
                // Stray ACKs for unknown flows are dropped silently.
            }
        }
    }

    async fn open_flow(self: &Arc<Self>, key: FlowKey, packet: &TcpPacket<'_>) {
        let uid = self.host.owner_uid(&key);
        let domain = self.cache.lookup(&IpAddr::V4(key.dst_ip));
        if self.policy.evaluate(uid, domain.as_deref()) == Decision::Block {
            self.stats.record_policy_block();
            warn!(
                target: "tunwarden::policy",
                %key,
                uid,
                domain = domain.as_deref().unwrap_or("-"),
                "TCP flow blocked by policy"
            );
            self.send_rst_for_packet(packet);
            return;
        }

        // Socket allocation and protection stay on this dispatch path; only
        // the connect itself moves to a task.
        let socket = match TcpSocket::new_v4() {
            Ok(socket) => socket,
            Err(error) => {
                warn!(target: "tunwarden::flow", %key, %error, "outbound socket allocation failed");
                self.send_rst_for_packet(packet);
                return;
            }
        };
        if !self.host.protect(socket.as_raw_fd()) {
            warn!(target: "tunwarden::flow", %key, "socket protection refused");
            self.send_rst_for_packet(packet);
            return;
        }

        let flow = Arc::new(TcpFlow::new(key, packet.seq, uid, domain));
        self.flows.lock().insert(key, Arc::clone(&flow));
        self.stats.record_flow_opened(FlowProto::Tcp);
        debug!(target: "tunwarden::flow", %key, "TCP flow admitted");

        let forwarder = Arc::clone(self);
        tokio::spawn(async move {
            forwarder.connect_outbound(flow, socket).await;
        });
    }

    async fn connect_outbound(self: Arc<Self>, flow: Arc<TcpFlow>, socket: TcpSocket) {
        let addr = SocketAddr::from((flow.key.dst_ip, flow.key.dst_port));
        let stream = match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                warn!(target: "tunwarden::flow", key = %flow.key, %error, "outbound connect failed");
                self.abort_flow(&flow, true).await;
                return;
            }
            Err(_) => {
                warn!(target: "tunwarden::flow", key = %flow.key, "outbound connect timed out");
                self.abort_flow(&flow, true).await;
                return;
            }
        };
        if flow.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *flow.writer.lock().await = Some(write_half);
        {
            let mut ctl = flow.ctl.lock();
            if ctl.state != TcpState::SynSent {
                return;
            }
            ctl.state = TcpState::Established;
        }
        self.emit_to_guest(&flow, TcpFlags::SYN | TcpFlags::ACK, &[], true);
        flow.advance_local(1);
        debug!(target: "tunwarden::flow", key = %flow.key, "TCP flow established");

        let reader_flow = Arc::clone(&flow);
        let forwarder = Arc::clone(&self);
        let task = tokio::spawn(async move {
            forwarder.run_downlink(reader_flow, read_half).await;
        });
        *flow.reader_task.lock() = Some(task);
        // A teardown that raced the spawn saw an empty task slot; finish
        // its job here.
        if flow.closed.load(Ordering::Acquire) {
            if let Some(task) = flow.reader_task.lock().take() {
                task.abort();
            }
        }
    }

    async fn drive_flow(self: &Arc<Self>, flow: &Arc<TcpFlow>, packet: &TcpPacket<'_>) {
        flow.touch_guest();
        if packet.flags.contains(TcpFlags::RST) {
            debug!(target: "tunwarden::flow", key = %flow.key, "guest reset");
            self.abort_flow(flow, false).await;
            return;
        }
        match flow.state() {
            TcpState::SynSent => {
                // Duplicate SYN or early data while the dial is in flight:
                // fail-open, nothing is emitted.
            }
            TcpState::Established => {
                if !packet.payload.is_empty()
                    && !self.forward_uplink(flow, packet.payload).await
                {
                    return;
                }
                if !packet.payload.is_empty() {
                    // The reader task is the only downlink synthesizer in
                    // this state; nudge it to acknowledge.
                    flow.ack_nudge.notify_one();
                }
                if packet.flags.contains(TcpFlags::FIN) {
                    flow.advance_peer(1);
                    self.shutdown_uplink(flow).await;
                    flow.set_state(TcpState::FinWaitServer);
                    self.emit_to_guest(flow, TcpFlags::ACK, &[], false);
                    debug!(target: "tunwarden::flow", key = %flow.key, "guest fin, half-closed");
                }
            }
            TcpState::FinWaitApp => {
                // Remote closed its sending side; guest may still upload.
                if !packet.payload.is_empty() {
                    if !self.forward_uplink(flow, packet.payload).await {
                        return;
                    }
                    self.emit_to_guest(flow, TcpFlags::ACK, &[], false);
                }
                if packet.flags.contains(TcpFlags::FIN) {
                    flow.advance_peer(1);
                    self.emit_to_guest(flow, TcpFlags::ACK, &[], false);
                    flow.enter_time_wait();
                    debug!(target: "tunwarden::flow", key = %flow.key, "guest fin, time_wait");
                }
            }
            TcpState::FinWaitServer
            | TcpState::TimeWait
            | TcpState::Reset
            | TcpState::Closed => {
                // Late or duplicate segments: fail-open, drop.
                trace!(target: "tunwarden::flow", key = %flow.key, "segment dropped in terminal state");
            }
        }
    }

    /// Write guest payload to the outbound socket in arrival order. Returns
    /// `false` when the flow died on a write failure.
    async fn forward_uplink(self: &Arc<Self>, flow: &Arc<TcpFlow>, payload: &[u8]) -> bool {
        let result = {
            let mut guard = flow.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write_all(payload).await,
                // Writer already shut down by a concurrent close: fail-open.
                None => return true,
            }
        };
        match result {
            Ok(()) => {
                flow.advance_peer(payload.len() as u32);
                flow.bytes_uplink
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                self.stats.add_uplink(payload.len() as u64);
                true
            }
            Err(error) => {
                warn!(target: "tunwarden::flow", key = %flow.key, %error, "outbound write failed");
                self.abort_flow(flow, true).await;
                false
            }
        }
    }

    async fn shutdown_uplink(&self, flow: &Arc<TcpFlow>) {
        let mut guard = flow.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let _ = writer.shutdown().await;
        }
    }

    /// Tear a flow down from the demux/connect paths. Idempotent; safe
    /// against the reader observing the same death concurrently.
    async fn abort_flow(&self, flow: &Arc<TcpFlow>, emit_rst: bool) {
        if flow.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        flow.set_state(TcpState::Reset);
        if emit_rst {
            self.send_rst_for_flow(flow);
        }
        if let Some(task) = flow.reader_task.lock().take() {
            task.abort();
        }
        *flow.writer.lock().await = None;
        self.remove_flow(&flow.key);
    }

    /// Reader-side teardown. Never aborts the reader task itself; the
    /// caller returns immediately afterwards.
    async fn fail_from_reader(&self, flow: &Arc<TcpFlow>, emit_rst: bool) {
        if flow.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        flow.set_state(TcpState::Reset);
        if emit_rst {
            self.send_rst_for_flow(flow);
        }
        *flow.writer.lock().await = None;
        self.remove_flow(&flow.key);
    }

    /// Reap flows whose TIME_WAIT grace has elapsed. Driven by the
    /// gateway's periodic sweeper.
    pub(crate) async fn reap_time_wait(&self, now: Instant) {
        let expired: Vec<Arc<TcpFlow>> = self
            .flows
            .lock()
            .values()
            .filter(|flow| {
                let ctl = flow.ctl.lock();
                ctl.state == TcpState::TimeWait
                    && ctl
                        .time_wait_since
                        .and_then(|since| now.checked_duration_since(since))
                        .map(|elapsed| elapsed >= TIME_WAIT_GRACE)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        for flow in expired {
            if flow.closed.swap(true, Ordering::SeqCst) {
                continue;
            }
            flow.set_state(TcpState::Closed);
            if let Some(task) = flow.reader_task.lock().take() {
                task.abort();
            }
            *flow.writer.lock().await = None;
            self.remove_flow(&flow.key);
            trace!(target: "tunwarden::flow", key = %flow.key, "time_wait flow reaped");
        }
    }

    /// Drain every flow at gateway stop: graceful FIN toward the guest
    /// where the conversation is intact, RST where it is already
    /// half-closed. Returns only after all reader tasks have exited.
    pub(crate) async fn shutdown(&self) {
        let flows: Vec<Arc<TcpFlow>> = self.flows.lock().drain().map(|(_, flow)| flow).collect();
        let mut tasks = Vec::new();
        for flow in flows {
            if flow.closed.swap(true, Ordering::SeqCst) {
                continue;
            }
            match flow.state() {
                TcpState::Established => {
                    self.emit_to_guest(&flow, TcpFlags::FIN | TcpFlags::ACK, &[], false);
                    flow.advance_local(1);
                }
                TcpState::FinWaitApp | TcpState::FinWaitServer => {
                    self.send_rst_for_flow(&flow);
                }
                _ => {}
            }
            flow.set_state(TcpState::Closed);
            if let Some(task) = flow.reader_task.lock().take() {
                task.abort();
                tasks.push(task);
            }
            *flow.writer.lock().await = None;
        }
        let _ = futures::future::join_all(tasks).await;
    }

    fn remove_flow(&self, key: &FlowKey) {
        self.flows.lock().remove(key);
    }

    /// Synthesize a segment toward the guest from the flow's current
    /// sequence space. Advancing the space is the caller's job.
    fn emit_to_guest(&self, flow: &Arc<TcpFlow>, flags: TcpFlags, payload: &[u8], syn_ack: bool) {
        let (seq, ack) = flow.seq_ack();
        let key = &flow.key;
        let packet = builder::tcp_segment(&TcpSegmentSpec {
            src: key.dst_ip,
            src_port: key.dst_port,
            dst: key.src_ip,
            dst_port: key.src_port,
            seq,
            ack,
            flags,
            window: DEFAULT_WINDOW,
            mss: syn_ack.then_some(self.mss),
            payload,
        });
        self.device.send(&packet);
    }

    fn send_rst_for_packet(&self, packet: &TcpPacket<'_>) {
        self.stats.record_rst();
        self.device.send(&builder::tcp_reset_for(packet));
    }

    fn send_rst_for_flow(&self, flow: &Arc<TcpFlow>) {
        self.stats.record_rst();
        let (seq, ack) = flow.seq_ack();
        let key = &flow.key;
        let packet = builder::tcp_segment(&TcpSegmentSpec {
            src: key.dst_ip,
            src_port: key.dst_port,
            dst: key.src_ip,
            dst_port: key.src_port,
            seq,
            ack,
            flags: TcpFlags::RST | TcpFlags::ACK,
            window: 0,
            mss: None,
            payload: &[],
        });
        self.device.send(&packet);
    }
}
