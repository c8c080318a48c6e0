//! Gateway lifecycle owner: validates configuration, installs the host
//! self-exclusion, opens the tunnel, wires the forwarders, and runs the
//! TUN demultiplexer.

use crate::codec::{self, ParsedPacket};
use crate::dns::{DnsInspector, DomainCache};
use crate::host::{HostError, TunnelConfig, TunnelHost};
use crate::policy::{self, Decision, PolicyRule, PolicyStore, RuleSubject};
use crate::stats::{GatewayStats, StatsSnapshot};
use crate::tcp::TcpForwarder;
use crate::tun::{TunDevice, TunHandle, RING_CAPACITY};
use crate::udp::{UdpForwarder, UDP_IDLE_TIMEOUT};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 9000;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Protected-socket semantics depend on the kernel never classifying
    /// this process's sockets as tunnel-bound, so this failure aborts
    /// startup before the tunnel is opened.
    #[error("self-exclusion install failed")]
    SelfExclusion(#[source] HostError),
    #[error("tunnel establish failed")]
    Establish(#[source] HostError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub tunnel: TunnelConfig,
    pub udp_idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
    /// Destination port inspected for DNS traffic.
    pub dns_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            udp_idle_timeout: UDP_IDLE_TIMEOUT,
            sweep_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            dns_port: 53,
        }
    }
}

impl GatewayConfig {
    fn validate(&self) -> Result<(), String> {
        if self.tunnel.mtu < MIN_MTU || self.tunnel.mtu > MAX_MTU {
            return Err(format!(
                "mtu {} outside supported range {MIN_MTU}..={MAX_MTU}",
                self.tunnel.mtu
            ));
        }
        if self.tunnel.routes.is_empty() {
            return Err("at least one route is required".to_string());
        }
        if let Some(route) = self
            .tunnel
            .routes
            .iter()
            .find(|route| route.prefix_len > 32)
        {
            return Err(format!(
                "route {}/{} has an invalid prefix length",
                route.destination, route.prefix_len
            ));
        }
        if self.sweep_interval.is_zero() || self.udp_idle_timeout.is_zero() {
            return Err("sweep interval and idle timeout must be non-zero".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect timeout must be non-zero".to_string());
        }
        if self.dns_port == 0 {
            return Err("dns port must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Running gateway instance. Control-plane methods are non-blocking with
/// respect to the data plane; `stop` is idempotent and joins every task.
pub struct Gateway {
    config: GatewayConfig,
    device: TunDevice,
    tcp: Arc<TcpForwarder>,
    udp: Arc<UdpForwarder>,
    policy: Arc<PolicyStore>,
    cache: Arc<DomainCache>,
    stats: Arc<GatewayStats>,
    demux_task: Mutex<Option<JoinHandle<()>>>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Gateway {
    /// Validate the configuration, install the self-exclusion, establish
    /// the tunnel, and start the data-plane tasks. Self-exclusion failure
    /// is fatal and happens before anything else is touched.
    pub async fn start(
        config: GatewayConfig,
        host: Arc<dyn TunnelHost>,
    ) -> Result<Arc<Self>, StartError> {
        config.validate().map_err(StartError::InvalidConfig)?;
        host.install_self_exclusion()
            .map_err(StartError::SelfExclusion)?;
        host.establish(&config.tunnel).map_err(StartError::Establish)?;

        let device = TunDevice::new(config.tunnel.mtu, RING_CAPACITY);
        let stats = Arc::new(GatewayStats::new());
        let cache = DomainCache::new();
        let policy_store = PolicyStore::new();
        policy::install(Arc::clone(&policy_store));
        let inspector = Arc::new(DnsInspector::new(Arc::clone(&cache), Arc::clone(&stats)));
        let tcp = TcpForwarder::new(
            device.clone(),
            Arc::clone(&host),
            Arc::clone(&policy_store),
            Arc::clone(&cache),
            Arc::clone(&stats),
            config.connect_timeout,
        );
        let udp = UdpForwarder::new(
            device.clone(),
            Arc::clone(&host),
            Arc::clone(&policy_store),
            Arc::clone(&cache),
            inspector,
            Arc::clone(&stats),
            config.udp_idle_timeout,
            config.dns_port,
        );

        let gateway = Arc::new(Self {
            config,
            device,
            tcp,
            udp,
            policy: policy_store,
            cache,
            stats,
            demux_task: Mutex::new(None),
            sweeper_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        gateway.spawn_demux();
        gateway.spawn_sweeper();
        info!(
            target: "tunwarden::device",
            mtu = gateway.config.tunnel.mtu,
            address = %gateway.config.tunnel.address,
            "gateway started"
        );
        Ok(gateway)
    }

    /// Platform-side endpoint: the surrounding application pushes guest
    /// datagrams in and drains synthesized frames out through this handle.
    pub fn handle(&self) -> TunHandle {
        self.device.handle()
    }

    /// Stop the data plane. Idempotent; does not return until the demux,
    /// sweeper, and every per-flow task have exited.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "tunwarden::device", "gateway stopping");
        self.device.close();
        let demux = self.demux_task.lock().take();
        if let Some(task) = demux {
            let _ = task.await;
        }
        let sweeper = self.sweeper_task.lock().take();
        if let Some(task) = sweeper {
            task.abort();
            let _ = task.await;
        }
        self.tcp.shutdown().await;
        self.udp.shutdown().await;
        policy::uninstall(&self.policy);
        info!(target: "tunwarden::device", "gateway stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn set_rule(&self, subject: RuleSubject, decision: Decision) {
        self.policy.set_rule(subject, decision);
    }

    pub fn remove_rule(&self, subject: &RuleSubject) -> bool {
        self.policy.remove_rule(subject)
    }

    pub fn list_rules(&self) -> Vec<PolicyRule> {
        self.policy.rules()
    }

    /// Point-in-time statistics. Cheap: counter loads plus two table sizes.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.tcp.active_flows(),
            self.udp.active_flows(),
            self.cache.len(),
        )
    }

    /// Full diagnostic report for support export.
    pub fn diagnostic_report(&self) -> serde_json::Value {
        serde_json::json!({
            "config": self.config,
            "snapshot": self.stats_snapshot(),
            "rules": self.policy.rules(),
            "tcp_flows": self.tcp.flow_summaries(),
            "udp_flows": self.udp.flow_summaries(),
        })
    }

    fn spawn_demux(self: &Arc<Self>) {
        let device = self.device.clone();
        let tcp = Arc::clone(&self.tcp);
        let udp = Arc::clone(&self.udp);
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(async move {
            // Deliberately thin: every valid datagram goes to exactly one
            // forwarder exactly once. No flow lookups, no policy, no
            // synthesis here.
            while let Some(packet) = device.recv().await {
                stats.record_packet_in();
                match codec::parse_packet(&packet) {
                    Ok(ParsedPacket::Tcp(tcp_packet)) => tcp.handle_packet(&tcp_packet).await,
                    Ok(ParsedPacket::Udp(udp_packet)) => udp.handle_packet(&udp_packet).await,
                    Ok(ParsedPacket::Other) => {
                        stats.record_unsupported();
                        trace!(target: "tunwarden::device", "unsupported protocol dropped");
                    }
                    Err(error) => {
                        stats.record_decode_error();
                        trace!(target: "tunwarden::device", %error, "undecodable packet dropped");
                    }
                }
            }
            debug!(target: "tunwarden::device", "demux exited");
        });
        *self.demux_task.lock() = Some(task);
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let tcp = Arc::clone(&self.tcp);
        let udp = Arc::clone(&self.udp);
        let interval = self.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let now = Instant::now();
                udp.sweep(now);
                tcp.reap_time_wait(now).await;
            }
        });
        *self.sweeper_task.lock() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TcpFlags;
    use crate::testutil::{
        build_dns_query, build_dns_response, guest_syn, guest_udp, parse_tcp, recv_frame,
        wait_for, DnsAnswerSpec, RecordingHost,
    };
    use crate::flow::{FlowKey, FlowProto};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            sweep_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn self_exclusion_failure_aborts_before_tunnel_opens() {
        crate::testutil::init_tracing();
        let host = Arc::new(RecordingHost::new());
        host.fail_self_exclusion.store(true, Ordering::Relaxed);
        let result = Gateway::start(test_config(), Arc::clone(&host) as Arc<dyn TunnelHost>).await;
        assert!(matches!(result, Err(StartError::SelfExclusion(_))));
        assert_eq!(host.establish_count(), 0, "no tunnel may be opened");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let host = Arc::new(RecordingHost::new());
        let mut config = test_config();
        config.tunnel.mtu = 100;
        let result = Gateway::start(config, Arc::clone(&host) as Arc<dyn TunnelHost>).await;
        assert!(matches!(result, Err(StartError::InvalidConfig(_))));
        assert_eq!(host.establish_count(), 0);
    }

    #[tokio::test]
    async fn start_establishes_tunnel_and_stop_is_idempotent() {
        crate::testutil::init_tracing();
        let host = Arc::new(RecordingHost::new());
        let gateway = Gateway::start(test_config(), Arc::clone(&host) as Arc<dyn TunnelHost>)
            .await
            .expect("start should succeed");
        assert_eq!(host.establish_count(), 1);

        gateway.stop().await;
        assert!(gateway.is_stopped());
        let snapshot = gateway.stats_snapshot();
        assert_eq!(snapshot.tcp_flows_active, 0);
        assert_eq!(snapshot.udp_flows_active, 0);
        // A second stop is a no-op.
        gateway.stop().await;
    }

    #[tokio::test]
    async fn end_to_end_tcp_through_demux() {
        crate::testutil::init_tracing();
        let host = Arc::new(RecordingHost::new());
        let gateway = Gateway::start(test_config(), Arc::clone(&host) as Arc<dyn TunnelHost>)
            .await
            .expect("start should succeed");
        let handle = gateway.handle();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let server_addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 64];
            let bytes = stream.read(&mut buf).await.expect("read request");
            stream.write_all(&buf[..bytes]).await.expect("echo back");
            stream.flush().await.expect("flush");
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let std::net::SocketAddr::V4(server_v4) = server_addr else {
            panic!("expected v4");
        };
        let key = FlowKey {
            proto: FlowProto::Tcp,
            src_ip: Ipv4Addr::new(10, 111, 222, 2),
            src_port: 40_100,
            dst_ip: *server_v4.ip(),
            dst_port: server_v4.port(),
        };
        assert!(handle.push_inbound(&guest_syn(&key, 500)));
        let frame = recv_frame(&handle, Duration::from_secs(2))
            .await
            .expect("SYN-ACK expected");
        let syn_ack = parse_tcp(&frame);
        assert!(syn_ack.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
        let server_isn = syn_ack.seq;

        assert!(handle.push_inbound(&crate::testutil::guest_tcp(
            &key,
            501,
            server_isn.wrapping_add(1),
            TcpFlags::ACK | TcpFlags::PSH,
            b"hello tunnel",
        )));
        // Expect the echoed payload back through the tunnel.
        let mut echoed = Vec::new();
        while echoed.len() < 12 {
            let frame = recv_frame(&handle, Duration::from_secs(2))
                .await
                .expect("echo data expected");
            let packet = parse_tcp(&frame);
            assert!(!packet.flags.contains(TcpFlags::RST));
            echoed.extend_from_slice(packet.payload);
        }
        assert_eq!(echoed, b"hello tunnel");

        let snapshot = gateway.stats_snapshot();
        assert_eq!(snapshot.tcp_flows_active, 1);
        assert!(snapshot.bytes_uplink >= 12);
        assert!(snapshot.bytes_downlink >= 12);
        assert_eq!(host.protected_count(), 1);

        gateway.stop().await;
        assert_eq!(gateway.stats_snapshot().tcp_flows_active, 0);
    }

    #[tokio::test]
    async fn dns_attribution_blocks_later_syn_by_domain() {
        crate::testutil::init_tracing();
        let resolver = UdpSocket::bind("127.0.0.1:0").await.expect("bind resolver");
        let resolver_addr = resolver.local_addr().expect("resolver addr");
        let mut config = test_config();
        config.dns_port = resolver_addr.port();
        let host = Arc::new(RecordingHost::new());
        let gateway = Gateway::start(config, Arc::clone(&host) as Arc<dyn TunnelHost>)
            .await
            .expect("start should succeed");
        let handle = gateway.handle();
        gateway.set_rule(
            RuleSubject::Domain("example.org".to_string()),
            Decision::Block,
        );

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            if let Ok((_, from)) = resolver.recv_from(&mut buf).await {
                let reply = build_dns_response(
                    "example.org",
                    &[DnsAnswerSpec::a([93, 184, 216, 34], 300)],
                );
                let _ = resolver.send_to(&reply, from).await;
            }
        });

        let std::net::SocketAddr::V4(resolver_v4) = resolver_addr else {
            panic!("expected v4");
        };
        let dns_key = FlowKey {
            proto: FlowProto::Udp,
            src_ip: Ipv4Addr::new(10, 111, 222, 2),
            src_port: 40_200,
            dst_ip: *resolver_v4.ip(),
            dst_port: resolver_v4.port(),
        };
        assert!(handle.push_inbound(&guest_udp(&dns_key, &build_dns_query("example.org"))));
        // The reply is forwarded to the guest and, on the way, attributed.
        let frame = recv_frame(&handle, Duration::from_secs(2))
            .await
            .expect("DNS reply expected");
        let _ = crate::testutil::parse_udp(&frame);

        // A subsequent SYN to the resolved address is blocked by domain.
        let blocked_key = FlowKey {
            proto: FlowProto::Tcp,
            src_ip: Ipv4Addr::new(10, 111, 222, 2),
            src_port: 40_201,
            dst_ip: Ipv4Addr::new(93, 184, 216, 34),
            dst_port: 443,
        };
        assert!(handle.push_inbound(&guest_syn(&blocked_key, 700)));
        let frame = recv_frame(&handle, Duration::from_secs(2))
            .await
            .expect("RST expected for blocked SYN");
        let rst = parse_tcp(&frame);
        assert!(rst.flags.contains(TcpFlags::RST));
        assert_eq!(rst.dst_port, blocked_key.src_port);

        let snapshot = gateway.stats_snapshot();
        assert_eq!(snapshot.tcp_flows_active, 0);
        assert_eq!(snapshot.policy_blocks, 1);
        assert!(snapshot.dns_responses >= 1);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn malformed_packets_are_counted_and_dropped() {
        crate::testutil::init_tracing();
        let host = Arc::new(RecordingHost::new());
        let gateway = Gateway::start(test_config(), Arc::clone(&host) as Arc<dyn TunnelHost>)
            .await
            .expect("start should succeed");
        let handle = gateway.handle();
        assert!(handle.push_inbound(&[0x45, 0x00, 0x00])); // truncated header
        assert!(handle.push_inbound(&[0x60; 40])); // IPv6 is not forwarded
        let stats = || gateway.stats_snapshot();
        assert!(
            wait_for(Duration::from_secs(1), || {
                let snapshot = stats();
                snapshot.decode_errors >= 2 && snapshot.packets_in >= 2
            })
            .await,
            "decode errors must be counted"
        );
        gateway.stop().await;
    }

    #[tokio::test]
    async fn diagnostic_report_includes_sections() {
        let host = Arc::new(RecordingHost::new());
        let gateway = Gateway::start(test_config(), Arc::clone(&host) as Arc<dyn TunnelHost>)
            .await
            .expect("start should succeed");
        gateway.set_rule(RuleSubject::Uid(10_014), Decision::Block);
        let report = gateway.diagnostic_report();
        assert!(report.get("config").is_some());
        assert!(report.get("snapshot").is_some());
        assert_eq!(
            report
                .get("rules")
                .and_then(|rules| rules.as_array())
                .map(|rules| rules.len()),
            Some(1)
        );
        assert!(report.get("tcp_flows").is_some());
        assert!(report.get("udp_flows").is_some());
        gateway.stop().await;
    }
}
