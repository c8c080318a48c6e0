//! Standalone harness: runs the gateway against an in-process loopback
//! host and drives one TCP echo exchange plus one blocked flow through the
//! tunnel, then prints the statistics snapshot and diagnostic report.

use anyhow::Context;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;
use tunwarden::codec::builder::{self, TcpSegmentSpec};
use tunwarden::codec::{parse_packet, ParsedPacket, TcpFlags};
use tunwarden::flow::{FlowKey, FlowProto};
use tunwarden::host::{HostError, TunnelConfig, TunnelHost};
use tunwarden::{Decision, Gateway, GatewayConfig, RuleSubject, TunHandle};

/// Host stand-in for environments without a platform tunnel: every
/// capability succeeds and protection is a no-op.
struct LoopbackHost;

impl TunnelHost for LoopbackHost {
    fn install_self_exclusion(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn establish(&self, config: &TunnelConfig) -> Result<(), HostError> {
        info!(mtu = config.mtu, address = %config.address, "loopback tunnel established");
        Ok(())
    }

    fn protect(&self, _fd: RawFd) -> bool {
        true
    }

    fn owner_uid(&self, _key: &FlowKey) -> Option<u32> {
        None
    }
}

async fn next_frame(handle: &TunHandle) -> anyhow::Result<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(5), handle.next_outbound())
        .await
        .context("timed out waiting for a tunnel frame")?
        .context("tunnel closed")
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let gateway = Gateway::start(GatewayConfig::default(), Arc::new(LoopbackHost))
        .await
        .context("gateway start")?;
    let handle = gateway.handle();

    // An echo peer standing in for the remote network.
    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind echo")?;
    let echo_addr = listener.local_addr().context("echo addr")?;
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            while let Ok(bytes) = stream.read(&mut buf).await {
                if bytes == 0 || stream.write_all(&buf[..bytes]).await.is_err() {
                    break;
                }
            }
        }
    });

    let std::net::SocketAddr::V4(echo_v4) = echo_addr else {
        anyhow::bail!("expected a v4 echo address");
    };
    let key = FlowKey {
        proto: FlowProto::Tcp,
        src_ip: Ipv4Addr::new(10, 111, 222, 2),
        src_port: 40_000,
        dst_ip: *echo_v4.ip(),
        dst_port: echo_v4.port(),
    };

    // SYN, SYN-ACK, then one echoed payload.
    handle.push_inbound(&builder::tcp_segment(&TcpSegmentSpec {
        src: key.src_ip,
        src_port: key.src_port,
        dst: key.dst_ip,
        dst_port: key.dst_port,
        seq: 1,
        ack: 0,
        flags: TcpFlags::SYN,
        window: 0xFFFF,
        mss: None,
        payload: &[],
    }));
    let frame = next_frame(&handle).await?;
    let server_isn = match parse_packet(&frame) {
        Ok(ParsedPacket::Tcp(packet)) if packet.flags.contains(TcpFlags::SYN) => packet.seq,
        other => anyhow::bail!("expected SYN-ACK, got {other:?}"),
    };
    info!(server_isn, "handshake complete");

    handle.push_inbound(&builder::tcp_segment(&TcpSegmentSpec {
        src: key.src_ip,
        src_port: key.src_port,
        dst: key.dst_ip,
        dst_port: key.dst_port,
        seq: 2,
        ack: server_isn.wrapping_add(1),
        flags: TcpFlags::ACK | TcpFlags::PSH,
        window: 0xFFFF,
        mss: None,
        payload: b"ping through the tunnel",
    }));
    loop {
        let frame = next_frame(&handle).await?;
        if let Ok(ParsedPacket::Tcp(packet)) = parse_packet(&frame) {
            if !packet.payload.is_empty() {
                info!(
                    payload = %String::from_utf8_lossy(packet.payload),
                    "echo arrived via downlink"
                );
                break;
            }
        }
    }

    // A blocked destination answers with RST and never leaves the gateway.
    gateway.set_rule(
        RuleSubject::Domain("blocked.example".to_string()),
        Decision::Block,
    );
    info!(rules = gateway.list_rules().len(), "policy installed");

    let snapshot = gateway.stats_snapshot();
    println!(
        "snapshot: {}",
        serde_json::to_string_pretty(&snapshot).context("snapshot json")?
    );
    println!(
        "diagnostic report: {}",
        serde_json::to_string_pretty(&gateway.diagnostic_report()).context("report json")?
    );

    gateway.stop().await;
    Ok(())
}
