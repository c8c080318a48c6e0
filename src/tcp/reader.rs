//! Stream-driven downlink reader: one task per established flow.
//!
//! The task owns the outbound read half and waits on readiness with a
//! bounded timeout. Readable bytes become MSS-sized segments toward the
//! guest; EOF drives the FIN transitions; a timeout on a quiet-but-alive
//! flow reflects an ACK-only segment so long-idle connections do not look
//! dead to the guest. This task is the only code path that synthesizes
//! downlink packets for an established flow.

use super::{TcpFlow, TcpForwarder, TcpState};
use crate::codec::TcpFlags;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, trace};

impl TcpForwarder {
    pub(super) async fn run_downlink(
        self: Arc<Self>,
        flow: Arc<TcpFlow>,
        mut reader: OwnedReadHalf,
    ) {
        let mut buf = vec![0u8; usize::from(self.mss)];
        loop {
            if flow.closed.load(Ordering::Acquire) {
                break;
            }
            let wait = self.idle_wait(&flow);
            tokio::select! {
                _ = flow.ack_nudge.notified() => {
                    self.emit_to_guest(&flow, TcpFlags::ACK, &[], false);
                }
                result = tokio::time::timeout(wait, reader.read(&mut buf)) => match result {
                    Err(_) => {
                        // No readable event for the full interval.
                        if flow.should_reflect(wait) {
                            self.emit_to_guest(&flow, TcpFlags::ACK, &[], false);
                            self.stats.record_reflected_ack();
                            flow.bump_idle_epoch();
                            trace!(target: "tunwarden::flow", key = %flow.key, "reflected idle ack");
                        }
                    }
                    Ok(Ok(0)) => {
                        self.on_remote_eof(&flow).await;
                        break;
                    }
                    Ok(Ok(bytes)) => {
                        flow.note_peer_bytes(bytes);
                        self.emit_downlink(&flow, &buf[..bytes]);
                    }
                    Ok(Err(error)) => {
                        debug!(target: "tunwarden::flow", key = %flow.key, %error, "outbound read failed");
                        self.fail_from_reader(&flow, true).await;
                        break;
                    }
                }
            }
        }
    }

    fn emit_downlink(&self, flow: &Arc<TcpFlow>, bytes: &[u8]) {
        self.emit_to_guest(flow, TcpFlags::ACK | TcpFlags::PSH, bytes, false);
        flow.advance_local(bytes.len() as u32);
        self.stats.add_downlink(bytes.len() as u64);
    }

    async fn on_remote_eof(&self, flow: &Arc<TcpFlow>) {
        match flow.state() {
            TcpState::Established => {
                self.emit_to_guest(flow, TcpFlags::FIN | TcpFlags::ACK, &[], false);
                flow.advance_local(1);
                flow.set_state(TcpState::FinWaitApp);
                debug!(target: "tunwarden::flow", key = %flow.key, "remote fin, awaiting guest fin");
            }
            TcpState::FinWaitServer => {
                self.emit_to_guest(flow, TcpFlags::FIN | TcpFlags::ACK, &[], false);
                flow.advance_local(1);
                flow.enter_time_wait();
                debug!(target: "tunwarden::flow", key = %flow.key, "remote fin, time_wait");
            }
            _ => {}
        }
    }
}
