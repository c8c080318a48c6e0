//! Abstract host tunneling API.
//!
//! The surrounding platform owns the real tunnel: it can establish the
//! point-to-point interface, exempt individual sockets from tunnel routing
//! ("protect"), exclude the gateway process itself from tunnel
//! classification, and optionally resolve the process UID that originated a
//! guest flow. The gateway talks to it only through this trait.

use crate::flow::FlowKey;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("self-exclusion rejected by host: {0}")]
    SelfExclusionRejected(String),
    #[error("tunnel establish failed: {0}")]
    EstablishFailed(String),
}

/// One route installed on the tunnel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
}

impl RouteSpec {
    pub const DEFAULT: RouteSpec = RouteSpec {
        destination: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };
}

/// Parameters handed to the host when the tunnel is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub mtu: usize,
    pub address: Ipv4Addr,
    pub routes: Vec<RouteSpec>,
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mtu: crate::tun::DEFAULT_MTU,
            address: Ipv4Addr::new(10, 111, 222, 1),
            routes: vec![RouteSpec::DEFAULT],
            dns_servers: Vec::new(),
        }
    }
}

/// Host capabilities the gateway depends on.
///
/// `protect` must be invoked on every outbound socket after allocation and
/// before any connect or send, on the dispatch call path that carries the
/// host's authorization context. `owner_uid` may return `None` when the
/// platform cannot attribute a flow; identity policy then degrades to the
/// domain step.
pub trait TunnelHost: Send + Sync + 'static {
    /// Install the directive that keeps this process's own sockets out of
    /// the tunnel. Failure is fatal for gateway startup.
    fn install_self_exclusion(&self) -> Result<(), HostError>;

    /// Open the tunnel with the given MTU, address, and route set.
    fn establish(&self, config: &TunnelConfig) -> Result<(), HostError>;

    /// Exempt one outbound socket from tunnel routing. Returns `false`
    /// when the host refuses; the caller must close the socket and drop
    /// the flow.
    fn protect(&self, fd: RawFd) -> bool;

    /// Resolve the UID of the process that originated `key`, if the
    /// platform exposes that mapping.
    fn owner_uid(&self, key: &FlowKey) -> Option<u32>;
}
