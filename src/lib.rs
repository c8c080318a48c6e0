//! Userspace virtual-network gateway core.
//!
//! Terminates a platform-provided TUN device and bridges guest flows onto
//! protected outbound sockets: per-connection NAT for UDP, a fail-open
//! virtual TCP machine for streams, passive DNS inspection to attribute
//! flows to domain names, and an allow/block policy keyed on process UID
//! or destination domain. The surrounding application supplies the real
//! tunnel through the [`host::TunnelHost`] trait and exchanges datagrams
//! through a [`tun::TunHandle`].

pub mod codec;
pub mod dns;
pub mod flow;
pub mod gateway;
pub mod host;
pub mod policy;
pub mod stats;
pub mod tun;

mod tcp;
mod udp;

#[cfg(test)]
mod testutil;

pub use gateway::{Gateway, GatewayConfig, StartError};
pub use host::{HostError, RouteSpec, TunnelConfig, TunnelHost};
pub use policy::{Decision, PolicyRule, PolicyStore, RuleSubject};
pub use stats::StatsSnapshot;
pub use tun::TunHandle;
