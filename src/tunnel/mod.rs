//! Reverse-tunnel engine.
//!
//! - [`agent`]: per-tunnel connection pool fed by the remote client.
//! - [`client`]: proxy over a pool, plus the grace-period lifecycle.
//! - [`upgrade`]: raw head formatting/parsing and socket splicing for upgrades.
//! - [`manager`]: id → tunnel registry.

pub mod agent;
pub mod client;
pub mod manager;
pub mod upgrade;

pub use agent::{AgentEvent, AgentStats, PooledConnection, TunnelAgent};
pub use client::{ClientEvent, ClientOptions, ClientPhase, TunnelClient};
pub use manager::{AuthOptions, ClientManager, ManagerOptions, ManagerStats, TunnelInfo};
