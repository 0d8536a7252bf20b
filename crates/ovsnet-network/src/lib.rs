//! ovsnet-network: OVS-backed container networks
//!
//! - [`BridgeManager`]: bridge rows, kernel link setup, NAT and port attachment
//! - [`watcher`]: restores Bridge rows deleted outside the driver
//! - [`NetworkDriver`]: the create/delete/join/leave state machine
//! - [`GatewayCoordinator`]: the node-wide single gateway process
//! - OS collaborators behind traits: [`LinkOps`], [`Firewall`], [`ServiceManager`]

pub mod bridge;
pub mod driver;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod gateway;
pub mod netlink;
pub mod options;
pub mod types;
pub mod watcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::BridgeManager;
pub use driver::NetworkDriver;
pub use error::{DriverError, ErrorCategory};
pub use firewall::{Firewall, Iptables};
pub use gateway::{GatewayCoordinator, ServiceManager, ServiceType, SystemdServices};
pub use netlink::{LinkOps, RtnetlinkLinks};
pub use options::{BridgeMode, NetworkState};
