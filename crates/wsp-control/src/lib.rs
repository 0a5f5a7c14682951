//! Gateway core
//!
//! Control connections open upstream TCP channels and send raw bytes through
//! them; data connections join a channel to receive its binary frames. The
//! [`SessionRegistry`] ties the two sides together by channel id.
pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod upstream;

pub use config::GatewayConfig;
pub use control::{ControlHandler, ControlState};
pub use data::{DataHandler, DataState};
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use registry::{
    RegistryError, SessionRegistry, SessionSnapshot, SessionStats, StatsSnapshot,
};
pub use upstream::{UpstreamHandle, UpstreamReader};
