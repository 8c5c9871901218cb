//! # courier-node
//!
//! Wires the network session, the message log and the delivery path into a
//! runnable node.

pub mod commands;
pub mod config;
pub mod delivery;

pub use commands::{Command, CommandError};
pub use config::NodeConfig;
pub use delivery::{DeliveryCoordinator, DeliveryError, Disposition, InboundFrame, InboundPipeline};
