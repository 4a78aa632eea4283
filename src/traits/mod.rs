//! Trait definitions at the seams of the bridge.
//!
//! # Submodules
//!
//! - `channel`: byte transports ([`PhysicalChannel`])
//! - `codec`: pure wire translation ([`Codec`])
//! - `controller`: the upstream contract ([`CommandStationController`])
//! - `hardware`: time source ([`Clock`])
//!
//! The dispatcher, correlator and safety monitor are generic over a
//! `Codec` + `PhysicalChannel` pair, so every backend shares them and tests
//! substitute [`MockChannel`](crate::hal::MockChannel) for real hardware.

pub mod channel;
pub mod codec;
pub mod controller;
pub mod hardware;

pub use channel::*;
pub use codec::*;
pub use controller::*;
pub use hardware::*;
