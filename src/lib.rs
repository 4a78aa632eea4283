//! # rs-trainz-bridge
//!
//! A protocol bridge between model-railway software and digital command
//! stations. One upstream API (power, locomotives, accessories, feedback,
//! measurements) drives three hardware families:
//!
//! - **Legacy serial**: the byte-oriented 6050-style interface over RS-232
//! - **Märklin CAN**: 13-byte CAN frames over TCP or UDP (CS2/CS3, Gleisbox)
//! - **Text protocol**: `<...>` command lines over TCP or USB serial (DCC-EX)
//!
//! Upstream events (sensor changes, power, loco state) flow back through a
//! shared [`EventFanout`](fanout::EventFanout).
//!
//! ## Architecture
//!
//! - `codec` - Pure wire translation per backend
//! - `hal` - Physical channels (serial, TCP, UDP, mock) and the reader worker
//! - `correlator` - Matches inbound frames to outstanding requests
//! - `dispatcher` - Serial command queue with pacing and offline policy
//! - `safety` - Coil dwell supervision for accessories
//! - `connection` - Connect/probe/reconnect lifecycle
//! - `backend` - Per-family executors plus the wire-less virtual station
//! - `station` - Config-driven choice of backend
//! - `services` - HTTP and MQTT surfaces (feature-gated)
//! - `discovery` - UDP discovery responder (feature-gated)
//!
//! ## Example
//!
//! ```rust
//! use rs_trainz_bridge::backend::VirtualStation;
//! use rs_trainz_bridge::{CommandStationController, DecoderProtocol, Direction};
//!
//! let station = VirtualStation::with_defaults();
//! assert!(station.connect());
//!
//! station.power(true);
//! station.change_velocity(3, DecoderProtocol::Dcc, 40);
//! station.change_direction(3, DecoderProtocol::Dcc, Direction::Backward);
//!
//! station.emergency_stop();
//! assert_eq!(station.session().power(), Some(false));
//! ```

#![warn(missing_docs)]

/// Backend executors and the virtual station.
pub mod backend;
/// Wire codecs for every protocol family.
pub mod codec;
/// Upstream command types.
pub mod commands;
/// Bridge configuration (JSON-loadable with the `serde` feature).
pub mod config;
/// Connection lifecycle: connect, probe, reconnect, disconnect.
pub mod connection;
/// Request/reply correlation.
pub mod correlator;
/// Discovered devices and measurement channels.
pub mod device;
/// Paced, serialized command execution.
pub mod dispatcher;
/// Error types.
pub mod error;
/// Upstream events.
pub mod events;
/// Event listener registry.
pub mod fanout;
/// Physical channels and inbound framing.
pub mod hal;
/// Blocking FIFO feeding the dispatcher.
pub mod queue;
/// Accessory coil supervision.
pub mod safety;
/// Per-connection state: sensors, locos, power, devices.
pub mod state;
/// Config-selected command station.
pub mod station;
/// Trait seams: channel, codec, controller, clock.
pub mod traits;

/// UDP discovery responder.
#[cfg(feature = "discovery")]
pub mod discovery;

/// Network services for HTTP API and MQTT (feature-gated).
#[cfg(any(feature = "web", feature = "mqtt"))]
pub mod services;

// Re-exports for convenience
pub use commands::{AccessoryValue, Command, CommandKind, DecoderProtocol, Direction};
pub use error::{BridgeError, Result};
pub use events::BridgeEvent;
pub use traits::CommandStationController;
