//! Network services for HTTP API and MQTT integration.
//!
//! - `web` feature: Axum-based HTTP API server with JSON endpoints
//! - `mqtt` feature: MQTT client for pub/sub messaging
//!
//! Both services command one station through a shared [`SharedStation`]
//! wrapped in `Arc`:
//!
//! ```ignore
//! use std::sync::Arc;
//! use rs_trainz_bridge::services::SharedStation;
//!
//! let shared = Arc::new(SharedStation::new(Arc::new(station)));
//!
//! let web_router = build_router(Arc::clone(&shared), &web_config);
//! let mqtt_handler = MqttHandler::new(Arc::clone(&shared), mqtt_config);
//! ```

pub mod api;
pub mod shared;

#[cfg(feature = "web")]
pub mod web;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use api::*;
pub use shared::*;

#[cfg(feature = "web")]
pub use web::*;

#[cfg(feature = "mqtt")]
pub use mqtt::*;
