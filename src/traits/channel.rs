//! Physical channel abstraction: serial port, TCP stream or UDP socket pair.
//!
//! A channel moves raw bytes. It knows nothing about commands; the codec
//! turns commands into bytes and inbound units back into typed values.
//!
//! # Contract
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | [`open`](PhysicalChannel::open) | acquire the transport and start the reader worker |
//! | [`write`](PhysicalChannel::write) | `Ok(true)` iff the transport accepted the bytes |
//! | [`close`](PhysicalChannel::close) | stop the reader and release the transport |
//!
//! The reader worker cuts the inbound stream into units according to the
//! channel's [`Framing`](crate::hal::Framing) (single bytes, text lines or
//! fixed-size frames) and invokes the registered handler once per unit.
//!
//! Transports with pacing rules (the legacy serial interface) enforce them
//! inside `write`: callers hand over a whole command and the channel spaces
//! the bytes and waits for the hardware ready signal.
//!
//! Socket transports must fail fast after a detected disconnect: `write`
//! returns an error instead of blocking, and [`is_open`](PhysicalChannel::is_open)
//! turns false so the connection manager reconnects.

use std::sync::Arc;

use crate::error::Result;

/// Callback receiving one inbound unit.
pub type InboundHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A byte transport to a command station.
///
/// Methods take `&self`: the dispatcher worker writes while the connection
/// manager may close, so implementations use interior locking.
pub trait PhysicalChannel: Send + Sync {
    /// Human-readable endpoint (port name or socket address), for logs.
    fn describe(&self) -> String;

    /// Open the transport and start delivering inbound units to `handler`.
    fn open(&self, handler: InboundHandler) -> Result<()>;

    /// Write one command's bytes.
    fn write(&self, bytes: &[u8]) -> Result<bool>;

    /// Stop the reader and release the transport. Idempotent.
    fn close(&self);

    /// True while the transport is open and no disconnect has been detected.
    fn is_open(&self) -> bool;
}

impl<C: PhysicalChannel + ?Sized> PhysicalChannel for Arc<C> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&self, handler: InboundHandler) -> Result<()> {
        (**self).open(handler)
    }

    fn write(&self, bytes: &[u8]) -> Result<bool> {
        (**self).write(bytes)
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
