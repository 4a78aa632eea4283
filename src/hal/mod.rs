//! Physical channel implementations.
//!
//! This module contains concrete implementations of
//! [`PhysicalChannel`](crate::traits::PhysicalChannel) and the shared reader
//! worker that cuts inbound bytes into units.
//!
//! # Available Implementations
//!
//! - `mock`: in-memory channel and clock for tests
//! - `serial`: RS-232 / USB serial ports (requires `serial` feature)
//! - `tcp`: TCP stream to a networked station
//! - `udp`: UDP send/receive socket pair (CAN stations)

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;
pub mod udp;

pub use mock::*;
#[cfg(feature = "serial")]
pub use serial::{SerialChannel, SerialSettings};
pub use tcp::TcpChannel;
pub use udp::UdpChannel;

use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::traits::InboundHandler;

// ============================================================================
// Framing
// ============================================================================

/// How a reader cuts the inbound byte stream into units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Every byte is a unit (legacy serial replies).
    Bytes,
    /// Units end with `terminator`, which is kept, or with a line break;
    /// surrounding whitespace is trimmed and empty units are skipped (text
    /// protocol). A unit longer than [`MAX_LINE`] is dropped.
    Lines {
        /// Terminal marker.
        terminator: u8,
    },
    /// Units of exactly this many bytes (CAN frames).
    Fixed(usize),
}

/// Longest line unit kept in [`Framing::Lines`] before it is discarded.
pub const MAX_LINE: usize = 512;

/// Incremental splitter for one [`Framing`].
///
/// ```
/// use rs_trainz_bridge::hal::{Deframer, Framing};
///
/// let mut units = Vec::new();
/// let mut d = Deframer::new(Framing::Lines { terminator: b'>' });
/// d.push(b"<p1>\r\n<l 3 0 1", |u| units.push(u.to_vec()));
/// d.push(b"28 0>", |u| units.push(u.to_vec()));
/// assert_eq!(units, vec![b"<p1>".to_vec(), b"<l 3 0 128 0>".to_vec()]);
/// ```
#[derive(Debug)]
pub struct Deframer {
    framing: Framing,
    buf: Vec<u8>,
    overflowed: bool,
}

impl Deframer {
    /// Create a splitter.
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: Vec::new(),
            overflowed: false,
        }
    }

    /// Feed received bytes; `emit` is called once per complete unit.
    pub fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(&[u8])) {
        match self.framing {
            Framing::Bytes => {
                for b in bytes {
                    emit(core::slice::from_ref(b));
                }
            }
            Framing::Lines { terminator } => {
                for &b in bytes {
                    let end = b == terminator || b == b'\n';
                    if self.overflowed {
                        // skip the rest of an oversized unit
                        self.overflowed = !end;
                        continue;
                    }
                    self.buf.push(b);
                    if end {
                        let unit = trim(&self.buf);
                        if !unit.is_empty() {
                            emit(unit);
                        }
                        self.buf.clear();
                    } else if self.buf.len() >= MAX_LINE {
                        tracing::warn!(bytes = self.buf.len(), "discarding oversized line");
                        self.buf.clear();
                        self.overflowed = true;
                    }
                }
            }
            Framing::Fixed(size) => {
                self.buf.extend_from_slice(bytes);
                let mut start = 0;
                while self.buf.len() - start >= size {
                    emit(&self.buf[start..start + size]);
                    start += size;
                }
                self.buf.drain(..start);
            }
        }
    }

    /// Drop partial input.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.overflowed = false;
    }

    /// Number of buffered bytes not yet forming a unit.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

// ============================================================================
// Reader Worker
// ============================================================================

/// Background thread reading from a transport until stopped or disconnected.
pub(crate) struct ReaderWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderWorker {
    /// Spawn a reader over `source`.
    ///
    /// `source` must have a read timeout so the worker notices [`stop`](Self::stop).
    /// End of stream or a hard read error clears `link_up`.
    pub(crate) fn spawn<R>(
        name: &str,
        mut source: R,
        framing: Framing,
        handler: InboundHandler,
        link_up: Arc<AtomicBool>,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let endpoint = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("reader {name}"))
            .spawn(move || {
                let mut deframer = Deframer::new(framing);
                let mut buf = [0u8; 256];
                while flag.load(Ordering::Acquire) {
                    match source.read(&mut buf) {
                        Ok(0) => {
                            tracing::warn!(endpoint = %endpoint, "peer closed connection");
                            link_up.store(false, Ordering::Release);
                            break;
                        }
                        Ok(n) => deframer.push(&buf[..n], |unit| handler(unit)),
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                            ) => {}
                        Err(e) => {
                            if flag.load(Ordering::Acquire) {
                                tracing::warn!(endpoint = %endpoint, error = %e, "read failed");
                            }
                            link_up.store(false, Ordering::Release);
                            break;
                        }
                    }
                }
                tracing::debug!(endpoint = %endpoint, "reader stopped");
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Ask the worker to stop and join it.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("reader worker panicked");
            }
        }
    }
}

impl Drop for ReaderWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
