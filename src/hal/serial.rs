//! Serial port channel (RS-232 or USB adapter).
//!
//! The legacy interface needs the writer to pace itself: a fixed pause
//! between the bytes of one command and, before every byte after the first,
//! the CTS line asserted by the box. A box that never raises CTS is tolerated:
//! the byte goes out after [`SerialSettings::cts_timeout`] with a warning.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serialport::SerialPort;

use super::{Framing, ReaderWorker};
use crate::error::{BridgeError, Result};
use crate::traits::{InboundHandler, PhysicalChannel};

const READ_POLL: Duration = Duration::from_millis(100);
const CTS_POLL: Duration = Duration::from_millis(1);

/// Line settings and pacing of one serial station.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialSettings {
    /// OS port name (`/dev/ttyUSB0`, `COM3`).
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Two stop bits instead of one.
    pub two_stop_bits: bool,
    /// Observe CTS between bytes.
    pub cts: bool,
    /// Pause between bytes of one write.
    pub byte_pause: Duration,
    /// Longest wait for CTS before sending anyway.
    pub cts_timeout: Duration,
    /// Inbound unit framing.
    pub framing: Framing,
}

impl SerialSettings {
    /// 6050 interface: 2400 baud 8N2 with CTS.
    pub fn legacy(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: 2400,
            two_stop_bits: true,
            cts: true,
            byte_pause: Duration::from_millis(10),
            cts_timeout: Duration::from_millis(100),
            framing: Framing::Bytes,
        }
    }

    /// Text-protocol station on USB: 115200 8N1.
    pub fn text(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: 115_200,
            two_stop_bits: false,
            cts: false,
            byte_pause: Duration::ZERO,
            cts_timeout: Duration::ZERO,
            framing: Framing::Lines { terminator: b'>' },
        }
    }
}

struct SerialLink {
    port: Box<dyn SerialPort>,
    reader: ReaderWorker,
}

/// Paced serial channel.
pub struct SerialChannel {
    settings: SerialSettings,
    link: Mutex<Option<SerialLink>>,
    link_up: Arc<AtomicBool>,
}

impl SerialChannel {
    /// Channel with the given settings; nothing is opened yet.
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            link: Mutex::new(None),
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn map_open_error(&self, e: serialport::Error) -> BridgeError {
        let busy = matches!(
            e.kind(),
            serialport::ErrorKind::NoDevice
                | serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied)
        ) || e.to_string().to_ascii_lowercase().contains("busy");
        if busy {
            BridgeError::PortBusy(self.settings.port.clone())
        } else {
            BridgeError::Transport(io::Error::from(e))
        }
    }
}

// ============================================================================
// Pacing
// ============================================================================

/// Write side of a port that exposes the CTS line.
pub(crate) trait PacedPort: Write {
    /// Current state of the CTS input.
    fn clear_to_send(&mut self) -> io::Result<bool>;
}

impl PacedPort for Box<dyn SerialPort> {
    fn clear_to_send(&mut self) -> io::Result<bool> {
        self.read_clear_to_send().map_err(io::Error::from)
    }
}

/// Outcome of waiting for CTS before a byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CtsWait {
    Asserted,
    TimedOut,
    Unreadable,
}

fn wait_cts(port: &mut impl PacedPort, name: &str, timeout: Duration) -> CtsWait {
    let start = Instant::now();
    loop {
        match port.clear_to_send() {
            Ok(true) => return CtsWait::Asserted,
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(port = %name, error = %e, "cannot read CTS");
                return CtsWait::Unreadable;
            }
        }
        let waited = start.elapsed();
        if waited >= timeout {
            tracing::warn!(
                port = %name,
                waited_ms = waited.as_millis() as u64,
                "CTS not asserted, sending anyway"
            );
            return CtsWait::TimedOut;
        }
        std::thread::sleep(CTS_POLL);
    }
}

/// Send `bytes` one at a time, pausing and waiting for CTS before every byte
/// after the first.
pub(crate) fn write_paced(
    port: &mut impl PacedPort,
    bytes: &[u8],
    settings: &SerialSettings,
) -> io::Result<()> {
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            std::thread::sleep(settings.byte_pause);
            if settings.cts {
                wait_cts(port, &settings.port, settings.cts_timeout);
            }
        }
        port.write_all(core::slice::from_ref(byte))?;
        port.flush()?;
    }
    Ok(())
}

impl PhysicalChannel for SerialChannel {
    fn describe(&self) -> String {
        format!("serial://{}@{}", self.settings.port, self.settings.baud_rate)
    }

    fn open(&self, handler: InboundHandler) -> Result<()> {
        self.close();

        let stop_bits = if self.settings.two_stop_bits {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };
        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(stop_bits)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_POLL)
            .open()
            .map_err(|e| self.map_open_error(e))?;
        let source = port
            .try_clone()
            .map_err(|e| BridgeError::Transport(io::Error::from(e)))?;

        self.link_up.store(true, Ordering::Release);
        let reader = ReaderWorker::spawn(
            &self.settings.port,
            source,
            self.settings.framing,
            handler,
            Arc::clone(&self.link_up),
        )?;
        *self.link.lock() = Some(SerialLink { port, reader });
        tracing::info!(port = %self.settings.port, baud = self.settings.baud_rate, "serial channel open");
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<bool> {
        if !self.link_up.load(Ordering::Acquire) {
            return Err(BridgeError::NotConnected);
        }
        let mut guard = self.link.lock();
        let link = guard.as_mut().ok_or(BridgeError::NotConnected)?;

        if let Err(e) = write_paced(&mut link.port, bytes, &self.settings) {
            tracing::warn!(port = %self.settings.port, error = %e, "serial write failed");
            self.link_up.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(true)
    }

    fn close(&self) {
        let link = self.link.lock().take();
        self.link_up.store(false, Ordering::Release);
        if let Some(mut link) = link {
            link.reader.stop();
            tracing::info!(port = %self.settings.port, "serial channel closed");
        }
    }

    fn is_open(&self) -> bool {
        self.link_up.load(Ordering::Acquire) && self.link.lock().is_some()
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}
