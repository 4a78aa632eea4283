//! UDP channel for CAN stations that broadcast frames as datagrams.
//!
//! Frames are sent to the station's command port and received on a separate
//! local port. UDP has no connection state, so only socket errors mark the
//! link down.

use std::io::{self, Read};
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Framing, ReaderWorker};
use crate::error::{BridgeError, Result};
use crate::traits::{InboundHandler, PhysicalChannel};

const READ_POLL: Duration = Duration::from_millis(100);

/// Adapts a receiving socket to [`Read`] for the reader worker.
struct Datagrams(UdpSocket);

impl Read for Datagrams {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.recv(buf)?;
        // an empty datagram is not end of stream
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }
}

struct UdpLink {
    tx: UdpSocket,
    reader: ReaderWorker,
}

/// Send/receive socket pair.
pub struct UdpChannel {
    remote: String,
    local_port: u16,
    framing: Framing,
    link: Mutex<Option<UdpLink>>,
    link_up: Arc<AtomicBool>,
}

impl UdpChannel {
    /// Send to `host:remote_port`, receive on `local_port`.
    pub fn new(host: &str, remote_port: u16, local_port: u16, framing: Framing) -> Self {
        Self {
            remote: format!("{host}:{remote_port}"),
            local_port,
            framing,
            link: Mutex::new(None),
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl PhysicalChannel for UdpChannel {
    fn describe(&self) -> String {
        format!("udp://{} (rx {})", self.remote, self.local_port)
    }

    fn open(&self, handler: InboundHandler) -> Result<()> {
        self.close();

        let remote = self
            .remote
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| BridgeError::Config(format!("cannot resolve {}", self.remote)))?;
        let tx = UdpSocket::bind(("0.0.0.0", 0))?;
        tx.connect(remote)?;
        let rx = UdpSocket::bind(("0.0.0.0", self.local_port))?;
        rx.set_read_timeout(Some(READ_POLL))?;

        self.link_up.store(true, Ordering::Release);
        let reader = ReaderWorker::spawn(
            &self.remote,
            Datagrams(rx),
            self.framing,
            handler,
            Arc::clone(&self.link_up),
        )?;
        *self.link.lock() = Some(UdpLink { tx, reader });
        tracing::info!(remote = %self.remote, local_port = self.local_port, "udp channel open");
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<bool> {
        if !self.link_up.load(Ordering::Acquire) {
            return Err(BridgeError::NotConnected);
        }
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(BridgeError::NotConnected)?;
        match link.tx.send(bytes) {
            Ok(n) => Ok(n == bytes.len()),
            Err(e) => {
                tracing::warn!(remote = %self.remote, error = %e, "udp send failed");
                self.link_up.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn close(&self) {
        let link = self.link.lock().take();
        self.link_up.store(false, Ordering::Release);
        if let Some(mut link) = link {
            link.reader.stop();
            tracing::info!(remote = %self.remote, "udp channel closed");
        }
    }

    fn is_open(&self) -> bool {
        self.link_up.load(Ordering::Acquire) && self.link.lock().is_some()
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_round_trip_through_reader() {
        let station = UdpSocket::bind("127.0.0.1:0").unwrap();
        let station_port = station.local_addr().unwrap().port();
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let local_port = probe.local_addr().unwrap().port();
        drop(probe);

        let channel = UdpChannel::new("127.0.0.1", station_port, local_port, Framing::Fixed(13));
        let (tx, rx) = std::sync::mpsc::channel();
        channel
            .open(Arc::new(move |u: &[u8]| {
                let _ = tx.send(u.to_vec());
            }))
            .unwrap();

        assert!(channel.write(&[0x30; 13]).unwrap());
        let mut buf = [0u8; 32];
        let (n, _) = station.recv_from(&mut buf).unwrap();
        assert_eq!(n, 13);

        station.send_to(&[0x31; 13], ("127.0.0.1", local_port)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![0x31; 13]);

        channel.close();
        assert!(!channel.is_open());
    }
}
