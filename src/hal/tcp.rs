//! TCP stream channel for networked command stations.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Framing, ReaderWorker};
use crate::error::{BridgeError, Result};
use crate::traits::{InboundHandler, PhysicalChannel};

/// Read timeout so the reader notices shutdown.
const READ_POLL: Duration = Duration::from_millis(100);

struct TcpLink {
    stream: TcpStream,
    reader: ReaderWorker,
}

/// Channel over one TCP connection.
///
/// A read of zero bytes or a failed write marks the link down; further
/// writes fail with [`BridgeError::NotConnected`] until reopened.
pub struct TcpChannel {
    endpoint: String,
    framing: Framing,
    connect_timeout: Duration,
    link: Mutex<Option<TcpLink>>,
    link_up: Arc<AtomicBool>,
}

impl TcpChannel {
    /// Channel to `host:port`.
    pub fn new(host: &str, port: u16, framing: Framing) -> Self {
        Self {
            endpoint: format!("{host}:{port}"),
            framing,
            connect_timeout: Duration::from_secs(2),
            link: Mutex::new(None),
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl PhysicalChannel for TcpChannel {
    fn describe(&self) -> String {
        format!("tcp://{}", self.endpoint)
    }

    fn open(&self, handler: InboundHandler) -> Result<()> {
        self.close();

        let addr = self
            .endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| BridgeError::Config(format!("cannot resolve {}", self.endpoint)))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.connect_timeout))?;

        let source = stream.try_clone()?;
        source.set_read_timeout(Some(READ_POLL))?;
        self.link_up.store(true, Ordering::Release);
        let reader = ReaderWorker::spawn(
            &self.endpoint,
            source,
            self.framing,
            handler,
            Arc::clone(&self.link_up),
        )?;

        *self.link.lock() = Some(TcpLink { stream, reader });
        tracing::info!(endpoint = %self.endpoint, "tcp channel open");
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<bool> {
        if !self.link_up.load(Ordering::Acquire) {
            return Err(BridgeError::NotConnected);
        }
        let mut guard = self.link.lock();
        let link = guard.as_mut().ok_or(BridgeError::NotConnected)?;
        if let Err(e) = link.stream.write_all(bytes) {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "tcp write failed");
            self.link_up.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(true)
    }

    fn close(&self) {
        let link = self.link.lock().take();
        self.link_up.store(false, Ordering::Release);
        if let Some(mut link) = link {
            let _ = link.stream.shutdown(Shutdown::Both);
            link.reader.stop();
            tracing::info!(endpoint = %self.endpoint, "tcp channel closed");
        }
    }

    fn is_open(&self) -> bool {
        self.link_up.load(Ordering::Acquire) && self.link.lock().is_some()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn write_after_peer_close_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let channel = TcpChannel::new("127.0.0.1", port, Framing::Lines { terminator: b'>' });

        let (tx, rx) = std::sync::mpsc::channel();
        let handler: InboundHandler = Arc::new(move |u: &[u8]| {
            let _ = tx.send(u.to_vec());
        });
        channel.open(handler).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        assert!(channel.write(b"<s>\n").unwrap());
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"<s>\n");

        peer.write_all(b"<p1>\n").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"<p1>".to_vec());

        drop(peer);
        for _ in 0..100 {
            if !channel.is_open() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!channel.is_open());
        assert!(matches!(channel.write(b"<s>\n"), Err(BridgeError::NotConnected)));
        channel.close();
    }

    #[test]
    fn refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let channel = TcpChannel::new("127.0.0.1", port, Framing::Fixed(13));
        let err = channel.open(Arc::new(|_: &[u8]| {})).unwrap_err();
        assert!(err.is_transport());
        assert!(!channel.is_open());
    }
}
