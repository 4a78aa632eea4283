//! Zero-configuration discovery over UDP.
//!
//! Clients broadcast the challenge string; the responder answers each one
//! with `"<response> <port>"`, naming the TCP port of the bridge's service.
//! Any other datagram is ignored. The responder is an ordinary owned value:
//! whoever composes the bridge binds it, keeps the handle and shuts it down.
//!
//! ```no_run
//! # async fn run() -> rs_trainz_bridge::error::Result<()> {
//! use rs_trainz_bridge::config::DiscoveryConfig;
//! use rs_trainz_bridge::discovery::DiscoveryResponder;
//!
//! let handle = DiscoveryResponder::new(&DiscoveryConfig::default(), 8080).spawn().await?;
//! // ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DiscoveryConfig;
use crate::error::Result;

const MAX_DATAGRAM: usize = 512;

/// Answers discovery challenges with the service port.
#[derive(Clone, Debug)]
pub struct DiscoveryResponder {
    bind: SocketAddr,
    challenge: String,
    reply: String,
}

impl DiscoveryResponder {
    /// Responder for `config` announcing `service_port`.
    pub fn new(config: &DiscoveryConfig, service_port: u16) -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
            challenge: config.challenge.as_str().to_string(),
            reply: format!("{} {}", config.response, service_port),
        }
    }

    /// Bind to a specific address instead (port 0 picks a free one).
    pub fn with_bind_addr(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// The reply sent for a matching challenge.
    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Answer for one received datagram, if it is a challenge.
    pub fn answer(&self, datagram: &[u8]) -> Option<&[u8]> {
        let text = std::str::from_utf8(datagram).ok()?;
        (text.trim() == self.challenge).then_some(self.reply.as_bytes())
    }

    /// Bind the socket and serve until the handle is shut down.
    pub async fn spawn(self) -> Result<DiscoveryHandle> {
        let socket = UdpSocket::bind(self.bind).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        tracing::info!(address = %local_addr, "discovery responder listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, peer)) => {
                            let Some(reply) = self.answer(&buf[..n]) else {
                                tracing::trace!(%peer, bytes = n, "ignoring datagram");
                                continue;
                            };
                            tracing::debug!(%peer, "answering discovery challenge");
                            if let Err(e) = socket.send_to(reply, peer).await {
                                tracing::warn!(%peer, error = %e, "discovery reply failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "discovery receive failed"),
                    },
                }
            }
            tracing::debug!("discovery responder stopped");
        });

        Ok(DiscoveryHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Running responder.
pub struct DiscoveryHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl DiscoveryHandle {
    /// Address the responder is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stop serving and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "discovery task ended abnormally");
        }
    }
}
