//! Error taxonomy for the protocol bridge.
//!
//! Nothing in this crate is fatal to the process. Errors fall into four
//! families, and each one degrades to "the operation had no effect":
//!
//! | Family | Variants | Surfaced to upstream callers as |
//! |--------|----------|----------------------------------|
//! | Transport | [`Transport`](BridgeError::Transport), [`PortBusy`](BridgeError::PortBusy), [`NotConnected`](BridgeError::NotConnected) | `is_connected() == false` |
//! | Protocol decode | [`Decode`](BridgeError::Decode) | nothing, unit is discarded and logged |
//! | Timeout | [`Timeout`](BridgeError::Timeout), [`Rejected`](BridgeError::Rejected) | failed dispatch, empty result |
//! | Programmer error | [`CorrelatorBusy`](BridgeError::CorrelatorBusy), [`Unsupported`](BridgeError::Unsupported) | logged loudly |
//!
//! Safety cutoffs are not errors at all; the [`SafetyMonitor`](crate::safety::SafetyMonitor)
//! handles them proactively.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, BridgeError>;

/// Errors produced by codecs, channels and the dispatch machinery.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Underlying transport failed (socket reset, port unplugged).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The serial port exists but another process holds it.
    #[error("port {0} is busy")]
    PortBusy(String),

    /// The channel is closed or the last liveness probe failed.
    #[error("not connected")]
    NotConnected,

    /// A received unit could not be decoded and was discarded.
    #[error("decode error: {0}")]
    Decode(String),

    /// No response arrived before the deadline.
    #[error("no response after {elapsed_ms} ms")]
    Timeout {
        /// Time spent waiting, measured from send.
        elapsed_ms: u64,
    },

    /// A second correlation was registered while one is still outstanding.
    #[error("correlator busy: request {pending} still outstanding")]
    CorrelatorBusy {
        /// Id of the request that is still waiting.
        pending: u64,
    },

    /// The backend cannot express this command.
    #[error("unsupported by {backend}: {what}")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// What was asked for.
        what: String,
    },

    /// The station answered the command with an error reply.
    #[error("station rejected command: {0}")]
    Rejected(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Returns true for errors that mean the link itself is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport(_) | BridgeError::PortBusy(_) | BridgeError::NotConnected
        )
    }

    pub(crate) fn unsupported(backend: &'static str, what: impl Into<String>) -> Self {
        BridgeError::Unsupported {
            backend,
            what: what.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_includes_elapsed() {
        let err = BridgeError::Timeout { elapsed_ms: 2003 };
        assert_eq!(err.to_string(), "no response after 2003 ms");
    }

    #[test]
    fn transport_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(BridgeError::from(io).is_transport());
        assert!(BridgeError::NotConnected.is_transport());
        assert!(!BridgeError::Timeout { elapsed_ms: 1 }.is_transport());
        assert!(!BridgeError::Decode("bad dlc".into()).is_transport());
    }

    #[test]
    fn correlator_busy_names_pending_request() {
        let err = BridgeError::CorrelatorBusy { pending: 7 };
        assert!(err.to_string().contains('7'));
    }
}
