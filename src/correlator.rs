//! Response correlator: matches the single outstanding request of a
//! connection to the replies that arrive on the reader worker.
//!
//! # Protocol
//!
//! ```text
//! dispatcher                         reader worker
//! ──────────                         ─────────────
//! register()  ──▶ slot = Pending(id)
//! write frame
//! wait(ticket, timeout)              offer(frame) / complete(id, frame)
//!     ◀── condvar notify ──────────  slot.done = true
//! slot cleared
//! ```
//!
//! At most one correlation can be outstanding. A second
//! [`register`](Correlator::register) while one is pending fails with
//! [`BridgeError::CorrelatorBusy`] instead of replacing it. The timeout of
//! [`wait`](Correlator::wait) counts from [`Ticket::mark_sent`], not from the
//! moment the command was queued.
//!
//! Which inbound frames belong to the pending request is decided by the
//! caller's predicate in [`register_matching`](Correlator::register_matching).
//! The CAN backend accepts a reply by command adjacency alone
//! ([`CanFrame::is_response_for`](crate::codec::CanFrame::is_response_for));
//! with one slot per connection there is nothing else to tell apart.
//!
//! ```rust
//! use std::time::Duration;
//! use rs_trainz_bridge::correlator::Correlator;
//!
//! let correlator: Correlator<u8> = Correlator::new();
//! let ticket = correlator.register().unwrap();
//! assert!(correlator.register().is_err());
//!
//! correlator.complete(ticket.id(), 42);
//! assert_eq!(correlator.wait(ticket, Duration::from_millis(10)).unwrap(), vec![42]);
//! assert!(!correlator.is_pending());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BridgeError, Result};

type Accepts<T> = Box<dyn Fn(&T) -> bool + Send>;
type IsComplete<T> = Box<dyn Fn(&[T]) -> bool + Send>;

struct Pending<T> {
    id: u64,
    responses: Vec<T>,
    done: bool,
    accepts: Accepts<T>,
    is_complete: IsComplete<T>,
}

/// Handle of one registered correlation.
#[derive(Debug)]
#[must_use = "a registered correlation must be waited for or cancelled"]
pub struct Ticket {
    id: u64,
    sent_at: Instant,
}

impl Ticket {
    /// Correlation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Restart the timeout clock; call right after the request was written.
    pub fn mark_sent(&mut self) {
        self.sent_at = Instant::now();
    }
}

/// Single-slot request/response correlator.
pub struct Correlator<T> {
    slot: Mutex<Option<Pending<T>>>,
    ready: Condvar,
    next_id: AtomicU64,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Correlator<T> {
    /// Create an idle correlator.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a correlation completed by the first accepted response.
    pub fn register(&self) -> Result<Ticket> {
        self.register_matching(|_| true, |responses| !responses.is_empty())
    }

    /// Register a correlation with a filter and a completion rule.
    ///
    /// `accepts` decides whether an offered response belongs to this request;
    /// `is_complete` is evaluated after every accepted response.
    pub fn register_matching(
        &self,
        accepts: impl Fn(&T) -> bool + Send + 'static,
        is_complete: impl Fn(&[T]) -> bool + Send + 'static,
    ) -> Result<Ticket> {
        let mut slot = self.slot.lock();
        if let Some(pending) = slot.as_ref() {
            tracing::error!(pending = pending.id, "correlation registered while one is outstanding");
            return Err(BridgeError::CorrelatorBusy {
                pending: pending.id,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Pending {
            id,
            responses: Vec::new(),
            done: false,
            accepts: Box::new(accepts),
            is_complete: Box::new(is_complete),
        });
        Ok(Ticket {
            id,
            sent_at: Instant::now(),
        })
    }

    /// True while a correlation is outstanding.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Id of the outstanding correlation.
    pub fn pending_id(&self) -> Option<u64> {
        self.slot.lock().as_ref().map(|p| p.id)
    }

    /// Attach a response to correlation `id` without completing it.
    ///
    /// Returns false if `id` is not the outstanding correlation.
    pub fn deliver(&self, id: u64, response: T) -> bool {
        self.push(id, response, false)
    }

    /// Attach the final response to correlation `id` and wake the waiter.
    pub fn complete(&self, id: u64, response: T) -> bool {
        self.push(id, response, true)
    }

    fn push(&self, id: u64, response: T, done: bool) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some(pending) if pending.id == id && !pending.done => {
                pending.responses.push(response);
                pending.done |= done;
                if pending.done {
                    self.ready.notify_all();
                }
                true
            }
            _ => false,
        }
    }

    /// Block until correlation `ticket` completes or `timeout` after send.
    ///
    /// The slot is cleared either way. On timeout the partial responses are
    /// discarded and the elapsed time is reported.
    pub fn wait(&self, ticket: Ticket, timeout: Duration) -> Result<Vec<T>> {
        let deadline = ticket.sent_at + timeout;
        let mut slot = self.slot.lock();
        loop {
            match slot.as_ref().filter(|p| p.id == ticket.id).map(|p| p.done) {
                Some(true) => return Ok(slot.take().map(|p| p.responses).unwrap_or_default()),
                Some(false) => {}
                None => {
                    return Err(BridgeError::Timeout {
                        elapsed_ms: ticket.sent_at.elapsed().as_millis() as u64,
                    })
                }
            }
            if self.ready.wait_until(&mut slot, deadline).timed_out()
                && !slot.as_ref().is_some_and(|p| p.id == ticket.id && p.done)
            {
                *slot = None;
                let elapsed_ms = ticket.sent_at.elapsed().as_millis() as u64;
                tracing::warn!(id = ticket.id, elapsed_ms, "no response before deadline");
                return Err(BridgeError::Timeout { elapsed_ms });
            }
        }
    }

    /// Gather every accepted response until `window` after send, then clear
    /// the slot. Completes early if the completion rule fires.
    pub fn collect(&self, ticket: Ticket, window: Duration) -> Vec<T> {
        let deadline = ticket.sent_at + window;
        let mut slot = self.slot.lock();
        while slot.as_ref().is_some_and(|p| p.id == ticket.id && !p.done) {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        if slot.as_ref().is_some_and(|p| p.id == ticket.id) {
            slot.take().map(|p| p.responses).unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Drop correlation `ticket` without waiting (e.g. the write failed).
    pub fn cancel(&self, ticket: Ticket) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|p| p.id == ticket.id) {
            *slot = None;
        }
    }
}

impl<T: Clone> Correlator<T> {
    /// Offer an inbound unit to the outstanding correlation.
    ///
    /// Returns true if the correlation accepted it. Units are never consumed:
    /// the reader still processes them as unsolicited traffic.
    pub fn offer(&self, response: &T) -> bool {
        let mut slot = self.slot.lock();
        let Some(pending) = slot.as_mut() else {
            return false;
        };
        if pending.done || !(pending.accepts)(response) {
            return false;
        }
        pending.responses.push(response.clone());
        if (pending.is_complete)(&pending.responses) {
            pending.done = true;
            self.ready.notify_all();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_registration_fails_loudly() {
        let c: Correlator<u8> = Correlator::new();
        let first = c.register().unwrap();
        match c.register() {
            Err(BridgeError::CorrelatorBusy { pending }) => assert_eq!(pending, first.id()),
            other => panic!("expected busy, got {other:?}"),
        }
        c.cancel(first);
        assert!(c.register().is_ok());
    }

    #[test]
    fn timeout_reports_elapsed_and_clears_slot() {
        let c: Correlator<u8> = Correlator::new();
        let mut ticket = c.register().unwrap();
        ticket.mark_sent();
        match c.wait(ticket, Duration::from_millis(30)) {
            Err(BridgeError::Timeout { elapsed_ms }) => assert!(elapsed_ms >= 30),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!c.is_pending());
    }

    #[test]
    fn stale_id_is_rejected() {
        let c: Correlator<u8> = Correlator::new();
        let t = c.register().unwrap();
        let stale = t.id();
        c.cancel(t);
        let _fresh = c.register().unwrap();
        assert!(!c.complete(stale, 1));
    }

    #[test]
    fn deliver_accumulates_until_complete() {
        let c: Correlator<u8> = Correlator::new();
        let t = c.register().unwrap();
        assert!(c.deliver(t.id(), 1));
        assert!(c.deliver(t.id(), 2));
        assert!(c.complete(t.id(), 3));
        assert!(!c.deliver(t.id(), 4));
        assert_eq!(c.wait(t, Duration::from_millis(10)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn offer_applies_filter_and_completion_rule() {
        let c: Correlator<u8> = Correlator::new();
        let t = c
            .register_matching(|b| *b % 2 == 1, |all| all.len() == 2)
            .unwrap();
        assert!(!c.offer(&2));
        assert!(c.offer(&3));
        assert!(c.offer(&5));
        assert!(!c.offer(&7));
        assert_eq!(c.wait(t, Duration::from_millis(10)).unwrap(), vec![3, 5]);
    }

    #[test]
    fn waiter_wakes_on_completion_from_other_thread() {
        let c: Arc<Correlator<u8>> = Arc::new(Correlator::new());
        let t = c.register().unwrap();
        let id = t.id();
        let reader = Arc::clone(&c);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            reader.complete(id, 9);
        });
        assert_eq!(c.wait(t, Duration::from_secs(2)).unwrap(), vec![9]);
        handle.join().unwrap();
    }

    #[test]
    fn collect_returns_partial_after_window() {
        let c: Correlator<u8> = Correlator::new();
        let t = c.register_matching(|_| true, |_| false).unwrap();
        c.offer(&1);
        c.offer(&2);
        assert_eq!(c.collect(t, Duration::from_millis(20)), vec![1, 2]);
        assert!(!c.is_pending());
    }
}
