//! Wire codec abstraction.
//!
//! A codec is a pure translator between domain [`Command`]s and one backend's
//! frames. It performs no I/O and keeps no state beyond lookup tables, so one
//! instance may be shared between the dispatcher and the reader worker.
//!
//! Codecs that drive solenoid accessories must be able to build the OFF frame
//! from the coil identity alone; the [`SafetyMonitor`](crate::safety::SafetyMonitor)
//! relies on that to cut power without consulting hardware state.

use core::fmt::Debug;

use crate::codec::Decoded;
use crate::commands::{AccessoryValue, Command, DecoderProtocol};
use crate::error::Result;
use crate::state::LocoState;

/// Backend-specific translation between commands and frames.
pub trait Codec: Send + Sync {
    /// Wire unit of this backend.
    type Frame: Clone + Debug + PartialEq + Send + 'static;

    /// Backend name used in logs and errors.
    const BACKEND: &'static str;

    /// Encode a command into the frames to write, in order.
    ///
    /// `loco` is the last known state of the addressed locomotive, for
    /// protocols that must resend speed or functions alongside a change.
    fn encode(&self, command: &Command, loco: &LocoState) -> Result<Vec<Self::Frame>>;

    /// The frame that de-energizes a coil, if this backend needs one.
    fn cutoff(
        &self,
        address: u32,
        protocol: DecoderProtocol,
        value: AccessoryValue,
    ) -> Option<Self::Frame>;

    /// Interpret a frame. Unknown frames decode to [`Decoded::Unrecognized`].
    fn decode(&self, frame: &Self::Frame) -> Decoded;

    /// Serialize a frame to the bytes written on the channel.
    fn to_wire(&self, frame: &Self::Frame) -> Vec<u8>;
}
