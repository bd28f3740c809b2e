//! Error types for rdmacomm.

use std::io;

use crate::types::{Direction, OpKind, SlotId, WcStatus};

/// Error type for rdmacomm operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Registering the communication region with the fabric failed.
    #[error("memory registration failed: {0}")]
    Registration(#[source] io::Error),
    /// Posting a work request to the fabric failed.
    #[error("failed to post {kind:?} work request for slot {slot}: {source}")]
    Transport {
        kind: OpKind,
        slot: SlotId,
        #[source]
        source: io::Error,
    },
    /// A completion event arrived with a non-success status.
    #[error("{direction:?} completion for slot {slot} failed with status {status}")]
    Completion {
        direction: Direction,
        slot: SlotId,
        status: WcStatus,
    },
    /// Peer speaks a different protocol version than this endpoint.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersionMismatch { expected: u8, got: u8 },
    /// The communicator is shutting down and no longer accepts work.
    #[error("communicator is shutting down")]
    ShuttingDown,
    /// The operation kind was not enabled for this communicator.
    #[error("operation kind {0:?} is not enabled")]
    UnsupportedKind(OpKind),
    /// Slot id outside of the configured range.
    #[error("invalid slot id: {0}")]
    InvalidSlot(SlotId),
    /// Slot released while not held by anyone.
    #[error("slot {0} is not held")]
    SlotNotHeld(SlotId),
    /// Requested length does not fit in the slot buffer.
    #[error("length {len} exceeds slot size {slot_size}")]
    LengthExceedsSlot { len: usize, slot_size: usize },
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the failure is transient from the caller's point of view.
    ///
    /// Transport failures leave the slot with the caller, who may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

/// Result type for rdmacomm operations.
pub type Result<T> = std::result::Result<T, Error>;
