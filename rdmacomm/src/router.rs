//! Completion routing.
//!
//! Each completion event is turned back into the slot it was posted for and
//! handed to exactly one reaction:
//!
//! - non-success status: the error reaction, with a [`FailedCompletion`]
//! - successful outbound kinds: the kind's reaction, with an
//!   [`OutboundCompletion`]
//! - successful receive: the receive reaction, with an
//!   [`InboundCompletion`] exposing the received bytes
//!
//! Handles own the slot for the duration of the reaction. Dropping one
//! returns the slot: outbound ids go back to the pool, inbound slots are
//! reposted. Failed completions are recovered the same way, so a slot is
//! never stranded by an error.
//!
//! Handles borrow the communicator for the reaction's duration only, so a
//! reaction cannot hand a slot to another thread and release it later;
//! custody ends when the reaction returns, or is carried on through
//! [`OutboundCompletion::reuse`]. A receive whose repost fails is kept for
//! [`Communicator::rearm_pending`].

use crate::comm::{BorrowedSlot, Communicator};
use crate::error::Error;
use crate::types::{kind_for_opcode, CompletionEvent, Direction, OpKind, SlotId, WcStatus};

/// Reaction for a completed outbound operation.
pub type OutboundReaction = Box<dyn Fn(OutboundCompletion<'_>) + Send + Sync>;
/// Reaction for a completed receive.
pub type InboundReaction = Box<dyn Fn(InboundCompletion<'_>) + Send + Sync>;
/// Reaction for a completion with a non-success status.
pub type ErrorReaction = Box<dyn Fn(FailedCompletion<'_>) + Send + Sync>;

/// Where a completion event belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    /// Direction encoded in the work-request id.
    pub direction: Direction,
    /// Slot encoded in the work-request id.
    pub slot: SlotId,
    /// Kind derived from the opcode. `None` if the opcode is not one this
    /// layer posts, or if it contradicts the id's direction.
    pub kind: Option<OpKind>,
}

/// Map a completion event to its direction, slot and kind.
pub fn classify(event: &CompletionEvent) -> Classified {
    let (direction, slot) = event.slot();
    let kind = kind_for_opcode(event.opcode).filter(|k| k.direction() == direction);
    Classified {
        direction,
        slot,
        kind,
    }
}

/// One reaction per operation kind, plus the error reaction.
#[derive(Default)]
pub struct ReactionTable {
    send: Option<OutboundReaction>,
    rdma_write: Option<OutboundReaction>,
    rdma_read: Option<OutboundReaction>,
    recv: Option<InboundReaction>,
    error: Option<ErrorReaction>,
}

impl ReactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reaction for an outbound kind, replacing any previous one.
    ///
    /// Ignored for [`OpKind::Recv`]; use [`ReactionTable::set_recv`].
    pub fn set_outbound(&mut self, kind: OpKind, reaction: OutboundReaction) {
        match kind {
            OpKind::Send => self.send = Some(reaction),
            OpKind::RdmaWrite => self.rdma_write = Some(reaction),
            OpKind::RdmaRead => self.rdma_read = Some(reaction),
            OpKind::Recv => log::warn!("outbound reaction registered for Recv, ignored"),
        }
    }

    pub fn set_recv(&mut self, reaction: InboundReaction) {
        self.recv = Some(reaction);
    }

    pub fn set_error(&mut self, reaction: ErrorReaction) {
        self.error = Some(reaction);
    }

    /// Whether a reaction is registered for `kind`.
    pub fn has(&self, kind: OpKind) -> bool {
        match kind {
            OpKind::Send => self.send.is_some(),
            OpKind::RdmaWrite => self.rdma_write.is_some(),
            OpKind::RdmaRead => self.rdma_read.is_some(),
            OpKind::Recv => self.recv.is_some(),
        }
    }

    fn outbound(&self, kind: OpKind) -> Option<&OutboundReaction> {
        match kind {
            OpKind::Send => self.send.as_ref(),
            OpKind::RdmaWrite => self.rdma_write.as_ref(),
            OpKind::RdmaRead => self.rdma_read.as_ref(),
            OpKind::Recv => None,
        }
    }

    /// Route one event. Called from the fabric's delivery thread.
    pub(crate) fn dispatch(&self, comm: &Communicator, event: CompletionEvent) {
        let Classified {
            direction,
            slot,
            kind,
        } = classify(&event);

        if slot >= comm.capacity() || !comm.region().has(direction) {
            log::error!(
                "completion for unknown {:?} slot {} (wr_id={:#x}), dropped",
                direction,
                slot,
                event.wr_id
            );
            return;
        }
        if !comm.claim(direction, slot) {
            log::error!(
                "completion for {:?} slot {} that has nothing outstanding, dropped",
                direction,
                slot
            );
            return;
        }

        if !event.status.is_success() {
            let failed = FailedCompletion {
                comm,
                direction,
                slot,
                kind,
                status: event.status,
            };
            match &self.error {
                Some(reaction) => reaction(failed),
                None => log::error!("{}", failed.error()),
            }
            return;
        }

        match kind {
            Some(OpKind::Recv) => {
                let completion = InboundCompletion {
                    comm,
                    slot,
                    byte_len: event.byte_len,
                };
                match &self.recv {
                    Some(reaction) => reaction(completion),
                    None => log::warn!("no reaction for Recv, slot {} rearmed", slot),
                }
            }
            Some(kind) if comm.supports(kind) => {
                let completion = OutboundCompletion {
                    comm,
                    slot,
                    kind,
                    byte_len: event.byte_len,
                };
                match self.outbound(kind) {
                    Some(reaction) => reaction(completion),
                    None => log::warn!("no reaction for {:?}, slot {} released", kind, slot),
                }
            }
            _ => {
                log::error!(
                    "unrecognized opcode {} for {:?} slot {}, event dropped",
                    event.opcode,
                    direction,
                    slot
                );
                comm.recover(direction, slot);
            }
        }
    }
}

/// A completed outbound operation. Dropping it returns the slot to the pool.
pub struct OutboundCompletion<'a> {
    comm: &'a Communicator,
    slot: SlotId,
    kind: OpKind,
    byte_len: u32,
}

impl<'a> OutboundCompletion<'a> {
    #[inline]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Bytes reported by the completion.
    #[inline]
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// The slot buffer. Holds the fetched bytes after an RDMA READ.
    pub fn buf(&self) -> &[u8] {
        // Safety: the completion owns the slot until it is dropped.
        unsafe {
            self.comm
                .region()
                .slice(Direction::Outbound, self.slot)
                .unwrap_or_default()
        }
    }

    /// Return the slot to the pool.
    pub fn release(self) {}

    /// Keep custody and reuse the slot for another operation of the same
    /// kind without going through the pool.
    pub fn reuse(self) -> BorrowedSlot<'a> {
        let slot = BorrowedSlot::adopt(self.comm, self.slot, self.kind);
        std::mem::forget(self);
        slot
    }
}

impl Drop for OutboundCompletion<'_> {
    fn drop(&mut self) {
        self.comm.release_outbound(self.slot);
    }
}

/// A completed receive. Dropping it reposts the receive.
pub struct InboundCompletion<'a> {
    comm: &'a Communicator,
    slot: SlotId,
    byte_len: u32,
}

impl InboundCompletion<'_> {
    #[inline]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Number of bytes received.
    #[inline]
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// The received bytes.
    pub fn data(&self) -> &[u8] {
        // Safety: the receive is not posted while this handle exists.
        let slice = unsafe {
            self.comm
                .region()
                .slice(Direction::Inbound, self.slot)
                .unwrap_or_default()
        };
        let len = (self.byte_len as usize).min(slice.len());
        &slice[..len]
    }

    /// Repost the receive.
    pub fn release(self) {}
}

impl Drop for InboundCompletion<'_> {
    fn drop(&mut self) {
        self.comm.rearm(self.slot);
    }
}

/// A completion with a non-success status.
///
/// Dropping it recovers the slot like a successful completion would.
pub struct FailedCompletion<'a> {
    comm: &'a Communicator,
    direction: Direction,
    slot: SlotId,
    kind: Option<OpKind>,
    status: WcStatus,
}

impl FailedCompletion<'_> {
    #[inline]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Kind, if the opcode on the failed event could be trusted.
    #[inline]
    pub fn kind(&self) -> Option<OpKind> {
        self.kind
    }

    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// The failure as an [`Error::Completion`].
    pub fn error(&self) -> Error {
        Error::Completion {
            direction: self.direction,
            slot: self.slot,
            status: self.status,
        }
    }

    /// Recover the slot.
    pub fn release(self) {}
}

impl Drop for FailedCompletion<'_> {
    fn drop(&mut self) {
        self.comm.recover(self.direction, self.slot);
    }
}
