//! Shared vocabulary: operation kinds, directions, completion events.

use std::fmt;

use bitflags::bitflags;

/// Index of a slot within one direction's slice set.
pub type SlotId = usize;

/// Work-completion opcodes as reported by verbs (`ibv_wc_opcode`).
pub mod wc_opcode {
    /// Two-sided send completed.
    pub const SEND: u32 = 0;
    /// One-sided RDMA WRITE completed.
    pub const RDMA_WRITE: u32 = 1;
    /// One-sided RDMA READ completed.
    pub const RDMA_READ: u32 = 2;
    /// Receive completed; the slot buffer holds incoming data.
    pub const RECV: u32 = 1 << 7;
    /// Receive of an RDMA WRITE with immediate.
    pub const RECV_RDMA_WITH_IMM: u32 = RECV + 1;
}

/// Direction a slot serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Locally initiated operations (send, write, read).
    Outbound,
    /// Posted receives waiting for remote data.
    Inbound,
}

/// Operation kinds the communicator can prepare templates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Two-sided signaled send.
    Send,
    /// Two-sided receive.
    Recv,
    /// One-sided signaled RDMA WRITE.
    RdmaWrite,
    /// One-sided signaled RDMA READ.
    RdmaRead,
}

impl OpKind {
    /// All kinds, in template-table order.
    pub const ALL: [OpKind; 4] = [OpKind::Send, OpKind::Recv, OpKind::RdmaWrite, OpKind::RdmaRead];

    /// Direction of the slots this kind operates on.
    #[inline]
    pub fn direction(self) -> Direction {
        match self {
            OpKind::Recv => Direction::Inbound,
            OpKind::Send | OpKind::RdmaWrite | OpKind::RdmaRead => Direction::Outbound,
        }
    }

    /// Whether the descriptor targets remote memory.
    #[inline]
    pub fn is_remote_addressed(self) -> bool {
        matches!(self, OpKind::RdmaWrite | OpKind::RdmaRead)
    }

    /// Completion opcode the fabric reports for this kind.
    #[inline]
    pub fn wc_opcode(self) -> u32 {
        match self {
            OpKind::Send => wc_opcode::SEND,
            OpKind::Recv => wc_opcode::RECV,
            OpKind::RdmaWrite => wc_opcode::RDMA_WRITE,
            OpKind::RdmaRead => wc_opcode::RDMA_READ,
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            OpKind::Send => 0,
            OpKind::Recv => 1,
            OpKind::RdmaWrite => 2,
            OpKind::RdmaRead => 3,
        }
    }

    #[inline]
    pub(crate) fn flag(self) -> OpKinds {
        match self {
            OpKind::Send => OpKinds::SEND,
            OpKind::Recv => OpKinds::RECV,
            OpKind::RdmaWrite => OpKinds::RDMA_WRITE,
            OpKind::RdmaRead => OpKinds::RDMA_READ,
        }
    }
}

/// Map a completion opcode to the operation kind that produced it.
///
/// Returns `None` for opcodes this layer never posts.
#[inline]
pub fn kind_for_opcode(opcode: u32) -> Option<OpKind> {
    match opcode {
        wc_opcode::SEND => Some(OpKind::Send),
        wc_opcode::RECV => Some(OpKind::Recv),
        wc_opcode::RDMA_WRITE => Some(OpKind::RdmaWrite),
        wc_opcode::RDMA_READ => Some(OpKind::RdmaRead),
        _ => None,
    }
}

bitflags! {
    /// Set of operation kinds enabled on a communicator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpKinds: u8 {
        /// Two-sided send.
        const SEND = 1 << 0;
        /// Two-sided receive. Enables the inbound slice set.
        const RECV = 1 << 1;
        /// One-sided RDMA WRITE.
        const RDMA_WRITE = 1 << 2;
        /// One-sided RDMA READ.
        const RDMA_READ = 1 << 3;

        /// Kinds served by the outbound slot set.
        const OUTBOUND = Self::SEND.bits() | Self::RDMA_WRITE.bits() | Self::RDMA_READ.bits();
        /// Send + receive.
        const TWO_SIDED = Self::SEND.bits() | Self::RECV.bits();
    }
}

impl OpKinds {
    /// Whether `kind` is in the set.
    #[inline]
    pub fn has(self, kind: OpKind) -> bool {
        self.contains(kind.flag())
    }

    /// Whether any outbound kind is enabled.
    #[inline]
    pub fn has_outbound(self) -> bool {
        self.intersects(OpKinds::OUTBOUND)
    }

    /// Whether the inbound set is needed.
    #[inline]
    pub fn has_inbound(self) -> bool {
        self.contains(OpKinds::RECV)
    }

    /// Enabled kinds in template-table order.
    pub fn kinds(self) -> impl Iterator<Item = OpKind> {
        OpKind::ALL.into_iter().filter(move |k| self.has(*k))
    }
}

/// Memory on a remote peer targeted by one-sided operations.
///
/// Slot `i` addresses `addr + i * slot_size`, mirroring the local slicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteLocation {
    /// Base remote virtual address.
    pub addr: u64,
    /// Remote key of the peer's registered region.
    pub rkey: u32,
}

impl RemoteLocation {
    pub fn new(addr: u64, rkey: u32) -> Self {
        Self { addr, rkey }
    }
}

/// Work completion status (`ibv_wc_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WcStatus(pub u32);

impl WcStatus {
    pub const SUCCESS: WcStatus = WcStatus(0);
    pub const LOC_LEN_ERR: WcStatus = WcStatus(1);
    pub const LOC_PROT_ERR: WcStatus = WcStatus(4);
    pub const WR_FLUSH_ERR: WcStatus = WcStatus(5);
    pub const REM_ACCESS_ERR: WcStatus = WcStatus(10);
    pub const RETRY_EXC_ERR: WcStatus = WcStatus(12);

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            WcStatus::SUCCESS => "success",
            WcStatus::LOC_LEN_ERR => "local length error",
            WcStatus::LOC_PROT_ERR => "local protection error",
            WcStatus::WR_FLUSH_ERR => "work request flushed",
            WcStatus::REM_ACCESS_ERR => "remote access error",
            WcStatus::RETRY_EXC_ERR => "retry exceeded",
            _ => return write!(f, "status {}", self.0),
        };
        write!(f, "{} ({})", name, self.0)
    }
}

/// Tag bit marking inbound work-request ids.
///
/// Hardware does not guarantee a valid opcode on failed completions, so the
/// direction travels in the id itself.
pub const INBOUND_WR_ID_FLAG: u64 = 1 << 63;

/// Build the 64-bit work-request id for a slot.
#[inline]
pub fn encode_wr_id(direction: Direction, slot: SlotId) -> u64 {
    match direction {
        Direction::Outbound => slot as u64,
        Direction::Inbound => slot as u64 | INBOUND_WR_ID_FLAG,
    }
}

/// Split a work-request id into direction and slot.
#[inline]
pub fn decode_wr_id(wr_id: u64) -> (Direction, SlotId) {
    if wr_id & INBOUND_WR_ID_FLAG != 0 {
        (Direction::Inbound, (wr_id & !INBOUND_WR_ID_FLAG) as SlotId)
    } else {
        (Direction::Outbound, wr_id as SlotId)
    }
}

/// A completion notification delivered by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Work-request id the descriptor was posted with.
    pub wr_id: u64,
    /// Completion opcode.
    pub opcode: u32,
    /// Completion status.
    pub status: WcStatus,
    /// Bytes transferred (meaningful for receives).
    pub byte_len: u32,
}

impl CompletionEvent {
    /// Successful completion for `kind` on `slot`.
    pub fn success(kind: OpKind, slot: SlotId, byte_len: u32) -> Self {
        Self {
            wr_id: encode_wr_id(kind.direction(), slot),
            opcode: kind.wc_opcode(),
            status: WcStatus::SUCCESS,
            byte_len,
        }
    }

    /// Failed completion for `kind` on `slot`.
    pub fn failure(kind: OpKind, slot: SlotId, status: WcStatus) -> Self {
        Self {
            wr_id: encode_wr_id(kind.direction(), slot),
            opcode: kind.wc_opcode(),
            status,
            byte_len: 0,
        }
    }

    /// Direction and slot encoded in the work-request id.
    #[inline]
    pub fn slot(&self) -> (Direction, SlotId) {
        decode_wr_id(self.wr_id)
    }
}
