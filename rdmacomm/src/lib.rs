//! # rdmacomm - slot-based RDMA communication core
//!
//! Resource management and completion dispatch for one RDMA connection.
//! A single registered region is sliced into fixed-size slot buffers; each
//! slot carries a prepared work request per enabled operation kind, so the
//! data path only patches a length and posts.
//!
//! ## Features
//!
//! - **One registration**: outbound and inbound slot sets live in one
//!   page-aligned region registered once
//! - **Slot custody**: borrowed slots are move-only handles; dropping one
//!   returns the slot
//! - **FIFO blocking borrow**: waiters are served in arrival order and woken
//!   on release
//! - **Prepared templates**: send, receive, RDMA WRITE and RDMA READ
//!   descriptors are built once at initialization
//! - **Completion routing**: one reaction per kind plus an error reaction;
//!   receives are reposted automatically
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use rdmacomm::{CommConfig, Communicator, LoopbackFabric, OpKind};
//!
//! let fabric = Arc::new(LoopbackFabric::new());
//! let comm = Communicator::builder(CommConfig::two_sided(16, 4096))
//!     .on_send(|done| done.release())
//!     .on_recv(|msg| println!("got {} bytes", msg.data().len()))
//!     .on_error(|failed| eprintln!("{}", failed.error()))
//!     .initialize(fabric.clone())?;
//!
//! let mut slot = comm.borrow(OpKind::Send)?.expect("communicator is open");
//! slot.write(b"hello")?;
//! slot.submit_written().map_err(|e| e.into_parts().1)?;
//!
//! // On the fabric's delivery thread:
//! while let Some(event) = fabric.complete_next_send() {
//!     comm.on_completion_event(event);
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: Configuration (`CommConfig`)
//! - [`region`]: Registered region and slicing (`RegisteredRegion`)
//! - [`pool`]: Slot free-list with FIFO waiters (`SlotPool`)
//! - [`template`]: Prepared work requests (`TemplateCache`, `WorkRequest`)
//! - [`router`]: Completion classification and reactions
//! - [`comm`]: The orchestrator (`Communicator`, `BorrowedSlot`)
//! - [`fabric`]: Transport boundary (`Fabric`)
//! - [`loopback`]: In-process fabric (`LoopbackFabric`)

pub mod comm;
pub mod config;
pub mod error;
pub mod fabric;
pub mod loopback;
pub mod pool;
pub mod region;
pub mod router;
pub mod template;
pub mod types;

// Re-export main types
pub use comm::{BorrowedSlot, Communicator, CommunicatorBuilder, SubmitError};
pub use config::CommConfig;
pub use error::{Error, Result};
pub use fabric::{Fabric, MemoryKey};
pub use loopback::{LoopbackFabric, PostedOp};
pub use pool::SlotPool;
pub use region::{RegisteredRegion, PAGE_SIZE};
pub use router::{
    classify, Classified, FailedCompletion, InboundCompletion, OutboundCompletion, ReactionTable,
};
pub use template::{Sge, TemplateCache, WorkRequest};
pub use types::{
    decode_wr_id, encode_wr_id, kind_for_opcode, wc_opcode, CompletionEvent, Direction, OpKind,
    OpKinds, RemoteLocation, SlotId, WcStatus, INBOUND_WR_ID_FLAG,
};
