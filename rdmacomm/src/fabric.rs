//! Boundary with the RDMA transport.
//!
//! The communicator never talks to a device directly. Memory registration,
//! posting to the queue pair and delivering completions are the job of a
//! [`Fabric`] implementation; completions flow back through
//! [`Communicator::on_completion_event`](crate::Communicator::on_completion_event)
//! on the fabric's own polling thread.

use std::io;

use crate::template::WorkRequest;

/// Capability key produced by registering memory.
///
/// - `lkey`: placed in the SGE of every local descriptor
/// - `rkey`: handed to peers so they can target this memory one-sidedly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryKey {
    pub lkey: u32,
    pub rkey: u32,
}

/// Transport capability used by the communicator.
pub trait Fabric: Send + Sync {
    /// Register `len` bytes starting at `addr` for local and remote access.
    ///
    /// # Safety
    /// The caller must ensure that:
    /// - The memory pointed to by `addr` with `len` bytes is valid
    /// - The memory remains valid until [`Fabric::deregister_region`] is
    ///   called with the returned key
    unsafe fn register_region(&self, addr: *mut u8, len: usize) -> io::Result<MemoryKey>;

    /// Release a registration obtained from [`Fabric::register_region`].
    ///
    /// Descriptors still posted against `key.lkey` are discarded without a
    /// completion; the memory is freed right after this returns. A verbs
    /// fabric moves or destroys the queue pair before deregistering.
    fn deregister_region(&self, key: MemoryKey);

    /// Post an outbound descriptor (send, RDMA WRITE or RDMA READ).
    ///
    /// Must not block. The descriptor stays owned by the caller; the fabric
    /// copies what it needs before returning.
    fn post_send(&self, wr: &WorkRequest) -> io::Result<()>;

    /// Post a receive descriptor.
    fn post_recv(&self, wr: &WorkRequest) -> io::Result<()>;

    /// Whether the underlying connection can still carry work.
    fn is_connected(&self) -> bool {
        true
    }
}
