//! In-process fabric.
//!
//! [`LoopbackFabric`] stands in for a NIC: it hands out memory keys, records
//! every descriptor posted to it and turns outstanding descriptors into
//! completion events on request. Receives can be fed with payloads, which are
//! copied into the posted buffer the same way a peer's send would land.
//! Failure switches let callers exercise registration, posting and
//! disconnection paths.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::fabric::{Fabric, MemoryKey};
use crate::template::{Sge, WorkRequest};
use crate::types::{CompletionEvent, OpKind, RemoteLocation, SlotId, WcStatus};

/// Key space offset so that rkeys are distinguishable from lkeys in logs.
const RKEY_BASE: u32 = 0x8000_0000;

/// Post budget meaning "never fail".
const UNLIMITED: usize = usize::MAX;

/// Snapshot of a descriptor at the time it was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedOp {
    pub wr_id: u64,
    pub kind: OpKind,
    pub slot: SlotId,
    pub sge: Sge,
    pub remote: Option<RemoteLocation>,
}

impl PostedOp {
    fn capture(wr: &WorkRequest) -> Self {
        Self {
            wr_id: wr.wr_id(),
            kind: wr.kind(),
            slot: wr.slot(),
            sge: wr.sge(),
            remote: wr.remote(),
        }
    }

    /// Successful completion moving the whole SGE.
    pub fn complete(&self) -> CompletionEvent {
        CompletionEvent::success(self.kind, self.slot, self.sge.length)
    }

    /// Completion with `status`.
    pub fn fail(&self, status: WcStatus) -> CompletionEvent {
        CompletionEvent::failure(self.kind, self.slot, status)
    }
}

#[derive(Default)]
struct Queues {
    /// Every post, in order.
    history: Vec<PostedOp>,
    /// Outbound posts without a completion yet.
    send_queue: VecDeque<PostedOp>,
    /// Receives waiting for a payload.
    recv_queue: VecDeque<PostedOp>,
}

/// Fabric that never leaves the process.
pub struct LoopbackFabric {
    next_key: AtomicU32,
    registrations: Mutex<HashMap<u32, (u64, usize)>>,
    deregistrations: AtomicUsize,
    posts: AtomicUsize,
    queues: Mutex<Queues>,
    fail_registration: AtomicBool,
    /// Posts that may still succeed.
    post_budget: AtomicUsize,
    connected: AtomicBool,
    keep_history: bool,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    /// Create a connected fabric with no registrations.
    pub fn new() -> Self {
        Self {
            next_key: AtomicU32::new(1),
            registrations: Mutex::new(HashMap::new()),
            deregistrations: AtomicUsize::new(0),
            posts: AtomicUsize::new(0),
            queues: Mutex::new(Queues::default()),
            fail_registration: AtomicBool::new(false),
            post_budget: AtomicUsize::new(UNLIMITED),
            connected: AtomicBool::new(true),
            keep_history: true,
        }
    }

    /// Like [`LoopbackFabric::new`], but [`LoopbackFabric::posted`] stays
    /// empty. For long-running loops.
    pub fn without_history() -> Self {
        Self {
            keep_history: false,
            ..Self::new()
        }
    }

    /// Make subsequent registrations fail.
    pub fn fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent posts fail.
    pub fn fail_posts(&self, fail: bool) {
        let budget = if fail { 0 } else { UNLIMITED };
        self.post_budget.store(budget, Ordering::Relaxed);
    }

    /// Let the next `posts` posts succeed and fail every one after.
    pub fn fail_posts_after(&self, posts: usize) {
        self.post_budget.store(posts, Ordering::Relaxed);
    }

    /// Set the reported connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Drop the connection. Posts are refused from now on.
    pub fn disconnect(&self) {
        self.set_connected(false);
    }

    /// Registrations not yet released.
    pub fn live_registrations(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Number of successful deregistrations.
    pub fn deregistrations(&self) -> usize {
        self.deregistrations.load(Ordering::Relaxed)
    }

    /// Every descriptor posted so far, in order.
    pub fn posted(&self) -> Vec<PostedOp> {
        self.queues.lock().history.clone()
    }

    /// Number of descriptors posted so far.
    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::Relaxed)
    }

    /// Outbound posts still waiting for a completion.
    pub fn pending_sends(&self) -> usize {
        self.queues.lock().send_queue.len()
    }

    /// Receives still waiting for a payload.
    pub fn pending_recvs(&self) -> usize {
        self.queues.lock().recv_queue.len()
    }

    /// Complete the oldest outbound post successfully.
    pub fn complete_next_send(&self) -> Option<CompletionEvent> {
        self.queues.lock().send_queue.pop_front().map(|op| op.complete())
    }

    /// Fail the oldest outbound post with `status`.
    pub fn fail_next_send(&self, status: WcStatus) -> Option<CompletionEvent> {
        self.queues
            .lock()
            .send_queue
            .pop_front()
            .map(|op| op.fail(status))
    }

    /// Land `payload` in the oldest posted receive and complete it.
    ///
    /// The payload is truncated to the receive's SGE length.
    pub fn deliver(&self, payload: &[u8]) -> Option<CompletionEvent> {
        let op = self.queues.lock().recv_queue.pop_front()?;
        let len = payload.len().min(op.sge.length as usize);
        // Held across the copy so the registration cannot go away under it.
        let registrations = self.registrations.lock();
        let covered = registrations
            .get(&op.sge.lkey)
            .is_some_and(|&(base, size)| {
                op.sge.addr >= base && op.sge.addr + len as u64 <= base + size as u64
            });
        if !covered {
            log::error!(
                "receive for slot {} outside its registration (lkey {:#x})",
                op.slot,
                op.sge.lkey
            );
            return Some(op.fail(WcStatus::LOC_PROT_ERR));
        }
        // Safety: the range lies in the registration named by the SGE, whose
        // memory the registrant keeps valid until deregistration, and the
        // lock keeps it registered. The receive is outstanding, so nobody
        // else touches the slice.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), op.sge.addr as *mut u8, len);
        }
        drop(registrations);
        Some(CompletionEvent::success(OpKind::Recv, op.slot, len as u32))
    }

    /// Flush every outstanding descriptor, as a queue pair entering the
    /// error state does.
    pub fn flush(&self) -> Vec<CompletionEvent> {
        let mut queues = self.queues.lock();
        let sends = std::mem::take(&mut queues.send_queue);
        let recvs = std::mem::take(&mut queues.recv_queue);
        sends
            .into_iter()
            .chain(recvs)
            .map(|op| op.fail(WcStatus::WR_FLUSH_ERR))
            .collect()
    }

    fn check_postable(&self) -> io::Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "loopback disconnected"));
        }
        let spent = self
            .post_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |budget| match budget {
                0 => None,
                UNLIMITED => Some(UNLIMITED),
                n => Some(n - 1),
            });
        if spent.is_err() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "work queue full"));
        }
        Ok(())
    }
}

impl Fabric for LoopbackFabric {
    unsafe fn register_region(&self, addr: *mut u8, len: usize) -> io::Result<MemoryKey> {
        if self.fail_registration.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "cannot pin memory",
            ));
        }
        let lkey = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .lock()
            .insert(lkey, (addr as u64, len));
        Ok(MemoryKey {
            lkey,
            rkey: lkey | RKEY_BASE,
        })
    }

    fn deregister_region(&self, key: MemoryKey) {
        let mut registrations = self.registrations.lock();
        if registrations.remove(&key.lkey).is_none() {
            log::error!("deregistering unknown lkey {:#x}", key.lkey);
            return;
        }
        self.deregistrations.fetch_add(1, Ordering::Relaxed);

        let mut queues = self.queues.lock();
        let before = queues.send_queue.len() + queues.recv_queue.len();
        queues.send_queue.retain(|op| op.sge.lkey != key.lkey);
        queues.recv_queue.retain(|op| op.sge.lkey != key.lkey);
        let discarded = before - queues.send_queue.len() - queues.recv_queue.len();
        if discarded > 0 {
            log::debug!(
                "discarded {} descriptors posted against lkey {:#x}",
                discarded,
                key.lkey
            );
        }
    }

    fn post_send(&self, wr: &WorkRequest) -> io::Result<()> {
        self.check_postable()?;
        let op = PostedOp::capture(wr);
        self.posts.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.lock();
        if self.keep_history {
            queues.history.push(op);
        }
        queues.send_queue.push_back(op);
        Ok(())
    }

    fn post_recv(&self, wr: &WorkRequest) -> io::Result<()> {
        self.check_postable()?;
        let op = PostedOp::capture(wr);
        self.posts.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.lock();
        if self.keep_history {
            queues.history.push(op);
        }
        queues.recv_queue.push_back(op);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
