//! Communicator: the region, the slot pool, the templates and the reaction
//! table behind one handle.
//!
//! Application threads borrow outbound slots, fill them and submit them;
//! the fabric's delivery thread feeds completions into
//! [`Communicator::on_completion_event`], which hands the slot to the
//! matching reaction. Receives are posted once at initialization and
//! reposted whenever their completion handle goes away.
//!
//! The communicator has no thread of its own.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::CommConfig;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::pool::SlotPool;
use crate::region::RegisteredRegion;
use crate::router::{
    FailedCompletion, InboundCompletion, OutboundCompletion, ReactionTable,
};
use crate::template::TemplateCache;
use crate::types::{CompletionEvent, Direction, OpKind, RemoteLocation, SlotId};

/// Collects configuration and reactions before anything is allocated.
pub struct CommunicatorBuilder {
    config: CommConfig,
    reactions: ReactionTable,
}

impl CommunicatorBuilder {
    pub fn new(config: CommConfig) -> Self {
        Self {
            config,
            reactions: ReactionTable::new(),
        }
    }

    /// Reaction for completed sends.
    pub fn on_send<F>(mut self, reaction: F) -> Self
    where
        F: Fn(OutboundCompletion<'_>) + Send + Sync + 'static,
    {
        self.reactions.set_outbound(OpKind::Send, Box::new(reaction));
        self
    }

    /// Reaction for completed RDMA WRITEs.
    pub fn on_rdma_write<F>(mut self, reaction: F) -> Self
    where
        F: Fn(OutboundCompletion<'_>) + Send + Sync + 'static,
    {
        self.reactions.set_outbound(OpKind::RdmaWrite, Box::new(reaction));
        self
    }

    /// Reaction for completed RDMA READs. The slot buffer holds the data.
    pub fn on_rdma_read<F>(mut self, reaction: F) -> Self
    where
        F: Fn(OutboundCompletion<'_>) + Send + Sync + 'static,
    {
        self.reactions.set_outbound(OpKind::RdmaRead, Box::new(reaction));
        self
    }

    /// Reaction for received messages.
    pub fn on_recv<F>(mut self, reaction: F) -> Self
    where
        F: Fn(InboundCompletion<'_>) + Send + Sync + 'static,
    {
        self.reactions.set_recv(Box::new(reaction));
        self
    }

    /// Reaction for completions with a non-success status.
    pub fn on_error<F>(mut self, reaction: F) -> Self
    where
        F: Fn(FailedCompletion<'_>) + Send + Sync + 'static,
    {
        self.reactions.set_error(Box::new(reaction));
        self
    }

    /// Allocate and register the region, build the templates and post
    /// every receive.
    ///
    /// On failure nothing stays registered.
    pub fn initialize(self, fabric: Arc<dyn Fabric>) -> Result<Communicator> {
        let config = self.config;
        config.validate()?;
        for kind in config.kinds.kinds() {
            if !self.reactions.has(kind) {
                log::warn!("{:?} enabled without a reaction; completions will be dropped", kind);
            }
        }

        let region = RegisteredRegion::allocate(&config, fabric.clone())?;
        let templates = TemplateCache::initialize(&region, &config, fabric.as_ref())?;

        let n = config.num_slots;
        let pool = config
            .kinds
            .has_outbound()
            .then(|| SlotPool::new(Direction::Outbound, n));
        let flags = |len: usize, set: bool| -> Box<[AtomicBool]> {
            (0..len).map(|_| AtomicBool::new(set)).collect()
        };
        let outstanding = flags(if pool.is_some() { n } else { 0 }, false);
        // initialize() above posted every receive.
        let inbound = if config.kinds.has_inbound() { n } else { 0 };
        let armed = flags(inbound, true);
        let unarmed = flags(inbound, false);

        log::debug!(
            "communicator initialized: kinds={:?} slots={} slot_size={} rkey={:#x}",
            config.kinds,
            n,
            config.slot_size,
            region.rkey()
        );

        Ok(Communicator {
            templates,
            pool,
            outstanding,
            armed,
            unarmed,
            unarmed_count: AtomicUsize::new(0),
            reactions: self.reactions,
            shutting_down: AtomicBool::new(false),
            region,
            fabric,
            config,
        })
    }
}

/// Resource manager and dispatcher for one connection.
pub struct Communicator {
    templates: TemplateCache,
    /// Outbound free-list. `None` if only receives are enabled.
    pool: Option<SlotPool>,
    /// Per outbound slot: posted and awaiting its completion.
    outstanding: Box<[AtomicBool]>,
    /// Per inbound slot: receive posted.
    armed: Box<[AtomicBool]>,
    /// Per inbound slot: repost failed, waiting for
    /// [`Communicator::rearm_pending`].
    unarmed: Box<[AtomicBool]>,
    unarmed_count: AtomicUsize,
    reactions: ReactionTable,
    shutting_down: AtomicBool,
    // Dropped after the templates that point into it.
    region: RegisteredRegion,
    fabric: Arc<dyn Fabric>,
    config: CommConfig,
}

impl Communicator {
    /// Start building a communicator for `config`.
    pub fn builder(config: CommConfig) -> CommunicatorBuilder {
        CommunicatorBuilder::new(config)
    }

    /// Take custody of a free outbound slot for `kind`.
    ///
    /// With `blocking` set, waits until a slot is released; waiters are
    /// served in arrival order. Returns `Ok(None)` when no slot is free
    /// (non-blocking) or the communicator has been shut down.
    ///
    /// # Errors
    /// [`Error::UnsupportedKind`] if `kind` is not an enabled outbound kind.
    pub fn borrow_slot(&self, kind: OpKind, blocking: bool) -> Result<Option<BorrowedSlot<'_>>> {
        if kind.direction() != Direction::Outbound || !self.supports(kind) {
            return Err(Error::UnsupportedKind(kind));
        }
        let pool = self.pool.as_ref().ok_or(Error::UnsupportedKind(kind))?;
        let id = if blocking {
            pool.acquire_blocking()
        } else {
            pool.try_acquire()
        };
        if let Some(id) = id {
            log::trace!("borrowed slot {} for {:?}", id, kind);
        }
        Ok(id.map(|id| BorrowedSlot::adopt(self, id, kind)))
    }

    /// Non-blocking [`Communicator::borrow_slot`].
    pub fn try_borrow(&self, kind: OpKind) -> Result<Option<BorrowedSlot<'_>>> {
        self.borrow_slot(kind, false)
    }

    /// Blocking [`Communicator::borrow_slot`].
    pub fn borrow(&self, kind: OpKind) -> Result<Option<BorrowedSlot<'_>>> {
        self.borrow_slot(kind, true)
    }

    /// Post the slot's template with `length` bytes.
    ///
    /// On success the slot stays out of the pool until its completion has
    /// been handled. On failure the slot comes back in the error, still
    /// borrowed; nothing is retried.
    pub fn submit<'a>(
        &'a self,
        slot: BorrowedSlot<'a>,
        length: usize,
    ) -> std::result::Result<(), SubmitError<'a>> {
        if !std::ptr::eq(slot.comm, self) {
            let error = Error::InvalidSlot(slot.id);
            return Err(SubmitError { slot, error });
        }
        if self.is_shutting_down() {
            return Err(SubmitError {
                slot,
                error: Error::ShuttingDown,
            });
        }
        if length > self.config.slot_size {
            let error = Error::LengthExceedsSlot {
                len: length,
                slot_size: self.config.slot_size,
            };
            return Err(SubmitError { slot, error });
        }

        let id = slot.id;
        // Mark before posting: the completion may be delivered before
        // post returns.
        self.outstanding[id].store(true, Ordering::Release);
        match self
            .templates
            .submit(self.fabric.as_ref(), id, slot.kind, length)
        {
            Ok(()) => {
                std::mem::forget(slot);
                Ok(())
            }
            Err(error) => {
                self.outstanding[id].store(false, Ordering::Release);
                Err(SubmitError { slot, error })
            }
        }
    }

    /// Route one completion event to its reaction.
    ///
    /// Called by the fabric's delivery thread, one event at a time.
    pub fn on_completion_event(&self, event: CompletionEvent) {
        self.reactions.dispatch(self, event);
    }

    /// Repost receives whose rearm failed.
    ///
    /// A rearm that fails while the communicator is still running leaves the
    /// slot pending instead of dropping it. Every pending slot is tried once;
    /// those that fail again stay pending. Returns how many were reposted, or
    /// the first transport error. Pending slots are discarded once shutting
    /// down.
    pub fn rearm_pending(&self) -> Result<usize> {
        if self.unarmed_count.load(Ordering::Acquire) == 0 {
            return Ok(0);
        }
        let mut rearmed = 0;
        let mut first_error = None;
        for (slot, pending) in self.unarmed.iter().enumerate() {
            if !pending.swap(false, Ordering::AcqRel) {
                continue;
            }
            self.unarmed_count.fetch_sub(1, Ordering::AcqRel);
            match self.post_receive(slot) {
                Ok(true) => rearmed += 1,
                Ok(false) => {}
                Err(e) => {
                    self.defer_rearm(slot);
                    first_error.get_or_insert(e);
                }
            }
        }
        if rearmed > 0 {
            log::debug!("rearmed {} pending inbound slots", rearmed);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(rearmed),
        }
    }

    /// Stop accepting work.
    ///
    /// Submits fail with [`Error::ShuttingDown`], receives are no longer
    /// reposted, and threads blocked in [`Communicator::borrow`] return
    /// `None`.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            if let Some(pool) = &self.pool {
                pool.close();
            }
            log::debug!("communicator shutting down");
        }
    }

    /// Whether [`Communicator::shutdown`] was called or the fabric lost its
    /// connection.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire) || !self.fabric.is_connected()
    }

    /// Shut down and release the region.
    ///
    /// Does not wait for outstanding operations.
    pub fn teardown(self) {
        self.shutdown();
        let outstanding = self.outstanding_slots();
        if outstanding > 0 {
            log::debug!("tearing down with {} operations outstanding", outstanding);
        }
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Slots per direction.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.num_slots
    }

    /// Whether templates were prepared for `kind`.
    #[inline]
    pub fn supports(&self, kind: OpKind) -> bool {
        self.templates.supports(kind)
    }

    /// Free outbound slots.
    pub fn free_slots(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.free_count())
    }

    /// Outbound slots borrowed or submitted.
    pub fn in_use_slots(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.in_use_count())
    }

    /// Outbound slots posted and awaiting completion.
    pub fn outstanding_slots(&self) -> usize {
        count_set(&self.outstanding)
    }

    /// Free and in-use outbound slots, read together.
    pub fn slot_counts(&self) -> (usize, usize) {
        self.pool.as_ref().map_or((0, 0), |p| p.counts())
    }

    /// Inbound slots with a receive posted.
    pub fn armed_slots(&self) -> usize {
        count_set(&self.armed)
    }

    /// Inbound slots whose repost failed. See [`Communicator::rearm_pending`].
    pub fn unarmed_slots(&self) -> usize {
        self.unarmed_count.load(Ordering::Acquire)
    }

    /// Threads blocked waiting for an outbound slot.
    pub fn waiters(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.waiters())
    }

    pub fn region(&self) -> &RegisteredRegion {
        &self.region
    }

    /// Remote key peers use to address this communicator's region.
    pub fn rkey(&self) -> u32 {
        self.region.rkey()
    }

    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    /// Take the slot's outstanding operation for a completion.
    ///
    /// False if nothing was posted on the slot.
    pub(crate) fn claim(&self, direction: Direction, slot: SlotId) -> bool {
        let flags = match direction {
            Direction::Outbound => &self.outstanding,
            Direction::Inbound => &self.armed,
        };
        flags
            .get(slot)
            .is_some_and(|f| f.swap(false, Ordering::AcqRel))
    }

    pub(crate) fn release_outbound(&self, slot: SlotId) {
        if let Some(pool) = &self.pool {
            match pool.release(slot) {
                Ok(()) => log::trace!("released slot {}", slot),
                Err(e) => log::error!("release of outbound slot failed: {}", e),
            }
        }
    }

    /// Repost the receive for `slot`, unless shutting down.
    ///
    /// A failed post leaves the slot pending for
    /// [`Communicator::rearm_pending`].
    pub(crate) fn rearm(&self, slot: SlotId) {
        if slot >= self.armed.len() {
            log::error!("rearm of unknown inbound slot {}", slot);
            return;
        }
        if let Err(e) = self.post_receive(slot) {
            log::error!("rearm of inbound slot {} failed, left pending: {}", slot, e);
            self.defer_rearm(slot);
        }
    }

    /// Post the receive template for `slot`. `Ok(false)` if shutting down.
    fn post_receive(&self, slot: SlotId) -> Result<bool> {
        if self.is_shutting_down() {
            log::debug!("shutting down, inbound slot {} left unarmed", slot);
            return Ok(false);
        }
        let flag = self.armed.get(slot).ok_or(Error::InvalidSlot(slot))?;
        flag.store(true, Ordering::Release);
        if let Err(e) = self.templates.submit(
            self.fabric.as_ref(),
            slot,
            OpKind::Recv,
            self.config.slot_size,
        ) {
            flag.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    fn defer_rearm(&self, slot: SlotId) {
        if let Some(pending) = self.unarmed.get(slot) {
            if !pending.swap(true, Ordering::AcqRel) {
                self.unarmed_count.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Return a slot whose completion could not be routed normally.
    pub(crate) fn recover(&self, direction: Direction, slot: SlotId) {
        match direction {
            Direction::Outbound => self.release_outbound(slot),
            Direction::Inbound => self.rearm(slot),
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        log::debug!("communicator torn down");
    }
}

fn count_set(flags: &[AtomicBool]) -> usize {
    flags.iter().filter(|f| f.load(Ordering::Acquire)).count()
}

/// Exclusive custody of one outbound slot.
///
/// Dropping the handle returns the slot to the pool; submitting it hands
/// custody to the in-flight operation until its completion is handled.
pub struct BorrowedSlot<'a> {
    comm: &'a Communicator,
    id: SlotId,
    kind: OpKind,
    /// Bytes appended with [`BorrowedSlot::write`].
    written: usize,
}

impl<'a> BorrowedSlot<'a> {
    pub(crate) fn adopt(comm: &'a Communicator, id: SlotId, kind: OpKind) -> Self {
        Self {
            comm,
            id,
            kind,
            written: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> SlotId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Size of the slot buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.comm.config.slot_size
    }

    /// Remote target of this slot's template, for one-sided kinds.
    pub fn remote(&self) -> Option<RemoteLocation> {
        self.comm
            .templates
            .get(self.kind, self.id)
            .and_then(|wr| wr.remote())
    }

    pub fn buf(&self) -> &[u8] {
        // Safety: this handle holds exclusive custody of the slot.
        unsafe {
            self.comm
                .region
                .slice(Direction::Outbound, self.id)
                .unwrap_or_default()
        }
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        // Safety: this handle holds exclusive custody of the slot.
        unsafe {
            self.comm
                .region
                .slice_mut(Direction::Outbound, self.id)
                .unwrap_or_default()
        }
    }

    /// Append `data` after the bytes already written.
    ///
    /// # Errors
    /// [`Error::LengthExceedsSlot`] if it does not fit; nothing is written.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let end = self.written + data.len();
        if end > self.capacity() {
            return Err(Error::LengthExceedsSlot {
                len: end,
                slot_size: self.capacity(),
            });
        }
        let start = self.written;
        self.buf_mut()[start..end].copy_from_slice(data);
        self.written = end;
        Ok(())
    }

    /// Bytes appended so far.
    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Forget what was written.
    #[inline]
    pub fn clear(&mut self) {
        self.written = 0;
    }

    /// Post the slot with `length` bytes. See [`Communicator::submit`].
    pub fn submit(self, length: usize) -> std::result::Result<(), SubmitError<'a>> {
        let comm = self.comm;
        comm.submit(self, length)
    }

    /// Post the slot with the bytes appended by [`BorrowedSlot::write`].
    pub fn submit_written(self) -> std::result::Result<(), SubmitError<'a>> {
        let length = self.written;
        self.submit(length)
    }

    /// Return the slot to the pool.
    pub fn release(self) {}
}

impl Drop for BorrowedSlot<'_> {
    fn drop(&mut self) {
        self.comm.release_outbound(self.id);
    }
}

impl fmt::Debug for BorrowedSlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedSlot")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("written", &self.written)
            .finish()
    }
}

/// A submit that did not reach the fabric.
///
/// Custody of the slot comes back with the error.
#[derive(Debug, thiserror::Error)]
#[error("submit failed: {error}")]
pub struct SubmitError<'a> {
    slot: BorrowedSlot<'a>,
    #[source]
    error: Error,
}

impl<'a> SubmitError<'a> {
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Whether submitting the same slot again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    /// Take the slot back, e.g. to retry.
    pub fn into_slot(self) -> BorrowedSlot<'a> {
        self.slot
    }

    pub fn into_parts(self) -> (BorrowedSlot<'a>, Error) {
        (self.slot, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackFabric;
    use crate::types::OpKinds;

    fn send_only(n: usize) -> (Arc<LoopbackFabric>, Communicator) {
        let fabric = Arc::new(LoopbackFabric::new());
        let config = CommConfig::new()
            .with_kinds(OpKinds::SEND)
            .with_num_slots(n)
            .with_slot_size(64);
        let comm = Communicator::builder(config)
            .on_send(|_| {})
            .initialize(fabric.clone())
            .unwrap();
        (fabric, comm)
    }

    #[test]
    fn test_borrow_rejects_disabled_and_inbound_kinds() {
        let (_fabric, comm) = send_only(2);
        assert!(matches!(
            comm.try_borrow(OpKind::RdmaWrite),
            Err(Error::UnsupportedKind(OpKind::RdmaWrite))
        ));
        assert!(matches!(
            comm.try_borrow(OpKind::Recv),
            Err(Error::UnsupportedKind(OpKind::Recv))
        ));
    }

    #[test]
    fn test_write_appends_and_bounds() {
        let (_fabric, comm) = send_only(1);
        let mut slot = comm.try_borrow(OpKind::Send).unwrap().unwrap();
        slot.write(b"abc").unwrap();
        slot.write(b"de").unwrap();
        assert_eq!(slot.written(), 5);
        assert_eq!(&slot.buf()[..5], b"abcde");
        assert!(slot.write(&[0u8; 60]).is_err());
        assert_eq!(slot.written(), 5);
    }

    #[test]
    fn test_written_length_resets_on_release() {
        let (_fabric, comm) = send_only(1);
        let mut slot = comm.try_borrow(OpKind::Send).unwrap().unwrap();
        slot.write(b"payload").unwrap();
        slot.release();
        let slot = comm.try_borrow(OpKind::Send).unwrap().unwrap();
        assert_eq!(slot.id(), 0);
        assert_eq!(slot.written(), 0);
    }

    #[test]
    fn test_submit_marks_outstanding_until_completion() {
        let (fabric, comm) = send_only(2);
        let mut slot = comm.try_borrow(OpKind::Send).unwrap().unwrap();
        slot.write(b"ping").unwrap();
        slot.submit_written().unwrap();

        assert_eq!(comm.outstanding_slots(), 1);
        assert_eq!(comm.in_use_slots(), 1);
        let event = fabric.complete_next_send().unwrap();
        assert_eq!(event.byte_len, 4);
        comm.on_completion_event(event);
        assert_eq!(comm.outstanding_slots(), 0);
        assert_eq!(comm.free_slots(), 2);

        // A duplicate completion is dropped, not double-released.
        comm.on_completion_event(event);
        assert_eq!(comm.free_slots(), 2);
    }

    #[test]
    fn test_submit_length_checked_before_posting() {
        let (fabric, comm) = send_only(1);
        let slot = comm.try_borrow(OpKind::Send).unwrap().unwrap();
        let err = slot.submit(65).unwrap_err();
        assert!(matches!(err.error(), Error::LengthExceedsSlot { .. }));
        assert!(!err.is_retryable());
        assert_eq!(fabric.post_count(), 0);
        assert_eq!(comm.outstanding_slots(), 0);
        drop(err);
        assert_eq!(comm.free_slots(), 1);
    }

    #[test]
    fn test_pending_rearm_discarded_after_shutdown() {
        let fabric = Arc::new(LoopbackFabric::new());
        let comm = Communicator::builder(CommConfig::two_sided(2, 32))
            .on_recv(|_| {})
            .initialize(fabric.clone())
            .unwrap();

        let event = fabric.deliver(b"x").unwrap();
        fabric.fail_posts(true);
        comm.on_completion_event(event);
        assert_eq!(comm.unarmed_slots(), 1);

        comm.shutdown();
        fabric.fail_posts(false);
        assert_eq!(comm.rearm_pending().unwrap(), 0);
        assert_eq!(comm.unarmed_slots(), 0);
        assert_eq!(comm.armed_slots(), 1);
        assert_eq!(fabric.pending_recvs(), 1);
    }

    #[test]
    fn test_foreign_slot_rejected() {
        let (_fa, a) = send_only(1);
        let (_fb, b) = send_only(1);
        let slot = a.try_borrow(OpKind::Send).unwrap().unwrap();
        let err = b.submit(slot, 1).unwrap_err();
        assert!(matches!(err.error(), Error::InvalidSlot(0)));
    }
}
