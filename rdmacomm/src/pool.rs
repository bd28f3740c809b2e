//! Slot pool.
//!
//! Tracks which slot ids of one direction are free and hands out exclusive
//! custody of them. Blocked acquirers are served strictly in arrival order:
//! each waiter draws a ticket and only the ticket at the head of the line
//! may take a released id.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::types::{Direction, SlotId};

struct PoolState {
    /// Free ids, in release order.
    free: VecDeque<SlotId>,
    /// Custody flag per id.
    held: Box<[bool]>,
    /// Next ticket handed to a blocking acquirer.
    next_ticket: u64,
    /// Ticket currently allowed to take a free id.
    serving: u64,
    /// Threads currently parked in `acquire_blocking`.
    blocked: usize,
    /// Set once the owner shuts down; waiters leave empty-handed.
    closed: bool,
}

impl PoolState {
    /// Tickets drawn but not yet served.
    #[inline]
    fn queued(&self) -> u64 {
        self.next_ticket - self.serving
    }

    #[inline]
    fn take(&mut self) -> Option<SlotId> {
        let id = self.free.pop_front()?;
        self.held[id] = true;
        Some(id)
    }
}

/// Free-list of slot ids for one direction.
pub struct SlotPool {
    direction: Direction,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl SlotPool {
    /// Create a pool with ids `0..capacity`, all free.
    pub fn new(direction: Direction, capacity: usize) -> Self {
        Self {
            direction,
            capacity,
            state: Mutex::new(PoolState {
                free: (0..capacity).collect(),
                held: vec![false; capacity].into_boxed_slice(),
                next_ticket: 0,
                serving: 0,
                blocked: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Direction this pool serves.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Total number of ids.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a free id, blocking until one is released.
    ///
    /// Waiters are served first come, first served.
    ///
    /// # Returns
    /// `None` if the pool is empty-capacity or has been closed.
    pub fn acquire_blocking(&self) -> Option<SlotId> {
        if self.capacity == 0 {
            return None;
        }
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        if state.queued() == 0 {
            if let Some(id) = state.take() {
                return Some(id);
            }
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.blocked += 1;
        let acquired = loop {
            if state.closed {
                break None;
            }
            if state.serving == ticket {
                if let Some(id) = state.take() {
                    state.serving += 1;
                    // More ids may be waiting for the next ticket holder.
                    if state.queued() > 0 && !state.free.is_empty() {
                        self.available.notify_all();
                    }
                    break Some(id);
                }
            }
            self.available.wait(&mut state);
        };
        state.blocked -= 1;
        acquired
    }

    /// Take a free id without blocking.
    ///
    /// Does not jump ahead of blocked waiters: if anyone is waiting the
    /// released ids are theirs.
    pub fn try_acquire(&self) -> Option<SlotId> {
        let mut state = self.state.lock();
        if state.closed || state.queued() > 0 {
            return None;
        }
        state.take()
    }

    /// Return a held id to the free set.
    ///
    /// # Errors
    /// [`Error::InvalidSlot`] for ids out of range, [`Error::SlotNotHeld`]
    /// if the id is already free.
    pub fn release(&self, id: SlotId) -> Result<()> {
        let mut state = self.state.lock();
        match state.held.get(id).copied() {
            None => return Err(Error::InvalidSlot(id)),
            Some(false) => return Err(Error::SlotNotHeld(id)),
            Some(true) => {}
        }
        state.held[id] = false;
        state.free.push_back(id);
        // The check and the wake happen under the same lock as acquire's
        // wait, so a waiter cannot miss this release.
        if state.queued() > 0 {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Close the pool: blocked and future acquirers get `None`.
    ///
    /// Releases are still accepted so that outstanding custody can unwind.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
    }

    /// Whether [`SlotPool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether `id` is currently held.
    pub fn is_held(&self, id: SlotId) -> bool {
        self.state.lock().held.get(id).copied().unwrap_or(false)
    }

    /// Number of free ids.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of ids currently held (borrowed or submitted).
    pub fn in_use_count(&self) -> usize {
        let state = self.state.lock();
        self.capacity - state.free.len()
    }

    /// Free and held counts from one snapshot.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        let free = state.free.len();
        (free, self.capacity - free)
    }

    /// Number of threads blocked in [`SlotPool::acquire_blocking`].
    pub fn waiters(&self) -> usize {
        self.state.lock().blocked
    }
}
