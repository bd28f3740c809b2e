//! Slot custody: borrowing, submitting, releasing and blocking.
//!
//! Run with:
//! ```bash
//! cargo test --package rdmacomm --test slot_lifecycle
//! ```

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rdmacomm::{CommConfig, Error, OpKind, OpKinds, RemoteLocation};

use common::{wait_until, TestComm};

fn send_only(num_slots: usize, slot_size: usize) -> TestComm {
    TestComm::new(
        CommConfig::new()
            .with_kinds(OpKinds::SEND)
            .with_num_slots(num_slots)
            .with_slot_size(slot_size),
    )
}

// =============================================================================
// Non-blocking borrow
// =============================================================================

#[test]
fn test_three_slot_scenario() {
    let t = send_only(3, 64);
    let comm = &t.comm;

    let s0 = comm.try_borrow(OpKind::Send).unwrap().unwrap();
    let s1 = comm.try_borrow(OpKind::Send).unwrap().unwrap();
    let s2 = comm.try_borrow(OpKind::Send).unwrap().unwrap();
    assert_eq!((s0.id(), s1.id(), s2.id()), (0, 1, 2));
    assert!(comm.try_borrow(OpKind::Send).unwrap().is_none());
    t.assert_accounted();

    s1.release();
    let again = comm.try_borrow(OpKind::Send).unwrap().unwrap();
    assert_eq!(again.id(), 1);
    t.assert_accounted();
}

#[test]
fn test_single_slot_cycles_on_id_zero() {
    let t = send_only(1, 8);
    for _ in 0..1000 {
        let slot = t.comm.borrow(OpKind::Send).unwrap().unwrap();
        assert_eq!(slot.id(), 0);
        drop(slot);
    }
    assert_eq!(t.comm.free_slots(), 1);
}

#[test]
fn test_fresh_pool_hands_out_ids_in_order() {
    let n = 16;
    let t = send_only(n, 32);
    let slots: Vec<_> = (0..n)
        .map(|_| t.comm.try_borrow(OpKind::Send).unwrap().unwrap())
        .collect();
    assert_eq!(slots.iter().map(|s| s.id()).collect::<Vec<_>>(), (0..n).collect::<Vec<_>>());
    assert!(t.comm.try_borrow(OpKind::Send).unwrap().is_none());
    assert_eq!(t.comm.in_use_slots(), n);
    drop(slots);
    assert_eq!(t.comm.free_slots(), n);
}

#[test]
fn test_write_and_read_kinds_share_outbound_slots() {
    let remote = RemoteLocation::new(0x4000_0000, 0x77);
    let config = CommConfig::one_sided(OpKind::RdmaWrite, remote, 2, 64)
        .with_kinds(OpKinds::RDMA_WRITE | OpKinds::RDMA_READ)
        .with_remote(OpKind::RdmaRead, remote);
    let t = TestComm::new(config);

    let w = t.comm.try_borrow(OpKind::RdmaWrite).unwrap().unwrap();
    let r = t.comm.try_borrow(OpKind::RdmaRead).unwrap().unwrap();
    assert_eq!((w.id(), r.id()), (0, 1));
    assert_eq!(r.remote(), Some(RemoteLocation::new(0x4000_0000 + 64, 0x77)));
    assert!(t.comm.try_borrow(OpKind::RdmaWrite).unwrap().is_none());
    assert_eq!(t.comm.armed_slots(), 0);
}

// =============================================================================
// Submit
// =============================================================================

#[test]
fn test_submit_posts_patched_template() {
    let t = send_only(2, 64);
    let mut slot = t.comm.try_borrow(OpKind::Send).unwrap().unwrap();
    slot.write(b"hello").unwrap();
    let addr = slot.buf().as_ptr() as u64;
    slot.submit_written().unwrap();

    let posted = t.fabric.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].kind, OpKind::Send);
    assert_eq!(posted[0].slot, 0);
    assert_eq!(posted[0].sge.addr, addr);
    assert_eq!(posted[0].sge.length, 5);
    assert_eq!(posted[0].sge.lkey, t.comm.region().lkey());

    // Submitted slots stay in use until their completion is routed.
    assert_eq!(t.comm.in_use_slots(), 1);
    assert_eq!(t.pump_sends(), 1);
    assert_eq!(t.comm.free_slots(), 2);
    t.assert_accounted();
}

#[test]
fn test_transport_failure_returns_slot() {
    let t = send_only(2, 64);
    t.fabric.fail_posts(true);

    let slot = t.comm.try_borrow(OpKind::Send).unwrap().unwrap();
    let err = slot.submit(10).unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err.error(),
        Error::Transport {
            kind: OpKind::Send,
            slot: 0,
            ..
        }
    ));
    assert_eq!(t.comm.outstanding_slots(), 0);

    // Still borrowed; retry once the fabric recovers.
    let slot = err.into_slot();
    assert_eq!(slot.id(), 0);
    assert_eq!(t.comm.in_use_slots(), 1);
    t.fabric.fail_posts(false);
    slot.submit(10).unwrap();
    assert_eq!(t.fabric.post_count(), 1);
}

#[test]
fn test_submit_after_shutdown_fails() {
    let t = send_only(2, 64);
    let slot = t.comm.try_borrow(OpKind::Send).unwrap().unwrap();
    t.comm.shutdown();
    assert!(t.comm.is_shutting_down());

    let (slot, error) = slot.submit(1).unwrap_err().into_parts();
    assert!(matches!(error, Error::ShuttingDown));
    assert_eq!(t.fabric.post_count(), 0);
    drop(slot);
    t.assert_accounted();

    // The pool is closed as well.
    assert!(t.comm.try_borrow(OpKind::Send).unwrap().is_none());
    assert!(t.comm.borrow(OpKind::Send).unwrap().is_none());
}

#[test]
fn test_submit_on_disconnected_fabric_fails() {
    let t = send_only(1, 64);
    let slot = t.comm.try_borrow(OpKind::Send).unwrap().unwrap();
    t.fabric.disconnect();
    assert!(t.comm.is_shutting_down());
    let err = slot.submit(1).unwrap_err();
    assert!(matches!(err.error(), Error::ShuttingDown));
}

// =============================================================================
// Blocking borrow
// =============================================================================

#[test]
fn test_release_wakes_exactly_one_waiter_with_that_id() {
    let n_waiters = 4;
    let t = send_only(2, 64);
    let comm = &t.comm;
    let held: Vec<_> = (0..2)
        .map(|_| comm.try_borrow(OpKind::Send).unwrap().unwrap())
        .collect();

    let woken = Mutex::new(Vec::new());
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..n_waiters {
            s.spawn(|| {
                if let Some(slot) = comm.borrow(OpKind::Send).unwrap() {
                    woken.lock().push(slot.id());
                    while !done.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            });
        }
        assert!(wait_until(5000, || comm.waiters() == n_waiters));

        let mut held = held.into_iter();
        let released = held.next().unwrap();
        assert_eq!(released.id(), 0);
        released.release();

        assert!(wait_until(5000, || woken.lock().len() == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*woken.lock(), vec![0]);
        assert_eq!(comm.waiters(), n_waiters - 1);

        // Unblock everyone else.
        comm.shutdown();
        done.store(true, Ordering::Release);
        drop(held);
    });

    assert_eq!(comm.waiters(), 0);
    t.assert_accounted();
}

#[test]
fn test_waiters_served_in_arrival_order() {
    let t = send_only(1, 64);
    let comm = &t.comm;
    let first = comm.try_borrow(OpKind::Send).unwrap().unwrap();

    let order = Mutex::new(Vec::new());
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for name in 0..3usize {
            let order = &order;
            let done = &done;
            s.spawn(move || {
                let slot = comm.borrow(OpKind::Send).unwrap().unwrap();
                order.lock().push(name);
                while !done.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
                drop(slot);
            });
            // Next waiter only queues up after this one is blocked.
            assert!(wait_until(5000, || comm.waiters() == name + 1));
        }

        first.release();
        assert!(wait_until(5000, || order.lock().len() == 1));
        assert_eq!(*order.lock(), vec![0]);
        // Let each holder hand the slot on to the next in line.
        done.store(true, Ordering::Release);
        assert!(wait_until(5000, || order.lock().len() == 3));
    });

    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert_eq!(t.comm.free_slots(), 1);
}

#[test]
fn test_shutdown_unblocks_waiters() {
    let t = send_only(1, 64);
    let comm = &t.comm;
    let _held = comm.try_borrow(OpKind::Send).unwrap().unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| comm.borrow(OpKind::Send).unwrap().map(|slot| slot.id()));
        assert!(wait_until(5000, || comm.waiters() == 1));
        comm.shutdown();
        assert_eq!(waiter.join().unwrap(), None);
    });
}

// =============================================================================
// Concurrent submit and delivery
// =============================================================================

#[test]
fn test_submitters_and_delivery_thread_keep_slots_accounted() {
    const SUBMITTERS: usize = 6;
    const PER_SUBMITTER: usize = 50;
    const TOTAL: usize = SUBMITTERS * PER_SUBMITTER;

    let t = send_only(4, 64);
    let t = &t;

    thread::scope(|s| {
        for submitter in 0..SUBMITTERS {
            s.spawn(move || {
                for i in 0..PER_SUBMITTER {
                    let mut slot = t.comm.borrow(OpKind::Send).unwrap().unwrap();
                    slot.write(&[submitter as u8, i as u8]).unwrap();
                    slot.submit_written().unwrap();
                }
            });
        }

        // The fabric's delivery thread.
        s.spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut routed = 0;
            while routed < TOTAL {
                match t.fabric.complete_next_send() {
                    Some(event) => {
                        t.comm.on_completion_event(event);
                        routed += 1;
                    }
                    None => {
                        if Instant::now() > deadline {
                            // Unblock the submitters before failing.
                            t.comm.shutdown();
                            panic!("only {} of {} completions routed", routed, TOTAL);
                        }
                        thread::yield_now();
                    }
                }
                t.assert_accounted();
            }
        });
    });

    assert_eq!(t.fabric.post_count(), TOTAL);
    assert_eq!(t.seen().len(), TOTAL);
    assert_eq!(t.comm.free_slots(), 4);
    assert_eq!(t.comm.outstanding_slots(), 0);
    assert_eq!(t.comm.waiters(), 0);
    t.assert_accounted();
}
