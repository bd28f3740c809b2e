//! Common test utilities for rdmacomm integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rdmacomm::{
    CommConfig, Communicator, Direction, FailedCompletion, InboundCompletion, LoopbackFabric,
    OpKind, OutboundCompletion, SlotId, WcStatus,
};

/// What a reaction observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Completed { kind: OpKind, slot: SlotId },
    Received { slot: SlotId, data: Vec<u8> },
    Failed {
        direction: Direction,
        slot: SlotId,
        status: WcStatus,
    },
}

/// A communicator over a loopback fabric whose reactions record what they
/// see.
pub struct TestComm {
    pub fabric: Arc<LoopbackFabric>,
    pub comm: Communicator,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl TestComm {
    pub fn new(config: CommConfig) -> Self {
        let fabric = Arc::new(LoopbackFabric::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let comm = Communicator::builder(config)
            .on_send(record_outbound(seen.clone()))
            .on_rdma_write(record_outbound(seen.clone()))
            .on_rdma_read(record_outbound(seen.clone()))
            .on_recv(record_inbound(seen.clone()))
            .on_error(record_failed(seen.clone()))
            .initialize(fabric.clone())
            .unwrap();

        Self { fabric, comm, seen }
    }

    /// Snapshot of the recorded observations.
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    /// Complete every pending outbound post. Returns how many were routed.
    pub fn pump_sends(&self) -> usize {
        let mut routed = 0;
        while let Some(event) = self.fabric.complete_next_send() {
            self.comm.on_completion_event(event);
            routed += 1;
        }
        routed
    }

    /// Deliver `payload` to the oldest posted receive and route it.
    pub fn deliver(&self, payload: &[u8]) -> bool {
        match self.fabric.deliver(payload) {
            Some(event) => {
                self.comm.on_completion_event(event);
                true
            }
            None => false,
        }
    }

    /// Pool invariant: every outbound slot is either free or in use.
    pub fn assert_accounted(&self) {
        let (free, in_use) = self.comm.slot_counts();
        assert_eq!(free + in_use, self.comm.capacity());
    }
}

fn record_outbound(
    seen: Arc<Mutex<Vec<Seen>>>,
) -> impl Fn(OutboundCompletion<'_>) + Send + Sync + 'static {
    move |done| {
        seen.lock().push(Seen::Completed {
            kind: done.kind(),
            slot: done.slot(),
        })
    }
}

fn record_inbound(
    seen: Arc<Mutex<Vec<Seen>>>,
) -> impl Fn(InboundCompletion<'_>) + Send + Sync + 'static {
    move |msg| {
        seen.lock().push(Seen::Received {
            slot: msg.slot(),
            data: msg.data().to_vec(),
        })
    }
}

fn record_failed(
    seen: Arc<Mutex<Vec<Seen>>>,
) -> impl Fn(FailedCompletion<'_>) + Send + Sync + 'static {
    move |failed| {
        seen.lock().push(Seen::Failed {
            direction: failed.direction(),
            slot: failed.slot(),
            status: failed.status(),
        })
    }
}

/// Poll `cond` until it holds or `timeout_ms` passes.
pub fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
