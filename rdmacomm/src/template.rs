//! Prepared work-request templates.
//!
//! Every (slot, kind) pair gets one descriptor, built once when the
//! communicator initializes and bound to the slot's buffer address, the
//! region's lkey and, for one-sided kinds, the remote target. Posting only
//! patches the SGE length and hands the same descriptor to the fabric again,
//! so the hot path neither allocates nor rebuilds anything.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::CommConfig;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::region::RegisteredRegion;
use crate::types::{encode_wr_id, OpKind, RemoteLocation, SlotId};

/// Scatter/gather element as seen by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// A reusable descriptor bound to one slot.
///
/// Everything except the SGE length is fixed at construction. The length is
/// atomic so that the holder of the slot can patch it through a shared
/// reference; slot custody guarantees there is only ever one writer.
#[derive(Debug)]
pub struct WorkRequest {
    wr_id: u64,
    kind: OpKind,
    slot: SlotId,
    addr: u64,
    length: AtomicU32,
    lkey: u32,
    remote: Option<RemoteLocation>,
}

impl WorkRequest {
    fn new(
        kind: OpKind,
        slot: SlotId,
        addr: u64,
        capacity: u32,
        lkey: u32,
        remote: Option<RemoteLocation>,
    ) -> Self {
        Self {
            wr_id: encode_wr_id(kind.direction(), slot),
            kind,
            slot,
            addr,
            length: AtomicU32::new(capacity),
            lkey,
            remote,
        }
    }

    /// Work-request id reported back in the completion.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    #[inline]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Outbound descriptors always request a completion.
    #[inline]
    pub fn signaled(&self) -> bool {
        true
    }

    /// Current SGE.
    #[inline]
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.addr,
            length: self.length.load(Ordering::Acquire),
            lkey: self.lkey,
        }
    }

    /// Remote target for one-sided kinds, already offset for this slot.
    #[inline]
    pub fn remote(&self) -> Option<RemoteLocation> {
        self.remote
    }

    #[inline]
    fn set_length(&self, length: u32) {
        self.length.store(length, Ordering::Release);
    }
}

/// Descriptors for every enabled (slot, kind) pair.
pub struct TemplateCache {
    slot_size: usize,
    /// Indexed by `OpKind::index()`, then slot. Disabled kinds are empty.
    table: [Box<[WorkRequest]>; 4],
}

impl TemplateCache {
    /// Build every template for `config` over `region`.
    ///
    /// Nothing is posted; see [`TemplateCache::arm_all`].
    pub fn build(region: &RegisteredRegion, config: &CommConfig) -> Result<Self> {
        let capacity = u32::try_from(region.slot_size()).map_err(|_| {
            Error::InvalidConfig(format!("slot_size {} exceeds u32", region.slot_size()))
        })?;
        let mut table: [Box<[WorkRequest]>; 4] = Default::default();

        for kind in config.kinds.kinds() {
            let direction = kind.direction();
            let remote_base = match (kind.is_remote_addressed(), config.remote_for(kind)) {
                (true, None) => {
                    return Err(Error::InvalidConfig(format!(
                        "{:?} enabled without a remote location",
                        kind
                    )));
                }
                (_, remote) => remote,
            };
            let mut templates = Vec::with_capacity(region.num_slots());
            for slot in 0..region.num_slots() {
                let addr = region
                    .slice_addr(direction, slot)
                    .ok_or(Error::InvalidSlot(slot))?;
                let remote = remote_base.map(|r| RemoteLocation {
                    addr: r.addr + (slot * region.slot_size()) as u64,
                    rkey: r.rkey,
                });
                templates.push(WorkRequest::new(
                    kind,
                    slot,
                    addr,
                    capacity,
                    region.lkey(),
                    remote,
                ));
            }
            table[kind.index()] = templates.into_boxed_slice();
        }

        Ok(Self {
            slot_size: region.slot_size(),
            table,
        })
    }

    /// Build the templates and post every receive template once.
    pub fn initialize(
        region: &RegisteredRegion,
        config: &CommConfig,
        fabric: &dyn Fabric,
    ) -> Result<Self> {
        let cache = Self::build(region, config)?;
        cache.arm_all(fabric)?;
        Ok(cache)
    }

    /// Post every receive template.
    ///
    /// Stops at the first failure. Receives already posted stay posted until
    /// the region is deregistered, which discards them.
    pub fn arm_all(&self, fabric: &dyn Fabric) -> Result<()> {
        let total = self.templates(OpKind::Recv).len();
        for slot in 0..total {
            if let Err(e) = self.submit(fabric, slot, OpKind::Recv, self.slot_size) {
                log::error!("armed {} of {} receives before failing", slot, total);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Templates for one kind, indexed by slot.
    #[inline]
    pub fn templates(&self, kind: OpKind) -> &[WorkRequest] {
        &self.table[kind.index()]
    }

    /// Template for `(slot, kind)`.
    #[inline]
    pub fn get(&self, kind: OpKind, slot: SlotId) -> Option<&WorkRequest> {
        self.table[kind.index()].get(slot)
    }

    /// Whether templates exist for `kind`.
    #[inline]
    pub fn supports(&self, kind: OpKind) -> bool {
        !self.table[kind.index()].is_empty()
    }

    /// Patch the template's length and post it.
    ///
    /// The caller must hold custody of `slot`.
    pub fn submit(
        &self,
        fabric: &dyn Fabric,
        slot: SlotId,
        kind: OpKind,
        length: usize,
    ) -> Result<()> {
        if !self.supports(kind) {
            return Err(Error::UnsupportedKind(kind));
        }
        let wr = self.get(kind, slot).ok_or(Error::InvalidSlot(slot))?;
        if length > self.slot_size {
            return Err(Error::LengthExceedsSlot {
                len: length,
                slot_size: self.slot_size,
            });
        }
        // slot_size fits in u32 (checked in build).
        wr.set_length(length as u32);

        let posted = match kind {
            OpKind::Recv => fabric.post_recv(wr),
            OpKind::Send | OpKind::RdmaWrite | OpKind::RdmaRead => fabric.post_send(wr),
        };
        posted.map_err(|source| Error::Transport { kind, slot, source })?;
        log::trace!("posted {:?} slot={} len={}", kind, slot, length);
        Ok(())
    }
}
