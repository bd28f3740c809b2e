//! Registered communication region.
//!
//! One page-aligned block is allocated and registered once. It is carved
//! into fixed-size slices: the outbound set first, then the inbound set.
//! Registering a single region instead of one per buffer keeps the NIC's
//! translation and protection tables small.

use std::sync::Arc;

use crate::config::CommConfig;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, MemoryKey};
use crate::types::{Direction, SlotId};

/// Alignment of the region base.
pub const PAGE_SIZE: usize = 4096;

/// The registered block and its slice layout.
pub struct RegisteredRegion {
    /// Base of the allocation.
    buffer: *mut u8,
    /// Total size in bytes.
    len: usize,
    /// Size of each slice.
    slot_size: usize,
    /// Slices per direction.
    num_slots: usize,
    /// Start addresses of outbound slices (empty if unused).
    outbound_addrs: Box<[u64]>,
    /// Start addresses of inbound slices (empty if unused).
    inbound_addrs: Box<[u64]>,
    key: MemoryKey,
    fabric: Arc<dyn Fabric>,
}

impl RegisteredRegion {
    /// Allocate and register a region sized for `config`.
    ///
    /// Registration failure is reported as [`Error::Registration`]; the
    /// allocation is released before returning.
    pub fn allocate(config: &CommConfig, fabric: Arc<dyn Fabric>) -> Result<Self> {
        config.validate()?;
        let slot_size = config.slot_size;
        let num_slots = config.num_slots;
        let len = config.region_len();

        let buffer = unsafe {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, len);
            if ret != 0 {
                return Err(Error::Registration(std::io::Error::from_raw_os_error(ret)));
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, len);
            ptr as *mut u8
        };

        let key = match unsafe { fabric.register_region(buffer, len) } {
            Ok(key) => key,
            Err(e) => {
                unsafe { libc::free(buffer as *mut libc::c_void) };
                return Err(Error::Registration(e));
            }
        };

        let base = buffer as u64;
        let block = (slot_size * num_slots) as u64;
        let slice_addrs = |start: u64| -> Box<[u64]> {
            (0..num_slots)
                .map(|i| start + (i * slot_size) as u64)
                .collect()
        };
        let outbound_addrs = if config.kinds.has_outbound() {
            slice_addrs(base)
        } else {
            Box::default()
        };
        let inbound_addrs = match (config.kinds.has_inbound(), config.kinds.has_outbound()) {
            (true, true) => slice_addrs(base + block),
            (true, false) => slice_addrs(base),
            (false, _) => Box::default(),
        };

        log::debug!(
            "registered region: {} bytes at {:#x}, {} x {} B per direction, lkey={:#x}",
            len,
            base,
            num_slots,
            slot_size,
            key.lkey
        );

        Ok(Self {
            buffer,
            len,
            slot_size,
            num_slots,
            outbound_addrs,
            inbound_addrs,
            key,
            fabric,
        })
    }

    /// Capability key of the registration.
    #[inline]
    pub fn key(&self) -> MemoryKey {
        self.key
    }

    /// Local key placed in every descriptor.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.key.lkey
    }

    /// Remote key peers use to target this region.
    #[inline]
    pub fn rkey(&self) -> u32 {
        self.key.rkey
    }

    /// Base address of the region.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.buffer as u64
    }

    /// Total size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty. Never true for a validated config.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of each slice.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slices per direction.
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Whether the region carries slices for `direction`.
    #[inline]
    pub fn has(&self, direction: Direction) -> bool {
        !self.addrs(direction).is_empty()
    }

    #[inline]
    fn addrs(&self, direction: Direction) -> &[u64] {
        match direction {
            Direction::Outbound => &self.outbound_addrs,
            Direction::Inbound => &self.inbound_addrs,
        }
    }

    /// Recorded start address of a slice.
    ///
    /// # Returns
    /// `None` if the direction is absent or the id is out of bounds.
    #[inline]
    pub fn slice_addr(&self, direction: Direction, slot: SlotId) -> Option<u64> {
        self.addrs(direction).get(slot).copied()
    }

    /// Pointer to the start of a slice.
    #[inline]
    pub fn slice_ptr(&self, direction: Direction, slot: SlotId) -> Option<*mut u8> {
        self.slice_addr(direction, slot).map(|addr| addr as *mut u8)
    }

    /// View a slice.
    ///
    /// # Safety
    /// The caller must hold custody of the slot (or otherwise guarantee
    /// that nobody writes to the slice for the lifetime of the view).
    pub unsafe fn slice(&self, direction: Direction, slot: SlotId) -> Option<&[u8]> {
        let ptr = self.slice_ptr(direction, slot)?;
        Some(unsafe { std::slice::from_raw_parts(ptr, self.slot_size) })
    }

    /// Mutable view of a slice.
    ///
    /// # Safety
    /// The caller must hold exclusive custody of the slot.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, direction: Direction, slot: SlotId) -> Option<&mut [u8]> {
        let ptr = self.slice_ptr(direction, slot)?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, self.slot_size) })
    }
}

impl Drop for RegisteredRegion {
    fn drop(&mut self) {
        self.fabric.deregister_region(self.key);
        unsafe {
            libc::free(self.buffer as *mut libc::c_void);
        }
        log::debug!("deregistered region at {:#x}", self.buffer as u64);
    }
}

// Safety: the region owns its allocation. Slices are only dereferenced by
// whoever holds the slot's custody, which the slot pool makes exclusive.
unsafe impl Send for RegisteredRegion {}
unsafe impl Sync for RegisteredRegion {}
