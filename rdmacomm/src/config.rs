//! Configuration types for rdmacomm.

use crate::error::{Error, Result};
use crate::types::{OpKind, OpKinds, RemoteLocation};

/// Communicator configuration.
///
/// Fixed for the communicator's lifetime: the slot count and slot size
/// determine the registered region, and the enabled kinds determine which
/// templates are prepared.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Number of slots per direction.
    /// Default: 64
    pub num_slots: usize,
    /// Size of each slot buffer in bytes.
    /// Default: 4096
    pub slot_size: usize,
    /// Operation kinds to prepare templates for.
    /// Default: send + recv
    pub kinds: OpKinds,
    /// Remote target of RDMA WRITE templates.
    pub write_target: Option<RemoteLocation>,
    /// Remote source of RDMA READ templates.
    pub read_source: Option<RemoteLocation>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            num_slots: 64,
            slot_size: 4096,
            kinds: OpKinds::TWO_SIDED,
            write_target: None,
            read_source: None,
        }
    }
}

impl CommConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Two-sided messaging: send slots plus posted receives.
    pub fn two_sided(num_slots: usize, slot_size: usize) -> Self {
        Self::default()
            .with_num_slots(num_slots)
            .with_slot_size(slot_size)
            .with_kinds(OpKinds::TWO_SIDED)
    }

    /// One-sided access to a single remote window.
    ///
    /// `kind` must be [`OpKind::RdmaWrite`] or [`OpKind::RdmaRead`]. Debug
    /// builds panic on a two-sided kind; release builds ignore `remote`.
    pub fn one_sided(
        kind: OpKind,
        remote: RemoteLocation,
        num_slots: usize,
        slot_size: usize,
    ) -> Self {
        debug_assert!(
            kind.is_remote_addressed(),
            "one_sided() needs a remote-addressed kind, got {:?}",
            kind
        );
        Self::default()
            .with_num_slots(num_slots)
            .with_slot_size(slot_size)
            .with_kinds(kind.flag())
            .with_remote(kind, remote)
    }

    /// Set the number of slots per direction.
    pub fn with_num_slots(mut self, num_slots: usize) -> Self {
        self.num_slots = num_slots;
        self
    }

    /// Set the slot buffer size.
    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    /// Set the enabled operation kinds.
    pub fn with_kinds(mut self, kinds: OpKinds) -> Self {
        self.kinds = kinds;
        self
    }

    /// Bind the remote location for a remote-addressed kind.
    ///
    /// Ignored for kinds that do not address remote memory.
    pub fn with_remote(mut self, kind: OpKind, remote: RemoteLocation) -> Self {
        match kind {
            OpKind::RdmaWrite => self.write_target = Some(remote),
            OpKind::RdmaRead => self.read_source = Some(remote),
            OpKind::Send | OpKind::Recv => {}
        }
        self
    }

    /// Remote location bound to `kind`, if any.
    pub fn remote_for(&self, kind: OpKind) -> Option<RemoteLocation> {
        match kind {
            OpKind::RdmaWrite => self.write_target,
            OpKind::RdmaRead => self.read_source,
            OpKind::Send | OpKind::Recv => None,
        }
    }

    /// Whether the region carries an inbound slice set.
    pub fn has_inbound(&self) -> bool {
        self.kinds.has_inbound()
    }

    /// Bytes needed for the registered region.
    pub fn region_len(&self) -> usize {
        let sets = usize::from(self.kinds.has_outbound()) + usize::from(self.kinds.has_inbound());
        self.slot_size * self.num_slots * sets
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_slots == 0 {
            return Err(Error::InvalidConfig("num_slots cannot be 0".into()));
        }
        if self.slot_size == 0 {
            return Err(Error::InvalidConfig("slot_size cannot be 0".into()));
        }
        if self.slot_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "slot_size {} does not fit a 32-bit SGE length",
                self.slot_size
            )));
        }
        if self.kinds.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one operation kind must be enabled".into(),
            ));
        }
        let sets = usize::from(self.kinds.has_outbound()) + usize::from(self.kinds.has_inbound());
        if self
            .slot_size
            .checked_mul(self.num_slots)
            .and_then(|n| n.checked_mul(sets))
            .is_none()
        {
            return Err(Error::InvalidConfig("region size overflows usize".into()));
        }
        for kind in self.kinds.kinds().filter(|k| k.is_remote_addressed()) {
            if self.remote_for(kind).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "{:?} enabled without a remote location",
                    kind
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = CommConfig::new();
        assert!(config.validate().is_ok());
        assert!(config.has_inbound());
        assert_eq!(config.region_len(), 64 * 4096 * 2);
    }

    #[test]
    fn test_one_sided_region_is_single_set() {
        let remote = RemoteLocation::new(0x1000, 7);
        let config = CommConfig::one_sided(OpKind::RdmaWrite, remote, 5, 5);
        assert!(config.validate().is_ok());
        assert!(!config.has_inbound());
        assert_eq!(config.region_len(), 25);
        assert_eq!(config.remote_for(OpKind::RdmaWrite), Some(remote));
        assert_eq!(config.remote_for(OpKind::RdmaRead), None);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(CommConfig::new().with_num_slots(0).validate().is_err());
        assert!(CommConfig::new().with_slot_size(0).validate().is_err());
        assert!(
            CommConfig::new()
                .with_kinds(OpKinds::empty())
                .validate()
                .is_err()
        );
        // Remote-addressed kind without a location.
        assert!(
            CommConfig::new()
                .with_kinds(OpKinds::RDMA_READ)
                .validate()
                .is_err()
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "remote-addressed kind")]
    fn test_one_sided_rejects_two_sided_kind() {
        let _ = CommConfig::one_sided(OpKind::Send, RemoteLocation::new(0, 0), 4, 64);
    }
}
