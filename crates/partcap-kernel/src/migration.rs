//! Capability hand-off across live migration.
//!
//! The protocol has three steps around one transfer:
//!
//! 1. **Pre-save** (source): snapshot the effective levels into the
//!    migration scratch set and emit a [`MigrationRecord`].
//! 2. **Pre-load** (destination): reset the scratch set to the defaults so
//!    that capabilities absent from the stream read as "default".
//! 3. **Post-load** (destination): rebuild the source's levels from the
//!    defaults plus whatever arrived, and compare against what this machine
//!    enforces.  Source above destination is a hard failure that aborts the
//!    transfer; source below destination only warns.
//!
//! Levels are compared numerically, which is sound because enumerated value
//! lists only ever grow by appending stronger variants.

use std::collections::BTreeMap;

use partcap_types::{CapError, CapabilityId, Level, LevelMismatch};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::capability_set::{CapabilitySet, MachineCaps};
use crate::registry;

/// Capability levels carried in the migration stream, keyed by capability
/// name.  Only capabilities that need transferring are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MigrationRecord {
    levels: BTreeMap<CapabilityId, Level>,
}

impl MigrationRecord {
    pub fn get(&self, id: CapabilityId) -> Option<Level> {
        self.levels.get(&id).copied()
    }

    pub fn insert(&mut self, id: CapabilityId, level: Level) {
        self.levels.insert(id, level);
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CapabilityId, Level)> + '_ {
        self.levels.iter().map(|(id, level)| (*id, *level))
    }
}

/// Outcome of an accepted migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Capabilities the destination provides at a higher level than the
    /// source promised.
    pub warnings: Vec<LevelMismatch>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Compare the levels a migration source promised against the levels this
/// machine enforces.
///
/// # Errors
///
/// [`CapError::MigrationIncompatible`] listing every capability where the
/// source is higher than the destination.
///
/// # Example
///
/// ```
/// use partcap_kernel::capability_set::CapabilitySet;
/// use partcap_kernel::migration::compare;
///
/// let source = CapabilitySet::from_levels([1, 1, 1, 2, 0, 0, 16, 0]);
/// let dest = CapabilitySet::from_levels([1, 1, 1, 1, 0, 0, 16, 0]);
/// let err = compare(&source, &dest).unwrap_err();
/// assert!(err.to_string().contains("cap-cfpc higher level (2)"));
///
/// let report = compare(&dest, &source).unwrap();
/// assert_eq!(report.warnings.len(), 1);
/// ```
pub fn compare(source: &CapabilitySet, dest: &CapabilitySet) -> Result<MigrationReport, CapError> {
    let mut failures = Vec::new();
    let mut warnings = Vec::new();

    for (id, incoming) in source.iter() {
        let local = dest.get(id);
        if incoming == local {
            continue;
        }
        let mismatch = LevelMismatch {
            capability: registry::descriptor(id).name.to_string(),
            incoming,
            local,
        };
        if incoming > local {
            error!(capability = %mismatch.capability, incoming, local, "{mismatch}");
            failures.push(mismatch);
        } else {
            warn!(capability = %mismatch.capability, incoming, local, "{mismatch}");
            warnings.push(mismatch);
        }
    }

    if failures.is_empty() {
        Ok(MigrationReport { warnings })
    } else {
        Err(CapError::MigrationIncompatible(failures))
    }
}

impl MachineCaps {
    /// Whether capability `id` has to travel in the migration stream.
    ///
    /// NOTE: a capability explicitly set to its default value is not sent.
    /// If the destination resolves a different default, that explicit
    /// setting is lost and the destination's default wins silently.
    pub fn migration_needed(&self, id: CapabilityId) -> bool {
        self.is_overridden(id) && self.effective().get(id) != self.defaults().get(id)
    }

    /// Source side: snapshot the effective levels for transfer.
    pub fn pre_save(&mut self) {
        self.migration_incoming = *self.effective();
    }

    /// Record for the migration stream.  Call after [`pre_save`].
    ///
    /// [`pre_save`]: MachineCaps::pre_save
    pub fn save_record(&self) -> MigrationRecord {
        let mut record = MigrationRecord::default();
        for id in CapabilityId::ALL {
            if self.migration_needed(id) {
                record.insert(id, self.migration_incoming.get(id));
            }
        }
        debug!(fields = record.len(), "saved capability record");
        record
    }

    /// Destination side: absent fields read as defaults.
    pub fn pre_load(&mut self) {
        self.migration_incoming = *self.defaults();
    }

    /// Merge an incoming record into the scratch set.  Either every level is
    /// taken or none is.
    pub fn load_record(&mut self, record: &MigrationRecord) -> Result<(), CapError> {
        for (id, level) in record.iter() {
            let desc = registry::descriptor(id);
            if !desc.kind.is_valid(level) {
                return Err(CapError::LevelOutOfRange {
                    capability: desc.name.to_string(),
                    level,
                });
            }
        }
        for (id, level) in record.iter() {
            self.migration_incoming.set(id, level);
        }
        Ok(())
    }

    /// Destination side, after the stream is consumed.
    ///
    /// `source_defaults` are the defaults recomputed for this machine's
    /// processor compatibility.  Every incoming level that differs from
    /// this machine's defaults is overlaid on them to rebuild the source's
    /// effective levels, which are then checked with [`compare`].  The
    /// scratch set is reset to the defaults either way.
    pub fn post_load(
        &mut self,
        source_defaults: &CapabilitySet,
    ) -> Result<MigrationReport, CapError> {
        let mut source = *source_defaults;
        for (id, incoming) in self.migration_incoming.iter() {
            if incoming != self.defaults().get(id) {
                source.set(id, incoming);
            }
        }
        self.migration_incoming = *self.defaults();
        compare(&source, self.effective())
    }
}
