//! Capability level snapshots and the per-machine triple.

use std::ops::Index;

use bitflags::bitflags;
use partcap_types::{CapabilityId, Level, NUM_CAPS};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One level per capability, indexed by [`CapabilityId`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct CapabilitySet {
    levels: [Level; NUM_CAPS],
}

impl CapabilitySet {
    /// Build a set from levels in ascending id order.
    pub const fn from_levels(levels: [Level; NUM_CAPS]) -> Self {
        Self { levels }
    }

    pub fn get(&self, id: CapabilityId) -> Level {
        self.levels[id.index()]
    }

    pub fn set(&mut self, id: CapabilityId, level: Level) {
        self.levels[id.index()] = level;
    }

    pub fn levels(&self) -> &[Level; NUM_CAPS] {
        &self.levels
    }

    /// `(id, level)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (CapabilityId, Level)> + '_ {
        CapabilityId::ALL.into_iter().map(move |id| (id, self.get(id)))
    }
}

impl Index<CapabilityId> for CapabilitySet {
    type Output = Level;

    fn index(&self, id: CapabilityId) -> &Level {
        &self.levels[id.index()]
    }
}

bitflags! {
    /// Which capabilities were explicitly configured, one bit per
    /// [`CapabilityId`] index.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OverrideMask: u32 {
        const _ = (1 << NUM_CAPS) - 1;
    }
}

impl OverrideMask {
    pub const fn of(id: CapabilityId) -> Self {
        Self::from_bits_retain(1 << id.index())
    }
}

/// The capability state of one machine: defaults, effective levels, the
/// migration scratch snapshot and the override bitmap.
///
/// `defaults` is fixed at construction.  `effective` starts equal to it and
/// changes only through explicit configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineCaps {
    defaults: CapabilitySet,
    effective: CapabilitySet,
    pub(crate) migration_incoming: CapabilitySet,
    overridden: OverrideMask,
}

impl MachineCaps {
    pub fn new(defaults: CapabilitySet) -> Self {
        Self {
            defaults,
            effective: defaults,
            migration_incoming: defaults,
            overridden: OverrideMask::default(),
        }
    }

    pub fn defaults(&self) -> &CapabilitySet {
        &self.defaults
    }

    pub fn effective(&self) -> &CapabilitySet {
        &self.effective
    }

    pub fn migration_incoming(&self) -> &CapabilitySet {
        &self.migration_incoming
    }

    pub fn overridden(&self) -> OverrideMask {
        self.overridden
    }

    pub fn is_overridden(&self, id: CapabilityId) -> bool {
        self.overridden.contains(OverrideMask::of(id))
    }

    /// Level currently in force for `id`.
    pub fn level(&self, id: CapabilityId) -> Level {
        self.effective.get(id)
    }

    /// Record an explicit setting of `id`.  Callers validate `level` first.
    pub(crate) fn set_override(&mut self, id: CapabilityId, level: Level) {
        self.overridden.insert(OverrideMask::of(id));
        self.effective.set(id, level);
    }
}
