//! The capability schema.
//!
//! [`REGISTRY`] holds one immutable [`CapabilityDescriptor`] per
//! [`CapabilityId`], indexed by the id's discriminant.  Everything else in
//! the crate reaches descriptors through [`descriptor`]; lookup by name with
//! [`lookup`] is reserved for the configuration boundary.
//!
//! Enumerated value lists are append-only.  Each index must describe a
//! strict superset of the behaviour of the index before it, because the
//! migration checker compares levels numerically.

use partcap_types::{CapabilityId, Level, NUM_CAPS};

use crate::validators::{self, CapValidator, UnitValidator};

/// Ordered value names of an enumerated capability.
#[derive(Debug)]
pub struct PossibleValues {
    pub values: &'static [&'static str],
    /// Returned verbatim as the error of a `?` query.
    pub help: &'static str,
}

impl PossibleValues {
    /// Name of `level`, or `None` when out of range.
    pub fn name(&self, level: Level) -> Option<&'static str> {
        self.values.get(usize::from(level)).copied()
    }

    /// Case-insensitive match of `name` to its index.
    pub fn position(&self, name: &str) -> Option<Level> {
        self.values
            .iter()
            .position(|v| v.eq_ignore_ascii_case(name))
            .and_then(|i| Level::try_from(i).ok())
    }
}

pub static CFPC_VALUES: PossibleValues = PossibleValues {
    values: &["broken", "workaround", "fixed"],
    help: "broken - no protection, workaround - workaround available, fixed - fixed in hardware",
};

pub static SBBC_VALUES: PossibleValues = PossibleValues {
    values: &["broken", "workaround", "fixed"],
    help: "broken - no protection, workaround - workaround available, fixed - fixed in hardware",
};

// "workaround" survives only to keep the indices stable.
pub static IBS_VALUES: PossibleValues = PossibleValues {
    values: &["broken", "workaround", "fixed-ibs", "fixed-ccd"],
    help: "broken - no protection, fixed-ibs - indirect branch serialisation, fixed-ccd - cache count disabled",
};

/// How a capability's level is presented externally.
#[derive(Debug)]
pub enum ValueKind {
    /// 0 = off, 1 = on.
    Boolean,
    /// Index into an ordered list of names.
    Enumerated(&'static PossibleValues),
    /// Base-2 exponent of a byte count.
    Log2Size,
}

impl ValueKind {
    /// Name of the decoded property type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ValueKind::Boolean => "bool",
            ValueKind::Enumerated(_) => "string",
            ValueKind::Log2Size => "size",
        }
    }

    /// Whether `level` is inside this kind's domain.
    pub fn is_valid(&self, level: Level) -> bool {
        match self {
            ValueKind::Boolean => level <= 1,
            ValueKind::Enumerated(possible) => usize::from(level) < possible.values.len(),
            ValueKind::Log2Size => level <= 63,
        }
    }
}

/// Immutable description of one capability.
pub struct CapabilityDescriptor {
    pub id: CapabilityId,
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ValueKind,
    /// `false` when a request to disable the capability is accepted but has
    /// no effect on the guest.
    pub revocable: bool,
    pub validator: &'static dyn CapValidator,
    pub unit_validator: Option<&'static dyn UnitValidator>,
}

impl CapabilityDescriptor {
    /// The configuration property name, `cap-<name>`.
    pub fn property_name(&self) -> String {
        format!("cap-{}", self.name)
    }

    /// Help text for enumerated capabilities.
    pub fn help(&self) -> Option<&'static str> {
        match self.kind {
            ValueKind::Enumerated(possible) => Some(possible.help),
            _ => None,
        }
    }
}

impl std::fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("revocable", &self.revocable)
            .field("per_unit", &self.unit_validator.is_some())
            .finish()
    }
}

/// The schema, indexed by [`CapabilityId::index`].
pub static REGISTRY: [CapabilityDescriptor; NUM_CAPS] = [
    CapabilityDescriptor {
        id: CapabilityId::Htm,
        name: "htm",
        description: "Allow Hardware Transactional Memory (HTM)",
        kind: ValueKind::Boolean,
        revocable: false,
        validator: &validators::HTM,
        unit_validator: None,
    },
    CapabilityDescriptor {
        id: CapabilityId::Vsx,
        name: "vsx",
        description: "Allow Vector Scalar Extensions (VSX)",
        kind: ValueKind::Boolean,
        revocable: false,
        validator: &validators::VSX,
        unit_validator: None,
    },
    CapabilityDescriptor {
        id: CapabilityId::Dfp,
        name: "dfp",
        description: "Allow Decimal Floating Point (DFP)",
        kind: ValueKind::Boolean,
        revocable: false,
        validator: &validators::DFP,
        unit_validator: None,
    },
    CapabilityDescriptor {
        id: CapabilityId::Cfpc,
        name: "cfpc",
        description: "Cache Flush on Privilege Change (broken, workaround, fixed)",
        kind: ValueKind::Enumerated(&CFPC_VALUES),
        revocable: true,
        validator: &validators::SAFE_CACHE,
        unit_validator: None,
    },
    CapabilityDescriptor {
        id: CapabilityId::Sbbc,
        name: "sbbc",
        description: "Speculation Barrier Bounds Checking (broken, workaround, fixed)",
        kind: ValueKind::Enumerated(&SBBC_VALUES),
        revocable: true,
        validator: &validators::SAFE_BOUNDS_CHECK,
        unit_validator: None,
    },
    CapabilityDescriptor {
        id: CapabilityId::Ibs,
        name: "ibs",
        description: "Indirect Branch Speculation (broken, fixed-ibs, fixed-ccd)",
        kind: ValueKind::Enumerated(&IBS_VALUES),
        revocable: true,
        validator: &validators::SAFE_INDIRECT_BRANCH,
        unit_validator: None,
    },
    CapabilityDescriptor {
        id: CapabilityId::HptMaxPageSize,
        name: "hpt-max-page-size",
        description: "Maximum page size for Hash Page Table guests",
        kind: ValueKind::Log2Size,
        revocable: true,
        validator: &validators::HPT_MAX_PAGE_SIZE,
        unit_validator: Some(&validators::HPT_PAGE_SIZE_FILTER),
    },
    CapabilityDescriptor {
        id: CapabilityId::NestedHv,
        name: "nested-hv",
        description: "Allow Nested KVM-HV",
        kind: ValueKind::Boolean,
        revocable: true,
        validator: &validators::NESTED_HV,
        unit_validator: None,
    },
];

/// The descriptor of `id`.
pub fn descriptor(id: CapabilityId) -> &'static CapabilityDescriptor {
    &REGISTRY[id.index()]
}

/// All descriptors in ascending id order.
pub fn descriptors() -> impl Iterator<Item = &'static CapabilityDescriptor> {
    REGISTRY.iter()
}

/// Find a descriptor by capability name (`"htm"`) or property name
/// (`"cap-htm"`).
pub fn lookup(name: &str) -> Option<&'static CapabilityDescriptor> {
    let bare = name.strip_prefix("cap-").unwrap_or(name);
    REGISTRY.iter().find(|d| d.name == bare)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_indexed_by_id() {
        for id in CapabilityId::ALL {
            assert_eq!(descriptor(id).id, id);
        }
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = descriptors().map(|d| d.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), NUM_CAPS);
    }

    #[test]
    fn lookup_accepts_bare_and_prefixed_names() {
        assert_eq!(lookup("cfpc").map(|d| d.id), Some(CapabilityId::Cfpc));
        assert_eq!(
            lookup("cap-hpt-max-page-size").map(|d| d.id),
            Some(CapabilityId::HptMaxPageSize)
        );
        assert!(lookup("cap-bogus").is_none());
    }

    #[test]
    fn only_page_size_has_unit_validator() {
        for d in descriptors() {
            assert_eq!(
                d.unit_validator.is_some(),
                d.id == CapabilityId::HptMaxPageSize,
                "{}",
                d.name
            );
        }
    }

    #[test]
    fn enumerated_levels_keep_their_indices() {
        assert_eq!(CFPC_VALUES.position("workaround"), Some(1));
        assert_eq!(SBBC_VALUES.position("fixed"), Some(2));
        assert_eq!(IBS_VALUES.position("fixed-ibs"), Some(2));
        assert_eq!(IBS_VALUES.position("fixed-ccd"), Some(3));
    }

    #[test]
    fn possible_values_match_case_insensitively() {
        assert_eq!(CFPC_VALUES.position("WORKAROUND"), Some(1));
        assert_eq!(CFPC_VALUES.position("nope"), None);
        assert_eq!(CFPC_VALUES.name(2), Some("fixed"));
        assert_eq!(CFPC_VALUES.name(3), None);
    }

    #[test]
    fn value_kind_domains() {
        assert!(ValueKind::Boolean.is_valid(1));
        assert!(!ValueKind::Boolean.is_valid(2));
        assert!(ValueKind::Enumerated(&IBS_VALUES).is_valid(3));
        assert!(!ValueKind::Enumerated(&IBS_VALUES).is_valid(4));
        assert!(ValueKind::Log2Size.is_valid(63));
        assert!(!ValueKind::Log2Size.is_valid(64));
    }

    #[test]
    fn property_names_are_prefixed() {
        assert_eq!(descriptor(CapabilityId::NestedHv).property_name(), "cap-nested-hv");
        assert!(descriptor(CapabilityId::Htm).help().is_none());
        assert!(descriptor(CapabilityId::Ibs).help().unwrap().contains("fixed-ccd"));
    }
}
