use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Internal encoding of how strongly a capability is supported.
///
/// Booleans use 0/1, enumerated capabilities use the index into their value
/// list, and size capabilities store a base-2 exponent.
pub type Level = u8;

pub const CAP_OFF: Level = 0;
pub const CAP_ON: Level = 1;

pub const CAP_BROKEN: Level = 0;
pub const CAP_WORKAROUND: Level = 1;
pub const CAP_FIXED: Level = 2;
pub const CAP_FIXED_IBS: Level = 2;
pub const CAP_FIXED_CCD: Level = 3;

/// Number of capabilities in the current schema.
pub const NUM_CAPS: usize = 8;

/// Dense, stable identifier of a capability.
///
/// The discriminant is the wire index.  New capabilities may only be
/// appended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum CapabilityId {
    /// Hardware Transactional Memory.
    Htm = 0,
    /// Vector Scalar Extensions.
    Vsx = 1,
    /// Decimal Floating Point.
    Dfp = 2,
    /// Cache Flush on Privilege Change.
    Cfpc = 3,
    /// Speculation Barrier Bounds Checking.
    Sbbc = 4,
    /// Indirect Branch Speculation.
    Ibs = 5,
    /// Maximum page size for hash page table guests.
    HptMaxPageSize = 6,
    /// Nested hypervisor acceleration.
    NestedHv = 7,
}

impl CapabilityId {
    /// Every capability in ascending id order.
    pub const ALL: [CapabilityId; NUM_CAPS] = [
        CapabilityId::Htm,
        CapabilityId::Vsx,
        CapabilityId::Dfp,
        CapabilityId::Cfpc,
        CapabilityId::Sbbc,
        CapabilityId::Ibs,
        CapabilityId::HptMaxPageSize,
        CapabilityId::NestedHv,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Execution mode of the backend running the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Hardware-assisted virtualization.
    Accelerated,
    /// Pure instruction emulation.
    Emulated,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Accelerated => write!(f, "accelerated"),
            ExecMode::Emulated => write!(f, "emulated"),
        }
    }
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accelerated" | "kvm" => Ok(ExecMode::Accelerated),
            "emulated" | "tcg" => Ok(ExecMode::Emulated),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

/// Logical processor compatibility level, ordered oldest to newest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum CompatLevel {
    #[serde(rename = "power6")]
    Isa2_05,
    #[serde(rename = "power7")]
    Isa2_06,
    #[serde(rename = "power7+")]
    Isa2_06Plus,
    #[serde(rename = "power8")]
    Isa2_07,
    #[serde(rename = "power9")]
    Isa3_00,
}

impl fmt::Display for CompatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompatLevel::Isa2_05 => "power6",
            CompatLevel::Isa2_06 => "power7",
            CompatLevel::Isa2_06Plus => "power7+",
            CompatLevel::Isa2_07 => "power8",
            CompatLevel::Isa3_00 => "power9",
        };
        f.write_str(s)
    }
}

impl FromStr for CompatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "power6" | "2.05" => Ok(CompatLevel::Isa2_05),
            "power7" | "2.06" => Ok(CompatLevel::Isa2_06),
            "power7+" | "2.06+" => Ok(CompatLevel::Isa2_06Plus),
            "power8" | "2.07" => Ok(CompatLevel::Isa2_07),
            "power9" | "3.00" => Ok(CompatLevel::Isa3_00),
            other => Err(format!("unknown compatibility level '{other}'")),
        }
    }
}

bitflags! {
    /// Instruction-set feature flags of a processor model.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct InsnFlags: u32 {
        const ALTIVEC = 1 << 0;
        const VSX     = 1 << 1;
        const DFP     = 1 << 2;
        const HTM     = 1 << 3;
    }
}

/// One capability whose incoming level did not match the local one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelMismatch {
    pub capability: String,
    /// Level the migration source promised the guest.
    pub incoming: Level,
    /// Level enforced on this (destination) machine.
    pub local: Level,
}

impl fmt::Display for LevelMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.incoming > self.local {
            "higher"
        } else {
            "lower"
        };
        write!(
            f,
            "cap-{} {dir} level ({}) in incoming stream than on destination ({})",
            self.capability, self.incoming, self.local
        )
    }
}

fn join_mismatches(mismatches: &[LevelMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Recoverable capability errors: configuration decode failures, lookups,
/// host checks and migration rejection.
///
/// None of these terminate the machine.  Apply-time infeasibility uses
/// [`FatalError`] instead.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapError {
    #[error("property '{0}' not found")]
    UnknownProperty(String),

    #[error("property '{0}' cannot be changed once the machine has started")]
    ReadOnly(String),

    #[error("unknown CPU type '{0}'")]
    UnknownCpuType(String),

    #[error("unknown machine profile '{0}'")]
    UnknownProfile(String),

    #[error("cap-{capability} expects a {expected} value")]
    WrongType {
        capability: String,
        expected: String,
    },

    /// The `?` query on an enumerated capability.  The message is exactly the
    /// capability's help text.
    #[error("{0}")]
    Help(String),

    #[error("invalid value for capability cap-{capability}: \"{value}\"")]
    InvalidValue { capability: String, value: String },

    #[error("cap-{capability} must be a power of 2")]
    NotPowerOfTwo { capability: String, value: u64 },

    #[error("invalid size \"{0}\"")]
    InvalidSize(String),

    #[error("invalid value ({level}) for cap-{capability}")]
    LevelOutOfRange { capability: String, level: Level },

    #[error(
        "Can't support {guest_kib} kiB guest pages with {host_kib} kiB host pages with this accelerator"
    )]
    HostPageSize { guest_kib: u64, host_kib: u64 },

    #[error("incoming migration rejected: {}", join_mismatches(.0))]
    MigrationIncompatible(Vec<LevelMismatch>),
}

/// Why a validator refused a capability level.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyError {
    /// The execution backend cannot provide the requested level.
    #[error("{0}")]
    Unsupported(String),

    /// The processor model lacks an instruction-set feature.
    #[error("{feature} support not available, try cap-{capability}=off")]
    MissingInsnFeature { capability: String, feature: String },

    /// The level is never acceptable for this capability.
    #[error("{0}")]
    InvalidLevel(String),

    /// Host pages cannot back the configured guest page size.
    #[error(transparent)]
    HostPages(#[from] CapError),

    /// The backend refused a state change.
    #[error("{0}")]
    Backend(String),
}

/// A capability level the current backend cannot realize.
///
/// Returned by the apply engine.  The machine start-up routine must treat it
/// as unrecoverable; there is deliberately no conversion into [`CapError`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("cap-{capability}: {reason}")]
#[must_use]
pub struct FatalError {
    pub capability: String,
    pub reason: ApplyError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_ids_are_dense() {
        for (i, id) in CapabilityId::ALL.iter().enumerate() {
            assert_eq!(id.index(), i);
            assert_eq!(CapabilityId::from_index(i), Some(*id));
        }
        assert_eq!(CapabilityId::from_index(NUM_CAPS), None);
    }

    #[test]
    fn capability_id_serializes_kebab_case() {
        let json = serde_json::to_string(&CapabilityId::HptMaxPageSize).unwrap();
        assert_eq!(json, "\"hpt-max-page-size\"");
    }

    #[test]
    fn compat_levels_are_ordered() {
        assert!(CompatLevel::Isa2_05 < CompatLevel::Isa2_06);
        assert!(CompatLevel::Isa2_06 < CompatLevel::Isa2_06Plus);
        assert!(CompatLevel::Isa2_06Plus < CompatLevel::Isa2_07);
        assert!(CompatLevel::Isa2_07 < CompatLevel::Isa3_00);
    }

    #[test]
    fn compat_level_parses_names_and_isa_versions() {
        assert_eq!("POWER8".parse::<CompatLevel>(), Ok(CompatLevel::Isa2_07));
        assert_eq!("2.06+".parse::<CompatLevel>(), Ok(CompatLevel::Isa2_06Plus));
        assert!("power42".parse::<CompatLevel>().is_err());
        assert_eq!(CompatLevel::Isa2_06Plus.to_string(), "power7+");
    }

    #[test]
    fn exec_mode_accepts_aliases() {
        assert_eq!("kvm".parse::<ExecMode>(), Ok(ExecMode::Accelerated));
        assert_eq!("Emulated".parse::<ExecMode>(), Ok(ExecMode::Emulated));
        assert!("xen".parse::<ExecMode>().is_err());
    }

    #[test]
    fn insn_flags_contains() {
        let flags = InsnFlags::ALTIVEC | InsnFlags::VSX;
        assert!(flags.contains(InsnFlags::VSX));
        assert!(flags.contains(InsnFlags::ALTIVEC | InsnFlags::VSX));
        assert!(!flags.contains(InsnFlags::DFP));
        assert!(flags.contains(InsnFlags::empty()));
        assert_eq!(InsnFlags::ALTIVEC.union(InsnFlags::VSX), flags);
    }

    #[test]
    fn help_error_message_is_verbatim() {
        let err = CapError::Help("broken - no protection".into());
        assert_eq!(err.to_string(), "broken - no protection");
    }

    #[test]
    fn migration_error_lists_every_mismatch() {
        let err = CapError::MigrationIncompatible(vec![
            LevelMismatch {
                capability: "cfpc".into(),
                incoming: 2,
                local: 1,
            },
            LevelMismatch {
                capability: "htm".into(),
                incoming: 1,
                local: 0,
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("cap-cfpc higher level (2)"));
        assert!(msg.contains("cap-htm higher level (1)"));
    }

    #[test]
    fn fatal_error_names_capability() {
        let err = FatalError {
            capability: "vsx".into(),
            reason: ApplyError::MissingInsnFeature {
                capability: "vsx".into(),
                feature: "VSX".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "cap-vsx: VSX support not available, try cap-vsx=off"
        );
    }

    #[test]
    fn host_page_error_keeps_its_message() {
        let err = ApplyError::from(CapError::HostPageSize {
            guest_kib: 16384,
            host_kib: 64,
        });
        assert_eq!(
            err.to_string(),
            "Can't support 16384 kiB guest pages with 64 kiB host pages with this accelerator"
        );
    }

    #[test]
    fn cap_error_serialization_roundtrip() {
        let err = CapError::NotPowerOfTwo {
            capability: "hpt-max-page-size".into(),
            value: 65535,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: CapError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
