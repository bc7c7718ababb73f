//! Processor compatibility model.
//!
//! The [`CpuModel`] trait answers the two questions capability handling
//! asks of the CPU model: "can this CPU type run in compatibility mode C?"
//! and "which instruction-set features does the current CPU have?".
//! [`CpuCatalog`] is a static table of known server processor models.

use partcap_types::{CompatLevel, InsnFlags};

/// Processor-compatibility queries.
pub trait CpuModel {
    /// `true` when `cpu_type` can present compatibility level `compat` to the
    /// guest without exceeding `max_compat` (when one is set).
    fn type_check_compat(
        &self,
        cpu_type: &str,
        compat: CompatLevel,
        max_compat: Option<CompatLevel>,
    ) -> bool;

    /// Instruction-set features enabled on the current CPU.
    fn insn_flags(&self) -> InsnFlags;
}

/// Static description of one processor model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuModelInfo {
    pub name: &'static str,
    /// Newest compatibility level the processor can run natively.
    pub native: CompatLevel,
    pub flags: InsnFlags,
}

const BASE_FLAGS: InsnFlags = InsnFlags::ALTIVEC;
const POWER6_FLAGS: InsnFlags = BASE_FLAGS.union(InsnFlags::DFP);
const POWER7_FLAGS: InsnFlags = POWER6_FLAGS.union(InsnFlags::VSX);
const POWER8_FLAGS: InsnFlags = POWER7_FLAGS.union(InsnFlags::HTM);

/// Known processor models.
pub static CPU_MODELS: &[CpuModelInfo] = &[
    CpuModelInfo {
        name: "power6",
        native: CompatLevel::Isa2_05,
        flags: POWER6_FLAGS,
    },
    CpuModelInfo {
        name: "power7",
        native: CompatLevel::Isa2_06,
        flags: POWER7_FLAGS,
    },
    CpuModelInfo {
        name: "power7+",
        native: CompatLevel::Isa2_06Plus,
        flags: POWER7_FLAGS,
    },
    CpuModelInfo {
        name: "power8",
        native: CompatLevel::Isa2_07,
        flags: POWER8_FLAGS,
    },
    CpuModelInfo {
        name: "power8e",
        native: CompatLevel::Isa2_07,
        flags: POWER8_FLAGS,
    },
    CpuModelInfo {
        name: "power8nvl",
        native: CompatLevel::Isa2_07,
        flags: POWER8_FLAGS,
    },
    CpuModelInfo {
        name: "power9",
        native: CompatLevel::Isa3_00,
        flags: POWER8_FLAGS,
    },
];

/// Look up a processor model by (case-insensitive) type name.
pub fn find_model(cpu_type: &str) -> Option<&'static CpuModelInfo> {
    CPU_MODELS
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(cpu_type))
}

/// [`CpuModel`] backed by [`CPU_MODELS`], with the machine's CPU type as the
/// current CPU.
///
/// # Example
///
/// ```
/// use partcap_hal::cpu::{CpuCatalog, CpuModel};
/// use partcap_types::{CompatLevel, InsnFlags};
///
/// let cpu = CpuCatalog::for_type("power8").unwrap();
/// assert!(cpu.insn_flags().contains(InsnFlags::HTM));
/// assert!(cpu.type_check_compat("power8", CompatLevel::Isa2_06, None));
/// assert!(!cpu.type_check_compat("power8", CompatLevel::Isa2_07, Some(CompatLevel::Isa2_06)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CpuCatalog {
    current: &'static CpuModelInfo,
}

impl CpuCatalog {
    /// Build a catalog whose current CPU is `cpu_type`.  Returns `None` for
    /// unknown types.
    pub fn for_type(cpu_type: &str) -> Option<Self> {
        find_model(cpu_type).map(|current| Self { current })
    }

    pub fn current(&self) -> &'static CpuModelInfo {
        self.current
    }
}

impl CpuModel for CpuCatalog {
    fn type_check_compat(
        &self,
        cpu_type: &str,
        compat: CompatLevel,
        max_compat: Option<CompatLevel>,
    ) -> bool {
        let Some(model) = find_model(cpu_type) else {
            return false;
        };
        model.native >= compat && max_compat.is_none_or(|max| max >= compat)
    }

    fn insn_flags(&self) -> InsnFlags {
        self.current.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(find_model("POWER9").map(|m| m.name), Some("power9"));
        assert!(find_model("pentium").is_none());
    }

    #[test]
    fn every_model_has_altivec() {
        for m in CPU_MODELS {
            assert!(m.flags.contains(InsnFlags::ALTIVEC), "{}", m.name);
        }
    }

    #[test]
    fn power6_lacks_vsx() {
        let cpu = CpuCatalog::for_type("power6").unwrap();
        assert!(!cpu.insn_flags().contains(InsnFlags::VSX));
        assert!(cpu.insn_flags().contains(InsnFlags::DFP));
    }

    #[test]
    fn newer_cpu_satisfies_older_compat() {
        let cpu = CpuCatalog::for_type("power9").unwrap();
        assert!(cpu.type_check_compat("power9", CompatLevel::Isa2_05, None));
        assert!(cpu.type_check_compat("power9", CompatLevel::Isa3_00, None));
        assert!(!cpu.type_check_compat("power7", CompatLevel::Isa2_07, None));
    }

    #[test]
    fn max_compat_caps_the_level() {
        let cpu = CpuCatalog::for_type("power9").unwrap();
        let max = Some(CompatLevel::Isa2_06Plus);
        assert!(cpu.type_check_compat("power9", CompatLevel::Isa2_06Plus, max));
        assert!(!cpu.type_check_compat("power9", CompatLevel::Isa2_07, max));
    }

    #[test]
    fn unknown_type_never_compatible() {
        let cpu = CpuCatalog::for_type("power8").unwrap();
        assert!(!cpu.type_check_compat("sparc", CompatLevel::Isa2_05, None));
    }
}
