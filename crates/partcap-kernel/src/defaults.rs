//! Default capability levels.
//!
//! A [`MachineProfile`] supplies the baseline levels of one machine
//! version.  [`resolve_defaults`] clamps that baseline to what the guest's
//! processor compatibility level can actually offer.  The result feeds both
//! machine construction and the post-migration check, so it has to be a
//! deterministic function of its inputs.

use partcap_hal::{Backend, CpuModel};
use partcap_types::{CAP_BROKEN, CAP_OFF, CAP_ON, CapabilityId, CompatLevel, Level};

use crate::capability_set::CapabilitySet;

/// Page-size exponent meaning "no limit" (16 GiB, the largest page size).
pub const UNBOUNDED_PAGE_SHIFT: Level = 34;

/// Baseline capability levels of one machine version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineProfile {
    pub name: &'static str,
    /// A page-size level of 0 marks a version that predates the capability
    /// and has it derived from the host.
    pub default_caps: CapabilitySet,
}

/// Profile used when none is configured.
pub const DEFAULT_PROFILE: &str = "pseries-3.0";

// Level order: htm, vsx, dfp, cfpc, sbbc, ibs, hpt-max-page-size, nested-hv.
pub static PROFILES: &[MachineProfile] = &[
    MachineProfile {
        name: "pseries-2.11",
        default_caps: CapabilitySet::from_levels([
            CAP_OFF, CAP_ON, CAP_ON, CAP_BROKEN, CAP_BROKEN, CAP_BROKEN, 0, CAP_OFF,
        ]),
    },
    MachineProfile {
        name: "pseries-2.12",
        default_caps: CapabilitySet::from_levels([
            CAP_ON, CAP_ON, CAP_ON, CAP_BROKEN, CAP_BROKEN, CAP_BROKEN, 0, CAP_OFF,
        ]),
    },
    MachineProfile {
        name: "pseries-3.0",
        default_caps: CapabilitySet::from_levels([
            CAP_ON, CAP_ON, CAP_ON, CAP_BROKEN, CAP_BROKEN, CAP_BROKEN, 16, CAP_OFF,
        ]),
    },
];

pub fn find_profile(name: &str) -> Option<&'static MachineProfile> {
    PROFILES.iter().find(|p| p.name == name)
}

/// Compute the default levels for a guest of `cpu_type` limited to
/// `max_compat`, starting from `baseline`.
///
/// Capabilities that need instructions the compatibility level lacks are
/// forced to their weakest level.  A legacy (zero) page-size baseline is
/// replaced by the host RAM page size when the backend needs host-contiguous
/// pages, and by [`UNBOUNDED_PAGE_SHIFT`] otherwise.
///
/// # Example
///
/// ```
/// use partcap_hal::{CpuCatalog, EmulatedBackend};
/// use partcap_kernel::defaults::{find_profile, resolve_defaults};
/// use partcap_types::CapabilityId;
///
/// let cpu = CpuCatalog::for_type("power7").unwrap();
/// let baseline = find_profile("pseries-3.0").unwrap().default_caps;
/// let defaults = resolve_defaults(&cpu, "power7", None, &baseline, &EmulatedBackend::new());
///
/// // POWER7 predates transactional memory.
/// assert_eq!(defaults.get(CapabilityId::Htm), 0);
/// assert_eq!(defaults.get(CapabilityId::Vsx), 1);
/// ```
pub fn resolve_defaults(
    cpu: &dyn CpuModel,
    cpu_type: &str,
    max_compat: Option<CompatLevel>,
    baseline: &CapabilitySet,
    backend: &dyn Backend,
) -> CapabilitySet {
    let mut caps = *baseline;
    let compat = |level| cpu.type_check_compat(cpu_type, level, max_compat);

    if !compat(CompatLevel::Isa2_07) {
        caps.set(CapabilityId::Htm, CAP_OFF);
        caps.set(CapabilityId::Cfpc, CAP_BROKEN);
    }

    if !compat(CompatLevel::Isa2_06Plus) {
        caps.set(CapabilityId::Sbbc, CAP_BROKEN);
    }

    if !compat(CompatLevel::Isa2_06) {
        caps.set(CapabilityId::Vsx, CAP_OFF);
        caps.set(CapabilityId::Dfp, CAP_OFF);
        caps.set(CapabilityId::Ibs, CAP_BROKEN);
    }

    if baseline.get(CapabilityId::HptMaxPageSize) == 0 {
        let shift = if backend.needs_host_contiguous_pages() {
            log2_floor(backend.host_page_size())
        } else {
            UNBOUNDED_PAGE_SHIFT
        };
        caps.set(CapabilityId::HptMaxPageSize, shift);
    }

    caps
}

fn log2_floor(bytes: u64) -> Level {
    // Host page sizes are powers of two; trailing zeros is the exponent.
    bytes.trailing_zeros().min(63) as Level
}

#[cfg(test)]
mod tests {
    use super::*;
    use partcap_hal::{AcceleratedBackend, CpuCatalog, EmulatedBackend, HostFeatures};
    use partcap_types::CAP_WORKAROUND;

    fn baseline(name: &str) -> CapabilitySet {
        find_profile(name).unwrap().default_caps
    }

    fn resolve(cpu_type: &str, max: Option<CompatLevel>, base: &CapabilitySet) -> CapabilitySet {
        let cpu = CpuCatalog::for_type(cpu_type).unwrap();
        resolve_defaults(&cpu, cpu_type, max, base, &EmulatedBackend::new())
    }

    #[test]
    fn default_profile_exists() {
        assert!(find_profile(DEFAULT_PROFILE).is_some());
        assert!(find_profile("pseries-9.9").is_none());
    }

    #[test]
    fn modern_cpu_keeps_baseline() {
        let base = baseline("pseries-3.0");
        assert_eq!(resolve("power9", None, &base), base);
    }

    #[test]
    fn power7_loses_htm_and_cfpc() {
        let mut base = baseline("pseries-3.0");
        base.set(CapabilityId::Cfpc, CAP_WORKAROUND);
        base.set(CapabilityId::Sbbc, CAP_WORKAROUND);
        let caps = resolve("power7", None, &base);
        assert_eq!(caps.get(CapabilityId::Htm), CAP_OFF);
        assert_eq!(caps.get(CapabilityId::Cfpc), CAP_BROKEN);
        // 2.06 is below 2.06+, so sbbc is clamped too.
        assert_eq!(caps.get(CapabilityId::Sbbc), CAP_BROKEN);
        assert_eq!(caps.get(CapabilityId::Vsx), CAP_ON);
    }

    #[test]
    fn power7_plus_keeps_sbbc() {
        let mut base = baseline("pseries-3.0");
        base.set(CapabilityId::Sbbc, CAP_WORKAROUND);
        let caps = resolve("power7+", None, &base);
        assert_eq!(caps.get(CapabilityId::Sbbc), CAP_WORKAROUND);
    }

    #[test]
    fn power6_loses_vector_and_decimal() {
        let caps = resolve("power6", None, &baseline("pseries-3.0"));
        assert_eq!(caps.get(CapabilityId::Vsx), CAP_OFF);
        assert_eq!(caps.get(CapabilityId::Dfp), CAP_OFF);
        assert_eq!(caps.get(CapabilityId::Ibs), CAP_BROKEN);
    }

    #[test]
    fn max_compat_clamps_newer_cpu() {
        let caps = resolve("power9", Some(CompatLevel::Isa2_06), &baseline("pseries-3.0"));
        assert_eq!(caps.get(CapabilityId::Htm), CAP_OFF);
        assert_eq!(caps.get(CapabilityId::Vsx), CAP_ON);
    }

    #[test]
    fn legacy_page_size_unbounded_without_contiguity() {
        let caps = resolve("power9", None, &baseline("pseries-2.12"));
        assert_eq!(caps.get(CapabilityId::HptMaxPageSize), UNBOUNDED_PAGE_SHIFT);
    }

    #[test]
    fn legacy_page_size_follows_host_when_contiguous() {
        let cpu = CpuCatalog::for_type("power9").unwrap();
        let backend = AcceleratedBackend::new(HostFeatures {
            needs_host_contiguous_pages: true,
            ram_page_size: 64 * 1024,
            ..HostFeatures::default()
        });
        let caps = resolve_defaults(&cpu, "power9", None, &baseline("pseries-2.11"), &backend);
        assert_eq!(caps.get(CapabilityId::HptMaxPageSize), 16);
        assert_eq!(caps.get(CapabilityId::Htm), CAP_OFF);
    }

    #[test]
    fn resolution_is_deterministic() {
        for profile in PROFILES {
            for cpu in ["power6", "power7", "power7+", "power8", "power9"] {
                let a = resolve(cpu, None, &profile.default_caps);
                let b = resolve(cpu, None, &profile.default_caps);
                assert_eq!(a, b, "{} / {cpu}", profile.name);
            }
        }
    }
}
