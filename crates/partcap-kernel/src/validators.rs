//! Per-capability feasibility rules.
//!
//! Every capability in the [registry][crate::registry] points at one
//! [`CapValidator`], run once per machine, and optionally one
//! [`UnitValidator`], run once per processing unit.  Validators read what
//! the backend and CPU model can do through [`ApplyContext`] and return an
//! [`ApplyError`] when the requested level cannot be realized.  The
//! [apply engine][crate::apply] wraps it in a fatal error.
//!
//! Capabilities that cannot yet be revoked (`htm`, `vsx`, `dfp`) accept an
//! "off" request without checking anything.

use partcap_hal::unit::LARGE_PAGE_SHIFT;
use partcap_hal::{Backend, CpuModel, ProcessingUnit};
use partcap_types::{
    ApplyError, CAP_BROKEN, CAP_OFF, CAP_WORKAROUND, CapError, CapabilityId, ExecMode, InsnFlags,
    Level,
};
use tracing::{debug, warn};

use crate::registry::{CFPC_VALUES, IBS_VALUES, PossibleValues, SBBC_VALUES, descriptor};

// ────────────────────────────────────────────────────────────────────────────
// Traits
// ────────────────────────────────────────────────────────────────────────────

/// Collaborators a validator may consult.
pub struct ApplyContext<'a> {
    pub backend: &'a mut dyn Backend,
    pub cpu: &'a dyn CpuModel,
}

/// Machine-wide feasibility rule for one capability.
pub trait CapValidator: Send + Sync {
    /// Return `Ok(())` when `level` can be provided, or the reason it cannot.
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError>;
}

/// Per-processing-unit rule for one capability.
pub trait UnitValidator: Send + Sync {
    /// Constrain `unit` to `level`, or return the reason it cannot be done.
    fn check_unit(
        &self,
        level: Level,
        unit: &mut ProcessingUnit,
        backend: &dyn Backend,
    ) -> Result<(), ApplyError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Instruction-set capabilities
// ────────────────────────────────────────────────────────────────────────────

/// Hardware transactional memory needs accelerator support.
pub struct HtmValidator;

impl CapValidator for HtmValidator {
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        if level == CAP_OFF {
            return Ok(());
        }
        match ctx.backend.mode() {
            ExecMode::Emulated => Err(ApplyError::Unsupported(
                "No Transactional Memory support in emulated mode, try cap-htm=off".into(),
            )),
            ExecMode::Accelerated if ctx.backend.supported_level(CapabilityId::Htm) == CAP_OFF => {
                Err(ApplyError::Unsupported(
                    "Accelerator does not support Transactional Memory, try cap-htm=off".into(),
                ))
            }
            ExecMode::Accelerated => Ok(()),
        }
    }
}

fn missing_feature(cap: CapabilityId, feature: &str) -> ApplyError {
    ApplyError::MissingInsnFeature {
        capability: descriptor(cap).name.to_string(),
        feature: feature.to_string(),
    }
}

/// Vector scalar extensions need the CPU's VSX instructions.
pub struct VsxValidator;

impl CapValidator for VsxValidator {
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        if level == CAP_OFF {
            return Ok(());
        }
        let flags = ctx.cpu.insn_flags();
        if !flags.contains(InsnFlags::ALTIVEC) {
            return Err(missing_feature(CapabilityId::Vsx, "VMX (AltiVec)"));
        }
        if !flags.contains(InsnFlags::VSX) {
            return Err(missing_feature(CapabilityId::Vsx, "VSX"));
        }
        Ok(())
    }
}

/// Decimal floating point needs the CPU's DFP instructions.
pub struct DfpValidator;

impl CapValidator for DfpValidator {
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        if level == CAP_OFF || ctx.cpu.insn_flags().contains(InsnFlags::DFP) {
            Ok(())
        } else {
            Err(missing_feature(CapabilityId::Dfp, "DFP"))
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Speculation mitigations
// ────────────────────────────────────────────────────────────────────────────

/// A mitigation whose level may not exceed what the backend provides.
pub struct MitigationValidator {
    pub cap: CapabilityId,
    /// Used in error messages, e.g. "safe cache".
    pub label: &'static str,
    pub values: &'static PossibleValues,
}

impl CapValidator for MitigationValidator {
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let best = ctx.backend.supported_level(self.cap);
        if level <= best {
            return Ok(());
        }
        let name = descriptor(self.cap).name;
        let reason = match ctx.backend.mode() {
            ExecMode::Emulated => format!(
                "Requested {} capability level not supported in emulated mode, try a different value for cap-{name}",
                self.label
            ),
            ExecMode::Accelerated => format!(
                "Requested {} capability level not supported by the accelerator, try cap-{name}={}",
                self.label,
                self.values.name(best).unwrap_or("broken")
            ),
        };
        Err(ApplyError::Unsupported(reason))
    }
}

/// Indirect branch mitigations are distinct mechanisms, so a non-broken
/// request must match the backend exactly.
pub struct IndirectBranchValidator;

impl CapValidator for IndirectBranchValidator {
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let best = ctx.backend.supported_level(CapabilityId::Ibs);
        let suggestion = IBS_VALUES.name(best).unwrap_or("broken");
        if level == CAP_WORKAROUND {
            return Err(ApplyError::InvalidLevel(format!(
                "Requested safe indirect branch capability level \"workaround\" not valid, try cap-ibs={suggestion}"
            )));
        }
        if level == CAP_BROKEN {
            return Ok(());
        }
        match ctx.backend.mode() {
            ExecMode::Emulated => Err(ApplyError::Unsupported(
                "Requested safe indirect branch capability level not supported in emulated mode, try a different value for cap-ibs"
                    .into(),
            )),
            ExecMode::Accelerated if level != best => Err(ApplyError::Unsupported(format!(
                "Requested safe indirect branch capability level not supported by the accelerator, try cap-ibs={suggestion}"
            ))),
            ExecMode::Accelerated => Ok(()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Page sizes
// ────────────────────────────────────────────────────────────────────────────

/// Fail when guest pages of `1 << max_shift` bytes cannot be backed by host
/// pages of `pagesize` bytes.  Only relevant when the backend needs
/// host-contiguous pages.
pub fn check_host_pagesize(
    max_shift: Level,
    backend: &dyn Backend,
    pagesize: u64,
) -> Result<(), CapError> {
    if !backend.needs_host_contiguous_pages() {
        return Ok(());
    }
    let max_pagesize = 1u64 << max_shift.min(63);
    if max_pagesize > pagesize {
        return Err(CapError::HostPageSize {
            guest_kib: max_pagesize >> 10,
            host_kib: pagesize >> 10,
        });
    }
    Ok(())
}

/// Machine-wide bound on the hash page table page size.
pub struct HptMaxPageSizeValidator;

impl CapValidator for HptMaxPageSizeValidator {
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        if level < 12 {
            return Err(ApplyError::InvalidLevel(
                "Require at least 4kiB hpt-max-page-size".into(),
            ));
        }
        if level < 16 {
            warn!(shift = level, "Many guests require at least 64kiB hpt-max-page-size");
        }
        let host = ctx.backend.host_page_size();
        check_host_pagesize(level, &*ctx.backend, host)?;
        Ok(())
    }
}

/// `true` when a unit may use pages of `page_shift` inside segments of
/// `seg_shift` under a maximum of `max_shift`.
///
/// Besides the maximum, only the segment's own size and the 16 MiB large
/// page are allowed, so accelerated and emulated guests see the same menu.
/// Pages smaller than their segment are malformed and never allowed.
pub fn page_size_allowed(max_shift: u32, seg_shift: u32, page_shift: u32) -> bool {
    if page_shift < seg_shift || page_shift > max_shift {
        return false;
    }
    page_shift == seg_shift || page_shift == LARGE_PAGE_SHIFT
}

/// Narrows each unit's page-size menu to the configured maximum.
pub struct HptPageSizeFilter;

impl UnitValidator for HptPageSizeFilter {
    fn check_unit(
        &self,
        level: Level,
        unit: &mut ProcessingUnit,
        backend: &dyn Backend,
    ) -> Result<(), ApplyError> {
        let max_shift = u32::from(level);
        unit.filter_page_sizes(|seg, page| page_size_allowed(max_shift, seg, page));
        debug!(
            unit = unit.index(),
            max_shift,
            accelerated = backend.unit_accelerated(unit),
            "filtered page sizes"
        );
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Nested acceleration
// ────────────────────────────────────────────────────────────────────────────

/// Nested hypervisor support has to be switched on in the accelerator.
pub struct NestedHvValidator;

impl CapValidator for NestedHvValidator {
    fn check(&self, level: Level, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        if level == CAP_OFF {
            return Ok(());
        }
        match ctx.backend.mode() {
            ExecMode::Emulated => Err(ApplyError::Unsupported(
                "No Nested KVM-HV support in emulated mode, try cap-nested-hv=off".into(),
            )),
            ExecMode::Accelerated => {
                if ctx.backend.supported_level(CapabilityId::NestedHv) == CAP_OFF {
                    return Err(ApplyError::Unsupported(
                        "Accelerator does not support Nested KVM-HV, try cap-nested-hv=off".into(),
                    ));
                }
                ctx.backend.set_nested_hv(level).map_err(|e| {
                    ApplyError::Backend(format!(
                        "Error enabling cap-nested-hv ({e}), try cap-nested-hv=off"
                    ))
                })
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Instances referenced from the registry
// ────────────────────────────────────────────────────────────────────────────

pub static HTM: HtmValidator = HtmValidator;
pub static VSX: VsxValidator = VsxValidator;
pub static DFP: DfpValidator = DfpValidator;
pub static SAFE_CACHE: MitigationValidator = MitigationValidator {
    cap: CapabilityId::Cfpc,
    label: "safe cache",
    values: &CFPC_VALUES,
};
pub static SAFE_BOUNDS_CHECK: MitigationValidator = MitigationValidator {
    cap: CapabilityId::Sbbc,
    label: "safe bounds check",
    values: &SBBC_VALUES,
};
pub static SAFE_INDIRECT_BRANCH: IndirectBranchValidator = IndirectBranchValidator;
pub static HPT_MAX_PAGE_SIZE: HptMaxPageSizeValidator = HptMaxPageSizeValidator;
pub static HPT_PAGE_SIZE_FILTER: HptPageSizeFilter = HptPageSizeFilter;
pub static NESTED_HV: NestedHvValidator = NestedHvValidator;

#[cfg(test)]
mod tests {
    use super::*;
    use partcap_hal::unit::SegmentPageSizes;
    use partcap_hal::{AcceleratedBackend, CpuCatalog, EmulatedBackend, HostFeatures};
    use partcap_types::{CAP_FIXED, CAP_FIXED_CCD, CAP_FIXED_IBS, CAP_ON};

    // ------------------------------------------------------------------ helpers

    fn check(
        v: &dyn CapValidator,
        level: Level,
        backend: &mut dyn Backend,
        cpu_type: &str,
    ) -> Result<(), ApplyError> {
        let cpu = CpuCatalog::for_type(cpu_type).unwrap();
        let mut ctx = ApplyContext { backend, cpu: &cpu };
        v.check(level, &mut ctx)
    }

    fn host(features: HostFeatures) -> AcceleratedBackend {
        AcceleratedBackend::new(features)
    }

    // ------------------------------------------------------------------ htm

    #[test]
    fn htm_off_always_passes() {
        assert!(check(&HTM, CAP_OFF, &mut EmulatedBackend::new(), "power9").is_ok());
    }

    #[test]
    fn htm_on_is_infeasible_under_emulation() {
        let err = check(&HTM, CAP_ON, &mut EmulatedBackend::new(), "power9").unwrap_err();
        assert!(matches!(err, ApplyError::Unsupported(_)));
        assert!(err.to_string().contains("cap-htm=off"));
    }

    #[test]
    fn htm_on_needs_accelerator_support() {
        let mut without = host(HostFeatures::default());
        assert!(check(&HTM, CAP_ON, &mut without, "power9").is_err());

        let mut with = host(HostFeatures {
            htm: true,
            ..HostFeatures::default()
        });
        assert!(check(&HTM, CAP_ON, &mut with, "power9").is_ok());
    }

    // ------------------------------------------------------------------ vsx / dfp

    #[test]
    fn vsx_on_needs_cpu_support() {
        let mut b = EmulatedBackend::new();
        assert!(check(&VSX, CAP_ON, &mut b, "power7").is_ok());
        let err = check(&VSX, CAP_ON, &mut b, "power6").unwrap_err();
        assert_eq!(
            err,
            ApplyError::MissingInsnFeature {
                capability: "vsx".into(),
                feature: "VSX".into(),
            }
        );
        assert_eq!(err.to_string(), "VSX support not available, try cap-vsx=off");
        assert!(check(&VSX, CAP_OFF, &mut b, "power6").is_ok());
    }

    #[test]
    fn dfp_on_needs_cpu_support() {
        let mut b = EmulatedBackend::new();
        assert!(check(&DFP, CAP_ON, &mut b, "power6").is_ok());
        assert!(check(&DFP, CAP_ON, &mut b, "power9").is_ok());
    }

    // ------------------------------------------------------------------ mitigations

    #[test]
    fn mitigation_within_backend_level_passes() {
        let mut b = host(HostFeatures {
            safe_cache: CAP_WORKAROUND,
            ..HostFeatures::default()
        });
        assert!(check(&SAFE_CACHE, CAP_BROKEN, &mut b, "power9").is_ok());
        assert!(check(&SAFE_CACHE, CAP_WORKAROUND, &mut b, "power9").is_ok());
    }

    #[test]
    fn mitigation_above_backend_level_suggests_supported_value() {
        let mut b = host(HostFeatures {
            safe_bounds_check: CAP_WORKAROUND,
            ..HostFeatures::default()
        });
        let err = check(&SAFE_BOUNDS_CHECK, CAP_FIXED, &mut b, "power9").unwrap_err();
        assert!(err.to_string().contains("try cap-sbbc=workaround"), "{err}");
    }

    #[test]
    fn mitigation_under_emulation_only_allows_broken() {
        let mut b = EmulatedBackend::new();
        assert!(check(&SAFE_CACHE, CAP_BROKEN, &mut b, "power9").is_ok());
        let err = check(&SAFE_CACHE, CAP_WORKAROUND, &mut b, "power9").unwrap_err();
        assert!(err.to_string().contains("cap-cfpc"));
    }

    #[test]
    fn ibs_workaround_is_never_valid() {
        let mut b = host(HostFeatures {
            safe_indirect_branch: CAP_FIXED_CCD,
            ..HostFeatures::default()
        });
        let err = check(&SAFE_INDIRECT_BRANCH, CAP_WORKAROUND, &mut b, "power9").unwrap_err();
        assert!(matches!(err, ApplyError::InvalidLevel(_)));
        assert!(err.to_string().contains("try cap-ibs=fixed-ccd"), "{err}");
    }

    #[test]
    fn ibs_must_match_backend_exactly() {
        let mut b = host(HostFeatures {
            safe_indirect_branch: CAP_FIXED_CCD,
            ..HostFeatures::default()
        });
        assert!(check(&SAFE_INDIRECT_BRANCH, CAP_FIXED_CCD, &mut b, "power9").is_ok());
        assert!(check(&SAFE_INDIRECT_BRANCH, CAP_FIXED_IBS, &mut b, "power9").is_err());
        assert!(check(&SAFE_INDIRECT_BRANCH, CAP_BROKEN, &mut b, "power9").is_ok());
    }

    #[test]
    fn ibs_fixed_rejected_under_emulation() {
        let mut b = EmulatedBackend::new();
        assert!(check(&SAFE_INDIRECT_BRANCH, CAP_FIXED_IBS, &mut b, "power9").is_err());
    }

    // ------------------------------------------------------------------ page size

    #[test]
    fn page_size_below_4k_rejected() {
        let mut b = EmulatedBackend::new();
        let err = check(&HPT_MAX_PAGE_SIZE, 11, &mut b, "power9").unwrap_err();
        assert!(matches!(err, ApplyError::InvalidLevel(_)));
        assert!(err.to_string().contains("at least 4kiB"));
    }

    #[test]
    fn small_page_size_only_warns() {
        let mut b = EmulatedBackend::new();
        assert!(check(&HPT_MAX_PAGE_SIZE, 12, &mut b, "power9").is_ok());
    }

    #[test]
    fn page_size_bounded_by_host_when_contiguous() {
        let mut b = host(HostFeatures {
            needs_host_contiguous_pages: true,
            ram_page_size: 64 * 1024,
            ..HostFeatures::default()
        });
        assert!(check(&HPT_MAX_PAGE_SIZE, 16, &mut b, "power9").is_ok());
        let err = check(&HPT_MAX_PAGE_SIZE, 24, &mut b, "power9").unwrap_err();
        assert_eq!(
            err,
            ApplyError::HostPages(CapError::HostPageSize {
                guest_kib: 16384,
                host_kib: 64,
            })
        );
    }

    #[test]
    fn host_pagesize_ignored_without_contiguity() {
        let b = EmulatedBackend::new();
        assert!(check_host_pagesize(34, &b, 4096).is_ok());
    }

    #[test]
    fn page_filter_predicate() {
        // Above the maximum.
        assert!(!page_size_allowed(16, 12, 24));
        // Segment base size.
        assert!(page_size_allowed(16, 16, 16));
        // 16M large page inside a 4k segment.
        assert!(page_size_allowed(24, 12, 24));
        // 64k page inside a 4k segment is never allowed.
        assert!(!page_size_allowed(24, 12, 16));
        // Page smaller than its segment.
        assert!(!page_size_allowed(24, 16, 12));
    }

    #[test]
    fn malformed_menu_entries_are_dropped() {
        let mut unit = ProcessingUnit::with_page_sizes(
            0,
            vec![
                SegmentPageSizes::new(16, &[12, 16]),
                SegmentPageSizes::new(24, &[12]),
            ],
        );
        HPT_PAGE_SIZE_FILTER
            .check_unit(24, &mut unit, &EmulatedBackend::new())
            .unwrap();
        assert!(unit.allows(16, 16));
        assert!(!unit.allows(16, 12));
        assert!(!unit.allows(24, 12));
    }

    #[test]
    fn unit_filter_limits_menu_to_64k() {
        let mut unit = ProcessingUnit::new(0);
        let b = EmulatedBackend::new();
        HPT_PAGE_SIZE_FILTER.check_unit(16, &mut unit, &b).unwrap();
        let menu: Vec<_> = unit
            .page_sizes()
            .iter()
            .map(|s| (s.seg_shift, s.page_shifts.clone()))
            .collect();
        assert_eq!(menu, vec![(12, vec![12]), (16, vec![16])]);
    }

    #[test]
    fn unit_filter_is_backend_independent() {
        let mut emulated = ProcessingUnit::new(0);
        let mut accelerated = ProcessingUnit::new(0);
        HPT_PAGE_SIZE_FILTER
            .check_unit(24, &mut emulated, &EmulatedBackend::new())
            .unwrap();
        HPT_PAGE_SIZE_FILTER
            .check_unit(24, &mut accelerated, &host(HostFeatures::default()))
            .unwrap();
        assert_eq!(emulated, accelerated);
        assert!(emulated.allows(12, 24));
        assert!(!emulated.allows(12, 16));
        assert!(!emulated.page_sizes().iter().any(|s| s.seg_shift == 34));
    }

    // ------------------------------------------------------------------ nested

    #[test]
    fn nested_on_enables_backend() {
        let mut b = host(HostFeatures {
            nested_hv: true,
            ..HostFeatures::default()
        });
        assert!(check(&NESTED_HV, CAP_ON, &mut b, "power9").is_ok());
        assert_eq!(b.nested_level(), CAP_ON);
    }

    #[test]
    fn nested_on_rejected_without_support() {
        let mut b = host(HostFeatures::default());
        assert!(check(&NESTED_HV, CAP_ON, &mut b, "power9").is_err());
        let mut e = EmulatedBackend::new();
        assert!(check(&NESTED_HV, CAP_ON, &mut e, "power9").is_err());
    }

    #[test]
    fn nested_off_touches_nothing() {
        let mut b = host(HostFeatures::default());
        assert!(check(&NESTED_HV, CAP_OFF, &mut b, "power9").is_ok());
        assert_eq!(b.nested_level(), CAP_OFF);
    }
}
