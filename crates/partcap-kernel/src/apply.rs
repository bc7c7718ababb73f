//! Apply engine: turn effective levels into backend state, or fail hard.
//!
//! [`apply_global`] runs every capability's [`CapValidator`] in ascending id
//! order once at machine start.  [`apply_unit`] runs the per-unit rules for
//! each processing unit as it is created.  A validator failure becomes a
//! [`FatalError`]; there is no best-effort fallback at this layer.
//!
//! [`CapValidator`]: crate::validators::CapValidator

use partcap_hal::{Backend, ProcessingUnit};
use partcap_types::{CAP_OFF, CapError, CapabilityId, FatalError};
use tracing::debug;

use crate::capability_set::MachineCaps;
use crate::registry;
use crate::validators::{self, ApplyContext};

/// Validate and realize every effective level against `ctx`.
///
/// Running it twice with the same inputs gives the same outcome.
///
/// # Example
///
/// ```
/// use partcap_hal::{CpuCatalog, EmulatedBackend};
/// use partcap_kernel::apply::apply_global;
/// use partcap_kernel::capability_set::MachineCaps;
/// use partcap_kernel::defaults::find_profile;
/// use partcap_kernel::validators::ApplyContext;
///
/// let caps = MachineCaps::new(find_profile("pseries-3.0").unwrap().default_caps);
/// let cpu = CpuCatalog::for_type("power9").unwrap();
/// let mut backend = EmulatedBackend::new();
/// let mut ctx = ApplyContext { backend: &mut backend, cpu: &cpu };
///
/// // HTM is on by default but cannot be emulated.
/// let err = apply_global(&caps, &mut ctx).unwrap_err();
/// assert_eq!(err.capability, "htm");
/// ```
pub fn apply_global(caps: &MachineCaps, ctx: &mut ApplyContext<'_>) -> Result<(), FatalError> {
    for (id, level) in caps.effective().iter() {
        let desc = registry::descriptor(id);
        debug!(capability = desc.name, level, "applying capability");

        if !desc.revocable && level == CAP_OFF && ctx.backend.supported_level(id) != CAP_OFF {
            debug!(
                capability = desc.name,
                "disabling is not supported yet, the guest may still see the feature"
            );
        }

        desc.validator
            .check(level, ctx)
            .map_err(|reason| FatalError {
                capability: desc.name.to_string(),
                reason,
            })?;
    }
    Ok(())
}

/// Constrain `unit` by every capability that has a per-unit rule.
pub fn apply_unit(
    caps: &MachineCaps,
    unit: &mut ProcessingUnit,
    backend: &dyn Backend,
) -> Result<(), FatalError> {
    for desc in registry::descriptors() {
        let Some(rule) = desc.unit_validator else {
            continue;
        };
        let level = caps.level(desc.id);
        rule.check_unit(level, unit, backend)
            .map_err(|reason| FatalError {
                capability: desc.name.to_string(),
                reason,
            })?;
    }
    Ok(())
}

/// Whether host pages of `pagesize` bytes can back the configured maximum
/// guest page size.  Memory backends call this before committing RAM.
pub fn check_pagesize(
    caps: &MachineCaps,
    backend: &dyn Backend,
    pagesize: u64,
) -> Result<(), CapError> {
    validators::check_host_pagesize(caps.level(CapabilityId::HptMaxPageSize), backend, pagesize)
}
