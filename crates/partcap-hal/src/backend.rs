//! Generic [`Backend`] trait for the execution engine running the guest.
//!
//! Capability validators never branch on a global "which accelerator"
//! flag.  They ask the backend handed to them what it can do.  Two
//! implementations are provided:
//!
//! - [`AcceleratedBackend`] – hardware-assisted virtualization whose
//!   feasibility is described by a [`HostFeatures`] snapshot.
//! - [`EmulatedBackend`] – pure instruction emulation.  Speculation
//!   mitigations, transactional memory and nested acceleration are not
//!   available.

use partcap_types::{ApplyError, CAP_BROKEN, CAP_OFF, CAP_ON, CapabilityId, ExecMode, Level};
use tracing::debug;

use crate::unit::ProcessingUnit;

/// Feasibility queries answered by the execution backend.
pub trait Backend {
    /// The execution mode this backend implements.
    fn mode(&self) -> ExecMode;

    /// The best level of `cap` this backend can currently provide.
    ///
    /// Boolean capabilities report 0 or 1; enumerated capabilities report an
    /// index into their value list.
    fn supported_level(&self, cap: CapabilityId) -> Level;

    /// Whether guest pages must be backed by host-contiguous pages.
    fn needs_host_contiguous_pages(&self) -> bool;

    /// Page size, in bytes, of the host memory backing guest RAM.
    fn host_page_size(&self) -> u64;

    /// Enable nested hypervisor acceleration at `level`.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Backend`] when the backend refuses the change.
    fn set_nested_hv(&mut self, level: Level) -> Result<(), ApplyError>;

    /// Whether `unit` executes accelerated.  Defaults to the backend mode.
    fn unit_accelerated(&self, _unit: &ProcessingUnit) -> bool {
        self.mode() == ExecMode::Accelerated
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Accelerated backend
// ────────────────────────────────────────────────────────────────────────────

/// What the host accelerator reports it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFeatures {
    pub htm: bool,
    pub nested_hv: bool,
    /// Best supported cache-flush-on-privilege-change level.
    pub safe_cache: Level,
    /// Best supported speculation-barrier bounds-checking level.
    pub safe_bounds_check: Level,
    /// Indirect branch mitigation the host actually implements.
    pub safe_indirect_branch: Level,
    pub needs_host_contiguous_pages: bool,
    pub ram_page_size: u64,
}

impl Default for HostFeatures {
    fn default() -> Self {
        Self {
            htm: false,
            nested_hv: false,
            safe_cache: CAP_BROKEN,
            safe_bounds_check: CAP_BROKEN,
            safe_indirect_branch: CAP_BROKEN,
            needs_host_contiguous_pages: false,
            ram_page_size: 64 * 1024,
        }
    }
}

/// Hardware-assisted backend.
///
/// # Example
///
/// ```
/// use partcap_hal::backend::{AcceleratedBackend, Backend, HostFeatures};
/// use partcap_types::CapabilityId;
///
/// let backend = AcceleratedBackend::new(HostFeatures {
///     htm: true,
///     ..HostFeatures::default()
/// });
/// assert_eq!(backend.supported_level(CapabilityId::Htm), 1);
/// ```
#[derive(Debug, Clone)]
pub struct AcceleratedBackend {
    features: HostFeatures,
    nested_level: Level,
}

impl AcceleratedBackend {
    pub fn new(features: HostFeatures) -> Self {
        Self {
            features,
            nested_level: CAP_OFF,
        }
    }

    pub fn features(&self) -> &HostFeatures {
        &self.features
    }

    /// Nested acceleration level most recently set through
    /// [`Backend::set_nested_hv`].
    pub fn nested_level(&self) -> Level {
        self.nested_level
    }
}

impl Backend for AcceleratedBackend {
    fn mode(&self) -> ExecMode {
        ExecMode::Accelerated
    }

    fn supported_level(&self, cap: CapabilityId) -> Level {
        match cap {
            CapabilityId::Htm => Level::from(self.features.htm),
            CapabilityId::NestedHv => Level::from(self.features.nested_hv),
            CapabilityId::Cfpc => self.features.safe_cache,
            CapabilityId::Sbbc => self.features.safe_bounds_check,
            CapabilityId::Ibs => self.features.safe_indirect_branch,
            // Decided by the processor model, not by the accelerator.
            CapabilityId::Vsx | CapabilityId::Dfp => CAP_ON,
            CapabilityId::HptMaxPageSize => 63,
        }
    }

    fn needs_host_contiguous_pages(&self) -> bool {
        self.features.needs_host_contiguous_pages
    }

    fn host_page_size(&self) -> u64 {
        self.features.ram_page_size
    }

    fn set_nested_hv(&mut self, level: Level) -> Result<(), ApplyError> {
        if level != CAP_OFF && !self.features.nested_hv {
            return Err(ApplyError::Backend(
                "nested acceleration is not available on this host".to_string(),
            ));
        }
        debug!(level, "setting nested hypervisor level");
        self.nested_level = level;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Emulated backend
// ────────────────────────────────────────────────────────────────────────────

/// Pure emulation backend.
#[derive(Debug, Clone)]
pub struct EmulatedBackend {
    ram_page_size: u64,
}

impl Default for EmulatedBackend {
    fn default() -> Self {
        Self {
            ram_page_size: 4096,
        }
    }
}

impl EmulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ram_page_size(mut self, bytes: u64) -> Self {
        self.ram_page_size = bytes;
        self
    }
}

impl Backend for EmulatedBackend {
    fn mode(&self) -> ExecMode {
        ExecMode::Emulated
    }

    fn supported_level(&self, cap: CapabilityId) -> Level {
        match cap {
            CapabilityId::Htm
            | CapabilityId::NestedHv
            | CapabilityId::Cfpc
            | CapabilityId::Sbbc
            | CapabilityId::Ibs => CAP_OFF,
            CapabilityId::Vsx | CapabilityId::Dfp => CAP_ON,
            CapabilityId::HptMaxPageSize => 63,
        }
    }

    fn needs_host_contiguous_pages(&self) -> bool {
        false
    }

    fn host_page_size(&self) -> u64 {
        self.ram_page_size
    }

    fn set_nested_hv(&mut self, level: Level) -> Result<(), ApplyError> {
        if level == CAP_OFF {
            Ok(())
        } else {
            Err(ApplyError::Backend(
                "nested acceleration requires an accelerated backend".to_string(),
            ))
        }
    }
}
