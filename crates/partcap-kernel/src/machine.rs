//! [`Machine`]: one partition's capability lifecycle.
//!
//! A machine is built with [`MachineBuilder`], which resolves the profile's
//! defaults for the configured CPU and applies explicit `cap-*` settings.
//! Properties stay writable until [`Machine::start`], which runs the apply
//! engine once.  A [`FatalError`] from apply terminates the machine; every
//! later call that needs a running machine returns the same error again.
//!
//! # Example
//!
//! ```
//! use partcap_kernel::{Machine, MachineState};
//!
//! let mut machine = Machine::builder()
//!     .cpu_type("power9")
//!     .cap("cap-htm", "off")
//!     .units(2)
//!     .build()
//!     .unwrap();
//!
//! machine.start().unwrap();
//! assert_eq!(machine.state(), MachineState::Running);
//! assert_eq!(machine.units().len(), 2);
//!
//! // Configuration is frozen once running.
//! assert!(machine.set_property("cap-cfpc", "workaround").is_err());
//! ```

use std::fmt;

use partcap_hal::{Backend, CpuCatalog, CpuModel, EmulatedBackend, ProcessingUnit};
use partcap_types::{ApplyError, CapError, CompatLevel, FatalError};
use tracing::{error, info};

use crate::accessor::{self, PropertyValue};
use crate::apply;
use crate::capability_set::{CapabilitySet, MachineCaps};
use crate::defaults::{self, DEFAULT_PROFILE, MachineProfile};
use crate::migration::{MigrationRecord, MigrationReport};
use crate::validators::ApplyContext;

/// CPU type used when none is configured.
pub const DEFAULT_CPU_TYPE: &str = "power9";

/// Lifecycle of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Properties may still change.
    Configuring,
    /// Capabilities applied; configuration is frozen.
    Running,
    /// An apply step failed.
    Terminated,
}

/// Assembles a [`Machine`].
pub struct MachineBuilder {
    profile: String,
    cpu_type: String,
    max_compat: Option<CompatLevel>,
    backend: Option<Box<dyn Backend>>,
    cpu: Option<Box<dyn CpuModel>>,
    caps: Vec<(String, String)>,
    units: usize,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self {
            profile: DEFAULT_PROFILE.to_string(),
            cpu_type: DEFAULT_CPU_TYPE.to_string(),
            max_compat: None,
            backend: None,
            cpu: None,
            caps: Vec::new(),
            units: 1,
        }
    }
}

impl MachineBuilder {
    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.profile = name.into();
        self
    }

    pub fn cpu_type(mut self, cpu_type: impl Into<String>) -> Self {
        self.cpu_type = cpu_type.into();
        self
    }

    pub fn max_compat(mut self, compat: Option<CompatLevel>) -> Self {
        self.max_compat = compat;
        self
    }

    /// Execution backend.  Defaults to [`EmulatedBackend`].
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the catalog CPU model, e.g. with a test double.
    pub fn cpu_model(mut self, cpu: Box<dyn CpuModel>) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Explicit `cap-*` setting, in textual form.  Applied in call order.
    pub fn cap(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.caps.push((name.into(), value.into()));
        self
    }

    /// Processing units created at start.
    pub fn units(mut self, count: usize) -> Self {
        self.units = count;
        self
    }

    /// Resolve defaults and apply explicit settings.
    ///
    /// # Errors
    ///
    /// - [`CapError::UnknownProfile`] / [`CapError::UnknownCpuType`].
    /// - Any decode error from an explicit setting.
    pub fn build(self) -> Result<Machine, CapError> {
        let profile = defaults::find_profile(&self.profile)
            .ok_or_else(|| CapError::UnknownProfile(self.profile.clone()))?;
        let cpu: Box<dyn CpuModel> = match self.cpu {
            Some(cpu) => cpu,
            None => Box::new(
                CpuCatalog::for_type(&self.cpu_type)
                    .ok_or_else(|| CapError::UnknownCpuType(self.cpu_type.clone()))?,
            ),
        };
        let backend = self
            .backend
            .unwrap_or_else(|| Box::new(EmulatedBackend::new()));

        let resolved = defaults::resolve_defaults(
            cpu.as_ref(),
            &self.cpu_type,
            self.max_compat,
            &profile.default_caps,
            backend.as_ref(),
        );
        let mut caps = MachineCaps::new(resolved);
        for (name, value) in &self.caps {
            accessor::set_property(&mut caps, name, value)?;
        }

        info!(
            profile = profile.name,
            cpu_type = %self.cpu_type,
            mode = %backend.mode(),
            "machine configured"
        );

        Ok(Machine {
            profile,
            cpu_type: self.cpu_type,
            max_compat: self.max_compat,
            cpu,
            backend,
            caps,
            units: (0..self.units).map(ProcessingUnit::new).collect(),
            state: MachineState::Configuring,
            fatal: None,
        })
    }
}

/// One partition: its CPU, backend, capability state and processing units.
pub struct Machine {
    profile: &'static MachineProfile,
    cpu_type: String,
    max_compat: Option<CompatLevel>,
    cpu: Box<dyn CpuModel>,
    backend: Box<dyn Backend>,
    caps: MachineCaps,
    units: Vec<ProcessingUnit>,
    state: MachineState,
    fatal: Option<FatalError>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("profile", &self.profile.name)
            .field("cpu_type", &self.cpu_type)
            .field("max_compat", &self.max_compat)
            .field("mode", &self.backend.mode())
            .field("caps", &self.caps)
            .field("units", &self.units.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Machine {
    pub fn builder() -> MachineBuilder {
        MachineBuilder::default()
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn profile(&self) -> &'static MachineProfile {
        self.profile
    }

    pub fn cpu_type(&self) -> &str {
        &self.cpu_type
    }

    pub fn caps(&self) -> &MachineCaps {
        &self.caps
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn units(&self) -> &[ProcessingUnit] {
        &self.units
    }

    /// The error that terminated the machine, if any.
    pub fn fatal(&self) -> Option<&FatalError> {
        self.fatal.as_ref()
    }

    // ── properties ──────────────────────────────────────────────────────────

    pub fn get_property(&self, name: &str) -> Result<PropertyValue, CapError> {
        accessor::get_property(&self.caps, name)
    }

    /// Set a `cap-*` property.  Only allowed before [`start`](Self::start).
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<(), CapError> {
        if self.state != MachineState::Configuring {
            return Err(CapError::ReadOnly(name.to_string()));
        }
        accessor::set_property(&mut self.caps, name, value)
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Apply every capability, then constrain every existing unit.
    ///
    /// Calling it on a running machine does nothing.
    pub fn start(&mut self) -> Result<(), FatalError> {
        match self.state {
            MachineState::Running => return Ok(()),
            MachineState::Terminated => return Err(self.terminated()),
            MachineState::Configuring => {}
        }

        let mut ctx = ApplyContext {
            backend: self.backend.as_mut(),
            cpu: self.cpu.as_ref(),
        };
        if let Err(e) = apply::apply_global(&self.caps, &mut ctx) {
            return Err(self.terminate(e));
        }
        for i in 0..self.units.len() {
            let result = apply::apply_unit(&self.caps, &mut self.units[i], self.backend.as_ref());
            if let Err(e) = result {
                return Err(self.terminate(e));
            }
        }

        self.state = MachineState::Running;
        info!(units = self.units.len(), "capabilities applied");
        Ok(())
    }

    /// Create one more processing unit.  On a running machine the unit is
    /// constrained immediately; otherwise it waits for [`start`](Self::start).
    /// Returns the new unit's index.
    pub fn add_unit(&mut self) -> Result<usize, FatalError> {
        if self.state == MachineState::Terminated {
            return Err(self.terminated());
        }
        let mut unit = ProcessingUnit::new(self.units.len());
        if self.state == MachineState::Running {
            if let Err(e) = apply::apply_unit(&self.caps, &mut unit, self.backend.as_ref()) {
                return Err(self.terminate(e));
            }
        }
        self.units.push(unit);
        Ok(self.units.len() - 1)
    }

    fn terminate(&mut self, err: FatalError) -> FatalError {
        error!(capability = %err.capability, reason = %err.reason, "terminating machine");
        self.state = MachineState::Terminated;
        self.fatal = Some(err.clone());
        err
    }

    fn terminated(&self) -> FatalError {
        self.fatal.clone().unwrap_or_else(|| FatalError {
            capability: String::new(),
            reason: ApplyError::Backend("machine terminated".to_string()),
        })
    }

    // ── migration ───────────────────────────────────────────────────────────

    /// Source side: snapshot and emit the capability record.
    pub fn pre_save(&mut self) -> MigrationRecord {
        self.caps.pre_save();
        self.caps.save_record()
    }

    pub fn pre_load(&mut self) {
        self.caps.pre_load();
    }

    pub fn load_record(&mut self, record: &MigrationRecord) -> Result<(), CapError> {
        self.caps.load_record(record)
    }

    /// Destination side: accept or refuse the incoming state.  Runs whether
    /// or not the stream carried any capability fields.
    pub fn post_load(&mut self) -> Result<MigrationReport, CapError> {
        let source_defaults = self.resolved_defaults();
        self.caps.post_load(&source_defaults)
    }

    /// Defaults recomputed from this machine's CPU and backend.
    pub fn resolved_defaults(&self) -> CapabilitySet {
        defaults::resolve_defaults(
            self.cpu.as_ref(),
            &self.cpu_type,
            self.max_compat,
            &self.profile.default_caps,
            self.backend.as_ref(),
        )
    }

    // ── memory ──────────────────────────────────────────────────────────────

    /// Whether host pages of `pagesize` bytes can back guest RAM.
    pub fn check_pagesize(&self, pagesize: u64) -> Result<(), CapError> {
        apply::check_pagesize(&self.caps, self.backend.as_ref(), pagesize)
    }
}
