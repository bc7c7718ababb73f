//! `partcap-kernel` – Capability negotiation policy
//!
//! Decides which level of each optional processor feature a partition's
//! guest sees, checks that the level can actually be realized on the current
//! backend, and keeps that decision consistent across live migration.
//!
//! # Modules
//!
//! - [`registry`] – the static schema: one
//!   [`CapabilityDescriptor`][registry::CapabilityDescriptor] per capability
//!   with its value kind and validators.
//! - [`capability_set`] – [`CapabilitySet`][capability_set::CapabilitySet]
//!   snapshots and the per-machine [`MachineCaps`][capability_set::MachineCaps].
//! - [`defaults`] – machine profiles and
//!   [`resolve_defaults`][defaults::resolve_defaults], which clamps a
//!   profile's baseline to the guest's processor compatibility.
//! - [`accessor`] – typed `cap-*` property get/set.
//! - [`validators`] – one feasibility rule per capability.
//! - [`apply`] – runs the rules at start-up and per processing unit; any
//!   failure is a [`FatalError`][partcap_types::FatalError].
//! - [`migration`] – pre-save / pre-load / post-load compatibility checks.
//! - [`machine`] – [`Machine`][machine::Machine]: the lifecycle that ties
//!   everything together.

pub mod accessor;
pub mod apply;
pub mod capability_set;
pub mod defaults;
pub mod machine;
pub mod migration;
pub mod registry;
pub mod validators;

pub use accessor::{PropertyInfo, PropertyValue};
pub use capability_set::{CapabilitySet, MachineCaps, OverrideMask};
pub use defaults::{MachineProfile, PROFILES, resolve_defaults};
pub use machine::{Machine, MachineBuilder, MachineState};
pub use migration::{MigrationRecord, MigrationReport};
pub use registry::{CapabilityDescriptor, ValueKind};
pub use validators::{ApplyContext, CapValidator, UnitValidator};
