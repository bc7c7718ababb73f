//! `partcap-hal` – Execution backend & processor model
//!
//! Everything capability negotiation needs to know about the host and the
//! virtual processors, behind narrow traits so the policy in
//! `partcap-kernel` never depends on a concrete accelerator.
//!
//! # Modules
//!
//! - [`backend`] – [`Backend`][backend::Backend]: feasibility queries with
//!   [`AcceleratedBackend`][backend::AcceleratedBackend] and
//!   [`EmulatedBackend`][backend::EmulatedBackend] implementations.
//! - [`cpu`] – [`CpuModel`][cpu::CpuModel]: processor compatibility checks
//!   and instruction flags, backed by a static model catalog.
//! - [`unit`] – [`ProcessingUnit`][unit::ProcessingUnit]: a guest virtual
//!   CPU and its page-size menu.

pub mod backend;
pub mod cpu;
pub mod unit;

pub use backend::{AcceleratedBackend, Backend, EmulatedBackend, HostFeatures};
pub use cpu::{CpuCatalog, CpuModel, CpuModelInfo};
pub use unit::{ProcessingUnit, SegmentPageSizes};
