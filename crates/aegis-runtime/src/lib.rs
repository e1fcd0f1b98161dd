//! `aegis-runtime` – The Safety Controller
//!
//! Applies the kernel's decisions to the world: one owner per user holds the
//! safety state, the capability gate and the active monitoring session, and
//! processes triggers one at a time.
//!
//! # Modules
//!
//! - [`controller`] – [`SafetyController`][controller::SafetyController]:
//!   serialized trigger processing with optimistic transitions that roll back
//!   when persistence rejects them, capability folding and profile
//!   initialization.
//! - [`session`] – [`MonitoringSessionManager`][session::MonitoringSessionManager]:
//!   session ids, periodic evidence polling and finalization.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.
//!
//! # Gating
//!
//! Every trigger goes through [`aegis_kernel::decide`] while the controller's
//! lock is held, so the capability check and the state it is checked against
//! can never disagree.

pub mod controller;
pub mod session;
pub mod telemetry;

pub use controller::{ControllerConfig, SafetyController, SafetyServices};
pub use session::MonitoringSessionManager;
pub use telemetry::{TracerProviderGuard, init_tracing};
