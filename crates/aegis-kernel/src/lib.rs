//! `aegis-kernel` – Safety Decisions
//!
//! Pure decision logic for the safety core.  Nothing in this crate performs
//! I/O; it consumes capability facts and trigger events and produces
//! decisions for the runtime to apply.
//!
//! # Modules
//!
//! - [`capability_gate`] – [`CapabilityGate`][capability_gate::CapabilityGate]:
//!   holds the current [`CapabilitySnapshot`][aegis_types::CapabilitySnapshot]
//!   and derives the critical / optimal predicates and the most critical
//!   missing capability.
//! - [`state_machine`] – [`decide`][state_machine::decide]: the safety-state
//!   transition table.  Given the current state, a trigger and the gate it
//!   returns the next state together with the side effect the runtime must
//!   perform.
//! - [`gesture`] – [`TriggerEvaluators`][gesture::TriggerEvaluators]:
//!   stateless evaluators that turn raw device input (button presses, shake
//!   intensity, tap sequences, keyword matches) into trigger requests.

pub mod capability_gate;
pub mod gesture;
pub mod state_machine;

pub use capability_gate::CapabilityGate;
pub use gesture::{GestureSettings, TriggerEvaluator, TriggerEvaluators};
pub use state_machine::{Decision, SideEffect, decide};
