//! Safety-state transition table.
//!
//! [`decide`] is the single place where the next [`SafetyState`] is chosen.
//! It never mutates anything: it returns a [`Decision`] that the runtime
//! applies (optimistically, with rollback on persistence failure).
//!
//! | From | Event | Guard | To | Side effect |
//! |---|---|---|---|---|
//! | Disabled | any | critical capabilities granted | Active | [`SideEffect::StartSession`] |
//! | Disabled | any | critical capabilities missing | Disabled | report [`Decision::Blocked`] |
//! | Active | `ManualToggle` | – | Disabled | [`SideEffect::FinalizeSession`] |
//! | Active | `EscalationRequest` | – | Emergency | [`SideEffect::MarkEmergency`] |
//! | Emergency | `ManualToggle` | – | Disabled | [`SideEffect::FinalizeSession`] |
//!
//! Every other `(state, event)` pair is [`Decision::Ignored`].

use aegis_types::{Capability, SafetyState, TriggerEvent};

use crate::capability_gate::CapabilityGate;

/// Work the runtime must perform alongside a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    StartSession,
    FinalizeSession,
    MarkEmergency,
}

/// Outcome of evaluating one trigger against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Transition { to: SafetyState, effect: SideEffect },
    /// Activation refused; `missing` is the capability to request.
    Blocked { missing: Capability },
    Ignored,
}

impl Decision {
    /// The state that holds after this decision is applied to `current`.
    pub fn next_state(&self, current: SafetyState) -> SafetyState {
        match self {
            Decision::Transition { to, .. } => *to,
            Decision::Blocked { .. } | Decision::Ignored => current,
        }
    }
}

/// Decide how `trigger` moves the machine out of `state`.
///
/// # Example
///
/// ```
/// use aegis_kernel::{CapabilityGate, Decision, SideEffect, decide};
/// use aegis_types::{CapabilitySnapshot, SafetyState, TriggerEvent};
///
/// let gate = CapabilityGate::new(CapabilitySnapshot::all());
/// let decision = decide(SafetyState::Disabled, &TriggerEvent::ManualToggle, &gate);
/// assert_eq!(
///     decision,
///     Decision::Transition { to: SafetyState::Active, effect: SideEffect::StartSession }
/// );
/// ```
pub fn decide(state: SafetyState, trigger: &TriggerEvent, gate: &CapabilityGate) -> Decision {
    match (state, trigger) {
        (SafetyState::Disabled, _) => match gate.require_critical() {
            Ok(()) => Decision::Transition {
                to: SafetyState::Active,
                effect: SideEffect::StartSession,
            },
            Err(_) => Decision::Blocked {
                missing: gate.most_critical_missing().unwrap_or(Capability::Audio),
            },
        },
        (SafetyState::Active | SafetyState::Emergency, TriggerEvent::ManualToggle) => {
            Decision::Transition {
                to: SafetyState::Disabled,
                effect: SideEffect::FinalizeSession,
            }
        }
        (SafetyState::Active, TriggerEvent::EscalationRequest) => Decision::Transition {
            to: SafetyState::Emergency,
            effect: SideEffect::MarkEmergency,
        },
        _ => Decision::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{CapabilitySnapshot, KeywordMatchResult};
    use chrono::Utc;

    fn every_event() -> Vec<TriggerEvent> {
        vec![
            TriggerEvent::ManualToggle,
            TriggerEvent::VolumeButtons { count: 3 },
            TriggerEvent::Shake { intensity: 20.0 },
            TriggerEvent::PowerButton { count: 5 },
            TriggerEvent::TapPattern {
                taps: vec![Utc::now(); 9],
            },
            TriggerEvent::VoiceKeyword(KeywordMatchResult::no_match("x", vec![])),
            TriggerEvent::EscalationRequest,
        ]
    }

    fn granted() -> CapabilityGate {
        CapabilityGate::new(CapabilitySnapshot::new(true, false, false, false, false))
    }

    fn starved() -> CapabilityGate {
        CapabilityGate::new(CapabilitySnapshot::new(false, false, true, true, true))
    }

    #[test]
    fn disabled_activates_on_any_event_when_critical_granted() {
        for event in every_event() {
            assert_eq!(
                decide(SafetyState::Disabled, &event, &granted()),
                Decision::Transition {
                    to: SafetyState::Active,
                    effect: SideEffect::StartSession
                },
                "event {event:?}"
            );
        }
    }

    #[test]
    fn disabled_is_blocked_with_most_critical_missing() {
        let gate = starved();
        for event in every_event() {
            let decision = decide(SafetyState::Disabled, &event, &gate);
            assert_eq!(
                decision,
                Decision::Blocked {
                    missing: Capability::Audio
                }
            );
            assert_eq!(decision.next_state(SafetyState::Disabled), SafetyState::Disabled);
        }
    }

    #[test]
    fn manual_toggle_disables_from_active_and_emergency() {
        for state in [SafetyState::Active, SafetyState::Emergency] {
            assert_eq!(
                decide(state, &TriggerEvent::ManualToggle, &granted()),
                Decision::Transition {
                    to: SafetyState::Disabled,
                    effect: SideEffect::FinalizeSession
                }
            );
        }
    }

    #[test]
    fn escalation_moves_active_to_emergency() {
        assert_eq!(
            decide(SafetyState::Active, &TriggerEvent::EscalationRequest, &granted()),
            Decision::Transition {
                to: SafetyState::Emergency,
                effect: SideEffect::MarkEmergency
            }
        );
    }

    #[test]
    fn no_other_pair_changes_state() {
        for state in [SafetyState::Active, SafetyState::Emergency] {
            for event in every_event() {
                let decision = decide(state, &event, &granted());
                let allowed = matches!(event, TriggerEvent::ManualToggle)
                    || (state == SafetyState::Active
                        && matches!(event, TriggerEvent::EscalationRequest));
                if !allowed {
                    assert_eq!(decision, Decision::Ignored, "{state:?} + {event:?}");
                    assert_eq!(decision.next_state(state), state);
                }
            }
        }
    }

    #[test]
    fn active_transitions_ignore_capabilities() {
        // Deactivation is never capability-gated.
        assert_eq!(
            decide(SafetyState::Active, &TriggerEvent::ManualToggle, &starved()).next_state(SafetyState::Active),
            SafetyState::Disabled
        );
    }
}
