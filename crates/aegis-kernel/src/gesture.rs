//! Gesture and keyword trigger evaluators.
//!
//! Each [`TriggerEvaluator`] is a stateless predicate over one kind of
//! [`GestureInput`].  Evaluators never change state themselves; when they fire
//! they hand back a [`TriggerEvent`] which the runtime feeds into the state
//! machine, where capabilities are re-checked.  An evaluator firing while
//! capabilities are missing therefore surfaces the missing-capability signal
//! instead of being dropped.
//!
//! All built-in evaluators only fire while the safety state is
//! [`SafetyState::Disabled`].
//!
//! | Evaluator | Fires when | Enabled by default |
//! |---|---|---|
//! | [`VolumeButtonEvaluator`] | `count >= 3` | yes |
//! | [`ShakeEvaluator`] | `intensity > 15.0` | yes |
//! | [`PowerButtonEvaluator`] | `count >= 5` | no (platform-limited) |
//! | [`TapPatternEvaluator`] | `taps.len() >= 9` | yes |
//! | [`VoiceKeywordEvaluator`] | keyword match `is_match()` | yes |

use aegis_types::{GestureInput, SafetyState, TriggerEvent};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ────────────────────────────────────────────────────────────────────────────
// Settings
// ────────────────────────────────────────────────────────────────────────────

/// Per-evaluator enable flags and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureSettings {
    pub volume_buttons: bool,
    pub volume_press_threshold: u32,
    pub shake: bool,
    pub shake_threshold: f32,
    pub power_button: bool,
    pub power_press_threshold: u32,
    pub tap_pattern: bool,
    pub tap_threshold: usize,
    pub voice_keyword: bool,
}

impl Default for GestureSettings {
    fn default() -> Self {
        Self {
            volume_buttons: true,
            volume_press_threshold: 3,
            shake: true,
            shake_threshold: 15.0,
            power_button: false,
            power_press_threshold: 5,
            tap_pattern: true,
            tap_threshold: 9,
            voice_keyword: true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Evaluator trait
// ────────────────────────────────────────────────────────────────────────────

/// Turns one kind of raw input into a trigger request.
pub trait TriggerEvaluator: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Return the trigger to submit, or `None` when the input does not
    /// qualify (wrong kind, under threshold, or not Disabled).
    fn evaluate(&self, input: &GestureInput, state: SafetyState) -> Option<TriggerEvent>;
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in evaluators
// ────────────────────────────────────────────────────────────────────────────

pub struct VolumeButtonEvaluator {
    pub enabled: bool,
    pub min_presses: u32,
}

impl TriggerEvaluator for VolumeButtonEvaluator {
    fn name(&self) -> &str {
        "volume_buttons"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn evaluate(&self, input: &GestureInput, state: SafetyState) -> Option<TriggerEvent> {
        match input {
            GestureInput::VolumeButtons { count }
                if state == SafetyState::Disabled && *count >= self.min_presses =>
            {
                Some(TriggerEvent::VolumeButtons { count: *count })
            }
            _ => None,
        }
    }
}

pub struct ShakeEvaluator {
    pub enabled: bool,
    /// Intensity must strictly exceed this value.
    pub threshold: f32,
}

impl TriggerEvaluator for ShakeEvaluator {
    fn name(&self) -> &str {
        "shake"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn evaluate(&self, input: &GestureInput, state: SafetyState) -> Option<TriggerEvent> {
        match input {
            GestureInput::Shake { intensity }
                if state == SafetyState::Disabled && *intensity > self.threshold =>
            {
                Some(TriggerEvent::Shake {
                    intensity: *intensity,
                })
            }
            _ => None,
        }
    }
}

/// Power-button presses.  Most platforms do not deliver these to
/// applications, so the evaluator is off unless explicitly enabled.
pub struct PowerButtonEvaluator {
    pub enabled: bool,
    pub min_presses: u32,
}

impl TriggerEvaluator for PowerButtonEvaluator {
    fn name(&self) -> &str {
        "power_button"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn evaluate(&self, input: &GestureInput, state: SafetyState) -> Option<TriggerEvent> {
        match input {
            GestureInput::PowerButton { count }
                if state == SafetyState::Disabled && *count >= self.min_presses =>
            {
                Some(TriggerEvent::PowerButton { count: *count })
            }
            _ => None,
        }
    }
}

/// Tap sequences.
///
/// Only the number of taps is checked; the timestamps are carried through
/// but no short/long rhythm is matched.
// TODO: match the actual short/long rhythm using the inter-tap intervals.
pub struct TapPatternEvaluator {
    pub enabled: bool,
    pub min_taps: usize,
}

impl TriggerEvaluator for TapPatternEvaluator {
    fn name(&self) -> &str {
        "tap_pattern"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn evaluate(&self, input: &GestureInput, state: SafetyState) -> Option<TriggerEvent> {
        match input {
            GestureInput::Taps { taps } if state == SafetyState::Disabled && taps.len() >= self.min_taps => {
                Some(TriggerEvent::TapPattern { taps: taps.clone() })
            }
            _ => None,
        }
    }
}

/// Fires on a transcription that matched the enrolled keyword.
pub struct VoiceKeywordEvaluator {
    pub enabled: bool,
}

impl TriggerEvaluator for VoiceKeywordEvaluator {
    fn name(&self) -> &str {
        "voice_keyword"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn evaluate(&self, input: &GestureInput, state: SafetyState) -> Option<TriggerEvent> {
        match input {
            GestureInput::Utterance(result) if state == SafetyState::Disabled && result.is_match() => {
                Some(TriggerEvent::VoiceKeyword(result.clone()))
            }
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Ordered collection of evaluators.  The first enabled evaluator that fires
/// wins.
#[derive(Default)]
pub struct TriggerEvaluators {
    evaluators: Vec<Box<dyn TriggerEvaluator>>,
}

impl TriggerEvaluators {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in evaluators configured from `settings`.
    pub fn from_settings(settings: &GestureSettings) -> Self {
        let mut registry = Self::new();
        registry.add(Box::new(VolumeButtonEvaluator {
            enabled: settings.volume_buttons,
            min_presses: settings.volume_press_threshold,
        }));
        registry.add(Box::new(ShakeEvaluator {
            enabled: settings.shake,
            threshold: settings.shake_threshold,
        }));
        registry.add(Box::new(PowerButtonEvaluator {
            enabled: settings.power_button,
            min_presses: settings.power_press_threshold,
        }));
        registry.add(Box::new(TapPatternEvaluator {
            enabled: settings.tap_pattern,
            min_taps: settings.tap_threshold,
        }));
        registry.add(Box::new(VoiceKeywordEvaluator {
            enabled: settings.voice_keyword,
        }));
        registry
    }

    /// Register an evaluator.  Evaluators are consulted in insertion order.
    pub fn add(&mut self, evaluator: Box<dyn TriggerEvaluator>) {
        self.evaluators.push(evaluator);
    }

    pub fn evaluate(&self, input: &GestureInput, state: SafetyState) -> Option<TriggerEvent> {
        self.evaluators
            .iter()
            .filter(|e| e.is_enabled())
            .find_map(|e| {
                let fired = e.evaluate(input, state);
                if fired.is_some() {
                    debug!(evaluator = e.name(), state = %state, "gesture evaluator fired");
                }
                fired
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{KeywordMatchResult, MatchType};
    use chrono::Utc;

    fn defaults() -> TriggerEvaluators {
        TriggerEvaluators::from_settings(&GestureSettings::default())
    }

    fn taps(n: usize) -> GestureInput {
        GestureInput::Taps {
            taps: vec![Utc::now(); n],
        }
    }

    // ------------------------------------------------------------------ thresholds

    #[test]
    fn volume_buttons_fire_at_three_presses() {
        let e = defaults();
        assert!(e.evaluate(&GestureInput::VolumeButtons { count: 2 }, SafetyState::Disabled).is_none());
        assert_eq!(
            e.evaluate(&GestureInput::VolumeButtons { count: 3 }, SafetyState::Disabled),
            Some(TriggerEvent::VolumeButtons { count: 3 })
        );
    }

    #[test]
    fn shake_requires_strictly_greater_intensity() {
        let e = defaults();
        assert!(e.evaluate(&GestureInput::Shake { intensity: 15.0 }, SafetyState::Disabled).is_none());
        assert!(e.evaluate(&GestureInput::Shake { intensity: 15.1 }, SafetyState::Disabled).is_some());
    }

    #[test]
    fn power_button_disabled_by_default() {
        let e = defaults();
        assert!(e.evaluate(&GestureInput::PowerButton { count: 10 }, SafetyState::Disabled).is_none());
    }

    #[test]
    fn power_button_fires_at_five_when_enabled() {
        let settings = GestureSettings {
            power_button: true,
            ..GestureSettings::default()
        };
        let e = TriggerEvaluators::from_settings(&settings);
        assert!(e.evaluate(&GestureInput::PowerButton { count: 4 }, SafetyState::Disabled).is_none());
        assert_eq!(
            e.evaluate(&GestureInput::PowerButton { count: 5 }, SafetyState::Disabled),
            Some(TriggerEvent::PowerButton { count: 5 })
        );
    }

    #[test]
    fn tap_pattern_counts_taps_only() {
        let e = defaults();
        assert!(e.evaluate(&taps(8), SafetyState::Disabled).is_none());
        assert!(matches!(
            e.evaluate(&taps(9), SafetyState::Disabled),
            Some(TriggerEvent::TapPattern { taps }) if taps.len() == 9
        ));
    }

    #[test]
    fn voice_keyword_requires_a_match() {
        let e = defaults();
        let miss = KeywordMatchResult::no_match("hello there", vec![]);
        assert!(e.evaluate(&GestureInput::Utterance(miss), SafetyState::Disabled).is_none());

        let hit = KeywordMatchResult {
            transcribed_text: "phoenix".into(),
            alternative_texts: vec![],
            matched_text: "phoenix".into(),
            match_type: MatchType::Exact,
            confidence: 1.0,
        };
        assert!(matches!(
            e.evaluate(&GestureInput::Utterance(hit), SafetyState::Disabled),
            Some(TriggerEvent::VoiceKeyword(_))
        ));
    }

    // ------------------------------------------------------------------ state gating

    #[test]
    fn nothing_fires_outside_disabled() {
        let e = defaults();
        for state in [SafetyState::Active, SafetyState::Emergency] {
            assert!(e.evaluate(&GestureInput::VolumeButtons { count: 9 }, state).is_none());
            assert!(e.evaluate(&GestureInput::Shake { intensity: 99.0 }, state).is_none());
            assert!(e.evaluate(&taps(20), state).is_none());
        }
    }

    #[test]
    fn disabled_evaluator_is_skipped() {
        let settings = GestureSettings {
            shake: false,
            ..GestureSettings::default()
        };
        let e = TriggerEvaluators::from_settings(&settings);
        assert!(e.evaluate(&GestureInput::Shake { intensity: 50.0 }, SafetyState::Disabled).is_none());
    }

    #[test]
    fn empty_registry_never_fires() {
        let e = TriggerEvaluators::new();
        assert!(e.evaluate(&GestureInput::VolumeButtons { count: 9 }, SafetyState::Disabled).is_none());
    }
}
