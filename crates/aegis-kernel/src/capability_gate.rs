//! [`CapabilityGate`] – tracks which runtime capabilities are granted.
//!
//! The gate holds a single [`CapabilitySnapshot`] that is replaced wholesale
//! every time capabilities are re-checked.  All queries are pure functions of
//! that snapshot.
//!
//! Before a Disabled → Active transition is allowed, call
//! [`CapabilityGate::require_critical`].  When neither audio nor location is
//! granted it fails with [`SafetyError::CapabilityMissing`] naming exactly the
//! one capability the caller should request.

use aegis_types::{Capability, CapabilityChange, CapabilitySnapshot, SafetyError};

/// Holds the current capability snapshot and derives predicates from it.
///
/// # Example
///
/// ```
/// use aegis_kernel::capability_gate::CapabilityGate;
/// use aegis_types::{Capability, CapabilitySnapshot};
///
/// let gate = CapabilityGate::new(CapabilitySnapshot::new(true, false, false, false, false));
///
/// assert!(gate.has_critical_capabilities());
/// assert!(!gate.has_all_optimal_capabilities());
/// assert_eq!(gate.most_critical_missing(), Some(Capability::Location));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapabilityGate {
    snapshot: CapabilitySnapshot,
}

impl CapabilityGate {
    pub fn new(snapshot: CapabilitySnapshot) -> Self {
        Self { snapshot }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> &CapabilitySnapshot {
        &self.snapshot
    }

    /// Replace the snapshot wholesale.
    pub fn update(&mut self, snapshot: CapabilitySnapshot) {
        self.snapshot = snapshot;
    }

    /// Fold a single provider change into a new snapshot.
    pub fn apply_change(&mut self, change: CapabilityChange) {
        self.snapshot = self.snapshot.with(change.capability, change.granted);
    }

    /// `audio OR location`.
    pub fn has_critical_capabilities(&self) -> bool {
        self.snapshot.audio || self.snapshot.location
    }

    /// `true` only when all five capabilities are granted.
    pub fn has_all_optimal_capabilities(&self) -> bool {
        Capability::PRIORITY
            .iter()
            .all(|cap| self.snapshot.is_granted(*cap))
    }

    /// The first missing capability in priority order, or `None` when
    /// everything is granted.
    pub fn most_critical_missing(&self) -> Option<Capability> {
        Capability::PRIORITY
            .into_iter()
            .find(|cap| !self.snapshot.is_granted(*cap))
    }

    /// Return `Ok(())` when the critical capabilities are present, or
    /// [`SafetyError::CapabilityMissing`] carrying
    /// [`most_critical_missing`][Self::most_critical_missing] otherwise.
    pub fn require_critical(&self) -> Result<(), SafetyError> {
        if self.has_critical_capabilities() {
            return Ok(());
        }
        // Critical capabilities absent implies audio is missing, so there is
        // always something to report.
        let missing = self.most_critical_missing().unwrap_or(Capability::Audio);
        Err(SafetyError::CapabilityMissing(missing))
    }

    /// Labels of granted capabilities, in priority order.
    pub fn active_labels(&self) -> Vec<String> {
        self.labels_where(true)
    }

    /// Labels of missing capabilities, in priority order.
    pub fn missing_labels(&self) -> Vec<String> {
        self.labels_where(false)
    }

    fn labels_where(&self, granted: bool) -> Vec<String> {
        Capability::PRIORITY
            .iter()
            .filter(|cap| self.snapshot.is_granted(**cap) == granted)
            .map(|cap| cap.label().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every combination of the five flags, in `[audio, location, camera,
    /// storage, sms]` bit order.
    fn all_combinations() -> impl Iterator<Item = [bool; 5]> {
        (0u8..32).map(|bits| {
            let mut flags = [false; 5];
            for (i, flag) in flags.iter_mut().enumerate() {
                *flag = bits & (1 << i) != 0;
            }
            flags
        })
    }

    fn gate_for(flags: [bool; 5]) -> CapabilityGate {
        CapabilityGate::new(CapabilitySnapshot::new(
            flags[0], flags[1], flags[2], flags[3], flags[4],
        ))
    }

    #[test]
    fn critical_is_audio_or_location_for_all_combinations() {
        for flags in all_combinations() {
            let gate = gate_for(flags);
            assert_eq!(
                gate.has_critical_capabilities(),
                flags[0] || flags[1],
                "flags {flags:?}"
            );
        }
    }

    #[test]
    fn optimal_requires_every_flag_for_all_combinations() {
        for flags in all_combinations() {
            let gate = gate_for(flags);
            assert_eq!(
                gate.has_all_optimal_capabilities(),
                flags.iter().all(|f| *f),
                "flags {flags:?}"
            );
        }
    }

    #[test]
    fn most_critical_missing_follows_priority_for_all_combinations() {
        for flags in all_combinations() {
            let gate = gate_for(flags);
            let expected = flags
                .iter()
                .position(|granted| !granted)
                .map(|i| Capability::PRIORITY[i]);
            assert_eq!(gate.most_critical_missing(), expected, "flags {flags:?}");
        }
    }

    #[test]
    fn labels_partition_all_capabilities() {
        for flags in all_combinations() {
            let gate = gate_for(flags);
            let active = gate.active_labels();
            let missing = gate.missing_labels();
            assert_eq!(active.len() + missing.len(), 5);
            assert!(active.iter().all(|l| !missing.contains(l)));
        }
    }

    #[test]
    fn audio_only_labels() {
        let gate = gate_for([true, false, false, false, false]);
        assert_eq!(gate.active_labels(), vec!["Voice Evidence"]);
        assert_eq!(
            gate.missing_labels(),
            vec![
                "Location Tracking",
                "Photo Evidence",
                "Evidence Storage",
                "SMS Messaging"
            ]
        );
    }

    #[test]
    fn require_critical_reports_audio_when_nothing_granted() {
        let gate = CapabilityGate::new(CapabilitySnapshot::none());
        assert_eq!(
            gate.require_critical(),
            Err(SafetyError::CapabilityMissing(Capability::Audio))
        );
    }

    #[test]
    fn require_critical_passes_with_location_only() {
        let gate = gate_for([false, true, false, false, false]);
        assert!(gate.require_critical().is_ok());
    }

    #[test]
    fn apply_change_replaces_snapshot() {
        let mut gate = CapabilityGate::default();
        let before = gate.snapshot().clone();
        gate.apply_change(CapabilityChange {
            capability: Capability::Location,
            granted: true,
        });
        assert!(!before.location);
        assert!(gate.snapshot().location);
        assert!(gate.has_critical_capabilities());
    }
}
