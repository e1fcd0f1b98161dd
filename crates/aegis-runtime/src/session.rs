//! [`MonitoringSessionManager`] – lifecycle of an active-protection session.
//!
//! A session is created on Disabled → Active, escalated on Active → Emergency
//! and finalized on → Disabled.  While it exists, a background task refreshes
//! its evidence counts every `poll_interval` from the [`EvidenceStore`].
//!
//! The poller runs each query inline, so a slow query delays the next tick
//! instead of overlapping it; ticks missed in the meantime are skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use aegis_kernel::CapabilityGate;
use aegis_middleware::{EventBus, EvidenceStore, Observable, Topic};
use aegis_types::{Event, EventPayload, EvidenceCounts, MonitoringSession, SafetyError, SessionSummary};

const SOURCE: &str = "aegis-runtime::session";

/// A session id unique for the lifetime of the process:
/// `session_<unix millis>_<random hex>`.
pub fn new_session_id() -> String {
    format!(
        "session_{}_{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

struct Poller {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the current [`MonitoringSession`] and its evidence poller.
pub struct MonitoringSessionManager {
    evidence: Arc<dyn EvidenceStore>,
    bus: EventBus,
    poll_interval: Duration,
    current: Observable<Option<MonitoringSession>>,
    poller: Option<Poller>,
}

impl MonitoringSessionManager {
    pub fn new(evidence: Arc<dyn EvidenceStore>, bus: EventBus, poll_interval: Duration) -> Self {
        Self {
            evidence,
            bus,
            poll_interval,
            current: Observable::new(None),
            poller: None,
        }
    }

    pub fn current(&self) -> Option<MonitoringSession> {
        self.current.get()
    }

    /// Handle to the observable session slot.  Every start, evidence refresh,
    /// escalation and teardown is emitted.
    pub fn observable(&self) -> Observable<Option<MonitoringSession>> {
        self.current.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Option<MonitoringSession>> {
        self.current.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    /// Create a session and start polling for its evidence.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self, trigger_method: &str, gate: &CapabilityGate) -> MonitoringSession {
        if let Some(poller) = self.poller.take() {
            // Replaced sessions never outlive their poller.
            poller.handle.abort();
        }

        let session = MonitoringSession {
            session_id: new_session_id(),
            start_time: Utc::now(),
            evidence_counts: EvidenceCounts::new(),
            trigger_method: trigger_method.to_string(),
            emergency_triggered: false,
            emergency_time: None,
            active_capabilities: gate.active_labels(),
            missing_capabilities: gate.missing_labels(),
        };
        info!(
            session_id = %session.session_id,
            trigger = trigger_method,
            active = ?session.active_capabilities,
            "monitoring session started"
        );
        self.current.set(Some(session.clone()));

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(poll_evidence(
            Arc::clone(&self.evidence),
            self.current.clone(),
            self.bus.clone(),
            session.session_id.clone(),
            self.poll_interval,
            stop_rx,
        ));
        self.poller = Some(Poller { stop, handle });
        session
    }

    /// Mark the session as escalated.  The first emergency time is kept.
    ///
    /// Applied in place so evidence counts written by the poller are never
    /// overwritten by a stale copy.
    pub fn escalate(&mut self, at: DateTime<Utc>) -> Option<MonitoringSession> {
        let escalated = self
            .current
            .update(|slot| slot.as_ref().map(|session| session.escalated(at)))?;
        warn!(session_id = %escalated.session_id, "monitoring session escalated to emergency");
        Some(escalated)
    }

    /// Undo an escalation: put back `previous`'s emergency flag and time.
    /// Everything else, evidence counts included, keeps its current value.
    /// Does nothing if the session has been replaced since.
    pub fn revert_escalation(&mut self, previous: &MonitoringSession) {
        self.current.update(|slot| match slot {
            Some(session) if session.session_id == previous.session_id => {
                Some(MonitoringSession {
                    emergency_triggered: previous.emergency_triggered,
                    emergency_time: previous.emergency_time,
                    ..session.clone()
                })
            }
            other => other.clone(),
        });
    }

    /// Stop polling, persist the summary and drop the local session.
    ///
    /// The local session is dropped even when the summary cannot be stored.
    pub async fn finalize(&mut self) -> Result<Option<SessionSummary>, SafetyError> {
        self.stop_polling().await;
        let Some(session) = self.current.get() else {
            return Ok(None);
        };
        self.current.set(None);

        let summary = self.evidence.create_session_summary(&session).await?;
        info!(
            session_id = %summary.session_id,
            duration_secs = summary.duration_seconds,
            emergency = summary.emergency_triggered,
            "monitoring session finalized"
        );
        Ok(Some(summary))
    }

    /// Stop polling and drop the session without a summary.
    pub async fn discard(&mut self) {
        self.stop_polling().await;
        if let Some(session) = self.current.get() {
            debug!(session_id = %session.session_id, "monitoring session discarded");
            self.current.set(None);
        }
    }

    /// Stop the evidence poller.  The session itself is kept.
    pub async fn stop(&mut self) {
        self.stop_polling().await;
    }

    async fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.stop.send(());
            if let Err(e) = poller.handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "evidence poller ended abnormally");
                }
            }
        }
    }
}

/// Refresh the session's evidence counts every `period` until `stop` fires
/// or its sender is dropped.
async fn poll_evidence(
    evidence: Arc<dyn EvidenceStore>,
    current: Observable<Option<MonitoringSession>>,
    bus: EventBus,
    session_id: String,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = &mut stop => break,
            result = evidence.counts_for_session(&session_id) => result,
        };

        match result {
            Ok(counts) => {
                let mut refreshed = false;
                current.update(|slot| match slot {
                    Some(session) if session.session_id == session_id => {
                        refreshed = true;
                        Some(session.with_evidence_counts(counts.clone()))
                    }
                    other => other.clone(),
                });
                if !refreshed {
                    break;
                }
                debug!(session_id = %session_id, ?counts, "evidence counts refreshed");
                let _ = bus.publish_to(
                    Topic::Session,
                    Event::new(
                        SOURCE,
                        EventPayload::EvidenceUpdated {
                            session_id: session_id.clone(),
                            counts,
                        },
                    ),
                );
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "evidence poll failed; retrying next tick"),
        }
    }
    debug!(session_id = %session_id, "evidence poller stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use aegis_middleware::sim::SimEvidenceStore;
    use aegis_types::{CapabilitySnapshot, EvidenceCategory};

    const PERIOD: Duration = Duration::from_secs(5);

    fn manager() -> (MonitoringSessionManager, Arc<SimEvidenceStore>) {
        let store = Arc::new(SimEvidenceStore::new());
        let manager = MonitoringSessionManager::new(store.clone(), EventBus::default(), PERIOD);
        (manager, store)
    }

    fn audio_only() -> CapabilityGate {
        CapabilityGate::new(CapabilitySnapshot::new(true, false, false, false, false))
    }

    #[test]
    fn thousand_ids_are_distinct() {
        let ids: HashSet<String> = (0..1_000).map(|_| new_session_id()).collect();
        assert_eq!(ids.len(), 1_000);
        assert!(ids.iter().all(|id| id.starts_with("session_")));
    }

    #[tokio::test(start_paused = true)]
    async fn start_snapshots_capability_labels() {
        let (mut manager, _) = manager();
        let session = manager.start("manual", &audio_only());

        assert_eq!(session.active_capabilities, vec!["Voice Evidence"]);
        assert_eq!(
            session.missing_capabilities,
            vec![
                "Location Tracking",
                "Photo Evidence",
                "Evidence Storage",
                "SMS Messaging"
            ]
        );
        assert_eq!(session.trigger_method, "manual");
        assert!(!session.emergency_triggered);
        assert!(manager.is_polling());
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn evidence_refreshes_every_interval() {
        let (mut manager, store) = manager();
        let session = manager.start("manual", &audio_only());
        store.record(&session.session_id, EvidenceCategory::Location);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(store.count_calls(), 1);
        let counts = manager.current().unwrap().evidence_counts;
        assert_eq!(counts.get(&EvidenceCategory::Location), Some(&1));

        store.record(&session.session_id, EvidenceCategory::Photo);
        tokio::time::sleep(PERIOD).await;
        assert_eq!(store.count_calls(), 2);
        let counts = manager.current().unwrap().evidence_counts;
        assert_eq!(counts.get(&EvidenceCategory::Photo), Some(&1));

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_poll_skips_instead_of_overlapping() {
        let (mut manager, store) = manager();
        store.set_latency(Duration::from_secs(12));
        manager.start("manual", &audio_only());

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(store.max_concurrent_count_calls(), 1);
        // One 12 s query at a time: at most one start per 12 s after t=5.
        let calls = store.count_calls();
        assert!((2..=5).contains(&calls), "calls: {calls}");
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_is_retried_next_tick() {
        let (mut manager, store) = manager();
        let session = manager.start("manual", &audio_only());
        store.record(&session.session_id, EvidenceCategory::Audio);
        store.set_counts_failing(true);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(manager.current().unwrap().evidence_counts.is_empty());

        store.set_counts_failing(false);
        tokio::time::sleep(PERIOD).await;
        assert_eq!(
            manager
                .current()
                .unwrap()
                .evidence_counts
                .get(&EvidenceCategory::Audio),
            Some(&1)
        );
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_stops_polling_and_drops_session() {
        let (mut manager, store) = manager();
        let session = manager.start("volume_buttons", &audio_only());
        store.record(&session.session_id, EvidenceCategory::Photo);

        let summary = manager.finalize().await.unwrap().unwrap();
        assert_eq!(summary.session_id, session.session_id);
        assert_eq!(summary.trigger_method, "volume_buttons");
        assert_eq!(summary.evidence_counts.get(&EvidenceCategory::Photo), Some(&1));
        assert!(manager.current().is_none());
        assert!(!manager.is_polling());

        let calls = store.count_calls();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.count_calls(), calls, "poller must not outlive the session");
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_drops_session_even_if_summary_fails() {
        let (mut manager, store) = manager();
        manager.start("manual", &audio_only());
        store.set_summaries_failing(true);

        assert!(manager.finalize().await.is_err());
        assert!(manager.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_keeps_first_time_and_polling() {
        let (mut manager, _) = manager();
        manager.start("manual", &audio_only());
        let first = Utc::now();

        let escalated = manager.escalate(first).unwrap();
        assert!(escalated.emergency_triggered);
        assert_eq!(escalated.emergency_time, Some(first));

        let again = manager
            .escalate(first + chrono::Duration::seconds(10))
            .unwrap();
        assert_eq!(again.emergency_time, Some(first));
        assert!(manager.is_polling());
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reverting_escalation_keeps_polled_evidence() {
        let (mut manager, store) = manager();
        let before = manager.start("manual", &audio_only());
        manager.escalate(Utc::now()).unwrap();

        store.record(&before.session_id, EvidenceCategory::Audio);
        tokio::time::sleep(PERIOD + Duration::from_millis(10)).await;

        manager.revert_escalation(&before);
        let current = manager.current().unwrap();
        assert!(!current.emergency_triggered);
        assert_eq!(current.emergency_time, None);
        assert_eq!(current.evidence_counts.get(&EvidenceCategory::Audio), Some(&1));
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn escalate_without_session_is_none() {
        let (mut manager, _) = manager();
        assert!(manager.escalate(Utc::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_slow_query_returns_promptly() {
        let (mut manager, store) = manager();
        store.set_latency(Duration::from_secs(60));
        manager.start("manual", &audio_only());
        tokio::time::sleep(Duration::from_secs(6)).await;

        let began = Instant::now();
        manager.stop().await;
        assert!(began.elapsed() < Duration::from_secs(1));
        assert!(manager.current().is_some());
    }
}
