//! [`SafetyController`] – the single owner of the safety state.
//!
//! Every trigger is processed while the controller's async mutex is held:
//!
//! 1. **Decide** – [`aegis_kernel::decide`] against the current state and
//!    capability gate.
//! 2. **Apply optimistically** – the state observable flips at once, a new
//!    session is started or the current one escalated.
//! 3. **Confirm** – the new status is written through the
//!    [`PersistenceBackend`].  A failure restores the previous state and
//!    session and surfaces [`SafetyError::Persistence`].
//! 4. **Finalize** – leaving protection finalizes the session only after the
//!    write is confirmed.
//!
//! A second trigger arriving mid-flight waits for the lock and is decided
//! against the state the first one left behind.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use aegis_middleware::sim::{SimCapabilityProvider, SimEvidenceStore, SimPersistence};
//! use aegis_runtime::{ControllerConfig, SafetyController, SafetyServices};
//! use aegis_types::{CapabilitySnapshot, SafetyState, TriggerEvent};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let controller = SafetyController::new(
//!     ControllerConfig::default(),
//!     SafetyServices {
//!         persistence: Arc::new(SimPersistence::new("user-1")),
//!         capabilities: Arc::new(SimCapabilityProvider::new(CapabilitySnapshot::all())),
//!         evidence: Arc::new(SimEvidenceStore::new()),
//!     },
//! );
//! controller.initialize().await.unwrap();
//! let state = controller.handle_trigger(TriggerEvent::ManualToggle).await.unwrap();
//! assert_eq!(state, SafetyState::Active);
//! controller.stop().await;
//! # });
//! ```

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use aegis_kernel::{CapabilityGate, Decision, GestureSettings, SideEffect, TriggerEvaluators, decide};
use aegis_middleware::{CapabilityProvider, EventBus, EvidenceStore, Observable, PersistenceBackend, Topic};
use aegis_types::{
    Capability, CapabilityChange, CapabilitySnapshot, Event, EventPayload, GestureInput,
    MonitoringSession, SafetyError, SafetyState, TriggerEvent,
};

use crate::session::MonitoringSessionManager;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const SOURCE: &str = "aegis-runtime::controller";

/// Trigger method recorded for a session re-created from a stored profile.
const RESTORED_TRIGGER: &str = "restored";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`SafetyController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often the active session's evidence counts are refreshed.
    pub poll_interval: Duration,
    /// Which gesture evaluators are enabled and their thresholds.
    pub gestures: GestureSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            gestures: GestureSettings::default(),
        }
    }
}

/// The collaborators a controller drives.
#[derive(Clone)]
pub struct SafetyServices {
    pub persistence: Arc<dyn PersistenceBackend>,
    pub capabilities: Arc<dyn CapabilityProvider>,
    pub evidence: Arc<dyn EvidenceStore>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

/// Everything guarded by the serialization lock.
struct Inner {
    gate: CapabilityGate,
    sessions: MonitoringSessionManager,
}

/// The part of the controller the capability watcher task also needs.
struct Shared {
    inner: Mutex<Inner>,
    capabilities: Observable<CapabilitySnapshot>,
    bus: EventBus,
}

impl Shared {
    fn publish(&self, topic: Topic, payload: EventPayload) {
        // Nobody listening is fine.
        let _ = self.bus.publish_to(topic, Event::new(SOURCE, payload));
    }

    async fn fold_change(&self, change: CapabilityChange) -> CapabilitySnapshot {
        let mut inner = self.inner.lock().await;
        inner.gate.apply_change(change);
        let snapshot = inner.gate.snapshot().clone();
        self.publish_snapshot(&snapshot);
        snapshot
    }

    fn publish_snapshot(&self, snapshot: &CapabilitySnapshot) {
        self.capabilities.set(snapshot.clone());
        self.publish(
            Topic::Capability,
            EventPayload::CapabilitiesUpdated(snapshot.clone()),
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SafetyController
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the safety state, the capability gate and the monitoring session for
/// one user.
///
/// Observation is read-only: subscribe to [`state`][Self::subscribe_state],
/// [`session`][Self::subscribe_session] or
/// [`capabilities`][Self::subscribe_capabilities], or to the event
/// [`bus`][Self::bus].
pub struct SafetyController {
    shared: Arc<Shared>,
    state: Observable<SafetyState>,
    session: Observable<Option<MonitoringSession>>,
    persistence: Arc<dyn PersistenceBackend>,
    provider: Arc<dyn CapabilityProvider>,
    evaluators: TriggerEvaluators,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl SafetyController {
    pub fn new(config: ControllerConfig, services: SafetyServices) -> Self {
        let bus = EventBus::default();
        let sessions =
            MonitoringSessionManager::new(services.evidence, bus.clone(), config.poll_interval);
        let session = sessions.observable();
        let gate = CapabilityGate::default();
        let capabilities = Observable::new(gate.snapshot().clone());

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner { gate, sessions }),
                capabilities,
                bus,
            }),
            state: Observable::new(SafetyState::Disabled),
            session,
            persistence: services.persistence,
            provider: services.capabilities,
            evaluators: TriggerEvaluators::from_settings(&config.gestures),
            watcher: StdMutex::new(None),
        }
    }

    // ── Observation ──────────────────────────────────────────────────────

    pub fn state(&self) -> SafetyState {
        self.state.get()
    }

    /// Every state write, including optimistic flips and their rollbacks.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SafetyState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> Option<MonitoringSession> {
        self.session.get()
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<Option<MonitoringSession>> {
        self.session.subscribe()
    }

    pub fn capabilities(&self) -> CapabilitySnapshot {
        self.shared.capabilities.get()
    }

    pub fn subscribe_capabilities(&self) -> broadcast::Receiver<CapabilitySnapshot> {
        self.shared.capabilities.subscribe()
    }

    /// A gate over the latest capability snapshot, for display.
    pub fn capability_gate(&self) -> CapabilityGate {
        CapabilityGate::new(self.capabilities())
    }

    pub fn bus(&self) -> EventBus {
        self.shared.bus.clone()
    }

    // ── Startup ──────────────────────────────────────────────────────────

    /// Check capabilities, then adopt the safety status of the first profile
    /// the persistence backend reports.
    ///
    /// A protected status re-creates a monitoring session so that a session
    /// exists exactly when the state is not Disabled.
    pub async fn initialize(&self) -> Result<SafetyState, SafetyError> {
        self.refresh_capabilities().await;

        let mut profiles = self.persistence.observe_user_profile();
        let profile = profiles.next().await.ok_or_else(|| {
            SafetyError::Persistence("profile stream ended before the first profile".into())
        })?;
        let status = profile.safety_status;

        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        self.state.set(status);

        if status.is_protected() && inner.sessions.current().is_none() {
            let mut session = inner.sessions.start(RESTORED_TRIGGER, &inner.gate);
            if status == SafetyState::Emergency {
                if let Some(escalated) = inner.sessions.escalate(Utc::now()) {
                    session = escalated;
                }
            }
            self.shared
                .publish(Topic::Session, EventPayload::SessionStarted(session));
        } else if !status.is_protected() {
            inner.sessions.discard().await;
        }

        info!(user_id = %profile.user_id, status = %status, "safety state restored from profile");
        Ok(status)
    }

    // ── Triggers ─────────────────────────────────────────────────────────

    /// Process one trigger, waiting behind any transition already in flight.
    ///
    /// Returns the state after the trigger.  A blocked activation returns
    /// [`SafetyError::CapabilityMissing`] naming the capability to request.
    #[instrument(skip(self, trigger), fields(trigger = trigger.trigger_method()))]
    pub async fn handle_trigger(&self, trigger: TriggerEvent) -> Result<SafetyState, SafetyError> {
        let mut inner = self.shared.inner.lock().await;
        self.process(&mut inner, &trigger).await
    }

    /// Like [`handle_trigger`][Self::handle_trigger] but refuses with
    /// [`SafetyError::ConcurrencyConflict`] instead of waiting.
    pub async fn try_handle_trigger(
        &self,
        trigger: TriggerEvent,
    ) -> Result<SafetyState, SafetyError> {
        let Ok(mut inner) = self.shared.inner.try_lock() else {
            debug!(trigger = trigger.trigger_method(), "transition in flight; trigger refused");
            return Err(SafetyError::ConcurrencyConflict);
        };
        self.process(&mut inner, &trigger).await
    }

    /// Run raw device input through the enabled evaluators.  `Ok(None)` when
    /// no evaluator fired.
    pub async fn handle_input(
        &self,
        input: GestureInput,
    ) -> Result<Option<SafetyState>, SafetyError> {
        let Some(trigger) = self.evaluators.evaluate(&input, self.state.get()) else {
            return Ok(None);
        };
        self.handle_trigger(trigger).await.map(Some)
    }

    pub async fn toggle(&self) -> Result<SafetyState, SafetyError> {
        self.handle_trigger(TriggerEvent::ManualToggle).await
    }

    pub async fn escalate(&self) -> Result<SafetyState, SafetyError> {
        self.handle_trigger(TriggerEvent::EscalationRequest).await
    }

    async fn process(
        &self,
        inner: &mut Inner,
        trigger: &TriggerEvent,
    ) -> Result<SafetyState, SafetyError> {
        let from = self.state.get();
        match decide(from, trigger, &inner.gate) {
            Decision::Ignored => {
                debug!(state = %from, "trigger has no effect in this state");
                Ok(from)
            }
            Decision::Blocked { missing } => {
                warn!(
                    capability = missing.as_str(),
                    "activation blocked: critical capability missing"
                );
                self.shared
                    .publish(Topic::Capability, EventPayload::CapabilityMissing(missing));
                Err(SafetyError::CapabilityMissing(missing))
            }
            Decision::Transition { to, effect } => {
                self.transition(inner, from, to, effect, trigger.trigger_method())
                    .await
            }
        }
    }

    async fn transition(
        &self,
        inner: &mut Inner,
        from: SafetyState,
        to: SafetyState,
        effect: SideEffect,
        trigger_method: &str,
    ) -> Result<SafetyState, SafetyError> {
        let previous_session = inner.sessions.current();

        self.state.set(to);
        let started = match effect {
            SideEffect::StartSession => Some(inner.sessions.start(trigger_method, &inner.gate)),
            SideEffect::MarkEmergency => {
                inner.sessions.escalate(Utc::now());
                None
            }
            SideEffect::FinalizeSession => None,
        };

        if let Err(e) = self.persistence.update_safety_status(to).await {
            warn!(from = %from, to = %to, error = %e, "status write failed; rolling back");
            self.state.set(from);
            match effect {
                SideEffect::StartSession => inner.sessions.discard().await,
                SideEffect::MarkEmergency => {
                    if let Some(previous) = &previous_session {
                        inner.sessions.revert_escalation(previous);
                    }
                }
                SideEffect::FinalizeSession => {}
            }
            self.shared.publish(
                Topic::Safety,
                EventPayload::StateRolledBack {
                    attempted: to,
                    restored: from,
                    reason: e.to_string(),
                },
            );
            return Err(match e {
                SafetyError::Persistence(_) => e,
                other => SafetyError::Persistence(other.to_string()),
            });
        }

        if let Some(session) = started {
            self.shared
                .publish(Topic::Session, EventPayload::SessionStarted(session));
        }
        if effect == SideEffect::FinalizeSession {
            match inner.sessions.finalize().await {
                Ok(Some(summary)) => self
                    .shared
                    .publish(Topic::Session, EventPayload::SessionFinalized(summary)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "session summary could not be stored"),
            }
        }

        info!(from = %from, to = %to, trigger = trigger_method, "safety state changed");
        self.shared.publish(
            Topic::Safety,
            EventPayload::StateChanged {
                from,
                to,
                trigger: trigger_method.to_string(),
            },
        );
        Ok(to)
    }

    // ── Capabilities ─────────────────────────────────────────────────────

    /// Re-check all five capabilities and replace the snapshot.
    pub async fn refresh_capabilities(&self) -> CapabilitySnapshot {
        let p = &self.provider;
        let snapshot = CapabilitySnapshot::new(
            p.check(Capability::Audio).await,
            p.check(Capability::Location).await,
            p.check(Capability::Camera).await,
            p.check(Capability::Storage).await,
            p.check(Capability::Sms).await,
        );

        let mut inner = self.shared.inner.lock().await;
        inner.gate.update(snapshot.clone());
        self.shared.publish_snapshot(&snapshot);
        debug!(
            critical = inner.gate.has_critical_capabilities(),
            optimal = inner.gate.has_all_optimal_capabilities(),
            "capabilities refreshed"
        );
        snapshot
    }

    /// Ask the user for `capability` and fold the answer into the gate.
    pub async fn request_capability(&self, capability: Capability) -> Result<bool, SafetyError> {
        let granted = self.provider.request(capability).await?;
        info!(capability = capability.as_str(), granted, "capability request answered");
        self.shared
            .fold_change(CapabilityChange {
                capability,
                granted,
            })
            .await;
        Ok(granted)
    }

    pub async fn apply_capability_change(&self, change: CapabilityChange) -> CapabilitySnapshot {
        self.shared.fold_change(change).await
    }

    /// Fold the provider's change stream into the gate until [`stop`][Self::stop].
    ///
    /// Must be called from within a Tokio runtime.  Calling it again while a
    /// watcher is running has no effect.
    pub fn watch_capabilities(&self) {
        let mut slot = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let mut changes = self.provider.changes();
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                debug!(
                    capability = change.capability.as_str(),
                    granted = change.granted,
                    "capability changed"
                );
                shared.fold_change(change).await;
            }
        }));
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Stop the capability watcher and evidence polling.  The state and any
    /// session are left as they are.
    pub async fn stop(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = watcher {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.inner.lock().await.sessions.stop().await;
        info!("safety controller stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
