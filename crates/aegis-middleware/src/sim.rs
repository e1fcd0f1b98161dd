//! In-process simulated collaborators for headless runs and tests.
//!
//! Every stand-in records what it was asked to do and can be scripted to fail,
//! so the full safety stack can run without a phone, a database or a network.
//!
//! # Example
//!
//! ```rust
//! use aegis_middleware::Transcriber;
//! use aegis_middleware::sim::SimTranscriber;
//! use aegis_types::AudioRef;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let transcriber = SimTranscriber::new("phoenix");
//!     let heard = transcriber.transcribe(&AudioRef("clip".into())).await.unwrap();
//!     assert_eq!(heard.text, "phoenix");
//! });
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use aegis_types::{
    AudioRef, Capability, CapabilityChange, CapabilitySnapshot, CapturedAudio, EvidenceCategory,
    EvidenceCounts, KeywordEnrollment, MonitoringSession, Profile, RecordingHandle, SafetyError,
    SafetyState, SessionSummary, Transcription, UploadMetadata,
};

use crate::collaborators::{
    AudioCapture, AudioPlayer, CapabilityProvider, EvidenceStore, PersistenceBackend, Transcriber,
    Uploader,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn simulate_latency(latency: &Mutex<Duration>) {
    let latency = *lock(latency);
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Persistence
// ────────────────────────────────────────────────────────────────────────────

/// Simulated profile store.  Status writes update the observed profile.
pub struct SimPersistence {
    profile: watch::Sender<Profile>,
    fail_status_updates: AtomicBool,
    fail_enrollments: AtomicBool,
    latency: Mutex<Duration>,
    status_updates: Mutex<Vec<SafetyState>>,
    enrollments: Mutex<Vec<KeywordEnrollment>>,
}

impl SimPersistence {
    pub fn new(user_id: impl Into<String>) -> Self {
        let (profile, _) = watch::channel(Profile {
            user_id: user_id.into(),
            safety_status: SafetyState::Disabled,
        });
        Self {
            profile,
            fail_status_updates: AtomicBool::new(false),
            fail_enrollments: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            status_updates: Mutex::new(Vec::new()),
            enrollments: Mutex::new(Vec::new()),
        }
    }

    /// Start with `status` already stored, as if restored from a prior run.
    pub fn with_status(self, status: SafetyState) -> Self {
        self.profile.send_modify(|p| p.safety_status = status);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_status_updates.store(failing, Ordering::SeqCst);
    }

    pub fn set_enrollment_failing(&self, failing: bool) {
        self.fail_enrollments.store(failing, Ordering::SeqCst);
    }

    /// Delay applied to every status write.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Push a profile as if it changed on another device.
    pub fn push_profile(&self, profile: Profile) {
        self.profile.send_replace(profile);
    }

    pub fn stored_status(&self) -> SafetyState {
        self.profile.borrow().safety_status
    }

    /// Every successfully persisted status, in write order.
    pub fn status_updates(&self) -> Vec<SafetyState> {
        lock(&self.status_updates).clone()
    }

    pub fn enrollments(&self) -> Vec<KeywordEnrollment> {
        lock(&self.enrollments).clone()
    }
}

#[async_trait]
impl PersistenceBackend for SimPersistence {
    async fn update_safety_status(&self, status: SafetyState) -> Result<(), SafetyError> {
        simulate_latency(&self.latency).await;
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(SafetyError::Persistence("simulated write failure".into()));
        }
        lock(&self.status_updates).push(status);
        self.profile.send_modify(|p| p.safety_status = status);
        Ok(())
    }

    fn observe_user_profile(&self) -> BoxStream<'static, Profile> {
        let rx = self.profile.subscribe();
        stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let profile = rx.borrow_and_update().clone();
            Some((profile, (rx, false)))
        })
        .boxed()
    }

    async fn save_keyword_enrollment(&self, record: &KeywordEnrollment) -> Result<(), SafetyError> {
        if self.fail_enrollments.load(Ordering::SeqCst) {
            return Err(SafetyError::Persistence("simulated enrollment write failure".into()));
        }
        lock(&self.enrollments).push(record.clone());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Capabilities
// ────────────────────────────────────────────────────────────────────────────

/// Simulated permission system.
pub struct SimCapabilityProvider {
    granted: Mutex<CapabilitySnapshot>,
    grant_on_request: AtomicBool,
    changes: broadcast::Sender<CapabilityChange>,
    requests: Mutex<Vec<Capability>>,
}

impl SimCapabilityProvider {
    pub fn new(granted: CapabilitySnapshot) -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            granted: Mutex::new(granted),
            grant_on_request: AtomicBool::new(true),
            changes,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Grant or revoke `capability` and notify change subscribers.
    pub fn set(&self, capability: Capability, granted: bool) {
        {
            let mut snapshot = lock(&self.granted);
            *snapshot = snapshot.with(capability, granted);
        }
        let _ = self.changes.send(CapabilityChange {
            capability,
            granted,
        });
    }

    /// Whether the simulated user accepts permission prompts.
    pub fn set_grant_on_request(&self, grant: bool) {
        self.grant_on_request.store(grant, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Capability> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl CapabilityProvider for SimCapabilityProvider {
    async fn check(&self, capability: Capability) -> bool {
        lock(&self.granted).is_granted(capability)
    }

    async fn request(&self, capability: Capability) -> Result<bool, SafetyError> {
        lock(&self.requests).push(capability);
        if self.grant_on_request.load(Ordering::SeqCst) {
            self.set(capability, true);
            return Ok(true);
        }
        Ok(lock(&self.granted).is_granted(capability))
    }

    fn changes(&self) -> BoxStream<'static, CapabilityChange> {
        let rx = self.changes.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(change) => return Some((change, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Evidence
// ────────────────────────────────────────────────────────────────────────────

/// Simulated evidence store that also tracks how polls overlap.
pub struct SimEvidenceStore {
    counts: Mutex<HashMap<String, EvidenceCounts>>,
    fail_counts: AtomicBool,
    fail_summaries: AtomicBool,
    latency: Mutex<Duration>,
    count_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    summaries: Mutex<Vec<SessionSummary>>,
}

impl SimEvidenceStore {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            fail_counts: AtomicBool::new(false),
            fail_summaries: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            count_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            summaries: Mutex::new(Vec::new()),
        }
    }

    /// Record one item of evidence for `session_id`.
    pub fn record(&self, session_id: &str, category: EvidenceCategory) {
        *lock(&self.counts)
            .entry(session_id.to_string())
            .or_default()
            .entry(category)
            .or_insert(0) += 1;
    }

    pub fn set_counts_failing(&self, failing: bool) {
        self.fail_counts.store(failing, Ordering::SeqCst);
    }

    pub fn set_summaries_failing(&self, failing: bool) {
        self.fail_summaries.store(failing, Ordering::SeqCst);
    }

    /// Delay applied to every count query.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    /// Highest number of count queries that were ever running at once.
    pub fn max_concurrent_count_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        lock(&self.summaries).clone()
    }

    fn counts_of(&self, session_id: &str) -> EvidenceCounts {
        lock(&self.counts)
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for SimEvidenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvidenceStore for SimEvidenceStore {
    async fn counts_for_session(&self, session_id: &str) -> Result<EvidenceCounts, SafetyError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        simulate_latency(&self.latency).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(SafetyError::Persistence("simulated evidence query failure".into()));
        }
        Ok(self.counts_of(session_id))
    }

    async fn create_session_summary(
        &self,
        session: &MonitoringSession,
    ) -> Result<SessionSummary, SafetyError> {
        if self.fail_summaries.load(Ordering::SeqCst) {
            return Err(SafetyError::Persistence("simulated summary write failure".into()));
        }
        let summary = session
            .with_evidence_counts(self.counts_of(&session.session_id))
            .summary(Utc::now());
        lock(&self.summaries).push(summary.clone());
        Ok(summary)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Audio
// ────────────────────────────────────────────────────────────────────────────

/// Simulated microphone.  Produces a deterministic clip per recording.
pub struct SimAudioCapture {
    active: Mutex<Option<RecordingHandle>>,
    fail_start: AtomicBool,
}

impl SimAudioCapture {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn set_start_failing(&self, failing: bool) {
        self.fail_start.store(failing, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.active).is_some()
    }
}

impl Default for SimAudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioCapture for SimAudioCapture {
    async fn start_recording(&self) -> Result<RecordingHandle, SafetyError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SafetyError::Recording("microphone unavailable".into()));
        }
        let handle = RecordingHandle(Uuid::new_v4());
        *lock(&self.active) = Some(handle);
        Ok(handle)
    }

    async fn stop_recording(&self, handle: RecordingHandle) -> Result<CapturedAudio, SafetyError> {
        let mut active = lock(&self.active);
        if *active != Some(handle) {
            return Err(SafetyError::Recording(format!(
                "no active recording for {}",
                handle.0
            )));
        }
        *active = None;
        Ok(CapturedAudio {
            audio_ref: AudioRef(format!("sim://audio/{}.m4a", handle.0)),
            bytes: handle.0.as_bytes().repeat(64),
        })
    }

    fn current_amplitude(&self, handle: RecordingHandle) -> u32 {
        if *lock(&self.active) == Some(handle) {
            1_200
        } else {
            0
        }
    }
}

/// Simulated speaker.  A clip plays until [`AudioPlayer::stop`] is called
/// or the test ends it with [`SimAudioPlayer::finish`].
pub struct SimAudioPlayer {
    playing: AtomicBool,
    played: Mutex<Vec<AudioRef>>,
}

impl SimAudioPlayer {
    pub fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            played: Mutex::new(Vec::new()),
        }
    }

    /// End the current clip as if it had played to the end.
    pub fn finish(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    pub fn played(&self) -> Vec<AudioRef> {
        lock(&self.played).clone()
    }
}

impl Default for SimAudioPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioPlayer for SimAudioPlayer {
    async fn play(&self, audio: &AudioRef) -> Result<(), SafetyError> {
        lock(&self.played).push(audio.clone());
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Speech
// ────────────────────────────────────────────────────────────────────────────

/// Scripted speech-to-text.  Returns whatever it was last told to hear.
pub struct SimTranscriber {
    response: Mutex<Result<Transcription, String>>,
    calls: AtomicUsize,
}

impl SimTranscriber {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            response: Mutex::new(Ok(Transcription {
                text: text.into(),
                alternative_texts: Vec::new(),
            })),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_transcription(&self, text: impl Into<String>, alternative_texts: Vec<String>) {
        *lock(&self.response) = Ok(Transcription {
            text: text.into(),
            alternative_texts,
        });
    }

    pub fn set_failure(&self, message: impl Into<String>) {
        *lock(&self.response) = Err(message.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for SimTranscriber {
    async fn transcribe(&self, _audio: &AudioRef) -> Result<Transcription, SafetyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.response)
            .clone()
            .map_err(SafetyError::Transcription)
    }
}

/// Simulated upload endpoint.
pub struct SimUploader {
    fail: AtomicBool,
    uploads: Mutex<Vec<UploadMetadata>>,
}

impl SimUploader {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<UploadMetadata> {
        lock(&self.uploads).clone()
    }
}

impl Default for SimUploader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Uploader for SimUploader {
    async fn upload(
        &self,
        _audio: &AudioRef,
        metadata: &UploadMetadata,
    ) -> Result<String, SafetyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SafetyError::Upload("simulated network failure".into()));
        }
        lock(&self.uploads).push(metadata.clone());
        Ok(format!("sim://uploads/{}.m4a", metadata.sample_hash))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persistence_failure_leaves_profile_untouched() {
        let store = SimPersistence::new("user-1");
        store.set_failing(true);
        let result = store.update_safety_status(SafetyState::Active).await;
        assert!(matches!(result, Err(SafetyError::Persistence(_))));
        assert_eq!(store.stored_status(), SafetyState::Disabled);
        assert!(store.status_updates().is_empty());
    }

    #[tokio::test]
    async fn profile_stream_yields_current_then_changes() {
        let store = SimPersistence::new("user-1").with_status(SafetyState::Active);
        let mut profiles = store.observe_user_profile();

        let first = profiles.next().await.expect("current profile");
        assert_eq!(first.safety_status, SafetyState::Active);

        store
            .update_safety_status(SafetyState::Disabled)
            .await
            .expect("write succeeds");
        let second = profiles.next().await.expect("updated profile");
        assert_eq!(second.safety_status, SafetyState::Disabled);
    }

    #[tokio::test]
    async fn capability_request_grants_and_notifies() {
        let provider = SimCapabilityProvider::new(CapabilitySnapshot::none());
        let mut changes = provider.changes();

        assert!(!provider.check(Capability::Audio).await);
        assert!(provider.request(Capability::Audio).await.expect("request"));
        assert!(provider.check(Capability::Audio).await);

        let change = changes.next().await.expect("change");
        assert_eq!(
            change,
            CapabilityChange {
                capability: Capability::Audio,
                granted: true
            }
        );
        assert_eq!(provider.requests(), vec![Capability::Audio]);
    }

    #[tokio::test]
    async fn declined_request_returns_false() {
        let provider = SimCapabilityProvider::new(CapabilitySnapshot::none());
        provider.set_grant_on_request(false);
        assert!(!provider.request(Capability::Sms).await.expect("request"));
    }

    #[tokio::test]
    async fn evidence_counts_accumulate_per_session() {
        let store = SimEvidenceStore::new();
        store.record("s1", EvidenceCategory::Photo);
        store.record("s1", EvidenceCategory::Photo);
        store.record("s2", EvidenceCategory::Audio);

        let counts = store.counts_for_session("s1").await.expect("counts");
        assert_eq!(counts.get(&EvidenceCategory::Photo), Some(&2));
        assert_eq!(counts.get(&EvidenceCategory::Audio), None);
        assert_eq!(store.count_calls(), 1);
    }

    #[tokio::test]
    async fn capture_rejects_unknown_handle() {
        let capture = SimAudioCapture::new();
        let handle = capture.start_recording().await.expect("start");
        assert_eq!(capture.current_amplitude(handle), 1_200);

        let other = RecordingHandle(Uuid::new_v4());
        assert!(matches!(
            capture.stop_recording(other).await,
            Err(SafetyError::Recording(_))
        ));

        let clip = capture.stop_recording(handle).await.expect("stop");
        assert!(!clip.bytes.is_empty());
        assert_eq!(capture.current_amplitude(handle), 0);
    }

    #[tokio::test]
    async fn transcriber_failure_maps_to_transcription_error() {
        let transcriber = SimTranscriber::new("phoenix");
        transcriber.set_failure("service unavailable");
        let result = transcriber.transcribe(&AudioRef("a".into())).await;
        assert_eq!(
            result,
            Err(SafetyError::Transcription("service unavailable".into()))
        );
    }

    #[tokio::test]
    async fn uploader_returns_url_keyed_by_hash() {
        let uploader = SimUploader::new();
        let meta = UploadMetadata {
            keyword: "phoenix".into(),
            sample_hash: "abc123".into(),
            duration_seconds: 2.0,
        };
        let url = uploader
            .upload(&AudioRef("a".into()), &meta)
            .await
            .expect("upload");
        assert_eq!(url, "sim://uploads/abc123.m4a");
        assert_eq!(uploader.uploads(), vec![meta]);
    }
}
