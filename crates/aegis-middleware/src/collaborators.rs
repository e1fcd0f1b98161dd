//! The collaborator seam.
//!
//! The safety core never talks to a database, the OS permission dialog, a
//! microphone or a speech-recognition service directly.  It calls one of the
//! traits below, and the host wires in an implementation (SQLite, a platform
//! bridge, or the [`sim`][crate::sim] stand-ins).
//!
//! Every fallible operation returns [`SafetyError`] so failures surface with
//! the taxonomy the UI layer understands.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use aegis_types::{
    AudioRef, Capability, CapabilityChange, CapturedAudio, EvidenceCounts, KeywordEnrollment,
    MonitoringSession, Profile, RecordingHandle, SafetyError, SafetyState, SessionSummary,
    Transcription, UploadMetadata,
};

/// Durable storage for the user profile and enrolled keywords.
///
/// # Contract
///
/// * `update_safety_status` – resolves only once the new status is durable.
///   A failure here makes the state machine roll back.
/// * `observe_user_profile` – a live stream of the profile; the first item is
///   the currently stored profile.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn update_safety_status(&self, status: SafetyState) -> Result<(), SafetyError>;

    fn observe_user_profile(&self) -> BoxStream<'static, Profile>;

    async fn save_keyword_enrollment(&self, record: &KeywordEnrollment) -> Result<(), SafetyError>;
}

/// Access to the platform permission system.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Whether `capability` is currently granted.
    async fn check(&self, capability: Capability) -> bool;

    /// Ask the user for `capability`.  `Ok(false)` means the user declined.
    async fn request(&self, capability: Capability) -> Result<bool, SafetyError>;

    /// Grants and revocations observed after subscription.
    fn changes(&self) -> BoxStream<'static, CapabilityChange>;
}

/// Read side of the evidence collected during a monitoring session.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn counts_for_session(&self, session_id: &str) -> Result<EvidenceCounts, SafetyError>;

    /// Persist the summary of `session` as it stands when monitoring ends.
    async fn create_session_summary(
        &self,
        session: &MonitoringSession,
    ) -> Result<SessionSummary, SafetyError>;
}

/// Microphone capture.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn start_recording(&self) -> Result<RecordingHandle, SafetyError>;

    async fn stop_recording(&self, handle: RecordingHandle) -> Result<CapturedAudio, SafetyError>;

    /// Current input level for a live meter, `0` when nothing is recording.
    fn current_amplitude(&self, handle: RecordingHandle) -> u32;
}

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, audio: &AudioRef) -> Result<(), SafetyError>;

    async fn stop(&self);

    /// `false` once the clip has ended, whether stopped or played out.
    fn is_playing(&self) -> bool;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioRef) -> Result<Transcription, SafetyError>;
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload the clip behind `audio` and return its remote URL.
    async fn upload(
        &self,
        audio: &AudioRef,
        metadata: &UploadMetadata,
    ) -> Result<String, SafetyError>;
}
