use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Minimum confidence a [`MatchType::Fuzzy`] result needs to count as a match.
pub const FUZZY_ACCEPTANCE_THRESHOLD: f32 = 0.70;

/// Current protection posture of the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyState {
    #[default]
    Disabled,
    Active,
    Emergency,
}

impl SafetyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyState::Disabled => "disabled",
            SafetyState::Active => "active",
            SafetyState::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [SafetyState::Disabled, SafetyState::Active, SafetyState::Emergency]
            .into_iter()
            .find(|state| state.as_str() == s)
    }

    /// `true` for every state in which a monitoring session must exist.
    pub fn is_protected(&self) -> bool {
        !matches!(self, SafetyState::Disabled)
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime-gated permission or resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Audio,
    Location,
    Camera,
    Storage,
    Sms,
}

impl Capability {
    /// Every capability, most critical first.
    pub const PRIORITY: [Capability; 5] = [
        Capability::Audio,
        Capability::Location,
        Capability::Camera,
        Capability::Storage,
        Capability::Sms,
    ];

    /// Human-readable name of the protection feature this capability enables.
    pub fn label(&self) -> &'static str {
        match self {
            Capability::Audio => "Voice Evidence",
            Capability::Location => "Location Tracking",
            Capability::Camera => "Photo Evidence",
            Capability::Storage => "Evidence Storage",
            Capability::Sms => "SMS Messaging",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Audio => "audio",
            Capability::Location => "location",
            Capability::Camera => "camera",
            Capability::Storage => "storage",
            Capability::Sms => "sms",
        }
    }

    /// Parse the lowercase identifier produced by [`Capability::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|cap| cap.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of which capabilities were granted at `checked_at`.
///
/// Snapshots are never edited in place; [`CapabilitySnapshot::with`] returns
/// a fresh value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub audio: bool,
    pub location: bool,
    pub camera: bool,
    pub storage: bool,
    pub sms: bool,
    pub checked_at: DateTime<Utc>,
}

impl CapabilitySnapshot {
    pub fn new(audio: bool, location: bool, camera: bool, storage: bool, sms: bool) -> Self {
        Self {
            audio,
            location,
            camera,
            storage,
            sms,
            checked_at: Utc::now(),
        }
    }

    /// A snapshot in which nothing has been granted.
    pub fn none() -> Self {
        Self::new(false, false, false, false, false)
    }

    /// A snapshot in which everything has been granted.
    pub fn all() -> Self {
        Self::new(true, true, true, true, true)
    }

    /// Build a snapshot by asking `granted` about each capability.
    pub fn from_fn(mut granted: impl FnMut(Capability) -> bool) -> Self {
        Self::new(
            granted(Capability::Audio),
            granted(Capability::Location),
            granted(Capability::Camera),
            granted(Capability::Storage),
            granted(Capability::Sms),
        )
    }

    pub fn is_granted(&self, cap: Capability) -> bool {
        match cap {
            Capability::Audio => self.audio,
            Capability::Location => self.location,
            Capability::Camera => self.camera,
            Capability::Storage => self.storage,
            Capability::Sms => self.sms,
        }
    }

    /// Return a new snapshot with `cap` set to `granted` and a fresh timestamp.
    pub fn with(&self, cap: Capability, granted: bool) -> Self {
        Self::from_fn(|c| if c == cap { granted } else { self.is_granted(c) })
    }
}

impl Default for CapabilitySnapshot {
    fn default() -> Self {
        Self::none()
    }
}

/// A single change reported by the capability provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityChange {
    pub capability: Capability,
    pub granted: bool,
}

/// How closely a transcription matched the enrolled keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Contains,
    Fuzzy,
    NoMatch,
}

/// Result of classifying a transcription against the enrolled keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordMatchResult {
    /// Primary transcription text, as heard.
    pub transcribed_text: String,
    pub alternative_texts: Vec<String>,
    /// The candidate, primary or alternative, that produced `match_type`.
    /// Empty for [`MatchType::NoMatch`].
    #[serde(default)]
    pub matched_text: String,
    pub match_type: MatchType,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl KeywordMatchResult {
    /// A [`MatchType::NoMatch`] result with zero confidence.
    pub fn no_match(transcribed_text: impl Into<String>, alternative_texts: Vec<String>) -> Self {
        Self {
            transcribed_text: transcribed_text.into(),
            alternative_texts,
            matched_text: String::new(),
            match_type: MatchType::NoMatch,
            confidence: 0.0,
        }
    }

    /// Derived; never stored.
    pub fn is_match(&self) -> bool {
        match self.match_type {
            MatchType::Exact | MatchType::Contains => true,
            MatchType::Fuzzy => self.confidence >= FUZZY_ACCEPTANCE_THRESHOLD,
            MatchType::NoMatch => false,
        }
    }
}

/// An event requesting a safety-state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", content = "payload")]
pub enum TriggerEvent {
    ManualToggle,
    VolumeButtons { count: u32 },
    Shake { intensity: f32 },
    PowerButton { count: u32 },
    TapPattern { taps: Vec<DateTime<Utc>> },
    VoiceKeyword(KeywordMatchResult),
    EscalationRequest,
}

impl TriggerEvent {
    /// Stable label recorded as a session's trigger method.
    pub fn trigger_method(&self) -> &'static str {
        match self {
            TriggerEvent::ManualToggle => "manual",
            TriggerEvent::VolumeButtons { .. } => "volume_buttons",
            TriggerEvent::Shake { .. } => "shake",
            TriggerEvent::PowerButton { .. } => "power_button",
            TriggerEvent::TapPattern { .. } => "tap_pattern",
            TriggerEvent::VoiceKeyword(_) => "voice_keyword",
            TriggerEvent::EscalationRequest => "escalation",
        }
    }
}

/// Raw device input handed to the trigger evaluators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GestureInput {
    VolumeButtons { count: u32 },
    Shake { intensity: f32 },
    PowerButton { count: u32 },
    Taps { taps: Vec<DateTime<Utc>> },
    Utterance(KeywordMatchResult),
}

/// Category of evidence aggregated during a monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceCategory {
    Location,
    Photo,
    Audio,
    Transcription,
}

impl EvidenceCategory {
    pub const ALL: [EvidenceCategory; 4] = [
        EvidenceCategory::Location,
        EvidenceCategory::Photo,
        EvidenceCategory::Audio,
        EvidenceCategory::Transcription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceCategory::Location => "location",
            EvidenceCategory::Photo => "photo",
            EvidenceCategory::Audio => "audio",
            EvidenceCategory::Transcription => "transcription",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

pub type EvidenceCounts = BTreeMap<EvidenceCategory, u32>;

/// A bounded period of active protection.
///
/// Updated through the `with_*` / [`escalated`][Self::escalated] functions,
/// which return new instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub evidence_counts: EvidenceCounts,
    pub trigger_method: String,
    pub emergency_triggered: bool,
    pub emergency_time: Option<DateTime<Utc>>,
    pub active_capabilities: Vec<String>,
    pub missing_capabilities: Vec<String>,
}

impl MonitoringSession {
    pub fn with_evidence_counts(&self, evidence_counts: EvidenceCounts) -> Self {
        Self {
            evidence_counts,
            ..self.clone()
        }
    }

    /// Mark the session as escalated at `at`.  An already-escalated session
    /// keeps its original emergency time.
    pub fn escalated(&self, at: DateTime<Utc>) -> Self {
        Self {
            emergency_triggered: true,
            emergency_time: self.emergency_time.or(Some(at)),
            ..self.clone()
        }
    }

    pub fn total_evidence(&self) -> u32 {
        self.evidence_counts.values().sum()
    }

    /// Summary shape persisted when the session ends at `ended_at`.
    pub fn summary(&self, ended_at: DateTime<Utc>) -> SessionSummary {
        let millis = (ended_at - self.start_time).num_milliseconds().max(0);
        SessionSummary {
            session_id: self.session_id.clone(),
            duration_seconds: millis as f64 / 1000.0,
            evidence_counts: self.evidence_counts.clone(),
            trigger_method: self.trigger_method.clone(),
            emergency_triggered: self.emergency_triggered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration_seconds: f64,
    pub evidence_counts: EvidenceCounts,
    pub trigger_method: String,
    pub emergency_triggered: bool,
}

/// The durable record of an enrolled voice keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordEnrollment {
    pub keyword: String,
    pub sample_hash: String,
    pub sample_url: String,
}

/// User profile as observed from the persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub safety_status: SafetyState,
}

/// Opaque handle to a stored audio clip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioRef(pub String);

impl fmt::Display for AudioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to an in-progress recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordingHandle(pub Uuid);

/// Raw audio returned by the capture device when a recording stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedAudio {
    pub audio_ref: AudioRef,
    pub bytes: Vec<u8>,
}

/// Output of the speech-to-text collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub alternative_texts: Vec<String>,
}

/// Metadata sent alongside an uploaded voice sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub keyword: String,
    pub sample_hash: String,
    pub duration_seconds: f32,
}

/// Unified event wrapper for the observation bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "aegis-runtime::controller"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the observation bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    StateChanged {
        from: SafetyState,
        to: SafetyState,
        trigger: String,
    },
    /// An optimistic transition was reverted because persistence failed.
    StateRolledBack {
        attempted: SafetyState,
        restored: SafetyState,
        reason: String,
    },
    /// A trigger was refused; the caller should request this capability.
    CapabilityMissing(Capability),
    CapabilitiesUpdated(CapabilitySnapshot),
    SessionStarted(MonitoringSession),
    EvidenceUpdated {
        session_id: String,
        counts: EvidenceCounts,
    },
    SessionFinalized(SessionSummary),
    EnrollmentSaved(KeywordEnrollment),
}

/// The keyword rule that a candidate keyword broke.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("keyword must not be blank")]
    Blank,

    #[error("keyword has {len} characters; at least {min} are required")]
    TooShort { len: usize, min: usize },

    #[error("keyword has {len} characters; at most {max} are allowed")]
    TooLong { len: usize, max: usize },

    #[error("keyword may only contain letters, found {0:?}")]
    InvalidCharacter(char),

    #[error("\"{0}\" is too common to be used as a keyword")]
    Forbidden(String),
}

/// Global error type for the safety core.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyError {
    #[error("Invalid keyword: {0}")]
    Validation(#[from] ValidationError),

    #[error("Capability Missing: {0}")]
    CapabilityMissing(Capability),

    #[error("Recording Error: {0}")]
    Recording(String),

    #[error("Transcription Error: {0}")]
    Transcription(String),

    #[error("Upload Error: {0}")]
    Upload(String),

    #[error("Persistence Error: {0}")]
    Persistence(String),

    /// Another transition was in flight.  Absorbed by trigger serialization.
    #[error("Concurrency Conflict: a transition is already in progress")]
    ConcurrencyConflict,

    #[error("Channel Error: {0}")]
    Channel(String),
}
