//! [`VoiceEnrollment`] – the keyword enrollment pipeline.
//!
//! ```text
//! Idle ──start──▶ Recording ──stop (≥ 1.5 s)──▶ Recorded ──verify──▶ Transcribing
//!   ▲                 │                            │                    │
//!   └── too short ────┘                            │          Verified / Unverified
//!                                                  └────────save────────┴──▶ Saved
//! ```
//!
//! Any stage can be left with [`VoiceEnrollment::discard`].
//!
//! Every take runs in a recorder task that releases the microphone at
//! [`MAX_RECORDING`] even if nobody calls [`VoiceEnrollment::stop_recording`];
//! the finished take then shows up as [`EnrollmentStage::Recorded`].  A take
//! shorter than [`MIN_RECORDING`] is thrown away with
//! [`SafetyError::Recording`].
//!
//! The recorder and the player never run at the same time: starting one
//! releases the other.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use aegis_middleware::{
    AudioCapture, AudioPlayer, EventBus, PersistenceBackend, Topic, Transcriber, Uploader,
};
use aegis_types::{
    AudioRef, CapturedAudio, Event, EventPayload, KeywordEnrollment, KeywordMatchResult,
    RecordingHandle, SafetyError, UploadMetadata, ValidationError,
};

use crate::keyword::validate_keyword;
use crate::matcher::classify;

pub const MIN_RECORDING: Duration = Duration::from_millis(1_500);
pub const MAX_RECORDING: Duration = Duration::from_secs(5);

const SOURCE: &str = "aegis-voice::enrollment";

/// Where the enrollment flow currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStage {
    Idle,
    Recording,
    Recorded,
    Transcribing,
    Verified,
    Unverified,
    Saved,
    Discarded,
}

/// External collaborators the pipeline drives.
#[derive(Clone)]
pub struct EnrollmentServices {
    pub capture: Arc<dyn AudioCapture>,
    pub player: Arc<dyn AudioPlayer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub uploader: Arc<dyn Uploader>,
    pub persistence: Arc<dyn PersistenceBackend>,
}

/// A finished take, owned by the pipeline until it is saved or dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSample {
    pub audio_ref: AudioRef,
    pub duration_seconds: f32,
    pub keyword_text: String,
    /// Hex SHA-256 of the raw audio bytes.
    pub integrity_hash: String,
    bytes: Vec<u8>,
}

impl VoiceSample {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn is_intact(&self) -> bool {
        sha256_hex(&self.bytes) == self.integrity_hash
    }
}

/// Written once by the recorder task when the device has been released.
type TakeSlot = Arc<Mutex<Option<Result<VoiceSample, SafetyError>>>>;

struct ActiveRecording {
    handle: RecordingHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    outcome: TakeSlot,
}

impl ActiveRecording {
    fn slot(&self) -> MutexGuard<'_, Option<Result<VoiceSample, SafetyError>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_finished(&self) -> bool {
        self.slot().is_some()
    }

    /// Ask the task to stop the device and wait for it to do so.
    async fn finish(self) -> Option<Result<VoiceSample, SafetyError>> {
        // The task may already have stopped at the deadline.
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "recorder task failed");
        }
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Single-owner enrollment form.  All mutation goes through `&mut self`, so
/// one flow can never interleave with itself.
pub struct VoiceEnrollment {
    services: EnrollmentServices,
    bus: EventBus,
    stage: EnrollmentStage,
    keyword: Option<String>,
    recording: Option<ActiveRecording>,
    sample: Option<VoiceSample>,
    match_result: Option<KeywordMatchResult>,
    accepted_unverified: bool,
    playing: bool,
}

impl VoiceEnrollment {
    pub fn new(services: EnrollmentServices, bus: EventBus) -> Self {
        Self {
            services,
            bus,
            stage: EnrollmentStage::Idle,
            keyword: None,
            recording: None,
            sample: None,
            match_result: None,
            accepted_unverified: false,
            playing: false,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn stage(&self) -> EnrollmentStage {
        match self.auto_stopped() {
            Some(true) => EnrollmentStage::Recorded,
            Some(false) => EnrollmentStage::Idle,
            None => self.stage,
        }
    }

    pub fn keyword(&self) -> Option<&str> {
        self.keyword.as_deref()
    }

    pub fn has_recording(&self) -> bool {
        self.sample.is_some() || self.auto_stopped() == Some(true)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.as_ref().is_some_and(|active| !active.is_finished())
    }

    /// `true` while the player is still sounding the sample.
    pub fn is_playing(&self) -> bool {
        self.playing && self.services.player.is_playing()
    }

    pub fn sample(&self) -> Option<VoiceSample> {
        if let Some(sample) = &self.sample {
            return Some(sample.clone());
        }
        let active = self.recording.as_ref()?;
        let slot = active.slot();
        match slot.as_ref() {
            Some(Ok(sample)) => Some(sample.clone()),
            _ => None,
        }
    }

    /// Outcome of the last [`verify`][Self::verify], if any.
    pub fn match_result(&self) -> Option<&KeywordMatchResult> {
        self.match_result.as_ref()
    }

    /// Live input level for a meter; `0` when not recording.
    pub fn current_amplitude(&self) -> u32 {
        match &self.recording {
            Some(active) if !active.is_finished() => {
                self.services.capture.current_amplitude(active.handle)
            }
            _ => 0,
        }
    }

    /// Outcome of a take the recorder task ended on its own, not yet folded
    /// into the form: `Some(true)` for a usable sample.
    fn auto_stopped(&self) -> Option<bool> {
        let active = self.recording.as_ref()?;
        let slot = active.slot();
        slot.as_ref().map(Result::is_ok)
    }

    // ── Keyword ──────────────────────────────────────────────────────────

    /// Validate and store the keyword.  Changing it drops any existing
    /// sample, which was spoken for the old keyword.
    pub fn set_keyword(&mut self, raw: &str) -> Result<(), SafetyError> {
        self.settle();
        if self.recording.is_some() {
            return Err(SafetyError::Recording(
                "cannot change the keyword while recording".into(),
            ));
        }
        let keyword = validate_keyword(raw)?;
        if self.sample.is_some() && self.keyword.as_deref() != Some(keyword.as_str()) {
            debug!("keyword changed; dropping previous sample");
            self.clear_sample();
        }
        self.keyword = Some(keyword);
        if matches!(
            self.stage,
            EnrollmentStage::Saved | EnrollmentStage::Discarded
        ) {
            self.stage = EnrollmentStage::Idle;
        }
        Ok(())
    }

    // ── Recording ────────────────────────────────────────────────────────

    /// Begin a new take.  Stops playback and replaces any previous sample.
    ///
    /// The device is released after [`MAX_RECORDING`] whether or not
    /// [`stop_recording`][Self::stop_recording] is called.
    pub async fn start_recording(&mut self) -> Result<(), SafetyError> {
        self.settle();
        if self.keyword.is_none() {
            return Err(ValidationError::Blank.into());
        }
        if self.recording.is_some() {
            return Err(SafetyError::Recording("already recording".into()));
        }
        self.stop_playback().await;
        self.clear_sample();

        let handle = self.services.capture.start_recording().await?;
        let started = Instant::now();
        let (stop, stop_rx) = oneshot::channel();
        let outcome = TakeSlot::default();
        let task = tokio::spawn(run_take(
            self.services.capture.clone(),
            handle,
            started,
            self.keyword.clone().unwrap_or_default(),
            stop_rx,
            outcome.clone(),
        ));
        self.recording = Some(ActiveRecording {
            handle,
            stop,
            task,
            outcome,
        });
        self.stage = EnrollmentStage::Recording;
        info!("voice recording started");
        Ok(())
    }

    /// Finish the current take.  A take that already hit [`MAX_RECORDING`]
    /// is returned as captured at that boundary.
    pub async fn stop_recording(&mut self) -> Result<(), SafetyError> {
        let Some(active) = self.recording.take() else {
            return Err(SafetyError::Recording("no recording in progress".into()));
        };
        let outcome = active.finish().await;
        self.absorb(outcome)
    }

    /// Record until `stop` resolves or [`MAX_RECORDING`] elapses, whichever
    /// comes first.
    pub async fn record_until<F>(&mut self, stop: F) -> Result<(), SafetyError>
    where
        F: Future<Output = ()>,
    {
        self.start_recording().await?;
        tokio::select! {
            () = stop => debug!("recording stopped by caller"),
            () = tokio::time::sleep(MAX_RECORDING) => {
                info!("recording reached maximum duration; stopping");
            }
        }
        self.stop_recording().await
    }

    async fn cancel_recording(&mut self) {
        if let Some(active) = self.recording.take() {
            active.finish().await;
            self.stage = EnrollmentStage::Idle;
        }
    }

    /// Fold a take the recorder task already ended into the form.
    fn settle(&mut self) {
        if !self.recording.as_ref().is_some_and(ActiveRecording::is_finished) {
            return;
        }
        if let Some(active) = self.recording.take() {
            let outcome = active.slot().take();
            // The task already logged a failed take.
            let _ = self.absorb(outcome);
        }
    }

    fn absorb(
        &mut self,
        outcome: Option<Result<VoiceSample, SafetyError>>,
    ) -> Result<(), SafetyError> {
        match outcome {
            Some(Ok(sample)) => {
                self.sample = Some(sample);
                self.stage = EnrollmentStage::Recorded;
                Ok(())
            }
            Some(Err(e)) => {
                self.stage = EnrollmentStage::Idle;
                Err(e)
            }
            None => {
                self.stage = EnrollmentStage::Idle;
                Err(SafetyError::Recording("recording ended without a take".into()))
            }
        }
    }

    // ── Playback ─────────────────────────────────────────────────────────

    /// Play the current sample back.  Releases the recorder first.
    pub async fn play(&mut self) -> Result<(), SafetyError> {
        self.settle();
        self.cancel_recording().await;
        let Some(sample) = &self.sample else {
            return Err(SafetyError::Recording("no recording to play".into()));
        };
        self.services.player.play(&sample.audio_ref).await?;
        self.playing = true;
        Ok(())
    }

    pub async fn stop_playback(&mut self) {
        if self.playing {
            self.services.player.stop().await;
            self.playing = false;
        }
    }

    /// Drop the current sample.  Refused while the recorder or player is busy.
    pub fn delete_recording(&mut self) -> Result<(), SafetyError> {
        self.settle();
        if self.recording.is_some() || self.is_playing() {
            return Err(SafetyError::Recording(
                "cannot delete a sample while recording or playing".into(),
            ));
        }
        self.clear_sample();
        Ok(())
    }

    // ── Verification ─────────────────────────────────────────────────────

    /// Transcribe the sample and classify it against the keyword.
    ///
    /// A transcription failure is recorded as `NoMatch`, leaves the sample
    /// in place for a retry, and is returned as the error.
    pub async fn verify(&mut self) -> Result<KeywordMatchResult, SafetyError> {
        self.settle();
        let Some(sample) = &self.sample else {
            return Err(SafetyError::Recording("no recording to verify".into()));
        };
        let audio_ref = sample.audio_ref.clone();
        let keyword = sample.keyword_text.clone();

        self.stage = EnrollmentStage::Transcribing;
        self.accepted_unverified = false;

        match self.services.transcriber.transcribe(&audio_ref).await {
            Ok(transcription) => {
                let result = classify(&transcription, &keyword);
                self.stage = if result.is_match() {
                    EnrollmentStage::Verified
                } else {
                    EnrollmentStage::Unverified
                };
                info!(
                    match_type = ?result.match_type,
                    confidence = result.confidence,
                    "voice sample classified"
                );
                self.match_result = Some(result.clone());
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "transcription failed; sample kept for retry");
                self.match_result = Some(KeywordMatchResult::no_match("", Vec::new()));
                self.stage = EnrollmentStage::Unverified;
                Err(e)
            }
        }
    }

    /// Allow saving a sample that did not verify.  The saved keyword still
    /// arms the voice trigger.
    pub fn accept_unverified(&mut self) -> Result<(), SafetyError> {
        self.settle();
        if self.sample.is_none() {
            return Err(SafetyError::Recording("no recording to accept".into()));
        }
        if self.stage != EnrollmentStage::Verified {
            warn!("unverified voice sample accepted; it will still arm the voice trigger");
            self.accepted_unverified = true;
        }
        Ok(())
    }

    // ── Save / discard ───────────────────────────────────────────────────

    /// Upload the sample, persist the enrollment record and clear the form.
    ///
    /// On failure the sample and keyword stay in place so the user can retry
    /// without recording again.
    pub async fn save(&mut self) -> Result<KeywordEnrollment, SafetyError> {
        self.settle();
        if self.recording.is_some() {
            return Err(SafetyError::Recording("stop recording before saving".into()));
        }
        let Some(sample) = self.sample.clone() else {
            return Err(SafetyError::Recording("no recording to save".into()));
        };
        if self.stage == EnrollmentStage::Unverified && !self.accepted_unverified {
            return Err(SafetyError::Transcription(
                "sample does not match the keyword; accept it explicitly to save anyway".into(),
            ));
        }
        if !sample.is_intact() {
            return Err(SafetyError::Recording(
                "sample failed its integrity check".into(),
            ));
        }
        self.stop_playback().await;

        let metadata = UploadMetadata {
            keyword: sample.keyword_text.clone(),
            sample_hash: sample.integrity_hash.clone(),
            duration_seconds: sample.duration_seconds,
        };
        let sample_url = match self.services.uploader.upload(&sample.audio_ref, &metadata).await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "voice sample upload failed; sample kept for retry");
                return Err(e);
            }
        };

        let record = KeywordEnrollment {
            keyword: sample.keyword_text,
            sample_hash: sample.integrity_hash,
            sample_url,
        };
        if let Err(e) = self.services.persistence.save_keyword_enrollment(&record).await {
            warn!(error = %e, "enrollment write failed; sample kept for retry");
            return Err(e);
        }

        info!(url = %record.sample_url, "voice keyword enrolled");
        let _ = self.bus.publish_to(
            Topic::Enrollment,
            Event::new(SOURCE, EventPayload::EnrollmentSaved(record.clone())),
        );

        self.keyword = None;
        self.clear_sample();
        self.stage = EnrollmentStage::Saved;
        Ok(record)
    }

    /// Abandon the flow, releasing the recorder and player.
    pub async fn discard(&mut self) {
        self.settle();
        self.cancel_recording().await;
        self.stop_playback().await;
        self.keyword = None;
        self.clear_sample();
        self.stage = EnrollmentStage::Discarded;
    }

    fn clear_sample(&mut self) {
        self.sample = None;
        self.match_result = None;
        self.accepted_unverified = false;
        self.stage = EnrollmentStage::Idle;
    }
}

/// Recorder task: stops the device when asked or at [`MAX_RECORDING`],
/// whichever comes first, and leaves the take in `outcome`.
async fn run_take(
    capture: Arc<dyn AudioCapture>,
    handle: RecordingHandle,
    started: Instant,
    keyword: String,
    stop: oneshot::Receiver<()>,
    outcome: TakeSlot,
) {
    tokio::select! {
        // A dropped form counts as a stop request.
        _ = stop => debug!("recording stopped by caller"),
        () = tokio::time::sleep_until(started + MAX_RECORDING) => {
            info!("recording reached maximum duration; stopping");
        }
    }
    let elapsed = started.elapsed().min(MAX_RECORDING);
    let take = match capture.stop_recording(handle).await {
        Ok(captured) => finish_take(captured, elapsed, keyword),
        Err(e) => {
            warn!(error = %e, "failed to release recorder");
            Err(e)
        }
    };
    *outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(take);
}

fn finish_take(
    captured: CapturedAudio,
    elapsed: Duration,
    keyword: String,
) -> Result<VoiceSample, SafetyError> {
    if elapsed < MIN_RECORDING {
        warn!(
            duration_secs = elapsed.as_secs_f32(),
            "recording shorter than minimum; discarded"
        );
        return Err(SafetyError::Recording(format!(
            "recording lasted {:.1}s; at least {:.1}s is required",
            elapsed.as_secs_f32(),
            MIN_RECORDING.as_secs_f32()
        )));
    }
    let sample = VoiceSample {
        audio_ref: captured.audio_ref,
        duration_seconds: elapsed.as_secs_f32(),
        keyword_text: keyword,
        integrity_hash: sha256_hex(&captured.bytes),
        bytes: captured.bytes,
    };
    info!(
        duration_secs = sample.duration_seconds,
        audio = %sample.audio_ref,
        "voice recording captured"
    );
    Ok(sample)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
