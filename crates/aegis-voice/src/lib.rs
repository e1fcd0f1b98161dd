//! `aegis-voice` – Voice Keyword Enrollment
//!
//! Registers the secret phrase that later arms hands-free activation.
//!
//! # Modules
//!
//! - [`keyword`] – Text rules a keyword must pass before recording starts.
//! - [`matcher`] – Classifies a transcription against the keyword
//!   (Exact / Contains / Fuzzy / NoMatch).
//! - [`enrollment`] – [`VoiceEnrollment`]: bounded recording, verification,
//!   playback and the upload-then-persist save path.
//! - [`listener`] – [`KeywordListener`]: turns live transcriptions into
//!   gesture inputs once a keyword is enrolled.

pub mod enrollment;
pub mod keyword;
pub mod listener;
pub mod matcher;

pub use enrollment::{EnrollmentServices, EnrollmentStage, VoiceEnrollment, VoiceSample};
pub use keyword::validate_keyword;
pub use listener::KeywordListener;
pub use matcher::classify;
