//! `aegis-middleware` – Plumbing
//!
//! Moves facts between the safety core and the outside world without caring
//! about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – Typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`observable`] – [`Observable`]: a value cell that broadcasts every
//!   successful write to its subscribers.
//! - [`collaborators`] – The traits every external collaborator implements
//!   (persistence, capability provider, evidence store, audio capture and
//!   playback, transcription, upload).
//! - [`sim`] – In-process simulated collaborators for headless runs and
//!   tests.

pub mod bus;
pub mod collaborators;
pub mod observable;
pub mod sim;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use collaborators::{
    AudioCapture, AudioPlayer, CapabilityProvider, EvidenceStore, PersistenceBackend, Transcriber,
    Uploader,
};
pub use observable::Observable;
