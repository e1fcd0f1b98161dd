//! [`KeywordListener`] – the bridge from live speech to the voice trigger.

use tracing::debug;

use aegis_types::{GestureInput, KeywordEnrollment, Transcription};

use crate::matcher::classify;

/// Holds the enrolled keyword and classifies live transcriptions against it.
///
/// The listener never decides whether to fire; it hands every classified
/// utterance to the trigger evaluators as a [`GestureInput::Utterance`].
#[derive(Debug, Clone, Default)]
pub struct KeywordListener {
    keyword: Option<String>,
}

impl KeywordListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_enrollment(record: &KeywordEnrollment) -> Self {
        let mut listener = Self::new();
        listener.arm(record);
        listener
    }

    /// Start listening for `record.keyword`, replacing any previous keyword.
    pub fn arm(&mut self, record: &KeywordEnrollment) {
        self.keyword = Some(record.keyword.clone());
    }

    pub fn disarm(&mut self) {
        self.keyword = None;
    }

    pub fn is_armed(&self) -> bool {
        self.keyword.is_some()
    }

    /// `None` when disarmed or when nothing was heard.
    pub fn hear(&self, transcription: &Transcription) -> Option<GestureInput> {
        let keyword = self.keyword.as_deref()?;
        if transcription.text.trim().is_empty() && transcription.alternative_texts.is_empty() {
            return None;
        }
        let result = classify(transcription, keyword);
        debug!(
            match_type = ?result.match_type,
            confidence = result.confidence,
            "utterance classified"
        );
        Some(GestureInput::Utterance(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::MatchType;

    fn record() -> KeywordEnrollment {
        KeywordEnrollment {
            keyword: "Phoenix".into(),
            sample_hash: "abc".into(),
            sample_url: "sim://uploads/abc.m4a".into(),
        }
    }

    fn heard(text: &str) -> Transcription {
        Transcription {
            text: text.into(),
            alternative_texts: vec![],
        }
    }

    #[test]
    fn disarmed_listener_ignores_speech() {
        let listener = KeywordListener::new();
        assert!(!listener.is_armed());
        assert_eq!(listener.hear(&heard("phoenix")), None);
    }

    #[test]
    fn armed_listener_classifies_utterances() {
        let listener = KeywordListener::from_enrollment(&record());
        let Some(GestureInput::Utterance(result)) = listener.hear(&heard("help phoenix")) else {
            panic!("expected an utterance");
        };
        assert_eq!(result.match_type, MatchType::Contains);
        assert!(result.is_match());
    }

    #[test]
    fn silence_produces_nothing() {
        let listener = KeywordListener::from_enrollment(&record());
        assert_eq!(listener.hear(&heard("   ")), None);
    }

    #[test]
    fn disarm_stops_listening() {
        let mut listener = KeywordListener::from_enrollment(&record());
        listener.disarm();
        assert_eq!(listener.hear(&heard("phoenix")), None);
    }
}
