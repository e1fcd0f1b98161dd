//! Transcription matching.
//!
//! Both sides are lower-cased and whitespace-normalized before comparison.
//! The transcription's primary text and every alternative are classified and
//! the strongest result wins (Exact > Contains > Fuzzy, ties by confidence).
//! The winning candidate is reported as `matched_text`; `transcribed_text`
//! always holds the primary text.
//!
//! Fuzzy similarity is normalized Levenshtein distance,
//! `1 - distance / max(len_a, len_b)` over Unicode scalar values, taken
//! against the whole text and against each word in it.

use aegis_types::{KeywordMatchResult, MatchType, Transcription};

/// Similarity above which a non-containing transcription counts as
/// [`MatchType::Fuzzy`].  Acceptance is decided separately by
/// [`aegis_types::FUZZY_ACCEPTANCE_THRESHOLD`].
pub const FUZZY_CANDIDATE_THRESHOLD: f32 = 0.50;

pub const EXACT_CONFIDENCE: f32 = 1.0;
pub const CONTAINS_CONFIDENCE: f32 = 0.9;

/// Classify `transcription` against `keyword`.
///
/// ```
/// use aegis_types::{MatchType, Transcription};
/// use aegis_voice::classify;
///
/// let heard = Transcription { text: "say phoenix now".into(), alternative_texts: vec![] };
/// let result = classify(&heard, "phoenix");
/// assert_eq!(result.match_type, MatchType::Contains);
/// assert!(result.is_match());
/// ```
pub fn classify(transcription: &Transcription, keyword: &str) -> KeywordMatchResult {
    let keyword = normalize(keyword);
    let best = std::iter::once(transcription.text.as_str())
        .chain(transcription.alternative_texts.iter().map(String::as_str))
        .map(|candidate| (candidate, classify_text(&normalize(candidate), &keyword)))
        .max_by(|(_, a), (_, b)| rank(a.0).cmp(&rank(b.0)).then(a.1.total_cmp(&b.1)));

    let (matched_text, (match_type, confidence)) = match best {
        Some((_, (MatchType::NoMatch, _))) | None => ("", (MatchType::NoMatch, 0.0)),
        Some(found) => found,
    };
    KeywordMatchResult {
        transcribed_text: transcription.text.clone(),
        alternative_texts: transcription.alternative_texts.clone(),
        matched_text: matched_text.to_string(),
        match_type,
        confidence,
    }
}

/// Classify one already-normalized candidate.
fn classify_text(text: &str, keyword: &str) -> (MatchType, f32) {
    if text.is_empty() || keyword.is_empty() {
        return (MatchType::NoMatch, 0.0);
    }
    if text == keyword {
        return (MatchType::Exact, EXACT_CONFIDENCE);
    }
    if text.contains(keyword) {
        return (MatchType::Contains, CONTAINS_CONFIDENCE);
    }

    let score = std::iter::once(text)
        .chain(text.split(' '))
        .map(|part| similarity(part, keyword))
        .fold(0.0_f32, f32::max);

    if score > FUZZY_CANDIDATE_THRESHOLD {
        (MatchType::Fuzzy, score)
    } else {
        (MatchType::NoMatch, 0.0)
    }
}

fn rank(match_type: MatchType) -> u8 {
    match match_type {
        MatchType::Exact => 3,
        MatchType::Contains => 2,
        MatchType::Fuzzy => 1,
        MatchType::NoMatch => 0,
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f32 / longest as f32
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    // Single-row dynamic programming.
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            let substitution = diagonal + usize::from(ca != cb);
            row[j + 1] = substitution.min(above + 1).min(row[j] + 1);
            diagonal = above;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::FUZZY_ACCEPTANCE_THRESHOLD;

    fn heard(text: &str) -> Transcription {
        Transcription {
            text: text.into(),
            alternative_texts: vec![],
        }
    }

    #[test]
    fn case_only_difference_is_exact() {
        let result = classify(&heard("phoenix"), "Phoenix");
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.confidence, EXACT_CONFIDENCE);
        assert!(result.is_match());
    }

    #[test]
    fn extra_whitespace_is_still_exact() {
        let result = classify(&heard("  Phoenix \n"), "phoenix");
        assert_eq!(result.match_type, MatchType::Exact);
    }

    #[test]
    fn keyword_inside_sentence_is_contains() {
        let result = classify(&heard("say phoenix now"), "phoenix");
        assert_eq!(result.match_type, MatchType::Contains);
        assert_eq!(result.confidence, CONTAINS_CONFIDENCE);
        assert!(result.is_match());
    }

    #[test]
    fn near_miss_is_fuzzy_below_acceptance() {
        // d("fenix", "phoenix") = 3, similarity = 4/7.
        let result = classify(&heard("fenix"), "phoenix");
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert!((result.confidence - 4.0 / 7.0).abs() < 1e-6);
        assert_eq!(
            result.is_match(),
            result.confidence >= FUZZY_ACCEPTANCE_THRESHOLD
        );
        assert!(!result.is_match());
    }

    #[test]
    fn single_typo_is_accepted_fuzzy() {
        // d("phenix", "phoenix") = 1, similarity = 6/7.
        let result = classify(&heard("phenix"), "phoenix");
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert!(result.is_match());
    }

    #[test]
    fn fuzzy_word_inside_sentence_is_found() {
        let result = classify(&heard("ok phenix go"), "phoenix");
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert!(result.is_match());
    }

    #[test]
    fn empty_transcription_is_no_match() {
        let result = classify(&heard(""), "phoenix");
        assert_eq!(result.match_type, MatchType::NoMatch);
        assert_eq!(result.confidence, 0.0);
        assert!(!result.is_match());
    }

    #[test]
    fn unrelated_text_is_no_match() {
        let result = classify(&heard("banana"), "phoenix");
        assert_eq!(result.match_type, MatchType::NoMatch);
        assert_eq!(result.matched_text, "");
        assert!(!result.is_match());
    }

    #[test]
    fn best_alternative_wins() {
        let transcription = Transcription {
            text: "fee nicks".into(),
            alternative_texts: vec!["fenix".into(), "Phoenix".into()],
        };
        let result = classify(&transcription, "phoenix");
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.transcribed_text, "fee nicks");
        assert_eq!(result.matched_text, "Phoenix");
        assert_eq!(result.alternative_texts.len(), 2);
    }

    #[test]
    fn primary_text_match_reports_itself() {
        let transcription = Transcription {
            text: "phoenix please".into(),
            alternative_texts: vec!["phenix".into()],
        };
        let result = classify(&transcription, "phoenix");
        assert_eq!(result.match_type, MatchType::Contains);
        assert_eq!(result.matched_text, "phoenix please");
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        assert_eq!(similarity("", "abc"), 0.0);
    }

    #[test]
    fn levenshtein_known_distances() {
        let d = |a: &str, b: &str| {
            levenshtein(
                &a.chars().collect::<Vec<_>>(),
                &b.chars().collect::<Vec<_>>(),
            )
        };
        assert_eq!(d("kitten", "sitting"), 3);
        assert_eq!(d("fenix", "phoenix"), 3);
        assert_eq!(d("", "abc"), 3);
        assert_eq!(d("flaw", "lawn"), 2);
    }
}
