//! Keyword text rules.

use aegis_types::ValidationError;

pub const MIN_KEYWORD_LEN: usize = 3;
pub const MAX_KEYWORD_LEN: usize = 15;

/// Greetings and assistant wake-words that fire too easily in normal speech.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "hello", "hi", "hey", "help", "ok", "okay", "yes", "no", "stop", "siri", "alexa", "google",
    "cortana", "bixby", "computer",
];

/// Validate `raw` and return the trimmed keyword.
///
/// Rules are checked in order: non-blank, at least [`MIN_KEYWORD_LEN`]
/// characters, at most [`MAX_KEYWORD_LEN`], letters only, and not a
/// [`FORBIDDEN_KEYWORDS`] entry (case-insensitive).  The first broken rule is
/// reported.
///
/// ```
/// use aegis_voice::validate_keyword;
///
/// assert_eq!(validate_keyword("  Guardian ").unwrap(), "Guardian");
/// assert!(validate_keyword("hello").is_err());
/// ```
pub fn validate_keyword(raw: &str) -> Result<String, ValidationError> {
    let keyword = raw.trim();
    if keyword.is_empty() {
        return Err(ValidationError::Blank);
    }

    let len = keyword.chars().count();
    if len < MIN_KEYWORD_LEN {
        return Err(ValidationError::TooShort {
            len,
            min: MIN_KEYWORD_LEN,
        });
    }
    if len > MAX_KEYWORD_LEN {
        return Err(ValidationError::TooLong {
            len,
            max: MAX_KEYWORD_LEN,
        });
    }

    if let Some(bad) = keyword.chars().find(|c| !c.is_alphabetic()) {
        return Err(ValidationError::InvalidCharacter(bad));
    }

    let lowered = keyword.to_lowercase();
    if FORBIDDEN_KEYWORDS.contains(&lowered.as_str()) {
        return Err(ValidationError::Forbidden(keyword.to_string()));
    }

    Ok(keyword.to_string())
}
