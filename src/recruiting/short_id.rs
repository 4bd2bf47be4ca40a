//! Job short ids quoted in mail subjects.

use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;

/// Characters used for the random part of a short id.
const SHORT_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Bracketed short id token, e.g. `[ABC123]`.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Z]{3}[A-Za-z0-9]{3})\]").expect("valid short id regex")
});

/// Generate a short id: a 3-letter prefix followed by 3 random characters.
///
/// Prefixes that are not exactly three ASCII letters are replaced with `JOB`
/// so the result always matches the subject token pattern.
pub fn generate_short_id(prefix: &str) -> String {
    let prefix = if prefix.len() == 3 && prefix.chars().all(|c| c.is_ascii_alphabetic()) {
        prefix.to_ascii_uppercase()
    } else {
        "JOB".to_string()
    };

    let mut rng = rand::thread_rng();
    let suffix: String = (0..3)
        .map(|_| SHORT_ID_ALPHABET[rng.gen_range(0..SHORT_ID_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}{suffix}")
}

/// Prefix a subject with the bracketed short id.
pub fn format_email_subject(subject: &str, short_id: &str) -> String {
    format!("[{short_id}] {subject}")
}

/// First bracketed short id token in a subject.
pub fn extract_short_id(subject: &str) -> Option<&str> {
    TOKEN_RE
        .captures(subject)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
