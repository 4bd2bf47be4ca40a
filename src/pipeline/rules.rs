//! Subject and sender rules for matching inbound mail.
//!
//! Cheap regex and keyword checks that run before any database lookup:
//! - title extraction for the fuzzy job match
//! - `From` header parsing into a candidate identity
//! - job-application heuristics used by step relevance checks

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::InboundEvent;
use crate::recruiting::ParsedSender;
use crate::workflow::model::StepType;

/// Keywords that suggest a message is a job application.
const APPLICATION_KEYWORDS: &[&str] = &[
    "application",
    "resume",
    "cv",
    "job",
    "position",
    "role",
    "candidate",
    "apply",
    "applying",
    "hiring",
    "career",
    "employment",
];

/// Job boards that forward applications on a candidate's behalf.
const JOB_BOARD_DOMAINS: &[&str] = &[
    "indeed",
    "linkedin",
    "glassdoor",
    "monster",
    "careerbuilder",
    "ziprecruiter",
    "simplyhired",
];

/// Regex rules that pull a job title out of a subject line.
pub struct SubjectRules {
    title_patterns: Vec<Regex>,
    email_in_angles: Regex,
}

impl SubjectRules {
    /// Rules with the default title patterns, most specific first.
    pub fn default_rules() -> Self {
        let title_patterns = [
            r"(?i)applying for (.+?) (?:role|position|job)\b",
            r"(?i)application for (.+?) (?:role|position|job)\b",
            r"(?i)(.+?) (?:role|position|job) application\b",
            r"(?i)applying for (.+)",
            r"(?i)application for (.+)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();

        Self {
            title_patterns,
            email_in_angles: Regex::new(r"<([^<>\s]+@[^<>\s]+)>").unwrap(),
        }
    }

    /// Add a custom title pattern. Its first capture group is the title.
    pub fn add_title_pattern(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.title_patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Best-effort job title from a subject.
    ///
    /// Falls back to the whole subject, minus any bracketed token and reply
    /// prefixes, when no pattern matches.
    pub fn extract_title(&self, subject: &str) -> String {
        let cleaned = clean_subject(subject);
        for re in &self.title_patterns {
            if let Some(title) = re.captures(&cleaned).and_then(|c| c.get(1)) {
                let title = title.as_str().trim().trim_end_matches(['.', '!', ',']);
                if !title.is_empty() {
                    debug!(subject = %subject, title = %title, "Extracted job title");
                    return title.to_string();
                }
            }
        }
        cleaned
    }

    /// Parse a free-text `From` header.
    ///
    /// Accepts `Name <addr>`, `"Name" <addr>` and bare addresses. Returns
    /// `None` when no address can be found.
    pub fn parse_sender(&self, from: &str) -> Option<ParsedSender> {
        let from = from.trim();
        let (email, display) = match self.email_in_angles.captures(from) {
            Some(caps) => {
                let email = caps.get(1)?.as_str().to_string();
                let display = from.split('<').next().unwrap_or("");
                (email, display.trim().trim_matches('"').trim().to_string())
            }
            None if is_plain_address(from) => (from.to_string(), String::new()),
            None => return None,
        };

        let email = email.to_lowercase();
        let (first_name, last_name) = if display.is_empty() {
            let local = email.split('@').next().unwrap_or("").to_string();
            (local, String::new())
        } else {
            match display.split_once(char::is_whitespace) {
                Some((first, last)) => (first.to_string(), last.trim().to_string()),
                None => (display, String::new()),
            }
        };

        Some(ParsedSender {
            email,
            first_name,
            last_name,
        })
    }
}

impl Default for SubjectRules {
    fn default() -> Self {
        Self::default_rules()
    }
}

/// Strip reply/forward prefixes and bracketed tokens from a subject.
fn clean_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        if lower.starts_with("re:") || lower.starts_with("fw:") {
            s = s[3..].trim_start();
        } else if lower.starts_with("fwd:") {
            s = s[4..].trim_start();
        } else {
            break;
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for ch in s.chars() {
        match ch {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_plain_address(s: &str) -> bool {
    !s.contains(char::is_whitespace)
        && s.split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
}

/// Case-insensitive, bidirectional substring match between two titles.
pub fn titles_match(candidate_title: &str, job_title: &str) -> bool {
    let a = candidate_title.trim().to_lowercase();
    let b = job_title.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// Whether a message looks like a job application.
pub fn looks_like_application(event: &InboundEvent) -> bool {
    let text = format!("{} {}", event.subject, event.body).to_lowercase();
    if contains_any_word(&text, APPLICATION_KEYWORDS) {
        return true;
    }
    let from = event.from.to_lowercase();
    JOB_BOARD_DOMAINS.iter().any(|d| from.contains(d))
}

/// Keywords an inbound mail must mention to be relevant to a step type.
///
/// `None` means every mail is relevant.
pub fn relevance_keywords(step_type: &StepType) -> Option<&'static [&'static str]> {
    match step_type {
        StepType::ResumeAnalysis => Some(APPLICATION_KEYWORDS),
        StepType::AssignmentReview => Some(&[
            "assignment",
            "submission",
            "submitted",
            "solution",
            "github",
            "repository",
            "attached",
        ]),
        StepType::InterviewScheduling => Some(&[
            "interview",
            "availability",
            "available",
            "schedule",
            "calendar",
            "time slot",
        ]),
        StepType::OfferLetter => Some(&["offer", "accept", "salary", "start date"]),
        StepType::TechnicalAssessment | StepType::Informational | StepType::Custom(_) => None,
    }
}

/// Whether an inbound mail is relevant to a step of the given type.
pub fn mail_is_relevant(step_type: &StepType, event: &InboundEvent) -> bool {
    match relevance_keywords(step_type) {
        Some(keywords) => {
            let text = format!("{} {}", event.subject, event.body).to_lowercase();
            contains_any_word(&text, keywords)
        }
        None => true,
    }
}

/// Whole-word (or whole-phrase) keyword search over lower-cased text.
fn contains_any_word(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| {
        text.match_indices(kw).any(|(start, _)| {
            let before = text[..start].chars().next_back();
            let after = text[start + kw.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
    })
}
