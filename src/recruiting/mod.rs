//! Recruiting entities the inbound matcher captures.

pub mod model;
pub mod short_id;

pub use model::{Application, Candidate, Job, JobStatus, ParsedSender};
pub use short_id::{extract_short_id, format_email_subject, generate_short_id};
