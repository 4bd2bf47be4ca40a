//! Inbound mail pipeline.
//!
//! Every candidate email, whether polled over IMAP or posted to the
//! webhook, flows through:
//! 1. `InboundMatcher::ingest()`: record by message id, match a job
//! 2. Candidate and application capture
//! 3. Workflow instance lookup or creation, then a pass on the dispatcher
//!
//! `event_processor` sweeps recorded events that never got past step 1.

pub mod event_processor;
pub mod matcher;
pub mod rules;
pub mod types;

pub use matcher::InboundMatcher;
pub use types::{EventStatus, InboundEvent, IngestOutcome, StoredEvent};
