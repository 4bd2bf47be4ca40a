//! hire-flow: hiring pipeline workflow engine.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod recruiting;
pub mod store;
pub mod workflow;
