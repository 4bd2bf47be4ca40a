//! Workflow engine: catalog, approval gate, step execution and progression.

pub mod approval;
pub mod catalog;
pub mod controller;
pub mod dispatcher;
pub mod executor;
pub mod model;

pub use approval::{ApprovalGate, DecisionReceipt, GateTally};
pub use catalog::{CatalogSeed, SeedReport, WorkflowCatalog};
pub use controller::{PassOutcome, PassReport, ProgressionController};
pub use dispatcher::{DispatchQueue, PassDispatcher, PassRunner, dispatch_channel};
pub use executor::{
    AutoApproveExecutor, ExecutionRequest, ExecutorRegistry, LlmStepExecutor, StepExecutor,
    StepGateway,
};
