// Automation Workflow Engine
//
// Executes declarative, multi-step automations against trigger events:
// reference-resolving step fields, conditional evaluation, invoke cycle
// detection, and a resumable run state machine with external cancellation.

pub mod accessor;
pub mod conditions;
pub mod cycle;
pub mod engine;
pub mod pipeline;
pub mod scheduler;
pub mod schedules;
pub mod store;
pub mod templates;

pub use engine::{AutomationEngine, InvocationRequest};
pub use schedules::ScheduleRunner;
pub use store::DurableStore;

use thiserror::Error;
use uuid::Uuid;

/// Engine error taxonomy. Definition errors reject an invocation before
/// anything is persisted; execution and store errors terminate a single run.
#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("duplicate step ref defined: {0}")]
    DuplicateStepRefsDefined(String),
    #[error("invalid step reference: {0}")]
    InvalidStepReference(String),
    #[error("automation invoke cycle detected: {0}")]
    AutomationInvokeCycle(String),
    #[error("invalid step definition: {0}")]
    InvalidStepDefinition(String),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("automation template '{0}' not found")]
    TemplateNotFound(String),
    #[error("step execution failed: {0}")]
    Execution(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl AutomationError {
    /// True for errors raised while accepting a step list, before any Run
    /// or Step record exists.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStepRefsDefined(_)
                | Self::InvalidStepReference(_)
                | Self::AutomationInvokeCycle(_)
                | Self::InvalidStepDefinition(_)
        )
    }
}

impl From<sqlx::Error> for AutomationError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for AutomationError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidStepDefinition(err.to_string())
    }
}
