//! Built-in executors, one module per `StepKind`.

mod ai_generated;
mod automated;
mod data_collection;
mod decision;
mod user_interaction;
mod validation;

pub use ai_generated::AiGeneratedExecutor;
pub use automated::AutomatedExecutor;
pub use data_collection::DataCollectionExecutor;
pub use decision::DecisionExecutor;
pub use user_interaction::UserInteractionExecutor;
pub use validation::{evaluate_rule, ValidationExecutor};
