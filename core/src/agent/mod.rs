pub mod context;
pub mod orchestrator;
pub mod registry;

pub use context::ContextBuilder;
pub use orchestrator::{Orchestrator, TurnOutcome};
pub use registry::{ToolOutcome, ToolRegistry};
