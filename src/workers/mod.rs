//! The four cooperating worker roles (SYSTEM OVERVIEW components D–G):
//! Planner, Coder, Tester, Supervisor.

pub mod coder;
pub mod planner;
pub mod supervisor;
pub mod tester;

pub use coder::Coder;
pub use planner::Planner;
pub use supervisor::Supervisor;
pub use tester::Tester;

/// Bus role name used for each worker's registration and as its
/// [`crate::llm::LlmClient`] session-table key.
pub const PLANNER_AGENT: &str = "planner";
pub const CODER_AGENT: &str = "coder";
pub const TESTER_AGENT: &str = "tester";
pub const SUPERVISOR_AGENT: &str = "supervisor";
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";
