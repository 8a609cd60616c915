//! Regex-driven parsers from raw LLM text to the typed domain model (§6,
//! §9 "regex-driven parsing"). Isolated from the orchestrator and workers:
//! callers depend only on the output record shape.

pub mod code;
pub mod plan;
pub mod test_report;
pub mod verification;

pub use code::parse_code_response;
pub use plan::parse_plan_response;
pub use test_report::parse_exploratory_response;
pub use verification::parse_verification_response;
