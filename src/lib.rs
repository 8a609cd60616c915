pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod parsing;
pub mod ring;
pub mod workers;

pub use bus::{AgentMessage, BroadcastOutcome, HistoryFilter, MessageBus, Worker};
pub use config::CliConfig;
pub use error::{BusError, DomainError, LlmError, LlmErrorKind};
pub use llm::{HttpLlmInvoker, LlmClient, LlmInvoker, LlmMetrics};
pub use orchestrator::{Orchestrator, OrchestrationReport};
pub use workers::{Coder, Planner, Supervisor, Tester};
