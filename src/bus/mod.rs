//! The message bus (SYSTEM OVERVIEW component B).

pub mod bus;
pub mod message;

pub use bus::{BroadcastOutcome, MessageBus, Worker};
pub use message::{AgentMessage, HistoryFilter};
