//! The LLM client wrapper (SYSTEM OVERVIEW component C).

pub mod client;
pub mod provider;

pub use client::{Callbacks, LlmClient, LlmClientConfig, LlmMetrics};
pub use provider::{CallOptions, CallResult, HttpLlmInvoker, LlmInvoker, OutputFormat};
