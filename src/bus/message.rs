//! `AgentMessage` (§3) — the unit of exchange on the message bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub from: String,
    pub to: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl AgentMessage {
    pub fn new(message_type: impl Into<String>, from: impl Into<String>, to: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            from: from.into(),
            to: to.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Builds a response to `request`: carries `correlationId = request.id`
    /// and reverses `from`/`to` (§3).
    pub fn respond_to(request: &AgentMessage, message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            from: request.to.clone(),
            to: request.from.clone(),
            payload,
            timestamp: Utc::now(),
            correlation_id: Some(request.id.clone()),
        }
    }
}

/// Filter for `getHistory` (§4.1).
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub message_type: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn matches(&self, msg: &AgentMessage) -> bool {
        if let Some(t) = &self.message_type
            && *t != msg.message_type
        {
            return false;
        }
        if let Some(f) = &self.from
            && *f != msg.from
        {
            return false;
        }
        if let Some(t) = &self.to
            && *t != msg.to
        {
            return false;
        }
        if let Some(since) = self.since
            && msg.timestamp < since
        {
            return false;
        }
        true
    }
}
