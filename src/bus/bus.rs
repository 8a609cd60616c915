//! The message bus (§4.1): routed, correlated request/response with
//! timeouts, bounded history, and pub/sub subscriptions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::bus::message::{AgentMessage, HistoryFilter};
use crate::error::BusError;
use crate::ring::RingBuffer;

/// Any value that can be registered under a role in the bus (§4.1,
/// §9 "event-driven inheritance chains" — re-expressed as a single
/// `handle_message` method, no virtual dispatch beyond it).
#[async_trait]
pub trait Worker: Send + Sync {
    async fn handle_message(&self, msg: AgentMessage) -> AgentMessage;
}

type Pending = Arc<Mutex<Option<oneshot::Sender<Result<AgentMessage, BusError>>>>>;

pub struct BroadcastOutcome {
    pub role: String,
    pub success: bool,
    pub result: Option<AgentMessage>,
    pub error: Option<String>,
}

const MAX_PENDING: usize = 50;
const MAX_HISTORY: usize = 100;

pub struct MessageBus {
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
    pending: Mutex<HashMap<String, Pending>>,
    pending_order: Mutex<Vec<String>>,
    history: Mutex<RingBuffer<AgentMessage>>,
    subscriptions: Mutex<HashMap<u64, (String, Arc<dyn Fn(&AgentMessage) -> Result<(), String> + Send + Sync>)>>,
    next_subscription_id: Mutex<u64>,
    shutdown: Mutex<bool>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_order: Mutex::new(Vec::new()),
            history: Mutex::new(RingBuffer::new(MAX_HISTORY)),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: Mutex::new(0),
            shutdown: Mutex::new(false),
        }
    }

    pub async fn register(&self, role: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.write().await.insert(role.into(), worker);
    }

    pub async fn unregister(&self, role: &str) {
        self.workers.write().await.remove(role);
    }

    async fn record_history(&self, msg: AgentMessage) {
        self.history.lock().await.push(msg);
        self.notify_subscribers_from_history().await;
    }

    async fn notify_subscribers_from_history(&self) {
        // Subscribers are notified at `send`/`request`/`broadcast` call
        // sites, not here; kept as a no-op seam so history writes and
        // notification stay conceptually separate operations.
    }

    async fn dispatch_to_subscribers(&self, msg: &AgentMessage) {
        let subs = self.subscriptions.lock().await;
        for (msg_type, handler) in subs.values() {
            let interested = msg_type == "*" || msg_type == &msg.message_type;
            if !interested {
                continue;
            }
            if let Err(e) = handler(msg) {
                tracing::warn!(error = %e, "subscriber handler failed");
            }
        }
    }

    /// §4.1 `send`: routes to the registered worker for `msg.to`, or resolves
    /// a matching pending request if `correlationId` is set.
    pub async fn send(&self, msg: AgentMessage) -> Result<(), BusError> {
        if *self.shutdown.lock().await {
            return Err(BusError::BusShutdown);
        }

        self.dispatch_to_subscribers(&msg).await;

        if let Some(correlation_id) = msg.correlation_id.clone() {
            let slot = self.pending.lock().await.get(&correlation_id).cloned();
            if let Some(slot) = slot {
                if let Some(sender) = slot.lock().await.take() {
                    let _ = sender.send(Ok(msg.clone()));
                }
                self.record_history(msg).await;
                return Ok(());
            }
        }

        let worker = self.workers.read().await.get(&msg.to).cloned();
        match worker {
            Some(worker) => {
                self.record_history(msg.clone()).await;
                let _response = worker.handle_message(msg).await;
                Ok(())
            }
            None => {
                let target = msg.to.clone();
                self.record_history(msg).await;
                Err(BusError::UnknownTarget(target))
            }
        }
    }

    async fn admit_pending(&self, id: String, slot: Pending) {
        let mut order = self.pending_order.lock().await;
        let mut pending = self.pending.lock().await;
        if order.len() >= MAX_PENDING {
            let oldest = order.remove(0);
            if let Some(dropped) = pending.remove(&oldest)
                && let Some(sender) = dropped.lock().await.take()
            {
                let _ = sender.send(Err(BusError::QueueOverflow));
            }
        }
        order.push(id.clone());
        pending.insert(id, slot);
    }

    async fn retire_pending(&self, id: &str) {
        self.pending.lock().await.remove(id);
        self.pending_order.lock().await.retain(|existing| existing != id);
    }

    /// §4.1 `request`: races the worker's direct return value against a
    /// later correlated `send`, whichever arrives first.
    pub async fn request(&self, msg: AgentMessage, timeout: Duration) -> Result<AgentMessage, BusError> {
        if *self.shutdown.lock().await {
            return Err(BusError::BusShutdown);
        }

        let id = msg.id.clone();
        let (tx, rx) = oneshot::channel();
        let slot: Pending = Arc::new(Mutex::new(Some(tx)));
        self.admit_pending(id.clone(), slot.clone()).await;

        self.dispatch_to_subscribers(&msg).await;
        self.record_history(msg.clone()).await;

        let worker = self.workers.read().await.get(&msg.to).cloned();
        let Some(worker) = worker else {
            self.retire_pending(&id).await;
            return Err(BusError::UnknownTarget(msg.to.clone()));
        };

        let slot_for_direct = slot.clone();
        let direct_msg = msg.clone();
        tokio::spawn(async move {
            let response = worker.handle_message(direct_msg).await;
            if let Some(sender) = slot_for_direct.lock().await.take() {
                let _ = sender.send(Ok(response));
            }
        });

        let result = tokio::time::timeout(timeout, rx).await;
        self.retire_pending(&id).await;

        match result {
            Ok(Ok(inner)) => inner,
            Ok(Err(_)) => Err(BusError::Timeout(id)),
            Err(_) => Err(BusError::Timeout(id)),
        }
    }

    /// §4.1 `broadcast`: delivers to every registered worker except
    /// `msg.from`.
    pub async fn broadcast(&self, msg: AgentMessage) -> Vec<BroadcastOutcome> {
        self.record_history(msg.clone()).await;
        let workers: Vec<(String, Arc<dyn Worker>)> = self
            .workers
            .read()
            .await
            .iter()
            .filter(|(role, _)| **role != msg.from)
            .map(|(role, worker)| (role.clone(), worker.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(workers.len());
        for (role, worker) in workers {
            let mut copy = msg.clone();
            copy.to = role.clone();
            let response = worker.handle_message(copy).await;
            outcomes.push(BroadcastOutcome {
                role,
                success: true,
                result: Some(response),
                error: None,
            });
        }
        outcomes
    }

    /// §4.1 `subscribe`: returns an id usable with [`Self::unsubscribe`].
    pub async fn subscribe(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn Fn(&AgentMessage) -> Result<(), String> + Send + Sync>,
    ) -> u64 {
        let mut next_id = self.next_subscription_id.lock().await;
        let id = *next_id;
        *next_id += 1;
        self.subscriptions.lock().await.insert(id, (message_type.into(), handler));
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscriptions.lock().await.remove(&id);
    }

    pub async fn get_history(&self, filter: &HistoryFilter) -> Vec<AgentMessage> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }

    /// §4.1 `reset`: rejects all pending with `BUS_SHUTDOWN`, clears history
    /// and subscriptions, retains worker registrations.
    pub async fn reset(&self) {
        *self.shutdown.lock().await = true;
        let mut pending = self.pending.lock().await;
        for (_, slot) in pending.drain() {
            if let Some(sender) = slot.lock().await.take() {
                let _ = sender.send(Err(BusError::BusShutdown));
            }
        }
        self.pending_order.lock().await.clear();
        *self.history.lock().await = RingBuffer::new(MAX_HISTORY);
        self.subscriptions.lock().await.clear();
        *self.shutdown.lock().await = false;
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}
