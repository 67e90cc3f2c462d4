//! Phase-aware message bus: priority dispatch, retry, dead-lettering.
//!
//! A pool of worker tasks drains four FIFO queues in strict priority
//! order (CRITICAL > HIGH > NORMAL > LOW). Deliveries for the same
//! execution are serialised; across executions workers run in parallel
//! up to the configured bound. A message is completed only when every
//! resolved target agent succeeds; partial failure retries the whole
//! message with exponential backoff, and exhausted retries move it to
//! the dead-letter queue and publish a CRITICAL escalation carrying the
//! original message id.

pub mod message;
pub mod queue;

pub use message::{MessageStatus, MessageType, PhaseMessage, Priority};
pub use queue::{PriorityQueues, QueueDepths};

use crate::config::BusConfig;
use crate::errors::BusError;
use crate::events::{EventBus, SystemEvent};
use crate::registry::{AgentEnvelope, AgentOutput, AgentRegistry};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A successful agent invocation, handed to the delivery sink.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub execution_id: Uuid,
    pub phase: usize,
    pub agent_id: String,
    pub message_id: Uuid,
    pub output: AgentOutput,
}

/// A failed agent invocation, handed to the failure sink for the
/// learning pipeline.
#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub execution_id: Uuid,
    pub phase: usize,
    pub agent_id: String,
    pub message_id: Uuid,
    pub error: String,
}

/// Snapshot of bus counters and queue depths.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BusMetrics {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub transitions: u64,
    pub approval_gates: u64,
    pub depths: QueueDepths,
}

#[derive(Default)]
struct Counters {
    received: u64,
    processed: u64,
    failed: u64,
    retried: u64,
    dead_lettered: u64,
    transitions: u64,
    approval_gates: u64,
}

struct BusState {
    queues: PriorityQueues,
    /// Execution ids with a delivery currently in flight.
    busy: HashSet<Uuid>,
    /// Cancelled execution ids; their messages are dropped.
    cancelled: HashSet<Uuid>,
    /// Every message id ever published, for idempotent publish.
    seen: HashSet<Uuid>,
    counters: Counters,
    shutdown: bool,
}

/// The bus. Cheap to clone; all clones share one queue set.
#[derive(Clone)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    registry: Arc<RwLock<AgentRegistry>>,
    events: EventBus,
    config: BusConfig,
    delivery_tx: Option<mpsc::UnboundedSender<Delivery>>,
    failure_tx: Option<mpsc::UnboundedSender<AgentFailure>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MessageBus {
    pub fn new(registry: Arc<RwLock<AgentRegistry>>, events: EventBus, config: BusConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                queues: PriorityQueues::new(),
                busy: HashSet::new(),
                cancelled: HashSet::new(),
                seen: HashSet::new(),
                counters: Counters::default(),
                shutdown: false,
            })),
            notify: Arc::new(Notify::new()),
            registry,
            events,
            config,
            delivery_tx: None,
            failure_tx: None,
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach the sink that receives successful agent outputs.
    pub fn with_delivery_sink(mut self, tx: mpsc::UnboundedSender<Delivery>) -> Self {
        self.delivery_tx = Some(tx);
        self
    }

    /// Attach the sink that receives agent failures.
    pub fn with_failure_sink(mut self, tx: mpsc::UnboundedSender<AgentFailure>) -> Self {
        self.failure_tx = Some(tx);
        self
    }

    /// Spawn the worker pool. Idempotent per bus instance only in the
    /// sense that calling it twice doubles the workers; call once.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.config.max_workers {
            let bus = self.clone();
            workers.push(tokio::spawn(async move {
                bus.worker_loop(worker_id).await;
            }));
        }
    }

    /// Stop workers after the current deliveries finish.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            state.shutdown = true;
        }
        self.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }

    /// Publish a message. Re-publishing an id that was ever seen is
    /// rejected; messages for cancelled executions are refused.
    pub async fn publish(&self, message: PhaseMessage) -> Result<Uuid, BusError> {
        let id = message.id;
        {
            let mut state = self.state.lock().await;
            if state.shutdown {
                return Err(BusError::ShutDown);
            }
            if state.seen.contains(&id) {
                return Err(BusError::DuplicateMessage(id));
            }
            if state.cancelled.contains(&message.execution_id) {
                return Err(BusError::ExecutionCancelled(message.execution_id));
            }
            state.seen.insert(id);
            state.counters.received += 1;
            if message.message_type == MessageType::PhaseTransition {
                state.counters.transitions += 1;
            }
            if message.needs_approval || message.message_type == MessageType::DeploymentApproval {
                state.counters.approval_gates += 1;
            }
            let priority = message.priority;
            state.queues.enqueue(message);
            self.events.emit(SystemEvent::MessagePublished {
                message_id: id,
                priority: priority.as_str().to_string(),
            });
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Move a dead-lettered message back onto its priority queue with
    /// its retry count reset.
    pub async fn retry_dead(&self, message_id: Uuid) -> Result<(), BusError> {
        {
            let mut state = self.state.lock().await;
            state.queues.retry_dead(message_id)?;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Cancel an execution: drop its queued messages and ignore any
    /// in-flight completions when they land.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> usize {
        let removed = {
            let mut state = self.state.lock().await;
            state.cancelled.insert(execution_id);
            state.queues.remove_for_execution(execution_id)
        };
        self.notify.notify_waiters();
        removed
    }

    /// Counter and depth snapshot.
    pub async fn metrics(&self) -> BusMetrics {
        let state = self.state.lock().await;
        BusMetrics {
            received: state.counters.received,
            processed: state.counters.processed,
            failed: state.counters.failed,
            retried: state.counters.retried,
            dead_lettered: state.counters.dead_lettered,
            transitions: state.counters.transitions,
            approval_gates: state.counters.approval_gates,
            depths: state.queues.depths(),
        }
    }

    /// Whether any queue, the DLQ, or an in-flight delivery still holds
    /// work for an execution.
    pub async fn has_pending_for(&self, execution_id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.busy.contains(&execution_id) || state.queues.has_messages_for(execution_id)
    }

    /// Ids currently parked in the dead-letter queue.
    pub async fn dead_letter_ids(&self) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state.queues.dead_letter().iter().map(|m| m.id).collect()
    }

    /// Wait until every queue is empty and no delivery is in flight.
    /// Intended for tests and shutdown paths.
    pub async fn quiesce(&self) {
        loop {
            {
                let state = self.state.lock().await;
                if state.queues.is_empty() && state.busy.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn worker_loop(&self, worker_id: usize) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    break;
                }
                let busy = state.busy.clone();
                match state.queues.pop_next(&busy) {
                    Some(message) => {
                        if state.cancelled.contains(&message.execution_id) {
                            // Dropped without delivery; loop for the next one.
                            continue;
                        }
                        state.busy.insert(message.execution_id);
                        Some(message)
                    }
                    None => None,
                }
            };

            match next {
                Some(mut message) => {
                    message.status = MessageStatus::Processing;
                    self.deliver(message, worker_id).await;
                    self.notify.notify_waiters();
                }
                None => {
                    // Re-check the queues periodically even without a
                    // wake-up, in case a retry re-enqueue raced us.
                    let _ = tokio::time::timeout(
                        Duration::from_millis(50),
                        self.notify.notified(),
                    )
                    .await;
                }
            }
        }
    }

    /// Invoke every target agent; complete, retry or dead-letter.
    async fn deliver(&self, mut message: PhaseMessage, worker_id: usize) {
        let handlers = {
            let registry = self.registry.read().await;
            message
                .targets
                .iter()
                .map(|id| (id.clone(), registry.handler(id)))
                .collect::<Vec<_>>()
        };

        let timeout = Duration::from_millis(self.config.invocation_timeout_ms);
        let mut outputs = Vec::new();
        let mut failures: Vec<(String, String)> = Vec::new();

        for (agent_id, handler) in handlers {
            let handler = match handler {
                Ok(h) => h,
                Err(e) => {
                    failures.push((agent_id, e.to_string()));
                    continue;
                }
            };
            let envelope = AgentEnvelope {
                execution_id: message.execution_id,
                phase: message.phase,
                message_id: message.id,
                message_type: message.message_type.as_str().to_string(),
                payload: message.payload.clone(),
            };
            match tokio::time::timeout(timeout, handler.invoke(envelope)).await {
                Ok(Ok(output)) => outputs.push((agent_id, output)),
                Ok(Err(e)) => failures.push((agent_id, e.to_string())),
                Err(_) => failures.push((agent_id, format!("invocation timed out after {:?}", timeout))),
            }
        }

        // Surface every failed invocation to the learning pipeline,
        // regardless of whether the message will retry.
        if let Some(ref tx) = self.failure_tx {
            for (agent_id, error) in &failures {
                let _ = tx.send(AgentFailure {
                    execution_id: message.execution_id,
                    phase: message.phase,
                    agent_id: agent_id.clone(),
                    message_id: message.id,
                    error: error.clone(),
                });
            }
        }

        let mut state = self.state.lock().await;
        state.busy.remove(&message.execution_id);

        if state.cancelled.contains(&message.execution_id) {
            // Completion arrived after cancellation: outputs discarded.
            tracing::debug!(message_id = %message.id, "discarding delivery for cancelled execution");
            return;
        }

        if failures.is_empty() {
            message.status = MessageStatus::Completed;
            state.counters.processed += 1;
            drop(state);
            if let Some(ref tx) = self.delivery_tx {
                for (agent_id, output) in outputs {
                    let _ = tx.send(Delivery {
                        execution_id: message.execution_id,
                        phase: message.phase,
                        agent_id,
                        message_id: message.id,
                        output,
                    });
                }
            }
            return;
        }

        state.counters.failed += 1;
        message.retry_count += 1;
        tracing::warn!(
            message_id = %message.id,
            worker = worker_id,
            retry = message.retry_count,
            failed_targets = failures.len(),
            "delivery failed"
        );

        if message.retry_count > self.config.max_retries {
            state.counters.dead_lettered += 1;
            let original_id = message.id;
            let execution_id = message.execution_id;
            let phase = message.phase;
            state.queues.push_dead(message);
            self.events
                .emit(SystemEvent::MessageDeadLettered { message_id: original_id });

            // Escalate at CRITICAL with the original id in the payload.
            let escalation = PhaseMessage::new(
                execution_id,
                phase,
                MessageType::Escalation,
                json!({
                    "original_message_id": original_id,
                    "reason": "retries_exhausted",
                    "failed_targets": failures.iter().map(|(a, _)| a.clone()).collect::<Vec<_>>(),
                }),
                Vec::new(),
            );
            state.seen.insert(escalation.id);
            state.counters.received += 1;
            state.queues.enqueue(escalation);
            self.events.emit(SystemEvent::Escalated {
                execution_id: Some(execution_id),
                original_message_id: Some(original_id),
                reason: "retries_exhausted".to_string(),
            });
        } else {
            message.status = MessageStatus::Retrying;
            state.counters.retried += 1;
            let backoff = self.config.backoff_for_retry(message.retry_count - 1);
            let retry = message.retry_count;
            let message_id = message.id;
            drop(state);
            self.events.emit(SystemEvent::MessageRetried {
                message_id,
                retry,
            });

            let bus = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let mut state = bus.state.lock().await;
                if state.shutdown || state.cancelled.contains(&message.execution_id) {
                    return;
                }
                let mut message = message;
                message.status = MessageStatus::Pending;
                state.queues.enqueue(message);
                drop(state);
                bus.notify.notify_waiters();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Agent, AgentRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct OkAgent {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Agent for OkAgent {
        async fn invoke(&self, _envelope: AgentEnvelope) -> anyhow::Result<AgentOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentOutput::default())
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        async fn invoke(&self, _envelope: AgentEnvelope) -> anyhow::Result<AgentOutput> {
            anyhow::bail!("Error: Parameter 'userId' is required")
        }
    }

    fn fast_config() -> BusConfig {
        BusConfig {
            max_retries: 2,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            backoff_multiplier: 2.0,
            max_workers: 2,
            invocation_timeout_ms: 1_000,
        }
    }

    async fn bus_with_agent(agent: Arc<dyn Agent>) -> (MessageBus, Arc<RwLock<AgentRegistry>>) {
        let mut registry = AgentRegistry::with_default_catalog();
        registry.register_handler("arch-design", agent).unwrap();
        let registry = Arc::new(RwLock::new(registry));
        let bus = MessageBus::new(registry.clone(), EventBus::default(), fast_config());
        bus.start().await;
        (bus, registry)
    }

    fn message_for(targets: Vec<String>) -> PhaseMessage {
        PhaseMessage::new(
            Uuid::new_v4(),
            1,
            MessageType::PhaseEntry,
            json!({"step": "design"}),
            targets,
        )
    }

    #[tokio::test]
    async fn successful_delivery_completes_and_counts() {
        let calls = Arc::new(AtomicU32::new(0));
        let (bus, _registry) = bus_with_agent(Arc::new(OkAgent { calls: calls.clone() })).await;

        bus.publish(message_for(vec!["arch-design".into()]))
            .await
            .unwrap();
        bus.quiesce().await;

        let metrics = bus.metrics().await;
        assert_eq!(metrics.received, 1);
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.dead_lettered, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_publish_is_rejected() {
        let (bus, _registry) = bus_with_agent(Arc::new(OkAgent {
            calls: Arc::new(AtomicU32::new(0)),
        }))
        .await;

        let message = message_for(vec![]);
        let dup = message.clone();
        bus.publish(message).await.unwrap();
        assert!(matches!(
            bus.publish(dup).await,
            Err(BusError::DuplicateMessage(_))
        ));
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_and_escalate() {
        let mut registry = AgentRegistry::with_default_catalog();
        registry
            .register_handler("arch-design", Arc::new(FailingAgent))
            .unwrap();
        let registry = Arc::new(RwLock::new(registry));
        let events = EventBus::default();
        let mut event_rx = events.subscribe();
        let bus = MessageBus::new(registry, events, fast_config());
        bus.start().await;

        let message = message_for(vec!["arch-design".into()]);
        let original_id = message.id;
        bus.publish(message).await.unwrap();

        // Wait for the dead-letter event.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    if let Ok(SystemEvent::MessageDeadLettered { message_id }) = event {
                        assert_eq!(message_id, original_id);
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => panic!("no dead-letter event"),
            }
        }
        bus.quiesce().await;

        let metrics = bus.metrics().await;
        assert_eq!(metrics.dead_lettered, 1);
        // max_retries failures scheduled as retries, final one dead-letters.
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.failed, 3);
        assert_eq!(bus.dead_letter_ids().await, vec![original_id]);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn retry_dead_revives_a_message() {
        let mut registry = AgentRegistry::with_default_catalog();
        registry
            .register_handler("arch-design", Arc::new(FailingAgent))
            .unwrap();
        let registry = Arc::new(RwLock::new(registry));
        let bus = MessageBus::new(registry.clone(), EventBus::default(), fast_config());
        bus.start().await;

        let message = message_for(vec!["arch-design".into()]);
        let id = message.id;
        bus.publish(message).await.unwrap();

        // Wait until the message lands in the DLQ.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while bus.dead_letter_ids().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "never dead-lettered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Swap in a working agent, then revive the message.
        {
            let mut reg = registry.write().await;
            reg.register_handler(
                "arch-design",
                Arc::new(OkAgent {
                    calls: Arc::new(AtomicU32::new(0)),
                }),
            )
            .unwrap();
        }
        bus.retry_dead(id).await.unwrap();
        bus.quiesce().await;

        let metrics = bus.metrics().await;
        assert_eq!(metrics.depths.dead_letter, 0);
        assert!(metrics.processed >= 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_drops_pending_and_refuses_new() {
        // No workers started: published messages stay queued.
        let registry = Arc::new(RwLock::new(AgentRegistry::with_default_catalog()));
        let bus = MessageBus::new(registry, EventBus::default(), fast_config());

        let execution_id = Uuid::new_v4();
        let mut pending = message_for(vec![]);
        pending.execution_id = execution_id;
        bus.publish(pending).await.unwrap();

        assert_eq!(bus.cancel_execution(execution_id).await, 1);
        assert!(!bus.has_pending_for(execution_id).await);

        let mut late = message_for(vec![]);
        late.execution_id = execution_id;
        assert!(matches!(
            bus.publish(late).await,
            Err(BusError::ExecutionCancelled(_))
        ));
    }

    #[tokio::test]
    async fn per_execution_delivery_is_serialised() {
        struct SlowAgent {
            concurrent: Arc<AtomicU32>,
            max_seen: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Agent for SlowAgent {
            async fn invoke(&self, _envelope: AgentEnvelope) -> anyhow::Result<AgentOutput> {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(AgentOutput::default())
            }
        }

        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let mut registry = AgentRegistry::with_default_catalog();
        registry
            .register_handler(
                "arch-design",
                Arc::new(SlowAgent {
                    concurrent: concurrent.clone(),
                    max_seen: max_seen.clone(),
                }),
            )
            .unwrap();
        let registry = Arc::new(RwLock::new(registry));
        let bus = MessageBus::new(registry, EventBus::default(), fast_config());
        bus.start().await;

        let execution_id = Uuid::new_v4();
        for _ in 0..4 {
            let mut message = message_for(vec!["arch-design".into()]);
            message.execution_id = execution_id;
            bus.publish(message).await.unwrap();
        }
        bus.quiesce().await;

        // Same execution id: never more than one invocation in flight.
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().await.processed, 4);
        bus.shutdown().await;
    }
}
