//! The four priority queues and the dead-letter queue.
//!
//! A message sits in exactly one place at a time: one of the four FIFO
//! queues, or the DLQ, or in flight with a worker. Selection drains
//! CRITICAL strictly before HIGH, HIGH before NORMAL, NORMAL before LOW;
//! within a queue FIFO order holds. Messages whose execution currently
//! has a delivery in flight are skipped, which serialises deliveries per
//! execution without reordering them (all of an execution's queued
//! messages are skipped together).

use crate::bus::message::{MessageStatus, PhaseMessage, Priority};
use crate::errors::BusError;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

const QUEUE_COUNT: usize = 4;

/// Per-queue depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub dead_letter: usize,
}

/// The queue set. Not thread-safe by itself; the dispatcher guards it.
#[derive(Debug, Default)]
pub struct PriorityQueues {
    queues: [VecDeque<PhaseMessage>; QUEUE_COUNT],
    dead_letter: Vec<PhaseMessage>,
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue onto the queue matching the message's priority.
    pub fn enqueue(&mut self, message: PhaseMessage) {
        self.queues[message.priority.queue_index()].push_back(message);
    }

    /// Pop the next deliverable message: highest priority class first,
    /// FIFO within a class, skipping messages whose execution id is in
    /// `busy`.
    pub fn pop_next(&mut self, busy: &HashSet<Uuid>) -> Option<PhaseMessage> {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|m| !busy.contains(&m.execution_id)) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Move a message to the dead-letter queue.
    pub fn push_dead(&mut self, mut message: PhaseMessage) {
        message.status = MessageStatus::DeadLettered;
        self.dead_letter.push(message);
    }

    /// Move a DLQ entry back to its original priority queue with its
    /// retry count reset.
    pub fn retry_dead(&mut self, message_id: Uuid) -> Result<Priority, BusError> {
        let pos = self
            .dead_letter
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(BusError::NotInDeadLetter(message_id))?;
        let mut message = self.dead_letter.remove(pos);
        message.retry_count = 0;
        message.status = MessageStatus::Pending;
        let priority = message.priority;
        self.enqueue(message);
        Ok(priority)
    }

    /// Drop all queued messages for an execution. DLQ entries stay put.
    /// Returns the number removed.
    pub fn remove_for_execution(&mut self, execution_id: Uuid) -> usize {
        let mut removed = 0;
        for queue in self.queues.iter_mut() {
            let before = queue.len();
            queue.retain(|m| m.execution_id != execution_id);
            removed += before - queue.len();
        }
        removed
    }

    /// Whether any queue or the DLQ still holds messages for an execution.
    pub fn has_messages_for(&self, execution_id: Uuid) -> bool {
        self.queues
            .iter()
            .any(|q| q.iter().any(|m| m.execution_id == execution_id))
            || self
                .dead_letter
                .iter()
                .any(|m| m.execution_id == execution_id)
    }

    /// Whether a message id is present anywhere in the queue set.
    pub fn contains(&self, message_id: Uuid) -> bool {
        self.queues
            .iter()
            .any(|q| q.iter().any(|m| m.id == message_id))
            || self.dead_letter.iter().any(|m| m.id == message_id)
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            critical: self.queues[0].len(),
            high: self.queues[1].len(),
            normal: self.queues[2].len(),
            low: self.queues[3].len(),
            dead_letter: self.dead_letter.len(),
        }
    }

    pub fn dead_letter(&self) -> &[PhaseMessage] {
        &self.dead_letter
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::MessageType;
    use serde_json::json;

    fn msg(execution_id: Uuid, phase: usize) -> PhaseMessage {
        PhaseMessage::new(execution_id, phase, MessageType::Execution, json!({}), vec![])
    }

    #[test]
    fn pop_drains_strictly_by_priority_class() {
        let mut queues = PriorityQueues::new();
        let exec = Uuid::new_v4();
        let low = msg(exec, 11);
        let normal = msg(exec, 7);
        let critical = msg(exec, 4);
        let high = msg(exec, 1);

        queues.enqueue(low.clone());
        queues.enqueue(normal.clone());
        queues.enqueue(critical.clone());
        queues.enqueue(high.clone());

        let busy = HashSet::new();
        assert_eq!(queues.pop_next(&busy).unwrap().id, critical.id);
        assert_eq!(queues.pop_next(&busy).unwrap().id, high.id);
        assert_eq!(queues.pop_next(&busy).unwrap().id, normal.id);
        assert_eq!(queues.pop_next(&busy).unwrap().id, low.id);
        assert!(queues.pop_next(&busy).is_none());
    }

    #[test]
    fn pop_is_fifo_within_a_class() {
        let mut queues = PriorityQueues::new();
        let exec = Uuid::new_v4();
        let first = msg(exec, 7);
        let second = msg(exec, 8);
        queues.enqueue(first.clone());
        queues.enqueue(second.clone());

        let busy = HashSet::new();
        assert_eq!(queues.pop_next(&busy).unwrap().id, first.id);
        assert_eq!(queues.pop_next(&busy).unwrap().id, second.id);
    }

    #[test]
    fn busy_executions_are_skipped_without_reordering() {
        let mut queues = PriorityQueues::new();
        let busy_exec = Uuid::new_v4();
        let other_exec = Uuid::new_v4();
        let blocked_1 = msg(busy_exec, 7);
        let free = msg(other_exec, 7);
        let blocked_2 = msg(busy_exec, 7);
        queues.enqueue(blocked_1.clone());
        queues.enqueue(free.clone());
        queues.enqueue(blocked_2.clone());

        let busy: HashSet<Uuid> = [busy_exec].into_iter().collect();
        assert_eq!(queues.pop_next(&busy).unwrap().id, free.id);
        assert!(queues.pop_next(&busy).is_none());

        // Once the execution frees up, its messages come out in order.
        let none_busy = HashSet::new();
        assert_eq!(queues.pop_next(&none_busy).unwrap().id, blocked_1.id);
        assert_eq!(queues.pop_next(&none_busy).unwrap().id, blocked_2.id);
    }

    #[test]
    fn dead_letter_round_trip_resets_retries() {
        let mut queues = PriorityQueues::new();
        let mut message = msg(Uuid::new_v4(), 4);
        message.retry_count = 4;
        let id = message.id;
        queues.push_dead(message);

        assert_eq!(queues.depths().dead_letter, 1);
        assert!(queues.contains(id));

        let priority = queues.retry_dead(id).unwrap();
        assert_eq!(priority, Priority::Critical);
        assert_eq!(queues.depths().dead_letter, 0);

        let revived = queues.pop_next(&HashSet::new()).unwrap();
        assert_eq!(revived.id, id);
        assert_eq!(revived.retry_count, 0);
        assert_eq!(revived.status, MessageStatus::Pending);
    }

    #[test]
    fn retry_dead_unknown_id_errors() {
        let mut queues = PriorityQueues::new();
        assert!(matches!(
            queues.retry_dead(Uuid::new_v4()),
            Err(BusError::NotInDeadLetter(_))
        ));
    }

    #[test]
    fn remove_for_execution_clears_queues_but_not_dlq() {
        let mut queues = PriorityQueues::new();
        let exec = Uuid::new_v4();
        queues.enqueue(msg(exec, 1));
        queues.enqueue(msg(exec, 7));
        queues.push_dead(msg(exec, 4));

        assert_eq!(queues.remove_for_execution(exec), 2);
        assert!(queues.is_empty());
        // DLQ entries survive cancellation for observability.
        assert_eq!(queues.depths().dead_letter, 1);
        assert!(queues.has_messages_for(exec));
    }
}
