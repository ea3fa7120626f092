//! Per-conversation lane state.
//!
//! All mutation happens under the lane's own mutex; there is no lock that
//! spans lanes.

use crate::task::Task;
use chrono::{DateTime, Utc};
use parley_chat::{Conversation, ConversationId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Idle,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneStatusSnapshot {
    pub conversation_id: ConversationId,
    pub status: LaneStatus,
    pub version: u64,
    pub consecutive_generated: u32,
    pub pending_tasks: usize,
    pub current_task: Option<Uuid>,
    pub debounce_pending: bool,
    pub last_activity: DateTime<Utc>,
}

pub(crate) struct Lane {
    pub(crate) id: ConversationId,
    pub(crate) state: Arc<Mutex<LaneState>>,
}

impl Lane {
    pub(crate) fn new(id: ConversationId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(LaneState::new())),
        }
    }
}

pub(crate) struct CurrentTask {
    pub(crate) id: Uuid,
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct PendingDebounce {
    pub(crate) id: Uuid,
    pub(crate) snapshot: Conversation,
    pub(crate) timer: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

pub(crate) struct LaneState {
    pub(crate) consecutive_generated: u32,
    pub(crate) version: u64,
    pub(crate) status: LaneStatus,
    pub(crate) current: Option<CurrentTask>,
    pub(crate) pending: Vec<Task>,
    pub(crate) debounce: Option<PendingDebounce>,
    pub(crate) last_activity: DateTime<Utc>,
    /// Bumped on every lane-wide cancel; a worker from an older epoch exits
    /// without touching the lane.
    pub(crate) worker_epoch: u64,
    pub(crate) worker: Option<JoinHandle<()>>,
    /// Set once the lane has been removed from the scheduler map.
    pub(crate) evicted: bool,
}

impl LaneState {
    pub(crate) fn new() -> Self {
        Self {
            consecutive_generated: 0,
            version: 0,
            status: LaneStatus::Idle,
            current: None,
            pending: Vec::new(),
            debounce: None,
            last_activity: Utc::now(),
            worker_epoch: 0,
            worker: None,
            evicted: false,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub(crate) fn is_stale(&self, task: &Task) -> bool {
        task.cancel.is_cancelled() || task.version_snapshot < self.version
    }

    /// Index of the turn about to start, or `None` once the lane sits at
    /// `turn_limit` and no further simulated message may be produced.
    pub(crate) fn next_turn(&self, turn_limit: u32) -> Option<u32> {
        (self.consecutive_generated < turn_limit).then_some(self.consecutive_generated)
    }

    /// Count one delivered message against the limit.
    pub(crate) fn record_delivery(&mut self, turn_limit: u32) -> u32 {
        self.consecutive_generated = self
            .consecutive_generated
            .saturating_add(1)
            .min(turn_limit);
        self.consecutive_generated
    }

    /// Queue a task, keeping (priority desc, enqueued_at asc) order.
    ///
    /// Returns true when the lane was idle and a worker has to be started.
    pub(crate) fn push(&mut self, task: Task) -> bool {
        self.pending.push(task);
        self.pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        });
        if self.status == LaneStatus::Idle {
            self.status = LaneStatus::Processing;
            return true;
        }
        false
    }

    pub(crate) fn next_task(&mut self) -> Option<Task> {
        if self.pending.is_empty() {
            self.current = None;
            self.status = LaneStatus::Idle;
            return None;
        }
        let task = self.pending.remove(0);
        self.current = Some(CurrentTask {
            id: task.id,
            cancel: task.cancel.clone(),
        });
        self.status = LaneStatus::Processing;
        Some(task)
    }

    /// Cancel the running task and every queued one, then go idle.
    ///
    /// Returns whether the lane was processing when cancelled.
    pub(crate) fn cancel_all(&mut self) -> bool {
        let was_processing = self.status == LaneStatus::Processing;
        if let Some(current) = self.current.take() {
            current.cancel.cancel();
        }
        for task in self.pending.drain(..) {
            task.cancel.cancel();
        }
        self.status = LaneStatus::Idle;
        self.worker_epoch = self.worker_epoch.wrapping_add(1);
        was_processing
    }

    pub(crate) fn cancel_debounce(&mut self) -> Option<JoinHandle<()>> {
        let pending = self.debounce.take()?;
        pending.timer.cancel();
        Some(pending.handle)
    }

    pub(crate) fn snapshot(&self, conversation_id: &ConversationId) -> LaneStatusSnapshot {
        LaneStatusSnapshot {
            conversation_id: conversation_id.clone(),
            status: self.status,
            version: self.version,
            consecutive_generated: self.consecutive_generated,
            pending_tasks: self.pending.len(),
            current_task: self.current.as_ref().map(|c| c.id),
            debounce_pending: self.debounce.is_some(),
            last_activity: self.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use parley_chat::Participant;

    fn task(priority: TaskPriority, version: u64) -> Task {
        Task::new(
            Conversation::new("c1", vec![Participant::new("Alice")]),
            priority,
            CancellationToken::new(),
            version,
        )
    }

    #[test]
    fn queue_orders_by_priority_then_fifo() {
        let mut state = LaneState::new();
        let first_sim = task(TaskPriority::SimulatedReply, 0);
        let second_sim = task(TaskPriority::SimulatedReply, 0);
        let user = task(TaskPriority::UserTriggered, 0);
        let ids = (first_sim.id, second_sim.id, user.id);

        assert!(state.push(first_sim));
        assert!(!state.push(second_sim));
        assert!(!state.push(user));

        let order: Vec<Uuid> = std::iter::from_fn(|| state.next_task().map(|t| t.id)).collect();
        assert_eq!(order, vec![ids.2, ids.0, ids.1]);
        assert_eq!(state.status, LaneStatus::Idle);
        assert!(state.current.is_none());
    }

    #[test]
    fn cancel_all_fires_every_token_and_goes_idle() {
        let mut state = LaneState::new();
        state.push(task(TaskPriority::SimulatedReply, 0));
        state.push(task(TaskPriority::SimulatedReply, 0));
        let running = state.next_task().expect("task queued");
        let queued_token = state.pending[0].cancel.clone();
        let epoch = state.worker_epoch;

        assert!(state.cancel_all());
        assert!(running.cancel.is_cancelled());
        assert!(queued_token.is_cancelled());
        assert!(state.pending.is_empty());
        assert_eq!(state.status, LaneStatus::Idle);
        assert_ne!(state.worker_epoch, epoch);
        assert!(!state.cancel_all());
    }

    #[test]
    fn turn_counter_advances_per_delivery_and_stops_at_limit() {
        let mut state = LaneState::new();
        assert_eq!(state.next_turn(3), Some(0));
        assert_eq!(state.record_delivery(3), 1);
        assert_eq!(state.record_delivery(3), 2);
        assert_eq!(state.next_turn(3), Some(2));
        assert_eq!(state.record_delivery(3), 3);
        assert_eq!(state.next_turn(3), None);
        assert_eq!(state.record_delivery(3), 3);
    }

    #[test]
    fn stale_when_version_moves_or_token_fires() {
        let mut state = LaneState::new();
        let fresh = task(TaskPriority::SimulatedReply, 0);
        assert!(!state.is_stale(&fresh));
        state.version = 1;
        assert!(state.is_stale(&fresh));

        let current = task(TaskPriority::SimulatedReply, 1);
        assert!(!state.is_stale(&current));
        current.cancel.cancel();
        assert!(state.is_stale(&current));
    }
}
