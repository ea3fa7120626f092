use chrono::{DateTime, Utc};
use parley_chat::{Conversation, Participant};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    SimulatedReply = 50,
    UserTriggered = 100,
}

impl TaskPriority {
    pub fn weight(self) -> u8 {
        self as u8
    }
}

/// One scheduled turn. The conversation is a value copy taken at enqueue time;
/// the turn index is read from the lane counter when the task starts.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub(crate) id: Uuid,
    pub(crate) conversation: Conversation,
    pub(crate) priority: TaskPriority,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) cancel: CancellationToken,
    pub(crate) version_snapshot: u64,
    /// Whoever spoke last; left out of the next round-robin request.
    pub(crate) excluded_sender: Option<String>,
}

impl Task {
    pub(crate) fn new(
        conversation: Conversation,
        priority: TaskPriority,
        cancel: CancellationToken,
        version_snapshot: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation,
            priority,
            enqueued_at: Utc::now(),
            cancel,
            version_snapshot,
            excluded_sender: None,
        }
    }

    pub(crate) fn excluding(mut self, sender: impl Into<String>) -> Self {
        self.excluded_sender = Some(sender.into());
        self
    }

    /// Recipients eligible to answer this turn.
    pub(crate) fn responders(&self) -> Vec<Participant> {
        let all = &self.conversation.recipients;
        let Some(excluded) = self.excluded_sender.as_deref() else {
            return all.clone();
        };
        let remaining: Vec<Participant> = all
            .iter()
            .filter(|p| p.name != excluded)
            .cloned()
            .collect();
        if remaining.is_empty() {
            all.clone()
        } else {
            remaining
        }
    }

    pub(crate) fn is_direct_reply(&self) -> bool {
        self.priority == TaskPriority::UserTriggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Conversation {
        Conversation::new(
            "c1",
            vec![
                Participant::new("Alice"),
                Participant::new("Bob"),
                Participant::new("Cara"),
            ],
        )
    }

    #[test]
    fn priorities_order_user_first() {
        assert!(TaskPriority::UserTriggered > TaskPriority::SimulatedReply);
        assert_eq!(TaskPriority::UserTriggered.weight(), 100);
        assert_eq!(TaskPriority::SimulatedReply.weight(), 50);
    }

    #[test]
    fn responders_skip_last_speaker() {
        let task = Task::new(
            conversation(),
            TaskPriority::SimulatedReply,
            CancellationToken::new(),
            0,
        )
        .excluding("Alice");
        let names: Vec<String> = task.responders().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Bob".to_string(), "Cara".to_string()]);
    }

    #[test]
    fn responders_fall_back_to_everyone() {
        let convo = Conversation::new("c2", vec![Participant::new("Alice")]);
        let task = Task::new(
            convo,
            TaskPriority::SimulatedReply,
            CancellationToken::new(),
            0,
        )
        .excluding("Alice");
        assert_eq!(task.responders().len(), 1);
    }
}
