use crate::error::SchedulerError;
use parley_chat::{ConversationId, Message, MessageId, MessageUpdate, Reaction};
use tokio::sync::mpsc::UnboundedSender;

/// Outbound notifications from the scheduler.
///
/// Callbacks are invoked while the emitting lane is locked, so they must not
/// block. Forward to a channel or a UI queue instead of doing work inline.
pub trait EventSink: Send + Sync {
    fn on_message_generated(&self, conversation_id: &ConversationId, message: &Message);

    fn on_message_updated(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        update: &MessageUpdate,
    );

    /// `None, None` clears the typing indicator.
    fn on_typing_status_changed(
        &self,
        conversation_id: Option<&ConversationId>,
        sender: Option<&str>,
    );

    fn on_error(&self, error: &SchedulerError);

    /// Audible/visual cue for a freshly applied reaction.
    fn on_reaction_played(&self, _conversation_id: &ConversationId, _reaction: &Reaction) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    MessageGenerated {
        conversation_id: ConversationId,
        message: Message,
    },
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        update: MessageUpdate,
    },
    TypingStatusChanged {
        conversation_id: Option<ConversationId>,
        sender: Option<String>,
    },
    ReactionPlayed {
        conversation_id: ConversationId,
        reaction: Reaction,
    },
    Error {
        conversation_id: Option<ConversationId>,
        message: String,
    },
}

impl SchedulerEvent {
    pub fn is_typing_cleared(&self) -> bool {
        matches!(
            self,
            Self::TypingStatusChanged {
                conversation_id: None,
                sender: None
            }
        )
    }
}

/// Sink that forwards every callback as a [`SchedulerEvent`] on an
/// unbounded channel, preserving emission order.
#[derive(Clone)]
pub struct ChannelEventSink {
    tx: UnboundedSender<SchedulerEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: UnboundedSender<SchedulerEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: SchedulerEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("scheduler event receiver dropped");
        }
    }
}

impl EventSink for ChannelEventSink {
    fn on_message_generated(&self, conversation_id: &ConversationId, message: &Message) {
        self.send(SchedulerEvent::MessageGenerated {
            conversation_id: conversation_id.clone(),
            message: message.clone(),
        });
    }

    fn on_message_updated(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        update: &MessageUpdate,
    ) {
        self.send(SchedulerEvent::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            update: update.clone(),
        });
    }

    fn on_typing_status_changed(
        &self,
        conversation_id: Option<&ConversationId>,
        sender: Option<&str>,
    ) {
        self.send(SchedulerEvent::TypingStatusChanged {
            conversation_id: conversation_id.cloned(),
            sender: sender.map(str::to_string),
        });
    }

    fn on_error(&self, error: &SchedulerError) {
        self.send(SchedulerEvent::Error {
            conversation_id: error.conversation_id().cloned(),
            message: error.to_string(),
        });
    }

    fn on_reaction_played(&self, conversation_id: &ConversationId, reaction: &Reaction) {
        self.send(SchedulerEvent::ReactionPlayed {
            conversation_id: conversation_id.clone(),
            reaction: reaction.clone(),
        });
    }
}
