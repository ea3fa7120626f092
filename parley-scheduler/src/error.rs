use parley_chat::ConversationId;
use parley_gen::GenerationError;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("generation request failed for conversation {conversation_id} (task {task_id}): {source}")]
    GenerationRequestFailed {
        conversation_id: ConversationId,
        task_id: Uuid,
        #[source]
        source: GenerationError,
    },

    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),

    #[error("scheduler has been disposed")]
    Disposed,
}

impl SchedulerError {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::GenerationRequestFailed {
                conversation_id, ..
            } => Some(conversation_id),
            Self::InvalidConfig(_) | Self::Disposed => None,
        }
    }
}
