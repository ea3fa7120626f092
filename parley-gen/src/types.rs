use parley_chat::{Message, MessageId, Participant, Reaction};
use serde::{Deserialize, Serialize};

/// Request body sent to the generation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub recipients: Vec<Participant>,
    pub message_history: Vec<Message>,
    pub should_wrap_up: bool,
    pub is_one_on_one: bool,
    pub should_react: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionProposal {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    /// Message the reaction lands on. Absent means "the newest user message".
    #[serde(default)]
    pub target_message_id: Option<MessageId>,
}

impl ReactionProposal {
    pub fn to_reaction(&self) -> Reaction {
        Reaction {
            kind: self.kind.clone(),
            sender: self.sender.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    #[serde(default)]
    pub content: String,
    pub sender: String,
    #[serde(default)]
    pub reaction: Option<ReactionProposal>,
}

impl GenerationResponse {
    pub fn reply(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender: sender.into(),
            reaction: None,
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.sender.trim().is_empty() {
            return Err(crate::error::GenerationError::ResponseFormat(
                "response sender is empty".to_string(),
            ));
        }
        if !self.has_content() && self.reaction.is_none() {
            return Err(crate::error::GenerationError::ResponseFormat(
                "response carries neither content nor a reaction".to_string(),
            ));
        }
        Ok(())
    }
}
