use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// An AI-played party in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Participant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Generated,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    fn new(kind: MessageKind, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::random(),
            sender: sender.into(),
            content: content.into(),
            kind,
            reactions: Vec::new(),
            sent_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, "user", content)
    }

    pub fn generated(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Generated, sender, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, "system", content)
    }

    pub fn is_user(&self) -> bool {
        self.kind == MessageKind::User
    }
}

/// Partial update applied to an already delivered message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Reaction>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub recipients: Vec<Participant>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<ConversationId>, recipients: Vec<Participant>) -> Self {
        Self {
            id: id.into(),
            recipients,
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn is_one_on_one(&self) -> bool {
        self.recipients.len() <= 1
    }

    /// Number of non-user messages after the newest user message.
    pub fn trailing_generated_count(&self) -> usize {
        self.messages
            .iter()
            .rev()
            .take_while(|m| !m.is_user())
            .count()
    }

    pub fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    /// Default target for a reaction that does not name one: the newest user
    /// message, falling back to the newest message of any kind.
    pub fn reaction_target(&self) -> Option<&MessageId> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .or_else(|| self.messages.last())
            .map(|m| &m.id)
    }
}
