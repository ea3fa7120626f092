//! Conversation value types shared by the scheduler and the generation client.
//!
//! Everything here is a plain value: the scheduler clones snapshots into tasks
//! and never holds a live reference to caller-owned state.

mod types;

pub use types::{
    Conversation, ConversationId, Message, MessageId, MessageKind, MessageUpdate, Participant,
    Reaction,
};
