//! Console driver for `parley chat`.
//!
//! Stdin lines become user messages for one local conversation; scheduler
//! events are folded into a shared transcript and printed as they arrive.

use crate::config::ParleyConfig;
use anyhow::Result;
use parley_chat::{Conversation, ConversationId, Message};
use parley_gen::HttpGenerationService;
use parley_scheduler::{ChannelEventSink, ConversationScheduler, SchedulerEvent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};

const HELP: &str = "Commands: /switch [id] /nudge /cancel /status /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Say(String),
    /// `None` means no conversation is on screen.
    Switch(Option<ConversationId>),
    Nudge,
    Cancel,
    Status,
    Quit,
    Unknown(String),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(input: &str) -> Option<ConsoleCommand> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('/') {
        return Some(ConsoleCommand::Say(trimmed.to_string()));
    }

    let mut parts = trimmed.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();
    let parsed = match command {
        "/switch" => ConsoleCommand::Switch(arg.map(ConversationId::from)),
        "/nudge" => ConsoleCommand::Nudge,
        "/cancel" => ConsoleCommand::Cancel,
        "/status" => ConsoleCommand::Status,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        other => ConsoleCommand::Unknown(other.to_string()),
    };
    Some(parsed)
}

/// Local copy of the conversation, kept in step with delivered events.
#[derive(Debug)]
pub struct Transcript {
    conversation: Conversation,
}

impl Transcript {
    pub fn new(conversation: Conversation) -> Self {
        Self { conversation }
    }

    pub fn id(&self) -> &ConversationId {
        &self.conversation.id
    }

    pub fn push_user(&mut self, content: &str) -> Conversation {
        self.conversation.messages.push(Message::user(content));
        self.conversation.clone()
    }

    pub fn snapshot(&self) -> Conversation {
        self.conversation.clone()
    }

    /// Fold an event into the transcript, returning the line to print.
    pub fn apply(&mut self, event: SchedulerEvent) -> Option<String> {
        match event {
            SchedulerEvent::MessageGenerated {
                conversation_id,
                message,
            } => {
                let line = format!("[{conversation_id}] {}: {}", message.sender, message.content);
                if conversation_id == self.conversation.id {
                    self.conversation.messages.push(message);
                }
                Some(line)
            }
            SchedulerEvent::MessageUpdated {
                conversation_id,
                message_id,
                update,
            } => {
                if conversation_id != self.conversation.id {
                    return None;
                }
                let reactions = update.reactions?;
                let message = self.conversation.message_mut(&message_id)?;
                message.reactions = reactions;
                let summary: Vec<String> = message
                    .reactions
                    .iter()
                    .map(|r| format!("{} {}", r.sender, r.kind))
                    .collect();
                Some(format!(
                    "[{conversation_id}] reactions on {:?}: {}",
                    message.content,
                    summary.join(", ")
                ))
            }
            SchedulerEvent::TypingStatusChanged {
                conversation_id: Some(conversation_id),
                sender: Some(sender),
            } => Some(format!("[{conversation_id}] {sender} is typing...")),
            SchedulerEvent::TypingStatusChanged { .. } => None,
            SchedulerEvent::ReactionPlayed {
                conversation_id,
                reaction,
            } => Some(format!(
                "[{conversation_id}] * {} reacted with {}",
                reaction.sender, reaction.kind
            )),
            SchedulerEvent::Error {
                conversation_id,
                message,
            } => Some(match conversation_id {
                Some(id) => format!("[{id}] error: {message}"),
                None => format!("error: {message}"),
            }),
        }
    }
}

pub async fn run(cfg: ParleyConfig) -> Result<()> {
    let generator = Arc::new(HttpGenerationService::new(
        &cfg.generation.endpoint,
        cfg.generation.api_key.as_deref(),
    )?);
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = ConversationScheduler::new(
        cfg.scheduler.clone(),
        generator,
        Arc::new(ChannelEventSink::new(tx)),
    )?;

    let transcript = Arc::new(Mutex::new(Transcript::new(
        cfg.conversation.to_conversation(),
    )));
    let conversation_id = transcript.lock().await.id().clone();
    scheduler
        .set_active_conversation(Some(conversation_id.clone()))
        .await;

    let printer = tokio::spawn(print_events(rx, transcript.clone()));
    tracing::info!(
        conversation_id = %conversation_id,
        recipients = ?cfg.conversation.recipients,
        endpoint = %cfg.generation.endpoint,
        "console chat started"
    );
    println!(
        "chatting in {conversation_id} with {}. {HELP}",
        cfg.conversation.recipients.join(", ")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break Ok(()),
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(anyhow::anyhow!("read stdin: {e}")),
        };
        let Some(command) = parse_command(&line) else {
            continue;
        };

        match command {
            ConsoleCommand::Say(text) => {
                let snapshot = transcript.lock().await.push_user(&text);
                if let Err(e) = scheduler.enqueue_user_message(snapshot).await {
                    break Err(e.into());
                }
            }
            ConsoleCommand::Nudge => {
                let snapshot = transcript.lock().await.snapshot();
                match scheduler.enqueue_simulated_message(snapshot).await {
                    Ok(true) => {}
                    Ok(false) => println!("turn limit reached; say something first"),
                    Err(e) => break Err(e.into()),
                }
            }
            ConsoleCommand::Cancel => {
                scheduler.cancel_lane(&conversation_id).await;
                println!("cancelled pending replies in {conversation_id}");
            }
            ConsoleCommand::Status => {
                let lanes = scheduler.status_snapshot().await;
                let active = scheduler.active_conversation().await;
                let report = serde_json::json!({
                    "active_conversation": active,
                    "lanes": lanes,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            ConsoleCommand::Switch(target) => {
                match &target {
                    Some(id) => println!("now viewing {id}"),
                    None => println!("no conversation on screen"),
                }
                scheduler.set_active_conversation(target).await;
            }
            ConsoleCommand::Quit => break Ok(()),
            ConsoleCommand::Unknown(command) => println!("unknown command {command}. {HELP}"),
        }
    };

    scheduler.dispose().await;
    printer.abort();
    tracing::info!("console chat stopped");
    outcome
}

async fn print_events(mut rx: UnboundedReceiver<SchedulerEvent>, transcript: Arc<Mutex<Transcript>>) {
    while let Some(event) = rx.recv().await {
        if let SchedulerEvent::Error { message, .. } = &event {
            tracing::warn!(error = %message, "scheduler reported an error");
        }
        if let Some(line) = transcript.lock().await.apply(event) {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_chat::{MessageUpdate, Participant, Reaction};

    fn transcript() -> Transcript {
        Transcript::new(Conversation::new(
            "local",
            vec![Participant::new("Alice"), Participant::new("Bob")],
        ))
    }

    #[test]
    fn parses_commands_and_plain_text() {
        assert_eq!(parse_command("   "), None);
        assert_eq!(
            parse_command(" hello there "),
            Some(ConsoleCommand::Say("hello there".to_string()))
        );
        assert_eq!(
            parse_command("/switch other"),
            Some(ConsoleCommand::Switch(Some(ConversationId::from("other"))))
        );
        assert_eq!(parse_command("/switch"), Some(ConsoleCommand::Switch(None)));
        assert_eq!(parse_command("/nudge"), Some(ConsoleCommand::Nudge));
        assert_eq!(parse_command("/exit"), Some(ConsoleCommand::Quit));
        assert_eq!(
            parse_command("/dance"),
            Some(ConsoleCommand::Unknown("/dance".to_string()))
        );
    }

    #[test]
    fn generated_messages_extend_the_transcript() {
        let mut t = transcript();
        let snapshot = t.push_user("hi");
        assert_eq!(snapshot.messages.len(), 1);

        let line = t.apply(SchedulerEvent::MessageGenerated {
            conversation_id: ConversationId::from("local"),
            message: Message::generated("Alice", "hey"),
        });
        assert_eq!(line.as_deref(), Some("[local] Alice: hey"));
        assert_eq!(t.snapshot().trailing_generated_count(), 1);

        t.apply(SchedulerEvent::MessageGenerated {
            conversation_id: ConversationId::from("elsewhere"),
            message: Message::generated("Bob", "not here"),
        });
        assert_eq!(t.snapshot().messages.len(), 2);
    }

    #[test]
    fn reaction_updates_replace_the_reaction_list() {
        let mut t = transcript();
        let snapshot = t.push_user("hi");
        let target = snapshot.messages[0].id.clone();
        let reaction = Reaction {
            kind: "heart".to_string(),
            sender: "Bob".to_string(),
        };

        let line = t.apply(SchedulerEvent::MessageUpdated {
            conversation_id: ConversationId::from("local"),
            message_id: target,
            update: MessageUpdate {
                reactions: Some(vec![reaction.clone()]),
            },
        });
        assert!(line.expect("printed").contains("Bob heart"));
        assert_eq!(t.snapshot().messages[0].reactions, vec![reaction]);
    }

    #[test]
    fn cleared_typing_prints_nothing() {
        let mut t = transcript();
        let cleared = SchedulerEvent::TypingStatusChanged {
            conversation_id: None,
            sender: None,
        };
        assert_eq!(t.apply(cleared), None);
    }
}
