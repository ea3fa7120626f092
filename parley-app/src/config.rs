//! parley configuration loader.

use parley_chat::{Conversation, Participant};
use parley_scheduler::SchedulerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ParleyConfig {
    pub generation: GenerationConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_conversation_id")]
    pub id: String,
    #[serde(default = "default_recipients")]
    pub recipients: Vec<String>,
}

fn default_conversation_id() -> String {
    "local".to_string()
}

fn default_recipients() -> Vec<String> {
    vec!["Alice".to_string(), "Bob".to_string()]
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            id: default_conversation_id(),
            recipients: default_recipients(),
        }
    }
}

impl ConversationConfig {
    pub fn to_conversation(&self) -> Conversation {
        Conversation::new(
            self.id.as_str(),
            self.recipients
                .iter()
                .map(|name| Participant::new(name.as_str()))
                .collect(),
        )
    }
}

impl ParleyConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub(crate) fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PARLEY_GENERATION_URL") {
            if !v.trim().is_empty() {
                self.generation.endpoint = v;
            }
        }
        if let Ok(v) = std::env::var("PARLEY_API_KEY") {
            if !v.trim().is_empty() {
                self.generation.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PARLEY_TURN_LIMIT") {
            match v.trim().parse::<u32>() {
                Ok(limit) => self.scheduler.turn_limit = limit,
                Err(e) => tracing::warn!(value = %v, %e, "ignoring invalid PARLEY_TURN_LIMIT"),
            }
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.generation.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("generation.endpoint is required"));
        }
        if self.conversation.id.trim().is_empty() {
            return Err(anyhow::anyhow!("conversation.id must not be empty"));
        }
        if self.conversation.recipients.is_empty() {
            return Err(anyhow::anyhow!(
                "conversation.recipients must name at least one recipient"
            ));
        }
        for (idx, name) in self.conversation.recipients.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(anyhow::anyhow!("conversation.recipients[{idx}] is empty"));
            }
            if self.conversation.recipients[..idx].contains(name) {
                return Err(anyhow::anyhow!(
                    "conversation.recipients lists {name:?} more than once"
                ));
            }
        }
        self.scheduler.validate()?;
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".parley").join("config.toml")
}
