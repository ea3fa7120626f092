//! `parley init`: render a starter config into place.
//!
//! The repository template supplies the `[scheduler]` tuning. The command
//! line can pin the generation endpoint, the conversation id and its
//! recipients. The rendered file must load as a [`ParleyConfig`] before it
//! is written, and an existing file is never replaced.

use crate::config::ParleyConfig;
use anyhow::Result;
use std::path::{Path, PathBuf};
use toml::{Table, Value};

const TEMPLATE: &str = include_str!("../../config-templates/config.toml");

const HEADER: &str = "\
# parley local configuration.
#
# Environment overrides: PARLEY_GENERATION_URL, PARLEY_API_KEY, PARLEY_TURN_LIMIT.

";

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub endpoint: Option<String>,
    pub conversation_id: Option<String>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Created(PathBuf),
    /// A config already existed at this path and was left untouched.
    Kept(PathBuf),
}

/// Template with `options` applied, checked against the config loader.
pub fn render(options: &InitOptions) -> Result<String> {
    let mut doc: Table = TEMPLATE
        .parse()
        .map_err(|e| anyhow::anyhow!("parse config template: {e}"))?;

    if let Some(endpoint) = options.endpoint.as_deref() {
        table_mut(&mut doc, "generation")?.insert(
            "endpoint".to_string(),
            Value::String(endpoint.trim().to_string()),
        );
    }
    if let Some(id) = options.conversation_id.as_deref() {
        table_mut(&mut doc, "conversation")?
            .insert("id".to_string(), Value::String(id.trim().to_string()));
    }
    if !options.recipients.is_empty() {
        let names = options
            .recipients
            .iter()
            .map(|name| Value::String(name.trim().to_string()))
            .collect();
        table_mut(&mut doc, "conversation")?.insert("recipients".to_string(), Value::Array(names));
    }

    let body = toml::to_string_pretty(&doc)?;
    ParleyConfig::parse(&body)
        .and_then(|cfg| cfg.validate())
        .map_err(|e| anyhow::anyhow!("rendered config is invalid: {e}"))?;
    Ok(format!("{HEADER}{body}"))
}

fn table_mut<'a>(doc: &'a mut Table, name: &str) -> Result<&'a mut Table> {
    doc.entry(name)
        .or_insert(Value::Table(Table::new()))
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("config template [{name}] is not a table"))
}

pub async fn write_config(path: &Path, options: &InitOptions) -> Result<InitOutcome> {
    let contents = render(options)?;

    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| anyhow::anyhow!("inspect config path {}: {e}", path.display()))?;
    if exists {
        tracing::debug!(path = %path.display(), "config already present; leaving it alone");
        return Ok(InitOutcome::Kept(path.to_path_buf()));
    }

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| anyhow::anyhow!("create config dir {}: {e}", dir.display()))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| anyhow::anyhow!("write config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote starter config");
    Ok(InitOutcome::Created(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_scheduler::SchedulerConfig;
    use uuid::Uuid;

    fn scratch_config() -> PathBuf {
        std::env::temp_dir()
            .join(format!("parley-init-{}", Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn render_applies_command_line_choices() {
        let rendered = render(&InitOptions {
            endpoint: Some(" http://10.0.0.2:9000/generate ".to_string()),
            conversation_id: Some("friends".to_string()),
            recipients: vec!["Cara".to_string(), "Dan".to_string(), "Eve".to_string()],
        })
        .expect("render");
        assert!(rendered.starts_with(HEADER));

        let cfg = ParleyConfig::parse(&rendered).expect("rendered config parses");
        assert_eq!(cfg.generation.endpoint, "http://10.0.0.2:9000/generate");
        assert_eq!(cfg.conversation.id, "friends");
        assert_eq!(cfg.conversation.recipients, vec!["Cara", "Dan", "Eve"]);
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn render_without_choices_keeps_template_values() {
        let cfg = ParleyConfig::parse(&render(&InitOptions::default()).expect("render"))
            .expect("rendered config parses");
        let template = ParleyConfig::parse(TEMPLATE).expect("template parses");
        assert_eq!(cfg.generation.endpoint, template.generation.endpoint);
        assert_eq!(cfg.conversation.recipients, template.conversation.recipients);
        assert_eq!(cfg.scheduler, template.scheduler);
    }

    #[test]
    fn render_refuses_recipients_the_loader_would_reject() {
        let err = render(&InitOptions {
            recipients: vec!["Cara".to_string(), "Cara".to_string()],
            ..InitOptions::default()
        })
        .expect_err("duplicate recipients rejected");
        assert!(err.to_string().contains("more than once"));
    }

    #[tokio::test]
    async fn write_config_never_replaces_an_existing_file() {
        let path = scratch_config();
        let created = write_config(&path, &InitOptions::default())
            .await
            .expect("first write");
        assert_eq!(created, InitOutcome::Created(path.clone()));
        ParleyConfig::load(Some(path.clone()))
            .await
            .expect("written config loads");

        std::fs::write(&path, "# hand edited\n").expect("edit config");
        let again = write_config(
            &path,
            &InitOptions {
                endpoint: Some("http://elsewhere:1/generate".to_string()),
                ..InitOptions::default()
            },
        )
        .await
        .expect("second write");
        assert_eq!(again, InitOutcome::Kept(path.clone()));
        assert_eq!(
            std::fs::read_to_string(&path).expect("read config"),
            "# hand edited\n"
        );

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
