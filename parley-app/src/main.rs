//! parley main binary.

mod config;
mod console;
mod init;

use clap::{Parser, Subcommand};
use config::ParleyConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Simulated group chat on a per-conversation scheduler")]
struct Cli {
    /// Config file to use instead of ~/.parley/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Chat with the configured recipients on the console (default).
    Chat,
    /// Write a starter config (default ~/.parley/config.toml); never overwrites.
    Init {
        /// Generation service endpoint to put in the config.
        #[arg(long)]
        endpoint: Option<String>,
        /// Conversation id for the console chat.
        #[arg(long)]
        conversation: Option<String>,
        /// Recipient name; repeat for a group chat.
        #[arg(long = "recipient")]
        recipients: Vec<String>,
    },
    /// Validate config and print the effective scheduler settings.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Chat
    };

    match command {
        Command::Chat => {
            let cfg = ParleyConfig::load(cli.config).await?;
            console::run(cfg).await
        }
        Command::Init {
            endpoint,
            conversation,
            recipients,
        } => {
            let path = cli.config.unwrap_or_else(config::default_config_path);
            let options = init::InitOptions {
                endpoint,
                conversation_id: conversation,
                recipients,
            };
            match init::write_config(&path, &options).await? {
                init::InitOutcome::Created(path) => {
                    println!("parley init: wrote {}", path.display());
                    println!("next: run `parley doctor` to check the settings");
                }
                init::InitOutcome::Kept(path) => {
                    println!(
                        "parley init: {} already exists; left unchanged",
                        path.display()
                    );
                }
            }
            Ok(())
        }
        Command::Doctor => doctor(cli.config).await,
    }
}

async fn doctor(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (cfg, path) = ParleyConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        endpoint = %cfg.generation.endpoint,
        api_key_set = cfg.generation.api_key.is_some(),
        conversation_id = %cfg.conversation.id,
        recipients = cfg.conversation.recipients.len(),
        turn_limit = cfg.scheduler.turn_limit,
        "config ok"
    );
    println!("config: {}", path.display());
    println!("endpoint: {}", cfg.generation.endpoint);
    println!(
        "conversation: {} ({})",
        cfg.conversation.id,
        cfg.conversation.recipients.join(", ")
    );
    println!("scheduler:\n{}", toml::to_string_pretty(&cfg.scheduler)?);
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,parley=debug,parley_app=debug,parley_scheduler=debug,parley_gen=debug",
        ),
    };
    let log_format = std::env::var("PARLEY_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    // Logs go to stderr so they never interleave with the chat transcript.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported PARLEY_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
