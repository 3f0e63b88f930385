#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI binary: stdout/stderr is the UI

mod access;
mod cli;
mod config;
mod config_check;
mod conversation;
mod event_loop;
mod keyboard;
mod ledger;
mod mailbox;
mod menu;
mod orchestrator;
mod registry;
mod stats;
mod tracing_setup;
mod user;
mod user_store;

use anyhow::{Context, Result};
use clap::Parser;
use parley_agent::{ElevenLabsSynthesizer, OpenAiProvider};
use parley_channels::{TelegramApi, TelegramUpdates, TerminalHandle, TerminalOutput, terminal_pair};
use parley_core::{CompletionProvider, Transport, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{Config, env_secret};
use crate::event_loop::run_event_loop;
use crate::ledger::UsageLedger;
use crate::orchestrator::{Orchestrator, Services, Settings};
use crate::user_store::{DiskUserStore, MemoryUserStore, UserStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = tracing_setup::init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "parley starting"
    );

    match cli.command {
        Commands::Check { format } => cmd_check(cli.config.as_deref(), &format),
        Commands::Start => cmd_start(cli.config.as_deref()).await,
        Commands::Chat { user, ephemeral } => {
            cmd_chat(cli.config.as_deref(), user, ephemeral).await
        }
        Commands::Version => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config_file = Config::find_config_path(config_path);
    Config::load(&config_file)
        .with_context(|| format!("loading config from {}", config_file.display()))
}

fn settings(config: &Config) -> Settings {
    Settings {
        admin: config.admin(),
        summary_window: config.limits.summary_window,
        service_timeout: config.service_timeout(),
    }
}

/// Completion, transcription and speech clients. A missing key is fatal.
fn build_services(config: &Config) -> Result<Services> {
    let openai = Arc::new(
        OpenAiProvider::new(
            env_secret(&config.completion.api_key_env)?,
            &config.completion.api_base,
            &config.completion.transcription_model,
        )
        .context("failed to initialize completion client")?,
    );
    let synthesizer = Arc::new(
        ElevenLabsSynthesizer::new(
            env_secret(&config.speech.api_key_env)?,
            &config.speech.api_base,
            &config.speech.voice_id,
            &config.speech.model_id,
        )
        .context("failed to initialize speech client")?,
    );

    Ok(Services {
        completion: Arc::clone(&openai) as Arc<dyn CompletionProvider>,
        transcriber: openai,
        synthesizer,
    })
}

fn build_orchestrator(
    config: &Config,
    store: Arc<dyn UserStore>,
    transport: Arc<dyn Transport>,
    services: Services,
) -> Result<Arc<Orchestrator>> {
    let ledger = UsageLedger::new(config.catalog(), config.limits.usage_ceiling);
    let orchestrator = Orchestrator::new(store, transport, services, ledger, settings(config))?;
    Ok(Arc::new(orchestrator))
}

// ---------------------------------------------------------------------------
// cmd_check: validate config without starting
// ---------------------------------------------------------------------------

#[allow(clippy::unnecessary_wraps)] // must return Result to match main's match arms
fn cmd_check(config_path: Option<&str>, format: &str) -> Result<()> {
    let config_file = Config::find_config_path(config_path);
    let report = config_check::validate_config(&config_file);

    match format {
        "json" => report.print_json(),
        _ => report.print_human(),
    }

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cmd_start: serve Telegram
// ---------------------------------------------------------------------------

async fn cmd_start(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;

    let token = env_secret(&config.telegram.token_env)?;
    let services = build_services(&config)?;
    let api = Arc::new(
        TelegramApi::new(
            token,
            &config.telegram.api_base,
            config.telegram.poll_timeout_secs,
        )
        .context("failed to initialize telegram client")?,
    );

    let store = Arc::new(DiskUserStore::new(config.users_path())?);
    info!(path = %store.path().display(), "using users file");

    let orchestrator = build_orchestrator(
        &config,
        store,
        Arc::clone(&api) as Arc<dyn Transport>,
        services,
    )?;
    let updates = TelegramUpdates::new(api, config.telegram.poll_timeout_secs);

    tokio::select! {
        result = run_event_loop(updates, orchestrator) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// cmd_chat: one local user over the terminal transport
// ---------------------------------------------------------------------------

async fn cmd_chat(config_path: Option<&str>, user: Option<i64>, ephemeral: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let user = user.map_or_else(|| config.admin(), UserId);
    let services = build_services(&config)?;

    let store: Arc<dyn UserStore> = if ephemeral {
        Arc::new(MemoryUserStore::default())
    } else {
        Arc::new(DiskUserStore::new(config.users_path())?)
    };

    let (inbound, transport, handle) = terminal_pair(64, user);
    let orchestrator = build_orchestrator(&config, store, Arc::new(transport), services)?;
    let TerminalHandle { tx, mut rx } = handle;

    let event_loop = tokio::spawn(run_event_loop(inbound, orchestrator));
    let printer = tokio::spawn(async move {
        while let Some(output) = rx.recv().await {
            println!("{}", format_output(&output));
        }
    });

    println!("chatting as user {user}, Ctrl-D to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.send(line.to_owned()).await.is_err() {
            warn!("event loop stopped, leaving chat");
            break;
        }
    }
    drop(tx);

    // Closing the input ends the loop once queued events are handled.
    match event_loop.await {
        Ok(Err(err)) => debug!(error = %format!("{err:#}"), "event loop finished"),
        Ok(Ok(())) => {}
        Err(err) => warn!(error = %err, "event loop task failed"),
    }
    if tokio::time::timeout(Duration::from_secs(2), printer)
        .await
        .is_err()
    {
        debug!("output printer still running at exit");
    }
    Ok(())
}

fn format_output(output: &TerminalOutput) -> String {
    match output {
        TerminalOutput::Message { id, text, buttons } => {
            if buttons.is_empty() {
                format!("[{id}] {text}")
            } else {
                format!("[{id}] {text}\n    {}", buttons.join(" | "))
            }
        }
        TerminalOutput::Edit { id, text } => format!("[{id}~] {text}"),
        TerminalOutput::Delete { id } => format!("[{id}] (removed)"),
        TerminalOutput::File {
            name,
            caption,
            bytes,
        } => match caption {
            Some(caption) => format!("[file] {name} ({} bytes): {caption}", bytes.len()),
            None => format!("[file] {name} ({} bytes)", bytes.len()),
        },
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::fakes::{FakeProvider, FakeSynthesizer, FakeTranscriber};

    fn test_config() -> Config {
        Config::parse("[admin]\nid = 5\n[limits]\nsummary_window = 3\nservice_timeout_secs = 9\n").unwrap()
    }

    fn fake_services() -> Services {
        Services {
            completion: Arc::new(FakeProvider::new("hello there")),
            transcriber: Arc::new(FakeTranscriber::new("spoken words")),
            synthesizer: Arc::new(FakeSynthesizer::new()),
        }
    }

    #[test]
    fn settings_follow_config() {
        let settings = settings(&test_config());
        assert_eq!(settings.admin, UserId(5));
        assert_eq!(settings.summary_window, 3);
        assert_eq!(settings.service_timeout, Duration::from_secs(9));
    }

    #[test]
    fn format_message_with_buttons() {
        let output = TerminalOutput::Message {
            id: 3,
            text: "Main Menu".into(),
            buttons: vec!["/list".into(), "/new".into()],
        };
        assert_eq!(format_output(&output), "[3] Main Menu\n    /list | /new");
    }

    #[test]
    fn format_file_with_caption() {
        let output = TerminalOutput::File {
            name: "answer.mp3".into(),
            caption: Some("hi".into()),
            bytes: vec![0; 4],
        };
        assert_eq!(format_output(&output), "[file] answer.mp3 (4 bytes): hi");
    }

    #[tokio::test]
    async fn terminal_session_reaches_the_admin_menu() {
        let config = test_config();
        let (inbound, transport, handle) = terminal_pair(16, config.admin());
        let orchestrator = build_orchestrator(
            &config,
            Arc::new(MemoryUserStore::default()),
            Arc::new(transport),
            fake_services(),
        )
        .unwrap();
        let TerminalHandle { tx, mut rx } = handle;

        let event_loop = tokio::spawn(run_event_loop(inbound, orchestrator));
        tx.send("hi".into()).await.unwrap();
        tx.send("/ping".into()).await.unwrap();
        drop(tx);
        assert!(event_loop.await.unwrap().is_err());

        let mut texts = Vec::new();
        while let Ok(output) = rx.try_recv() {
            if let TerminalOutput::Message { text, .. } = output {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["Welcome back", "pong"]);
    }
}
