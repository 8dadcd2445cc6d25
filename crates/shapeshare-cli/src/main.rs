use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use shapeshare_agent::{Caller, CommandReport, CommandTranslator};
use shapeshare_canvas::Reorder;
use shapeshare_core::config::Config;
use shapeshare_core::memory_gateway::InMemoryGateway;
use shapeshare_core::types::{Geometry, Position, Shape, ShapeDraft, ShapePatch, ShapeType};
use shapeshare_providers::openai::OpenAiGateway;
use shapeshare_sync::{SessionConfig, SessionHandle, spawn_session};

mod logging;

#[derive(Parser)]
#[command(
    name = "shapeshare",
    about = "Real-time shared canvas with an AI drawing assistant",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an input channel and submit one instruction per line
    Prompt {
        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Submit a single instruction
    Command {
        /// The instruction, e.g. "Create a blue rectangle at 500, 500"
        text: String,

        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Run two in-process sessions against a shared in-memory backend
    Demo,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct CallerArgs {
    /// User id from the auth table
    #[arg(short, long)]
    user: String,

    /// Caller token (default: $SHAPESHARE_TOKEN)
    #[arg(long)]
    token: Option<String>,
}

impl CallerArgs {
    fn caller(&self) -> anyhow::Result<Caller> {
        let token = match &self.token {
            Some(token) => token.clone(),
            None => std::env::var("SHAPESHARE_TOKEN")
                .context("no --token given and SHAPESHARE_TOKEN is not set")?,
        };
        Ok(Caller::new(self.user.clone(), token))
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
    /// Write a default config file if none exists
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Prompt { caller } => {
            ensure_valid(&config)?;
            let caller = caller.caller()?;
            let (translator, session) = local_canvas(config, &caller.user_id)?;
            run_prompt(&translator, &caller, &session).await?;
            session.shutdown();
        }
        Commands::Command { text, caller } => {
            ensure_valid(&config)?;
            let caller = caller.caller()?;
            let (translator, session) = local_canvas(config, &caller.user_id)?;
            let report = translator.translate(&caller, &text, &session).await?;
            print_report(&report);
            print_shapes(&session.shapes().await?);
            session.shutdown();
        }
        Commands::Demo => {
            ensure_valid(&config)?;
            run_demo(&config).await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("{} is valid", config_path.display());
            }
            ConfigAction::Init => {
                if config_path.exists() {
                    anyhow::bail!("{} already exists", config_path.display());
                }
                if let Some(dir) = config_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                Config::default().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
    }

    Ok(())
}

/// Refuse to start sessions on a config with errors; warnings are logged.
fn ensure_valid(config: &Config) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        warn!("{w}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }
    Ok(())
}

/// A translator plus a session on a process-local canvas.
fn local_canvas(config: Config, user_id: &str) -> anyhow::Result<(CommandTranslator, SessionHandle)> {
    let display_name = config
        .user(user_id)
        .and_then(|u| u.display_name.clone())
        .unwrap_or_else(|| user_id.to_string());
    let inference = OpenAiGateway::from_config(&config)?;
    let backend = InMemoryGateway::new();
    let (session, _task) = spawn_session(
        Arc::new(backend.link()),
        SessionConfig::from_config(&config, user_id, display_name),
    );
    let translator = CommandTranslator::new(Arc::new(inference), Arc::new(config));
    Ok((translator, session))
}

async fn run_prompt(
    translator: &CommandTranslator,
    caller: &Caller,
    session: &SessionHandle,
) -> anyhow::Result<()> {
    println!("Describe a change to the canvas. Type 'shapes' to list shapes, 'exit' to quit.");
    loop {
        let line = tokio::task::spawn_blocking(|| {
            dialoguer::Input::<String>::new()
                .with_prompt("canvas")
                .allow_empty(true)
                .interact_text()
        })
        .await??;

        match line.trim() {
            "" => continue,
            "exit" | "quit" => break,
            "shapes" => print_shapes(&session.shapes().await?),
            instruction => match translator.translate(caller, instruction, session).await {
                Ok(report) => print_report(&report),
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }
    Ok(())
}

fn print_report(report: &CommandReport) {
    if !report.message.is_empty() {
        println!("{}", report.message);
    }
    println!("status: {:?}", report.status());
    for call in &report.applied {
        println!("  applied  {} {}", call.tool, call.shape_ids.join(", "));
    }
    for call in &report.rejected {
        println!("  rejected {} ({})", call.tool, call.reason);
    }
}

fn print_shapes(shapes: &[Shape]) {
    if shapes.is_empty() {
        println!("(empty canvas)");
    }
    for s in shapes {
        println!(
            "  {:<38} {:<9} at ({:.0}, {:.0}) {}x{} fill {} z {}",
            s.id,
            s.shape_type.as_str(),
            s.geometry.x,
            s.geometry.y,
            s.geometry.width,
            s.geometry.height,
            s.style.fill,
            s.z_index
        );
    }
}

/// Two collaborators editing the same canvas, one of them dropping offline.
async fn run_demo(config: &Config) -> anyhow::Result<()> {
    let backend = InMemoryGateway::new();
    let alice_link = backend.link();
    let (alice, alice_task) = spawn_session(
        Arc::new(alice_link.clone()),
        SessionConfig::from_config(config, "alice", "Alice"),
    );
    let (bob, bob_task) = spawn_session(
        Arc::new(backend.link()),
        SessionConfig::from_config(config, "bob", "Bob"),
    );
    for session in [&alice, &bob] {
        let mut state = session.watch_connection();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_connected()))
            .await
            .context("session did not connect")??;
    }
    info!("Both sessions connected");

    let card = alice
        .create(
            ShapeDraft::new(ShapeType::Rectangle, Geometry::new(100.0, 100.0, 240.0, 160.0))
                .with_fill("#4363d8"),
        )
        .await?;
    let label = alice
        .create(
            ShapeDraft::new(ShapeType::Text, Geometry::new(120.0, 120.0, 200.0, 40.0))
                .with_text("Hello, canvas", 24.0),
        )
        .await?;
    alice.move_cursor(Position::new(130.0, 130.0))?;
    alice.select(vec![card.id.clone()])?;

    println!("Alice drew two shapes.");
    for _ in 0..200 {
        if bob.shapes().await?.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    println!("Bob sees:");
    print_shapes(&bob.shapes().await?);

    bob.update(card.id.clone(), ShapePatch::position(400.0, 220.0)).await?;
    bob.reorder(label.id.clone(), Reorder::ToBack).await?;

    println!("Alice goes offline and keeps editing.");
    alice_link.set_online(false);
    alice
        .update(
            label.id.clone(),
            ShapePatch {
                text: Some("Edited offline".into()),
                ..ShapePatch::default()
            },
        )
        .await?;
    println!("Alice has {} unsent writes.", alice.pending_writes().await?);

    alice_link.set_online(true);
    let mut state = alice.watch_connection();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_connected()))
        .await
        .context("alice did not reconnect")??;
    for _ in 0..200 {
        if alice.pending_writes().await? == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if alice.pending_writes().await? > 0 {
        warn!("Alice still has unsent writes");
    }
    // Give Bob's subscription a moment to deliver the flushed writes.
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("After reconnect, Alice sees:");
    print_shapes(&alice.shapes().await?);
    println!("After reconnect, Bob sees:");
    print_shapes(&bob.shapes().await?);

    let collaborators = bob.collaborators().await?;
    for user in &collaborators.users {
        println!("Bob sees {} online, selecting {:?}", user.display_name, user.selection);
    }

    alice.shutdown();
    bob.shutdown();
    alice_task.await?;
    bob_task.await?;
    Ok(())
}
