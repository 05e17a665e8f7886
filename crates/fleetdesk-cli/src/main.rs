use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetdesk_core::{ChangeEnvelope, LogSeverity};
use fleetdesk_engine::{CommandOutcome, DisplayEvent, Engine, EngineConfig, FleetSnapshot};
use fleetdesk_store::{read_journal, FeedJournal, MemoryBackend, SqliteStore};

#[derive(Parser)]
#[command(name = "fleetdesk")]
#[command(about = "Operator console for a shared fleet database", long_about = None)]
struct Cli {
    /// Path to the shared fleet database
    #[arg(long, default_value = "fleetdesk.db")]
    db: PathBuf,
    /// Mirror the change feed to an NDJSON journal file
    #[arg(long)]
    journal: Option<PathBuf>,
    #[arg(long)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known agents with status and last contact
    Agents,
    /// Send a command to an agent and wait for its result
    Send {
        #[arg(long)]
        agent: String,
        /// Seconds to wait for the result before giving up
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        command: String,
    },
    /// Stream fleet changes until interrupted
    Watch,
    /// Session event log
    Log {
        #[command(subcommand)]
        action: LogCommands,
    },
    /// Replay a change-feed journal through a throwaway engine
    Replay { file: PathBuf },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Print the persisted event log as rendered lines
    Export,
    /// Clear the persisted event log
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Commands::Agents => {
            let store = open_store(&cli.db, cli.journal.as_deref())?;
            let agents = store.list_agents_sync().context("list agents")?;
            if agents.is_empty() {
                println!("No agents registered.");
                return Ok(());
            }
            for agent in agents {
                println!(
                    "{:<24} {:<20} {:<9} last seen {}",
                    agent.agent_id,
                    agent.hostname,
                    agent.status.as_str(),
                    agent.last_seen.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Send {
            agent,
            timeout_secs,
            command,
        } => {
            let backend = Arc::new(open_store(&cli.db, cli.journal.as_deref())?);
            let engine = Engine::start(backend, EngineConfig::default()).await?;
            info!(event = "console_send", agent_id = %agent, command = %command);
            let (dispatched, outcome) = engine
                .run_command(&agent, &command, Some(Duration::from_secs(timeout_secs)))
                .await?;
            let timed_out = match outcome {
                CommandOutcome::Completed(result) => {
                    println!(
                        "command {} exited with code {}",
                        dispatched.id, result.exit_code
                    );
                    if !result.output.is_empty() {
                        println!("{}", result.output);
                    }
                    false
                }
                CommandOutcome::TimedOut => {
                    println!(
                        "command {} sent; no result within {timeout_secs}s",
                        dispatched.id
                    );
                    true
                }
            };
            engine.shutdown().await;
            if timed_out {
                std::process::exit(2);
            }
        }
        Commands::Watch => {
            let backend = Arc::new(open_store(&cli.db, cli.journal.as_deref())?);
            let engine = Engine::start(backend, EngineConfig::default()).await?;
            engine
                .record_log(LogSeverity::Info, "Console session attached")
                .await;
            let mut display = engine.subscribe_display();
            let mut snapshots = engine.watch_snapshots();
            print_fleet_line(&engine.snapshot());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        print_fleet_line(&snapshot);
                    }
                    event = display.recv() => match event {
                        Ok(event) => println!("{}", render_event(&event)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            eprintln!("display stream lagged; {skipped} events skipped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            engine.shutdown().await;
        }
        Commands::Log { action } => {
            let store = open_store(&cli.db, cli.journal.as_deref())?;
            match action {
                LogCommands::Export => {
                    for entry in store.list_log_entries().context("read event log")? {
                        println!("{}", entry.render());
                    }
                }
                LogCommands::Clear => {
                    let purged = store.purge_log_entries_sync().context("clear event log")?;
                    println!("cleared {purged} event log entries");
                }
            }
        }
        Commands::Replay { file } => {
            let envelopes = read_journal(&file)
                .with_context(|| format!("read journal at {}", file.display()))?;
            let total = envelopes.len();

            let backend = Arc::new(MemoryBackend::new());
            let engine = Engine::start(backend.clone(), EngineConfig::default()).await?;
            for envelope in envelopes {
                println!("{}", render_envelope(&envelope));
                backend.publish(envelope);
            }
            // let the pumps drain before sampling the final state
            tokio::time::sleep(Duration::from_millis(200)).await;

            print_fleet_line(&engine.snapshot());
            let log = engine.log().export_text();
            if !log.is_empty() {
                println!("{log}");
            }
            println!("replayed {total} envelopes");
            engine.shutdown().await;
        }
    }

    Ok(())
}

fn open_store(db: &Path, journal: Option<&Path>) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(db)
        .with_context(|| format!("open fleet database at {}", db.display()))?;
    if let Some(path) = journal {
        let journal = FeedJournal::open(path)
            .with_context(|| format!("open feed journal at {}", path.display()))?;
        store = store.with_journal(journal);
    }
    Ok(store)
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FLEETDESK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_fleet_line(snapshot: &FleetSnapshot) {
    println!(
        "fleet: {} agents, {} online{}",
        snapshot.agents.len(),
        snapshot.online_count,
        if snapshot.feed_degraded {
            " [feed degraded]"
        } else {
            ""
        }
    );
}

fn render_event(event: &DisplayEvent) -> String {
    match event {
        DisplayEvent::Command(command) => format!(
            "command {} -> {} [{}]: {}",
            command.id,
            command.agent_id,
            command.status.as_str(),
            command.command
        ),
        DisplayEvent::Result(result) => format!(
            "result for {} from {} (exit {}): {}",
            result.command_id,
            result.agent_id,
            result.exit_code,
            first_line(&result.output)
        ),
        DisplayEvent::FileListing(listing) => format!(
            "file listing {} from {} ({} entries)",
            listing.path,
            listing.agent_id,
            listing.entries.len()
        ),
        DisplayEvent::Screenshot(shot) => format!(
            "screenshot from {} ({}x{}) at {}",
            shot.agent_id, shot.width, shot.height, shot.storage_path
        ),
        DisplayEvent::Log(entry) => entry.render(),
    }
}

fn render_envelope(envelope: &ChangeEnvelope) -> String {
    let reference = envelope
        .payload()
        .and_then(|row| {
            row.get("agent_id")
                .or_else(|| row.get("id"))
                .and_then(|value| value.as_str())
        })
        .unwrap_or("?");
    format!(
        "{} {} {} {}",
        envelope.emitted_at.format("%Y-%m-%d %H:%M:%S"),
        envelope.entity.as_str(),
        envelope.op.as_str(),
        reference
    )
}

fn first_line(output: &str) -> &str {
    output.lines().next().unwrap_or("")
}
