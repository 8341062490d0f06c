//! Outbox CLI - offline-first record editing from the command line.
//!
//! Edits are applied to a local SQLite store immediately and queued; `sync`
//! pushes the queue to the server and `pull` fetches what other devices wrote.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use outbox_common::{EntityType, LocalId, Payload};
use outbox_remote::HttpRemote;
use outbox_storage::SqliteKv;
use outbox_sync::{OpKind, SyncConfig, SyncEngine, SyncEvent, SyncMode};

#[derive(Parser)]
#[command(name = "outbox")]
#[command(about = "Outbox - offline-first sync client")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the local store (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Server base URL.
    #[arg(
        long,
        global = true,
        env = "OUTBOX_SERVER",
        default_value = "http://127.0.0.1:8080"
    )]
    server: String,

    /// JSON file with sync settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a record.
    Create {
        /// Entity type: client, project, task, timeEntry or invoice.
        entity_type: EntityType,

        /// Record fields as a JSON object.
        data: String,

        /// Use this local id instead of a generated one.
        #[arg(long)]
        id: Option<String>,
    },

    /// Replace a record's fields.
    Update {
        entity_type: EntityType,

        /// Local id of the record.
        id: String,

        /// New record fields as a JSON object.
        data: String,
    },

    /// Delete a record.
    Delete {
        entity_type: EntityType,

        /// Local id of the record.
        id: String,
    },

    /// Show sync status of a record.
    Status {
        /// Local id of the record.
        id: String,
    },

    /// List local records of a type.
    List {
        entity_type: EntityType,

        /// Only records with unsynced edits.
        #[arg(long)]
        dirty: bool,
    },

    /// Show queued mutations.
    Queue,

    /// Push queued mutations to the server.
    Sync {
        /// Keep running and sync every N seconds until interrupted.
        #[arg(long, value_name = "SECONDS")]
        watch: Option<u64>,
    },

    /// Fetch records from the server.
    Pull {
        /// Types to pull (default: all, parents first).
        entity_types: Vec<EntityType>,
    },

    /// Requeue a failed mutation.
    Retry {
        /// Local id of the record.
        id: String,
    },

    /// Show resolved conflicts.
    Conflicts,

    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "outbox", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref()).await?;
    if let Commands::Sync {
        watch: Some(seconds),
    } = &cli.command
    {
        config.sync_mode = SyncMode::Hybrid {
            interval: Duration::from_secs((*seconds).max(1)),
        };
    }
    let engine = open_engine(cli.data_dir, &cli.server, config).await?;

    match cli.command {
        Commands::Create {
            entity_type,
            data,
            id,
        } => {
            let id = id.map(LocalId::new).transpose().context("Invalid id")?;
            cmd_mutate(&engine, entity_type, id, OpKind::Create, &data).await
        }

        Commands::Update {
            entity_type,
            id,
            data,
        } => {
            let id = LocalId::new(id).context("Invalid id")?;
            cmd_mutate(&engine, entity_type, Some(id), OpKind::Update, &data).await
        }

        Commands::Delete { entity_type, id } => {
            let id = LocalId::new(id).context("Invalid id")?;
            cmd_mutate(&engine, entity_type, Some(id), OpKind::Delete, "null").await
        }

        Commands::Status { id } => cmd_status(&engine, &id).await,

        Commands::List { entity_type, dirty } => cmd_list(&engine, entity_type, dirty).await,

        Commands::Queue => cmd_queue(&engine).await,

        Commands::Sync { watch: None } => cmd_sync(&engine).await,

        Commands::Sync { watch: Some(_) } => cmd_watch(&engine).await,

        Commands::Pull { entity_types } => cmd_pull(&engine, entity_types).await,

        Commands::Retry { id } => {
            let id = LocalId::new(id).context("Invalid id")?;
            engine
                .retry_failed(&id)
                .await
                .context("Failed to requeue")?;
            println!("Requeued {}", id);
            Ok(())
        }

        Commands::Conflicts => cmd_conflicts(&engine).await,

        Commands::Completions { .. } => Ok(()),
    }
}

async fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

async fn open_engine(
    data_dir: Option<PathBuf>,
    server: &str,
    config: SyncConfig,
) -> Result<SyncEngine> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("outbox"),
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let db_path = data_dir.join("outbox.db");
    let kv = SqliteKv::open(&db_path)
        .with_context(|| format!("Failed to open store {}", db_path.display()))?;
    let remote =
        HttpRemote::new(server, config.request_timeout).context("Failed to set up server client")?;

    // A one-shot process has no connectivity feed; requests report their own
    // network failures.
    let (_online_tx, online_rx) = watch::channel(true);
    let engine = SyncEngine::open(Arc::new(kv), Arc::new(remote), config, online_rx)
        .await
        .context("Failed to open sync engine")?;
    info!("Opened store {}", db_path.display());
    Ok(engine)
}

fn parse_payload(data: &str) -> Result<Payload> {
    serde_json::from_str(data).context("Record data must be valid JSON")
}

async fn cmd_mutate(
    engine: &SyncEngine,
    entity_type: EntityType,
    id: Option<LocalId>,
    kind: OpKind,
    data: &str,
) -> Result<()> {
    let payload = parse_payload(data)?;
    let id = engine
        .apply_local_mutation(entity_type, id, kind, payload)
        .await
        .with_context(|| format!("Failed to {:?} {}", kind, entity_type))?;

    let queued = engine.get_sync_status(&id).await.map(|s| s.queued_ops).unwrap_or(0);
    println!("{:?} {} {} ({} queued)", kind, entity_type, id, queued);
    Ok(())
}

async fn cmd_status(engine: &SyncEngine, id: &str) -> Result<()> {
    let id = LocalId::new(id).context("Invalid id")?;
    let status = engine
        .get_sync_status(&id)
        .await
        .context("Failed to get status")?;

    println!("Record {}:", status.local_id);
    println!(
        "  Server id: {}",
        status
            .server_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  Dirty: {}", status.dirty);
    if status.deleted {
        println!("  Deleted (awaiting server)");
    }
    if let Some(kind) = status.pending_op_kind {
        println!("  Pending: {:?} ({} queued)", kind, status.queued_ops);
    }
    if let Some(op_status) = status.op_status {
        println!("  Op status: {:?}", op_status);
    }
    if let Some(error) = status.last_error {
        println!("  Last error: {}", error);
    }
    Ok(())
}

async fn cmd_list(engine: &SyncEngine, entity_type: EntityType, dirty: bool) -> Result<()> {
    let records = engine
        .query(entity_type, |record| !dirty || record.dirty)
        .await;

    if records.is_empty() {
        println!("No {} records.", entity_type);
        return Ok(());
    }
    for record in records {
        let marker = if record.dirty { "*" } else { " " };
        let server = record
            .server_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {}  [{}] v{}  {}",
            marker, record.local_id, server, record.version, record.payload
        );
    }
    Ok(())
}

async fn cmd_queue(engine: &SyncEngine) -> Result<()> {
    let ops = engine.pending_ops().await;
    if ops.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} queued mutation(s):", ops.len());
    for op in ops {
        print!(
            "  {} {:?} {} {} [{:?}, {} attempts]",
            op.op_id, op.kind, op.entity_type, op.local_id, op.status, op.attempts
        );
        if let Some(at) = op.next_retry_at {
            print!(" retry at {}", at);
        }
        if !op.depends_on.is_empty() {
            let parents: Vec<&str> = op.depends_on.iter().map(|id| id.as_str()).collect();
            print!(" after {}", parents.join(", "));
        }
        println!();
        if let Some(error) = op.last_error {
            println!("      {}", error);
        }
    }
    Ok(())
}

async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    let report = engine.force_sync_now().await.context("Sync failed")?;

    println!(
        "Synced in {:?}: {} done, {} failed, {} conflicts, {} retrying, {} waiting on parents",
        report.duration,
        report.ops_done,
        report.ops_failed,
        report.conflicts,
        report.retried,
        report.held
    );
    let remaining = engine.pending_ops().await.len();
    if remaining > 0 {
        println!("{} mutation(s) still queued.", remaining);
    }
    Ok(())
}

async fn cmd_watch(engine: &SyncEngine) -> Result<()> {
    let mut events = engine.subscribe();
    let scheduler = engine.spawn_scheduler();
    println!("Syncing in the background, Ctrl-C to stop.");

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::OpDone { local_id, kind, .. } => println!("  {:?} {} done", kind, local_id),
                SyncEvent::OpFailed {
                    local_id,
                    error,
                    permanent,
                    ..
                } => {
                    let note = if permanent { "failed" } else { "will retry" };
                    println!("  {} {}: {}", local_id, note, error);
                }
                SyncEvent::Conflict { local_id, decision } => {
                    println!("  {} conflict: {:?}", local_id, decision)
                }
                SyncEvent::PassCompleted(report) if report.ops_done + report.ops_failed > 0 => {
                    println!(
                        "Pass: {} done, {} failed, {} retrying",
                        report.ops_done, report.ops_failed, report.retried
                    )
                }
                SyncEvent::PassCompleted(_) => {}
                SyncEvent::HealthError(error) => warn!("Sync unhealthy: {}", error),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stopping");
    scheduler.shutdown().await;
    printer.abort();
    Ok(())
}

async fn cmd_pull(engine: &SyncEngine, entity_types: Vec<EntityType>) -> Result<()> {
    let entity_types = if entity_types.is_empty() {
        EntityType::ALL.to_vec()
    } else {
        entity_types
    };

    for entity_type in entity_types {
        let report = engine
            .pull(entity_type)
            .await
            .with_context(|| format!("Failed to pull {}", entity_type))?;
        println!(
            "{}: {} new, {} refreshed, {} with local edits",
            entity_type, report.inserted, report.refreshed, report.skipped_dirty
        );
    }
    Ok(())
}

async fn cmd_conflicts(engine: &SyncEngine) -> Result<()> {
    let entries = engine.conflict_audit().await;
    if entries.is_empty() {
        println!("No conflicts recorded.");
        return Ok(());
    }

    for entry in entries {
        println!(
            "#{} {} {} ({:?}): {:?} by {}",
            entry.seq, entry.entity_type, entry.local_id, entry.op_kind, entry.decision, entry.policy
        );
        println!(
            "    local v{} at {}, server v{} at {}",
            entry.local_version,
            entry.local_mutated_at,
            entry.server_version,
            entry.server_updated_at
        );
    }
    Ok(())
}
