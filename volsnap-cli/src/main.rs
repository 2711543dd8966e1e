/*!
volsnap CLI - run the snapshot controller and manage its records.

All commands work on a file-backed object store (one JSON file per record
under `--state-dir`), so a running controller picks up changes made by other
invocations of this tool.
*/

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::sync::watch;
use tracing::{info, warn};
use volsnap_core::model::{Condition, SnapshotData, SnapshotRequest};
use volsnap_core::observability::{init_observability, DEFAULT_LOG_DIRECTIVE};
use volsnap_core::{
    BackendConfig, ControllerConfig, FileObjectStore, ObjectStore, PluginRegistry,
    SnapshotController, SnapshotKey, Volume, VolumeClaim, VolumeSource,
};

#[derive(Parser)]
#[command(name = "volsnap")]
#[command(about = "Reconciliation engine for point-in-time volume snapshots")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "VOLSNAP_JSON_LOGS")]
    json_logs: bool,

    /// Directory holding the object store records
    #[arg(
        long,
        global = true,
        env = "VOLSNAP_STATE_DIR",
        default_value = "./volsnap-state"
    )]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until interrupted
    Run(RunArgs),
    /// Manage snapshot requests
    #[command(subcommand)]
    Request(RequestCommand),
    /// Manage source volumes
    #[command(subcommand)]
    Volume(VolumeCommand),
    /// Manage volume claims
    #[command(subcommand)]
    Claim(ClaimCommand),
    /// Inspect SnapshotData records
    #[command(subcommand)]
    Data(DataCommand),
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON configuration file; flags below override its values
    #[arg(short, long, env = "VOLSNAP_CONFIG")]
    config: Option<PathBuf>,

    /// Identity of this controller instance
    #[arg(long, env = "VOLSNAP_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Backend used for new snapshots
    #[arg(long, value_enum, env = "VOLSNAP_BACKEND")]
    backend: Option<BackendChoice>,

    /// Archive directory of the hostPath backend [default: <state-dir>/archives]
    #[arg(long, env = "VOLSNAP_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    /// Reconciler tick in milliseconds
    #[arg(long, env = "VOLSNAP_RECONCILER_PERIOD_MS")]
    reconciler_period_ms: Option<u64>,

    /// Populator period in milliseconds
    #[arg(long, env = "VOLSNAP_POPULATOR_PERIOD_MS")]
    populator_period_ms: Option<u64>,

    /// Period of the sweep deleting snapshots of removed requests, in milliseconds
    #[arg(long, env = "VOLSNAP_COLLECTOR_PERIOD_MS")]
    collector_period_ms: Option<u64>,

    /// Turn off the periodic full-sync hook
    #[arg(long, env = "VOLSNAP_DISABLE_SYNC")]
    disable_sync: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendChoice {
    HostPath,
    Memory,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
enum RequestCommand {
    /// Request a snapshot of the volume bound to a claim
    Create {
        /// Request key as namespace/name
        key: SnapshotKey,
        /// Claim in the same namespace whose volume is snapshotted
        #[arg(long)]
        claim: String,
        /// Only let the controller with this instance id act on the request
        #[arg(long)]
        controller: Option<String>,
    },
    /// Delete a request; the controller removes its snapshot
    Delete {
        /// Request key as namespace/name
        key: SnapshotKey,
    },
    /// List requests and their status
    List {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

#[derive(Subcommand)]
enum VolumeCommand {
    /// Register a volume
    Add {
        name: String,
        /// Directory backing a hostPath volume
        #[arg(long, conflicts_with = "memory_id", required_unless_present = "memory_id")]
        host_path: Option<PathBuf>,
        /// Identifier of an in-memory volume
        #[arg(long)]
        memory_id: Option<String>,
    },
    /// Destroy the data behind a volume through its backend
    Purge {
        name: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ClaimCommand {
    /// Register a claim, optionally bound to a volume
    Add {
        /// Claim key as namespace/name
        key: SnapshotKey,
        /// Volume the claim is bound to
        #[arg(long)]
        volume: Option<String>,
    },
}

#[derive(Subcommand)]
enum DataCommand {
    /// List SnapshotData records with their last condition
    List {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

#[derive(Tabled)]
struct RequestRow {
    #[tabled(rename = "Request")]
    key: String,
    #[tabled(rename = "Claim")]
    claim: String,
    #[tabled(rename = "SnapshotData")]
    data: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct DataRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Request")]
    request: String,
    #[tabled(rename = "Volume")]
    volume: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Owner")]
    owner: String,
    #[tabled(rename = "Last condition")]
    condition: String,
    #[tabled(rename = "Created")]
    created: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "volsnap=debug"
    } else {
        DEFAULT_LOG_DIRECTIVE
    };
    init_observability(cli.json_logs, directive)?;

    let store = FileObjectStore::open(&cli.state_dir)
        .with_context(|| format!("opening state directory {}", cli.state_dir.display()))?;

    match cli.command {
        Commands::Run(args) => run_controller(store, &cli.state_dir, args).await?,
        Commands::Request(command) => request_command(&store, command).await?,
        Commands::Volume(command) => volume_command(&store, &cli.state_dir, command).await?,
        Commands::Claim(ClaimCommand::Add { key, volume }) => {
            let claim = match volume {
                Some(volume) => VolumeClaim::bound(key.namespace(), key.name(), volume),
                None => VolumeClaim::unbound(key.namespace(), key.name()),
            };
            store.put_claim(claim).await?;
            println!("✓ Claim {key} saved");
        }
        Commands::Data(DataCommand::List { output }) => list_data(&store, output).await?,
    }

    Ok(())
}

fn controller_config(
    state_dir: &std::path::Path,
    args: &RunArgs,
) -> anyhow::Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::host_path(state_dir.join("archives")),
    };

    if let Some(instance_id) = &args.instance_id {
        config.instance_id = instance_id.clone();
    }
    match args.backend {
        Some(BackendChoice::Memory) => config.backend = BackendConfig::Memory,
        Some(BackendChoice::HostPath)
            if !matches!(config.backend, BackendConfig::HostPath { .. }) =>
        {
            config.backend = BackendConfig::HostPath {
                archive_dir: state_dir.join("archives"),
            }
        }
        _ => {}
    }
    if let Some(dir) = &args.archive_dir {
        match &mut config.backend {
            BackendConfig::HostPath { archive_dir } => *archive_dir = dir.clone(),
            BackendConfig::Memory => warn!("--archive-dir ignored for the memory backend"),
        }
    }
    if let Some(period) = args.reconciler_period_ms {
        config.reconciler_loop_period_ms = period;
    }
    if let Some(period) = args.populator_period_ms {
        config.populator_loop_period_ms = period;
    }
    if let Some(period) = args.collector_period_ms {
        config.collector_loop_period_ms = period;
    }
    if args.disable_sync {
        config.disable_reconciliation_sync = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run_controller(
    store: FileObjectStore,
    state_dir: &std::path::Path,
    args: RunArgs,
) -> anyhow::Result<()> {
    let config = controller_config(state_dir, &args)?;
    info!(instance = %config.instance_id, state_dir = %state_dir.display(), "Starting volsnap");

    let controller = SnapshotController::from_config(config, Arc::new(store)).await?;

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
        stop.send_replace(true);
    });

    controller.run(shutdown).await?;
    Ok(())
}

async fn request_command(store: &FileObjectStore, command: RequestCommand) -> anyhow::Result<()> {
    match command {
        RequestCommand::Create {
            key,
            claim,
            controller,
        } => {
            let mut request = SnapshotRequest::new(key.namespace(), key.name(), claim);
            if let Some(controller) = controller {
                request = request.with_controller(controller);
            }
            let request = store.create_request(request).await?;
            println!("✓ Snapshot request {key} created (uid {})", request.metadata.uid);
        }
        RequestCommand::Delete { key } => {
            store.delete_request(&key).await?;
            println!("✓ Snapshot request {key} deleted");
        }
        RequestCommand::List { output } => {
            let mut requests = store.list_requests().await?;
            requests.sort_by(|a, b| {
                (&a.metadata.namespace, &a.metadata.name)
                    .cmp(&(&b.metadata.namespace, &b.metadata.name))
            });
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&requests)?),
                OutputFormat::Table if requests.is_empty() => {
                    println!("No snapshot requests found")
                }
                OutputFormat::Table => {
                    let rows = requests.iter().map(|request| RequestRow {
                        key: format!("{}/{}", request.metadata.namespace, request.metadata.name),
                        claim: request.spec.persistent_volume_claim_name.clone(),
                        data: request.snapshot_data_name().unwrap_or("-").to_string(),
                        status: request.status().to_string(),
                    });
                    println!("{}", Table::new(rows));
                }
            }
        }
    }
    Ok(())
}

async fn volume_command(
    store: &FileObjectStore,
    state_dir: &std::path::Path,
    command: VolumeCommand,
) -> anyhow::Result<()> {
    match command {
        VolumeCommand::Add {
            name,
            host_path,
            memory_id,
        } => {
            let source = match (host_path, memory_id) {
                (Some(path), _) => {
                    let path = std::fs::canonicalize(&path)
                        .with_context(|| format!("resolving {}", path.display()))?;
                    VolumeSource::HostPath {
                        path: path.display().to_string(),
                    }
                }
                (None, Some(volume_id)) => VolumeSource::Memory { volume_id },
                (None, None) => bail!("either --host-path or --memory-id is required"),
            };
            store.put_volume(Volume::new(&name, source)).await?;
            println!("✓ Volume {name} saved");
        }
        VolumeCommand::Purge { name, force } => {
            let volume = store.get_volume(&name).await?;
            if !force && !confirm(&format!("Destroy all data of volume '{name}'?"))? {
                println!("Purge cancelled");
                return Ok(());
            }

            let backend = match volume.source {
                VolumeSource::Memory { .. } => BackendConfig::Memory,
                _ => BackendConfig::HostPath {
                    archive_dir: state_dir.join("archives"),
                },
            };
            let plugins = PluginRegistry::from_config(&backend).await?;
            plugins.get(volume.source.kind())?.volume_delete(&volume).await?;
            println!("✓ Volume {name} purged");
        }
    }
    Ok(())
}

async fn list_data(store: &FileObjectStore, output: OutputFormat) -> anyhow::Result<()> {
    let mut data = store.list_data().await?;
    data.sort_by(|a, b| {
        a.status
            .creation_timestamp
            .cmp(&b.status.creation_timestamp)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&data)?),
        OutputFormat::Table if data.is_empty() => println!("No SnapshotData found"),
        OutputFormat::Table => {
            let rows: Vec<DataRow> = data.iter().map(data_row).collect();
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}

fn data_row(data: &SnapshotData) -> DataRow {
    DataRow {
        name: data.name().to_string(),
        request: data.spec.volume_snapshot_ref.to_string(),
        volume: data.spec.persistent_volume_ref.clone(),
        source: format!("{}:{}", data.spec.source.kind(), data.spec.source.id()),
        owner: data.owner().unwrap_or("-").to_string(),
        condition: data
            .status
            .conditions
            .last()
            .map(describe_condition)
            .unwrap_or_else(|| "-".to_string()),
        created: data
            .status
            .creation_timestamp
            .map(|ts| ts.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
    }
}

fn describe_condition(condition: &Condition) -> String {
    let mut text = format!("{:?}={:?}", condition.condition_type, condition.status);
    if !condition.message.is_empty() {
        text.push_str(": ");
        text.push_str(&condition.message);
    }
    text
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    use std::io::{self, Write};

    print!("{prompt} (y/N): ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}
