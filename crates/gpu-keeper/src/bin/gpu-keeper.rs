//! gpu-keeper CLI - keep a GPU instance available across zone capacity outages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gpu_keeper::idle::{IdleConfig, IdleWatcher, NvidiaSmi, SystemShutdown};
use gpu_keeper::providers::gcp::{GcloudToken, StaticToken, TokenSource};
use gpu_keeper::{FileHandleStore, Gcp, HttpProbe, InstanceLifecycleManager, KeeperConfig};

/// gpu-keeper - Keep one GPU instance per server type running.
#[derive(Parser)]
#[command(name = "gpu-keeper")]
#[command(about = "Start, stop and relocate a GPU instance on Compute Engine")]
struct Cli {
    /// JSON or TOML config file. Flags override its values.
    #[arg(long, env = "GPU_KEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// GCP project ID.
    #[arg(long, env = "GCP_PROJECT_ID")]
    project_id: Option<String>,

    /// Server type; names the snapshot, disks, instances and cache files.
    #[arg(long, env = "GPU_KEEPER_SERVER_TYPE")]
    server_type: Option<String>,

    /// Region prefix candidate zones must start with.
    #[arg(long, env = "GPU_KEEPER_REGION")]
    region: Option<String>,

    /// Accelerator type, e.g. `nvidia-l4`.
    #[arg(long, env = "GPU_KEEPER_ACCELERATOR_TYPE")]
    accelerator_type: Option<String>,

    /// Accelerators per instance.
    #[arg(long, env = "GPU_KEEPER_ACCELERATOR_COUNT")]
    accelerator_count: Option<u32>,

    /// Machine type, e.g. `g2-standard-4`.
    #[arg(long, env = "GPU_KEEPER_MACHINE_TYPE")]
    machine_type: Option<String>,

    /// Disk type for failover disks.
    #[arg(long, env = "GPU_KEEPER_DISK_TYPE")]
    disk_type: Option<String>,

    /// VPC network for recreated instances.
    #[arg(long, env = "GPU_KEEPER_NETWORK")]
    network: Option<String>,

    /// Subnetwork for recreated instances.
    #[arg(long, env = "GPU_KEEPER_SUBNETWORK")]
    subnetwork: Option<String>,

    /// Service account email for recreated instances.
    #[arg(long, env = "GPU_KEEPER_SERVICE_ACCOUNT")]
    service_account: Option<String>,

    /// Network tags (comma-separated).
    #[arg(long, env = "GPU_KEEPER_TAGS", value_delimiter = ',')]
    tags: Option<Vec<String>>,

    /// Startup script file installed as instance metadata.
    #[arg(long, env = "GPU_KEEPER_STARTUP_SCRIPT")]
    startup_script: Option<PathBuf>,

    /// Directory for the handle and IP cache.
    #[arg(long, env = "GPU_KEEPER_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Zone of an existing instance to adopt when nothing is cached.
    #[arg(long, env = "GPU_KEEPER_ZONE", requires = "instance")]
    zone: Option<String>,

    /// ID or name of an existing instance to adopt when nothing is cached.
    #[arg(long, env = "GPU_KEEPER_INSTANCE", requires = "zone")]
    instance: Option<String>,

    /// OAuth2 access token (otherwise taken from `gcloud auth print-access-token`).
    #[arg(long, env = "GCP_ACCESS_TOKEN", default_value = "", hide_env_values = true)]
    access_token: String,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log as JSON lines.
    #[arg(long, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the instance up, acquiring or relocating it as needed.
    EnsureReady,

    /// Start the cached instance.
    Start,

    /// Stop the cached instance.
    Stop,

    /// Stop, then start the cached instance.
    Restart,

    /// Show the cached instance and its state.
    Status,

    /// Print the instance IP, bringing it up if needed.
    Ip {
        /// Local port to probe before asking the provider.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Forget the cached instance.
    Forget,

    /// Recreate the instance in another zone now.
    Failover,

    /// List zones a failover would try.
    Zones,

    /// Shut this machine down once its GPU is idle (run on the instance).
    WatchIdle {
        /// GPU memory in use (GiB) at or above which the GPU is busy.
        #[arg(long, default_value = "1")]
        threshold_gb: u64,

        /// Seconds between samples.
        #[arg(long, default_value = "60")]
        interval: u64,

        /// Minutes between scheduling and shutting down.
        #[arg(long, default_value = "5")]
        delay_minutes: u64,

        /// Run `shutdown` through `sudo`.
        #[arg(long, default_value = "false")]
        sudo: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Commands::WatchIdle {
        threshold_gb,
        interval,
        delay_minutes,
        sudo,
    } = cli.command
    {
        let config = IdleConfig::from_units(threshold_gb, interval, delay_minutes).with_context(
            || format!("Threshold of {threshold_gb} GB or delay of {delay_minutes} minutes is too large"),
        )?;
        IdleWatcher::new(NvidiaSmi, SystemShutdown::new(sudo), config)
            .run()
            .await;
        return Ok(());
    }

    let config = resolve_config(&cli)?;
    let tokens = resolve_token_source(&cli).await?;

    let provider = Arc::new(
        Gcp::with_tokens(&config.project_id, tokens).context("Failed to create GCP provider")?,
    );
    let store = Arc::new(FileHandleStore::new(&config.cache_dir, &config.project_id));
    let probe = Arc::new(
        HttpProbe::new(config.timings.probe_timeout).context("Failed to create liveness probe")?,
    );

    info!(
        project_id = %config.project_id,
        server_type = %config.server_type,
        region = %config.region,
        "Starting gpu-keeper"
    );
    let manager = InstanceLifecycleManager::new(provider, store, probe, config)
        .context("Failed to initialize lifecycle manager")?;

    match cli.command {
        Commands::EnsureReady => {
            let ip = manager.ensure_ready().await?;
            println!("✅ Instance ready at {ip}");
        }

        Commands::Start => report(manager.start().await?, "Instance running", "Instance did not start"),

        Commands::Stop => report(manager.stop().await?, "Instance stopped", "Instance did not stop"),

        Commands::Restart => report(
            manager.restart().await?,
            "Instance restarted",
            "Instance did not restart",
        ),

        Commands::Status => {
            let Some(handle) = manager.handle()? else {
                println!("No cached instance for server type {}.", manager.config().server_type);
                return Ok(());
            };
            let instance = manager.instance().await?;
            let gpu = if instance.accelerator_count > 0 { "✅" } else { "❌" };

            println!("🖥️  {} ({})", instance.name, handle.instance_id);
            println!("   Zone:    {}", handle.zone);
            println!("   Status:  {}", instance.status);
            println!("   Machine: {}", instance.machine_type);
            if let Some(created) = instance.created_at {
                println!("   Created: {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!("   GPU:     {gpu} {}", instance.accelerator_count);
            println!(
                "   IP:      {} (internal {})",
                instance.external_ip.as_deref().unwrap_or("N/A"),
                instance.internal_ip.as_deref().unwrap_or("N/A")
            );
        }

        Commands::Ip { port } => {
            let ip = manager.get_ip(port).await?;
            println!("{ip}");
        }

        Commands::Forget => {
            manager.forget()?;
            println!("🗑️  Forgot cached instance");
        }

        Commands::Failover => {
            println!("🔀 Relocating instance...");
            if manager.switch_to_new_instance().await? {
                let handle = manager
                    .handle()?
                    .context("Handle missing after failover")?;
                println!("✅ Instance {} created in {}", handle.instance_id, handle.zone);
            } else {
                println!("❌ No zone accepted the instance");
            }
        }

        Commands::Zones => {
            let zones = manager.candidate_zones().await?;
            if zones.is_empty() {
                println!("No zones offer the configured accelerator and machine type.");
            } else {
                println!("{:<24}", "ZONE");
                println!("{}", "-".repeat(24));
                for zone in zones {
                    println!("{zone:<24}");
                }
            }
        }

        // Handled before provider setup.
        Commands::WatchIdle { .. } => {}
    }

    Ok(())
}

fn report(ok: bool, success: &str, failure: &str) {
    if ok {
        println!("✅ {success}");
    } else {
        println!("❌ {failure}");
    }
}

/// Config file first, then flags and environment on top.
fn resolve_config(cli: &Cli) -> Result<KeeperConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => KeeperConfig::default(),
    };

    if let Some(v) = &cli.project_id {
        config.project_id.clone_from(v);
    }
    if let Some(v) = &cli.server_type {
        config.server_type.clone_from(v);
    }
    if let Some(v) = &cli.region {
        config.region.clone_from(v);
    }
    if let Some(v) = &cli.accelerator_type {
        config.accelerator_type.clone_from(v);
    }
    if let Some(v) = cli.accelerator_count {
        config.accelerator_count = v;
    }
    if let Some(v) = &cli.machine_type {
        config.machine_type.clone_from(v);
    }
    if let Some(v) = &cli.disk_type {
        config.disk_type.clone_from(v);
    }
    if cli.network.is_some() {
        config.network.clone_from(&cli.network);
    }
    if cli.subnetwork.is_some() {
        config.subnetwork.clone_from(&cli.subnetwork);
    }
    if cli.service_account.is_some() {
        config.service_account.clone_from(&cli.service_account);
    }
    if let Some(v) = &cli.tags {
        config.tags.clone_from(v);
    }
    if let Some(path) = &cli.startup_script {
        let script = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read startup script {}", path.display()))?;
        config.startup_script = Some(script);
    }
    if let Some(v) = &cli.cache_dir {
        config.cache_dir.clone_from(v);
    }
    if cli.zone.is_some() {
        config.seed_zone.clone_from(&cli.zone);
        config.seed_instance.clone_from(&cli.instance);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<KeeperConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    if is_toml {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON config {}", path.display()))
    }
}

/// A fixed `--access-token`, otherwise tokens printed by `gcloud` and
/// refreshed as they expire.
async fn resolve_token_source(cli: &Cli) -> Result<Arc<dyn TokenSource>> {
    let token = cli.access_token.trim();
    if !token.is_empty() {
        return Ok(Arc::new(StaticToken::new(token)));
    }

    let source = GcloudToken::new();
    source
        .token()
        .await
        .context("Failed to get an access token from gcloud")?;
    Ok(Arc::new(source))
}
