use anyhow::Context;
use clap::{Parser, Subcommand};
use spike_link::domain::settings::SettingsService;
use spike_link::infrastructure::bluetooth::default_link;
use spike_link::infrastructure::logging::init_logger;
use spike_link::{HubConfig, HubEvent, HubService};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about = "Talk to a LEGO SPIKE Prime hub over BLE", long_about = None)]
struct Cli {
    /// Path to settings file (defaults to the per-user config directory)
    #[arg(long, short, env = "SPIKE_LINK_CONFIG")]
    config: Option<PathBuf>,
    /// Program slot to operate on
    #[arg(long, short, default_value_t = 0)]
    slot: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print firmware version and transfer limits
    Info,
    /// Clear the program slot
    Clear,
    /// Upload a program file into the slot
    Upload {
        file: PathBuf,
        /// Name stored on the hub (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
        /// Start the program once uploaded
        #[arg(long)]
        run: bool,
    },
    /// Start the program in the slot
    Run,
    /// Stop the program in the slot
    Stop,
    /// Print hub events as JSON lines until Ctrl-C
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new()?,
    };
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Settings loaded from {}", settings.path().display());

    let link = default_link().context("no BLE backend available")?;
    let service = HubService::new(link, HubConfig::from(settings.get()));

    let hub = service.connect().await.context("failed to connect to hub")?;
    let result = run(&cli, &service, hub).await;
    service.disconnect().await;
    result
}

async fn run(
    cli: &Cli,
    service: &HubService,
    hub: spike_link::protocol::HubInfo,
) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Info => {
            println!("firmware:        {}", hub.firmware_version());
            println!("rpc:             {}", hub.rpc_version());
            println!("max packet size: {}", hub.max_packet_size);
            println!("max message:     {}", hub.max_message_size);
            println!("max chunk size:  {}", hub.max_chunk_size);
            println!("product group:   {}", hub.product_group);
        }
        Commands::Clear => {
            if service.clear_slot(cli.slot).await? {
                println!("slot {} cleared", cli.slot);
            } else {
                println!("slot {} was already empty", cli.slot);
            }
        }
        Commands::Upload { file, name, run } => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let name = match name {
                Some(name) => name.clone(),
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("file has no name")?,
            };

            service
                .upload_program_file(&name, cli.slot, &bytes)
                .await
                .with_context(|| format!("upload of {name} failed"))?;
            println!("uploaded {} ({} bytes) to slot {}", name, bytes.len(), cli.slot);

            if *run {
                service.start_program(cli.slot).await?;
                println!("program started");
            }
        }
        Commands::Run => {
            service.start_program(cli.slot).await?;
            println!("program started");
        }
        Commands::Stop => {
            service.stop_program(cli.slot).await?;
            println!("program stopped");
        }
        Commands::Watch { seconds } => watch(service, seconds.map(Duration::from_secs)).await?,
    }
    Ok(())
}

async fn watch(service: &HubService, limit: Option<Duration>) -> anyhow::Result<()> {
    let mut events = service.subscribe();
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if event == HubEvent::Disconnected {
                        anyhow::bail!("hub disconnected");
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
