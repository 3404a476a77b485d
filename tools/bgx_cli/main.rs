//! Command-line front end for BGX modules.
//!
//! Drives `BgxManager` against the host BLE adapter and prints every event
//! it emits as one JSON line.

use bgx_commander::types::CredentialPurpose;
use bgx_commander::{
    AckMode, BgxConfig, BgxEvent, BgxManager, BleCentral, BusMode, Command, ConnectionState,
    CredentialGate, DmsCatalog, FirmwareVersion, ImageRef, KeyringCredentialGate, OtaRequest,
    OtaStatus, Subscription,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bgx_cli")]
#[command(about = "Session, bus mode and OTA tool for Silicon Labs BGX modules")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write the log to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for BGX modules
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Connect and print device information
    Info { address: String },
    /// Read the bus mode, or change it with --set
    Mode {
        address: String,
        /// stream, local or remote
        #[arg(long)]
        set: Option<BusMode>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Send a line of text over the serial stream
    Send {
        address: String,
        text: String,
        /// Keep printing received data for this many seconds
        #[arg(long, default_value = "2")]
        listen: u64,
    },
    /// List catalog firmware versions for a part
    Versions {
        part_identifier: String,
        #[arg(long)]
        platform: Option<String>,
    },
    /// Update firmware from a file or a catalog version
    Ota {
        address: String,
        #[arg(long, conflicts_with = "version", required_unless_present = "version")]
        file: Option<PathBuf>,
        #[arg(long)]
        version: Option<FirmwareVersion>,
        /// Acknowledge every data chunk (slower, more robust)
        #[arg(long)]
        ack: bool,
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget stored passwords for a device
    Forget { address: String },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BgxConfig::load(path)?,
        None => BgxConfig::load_default()?,
    };
    if let Commands::Scan { duration: Some(secs) } = &cli.command {
        config.scan_duration_secs = *secs;
    }
    if let Some(dir) = cli.log_dir.as_ref().or(config.log_dir.as_ref()) {
        bgx_commander::logging::init_file_logging(dir)?;
    }

    let credentials: Arc<dyn CredentialGate> = Arc::new(KeyringCredentialGate);
    if let Commands::Forget { address } = &cli.command {
        credentials.forget(CredentialPurpose::BusModePassword, address)?;
        credentials.forget(CredentialPurpose::OtaPassword, address)?;
        println!("Forgot stored passwords for {}", address);
        return Ok(());
    }

    let central = Arc::new(BleCentral::new().await?);
    let catalog = Arc::new(DmsCatalog::new(&config)?);
    let scan_secs = config.scan_duration_secs;
    let manager = BgxManager::new(central, catalog, credentials, config)?;
    let mut events = manager.subscribe();

    let result = run(&manager, &mut events, cli.command, scan_secs).await;
    bgx_commander::logging::stop_file_logging();
    result
}

async fn run(
    manager: &BgxManager,
    events: &mut Subscription,
    command: Commands,
    scan_secs: u64,
) -> CliResult<()> {
    match command {
        Commands::Scan { duration } => {
            manager.handle(Command::StartScan).await;
            let secs = duration.unwrap_or(scan_secs);
            let _ = tokio::time::timeout(Duration::from_secs(secs + 2), async {
                while let Some(event) = events.recv().await {
                    print_event(&event);
                    if matches!(event, BgxEvent::ScanModeChanged { is_scanning: false, .. }) {
                        break;
                    }
                }
            })
            .await;
            manager.handle(Command::StopScan).await;
        }
        Commands::Info { address } => {
            connect(manager, events, &address).await?;
            manager.handle(Command::GetDeviceInfo { address: address.clone() }).await;
            wait_for(events, 5, |e| matches!(e, BgxEvent::DeviceInfo { .. })).await?;
            disconnect(manager, events, &address).await;
        }
        Commands::Mode { address, set, password } => {
            connect(manager, events, &address).await?;
            match set {
                Some(mode) => {
                    manager
                        .handle(Command::WriteBusMode { address: address.clone(), mode, password })
                        .await;
                    wait_for(events, 10, |e| {
                        matches!(
                            e,
                            BgxEvent::BusModeChanged { .. } | BgxEvent::BusModeErrorPasswordRequired { .. }
                        )
                    })
                    .await?;
                }
                None => {
                    manager.handle(Command::ReadBusMode { address: address.clone() }).await;
                    wait_for(events, 10, |e| matches!(e, BgxEvent::BusModeChanged { .. })).await?;
                }
            }
            disconnect(manager, events, &address).await;
        }
        Commands::Send { address, text, listen } => {
            connect(manager, events, &address).await?;
            manager
                .handle(Command::WriteMessage { address: address.clone(), text: format!("{}\r\n", text) })
                .await;
            let _ = tokio::time::timeout(Duration::from_secs(listen), async {
                while let Some(event) = events.recv().await {
                    print_event(&event);
                }
            })
            .await;
            disconnect(manager, events, &address).await;
        }
        Commands::Versions { part_identifier, platform } => {
            manager.handle(Command::GetFirmwareVersions { part_identifier, platform }).await;
            wait_for(events, 30, |e| {
                matches!(e, BgxEvent::FirmwareVersionsAvailable { .. } | BgxEvent::CatalogError { .. })
            })
            .await?;
        }
        Commands::Ota { address, file, version, ack, password } => {
            let ack_mode = if ack { AckMode::Acknowledged } else { AckMode::Unacknowledged };
            connect(manager, events, &address).await?;

            let command = match (file, version) {
                (Some(path), _) => {
                    let mut request = OtaRequest::new(ImageRef::File(path), ack_mode);
                    request.password = password;
                    Command::StartOta { address: address.clone(), request }
                }
                (None, Some(version)) => Command::StartOtaFromCatalog {
                    address: address.clone(),
                    version,
                    ack_mode,
                    password,
                },
                (None, None) => return Err("either --file or --version is required".into()),
            };
            manager.handle(command).await;

            // Ctrl-C cancels the transfer rather than killing the link mid-write
            let finished = tokio::select! {
                r = wait_for(events, 600, is_ota_terminal) => Some(r?),
                _ = tokio::signal::ctrl_c() => None,
            };
            let terminal = match finished {
                Some(event) => event,
                None => {
                    manager.handle(Command::CancelOta { address: address.clone() }).await;
                    wait_for(events, 30, is_ota_terminal).await?
                }
            };
            if !matches!(terminal, BgxEvent::OtaStatus { status: OtaStatus::Finished, .. }) {
                disconnect(manager, events, &address).await;
                return Err("firmware update did not finish".into());
            }
            disconnect(manager, events, &address).await;
        }
        Commands::Forget { .. } => {}
    }
    Ok(())
}

async fn connect(manager: &BgxManager, events: &mut Subscription, address: &str) -> CliResult<()> {
    manager.handle(Command::Connect { address: address.to_string() }).await;
    let event = wait_for(events, 60, |e| {
        matches!(
            e,
            BgxEvent::ConnectionStatusChanged {
                state: ConnectionState::Connected | ConnectionState::ConnectionTimedOut,
                ..
            } | BgxEvent::ConnectionError { .. }
                | BgxEvent::BondFailed { .. }
                | BgxEvent::InvalidGattHandles { .. }
                | BgxEvent::CommandRejected { .. }
        )
    })
    .await?;
    match event {
        BgxEvent::ConnectionStatusChanged { state: ConnectionState::Connected, .. } => Ok(()),
        _ => Err(format!("Could not connect to {}", address).into()),
    }
}

async fn disconnect(manager: &BgxManager, events: &mut Subscription, address: &str) {
    manager.handle(Command::Disconnect { address: address.to_string() }).await;
    while let Some(event) = events.try_recv() {
        print_event(&event);
    }
}

fn is_ota_terminal(event: &BgxEvent) -> bool {
    matches!(
        event,
        BgxEvent::OtaStatus {
            status: OtaStatus::Finished
                | OtaStatus::Failed
                | OtaStatus::UserCanceled
                | OtaStatus::PasswordRequired,
            ..
        }
    )
}

/// Print events until one matches, then return it.
async fn wait_for<F>(events: &mut Subscription, secs: u64, pred: F) -> CliResult<BgxEvent>
where
    F: Fn(&BgxEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(secs), async {
        while let Some(event) = events.recv().await {
            print_event(&event);
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err("event stream closed".into()),
        Err(_) => Err(format!("no response within {}s", secs).into()),
    }
}

fn print_event(event: &BgxEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Failed to serialize event: {}", e),
    }
}
