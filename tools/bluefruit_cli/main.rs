//! Bluefruit command-line front end
//!
//! Scans for peripherals, checks the release catalog for a connected board
//! and runs DFU firmware updates, printing the events the core publishes.

use bluefruit_connect_lib::ble_adapter::BtleplugTransport;
use bluefruit_connect_lib::catalog::is_newer_version;
use bluefruit_connect_lib::dfu_legacy::LegacyDfuTransport;
use bluefruit_connect_lib::settings::{default_settings_path, load_settings};
use bluefruit_connect_lib::{
    logging, read_device_info, AppSettings, BleHandle, BleManager, CatalogResolver,
    DefaultImageLoader, DeviceInfo, DfuOrchestrator, DfuPhase, FirmwareSource, HttpCatalogSource,
    PeripheralId, RadioTransport, TransportGate,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bluefruit_cli")]
#[command(about = "Discover, inspect and update Bluefruit LE peripherals")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
    /// Settings file (defaults to the platform config dir)
    #[arg(long)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for peripherals
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Only list peripherals advertising the UART service
        #[arg(long)]
        uart_only: bool,
    },
    /// Read device information and look up firmware releases
    CheckUpdates {
        /// Peripheral id or name fragment
        #[arg(short, long)]
        device: String,
        /// Include beta releases
        #[arg(long)]
        beta: bool,
    },
    /// Flash firmware, either the latest release or local files
    Update {
        /// Peripheral id or name fragment
        #[arg(short, long)]
        device: String,
        /// Local firmware image (.hex or .bin); the latest release is used otherwise
        #[arg(long)]
        image: Option<PathBuf>,
        /// Local init packet (.dat) for the image
        #[arg(long, requires = "image")]
        init: Option<PathBuf>,
        /// Include beta releases
        #[arg(long)]
        beta: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let settings_path = match cli.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let settings = load_settings(&settings_path).unwrap_or_else(|e| {
        eprintln!("Using default settings: {e}");
        AppSettings::default()
    });
    let reports_dir = settings.reports_dir.as_ref().map(PathBuf::from);
    logging::init_logging(reports_dir.as_deref(), cli.verbose)?;

    let radio = Arc::new(BtleplugTransport::new().await?);
    let handle = BleManager::spawn(radio.clone(), settings.discovery_config());

    let result = match cli.command {
        Commands::Scan {
            duration,
            uart_only,
        } => scan(&handle, duration, uart_only).await,
        Commands::CheckUpdates { device, beta } => {
            check_updates(&handle, radio.clone(), &settings, &device, beta).await
        }
        Commands::Update {
            device,
            image,
            init,
            beta,
        } => {
            let local = image.map(|image| FirmwareSource::Local { image, init });
            update(&handle, radio.clone(), &settings, &device, local, beta).await
        }
    };

    handle.shutdown().await;
    result
}

async fn scan(
    handle: &BleHandle,
    duration: u64,
    uart_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for peripherals ({} seconds)...", duration);
    handle.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(duration)).await;
    handle.stop_scan().await;

    let peripherals: Vec<_> = handle
        .peripherals()
        .await
        .into_iter()
        .filter(|p| !uart_only || p.uart_capable)
        .collect();

    println!("\nFound {} peripherals:", peripherals.len());
    for p in peripherals {
        let marker = if p.uart_capable { " [UART]" } else { "" };
        println!(
            "  {:<24} {}  RSSI: {} ({}/4){}",
            p.name, p.id, p.rssi, p.signal_bucket, marker
        );
    }
    Ok(())
}

/// Scan until a peripheral matching `target` shows up, then connect to it.
async fn find_and_connect(
    handle: &BleHandle,
    target: &str,
    timeout: Duration,
) -> Result<PeripheralId, Box<dyn std::error::Error>> {
    handle.start_scan().await?;
    println!("Looking for {target}...");

    let id = tokio::time::timeout(timeout, async {
        loop {
            if let Some(p) = handle
                .peripherals()
                .await
                .into_iter()
                .find(|p| p.id.as_str() == target || p.name.contains(target))
            {
                return p.id;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .map_err(|_| format!("Peripheral '{target}' not found"))?;
    handle.stop_scan().await;

    println!("Connecting to {id}...");
    handle.connect_and_wait(&id).await?;
    Ok(id)
}

async fn device_info(
    radio: &dyn RadioTransport,
    id: &PeripheralId,
) -> Result<DeviceInfo, Box<dyn std::error::Error>> {
    let info = read_device_info(radio, id).await?;
    println!(
        "Model: {}  Software: {}  Bootloader: {}",
        info.model_number.as_deref().unwrap_or("?"),
        info.software_revision.as_deref().unwrap_or("?"),
        info.bootloader_version
    );
    Ok(info)
}

async fn check_updates(
    handle: &BleHandle,
    radio: Arc<BtleplugTransport>,
    settings: &AppSettings,
    target: &str,
    beta: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = find_and_connect(handle, target, settings.discovery_config().connect_timeout).await?;
    let info = device_info(radio.as_ref(), &id).await?;

    let resolver = CatalogResolver::new(
        HttpCatalogSource::new(settings.update_server_url.clone())?,
        beta || settings.show_beta_versions,
    );
    let check = resolver.check_updates(&info).await;
    match &check.latest_release {
        Some(latest) => {
            let current = info.software_revision.as_deref().unwrap_or("");
            let newer = is_newer_version(current, &latest.version);
            println!(
                "Latest release: {}{}{}",
                latest.version,
                if latest.is_beta { " (beta)" } else { "" },
                if newer { " - update available" } else { " - up to date" }
            );
        }
        None => println!("No releases found for this board"),
    }
    if let Some(board) = &check.board_catalog {
        for release in &board.firmware {
            println!(
                "  {:<10} min bootloader {}{}",
                release.version,
                release.min_bootloader_version,
                if release.is_beta { "  beta" } else { "" }
            );
        }
    }
    let _ = handle.disconnect(&id);
    Ok(())
}

async fn update(
    handle: &BleHandle,
    radio: Arc<BtleplugTransport>,
    settings: &AppSettings,
    target: &str,
    local: Option<FirmwareSource>,
    beta: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = find_and_connect(handle, target, settings.discovery_config().connect_timeout).await?;
    let info = device_info(radio.as_ref(), &id).await?;

    let source = match local {
        Some(source) => source,
        None => {
            let resolver = CatalogResolver::new(
                HttpCatalogSource::new(settings.update_server_url.clone())?,
                beta || settings.show_beta_versions,
            );
            let release = resolver
                .check_updates(&info)
                .await
                .latest_release
                .ok_or("No releases found for this board")?;
            FirmwareSource::Release(release)
        }
    };

    let dfu = DfuOrchestrator::new(
        Arc::new(LegacyDfuTransport::new(radio.clone())),
        Arc::new(DefaultImageLoader::new()),
        handle.connection_watch(),
        TransportGate::new(),
        settings.dfu_timeouts(),
    );

    let mut progress = dfu.subscribe();
    dfu.start_update(id, source, &info)?;

    let printer = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            println!(
                "  {:>5.1}%  {}",
                snapshot.progress * 100.0,
                snapshot.progress_message
            );
            if snapshot.phase.is_terminal() {
                break;
            }
        }
    });

    let outcome = tokio::select! {
        phase = dfu.wait_until_finished() => phase,
        _ = tokio::signal::ctrl_c() => {
            println!("Cancelling...");
            dfu.cancel();
            dfu.wait_until_finished().await
        }
    };
    let _ = printer.await;

    match outcome {
        DfuPhase::Succeeded => println!("Update complete"),
        DfuPhase::Cancelled => println!("Update cancelled; the device may need a manual recovery"),
        DfuPhase::Failed { message, detail } => {
            return Err(match detail {
                Some(detail) => format!("{message} ({detail})"),
                None => message,
            }
            .into())
        }
        _ => {}
    }
    Ok(())
}
