//! CLI entry point for daqlink
//!
//! Provides commands for:
//! - Streaming live samples from a device over USB or WiFi
//! - Managing the device's SD card (logging, listing, deleting)
//! - Downloading and importing SD-card logs into CSV
//! - Importing a log file already on disk
//!
//! # Usage
//!
//! ```bash
//! daqlink stream --host 192.168.1.42 --analog 0,1 --duration 10
//! daqlink sd-list --port /dev/ttyACM0
//! daqlink import --port /dev/ttyACM0 20241105_120000.bin --output data.csv
//! daqlink import-file 20241105_120000.bin --metadata device.toml --output data.csv
//! ```

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use daqlink::config::AppConfig;
use daqlink::connection::{Connectable, ConnectionRegistry, ConnectionStatus};
use daqlink::device::{
    ChannelKind, DaqDevice, DeviceIdentity, DeviceMetadata, DeviceMode, DeviceSettings,
};
use daqlink::sdcard::{
    DownloadResult, ImportOutcome, ImportProgress, ImportRequest, ProgressFn, SdCardImporter,
};
use daqlink::storage::{CsvSink, SampleSink, SessionInfo};
use daqlink::stream::{DataSample, DeviceEvent};
use daqlink::transport::{DeviceEndpoint, DeviceLink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "daqlink")]
#[command(about = "Stream and import data from DAQ devices", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/daqlink.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct EndpointArgs {
    /// Serial port of a USB-connected device
    #[arg(long, conflicts_with = "host")]
    port: Option<String>,

    /// Host name or address of a WiFi-connected device
    #[arg(long)]
    host: Option<String>,

    /// Seconds to wait for the device's status reply
    #[arg(long, default_value = "10")]
    ready_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live samples to stdout (and optionally CSV)
    Stream {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Analog channels to sample
        #[arg(long, value_delimiter = ',')]
        analog: Vec<u32>,

        /// Digital channels to sample
        #[arg(long, value_delimiter = ',')]
        digital: Vec<u32>,

        /// Sample rate in Hz (defaults to the configured rate)
        #[arg(long)]
        frequency: Option<u32>,

        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(long)]
        duration: Option<u64>,

        /// Also append samples to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Print samples as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Log to the device's SD card until stopped (USB only)
    SdLog {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Analog channels to log
        #[arg(long, value_delimiter = ',')]
        analog: Vec<u32>,

        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(long)]
        duration: Option<u64>,

        /// Write the channel configuration here for a later `import-file`
        #[arg(long)]
        save_metadata: Option<PathBuf>,
    },

    /// List log files on the device's SD card (USB only)
    SdList {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Seconds to wait for the listing
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Delete a log file from the device's SD card (USB only)
    SdDelete {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// File to delete
        file_name: String,
    },

    /// Download a log from the SD card and import it into CSV (USB only)
    Import {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// File to download
        file_name: String,

        /// Analog channels that were active while logging
        #[arg(long, value_delimiter = ',')]
        analog: Vec<u32>,

        /// CSV output
        #[arg(long)]
        output: PathBuf,

        /// Seconds to wait for the download
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Import a log file from disk into CSV
    ImportFile {
        /// Downloaded log file
        path: PathBuf,

        /// TOML description of the device and its active channels
        #[arg(long)]
        metadata: PathBuf,

        /// CSV output
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    daqlink::logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let registry = ConnectionRegistry::new();
    let result = run(cli.command, &config, &registry).await;
    registry.disconnect_all().await;
    result
}

async fn run(command: Commands, config: &AppConfig, registry: &ConnectionRegistry) -> Result<()> {
    match command {
        Commands::Stream {
            endpoint,
            analog,
            digital,
            frequency,
            duration,
            csv,
            json,
        } => {
            let options = StreamOptions {
                analog,
                digital,
                frequency: frequency.unwrap_or(config.streaming.frequency_hz),
                duration: duration.map(Duration::from_secs),
                csv,
                json,
            };
            stream(config, registry, &endpoint, options).await
        }
        Commands::SdLog {
            endpoint,
            analog,
            duration,
            save_metadata,
        } => {
            sd_log(
                config,
                registry,
                &endpoint,
                &analog,
                duration.map(Duration::from_secs),
                save_metadata.as_deref(),
            )
            .await
        }
        Commands::SdList { endpoint, timeout } => {
            sd_list(config, registry, &endpoint, Duration::from_secs(timeout)).await
        }
        Commands::SdDelete {
            endpoint,
            file_name,
        } => sd_delete(config, registry, &endpoint, &file_name).await,
        Commands::Import {
            endpoint,
            file_name,
            analog,
            output,
            timeout,
        } => {
            import_from_device(
                config,
                registry,
                &endpoint,
                &file_name,
                &analog,
                &output,
                Duration::from_secs(timeout),
            )
            .await
        }
        Commands::ImportFile {
            path,
            metadata,
            output,
        } => import_file(config, &path, &metadata, &output).await,
    }
}

fn resolve_endpoint(args: &EndpointArgs, config: &AppConfig) -> Result<DeviceEndpoint> {
    match (&args.port, &args.host) {
        (Some(port), None) => Ok(DeviceEndpoint::Usb {
            port: port.clone(),
            baud_rate: config.transport.baud_rate,
        }),
        (None, Some(host)) => Ok(DeviceEndpoint::Wifi {
            host: host.clone(),
            port: config.transport.tcp_port,
        }),
        _ => bail!("Specify exactly one of --port or --host"),
    }
}

/// Connect through the registry and complete the status handshake.
///
/// The serial number is only known after the handshake, so the registry runs
/// its duplicate check again with the reported identity.
async fn connect(
    registry: &ConnectionRegistry,
    args: &EndpointArgs,
    config: &AppConfig,
) -> Result<(DaqDevice, Arc<dyn Connectable>)> {
    let endpoint = resolve_endpoint(args, config)?;
    let kind = endpoint.connection_kind();
    info!(%endpoint, "Connecting");

    let link = Arc::new(DeviceLink::new(
        endpoint,
        DeviceIdentity::unidentified(kind),
        &config.transport,
    ));
    let handle: Arc<dyn Connectable> = link.clone();
    registry.connect(handle.clone()).await?;
    let transport = link
        .take_transport()
        .context("Link connected without a transport")?;

    let mut device = DaqDevice::new(transport, kind, DeviceSettings::from_config(config));
    device.initialize().await?;
    device
        .wait_until_ready(Duration::from_secs(args.ready_timeout))
        .await?;

    let identity = device.identity().clone();
    if registry.identify(&handle, identity.clone()).await? == ConnectionStatus::AlreadyConnected {
        device.shutdown().await?;
        bail!("Device {identity} is already connected");
    }
    println!("Connected to {identity}");
    Ok((device, handle))
}

/// Shut the device down and drop it from the registry.
async fn release(
    registry: &ConnectionRegistry,
    device: DaqDevice,
    handle: &Arc<dyn Connectable>,
) -> Result<()> {
    device.shutdown().await?;
    registry.disconnect_handle(handle).await?;
    Ok(())
}

async fn activate(device: &mut DaqDevice, kind: ChannelKind, indices: &[u32]) -> Result<()> {
    for index in indices {
        device.activate_channel(kind, *index).await?;
    }
    Ok(())
}

struct StreamOptions {
    analog: Vec<u32>,
    digital: Vec<u32>,
    frequency: u32,
    duration: Option<Duration>,
    csv: Option<PathBuf>,
    json: bool,
}

async fn stream(
    config: &AppConfig,
    registry: &ConnectionRegistry,
    args: &EndpointArgs,
    options: StreamOptions,
) -> Result<()> {
    let (mut device, handle) = connect(registry, args, config).await?;
    let mut events = device.subscribe();

    activate(&mut device, ChannelKind::Analog, &options.analog).await?;
    activate(&mut device, ChannelKind::Digital, &options.digital).await?;

    let recorder = match &options.csv {
        Some(path) => {
            let sink = CsvSink::create(path)?;
            let session = sink
                .create_session(&SessionInfo {
                    name: format!("live {}", device.identity()),
                    serial: device.identity().serial_number.clone(),
                    started_at: Utc::now(),
                })
                .await?;
            Some((sink, session))
        }
        None => None,
    };
    let mut pending: Vec<DataSample> = Vec::new();

    device.start_streaming(options.frequency).await?;
    println!("Streaming at {} Hz, Ctrl+C to stop", options.frequency);

    let deadline = tokio::time::sleep(options.duration.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);
    let mut received = 0usize;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            more = device.process_next() => {
                if !more? {
                    warn!("Device closed the connection");
                    break;
                }
            }
        }

        loop {
            match events.try_recv() {
                Ok(DeviceEvent::Sample(sample)) => {
                    received += 1;
                    if options.json {
                        println!("{}", serde_json::to_string(&sample)?);
                    } else {
                        println!(
                            "{} {:>6} {:>12.6}",
                            sample.timestamp.to_rfc3339(),
                            sample.channel,
                            sample.value
                        );
                    }
                    if recorder.is_some() {
                        pending.push(sample);
                    }
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event consumer fell behind");
                }
                Err(_) => break,
            }
        }

        if let Some((sink, session)) = &recorder {
            if pending.len() >= config.import.batch_size {
                sink.insert_batch(*session, &pending).await?;
                pending.clear();
            }
        }
    }

    device.stop_streaming().await?;
    if let Some((sink, session)) = &recorder {
        if !pending.is_empty() {
            sink.insert_batch(*session, &pending).await?;
        }
        sink.flush().await?;
    }
    release(registry, device, &handle).await?;
    println!("Received {received} samples");
    Ok(())
}

async fn sd_log(
    config: &AppConfig,
    registry: &ConnectionRegistry,
    args: &EndpointArgs,
    analog: &[u32],
    duration: Option<Duration>,
    save_metadata: Option<&Path>,
) -> Result<()> {
    let (mut device, handle) = connect(registry, args, config).await?;

    device.switch_mode(DeviceMode::LogToDevice).await?;
    activate(&mut device, ChannelKind::Analog, analog).await?;
    let file_name = device.start_sd_card_logging().await?;
    println!("Logging to {file_name}, Ctrl+C to stop");

    if let Some(path) = save_metadata {
        let text = toml::to_string_pretty(&device.metadata())?;
        tokio::fs::write(path, text).await?;
        println!("Channel configuration written to {}", path.display());
    }

    tokio::select! {
        _ = tokio::time::sleep(duration.unwrap_or(Duration::MAX)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    device.stop_sd_card_logging().await?;
    println!("Logging stopped, {file_name} is on the SD card");
    device.switch_mode(DeviceMode::StreamToApp).await?;
    release(registry, device, &handle).await?;
    Ok(())
}

async fn sd_list(
    config: &AppConfig,
    registry: &ConnectionRegistry,
    args: &EndpointArgs,
    timeout: Duration,
) -> Result<()> {
    let (mut device, handle) = connect(registry, args, config).await?;
    device.switch_mode(DeviceMode::LogToDevice).await?;

    let files = device.list_sd_card_files(timeout).await?;
    if files.is_empty() {
        println!("No log files on the SD card");
    }
    for file in &files {
        match file.created {
            Some(created) => println!("{:<32} {}", file.file_name, created),
            None => println!("{}", file.file_name),
        }
    }

    device.switch_mode(DeviceMode::StreamToApp).await?;
    release(registry, device, &handle).await?;
    Ok(())
}

async fn sd_delete(
    config: &AppConfig,
    registry: &ConnectionRegistry,
    args: &EndpointArgs,
    file_name: &str,
) -> Result<()> {
    let (mut device, handle) = connect(registry, args, config).await?;
    device.switch_mode(DeviceMode::LogToDevice).await?;
    device.delete_sd_card_file(file_name).await?;
    println!("Deleted {file_name}");
    device.switch_mode(DeviceMode::StreamToApp).await?;
    release(registry, device, &handle).await?;
    Ok(())
}

async fn import_from_device(
    config: &AppConfig,
    registry: &ConnectionRegistry,
    args: &EndpointArgs,
    file_name: &str,
    analog: &[u32],
    output: &Path,
    timeout: Duration,
) -> Result<()> {
    let (mut device, handle) = connect(registry, args, config).await?;
    device.switch_mode(DeviceMode::LogToDevice).await?;

    // The log does not record which channels were active
    for index in analog {
        if let Some(channel) = device.channel(ChannelKind::Analog, *index) {
            if !channel.is_active {
                device.activate_channel(ChannelKind::Analog, *index).await?;
            }
        }
    }
    let metadata = device.metadata();

    let download = device.download_sd_card_file(file_name, timeout).await?;
    device.switch_mode(DeviceMode::StreamToApp).await?;
    release(registry, device, &handle).await?;

    let content = match download {
        DownloadResult::Completed { content, .. } => content,
        DownloadResult::Failed(reason) => bail!("Download of {file_name} failed: {reason}"),
    };
    println!("Downloaded {} bytes", content.len());

    run_import(
        config,
        ImportRequest {
            file_name: file_name.to_string(),
            content,
            device: Some(metadata),
        },
        output,
    )
    .await
}

async fn import_file(config: &AppConfig, path: &Path, metadata: &Path, output: &Path) -> Result<()> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let text = tokio::fs::read_to_string(metadata)
        .await
        .with_context(|| format!("Failed to read {}", metadata.display()))?;
    let device: DeviceMetadata = toml::from_str(&text)
        .with_context(|| format!("Invalid device description in {}", metadata.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    run_import(
        config,
        ImportRequest {
            file_name,
            content,
            device: Some(device),
        },
        output,
    )
    .await
}

async fn run_import(config: &AppConfig, request: ImportRequest, output: &Path) -> Result<()> {
    let sink = Arc::new(CsvSink::create(output)?);
    let importer = SdCardImporter::new(sink, config.import.clone());

    let cancel = CancellationToken::new();
    let progress: ProgressFn = Arc::new(|p: ImportProgress| {
        info!(processed = p.processed, total = ?p.estimated_total, "Import progress");
    });
    let task = importer.spawn(request, cancel.clone(), Some(progress));

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let outcome = task.await?;
    match &outcome {
        ImportOutcome::Completed {
            samples_imported,
            channel_colors,
            ..
        } => {
            println!("Imported {samples_imported} samples into {}", output.display());
            for (channel, color) in channel_colors.iter() {
                println!("  {channel:<6} {color}");
            }
            Ok(())
        }
        ImportOutcome::Cancelled => {
            println!("{}", outcome.message());
            Ok(())
        }
        ImportOutcome::Failed(reason) => bail!("Import failed: {reason}"),
    }
}
