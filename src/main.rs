mod ble;
mod error;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use hrwatch_lib::reader::{ReadPhase, TransferObserver};
use hrwatch_lib::request::{self, Alarm, MusicInfo, NotificationType};
use hrwatch_lib::{
    AuthError, FileHandle, FileTransferError, KnownFile, SessionConfig, SessionKey, StaticKeyStore, Watch,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ble::BleTransport;

/// Client for hybrid smartwatches: authenticate and pull files over BLE.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Watch name or address; defaults to the first device advertising the watch service
    #[arg(short, long, global = true)]
    address: Option<String>,
    /// Secret key of the watch as 32 hex characters
    #[arg(short, long, global = true)]
    key: Option<String>,
    /// JSON file with session timeouts
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// How long to scan for devices, in seconds
    #[arg(long, default_value_t = 5, global = true)]
    scan_secs: u64,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List nearby BLE devices
    Scan,
    /// Connect and run the authentication handshake
    Auth,
    /// Fetch a file by catalog name (e.g. activity_file) or hex handle (0x0100)
    Fetch {
        handle: FileHandle,
        /// The file is not encrypted; skip authentication
        #[arg(long)]
        plain: bool,
        /// Write the file here instead of hex-dumping it
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print the known file handles
    Files,
    /// Print a request payload as hex without connecting
    Encode {
        #[command(subcommand)]
        payload: Payload,
    },
}

#[derive(Subcommand, Debug)]
enum Payload {
    Notification {
        #[arg(long, value_enum, default_value_t = Kind::Notification)]
        kind: Kind,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        sender: String,
        #[arg(long, default_value = "")]
        message: String,
        /// Package name of the originating app
        #[arg(long, default_value = "generic")]
        package: String,
        #[arg(long, default_value_t = 1)]
        id: u32,
    },
    Alarm {
        hour: u8,
        minute: u8,
        /// Weekday mask, bit 0 = Sunday
        #[arg(long, default_value_t = 0x7F)]
        days: u8,
        #[arg(long)]
        repeat: bool,
        #[arg(long, default_value = "")]
        label: String,
        #[arg(long, default_value = "")]
        message: String,
    },
    Music {
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        artist: String,
        #[arg(long, default_value = "")]
        album: String,
        #[arg(long, default_value_t = 0)]
        revision: u8,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    IncomingCall,
    Text,
    Notification,
    Email,
    Calendar,
    MissedCall,
    Dismiss,
}

impl From<Kind> for NotificationType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::IncomingCall => NotificationType::IncomingCall,
            Kind::Text => NotificationType::Text,
            Kind::Notification => NotificationType::Notification,
            Kind::Email => NotificationType::Email,
            Kind::Calendar => NotificationType::Calendar,
            Kind::MissedCall => NotificationType::MissedCall,
            Kind::Dismiss => NotificationType::Dismiss,
        }
    }
}

/// Logs phase changes and progress of a fetch
struct LogProgress;

impl TransferObserver for LogProgress {
    fn on_phase(&self, phase: ReadPhase) {
        debug!("Transfer phase: {}", phase);
    }

    fn on_progress(&self, received: usize, total: u32) {
        if total > 0 {
            info!("{}/{} bytes ({}%)", received, total, received * 100 / total as usize);
        }
    }
}

/// Stderr logging at the `-v`/`-q` level (RUST_LOG wins), mirrored to `log_file` without colours
fn init_tracing(verbosity: &Verbosity<InfoLevel>, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let mut guard = None;
    let mirror = log_file
        .map(|path| -> Result<_> {
            let file = File::create(path).with_context(|| format!("Cannot create log file {}", path.display()))?;
            let (writer, worker) = tracing_appender::non_blocking(file);
            guard = Some(worker);
            Ok(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(mirror)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(&cli.verbose, cli.log_file.as_deref())?;

    if let Err(e) = run(cli).await {
        match hint(&e) {
            Some(hint) => error!("{:#} (try: {})", e, hint),
            None => error!("{:#}", e),
        }
        process::exit(1);
    }

    Ok(())
}

/// Remediation for protocol failures anywhere in the error chain
fn hint(e: &anyhow::Error) -> Option<String> {
    e.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<FileTransferError>() {
            Some(e.remediation().to_string())
        } else {
            cause.downcast_ref::<AuthError>().map(|e| e.remediation().to_string())
        }
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SessionConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => SessionConfig::default(),
    };
    let scan_time = Duration::from_secs(cli.scan_secs);

    match cli.command {
        Command::Scan => {
            info!("Scanning for {} s...", cli.scan_secs);
            let devices = ble::scan(scan_time).await?;
            if devices.is_empty() {
                info!("No devices found.");
            }
            for device in devices {
                println!(
                    "{}  {:<24} rssi {:>4}{}",
                    device.address,
                    device.name,
                    device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".to_string()),
                    if device.is_watch { "  [watch]" } else { "" }
                );
            }
        }
        Command::Files => {
            for file in KnownFile::ALL {
                println!("0x{:04X}  {}", u16::from(file), file);
            }
        }
        Command::Encode { payload } => {
            println!("{}", hex::encode(encode(payload)));
        }
        Command::Auth => {
            let key = parse_key(cli.key.as_deref())?;
            let (transport, watch) = connect(cli.address.as_deref(), scan_time, Some(key), config).await?;
            let result = watch.authenticate().await;
            transport.disconnect().await?;
            result.context("Authentication failed")?;
            println!("Authenticated");
        }
        Command::Fetch { handle, plain, out } => {
            let key = if plain {
                cli.key.as_deref().map(SessionKey::from_hex).transpose()?
            } else {
                Some(parse_key(cli.key.as_deref())?)
            };
            let (transport, watch) = connect(cli.address.as_deref(), scan_time, key, config).await?;
            let result = fetch(&watch, handle, plain).await;
            transport.disconnect().await?;
            let file = result?;

            match out {
                Some(path) => {
                    std::fs::write(&path, &file).with_context(|| format!("Failed to write {:?}", path))?;
                    info!("Wrote {} bytes to {:?}", file.len(), path);
                }
                None => {
                    for (i, chunk) in file.chunks(16).enumerate() {
                        println!("{:08x}  {}", i * 16, hex::encode(chunk));
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_key(key: Option<&str>) -> Result<SessionKey> {
    let Some(key) = key else {
        bail!("A secret key is required (--key <32 hex chars>)");
    };
    SessionKey::from_hex(key).context("Invalid key")
}

async fn connect(
    target: Option<&str>,
    scan_time: Duration,
    key: Option<SessionKey>,
    config: SessionConfig,
) -> Result<(Arc<BleTransport>, Watch)> {
    let peripheral = ble::find_watch(target, scan_time).await?;
    let transport = Arc::new(BleTransport::connect(peripheral).await?);
    let keys = match key {
        Some(key) => StaticKeyStore::new(key),
        None => StaticKeyStore::empty(),
    };
    let watch = Watch::new(transport.clone(), Arc::new(keys), config).with_observer(Arc::new(LogProgress));
    Ok((transport, watch))
}

async fn fetch(watch: &Watch, handle: FileHandle, plain: bool) -> Result<bytes::Bytes> {
    if plain {
        return Ok(watch.fetch_file(handle).await?);
    }
    watch.authenticate().await.context("Authentication failed")?;
    watch
        .fetch_encrypted_file(handle)
        .await
        .with_context(|| format!("Fetching {} failed", handle))
}

fn encode(payload: Payload) -> bytes::Bytes {
    match payload {
        Payload::Notification {
            kind,
            title,
            sender,
            message,
            package,
            id,
        } => request::play_notification(&request::Notification {
            kind: kind.into(),
            flags: 0x02,
            message_id: id,
            package_crc: request::package_crc(&package),
            title,
            sender,
            message,
        }),
        Payload::Alarm {
            hour,
            minute,
            days,
            repeat,
            label,
            message,
        } => request::alarms(&[Alarm {
            hour,
            minute,
            days,
            repeat,
            label,
            message,
        }]),
        Payload::Music {
            title,
            artist,
            album,
            revision,
        } => request::music_info(&MusicInfo {
            revision,
            title,
            artist,
            album,
        }),
    }
}
