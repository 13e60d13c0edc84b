//! aoa-bridge
//!
//! Switches an attached Android phone into accessory mode and serves its
//! accessory byte pipe and audio stream on local Unix sockets.

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbBackend, setup_logging};
use host::config::HostConfig;
use host::session::{AccessoryDevice, Session, SessionEvent};
use host::usb::RusbBackend;
use protocol::ChannelMode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "aoa-bridge")]
#[command(
    author,
    version,
    about = "Bridge an Android device in accessory mode to local sockets"
)]
#[command(long_about = "
Finds an Android phone on the USB bus, switches it into Android Open Accessory
mode and serves its channels on Unix sockets:

  accessory  full-duplex byte pipe over the accessory bulk endpoints
  audio      raw 16-bit stereo PCM captured from the USB audio interface

EXAMPLES:
    # Bridge both channels with the default config
    aoa-bridge

    # Audio only, with debug logging
    aoa-bridge --mode audio --log-level debug

    # List USB devices without opening anything
    aoa-bridge --list-devices

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/aoa-bridge/host.toml
    3. /etc/aoa-bridge/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Channels to open (accessory, audio, accessory+audio)
    #[arg(short, long, value_name = "MODE")]
    mode: Option<ChannelMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Unix socket path for the accessory channel
    #[arg(long, value_name = "PATH")]
    accessory_socket: Option<String>,

    /// Unix socket path for the audio channel
    #[arg(long, value_name = "PATH")]
    audio_socket: Option<String>,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    if let Some(mode) = args.mode {
        config.host.mode = mode;
    }
    if let Some(level) = args.log_level {
        config.host.log_level = level;
    }
    if let Some(path) = args.accessory_socket {
        config.host.accessory_socket = path;
    }
    if let Some(path) = args.audio_socket {
        config.host.audio_socket = path;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.host.log_level).context("Failed to setup logging")?;

    info!("aoa-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.host.log_level);

    let backend = Arc::new(RusbBackend::new().context("Failed to initialize libusb")?);

    if args.list_devices {
        return list_devices(&backend);
    }

    let Some(session) = open_session(Arc::clone(&backend), &config).await? else {
        info!("Interrupted before a device was found");
        return Ok(());
    };

    serve(session, &config).await
}

/// List USB devices and exit
fn list_devices(backend: &RusbBackend) -> Result<()> {
    let devices = backend.devices().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let accessory = if protocol::aoa::is_accessory_product(device.product_id)
            && device.vendor_id == protocol::aoa::ACCESSORY_VENDOR_ID
        {
            " (accessory mode)"
        } else {
            ""
        };
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}{}",
            device.vendor_id, device.product_id, device.bus_number, device.device_address, accessory
        );
    }

    Ok(())
}

/// Open and initialize a session, retrying while no device is attached
///
/// Returns None when interrupted with Ctrl-C.
async fn open_session(
    backend: Arc<RusbBackend>,
    config: &HostConfig,
) -> Result<Option<Session<RusbBackend>>> {
    let mode = config.host.mode;
    let retry_interval = config.host.retry_interval();
    info!("Waiting for device ({})", mode);

    loop {
        let backend = Arc::clone(&backend);
        let settings = config.session_settings();
        let attempt = tokio::task::spawn_blocking(move || {
            AccessoryDevice::open(backend, settings, mode)?.initialize()
        })
        .await
        .context("Session setup task failed")?;

        match attempt {
            Ok(session) => return Ok(Some(session)),
            Err(e) if e.is_retryable() => {
                debug!("{}, retrying in {:?}", e, retry_interval);
            }
            Err(e) => return Err(e).context("Failed to open accessory session"),
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_interval) => {}
            _ = signal::ctrl_c() => return Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Accessory,
    Audio,
}

/// Serve the session streams until Ctrl-C or the session ends
async fn serve(mut session: Session<RusbBackend>, config: &HostConfig) -> Result<()> {
    let mut tasks = Vec::new();

    if let Some(stream) = session.take_accessory_stream() {
        let path = config.host.accessory_socket_path();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve_stream(&path, stream, StreamKind::Accessory).await {
                error!("Accessory socket error: {:#}", e);
            }
        }));
    }

    if let Some(stream) = session.take_audio_stream() {
        let path = config.host.audio_socket_path();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve_stream(&path, stream, StreamKind::Audio).await {
                error!("Audio socket error: {:#}", e);
            }
        }));
    }

    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        event = session.closed() => match event {
            SessionEvent::Shutdown => Ok(()),
            SessionEvent::Failed { channel, error } => {
                Err(anyhow::Error::new(error).context(format!("{} failed", channel)))
            }
        },
    };

    for task in tasks {
        task.abort();
    }

    if session.audio_overruns() > 0 {
        warn!("{} audio overruns during the session", session.audio_overruns());
    }

    // Dropping the session joins the bridge threads
    session.shutdown();
    tokio::task::spawn_blocking(move || drop(session))
        .await
        .context("Session teardown task failed")?;

    info!("Shutdown complete");
    result
}

/// Accept one consumer on `path` and copy between it and the session stream
async fn serve_stream(
    path: &Path,
    stream: std::os::unix::net::UnixStream,
    kind: StreamKind,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind socket: {}", path.display()))?;
    info!("Serving {:?} stream on {}", kind, path.display());

    stream
        .set_nonblocking(true)
        .context("Failed to set socket non-blocking")?;
    let mut device = UnixStream::from_std(stream).context("Failed to convert socket to tokio")?;

    let (mut client, _) = listener.accept().await.context("Failed to accept consumer")?;
    info!("Consumer connected to {:?} stream", kind);

    let result = match kind {
        StreamKind::Accessory => tokio::io::copy_bidirectional(&mut client, &mut device)
            .await
            .map(|(up, down)| up + down),
        StreamKind::Audio => tokio::io::copy(&mut device, &mut client).await,
    };

    let _ = std::fs::remove_file(path);
    let bytes = result.with_context(|| format!("{:?} stream copy failed", kind))?;
    info!("{:?} consumer disconnected after {} bytes", kind, bytes);
    Ok(())
}
