use std::io::BufRead;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;

use streamplay::audio::{CpalSink, DeviceManager, VorbisCodec};
use streamplay::cli::{CliApp, ControlLine, StatusDisplay};
use streamplay::config::{ConfigManager, EngineConfig};
use streamplay::engine::{EngineHandle, Notification, PlaybackEngine};
use streamplay::fetch::{FetchManager, FetchSettings, HttpCatalog, HttpTransport};
use streamplay::queue::cache::PlaylistCache;
use streamplay::{logging, PlayerError};

fn main() {
    let cli = CliApp::parse();

    if let Err(e) = logging::init() {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("{}", e);
        StatusDisplay::display_error(&e);
        std::process::exit(1);
    }
}

fn run(cli: CliApp) -> Result<(), PlayerError> {
    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };
    let mut config = config_manager.get_config().clone();
    if cli.device.is_some() {
        config.preferred_device = cli.device.clone();
    }

    if cli.list_devices {
        let devices = DeviceManager::new()?;
        for name in devices.list_devices() {
            println!("{}", name);
        }
        return Ok(());
    }

    if cli.list_playlists {
        let records = PlaylistCache::new(config.playlist_cache_path()).load()?;
        if records.is_empty() {
            println!("No cached albums or playlists");
        }
        for line in StatusDisplay::playlist_lines(&records) {
            println!("{}", line);
        }
        return Ok(());
    }

    if config.backend_instances.is_empty() {
        warn!(
            "No backend instances configured in {}",
            config_manager.config_path().display()
        );
    }

    // The output stream may not be movable between threads, so the engine
    // runs on the main thread of a single-threaded runtime
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve(cli, config))
}

async fn serve(cli: CliApp, config: EngineConfig) -> Result<(), PlayerError> {
    let transport = HttpTransport::new(config.read_timeout())?;
    let fetcher = FetchManager::new(Arc::new(transport), FetchSettings::from_config(&config));
    let catalog = HttpCatalog::new(fetcher.clone(), config.catalog_cache_directory());
    let sink = CpalSink::new(config.preferred_device.clone());

    let (engine, handle, notifications) = PlaybackEngine::new(
        config,
        fetcher,
        Arc::new(catalog),
        sink,
        Box::new(VorbisCodec::new()),
    );

    let interrupt = handle.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Interrupt received, shutting down");
        interrupt.shutdown();
    }) {
        warn!("Cannot install interrupt handler: {}", e);
    }

    tokio::spawn(print_notifications(notifications));
    tokio::spawn(read_console(handle.clone()));

    if let Some(command) = cli.initial_command() {
        handle.send(command)?;
    }

    engine.run().await;
    Ok(())
}

async fn print_notifications(mut notifications: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::TrackChanged(track) => {
                println!("Playing: {} - {}", track.artist_name(), track.display_name())
            }
            Notification::PositionSeeked(micros) => println!(
                "Position: {}",
                CliApp::format_duration(std::time::Duration::from_micros(micros))
            ),
            Notification::PlaybackStatusChanged(state) => println!("Status: {}", state.as_str()),
            Notification::TrackOver => {}
            Notification::PlaybackFault(message) => eprintln!("⚠ Audio output failed: {}", message),
        }
    }
}

/// Forward control lines from stdin to the engine until quit or end of input
async fn read_console(handle: EngineHandle) {
    let (tx, mut lines) = mpsc::unbounded_channel::<String>();

    // Blocking reads stay off the runtime thread
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Cannot read control input: {}", e);
                    break;
                }
            }
        }
    });

    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        match CliApp::parse_command(&line) {
            Ok(ControlLine::Engine(command)) => {
                if let Err(e) = handle.send(command) {
                    StatusDisplay::display_error(&e);
                    return;
                }
            }
            Ok(ControlLine::Status) => match handle.status().await {
                Ok(status) => StatusDisplay::display_full_status(&status),
                Err(e) => StatusDisplay::display_error(&e),
            },
            Ok(ControlLine::Help) => CliApp::display_help(),
            Ok(ControlLine::Quit) => {
                handle.shutdown();
                return;
            }
            Err(e) => StatusDisplay::display_error(&PlayerError::from(e)),
        }
    }

    // stdin closed: keep playing until interrupted
    info!("Control input closed");
}
