use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camcast::config::ConfigStore;
use camcast::events::EventBus;
use camcast::video::device::choose_preview_size;
use camcast::video::sim::{
    CollectingPacketizer, SimCameraBackend, SimCodecMode, SimCodecProvider, SimSurfaceProvider,
};
use camcast::video::{QualityDescriptor, Resolution, StreamPipeline, V4l2CameraBackend};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "camcast")]
#[command(version, about = "Camera capture to hardware H.264 with parameter set extraction", long_about = None)]
struct CliArgs {
    /// Data directory path (default: /var/lib/camcast)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List V4L2 capture devices and the preview size each would use
    Devices {
        #[arg(long, default_value_t = 1280)]
        width: u32,
        #[arg(long, default_value_t = 720)]
        height: u32,
    },

    /// Run configure, start and stop against simulated hardware
    Simulate {
        #[arg(long, default_value_t = 1280)]
        width: u32,
        #[arg(long, default_value_t = 720)]
        height: u32,
        #[arg(long, default_value_t = 30)]
        fps: u32,
        #[arg(long, default_value_t = 3_000_000)]
        bitrate: u32,
        /// Deliver parameter sets in-band instead of through the output format
        #[arg(long)]
        in_band: bool,
        /// Access units to collect before stopping
        #[arg(long, default_value_t = 30)]
        frames: usize,
    },

    /// Print persisted parameter sets
    Params,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::debug!("camcast v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);

    match args.command {
        Command::Devices { width, height } => list_devices(Resolution::new(width, height)),
        Command::Simulate {
            width,
            height,
            fps,
            bitrate,
            in_band,
            frames,
        } => {
            let quality = QualityDescriptor::new(width, height, fps, bitrate);
            quality.validate()?;
            let store = open_store(&data_dir).await?;
            simulate(store, quality, in_band, frames).await
        }
        Command::Params => {
            let store = open_store(&data_dir).await?;
            print_parameter_sets(&store).await
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camcast=error",
        LogLevel::Warn => "camcast=warn",
        LogLevel::Info => "camcast=info",
        LogLevel::Verbose => "camcast=debug,sqlx=warn",
        LogLevel::Debug => "camcast=debug,sqlx=info",
        LogLevel::Trace => "camcast=trace,sqlx=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("CAMCAST_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/var/lib/camcast")
}

async fn open_store(data_dir: &std::path::Path) -> anyhow::Result<ConfigStore> {
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(data_dir).await?;
    Ok(ConfigStore::new(&data_dir.join("camcast.db")).await?)
}

fn list_devices(requested: Resolution) -> anyhow::Result<()> {
    let backend = V4l2CameraBackend::scan()?;
    if backend.devices().is_empty() {
        println!("No video capture devices found");
        return Ok(());
    }

    for device in backend.devices() {
        let params = &device.parameters;
        let sizes: Vec<String> = params
            .supported_preview_sizes
            .iter()
            .map(|s| s.to_string())
            .collect();
        let formats: Vec<String> = params.preview_formats.iter().map(|f| f.to_string()).collect();

        println!(
            "{} [{}] {} ({}, {})",
            device.path.display(),
            device.camera.facing,
            device.camera.name,
            device.driver,
            device.bus_info
        );
        println!("  formats: {}", formats.join(" "));
        println!("  sizes:   {}", sizes.join(" "));
        if !params.supported_preview_sizes.is_empty() {
            println!(
                "  preview for {}: {}",
                requested,
                choose_preview_size(params, requested)
            );
        }
    }
    Ok(())
}

async fn simulate(
    store: ConfigStore,
    quality: QualityDescriptor,
    in_band: bool,
    frames: usize,
) -> anyhow::Result<()> {
    let config = store.get().pipeline.clone();
    let mode = if in_band {
        SimCodecMode::InBand
    } else {
        SimCodecMode::FormatChange
    };

    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("{}", json),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        }
    });

    let packetizer = CollectingPacketizer::new();
    let collected = packetizer.collected();

    let pipeline = StreamPipeline::builder(
        Arc::new(SimCameraBackend::standard()),
        Arc::new(SimCodecProvider::new().with_mode(mode)),
        Arc::new(SimSurfaceProvider::new()),
    )
    .config(config)
    .packetizer(Box::new(packetizer))
    .store(store)
    .events(events)
    .build()?;

    pipeline.configure(quality).await?;
    let params = pipeline.codec_parameter_set().await?;
    println!("profile-level-id={}", params.profile_level_id());
    println!("sprop-parameter-sets={}", params.sprop_parameter_sets());

    pipeline.start().await?;

    // Allow twice the nominal time for the requested frames
    let deadline = tokio::time::Instant::now()
        + Duration::from_micros(quality.frame_interval_us() * frames as u64 * 2)
        + Duration::from_secs(1);
    while collected.unit_count() < frames && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pipeline.stop().await?;
    println!(
        "collected {} access units, {} bytes",
        collected.unit_count(),
        collected.total_bytes()
    );

    pipeline.release().await;
    Ok(())
}

async fn print_parameter_sets(store: &ConfigStore) -> anyhow::Result<()> {
    let stored = store.list_parameter_sets().await?;
    if stored.is_empty() {
        println!("No parameter sets stored");
        return Ok(());
    }

    for entry in stored {
        println!(
            "{} {} {} profile-level-id={} sprop-parameter-sets={},{} ({})",
            entry.mime,
            entry.encoder,
            entry.quality,
            entry.parameters.profile_level_id,
            entry.parameters.sps,
            entry.parameters.pps,
            entry.updated_at.to_rfc3339()
        );
    }
    Ok(())
}
