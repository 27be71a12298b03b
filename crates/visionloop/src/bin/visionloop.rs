//! Visionloop CLI
//!
//! Usage:
//!   visionloop run [-c config.yaml] [--demo]   # Route frames until Ctrl+C
//!   visionloop migrate [-c config.yaml]        # Migrate the camera document
//!   visionloop rollback [-c config.yaml]       # Restore the pre-migration document
//!   visionloop status [-c config.yaml] [-f json]

use argh::FromArgs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use visionloop::camera::CameraSettings;
use visionloop::sim::{BrightSpotProcessor, LogSink, TestPatternProvider};
use visionloop::store::{detect_version, PersistedDocument};
use visionloop::{
    ConfigMigrator, ConfigStore, FileConfigStore, FrameInfo, PipelineSettings, PixelFormat,
    RuntimeConfig, VisionCore,
};

/// Visionloop - camera/pipeline vision coprocessor runtime
#[derive(FromArgs)]
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunArgs),
    Migrate(MigrateArgs),
    Rollback(RollbackArgs),
    Status(StatusArgs),
}

/// Route frames from every camera through its pipelines
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
struct RunArgs {
    /// path to the runtime configuration file
    #[argh(option, short = 'c', default = "String::from(\"visionloop.yaml\")")]
    config: String,

    /// add a test-pattern camera with one pipeline when none are configured
    #[argh(switch)]
    demo: bool,
}

/// Migrate the persisted camera document to the current schema
#[derive(FromArgs)]
#[argh(subcommand, name = "migrate")]
struct MigrateArgs {
    /// path to the runtime configuration file
    #[argh(option, short = 'c', default = "String::from(\"visionloop.yaml\")")]
    config: String,
}

/// Restore the camera document saved before the last migration
#[derive(FromArgs)]
#[argh(subcommand, name = "rollback")]
struct RollbackArgs {
    /// path to the runtime configuration file
    #[argh(option, short = 'c', default = "String::from(\"visionloop.yaml\")")]
    config: String,
}

/// Show the persisted cameras and pipelines
#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
struct StatusArgs {
    /// path to the runtime configuration file
    #[argh(option, short = 'c', default = "String::from(\"visionloop.yaml\")")]
    config: String,

    /// output format: table, json (default: table)
    #[argh(option, short = 'f', default = "String::from(\"table\")")]
    format: String,
}

fn setup_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);
}

fn load_config(path: &str) -> anyhow::Result<RuntimeConfig> {
    let config = RuntimeConfig::load_or_default(path)?;
    log::debug!("Data directory: {}", config.data_dir.display());
    Ok(config)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let store = Arc::new(FileConfigStore::from_config(&config));
    let provider = TestPatternProvider::new(FrameInfo::new(640, 480, PixelFormat::Rgb8))
        .with_frame_interval(Duration::from_millis(33));

    let core = VisionCore::bootstrap(
        &config,
        store,
        Arc::new(provider),
        Arc::new(BrightSpotProcessor),
        Arc::new(LogSink),
    )
    .await?;

    if args.demo && core.cameras().await.is_empty() {
        log::info!("No cameras configured, adding demo camera");
        core.create_camera(CameraSettings::new("Cam0")).await?;
        core.create_pipeline("Cam0", PipelineSettings::new("bright-spot", "Cam0"))
            .await?;
    }

    for camera in core.cameras().await {
        log::info!(
            "  - {} (ports {}/{}, {:?})",
            camera.unique_name,
            camera.ports.input,
            camera.ports.output,
            camera.liveness
        );
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received Ctrl+C, shutting down gracefully...");
            shutdown_tx.send(()).ok();
        }
    })?;

    core.run(shutdown_rx).await?;
    log::info!("Shutdown complete");
    Ok(())
}

fn migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let migrator = ConfigMigrator::new(Arc::new(FileConfigStore::from_config(&config)));
    let outcome = migrator.run()?;
    println!("{:?}", outcome);
    Ok(())
}

fn rollback(args: RollbackArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let migrator = ConfigMigrator::new(Arc::new(FileConfigStore::from_config(&config)));
    migrator.rollback()?;
    println!("Restored {}", config.document_path().display());
    Ok(())
}

fn status(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let store = FileConfigStore::from_config(&config);
    let Some(blob) = store.load()? else {
        println!("No camera document at {}", config.document_path().display());
        return Ok(());
    };
    let version = detect_version(&blob)?;
    if version != Some(visionloop::store::CURRENT_VERSION) {
        println!(
            "Document at {} has version {:?}; run `visionloop migrate`",
            config.document_path().display(),
            version
        );
        return Ok(());
    }

    let doc = PersistedDocument::parse(&blob)?;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{:<20} {:<8} {:<12}", "CAMERA", "STREAM", "PORTS");
    for camera in &doc.cameras {
        let index = camera.stream_index.unwrap_or_default();
        let ports = visionloop::ports::StreamPorts::for_stream_index(index)?;
        println!(
            "{:<20} {:<8} {}/{}",
            camera.unique_name, index, ports.input, ports.output
        );
    }
    println!();
    println!("{:<6} {:<20} {:<20} {:<8}", "ID", "PIPELINE", "CAMERA", "ENABLED");
    for record in &doc.pipelines {
        println!(
            "{:<6} {:<20} {:<20} {:<8}",
            record.id.0,
            record.settings.nickname,
            record.settings.source_camera_unique_name,
            record.settings.enabled
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();
    let args: Args = argh::from_env();

    match args.command {
        Command::Run(args) => run(args).await,
        Command::Migrate(args) => migrate(args),
        Command::Rollback(args) => rollback(args),
        Command::Status(args) => status(args),
    }
}
