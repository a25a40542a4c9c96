use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rollcall_core::attendance::SessionConfig;
use rollcall_core::onnx::{Gallery, ModelPaths, OnnxFaceAnalyzer};
use rollcall_core::pool::DEFAULT_SWEEP_INTERVAL;
use rollcall_core::{FrameAnalyzer, SettingsHandle, TrackerConfig};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod pipeline;
mod source;
mod store;

use config::Config;
use dbus_interface::{AppState, AttendanceService, BUS_NAME, OBJECT_PATH};
use pipeline::{Pipeline, PipelineConfig};
use source::DirectorySource;
use store::AttendanceStore;

/// Face attendance daemon.
#[derive(Parser, Debug)]
#[command(name = "rollcalld", version, about)]
struct Args {
    /// Replay still images from this directory as the camera feed.
    #[arg(long)]
    frames_dir: Option<PathBuf>,
    /// Serve on the session bus instead of the system bus.
    #[arg(long)]
    session_bus: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    config.apply_overrides(args.frames_dir, args.session_bus);

    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        strategy = %config.dedup_strategy,
        "rollcalld starting"
    );

    let report = rollcall_models::verify_models_dir(&config.model_dir)
        .context("model integrity check failed")?;
    for (role, verification) in &report {
        tracing::info!(model = role.id(), status = ?verification, "model checked");
    }

    let gallery = if config.gallery_path.exists() {
        Gallery::load(&config.gallery_path, config.similarity_threshold)
            .with_context(|| format!("loading gallery {}", config.gallery_path.display()))?
    } else {
        tracing::warn!(
            path = %config.gallery_path.display(),
            "no gallery found, every face will be unknown"
        );
        Gallery::empty(config.similarity_threshold)
    };
    let gallery_size = gallery.len();
    tracing::info!(enrolled = gallery_size, "gallery loaded");

    let analyzer = Arc::new(OnnxFaceAnalyzer::new(
        ModelPaths::from_dir(&config.model_dir),
        Arc::new(gallery),
        config.detector_config(),
        config.liveness_config(),
        config.pool_config(),
    ));
    let engine = engine::spawn_engine(
        analyzer.clone() as Arc<dyn FrameAnalyzer>,
        config.inference_timeout(),
    );

    let store = AttendanceStore::open(&config.db_path).await?;
    let settings = SettingsHandle::new(config.runtime_settings());

    let frames_dir = config
        .frames_dir
        .clone()
        .context("no frame source: set ROLLCALL_FRAMES_DIR or pass --frames-dir")?;
    let source = DirectorySource::open(&frames_dir, config.frames_loop)?;

    let mut pipeline = Pipeline::new(
        engine.clone(),
        source,
        store.clone(),
        settings.clone(),
        PipelineConfig {
            capture_interval: config.capture_interval(),
            tick_interval: config.tick_interval(),
            strategy: config.dedup_strategy,
            session: SessionConfig::default(),
            tracker: TrackerConfig::default(),
        },
    );
    pipeline.restore_cooldowns(store.load_cooldowns().await?);

    let state = Arc::new(AppState {
        config: config.clone(),
        settings,
        engine,
        analyzer: analyzer.clone(),
        store: store.clone(),
        overlay: pipeline.overlay(),
        gallery_size,
    });
    let service = AttendanceService { state };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(bus = BUS_NAME, session_bus = config.session_bus, "D-Bus service ready");

    let sweeper = {
        let analyzer = analyzer.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let analyzer = analyzer.clone();
                match tokio::task::spawn_blocking(move || analyzer.sweep()).await {
                    Ok(0) => {}
                    Ok(evicted) => tracing::debug!(evicted, "idle inference sessions evicted"),
                    Err(e) => tracing::warn!(error = %e, "session sweep panicked"),
                }
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline_task = tokio::spawn(pipeline.run(shutdown_rx));

    tracing::info!("rollcalld ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let _ = shutdown_tx.send(true);
    sweeper.abort();
    let cooldowns = pipeline_task.await.context("pipeline task failed")?;
    store.save_cooldowns(&cooldowns).await?;

    Ok(())
}
