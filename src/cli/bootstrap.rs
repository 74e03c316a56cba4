//! CLI bootstrap: logging, settings, store and processor.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::counting::{CountingProcessor, MemoryStore, ProcessorEvent};
use crate::settings::{get_with_env_fallback, SettingsManager};

use super::args::Args;

const DEFAULT_LOG_FILTER: &str = "lanecount=info";

/// Context for CLI execution containing all initialized services.
pub struct CliContext {
    pub processor: CountingProcessor,

    /// Store seeded from settings; holds the results after replay
    pub store: Arc<MemoryStore>,

    /// Processor events for the output loop
    pub event_rx: mpsc::UnboundedReceiver<ProcessorEvent>,

    pub args: Args,
}

/// Write the settings template for `--init-settings`.
pub async fn init_settings(args: &Args) -> Result<()> {
    let manager = SettingsManager::with_path(args.settings_path()).await?;
    if manager.ensure_settings_file().await? {
        eprintln!("Created settings template at {}", manager.path().display());
    } else {
        eprintln!("Settings file already exists at {}", manager.path().display());
    }
    Ok(())
}

/// Initialize the CLI context.
pub async fn initialize(args: &Args) -> Result<CliContext> {
    let settings_manager = SettingsManager::with_path(args.settings_path())
        .await
        .context("Failed to initialize settings manager")?;
    let settings = settings_manager.get().await;

    init_logging(args, settings.logging.filter.as_ref());

    if args.verbose {
        eprintln!(
            "[cli] Settings loaded from {}",
            settings_manager.path().display()
        );
    }

    if settings.lanes.is_empty() {
        tracing::warn!(
            "No lanes configured in {}; every event will be ignored",
            settings_manager.path().display()
        );
    }

    let mut config = settings.engine.processor_config();
    if let Some(timeout_secs) = args.timeout_secs {
        config.default_timeout_secs = timeout_secs;
    }

    let store = Arc::new(MemoryStore::with_records(
        settings.lanes,
        settings.parking_lots,
    ));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let processor = CountingProcessor::spawn(store.clone(), config, Some(event_tx));

    Ok(CliContext {
        processor,
        store,
        event_rx,
        args: args.clone(),
    })
}

/// Install the stderr subscriber.
///
/// Filter precedence: `--verbose`, settings, `LANECOUNT_LOG`, `RUST_LOG`.
fn init_logging(args: &Args, settings_filter: Option<&String>) {
    let directive = if args.verbose {
        "lanecount=debug".to_string()
    } else {
        get_with_env_fallback(
            &settings_filter.cloned(),
            &["LANECOUNT_LOG", "RUST_LOG"],
            Some(DEFAULT_LOG_FILTER.to_string()),
        )
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
    };

    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("[cli] Invalid log filter '{}': {}", directive, e);
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
