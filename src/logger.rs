//! Logging setup driven by the `logger.*` config section.
//!
//! Console and file sinks are independent layers with their own levels and
//! formats, stacked on a single `tracing` registry.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

use crate::config::LoggerConfig;
use crate::error::ConfigError;

/// Parse a level name ("INFO", "debug", ...) into a filter.
pub fn parse_level(level: &str) -> Result<LevelFilter, String> {
    level.parse::<LevelFilter>().map_err(|e| e.to_string())
}

/// Install the global subscriber. Must be called once, before any logging.
pub fn init(cfg: &LoggerConfig) -> Result<(), ConfigError> {
    let console_layer: Option<Box<dyn Layer<Registry> + Send + Sync>> = if cfg.enable_console {
        let level = parse_level(&cfg.console_level)
            .map_err(|e| ConfigError::invalid(format!("invalid ConsoleLevel value: {e}")))?;
        let base = tracing_subscriber::fmt::layer().with_ansi(cfg.enable_color);
        Some(if cfg.console_json {
            base.json().with_filter(level).boxed()
        } else {
            base.with_filter(level).boxed()
        })
    } else {
        None
    };

    let file_layer: Option<Box<dyn Layer<Registry> + Send + Sync>> = if cfg.enable_file {
        let level = parse_level(&cfg.file_level)
            .map_err(|e| ConfigError::invalid(format!("invalid FileLevel value: {e}")))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.file_location)
            .map_err(|e| {
                ConfigError::invalid(format!(
                    "failed to open log file {}: {e}",
                    cfg.file_location
                ))
            })?;
        let base = tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false);
        Some(if cfg.file_json {
            base.json().with_filter(level).boxed()
        } else {
            base.with_filter(level).boxed()
        })
    } else {
        None
    };

    let layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> =
        vec![console_layer, file_layer].into_iter().flatten().collect();

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| ConfigError::invalid(format!("failed to init logger: {e}")))
}
