//! TOML-based settings for the counting engine.
//!
//! Settings are loaded from `~/.lanecount/settings.toml` unless another path
//! is given. Every section is optional; missing values fall back to the
//! engine defaults.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lanecount::settings::SettingsManager;
//!
//! let manager = SettingsManager::new().await?;
//! let settings = manager.get().await;
//! let config = settings.engine.processor_config();
//! ```

pub mod loader;
pub mod schema;

pub use loader::{get_with_env_fallback, settings_path, SettingsManager};
pub use schema::{EngineSettings, LanecountSettings, LoggingSettings};
