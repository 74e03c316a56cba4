//! Settings loading, saving, and environment variable interpolation.
//!
//! The `SettingsManager` handles:
//! - Loading settings from `~/.lanecount/settings.toml` or an explicit path
//! - Resolving `$VAR` and `${VAR}` references in string settings
//! - Atomic file writes with temp file + rename
//! - Template generation for `--init-settings`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use super::schema::LanecountSettings;

/// Embedded template for first-run generation.
const TEMPLATE: &str = include_str!("template.toml");

/// Get the path to the default settings file.
pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lanecount")
        .join("settings.toml")
}

/// Manages settings loading, interpolation, and persistence.
pub struct SettingsManager {
    /// Cached settings (with env vars resolved)
    settings: RwLock<LanecountSettings>,

    path: PathBuf,
}

impl SettingsManager {
    /// Load from the default location.
    pub async fn new() -> Result<Self> {
        Self::with_path(settings_path()).await
    }

    /// Load from a specific path. A missing file yields defaults.
    pub async fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Self::load_from_path(&path).await?;

        Ok(Self {
            settings: RwLock::new(settings),
            path,
        })
    }

    async fn load_from_path(path: &Path) -> Result<LanecountSettings> {
        if !path.exists() {
            tracing::debug!("Settings file not found at {:?}, using defaults", path);
            return Ok(LanecountSettings::default());
        }

        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read settings file {:?}", path))?;

        let mut settings: LanecountSettings =
            toml::from_str(&contents).context("Failed to deserialize settings")?;

        Self::resolve_env_vars(&mut settings);

        tracing::info!(
            "Loaded settings from {:?} ({} lanes, {} parking lots)",
            path,
            settings.lanes.len(),
            settings.parking_lots.len()
        );
        Ok(settings)
    }

    fn resolve_env_vars(settings: &mut LanecountSettings) {
        if let Some(filter) = &mut settings.logging.filter {
            if let Some(resolved) = resolve_env_ref(filter) {
                *filter = resolved;
            }
        }
    }

    /// Get the current settings (read-only).
    pub async fn get(&self) -> LanecountSettings {
        self.settings.read().await.clone()
    }

    /// Update settings and persist to disk.
    pub async fn update(&self, new_settings: LanecountSettings) -> Result<()> {
        *self.settings.write().await = new_settings.clone();

        let toml_string =
            toml::to_string_pretty(&new_settings).context("Failed to serialize settings")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("toml.tmp");
        tokio::fs::write(&temp_path, &toml_string).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        tracing::info!("Saved settings to {:?}", self.path);
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure settings file exists, creating from template if needed.
    ///
    /// Returns `true` if a new file was created.
    pub async fn ensure_settings_file(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&self.path, TEMPLATE).await?;
        tracing::info!("Generated settings template at {:?}", self.path);
        Ok(true)
    }
}

/// Resolve a $ENV_VAR or ${ENV_VAR} reference.
///
/// Returns `None` if the value is not a reference or the variable is unset.
fn resolve_env_ref(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let name = trimmed.strip_prefix('$')?;
    let name = name
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .unwrap_or(name);
    std::env::var(name).ok()
}

/// Get a setting value with environment variable fallback.
///
/// Priority order:
/// 1. Settings value (if set and non-empty)
/// 2. Environment variable (first non-empty match from list)
/// 3. Default value
pub fn get_with_env_fallback(
    setting: &Option<String>,
    env_vars: &[&str],
    default: Option<String>,
) -> Option<String> {
    if let Some(v) = setting {
        if !v.is_empty() {
            return Some(v.clone());
        }
    }

    for env_var in env_vars {
        if let Ok(v) = std::env::var(env_var) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }

    default
}
