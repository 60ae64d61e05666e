//! Store limits and GC thresholds loaded from TOML.
//!
//! - `init_custom(toml_content)` installs a custom TOML before the first
//!   `settings()` call
//! - `settings()` returns `&'static Settings` (lazy-init singleton)
//! - Defaults are embedded via `include_str!("default_settings.toml")`

use std::sync::OnceLock;

use serde::Deserialize;

pub const DEFAULT_SETTINGS_TOML: &str = include_str!("default_settings.toml");

static CUSTOM_TOML: OnceLock<String> = OnceLock::new();

/// Set custom TOML before first `settings()` call.
pub fn init_custom(toml_content: String) -> Result<(), SettingsError> {
    parse_settings_toml(&toml_content)?;
    CUSTOM_TOML
        .set(toml_content)
        .map_err(|_| SettingsError::AlreadyInitialized)
}

/// Get or initialize the global settings singleton.
pub fn settings() -> &'static Settings {
    static INSTANCE: OnceLock<Settings> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        let toml_str = CUSTOM_TOML
            .get()
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_SETTINGS_TOML);
        parse_settings_toml(toml_str).expect("settings TOML must be valid")
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("TOML parse error: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("settings already initialized")]
    AlreadyInitialized,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    pub gc: GcSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Hard cap on distinct words; `addUnigramWord` fails past it.
    pub max_unigram_count: u32,
    /// Hard cap on bigram edges.
    pub max_bigram_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcSettings {
    /// Garbage-to-total byte ratio (percent) above which GC is requested.
    pub garbage_ratio_percent: u32,
    /// Stricter ratio used when the caller minds being blocked by GC.
    pub garbage_ratio_percent_minding_block: u32,
    /// Garbage volume below which the ratio is ignored; keeps small
    /// dictionaries from demanding GC after a handful of updates.
    pub min_garbage_bytes: usize,
    /// Buffer occupancy (bytes across all stores) that forces GC outright.
    pub max_body_bytes: usize,
}

fn parse_settings_toml(content: &str) -> Result<Settings, SettingsError> {
    let s: Settings = toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
    if s.gc.garbage_ratio_percent_minding_block > s.gc.garbage_ratio_percent {
        return Err(SettingsError::InvalidValue {
            field: "gc.garbage_ratio_percent_minding_block".to_string(),
            reason: "must not exceed gc.garbage_ratio_percent".to_string(),
        });
    }
    if s.store.max_unigram_count == 0 {
        return Err(SettingsError::InvalidValue {
            field: "store.max_unigram_count".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(s)
}
