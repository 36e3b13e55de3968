//! # courier-settings
//!
//! Policy values for the courier server and client: ports, timeouts, limits,
//! cache watermarks, logging. Resolution order, later wins:
//!
//! 1. compiled defaults ([`CourierSettings::default()`])
//! 2. `~/.courier/settings.json`, deep-merged over the defaults
//! 3. `COURIER_*` environment variables
//!
//! The result is checked for cross-field consistency before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<CourierSettings> = OnceLock::new();

/// Process-wide settings. The first call resolves them from the default
/// path; a file that fails to load falls back to compiled defaults.
pub fn get_settings() -> &'static CourierSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Install `settings` as the process-wide value, before anything calls
/// [`get_settings`]. Hands the value back if one is already installed.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: CourierSettings) -> std::result::Result<(), CourierSettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
