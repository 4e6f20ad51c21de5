//! # lchat-settings
//!
//! Layered configuration for the chat client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ChatSettings::default()`]
//! 2. **User file**: `~/.lchat/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LCHAT_*` overrides (highest priority)
//!
//! There is no global instance; the loaded value is passed explicitly to
//! whatever needs it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{ChatSettings, DEFAULT_HUB_URL};
