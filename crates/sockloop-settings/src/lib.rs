//! # sockloop-settings
//!
//! Configuration management with layered sources for sockloop.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SockloopSettings::default()`]
//! 2. **User file**: `~/.sockloop/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SOCKLOOP_*` overrides (highest priority)
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = SockloopSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = SockloopSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.offload.pool_size, 2);
        assert_eq!(settings.offload.long_request_delay_ms, 4000);
    }
}
