//! Device configuration bundled into the image at build time.

use ota_core::config::{ConfigError, DeviceConfig};

/// Configuration text compiled into the firmware.
pub const BUNDLED_CONFIG: &str = include_str!("../device.conf");

/// Parses the bundled configuration.
pub fn load() -> Result<DeviceConfig, ConfigError> {
    DeviceConfig::parse(BUNDLED_CONFIG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_config_parses() {
        let config = load().expect("bundled config is valid");
        assert_eq!(config.ota_hostname.as_str(), "ota-guard");
        assert_eq!(config.ota_port, 3232);
        assert_eq!(config.probation_boots, 3);
        assert!(config.ota_password.is_some());
    }
}
