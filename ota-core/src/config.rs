//! Device configuration loaded from `key = value` text.
//!
//! Blank lines and lines starting with `#` are ignored. Keys are dotted
//! identifiers; values run to the end of the line with surrounding whitespace
//! trimmed. Network credentials and the update-service host name are
//! mandatory: a device without them has no way to receive a fix.

use core::fmt;

use heapless::String;
use winnow::ascii::{dec_uint, space0};
use winnow::error::{ContextError, ModalResult};
use winnow::prelude::*;
use winnow::token::{rest, take_while};

use crate::coordinator::{CoordinatorSettings, DEFAULT_PROBATION_BOOTS, MAX_PROBATION_BOOTS};
use crate::transfer::{DEFAULT_SERVICE_PORT, MAX_HOSTNAME_LEN, MAX_SECRET_LEN, ServiceIdentity};

/// Maximum network name length.
pub const MAX_SSID_LEN: usize = 32;
/// Maximum log collector host length.
pub const MAX_LOG_HOST_LEN: usize = 64;
/// Maximum firmware version label length.
pub const MAX_VERSION_LEN: usize = 32;
/// Default port of the remote log collector.
pub const DEFAULT_LOG_PORT: u16 = 9000;

/// Recognized configuration keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigKey {
    WifiSsid,
    WifiPassphrase,
    OtaHostname,
    OtaPassword,
    OtaPort,
    LogHost,
    LogPort,
    ProbationBoots,
    FirmwareVersion,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 9] = [
        ConfigKey::WifiSsid,
        ConfigKey::WifiPassphrase,
        ConfigKey::OtaHostname,
        ConfigKey::OtaPassword,
        ConfigKey::OtaPort,
        ConfigKey::LogHost,
        ConfigKey::LogPort,
        ConfigKey::ProbationBoots,
        ConfigKey::FirmwareVersion,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConfigKey::WifiSsid => "wifi.ssid",
            ConfigKey::WifiPassphrase => "wifi.passphrase",
            ConfigKey::OtaHostname => "ota.hostname",
            ConfigKey::OtaPassword => "ota.password",
            ConfigKey::OtaPort => "ota.port",
            ConfigKey::LogHost => "log.host",
            ConfigKey::LogPort => "log.port",
            ConfigKey::ProbationBoots => "probation.boots",
            ConfigKey::FirmwareVersion => "firmware.version",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration errors. Line numbers start at 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// Line is neither a comment nor a `key = value` entry.
    Syntax { line: usize },
    UnknownKey { line: usize },
    InvalidValue { line: usize, key: ConfigKey },
    TooLong { line: usize, key: ConfigKey },
    /// Required key absent or empty.
    Missing(ConfigKey),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Syntax { line } => write!(f, "line {line}: expected `key = value`"),
            ConfigError::UnknownKey { line } => write!(f, "line {line}: unknown key"),
            ConfigError::InvalidValue { line, key } => {
                write!(f, "line {line}: invalid value for {key}")
            }
            ConfigError::TooLong { line, key } => write!(f, "line {line}: {key} is too long"),
            ConfigError::Missing(key) => write!(f, "missing required key {key}"),
        }
    }
}

/// Parsed device configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceConfig {
    pub wifi_ssid: String<MAX_SSID_LEN>,
    pub wifi_passphrase: String<MAX_SECRET_LEN>,
    pub ota_hostname: String<MAX_HOSTNAME_LEN>,
    pub ota_password: Option<String<MAX_SECRET_LEN>>,
    pub ota_port: u16,
    pub log_host: Option<String<MAX_LOG_HOST_LEN>>,
    pub log_port: u16,
    pub probation_boots: u8,
    pub firmware_version: Option<String<MAX_VERSION_LEN>>,
}

impl DeviceConfig {
    /// Parses configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut wifi_ssid = None;
        let mut wifi_passphrase = None;
        let mut ota_hostname = None;
        let mut ota_password = None;
        let mut ota_port = DEFAULT_SERVICE_PORT;
        let mut log_host = None;
        let mut log_port = DEFAULT_LOG_PORT;
        let mut probation_boots = DEFAULT_PROBATION_BOOTS;
        let mut firmware_version = None;

        for (index, raw_line) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (name, value) = entry
                .parse(trimmed)
                .map_err(|_| ConfigError::Syntax { line })?;
            let key = ConfigKey::from_name(name).ok_or(ConfigError::UnknownKey { line })?;

            match key {
                ConfigKey::WifiSsid => wifi_ssid = Some(text_value(value, line, key)?),
                ConfigKey::WifiPassphrase => wifi_passphrase = Some(text_value(value, line, key)?),
                ConfigKey::OtaHostname => ota_hostname = Some(text_value(value, line, key)?),
                ConfigKey::OtaPassword => ota_password = optional_text(value, line, key)?,
                ConfigKey::OtaPort => ota_port = port_value(value, line, key)?,
                ConfigKey::LogHost => log_host = optional_text(value, line, key)?,
                ConfigKey::LogPort => log_port = port_value(value, line, key)?,
                ConfigKey::ProbationBoots => {
                    probation_boots = dec_uint::<_, u8, ContextError>
                        .parse(value)
                        .ok()
                        .filter(|boots| (1..=MAX_PROBATION_BOOTS).contains(boots))
                        .ok_or(ConfigError::InvalidValue { line, key })?;
                }
                ConfigKey::FirmwareVersion => firmware_version = optional_text(value, line, key)?,
            }
        }

        Ok(Self {
            wifi_ssid: required(wifi_ssid, ConfigKey::WifiSsid)?,
            wifi_passphrase: required(wifi_passphrase, ConfigKey::WifiPassphrase)?,
            ota_hostname: required(ota_hostname, ConfigKey::OtaHostname)?,
            ota_password,
            ota_port,
            log_host,
            log_port,
            probation_boots,
            firmware_version,
        })
    }

    /// Identity the update service advertises.
    #[must_use]
    pub fn service_identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            hostname: self.ota_hostname.clone(),
            password: self.ota_password.clone(),
            port: self.ota_port,
        }
    }

    #[must_use]
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            probation_boots: self.probation_boots,
            identity: self.service_identity(),
        }
    }
}

fn entry<'a>(input: &mut &'a str) -> ModalResult<(&'a str, &'a str)> {
    let key = take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || c == '.' || c == '_'
    })
    .parse_next(input)?;
    (space0, '=', space0).parse_next(input)?;
    let value = rest.parse_next(input)?;
    Ok((key, value.trim_end()))
}

fn text_value<const N: usize>(
    value: &str,
    line: usize,
    key: ConfigKey,
) -> Result<String<N>, ConfigError> {
    String::try_from(value).map_err(|_| ConfigError::TooLong { line, key })
}

fn optional_text<const N: usize>(
    value: &str,
    line: usize,
    key: ConfigKey,
) -> Result<Option<String<N>>, ConfigError> {
    if value.is_empty() {
        return Ok(None);
    }
    text_value(value, line, key).map(Some)
}

fn port_value(value: &str, line: usize, key: ConfigKey) -> Result<u16, ConfigError> {
    dec_uint::<_, u16, ContextError>
        .parse(value)
        .ok()
        .filter(|port| *port != 0)
        .ok_or(ConfigError::InvalidValue { line, key })
}

fn required<const N: usize>(
    value: Option<String<N>>,
    key: ConfigKey,
) -> Result<String<N>, ConfigError> {
    value
        .filter(|text| !text.is_empty())
        .ok_or(ConfigError::Missing(key))
}
