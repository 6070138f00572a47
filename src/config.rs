use crate::priority::IoClass;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Timeout used when neither the command line nor the config file sets one.
pub const DEFAULT_TIMEOUT_SECS: u32 = 120;

/// Highest (least favorable) nice value on Linux and the BSDs.
pub const LOWEST_NICENESS: i32 = 19;

/// Top-level configuration, optionally loaded from a TOML file via `--config`.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct KeepaliveConfig {
    pub watchdog: WatchdogConfig,
    pub priority: PriorityConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub niceness: i32,
    pub io_class: IoClass,
    pub io_level: u8,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            niceness: LOWEST_NICENESS,
            io_class: IoClass::Idle,
            io_level: 0,
        }
    }
}

/// Errors that can occur while loading a config file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value parsed but is out of range.
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl KeepaliveConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: KeepaliveConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let niceness = self.priority.niceness;
        if !(-20..=LOWEST_NICENESS).contains(&niceness) {
            return Err(ConfigError::Invalid {
                field: "priority.niceness",
                reason: format!("{niceness} is outside -20..=19"),
            });
        }
        if self.priority.io_level > 7 {
            return Err(ConfigError::Invalid {
                field: "priority.io_level",
                reason: format!("{} is outside 0..=7", self.priority.io_level),
            });
        }
        Ok(())
    }

    /// Resolve the effective timeout: the positional argument wins over the config.
    pub fn resolve_timeout(&self, arg: Option<&str>) -> u32 {
        match arg {
            Some(raw) => parse_timeout_arg(raw),
            None => self.watchdog.timeout_secs,
        }
    }
}

/// Parse a timeout argument the way C's `atoi` does.
///
/// Leading whitespace is skipped, an optional sign is honored, and the longest
/// run of decimal digits is taken. Text with no leading digits yields 0. The
/// `int` result is reinterpreted as unsigned, so negative input wraps.
pub fn parse_timeout_arg(raw: &str) -> u32 {
    let s = raw.trim_start_matches([' ', '\t', '\n', '\r', '\x0b', '\x0c']);
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    // Accumulate with the sign applied so overflow clamps to i64::MIN or
    // i64::MAX, as strtol clamps to LONG_MIN or LONG_MAX.
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| {
            let digit = i64::from(d - b'0');
            if negative {
                acc.saturating_mul(10).saturating_sub(digit)
            } else {
                acc.saturating_mul(10).saturating_add(digit)
            }
        });

    // strtol's long result is narrowed to int, then the int is stored unsigned.
    value as i32 as u32
}
