//! Configuration tree (C13): `DaemonConfig` is loaded from a JSON file via `serde_json`,
//! following the teacher's `config.rs` loading pattern (platform-conditional `Default`, inline
//! commentary documenting *why* a default is what it is) extended with one sub-config per
//! SPEC_FULL.md component that needs tunables.

use serde::{Deserialize, Serialize};

use crate::acl::AclOrder;
use crate::clock::{ClockDriverConfig, ClockDriverKind};
use crate::port::PortConfig;
use crate::servo::DtMethod;
use crate::stats::{StatFilterKind, WindowType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub kp: f64,
    pub ki: f64,
    pub max_output_ppb: f64,
    pub dt_method: DtMethod,
    pub dt_constant: f64,
    pub max_dt: f64,
    pub stability_threshold: f64,
    pub stability_period: u32,
    pub stability_timeout: u32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: 0.0005,
            ki: 0.00005,
            max_output_ppb: 500_000.0,
            dt_method: DtMethod::Measured,
            dt_constant: 1.0,
            max_dt: 2.0,
            stability_threshold: 0.4,
            stability_period: 15,
            stability_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub kind: StatFilterKind,
    pub window_type: WindowType,
    pub window_size: usize,
    /// Peirce's-criterion rejection threshold; a sample more than this many estimated standard
    /// deviations from the running mean is treated as an outlier (see `stats::is_peirces_outlier`).
    pub peirce_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            kind: StatFilterKind::Mean,
            window_type: WindowType::Sliding,
            window_size: 8,
            peirce_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    pub order: AclOrder,
    pub permit: String,
    pub deny: String,
}

impl Default for AclConfig {
    fn default() -> Self {
        AclConfig { order: AclOrder::PermitDeny, permit: String::new(), deny: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `log`'s level filter strings ("error", "warn", "info", "debug", "trace"); passed to
    /// `env_logger::Builder::parse_filters` exactly as the teacher's `main.rs` does.
    pub level: String,
    /// When set, status/log output is additionally written to this path and rotated on a
    /// `LOGGING` lifecycle restart bit (C12); `None` logs to stderr only, matching the teacher's
    /// foreground default.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: "info".to_string(), file: None }
    }
}

/// One configured clock driver: a name (used for the frequency-persistence file and log
/// messages), which backend implementation to instantiate, and its tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockDriverEntry {
    pub name: String,
    pub kind: ClockDriverKind,
    /// `/dev/ptpN` for `ClockDriverKind::PhcClock`; ignored for `SystemClock` (there is exactly
    /// one system clock per host).
    pub device_path: Option<String>,
    #[serde(default)]
    pub config: ClockDriverConfig,
}

/// Root configuration tree, loaded whole from one JSON file. Every sub-section carries
/// `#[serde(default)]` so a config file needs only specify the fields it wants to override,
/// matching the teacher's `SystemConfig` partial-override philosophy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub port: PortConfig,
    pub clock_drivers: Vec<ClockDriverEntry>,
    pub servo: ServoConfig,
    pub filter: FilterConfig,
    pub acl: AclConfig,
    pub logging: LoggingConfig,
    /// Network interface to bind to; `None` selects the teacher's `get_default_interface()`
    /// heuristic (first up, non-loopback, preferably-wired interface).
    pub interface: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            port: PortConfig::default(),
            clock_drivers: vec![ClockDriverEntry {
                name: "system".to_string(),
                kind: ClockDriverKind::SystemClock,
                device_path: None,
                config: ClockDriverConfig::default(),
            }],
            servo: ServoConfig::default(),
            filter: FilterConfig::default(),
            acl: AclConfig::default(),
            logging: LoggingConfig::default(),
            interface: None,
        }
    }
}

impl DaemonConfig {
    /// Default config file search path per platform, matching the teacher's `main.rs::load_config`.
    pub fn default_path() -> &'static str {
        #[cfg(windows)]
        {
            r"C:\ProgramData\ptpdrs\config.json"
        }
        #[cfg(not(windows))]
        {
            "/etc/ptpdrs/config.json"
        }
    }

    /// Loads from `path`, falling back to `DaemonConfig::default()` if the file does not exist
    /// (a missing config is not an error — the daemon runs with documented defaults), but
    /// propagating parse errors since a malformed config the user *did* provide should not be
    /// silently ignored.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!("no config file at {}, using defaults", path.display());
            return Ok(DaemonConfig::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&data)?;
        Ok(config)
    }
}
