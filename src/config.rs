//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `ECHONET_EXPORTER_LISTEN`,
//!    `ECHONET_EXPORTER_DEVICE`, `ECHONET_EXPORTER_RBID`,
//!    `ECHONET_EXPORTER_PWD`
//! 2. **Config file** — path via `--config <path>`, or
//!    `echonet-exporter.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:9493"
//! max_connections = 10
//!
//! [wisun]
//! device = "/dev/ttyUSB0"
//! baud = 115200
//! rbid = "00112233445566778899AABBCCDDEEFF"
//! pwd = "0123456789AB"
//! scan_channel_mask = 0xFFFFFFFF
//! scan_duration = 6
//! recv_timeout_ms = 5000
//!
//! [meter]
//! target = { class_group = 0x02, class_code = 0x88, instance = 0x01 }
//!
//! [[meter.measures]]
//! name = "instantaneous_power"
//! help = "Instantaneous electric power in watts."
//! epc = 0xE7
//! layout = [ { name = "echonet_instantaneous_power_watts", type = "i32" } ]
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::echonet::{Eoj, FieldLayout};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub wisun: WisunConfig,
    #[serde(default)]
    pub meter: MeterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:9493`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections (default 10).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Serial device and B-route link settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WisunConfig {
    /// Serial device of the SK modem (default `/dev/ttyUSB0`).
    /// Override with `ECHONET_EXPORTER_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate (default 115200).
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Route-B ID, 32 hex chars. Override with `ECHONET_EXPORTER_RBID`.
    /// Must be configured together with `pwd`.
    pub rbid: Option<String>,
    /// Route-B password, ASCII. Override with `ECHONET_EXPORTER_PWD`.
    pub pwd: Option<String>,
    /// Channel mask for the active scan (default all channels).
    #[serde(default = "default_scan_channel_mask")]
    pub scan_channel_mask: u32,
    /// Scan duration exponent (default 6).
    #[serde(default = "default_scan_duration")]
    pub scan_duration: u8,
    /// Per-receive deadline in milliseconds (default 5000).
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: i32,
}

/// Target object and the measures read from it.
#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    /// ECHONET object queried each scrape (default the low-voltage smart
    /// meter, `02 88 01`).
    #[serde(default = "default_target")]
    pub target: Eoj,
    /// Properties to request and how to export them.
    #[serde(default = "default_measures")]
    pub measures: Vec<Measure>,
}

/// One scraped property: which EPC to get and the fields in its EDT.
#[derive(Debug, Clone, Deserialize)]
pub struct Measure {
    /// Human label, used in logs.
    pub name: String,
    /// HELP text shared by this measure's exported fields.
    pub help: Option<String>,
    /// Property code to request.
    pub epc: u8,
    /// Typed fields at the head of the EDT, in order.
    pub layout: Vec<FieldLayout>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9493".to_string()
}
fn default_max_connections() -> usize {
    10
}
fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_scan_channel_mask() -> u32 {
    0xFFFF_FFFF
}
fn default_scan_duration() -> u8 {
    6
}
fn default_recv_timeout_ms() -> i32 {
    5000
}
fn default_target() -> Eoj {
    Eoj {
        class_group: 0x02,
        class_code: 0x88,
        instance: 0x01,
    }
}
fn default_measures() -> Vec<Measure> {
    vec![Measure {
        name: "instantaneous_power".to_string(),
        help: Some("Instantaneous electric power in watts.".to_string()),
        epc: 0xE7,
        layout: vec![FieldLayout {
            name: "echonet_instantaneous_power_watts".to_string(),
            kind: crate::echonet::FieldKind::I32,
        }],
    }]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for WisunConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
            rbid: None,
            pwd: None,
            scan_channel_mask: default_scan_channel_mask(),
            scan_duration: default_scan_duration(),
            recv_timeout_ms: default_recv_timeout_ms(),
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            measures: default_measures(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Valid exposition metric name: `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `echonet-exporter.toml` in the current directory, falling
    /// back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("echonet-exporter.toml").exists() {
            let content = std::fs::read_to_string("echonet-exporter.toml")
                .expect("Failed to read echonet-exporter.toml");
            toml::from_str(&content).expect("Failed to parse echonet-exporter.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                wisun: WisunConfig::default(),
                meter: MeterConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("ECHONET_EXPORTER_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(device) = std::env::var("ECHONET_EXPORTER_DEVICE") {
            config.wisun.device = device;
        }
        if let Ok(rbid) = std::env::var("ECHONET_EXPORTER_RBID") {
            config.wisun.rbid = Some(rbid);
        }
        if let Ok(pwd) = std::env::var("ECHONET_EXPORTER_PWD") {
            config.wisun.pwd = Some(pwd);
        }

        config
    }

    /// Check invariants the structs alone cannot express. Returns one
    /// message per problem; empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match (&self.wisun.rbid, &self.wisun.pwd) {
            (Some(rbid), Some(pwd)) => {
                if rbid.len() != 32 || !rbid.bytes().all(|b| b.is_ascii_hexdigit()) {
                    errors.push("wisun.rbid must be exactly 32 hex characters".to_string());
                }
                if pwd.is_empty() || pwd.len() > 32 || !pwd.is_ascii() {
                    errors.push("wisun.pwd must be 1-32 ASCII characters".to_string());
                }
            }
            (None, None) => {}
            _ => errors
                .push("wisun.rbid and wisun.pwd must be configured together".to_string()),
        }

        if self.wisun.scan_duration > 14 {
            errors.push("wisun.scan_duration must be at most 14".to_string());
        }

        if self.meter.measures.is_empty() {
            errors.push("meter.measures must not be empty".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for measure in &self.meter.measures {
            if measure.layout.is_empty() {
                errors.push(format!("measure {} has an empty layout", measure.name));
            }
            for field in &measure.layout {
                if !is_valid_metric_name(&field.name) {
                    errors.push(format!("invalid metric name {:?}", field.name));
                }
                if !seen.insert(field.name.clone()) {
                    errors.push(format!("duplicate metric name {:?}", field.name));
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::load(None);
        assert_eq!(config.server.listen, "0.0.0.0:9493");
        assert_eq!(config.wisun.baud, 115_200);
        assert_eq!(config.wisun.scan_channel_mask, 0xFFFF_FFFF);
        assert_eq!(config.wisun.recv_timeout_ms, 5000);
        assert_eq!(config.meter.target.class_group, 0x02);
        assert_eq!(config.meter.measures.len(), 1);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:8080"

            [wisun]
            device = "/dev/ttyS1"
            rbid = "00112233445566778899AABBCCDDEEFF"
            pwd = "0123456789AB"
            scan_duration = 7

            [meter]
            target = { class_group = 0x02, class_code = 0x88, instance = 0x01 }

            [[meter.measures]]
            name = "currents"
            epc = 0xE8
            layout = [
                { name = "echonet_current_r_deciamps", type = "i16" },
                { name = "echonet_current_t_deciamps", type = "i16" },
            ]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.wisun.device, "/dev/ttyS1");
        assert_eq!(config.wisun.scan_duration, 7);
        assert_eq!(config.wisun.baud, 115_200); // default fills in
        assert_eq!(config.meter.measures[0].epc, 0xE8);
        assert_eq!(config.meter.measures[0].layout.len(), 2);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_rejects_lone_rbid() {
        let mut config = Config::load(None);
        config.wisun.rbid = Some("00112233445566778899AABBCCDDEEFF".into());
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_validate_rejects_short_rbid() {
        let mut config = Config::load(None);
        config.wisun.rbid = Some("0011".into());
        config.wisun.pwd = Some("secret".into());
        assert!(config.validate().iter().any(|e| e.contains("rbid")));
    }

    #[test]
    fn test_validate_rejects_empty_measures() {
        let mut config = Config::load(None);
        config.meter.measures.clear();
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_metric_name() {
        let mut config = Config::load(None);
        config.meter.measures[0].layout[0].name = "9starts_with_digit".into();
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("invalid metric name")));
    }

    #[test]
    fn test_validate_rejects_duplicate_metric_names() {
        let mut config = Config::load(None);
        let dup = config.meter.measures[0].clone();
        config.meter.measures.push(dup);
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("duplicate metric name")));
    }
}
