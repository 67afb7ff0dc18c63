//! Configuration for Mailgate

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Virus scanner configuration
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Email authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// ClamAV scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Enable virus scanning
    #[serde(default)]
    pub enabled: bool,

    /// clamd socket address: `unix:/var/run/clamav/clamd.sock` or
    /// `tcp://127.0.0.1:3310`
    #[serde(default = "default_scanner_address")]
    pub address: String,

    /// Number of pooled connections
    #[serde(default = "default_connection_pool")]
    pub connection_pool: usize,

    /// Scan timeout in seconds
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,

    /// Maximum message size to scan in bytes; larger messages skip
    /// scanning and are treated as clean
    #[serde(default = "default_max_scan_size")]
    pub max_size: i64,

    /// Scan incoming messages
    #[serde(default = "default_scan_on_receive")]
    pub scan_on_receive: bool,

    /// Scan messages before final delivery
    #[serde(default)]
    pub scan_on_delivery: bool,

    /// Reject infected messages (orchestrator policy)
    #[serde(default = "default_reject_infected")]
    pub reject_infected: bool,

    /// Directory for quarantined messages (orchestrator policy)
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_scanner_address(),
            connection_pool: default_connection_pool(),
            timeout_secs: default_scan_timeout(),
            max_size: default_max_scan_size(),
            scan_on_receive: default_scan_on_receive(),
            scan_on_delivery: false,
            reject_infected: default_reject_infected(),
            quarantine_dir: default_quarantine_dir(),
        }
    }
}

fn default_scanner_address() -> String {
    "unix:/var/run/clamav/clamd.sock".to_string()
}

fn default_connection_pool() -> usize {
    5
}

fn default_scan_timeout() -> u64 {
    30
}

fn default_max_scan_size() -> i64 {
    25 * 1024 * 1024 // 25 MB
}

fn default_scan_on_receive() -> bool {
    true
}

fn default_reject_infected() -> bool {
    true
}

fn default_quarantine_dir() -> String {
    "/var/quarantine/mail".to_string()
}

/// Email authentication (SPF/DMARC) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// DNS lookup timeout in seconds
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,

    /// Maximum DNS-consuming mechanism evaluations per SPF check
    /// (RFC 7208 limit)
    #[serde(default = "default_max_dns_lookups")]
    pub max_dns_lookups: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dns_timeout_secs: default_dns_timeout(),
            max_dns_lookups: default_max_dns_lookups(),
        }
    }
}

fn default_dns_timeout() -> u64 {
    10
}

fn default_max_dns_lookups() -> usize {
    10
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/mailgate/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let scanner = ScannerConfig::default();
        assert!(!scanner.enabled);
        assert_eq!(scanner.connection_pool, 5);
        assert_eq!(scanner.max_size, 25 * 1024 * 1024);
        assert!(scanner.scan_on_receive);
        assert!(scanner.reject_infected);

        let auth = AuthConfig::default();
        assert_eq!(auth.dns_timeout_secs, 10);
        assert_eq!(auth.max_dns_lookups, 10);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[scanner]
enabled = true
address = "tcp://127.0.0.1:3310"
connection_pool = 2
timeout_secs = 10

[auth]
dns_timeout_secs = 5

[logging]
level = "debug"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.scanner.enabled);
        assert_eq!(config.scanner.address, "tcp://127.0.0.1:3310");
        assert_eq!(config.scanner.connection_pool, 2);
        assert_eq!(config.auth.dns_timeout_secs, 5);
        assert_eq!(config.auth.max_dns_lookups, 10);
        assert_eq!(config.logging.level, "debug");
    }
}
