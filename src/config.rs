use crate::error::{Result, VigilError};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Concurrency used when `CHECK_CONCURRENCY` is zero or negative
pub const DEFAULT_CHECK_CONCURRENCY: usize = 32;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Probe configuration
    pub checker: CheckerConfig,
    /// Meta-subscription selection
    pub selector: SelectorConfig,
    /// Where proxy descriptors come from
    pub source: SourceConfig,
    /// Where results are pushed
    pub publish: PublishConfig,
    /// Logging configuration
    pub log: LogConfig,
    /// Run a single check + publish cycle and exit
    pub run_once: bool,
}

/// How a proxy is judged healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckMethod {
    /// Egress IP seen through the tunnel differs from our own
    #[default]
    Ip,
    /// Target answers with a 2xx status
    Status,
    /// At least a minimum number of bytes can be downloaded
    Download,
}

impl CheckMethod {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ip" | "egress-ip" | "egress_ip" => Ok(Self::Ip),
            "status" | "gen" => Ok(Self::Status),
            "download" => Ok(Self::Download),
            other => Err(VigilError::UnsupportedCheckMethod(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Status => "status",
            Self::Download => "download",
        }
    }
}

impl std::fmt::Display for CheckMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub method: CheckMethod,
    /// URL returning the caller's public IP as plain text
    pub ip_check_url: String,
    /// URL expected to answer with a 2xx status
    pub status_check_url: String,
    /// URL of a payload of at least `download_min_size` bytes
    pub download_url: String,
    /// Timeout for ip/status probes
    pub timeout: Duration,
    /// Timeout for download probes
    pub download_timeout: Duration,
    /// Minimum number of bytes a download probe must receive
    pub download_min_size: u64,
    /// Maximum number of probes in flight
    pub concurrency: usize,
    /// Interval between check batches
    pub check_interval: Duration,
    /// Host the tunnel listeners are bound to
    pub tunnel_host: String,
    /// Port of the tunnel with index 0
    pub base_port: u16,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            method: CheckMethod::Ip,
            ip_check_url: "https://api.ipify.org?format=text".to_string(),
            status_check_url: "https://cp.cloudflare.com/generate_204".to_string(),
            download_url: String::new(),
            timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(60),
            download_min_size: 51_200,
            concurrency: DEFAULT_CHECK_CONCURRENCY,
            check_interval: Duration::from_secs(300),
            tunnel_host: "127.0.0.1".to_string(),
            base_port: 10000,
        }
    }
}

impl CheckerConfig {
    /// SOCKS5 endpoint of the tunnel with the given index
    pub fn tunnel_url(&self, index: u16) -> Result<String> {
        let port = self.base_port.checked_add(index).ok_or_else(|| {
            VigilError::InvalidConfig(format!(
                "tunnel port overflow: base {} + index {}",
                self.base_port, index
            ))
        })?;
        Ok(format!("socks5h://{}:{}", self.tunnel_host, port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Name marker of the first bucket (case-insensitive substring)
    pub bucket_a: String,
    /// Name marker of the second bucket (case-insensitive substring)
    pub bucket_b: String,
    pub quota_a: usize,
    pub quota_b: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            bucket_a: "BL".to_string(),
            bucket_b: "CIDR".to_string(),
            quota_a: 10,
            quota_b: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// JSON file with the current descriptor list
    pub proxies_file: PathBuf,
    /// How often to re-read `proxies_file` (None = never)
    pub refresh_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishConfig {
    /// Newline-joined published list
    pub output_file: Option<PathBuf>,
    /// Prometheus text exposition of status/latency gauges
    pub metrics_file: Option<PathBuf>,
    /// Value of the `instance` label on exported gauges (empty = no label)
    pub metrics_instance: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let checker = CheckerConfig {
            method: CheckMethod::parse(&get_env_or("CHECK_METHOD", "ip")).map_err(|e| {
                VigilError::InvalidConfig(format!("CHECK_METHOD: {}", e))
            })?,
            ip_check_url: parse_url("CHECK_IP_URL", "https://api.ipify.org?format=text")?,
            status_check_url: parse_url(
                "CHECK_STATUS_URL",
                "https://cp.cloudflare.com/generate_204",
            )?,
            download_url: parse_url("CHECK_DOWNLOAD_URL", "")?,
            timeout: Duration::from_secs(parse_number::<u64>("CHECK_TIMEOUT", "10")?.max(1)),
            download_timeout: Duration::from_secs(
                parse_number::<u64>("CHECK_DOWNLOAD_TIMEOUT", "60")?.max(1),
            ),
            download_min_size: parse_number("CHECK_DOWNLOAD_MIN_SIZE", "51200")?,
            concurrency: concurrency_or_default(parse_number("CHECK_CONCURRENCY", "32")?),
            check_interval: Duration::from_secs(parse_number::<u64>("CHECK_INTERVAL", "300")?.max(1)),
            tunnel_host: get_env_or("TUNNEL_HOST", "127.0.0.1"),
            base_port: get_env_or("TUNNEL_BASE_PORT", "10000").parse().map_err(|_| {
                VigilError::InvalidConfig("TUNNEL_BASE_PORT must be a valid port number".into())
            })?,
        };

        let selector = SelectorConfig {
            bucket_a: get_env_or("SELECTOR_BUCKET_A", "BL"),
            bucket_b: get_env_or("SELECTOR_BUCKET_B", "CIDR"),
            quota_a: parse_number("SELECTOR_QUOTA_A", "10")?,
            quota_b: parse_number("SELECTOR_QUOTA_B", "10")?,
        };
        if selector.bucket_a.trim().is_empty() || selector.bucket_b.trim().is_empty() {
            return Err(VigilError::InvalidConfig(
                "SELECTOR_BUCKET_A and SELECTOR_BUCKET_B must not be empty".into(),
            ));
        }

        let refresh_secs: u64 = parse_number("PROXIES_REFRESH_INTERVAL", "0")?;

        Ok(Config {
            checker,
            selector,
            source: SourceConfig {
                proxies_file: PathBuf::from(get_env_or("PROXIES_FILE", "proxies.json")),
                refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            },
            publish: PublishConfig {
                output_file: optional_path("PUBLISH_FILE"),
                metrics_file: optional_path("METRICS_FILE"),
                metrics_instance: get_env_or("METRICS_INSTANCE", "").trim().to_string(),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
            run_once: parse_bool("RUN_ONCE", "false")?,
        })
    }
}

fn concurrency_or_default(raw: i64) -> usize {
    if raw <= 0 {
        DEFAULT_CHECK_CONCURRENCY
    } else {
        usize::try_from(raw).unwrap_or(DEFAULT_CHECK_CONCURRENCY)
    }
}

fn parse_bool(key: &str, default: &str) -> Result<bool> {
    match get_env_or(key, default).trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(VigilError::InvalidConfig(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| VigilError::InvalidConfig(format!("{} must be a valid number", key)))
}

/// Empty values are allowed; the probe that needs the URL reports it.
fn parse_url(key: &str, default: &str) -> Result<String> {
    let raw = get_env_or(key, default).trim().to_string();
    if raw.is_empty() {
        return Ok(raw);
    }

    let url = Url::parse(&raw)
        .map_err(|e| VigilError::InvalidConfig(format!("{} must be a valid URL: {}", key, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(raw),
        other => Err(VigilError::InvalidConfig(format!(
            "{} has unsupported scheme: {}",
            key, other
        ))),
    }
}

fn optional_path(key: &str) -> Option<PathBuf> {
    let raw = env::var(key).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        None
    } else {
        Some(PathBuf::from(raw))
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "CHECK_METHOD",
        "CHECK_IP_URL",
        "CHECK_STATUS_URL",
        "CHECK_DOWNLOAD_URL",
        "CHECK_TIMEOUT",
        "CHECK_DOWNLOAD_TIMEOUT",
        "CHECK_DOWNLOAD_MIN_SIZE",
        "CHECK_CONCURRENCY",
        "CHECK_INTERVAL",
        "TUNNEL_HOST",
        "TUNNEL_BASE_PORT",
        "SELECTOR_BUCKET_A",
        "SELECTOR_BUCKET_B",
        "SELECTOR_QUOTA_A",
        "SELECTOR_QUOTA_B",
        "PROXIES_FILE",
        "PROXIES_REFRESH_INTERVAL",
        "PUBLISH_FILE",
        "METRICS_FILE",
        "METRICS_INSTANCE",
        "LOG_LEVEL",
        "LOG_FORMAT",
        "RUN_ONCE",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.checker.method, CheckMethod::Ip);
        assert_eq!(config.checker.concurrency, 32);
        assert_eq!(config.checker.base_port, 10000);
        assert_eq!(config.checker.timeout, Duration::from_secs(10));
        assert_eq!(config.checker.download_min_size, 51_200);
        assert!(config.checker.download_url.is_empty());

        assert_eq!(config.selector, SelectorConfig::default());
        assert_eq!(config.source.proxies_file, PathBuf::from("proxies.json"));
        assert!(config.source.refresh_interval.is_none());
        assert!(config.publish.output_file.is_none());
        assert!(config.publish.metrics_instance.is_empty());
        assert!(!config.run_once);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("CHECK_METHOD", "Download");
        env::set_var("CHECK_DOWNLOAD_URL", "https://speed.example/1mb.bin");
        env::set_var("CHECK_CONCURRENCY", "8");
        env::set_var("TUNNEL_BASE_PORT", "20000");
        env::set_var("SELECTOR_QUOTA_A", "5");
        env::set_var("PROXIES_REFRESH_INTERVAL", "60");
        env::set_var("PUBLISH_FILE", "/tmp/top.txt");
        env::set_var("METRICS_INSTANCE", "edge-1");
        env::set_var("RUN_ONCE", "true");

        let config = Config::from_env().unwrap();

        assert_eq!(config.checker.method, CheckMethod::Download);
        assert_eq!(config.checker.download_url, "https://speed.example/1mb.bin");
        assert_eq!(config.checker.concurrency, 8);
        assert_eq!(config.checker.base_port, 20000);
        assert_eq!(config.selector.quota_a, 5);
        assert_eq!(config.selector.quota_b, 10);
        assert_eq!(
            config.source.refresh_interval,
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.publish.output_file, Some(PathBuf::from("/tmp/top.txt")));
        assert_eq!(config.publish.metrics_instance, "edge-1");
        assert!(config.run_once);
    }

    #[test]
    fn test_config_rejects_unknown_check_method() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("CHECK_METHOD", "ping");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, VigilError::InvalidConfig(_)));
        assert!(err.to_string().contains("ping"));
    }

    #[test]
    fn test_check_method_parse() {
        assert_eq!(CheckMethod::parse("ip").unwrap(), CheckMethod::Ip);
        assert_eq!(CheckMethod::parse("Status").unwrap(), CheckMethod::Status);
        assert_eq!(CheckMethod::parse(" download ").unwrap(), CheckMethod::Download);
        assert!(matches!(
            CheckMethod::parse("ping"),
            Err(VigilError::UnsupportedCheckMethod(_))
        ));
        assert_eq!(CheckMethod::Download.to_string(), "download");
    }

    #[test]
    fn test_config_run_once_spellings() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        for value in ["1", "yes", "ON", "true"] {
            env::set_var("RUN_ONCE", value);
            assert!(Config::from_env().unwrap().run_once, "{value}");
        }
        for value in ["0", "no", "off", "false", ""] {
            env::set_var("RUN_ONCE", value);
            assert!(!Config::from_env().unwrap().run_once, "{value}");
        }

        env::set_var("RUN_ONCE", "maybe");
        assert!(matches!(
            Config::from_env(),
            Err(VigilError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_zero_timeouts_clamped() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("CHECK_TIMEOUT", "0");
        env::set_var("CHECK_DOWNLOAD_TIMEOUT", "0");
        let config = Config::from_env().unwrap();
        assert_eq!(config.checker.timeout, Duration::from_secs(1));
        assert_eq!(config.checker.download_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_config_non_positive_concurrency_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("CHECK_CONCURRENCY", "0");
        assert_eq!(Config::from_env().unwrap().checker.concurrency, 32);

        env::set_var("CHECK_CONCURRENCY", "-4");
        assert_eq!(Config::from_env().unwrap().checker.concurrency, 32);
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("TUNNEL_BASE_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, VigilError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_url() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("CHECK_STATUS_URL", "ftp://example.com/file");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, VigilError::InvalidConfig(_)));
    }

    #[test]
    fn test_tunnel_url() {
        let config = CheckerConfig {
            base_port: 10000,
            ..Default::default()
        };
        assert_eq!(config.tunnel_url(3).unwrap(), "socks5h://127.0.0.1:10003");

        let config = CheckerConfig {
            base_port: u16::MAX,
            ..Default::default()
        };
        assert!(matches!(
            config.tunnel_url(1),
            Err(VigilError::InvalidConfig(_))
        ));
    }
}
