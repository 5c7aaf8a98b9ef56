use crate::error::{RedirectorError, RedirectorResult};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]([A-Za-z0-9_-]*[A-Za-z0-9_])?(\.[A-Za-z0-9_]([A-Za-z0-9_-]*[A-Za-z0-9_])?)*\.?$")
        .expect("hostname pattern is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
    #[serde(default = "default_true")]
    pub prune_stale_blocks: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "pretty" or "compact"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

/// 虚拟主机的原始配置（未校验）
///
/// 策略与健康检查类型以字符串形式保留，未知类型只影响该虚拟主机，
/// 不会导致整个配置文件加载失败。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualHostSpec {
    pub hostname: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub backends: Vec<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub health_check: HealthCheckSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub port: Option<u16>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub path: Option<String>,
    pub scheme: Option<String>,
    pub expected_status: Option<Vec<String>>,
}

/// 已校验的虚拟主机配置，运行期间不可变
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualHostConfig {
    pub hostname: String,
    pub aliases: Vec<String>,
    pub backends: Vec<Backend>,
    pub health_check: HealthCheck,
    pub check_interval: Duration,
    pub failure_threshold: u32,
    pub strategy: StrategyKind,
}

impl VirtualHostConfig {
    /// 写入托管块的全部主机名（主名在前）
    pub fn published_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(1 + self.aliases.len());
        names.push(self.hostname.clone());
        names.extend(self.aliases.iter().cloned());
        names
    }
}

/// 健康检查方式
#[derive(Debug, Clone, PartialEq)]
pub enum HealthCheck {
    Tcp {
        port: Option<u16>,
        timeout: Duration,
    },
    Http {
        scheme: HttpScheme,
        port: Option<u16>,
        path: String,
        expected_status: Vec<StatusRange>,
        timeout: Duration,
    },
}

impl HealthCheck {
    /// 后端未指定端口时使用的端口
    pub fn default_port(&self) -> Option<u16> {
        match self {
            HealthCheck::Tcp { port, .. } => *port,
            HealthCheck::Http { scheme, port, .. } => Some(port.unwrap_or(scheme.default_port())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpScheme {
    Http,
    Https,
}

impl HttpScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpScheme::Http => "http",
            HttpScheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            HttpScheme::Http => 80,
            HttpScheme::Https => 443,
        }
    }
}

/// 期望的HTTP状态码区间（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRange {
    pub start: u16,
    pub end: u16,
}

impl StatusRange {
    pub fn contains(&self, status: u16) -> bool {
        self.start <= status && status <= self.end
    }
}

impl FromStr for StatusRange {
    type Err = RedirectorError;

    /// 支持 "204"、"200-299"、"2xx" 三种写法
    fn from_str(s: &str) -> RedirectorResult<Self> {
        let s = s.trim();
        let invalid = || RedirectorError::config(format!("invalid expected status '{}'", s));
        let code = |v: &str| -> RedirectorResult<u16> {
            v.parse::<u16>()
                .ok()
                .filter(|c| (100..=599).contains(c))
                .ok_or_else(invalid)
        };

        let range = if let Some(class) = s.strip_suffix("xx").or_else(|| s.strip_suffix("XX")) {
            let digit = class.parse::<u16>().ok().filter(|d| (1..=5).contains(d));
            let digit = digit.ok_or_else(invalid)?;
            StatusRange {
                start: digit * 100,
                end: digit * 100 + 99,
            }
        } else if let Some((start, end)) = s.split_once('-') {
            StatusRange {
                start: code(start.trim())?,
                end: code(end.trim())?,
            }
        } else {
            let c = code(s)?;
            StatusRange { start: c, end: c }
        };

        if range.start > range.end {
            return Err(invalid());
        }
        Ok(range)
    }
}

/// 后端选择策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Sequential,
    Random,
}

impl FromStr for StrategyKind {
    type Err = RedirectorError;

    fn from_str(s: &str) -> RedirectorResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(StrategyKind::Sequential),
            "random" => Ok(StrategyKind::Random),
            other => Err(RedirectorError::config(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

/// 后端地址：IP或可解析的主机名，端口可选
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    pub host: String,
    pub port: Option<u16>,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 主机部分是否为IP字面量
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// 用于URL的主机部分，IPv6地址加方括号
    pub fn url_host(&self) -> String {
        match self.ip() {
            Some(IpAddr::V6(v6)) => format!("[{}]", v6),
            _ => self.host.clone(),
        }
    }

    /// 解析为写入hosts文件的IP地址，优先IPv4
    pub async fn resolve(&self) -> RedirectorResult<IpAddr> {
        if let Some(ip) = self.ip() {
            return Ok(ip);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), 0))
            .await
            .map_err(|e| RedirectorError::Resolution {
                host: self.host.clone(),
                reason: e.to_string(),
            })?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| RedirectorError::Resolution {
                host: self.host.clone(),
                reason: "no addresses returned".to_string(),
            })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.url_host(), port),
            None => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for Backend {
    type Err = RedirectorError;

    /// 支持 "10.0.0.1"、"10.0.0.1:8080"、"db.internal"、"[::1]:80"、"::1"
    fn from_str(s: &str) -> RedirectorResult<Self> {
        let s = s.trim();
        let invalid = |why: &str| RedirectorError::config(format!("invalid backend address '{}': {}", s, why));
        let parse_port = |p: &str| -> RedirectorResult<u16> {
            p.parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid("bad port"))
        };

        if s.is_empty() {
            return Err(invalid("empty"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            let ip: std::net::Ipv6Addr = host.parse().map_err(|_| invalid("bad IPv6 address"))?;
            let port = match tail {
                "" => None,
                t => Some(parse_port(t.strip_prefix(':').ok_or_else(|| invalid("expected ':port'"))?)?),
            };
            return Ok(Backend::new(ip.to_string(), port));
        }

        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Backend::new(ip.to_string(), None));
        }

        let (host, port) = match s.split_once(':') {
            Some((host, port)) => (host, Some(parse_port(port)?)),
            None => (s, None),
        };

        if host.parse::<IpAddr>().is_err() && !HOSTNAME_RE.is_match(host) {
            return Err(invalid("not an IP address or hostname"));
        }

        Ok(Backend::new(host, port))
    }
}

impl VirtualHostSpec {
    /// 校验并生成不可变的虚拟主机配置
    pub fn validate(&self) -> RedirectorResult<VirtualHostConfig> {
        let name = &self.hostname;

        if !is_valid_hostname(name) {
            return Err(RedirectorError::config(format!(
                "invalid virtual host identifier '{}'",
                name
            )));
        }
        for alias in &self.aliases {
            if !is_valid_hostname(alias) {
                return Err(RedirectorError::config(format!(
                    "virtual host '{}' has invalid alias '{}'",
                    name, alias
                )));
            }
        }

        if self.backends.is_empty() {
            return Err(RedirectorError::config(format!(
                "virtual host '{}' must have at least one backend",
                name
            )));
        }
        let backends = self
            .backends
            .iter()
            .map(|b| b.parse::<Backend>())
            .collect::<RedirectorResult<Vec<_>>>()?;

        if self.interval_secs == 0 {
            return Err(RedirectorError::config(format!(
                "virtual host '{}' check interval must be at least 1 second",
                name
            )));
        }
        if self.failure_threshold == 0 {
            return Err(RedirectorError::config(format!(
                "virtual host '{}' failure threshold must be at least 1",
                name
            )));
        }

        let strategy = self.strategy.parse::<StrategyKind>()?;
        let health_check = self.health_check.validate()?;

        if health_check.default_port().is_none() && backends.iter().any(|b| b.port.is_none()) {
            return Err(RedirectorError::config(format!(
                "virtual host '{}' uses a TCP check without a port and a backend without one",
                name
            )));
        }

        Ok(VirtualHostConfig {
            hostname: name.clone(),
            aliases: self.aliases.clone(),
            backends,
            health_check,
            check_interval: Duration::from_secs(self.interval_secs),
            failure_threshold: self.failure_threshold,
            strategy,
        })
    }
}

impl HealthCheckSpec {
    pub fn validate(&self) -> RedirectorResult<HealthCheck> {
        if self.timeout_ms == 0 {
            return Err(RedirectorError::config("health check timeout must be positive"));
        }
        let timeout = Duration::from_millis(self.timeout_ms);

        match self.kind.to_ascii_lowercase().as_str() {
            "tcp" => Ok(HealthCheck::Tcp {
                port: self.port,
                timeout,
            }),
            "http" => {
                let scheme = match self.scheme.as_deref().map(str::to_ascii_lowercase).as_deref() {
                    None | Some("http") => HttpScheme::Http,
                    Some("https") => HttpScheme::Https,
                    Some(other) => {
                        return Err(RedirectorError::config(format!(
                            "unknown HTTP scheme '{}'",
                            other
                        )));
                    }
                };

                let path = self.path.clone().unwrap_or_else(|| "/".to_string());
                if !path.starts_with('/') {
                    return Err(RedirectorError::config(format!(
                        "health check path '{}' must start with '/'",
                        path
                    )));
                }

                let expected_status = match &self.expected_status {
                    Some(list) if !list.is_empty() => list
                        .iter()
                        .map(|s| s.parse::<StatusRange>())
                        .collect::<RedirectorResult<Vec<_>>>()?,
                    _ => vec![StatusRange { start: 200, end: 299 }],
                };

                Ok(HealthCheck::Http {
                    scheme,
                    port: self.port,
                    path,
                    expected_status,
                    timeout,
                })
            }
            other => Err(RedirectorError::config(format!(
                "unknown health check type '{}'",
                other
            ))),
        }
    }
}

pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && HOSTNAME_RE.is_match(name)
}

/// 校验全部虚拟主机；重复的标识符从第二次出现起视为配置错误
pub fn validate_virtual_hosts(
    specs: &[VirtualHostSpec],
) -> Vec<(String, RedirectorResult<VirtualHostConfig>)> {
    let mut seen = HashSet::new();
    specs
        .iter()
        .map(|spec| {
            let result = if seen.insert(spec.hostname.to_ascii_lowercase()) {
                spec.validate()
            } else {
                Err(RedirectorError::config(format!(
                    "duplicate virtual host identifier '{}'",
                    spec.hostname
                )))
            };
            (spec.hostname.clone(), result)
        })
        .collect()
}

pub struct ConfigManager {
    config: RwLock<Config>,
    file_path: PathBuf,
}

impl ConfigManager {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            config: RwLock::new(Config::default()),
            file_path: file_path.into(),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub async fn load(&self) -> Result<()> {
        let content = fs::read_to_string(&self.file_path)
            .await
            .with_context(|| format!("Failed to read config file: {}", self.file_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", self.file_path.display()))?;
        config.validate()?;

        *self.config.write().await = config;
        info!("Configuration loaded from {}", self.file_path.display());
        Ok(())
    }

    pub async fn reload(&self) -> Result<()> {
        info!("Reloading configuration...");
        self.load().await?;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    pub async fn get(&self) -> Config {
        self.config.read().await.clone()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts_file: default_hosts_file(),
            prune_stale_blocks: true,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            virtual_hosts: Vec::new(),
        }
    }
}

impl Config {
    /// 文件级校验；虚拟主机级的错误由Supervisor逐个处理
    pub fn validate(&self) -> Result<()> {
        if self.hosts_file.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("hosts_file cannot be empty"));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => return Err(anyhow::anyhow!("Unknown log format '{}'", other)),
        }

        if self.metrics.enabled {
            let path = self.metrics.path.trim_matches('/');
            if path.is_empty() {
                return Err(anyhow::anyhow!("Metrics path cannot be empty"));
            }
            if path.split('/').any(|segment| segment.is_empty()) {
                return Err(anyhow::anyhow!(
                    "Metrics path '{}' contains an empty segment",
                    self.metrics.path
                ));
            }
        }

        Ok(())
    }
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from(DEFAULT_HOSTS_FILE)
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9273))
}

fn default_metrics_path() -> String {
    "metrics".to_string()
}

fn default_interval_secs() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_strategy() -> String {
    "sequential".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}
