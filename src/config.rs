use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// 监听端点，每个端点可绑定分组与网卡。
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// 上游服务器，按注册顺序决定组内优先级。
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    /// 静态地址规则（域名后缀 -> IP）。
    #[serde(default)]
    pub address: Vec<AddressRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// 单个上游超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// 整个查询的超时（毫秒），缺省按上游数量推算。
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
    #[serde(default)]
    pub dispatch: DispatchPolicy,
    /// 缓存最大条目数。
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// 最小TTL秒数，缺省0。
    #[serde(default)]
    pub min_ttl: u32,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
    /// 无记录的否定应答缓存时长。
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u32,
    /// Caps TTLs of answers served straight from upstream.
    #[serde(default)]
    pub miss_reply_ttl: Option<u32>,
    #[serde(default)]
    pub cache_persist: bool,
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
    /// UDP 上游套接字池大小。
    #[serde(default = "default_udp_pool_size")]
    pub udp_pool_size: usize,
    /// TCP/TLS 每个上游的连接数。
    #[serde(default = "default_tcp_pool_size")]
    pub tcp_pool_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            upstream_timeout_ms: default_upstream_timeout_ms(),
            query_timeout_ms: None,
            dispatch: DispatchPolicy::default(),
            cache_size: default_cache_size(),
            min_ttl: 0,
            max_ttl: default_max_ttl(),
            negative_ttl: default_negative_ttl(),
            miss_reply_ttl: None,
            cache_persist: false,
            cache_file: default_cache_file(),
            udp_pool_size: default_udp_pool_size(),
            tcp_pool_size: default_tcp_pool_size(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl GlobalSettings {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Total budget for one resolution across `upstreams` servers.
    pub fn query_timeout(&self, upstreams: usize) -> Duration {
        if let Some(ms) = self.query_timeout_ms {
            return Duration::from_millis(ms);
        }
        let per = self.upstream_timeout();
        let rounds = match self.dispatch {
            DispatchPolicy::Parallel => 1,
            DispatchPolicy::Sequential => upstreams.max(1) as u32,
        };
        per * rounds + Duration::from_millis(200)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// 同时向组内所有上游发起查询，取第一个有效应答。
    #[default]
    Parallel,
    /// 按注册顺序逐个尝试。
    Sequential,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => 53,
            Protocol::Tls => 853,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// 监听地址，支持 `addr@device` 形式指定网卡。
    pub bind: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl ListenerConfig {
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(DEFAULT_GROUP)
    }

    /// Bind address and device; an explicit `device` wins over the `@` suffix.
    pub fn endpoint(&self) -> Result<(SocketAddr, Option<String>), ConfigError> {
        let (addr, device) = parse_bind(&self.bind)?;
        Ok((addr, self.device.clone().or(device)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// `ip` 或 `ip:port`，缺省端口随传输方式而定。
    pub addr: String,
    #[serde(default)]
    pub transport: Protocol,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub skip_cert_verify: bool,
    /// TLS 证书校验使用的服务器名，缺省为 IP。
    #[serde(default)]
    pub tls_name: Option<String>,
}

impl UpstreamConfig {
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(DEFAULT_GROUP)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_upstream_addr(&self.addr, self.transport.default_port())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddressRuleConfig {
    pub domain: String,
    /// 为空表示屏蔽（返回 NXDOMAIN）。
    #[serde(default)]
    pub ips: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    validate(&cfg).with_context(|| format!("validate config file: {}", path.display()))?;
    Ok(cfg)
}

/// 轻量校验：地址提前解析，便于启动时快速失败。
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.listeners.is_empty() {
        return Err(ConfigError::NoListeners);
    }
    for listener in &cfg.listeners {
        listener.endpoint()?;
    }
    for upstream in &cfg.upstreams {
        upstream.socket_addr()?;
    }
    for rule in &cfg.address {
        for ip in &rule.ips {
            ip.parse::<IpAddr>().map_err(|e| ConfigError::InvalidRule {
                domain: rule.domain.clone(),
                reason: format!("{ip}: {e}"),
            })?;
        }
    }
    Ok(())
}

pub fn parse_bind(bind: &str) -> Result<(SocketAddr, Option<String>), ConfigError> {
    let (addr, device) = match bind.rsplit_once('@') {
        Some((addr, dev)) if !dev.is_empty() => (addr, Some(dev.to_string())),
        Some((addr, _)) => (addr, None),
        None => (bind, None),
    };
    let addr = addr
        .trim()
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidAddress {
            value: bind.to_string(),
            reason: e.to_string(),
        })?;
    Ok((addr, device))
}

pub fn parse_upstream_addr(value: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let bare = value.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|e| ConfigError::InvalidAddress {
            value: value.to_string(),
            reason: e.to_string(),
        })
}


fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_cache_size() -> u64 {
    10_000
}

fn default_max_ttl() -> u32 {
    86_400
}

fn default_negative_ttl() -> u32 {
    60
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("kixfwd.cache.json")
}

fn default_udp_pool_size() -> usize {
    16
}

fn default_tcp_pool_size() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}
