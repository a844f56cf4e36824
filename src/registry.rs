use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::config::{Config, DEFAULT_GROUP, Protocol};
use crate::error::ConfigError;

/// One configured upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamSpec {
    pub group: Arc<str>,
    pub kind: Protocol,
    pub addr: SocketAddr,
    pub skip_cert_verify: bool,
    pub tls_name: Option<Arc<str>>,
}

impl UpstreamSpec {
    pub fn new(group: &str, kind: Protocol, addr: SocketAddr) -> Self {
        Self {
            group: Arc::from(group),
            kind,
            addr,
            skip_cert_verify: false,
            tls_name: None,
        }
    }

    /// Label used in logs, e.g. `tls://127.0.0.1:853`.
    pub fn label(&self) -> String {
        format!("{}://{}", self.kind.as_str(), self.addr)
    }
}

/// Group name -> ordered upstream set. Fixed after startup.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<Arc<str>, Vec<UpstreamSpec>>,
}

impl GroupRegistry {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for up in &cfg.upstreams {
            let mut spec = UpstreamSpec::new(up.group_name(), up.transport, up.socket_addr()?);
            spec.skip_cert_verify = up.skip_cert_verify;
            spec.tls_name = up.tls_name.as_deref().map(Arc::from);
            registry.register(spec);
        }

        // 监听端点引用的分组必须存在上游，启动时即失败。
        for listener in &cfg.listeners {
            let group = listener.group_name();
            if registry.groups.get(group).is_none_or(|g| g.is_empty()) {
                return Err(ConfigError::EmptyGroup(group.to_string()));
            }
        }

        for (name, ups) in &registry.groups {
            info!(target = "registry", group = %name, upstreams = ups.len(), "group registered");
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: UpstreamSpec) {
        self.groups.entry(spec.group.clone()).or_default().push(spec);
    }

    /// Upstreams for `group`; unknown or absent groups use the default group.
    pub fn resolve(&self, group: Option<&str>) -> Result<&[UpstreamSpec], ConfigError> {
        let name = group.unwrap_or(DEFAULT_GROUP);
        let ups = match self.groups.get(name) {
            Some(ups) => ups,
            None => self
                .groups
                .get(DEFAULT_GROUP)
                .ok_or_else(|| ConfigError::EmptyGroup(name.to_string()))?,
        };
        if ups.is_empty() {
            return Err(ConfigError::EmptyGroup(name.to_string()));
        }
        Ok(ups)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|k| k.as_ref())
    }
}
