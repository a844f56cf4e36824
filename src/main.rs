mod cache;
mod codec;
mod config;
mod engine;
mod error;
mod listener;
mod persist;
mod registry;
mod rules;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::Engine;
use crate::listener::BoundListener;
use crate::registry::GroupRegistry;
use crate::rules::AddressRules;
use crate::transport::Transports;

#[derive(Parser, Debug)]
#[command(author, version, about = "KixFwd forwarding/caching DNS resolver", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/kixfwd.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 每个 UDP 监听端点的 worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = load_config(&args.config).context("load config")?;
    init_tracing(args.debug, &cfg.settings.log_level, cfg.settings.log_json);

    let registry = GroupRegistry::from_config(&cfg).context("build upstream groups")?;
    let rules = AddressRules::from_config(&cfg.address).context("compile address rules")?;
    let transport = Arc::new(Transports::new(&cfg.settings).context("init upstream transports")?);
    let groups: Vec<String> = registry.group_names().map(str::to_string).collect();
    let static_rules = !rules.is_empty();
    let engine = Engine::new(cfg.settings.clone(), registry, rules, transport);

    if cfg.settings.cache_persist {
        persist::restore(engine.cache(), &cfg.settings.cache_file);
    }

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    // bind everything before serving so a bad listener fails startup
    let mut bound = Vec::with_capacity(cfg.listeners.len());
    for listener in &cfg.listeners {
        bound.push(
            BoundListener::bind(listener, udp_workers)
                .with_context(|| format!("bind listener {}", listener.bind))?,
        );
    }
    let addrs: Vec<String> = bound.iter().map(|l| l.local_addr().to_string()).collect();
    let mut handles = Vec::new();
    for listener in bound {
        handles.extend(listener.spawn(engine.clone()));
    }

    info!(
        listeners = ?addrs,
        groups = ?groups,
        udp_workers,
        static_rules,
        dispatch = ?cfg.settings.dispatch,
        "dns forwarder started"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl_c")?;
    info!("shutdown requested");
    for handle in &handles {
        handle.abort();
    }

    if cfg.settings.cache_persist {
        let cache = engine.cache().clone();
        let path = cfg.settings.cache_file.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || persist::persist(&cache, &path)).await {
            error!(error = %err, "cache save task failed");
        }
    }
    info!(
        cached_entries = engine.cache().len(),
        metrics = %engine.metrics_snapshot(),
        "dns forwarder stopped"
    );
    Ok(())
}

fn init_tracing(debug: bool, level: &str, json: bool) {
    let level = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}
