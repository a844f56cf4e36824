use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{PersistedEntry, RecordCache};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<PersistedEntry>,
}

pub fn load_all(path: &Path) -> Result<Vec<PersistedEntry>> {
    let raw = fs::read(path).with_context(|| format!("read cache file: {}", path.display()))?;
    let file: CacheFile =
        serde_json::from_slice(&raw).with_context(|| format!("parse cache file: {}", path.display()))?;
    anyhow::ensure!(
        file.version == FORMAT_VERSION,
        "unsupported cache file version {}",
        file.version
    );
    Ok(file.entries)
}

/// Writes to a sibling temp file first so a crash never leaves a torn file.
pub fn save_all(path: &Path, entries: Vec<PersistedEntry>) -> Result<()> {
    let file = CacheFile {
        version: FORMAT_VERSION,
        entries,
    };
    let raw = serde_json::to_vec(&file).context("serialize cache")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, raw).with_context(|| format!("write cache file: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename cache file: {}", path.display()))?;
    Ok(())
}

/// 启动时恢复缓存；文件缺失视为空缓存，解析失败则清空缓存继续运行。
pub fn restore(cache: &RecordCache, path: &Path) {
    if !path.exists() {
        return;
    }
    match load_all(path).and_then(|entries| cache.import(entries)) {
        Ok(restored) => info!(target = "persist", path = %path.display(), restored, "cache restored"),
        Err(err) => {
            cache.clear();
            warn!(target = "persist", path = %path.display(), error = %err, "cache restore failed, starting empty");
        }
    }
}

pub fn persist(cache: &RecordCache, path: &Path) {
    let entries = cache.export();
    let count = entries.len();
    match save_all(path, entries) {
        Ok(()) => info!(target = "persist", path = %path.display(), entries = count, "cache saved"),
        Err(err) => warn!(target = "persist", path = %path.display(), error = %err, "cache save failed"),
    }
}
