use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

const DEFAULT_LOG_MAX_LINES: usize = 1000;

pub(crate) fn log_max_lines() -> usize {
    env_usize("KILN_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

pub(crate) fn stop_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("KILN_STOP_POLL_INTERVAL_MS")
            .map(|v| v.clamp(50, 10_000))
            .unwrap_or(250),
    )
}

pub(crate) fn stop_poll_timeout() -> Duration {
    Duration::from_millis(
        env_u64("KILN_STOP_POLL_TIMEOUT_MS")
            .map(|v| v.clamp(1000, 10 * 60 * 1000))
            .unwrap_or(15_000),
    )
}

/// Installation root holding the compose document, the template cache and
/// the per-workload folders. An explicit context value: construct once
/// (from `KILN_DATA_ROOT` or a test directory) and pass it around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    root: PathBuf,
}

impl InstallPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn from_env() -> Self {
        let raw = std::env::var("KILN_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
        let p = PathBuf::from(raw);
        let root = if p.is_absolute() {
            p
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(p)
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compose_path(&self) -> PathBuf {
        self.root.join("docker-compose.yml")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn workloads_dir(&self) -> PathBuf {
        self.root.join("workloads")
    }

    pub fn workload_dir(&self, name: &str) -> PathBuf {
        self.workloads_dir().join(name)
    }

    pub fn shared_models_dir(&self) -> PathBuf {
        self.root.join("shared_models")
    }

    pub fn provisioned_marker(&self) -> PathBuf {
        // Dot prefix keeps the marker hidden on unix-likes.
        self.root.join(".provisioned")
    }
}

/// Keep workload names safe for filesystem paths and compose service keys.
pub fn normalize_workload_name(name: &str) -> anyhow::Result<String> {
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("workload name must be non-empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        anyhow::bail!("invalid workload name: {name}");
    }
    // "." and ".." pass the character filter but resolve outside the
    // workloads dir.
    if !name.chars().any(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!("invalid workload name: {name}");
    }
    Ok(name.to_string())
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Atomic-ish write: same-path overwrite via temp file + rename. One local
/// desktop process, no concurrent writers, so this is sufficient.
pub(crate) async fn write_file_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}
