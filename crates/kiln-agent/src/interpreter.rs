use std::path::{Path, PathBuf};

use tokio::process::Command;

/// A resolved interpreter plus how it was found. The embedded runtime is
/// preferred; the system one is the fallback used when no bundled runtime
/// sits next to the workload root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInterpreter {
    pub path: PathBuf,
    pub embedded: bool,
}

/// Plausible bundled interpreter locations, derived from sibling
/// directories of the workload root, ranked. Existence decides.
#[cfg(windows)]
pub fn embedded_candidates(root_path: &Path) -> Vec<PathBuf> {
    let parent = root_path.parent().unwrap_or(root_path);
    vec![
        parent.join("python_embedded").join("python.exe"),
        parent.join("python").join("python.exe"),
    ]
}

#[cfg(not(windows))]
pub fn embedded_candidates(root_path: &Path) -> Vec<PathBuf> {
    let parent = root_path.parent().unwrap_or(root_path);
    vec![
        parent.join("python_embedded").join("bin").join("python3"),
        parent.join("python").join("bin").join("python3"),
    ]
}

pub async fn find_embedded(root_path: &Path) -> Option<PathBuf> {
    for candidate in embedded_candidates(root_path) {
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

async fn lookup_on_path(program: &str, query: &str) -> Option<PathBuf> {
    let out = Command::new(program).arg(query).output().await.ok()?;
    if !out.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    let first = stdout.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(PathBuf::from(first))
}

/// PATH-resolved system interpreter.
#[cfg(windows)]
pub async fn resolve_system() -> Option<PathBuf> {
    lookup_on_path("where", "python").await
}

#[cfg(not(windows))]
pub async fn resolve_system() -> Option<PathBuf> {
    match lookup_on_path("which", "python3").await {
        Some(p) => Some(p),
        None => lookup_on_path("which", "python").await,
    }
}

/// Embedded first, then system. `None` is terminal for a start request.
pub async fn resolve(root_path: &Path) -> Option<ResolvedInterpreter> {
    if let Some(path) = find_embedded(root_path).await {
        return Some(ResolvedInterpreter {
            path,
            embedded: true,
        });
    }
    resolve_system().await.map(|path| ResolvedInterpreter {
        path,
        embedded: false,
    })
}
