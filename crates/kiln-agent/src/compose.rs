use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

use crate::support::write_file_atomic;

/// Structured view of the compose document: an ordered mapping of service
/// name to block text plus the set of declared networks. Service bodies
/// are opaque, indentation-preserved text; we never reinterpret them
/// beyond finding their `networks:` references, so unrelated blocks
/// survive round trips verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ComposeDocument {
    /// Top-level lines preceding the managed sections (comments,
    /// `version:` keys and the like), kept verbatim.
    preamble: Vec<String>,
    services: Vec<(String, String)>,
    networks: Vec<String>,
}

fn service_header_name(line: &str) -> Option<&str> {
    // Anchored at column zero: exactly two spaces, a key, a colon, nothing
    // else on the line.
    let rest = line.strip_prefix("  ")?;
    if rest.starts_with(' ') {
        return None;
    }
    let key = rest.trim_end().strip_suffix(':')?;
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(key)
}

fn is_top_level_key(line: &str) -> bool {
    !line.is_empty() && !line.starts_with(' ') && !line.starts_with('#')
}

/// Normalize a block to header + body with a single trailing newline.
fn normalize_block(block: &str) -> String {
    let mut out = block.trim_end().to_string();
    out.push('\n');
    out
}

/// Networks referenced by a service block: entries of its `networks:`
/// sub-list.
fn referenced_networks(block: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_networks = false;
    for line in block.lines() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if trimmed == "networks:" {
            in_networks = true;
            continue;
        }
        if in_networks {
            if indent >= 6 && trimmed.starts_with("- ") {
                out.push(trimmed[2..].trim().to_string());
                continue;
            }
            in_networks = false;
        }
    }
    out
}

impl ComposeDocument {
    pub(crate) fn parse(text: &str) -> Self {
        #[derive(PartialEq)]
        enum Section {
            Preamble,
            Services,
            Networks,
            Other,
        }

        let mut doc = ComposeDocument::default();
        let mut section = Section::Preamble;
        let mut current: Option<(String, String)> = None;

        let flush = |current: &mut Option<(String, String)>, doc: &mut ComposeDocument| {
            if let Some((name, block)) = current.take() {
                doc.services.push((name, normalize_block(&block)));
            }
        };

        for line in text.lines() {
            if is_top_level_key(line) {
                flush(&mut current, &mut doc);
                section = match line.trim_end() {
                    "services:" => Section::Services,
                    "networks:" => Section::Networks,
                    _ => {
                        doc.preamble.push(line.to_string());
                        Section::Other
                    }
                };
                continue;
            }

            match section {
                Section::Services => {
                    if let Some(name) = service_header_name(line) {
                        flush(&mut current, &mut doc);
                        current = Some((name.to_string(), format!("{line}\n")));
                    } else if let Some((_, block)) = current.as_mut() {
                        block.push_str(line);
                        block.push('\n');
                    }
                    // Stray indented lines before any header are dropped;
                    // the skeleton never produces them.
                }
                Section::Networks => {
                    if let Some(name) = service_header_name(line) {
                        doc.networks.push(name.to_string());
                    }
                }
                Section::Preamble | Section::Other => {
                    doc.preamble.push(line.to_string());
                }
            }
        }
        flush(&mut current, &mut doc);
        doc
    }

    /// Deterministic serialization: preamble, services in order, then a
    /// networks root declaring every referenced network as external.
    pub(crate) fn serialize(&self) -> String {
        let mut out = String::new();
        for line in &self.preamble {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("services:\n");
        for (_, block) in &self.services {
            out.push_str(block);
        }

        let mut networks: Vec<String> = Vec::new();
        for name in self
            .networks
            .iter()
            .cloned()
            .chain(self.services.iter().flat_map(|(_, b)| referenced_networks(b)))
        {
            if !networks.contains(&name) {
                networks.push(name);
            }
        }

        out.push_str("networks:\n");
        for name in &networks {
            out.push_str(&format!("  {name}:\n    external: true\n"));
        }
        out
    }

    pub(crate) fn upsert(&mut self, name: &str, block: &str) {
        let block = normalize_block(block);
        if let Some(slot) = self.services.iter_mut().find(|(n, _)| n == name) {
            slot.1 = block;
        } else {
            // New blocks go directly under the services root, ahead of
            // existing entries.
            self.services.insert(0, (name.to_string(), block));
        }
    }

    pub(crate) fn remove(&mut self, name: &str) -> bool {
        let before = self.services.len();
        self.services.retain(|(n, _)| n != name);
        self.services.len() != before
    }

    pub(crate) fn has_service(&self, name: &str) -> bool {
        self.services.iter().any(|(n, _)| n == name)
    }
}

fn skeleton(network_name: &str) -> String {
    format!("services:\nnetworks:\n  {network_name}:\n    external: true\n")
}

/// Owns the single compose document of an installation. Read-modify-write
/// cycles are serialized through one mutex per manager (one manager per
/// document path); concurrent registrations queue here instead of losing
/// updates.
#[derive(Clone)]
pub struct ComposeManager {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ComposeManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Write the minimal skeleton if and only if no document exists.
    /// An existing document may hold services we did not create; it is
    /// never overwritten.
    pub async fn ensure(&self, network_name: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(());
        }
        write_file_atomic(&self.path, skeleton(network_name).as_bytes())
            .await
            .with_context(|| format!("create compose document {}", self.path.display()))
    }

    /// Idempotently insert or replace the named service block. The block
    /// must start with its own `  name:` header line.
    pub async fn upsert_service(
        &self,
        name: &str,
        rendered_block: &str,
        network_name: &str,
    ) -> anyhow::Result<()> {
        let header = rendered_block.lines().next().unwrap_or_default();
        if service_header_name(header) != Some(name) {
            anyhow::bail!("rendered block does not start with service header for {name}");
        }

        let _guard = self.lock.lock().await;
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(_) => skeleton(network_name),
        };
        let mut doc = ComposeDocument::parse(&text);
        doc.upsert(name, rendered_block);
        if !doc.networks.contains(&network_name.to_string()) {
            doc.networks.push(network_name.to_string());
        }
        write_file_atomic(&self.path, doc.serialize().as_bytes())
            .await
            .with_context(|| format!("write compose document {}", self.path.display()))
    }

    /// Remove the named service block. Returns whether a block was
    /// removed; a miss is not an error.
    pub async fn remove_service(&self, name: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(_) => return Ok(false),
        };
        let mut doc = ComposeDocument::parse(&text);
        if !doc.remove(name) {
            return Ok(false);
        }
        write_file_atomic(&self.path, doc.serialize().as_bytes())
            .await
            .with_context(|| format!("write compose document {}", self.path.display()))?;
        Ok(true)
    }
}
