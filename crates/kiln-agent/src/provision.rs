use std::collections::BTreeMap;

use anyhow::Context;
use kiln_workload::{DeregisterOutcome, RegisterOutcome, Workload};

use crate::compose::ComposeManager;
use crate::events::LogSink;
use crate::support::{self, InstallPaths, format_error_chain};
use crate::template;

/// Whether deregistration also removes the workload's compose service
/// block. The desktop shell historically kept blocks around so a
/// re-registered workload picks up its old configuration; removal is the
/// stricter alternative. Explicit policy instead of a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeregisterPolicy {
    #[default]
    KeepServiceBlock,
    RemoveServiceBlock,
}

const SCAFFOLD_SUBDIRS: &[&str] = &["input", "output", "custom_nodes", "notebooks"];

/// Default notebook port when the caller registers without one: offset
/// from the primary port so two defaults never collide.
const NOTEBOOK_PORT_OFFSET: u16 = 100;

/// Creates and removes containerized workload registrations: folder
/// scaffold, rendered startup/Dockerfile, and the compose service block.
#[derive(Clone)]
pub struct Provisioner {
    paths: InstallPaths,
    compose: ComposeManager,
    sink: LogSink,
    policy: DeregisterPolicy,
}

impl Provisioner {
    pub fn new(paths: InstallPaths, sink: LogSink, policy: DeregisterPolicy) -> Self {
        let compose = ComposeManager::new(paths.compose_path());
        Self {
            paths,
            compose,
            sink,
            policy,
        }
    }

    /// One-time install provisioning: base directories, template cache
    /// seeded from bundled resources, and the compose skeleton. Guarded
    /// by a hidden marker file; reruns are no-ops.
    pub async fn provision_install(&self, network_name: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.paths.root())
            .await
            .with_context(|| format!("create install root {}", self.paths.root().display()))?;
        self.compose.ensure(network_name).await?;

        let marker = self.paths.provisioned_marker();
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            return Ok(());
        }

        tokio::fs::create_dir_all(self.paths.shared_models_dir())
            .await
            .context("create shared models dir")?;
        tokio::fs::create_dir_all(self.paths.workloads_dir())
            .await
            .context("create workloads dir")?;
        for name in [
            template::SERVICE_TEMPLATE,
            template::STARTUP_TEMPLATE,
            template::DOCKERFILE_TEMPLATE,
        ] {
            template::load_template(&self.paths, name).await?;
        }

        tokio::fs::write(&marker, b"true\n")
            .await
            .context("write provisioned marker")?;
        self.sink
            .info(format!("provisioned install at {}", self.paths.root().display()))
            .await;
        Ok(())
    }

    pub async fn register_container_workload(&self, workload: &Workload) -> RegisterOutcome {
        match self.try_register(workload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let msg = format_error_chain(&err);
                self.sink
                    .error(format!("failed to register {}: {msg}", workload.name))
                    .await;
                RegisterOutcome {
                    success: false,
                    path: None,
                    error: Some(msg),
                }
            }
        }
    }

    async fn try_register(&self, workload: &Workload) -> anyhow::Result<RegisterOutcome> {
        let name = support::normalize_workload_name(&workload.name)?;
        let dir = self.paths.workload_dir(&name);

        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create workload dir {}", dir.display()))?;
        for sub in SCAFFOLD_SUBDIRS {
            tokio::fs::create_dir_all(dir.join(sub))
                .await
                .with_context(|| format!("create workload subdir {sub}"))?;
        }

        let notebook_port = workload
            .notebook_port
            .unwrap_or(workload.port.saturating_add(NOTEBOOK_PORT_OFFSET));
        let values: BTreeMap<String, String> = [
            ("name".to_string(), name.clone()),
            ("port".to_string(), workload.port.to_string()),
            ("notebook_port".to_string(), notebook_port.to_string()),
            (
                "shared_models_dir".to_string(),
                self.paths.shared_models_dir().display().to_string(),
            ),
            ("network_name".to_string(), workload.network_name.clone()),
        ]
        .into();

        let startup = template::load_template(&self.paths, template::STARTUP_TEMPLATE).await?;
        write_executable(&dir.join("startup.sh"), &template::render(&startup, &values)).await?;
        self.sink.info(format!("created startup.sh for {name}")).await;

        let dockerfile = template::load_template(&self.paths, template::DOCKERFILE_TEMPLATE).await?;
        tokio::fs::write(dir.join("Dockerfile"), template::render(&dockerfile, &values))
            .await
            .context("write Dockerfile")?;
        self.sink.info(format!("created Dockerfile for {name}")).await;

        self.compose.ensure(&workload.network_name).await?;
        let service = template::load_template(&self.paths, template::SERVICE_TEMPLATE).await?;
        self.compose
            .upsert_service(
                &name,
                &template::render(&service, &values),
                &workload.network_name,
            )
            .await?;

        self.sink
            .success(format!("registered container workload {name}"))
            .await;
        Ok(RegisterOutcome {
            success: true,
            path: Some(dir),
            error: None,
        })
    }

    /// Remove the workload folder; the compose block follows the
    /// configured policy.
    pub async fn deregister_workload(&self, name: &str) -> DeregisterOutcome {
        let name = match support::normalize_workload_name(name) {
            Ok(n) => n,
            Err(err) => {
                self.sink
                    .error(format!("failed to deregister: {}", format_error_chain(&err)))
                    .await;
                return DeregisterOutcome { success: false };
            }
        };

        let dir = self.paths.workload_dir(&name);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            self.sink
                .error(format!("failed to remove workload folder {name}: {err}"))
                .await;
            return DeregisterOutcome { success: false };
        }

        if self.policy == DeregisterPolicy::RemoveServiceBlock {
            match self.compose.remove_service(&name).await {
                Ok(true) => {
                    self.sink
                        .info(format!("removed compose service block for {name}"))
                        .await;
                }
                Ok(false) => {}
                Err(err) => {
                    self.sink
                        .error(format!(
                            "failed to update compose document for {name}: {}",
                            format_error_chain(&err)
                        ))
                        .await;
                    return DeregisterOutcome { success: false };
                }
            }
        }

        self.sink.success(format!("deregistered workload {name}")).await;
        DeregisterOutcome { success: true }
    }
}

#[cfg(unix)]
async fn write_executable(path: &std::path::Path, content: &str) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_executable(path: &std::path::Path, content: &str) -> anyhow::Result<()> {
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
