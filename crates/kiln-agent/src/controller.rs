use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use kiln_workload::{StartOutcome, StopOutcome, Workload, WorkloadState, WorkloadStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::ControlError;
use crate::events::LogSink;
use crate::interpreter::{self, ResolvedInterpreter};
use crate::support::{self, InstallPaths, format_error_chain};
use crate::sysproc;

/// Stderr lines carrying these fragments indicate the numpy runtime of
/// the spawned pipeline is broken for the chosen interpreter. Seen when a
/// system Python picks up an incompatible numpy; the embedded runtime
/// ships a matching one.
const NUMPY_FAILURE_SIGNATURES: &[&str] = &[
    "numpy.core.multiarray failed to import",
    "Original error was: DLL load failed",
];

#[cfg(windows)]
const INTERPRETER_NOT_FOUND_EXIT: i32 = 9009;
#[cfg(not(windows))]
const INTERPRETER_NOT_FOUND_EXIT: i32 = 127;

pub(crate) fn is_failure_signature(line: &str) -> bool {
    NUMPY_FAILURE_SIGNATURES.iter().any(|sig| line.contains(sig))
}

#[derive(Debug)]
struct WorkloadEntry {
    state: WorkloadState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    message: Option<String>,
    /// Spawn generation. Watcher tasks from superseded attempts compare
    /// against this and bail instead of clobbering newer state.
    attempt: u64,
    /// The single fallback retry has been consumed.
    retried: bool,
}

impl Default for WorkloadEntry {
    fn default() -> Self {
        Self {
            state: WorkloadState::Idle,
            pid: None,
            exit_code: None,
            message: None,
            attempt: 0,
            retried: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct RunInfo {
    workload: String,
    agent_version: String,
    interpreter: String,
    embedded_interpreter: bool,
    args: Vec<String>,
    cwd: String,
    started_at_unix_ms: u64,
    pid: Option<u32>,
}

#[cfg(unix)]
fn signal_description(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {sig}"),
        None => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: &std::process::ExitStatus) -> String {
    "terminated abnormally".to_string()
}

async fn write_run_info(paths: &InstallPaths, name: &str, info: &RunInfo) {
    // Best-effort metadata for the shell; never fails a start.
    let path = paths.workload_dir(name).join("run.json");
    if let Ok(data) = serde_json::to_vec_pretty(info) {
        let _ = support::write_file_atomic(&path, &data).await;
    }
}

/// Per-workload lifecycle controller. An explicit context object: create
/// one per installation (or per test) and pass it around; there is no
/// process-wide instance.
#[derive(Clone)]
pub struct WorkloadRuntime {
    paths: InstallPaths,
    inner: Arc<Mutex<HashMap<String, WorkloadEntry>>>,
    sink: LogSink,
}

impl WorkloadRuntime {
    pub fn new(paths: InstallPaths, sink: LogSink) -> Self {
        Self {
            paths,
            inner: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    pub async fn status(&self, name: &str) -> Option<WorkloadStatus> {
        let inner = self.inner.lock().await;
        inner.get(name).map(|e| WorkloadStatus {
            name: name.to_string(),
            state: e.state,
            pid: e.pid,
            exit_code: e.exit_code,
            message: e.message.clone(),
        })
    }

    /// Start a workload: entry-point check, interpreter resolution
    /// (embedded preferred, system fallback), spawn with cwd `root_path`.
    /// `Running` is signalled on spawn success, not workload readiness.
    pub async fn start(&self, workload: &Workload) -> StartOutcome {
        match self.try_start(workload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.sink
                    .error(format!(
                        "failed to start {}: {}",
                        workload.name,
                        format_error_chain(&err)
                    ))
                    .await;
                let mut inner = self.inner.lock().await;
                let e = inner.entry(workload.name.clone()).or_default();
                // A rejected start of an already-active workload must not
                // disturb its recorded state.
                if matches!(e.state, WorkloadState::Starting) {
                    e.state = WorkloadState::Idle;
                    e.message = Some(format_error_chain(&err));
                }
                StartOutcome {
                    success: false,
                    pid: None,
                    using_fallback_interpreter: false,
                }
            }
        }
    }

    async fn try_start(&self, workload: &Workload) -> anyhow::Result<StartOutcome> {
        {
            let mut inner = self.inner.lock().await;
            let e = inner.entry(workload.name.clone()).or_default();
            if matches!(
                e.state,
                WorkloadState::Starting
                    | WorkloadState::Retrying
                    | WorkloadState::Running
                    | WorkloadState::Stopping
            ) {
                return Err(ControlError::AlreadyActive(match e.state {
                    WorkloadState::Stopping => "stopping",
                    _ => "running",
                })
                .into());
            }
            e.state = WorkloadState::Starting;
            e.exit_code = None;
            e.retried = false;
            e.message = Some("starting...".to_string());
        }

        let entry_point = workload.root_path.join(sysproc::ENTRY_POINT);
        if !tokio::fs::try_exists(&entry_point).await.unwrap_or(false) {
            return Err(ControlError::EntryPointMissing(entry_point).into());
        }

        let interp = interpreter::resolve(&workload.root_path)
            .await
            .ok_or(ControlError::NoInterpreter)?;
        self.sink
            .info(format!(
                "starting {} with {} interpreter: {}",
                workload.name,
                if interp.embedded { "embedded" } else { "system" },
                interp.path.display()
            ))
            .await;

        self.start_with_interpreter(workload, interp).await
    }

    /// Spawn seam shared by the initial attempt and the fallback retry.
    /// Boxed future: the retry path re-enters this through the stderr
    /// watcher task, a recursion an opaque async fn cannot express.
    pub(crate) fn start_with_interpreter<'a>(
        &'a self,
        workload: &'a Workload,
        interp: ResolvedInterpreter,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StartOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let attempt = {
                let mut inner = self.inner.lock().await;
                let e = inner.entry(workload.name.clone()).or_default();
                e.attempt = e.attempt.saturating_add(1);
                e.attempt
            };

            let pid = self.spawn_attempt(workload, &interp, attempt).await?;

            {
                let mut inner = self.inner.lock().await;
                if let Some(e) = inner.get_mut(&workload.name)
                    && e.attempt == attempt
                {
                    e.state = WorkloadState::Running;
                    e.pid = Some(pid);
                    e.message = None;
                }
            }
            self.sink
                .success(format!("{} running (pid {pid})", workload.name))
                .await;

            Ok(StartOutcome {
                success: true,
                pid: Some(pid),
                using_fallback_interpreter: !interp.embedded,
            })
        })
    }

    async fn spawn_attempt(
        &self,
        workload: &Workload,
        interp: &ResolvedInterpreter,
        attempt: u64,
    ) -> anyhow::Result<u32> {
        let args = vec![
            sysproc::ENTRY_POINT.to_string(),
            "--port".to_string(),
            workload.port.to_string(),
        ];

        let mut child = Command::new(&interp.path)
            .args(&args)
            .current_dir(&workload.root_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "spawn {} with {} (cwd {})",
                    workload.name,
                    interp.path.display(),
                    workload.root_path.display()
                )
            })?;

        let pid = child.id().context("spawned process has no pid")?;

        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        write_run_info(
            &self.paths,
            &workload.name,
            &RunInfo {
                workload: workload.name.clone(),
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
                interpreter: interp.path.display().to_string(),
                embedded_interpreter: interp.embedded,
                args,
                cwd: workload.root_path.display().to_string(),
                started_at_unix_ms,
                pid: Some(pid),
            },
        )
        .await;

        if let Some(out) = child.stdout.take() {
            let sink = self.sink.clone();
            let name = workload.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.info(format!("[{name}] {line}")).await;
                }
            });
        }

        if let Some(err) = child.stderr.take() {
            let runtime = self.clone();
            let wl = workload.clone();
            let used_embedded = interp.embedded;
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    runtime
                        .sink
                        .info(format!("[{} stderr] {line}", wl.name))
                        .await;
                    if is_failure_signature(&line) {
                        runtime.on_failure_signature(&wl, attempt, used_embedded).await;
                    }
                }
            });
        }

        {
            let runtime = self.clone();
            let name = workload.name.clone();
            tokio::spawn(async move {
                let res = child.wait().await;
                runtime.observe_exit(&name, attempt, res).await;
            });
        }

        Ok(pid)
    }

    /// The lateral `Starting -> Retrying` transition: one superseding
    /// spawn on the embedded interpreter when the failure signature shows
    /// up and the embedded runtime exists but was not the one used. Never
    /// loops; a second failure stays Failed.
    async fn on_failure_signature(&self, workload: &Workload, attempt: u64, used_embedded: bool) {
        if used_embedded {
            return;
        }
        let Some(embedded) = interpreter::find_embedded(&workload.root_path).await else {
            return;
        };

        let old_pid = {
            let mut inner = self.inner.lock().await;
            let Some(e) = inner.get_mut(&workload.name) else {
                return;
            };
            if e.attempt != attempt || e.retried {
                return;
            }
            if !matches!(e.state, WorkloadState::Starting | WorkloadState::Running) {
                return;
            }
            e.retried = true;
            e.state = WorkloadState::Retrying;
            e.message = Some("retrying with embedded interpreter".to_string());
            e.pid.take()
        };

        self.sink
            .error(format!(
                "{}: numpy runtime failure detected, retrying with embedded interpreter",
                workload.name
            ))
            .await;

        if let Some(pid) = old_pid {
            sysproc::kill(pid).await;
        }

        let retry = self
            .start_with_interpreter(
                workload,
                ResolvedInterpreter {
                    path: embedded,
                    embedded: true,
                },
            )
            .await;

        if let Err(err) = retry {
            self.sink
                .error(format!(
                    "{}: fallback retry failed: {}",
                    workload.name,
                    format_error_chain(&err)
                ))
                .await;
            let mut inner = self.inner.lock().await;
            if let Some(e) = inner.get_mut(&workload.name) {
                e.state = WorkloadState::Failed;
                e.message = Some("fallback retry failed".to_string());
            }
        }
    }

    async fn observe_exit(
        &self,
        name: &str,
        attempt: u64,
        res: std::io::Result<std::process::ExitStatus>,
    ) {
        let (message, is_error) = {
            let mut inner = self.inner.lock().await;
            let Some(e) = inner.get_mut(name) else {
                return;
            };
            if e.attempt != attempt {
                // Superseded by a retry; the newer watcher owns the entry.
                return;
            }
            let stopping = matches!(e.state, WorkloadState::Stopping);

            match res {
                Ok(status) => {
                    e.exit_code = status.code();
                    e.pid = None;
                    if stopping {
                        e.state = WorkloadState::Idle;
                        e.message = Some("stopped".to_string());
                        (format!("{name} stopped"), false)
                    } else if status.success() {
                        e.state = WorkloadState::Idle;
                        e.message = Some("exited".to_string());
                        (format!("{name} exited"), false)
                    } else if let Some(code) = status.code() {
                        e.state = WorkloadState::Failed;
                        let msg = if code == INTERPRETER_NOT_FOUND_EXIT {
                            format!(
                                "{name} exited with code {code}: interpreter not found on the search path; install Python or fix PATH"
                            )
                        } else {
                            format!("{name} exited with code {code}")
                        };
                        e.message = Some(msg.clone());
                        (msg, true)
                    } else {
                        // No exit code means a signal death.
                        e.state = WorkloadState::Failed;
                        let msg = format!("{name} {}", signal_description(&status));
                        e.message = Some(msg.clone());
                        (msg, true)
                    }
                }
                Err(err) => {
                    e.state = WorkloadState::Failed;
                    e.pid = None;
                    let msg = format!("{name}: wait failed: {err}");
                    e.message = Some(msg.clone());
                    (msg, true)
                }
            }
        };

        if is_error {
            self.sink.error(message).await;
        } else {
            self.sink.info(message).await;
        }
    }

    /// Two-phase stop: port-based discovery first, then path-based. Kill
    /// is best-effort; finding nothing to stop is a reported non-event,
    /// not an error.
    pub async fn stop(&self, workload: &Workload) -> StopOutcome {
        {
            let mut inner = self.inner.lock().await;
            let e = inner.entry(workload.name.clone()).or_default();
            e.state = WorkloadState::Stopping;
            e.message = Some("stopping...".to_string());
        }
        self.sink
            .info(format!("stopping {} (port {})", workload.name, workload.port))
            .await;

        if let Some(pid) = sysproc::find_pid_by_port(workload.port).await {
            if sysproc::kill(pid).await {
                self.settle_after_kill(&workload.name).await;
                self.sink
                    .success(format!(
                        "{} stopped (pid {pid} on port {})",
                        workload.name, workload.port
                    ))
                    .await;
                return StopOutcome { success: true };
            }
            self.sink
                .info(format!(
                    "{}: could not terminate pid {pid} by port, trying path match",
                    workload.name
                ))
                .await;
        }

        let fragment = workload.root_path.to_string_lossy().to_string();
        if let Some(pid) = sysproc::find_pid_by_path(&fragment).await
            && sysproc::kill(pid).await
        {
            self.settle_after_kill(&workload.name).await;
            self.sink
                .success(format!(
                    "{} stopped (pid {pid} matched by path)",
                    workload.name
                ))
                .await;
            return StopOutcome { success: true };
        }

        self.settle_stopped(&workload.name).await;
        self.sink
            .info(format!(
                "{}: no running process found on port {} or under {}; nothing to stop",
                workload.name,
                workload.port,
                workload.root_path.display()
            ))
            .await;
        StopOutcome { success: false }
    }

    async fn settle_stopped(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(e) = inner.get_mut(name) {
            e.state = WorkloadState::Idle;
            e.pid = None;
            e.message = None;
        }
    }

    /// After a successful kill. A child we spawned has an exit watcher
    /// that observes the death and settles the entry; an externally
    /// discovered process has none, so settle here.
    async fn settle_after_kill(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(e) = inner.get_mut(name) {
            if e.pid.is_some() {
                return;
            }
            e.state = WorkloadState::Idle;
            e.message = None;
        }
    }

    /// Confirmation helper for callers that need more than "signal
    /// issued": polls port discovery until the port is free.
    pub async fn wait_stopped(&self, workload: &Workload) -> bool {
        sysproc::wait_until_port_free(
            workload.port,
            support::stop_poll_interval(),
            support::stop_poll_timeout(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn failure_signature_matches_known_numpy_errors() {
        assert!(is_failure_signature(
            "ImportError: numpy.core.multiarray failed to import"
        ));
        assert!(is_failure_signature(
            "ImportError: DLL load failed. Original error was: DLL load failed while importing _multiarray_umath"
        ));
        assert!(!is_failure_signature("Traceback (most recent call last):"));
        assert!(!is_failure_signature(""));
    }

    fn runtime(dir: &Path) -> WorkloadRuntime {
        WorkloadRuntime::new(InstallPaths::new(dir.to_path_buf()), LogSink::default())
    }

    fn workload(root: &Path, port: u16) -> Workload {
        Workload {
            name: "demo".to_string(),
            port,
            notebook_port: None,
            network_name: "net1".to_string(),
            root_path: root.to_path_buf(),
        }
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn wait_for<F>(mut cond: F)
    where
        F: AsyncFnMut() -> bool,
    {
        for _ in 0..100 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn start_reports_missing_entry_point_and_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());
        let wl = workload(dir.path(), 39901);

        let outcome = runtime.start(&wl).await;
        assert!(!outcome.success);
        assert!(outcome.pid.is_none());

        let status = runtime.status("demo").await.unwrap();
        assert_eq!(status.state, WorkloadState::Idle);
        assert!(status.message.unwrap().contains("entry point not found"));
    }

    #[tokio::test]
    async fn stop_without_a_process_is_a_reported_non_event() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());
        // Nothing listens on this port and nothing matches the path.
        let wl = workload(dir.path(), 39902);

        let outcome = runtime.stop(&wl).await;
        assert!(!outcome.success);
        let status = runtime.status("demo").await.unwrap();
        assert_eq!(status.state, WorkloadState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_observed_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(sysproc::ENTRY_POINT), "").unwrap();
        let interp = dir.path().join("fake-python");
        write_script(&interp, "#!/bin/sh\nexit 3\n");

        let runtime = runtime(dir.path());
        let wl = workload(&root, 39903);
        let outcome = runtime
            .start_with_interpreter(
                &wl,
                ResolvedInterpreter {
                    path: interp,
                    embedded: false,
                },
            )
            .await
            .unwrap();
        assert!(outcome.success);

        let rt = runtime.clone();
        wait_for(async || {
            matches!(
                rt.status("demo").await,
                Some(WorkloadStatus {
                    state: WorkloadState::Failed,
                    ..
                })
            )
        })
        .await;

        let status = runtime.status("demo").await.unwrap();
        assert_eq!(status.exit_code, Some(3));
        assert!(status.message.unwrap().contains("exited with code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_127_gets_interpreter_guidance() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(sysproc::ENTRY_POINT), "").unwrap();
        let interp = dir.path().join("fake-python");
        write_script(&interp, "#!/bin/sh\nexit 127\n");

        let runtime = runtime(dir.path());
        let wl = workload(&root, 39904);
        runtime
            .start_with_interpreter(
                &wl,
                ResolvedInterpreter {
                    path: interp,
                    embedded: false,
                },
            )
            .await
            .unwrap();

        let rt = runtime.clone();
        wait_for(async || {
            matches!(
                rt.status("demo").await,
                Some(WorkloadStatus {
                    state: WorkloadState::Failed,
                    ..
                })
            )
        })
        .await;

        let message = runtime.status("demo").await.unwrap().message.unwrap();
        assert!(message.contains("interpreter not found on the search path"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejected_second_start_leaves_the_running_state_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(sysproc::ENTRY_POINT), "").unwrap();
        let interp = dir.path().join("fake-python");
        write_script(&interp, "#!/bin/sh\nsleep 30\n");

        let runtime = runtime(dir.path());
        let wl = workload(&root, 39906);
        let outcome = runtime
            .start_with_interpreter(
                &wl,
                ResolvedInterpreter {
                    path: interp,
                    embedded: false,
                },
            )
            .await
            .unwrap();
        let pid = outcome.pid.unwrap();

        let second = runtime.start(&wl).await;
        assert!(!second.success);

        let status = runtime.status("demo").await.unwrap();
        assert_eq!(status.state, WorkloadState::Running);
        assert_eq!(status.pid, Some(pid));

        sysproc::kill(pid).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_of_a_spawned_child_settles_idle_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(sysproc::ENTRY_POINT), "").unwrap();
        let interp = dir.path().join("fake-python");
        write_script(&interp, "#!/bin/sh\nsleep 30\n");

        let runtime = runtime(dir.path());
        let wl = workload(&root, 39907);
        let outcome = runtime
            .start_with_interpreter(
                &wl,
                ResolvedInterpreter {
                    path: interp,
                    embedded: false,
                },
            )
            .await
            .unwrap();
        let pid = outcome.pid.unwrap();

        // The stop path: mark Stopping, kill, then settle; the child has
        // an exit watcher, so the entry must wait for it.
        {
            let mut inner = runtime.inner.lock().await;
            inner.get_mut("demo").unwrap().state = WorkloadState::Stopping;
        }
        assert!(sysproc::kill(pid).await);
        runtime.settle_after_kill("demo").await;

        let rt = runtime.clone();
        wait_for(async || {
            rt.status("demo")
                .await
                .is_some_and(|s| s.state == WorkloadState::Idle)
        })
        .await;

        let status = runtime.status("demo").await.unwrap();
        assert_eq!(status.message.as_deref(), Some("stopped"));
        assert!(status.pid.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_outside_stop_reports_the_signal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(sysproc::ENTRY_POINT), "").unwrap();
        let interp = dir.path().join("fake-python");
        write_script(&interp, "#!/bin/sh\nsleep 30\n");

        let runtime = runtime(dir.path());
        let wl = workload(&root, 39908);
        let outcome = runtime
            .start_with_interpreter(
                &wl,
                ResolvedInterpreter {
                    path: interp,
                    embedded: false,
                },
            )
            .await
            .unwrap();
        let pid = outcome.pid.unwrap();

        sysproc::kill(pid).await;

        let rt = runtime.clone();
        wait_for(async || {
            rt.status("demo")
                .await
                .is_some_and(|s| s.state == WorkloadState::Failed)
        })
        .await;

        let message = runtime.status("demo").await.unwrap().message.unwrap();
        assert!(message.contains("terminated by signal"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_signature_triggers_exactly_one_superseding_retry() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(sysproc::ENTRY_POINT), "").unwrap();

        // The "system" interpreter keeps emitting the failure signature;
        // the embedded one exists and must be used for the single retry.
        let sys_interp = dir.path().join("fake-python");
        write_script(
            &sys_interp,
            "#!/bin/sh\necho 'ImportError: numpy.core.multiarray failed to import' 1>&2\nsleep 30\n",
        );
        let embedded = interpreter::embedded_candidates(&root)[0].clone();
        write_script(
            &embedded,
            "#!/bin/sh\nsleep 0.2\necho 'ImportError: numpy.core.multiarray failed to import' 1>&2\nsleep 30\n",
        );

        let runtime = runtime(dir.path());
        let wl = workload(&root, 39905);
        let outcome = runtime
            .start_with_interpreter(
                &wl,
                ResolvedInterpreter {
                    path: sys_interp,
                    embedded: false,
                },
            )
            .await
            .unwrap();
        let first_pid = outcome.pid.unwrap();

        // Retry replaces the first attempt with the embedded interpreter.
        let rt = runtime.clone();
        wait_for(async || {
            rt.status("demo")
                .await
                .and_then(|s| s.pid)
                .is_some_and(|pid| pid != first_pid)
        })
        .await;

        let retried_pid = runtime.status("demo").await.unwrap().pid.unwrap();

        // The embedded attempt emits the signature too, but the retry is
        // single-shot: the pid must not change again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = runtime.status("demo").await.unwrap();
        assert_eq!(status.pid, Some(retried_pid));
        assert_eq!(status.state, WorkloadState::Running);

        sysproc::kill(retried_pid).await;
    }
}
