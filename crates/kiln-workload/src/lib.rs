use std::path::PathBuf;

use specta::Type;

/// A named local compute unit: one generative-pipeline instance managed by
/// the agent, keyed by `name` (also the compose service name and the
/// workload folder name).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct Workload {
    pub name: String,
    /// Primary network port. Uniqueness across workloads is enforced by the
    /// caller's port registry, not here.
    pub port: u16,
    /// Optional secondary port (notebook interface).
    pub notebook_port: Option<u16>,
    /// Shared network segment the containerized workload joins.
    pub network_name: String,
    /// Filesystem location containing the workload entry point.
    pub root_path: PathBuf,
}

/// Lifecycle states for a workload's local process.
///
/// `Retrying` is the lateral path taken when the stderr failure signature
/// triggers the single embedded-interpreter retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub enum WorkloadState {
    Idle,
    Starting,
    Retrying,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct WorkloadStatus {
    pub name: String,
    pub state: WorkloadState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Result of a start request. `success` reflects spawn success, not
/// workload readiness.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct StartOutcome {
    pub success: bool,
    pub pid: Option<u32>,
    /// True when the workload runs on the PATH-resolved system
    /// interpreter rather than an embedded runtime. The embedded retry
    /// after a startup failure reports `false` here.
    pub using_fallback_interpreter: bool,
}

/// Result of a stop request. `success: false` with no error means no
/// process was found to stop, which is a reportable non-event.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Type)]
pub struct StopOutcome {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Type)]
pub struct DeregisterOutcome {
    pub success: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct RegisterOutcome {
    pub success: bool,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Error,
    Success,
}

/// One user-visible log record, as consumed by the desktop shell's log
/// surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct LogEvent {
    pub timestamp: String,
    pub message: String,
    pub severity: LogSeverity,
}

impl LogEvent {
    pub fn new(message: impl Into<String>, severity: LogSeverity) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            message: message.into(),
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_carries_severity() {
        let ev = LogEvent::new("started", LogSeverity::Success);
        assert_eq!(ev.severity, LogSeverity::Success);
        assert_eq!(ev.message, "started");
        assert!(!ev.timestamp.is_empty());
    }

    #[test]
    fn severity_serializes_lowercase() {
        let s = serde_json::to_string(&LogSeverity::Error).unwrap();
        assert_eq!(s, "\"error\"");
    }
}
