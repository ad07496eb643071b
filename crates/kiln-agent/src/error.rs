use std::path::PathBuf;

/// Operation-terminal error classes. Discovery misses and system-command
/// failures are deliberately *not* here: both degrade to "not found"
/// results instead of errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("entry point not found: {0}")]
    EntryPointMissing(PathBuf),

    #[error("no interpreter found (searched embedded candidates and PATH); install Python or place an embedded runtime next to the workload root")]
    NoInterpreter,

    #[error("template not found in cache or bundled resources: {0}")]
    TemplateMissing(String),

    #[error("workload is already {0}")]
    AlreadyActive(&'static str),
}
