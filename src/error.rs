use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] callmeter_runtime::Error),

    #[error("no functions to track -- pass --fn or list them under `functions` in a config file")]
    NoFunctions,

    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to read trace {}: {source}", path.display())]
    TraceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {reason}", path.display())]
    InvalidTrace {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("trace line {line}: cannot allocate {bytes} bytes: {source}")]
    TraceAlloc {
        line: usize,
        bytes: usize,
        #[source]
        source: std::collections::TryReserveError,
    },

    #[error("no callmeter runs found -- run `callmeter replay` to generate one")]
    NoRuns,

    #[error("failed to read run file {}: {source}", path.display())]
    RunReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid run data in {}: {reason}", path.display())]
    InvalidRunData { path: PathBuf, reason: String },

    #[error("failed to write run file {}: {source}", path.display())]
    RunWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
