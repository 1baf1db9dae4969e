use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Structural failures that end a worker. Per-record problems (bad JSON,
/// odd conntrack rows) are logged where they happen and never reach here.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("cannot open input source {path}: {source}")]
    SourceOpen {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reading input source {path} failed: {source}")]
    SourceRead {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("input source {0} closed")]
    SourceClosed(PathBuf),

    #[error("conntrack could not be run: {0}")]
    ConntrackUnavailable(#[source] io::Error),

    #[error("conntrack exited with {0}")]
    ConntrackFailed(std::process::ExitStatus),

    #[error("cannot spawn worker thread {name}: {source}")]
    Spawn {
        name:   &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CorrelatorError>;
