//! Error types for resolution, processing and configuration.

use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required logical path resolved to zero candidates.
    #[error("couldn't find file '{path}'")]
    FileNotFound { path: String },

    /// The pipeline produced a different mime-type stack than was requested.
    #[error("{filename}: expected content types {expected:?}, pipeline produced {actual:?}")]
    ContentTypeMismatch {
        filename: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// An engine rejected malformed input.
    #[error("{}", syntax_message(.filename, .line, .column, .message))]
    Syntax {
        filename: String,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not a directory: `{0}`")]
    InvalidPath(PathBuf),

    /// A spawned engine exited unsuccessfully.
    #[error("`{program}` failed ({status}){}", captured(.stdout, .stderr))]
    Engine {
        program: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// Any other engine failure, tagged with where it happened.
    #[error("{engine} failed on {filename}: {source}")]
    Processor {
        engine: String,
        filename: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error on `{0}`")]
    Io(PathBuf, #[source] io::Error),

    #[error("json error")]
    Json(#[from] serde_json::Error),

    #[error("config file parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("invalid glob pattern")]
    Pattern(#[from] glob::PatternError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        Self::Io(path.into(), err)
    }

    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub fn syntax(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Syntax {
            filename: filename.into(),
            line: None,
            column: None,
            message: message.into(),
        }
    }

    /// Attach a line/column to a syntax error; other variants pass through.
    pub fn at(self, line: usize, column: usize) -> Self {
        match self {
            Self::Syntax {
                filename, message, ..
            } => Self::Syntax {
                filename,
                line: Some(line),
                column: Some(column),
                message,
            },
            other => other,
        }
    }

    /// Convert an engine failure into a crate error.
    ///
    /// Crate errors raised by the engine are returned untouched.
    pub(crate) fn from_engine(engine: &str, filename: &str, err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(source) => Self::Processor {
                engine: engine.to_owned(),
                filename: filename.to_owned(),
                source: source.into(),
            },
        }
    }
}

fn syntax_message(
    filename: &str,
    line: &Option<usize>,
    column: &Option<usize>,
    message: &str,
) -> String {
    let mut out = filename.to_owned();
    if let Some(line) = line {
        let _ = write!(out, ":{line}");
        if let Some(column) = column {
            let _ = write!(out, ":{column}");
        }
    }
    let _ = write!(out, ": {message}");
    out
}

fn captured(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    if !stderr.trim().is_empty() {
        out.push_str("\nstderr:\n");
        out.push_str(stderr.trim_end());
    }
    if !stdout.trim().is_empty() {
        out.push_str("\nstdout:\n");
        out.push_str(stdout.trim_end());
    }
    out
}
