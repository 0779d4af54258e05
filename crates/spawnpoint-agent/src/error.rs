//! Error taxonomy for provisioning and teardown.

use std::path::PathBuf;

use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, unreadable or unsupported-extension archive, or bad parameters.
    #[error("invalid input {subject}: {reason}")]
    Validation { subject: String, reason: String },

    /// Recognized archive format that has no extractor yet.
    #[error("archive format {format} is not supported yet: {}", path.display())]
    UnsupportedFormat { path: PathBuf, format: String },

    /// Corrupt archive or an entry escaping the destination directory.
    #[error("failed to extract {}: {reason}", path.display())]
    Extraction {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(
        "{} contains neither a {jar} file nor a {overlay}/ directory",
        dir.display()
    )]
    DeploymentClassification {
        dir: PathBuf,
        jar: &'static str,
        overlay: &'static str,
    },

    #[error("no available {kind} port from {start} up to {upper}")]
    PortExhaustion {
        kind: &'static str,
        start: u16,
        upper: u16,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The monitoring channel could not be opened or broke.
    #[error("event stream for {resource}: {reason}")]
    EventStream {
        resource: String,
        reason: String,
        #[source]
        source: Option<EngineError>,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn validation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn extraction(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Extraction {
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code, suitable for status text sent back to
    /// collaborators.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "invalid_archive",
            Self::UnsupportedFormat { .. } => "unsupported_format",
            Self::Extraction { .. } => "extraction_failed",
            Self::DeploymentClassification { .. } => "unrecognized_payload",
            Self::PortExhaustion { .. } => "ports_exhausted",
            Self::Engine(_) => "engine_failed",
            Self::EventStream { .. } => "event_stream_failed",
            Self::Io { .. } => "io_failed",
        }
    }
}

pub(crate) fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
