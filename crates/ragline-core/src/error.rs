//! Typed errors for the core library.
//!
//! Ingest-side failures are surfaced to the caller; query-side stage
//! failures never reach this type (they are contained and recorded in the
//! stage trace instead).

use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Ingest phase in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    Extract,
    Transform,
    Load,
    Clean,
    Retrieve,
}

impl fmt::Display for IndexPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexPhase::Extract => "extract",
            IndexPhase::Transform => "transform",
            IndexPhase::Load => "load",
            IndexPhase::Clean => "clean",
            IndexPhase::Retrieve => "retrieve",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// No registered parser accepts the file type.
    #[error("unsupported document type: {0}")]
    UnsupportedDocumentType(String),

    /// Segmentation rule outside its allowed ranges.
    #[error("invalid segmentation config: {0}")]
    InvalidSegmentationConfig(String),

    /// Any other configuration value that cannot be honoured.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The parser accepted the type but could not read the resource.
    #[error("failed to parse {file_name}: {reason}")]
    Parse { file_name: String, reason: String },

    #[error("model {model_id} unavailable: {reason}")]
    ModelUnavailable { model_id: i64, reason: String },

    #[error("invalid model id: {0}")]
    InvalidModelId(i64),

    #[error("store write failed: {0}")]
    StoreWriteFailure(String),

    #[error("store read failed: {0}")]
    StoreReadFailure(String),

    /// Wraps an error with the ingest phase that produced it.
    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: IndexPhase,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn in_phase(self, phase: IndexPhase) -> Self {
        match self {
            already @ Error::Phase { .. } => already,
            other => Error::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The phase this error was tagged with, if any.
    pub fn phase(&self) -> Option<IndexPhase> {
        match self {
            Error::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The innermost error, with phase tags peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::Phase { source, .. } => source.root(),
            other => other,
        }
    }
}
