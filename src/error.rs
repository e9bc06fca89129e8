//! The possible error types when training with `emf`.
use crate::lord::Status;
use crate::portion::{Owner, StepKind};
use thiserror::Error;

/// An enumeration of `emf` errors.
#[derive(Debug, Error)]
pub enum EmfError {
    /// No trainable rows, the run is aborted before anything is written
    #[error("No data to train")]
    NoData,
    /// `train` was called while the `Lord` is not in the `ready` state
    #[error("Not ready to train. Status is {0}")]
    NotReady(Status),
    /// `train` was called while a run is in progress
    #[error("Training is already started")]
    AlreadyTraining,
    /// A cluster node went away, its portions are redistributed
    #[error("Cluster node #{0} disconnected")]
    NodeDisconnected(usize),
    /// The observed train/validate/test split drifted from the target
    #[error("Split {observed:?} deviates from target {target:?}")]
    SplitInconsistent { observed: [f64; 3], target: [f64; 3] },
    /// The `Lord` refused our registration
    #[error("Registration rejected: {0}")]
    Rejected(String),
    /// No portion of a step completed within the stall timeout
    #[error("Step {step} stalled with {completed}/{total} portions done")]
    Stalled {
        step: StepKind,
        completed: usize,
        total: usize,
    },
    #[error("Unexpected message")]
    UnexpectedMessage,
    #[error("The stream was closed")]
    StreamClosed,
    #[error("Unknown node id")]
    UnknownId,
    #[error("Already connected to that node")]
    ReconnectionError,
    /// A completion arrived for a portion the owner does not hold
    #[error("{owner} does not hold portion {index}")]
    UnclaimedPortion { owner: Owner, index: usize },
    /// A message referenced a step that is not running
    #[error("Message for a step that is not running")]
    StaleStep,
    #[error("Row range out of bounds")]
    RowOutOfRange,
    #[error("Stored factors do not match the configured shape or precision")]
    PrecisionMismatch,
    /// Two nodes disagree on the ratings they hold
    #[error("Rating store mismatch: {0}")]
    StoreMismatch(String),
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("Kernel failure: {0}")]
    Kernel(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl EmfError {
    /// A stable code for this error, safe to match on from outside the crate
    pub fn code(&self) -> &'static str {
        match self {
            EmfError::NoData => "no_data",
            EmfError::NotReady(_) => "not_ready",
            EmfError::AlreadyTraining => "already_training",
            EmfError::NodeDisconnected(_) => "node_disconnected",
            EmfError::SplitInconsistent { .. } => "split_inconsistent",
            EmfError::Rejected(_) => "rejected",
            EmfError::Stalled { .. } => "stalled",
            EmfError::UnexpectedMessage => "unexpected_message",
            EmfError::StreamClosed => "stream_closed",
            EmfError::UnknownId => "unknown_id",
            EmfError::ReconnectionError => "reconnection",
            EmfError::UnclaimedPortion { .. } => "unclaimed_portion",
            EmfError::StaleStep => "stale_step",
            EmfError::RowOutOfRange => "row_out_of_range",
            EmfError::PrecisionMismatch => "precision_mismatch",
            EmfError::StoreMismatch(_) => "store_mismatch",
            EmfError::InvalidOptions(_) => "invalid_options",
            EmfError::Kernel(_) => "kernel",
            EmfError::Io(_) => "io",
            EmfError::Serialization(_) => "serialization",
            EmfError::Json(_) => "json",
            EmfError::Csv(_) => "csv",
        }
    }
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, EmfError>;
