//! Portions: the bounded units of work that one training step is split into.
//!
//! The `PortionCatalog` is built once per run from the row statistics and
//! fixes the portions of every step kind. A fresh `PortionQueue` is created
//! for every step to track which of those portions are unissued, claimed,
//! dropped or done.
use crate::factors::Side;
use crate::store::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;

mod catalog;
mod queue;

pub use crate::factors::RowRange;
pub use catalog::{row_portions, stream_portions, PortionCatalog};
pub use queue::PortionQueue;

/// The kind of a training step
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// ALS half step solving the user factors
    ByUser,
    /// ALS half step solving the item factors
    ByItem,
    Sgd,
    RmseValidate,
    RmseTest,
}

impl StepKind {
    /// The factor matrix this step writes, if any
    pub fn writes(self) -> Option<Side> {
        match self {
            StepKind::ByUser => Some(Side::User),
            StepKind::ByItem => Some(Side::Item),
            _ => None,
        }
    }

    pub fn is_rmse(self) -> bool {
        matches!(self, StepKind::RmseValidate | StepKind::RmseTest)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StepKind::ByUser => "byUser",
            StepKind::ByItem => "byItem",
            StepKind::Sgd => "sgd",
            StepKind::RmseValidate => "rmseValidate",
            StepKind::RmseTest => "rmseTest",
        };
        write!(f, "{}", name)
    }
}

/// Whoever a portion is handed out to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A worker thread of the local supervisor
    Worker(usize),
    /// A cluster node, by the id the `Lord` assigned it
    Node(usize),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Owner::Worker(id) => write!(f, "worker #{}", id),
            Owner::Node(id) => write!(f, "node #{}", id),
        }
    }
}

/// What a portion covers
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortionSpan {
    /// A contiguous range of user or item rows
    Rows(RowRange),
    /// A slice of a flat rating stream
    Stream {
        stream: Stream,
        offset: usize,
        len: usize,
    },
}

/// One unit of work of a step, immutable once built
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Portion {
    pub step: StepKind,
    pub index: usize,
    pub span: PortionSpan,
}

impl Portion {
    /// The row range, for row portions
    pub fn rows(&self) -> Option<RowRange> {
        match self.span {
            PortionSpan::Rows(r) => Some(r),
            PortionSpan::Stream { .. } => None,
        }
    }
}

impl fmt::Display for Portion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.span {
            PortionSpan::Rows(r) => {
                write!(f, "{} portion {} rows {}", self.step, self.index, r)
            }
            PortionSpan::Stream { offset, len, .. } => write!(
                f,
                "{} portion {} ratings [{}, {})",
                self.step,
                self.index,
                offset,
                offset + len
            ),
        }
    }
}
