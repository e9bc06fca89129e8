//! The rating store that training reads from and writes results back to.
//!
//! The store owns the ratings, their assignment to the train / validate /
//! test sets, and the bookkeeping of the previous run (`CalcInfo`). Training
//! only ever talks to it through the `RatingStore` trait, so a database
//! backed store can be dropped in without touching the coordinator.
//!
//! The *training stream* is every rating assigned to either the train or
//! the validate set: validate ratings also train the model, which makes the
//! validate RMSE a measure of fit. Test ratings are held out.
use crate::config::Algorithm;
use crate::error::Result;
use crate::factors::{FactorMatrix, Side};
use serde::{Deserialize, Serialize};

mod memory;
pub use memory::MemoryRatingStore;

/// The set a rating is assigned to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    Train,
    Validate,
    Test,
}

impl Dataset {
    pub(crate) fn code(self) -> u8 {
        match self {
            Dataset::Train => 1,
            Dataset::Validate => 2,
            Dataset::Test => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Dataset::Train),
            2 => Some(Dataset::Validate),
            3 => Some(Dataset::Test),
            _ => None,
        }
    }
}

/// A flat stream of ratings that portions slice by offset
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Train and validate ratings, in the current (possibly shuffled) order
    Train,
    Validate,
    Test,
}

/// A single rating, ids are 0-based
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Rating {
    pub user: usize,
    pub item: usize,
    pub value: f32,
}

/// Rating count and average of one row over the training stream
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct RowStat {
    pub count: usize,
    pub avg: f64,
}

/// Number of ratings assigned to each set
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitCounts {
    pub train: usize,
    pub validate: usize,
    pub test: usize,
}

impl SplitCounts {
    pub fn total(&self) -> usize {
        self.train + self.validate + self.test
    }

    /// `[train, validate, test]` as percentages of the assigned ratings
    pub fn percentages(&self) -> [f64; 3] {
        let total = self.total();
        if total == 0 {
            return [0.0; 3];
        }
        let pct = |n: usize| n as f64 / total as f64 * 100.0;
        [pct(self.train), pct(self.validate), pct(self.test)]
    }
}

/// The split of every rating, in store order. `0` means not yet assigned,
/// otherwise a `Dataset` code. Shipped to cluster nodes so that every node
/// slices the same streams.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SplitSnapshot {
    pub sets: Vec<u8>,
}

/// Snapshot of a finished run, compared against on the next run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CalcInfo {
    pub algorithm: Algorithm,
    pub factors_count: usize,
    pub iterations: usize,
    pub dataset_distr: [f64; 3],
    pub rmse_validate: Option<f64>,
    pub rmse_test: Option<f64>,
    pub rmse_test_shifted: Option<f64>,
    pub global_avg_shift: f64,
    /// Cluster nodes that took part in the run
    pub cluster_nodes: usize,
    /// Directed peer connections acknowledged while gathering
    pub mesh_links: usize,
    pub calc_count: usize,
    /// Seconds since the unix epoch
    pub calc_timestamp: u64,
}

/// Everything training needs from the rating store
pub trait RatingStore: Send + Sync {
    /// Number of rows (max id) on the given side
    fn row_count(&self, side: Side) -> usize;

    /// Per-row rating count and average over the training stream
    fn row_stats(&self, side: Side) -> Vec<RowStat>;

    fn split_counts(&self) -> SplitCounts;

    /// Average of all assigned ratings
    fn ratings_avg(&self) -> f64;

    /// `(column, value)` pairs of the training stream ratings in `row`
    fn row_ratings(&self, side: Side, row: usize) -> Vec<(usize, f32)>;

    fn stream_len(&self, stream: Stream) -> usize;

    fn stream_slice(&self, stream: Stream, offset: usize, len: usize)
        -> Vec<Rating>;

    /// Assign ratings to sets. When `split_all` is false only ratings
    /// without a set are assigned.
    fn split_to_sets(&self, pcts: [f64; 3], split_all: bool) -> Result<()>;

    fn export_split(&self) -> SplitSnapshot;

    fn import_split(&self, snapshot: &SplitSnapshot) -> Result<()>;

    /// Randomize the order of the training stream
    fn reshuffle_train(&self, seed: u64) -> Result<()>;

    fn last_calc_info(&self) -> Option<CalcInfo>;

    fn save_calc_info(&self, info: &CalcInfo) -> Result<()>;

    fn save_factors(&self, users: &FactorMatrix, items: &FactorMatrix)
        -> Result<()>;

    /// Factors saved by a previous run, if any
    fn load_factors(&self, _side: Side) -> Result<Option<FactorMatrix>> {
        Ok(None)
    }
}
