//! Options for a training run.
//!
//! A `TrainingOptions` value is fixed for the whole run: the `Lord` reads it
//! once, validates it, and ships a copy to every `Chief` while syncing so the
//! whole cluster portions and computes the same way.
use crate::error::{EmfError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// The factorization algorithm
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Alternating least squares, parallel and distributable
    Als,
    /// Stochastic gradient descent, one local worker only
    Sgd,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Algorithm::Als => write!(f, "als"),
            Algorithm::Sgd => write!(f, "sgd"),
        }
    }
}

/// Width of a single factor element in the factor store
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    /// The number of bytes per factor element
    pub fn width(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

/// A value configured separately for each `Algorithm`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerAlgorithm<T> {
    pub als: T,
    pub sgd: T,
}

impl<T: Copy> PerAlgorithm<T> {
    pub fn get(&self, alg: Algorithm) -> T {
        match alg {
            Algorithm::Als => self.als,
            Algorithm::Sgd => self.sgd,
        }
    }
}

/// Target ratings per portion for the two ALS half steps
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlsPortionTargets {
    pub by_user: usize,
    pub by_item: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AlsParams {
    /// Regularization, scaled by the number of ratings in a row
    pub lambda: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SgdParams {
    pub learning_rate: f64,
    pub lambda: f64,
}

/// Immutable per-run options
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainingOptions {
    pub algorithm: Algorithm,
    pub factors_count: usize,
    pub train_iters: usize,
    /// Worker threads per algorithm, `0` means one per CPU. SGD updates are
    /// not row-disjoint, so `sgd` may only be `0` or `1` and both mean a
    /// single local worker.
    pub num_threads_for_train: PerAlgorithm<usize>,
    pub ratings_in_portion_for_als: AlsPortionTargets,
    pub ratings_in_portion_for_rmse: usize,
    pub ratings_in_portion_for_sgd: usize,
    /// `[train, validate, test]` percentages, summing to 100
    pub dataset_distr: [f64; 3],
    pub use_clustering: bool,
    pub cluster_server_port: u16,
    pub use_double_precision: bool,
    /// Compute a third RMSE pass over the test set shifted by the mean error
    pub use_global_avg_shift: bool,
    pub als: AlsParams,
    pub sgd: SgdParams,
    /// How long a step may go without a single completion
    pub step_stall_timeout_secs: u64,
    pub seed: u64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        TrainingOptions {
            algorithm: Algorithm::Als,
            factors_count: 100,
            train_iters: 10,
            num_threads_for_train: PerAlgorithm { als: 0, sgd: 1 },
            ratings_in_portion_for_als: AlsPortionTargets {
                by_user: 5_000,
                by_item: 5_000,
            },
            ratings_in_portion_for_rmse: 50_000,
            ratings_in_portion_for_sgd: 50_000,
            dataset_distr: [80.0, 10.0, 10.0],
            use_clustering: false,
            cluster_server_port: 7101,
            use_double_precision: false,
            use_global_avg_shift: true,
            als: AlsParams { lambda: 0.1 },
            sgd: SgdParams {
                learning_rate: 0.005,
                lambda: 0.02,
            },
            step_stall_timeout_secs: 600,
            seed: 42,
        }
    }
}

impl TrainingOptions {
    /// Reads options from a JSON file, missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let options: TrainingOptions = serde_json::from_reader(file)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.factors_count == 0 {
            return Err(EmfError::InvalidOptions(
                "factors_count must be at least 1".to_string(),
            ));
        }
        let total: f64 = self.dataset_distr.iter().sum();
        if (total - 100.0).abs() > 1e-6
            || self.dataset_distr.iter().any(|p| *p < 0.0)
        {
            return Err(EmfError::InvalidOptions(format!(
                "dataset_distr {:?} must be non-negative and sum to 100",
                self.dataset_distr
            )));
        }
        if self.ratings_in_portion_for_als.by_user == 0
            || self.ratings_in_portion_for_als.by_item == 0
            || self.ratings_in_portion_for_rmse == 0
            || self.ratings_in_portion_for_sgd == 0
        {
            return Err(EmfError::InvalidOptions(
                "ratings per portion must be positive".to_string(),
            ));
        }
        if self.num_threads_for_train.sgd > 1 {
            return Err(EmfError::InvalidOptions(format!(
                "num_threads_for_train.sgd is {}, SGD runs on one worker",
                self.num_threads_for_train.sgd
            )));
        }
        Ok(())
    }

    pub fn precision(&self) -> Precision {
        if self.use_double_precision {
            Precision::Double
        } else {
            Precision::Single
        }
    }

    /// The number of local workers for the configured algorithm. SGD updates
    /// are not row-disjoint so it always gets exactly one.
    pub fn num_threads(&self) -> usize {
        match self.algorithm {
            Algorithm::Sgd => 1,
            Algorithm::Als => {
                match self.num_threads_for_train.get(self.algorithm) {
                    0 => num_cpus::get(),
                    n => n,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TrainingOptions::default().validate().is_ok());
    }

    #[test]
    fn test_bad_split_rejected() {
        let mut opts = TrainingOptions::default();
        opts.dataset_distr = [80.0, 10.0, 5.0];
        let err = opts.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_options");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let opts: TrainingOptions =
            serde_json::from_str(r#"{"algorithm": "sgd", "factors_count": 8}"#)
                .unwrap();
        assert_eq!(opts.algorithm, Algorithm::Sgd);
        assert_eq!(opts.factors_count, 8);
        assert_eq!(opts.train_iters, 10);
        assert_eq!(opts.num_threads(), 1);
    }

    #[test]
    fn test_sgd_threads_capped_at_one() {
        let mut opts = TrainingOptions::default();
        opts.algorithm = Algorithm::Sgd;
        opts.num_threads_for_train.sgd = 0;
        assert!(opts.validate().is_ok());
        assert_eq!(opts.num_threads(), 1);

        opts.num_threads_for_train.sgd = 4;
        let err = opts.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_options");
        assert!(err.to_string().contains("num_threads_for_train.sgd"));
    }

    #[test]
    fn test_zero_threads_means_all_cpus() {
        let opts = TrainingOptions::default();
        assert_eq!(opts.num_threads(), num_cpus::get());
    }
}
