//! Per-run statistics and the train/validate/test split policy.
use crate::config::TrainingOptions;
use crate::error::{EmfError, Result};
use crate::factors::Side;
use crate::store::{RatingStore, RowStat, SplitCounts, Stream};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Observed split percentages may be this many points off the target
const SPLIT_TOLERANCE: f64 = 1.0;

/// Rating counts and averages of every row of one side
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RowStats {
    pub counts: Vec<usize>,
    pub avgs: Vec<f64>,
    pub max_ratings_per_row: usize,
    /// Sum of `counts`
    pub ratings: usize,
}

impl RowStats {
    fn from_rows(rows: Vec<RowStat>) -> Self {
        let counts: Vec<usize> = rows.iter().map(|r| r.count).collect();
        RowStats {
            max_ratings_per_row: counts.iter().copied().max().unwrap_or(0),
            ratings: counts.iter().sum(),
            avgs: rows.iter().map(|r| r.avg).collect(),
            counts,
        }
    }

    pub fn rows(&self) -> usize {
        self.counts.len()
    }
}

/// Everything the `Lord` learns about the data before portioning
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub users: RowStats,
    pub items: RowStats,
    pub split: SplitCounts,
    /// Ratings in the training stream (train plus validate)
    pub train_ratings: usize,
    pub validate_ratings: usize,
    pub test_ratings: usize,
    pub ratings_avg: f64,
}

impl Stats {
    /// Reads the statistics of the current split from `store`
    pub fn gather(store: &dyn RatingStore) -> Self {
        let stats = Stats {
            users: RowStats::from_rows(store.row_stats(Side::User)),
            items: RowStats::from_rows(store.row_stats(Side::Item)),
            split: store.split_counts(),
            train_ratings: store.stream_len(Stream::Train),
            validate_ratings: store.stream_len(Stream::Validate),
            test_ratings: store.stream_len(Stream::Test),
            ratings_avg: store.ratings_avg(),
        };
        debug_assert_eq!(stats.users.ratings, stats.train_ratings);
        debug_assert_eq!(stats.items.ratings, stats.train_ratings);
        stats
    }

    pub fn side(&self, side: Side) -> &RowStats {
        match side {
            Side::User => &self.users,
            Side::Item => &self.items,
        }
    }

    pub fn has_training_data(&self) -> bool {
        self.train_ratings > 0
    }
}

/// Fails with `SplitInconsistent` if any observed percentage is more than
/// one point away from its target
pub fn check_split(observed: &SplitCounts, target: [f64; 3]) -> Result<()> {
    let pcts = observed.percentages();
    let ok = observed.total() > 0
        && pcts
            .iter()
            .zip(target.iter())
            .all(|(o, t)| (o - t).abs() <= SPLIT_TOLERANCE);
    if ok {
        Ok(())
    } else {
        Err(EmfError::SplitInconsistent {
            observed: pcts,
            target,
        })
    }
}

/// Brings the split of `store` in line with the configured distribution.
///
/// Everything is resplit when forced or when the distribution changed since
/// the last run. After a previous run only new ratings are assigned. A first
/// run keeps whatever split exists. Unless everything was just resplit the
/// result is checked, and an inconsistent split is redone from scratch.
pub fn prepare_split(
    store: &dyn RatingStore,
    options: &TrainingOptions,
    force_resplit: bool,
) -> Result<SplitCounts> {
    let pcts = options.dataset_distr;
    let last = store.last_calc_info();
    let changed = last.as_ref().map_or(false, |l| l.dataset_distr != pcts);
    let (do_split, split_all) = if force_resplit || changed {
        (true, true)
    } else if last.is_some() {
        (true, false)
    } else {
        (false, true)
    };

    if do_split {
        info!(
            "Splitting {} ratings to sets train/validate/test {:?}",
            if split_all { "all" } else { "new" },
            pcts
        );
        store.split_to_sets(pcts, split_all)?;
    }
    let counts = store.split_counts();
    if !(do_split && split_all) {
        if let Err(e) = check_split(&counts, pcts) {
            warn!("{}, resplitting everything", e);
            return prepare_split(store, options, true);
        }
    }
    info!(
        "Split to sets train/validate/test {:?}: {} / {} / {}",
        counts.percentages(),
        counts.train,
        counts.validate,
        counts.test
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Algorithm;
    use crate::store::{CalcInfo, MemoryRatingStore, Rating};

    fn store() -> MemoryRatingStore {
        let ratings = (0..20)
            .flat_map(|u| {
                (0..10).map(move |i| Rating {
                    user: u,
                    item: i,
                    value: ((u + i) % 5 + 1) as f32,
                })
            })
            .collect();
        MemoryRatingStore::from_ratings(ratings)
    }

    #[test]
    fn test_check_split() {
        let counts = SplitCounts {
            train: 80,
            validate: 10,
            test: 10,
        };
        assert!(check_split(&counts, [80.0, 10.0, 10.0]).is_ok());
        assert!(check_split(&counts, [79.5, 10.5, 10.0]).is_ok());
        let err = check_split(&counts, [70.0, 20.0, 10.0]).unwrap_err();
        assert_eq!(err.code(), "split_inconsistent");
        assert!(check_split(&SplitCounts::default(), [80.0, 10.0, 10.0])
            .is_err());
    }

    #[test]
    fn test_first_run_splits_unassigned_store() {
        let store = store();
        let opts = TrainingOptions::default();
        let counts = prepare_split(&store, &opts, false).unwrap();
        assert_eq!(counts.total(), 200);
        assert_eq!(counts.train, 160);
        let stats = Stats::gather(&store);
        assert_eq!(stats.train_ratings, 180);
        assert_eq!(stats.users.ratings, 180);
        assert_eq!(stats.users.rows(), 20);
        assert!(stats.items.max_ratings_per_row <= 20);
        assert!(stats.has_training_data());
    }

    #[test]
    fn test_changed_distribution_resplits() {
        let store = store();
        let mut opts = TrainingOptions::default();
        prepare_split(&store, &opts, false).unwrap();
        store
            .save_calc_info(&CalcInfo {
                algorithm: Algorithm::Als,
                factors_count: 4,
                iterations: 1,
                dataset_distr: opts.dataset_distr,
                rmse_validate: None,
                rmse_test: None,
                rmse_test_shifted: None,
                global_avg_shift: 0.0,
                cluster_nodes: 0,
                mesh_links: 0,
                calc_count: 1,
                calc_timestamp: 0,
            })
            .unwrap();
        opts.dataset_distr = [60.0, 20.0, 20.0];
        let counts = prepare_split(&store, &opts, false).unwrap();
        assert_eq!(counts.train, 120);
        assert_eq!(counts.validate, 40);
    }
}
