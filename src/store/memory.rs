//! An in-memory `RatingStore`, loaded from a `user,item,rating` CSV file.
use crate::error::{EmfError, Result};
use crate::factors::{FactorMatrix, Side};
use crate::store::{
    CalcInfo, Dataset, Rating, RatingStore, RowStat, SplitCounts,
    SplitSnapshot, Stream,
};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const CALC_INFO_FILE: &str = "calc_info.json";
const USER_FACTORS_FILE: &str = "users.factors";
const ITEM_FACTORS_FILE: &str = "items.factors";
const UNASSIGNED: u8 = 0;

#[derive(Debug, Default)]
struct Sets {
    /// Dataset code per rating, `UNASSIGNED` if not split yet
    codes: Vec<u8>,
    /// Indices of train and validate ratings, in stream order
    train: Vec<usize>,
    validate: Vec<usize>,
    test: Vec<usize>,
}

impl Sets {
    fn rebuild_streams(&mut self) {
        self.train.clear();
        self.validate.clear();
        self.test.clear();
        for (idx, code) in self.codes.iter().enumerate() {
            match Dataset::from_code(*code) {
                Some(Dataset::Train) => self.train.push(idx),
                Some(Dataset::Validate) => {
                    self.train.push(idx);
                    self.validate.push(idx);
                }
                Some(Dataset::Test) => self.test.push(idx),
                None => (),
            }
        }
    }

    fn in_training_stream(&self, idx: usize) -> bool {
        matches!(
            Dataset::from_code(self.codes[idx]),
            Some(Dataset::Train) | Some(Dataset::Validate)
        )
    }
}

/// Keeps every rating in memory. Optionally persists factors and the last
/// `CalcInfo` to an output directory.
#[derive(Debug)]
pub struct MemoryRatingStore {
    ratings: Vec<Rating>,
    users: usize,
    items: usize,
    by_user: Vec<Vec<usize>>,
    by_item: Vec<Vec<usize>>,
    seed: u64,
    out_dir: Option<PathBuf>,
    sets: RwLock<Sets>,
    last_calc: RwLock<Option<CalcInfo>>,
}

impl MemoryRatingStore {
    /// Creates a store holding the given ratings, none of them split yet
    pub fn from_ratings(ratings: Vec<Rating>) -> Self {
        let mut store = MemoryRatingStore {
            ratings: Vec::new(),
            users: 0,
            items: 0,
            by_user: Vec::new(),
            by_item: Vec::new(),
            seed: 0,
            out_dir: None,
            sets: RwLock::new(Sets::default()),
            last_calc: RwLock::new(None),
        };
        store.add_ratings(ratings);
        store
    }

    /// Reads a headerless `user,item,rating` CSV file with 1-based ids
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        let mut ratings = Vec::new();
        for record in reader.deserialize() {
            let (user, item, value): (usize, usize, f32) = record?;
            if user == 0 || item == 0 {
                return Err(EmfError::RowOutOfRange);
            }
            ratings.push(Rating {
                user: user - 1,
                item: item - 1,
                value,
            });
        }
        info!(
            "Loaded {} ratings from {}",
            ratings.len(),
            path.as_ref().display()
        );
        Ok(MemoryRatingStore::from_ratings(ratings))
    }

    /// Seed for the per-user shuffles done while splitting
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Persist factors and calc info under `dir`, picking up the calc info
    /// of a previous run if one is there
    pub fn with_output_dir<P: AsRef<Path>>(mut self, dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let info_path = dir.join(CALC_INFO_FILE);
        if info_path.exists() {
            let info: CalcInfo =
                serde_json::from_reader(BufReader::new(File::open(info_path)?))?;
            debug!("Found previous calc info: {:?}", info);
            *self.last_calc.get_mut().unwrap_or_else(|e| e.into_inner()) =
                Some(info);
        }
        self.out_dir = Some(dir);
        Ok(self)
    }

    /// Appends new, not yet split ratings
    pub fn add_ratings<I: IntoIterator<Item = Rating>>(&mut self, new: I) {
        let sets = self.sets.get_mut().unwrap_or_else(|e| e.into_inner());
        for r in new {
            let idx = self.ratings.len();
            self.users = self.users.max(r.user + 1);
            self.items = self.items.max(r.item + 1);
            if self.by_user.len() < self.users {
                self.by_user.resize(self.users, Vec::new());
            }
            if self.by_item.len() < self.items {
                self.by_item.resize(self.items, Vec::new());
            }
            self.by_user[r.user].push(idx);
            self.by_item[r.item].push(idx);
            self.ratings.push(r);
            sets.codes.push(UNASSIGNED);
        }
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    fn rows(&self, side: Side) -> &[Vec<usize>] {
        match side {
            Side::User => &self.by_user,
            Side::Item => &self.by_item,
        }
    }

    fn read_sets(&self) -> std::sync::RwLockReadGuard<'_, Sets> {
        self.sets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_sets(&self) -> std::sync::RwLockWriteGuard<'_, Sets> {
        self.sets.write().unwrap_or_else(|e| e.into_inner())
    }

    fn factors_path(&self, side: Side) -> Option<PathBuf> {
        let name = match side {
            Side::User => USER_FACTORS_FILE,
            Side::Item => ITEM_FACTORS_FILE,
        };
        self.out_dir.as_ref().map(|d| d.join(name))
    }
}

/// Per-set target counts for `total` ratings, the rest goes to test
fn target_counts(total: usize, pcts: [f64; 3]) -> [usize; 3] {
    // guard against 80.0000001 rounding up a whole rating
    let ceil = |x: f64| (x - 1e-9).ceil().max(0.0) as usize;
    let t0 = ceil(total as f64 * pcts[0] / 100.0).min(total);
    let t1 = ceil(total as f64 * (pcts[0] + pcts[1]) / 100.0)
        .min(total)
        .saturating_sub(t0);
    [t0, t1, total - t0 - t1]
}

impl RatingStore for MemoryRatingStore {
    fn row_count(&self, side: Side) -> usize {
        match side {
            Side::User => self.users,
            Side::Item => self.items,
        }
    }

    fn row_stats(&self, side: Side) -> Vec<RowStat> {
        let sets = self.read_sets();
        self.rows(side)
            .iter()
            .map(|idxs| {
                let mut stat = RowStat::default();
                let mut sum = 0.0;
                for idx in idxs.iter().filter(|i| sets.in_training_stream(**i))
                {
                    stat.count += 1;
                    sum += self.ratings[*idx].value as f64;
                }
                if stat.count > 0 {
                    stat.avg = sum / stat.count as f64;
                }
                stat
            })
            .collect()
    }

    fn split_counts(&self) -> SplitCounts {
        let sets = self.read_sets();
        let mut counts = SplitCounts::default();
        for code in sets.codes.iter() {
            match Dataset::from_code(*code) {
                Some(Dataset::Train) => counts.train += 1,
                Some(Dataset::Validate) => counts.validate += 1,
                Some(Dataset::Test) => counts.test += 1,
                None => (),
            }
        }
        counts
    }

    fn ratings_avg(&self) -> f64 {
        let sets = self.read_sets();
        let (sum, cnt) = sets
            .codes
            .iter()
            .zip(self.ratings.iter())
            .filter(|(code, _)| **code != UNASSIGNED)
            .fold((0.0, 0usize), |(s, c), (_, r)| (s + r.value as f64, c + 1));
        if cnt == 0 {
            0.0
        } else {
            sum / cnt as f64
        }
    }

    fn row_ratings(&self, side: Side, row: usize) -> Vec<(usize, f32)> {
        let sets = self.read_sets();
        match self.rows(side).get(row) {
            None => Vec::new(),
            Some(idxs) => idxs
                .iter()
                .filter(|i| sets.in_training_stream(**i))
                .map(|i| {
                    let r = &self.ratings[*i];
                    match side {
                        Side::User => (r.item, r.value),
                        Side::Item => (r.user, r.value),
                    }
                })
                .collect(),
        }
    }

    fn stream_len(&self, stream: Stream) -> usize {
        let sets = self.read_sets();
        match stream {
            Stream::Train => sets.train.len(),
            Stream::Validate => sets.validate.len(),
            Stream::Test => sets.test.len(),
        }
    }

    fn stream_slice(
        &self,
        stream: Stream,
        offset: usize,
        len: usize,
    ) -> Vec<Rating> {
        let sets = self.read_sets();
        let idxs = match stream {
            Stream::Train => &sets.train,
            Stream::Validate => &sets.validate,
            Stream::Test => &sets.test,
        };
        let from = offset.min(idxs.len());
        let to = offset.saturating_add(len).min(idxs.len());
        idxs[from..to].iter().map(|i| self.ratings[*i]).collect()
    }

    fn split_to_sets(&self, pcts: [f64; 3], split_all: bool) -> Result<()> {
        let mut sets = self.write_sets();
        if split_all {
            sets.codes.iter_mut().for_each(|c| *c = UNASSIGNED);
        }
        for (user, idxs) in self.by_user.iter().enumerate() {
            let mut free = Vec::new();
            let mut existing = [0usize; 3];
            for idx in idxs {
                match Dataset::from_code(sets.codes[*idx]) {
                    None => free.push(*idx),
                    Some(d) => existing[d.code() as usize - 1] += 1,
                }
            }
            if free.is_empty() {
                continue;
            }
            let targets = target_counts(idxs.len(), pcts);
            let mut wanted = [0usize; 3];
            for i in 0..3 {
                wanted[i] = targets[i].saturating_sub(existing[i]);
            }
            let assigned: usize = wanted.iter().sum();
            if assigned < free.len() {
                wanted[0] += free.len() - assigned;
            }
            let mut rng =
                StdRng::seed_from_u64(self.seed.wrapping_add(user as u64));
            free.shuffle(&mut rng);
            let mut offset = 0;
            let datasets = [Dataset::Train, Dataset::Validate, Dataset::Test];
            for (i, dataset) in datasets.iter().enumerate() {
                let to = (offset + wanted[i]).min(free.len());
                for idx in &free[offset..to] {
                    sets.codes[*idx] = dataset.code();
                }
                offset = to;
            }
        }
        sets.rebuild_streams();
        Ok(())
    }

    fn export_split(&self) -> SplitSnapshot {
        SplitSnapshot {
            sets: self.read_sets().codes.clone(),
        }
    }

    fn import_split(&self, snapshot: &SplitSnapshot) -> Result<()> {
        if snapshot.sets.len() != self.ratings.len() {
            return Err(EmfError::StoreMismatch(format!(
                "split covers {} ratings, store has {}",
                snapshot.sets.len(),
                self.ratings.len()
            )));
        }
        let mut sets = self.write_sets();
        sets.codes.clone_from(&snapshot.sets);
        sets.rebuild_streams();
        Ok(())
    }

    fn reshuffle_train(&self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.write_sets().train.shuffle(&mut rng);
        Ok(())
    }

    fn last_calc_info(&self) -> Option<CalcInfo> {
        self.last_calc
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn save_calc_info(&self, info: &CalcInfo) -> Result<()> {
        if let Some(dir) = &self.out_dir {
            let file = BufWriter::new(File::create(dir.join(CALC_INFO_FILE))?);
            serde_json::to_writer_pretty(file, info)?;
        }
        *self.last_calc.write().unwrap_or_else(|e| e.into_inner()) =
            Some(info.clone());
        Ok(())
    }

    fn save_factors(
        &self,
        users: &FactorMatrix,
        items: &FactorMatrix,
    ) -> Result<()> {
        for (side, matrix) in [(Side::User, users), (Side::Item, items)] {
            if let Some(path) = self.factors_path(side) {
                let mut file = BufWriter::new(File::create(&path)?);
                matrix.write_to(&mut file)?;
                debug!("Saved {} factors to {}", side, path.display());
            }
        }
        Ok(())
    }

    fn load_factors(&self, side: Side) -> Result<Option<FactorMatrix>> {
        match self.factors_path(side) {
            Some(path) if path.exists() => {
                let mut file = BufReader::new(File::open(path)?);
                Ok(Some(FactorMatrix::read_from(&mut file)?))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn init(users: usize, per_user: usize) -> MemoryRatingStore {
        let mut ratings = Vec::new();
        for u in 0..users {
            for i in 0..per_user {
                ratings.push(Rating {
                    user: u,
                    item: i,
                    value: ((u + i) % 5 + 1) as f32,
                });
            }
        }
        MemoryRatingStore::from_ratings(ratings)
    }

    #[test]
    fn test_target_counts() {
        assert_eq!(target_counts(10, [80.0, 10.0, 10.0]), [8, 1, 1]);
        assert_eq!(target_counts(3, [80.0, 10.0, 10.0]), [3, 0, 0]);
        assert_eq!(target_counts(7, [100.0, 0.0, 0.0]), [7, 0, 0]);
    }

    #[test]
    fn test_split_all() {
        let store = init(4, 10);
        store.split_to_sets([80.0, 10.0, 10.0], true).unwrap();
        let counts = store.split_counts();
        assert_eq!(counts.train, 32);
        assert_eq!(counts.validate, 4);
        assert_eq!(counts.test, 4);
        assert_eq!(store.stream_len(Stream::Train), 36);
        assert_eq!(store.stream_len(Stream::Test), 4);
        let stats = store.row_stats(Side::User);
        assert!(stats.iter().all(|s| s.count == 9));
    }

    #[test]
    fn test_split_new_only_keeps_existing() {
        let mut store = init(1, 10);
        store.split_to_sets([80.0, 10.0, 10.0], true).unwrap();
        let before = store.export_split();
        store.add_ratings((10..20).map(|i| Rating {
            user: 0,
            item: i,
            value: 3.0,
        }));
        store.split_to_sets([80.0, 10.0, 10.0], false).unwrap();
        let after = store.export_split();
        assert_eq!(&after.sets[..10], &before.sets[..]);
        assert!(after.sets.iter().all(|c| *c != UNASSIGNED));
        let counts = store.split_counts();
        assert_eq!(counts, SplitCounts { train: 16, validate: 2, test: 2 });
    }

    #[test]
    fn test_import_split_rejects_other_store() {
        let a = init(2, 5);
        let b = init(2, 6);
        a.split_to_sets([80.0, 10.0, 10.0], true).unwrap();
        let err = b.import_split(&a.export_split()).unwrap_err();
        assert_eq!(err.code(), "store_mismatch");
    }

    #[test]
    fn test_reshuffle_keeps_ratings() {
        let store = init(3, 10);
        store.split_to_sets([100.0, 0.0, 0.0], true).unwrap();
        let mut before = store.stream_slice(Stream::Train, 0, 30);
        store.reshuffle_train(7).unwrap();
        let mut after = store.stream_slice(Stream::Train, 0, 30);
        assert_ne!(before, after);
        let key = |r: &Rating| (r.user, r.item);
        before.sort_by_key(key);
        after.sort_by_key(key);
        assert_eq!(before, after);
    }

    #[test]
    fn test_from_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1,1,5\n1,2,3.5\n2, 2, 1").unwrap();
        let store = MemoryRatingStore::from_csv(file.path()).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.row_count(Side::User), 2);
        assert_eq!(store.row_count(Side::Item), 2);
        store.split_to_sets([100.0, 0.0, 0.0], true).unwrap();
        assert_eq!(store.row_ratings(Side::Item, 1), vec![(0, 3.5), (1, 1.0)]);
    }

    #[test]
    fn test_calc_info_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = init(1, 1).with_output_dir(dir.path()).unwrap();
        assert!(store.last_calc_info().is_none());
        let info = CalcInfo {
            algorithm: crate::config::Algorithm::Als,
            factors_count: 4,
            iterations: 2,
            dataset_distr: [80.0, 10.0, 10.0],
            rmse_validate: Some(0.5),
            rmse_test: None,
            rmse_test_shifted: None,
            global_avg_shift: 0.0,
            cluster_nodes: 0,
            mesh_links: 0,
            calc_count: 1,
            calc_timestamp: 0,
        };
        store.save_calc_info(&info).unwrap();
        let reopened = init(1, 1).with_output_dir(dir.path()).unwrap();
        assert_eq!(reopened.last_calc_info(), Some(info));
    }
}
