use crate::error::{EmfError, Result};
use crate::portion::{Portion, PortionSpan, RowRange, StepKind};
use crate::store::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Splits rows into contiguous, increasing ranges whose rating counts stay
/// near `target`.
///
/// A row is never split, so a portion may hold up to
/// `max(target, max(counts))` ratings. When that would give fewer portions
/// than `threads`, the target shrinks so every thread gets work, and when
/// there are fewer rows than portions each row becomes its own portion.
/// Returns nothing if there are no ratings at all.
pub fn row_portions(
    counts: &[usize],
    target: usize,
    threads: usize,
) -> Vec<RowRange> {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return Vec::new();
    }
    let threads = threads.max(1);
    let mut target = target.max(1);
    let mut portions = (total + target - 1) / target;
    if portions < threads {
        portions = threads;
        target = ((total + threads - 1) / threads).max(1);
    }
    if counts.len() <= portions {
        return (0..counts.len()).map(|r| RowRange::new(r, r + 1)).collect();
    }

    let max_row = counts.iter().copied().max().unwrap_or(0);
    let cap = target.max(max_row);
    let mut ranges = Vec::with_capacity(portions);
    let mut from = 0;
    let mut acc = 0;
    for (row, &cnt) in counts.iter().enumerate() {
        if row > from && acc + cnt > cap {
            ranges.push(RowRange::new(from, row));
            from = row;
            acc = 0;
        }
        acc += cnt;
    }
    ranges.push(RowRange::new(from, counts.len()));
    ranges
}

/// `(offset, len)` slices of a stream of `len` ratings, `per` each
pub fn stream_portions(len: usize, per: usize) -> Vec<(usize, usize)> {
    let per = per.max(1);
    (0..(len + per - 1) / per)
        .map(|i| {
            let offset = i * per;
            (offset, per.min(len - offset))
        })
        .collect()
}

/// The portions of every step kind of one training run
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PortionCatalog {
    steps: HashMap<StepKind, Vec<Portion>>,
}

impl PortionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&mut self, step: StepKind, ranges: Vec<RowRange>) {
        let portions = ranges
            .into_iter()
            .enumerate()
            .map(|(index, r)| Portion {
                step,
                index,
                span: PortionSpan::Rows(r),
            })
            .collect();
        self.steps.insert(step, portions);
    }

    pub fn insert_stream(
        &mut self,
        step: StepKind,
        stream: Stream,
        len: usize,
        per: usize,
    ) {
        let portions = stream_portions(len, per)
            .into_iter()
            .enumerate()
            .map(|(index, (offset, len))| Portion {
                step,
                index,
                span: PortionSpan::Stream {
                    stream,
                    offset,
                    len,
                },
            })
            .collect();
        self.steps.insert(step, portions);
    }

    /// The portions of `step`, empty if the step has none
    pub fn portions(&self, step: StepKind) -> &[Portion] {
        self.steps.get(&step).map(|p| p.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self, step: StepKind) -> usize {
        self.portions(step).len()
    }

    pub fn get(&self, step: StepKind, index: usize) -> Result<&Portion> {
        self.portions(step)
            .get(index)
            .ok_or(EmfError::RowOutOfRange)
    }
}
