use crate::error::{EmfError, Result};
use crate::portion::Owner;
use log::warn;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Claim state of the portions of a single step.
///
/// Every index in `[0, total)` is in exactly one place: not yet issued
/// (`>= next` and not dropped), busy with one owner, dropped, or completed.
/// Dropped portions are handed out before fresh ones.
#[derive(Debug, Clone)]
pub struct PortionQueue {
    total: usize,
    /// First index never handed out, only moves forward
    next: usize,
    dropped: VecDeque<usize>,
    busy: HashMap<Owner, BTreeSet<usize>>,
    completed: usize,
}

impl PortionQueue {
    pub fn new(total: usize) -> Self {
        PortionQueue {
            total,
            next: 0,
            dropped: VecDeque::new(),
            busy: HashMap::new(),
            completed: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Claims up to `want` portions for `owner`, oldest dropped ones first.
    /// An empty result means nothing is left to hand out right now.
    pub fn request_portions(&mut self, owner: Owner, want: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(want.min(self.total));
        while out.len() < want {
            if let Some(idx) = self.dropped.pop_front() {
                out.push(idx);
            } else if self.next < self.total {
                out.push(self.next);
                self.next += 1;
            } else {
                break;
            }
        }
        if !out.is_empty() {
            self.busy.entry(owner).or_default().extend(out.iter().copied());
        }
        out
    }

    /// Marks `index` done by `owner`. Returns whether the step is now
    /// complete.
    pub fn report_completion(
        &mut self,
        owner: Owner,
        index: usize,
    ) -> Result<bool> {
        let held = self
            .busy
            .get_mut(&owner)
            .map(|set| set.remove(&index))
            .unwrap_or(false);
        if !held {
            return Err(EmfError::UnclaimedPortion { owner, index });
        }
        if self.busy.get(&owner).map_or(false, |set| set.is_empty()) {
            self.busy.remove(&owner);
        }
        self.completed += 1;
        Ok(self.is_complete())
    }

    /// Forgets `owner`, moving whatever it held to the back of the dropped
    /// list. Returns the dropped indices.
    pub fn drop_owner(&mut self, owner: Owner) -> Vec<usize> {
        let held: Vec<usize> = self
            .busy
            .remove(&owner)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        if !held.is_empty() {
            warn!("{} dropped portions {:?}", owner, held);
        }
        self.dropped.extend(held.iter().copied());
        held
    }

    pub fn holds(&self, owner: Owner, index: usize) -> bool {
        self.busy.get(&owner).map_or(false, |set| set.contains(&index))
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }

    /// Portions not yet completed: unissued, dropped and busy
    pub fn outstanding(&self) -> usize {
        let busy: usize = self.busy.values().map(|s| s.len()).sum();
        (self.total - self.next) + self.dropped.len() + busy
    }

    /// Whether a request could be served right now
    pub fn has_unissued(&self) -> bool {
        !self.dropped.is_empty() || self.next < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const W0: Owner = Owner::Worker(0);
    const N1: Owner = Owner::Node(1);
    const N2: Owner = Owner::Node(2);

    #[test]
    fn test_hands_out_in_order() {
        let mut q = PortionQueue::new(5);
        assert_eq!(q.request_portions(W0, 2), vec![0, 1]);
        assert_eq!(q.request_portions(N1, 10), vec![2, 3, 4]);
        assert!(q.request_portions(N2, 1).is_empty());
        assert!(!q.has_unissued());
    }

    #[test]
    fn test_dropped_portion_comes_before_fresh_work() {
        let mut q = PortionQueue::new(3);
        assert_eq!(q.request_portions(W0, 1), vec![0]);
        assert_eq!(q.request_portions(N1, 1), vec![1]);
        assert!(!q.report_completion(W0, 0).unwrap());
        assert_eq!(q.drop_owner(N1), vec![1]);
        assert_eq!(q.completed(), 1);
        assert_eq!(q.request_portions(W0, 1), vec![1]);
        assert_eq!(q.request_portions(W0, 1), vec![2]);
        assert!(!q.report_completion(W0, 1).unwrap());
        assert!(q.report_completion(W0, 2).unwrap());
    }

    #[test]
    fn test_completion_by_other_owner_is_refused() {
        let mut q = PortionQueue::new(2);
        q.request_portions(N1, 1);
        let err = q.report_completion(N2, 0).unwrap_err();
        assert_eq!(err.code(), "unclaimed_portion");
        assert!(q.holds(N1, 0));
        q.report_completion(N1, 0).unwrap();
        assert!(q.report_completion(N1, 0).is_err());
    }

    #[test]
    fn test_drop_unknown_owner_is_noop() {
        let mut q = PortionQueue::new(2);
        assert!(q.drop_owner(N2).is_empty());
        assert_eq!(q.outstanding(), 2);
    }

    #[test]
    fn test_empty_step_is_complete() {
        let q = PortionQueue::new(0);
        assert!(q.is_complete());
        assert_eq!(q.outstanding(), 0);
    }

    #[test]
    fn test_random_schedules_complete_every_portion_once() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..100 {
            let total = rng.gen_range(0..40);
            let mut q = PortionQueue::new(total);
            let owners = [W0, Owner::Worker(1), N1, N2];
            let mut done = vec![0usize; total];
            let mut held: HashMap<Owner, Vec<usize>> = HashMap::new();
            let mut last = q.outstanding();
            let mut steps = 0;
            while !q.is_complete() {
                steps += 1;
                assert!(steps < 100_000);
                let owner = owners[rng.gen_range(0..owners.len())];
                match rng.gen_range(0..10) {
                    0 => {
                        q.drop_owner(owner);
                        held.remove(&owner);
                    }
                    1..=4 => {
                        let got = q.request_portions(owner, rng.gen_range(1..4));
                        held.entry(owner).or_default().extend(got);
                    }
                    _ => {
                        if let Some(idx) =
                            held.get_mut(&owner).and_then(|v| v.pop())
                        {
                            q.report_completion(owner, idx).unwrap();
                            done[idx] += 1;
                        }
                    }
                }
                let now = q.outstanding();
                assert!(now <= last);
                last = now;
            }
            assert!(done.iter().all(|n| *n == 1));
        }
    }
}
