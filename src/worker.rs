//! The local worker pool.
//!
//! Each worker is an OS thread that computes one portion at a time against
//! the shared `FactorStore`. Workers never pick their own work: the
//! coordinator that owns the `Supervisor` hands each idle worker one portion
//! and gets a `WorkerReport` back on its event channel when it is done, so
//! the next portion goes to whichever worker finished first.
//!
//! A worker whose portion fails or panics reports the failure and exits.
//! It is retired for the rest of the run and its portion is dropped.
use crate::config::TrainingOptions;
use crate::error::{EmfError, Result};
use crate::factors::{FactorStore, RowRange, Side};
use crate::kernel::{Kernel, RmseSums};
use crate::portion::{PortionCatalog, PortionSpan, StepKind};
use crate::store::RatingStore;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::UnboundedSender;

/// Everything a worker reads while computing portions of one run
pub struct WorkContext {
    pub options: TrainingOptions,
    pub catalog: Arc<PortionCatalog>,
    pub factors: Arc<FactorStore>,
    pub store: Arc<dyn RatingStore>,
    pub kernel: Arc<dyn Kernel>,
}

/// The step a dispatched portion belongs to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSpec {
    pub step_id: u64,
    pub kind: StepKind,
    /// Added to every prediction of an RMSE step
    pub global_avg_shift: f64,
}

/// What a finished portion produced
#[derive(Debug, Clone, PartialEq)]
pub enum PortionOutcome {
    /// These factor rows were rewritten in place
    Rows(Side, RowRange),
    Rmse(RmseSums),
    Sgd,
}

#[derive(Debug)]
pub struct WorkerReport {
    pub worker: usize,
    pub step_id: u64,
    pub portion: usize,
    pub outcome: std::result::Result<PortionOutcome, String>,
}

enum WorkerCmd {
    Run { step: StepSpec, portion: usize },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Busy(usize),
    Retired,
}

struct WorkerSlot {
    commands: Sender<WorkerCmd>,
    handle: Option<JoinHandle<()>>,
    state: WorkerState,
}

/// Owns the worker threads of one run
pub struct Supervisor {
    workers: Vec<WorkerSlot>,
    step: Option<StepSpec>,
}

/// Computes `portion` of `step`, writing factor rows in place
pub fn compute_portion(
    ctx: &WorkContext,
    step: &StepSpec,
    portion: usize,
) -> Result<PortionOutcome> {
    let p = ctx.catalog.get(step.kind, portion)?;
    let factors = &ctx.factors;
    match (step.kind, p.span) {
        (StepKind::ByUser, PortionSpan::Rows(range))
        | (StepKind::ByItem, PortionSpan::Rows(range)) => {
            let side = if step.kind == StepKind::ByUser {
                Side::User
            } else {
                Side::Item
            };
            let ratings: Vec<Vec<(usize, f32)>> = range
                .iter()
                .map(|row| ctx.store.row_ratings(side, row))
                .collect();
            let mut out = factors.side(side).rows_mut(range)?;
            ctx.kernel.als_rows(
                &mut out,
                &ratings,
                factors.side(side.opposite()),
                ctx.options.als.lambda,
            )?;
            Ok(PortionOutcome::Rows(side, range))
        }
        (StepKind::Sgd, PortionSpan::Stream { stream, offset, len }) => {
            let ratings = ctx.store.stream_slice(stream, offset, len);
            let mut users = factors.users.rows_mut(factors.users.full_range())?;
            let mut items = factors.items.rows_mut(factors.items.full_range())?;
            ctx.kernel
                .sgd(&ratings, &mut users, &mut items, &ctx.options.sgd)?;
            Ok(PortionOutcome::Sgd)
        }
        (kind, PortionSpan::Stream { stream, offset, len }) if kind.is_rmse() => {
            let ratings = ctx.store.stream_slice(stream, offset, len);
            let sums = ctx.kernel.rmse(
                &ratings,
                &factors.users,
                &factors.items,
                step.global_avg_shift,
            );
            Ok(PortionOutcome::Rmse(sums))
        }
        (kind, _) => Err(EmfError::Kernel(format!(
            "portion {} does not fit a {} step",
            p, kind
        ))),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn run_worker(
    id: usize,
    ctx: Arc<WorkContext>,
    commands: Receiver<WorkerCmd>,
    reports: UnboundedSender<WorkerReport>,
) {
    while let Ok(cmd) = commands.recv() {
        let (step, portion) = match cmd {
            WorkerCmd::Shutdown => break,
            WorkerCmd::Run { step, portion } => (step, portion),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            compute_portion(&ctx, &step, portion)
        }));
        let outcome = match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(panic_message(payload)),
        };
        let failed = outcome.is_err();
        let report = WorkerReport {
            worker: id,
            step_id: step.step_id,
            portion,
            outcome,
        };
        if reports.send(report).is_err() || failed {
            break;
        }
    }
    debug!("Worker #{} exiting", id);
}

impl Supervisor {
    /// Starts `threads` workers that report to `reports`
    pub fn spawn(
        ctx: Arc<WorkContext>,
        threads: usize,
        reports: UnboundedSender<WorkerReport>,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let (tx, rx) = unbounded();
            let ctx = ctx.clone();
            let reports = reports.clone();
            let handle = thread::Builder::new()
                .name(format!("emf-worker-{}", id))
                .spawn(move || run_worker(id, ctx, rx, reports))?;
            workers.push(WorkerSlot {
                commands: tx,
                handle: Some(handle),
                state: WorkerState::Idle,
            });
        }
        info!("Started {} workers", threads);
        Ok(Supervisor {
            workers,
            step: None,
        })
    }

    /// Every following dispatch belongs to `step`
    pub fn start_step(&mut self, step: StepSpec) {
        debug!("Workers switching to {} step #{}", step.kind, step.step_id);
        self.step = Some(step);
    }

    pub fn idle_workers(&self) -> Vec<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.state == WorkerState::Idle)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state != WorkerState::Retired)
            .count()
    }

    /// The portion `worker` is computing, if any
    pub fn busy_with(&self, worker: usize) -> Option<usize> {
        match self.workers.get(worker).map(|w| w.state) {
            Some(WorkerState::Busy(p)) => Some(p),
            _ => None,
        }
    }

    /// Hands `portion` of the current step to an idle `worker`
    pub fn dispatch(&mut self, worker: usize, portion: usize) -> Result<()> {
        let step = self.step.ok_or(EmfError::StaleStep)?;
        let slot = self.workers.get_mut(worker).ok_or(EmfError::UnknownId)?;
        if slot.state != WorkerState::Idle {
            return Err(EmfError::UnknownId);
        }
        if slot.commands.send(WorkerCmd::Run { step, portion }).is_err() {
            slot.state = WorkerState::Retired;
            return Err(EmfError::StreamClosed);
        }
        slot.state = WorkerState::Busy(portion);
        Ok(())
    }

    /// Records a report. A failed worker is retired.
    pub fn on_report(&mut self, report: &WorkerReport) {
        let slot = match self.workers.get_mut(report.worker) {
            Some(slot) => slot,
            None => return,
        };
        match &report.outcome {
            Ok(_) => slot.state = WorkerState::Idle,
            Err(e) => {
                error!(
                    "Worker #{} failed on portion {}: {}",
                    report.worker, report.portion, e
                );
                slot.state = WorkerState::Retired;
            }
        }
    }

    /// Tells every worker to exit without waiting for it. A worker stuck in
    /// the kernel is detached and exits once its portion returns.
    pub fn stop(&mut self) {
        for slot in self.workers.iter_mut() {
            if slot.state != WorkerState::Retired {
                let _ = slot.commands.send(WorkerCmd::Shutdown);
                slot.state = WorkerState::Retired;
            }
            slot.handle.take();
        }
    }

    /// Stops every worker and waits for them to exit, off the async threads
    pub async fn join(mut self) {
        let mut handles = Vec::with_capacity(self.workers.len());
        for slot in self.workers.iter_mut() {
            if slot.state != WorkerState::Retired {
                let _ = slot.commands.send(WorkerCmd::Shutdown);
                slot.state = WorkerState::Retired;
            }
            handles.extend(slot.handle.take());
        }
        let joined = tokio::task::spawn_blocking(move || {
            handles.into_iter().map(|h| h.join()).filter(|r| r.is_err()).count()
        })
        .await;
        match joined {
            Ok(0) => debug!("All workers stopped"),
            Ok(n) => error!("{} worker threads panicked while stopping", n),
            Err(e) => error!("Failed to join the workers: {}", e),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::factors::FactorMatrix;
    use crate::portion::row_portions;
    use crate::store::{MemoryRatingStore, Rating, Stream};
    use tokio::sync::mpsc::unbounded_channel;

    struct PanicKernel;

    impl Kernel for PanicKernel {
        fn als_rows(
            &self,
            _out: &mut crate::factors::RowsMut<'_>,
            _ratings: &[Vec<(usize, f32)>],
            _other: &FactorMatrix,
            _lambda: f64,
        ) -> Result<()> {
            panic!("boom")
        }

        fn sgd(
            &self,
            _ratings: &[Rating],
            _users: &mut crate::factors::RowsMut<'_>,
            _items: &mut crate::factors::RowsMut<'_>,
            _params: &crate::config::SgdParams,
        ) -> Result<()> {
            Ok(())
        }

        fn rmse(
            &self,
            _ratings: &[Rating],
            _users: &FactorMatrix,
            _items: &FactorMatrix,
            _shift: f64,
        ) -> RmseSums {
            RmseSums::default()
        }
    }

    fn context(kernel: Arc<dyn Kernel>) -> Arc<WorkContext> {
        let ratings = (0..6)
            .flat_map(|u| {
                (0..4).map(move |i| Rating {
                    user: u,
                    item: i,
                    value: (1 + (u * i) % 5) as f32,
                })
            })
            .collect();
        let store = MemoryRatingStore::from_ratings(ratings);
        store.split_to_sets([100.0, 0.0, 0.0], true).unwrap();
        let mut catalog = PortionCatalog::new();
        catalog.insert_rows(StepKind::ByUser, row_portions(&[4; 6], 8, 1));
        catalog.insert_stream(StepKind::RmseTest, Stream::Train, 24, 10);
        let mut options = TrainingOptions::default();
        options.factors_count = 2;
        let factors = FactorStore::new(
            FactorMatrix::zeroed(6, 2, Precision::Single),
            FactorMatrix::random(
                4,
                2,
                Precision::Single,
                &mut rand::thread_rng(),
            ),
        );
        Arc::new(WorkContext {
            options,
            catalog: Arc::new(catalog),
            factors: Arc::new(factors),
            store: Arc::new(store),
            kernel,
        })
    }

    fn step(kind: StepKind) -> StepSpec {
        StepSpec {
            step_id: 1,
            kind,
            global_avg_shift: 0.0,
        }
    }

    #[tokio::test]
    async fn test_greedy_dispatch_covers_all_portions() {
        let ctx = context(Arc::new(crate::kernel::NativeKernel));
        let total = ctx.catalog.len(StepKind::ByUser);
        let (tx, mut rx) = unbounded_channel();
        let mut sup = Supervisor::spawn(ctx.clone(), 2, tx).unwrap();
        sup.start_step(step(StepKind::ByUser));
        let mut next = 0;
        for w in sup.idle_workers() {
            sup.dispatch(w, next).unwrap();
            next += 1;
        }
        let mut done = 0;
        while done < total {
            let report = rx.recv().await.unwrap();
            sup.on_report(&report);
            assert!(matches!(report.outcome, Ok(PortionOutcome::Rows(..))));
            done += 1;
            if next < total {
                sup.dispatch(report.worker, next).unwrap();
                next += 1;
            }
        }
        sup.join().await;
        assert!(ctx.factors.users.row(5).iter().any(|v| *v != 0.0));
    }

    #[tokio::test]
    async fn test_rmse_portion_reports_sums() {
        let ctx = context(Arc::new(crate::kernel::NativeKernel));
        let (tx, mut rx) = unbounded_channel();
        let mut sup = Supervisor::spawn(ctx, 1, tx).unwrap();
        sup.start_step(step(StepKind::RmseTest));
        sup.dispatch(0, 2).unwrap();
        let report = rx.recv().await.unwrap();
        match report.outcome {
            Ok(PortionOutcome::Rmse(sums)) => assert_eq!(sums.count, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_is_retired() {
        let ctx = context(Arc::new(PanicKernel));
        let (tx, mut rx) = unbounded_channel();
        let mut sup = Supervisor::spawn(ctx, 2, tx).unwrap();
        sup.start_step(step(StepKind::ByUser));
        sup.dispatch(1, 0).unwrap();
        assert_eq!(sup.busy_with(1), Some(0));
        let report = rx.recv().await.unwrap();
        assert_eq!(report.worker, 1);
        assert!(report.outcome.is_err());
        sup.on_report(&report);
        assert_eq!(sup.live_workers(), 1);
        assert_eq!(sup.idle_workers(), vec![0]);
        assert!(sup.dispatch(1, 1).is_err());
    }
}
