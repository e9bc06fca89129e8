//! The `Lord`: the top coordinator of a training run.
//!
//! The `Lord` runs as a single tokio task that owns every piece of mutable
//! coordination state: the registered cluster nodes, the `PortionQueue` of
//! the running step, the RMSE accumulators. Network readers, worker threads
//! and the `LordHandle` only ever talk to it through channels, so none of
//! that state is shared.
//!
//! A run moves through `ready → preparing → gathering → syncing → training
//! → ready`. Gathering and syncing are skipped without cluster nodes. Every
//! step of the training loop is a barrier: the next step is not started
//! until the `PortionQueue` of the current one reports every portion done.
use crate::config::{Algorithm, TrainingOptions};
use crate::error::{EmfError, Result};
use crate::factors::{FactorMatrix, FactorStore, Side};
use crate::kernel::{Kernel, RmseSums};
use crate::network::{
    read_msg, send_msg, split_framed, Connection, FramedSink, FramedStream,
    PeerInfo, ToChief, ToLord,
};
use crate::portion::{
    row_portions, Owner, PortionCatalog, PortionQueue, StepKind,
};
use crate::stats::{prepare_split, Stats};
use crate::store::{CalcInfo, RatingStore, Stream};
use crate::worker::{
    PortionOutcome, StepSpec, Supervisor, WorkContext, WorkerReport,
};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{
    self, unbounded_channel, UnboundedReceiver, UnboundedSender,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// The state of the `Lord`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Preparing,
    Gathering,
    Syncing,
    Training,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Status::Ready => "ready",
            Status::Preparing => "preparing",
            Status::Gathering => "gathering",
            Status::Syncing => "syncing",
            Status::Training => "training",
        };
        write!(f, "{}", s)
    }
}

enum LordCmd {
    Train {
        force_resplit: bool,
        reply: oneshot::Sender<Result<CalcInfo>>,
    },
    Shutdown,
}

enum LordEvent {
    Register {
        host: String,
        port: u16,
        address: SocketAddr,
        stream: FramedStream<ToLord>,
        sink: FramedSink<ToChief>,
    },
    FromNode {
        node_id: usize,
        msg: ToLord,
    },
    NodeClosed {
        node_id: usize,
    },
}

/// What the `Lord` waits on while a run is in progress
#[derive(Debug)]
enum Input {
    Node(usize, ToLord),
    Worker(WorkerReport),
    /// A node went away and was already forgotten
    Lost(usize),
}

/// A registered `Chief`
struct ClusterNode {
    host: String,
    port: u16,
    conn: Connection<ToChief>,
    reader: JoinHandle<()>,
}

/// State of one training run
struct Run {
    catalog: Arc<PortionCatalog>,
    factors: Arc<FactorStore>,
    supervisor: Supervisor,
    stats: Stats,
}

/// State of the running step
struct StepState {
    kind: StepKind,
    step_id: u64,
    queue: PortionQueue,
    sums: RmseSums,
    /// Nodes that asked for portions when none were left, and how many
    starving: HashMap<usize, usize>,
}

impl StepState {
    fn stalled(&self) -> EmfError {
        EmfError::Stalled {
            step: self.kind,
            completed: self.queue.completed(),
            total: self.queue.total(),
        }
    }
}

/// The top coordinator, see the module docs
pub struct Lord {
    options: TrainingOptions,
    store: Arc<dyn RatingStore>,
    kernel: Arc<dyn Kernel>,
    status: watch::Sender<Status>,
    node_count: watch::Sender<usize>,
    nodes: HashMap<usize, ClusterNode>,
    next_node_id: usize,
    step_id: u64,
    commands: mpsc::Receiver<LordCmd>,
    commands_closed: bool,
    shutdown: bool,
    events: UnboundedReceiver<LordEvent>,
    /// Kept so that `events` never closes
    events_tx: UnboundedSender<LordEvent>,
    reports: UnboundedReceiver<WorkerReport>,
    reports_tx: UnboundedSender<WorkerReport>,
    acceptor: Option<JoinHandle<()>>,
}

/// Talks to a running `Lord`
pub struct LordHandle {
    commands: mpsc::Sender<LordCmd>,
    status: watch::Receiver<Status>,
    node_count: watch::Receiver<usize>,
    cluster_addr: Option<SocketAddr>,
    task: JoinHandle<()>,
}

impl LordHandle {
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Where cluster nodes register, if clustering is enabled
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.cluster_addr
    }

    pub fn node_count(&self) -> usize {
        *self.node_count.borrow()
    }

    /// Runs a full training, keeping the current split where possible
    pub async fn train(&self) -> Result<CalcInfo> {
        self.train_with(false).await
    }

    /// Runs a full training. `force_resplit` reassigns every rating to the
    /// train/validate/test sets first.
    pub async fn train_with(&self, force_resplit: bool) -> Result<CalcInfo> {
        match self.status() {
            Status::Ready => (),
            Status::Training => return Err(EmfError::AlreadyTraining),
            other => return Err(EmfError::NotReady(other)),
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LordCmd::Train {
                force_resplit,
                reply,
            })
            .await
            .map_err(|_| EmfError::StreamClosed)?;
        rx.await.map_err(|_| EmfError::StreamClosed)?
    }

    /// Waits until at least `n` cluster nodes are registered
    pub async fn wait_for_nodes(&mut self, n: usize) -> Result<()> {
        while *self.node_count.borrow_and_update() < n {
            self.node_count
                .changed()
                .await
                .map_err(|_| EmfError::StreamClosed)?;
        }
        Ok(())
    }

    /// Stops the `Lord` once it is idle and disconnects every node
    pub async fn shutdown(self) {
        let _ = self.commands.send(LordCmd::Shutdown).await;
        if self.task.await.is_err() {
            error!("Lord task panicked");
        }
    }
}

/// Accepts connections from new `Chief`s and forwards their registration
async fn accept_nodes(
    listener: TcpListener,
    events: UnboundedSender<LordEvent>,
) {
    while !events.is_closed() {
        let (socket, address) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                error!("Failed to accept a cluster node: {}", e);
                continue;
            }
        };
        let events = events.clone();
        tokio::spawn(async move {
            let (mut stream, sink) = split_framed::<ToLord, ToChief>(socket);
            match read_msg(&mut stream).await {
                Ok(m) => match m.msg {
                    ToLord::Register { host, port } => {
                        let _ = events.send(LordEvent::Register {
                            host,
                            port,
                            address,
                            stream,
                            sink,
                        });
                    }
                    other => warn!(
                        "{} sent {} before registering",
                        address,
                        other.name()
                    ),
                },
                Err(e) => warn!("Registration from {} failed: {}", address, e),
            }
        });
    }
}

/// Forwards every message of a node to the `Lord`
fn spawn_reader(
    node_id: usize,
    mut stream: FramedStream<ToLord>,
    events: UnboundedSender<LordEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_msg(&mut stream).await {
                Ok(m) => {
                    let ev = LordEvent::FromNode {
                        node_id,
                        msg: m.msg,
                    };
                    if events.send(ev).is_err() {
                        return;
                    }
                }
                Err(EmfError::StreamClosed) => break,
                Err(e) => {
                    error!("Connection to node #{} failed: {}", node_id, e);
                    break;
                }
            }
        }
        let _ = events.send(LordEvent::NodeClosed { node_id });
    })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds the portions of every step the run will execute
fn build_catalog(
    options: &TrainingOptions,
    stats: &Stats,
    threads: usize,
) -> PortionCatalog {
    let mut catalog = PortionCatalog::new();
    match options.algorithm {
        Algorithm::Als => {
            let targets = options.ratings_in_portion_for_als;
            catalog.insert_rows(
                StepKind::ByUser,
                row_portions(&stats.users.counts, targets.by_user, threads),
            );
            catalog.insert_rows(
                StepKind::ByItem,
                row_portions(&stats.items.counts, targets.by_item, threads),
            );
        }
        Algorithm::Sgd => catalog.insert_stream(
            StepKind::Sgd,
            Stream::Train,
            stats.train_ratings,
            options.ratings_in_portion_for_sgd,
        ),
    }
    let per = options.ratings_in_portion_for_rmse;
    catalog.insert_stream(
        StepKind::RmseValidate,
        Stream::Validate,
        stats.validate_ratings,
        per,
    );
    catalog.insert_stream(StepKind::RmseTest, Stream::Test, stats.test_ratings, per);
    catalog
}

impl Lord {
    /// Starts a `Lord` task. With clustering enabled it first binds the
    /// cluster port so that nodes can register as soon as this returns.
    pub async fn spawn(
        options: TrainingOptions,
        store: Arc<dyn RatingStore>,
        kernel: Arc<dyn Kernel>,
    ) -> Result<LordHandle> {
        options.validate()?;
        let (events_tx, events) = unbounded_channel();
        let (reports_tx, reports) = unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(8);
        let (status, status_rx) = watch::channel(Status::Ready);
        let (node_count, node_count_rx) = watch::channel(0);

        let (cluster_addr, acceptor) = if options.use_clustering {
            let listener =
                TcpListener::bind(("0.0.0.0", options.cluster_server_port))
                    .await?;
            let addr = listener.local_addr()?;
            info!("Lord listening for cluster nodes at {}", addr);
            let acceptor = tokio::spawn(accept_nodes(listener, events_tx.clone()));
            (Some(addr), Some(acceptor))
        } else {
            (None, None)
        };

        let lord = Lord {
            options,
            store,
            kernel,
            status,
            node_count,
            nodes: HashMap::new(),
            next_node_id: 1,
            step_id: 0,
            commands,
            commands_closed: false,
            shutdown: false,
            events,
            events_tx,
            reports,
            reports_tx,
            acceptor,
        };
        let task = tokio::spawn(lord.run());
        Ok(LordHandle {
            commands: commands_tx,
            status: status_rx,
            node_count: node_count_rx,
            cluster_addr,
            task,
        })
    }

    fn status(&self) -> Status {
        *self.status.borrow()
    }

    fn set_status(&self, status: Status) {
        debug!("Lord status: {}", status);
        self.status.send_replace(status);
    }

    async fn run(mut self) {
        while !self.shutdown {
            tokio::select! {
                cmd = self.commands.recv(), if !self.commands_closed => {
                    match cmd {
                        Some(LordCmd::Train { force_resplit, reply }) => {
                            let result = self.train(force_resplit).await;
                            let _ = reply.send(result);
                        }
                        Some(LordCmd::Shutdown) => self.shutdown = true,
                        None => {
                            self.commands_closed = true;
                            self.shutdown = true;
                        }
                    }
                }
                Some(ev) = self.events.recv() => {
                    self.on_event(ev).await;
                }
                Some(report) = self.reports.recv() => {
                    debug!("Dropping worker report of an old run: {:?}", report);
                }
            }
        }
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        let ids: Vec<usize> = self.nodes.keys().copied().collect();
        for id in ids {
            self.forget_node(id);
        }
        info!("Lord stopped");
    }

    /// Handles registrations and disconnects. Anything a running step
    /// needs to see is handed back.
    async fn on_event(&mut self, ev: LordEvent) -> Option<Input> {
        match ev {
            LordEvent::Register {
                host,
                port,
                address,
                stream,
                mut sink,
            } => {
                let status = self.status();
                if status != Status::Ready {
                    let reason = format!(
                        "Sorry, server state is {}, try again later",
                        status
                    );
                    warn!("Rejecting node at {}: {}", address, reason);
                    let _ =
                        send_msg(&mut sink, 0, 0, ToChief::Rejected { reason })
                            .await;
                    return None;
                }
                let node_id = self.next_node_id;
                self.next_node_id += 1;
                let mut conn = Connection::new(address, sink, 0, node_id);
                if let Err(e) = conn.send(ToChief::Registered { node_id }).await
                {
                    error!("Failed to register node at {}: {}", address, e);
                    return None;
                }
                let reader = spawn_reader(node_id, stream, self.events_tx.clone());
                info!(
                    "Registered node #{} at {}:{} ({})",
                    node_id, host, port, address
                );
                self.nodes.insert(
                    node_id,
                    ClusterNode {
                        host,
                        port,
                        conn,
                        reader,
                    },
                );
                self.node_count.send_replace(self.nodes.len());
                None
            }
            LordEvent::FromNode { node_id, msg } => {
                if self.nodes.contains_key(&node_id) {
                    Some(Input::Node(node_id, msg))
                } else {
                    None
                }
            }
            LordEvent::NodeClosed { node_id } => {
                if self.nodes.contains_key(&node_id) {
                    warn!("{}", EmfError::NodeDisconnected(node_id));
                    self.forget_node(node_id);
                    Some(Input::Lost(node_id))
                } else {
                    None
                }
            }
        }
    }

    fn forget_node(&mut self, node_id: usize) {
        if let Some(node) = self.nodes.remove(&node_id) {
            node.reader.abort();
            debug!("Forgot node #{} at {}", node_id, node.conn.address);
        }
        self.node_count.send_replace(self.nodes.len());
    }

    /// Waits for the next thing that needs the attention of a running step.
    /// Registration attempts and `train` calls are refused meanwhile.
    /// Returns `None` if nothing arrived within `timeout`.
    async fn next_input(&mut self, timeout: Duration) -> Option<Input> {
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return None,
                Some(report) = self.reports.recv() => {
                    return Some(Input::Worker(report));
                }
                Some(ev) = self.events.recv() => {
                    if let Some(input) = self.on_event(ev).await {
                        return Some(input);
                    }
                }
                cmd = self.commands.recv(), if !self.commands_closed => {
                    match cmd {
                        Some(LordCmd::Train { reply, .. }) => {
                            let err = match self.status() {
                                Status::Training => EmfError::AlreadyTraining,
                                other => EmfError::NotReady(other),
                            };
                            let _ = reply.send(Err(err));
                        }
                        Some(LordCmd::Shutdown) => self.shutdown = true,
                        None => {
                            self.commands_closed = true;
                            self.shutdown = true;
                        }
                    }
                }
            }
        }
    }

    fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.options.step_stall_timeout_secs)
    }

    /// Sends `msg` to every node, forgetting those that fail. Returns the
    /// ids of the forgotten nodes.
    async fn broadcast(&mut self, msg: &ToChief) -> Vec<usize> {
        let mut lost = Vec::new();
        for (id, node) in self.nodes.iter_mut() {
            if let Err(e) = node.conn.send(msg.clone()).await {
                error!("Failed to send {} to node #{}: {}", msg.name(), id, e);
                lost.push(*id);
            }
        }
        for id in lost.iter() {
            self.forget_node(*id);
        }
        lost
    }

    async fn send_to(&mut self, node_id: usize, msg: ToChief) -> Result<()> {
        let node = self.nodes.get_mut(&node_id).ok_or(EmfError::UnknownId)?;
        let name = msg.name();
        let result = node.conn.send(msg).await;
        if let Err(e) = &result {
            error!("Failed to send {} to node #{}: {}", name, node_id, e);
            self.forget_node(node_id);
        }
        result
    }

    /// Waits until every node in `pending` sent a message `accept` takes.
    /// Nodes that stay silent for a whole stall timeout are forgotten.
    async fn collect<F>(&mut self, mut pending: HashSet<usize>, mut accept: F)
    where
        F: FnMut(usize, ToLord) -> bool,
    {
        while !pending.is_empty() {
            match self.next_input(self.stall_timeout()).await {
                Some(Input::Node(id, msg)) => {
                    let name = msg.name();
                    if pending.contains(&id) && accept(id, msg) {
                        pending.remove(&id);
                    } else {
                        debug!("Ignoring {} from node #{}", name, id);
                    }
                }
                Some(Input::Lost(id)) => {
                    pending.remove(&id);
                }
                Some(Input::Worker(report)) => {
                    debug!("Ignoring worker report {:?}", report);
                }
                None => {
                    for id in pending.drain() {
                        warn!("Node #{} did not answer, dropping it", id);
                        self.forget_node(id);
                    }
                }
            }
        }
    }

    /// `train` with the status guard and the return to `ready`
    async fn train(&mut self, force_resplit: bool) -> Result<CalcInfo> {
        match self.status() {
            Status::Ready => (),
            Status::Training => return Err(EmfError::AlreadyTraining),
            other => return Err(EmfError::NotReady(other)),
        }
        self.set_status(Status::Preparing);
        let result = self.run_training(force_resplit).await;
        self.set_status(Status::Ready);
        match &result {
            Ok(info) => info!("Training finished: {:?}", info),
            Err(e) => error!("Training failed ({}): {}", e.code(), e),
        }
        result
    }

    /// Statistics, portions, factors and workers of a new run
    fn prepare(&self, force_resplit: bool) -> Result<Run> {
        let options = &self.options;
        prepare_split(&*self.store, options, force_resplit)?;
        let stats = Stats::gather(&*self.store);
        if !stats.has_training_data() {
            return Err(EmfError::NoData);
        }
        let threads = options.num_threads();
        let cluster_threads = match options.algorithm {
            Algorithm::Als => threads * (1 + self.nodes.len()),
            Algorithm::Sgd => threads,
        };
        let catalog = build_catalog(options, &stats, cluster_threads);
        for kind in [
            StepKind::ByUser,
            StepKind::ByItem,
            StepKind::Sgd,
            StepKind::RmseValidate,
            StepKind::RmseTest,
        ] {
            debug!("{} portions for {}", catalog.len(kind), kind);
        }

        let precision = options.precision();
        let f = options.factors_count;
        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut init = |side: Side| -> Result<FactorMatrix> {
            let rows = self.store.row_count(side);
            match self.store.load_factors(side)? {
                Some(m) if m.matches(rows, f, precision) => {
                    info!("Continuing from saved {} factors", side);
                    Ok(m)
                }
                _ => Ok(FactorMatrix::random(rows, f, precision, &mut rng)),
            }
        };
        let factors = Arc::new(FactorStore::new(
            init(Side::User)?,
            init(Side::Item)?,
        ));
        let catalog = Arc::new(catalog);
        let ctx = Arc::new(WorkContext {
            options: options.clone(),
            catalog: catalog.clone(),
            factors: factors.clone(),
            store: self.store.clone(),
            kernel: self.kernel.clone(),
        });
        let supervisor =
            Supervisor::spawn(ctx, threads, self.reports_tx.clone())?;
        Ok(Run {
            catalog,
            factors,
            supervisor,
            stats,
        })
    }

    /// Has every node connect to every other one. Returns the number of
    /// directed peer connections the nodes acknowledged.
    async fn gather(&mut self) -> usize {
        let peers: Vec<PeerInfo> = self
            .nodes
            .iter()
            .map(|(id, n)| PeerInfo {
                node_id: *id,
                host: n.host.clone(),
                port: n.port,
            })
            .collect();
        let n = peers.len();
        let ids: Vec<usize> = peers.iter().map(|p| p.node_id).collect();
        for id in ids.iter() {
            let others =
                peers.iter().filter(|p| p.node_id != *id).cloned().collect();
            let _ = self.send_to(*id, ToChief::MeetCluster { peers: others }).await;
        }
        let pending: HashSet<usize> = self.nodes.keys().copied().collect();
        let mut links = 0;
        self.collect(pending, |id, msg| match msg {
            ToLord::MetCluster { connected } => {
                debug!("Node #{} met {:?}", id, connected);
                links += connected.len();
                true
            }
            _ => false,
        })
        .await;
        let expected = n * n.saturating_sub(1);
        if links == expected {
            info!("Cluster gathered: {} nodes, {} links", n, links);
        } else {
            warn!(
                "Cluster gathered with {} of {} links, {} nodes left",
                links,
                expected,
                self.nodes.len()
            );
        }
        links
    }

    /// Ships options, portions, the split and the initial factors to every
    /// node
    async fn sync(&mut self, run: &Run) -> Result<()> {
        let msg = ToChief::PrepareToTrain {
            options: self.options.clone(),
            catalog: (*run.catalog).clone(),
            split: self.store.export_split(),
            user_rows: run.factors.users.rows(),
            item_rows: run.factors.items.rows(),
        };
        self.broadcast(&msg).await;
        self.send_factors(run, &[Side::User, Side::Item]).await?;
        let pending = self.nodes.keys().copied().collect();
        self.collect(pending, |_, msg| matches!(msg, ToLord::PreparedToTrain))
            .await;
        info!("{} nodes ready to train", self.nodes.len());
        Ok(())
    }

    async fn send_factors(&mut self, run: &Run, sides: &[Side]) -> Result<()> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        for side in sides {
            let m = run.factors.side(*side);
            let data = m.rows_bytes(m.full_range())?;
            self.broadcast(&ToChief::SetFactors { side: *side, data })
                .await;
        }
        Ok(())
    }

    async fn run_training(&mut self, force_resplit: bool) -> Result<CalcInfo> {
        let mut run = self.prepare(force_resplit)?;
        let mut mesh_links = 0;
        if !self.nodes.is_empty() {
            self.set_status(Status::Gathering);
            mesh_links = self.gather().await;
            self.set_status(Status::Syncing);
            self.sync(&run).await?;
        }
        let cluster_nodes = self.nodes.len();
        self.set_status(Status::Training);

        let options = self.options.clone();
        let mut rmse_validate = None;
        let mut rmse_test = None;
        let mut rmse_test_shifted = None;
        let mut global_avg_shift = 0.0;
        for iter in 0..options.train_iters {
            match options.algorithm {
                Algorithm::Als => {
                    self.run_step(&mut run, StepKind::ByUser, iter, 0.0).await?;
                    self.send_factors(&run, &[Side::User]).await?;
                    self.run_step(&mut run, StepKind::ByItem, iter, 0.0).await?;
                    self.send_factors(&run, &[Side::Item]).await?;
                }
                Algorithm::Sgd => {
                    self.store
                        .reshuffle_train(options.seed.wrapping_add(iter as u64))?;
                    self.run_step(&mut run, StepKind::Sgd, iter, 0.0).await?;
                    self.send_factors(&run, &[Side::User, Side::Item]).await?;
                }
            }

            if run.catalog.len(StepKind::RmseValidate) > 0 {
                let sums = self
                    .run_step(&mut run, StepKind::RmseValidate, iter, 0.0)
                    .await?;
                rmse_validate = Some(sums.rmse());
            }
            if run.catalog.len(StepKind::RmseTest) > 0 {
                let sums =
                    self.run_step(&mut run, StepKind::RmseTest, iter, 0.0).await?;
                rmse_test = Some(sums.rmse());
                global_avg_shift = sums.avg_diff();
                if options.algorithm == Algorithm::Als
                    && options.use_global_avg_shift
                {
                    let shifted = self
                        .run_step(
                            &mut run,
                            StepKind::RmseTest,
                            iter,
                            global_avg_shift,
                        )
                        .await?;
                    rmse_test_shifted = Some(shifted.rmse());
                }
            }
            info!(
                "Iteration {}/{}: rmse validate {:?}, test {:?}, test shifted \
                 by {:.4} {:?}",
                iter + 1,
                options.train_iters,
                rmse_validate,
                rmse_test,
                global_avg_shift,
                rmse_test_shifted
            );
        }

        let info = CalcInfo {
            algorithm: options.algorithm,
            factors_count: options.factors_count,
            iterations: options.train_iters,
            dataset_distr: options.dataset_distr,
            rmse_validate,
            rmse_test,
            rmse_test_shifted,
            global_avg_shift,
            cluster_nodes,
            mesh_links,
            calc_count: self
                .store
                .last_calc_info()
                .map_or(0, |l| l.calc_count)
                + 1,
            calc_timestamp: now_secs(),
        };
        if !self.nodes.is_empty() {
            self.broadcast(&ToChief::EndTrain { info: info.clone() })
                .await;
            let pending = self.nodes.keys().copied().collect();
            self.collect(pending, |_, msg| matches!(msg, ToLord::EndedTrain))
                .await;
        }
        run.supervisor.join().await;
        debug!(
            "Saving factors of {} users and {} items",
            run.stats.users.rows(),
            run.stats.items.rows()
        );
        self.store
            .save_factors(&run.factors.users, &run.factors.items)?;
        self.store.save_calc_info(&info)?;
        Ok(info)
    }

    /// Gives every idle local worker one portion
    fn feed_workers(&self, run: &mut Run, step: &mut StepState) {
        for w in run.supervisor.idle_workers() {
            let owner = Owner::Worker(w);
            let portion = match step.queue.request_portions(owner, 1).first() {
                Some(p) => *p,
                None => break,
            };
            if let Err(e) = run.supervisor.dispatch(w, portion) {
                warn!("Could not hand portion {} to worker #{}: {}", portion, w, e);
                step.queue.drop_owner(owner);
            }
        }
    }

    /// Pushes portions to nodes that asked for work when there was none
    async fn feed_starving(&mut self, step: &mut StepState) {
        let ids: Vec<usize> = step.starving.keys().copied().collect();
        for id in ids {
            if !step.queue.has_unissued() {
                break;
            }
            let want = step.starving.remove(&id).unwrap_or(1);
            let portions = step.queue.request_portions(Owner::Node(id), want);
            debug!("Node #{} gets dropped portions {:?}", id, portions);
            let msg = ToChief::RetNextPortions {
                step_id: step.step_id,
                portions,
            };
            if self.send_to(id, msg).await.is_err() {
                step.queue.drop_owner(Owner::Node(id));
            }
        }
    }

    /// Runs one step through its `PortionQueue` until every portion is done.
    /// Returns the summed RMSE sums, empty for algorithm steps.
    async fn run_step(
        &mut self,
        run: &mut Run,
        kind: StepKind,
        iteration: usize,
        global_avg_shift: f64,
    ) -> Result<RmseSums> {
        self.step_id += 1;
        let total = run.catalog.len(kind);
        let mut step = StepState {
            kind,
            step_id: self.step_id,
            queue: PortionQueue::new(total),
            sums: RmseSums::default(),
            starving: HashMap::new(),
        };
        debug!("Starting {} step #{} with {} portions", kind, step.step_id, total);

        run.supervisor.start_step(StepSpec {
            step_id: step.step_id,
            kind,
            global_avg_shift,
        });
        // SGD updates are not row-disjoint, it stays local
        let distributed = kind != StepKind::Sgd;
        if distributed {
            let msg = if kind.is_rmse() {
                ToChief::StartCalcRmse {
                    step_id: step.step_id,
                    step: kind,
                    global_avg_shift,
                }
            } else {
                ToChief::StartAlsTrainStep {
                    step_id: step.step_id,
                    iteration,
                    step: kind,
                }
            };
            for id in self.broadcast(&msg).await {
                step.queue.drop_owner(Owner::Node(id));
            }
        }
        self.feed_workers(run, &mut step);

        while !step.queue.is_complete() {
            let remote = distributed && !self.nodes.is_empty();
            if run.supervisor.live_workers() == 0 && !remote {
                return Err(step.stalled());
            }
            let input = match self.next_input(self.stall_timeout()).await {
                Some(input) => input,
                None => return Err(step.stalled()),
            };
            match input {
                Input::Worker(report) => {
                    run.supervisor.on_report(&report);
                    if report.step_id != step.step_id {
                        debug!("Dropping stale worker report {:?}", report);
                        continue;
                    }
                    let owner = Owner::Worker(report.worker);
                    match report.outcome {
                        Ok(outcome) => {
                            if let PortionOutcome::Rmse(part) = outcome {
                                step.sums.add(&part);
                            }
                            step.queue.report_completion(owner, report.portion)?;
                        }
                        Err(_) => {
                            step.queue.drop_owner(owner);
                        }
                    }
                }
                Input::Node(id, msg) => self.on_node_msg(run, &mut step, id, msg).await?,
                Input::Lost(id) => {
                    step.queue.drop_owner(Owner::Node(id));
                    step.starving.remove(&id);
                }
            }
            self.feed_workers(run, &mut step);
            self.feed_starving(&mut step).await;
        }

        if distributed {
            self.broadcast(&ToChief::StepEnd {
                step_id: step.step_id,
            })
            .await;
        }
        info!("Step {} #{} done, {} portions", kind, step.step_id, total);
        Ok(step.sums)
    }

    /// Applies a message of a node to the running step
    async fn on_node_msg(
        &mut self,
        run: &mut Run,
        step: &mut StepState,
        node_id: usize,
        msg: ToLord,
    ) -> Result<()> {
        let owner = Owner::Node(node_id);
        match msg {
            ToLord::GetNextPortions { step_id, want } if step_id == step.step_id => {
                let portions = step.queue.request_portions(owner, want);
                debug!("Node #{} gets portions {:?}", node_id, portions);
                if portions.is_empty() {
                    step.starving.insert(node_id, want.max(1));
                } else {
                    step.starving.remove(&node_id);
                }
                let reply = ToChief::RetNextPortions { step_id, portions };
                if self.send_to(node_id, reply).await.is_err() {
                    step.queue.drop_owner(owner);
                    step.starving.remove(&node_id);
                }
            }
            ToLord::AlsSaveCalcedFactors {
                step_id,
                portion,
                side,
                rows,
                data,
            } if step_id == step.step_id => {
                if !step.queue.holds(owner, portion) {
                    warn!("Node #{} sent unclaimed portion {}", node_id, portion);
                    return Ok(());
                }
                let expected = run.catalog.get(step.kind, portion)?.rows();
                let written = if step.kind.writes() == Some(side)
                    && expected == Some(rows)
                {
                    run.factors
                        .side(side)
                        .rows_mut(rows)
                        .and_then(|mut out| out.copy_from_bytes(&data))
                } else {
                    Err(EmfError::RowOutOfRange)
                };
                match written {
                    Ok(()) => {
                        step.queue.report_completion(owner, portion)?;
                    }
                    Err(e) => {
                        error!(
                            "Bad factors from node #{} for portion {}: {}",
                            node_id, portion, e
                        );
                        self.forget_node(node_id);
                        step.queue.drop_owner(owner);
                        step.starving.remove(&node_id);
                    }
                }
            }
            ToLord::RmseSaveCalcs {
                step_id,
                portion,
                sums,
            } if step_id == step.step_id => {
                if step.queue.holds(owner, portion) {
                    step.sums.add(&sums);
                    step.queue.report_completion(owner, portion)?;
                } else {
                    warn!("Node #{} sent unclaimed portion {}", node_id, portion);
                }
            }
            other => {
                warn!(
                    "Ignoring {} from node #{}: {}",
                    other.name(),
                    node_id,
                    EmfError::StaleStep
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SgdParams;
    use crate::factors::RowsMut;
    use crate::kernel::NativeKernel;
    use crate::store::{MemoryRatingStore, Rating};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    /// Row solves that never return, or always fail
    enum BrokenKernel {
        Hang,
        Fail,
    }

    impl Kernel for BrokenKernel {
        fn als_rows(
            &self,
            _out: &mut RowsMut<'_>,
            _ratings: &[Vec<(usize, f32)>],
            _other: &FactorMatrix,
            _lambda: f64,
        ) -> Result<()> {
            match self {
                BrokenKernel::Hang => {
                    std::thread::sleep(Duration::from_secs(3600));
                    Ok(())
                }
                BrokenKernel::Fail => {
                    Err(EmfError::Kernel("singular system".to_string()))
                }
            }
        }

        fn sgd(
            &self,
            _ratings: &[Rating],
            _users: &mut RowsMut<'_>,
            _items: &mut RowsMut<'_>,
            _params: &SgdParams,
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

    fn store(users: usize, items: usize) -> Arc<dyn RatingStore> {
        let mut ratings = Vec::new();
        for u in 0..users {
            for i in 0..items {
                if (u + i) % 3 != 0 {
                    ratings.push(Rating {
                        user: u,
                        item: i,
                        value: (1 + (u * 7 + i * 3) % 5) as f32,
                    });
                }
            }
        }
        Arc::new(MemoryRatingStore::from_ratings(ratings))
    }

    fn options() -> TrainingOptions {
        let mut opts = TrainingOptions::default();
        opts.factors_count = 3;
        opts.train_iters = 2;
        opts.num_threads_for_train.als = 2;
        opts.ratings_in_portion_for_als.by_user = 20;
        opts.ratings_in_portion_for_als.by_item = 20;
        opts.ratings_in_portion_for_rmse = 15;
        opts.step_stall_timeout_secs = 30;
        opts
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Ready.to_string(), "ready");
        assert_eq!(Status::Gathering.to_string(), "gathering");
        let err = EmfError::NotReady(Status::Syncing);
        assert_eq!(err.to_string(), "Not ready to train. Status is syncing");
    }

    #[test]
    fn test_catalog_skips_empty_sets() {
        let mut opts = options();
        opts.dataset_distr = [90.0, 0.0, 10.0];
        let store = store(10, 10);
        prepare_split(&*store, &opts, true).unwrap();
        let stats = Stats::gather(&*store);
        let catalog = build_catalog(&opts, &stats, 2);
        assert_eq!(catalog.len(StepKind::RmseValidate), 0);
        assert!(catalog.len(StepKind::RmseTest) > 0);
        assert!(catalog.len(StepKind::ByUser) >= 2);
        assert_eq!(catalog.len(StepKind::Sgd), 0);
    }

    #[tokio::test]
    async fn test_local_als_run() {
        let handle = Lord::spawn(options(), store(30, 20), Arc::new(NativeKernel))
            .await
            .unwrap();
        let info = handle.train().await.unwrap();
        assert_eq!(info.iterations, 2);
        assert_eq!(info.calc_count, 1);
        assert_eq!(info.cluster_nodes, 0);
        assert!(info.rmse_validate.unwrap() > 0.0);
        assert!(info.rmse_test.unwrap().is_finite());
        assert!(info.rmse_test_shifted.is_some());
        assert_eq!(handle.status(), Status::Ready);
        let again = handle.train().await.unwrap();
        assert_eq!(again.calc_count, 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_sgd_run() {
        let mut opts = options();
        opts.algorithm = Algorithm::Sgd;
        opts.ratings_in_portion_for_sgd = 50;
        let handle = Lord::spawn(opts, store(20, 20), Arc::new(NativeKernel))
            .await
            .unwrap();
        let info = handle.train().await.unwrap();
        assert_eq!(info.algorithm, Algorithm::Sgd);
        assert!(info.rmse_test_shifted.is_none());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_data_returns_to_ready() {
        let empty: Arc<dyn RatingStore> =
            Arc::new(MemoryRatingStore::from_ratings(Vec::new()));
        let handle = Lord::spawn(options(), empty, Arc::new(NativeKernel))
            .await
            .unwrap();
        let err = handle.train().await.unwrap_err();
        assert_eq!(err.code(), "no_data");
        assert_eq!(handle.status(), Status::Ready);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_train_refused_while_training() {
        let handle = Lord::spawn(options(), store(40, 30), Arc::new(NativeKernel))
            .await
            .unwrap();
        let (a, b) = tokio::join!(handle.train(), handle.train());
        let (ok, err) = match (a, b) {
            (Ok(info), Err(e)) | (Err(e), Ok(info)) => (info, e),
            other => panic!("expected one run and one refusal: {:?}", other),
        };
        assert_eq!(ok.calc_count, 1);
        assert_eq!(err.code(), "already_training");
        assert_eq!(handle.status(), Status::Ready);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_hung_step_stalls_and_returns_to_ready() {
        let mut opts = options();
        opts.num_threads_for_train.als = 1;
        opts.step_stall_timeout_secs = 1;
        let handle =
            Lord::spawn(opts, store(10, 10), Arc::new(BrokenKernel::Hang))
                .await
                .unwrap();
        let result = timeout(Duration::from_secs(20), handle.train())
            .await
            .expect("train never returned from a hung step");
        let err = result.unwrap_err();
        assert_eq!(err.code(), "stalled");
        assert!(matches!(
            err,
            EmfError::Stalled {
                step: StepKind::ByUser,
                completed: 0,
                ..
            }
        ));
        assert_eq!(handle.status(), Status::Ready);
        timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown waited on a hung worker");
    }

    #[tokio::test]
    async fn test_step_stalls_once_every_worker_failed() {
        let mut opts = options();
        opts.num_threads_for_train.als = 1;
        let handle =
            Lord::spawn(opts, store(10, 10), Arc::new(BrokenKernel::Fail))
                .await
                .unwrap();
        // well inside the 30s stall timeout
        let result = timeout(Duration::from_secs(10), handle.train())
            .await
            .expect("a step with no workers left kept waiting");
        let err = result.unwrap_err();
        assert_eq!(err.code(), "stalled");
        assert_eq!(handle.status(), Status::Ready);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_train_refused_while_gathering() {
        let mut opts = options();
        opts.use_clustering = true;
        opts.cluster_server_port = 0;
        opts.step_stall_timeout_secs = 2;
        let mut handle = Lord::spawn(opts, store(20, 20), Arc::new(NativeKernel))
            .await
            .unwrap();
        let port = handle.cluster_addr().unwrap().port();

        // registers, then never answers
        let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (_stream, mut sink) = split_framed::<ToChief, ToLord>(socket);
        let register = ToLord::Register {
            host: "127.0.0.1".to_string(),
            port: 1,
        };
        send_msg(&mut sink, 0, 0, register).await.unwrap();
        handle.wait_for_nodes(1).await.unwrap();

        // straight to the actor, past the guard in `LordHandle`
        let mut status = handle.status.clone();
        let commands = handle.commands.clone();
        let early = async move {
            while *status.borrow_and_update() != Status::Gathering {
                status.changed().await.unwrap();
            }
            let (reply, rx) = oneshot::channel();
            let cmd = LordCmd::Train {
                force_resplit: false,
                reply,
            };
            if commands.send(cmd).await.is_err() {
                panic!("lord stopped");
            }
            rx.await.unwrap()
        };
        let (info, early) = tokio::join!(handle.train(), early);
        let info = info.unwrap();
        assert_eq!(info.cluster_nodes, 0);
        let err = early.unwrap_err();
        assert_eq!(err.code(), "not_ready");
        assert_eq!(err.to_string(), "Not ready to train. Status is gathering");
        assert_eq!(handle.status(), Status::Ready);
        handle.shutdown().await;
    }
}
