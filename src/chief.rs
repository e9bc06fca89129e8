//! A `Chief`: a cluster node that lends its local workers to the `Lord`.
//!
//! A `Chief` registers with the `Lord`, connects to every other `Chief` it
//! is told about, and then follows the steps the `Lord` broadcasts: it asks
//! for portions, runs them on its own `Supervisor`, and streams the results
//! back. It holds a full copy of both factor matrices, refreshed by the
//! `Lord` after every algorithm step.
use crate::error::{EmfError, Result};
use crate::factors::FactorStore;
use crate::kernel::Kernel;
use crate::network::{
    read_msg, send_msg, split_framed, Connection, FramedSink, FramedStream,
    PeerInfo, PeerMsg, ToChief, ToLord,
};
use crate::store::RatingStore;
use crate::worker::{
    PortionOutcome, StepSpec, Supervisor, WorkContext, WorkerReport,
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

enum ChiefEvent {
    FromLord(ToChief),
    LordClosed,
    /// Another `Chief` connected to us and introduced itself
    PeerJoined {
        node_id: usize,
        stream: FramedStream<PeerMsg>,
        sink: FramedSink<PeerMsg>,
    },
}

/// Both halves of a connection to another `Chief`
struct PeerLink {
    _stream: FramedStream<PeerMsg>,
    _sink: FramedSink<PeerMsg>,
}

/// State of the run the `Lord` is driving
struct ChiefRun {
    factors: Arc<FactorStore>,
    supervisor: Supervisor,
    step: Option<StepSpec>,
    /// Portions received from the `Lord` and not yet handed to a worker
    backlog: VecDeque<usize>,
    /// A `GetNextPortions` is waiting for its answer
    requested: bool,
    /// The `Lord` had nothing left for us, it pushes dropped portions later
    starving: bool,
}

/// A cluster node, see the module docs
pub struct Chief {
    node_id: usize,
    listen_addr: SocketAddr,
    lord: Connection<ToLord>,
    store: Arc<dyn RatingStore>,
    kernel: Arc<dyn Kernel>,
    events: UnboundedReceiver<ChiefEvent>,
    reports: UnboundedReceiver<WorkerReport>,
    reports_tx: UnboundedSender<WorkerReport>,
    /// Peers we connected to, by node id
    outgoing: HashMap<usize, PeerLink>,
    /// Peers that connected to us, by node id
    incoming: HashMap<usize, PeerLink>,
    run: Option<ChiefRun>,
    tasks: Vec<JoinHandle<()>>,
}

/// Answers the handshake of every `Chief` that connects to us
async fn accept_peers(
    my_id: usize,
    listener: TcpListener,
    events: UnboundedSender<ChiefEvent>,
) {
    while !events.is_closed() {
        let (socket, address) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                error!("Failed to accept a peer: {}", e);
                continue;
            }
        };
        let events = events.clone();
        tokio::spawn(async move {
            let (mut stream, mut sink) = split_framed::<PeerMsg, PeerMsg>(socket);
            let node_id = match read_msg(&mut stream).await {
                Ok(m) => match m.msg {
                    PeerMsg::SetMyNodeId { node_id } => node_id,
                    other => {
                        warn!("{} opened with {:?}", address, other);
                        return;
                    }
                },
                Err(e) => {
                    warn!("Handshake with {} failed: {}", address, e);
                    return;
                }
            };
            let reply = PeerMsg::GotYourNodeId { node_id: my_id };
            if let Err(e) = send_msg(&mut sink, my_id, node_id, reply).await {
                warn!("Handshake with node #{} failed: {}", node_id, e);
                return;
            }
            let _ = events.send(ChiefEvent::PeerJoined {
                node_id,
                stream,
                sink,
            });
        });
    }
}

/// Introduces us to `peer` over a fresh connection
async fn handshake(my_id: usize, peer: &PeerInfo) -> Result<PeerLink> {
    let socket = TcpStream::connect((peer.host.as_str(), peer.port)).await?;
    let (mut stream, mut sink) = split_framed::<PeerMsg, PeerMsg>(socket);
    let hello = PeerMsg::SetMyNodeId { node_id: my_id };
    send_msg(&mut sink, my_id, peer.node_id, hello).await?;
    match read_msg(&mut stream).await?.msg {
        PeerMsg::GotYourNodeId { node_id } if node_id == peer.node_id => {
            Ok(PeerLink {
                _stream: stream,
                _sink: sink,
            })
        }
        _ => Err(EmfError::UnexpectedMessage),
    }
}

/// Forwards every message of the `Lord`
async fn read_lord(
    mut stream: FramedStream<ToChief>,
    events: UnboundedSender<ChiefEvent>,
) {
    loop {
        match read_msg(&mut stream).await {
            Ok(m) => {
                if events.send(ChiefEvent::FromLord(m.msg)).is_err() {
                    return;
                }
            }
            Err(EmfError::StreamClosed) => break,
            Err(e) => {
                error!("Connection to the Lord failed: {}", e);
                break;
            }
        }
    }
    let _ = events.send(ChiefEvent::LordClosed);
}

impl Chief {
    /// Starts listening for peers on `host` (`port`, or any free port),
    /// then registers with the `Lord` at `lord_addr`.
    ///
    /// Fails with `Rejected` if the `Lord` is busy with a run.
    pub async fn connect(
        lord_addr: &str,
        host: &str,
        port: Option<u16>,
        store: Arc<dyn RatingStore>,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port.unwrap_or(0))).await?;
        let listen_addr = listener.local_addr()?;
        let socket = TcpStream::connect(lord_addr).await?;
        let lord_address = socket.peer_addr()?;
        let (mut stream, mut sink) = split_framed::<ToChief, ToLord>(socket);
        let register = ToLord::Register {
            host: host.to_string(),
            port: listen_addr.port(),
        };
        send_msg(&mut sink, 0, 0, register).await?;
        let reply = read_msg(&mut stream).await?;
        let node_id = match reply.msg {
            ToChief::Registered { node_id } => node_id,
            ToChief::Rejected { reason } => {
                return Err(EmfError::Rejected(reason))
            }
            _ => return Err(EmfError::UnexpectedMessage),
        };
        info!(
            "Registered with the Lord at {} as node #{}, peers connect to {}",
            lord_address, node_id, listen_addr
        );

        let (events_tx, events) = unbounded_channel();
        let (reports_tx, reports) = unbounded_channel();
        let tasks = vec![
            tokio::spawn(read_lord(stream, events_tx.clone())),
            tokio::spawn(accept_peers(node_id, listener, events_tx)),
        ];
        Ok(Chief {
            node_id,
            listen_addr,
            lord: Connection::new(lord_address, sink, node_id, 0),
            store,
            kernel,
            events,
            reports,
            reports_tx,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            run: None,
            tasks,
        })
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Follows the `Lord` until it closes the connection. An error means this
    /// node can no longer take part, the `Lord` treats the disconnect like
    /// any other.
    pub async fn run(mut self) -> Result<()> {
        let result = self.event_loop().await;
        if let Some(mut run) = self.run.take() {
            run.supervisor.stop();
        }
        for task in self.tasks.iter() {
            task.abort();
        }
        if let Err(e) = &result {
            error!("Node #{} stopping ({}): {}", self.node_id, e.code(), e);
        }
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                ev = self.events.recv() => match ev {
                    Some(ChiefEvent::FromLord(msg)) => self.on_lord_msg(msg).await?,
                    Some(ChiefEvent::PeerJoined { node_id, stream, sink }) => {
                        debug!("Node #{} connected to us", node_id);
                        if self.incoming.contains_key(&node_id) {
                            warn!("Node #{}: {}", node_id, EmfError::ReconnectionError);
                        }
                        self.incoming.insert(
                            node_id,
                            PeerLink { _stream: stream, _sink: sink },
                        );
                    }
                    Some(ChiefEvent::LordClosed) | None => {
                        info!("The Lord closed the connection");
                        return Ok(());
                    }
                },
                Some(report) = self.reports.recv() => self.on_report(report).await?,
            }
        }
    }

    fn run_mut(&mut self) -> Result<&mut ChiefRun> {
        self.run.as_mut().ok_or(EmfError::UnexpectedMessage)
    }

    async fn on_lord_msg(&mut self, msg: ToChief) -> Result<()> {
        match msg {
            ToChief::MeetCluster { peers } => {
                let connected = self.meet(peers).await;
                self.lord.send(ToLord::MetCluster { connected }).await?;
            }
            ToChief::PrepareToTrain {
                options,
                catalog,
                split,
                user_rows,
                item_rows,
            } => {
                // a run the Lord gave up on may still have a worker stuck
                if let Some(mut old) = self.run.take() {
                    old.supervisor.stop();
                }
                self.store.import_split(&split)?;
                let factors = Arc::new(FactorStore::zeroed(
                    user_rows,
                    item_rows,
                    options.factors_count,
                    options.precision(),
                ));
                let threads = options.num_threads();
                let ctx = Arc::new(WorkContext {
                    options,
                    catalog: Arc::new(catalog),
                    factors: factors.clone(),
                    store: self.store.clone(),
                    kernel: self.kernel.clone(),
                });
                let supervisor =
                    Supervisor::spawn(ctx, threads, self.reports_tx.clone())?;
                self.run = Some(ChiefRun {
                    factors,
                    supervisor,
                    step: None,
                    backlog: VecDeque::new(),
                    requested: false,
                    starving: false,
                });
                self.lord.send(ToLord::PreparedToTrain).await?;
            }
            ToChief::SetFactors { side, data } => {
                self.run_mut()?.factors.side(side).load_bytes(&data)?;
                debug!("Got {} factors", side);
            }
            ToChief::StartAlsTrainStep {
                step_id,
                iteration,
                step,
            } => {
                debug!("Iteration {} {} step #{}", iteration, step, step_id);
                self.start_step(StepSpec {
                    step_id,
                    kind: step,
                    global_avg_shift: 0.0,
                })?;
                self.pump().await?;
            }
            ToChief::StartCalcRmse {
                step_id,
                step,
                global_avg_shift,
            } => {
                self.start_step(StepSpec {
                    step_id,
                    kind: step,
                    global_avg_shift,
                })?;
                self.pump().await?;
            }
            ToChief::RetNextPortions { step_id, portions } => {
                let run = self.run_mut()?;
                if run.step.map(|s| s.step_id) != Some(step_id) {
                    warn!("Portions {:?} of stale step #{}", portions, step_id);
                    return Ok(());
                }
                if !portions.is_empty() {
                    run.backlog.extend(portions);
                    run.starving = false;
                    run.requested = false;
                } else if run.requested {
                    run.starving = true;
                    run.requested = false;
                }
                self.pump().await?;
            }
            ToChief::StepEnd { step_id } => {
                let run = self.run_mut()?;
                if !run.backlog.is_empty() {
                    warn!("Step #{} ended with portions {:?} left", step_id, run.backlog);
                }
                run.step = None;
                run.backlog.clear();
                debug!("Step #{} ended", step_id);
            }
            ToChief::EndTrain { info } => {
                if let Some(run) = self.run.take() {
                    run.supervisor.join().await;
                }
                info!(
                    "Training ended: rmse validate {:?}, test {:?}",
                    info.rmse_validate, info.rmse_test
                );
                self.lord.send(ToLord::EndedTrain).await?;
            }
            other @ ToChief::Registered { .. }
            | other @ ToChief::Rejected { .. } => {
                warn!("Unexpected {} from the Lord", other.name());
            }
        }
        Ok(())
    }

    /// Connects to every peer we are not connected to yet. Returns the ids
    /// of all peers we hold a connection to.
    async fn meet(&mut self, peers: Vec<PeerInfo>) -> Vec<usize> {
        let mut connected = Vec::new();
        let wanted: HashSet<usize> = peers.iter().map(|p| p.node_id).collect();
        self.outgoing.retain(|id, _| wanted.contains(id));
        for peer in peers {
            if self.outgoing.contains_key(&peer.node_id) {
                connected.push(peer.node_id);
                continue;
            }
            match handshake(self.node_id, &peer).await {
                Ok(link) => {
                    debug!("Connected to node #{}", peer.node_id);
                    self.outgoing.insert(peer.node_id, link);
                    connected.push(peer.node_id);
                }
                Err(e) => error!(
                    "Could not connect to node #{} at {}:{}: {}",
                    peer.node_id, peer.host, peer.port, e
                ),
            }
        }
        info!("Node #{} met peers {:?}", self.node_id, connected);
        connected
    }

    fn start_step(&mut self, step: StepSpec) -> Result<()> {
        let run = self.run_mut()?;
        run.supervisor.start_step(step);
        run.step = Some(step);
        run.backlog.clear();
        run.requested = false;
        run.starving = false;
        Ok(())
    }

    /// Hands the backlog to idle workers, asking the `Lord` for more when
    /// it runs dry
    async fn pump(&mut self) -> Result<()> {
        let run = match self.run.as_mut() {
            Some(run) => run,
            None => return Ok(()),
        };
        let step = match run.step {
            Some(step) => step,
            None => return Ok(()),
        };
        for w in run.supervisor.idle_workers() {
            let portion = match run.backlog.pop_front() {
                Some(p) => p,
                None => break,
            };
            if let Err(e) = run.supervisor.dispatch(w, portion) {
                warn!("Could not hand portion {} to worker #{}: {}", portion, w, e);
                run.backlog.push_front(portion);
            }
        }
        let want = run.supervisor.idle_workers().len();
        if want > 0 && run.backlog.is_empty() && !run.requested && !run.starving
        {
            run.requested = true;
            let msg = ToLord::GetNextPortions {
                step_id: step.step_id,
                want,
            };
            self.lord.send(msg).await?;
        }
        Ok(())
    }

    async fn on_report(&mut self, report: WorkerReport) -> Result<()> {
        let run = match self.run.as_mut() {
            Some(run) => run,
            None => return Ok(()),
        };
        run.supervisor.on_report(&report);
        let step = match run.step {
            Some(step) if step.step_id == report.step_id => step,
            _ => {
                debug!("Dropping stale worker report {:?}", report);
                return Ok(());
            }
        };
        let msg = match report.outcome {
            Ok(PortionOutcome::Rows(side, rows)) => {
                let data = run.factors.side(side).rows_bytes(rows)?;
                Some(ToLord::AlsSaveCalcedFactors {
                    step_id: step.step_id,
                    portion: report.portion,
                    side,
                    rows,
                    data,
                })
            }
            Ok(PortionOutcome::Rmse(sums)) => Some(ToLord::RmseSaveCalcs {
                step_id: step.step_id,
                portion: report.portion,
                sums,
            }),
            Ok(PortionOutcome::Sgd) => {
                warn!("SGD portion {} computed on a cluster node", report.portion);
                None
            }
            Err(_) => {
                run.backlog.push_front(report.portion);
                if run.supervisor.live_workers() == 0 {
                    return Err(EmfError::Kernel(format!(
                        "every worker of node #{} failed",
                        self.node_id
                    )));
                }
                None
            }
        };
        if let Some(msg) = msg {
            self.lord.send(msg).await?;
        }
        self.pump().await
    }
}
