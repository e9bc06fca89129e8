use emf::config::SgdParams;
use emf::factors::{FactorMatrix, RowRange, RowsMut};
use emf::kernel::RmseSums;
use emf::network::{Message, ToChief, ToLord};
use emf::{
    Chief, EmfError, Kernel, Lord, MemoryRatingStore, NativeKernel, Rating,
    Status, TrainingOptions,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

fn ratings() -> Vec<Rating> {
    let mut ratings = Vec::new();
    for u in 0..40 {
        for i in 0..25 {
            if (u * 3 + i) % 4 != 0 {
                ratings.push(Rating {
                    user: u,
                    item: i,
                    value: (1 + (u + 2 * i) % 5) as f32,
                });
            }
        }
    }
    ratings
}

fn options() -> TrainingOptions {
    let mut opts = TrainingOptions::default();
    opts.use_clustering = true;
    opts.cluster_server_port = 0;
    opts.factors_count = 3;
    opts.train_iters = 2;
    opts.num_threads_for_train.als = 2;
    opts.ratings_in_portion_for_als.by_user = 15;
    opts.ratings_in_portion_for_als.by_item = 15;
    opts.ratings_in_portion_for_rmse = 10;
    opts.step_stall_timeout_secs = 30;
    opts
}

fn local(addr: SocketAddr) -> String {
    format!("127.0.0.1:{}", addr.port())
}

/// A node driven by hand over the wire format, in place of a `Chief`
struct RawNode {
    socket: TcpStream,
}

impl RawNode {
    async fn register(lord: &str) -> RawNode {
        let socket = TcpStream::connect(lord).await.unwrap();
        let mut node = RawNode { socket };
        node.send(ToLord::Register {
            host: "127.0.0.1".to_string(),
            port: 1,
        })
        .await;
        node
    }

    async fn send(&mut self, msg: ToLord) {
        let body = bincode::serialize(&Message::new(0, 0, 0, msg)).unwrap();
        self.socket.write_u32(body.len() as u32).await.unwrap();
        self.socket.write_all(&body).await.unwrap();
    }

    async fn recv(&mut self) -> ToChief {
        let len = self.socket.read_u32().await.unwrap() as usize;
        let mut body = vec![0; len];
        self.socket.read_exact(&mut body).await.unwrap();
        bincode::deserialize::<Message<ToChief>>(&body).unwrap().msg
    }
}

/// Joins the cluster, claims `want` portions of the first ALS step and
/// disconnects without computing them
async fn claim_and_vanish(mut node: RawNode, want: usize) -> Vec<usize> {
    loop {
        match node.recv().await {
            ToChief::MeetCluster { .. } => {
                node.send(ToLord::MetCluster {
                    connected: Vec::new(),
                })
                .await
            }
            ToChief::PrepareToTrain { .. } => {
                node.send(ToLord::PreparedToTrain).await
            }
            ToChief::StartAlsTrainStep { step_id, .. } => {
                node.send(ToLord::GetNextPortions { step_id, want }).await
            }
            ToChief::RetNextPortions { portions, .. } => return portions,
            _ => (),
        }
    }
}

/// `NativeKernel` that holds every row solve until `open` is set, and
/// records the rows of each solve in call order
#[derive(Default)]
struct GatedKernel {
    open: AtomicBool,
    solved: Mutex<Vec<RowRange>>,
}

impl Kernel for GatedKernel {
    fn als_rows(
        &self,
        out: &mut RowsMut<'_>,
        ratings: &[Vec<(usize, f32)>],
        other: &FactorMatrix,
        lambda: f64,
    ) -> emf::Result<()> {
        while !self.open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.solved.lock().unwrap().push(out.range());
        NativeKernel.als_rows(out, ratings, other, lambda)
    }

    fn sgd(
        &self,
        ratings: &[Rating],
        users: &mut RowsMut<'_>,
        items: &mut RowsMut<'_>,
        params: &SgdParams,
    ) -> emf::Result<()> {
        NativeKernel.sgd(ratings, users, items, params)
    }

    fn rmse(
        &self,
        ratings: &[Rating],
        users: &FactorMatrix,
        items: &FactorMatrix,
        shift: f64,
    ) -> RmseSums {
        NativeKernel.rmse(ratings, users, items, shift)
    }
}

async fn chief(lord: &str) -> Result<Chief, EmfError> {
    Chief::connect(
        lord,
        "127.0.0.1",
        None,
        Arc::new(MemoryRatingStore::from_ratings(ratings())),
        Arc::new(NativeKernel),
    )
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_als_training() {
    let store = Arc::new(MemoryRatingStore::from_ratings(ratings()));
    let mut lord = Lord::spawn(options(), store, Arc::new(NativeKernel))
        .await
        .unwrap();
    let addr = local(lord.cluster_addr().unwrap());

    let first = chief(&addr).await.unwrap();
    let second = chief(&addr).await.unwrap();
    assert_ne!(first.node_id(), second.node_id());
    let first = tokio::spawn(first.run());
    let second = tokio::spawn(second.run());

    lord.wait_for_nodes(2).await.unwrap();
    let info = lord.train().await.unwrap();
    assert_eq!(info.cluster_nodes, 2);
    assert_eq!(info.mesh_links, 2);
    assert_eq!(info.calc_count, 1);
    assert!(info.rmse_validate.unwrap().is_finite());
    assert!(info.rmse_test.unwrap().is_finite());
    assert_eq!(lord.status(), Status::Ready);

    lord.shutdown().await;
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_mesh() {
    let store = Arc::new(MemoryRatingStore::from_ratings(ratings()));
    let mut opts = options();
    opts.train_iters = 1;
    let mut lord = Lord::spawn(opts, store, Arc::new(NativeKernel))
        .await
        .unwrap();
    let addr = local(lord.cluster_addr().unwrap());

    let mut chiefs = Vec::new();
    for _ in 0..3 {
        let node = chief(&addr).await.unwrap();
        chiefs.push(tokio::spawn(node.run()));
    }
    lord.wait_for_nodes(3).await.unwrap();
    let info = lord.train().await.unwrap();
    assert_eq!(info.cluster_nodes, 3);
    assert_eq!(info.mesh_links, 6);
    assert!(info.rmse_test.unwrap().is_finite());

    lord.shutdown().await;
    for node in chiefs {
        assert!(node.await.unwrap().is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_node_portions_are_reissued_first() {
    let mut opts = options();
    opts.train_iters = 1;
    opts.num_threads_for_train.als = 1;
    // one user per portion, so portion `i` is row `i`
    opts.ratings_in_portion_for_als.by_user = 5;
    let store = Arc::new(MemoryRatingStore::from_ratings(ratings()));
    let kernel = Arc::new(GatedKernel::default());
    let mut lord = Lord::spawn(opts, store, kernel.clone()).await.unwrap();
    let addr = local(lord.cluster_addr().unwrap());

    let node = RawNode::register(&addr).await;
    lord.wait_for_nodes(1).await.unwrap();
    let node = tokio::spawn(claim_and_vanish(node, 3));
    let release = async {
        let claimed = node.await.unwrap();
        while lord.node_count() != 0 {
            sleep(Duration::from_millis(5)).await;
        }
        kernel.open.store(true, Ordering::SeqCst);
        claimed
    };
    let (info, claimed) = tokio::join!(lord.train(), release);
    let info = info.unwrap();
    assert_eq!(claimed, vec![1, 2, 3]);
    assert_eq!(info.cluster_nodes, 1);
    assert!(info.rmse_test.unwrap().is_finite());
    assert_eq!(lord.status(), Status::Ready);

    // the local worker held row 0, then took back the lost rows before
    // anything fresh
    let solved = kernel.solved.lock().unwrap().clone();
    let first: HashSet<RowRange> = solved.iter().take(4).copied().collect();
    let expected: HashSet<RowRange> =
        (0..4).map(|r| RowRange::new(r, r + 1)).collect();
    assert_eq!(first, expected);
    assert_eq!(solved[0], RowRange::new(0, 1));
    lord.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_node_is_dropped_and_late_node_rejected() {
    let mut opts = options();
    opts.step_stall_timeout_secs = 2;
    let store = Arc::new(MemoryRatingStore::from_ratings(ratings()));
    let mut lord = Lord::spawn(opts, store, Arc::new(NativeKernel))
        .await
        .unwrap();
    let addr = local(lord.cluster_addr().unwrap());

    // registers, then never answers anything
    let _silent = RawNode::register(&addr).await;
    lord.wait_for_nodes(1).await.unwrap();

    let late = async {
        while lord.status() == Status::Ready {
            sleep(Duration::from_millis(5)).await;
        }
        chief(&addr).await
    };
    let (info, late) = tokio::join!(lord.train(), late);
    let info = info.unwrap();
    assert_eq!(info.cluster_nodes, 0);
    assert!(info.rmse_test.unwrap().is_finite());
    match late {
        Err(EmfError::Rejected(reason)) => {
            assert!(reason.starts_with("Sorry, server state is"))
        }
        other => panic!("expected a rejection, got {:?}", other.err()),
    }
    lord.shutdown().await;
}
