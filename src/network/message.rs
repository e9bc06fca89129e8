//! Defines the messages exchanged between the `Lord`, the `Chief`s and the
//! `Chief`s among themselves, and their wire encoding.
use crate::config::TrainingOptions;
use crate::error::EmfError;
use crate::factors::{RowRange, Side};
use crate::kernel::RmseSums;
use crate::network::{Message, MessageCodec};
use crate::portion::{PortionCatalog, StepKind};
use crate::store::{CalcInfo, SplitSnapshot};
use bincode::{deserialize, serialize};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const MAX_FRAME_SIZE: usize = 1_073_741_824; // 1 GB

/// How to reach a cluster node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: usize,
    pub host: String,
    pub port: u16,
}

/// Messages a `Chief` sends to the `Lord`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ToLord {
    /// First message on a new connection, `port` is where the `Chief`
    /// accepts its peers
    Register { host: String, port: u16 },
    /// The `Chief` is connected to these peers
    MetCluster { connected: Vec<usize> },
    PreparedToTrain,
    GetNextPortions { step_id: u64, want: usize },
    /// Rows of a finished ALS portion, as raw little-endian elements
    AlsSaveCalcedFactors {
        step_id: u64,
        portion: usize,
        side: Side,
        rows: RowRange,
        data: Vec<u8>,
    },
    RmseSaveCalcs {
        step_id: u64,
        portion: usize,
        sums: RmseSums,
    },
    EndedTrain,
}

/// Messages the `Lord` sends to a `Chief`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ToChief {
    Registered { node_id: usize },
    /// Registration refused, the connection is closed afterwards
    Rejected { reason: String },
    /// Connect to every one of these peers
    MeetCluster { peers: Vec<PeerInfo> },
    PrepareToTrain {
        options: TrainingOptions,
        catalog: PortionCatalog,
        split: SplitSnapshot,
        user_rows: usize,
        item_rows: usize,
    },
    /// A whole factor matrix, as raw little-endian elements
    SetFactors { side: Side, data: Vec<u8> },
    StartAlsTrainStep {
        step_id: u64,
        iteration: usize,
        step: StepKind,
    },
    StartCalcRmse {
        step_id: u64,
        step: StepKind,
        global_avg_shift: f64,
    },
    /// Reply to `GetNextPortions`, empty if nothing is left right now
    RetNextPortions { step_id: u64, portions: Vec<usize> },
    StepEnd { step_id: u64 },
    EndTrain { info: CalcInfo },
}

/// Handshake between two `Chief`s
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PeerMsg {
    SetMyNodeId { node_id: usize },
    GotYourNodeId { node_id: usize },
}

impl ToLord {
    /// The message name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ToLord::Register { .. } => "register",
            ToLord::MetCluster { .. } => "metCluster",
            ToLord::PreparedToTrain => "preparedToTrain",
            ToLord::GetNextPortions { .. } => "getNextPortions",
            ToLord::AlsSaveCalcedFactors { .. } => "alsSaveCalcedFactors",
            ToLord::RmseSaveCalcs { .. } => "rmseSaveCalcs",
            ToLord::EndedTrain => "endedTrain",
        }
    }
}

impl ToChief {
    /// The message name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ToChief::Registered { .. } => "registered",
            ToChief::Rejected { .. } => "rejected",
            ToChief::MeetCluster { .. } => "meetCluster",
            ToChief::PrepareToTrain { .. } => "prepareToTrain",
            ToChief::SetFactors { .. } => "setFactors",
            ToChief::StartAlsTrainStep { .. } => "startAlsTrainStep",
            ToChief::StartCalcRmse { .. } => "startCalcRmse",
            ToChief::RetNextPortions { .. } => "retNextPortions",
            ToChief::StepEnd { .. } => "stepEnd",
            ToChief::EndTrain { .. } => "endTrain",
        }
    }
}

impl<T> Message<T> {
    /// Creates a new `Message`.
    pub fn new(
        msg_id: usize,
        sender_id: usize,
        target_id: usize,
        msg: T,
    ) -> Self {
        Message {
            msg_id,
            sender_id,
            target_id,
            msg,
        }
    }
}

impl<T> MessageCodec<T> {
    /// Creates a new `MessageCodec`
    pub(crate) fn new() -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec,
        }
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = Message<T>;
    type Error = EmfError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(data) => Ok(Some(deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<Message<T>> for MessageCodec<T> {
    type Error = EmfError;

    fn encode(
        &mut self,
        item: Message<T>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let serialized = serialize(&item)?;
        Ok(self.codec.encode(Bytes::from(serialized), dst)?)
    }
}
