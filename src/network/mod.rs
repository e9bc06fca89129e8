//! Framing and connections for talking to other nodes over TCP.
//!
//! Every frame is a length-delimited, `bincode` encoded `Message<T>`. Each
//! connection carries a single message type per direction, one of the
//! closed enums in [`message`](message/index.html).
use crate::error::{EmfError, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{self, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

pub mod message;

pub use message::{PeerInfo, PeerMsg, ToChief, ToLord};

/// The read half of a connection, yielding `Message<T>`s
pub type FramedStream<T> = FramedRead<ReadHalf<TcpStream>, MessageCodec<T>>;
/// The write half of a connection, accepting `Message<T>`s
pub type FramedSink<T> = FramedWrite<WriteHalf<TcpStream>, MessageCodec<T>>;

/// A message for communication between nodes
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message<T> {
    /// The id of this message
    pub msg_id: usize,
    /// The id of the sender, `0` is the `Lord`
    pub sender_id: usize,
    /// The id of the node this message is being sent to
    pub target_id: usize,
    /// The body of the message
    pub msg: T,
}

#[derive(Debug)]
pub struct MessageCodec<T> {
    phantom: std::marker::PhantomData<T>,
    pub(crate) codec: LengthDelimitedCodec,
}

/// The sending side of a connection to another node
#[derive(Debug)]
pub struct Connection<T> {
    /// The address of the other end
    pub address: SocketAddr,
    pub(crate) sink: FramedSink<T>,
    /// Our id, stamped on every message as the sender
    pub(crate) my_id: usize,
    /// The id of the other end
    pub(crate) target_id: usize,
    msg_id: usize,
}

impl<T: Serialize> Connection<T> {
    pub(crate) fn new(
        address: SocketAddr,
        sink: FramedSink<T>,
        my_id: usize,
        target_id: usize,
    ) -> Self {
        Connection {
            address,
            sink,
            my_id,
            target_id,
            msg_id: 0,
        }
    }

    /// Sends `msg` to the other end
    pub async fn send(&mut self, msg: T) -> Result<()> {
        let message =
            Message::new(self.msg_id, self.my_id, self.target_id, msg);
        self.msg_id += 1;
        self.sink.send(message).await
    }
}

/// Splits `stream` into a framed reader of `R` and a framed writer of `W`
pub(crate) fn split_framed<R, W>(
    stream: TcpStream,
) -> (FramedStream<R>, FramedSink<W>) {
    let (reader, writer) = io::split(stream);
    (
        FramedRead::new(reader, MessageCodec::new()),
        FramedWrite::new(writer, MessageCodec::new()),
    )
}

/// Reads the next message from `reader`
pub(crate) async fn read_msg<T: DeserializeOwned>(
    reader: &mut FramedStream<T>,
) -> Result<Message<T>> {
    match reader.next().await {
        None => Err(EmfError::StreamClosed),
        Some(x) => x,
    }
}

/// Sends one message over a bare sink, for handshakes made before a
/// `Connection` exists
pub(crate) async fn send_msg<T: Serialize>(
    sink: &mut FramedSink<T>,
    sender_id: usize,
    target_id: usize,
    msg: T,
) -> Result<()> {
    sink.send(Message::new(0, sender_id, target_id, msg)).await
}
