//! RPC plumbing shared by the manager and the agent.
//!
//! One websocket per agent carries everything: a tarpc control service
//! (agent as client, manager as server) multiplexed with the raw task
//! lanes (`TaskRequest` manager to agent, `TaskResponse` agent to
//! manager). Frames are bincode-encoded [`MuxMessage`]s; each side
//! declares its incoming/outgoing aliases with [`define_stream_mux!`].

use std::{
    mem::size_of,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Sink, Stream};
use serde::{Deserialize, Serialize};
use tarpc::transport::channel::ChannelError;
use tokio::sync::mpsc;

pub mod control;
pub mod error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MuxMessage<Rpc, Task> {
    Rpc(Rpc),
    Task(Task),
}

#[macro_export]
macro_rules! define_stream_mux {
    ( manager ; $req:ty => $res:ty $(;)? ) => {
        /// A multiplexed message, incoming on the websocket.
        pub type MuxedMessageIncoming = $crate::rpc::MuxMessage<
            ::tarpc::ClientMessage<$req>,
            $crate::message::TaskResponse,
        >;

        /// A multiplexed message, outgoing on the websocket.
        pub type MuxedMessageOutgoing = $crate::rpc::MuxMessage<
            ::tarpc::Response<$res>,
            $crate::message::TaskRequest,
        >;
    };
    ( agent ; $req:ty => $res:ty $(;)? ) => {
        /// A multiplexed message, incoming on the websocket.
        pub type MuxedMessageIncoming = $crate::rpc::MuxMessage<
            ::tarpc::Response<$res>,
            $crate::message::TaskRequest,
        >;

        /// A multiplexed message, outgoing on the websocket.
        pub type MuxedMessageOutgoing = $crate::rpc::MuxMessage<
            ::tarpc::ClientMessage<$req>,
            $crate::message::TaskResponse,
        >;
    };
}

pub const PING_HEADER: &[u8] = b"jackadi-agent";
pub const PING_LENGTH: usize = size_of::<u32>() + size_of::<u128>();

pub struct RpcTransport<In, Out> {
    tx: mpsc::UnboundedSender<Out>,
    rx: mpsc::UnboundedReceiver<In>,
}

impl<In, Out> RpcTransport<In, Out> {
    /// Constructs a new RPC transport by building two channels. The returned
    /// transport can be used as a tarpc transport, but the other tx and rx
    /// must be used to pass messages around as they come in/leave the
    /// websocket.
    pub fn new() -> (
        mpsc::UnboundedSender<In>,
        Self,
        mpsc::UnboundedReceiver<Out>,
    ) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        (tx1, Self { tx: tx2, rx: rx1 }, rx2)
    }
}

impl<In, Out> Stream for RpcTransport<In, Out> {
    type Item = Result<In, ChannelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|o| o.map(Ok))
            .map_err(ChannelError::Receive)
    }
}

const CLOSED_MESSAGE: &str = "the channel is closed";

impl<In, Out> Sink<Out> for RpcTransport<In, Out> {
    type Error = ChannelError;

    fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(if self.tx.is_closed() {
            Err(ChannelError::Ready(CLOSED_MESSAGE.into()))
        } else {
            Ok(())
        })
    }

    fn start_send(self: Pin<&mut Self>, item: Out) -> Result<(), Self::Error> {
        self.tx
            .send(item)
            .map_err(|_| ChannelError::Send(CLOSED_MESSAGE.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
