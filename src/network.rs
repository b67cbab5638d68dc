//! Peer-to-peer transport boundary
//!
//! Nodes talk over two named pub-sub topics and two request/response
//! protocols. [`Transport`] is the seam; [`local::LocalNetwork`] implements it
//! in-process for tests and the bundled binary.

pub mod local;
pub mod messages;

pub use local::{LocalNetwork, LocalTransport};
pub use messages::*;

use crate::error::{ChainError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::oneshot;

pub type PeerId = String;

pub const TRANSACTIONS_TOPIC: &str = "transactions";
pub const BLOCKS_TOPIC: &str = "blocks";
pub const TOPICS: [&str; 2] = [TRANSACTIONS_TOPIC, BLOCKS_TOPIC];

pub const VOTE_PROTOCOL: &str = "vote";
pub const BLOCK_PROTOCOL: &str = "block";
pub const PROTOCOLS: [&str; 2] = [VOTE_PROTOCOL, BLOCK_PROTOCOL];

/// A point-to-point request waiting for its answer.
#[derive(Debug)]
pub struct InboundRequest {
    pub from: PeerId,
    pub payload: Vec<u8>,
    responder: oneshot::Sender<Vec<u8>>,
}

impl InboundRequest {
    pub fn new(from: PeerId, payload: Vec<u8>) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (responder, rx) = oneshot::channel();
        (
            Self {
                from,
                payload,
                responder,
            },
            rx,
        )
    }

    pub fn respond(self, payload: Vec<u8>) -> Result<()> {
        self.responder
            .send(payload)
            .map_err(|_| ChainError::Network(format!("requester {} went away", self.from)))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Currently reachable peers, excluding this node.
    fn peers(&self) -> Vec<PeerId>;

    /// Broadcast to every subscriber of `topic`, this node included.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Next message on `topic`, or `None` once `timeout` passes quietly.
    async fn next_message(&self, topic: &str, timeout: Duration)
        -> Result<Option<(PeerId, Vec<u8>)>>;

    async fn request(
        &self,
        peer: &PeerId,
        protocol: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    /// Next inbound request for `protocol`, or `None` once `timeout` passes.
    async fn next_request(&self, protocol: &str, timeout: Duration)
        -> Result<Option<InboundRequest>>;
}
