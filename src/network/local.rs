//! In-process transport hub.
//!
//! Every joined node gets an unbounded inbox per topic and per protocol.
//! Publishing fans out to all connected nodes including the publisher.
//! Isolated nodes neither send nor receive, which lets tests model partitions.

use super::{InboundRequest, PeerId, Transport, PROTOCOLS, TOPICS};
use crate::error::{ChainError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};

type Envelope = (PeerId, Vec<u8>);

struct Outboxes {
    topics: HashMap<&'static str, mpsc::UnboundedSender<Envelope>>,
    protocols: HashMap<&'static str, mpsc::UnboundedSender<InboundRequest>>,
}

#[derive(Default)]
struct HubState {
    nodes: BTreeMap<PeerId, Outboxes>,
    isolated: HashSet<PeerId>,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<HubState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Joining again under the same id replaces its inboxes.
    pub fn join(&self, peer: impl Into<PeerId>) -> Arc<LocalTransport> {
        let peer = peer.into();
        let mut topic_tx = HashMap::new();
        let mut topic_rx = HashMap::new();
        for topic in TOPICS {
            let (tx, rx) = mpsc::unbounded_channel();
            topic_tx.insert(topic, tx);
            topic_rx.insert(topic, AsyncMutex::new(rx));
        }

        let mut protocol_tx = HashMap::new();
        let mut protocol_rx = HashMap::new();
        for protocol in PROTOCOLS {
            let (tx, rx) = mpsc::unbounded_channel();
            protocol_tx.insert(protocol, tx);
            protocol_rx.insert(protocol, AsyncMutex::new(rx));
        }

        self.state.lock().nodes.insert(
            peer.clone(),
            Outboxes {
                topics: topic_tx,
                protocols: protocol_tx,
            },
        );
        debug!(peer = %peer, "Joined local network");

        Arc::new(LocalTransport {
            id: peer,
            hub: self.clone(),
            topics: topic_rx,
            protocols: protocol_rx,
        })
    }

    pub fn leave(&self, peer: &str) {
        let mut state = self.state.lock();
        state.nodes.remove(peer);
        state.isolated.remove(peer);
    }

    /// Cuts `peer` off from everyone else until [`reconnect`](Self::reconnect).
    pub fn isolate(&self, peer: &str) {
        self.state.lock().isolated.insert(peer.to_string());
    }

    pub fn reconnect(&self, peer: &str) {
        self.state.lock().isolated.remove(peer);
    }

    fn can_talk(state: &HubState, a: &str, b: &str) -> bool {
        a == b || (!state.isolated.contains(a) && !state.isolated.contains(b))
    }
}

pub struct LocalTransport {
    id: PeerId,
    hub: LocalNetwork,
    topics: HashMap<&'static str, AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>,
    protocols: HashMap<&'static str, AsyncMutex<mpsc::UnboundedReceiver<InboundRequest>>>,
}

fn unknown(kind: &str, name: &str) -> ChainError {
    ChainError::Network(format!("unknown {} '{}'", kind, name))
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_peer(&self) -> PeerId {
        self.id.clone()
    }

    fn peers(&self) -> Vec<PeerId> {
        let state = self.hub.state.lock();
        state
            .nodes
            .keys()
            .filter(|peer| **peer != self.id && LocalNetwork::can_talk(&state, &self.id, peer))
            .cloned()
            .collect()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.topics.contains_key(topic) {
            return Err(unknown("topic", topic));
        }
        let state = self.hub.state.lock();
        for (peer, outboxes) in &state.nodes {
            if !LocalNetwork::can_talk(&state, &self.id, peer) {
                continue;
            }
            if let Some(tx) = outboxes.topics.get(topic) {
                // A closed inbox belongs to a node that has shut down.
                if tx.send((self.id.clone(), payload.clone())).is_err() {
                    trace!(peer = %peer, topic, "Dropped message for departed peer");
                }
            }
        }
        Ok(())
    }

    async fn next_message(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<(PeerId, Vec<u8>)>> {
        let inbox = self.topics.get(topic).ok_or_else(|| unknown("topic", topic))?;
        let mut inbox = inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(envelope)) => Ok(Some(envelope)),
            Ok(None) => Err(ChainError::Network(format!("topic '{}' closed", topic))),
            Err(_) => Ok(None),
        }
    }

    async fn request(
        &self,
        peer: &PeerId,
        protocol: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let response = {
            let state = self.hub.state.lock();
            if !LocalNetwork::can_talk(&state, &self.id, peer) {
                return Err(ChainError::Network(format!("peer {} unreachable", peer)));
            }
            let outbox = state
                .nodes
                .get(peer)
                .ok_or_else(|| ChainError::Network(format!("unknown peer {}", peer)))?
                .protocols
                .get(protocol)
                .ok_or_else(|| unknown("protocol", protocol))?;

            let (request, response) = InboundRequest::new(self.id.clone(), payload);
            outbox
                .send(request)
                .map_err(|_| ChainError::Network(format!("peer {} is not serving", peer)))?;
            response
        };

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(ChainError::Network(format!(
                "peer {} dropped the {} request",
                peer, protocol
            ))),
            Err(_) => Err(ChainError::Network(format!(
                "{} request to {} timed out",
                protocol, peer
            ))),
        }
    }

    async fn next_request(
        &self,
        protocol: &str,
        timeout: Duration,
    ) -> Result<Option<InboundRequest>> {
        let inbox = self
            .protocols
            .get(protocol)
            .ok_or_else(|| unknown("protocol", protocol))?;
        let mut inbox = inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(request)) => Ok(Some(request)),
            Ok(None) => Err(ChainError::Network(format!("protocol '{}' closed", protocol))),
            Err(_) => Ok(None),
        }
    }
}
