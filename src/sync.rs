//! Majority-vote chain synchronization
//!
//! The client asks every peer for its latest hash, picks the hash with the
//! most votes and, when that chain is longer than ours, walks back from it
//! until it meets our tip. The ancestry is fetched before the store is
//! opened, then applied oldest-first inside one store transaction: any
//! failure at any depth discards all of it, and a tip that moved meanwhile
//! aborts the attempt.
//!
//! The server answers vote requests with the local latest hash and block
//! requests with stored block data.

use crate::blockchain::{BlockData, Sha256Hash, GENESIS_MARKER};
use crate::context::ChainContext;
use crate::error::{ChainError, Result};
use crate::keyed_mutex::SYNCING_LOCK;
use crate::network::{
    decode, encode, BlockRequest, BlockResponse, PeerId, VoteRequest, VoteResponse,
    BLOCK_PROTOCOL, VOTE_PROTOCOL,
};
use crate::validator::apply_block;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    NoPeers,
    /// Peers answered but none had anything beyond genesis.
    NoVotes,
    InSync,
    /// Our chain is at least as long as the winner's.
    Ahead,
    Backfilled { blocks: usize },
}

/// Votes for one hash, in the order they arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub hash: String,
    pub voters: Vec<PeerId>,
}

impl Tally {
    pub fn count(&self) -> usize {
        self.voters.len()
    }
}

/// Picks the most-voted hash. Ties go to the hash seen first; empty votes
/// do not count.
pub fn tally_votes(votes: &[(PeerId, String)]) -> Option<Tally> {
    let mut tallies: Vec<Tally> = Vec::new();
    for (peer, hash) in votes {
        if hash.is_empty() {
            continue;
        }
        match tallies.iter_mut().find(|t| &t.hash == hash) {
            Some(tally) => tally.voters.push(peer.clone()),
            None => tallies.push(Tally {
                hash: hash.clone(),
                voters: vec![peer.clone()],
            }),
        }
    }

    let mut winner: Option<Tally> = None;
    for tally in tallies {
        if winner.as_ref().map_or(true, |w| tally.count() > w.count()) {
            winner = Some(tally);
        }
    }
    winner
}

fn parse_hash(hex_str: &str) -> Result<Sha256Hash> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ChainError::Network(format!("peer voted for non-hex hash: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::Network(format!("peer voted for malformed hash {}", hex_str)))
}

pub struct SyncClient {
    ctx: ChainContext,
    vote_timeout: Duration,
    max_backfill_depth: u64,
}

impl SyncClient {
    pub fn new(ctx: ChainContext, vote_timeout: Duration, max_backfill_depth: u64) -> Self {
        Self {
            ctx,
            vote_timeout,
            max_backfill_depth,
        }
    }

    #[instrument(skip(self))]
    pub async fn sync_once(&self) -> Result<SyncOutcome> {
        let peers = self.ctx.transport.peers();
        if peers.is_empty() {
            return Ok(SyncOutcome::NoPeers);
        }
        let _role = self.ctx.locks.acquire(SYNCING_LOCK).await;

        let votes = self.collect_votes(&peers).await;
        let Some(winner) = tally_votes(&votes) else {
            debug!(peers = peers.len(), "No peer reported a chain beyond genesis");
            return Ok(SyncOutcome::NoVotes);
        };

        let local = self.ctx.coordinator.latest_hash();
        if hex::encode(local) == winner.hash {
            return Ok(SyncOutcome::InSync);
        }

        let target = parse_hash(&winner.hash)?;
        let sources = source_order(&winner.voters, &peers);
        let head = self.fetch_block(&target, &sources).await?;

        let tip = {
            let txn = self.ctx.coordinator.open().await?;
            let tip = txn.tip()?;
            txn.discard();
            tip
        };
        if tip.number >= head.number() {
            debug!(local = tip.number, winner = head.number(), "Local chain is not behind");
            return Ok(SyncOutcome::Ahead);
        }
        info!(
            local = tip.number,
            winner = head.number(),
            votes = winner.count(),
            "Chain tip differs from peer majority, backfilling"
        );

        // Walk back to our tip, newest first, with no store transaction open.
        let mut ancestry = vec![head];
        loop {
            let oldest = &ancestry[ancestry.len() - 1];
            let parent = oldest.header.prev_block_hash;
            if parent == tip.hash {
                break;
            }
            if oldest.number() <= tip.number + 1 {
                return Err(ChainError::ConsensusDivergence(format!(
                    "majority chain joins ours at {} below our tip {}",
                    hex::encode(parent),
                    tip.hash_hex()
                )));
            }
            if ancestry.len() as u64 >= self.max_backfill_depth {
                return Err(ChainError::ConsensusDivergence(format!(
                    "no join point within {} blocks",
                    self.max_backfill_depth
                )));
            }
            ancestry.push(self.fetch_block(&parent, &sources).await?);
        }

        let mut txn = self.ctx.coordinator.open().await?;
        let current = txn.tip()?;
        if current.hash != tip.hash {
            return Err(ChainError::StaleTip {
                expected: tip.hash_hex(),
                actual: current.hash_hex(),
            });
        }

        for block in ancestry.iter().rev() {
            apply_block(&mut txn, block, self.ctx.strategy.as_ref(), &self.ctx.rules)?;
        }
        txn.commit()?;

        for block in &ancestry {
            self.ctx.cache.insert_block(block).await;
        }
        info!(blocks = ancestry.len(), "Backfill committed");
        Ok(SyncOutcome::Backfilled {
            blocks: ancestry.len(),
        })
    }

    /// Latest-hash votes in arrival order. Unreachable peers are skipped.
    async fn collect_votes(&self, peers: &[PeerId]) -> Vec<(PeerId, String)> {
        let request = match encode(&VoteRequest) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode vote request");
                return Vec::new();
            }
        };

        let mut requests = JoinSet::new();
        for peer in peers {
            let transport = self.ctx.transport.clone();
            let peer = peer.clone();
            let payload = request.clone();
            let timeout = self.vote_timeout;
            requests.spawn(async move {
                let answer = transport
                    .request(&peer, VOTE_PROTOCOL, payload, timeout)
                    .await
                    .and_then(|bytes| decode::<VoteResponse>(&bytes));
                (peer, answer)
            });
        }

        let mut votes = Vec::new();
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((peer, Ok(vote))) => votes.push((peer, vote.latest_hash)),
                Ok((peer, Err(e))) => debug!(peer = %peer, error = %e, "No vote from peer"),
                Err(e) => warn!(error = %e, "Vote request task failed"),
            }
        }
        votes
    }

    async fn fetch_block(&self, hash: &Sha256Hash, sources: &[PeerId]) -> Result<BlockData> {
        let request = encode(&BlockRequest { hash: *hash })?;
        for peer in sources {
            let answer = self
                .ctx
                .transport
                .request(peer, BLOCK_PROTOCOL, request.clone(), self.vote_timeout)
                .await
                .and_then(|bytes| decode::<BlockResponse>(&bytes));
            match answer {
                Ok(BlockResponse { block: Some(block) })
                    if block.hash == *hash && block.header.hash() == *hash =>
                {
                    return Ok(block);
                }
                Ok(_) => debug!(peer = %peer, hash = %hex::encode(hash), "Peer could not supply block"),
                Err(e) => debug!(peer = %peer, error = %e, "Block request failed"),
            }
        }
        Err(ChainError::Network(format!(
            "no peer supplied block {}",
            hex::encode(hash)
        )))
    }
}

/// Winner's voters first, then everyone else.
fn source_order(voters: &[PeerId], peers: &[PeerId]) -> Vec<PeerId> {
    let mut order = voters.to_vec();
    order.extend(peers.iter().filter(|p| !voters.contains(p)).cloned());
    order
}

pub struct SyncServer {
    ctx: ChainContext,
    receive_timeout: Duration,
}

impl SyncServer {
    pub fn new(ctx: ChainContext, receive_timeout: Duration) -> Self {
        Self {
            ctx,
            receive_timeout,
        }
    }

    /// Answers one vote request with our latest hash, or an empty string
    /// while we hold nothing but genesis.
    pub async fn serve_vote_once(&self) -> Result<()> {
        let request = self
            .ctx
            .transport
            .next_request(VOTE_PROTOCOL, self.receive_timeout)
            .await?
            .ok_or(ChainError::NetworkSilence)?;
        decode::<VoteRequest>(&request.payload)?;

        let latest = self.ctx.coordinator.latest_hash();
        let latest_hash = if latest == GENESIS_MARKER {
            String::new()
        } else {
            hex::encode(latest)
        };
        debug!(peer = %request.from, latest = %latest_hash, "Answering vote request");
        request.respond(encode(&VoteResponse { latest_hash })?)
    }

    /// Answers one block request from the recent-block cache or the store.
    pub async fn serve_block_once(&self) -> Result<()> {
        let request = self
            .ctx
            .transport
            .next_request(BLOCK_PROTOCOL, self.receive_timeout)
            .await?
            .ok_or(ChainError::NetworkSilence)?;
        let BlockRequest { hash } = decode::<BlockRequest>(&request.payload)?;

        let block = match self.ctx.cache.get(&hash).await {
            Some(block) => Some(block),
            None => self.lookup(&hash).await?,
        };
        debug!(peer = %request.from, hash = %hex::encode(hash), found = block.is_some(), "Answering block request");
        request.respond(encode(&BlockResponse { block })?)
    }

    /// Store lookup that gives up rather than wait behind a long backfill.
    async fn lookup(&self, hash: &Sha256Hash) -> Result<Option<BlockData>> {
        match tokio::time::timeout(self.receive_timeout, self.ctx.coordinator.open()).await {
            Ok(txn) => {
                let txn = txn?;
                let block = txn.block(hash)?;
                txn.discard();
                Ok(block)
            }
            Err(_) => {
                debug!(hash = %hex::encode(hash), "Store busy, answering block request empty");
                Ok(None)
            }
        }
    }
}
