//! Proof-of-work sealing and cancellation

mod common;

use authority_chain::blockchain::leading_zero_bits;
use authority_chain::crypto::KeyPair;
use authority_chain::error::ChainError;
use authority_chain::miner::Miner;
use authority_chain::network::LocalNetwork;
use authority_chain::shutdown::ShutdownController;
use authority_chain::validator::ValidationOutcome;
use common::*;
use std::time::{Duration, Instant};
use tokio::time::timeout;

#[tokio::test]
async fn test_pow_block_meets_difficulty() {
    timeout(Duration::from_secs(30), async {
        let network = LocalNetwork::new();
        let miner = Harness::in_memory(&network, "miner", pow(8)).await;
        let follower = Harness::in_memory(&network, "follower", pow(8)).await;
        let beneficiary = KeyPair::generate().unwrap().address();
        let b = KeyPair::generate().unwrap().address();

        let block = miner.mine(beneficiary, &[transfer(&coinbase(), 0, b, 100)]).await;
        assert_eq!(block.header.difficulty, 8);
        assert_eq!(block.header.hash(), block.hash);
        assert!(leading_zero_bits(&block.hash) >= 8);
        assert!(block.validator.is_empty());
        assert_eq!(miner.account(&beneficiary).await.balance, 10);

        assert_eq!(
            follower.validator().process(block).await.unwrap(),
            ValidationOutcome::Committed
        );
        assert_eq!(follower.account(&b).await.balance, 100);
    })
    .await
    .expect("pow mining timed out");
}

#[tokio::test]
async fn test_pow_rejects_other_difficulty() {
    timeout(Duration::from_secs(30), async {
        let network = LocalNetwork::new();
        let easy = Harness::in_memory(&network, "easy", pow(1)).await;
        let strict = Harness::in_memory(&network, "strict", pow(12)).await;
        let b = KeyPair::generate().unwrap().address();

        let block = easy
            .mine(KeyPair::generate().unwrap().address(), &[transfer(&coinbase(), 0, b, 1)])
            .await;
        let result = strict.validator().process(block).await;
        assert!(matches!(result, Err(ChainError::InvalidProof(_))));
        assert!(strict.tip().await.is_genesis());
    })
    .await
    .expect("difficulty check timed out");
}

#[tokio::test]
async fn test_cancel_stops_search_promptly() {
    timeout(Duration::from_secs(10), async {
        let network = LocalNetwork::new();
        // Far beyond what the search can reach before it is cancelled.
        let node = Harness::in_memory(&network, "miner", pow(120)).await;
        node.mempool
            .receive(transfer(&coinbase(), 0, KeyPair::generate().unwrap().address(), 1))
            .await
            .unwrap();
        node.mempool.drain().await.unwrap();

        let controller = ShutdownController::new();
        let miner = Miner::new(
            node.ctx.clone(),
            KeyPair::generate().unwrap().address(),
            controller.subscribe(),
        );
        let search = tokio::spawn(async move { miner.mine_once().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled_at = Instant::now();
        controller.shutdown();

        let result = search.await.unwrap();
        assert!(matches!(result, Err(ChainError::Cancelled)));
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        assert!(node.tip().await.is_genesis());
        assert_eq!(node.mempool.pending_len().await.unwrap(), 1);
    })
    .await
    .expect("cancellation timed out");
}

#[tokio::test]
async fn test_search_aborts_when_tip_moves() {
    timeout(Duration::from_secs(30), async {
        let network = LocalNetwork::new();
        let slow = Harness::in_memory(&network, "slow", pow(120)).await;
        let b = KeyPair::generate().unwrap().address();

        slow.mempool.receive(transfer(&coinbase(), 0, b, 1)).await.unwrap();
        slow.mempool.drain().await.unwrap();
        let miner = slow.miner(KeyPair::generate().unwrap().address());
        let search = tokio::spawn(async move { miner.mine_once().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A block produced elsewhere lands; its proof is checked with an easy
        // strategy so the test does not have to find a 120-bit hash.
        let easy = Harness::in_memory(&network, "easy", pow(1)).await;
        let block = easy
            .mine(KeyPair::generate().unwrap().address(), &[transfer(&coinbase(), 0, b, 1)])
            .await;
        let mut txn = slow.ctx.coordinator.open().await.unwrap();
        authority_chain::validator::apply_block(&mut txn, &block, pow(1).as_ref(), &slow.ctx.rules)
            .unwrap();
        txn.commit().unwrap();

        let result = search.await.unwrap();
        assert!(matches!(result, Err(ChainError::Cancelled)));
        assert_eq!(slow.tip().await.hash, block.hash);
    })
    .await
    .expect("tip-move abort timed out");
}
