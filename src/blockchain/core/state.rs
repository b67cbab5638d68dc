use crate::crypto::{Address, ZERO_ADDRESS};
use crate::error::ChainError;
use crate::transaction::{PendingBlockTransaction, TxType};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::chain::Sha256Hash;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
}

impl Account {
    pub fn empty(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub id: u64,
    pub owner: Address,
    pub metadata_uri: String,
    pub nonce: u64,
}

/// Read/write access to the account and token ledger.
///
/// Implemented by the store transaction for real cycles and by
/// [`LedgerState`] for pure in-memory execution.
pub trait LedgerView {
    /// Returns the stored account or a fresh zero-balance one.
    fn account(&self, address: &Address) -> Result<Account, ChainError>;
    fn put_account(&mut self, account: &Account) -> Result<(), ChainError>;
    fn accounts(&self) -> Result<Vec<Account>, ChainError>;

    fn token(&self, id: u64) -> Result<Option<Token>, ChainError>;
    fn put_token(&mut self, token: &Token) -> Result<(), ChainError>;
    fn tokens(&self) -> Result<Vec<Token>, ChainError>;

    fn latest_token_id(&self) -> Result<u64, ChainError>;
    fn set_latest_token_id(&mut self, id: u64) -> Result<(), ChainError>;
}

/// Plain in-memory ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub accounts: BTreeMap<Address, Account>,
    pub tokens: BTreeMap<u64, Token>,
    pub latest_token_id: u64,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_balance(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.balance)
    }
}

impl LedgerView for LedgerState {
    fn account(&self, address: &Address) -> Result<Account, ChainError> {
        Ok(self
            .accounts
            .get(address)
            .cloned()
            .unwrap_or_else(|| Account::empty(*address)))
    }

    fn put_account(&mut self, account: &Account) -> Result<(), ChainError> {
        self.accounts.insert(account.address, account.clone());
        Ok(())
    }

    fn accounts(&self) -> Result<Vec<Account>, ChainError> {
        Ok(self.accounts.values().cloned().collect())
    }

    fn token(&self, id: u64) -> Result<Option<Token>, ChainError> {
        Ok(self.tokens.get(&id).cloned())
    }

    fn put_token(&mut self, token: &Token) -> Result<(), ChainError> {
        self.tokens.insert(token.id, token.clone());
        Ok(())
    }

    fn tokens(&self) -> Result<Vec<Token>, ChainError> {
        Ok(self.tokens.values().cloned().collect())
    }

    fn latest_token_id(&self) -> Result<u64, ChainError> {
        Ok(self.latest_token_id)
    }

    fn set_latest_token_id(&mut self, id: u64) -> Result<(), ChainError> {
        self.latest_token_id = id;
        Ok(())
    }
}

/// Hash over every account with a positive balance, ordered by address.
pub fn state_root(accounts: &[Account]) -> Sha256Hash {
    let mut funded: Vec<&Account> = accounts.iter().filter(|a| a.balance > 0).collect();
    funded.sort_by(|a, b| a.address.cmp(&b.address));

    let mut hasher = Sha256::new();
    for account in funded {
        hasher.update(account.address);
        hasher.update(account.balance.to_le_bytes());
        hasher.update(account.nonce.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Hash over every token, ordered by id.
pub fn tokens_root(tokens: &[Token]) -> Sha256Hash {
    let mut sorted: Vec<&Token> = tokens.iter().collect();
    sorted.sort_by_key(|t| t.id);

    let mut hasher = Sha256::new();
    for token in sorted {
        hasher.update(token.id.to_le_bytes());
        hasher.update(token.owner);
        hasher.update((token.metadata_uri.len() as u64).to_le_bytes());
        hasher.update(token.metadata_uri.as_bytes());
        hasher.update(token.nonce.to_le_bytes());
    }
    hasher.finalize().into()
}

/// State and tokens roots of the ledger as it stands.
pub fn ledger_roots(view: &dyn LedgerView) -> Result<(Sha256Hash, Sha256Hash), ChainError> {
    Ok((state_root(&view.accounts()?), tokens_root(&view.tokens()?)))
}

fn credit(view: &mut dyn LedgerView, address: &Address, amount: u64) -> Result<(), ChainError> {
    if amount == 0 {
        return Ok(());
    }
    let mut account = view.account(address)?;
    account.balance = account.balance.checked_add(amount).ok_or_else(|| {
        ChainError::Validation(format!("Balance overflow for {}", hex::encode(address)))
    })?;
    view.put_account(&account)
}

/// Applies one transaction. The signature is assumed to be verified already.
///
/// Only the sender's nonce moves; receivers are credited without touching
/// their nonce.
pub fn apply_transaction(
    view: &mut dyn LedgerView,
    ptx: &PendingBlockTransaction,
    beneficiary: &Address,
) -> Result<(), ChainError> {
    let tx = &ptx.signed.tx;
    let mut sender = view.account(&tx.from)?;

    if tx.nonce != sender.nonce {
        return Err(ChainError::Validation(format!(
            "Bad nonce for {}: expected {}, got {}",
            hex::encode(tx.from),
            sender.nonce,
            tx.nonce
        )));
    }

    let cost = ptx.total_cost()?;
    if sender.balance < cost {
        return Err(ChainError::Validation(format!(
            "Insufficient balance for {}: has {}, needs {}",
            hex::encode(tx.from),
            sender.balance,
            cost
        )));
    }

    let existing_token = match tx.tx_type {
        TxType::Token => {
            let existing = view.token(tx.token_id)?;
            if let Some(token) = &existing {
                if token.owner != tx.from {
                    return Err(ChainError::Validation(format!(
                        "Sender {} does not own token {} (owned by {})",
                        hex::encode(tx.from),
                        tx.token_id,
                        hex::encode(token.owner)
                    )));
                }
            }
            existing
        }
        TxType::Coin => None,
    };

    sender.balance -= cost;
    sender.nonce += 1;
    view.put_account(&sender)?;

    credit(view, &tx.to, tx.value)?;
    credit(view, beneficiary, tx.tip.saturating_add(ptx.gas_cost()?))?;

    if tx.tx_type == TxType::Token {
        let new_owner = if tx.to == ZERO_ADDRESS { tx.from } else { tx.to };
        let stale = existing_token
            .as_ref()
            .is_some_and(|token| tx.token_nonce < token.nonce);

        if !stale {
            view.put_token(&Token {
                id: tx.token_id,
                owner: new_owner,
                metadata_uri: tx.token_metadata_uri.clone(),
                nonce: tx.token_nonce,
            })?;
        }

        if existing_token.is_none() && tx.token_id > view.latest_token_id()? {
            view.set_latest_token_id(tx.token_id)?;
        }
    }

    Ok(())
}

/// Runs a block body against the ledger: signatures are checked up front in
/// parallel, then transactions apply in order and the mining reward is paid.
/// The first failure aborts; the caller owns rollback.
pub fn execute_block<'a, I>(
    view: &mut dyn LedgerView,
    transactions: I,
    beneficiary: &Address,
    mining_reward: u64,
) -> Result<(), ChainError>
where
    I: IntoIterator<Item = &'a PendingBlockTransaction>,
{
    let transactions: Vec<&PendingBlockTransaction> = transactions.into_iter().collect();

    transactions
        .par_iter()
        .try_for_each(|ptx| ptx.signed.verify_signature())?;

    for ptx in &transactions {
        apply_transaction(view, ptx, beneficiary)?;
    }

    credit(view, beneficiary, mining_reward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transaction::Transaction;
    use rand::seq::SliceRandom;

    const CHAIN_ID: u64 = 1;

    fn funded(keypair: &KeyPair, balance: u64) -> LedgerState {
        let mut state = LedgerState::new();
        state.accounts.insert(
            keypair.address(),
            Account {
                address: keypair.address(),
                balance,
                nonce: 0,
            },
        );
        state
    }

    fn stage(tx: Transaction, keypair: &KeyPair, gas_price: u64) -> PendingBlockTransaction {
        PendingBlockTransaction::stage(tx.sign(keypair).unwrap(), 1, gas_price)
    }

    #[test]
    fn test_coin_transfer_moves_value_and_sender_nonce() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap().address();
        let miner = KeyPair::generate().unwrap().address();
        let mut state = funded(&alice, 1_000);

        let ptx = stage(
            Transaction::coin(CHAIN_ID, 0, alice.address(), bob, 100).with_tip(2),
            &alice,
            3,
        );
        execute_block(&mut state, [&ptx], &miner, 0).unwrap();

        let sender = state.account(&alice.address()).unwrap();
        assert_eq!(sender.balance, 1_000 - 105);
        assert_eq!(sender.nonce, 1);
        assert_eq!(state.get_balance(&bob), 100);
        assert_eq!(state.account(&bob).unwrap().nonce, 0);
        assert_eq!(state.get_balance(&miner), 5);
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap().address();
        let mut state = funded(&alice, 1_000);

        let ptx = stage(Transaction::coin(CHAIN_ID, 0, alice.address(), bob, 10), &alice, 0);
        apply_transaction(&mut state, &ptx, &[9u8; 32]).unwrap();
        let err = apply_transaction(&mut state, &ptx, &[9u8; 32]).unwrap_err();
        assert!(err.to_string().contains("Bad nonce"));
    }

    #[test]
    fn test_insufficient_balance_leaves_ledger_untouched() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap().address();
        let mut state = funded(&alice, 50);

        let ptx = stage(Transaction::coin(CHAIN_ID, 0, alice.address(), bob, 51), &alice, 0);
        assert!(apply_transaction(&mut state, &ptx, &[9u8; 32]).is_err());
        assert_eq!(state.get_balance(&alice.address()), 50);
        assert_eq!(state.account(&alice.address()).unwrap().nonce, 0);
        assert_eq!(state.get_balance(&bob), 0);
    }

    #[test]
    fn test_token_mint_then_transfer_requires_ownership() {
        let minter = KeyPair::generate().unwrap();
        let stranger = KeyPair::generate().unwrap();
        let holder = KeyPair::generate().unwrap().address();
        let mut state = funded(&minter, 10);
        state.accounts.insert(
            stranger.address(),
            Account { address: stranger.address(), balance: 10, nonce: 0 },
        );

        let mint = stage(
            Transaction::token(CHAIN_ID, 0, minter.address(), ZERO_ADDRESS, 42, "ipfs://a", 1),
            &minter,
            0,
        );
        apply_transaction(&mut state, &mint, &[9u8; 32]).unwrap();
        let token = state.token(42).unwrap().unwrap();
        assert_eq!(token.owner, minter.address());
        assert_eq!(state.latest_token_id, 42);

        let theft = stage(
            Transaction::token(CHAIN_ID, 0, stranger.address(), holder, 42, "ipfs://a", 2),
            &stranger,
            0,
        );
        let err = apply_transaction(&mut state, &theft, &[9u8; 32]).unwrap_err();
        assert!(err.to_string().contains("does not own"));

        let transfer = stage(
            Transaction::token(CHAIN_ID, 1, minter.address(), holder, 42, "ipfs://a", 2),
            &minter,
            0,
        );
        apply_transaction(&mut state, &transfer, &[9u8; 32]).unwrap();
        assert_eq!(state.token(42).unwrap().unwrap().owner, holder);
    }

    #[test]
    fn test_token_equal_nonce_reapplies_and_lower_is_ignored() {
        let owner = KeyPair::generate().unwrap();
        let mut state = funded(&owner, 10);
        state.tokens.insert(
            42,
            Token { id: 42, owner: owner.address(), metadata_uri: "ipfs://v5".into(), nonce: 5 },
        );

        let replay = stage(
            Transaction::token(CHAIN_ID, 0, owner.address(), ZERO_ADDRESS, 42, "ipfs://v5", 5),
            &owner,
            0,
        );
        apply_transaction(&mut state, &replay, &[9u8; 32]).unwrap();
        let token = state.token(42).unwrap().unwrap();
        assert_eq!(token.nonce, 5);
        assert_eq!(token.owner, owner.address());
        assert_eq!(state.tokens.len(), 1);

        let older = stage(
            Transaction::token(CHAIN_ID, 1, owner.address(), ZERO_ADDRESS, 42, "ipfs://v3", 3),
            &owner,
            0,
        );
        apply_transaction(&mut state, &older, &[9u8; 32]).unwrap();
        let token = state.token(42).unwrap().unwrap();
        assert_eq!(token.nonce, 5);
        assert_eq!(token.metadata_uri, "ipfs://v5");
    }

    #[test]
    fn test_execute_block_conserves_coins() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let miner = KeyPair::generate().unwrap().address();
        let mut state = funded(&alice, 1_000);
        state.accounts.insert(
            bob.address(),
            Account { address: bob.address(), balance: 500, nonce: 0 },
        );
        let before: u64 = state.accounts.values().map(|a| a.balance).sum();

        let txs = vec![
            stage(Transaction::coin(CHAIN_ID, 0, alice.address(), bob.address(), 300).with_tip(1), &alice, 2),
            stage(Transaction::coin(CHAIN_ID, 0, bob.address(), alice.address(), 50), &bob, 2),
            stage(Transaction::coin(CHAIN_ID, 1, alice.address(), bob.address(), 7), &alice, 2),
        ];
        execute_block(&mut state, &txs, &miner, 0).unwrap();

        let after: u64 = state.accounts.values().map(|a| a.balance).sum();
        assert_eq!(before, after);
        assert_eq!(state.get_balance(&miner), 1 + 2 * 3);
    }

    #[test]
    fn test_execute_block_rejects_bad_signature() {
        let alice = KeyPair::generate().unwrap();
        let mallory = KeyPair::generate().unwrap();
        let mut state = funded(&alice, 1_000);

        let forged = stage(
            Transaction::coin(CHAIN_ID, 0, alice.address(), mallory.address(), 999),
            &mallory,
            0,
        );
        assert!(execute_block(&mut state, [&forged], &[9u8; 32], 0).is_err());
        assert_eq!(state.get_balance(&alice.address()), 1_000);
    }

    #[test]
    fn test_roots_ignore_order_and_empty_accounts() {
        let mut accounts: Vec<Account> = (0u8..20)
            .map(|i| Account { address: [i; 32], balance: i as u64 * 10, nonce: i as u64 })
            .collect();
        let mut tokens: Vec<Token> = (0u64..20)
            .map(|i| Token { id: i, owner: [i as u8; 32], metadata_uri: format!("uri-{}", i), nonce: i })
            .collect();

        let expected_state = state_root(&accounts);
        let expected_tokens = tokens_root(&tokens);

        let mut rng = rand::thread_rng();
        accounts.shuffle(&mut rng);
        tokens.shuffle(&mut rng);
        assert_eq!(state_root(&accounts), expected_state);
        assert_eq!(tokens_root(&tokens), expected_tokens);

        // Zero-balance accounts do not contribute.
        accounts.push(Account { address: [200u8; 32], balance: 0, nonce: 3 });
        assert_eq!(state_root(&accounts), expected_state);
    }
}
