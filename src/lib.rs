//! AuthorityChain - an account-based blockchain node with pluggable
//! proof-of-authority and proof-of-work consensus
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Block headers, ledger state transitions and structural checks
//! - [`transaction`] - Coin and token transactions, signing and staging
//! - [`genesis`] - Genesis parameters and opening balances
//!
//! ## Block Production & Validation
//! - [`mempool`] - Transaction intake and the pending-block buffer
//! - [`consensus`] - Proof-of-authority and proof-of-work strategies
//! - [`miner`] - Block assembly, sealing and commit
//! - [`validator`] - Received-block checks and the shared apply path
//!
//! ## Networking
//! - [`network`] - Transport boundary, wire messages and an in-process network
//! - [`sync`] - Majority-vote synchronization with backfill
//!
//! ## Storage & Concurrency
//! - [`persistence`] - Transactional key-value tables (SQLite and in-memory)
//! - [`store`] - Coordinated transactions across every ledger table
//! - [`cache`] - Recently committed blocks
//! - [`keyed_mutex`] - Named async locks for node roles
//!
//! ## Node & Utilities
//! - [`node`] - Node assembly and worker supervision
//! - [`context`] - Handles shared between workers
//! - [`config`] - Configuration management
//! - [`logging`] - Tracing subscriber setup
//! - [`shutdown`] - Shutdown signalling
//! - [`crypto`] - Keys, addresses and signatures (secp256k1)
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod genesis;
pub mod transaction;

// ============================================================================
// Block Production & Validation
// ============================================================================
pub mod consensus;
pub mod mempool;
pub mod miner;
pub mod validator;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod sync;

// ============================================================================
// Storage & Concurrency
// ============================================================================
pub mod cache;
pub mod keyed_mutex;
pub mod persistence;
pub mod store;

// ============================================================================
// Node & Utilities
// ============================================================================
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod node;
pub mod shutdown;

pub use error::{ChainError, Result};
pub use node::Node;
