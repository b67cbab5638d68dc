// Thin re-export module: implementation lives under `blockchain/core/`
// (block data, ledger state transitions, structural validation).

pub mod core;
pub use core::*;
