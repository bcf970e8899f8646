//! Lockmint Relayer - Library interface
//!
//! Relays lock events observed on a source chain into exactly one mint on a
//! destination chain. Re-exports internal modules for use in integration tests.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod finality;
pub mod metrics;
pub mod reader;
pub mod retry;
pub mod rpc;
pub mod store;
pub mod types;
