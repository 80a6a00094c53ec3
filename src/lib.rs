//! Pool Orchestrator: heterogeneous worker pools behind one contract.

pub mod backends;
pub mod bus;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod router;
pub mod runtime;
