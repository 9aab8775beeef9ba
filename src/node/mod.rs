//! Node module - events, config, genesis, mempool, and the chain processor

mod config;
mod events;
mod genesis;
mod mempool;
mod processor;

pub use config::*;
pub use events::*;
pub use genesis::*;
pub use mempool::*;
pub use processor::*;
