// Core types and functionality for the opflow workflow engine

pub mod types;
pub mod error;
pub mod events;
pub mod policy;
pub mod storage;
pub mod job;
pub mod scheduler;
pub mod workflow;
pub mod engine;

#[cfg(test)]
mod testing;

pub use types::*;
