//! blockhop library
//!
//! Moves one file or directory tree between two endpoints, at most one of them
//! remote, as a manifest of digested blocks that are copied in parallel and
//! re-verified each round until all of them arrive intact.

pub mod cli;
pub mod codec;
pub mod config;
pub mod digest;
pub mod endpoint;
pub mod error;
pub mod job;
pub mod journal;
pub mod logger;
pub mod manifest;
pub mod mover;
pub mod packer;
pub mod progress;
pub mod reassembler;
pub mod scheduler;
pub mod session;
pub mod side;
pub mod source;
pub mod splitter;

pub use endpoint::{Endpoint, TransferJob};
pub use error::TransferError;
pub use job::{run, JobOptions, JobSummary};
