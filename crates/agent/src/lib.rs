#![forbid(unsafe_code)]

//! Code-agent worker: provisions a sandbox, drives the coding agent against
//! it and commits the outcome through the daemon.

pub mod completion;
pub mod conversation;
pub mod error;
pub mod job;
pub mod llm;
pub mod local_sandbox;
pub mod memory;
pub mod network;
pub mod openai;
pub mod persist;
pub mod postprocess;
pub mod prompt;
pub mod remote;
pub mod sandbox;
pub mod state;
pub mod steps;
pub mod store;
pub mod testing;
pub mod tools;
pub mod worker;

pub use error::JobError;
pub use job::{CodeAgentJob, JobConfig};
pub use state::RunState;
