//! Git command execution and the forge interface it authorizes against.
//!
//! The executor shells out to the `git` binary with
//! `tokio::process::Command`, wiring the child's stdio to the SSH session
//! channel.

pub mod executor;
pub mod forge;

pub use executor::{GitExecutor, UPDATE_BATCH_ENV};
pub use forge::{AccessLevel, Forge, Repository, UpdateTask, User};
