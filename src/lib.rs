//! Estate - event-sourced aggregate runtime
//!
//! Executes declarative aggregate models: hierarchical state machines that turn
//! commands into events, plus process managers (sagas) that react to those
//! events with further commands.

pub mod config;
pub mod domains;
pub mod feed;
pub mod handler;
pub mod intake;
pub mod model;
pub mod process;
pub mod runtime;
pub mod storage;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
