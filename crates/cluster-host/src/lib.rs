pub mod cli;
pub mod config;
pub mod devices;
pub mod executor;
pub mod handler;
pub mod heartbeat;
pub mod host;
pub mod launcher;
pub mod logging;
pub mod managed;
pub mod monitor;
pub mod run_target;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_utils;
