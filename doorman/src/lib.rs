//! Server side of sequenced port knocking.
//!
//! Listeners authenticate knocks on the current port sequence and queue them;
//! a single consumer assembles them into per-client sessions and extends the
//! gate when a complete sequence matches.

#![forbid(unsafe_code)]

pub mod config;
pub mod console;
pub mod consumer;
pub mod error;
pub mod gate;
pub mod listener;
pub mod logging;
pub mod ratelimit;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;

pub use config::Config;
pub use server::{Server, ServerHandle};
