//! Common test infrastructure
//!
//! Spawns isolated curator/agent servers on random ports, each with its own
//! temp database and directories. Tests should only import from this module.

mod client;
mod server;

pub use client::TestClient;
pub use server::{TestAfficheServer, TestExpoServer};
