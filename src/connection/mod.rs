//! Connection management for the dual-transport link
//!
//! This module handles:
//! - Racing the attribute and stream transports to one peripheral
//! - Binding the winner and aborting the loser
//! - Linear-backoff retries with a hard attempt cap
//! - A single ordered event stream for the application

mod manager;
mod orchestrator;

pub use manager::{
    AppEvent, BluetoothConfig, BluetoothMode, ConnectionConfig, ConnectionManager, Transports,
};
