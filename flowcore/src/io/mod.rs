//! Side-effecting adapters: filesystem storage, config files, clocks, secrets.

pub mod clock;
pub mod config;
pub mod secrets;
pub mod snapshot;
pub mod store;
