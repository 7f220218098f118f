pub mod config;
pub mod error;
pub mod launcher;
pub mod lock;
pub mod log;
pub mod monitor;
pub mod orchestrator;
pub mod service;
pub mod store;
pub mod tickets;
pub mod types;
