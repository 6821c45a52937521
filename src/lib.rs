// Public API for integration tests and potential library usage

pub mod abuse;
pub mod api;
pub mod auth;
pub mod code;
pub mod config;
pub mod error;
pub mod normalize;
pub mod protocol;
pub mod state;
pub mod store;
pub mod types;
pub mod ws;

// Background tasks, public for the binary
pub mod broadcast;
