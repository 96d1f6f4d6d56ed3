pub mod auth;
pub mod config;
pub mod error;
pub mod generation;
pub mod interactions;
pub mod ledger;
pub mod metrics;
pub mod quota;
pub mod server;
pub mod time;
