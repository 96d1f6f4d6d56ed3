pub mod client;
pub mod types;

pub use client::GenerationClient;
pub use types::{Generation, TokenUsage};
