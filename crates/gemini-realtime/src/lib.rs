pub mod client;
pub mod types;

pub use client::{GeminiClient, LIVE_ENDPOINT, connect};
