//! LLM Provider layer
//!
//! HTTP transport for an OpenAI-compatible chat completions API
//! (OpenRouter by default). The dispatcher only talks to the `Transport`
//! trait, so tests can script upstream behaviour without a network.

mod client;
mod config;

pub use client::*;
pub use config::*;
