//! Chat Relay - a chat client core for OpenAI-compatible completion APIs
//!
//! This crate provides:
//! - A request dispatcher with an ordered fallback chain
//!   (streaming -> non-streaming -> no route -> fallback models)
//! - An incremental SSE decoder for streamed completions
//! - A per-session chat context and a CLI/REPL front end

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod provider;
pub mod session;
pub mod stream;
pub mod telemetry;

pub use auth::{AuthConfig, Credential};
pub use config::{Config, LlmConfig, LlmProvider};
pub use dispatch::{
    AttemptObserver, AttemptOutcome, AttemptRecord, CompletionRequest, CompletionResult,
    DispatchRequest, Dispatcher, FallbackPlan, PlanStep, RoutePolicy,
};
pub use error::{AttemptError, ChatError};
pub use message::{ImageReference, Message, Role, Transcript};
pub use provider::{HttpTransport, ProviderConfig, Transport};
pub use session::{ChatMode, ChatSession, TurnOutcome};
pub use stream::{decode_stream, sse_events, DecodedStream, StreamEvent, Termination};
pub use telemetry::Telemetry;
