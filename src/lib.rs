//! Renovoice - dual-persona renovation voice assistant
//!
//! A real-time conversational voice service:
//! - One WebSocket session per client, JSON event envelope
//! - Per-turn pipeline: STT -> moderation -> LLM stream -> TTS stream
//! - Two personas (Bob for intake/planning, Alice for the technical side)
//!   with seamless in-session handoff and an audible acknowledgement
//! - Barge-in cancellation, echo deafness window, idle nudges
//! - OpenAI-compatible provider adapters with retry and a per-session
//!   circuit breaker

// Core modules (order matters for cross-module dependencies)
pub mod adapters;
pub mod agents;
pub mod config;
pub mod protocol;
pub mod router;
pub mod state;

// Session plumbing
pub mod session;
pub mod turn;

// Front end
pub mod cli;
pub mod server;

// Re-export commonly used types for convenience
pub use adapters::{AdapterSet, ChatMessage};
pub use agents::{AgentId, AgentManager};
pub use config::Config;
pub use protocol::{ClientEvent, ServerEvent};
pub use session::Session;
pub use state::ConversationState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
