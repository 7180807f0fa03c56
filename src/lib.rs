//! # Deep Research Agent
//!
//! A planner → researcher → writer pipeline over two capability ports
//! (text completion and web search), runnable to completion or as a lazy
//! stream of stage updates, with a WebSocket bridge on top.

/// Environment-driven configuration
pub mod config;

/// Conversation turns, research state and partial updates
pub mod state;

/// Text-completion port
pub mod llm;

/// Web-search port
pub mod tools;

/// Stage functions and routing
pub mod stages;

/// Graph runner
pub mod agent;

/// JSON-file run-log
pub mod storage;

/// Streaming bridge
pub mod bridge;

/// HTTP / WebSocket server
pub mod server;

pub use agent::{Capabilities, ResearchAgent, RunOutcome, StageStep, StreamEvent};
pub use bridge::{SessionChannel, SessionOutcome, StreamingBridge};
pub use config::{Config, ConfigError};
pub use state::{Message, ResearchState, Role, StateUpdate};
pub use storage::{RunLog, RunRecord};
