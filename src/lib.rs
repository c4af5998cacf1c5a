//! Parley - realtime voice assistant client
//!
//! This library provides the building blocks of the parley voice client:
//! - Session orchestration (connection lifecycle, state machine, reconnection)
//! - Realtime wire protocol (JSON text frames over a websocket)
//! - Delegation of complex queries to a deeper reasoning model
//! - Audio capture and playback behind narrow traits
//! - A small persistent knowledge store for user facts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    Session                        │
//! │  state machine │ transcript │ delegation │ retry  │
//! └───────┬─────────────┬───────────────┬────────────┘
//!         │             │               │
//! ┌───────▼──────┐ ┌────▼─────┐ ┌───────▼──────────┐
//! │  Transport   │ │  Audio   │ │ Reasoning gateway │
//! │ (websocket)  │ │ src/sink │ │      (http)       │
//! └───────┬──────┘ └──────────┘ └──────────────────┘
//!         │
//! ┌───────▼──────┐
//! │ Relay (http) │  mints short-lived connection URLs
//! └──────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod delegation;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod persona;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transcript;
pub mod transport;

pub use config::Config;
pub use delegation::{HttpReasoningGateway, ReasoningGateway, TriggerMatcher};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use knowledge::{ContextProvider, KnowledgeStore, SharedKnowledge};
pub use relay::{CredentialProvider, RelayClient};
pub use session::{Collaborators, ConnectionState, ProcessingMode, Session, SessionHandle};
pub use transport::{Connector, Transport, WsConnector};
