//! Auralink MCP: multi-agent coordination protocol
//!
//! This crate connects the agents of a media-understanding pipeline
//! (transcription, vision, generation and an orchestrator) through a single
//! message envelope and an in-process bus. It provides:
//!
//! - Request/response calls correlated by id, with per-call deadlines
//! - Fire-and-forget notifications fanned out to subscribers
//! - Endpoints that dispatch requests to registered capabilities
//! - A newline-delimited JSON transport for running agents on separate nodes
//! - Orchestrator workflows chaining calls between agents
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐ ┌───────────────┐ ┌───────────────┐ ┌───────────────┐
//! │ Orchestrator  │ │ Transcription │ │    Vision     │ │  Generation   │
//! │   Endpoint    │ │   Endpoint    │ │   Endpoint    │ │   Endpoint    │
//! └───────┬───────┘ └───────┬───────┘ └───────┬───────┘ └───────┬───────┘
//!         │ mailbox         │                 │                 │
//!         ▼                 ▼                 ▼                 ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                                 Bus                                 │
//! │  ┌──────────────┐  ┌───────────────────┐  ┌───────────────────────┐ │
//! │  │ RoutingTable │  │ PendingCallTable  │  │ SubscriptionRegistry  │ │
//! │  └──────────────┘  └───────────────────┘  └───────────────────────┘ │
//! └──────────────────────────────────┬──────────────────────────────────┘
//!                                    │ RemoteLink / Listener
//!                                    ▼
//!                        other nodes (TCP, JSON lines)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use auralink_mcp::{AgentKind, Bus, Endpoint, Params};
//! use serde_json::json;
//!
//! # async fn demo() -> auralink_mcp::Result<()> {
//! let bus = Bus::default();
//!
//! let vision = Endpoint::attach(&bus, AgentKind::Vision)?;
//! vision.register_fn("ping", |_| async { Ok(json!({"pong": true})) })?;
//! tokio::spawn({
//!     let vision = vision.clone();
//!     async move { vision.run().await }
//! });
//!
//! let orchestrator = Endpoint::attach(&bus, AgentKind::Orchestrator)?;
//! let pong = orchestrator
//!     .send_request(AgentKind::Vision, "ping", Params::new(), Duration::from_secs(1))
//!     .await?;
//! assert_eq!(pong, json!({"pong": true}));
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod bus;
pub mod capability;
pub mod endpoint;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod router;
pub mod subscriptions;
#[cfg(feature = "tcp")]
pub mod transport;
pub mod workflow;

pub use agents::InferenceBackend;
pub use bus::{Bus, BusConfig, BusStats, ReplyFuture};
pub use capability::{Capability, NotificationHandler};
pub use endpoint::{Endpoint, WeakEndpoint};
pub use error::{Error, Result};
pub use protocol::{AgentKind, Envelope, ErrorObject, MessageKind, Params};
pub use router::{Backpressure, PeerAddress};
pub use workflow::{Workflow, WorkflowReport, WorkflowRunner, WorkflowState, WorkflowStep};
