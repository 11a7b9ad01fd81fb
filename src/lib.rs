//! Distributed Mutual Exclusion
//!
//! This crate lets a fixed set of processes take turns holding named
//! resources without a central coordinator. Requests are ordered by Lamport
//! timestamp with the process id as tie-break (Ricart-Agrawala): a process
//! enters the critical section once every peer has granted its request, and
//! peers defer their grant while they hold, or are about to hold, the same
//! resource.
//!
//! ```no_run
//! # async fn demo() -> Result<(), praborrow_mutex::MutexError> {
//! use praborrow_mutex::{LocalRouter, MutexEngineBuilder};
//! use std::sync::Arc;
//!
//! let router = LocalRouter::new();
//! let engine = MutexEngineBuilder::new()
//!     .id("P1")
//!     .peers(["P2", "P3"])
//!     .with_network(router.network("P1"))
//!     .build()?;
//! router.register("P1".into(), Arc::new(engine.clone()));
//!
//! engine.acquire("printer").await?;
//! // critical section
//! engine.release("printer").await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod clock;
pub mod config;
pub mod deadlock;
pub mod deferred;
pub mod engine;
pub mod manager;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod request;
pub mod state_machine;

#[cfg(feature = "grpc")]
pub mod grpc;


pub use builder::MutexEngineBuilder;
pub use clock::{ClockEvent, LamportClock};
pub use engine::{Acquired, MutexConfig, MutexEngine, MutexError, ReplyMode};
pub use manager::{CriticalSection, ResourceManager};
pub use metrics::MutexMetrics;
pub use network::local::{LocalNetwork, LocalRouter};
pub use network::{ExclusionHandler, NetworkError, PeerNetwork};
pub use quorum::MembershipPolicy;
pub use request::{ProcessId, RequestRecord, ResourceId, Timestamp};
pub use state_machine::{LockState, ResourceStatus};
