//! Prism relay - the always-on broker between CLI clients and editor
//! instances.
//!
//! The relay is responsible for:
//!
//! - **Registration**: Tracking connected editor instances by stable
//!   identifier, with displacement on duplicate registration
//! - **Routing**: Forwarding client commands to the target instance with
//!   at most one command in flight per instance
//! - **Idempotency**: Replaying cached success replies for repeated
//!   request identifiers within the cache TTL
//! - **Liveness**: Probing each editor connection and disconnecting
//!   instances that stop answering
//! - **Reload survival**: Holding in-flight work while an editor reloads
//!   and resuming it when the instance re-registers
//!
//! # Architecture
//!
//! A single [`Relay`] value owns the instance registry, the request
//! cache, and the pending-request index. Each accepted connection runs
//! as its own task; editors and clients are told apart by their first
//! frame. Nothing is persisted - a relay restart loses all registrations
//! and cache entries.
//!
//! # Example
//!
//! ```ignore
//! use prism_relay::{Relay, RelayConfig};
//!
//! let relay = Relay::new(RelayConfig::default());
//! relay.run().await?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
mod liveness;
pub mod pending;
pub mod registry;
pub mod server;

// Re-export main types
pub use cache::RequestCache;
pub use config::{CacheConfig, HeartbeatConfig, ListenConfig, QueueConfig, RelayConfig, RequestConfig};
pub use error::{RelayError, Result};
pub use pending::PendingRequests;
pub use registry::{InstanceId, InstanceRegistry, PendingCommand};
pub use server::Relay;
