//! Client-side transport for the Prism relay.
//!
//! A [`RelayClient`] holds one TCP connection to the relay per session
//! and provides a single-round-trip `call` with automatic retry on
//! transient errors.
//!
//! # At-most-once calls
//!
//! Every logical call mints one request identifier of shape
//! `<client-id>:<uuid>` and reuses it unchanged across all retries. The
//! relay caches successful replies under that identifier, so a retry
//! that races a slow first attempt is answered from the cache instead of
//! re-executing the command.
//!
//! # Retry policy
//!
//! Transient errors (`INSTANCE_RELOADING`, `INSTANCE_BUSY`, `QUEUE_FULL`,
//! `TIMEOUT`, and connection loss between attempts) are retried with
//! exponential backoff: 500 ms initial, doubling to an 8 s cap, within a
//! 30 s total budget. The terminal outcome is the first success, the
//! first non-transient error, or the last transient error once the
//! budget is exhausted.

mod client;
mod error;
mod retry;

pub use client::{CallOptions, ClientOptions, RelayClient};
pub use error::ClientError;
pub use retry::RetryPolicy;
