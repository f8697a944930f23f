//! Idempotency cache for request replies.
//!
//! Successful replies are cached by request identifier for a fixed TTL so
//! a retried request is answered without re-executing the command. Errors
//! are never cached; a retry with the same identifier must be able to
//! reach the editor again.
//!
//! Duplicate identifiers arriving while the first execution is still in
//! flight join it instead of executing again. This keeps the at-most-once
//! guarantee under concurrent duplicates, not just sequential ones.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use prism_proto::Response;

/// Outcome of looking up a request identifier.
pub enum Lookup {
    /// A fresh cached success reply; return it without forwarding.
    Cached(Response),
    /// The same identifier is executing right now; wait for its reply.
    Joined(Arc<InFlight>),
    /// First sighting; execute and complete the slot with the reply.
    Execute(ExecutionSlot),
}

/// Request cache with single-flight execution.
pub struct RequestCache {
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, Arc<InFlight>>,
}

struct CacheEntry {
    response: Response,
    cached_at: Instant,
}

impl RequestCache {
    /// Creates a cache with the given reply TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Looks up a request identifier, claiming the execution slot when it
    /// is unseen.
    pub fn lookup(&self, request_id: &str) -> Lookup {
        if let Some(entry) = self.entries.get(request_id) {
            if entry.cached_at.elapsed() <= self.ttl {
                debug!(request_id = %request_id, "idempotency cache hit");
                return Lookup::Cached(entry.response.clone());
            }
        }

        match self.in_flight.entry(request_id.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_settled() {
                    // The previous execution was abandoned (or raced its
                    // own cleanup); claim a fresh slot.
                    let flight = Arc::new(InFlight::new());
                    *occupied.get_mut() = flight.clone();
                    Lookup::Execute(ExecutionSlot {
                        request_id: request_id.to_owned(),
                        flight,
                        completed: false,
                    })
                } else {
                    debug!(request_id = %request_id, "joining in-flight duplicate");
                    Lookup::Joined(occupied.get().clone())
                }
            }
            Entry::Vacant(vacant) => {
                let flight = Arc::new(InFlight::new());
                vacant.insert(flight.clone());
                Lookup::Execute(ExecutionSlot {
                    request_id: request_id.to_owned(),
                    flight,
                    completed: false,
                })
            }
        }
    }

    /// Completes an execution slot with the terminal reply.
    ///
    /// Caches the reply when (and only when) it is a success, and wakes
    /// every joined duplicate.
    pub fn complete(&self, mut slot: ExecutionSlot, response: &Response) {
        if response.success {
            self.entries.insert(
                slot.request_id.clone(),
                CacheEntry {
                    response: response.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        slot.completed = true;
        slot.flight.settle(FlightState::Finished(response.clone()));
        self.in_flight
            .remove_if(&slot.request_id, |_, v| Arc::ptr_eq(v, &slot.flight));
    }

    /// Returns the cached reply for an identifier, if fresh.
    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<Response> {
        let entry = self.entries.get(request_id)?;
        (entry.cached_at.elapsed() <= self.ttl).then(|| entry.response.clone())
    }

    /// Drops expired entries. Called periodically by the relay.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.cached_at.elapsed() <= self.ttl);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, "swept expired cache entries");
        }
    }

    /// Number of cached replies (including not-yet-swept expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds no replies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The configured TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Shared state of an executing request that duplicates can join.
pub struct InFlight {
    notify: Notify,
    state: Mutex<FlightState>,
}

#[derive(Clone)]
enum FlightState {
    Running,
    Finished(Response),
    Abandoned,
}

impl InFlight {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            state: Mutex::new(FlightState::Running),
        }
    }

    /// Waits for the original execution to produce its reply.
    ///
    /// Returns `None` if the execution was abandoned without a reply
    /// (its connection task died); the caller re-executes or errors.
    pub async fn wait(&self) -> Option<Response> {
        loop {
            let notified = self.notify.notified();
            match self.lock_state().clone() {
                FlightState::Running => {}
                FlightState::Finished(response) => return Some(response),
                FlightState::Abandoned => return None,
            }
            notified.await;
        }
    }

    fn is_settled(&self) -> bool {
        !matches!(*self.lock_state(), FlightState::Running)
    }

    fn settle(&self, state: FlightState) {
        {
            let mut guard = self.lock_state();
            if matches!(*guard, FlightState::Running) {
                *guard = state;
            }
        }
        self.notify.notify_waiters();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FlightState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim on the right to execute a request identifier.
///
/// Dropping the slot without completing it marks the flight abandoned so
/// joined duplicates do not wait forever.
pub struct ExecutionSlot {
    request_id: String,
    flight: Arc<InFlight>,
    completed: bool,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        if !self.completed {
            self.flight.settle(FlightState::Abandoned);
        }
    }
}
