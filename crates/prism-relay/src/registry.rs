//! Instance registry and per-instance state machine.
//!
//! The registry owns one record per connected editor instance, keyed by
//! the instance identifier (the project path). Records move through
//! READY → BUSY → READY as commands dispatch and complete, detour through
//! RELOADING when the editor restarts its in-process subsystems, and are
//! removed once the connection is finally lost.
//!
//! Registry methods only mutate in-memory state under short per-entry
//! locks; all socket I/O happens in the connection tasks, reached through
//! the per-connection outbound channel stored in each record.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use dashmap::DashMap;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use prism_proto::{ErrorCode, InstanceStatus, InstanceSummary, Message, Register};

use crate::config::QueueConfig;

/// Stable instance identifier (the absolute project path).
pub type InstanceId = String;

/// A command accepted for an instance and not yet completed.
///
/// The completion slot lives in the relay-wide pending index, keyed by
/// `request_id`; this record carries everything needed to (re-)forward
/// the command to the editor.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub request_id: String,
    pub command: String,
    pub params: Box<RawValue>,
    pub timeout_ms: u64,
    pub deadline: Instant,
}

impl PendingCommand {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Work that must be failed back to its waiting clients after an instance
/// is lost.
#[derive(Debug, Default)]
pub struct FailedWork {
    /// The in-flight command, if any.
    pub in_flight: Option<PendingCommand>,
    /// Everything that was still queued.
    pub queued: Vec<PendingCommand>,
}

impl FailedWork {
    /// Returns true if there is nothing to fail.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.queued.is_empty()
    }

    /// Iterates over all contained commands.
    pub fn drain(self) -> impl Iterator<Item = PendingCommand> {
        self.in_flight.into_iter().chain(self.queued)
    }
}

/// Outcome of installing a registration.
pub struct Registration {
    /// Connection generation, used to detect stale timer callbacks.
    pub epoch: u64,
    /// Held in-flight command to re-forward on the new connection
    /// (re-register during a reload with the deadline still ahead).
    pub resumed: Option<PendingCommand>,
    /// Work owed an `INSTANCE_DISCONNECTED` reply because a live
    /// connection was displaced.
    pub displaced: Option<FailedWork>,
}

/// Outcome of a dispatch attempt.
pub enum Dispatch {
    /// Instance was READY: now BUSY, forward the COMMAND on this lane.
    Forward {
        instance_id: InstanceId,
        outbound: mpsc::Sender<Message>,
    },
    /// Instance was BUSY with queueing on: command buffered FIFO.
    Enqueued { instance_id: InstanceId },
    /// Not dispatched; reply to the client with this code.
    Rejected { code: ErrorCode, message: String },
}

/// Outcome of matching a COMMAND_RESULT against the outstanding command.
pub enum Completion {
    /// The result matched. If the queue held a live command it is now the
    /// new outstanding command and must be forwarded on the lane.
    Completed {
        next: Option<(PendingCommand, mpsc::Sender<Message>)>,
    },
    /// No matching outstanding command; the result is discarded.
    Unmatched,
}

struct Instance {
    project_name: String,
    unity_version: String,
    capabilities: Vec<String>,
    status: InstanceStatus,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    epoch: u64,
    /// Registration order; survives same-identifier re-registration.
    seq: u64,
    last_heartbeat: Instant,
    reloading_since: Option<Instant>,
    outstanding: Option<PendingCommand>,
    queue: VecDeque<PendingCommand>,
}

/// Registry of connected editor instances.
pub struct InstanceRegistry {
    instances: DashMap<InstanceId, Instance>,
    /// Explicitly chosen default instance. When unset or stale, requests
    /// fall back to the earliest-registered instance.
    default_id: Mutex<Option<InstanceId>>,
    queue: QueueConfig,
    next_epoch: AtomicU64,
    next_seq: AtomicU64,
}

impl InstanceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(queue: QueueConfig) -> Self {
        Self {
            instances: DashMap::new(),
            default_id: Mutex::new(None),
            queue,
            next_epoch: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Installs or replaces the record for a registering instance.
    ///
    /// A second REGISTER with the same identifier displaces the first: the
    /// old connection is cancelled and its work is returned for failure,
    /// unless the old record was RELOADING, in which case held work is
    /// resumed on the new connection instead.
    pub fn register(
        &self,
        register: &Register,
        outbound: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Registration {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let mut resumed = None;
        let mut displaced = None;
        let mut queue = VecDeque::new();
        let mut seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(mut old) = self.instances.get_mut(&register.instance_id) {
            seq = old.seq;
            old.cancel.cancel();

            if old.status == InstanceStatus::Reloading {
                info!(
                    instance_id = %register.instance_id,
                    "instance returned from reload"
                );
                if let Some(cmd) = old.outstanding.take() {
                    if cmd.is_expired() {
                        debug!(
                            request_id = %cmd.request_id,
                            "dropping held command whose deadline passed during reload"
                        );
                    } else {
                        resumed = Some(cmd);
                    }
                }
                queue = std::mem::take(&mut old.queue);
            } else {
                info!(
                    instance_id = %register.instance_id,
                    old_status = %old.status,
                    "displacing existing registration"
                );
                let work = FailedWork {
                    in_flight: old.outstanding.take(),
                    queued: old.queue.drain(..).collect(),
                };
                if !work.is_empty() {
                    displaced = Some(work);
                }
            }
        }

        let status = if resumed.is_some() {
            InstanceStatus::Busy
        } else {
            InstanceStatus::Ready
        };

        self.instances.insert(
            register.instance_id.clone(),
            Instance {
                project_name: register.project_name.clone(),
                unity_version: register.unity_version.clone(),
                capabilities: register.capabilities.clone(),
                status,
                outbound,
                cancel,
                epoch,
                seq,
                last_heartbeat: Instant::now(),
                reloading_since: None,
                outstanding: resumed.clone(),
                queue,
            },
        );

        Registration {
            epoch,
            resumed,
            displaced,
        }
    }

    /// Routes a command to the target instance per the state machine.
    pub fn dispatch(&self, target: Option<&str>, cmd: PendingCommand) -> Dispatch {
        let instance_id = match target {
            Some(id) => id.to_owned(),
            None => match self.effective_default() {
                Some(id) => id,
                None => {
                    return Dispatch::Rejected {
                        code: ErrorCode::InstanceNotFound,
                        message: "no instances registered".to_owned(),
                    }
                }
            },
        };

        let Some(mut instance) = self.instances.get_mut(&instance_id) else {
            return Dispatch::Rejected {
                code: ErrorCode::InstanceNotFound,
                message: format!("instance not found: {instance_id}"),
            };
        };

        if !instance.capabilities.is_empty()
            && !instance.capabilities.iter().any(|c| c == &cmd.command)
        {
            return Dispatch::Rejected {
                code: ErrorCode::CapabilityNotSupported,
                message: format!(
                    "command '{}' not supported by {instance_id}; available: {}",
                    cmd.command,
                    instance.capabilities.join(", ")
                ),
            };
        }

        match instance.status {
            InstanceStatus::Ready => {
                instance.status = InstanceStatus::Busy;
                instance.outstanding = Some(cmd);
                Dispatch::Forward {
                    outbound: instance.outbound.clone(),
                    instance_id,
                }
            }
            InstanceStatus::Busy => {
                if !self.queue.enabled {
                    return Dispatch::Rejected {
                        code: ErrorCode::InstanceBusy,
                        message: format!("instance is busy: {instance_id}"),
                    };
                }
                if instance.queue.len() >= self.queue.capacity {
                    return Dispatch::Rejected {
                        code: ErrorCode::QueueFull,
                        message: format!(
                            "command queue is full (capacity {}): {instance_id}",
                            self.queue.capacity
                        ),
                    };
                }
                instance.queue.push_back(cmd);
                debug!(
                    instance_id = %instance_id,
                    queue_size = instance.queue.len(),
                    "command queued"
                );
                Dispatch::Enqueued { instance_id }
            }
            InstanceStatus::Reloading => Dispatch::Rejected {
                code: ErrorCode::InstanceReloading,
                message: format!("instance is reloading: {instance_id}"),
            },
            InstanceStatus::Disconnected => Dispatch::Rejected {
                code: ErrorCode::InstanceDisconnected,
                message: format!("instance is disconnected: {instance_id}"),
            },
        }
    }

    /// Applies a COMMAND_RESULT to the instance state machine.
    ///
    /// On a match the instance returns to READY, or stays BUSY with the
    /// next live queued command promoted to outstanding. Expired queue
    /// entries are dropped; their clients already received TIMEOUT.
    pub fn complete(&self, instance_id: &str, request_id: &str) -> Completion {
        let Some(mut instance) = self.instances.get_mut(instance_id) else {
            return Completion::Unmatched;
        };

        match &instance.outstanding {
            Some(cmd) if cmd.request_id == request_id => {}
            _ => return Completion::Unmatched,
        }
        instance.outstanding = None;

        while let Some(next) = instance.queue.pop_front() {
            if next.is_expired() {
                debug!(
                    request_id = %next.request_id,
                    "dropping queued command whose deadline passed"
                );
                continue;
            }
            instance.outstanding = Some(next.clone());
            return Completion::Completed {
                next: Some((next, instance.outbound.clone())),
            };
        }

        instance.status = InstanceStatus::Ready;
        Completion::Completed { next: None }
    }

    /// Moves an instance into RELOADING. In-flight work is held, not
    /// failed; the caller starts the grace timer.
    ///
    /// Returns false if the instance is unknown, the connection is stale,
    /// or the instance is not in a running state.
    pub fn begin_reload(&self, instance_id: &str, epoch: u64) -> bool {
        let Some(mut instance) = self.instances.get_mut(instance_id) else {
            return false;
        };
        if instance.epoch != epoch {
            return false;
        }
        match instance.status {
            InstanceStatus::Ready | InstanceStatus::Busy => {
                instance.status = InstanceStatus::Reloading;
                instance.reloading_since = Some(Instant::now());
                true
            }
            InstanceStatus::Reloading | InstanceStatus::Disconnected => false,
        }
    }

    /// Handles an editor connection closing.
    ///
    /// A RELOADING instance keeps its record (and held work) for the grace
    /// window. Otherwise the record is removed and its work returned for
    /// failure. Returns `None` when nothing must be failed.
    pub fn connection_closed(&self, instance_id: &str, epoch: u64) -> Option<FailedWork> {
        {
            let instance = self.instances.get(instance_id)?;
            if instance.epoch != epoch {
                return None;
            }
            if instance.status == InstanceStatus::Reloading {
                debug!(
                    instance_id = %instance_id,
                    "connection closed during reload; holding record for grace window"
                );
                return None;
            }
        }
        self.remove(instance_id, epoch)
    }

    /// Fails a RELOADING instance whose grace window elapsed without a
    /// re-registration.
    pub fn grace_expired(&self, instance_id: &str, epoch: u64) -> Option<FailedWork> {
        {
            let instance = self.instances.get(instance_id)?;
            if instance.epoch != epoch || instance.status != InstanceStatus::Reloading {
                return None;
            }
        }
        self.remove(instance_id, epoch)
    }

    /// Removes an instance after liveness loss.
    pub fn mark_lost(&self, instance_id: &str, epoch: u64) -> Option<FailedWork> {
        self.remove(instance_id, epoch)
    }

    fn remove(&self, instance_id: &str, epoch: u64) -> Option<FailedWork> {
        let (_, mut instance) = self
            .instances
            .remove_if(instance_id, |_, i| i.epoch == epoch)?;
        instance.status = InstanceStatus::Disconnected;
        instance.cancel.cancel();
        Some(FailedWork {
            in_flight: instance.outstanding.take(),
            queued: instance.queue.drain(..).collect(),
        })
    }

    /// Records a liveness reply.
    pub fn record_heartbeat(&self, instance_id: &str, epoch: u64) {
        if let Some(mut instance) = self.instances.get_mut(instance_id) {
            if instance.epoch == epoch {
                instance.last_heartbeat = Instant::now();
            }
        }
    }

    /// Returns an instance's status and connection epoch.
    #[must_use]
    pub fn status_of(&self, instance_id: &str) -> Option<(InstanceStatus, u64)> {
        self.instances
            .get(instance_id)
            .map(|i| (i.status, i.epoch))
    }

    /// Returns when an instance last answered a probe.
    #[must_use]
    pub fn last_heartbeat(&self, instance_id: &str) -> Option<Instant> {
        self.instances.get(instance_id).map(|i| i.last_heartbeat)
    }

    /// Sets the explicit default instance. Fails if unknown.
    pub fn set_default(&self, instance_id: &str) -> bool {
        if !self.instances.contains_key(instance_id) {
            return false;
        }
        *self.lock_default() = Some(instance_id.to_owned());
        info!(instance_id = %instance_id, "default instance set");
        true
    }

    /// Resolves the instance that receives untargeted requests: the
    /// explicitly set default while it is registered, otherwise the
    /// earliest-registered instance.
    #[must_use]
    pub fn effective_default(&self) -> Option<InstanceId> {
        let explicit = self.lock_default().clone();
        if let Some(id) = explicit {
            if self.instances.contains_key(&id) {
                return Some(id);
            }
        }
        self.instances
            .iter()
            .min_by_key(|e| e.seq)
            .map(|e| e.key().clone())
    }

    /// Returns a point-in-time snapshot of all instances, in registration
    /// order.
    #[must_use]
    pub fn list(&self) -> Vec<InstanceSummary> {
        let default_id = self.effective_default();
        let mut rows: Vec<(u64, InstanceSummary)> = self
            .instances
            .iter()
            .map(|e| {
                (
                    e.seq,
                    InstanceSummary {
                        id: e.key().clone(),
                        project_name: e.project_name.clone(),
                        version: e.unity_version.clone(),
                        status: e.status,
                        capabilities: e.capabilities.clone(),
                        is_default: default_id.as_deref() == Some(e.key().as_str()),
                        queue_size: e.queue.len(),
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if no instances are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn lock_default(&self) -> std::sync::MutexGuard<'_, Option<InstanceId>> {
        self.default_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
