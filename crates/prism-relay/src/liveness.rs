//! Liveness probing for editor connections.
//!
//! Each editor connection gets one probe loop. A PING is sent every
//! interval and the loop waits for the matching PONG (`echo_ts`) within
//! the same interval, so there is never more than one outstanding probe.
//! After `max_missed` consecutive losses the instance is disconnected.
//! While the instance is RELOADING, probing is suspended and the reload
//! grace timer owns the outcome.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use prism_proto::{InstanceStatus, Message, Ping, Pong};

use crate::server::RelayState;

pub(crate) async fn probe_loop(
    state: Arc<RelayState>,
    instance_id: String,
    epoch: u64,
    outbound: mpsc::Sender<Message>,
    mut pong_rx: mpsc::Receiver<Pong>,
    cancel: CancellationToken,
) {
    let interval = state.config.heartbeat.interval;
    let max_missed = state.config.heartbeat.max_missed;
    let mut misses = 0u32;

    loop {
        let cycle_end = Instant::now() + interval;

        match state.registry.status_of(&instance_id) {
            Some((status, current_epoch)) if current_epoch == epoch => {
                if status == InstanceStatus::Reloading {
                    misses = 0;
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = sleep_until(cycle_end) => continue,
                    }
                }
            }
            // Displaced or removed; this loop belongs to a dead connection.
            _ => return,
        }

        // A stale echo must not answer the probe we are about to send.
        while pong_rx.try_recv().is_ok() {}

        let ping = Ping::new();
        let sent_ts = ping.ts;
        if outbound.send(ping.into()).await.is_err() {
            return;
        }

        let mut answered = false;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep_until(cycle_end) => break,
                pong = pong_rx.recv() => match pong {
                    Some(pong) if pong.echo_ts == sent_ts => {
                        answered = true;
                        break;
                    }
                    Some(_) => {
                        debug!(instance_id = %instance_id, "ignoring stale probe echo");
                    }
                    None => return,
                }
            }
        }

        if answered {
            misses = 0;
            state.registry.record_heartbeat(&instance_id, epoch);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep_until(cycle_end) => {}
            }
        } else {
            misses += 1;
            warn!(
                instance_id = %instance_id,
                misses,
                max_missed,
                "liveness probe lost"
            );
            if misses >= max_missed {
                warn!(instance_id = %instance_id, "liveness lost; disconnecting instance");
                state.disconnect_instance(&instance_id, epoch, "liveness probes lost");
                cancel.cancel();
                return;
            }
        }
    }
}
