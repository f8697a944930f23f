//! Relay server: connection acceptance, role discrimination, and the
//! editor and client session loops.
//!
//! The relay accepts both editors and clients on one port and decides the
//! role from the first frame: REGISTER opens an editor session, anything
//! a client may send opens a client session. Every accepted connection
//! runs as its own task with one inbound reader and one outbound writer;
//! editor writes (COMMAND, PING) are serialised through a per-connection
//! channel so there is exactly one writer per socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use prism_proto::codec::{read_message, write_message};
use prism_proto::{
    Ack, Command, CommandResult, ErrorBody, ErrorCode, ErrorFrame, InstanceStatus, Instances,
    Message, Pong, Register, Registered, Request, Response,
};

use crate::cache::{Lookup, RequestCache};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::liveness;
use crate::pending::PendingRequests;
use crate::registry::{Completion, Dispatch, FailedWork, InstanceRegistry, PendingCommand};

/// Depth of the per-connection outbound lane (COMMAND, PING, ERROR).
const OUTBOUND_LANE_DEPTH: usize = 32;

/// The relay aggregate: registry, cache, and pending index owned by one
/// value that handlers borrow. Nothing relay-scoped lives in process
/// globals, so a test can run a whole relay in-process.
pub struct Relay {
    state: Arc<RelayState>,
}

pub(crate) struct RelayState {
    pub(crate) config: RelayConfig,
    pub(crate) registry: InstanceRegistry,
    pub(crate) cache: RequestCache,
    pub(crate) pending: PendingRequests,
    pub(crate) shutdown: CancellationToken,
}

impl RelayState {
    /// Removes an instance and fails everything it still owed.
    pub(crate) fn disconnect_instance(&self, instance_id: &str, epoch: u64, reason: &str) {
        if let Some(work) = self.registry.mark_lost(instance_id, epoch) {
            info!(instance_id = %instance_id, reason, "instance removed");
            self.fail_work(work, reason);
        }
    }

    /// Resolves every command in `work` with `INSTANCE_DISCONNECTED`.
    pub(crate) fn fail_work(&self, work: FailedWork, message: &str) {
        for command in work.drain() {
            self.pending
                .fail(&command.request_id, ErrorCode::InstanceDisconnected, message);
        }
    }
}

impl Relay {
    /// Creates a relay from configuration. No sockets are opened yet.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let state = Arc::new(RelayState {
            registry: InstanceRegistry::new(config.queue.clone()),
            cache: RequestCache::new(config.cache.ttl),
            pending: PendingRequests::new(),
            shutdown: CancellationToken::new(),
            config,
        });
        Self { state }
    }

    /// Token that stops the accept loop and every connection task.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.state.config.listen.addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })
    }

    /// Serves connections on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "relay listening");

        let sweeper = self.state.clone();
        tokio::spawn(async move {
            let period = (sweeper.cache.ttl() / 2).max(Duration::from_millis(50));
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = sweeper.shutdown.cancelled() => break,
                    _ = ticker.tick() => sweeper.cache.sweep(),
                }
            }
        });

        loop {
            tokio::select! {
                () = self.state.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(self.state.clone(), stream, peer));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        info!("relay stopped");
        Ok(())
    }

    /// Binds and serves; convenience for the binary.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}

async fn handle_connection(state: Arc<RelayState>, stream: TcpStream, peer: SocketAddr) {
    debug!(peer = %peer, "connection accepted");
    let (mut reader, mut writer) = stream.into_split();

    let first = match tokio::time::timeout(
        state.config.requests.first_frame_timeout,
        read_message(&mut reader),
    )
    .await
    {
        Err(_) => {
            debug!(peer = %peer, "no first frame before timeout");
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "protocol error on first frame");
            send_error_frame(&mut writer, &e).await;
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Ok(Some(message))) => message,
    };

    match first {
        Message::Register(register) => editor_session(state, reader, writer, register).await,
        Message::Request(_) | Message::ListInstances(_) | Message::SetDefault(_) => {
            client_session(state, reader, writer, first).await;
        }
        other => {
            warn!(
                peer = %peer,
                message_type = %other.message_type(),
                "unrecognised first frame"
            );
            let frame = ErrorFrame::new(
                None,
                ErrorCode::ProtocolError,
                format!("unexpected first frame: {}", other.message_type()),
            );
            let _ = write_message(&mut writer, &frame.into()).await;
        }
    }
}

async fn send_error_frame(writer: &mut OwnedWriteHalf, error: &prism_proto::ProtocolError) {
    let frame = ErrorFrame::new(None, error.error_code(), error.to_string());
    let _ = write_message(writer, &frame.into()).await;
}

// ===== Editor sessions =====

async fn editor_session(
    state: Arc<RelayState>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    register: Register,
) {
    if register.protocol_version != prism_proto::version::CURRENT {
        warn!(
            instance_id = %register.instance_id,
            protocol_version = %register.protocol_version,
            "rejecting registration with unsupported protocol version"
        );
        let rejection = Registered::rejected(ErrorBody::new(
            ErrorCode::ProtocolVersionMismatch,
            format!(
                "unsupported protocol version: {} (expected {})",
                register.protocol_version,
                prism_proto::version::CURRENT
            ),
        ));
        let _ = write_message(&mut writer, &rejection.into()).await;
        return;
    }
    if register.instance_id.is_empty() {
        let rejection = Registered::rejected(ErrorBody::new(
            ErrorCode::ProtocolError,
            "instance_id must not be empty",
        ));
        let _ = write_message(&mut writer, &rejection.into()).await;
        return;
    }

    let instance_id = register.instance_id.clone();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_LANE_DEPTH);
    let cancel = state.shutdown.child_token();

    let registration = state
        .registry
        .register(&register, outbound_tx.clone(), cancel.clone());
    let epoch = registration.epoch;

    if let Some(work) = registration.displaced {
        state.fail_work(work, "displaced by a new registration");
    }

    info!(
        instance_id = %instance_id,
        project_name = %register.project_name,
        unity_version = %register.unity_version,
        "editor instance registered"
    );

    // The acknowledgement goes out before the writer task takes the
    // socket, so the editor sees REGISTERED before any COMMAND.
    let accepted = Registered::accepted(state.config.heartbeat.interval.as_millis() as u64);
    if write_message(&mut writer, &accepted.into()).await.is_err() {
        finish_editor_connection(&state, &instance_id, epoch, &cancel);
        return;
    }

    let writer_task = tokio::spawn(outbound_writer(writer, outbound_rx, cancel.clone()));

    if let Some(held) = registration.resumed {
        info!(
            instance_id = %instance_id,
            request_id = %held.request_id,
            "re-forwarding command held across reload"
        );
        let frame = Command::new(
            &held.request_id,
            &held.command,
            held.params.clone(),
            Some(held.timeout_ms),
        );
        let _ = outbound_tx.send(frame.into()).await;
    }

    let (pong_tx, pong_rx) = mpsc::channel::<Pong>(4);
    let probes = tokio::spawn(liveness::probe_loop(
        state.clone(),
        instance_id.clone(),
        epoch,
        outbound_tx.clone(),
        pong_rx,
        cancel.clone(),
    ));

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = read_message(&mut reader) => match read {
                Ok(Some(message)) => {
                    handle_editor_message(&state, &instance_id, epoch, message, &pong_tx).await;
                }
                Ok(None) => {
                    debug!(instance_id = %instance_id, "editor connection closed");
                    break;
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "editor connection protocol error");
                    let frame = ErrorFrame::new(None, e.error_code(), e.to_string());
                    let _ = outbound_tx.send(frame.into()).await;
                    break;
                }
            }
        }
    }

    finish_editor_connection(&state, &instance_id, epoch, &cancel);
    let _ = probes.await;
    let _ = writer_task.await;
}

/// Reload-aware teardown: a RELOADING instance keeps its record (the
/// grace timer owns the outcome); anything else is disconnected now.
fn finish_editor_connection(
    state: &RelayState,
    instance_id: &str,
    epoch: u64,
    cancel: &CancellationToken,
) {
    cancel.cancel();
    if let Some(work) = state.registry.connection_closed(instance_id, epoch) {
        info!(instance_id = %instance_id, "editor instance disconnected");
        state.fail_work(work, "instance connection closed");
    }
}

/// Single writer per editor connection: drains the outbound lane.
async fn outbound_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => {
                    if let Err(e) = write_message(&mut writer, &message).await {
                        debug!(error = %e, "outbound write failed");
                        return;
                    }
                }
                None => return,
            }
        }
    }

    // Best effort: flush whatever was already queued before the cancel.
    while let Ok(message) = rx.try_recv() {
        if write_message(&mut writer, &message).await.is_err() {
            break;
        }
    }
}

async fn handle_editor_message(
    state: &Arc<RelayState>,
    instance_id: &str,
    epoch: u64,
    message: Message,
    pong_tx: &mpsc::Sender<Pong>,
) {
    match message {
        Message::CommandResult(result) => {
            let request_id = result.id.clone();
            let delivered = state.pending.resolve(&request_id, result);
            if !delivered {
                warn!(
                    instance_id = %instance_id,
                    request_id = %request_id,
                    "discarding late or unmatched command result"
                );
            }
            match state.registry.complete(instance_id, &request_id) {
                Completion::Completed {
                    next: Some((next, outbound)),
                } => {
                    debug!(
                        instance_id = %instance_id,
                        request_id = %next.request_id,
                        "forwarding queued command"
                    );
                    let frame = Command::new(
                        &next.request_id,
                        &next.command,
                        next.params.clone(),
                        Some(next.timeout_ms),
                    );
                    if outbound.send(frame.into()).await.is_err() {
                        state.pending.fail(
                            &next.request_id,
                            ErrorCode::InstanceDisconnected,
                            "instance connection lost",
                        );
                    }
                }
                Completion::Completed { next: None } => {}
                Completion::Unmatched => {
                    debug!(
                        instance_id = %instance_id,
                        request_id = %request_id,
                        "result did not match the outstanding command"
                    );
                }
            }
        }
        Message::Status(status) => match InstanceStatus::from_str(&status.status) {
            Some(InstanceStatus::Reloading) => {
                if state.registry.begin_reload(instance_id, epoch) {
                    info!(
                        instance_id = %instance_id,
                        detail = status.detail.as_deref().unwrap_or_default(),
                        "instance reloading; holding in-flight work"
                    );
                    spawn_grace_timer(state.clone(), instance_id.to_owned(), epoch);
                }
            }
            Some(other) => {
                debug!(instance_id = %instance_id, status = %other, "ignoring status notification");
            }
            None => {
                warn!(instance_id = %instance_id, status = %status.status, "unknown status value");
            }
        },
        Message::Pong(pong) => {
            // Dropping on a full lane is fine: the echo would be stale.
            let _ = pong_tx.try_send(pong);
        }
        other => {
            warn!(
                instance_id = %instance_id,
                message_type = %other.message_type(),
                "unexpected message from editor; ignoring"
            );
        }
    }
}

fn spawn_grace_timer(state: Arc<RelayState>, instance_id: String, epoch: u64) {
    let grace = state.config.heartbeat.reload_grace;
    tokio::spawn(async move {
        tokio::select! {
            () = state.shutdown.cancelled() => {}
            () = tokio::time::sleep(grace) => {
                if let Some(work) = state.registry.grace_expired(&instance_id, epoch) {
                    warn!(
                        instance_id = %instance_id,
                        "reload grace expired; failing held work"
                    );
                    state.fail_work(work, "instance did not return from reload");
                }
            }
        }
    });
}

// ===== Client sessions =====

async fn client_session(
    state: Arc<RelayState>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    first: Message,
) {
    let mut next = Some(first);
    loop {
        let message = match next.take() {
            Some(message) => message,
            None => {
                tokio::select! {
                    () = state.shutdown.cancelled() => return,
                    read = read_message(&mut reader) => match read {
                        Ok(Some(message)) => message,
                        Ok(None) => return,
                        Err(e) => {
                            warn!(error = %e, "client connection protocol error");
                            send_error_frame(&mut writer, &e).await;
                            return;
                        }
                    }
                }
            }
        };

        match message {
            Message::Request(request) => {
                let response = handle_request(&state, request).await;
                if write_message(&mut writer, &response.into()).await.is_err() {
                    return;
                }
            }
            Message::ListInstances(_) => {
                let snapshot = Instances::new(state.registry.list());
                if write_message(&mut writer, &snapshot.into()).await.is_err() {
                    return;
                }
            }
            Message::SetDefault(set) => {
                let reply: Message = if state.registry.set_default(&set.instance_id) {
                    Ack::new(set.instance_id).into()
                } else {
                    ErrorFrame::new(
                        None,
                        ErrorCode::InstanceNotFound,
                        format!("instance not found: {}", set.instance_id),
                    )
                    .into()
                };
                if write_message(&mut writer, &reply).await.is_err() {
                    return;
                }
            }
            other => {
                warn!(
                    message_type = %other.message_type(),
                    "unexpected message on client connection"
                );
                let frame = ErrorFrame::new(
                    None,
                    ErrorCode::ProtocolError,
                    format!("unexpected {} on a client connection", other.message_type()),
                );
                let _ = write_message(&mut writer, &frame.into()).await;
                return;
            }
        }
    }
}

async fn handle_request(state: &Arc<RelayState>, request: Request) -> Response {
    let timeout_ms = request
        .timeout_ms
        .unwrap_or(state.config.requests.default_timeout.as_millis() as u64);
    let timeout = Duration::from_millis(timeout_ms);

    match state.cache.lookup(&request.id) {
        Lookup::Cached(response) => response,
        Lookup::Joined(flight) => match tokio::time::timeout(timeout, flight.wait()).await {
            Ok(Some(response)) => response,
            Ok(None) => Response::error(
                &request.id,
                ErrorCode::InternalError,
                "duplicate request was abandoned",
            ),
            Err(_) => Response::error(
                &request.id,
                ErrorCode::Timeout,
                format!("no reply within {timeout_ms} ms"),
            ),
        },
        Lookup::Execute(slot) => {
            let response = execute_request(state, &request, timeout, timeout_ms).await;
            state.cache.complete(slot, &response);
            response
        }
    }
}

async fn execute_request(
    state: &Arc<RelayState>,
    request: &Request,
    timeout: Duration,
    timeout_ms: u64,
) -> Response {
    let command = PendingCommand {
        request_id: request.id.clone(),
        command: request.command.clone(),
        params: request.params.clone(),
        timeout_ms,
        deadline: Instant::now() + timeout,
    };
    let receiver = state.pending.register(&request.id);

    match state.registry.dispatch(request.instance_id.as_deref(), command) {
        Dispatch::Rejected { code, message } => {
            state.pending.discard(&request.id);
            debug!(request_id = %request.id, code = %code, "request rejected");
            Response::failure(&request.id, ErrorBody::new(code, message))
        }
        Dispatch::Forward {
            instance_id,
            outbound,
        } => {
            let frame = Command::new(
                &request.id,
                &request.command,
                request.params.clone(),
                Some(timeout_ms),
            );
            if outbound.send(frame.into()).await.is_err() {
                state.pending.discard(&request.id);
                return Response::error(
                    &request.id,
                    ErrorCode::InstanceDisconnected,
                    format!("instance connection lost: {instance_id}"),
                );
            }
            debug!(
                request_id = %request.id,
                instance_id = %instance_id,
                command = %request.command,
                "command forwarded"
            );
            await_result(state, &request.id, receiver, timeout, timeout_ms).await
        }
        Dispatch::Enqueued { instance_id } => {
            debug!(
                request_id = %request.id,
                instance_id = %instance_id,
                "command queued behind the in-flight command"
            );
            await_result(state, &request.id, receiver, timeout, timeout_ms).await
        }
    }
}

async fn await_result(
    state: &Arc<RelayState>,
    request_id: &str,
    receiver: tokio::sync::oneshot::Receiver<CommandResult>,
    timeout: Duration,
    timeout_ms: u64,
) -> Response {
    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(result)) => response_from_result(request_id, result),
        Ok(Err(_)) => Response::error(
            request_id,
            ErrorCode::InstanceDisconnected,
            "request was dropped",
        ),
        Err(_) => {
            state.pending.discard(request_id);
            // No cancellation channel to the editor: it stays BUSY until
            // the late result arrives and is discarded.
            warn!(request_id = %request_id, timeout_ms, "request deadline reached");
            Response::error(
                request_id,
                ErrorCode::Timeout,
                format!("no reply within {timeout_ms} ms"),
            )
        }
    }
}

fn response_from_result(request_id: &str, result: CommandResult) -> Response {
    if result.success {
        Response::success(request_id, result.data)
    } else {
        let error = result.error.unwrap_or_else(|| {
            ErrorBody::new(
                ErrorCode::InternalError,
                "editor reported failure without detail",
            )
        });
        Response::failure(request_id, error)
    }
}
