//! Relay client session.

use std::time::{Duration, Instant};

use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use prism_proto::codec::{read_message, write_message};
use prism_proto::{
    ErrorCode, InstanceSummary, ListInstances, Message, ProtocolError, Request, SetDefault,
};

use crate::error::ClientError;
use crate::retry::RetryPolicy;

/// Client session options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Deadline sent with requests that carry no per-call timeout.
    pub default_timeout_ms: u64,
    /// Backoff schedule for transient errors.
    pub retry: RetryPolicy,
    /// How long to wait for the TCP connect.
    pub connect_timeout: Duration,
    /// Extra wait beyond the request deadline before a reply counts as
    /// lost. The relay enforces the deadline; this only covers transit.
    pub reply_slack: Duration,
    /// Reply wait for control calls (list instances, set default).
    pub control_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            reply_slack: Duration::from_secs(5),
            control_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Target instance. Absent means the relay's default instance.
    pub instance_id: Option<String>,
    /// Per-call deadline override in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// A session to the relay: one TCP connection, reopened on loss.
///
/// The client identifier is stable for the lifetime of this value, so
/// request identifiers stay unique across reconnects.
pub struct RelayClient {
    addr: String,
    client_id: String,
    options: ClientOptions,
    conn: Mutex<Option<TcpStream>>,
}

impl RelayClient {
    /// Creates a session against `host:port`. No connection is opened
    /// until the first call.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_options(host, port, ClientOptions::default())
    }

    /// Creates a session with explicit options.
    #[must_use]
    pub fn with_options(host: &str, port: u16, options: ClientOptions) -> Self {
        let client_id = Uuid::new_v4().simple().to_string()[..12].to_owned();
        Self {
            addr: format!("{host}:{port}"),
            client_id,
            options,
            conn: Mutex::new(None),
        }
    }

    /// The process-stable client identifier prefixing request ids.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Executes one command on an instance, retrying transient errors.
    ///
    /// The same request identifier is reused across every retry of this
    /// call, so the relay can replay a cached success instead of running
    /// the command twice. Returns the reply's `data` payload.
    pub async fn call(
        &self,
        command: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Option<Box<RawValue>>, ClientError> {
        let params = to_raw_value(&params)
            .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        let timeout_ms = options.timeout_ms.unwrap_or(self.options.default_timeout_ms);
        let request = Request::new(
            self.next_request_id(),
            options.instance_id,
            command,
            params,
            Some(timeout_ms),
        );

        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.call_once(&request, timeout_ms).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() => {
                    let backoff = self.options.retry.backoff(attempt);
                    if started.elapsed() + backoff >= self.options.retry.budget {
                        warn!(
                            command,
                            attempts = attempt + 1,
                            "retry budget exhausted"
                        );
                        return Err(e);
                    }
                    debug!(
                        command,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient error; retrying with the same request id"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetches a point-in-time snapshot of registered instances.
    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ClientError> {
        let reply = self
            .exchange(ListInstances::new().into(), self.options.control_timeout)
            .await?;
        match reply {
            Message::Instances(instances) => Ok(instances.instances),
            Message::Error(frame) => Err(ClientError::Relay {
                code: frame.code,
                message: frame.message,
            }),
            other => Err(ClientError::UnexpectedMessage(
                other.message_type().to_string(),
            )),
        }
    }

    /// Sets the relay's default instance.
    pub async fn set_default(&self, instance_id: &str) -> Result<(), ClientError> {
        let reply = self
            .exchange(
                SetDefault::new(instance_id).into(),
                self.options.control_timeout,
            )
            .await?;
        match reply {
            Message::Ack(_) => Ok(()),
            Message::Error(frame) => Err(ClientError::Relay {
                code: frame.code,
                message: frame.message,
            }),
            other => Err(ClientError::UnexpectedMessage(
                other.message_type().to_string(),
            )),
        }
    }

    fn next_request_id(&self) -> String {
        format!("{}:{}", self.client_id, Uuid::new_v4())
    }

    async fn call_once(
        &self,
        request: &Request,
        timeout_ms: u64,
    ) -> Result<Option<Box<RawValue>>, ClientError> {
        let wait = Duration::from_millis(timeout_ms) + self.options.reply_slack;
        let reply = self
            .exchange(Message::Request(request.clone()), wait)
            .await
            .map_err(|e| match e {
                ClientError::ReplyTimedOut(_) => ClientError::ReplyTimedOut(timeout_ms),
                other => other,
            })?;

        match reply {
            Message::Response(response) => {
                if response.id != request.id {
                    return Err(ClientError::UnexpectedMessage(format!(
                        "RESPONSE for {} while waiting on {}",
                        response.id, request.id
                    )));
                }
                if response.success {
                    Ok(response.data)
                } else {
                    let error = response.error.unwrap_or_else(|| {
                        prism_proto::ErrorBody::new(
                            ErrorCode::InternalError,
                            "relay reported failure without detail",
                        )
                    });
                    Err(ClientError::Relay {
                        code: error.code,
                        message: error.message,
                    })
                }
            }
            Message::Error(frame) => Err(ClientError::Relay {
                code: frame.code,
                message: frame.message,
            }),
            other => Err(ClientError::UnexpectedMessage(
                other.message_type().to_string(),
            )),
        }
    }

    /// Writes one frame and reads one reply on the session connection.
    ///
    /// The connection is taken out of the slot for the exchange and only
    /// put back on success, so any failure drops it and the next attempt
    /// reconnects.
    async fn exchange(&self, message: Message, wait: Duration) -> Result<Message, ClientError> {
        let mut guard = self.conn.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.open().await?,
        };

        let outcome = Self::exchange_on(&mut stream, &message, wait).await;
        if outcome.is_ok() {
            *guard = Some(stream);
        }
        outcome
    }

    async fn exchange_on(
        stream: &mut TcpStream,
        message: &Message,
        wait: Duration,
    ) -> Result<Message, ClientError> {
        write_message(stream, message)
            .await
            .map_err(flatten_io_error)?;

        match tokio::time::timeout(wait, read_message(stream)).await {
            Err(_) => Err(ClientError::ReplyTimedOut(wait.as_millis() as u64)),
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(ClientError::ConnectionLost(
                "relay closed the connection".to_owned(),
            )),
            Ok(Err(e)) => Err(flatten_io_error(e)),
        }
    }

    async fn open(&self) -> Result<TcpStream, ClientError> {
        let connect = TcpStream::connect(&self.addr);
        match tokio::time::timeout(self.options.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ClientError::Connect {
                addr: self.addr.clone(),
                source,
            }),
            Err(_) => Err(ClientError::Connect {
                addr: self.addr.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }
}

/// I/O failures mid-exchange mean the connection is gone (transient);
/// everything else is a real protocol violation.
fn flatten_io_error(error: ProtocolError) -> ClientError {
    match error {
        ProtocolError::Io(e) => ClientError::ConnectionLost(e.to_string()),
        other => ClientError::Protocol(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_prefixed_by_a_stable_client_id() {
        let client = RelayClient::new("127.0.0.1", 6500);
        assert_eq!(client.client_id().len(), 12);

        let first = client.next_request_id();
        let second = client.next_request_id();

        assert_ne!(first, second);
        for id in [&first, &second] {
            let (prefix, uuid) = id.split_once(':').expect("id has a colon");
            assert_eq!(prefix, client.client_id());
            assert!(Uuid::parse_str(uuid).is_ok());
        }
    }

    #[test]
    fn default_options_match_the_retry_contract() {
        let options = ClientOptions::default();
        assert_eq!(options.default_timeout_ms, 30_000);
        assert_eq!(options.retry.initial, Duration::from_millis(500));
        assert_eq!(options.retry.max, Duration::from_secs(8));
        assert_eq!(options.retry.budget, Duration::from_secs(30));
    }
}
