//! Scripted editor and client connections for integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::value::to_raw_value;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use prism_proto::codec::{read_message, write_message};
use prism_proto::{
    Command, CommandResult, ErrorBody, ErrorCode, InstanceSummary, ListInstances, Message, Pong,
    Register, Registered, Request, Response, SetDefault, Status,
};

/// A scripted editor connection.
///
/// Reads are explicit so tests control exactly which frames the editor
/// answers; `next_command` answers liveness probes transparently.
pub struct FakeEditor {
    pub instance_id: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl FakeEditor {
    /// Connects and registers with no capability restrictions.
    pub async fn register(addr: SocketAddr, instance_id: &str) -> (Self, Registered) {
        let register = Register::new(instance_id, "TestProject", "6000.0.23f1", vec![]);
        Self::register_with(addr, register).await
    }

    /// Connects and sends an explicit REGISTER frame.
    pub async fn register_with(addr: SocketAddr, register: Register) -> (Self, Registered) {
        let stream = TcpStream::connect(addr).await.expect("connect to relay");
        let (reader, mut writer) = stream.into_split();
        let instance_id = register.instance_id.clone();

        write_message(&mut writer, &register.into())
            .await
            .expect("send REGISTER");

        let mut editor = Self {
            instance_id,
            reader,
            writer,
        };
        let registered = match editor.next_raw().await {
            Some(Message::Registered(registered)) => registered,
            other => panic!("expected REGISTERED, got {other:?}"),
        };
        (editor, registered)
    }

    /// Reads one frame without answering probes.
    pub async fn next_raw(&mut self) -> Option<Message> {
        read_message(&mut self.reader).await.expect("read frame")
    }

    /// Reads until a COMMAND arrives, answering PINGs on the way.
    pub async fn next_command(&mut self) -> Command {
        loop {
            match self.next_raw().await {
                Some(Message::Ping(ping)) => {
                    write_message(&mut self.writer, &Pong::answering(&ping).into())
                        .await
                        .expect("send PONG");
                }
                Some(Message::Command(command)) => return command,
                Some(other) => panic!("unexpected {} frame", other.message_type()),
                None => panic!("connection closed while waiting for COMMAND"),
            }
        }
    }

    /// Waits for the next PING and answers it. Returns false when the
    /// connection closed instead.
    pub async fn answer_next_ping(&mut self) -> bool {
        match self.next_raw().await {
            Some(Message::Ping(ping)) => {
                write_message(&mut self.writer, &Pong::answering(&ping).into())
                    .await
                    .expect("send PONG");
                true
            }
            Some(other) => panic!("unexpected {} frame", other.message_type()),
            None => false,
        }
    }

    /// Like `next_command`, returning `None` when nothing arrives in
    /// `wait`. Used to assert the relay sent no new COMMAND.
    pub async fn try_next_command(&mut self, wait: Duration) -> Option<Command> {
        tokio::time::timeout(wait, self.next_command()).await.ok()
    }

    /// Answers probes for `wait` without expecting any COMMAND.
    pub async fn idle(&mut self, wait: Duration) {
        if let Some(command) = self.try_next_command(wait).await {
            panic!("unexpected COMMAND {} while idle", command.id);
        }
    }

    /// Sends a successful COMMAND_RESULT.
    pub async fn reply_success(&mut self, id: &str, data: Value) {
        let raw = to_raw_value(&data).expect("serialise data");
        let result = CommandResult::success(id, Some(raw));
        write_message(&mut self.writer, &result.into())
            .await
            .expect("send COMMAND_RESULT");
    }

    /// Sends a failed COMMAND_RESULT.
    pub async fn reply_failure(&mut self, id: &str, code: ErrorCode, message: &str) {
        let result = CommandResult::failure(id, ErrorBody::new(code, message));
        write_message(&mut self.writer, &result.into())
            .await
            .expect("send COMMAND_RESULT");
    }

    /// Sends a STATUS notification.
    pub async fn send_status(&mut self, status: &str) {
        let frame = Status::new(self.instance_id.clone(), status);
        write_message(&mut self.writer, &frame.into())
            .await
            .expect("send STATUS");
    }

    /// Serves commands forever, echoing `params` back as `data`.
    /// Consumes the editor; abort the handle to stop it.
    pub fn serve_echo(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let command = self.next_command().await;
                let params: Value =
                    serde_json::from_str(command.params.get()).expect("params are JSON");
                self.reply_success(&command.id, params).await;
            }
        })
    }
}

/// A raw scripted client connection.
pub struct TestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to relay");
        let (reader, writer) = stream.into_split();
        Self { reader, writer }
    }

    pub async fn send(&mut self, message: Message) {
        write_message(&mut self.writer, &message)
            .await
            .expect("send frame");
    }

    /// Sends raw bytes, bypassing the codec. For framing edge cases.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.writer.write_all(bytes).await.expect("send raw bytes");
        self.writer.flush().await.expect("flush");
    }

    pub async fn recv(&mut self) -> Option<Message> {
        read_message(&mut self.reader).await.expect("read frame")
    }

    /// Sends a REQUEST and waits for its RESPONSE.
    pub async fn request(
        &mut self,
        id: &str,
        instance_id: Option<&str>,
        command: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> Response {
        self.send_request(id, instance_id, command, params, timeout_ms)
            .await;
        self.recv_response().await
    }

    /// Sends a REQUEST without waiting.
    pub async fn send_request(
        &mut self,
        id: &str,
        instance_id: Option<&str>,
        command: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) {
        let raw = to_raw_value(&params).expect("serialise params");
        let request = Request::new(
            id,
            instance_id.map(str::to_owned),
            command,
            raw,
            timeout_ms,
        );
        self.send(request.into()).await;
    }

    /// Waits for a RESPONSE frame.
    pub async fn recv_response(&mut self) -> Response {
        match self.recv().await {
            Some(Message::Response(response)) => response,
            other => panic!("expected RESPONSE, got {other:?}"),
        }
    }

    /// Fetches the instance snapshot.
    pub async fn list_instances(&mut self) -> Vec<InstanceSummary> {
        self.send(ListInstances::new().into()).await;
        match self.recv().await {
            Some(Message::Instances(instances)) => instances.instances,
            other => panic!("expected INSTANCES, got {other:?}"),
        }
    }

    /// Sets the default instance, expecting an ACK.
    pub async fn set_default(&mut self, instance_id: &str) {
        self.send(SetDefault::new(instance_id).into()).await;
        match self.recv().await {
            Some(Message::Ack(_)) => {}
            other => panic!("expected ACK, got {other:?}"),
        }
    }
}

/// Shorthand for asserting a RESPONSE error code.
pub fn error_code(response: &Response) -> Option<ErrorCode> {
    response.error.as_ref().map(|e| e.code)
}
