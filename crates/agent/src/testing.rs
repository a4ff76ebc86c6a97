//! In-memory stand-in for the enforcement agent.
//!
//! [`MockConnector`] hands the client one end of a duplex pipe per connect
//! and delivers the other end, wrapped in a [`MockAgent`], to the test via
//! [`MockListener`]. The mock agent is scripted by the test: it reads what
//! the client sends and writes whatever the test tells it to.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use policy::Decision;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::connector::Connector;
use crate::protocol::{
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, PeerInfo, RegisterParams, RegisterResult, RequestId, methods,
};

/// How long the mock agent waits for the client before failing the test.
pub const MOCK_TIMEOUT: Duration = Duration::from_secs(5);

const PIPE_CAPACITY: usize = 64 * 1024;

/// Connector whose streams lead to [`MockAgent`]s.
#[derive(Clone)]
pub struct MockConnector {
    agents: mpsc::UnboundedSender<MockAgent>,
    refuse: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
}

/// Receives the agent side of every connection made through a [`MockConnector`].
pub struct MockListener {
    agents: mpsc::UnboundedReceiver<MockAgent>,
}

impl MockConnector {
    pub fn new() -> (Self, MockListener) {
        let (agents, agents_rx) = mpsc::unbounded_channel();
        let connector = Self {
            agents,
            refuse: Arc::new(AtomicBool::new(false)),
            stall: Arc::new(AtomicBool::new(false)),
        };
        let listener = MockListener { agents: agents_rx };
        (connector, listener)
    }

    /// Make subsequent connects fail as if no agent were listening.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make subsequent connects hang as if the socket never accepted.
    pub fn stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock agent refused connection",
            ));
        }
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (client, agent) = tokio::io::duplex(PIPE_CAPACITY);
        self.agents
            .send(MockAgent::new(agent))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "mock listener gone"))?;
        Ok(client)
    }
}

impl MockListener {
    /// Next connection, before any handshake.
    pub async fn accept(&mut self) -> MockAgent {
        timeout(MOCK_TIMEOUT, self.agents.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("mock connector dropped")
    }

    /// Next connection with the handshake already answered.
    pub async fn accept_initialized(&mut self) -> MockAgent {
        let mut agent = self.accept().await;
        agent.complete_handshake().await;
        agent
    }
}

/// Agent end of one mock connection.
pub struct MockAgent {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    next_id: i64,
}

impl MockAgent {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1000,
        }
    }

    /// Next message from the client, or `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        let read = timeout(MOCK_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for client message");
        match read {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(serde_json::from_str(&line).expect("client sent invalid JSON")),
        }
    }

    /// Assert the client sends nothing for `period`.
    pub async fn expect_silence(&mut self, period: Duration) {
        let mut line = String::new();
        match timeout(period, self.reader.read_line(&mut line)).await {
            Err(_) | Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(_)) => panic!("expected silence, client sent {line}"),
        }
    }

    /// Next message must be a request for `method`.
    pub async fn expect_request(&mut self, method: &str) -> JsonRpcRequest {
        let message = self.recv().await.expect("client hung up");
        let request: JsonRpcRequest =
            serde_json::from_value(message).expect("expected a request from the client");
        assert_eq!(request.method, method);
        request
    }

    /// Next message must be a response.
    pub async fn recv_response(&mut self) -> JsonRpcResponse {
        let message = self.recv().await.expect("client hung up");
        serde_json::from_value(message).expect("expected a response from the client")
    }

    pub async fn send_raw(&mut self, line: &str) {
        // The client may already be gone; tests observe that separately.
        let _ = self.writer.write_all(line.as_bytes()).await;
        let _ = self.writer.write_all(b"\n").await;
        let _ = self.writer.flush().await;
    }

    async fn send(&mut self, message: &impl Serialize) {
        let line = serde_json::to_string(message).expect("serialize mock message");
        self.send_raw(&line).await;
    }

    pub async fn respond(&mut self, id: RequestId, result: impl Serialize) {
        self.send(&JsonRpcResponse::success(id, result)).await;
    }

    pub async fn respond_error(&mut self, id: RequestId, code: i32, message: &str) {
        let error = JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        };
        self.send(&JsonRpcResponse::failure(id, error)).await;
    }

    /// Answer the client's `initialize` request.
    pub async fn complete_handshake(&mut self) {
        let request = self.expect_request(methods::INITIALIZE).await;
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            agent_info: PeerInfo {
                name: "mock-agent".to_string(),
                version: None,
            },
        };
        self.respond(request.id, result).await;
    }

    /// Answer the next `register` request; returns the requested handler flag.
    pub async fn answer_registration(&mut self, success: bool) -> bool {
        let request = self.expect_request(methods::REGISTER).await;
        let params: RegisterParams =
            serde_json::from_value(request.params.unwrap_or(Value::Null)).expect("register params");
        self.respond(request.id, RegisterResult { success }).await;
        params.handler
    }

    /// Send a `resolve` request; returns its id.
    pub async fn send_resolve(&mut self, path: &str, access: &str) -> RequestId {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;
        let request = JsonRpcRequest::new(id.clone(), methods::RESOLVE)
            .with_params(json!({ "pid": 4242, "path": path, "access": access }));
        self.send(&request).await;
        id
    }

    /// Send a `resolve` request and wait for its decision.
    pub async fn resolve(&mut self, path: &str, access: &str) -> Decision {
        let id = self.send_resolve(path, access).await;
        let response = self.recv_response().await;
        assert_eq!(response.id, id);
        let result = response.into_result().expect("resolve failed");
        serde_json::from_value(result["decision"].clone()).expect("decision")
    }

    /// Signal that the channel is dead.
    pub async fn invalidate(&mut self, reason: &str) {
        let notification =
            JsonRpcNotification::new(methods::INVALIDATED, json!({ "reason": reason }));
        self.send(&notification).await;
    }

    /// Hang up the agent side.
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
