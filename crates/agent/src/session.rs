//! One live channel to the enforcement agent.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use policy::{AccessRequest, Decision};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::config::MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};
use crate::protocol::{
    Incoming, InitializeParams, InitializeResult, InvalidatedParams, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, RawMessage, RegisterParams, RegisterResult, RequestId,
    ResolveParams, ResolveResult, methods,
};

/// Why a channel stopped carrying traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The channel could not be established.
    ConnectFailed(String),
    /// The channel was lost after it was established.
    Invalidated(String),
    /// The channel was closed on request.
    Stopped,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectFailed(reason) => write!(f, "connect failed: {reason}"),
            DisconnectReason::Invalidated(reason) => write!(f, "invalidated: {reason}"),
            DisconnectReason::Stopped => f.write_str("stopped"),
        }
    }
}

/// Receives resolution requests routed to this client by the agent.
///
/// `resolve` is called on the channel's reader task and must return
/// promptly. The decision is delivered through `reply`, which may be moved
/// to another task and answered later.
pub trait ResolveHandler: Send + Sync + 'static {
    fn resolve(&self, request: AccessRequest, reply: Reply);
}

/// Continuation that answers exactly one `resolve` request.
///
/// Dropping a `Reply` without calling [`Reply::send`] answers `Allow`.
/// If the channel is gone by the time the decision is ready, the answer is
/// discarded.
pub struct Reply {
    inner: Option<(RequestId, Weak<Shared>)>,
}

impl Reply {
    fn new(id: RequestId, shared: Weak<Shared>) -> Self {
        Self {
            inner: Some((id, shared)),
        }
    }

    /// Answer the request.
    pub fn send(mut self, decision: Decision) {
        self.deliver(decision);
    }

    fn deliver(&mut self, decision: Decision) {
        let Some((id, shared)) = self.inner.take() else {
            return;
        };
        let Some(shared) = shared.upgrade() else {
            debug!(?id, "channel gone, dropping reply");
            return;
        };
        let response = JsonRpcResponse::success(id.clone(), ResolveResult { decision });
        if !shared.send_message(&response) {
            debug!(?id, "channel closed, dropping reply");
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if self.inner.is_some() {
            warn!("resolution dropped without an answer, allowing");
            self.deliver(Decision::Allow);
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("id", &self.inner.as_ref().map(|(id, _)| id))
            .finish()
    }
}

type Pending = HashMap<RequestId, oneshot::Sender<std::result::Result<Value, JsonRpcError>>>;

/// State shared between the session handle, its I/O tasks and replies.
struct Shared {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Mutex<Pending>,
    handler: RwLock<Option<Arc<dyn ResolveHandler>>>,
    closed: watch::Sender<Option<DisconnectReason>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn ResolveHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_handler(&self, handler: Option<Arc<dyn ResolveHandler>>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    fn send_line(&self, line: String) -> bool {
        !self.is_closed() && self.outgoing.send(line).is_ok()
    }

    fn send_message(&self, message: &impl Serialize) -> bool {
        match serde_json::to_string(message) {
            Ok(line) => self.send_line(line),
            Err(e) => {
                error!(error = %e, "failed to serialize message");
                false
            }
        }
    }

    /// Mark the channel closed. Returns `true` only for the first call.
    fn close(&self, reason: DisconnectReason) -> bool {
        let first = self.closed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            // Dropping the senders fails every waiter with `ChannelClosed`.
            self.pending().clear();
            self.set_handler(None);
        }
        first
    }

    fn complete(&self, response: JsonRpcResponse) {
        match self.pending().remove(&response.id) {
            Some(waiter) => {
                let _ = waiter.send(response.into_result());
            }
            None => warn!(id = ?response.id, "response for unknown request"),
        }
    }

    fn dispatch(self: &Arc<Self>, request: JsonRpcRequest) {
        if request.method != methods::RESOLVE {
            warn!(method = %request.method, "agent called unknown method");
            let error = JsonRpcError::method_not_found(&request.method);
            self.send_message(&JsonRpcResponse::failure(request.id, error));
            return;
        }

        let reply = Reply::new(request.id, Arc::downgrade(self));
        let params = match request.params.map(serde_json::from_value::<ResolveParams>) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                warn!(error = %e, "malformed resolve params, allowing");
                return reply.send(Decision::Allow);
            }
            None => {
                warn!("resolve request without params, allowing");
                return reply.send(Decision::Allow);
            }
        };

        let (operation, pid) = (params.id, params.pid);
        let request = match AccessRequest::try_from(params) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, ?pid, "allowing");
                return reply.send(Decision::Allow);
            }
        };

        match self.handler() {
            Some(handler) => {
                debug!(
                    path = %request.path,
                    access = ?request.access,
                    ?pid,
                    ?operation,
                    "resolving"
                );
                handler.resolve(request, reply);
            }
            None => {
                debug!(path = %request.path, "no handler registered, allowing");
                reply.send(Decision::Allow);
            }
        }
    }
}

/// A live JSON-RPC channel to the enforcement agent.
///
/// Owned by the connection supervisor; callers reach it through an
/// [`AgentClient`](crate::AgentClient).
pub struct ChannelSession {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ChannelSession {
    /// Start serving the channel over `stream`.
    pub(crate) fn spawn<S>(stream: S, request_timeout: Duration) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            closed,
        });

        let writer = tokio::spawn(write_loop(write_half, outgoing_rx, Arc::downgrade(&shared)));
        let reader = tokio::spawn(read_loop(BufReader::new(read_half), Arc::clone(&shared)));

        Arc::new(Self {
            shared,
            next_id: AtomicI64::new(1),
            request_timeout,
            reader,
            writer,
        })
    }

    /// Perform the protocol handshake.
    pub(crate) async fn initialize(&self) -> Result<InitializeResult> {
        let result: InitializeResult = self
            .request(methods::INITIALIZE, InitializeParams::default())
            .await?;
        debug!(
            agent = %result.agent_info.name,
            version = ?result.agent_info.version,
            protocol = %result.protocol_version,
            "handshake complete"
        );
        Ok(result)
    }

    /// Ask the agent to route resolution requests to `handler`.
    pub async fn register_handler(&self, handler: Arc<dyn ResolveHandler>) -> Result<()> {
        // Installed first so requests arriving right after the ack are routed.
        self.shared.set_handler(Some(handler));
        let result: Result<RegisterResult> = self
            .request(methods::REGISTER, RegisterParams { handler: true })
            .await;
        match result {
            Ok(RegisterResult { success: true }) => Ok(()),
            Ok(RegisterResult { success: false }) => {
                self.shared.set_handler(None);
                Err(Error::Rejected)
            }
            Err(e) => {
                self.shared.set_handler(None);
                Err(e)
            }
        }
    }

    /// Ask the agent to stop routing resolution requests here.
    pub async fn unregister_handler(&self) -> Result<()> {
        let result: Result<RegisterResult> = self
            .request(methods::REGISTER, RegisterParams { handler: false })
            .await;
        self.shared.set_handler(None);
        match result? {
            RegisterResult { success: true } => Ok(()),
            RegisterResult { success: false } => Err(Error::Rejected),
        }
    }

    /// Whether the channel has been closed or invalidated.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the channel is closed or invalidated.
    pub async fn closed(&self) -> DisconnectReason {
        wait_closed(self.shared.closed.subscribe()).await
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<Option<DisconnectReason>> {
        self.shared.closed.subscribe()
    }

    /// Tear the channel down. Outstanding replies are discarded.
    pub(crate) fn close(&self, reason: DisconnectReason) {
        self.shared.close(reason);
        self.reader.abort();
        self.writer.abort();
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.shared.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let id = self.next_request_id();
        let request = JsonRpcRequest::new(id.clone(), method).with_params(params);
        let line = serde_json::to_string(&request)?;

        let (waiter, response) = oneshot::channel();
        self.shared.pending().insert(id.clone(), waiter);
        if !self.shared.send_line(line) {
            self.shared.pending().remove(&id);
            return Err(Error::ChannelClosed);
        }

        let outcome = match timeout(self.request_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(Error::ChannelClosed),
            Err(_) => {
                self.shared.pending().remove(&id);
                return Err(Error::Timeout);
            }
        };

        let value = outcome?;
        serde_json::from_value(value).map_err(|e| Error::InvalidResponse(format!("{method}: {e}")))
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close(DisconnectReason::Stopped);
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

pub(crate) async fn wait_closed(
    mut closed: watch::Receiver<Option<DisconnectReason>>,
) -> DisconnectReason {
    match closed.wait_for(Option::is_some).await {
        Ok(state) => (*state).clone().unwrap_or(DisconnectReason::Stopped),
        Err(_) => DisconnectReason::Stopped,
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: Weak<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outgoing.recv().await {
        if let Err(e) = write_line(&mut writer, &line).await {
            error!(error = %e, "failed to write to enforcement agent");
            if let Some(shared) = shared.upgrade() {
                shared.close(DisconnectReason::Invalidated(format!("write failed: {e}")));
            }
            return;
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncBufRead + Unpin,
{
    // One byte past the cap, so an oversized line is detected without
    // buffering the rest of it.
    let limit = MAX_MESSAGE_SIZE as u64 + 1;
    let reason = loop {
        let mut line = Vec::new();
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break "agent closed the channel".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read failed: {e}"),
        }

        if line.last() == Some(&b'\n') {
            line.pop();
        } else if line.len() > MAX_MESSAGE_SIZE {
            break format!("message too large: exceeds {MAX_MESSAGE_SIZE} bytes");
        }

        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }

        let message: RawMessage = match serde_json::from_slice(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "ignoring unparseable message");
                continue;
            }
        };

        match message.classify() {
            Some(Incoming::Response(response)) => shared.complete(response),
            Some(Incoming::Request(request)) => shared.dispatch(request),
            Some(Incoming::Notification(notification))
                if notification.method == methods::INVALIDATED =>
            {
                break notification
                    .params
                    .and_then(|p| serde_json::from_value::<InvalidatedParams>(p).ok())
                    .map(|p| p.reason)
                    .unwrap_or_else(|| "invalidated by agent".to_string());
            }
            Some(Incoming::Notification(notification)) => {
                debug!(method = %notification.method, "ignoring notification");
            }
            None => warn!("ignoring message without id or method"),
        }
    };

    if shared.close(DisconnectReason::Invalidated(reason.clone())) {
        warn!(%reason, "channel to enforcement agent invalidated");
    }
}
