//! Connection lifecycle (connect, invalidation, stop).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::session::{ChannelSession, DisconnectReason, ResolveHandler, wait_closed};

/// Connection state.
///
/// An invalidated channel goes straight back to `Disconnected`; the reason
/// travels in the [`SupervisorEvent::Disconnected`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications emitted by the supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Connected(AgentClient),
    Disconnected(DisconnectReason),
}

/// Handle to the connected agent.
///
/// Holds only a weak reference to the session: once the supervisor drops the
/// session every call fails with [`Error::ChannelClosed`].
#[derive(Debug, Clone)]
pub struct AgentClient {
    session: Weak<ChannelSession>,
}

impl AgentClient {
    fn new(session: &Arc<ChannelSession>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }

    fn session(&self) -> Result<Arc<ChannelSession>> {
        self.session
            .upgrade()
            .filter(|session| !session.is_closed())
            .ok_or(Error::ChannelClosed)
    }

    /// Route the agent's resolution requests to `handler`.
    pub async fn register_handler(&self, handler: Arc<dyn ResolveHandler>) -> Result<()> {
        self.session()?.register_handler(handler).await
    }

    /// Stop routing resolution requests to this client.
    pub async fn unregister_handler(&self) -> Result<()> {
        self.session()?.unregister_handler().await
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_ok()
    }
}

#[derive(Debug)]
struct Inner {
    state: ChannelState,
    /// Bumped on every connect and stop; events from older sessions are stale.
    generation: u64,
    session: Option<Arc<ChannelSession>>,
}

/// Owns the channel to the enforcement agent.
///
/// Exactly one [`SupervisorEvent::Disconnected`] is emitted per connection
/// attempt that leaves the `Disconnected` state. Reconnection is never
/// automatic.
pub struct ConnectionSupervisor<C> {
    connector: C,
    config: ChannelConfig,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    /// Create a supervisor and the receiver for its lifecycle events.
    pub fn new(
        connector: C,
        config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            connector,
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: ChannelState::Disconnected,
                generation: 0,
                session: None,
            })),
            events,
        };
        (supervisor, events_rx)
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    /// Open a channel and perform the handshake.
    ///
    /// Emits `Connected` on success or `Disconnected(ConnectFailed)` on
    /// failure. Fails with [`Error::InvalidState`] unless disconnected.
    pub async fn connect(&self) -> Result<AgentClient> {
        let generation = {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Disconnected {
                return Err(Error::InvalidState(format!(
                    "cannot connect while {:?}",
                    inner.state
                )));
            }
            inner.state = ChannelState::Connecting;
            inner.generation += 1;
            inner.generation
        };

        match self.establish().await {
            Ok(session) => self.on_established(session, generation),
            Err(e) => {
                self.on_connect_failed(&e, generation);
                Err(e)
            }
        }
    }

    /// Close the channel. Idempotent.
    pub fn stop(&self) {
        let session = {
            let mut inner = lock(&self.inner);
            if inner.state == ChannelState::Disconnected {
                return;
            }
            inner.generation += 1;
            inner.state = ChannelState::Disconnected;
            inner.session.take()
        };

        if let Some(session) = session {
            session.close(DisconnectReason::Stopped);
        }
        info!("channel to enforcement agent stopped");
        let _ = self
            .events
            .send(SupervisorEvent::Disconnected(DisconnectReason::Stopped));
    }

    async fn establish(&self) -> Result<Arc<ChannelSession>> {
        let stream = timeout(self.config.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        let session = ChannelSession::spawn(stream, self.config.request_timeout);
        if let Err(e) = session.initialize().await {
            session.close(DisconnectReason::ConnectFailed(e.to_string()));
            return Err(Error::Handshake(e.to_string()));
        }
        Ok(session)
    }

    fn on_established(&self, session: Arc<ChannelSession>, generation: u64) -> Result<AgentClient> {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            // Stopped while connecting; the stop already reported the disconnect.
            drop(inner);
            session.close(DisconnectReason::Stopped);
            return Err(Error::ChannelClosed);
        }

        inner.state = ChannelState::Connected;
        inner.session = Some(Arc::clone(&session));
        drop(inner);

        self.watch(&session, generation);
        let client = AgentClient::new(&session);
        info!("connected to enforcement agent");
        let _ = self.events.send(SupervisorEvent::Connected(client.clone()));
        Ok(client)
    }

    fn on_connect_failed(&self, error: &Error, generation: u64) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }
        inner.state = ChannelState::Disconnected;
        drop(inner);

        warn!(%error, "could not connect to enforcement agent");
        let _ = self.events.send(SupervisorEvent::Disconnected(
            DisconnectReason::ConnectFailed(error.to_string()),
        ));
    }

    /// Report invalidation of the session created for `generation`.
    fn watch(&self, session: &ChannelSession, generation: u64) {
        let closed = session.subscribe_closed();
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();

        tokio::spawn(async move {
            let reason = wait_closed(closed).await;

            let session = {
                let mut inner = lock(&inner);
                if inner.generation != generation {
                    return;
                }
                inner.state = ChannelState::Disconnected;
                inner.session.take()
            };
            drop(session);

            let _ = events.send(SupervisorEvent::Disconnected(reason));
        });
    }
}

impl<C> Drop for ConnectionSupervisor<C> {
    fn drop(&mut self) {
        let session = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.state = ChannelState::Disconnected;
            inner.session.take()
        };
        if let Some(session) = session {
            session.close(DisconnectReason::Stopped);
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockListener};
    use std::time::Duration;

    fn supervisor() -> (
        ConnectionSupervisor<MockConnector>,
        mpsc::UnboundedReceiver<SupervisorEvent>,
        MockListener,
    ) {
        let (connector, listener) = MockConnector::new();
        let config = ChannelConfig {
            request_timeout: Duration::from_secs(2),
            ..ChannelConfig::default()
        };
        let (supervisor, events) = ConnectionSupervisor::new(connector, config);
        (supervisor, events, listener)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> SupervisorEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn assert_no_event(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) {
        assert!(events.try_recv().is_err(), "unexpected extra event");
    }

    #[tokio::test]
    async fn connect_emits_connected() {
        let (supervisor, mut events, mut listener) = supervisor();
        let (client, _agent) = tokio::join!(supervisor.connect(), listener.accept_initialized());
        let client = client.unwrap();

        assert!(client.is_connected());
        assert_eq!(supervisor.state(), ChannelState::Connected);
        assert!(matches!(next_event(&mut events).await, SupervisorEvent::Connected(_)));
    }

    #[tokio::test]
    async fn unreachable_agent_reports_connect_failed() {
        let (supervisor, mut events, _listener) = supervisor();
        supervisor.connector.refuse(true);

        let result = supervisor.connect().await;
        assert!(matches!(result, Err(Error::Connect(_))));
        assert_eq!(supervisor.state(), ChannelState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SupervisorEvent::Disconnected(DisconnectReason::ConnectFailed(_))
        ));
        assert_no_event(&mut events);
    }

    #[tokio::test]
    async fn stalled_connect_times_out() {
        let (connector, _listener) = MockConnector::new();
        connector.stall(true);
        let config = ChannelConfig {
            connect_timeout: Duration::from_millis(50),
            ..ChannelConfig::default()
        };
        let (supervisor, mut events) = ConnectionSupervisor::new(connector, config);

        let result = supervisor.connect().await;
        assert!(matches!(result, Err(Error::ConnectTimeout)));
        assert_eq!(supervisor.state(), ChannelState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SupervisorEvent::Disconnected(DisconnectReason::ConnectFailed(_))
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_no_event(&mut events);
    }

    #[tokio::test]
    async fn handshake_failure_reports_connect_failed() {
        let (supervisor, mut events, mut listener) = supervisor();
        let (result, ()) = tokio::join!(supervisor.connect(), async {
            let mut agent = listener.accept().await;
            let request = agent.expect_request(crate::protocol::methods::INITIALIZE).await;
            agent.respond_error(request.id, -32000, "unsupported client").await;
        });

        assert!(matches!(result, Err(Error::Handshake(_))));
        assert_eq!(supervisor.state(), ChannelState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SupervisorEvent::Disconnected(DisconnectReason::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn connect_twice_is_invalid() {
        let (supervisor, _events, mut listener) = supervisor();
        let (client, _agent) = tokio::join!(supervisor.connect(), listener.accept_initialized());
        client.unwrap();

        assert!(matches!(supervisor.connect().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn invalidation_reported_exactly_once() {
        let (supervisor, mut events, mut listener) = supervisor();
        let (client, agent) = tokio::join!(supervisor.connect(), listener.accept_initialized());
        let client = client.unwrap();
        let mut agent = agent;
        next_event(&mut events).await;

        agent.invalidate("helper crashed").await;
        agent.invalidate("helper crashed").await;

        match next_event(&mut events).await {
            SupervisorEvent::Disconnected(DisconnectReason::Invalidated(reason)) => {
                assert_eq!(reason, "helper crashed");
            }
            other => panic!("expected invalidation, got {other:?}"),
        }
        assert_eq!(supervisor.state(), ChannelState::Disconnected);
        assert!(!client.is_connected());

        // A later stop finds nothing to stop.
        supervisor.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_no_event(&mut events);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_suppresses_later_invalidation() {
        let (supervisor, mut events, mut listener) = supervisor();
        let (client, agent) = tokio::join!(supervisor.connect(), listener.accept_initialized());
        let client = client.unwrap();
        let mut agent = agent;
        next_event(&mut events).await;

        supervisor.stop();
        supervisor.stop();
        assert!(matches!(
            next_event(&mut events).await,
            SupervisorEvent::Disconnected(DisconnectReason::Stopped)
        ));

        agent.invalidate("late").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_no_event(&mut events);
        assert!(matches!(
            client.unregister_handler().await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn stop_when_never_connected_emits_nothing() {
        let (supervisor, mut events, _listener) = supervisor();
        supervisor.stop();
        assert_no_event(&mut events);
    }

    #[tokio::test]
    async fn reconnect_after_invalidation() {
        let (supervisor, mut events, mut listener) = supervisor();
        let (client, agent) = tokio::join!(supervisor.connect(), listener.accept_initialized());
        client.unwrap();
        let mut agent = agent;
        next_event(&mut events).await;
        agent.close().await;
        next_event(&mut events).await;

        let (client, _agent) = tokio::join!(supervisor.connect(), listener.accept_initialized());
        assert!(client.unwrap().is_connected());
        assert!(matches!(next_event(&mut events).await, SupervisorEvent::Connected(_)));
    }
}
