//! The FileGuard orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use agent::{
    AgentClient, ChannelConfig, ChannelState, ConnectionSupervisor, Connector, DisconnectReason,
    Reply, ResolveHandler, SupervisorEvent,
};
use policy::{AccessRequest, AccessRule, RuleId, RuleSnapshot, RuleTable};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{Error, GuardObserver};

/// Resolves agent requests against the rule table.
struct RuleResolver {
    rules: Arc<RuleTable>,
}

impl ResolveHandler for RuleResolver {
    fn resolve(&self, request: AccessRequest, reply: Reply) {
        let rules = Arc::clone(&self.rules);
        // Off the channel's reader task; a panic here drops `reply`, which allows.
        tokio::spawn(async move {
            let snapshot = rules.snapshot();
            let decision = policy::resolve(&request, &snapshot);
            trace!(path = %request.path, access = ?request.access, %decision, "resolved");
            reply.send(decision);
        });
    }
}

struct Inner<C> {
    supervisor: ConnectionSupervisor<C>,
    rules: Arc<RuleTable>,
    resolver: Arc<RuleResolver>,
    observer: Mutex<Option<Weak<dyn GuardObserver>>>,
    client: Mutex<Option<AgentClient>>,
    running: AtomicBool,
}

impl<C: Connector> Inner<C> {
    fn client(&self) -> MutexGuard<'_, Option<AgentClient>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, f: impl FnOnce(&dyn GuardObserver)) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match observer {
            Some(observer) => f(observer.as_ref()),
            None => debug!("no observer to notify"),
        }
    }

    fn report(&self, error: Error) {
        let message = error.to_string();
        self.notify(|observer| observer.on_error(&message));
    }

    async fn on_connected(&self, client: AgentClient) {
        *self.client() = Some(client.clone());

        let handler: Arc<dyn ResolveHandler> = self.resolver.clone();
        match client.register_handler(handler).await {
            Ok(()) => {
                self.running.store(true, Ordering::SeqCst);
                info!("monitoring started");
                self.notify(|observer| observer.on_started());
            }
            Err(agent::Error::ChannelClosed) => {
                // Lost mid-registration; the disconnect event reports it.
                debug!("channel closed during registration");
            }
            Err(e) => {
                warn!(error = %e, "handler registration failed");
                self.client().take();
                self.supervisor.stop();
                self.report(Error::RegistrationFailed(e));
            }
        }
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        self.client().take();
        self.running.store(false, Ordering::SeqCst);

        match reason {
            DisconnectReason::ConnectFailed(reason) => self.report(Error::ConnectFailed(reason)),
            DisconnectReason::Invalidated(reason) => {
                warn!(%reason, "monitoring interrupted");
                self.report(Error::ChannelInvalidated(reason));
            }
            DisconnectReason::Stopped => debug!("channel stopped"),
        }
    }

    async fn start(&self, observer: Weak<dyn GuardObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);

        match self.supervisor.connect().await {
            Ok(_) => {}
            Err(agent::Error::InvalidState(state)) => {
                warn!(%state, "start requested while already started");
                self.report(Error::AlreadyStarted);
            }
            // Reported by the supervisor as `Disconnected(ConnectFailed)`.
            Err(e) => debug!(error = %e, "connect attempt failed"),
        }
    }

    async fn stop(&self) {
        let client = self.client().take();
        self.running.store(false, Ordering::SeqCst);

        let result = match client {
            Some(client) => client.unregister_handler().await,
            None => Ok(()),
        };
        self.supervisor.stop();

        match result {
            Ok(()) => {
                info!("monitoring stopped");
                self.notify(|observer| observer.on_stopped());
            }
            Err(e) => {
                warn!(error = %e, "handler unregistration failed");
                self.report(Error::UnregistrationFailed(e));
            }
        }
    }
}

/// Administrative requests, applied in the order they were made.
enum Command {
    Start(Weak<dyn GuardObserver>),
    Stop,
}

/// Mediates file access for the enforcement agent.
///
/// Rule edits take effect for every resolution that starts after the edit
/// returns. `start` and `stop` return immediately and are carried out in
/// call order; their outcome arrives through the [`GuardObserver`] given to
/// `start`.
pub struct FileGuard<C: Connector> {
    inner: Arc<Inner<C>>,
    commands: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl<C: Connector> FileGuard<C> {
    /// Create a guard. Must be called from within a tokio runtime; the other
    /// methods may then be called from any thread.
    pub fn new(connector: C, config: ChannelConfig) -> Self {
        let (supervisor, events) = ConnectionSupervisor::new(connector, config);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let rules = Arc::new(RuleTable::new());

        let inner = Arc::new(Inner {
            supervisor,
            resolver: Arc::new(RuleResolver {
                rules: Arc::clone(&rules),
            }),
            rules,
            observer: Mutex::new(None),
            client: Mutex::new(None),
            running: AtomicBool::new(false),
        });

        let worker = tokio::spawn(run(Arc::clone(&inner), commands_rx, events));
        Self {
            inner,
            commands,
            worker,
        }
    }

    /// Append a rule; returns its id for later removal.
    pub fn add_rule(&self, rule: AccessRule) -> RuleId {
        let id = rule.id;
        debug!(%id, path = %rule.path_prefix, policy = %rule.policy, "adding rule");
        self.inner.rules.add(rule);
        id
    }

    /// Remove the first rule with `id`. No-op if absent.
    pub fn remove_rule(&self, id: RuleId) -> Option<AccessRule> {
        let removed = self.inner.rules.remove(id);
        debug!(%id, removed = removed.is_some(), "removing rule");
        removed
    }

    /// Rules currently in force, in precedence order.
    pub fn rules(&self) -> RuleSnapshot {
        self.inner.rules.snapshot()
    }

    /// Connect to the agent and register as its resolution handler.
    ///
    /// `observer` replaces any previous observer once this start is carried
    /// out, and is held weakly. Starting while already started reports an
    /// error and leaves the running session alone.
    pub fn start(&self, observer: &Arc<dyn GuardObserver>) {
        self.send(Command::Start(Arc::downgrade(observer)));
    }

    /// Unregister from the agent and close the channel.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Whether the agent is currently routing requests to this guard.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn channel_state(&self) -> ChannelState {
        self.inner.supervisor.state()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("guard worker has exited, ignoring request");
        }
    }
}

impl<C: Connector> Drop for FileGuard<C> {
    fn drop(&mut self) {
        self.worker.abort();
        self.inner.supervisor.stop();
    }
}

/// Applies commands and supervisor events one at a time.
async fn run<C: Connector>(
    inner: Arc<Inner<C>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    loop {
        tokio::select! {
            // Pending events first: a command must see what earlier ones caused.
            biased;
            Some(event) = events.recv() => match event {
                SupervisorEvent::Connected(client) => inner.on_connected(client).await,
                SupervisorEvent::Disconnected(reason) => inner.on_disconnected(reason),
            },
            command = commands.recv() => match command {
                Some(Command::Start(observer)) => inner.start(observer).await,
                Some(Command::Stop) => inner.stop().await,
                None => break,
            },
        }
    }
}
