use super::session_table::{SessionTable, SlotOwner};
use super::state::ConnectionState;
use crate::auth::{TokenProvider, TokenRefreshManager};
use crate::cbs::{CBS_ADDRESS, CBS_SESSION_NAME, CbsChannel, ClaimsBasedSecurityNode};
use crate::common::{AmqpError, AmqpResult};
use crate::config::ConnectionOptions;
use crate::management::{MANAGEMENT_ADDRESS, MANAGEMENT_SESSION_NAME, ManagementNode};
use crate::observer::ConnectionObserver;
use crate::reactor::{ExceptionHandler, ReactorExecutor};
use crate::session::{AmqpSession, CbsProvider};
use crate::transport::{
    ConnectionHandler, EndpointState, HandlerEvent, ProtocolEngine, SessionHandler, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// The physical connection and the executor driving it.
struct PhysicalConnection {
    engine: Arc<dyn ProtocolEngine>,
    executor: ReactorExecutor,
}

/// Shared state behind an [`AmqpConnection`](super::AmqpConnection).
///
/// Sessions and CBS providers hold a `Weak` to this, so dropping the last
/// `AmqpConnection` handle tears the connection down.
pub(crate) struct ConnectionInner {
    connection_id: String,
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    token_provider: Arc<dyn TokenProvider>,
    runtime: Handle,
    observer: Arc<dyn ConnectionObserver>,
    physical: OnceCell<PhysicalConnection>,
    sessions: SessionTable,
    cbs: OnceCell<Arc<CbsChannel>>,
    management: OnceCell<Arc<ManagementNode>>,
    token_managers: Mutex<Vec<TokenRefreshManager>>,
    state: watch::Sender<ConnectionState>,
    subscriptions: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn new(
        connection_id: String,
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
        token_provider: Arc<dyn TokenProvider>,
        runtime: Handle,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            connection_id,
            options,
            transport,
            token_provider,
            runtime,
            observer,
            physical: OnceCell::new(),
            sessions: SessionTable::new(),
            cbs: OnceCell::new(),
            management: OnceCell::new(),
            token_managers: Mutex::new(Vec::new()),
            state,
            subscriptions: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub(crate) fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn audience_for(&self, entity_path: &str) -> String {
        format!(
            "amqp://{}/{}",
            self.options.fully_qualified_namespace(),
            entity_path
        )
    }

    fn closed_error(&self) -> AmqpError {
        AmqpError::ConnectionClosed {
            connection_id: self.connection_id.clone(),
        }
    }

    /// Reject new work once the connection is closed or failed.
    ///
    /// A failed connection keeps reporting the error that failed it.
    fn ensure_open(&self) -> AmqpResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        match &*self.state.borrow() {
            ConnectionState::Error(error) => Err(error.clone()),
            ConnectionState::Closed => Err(self.closed_error()),
            _ => Ok(()),
        }
    }

    /// Move to `next` unless a terminal state has already been reached.
    fn transition(&self, next: ConnectionState) {
        let connection_id = &self.connection_id;
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                log::debug!(
                    "Connection '{connection_id}' ignores {next:?}, already {current:?}"
                );
                return false;
            }
            log::debug!("Connection '{connection_id}' state {current:?} -> {next:?}");
            *current = next;
            true
        });
    }

    fn fail(&self, error: AmqpError) {
        log::error!("Connection '{}' failed: {error}", self.connection_id);
        self.transition(ConnectionState::Error(error));
    }

    fn on_endpoint_state(&self, state: EndpointState) {
        match state {
            EndpointState::Uninitialized => {}
            EndpointState::Opening => self.transition(ConnectionState::Connecting),
            EndpointState::Active => self.transition(ConnectionState::Active),
            EndpointState::Closed => self.transition(ConnectionState::Closed),
        }
    }

    /// The physical connection, created by the first caller only.
    async fn physical(self: &Arc<Self>) -> AmqpResult<&PhysicalConnection> {
        self.physical.get_or_try_init(|| self.connect()).await
    }

    async fn connect(self: &Arc<Self>) -> AmqpResult<PhysicalConnection> {
        // A failed attempt leaves the cell empty; later callers must not retry
        self.ensure_open()?;

        log::info!(
            "Opening connection '{}' to {}",
            self.connection_id,
            self.options.fully_qualified_namespace()
        );
        self.transition(ConnectionState::Connecting);

        let parameters = self.options.connection_parameters(&self.connection_id);
        let (handler, events) = ConnectionHandler::new(self.connection_id.clone());

        let engine = match self.transport.connect(&parameters, handler).await {
            Ok(engine) => engine,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };

        self.spawn_state_subscription(events);

        let executor = ReactorExecutor::new(
            self.connection_id.clone(),
            engine.clone(),
            self.runtime.clone(),
            self.exception_handler(),
        );
        if let Err(e) = executor.start() {
            self.fail(e.clone());
            return Err(e);
        }

        if self.is_closed() {
            executor.close();
            return Err(self.closed_error());
        }

        Ok(PhysicalConnection { engine, executor })
    }

    fn exception_handler(self: &Arc<Self>) -> ExceptionHandler {
        let connection = Arc::downgrade(self);
        Arc::new(move |error| {
            if let Some(connection) = connection.upgrade() {
                connection.fail(error);
            }
        })
    }

    /// Republish connection handler events on the state channel.
    fn spawn_state_subscription(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<HandlerEvent>,
    ) {
        let weak = Arc::downgrade(self);
        let cancelled = self.subscriptions.clone();

        self.runtime.spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancelled.cancelled() => return,
                    event = events.recv() => event,
                };

                let Some(connection) = weak.upgrade() else {
                    return;
                };

                match event {
                    Some(HandlerEvent::State(state)) => connection.on_endpoint_state(state),
                    Some(HandlerEvent::Error(error)) => connection.fail(error),
                    None => {
                        log::debug!(
                            "Connection '{}' handler stream ended",
                            connection.connection_id
                        );
                        connection.transition(ConnectionState::Closed);
                        return;
                    }
                }
            }
        });
    }

    async fn wait_for_active(&self) -> AmqpResult<()> {
        let mut receiver = self.state.subscribe();
        let timeout = self.options.operation_timeout();

        let wait = async {
            loop {
                let state = receiver.borrow_and_update().clone();
                match state {
                    ConnectionState::Active => return Ok(()),
                    ConnectionState::Error(error) => return Err(error),
                    ConnectionState::Closed => return Err(self.closed_error()),
                    ConnectionState::Uninitialized | ConnectionState::Connecting => {}
                }
                if receiver.changed().await.is_err() {
                    return Err(self.closed_error());
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            log::warn!(
                "Connection '{}' did not become active within {timeout:?}",
                self.connection_id
            );
            AmqpError::timeout(
                format!("waiting for connection '{}' to open", self.connection_id),
                timeout,
            )
        })?
    }

    pub(crate) async fn create_session(self: &Arc<Self>, name: &str) -> AmqpResult<AmqpSession> {
        if name.is_empty() {
            return Err(AmqpError::InvalidOperation(
                "Session name must not be empty".to_string(),
            ));
        }
        self.ensure_open()?;

        let physical = self.physical().await?;
        loop {
            let slot = self.sessions.slot(name);
            let session = match slot
                .get_or_try_init(|| self.begin_session(physical.engine.clone(), name))
                .await
            {
                Ok(session) => session.clone(),
                Err(e) => {
                    self.sessions.discard_slot(name, &slot);
                    return Err(e);
                }
            };

            match self.sessions.owner(name, &slot) {
                SlotOwner::Table if !self.is_closed() => return Ok(session),
                // close() ran after the slot was taken but may not have drained it yet
                SlotOwner::Table => {
                    if self.sessions.remove_instance(&session) {
                        self.end_detached(&session).await;
                    }
                    return Err(self.closed_error());
                }
                SlotOwner::Creator => self.end_detached(&session).await,
                SlotOwner::Remover => {}
            }

            if self.is_closed() {
                return Err(self.closed_error());
            }
            log::debug!(
                "Session '{name}' on connection '{}' was removed while it was begun, retrying",
                self.connection_id
            );
        }
    }

    /// End a session that is no longer in the table and report it closed.
    async fn end_detached(&self, session: &AmqpSession) {
        if let Err(e) = session.end().await {
            log::warn!(
                "Failed to end session '{}' on connection '{}': {e}",
                session.name(),
                self.connection_id
            );
        }
        self.observer
            .on_session_closed(&self.connection_id, session.name());
    }

    async fn begin_session(
        self: &Arc<Self>,
        engine: Arc<dyn ProtocolEngine>,
        name: &str,
    ) -> AmqpResult<AmqpSession> {
        log::debug!(
            "Beginning session '{name}' on connection '{}'",
            self.connection_id
        );

        let handler = SessionHandler::new(name);
        let endpoint = engine.begin_session(name, handler.clone()).await?;
        let cbs_provider = CbsProvider::new(self.connection_id.clone(), Arc::downgrade(self));
        let session = AmqpSession::new(
            name,
            self.connection_id.clone(),
            endpoint,
            handler,
            cbs_provider,
        );

        self.observer.on_session_opened(&self.connection_id, name);
        Ok(session)
    }

    pub(crate) async fn remove_session(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }

        let Some(session) = self.sessions.remove(name) else {
            return false;
        };
        self.end_detached(&session).await;
        true
    }

    /// Drop a session from the table without ending it.
    pub(crate) fn forget_session(&self, session: &AmqpSession) {
        if self.sessions.remove_instance(session) {
            self.observer
                .on_session_closed(&self.connection_id, session.name());
        }
    }

    pub(crate) async fn cbs_node(
        self: &Arc<Self>,
    ) -> AmqpResult<Arc<dyn ClaimsBasedSecurityNode>> {
        self.ensure_open()?;
        self.physical().await?;
        self.wait_for_active().await?;

        let channel = self
            .cbs
            .get_or_try_init(|| async {
                let session = self.create_session(CBS_SESSION_NAME).await?;
                let link = session.open_request_response(CBS_ADDRESS).await?;
                log::info!("CBS node ready on connection '{}'", self.connection_id);
                Ok::<_, AmqpError>(Arc::new(CbsChannel::new(
                    link,
                    self.token_provider.clone(),
                    self.options.authorization_type(),
                    self.options.operation_timeout(),
                )))
            })
            .await?;

        let node: Arc<dyn ClaimsBasedSecurityNode> = channel.clone();
        Ok(node)
    }

    /// Create a token manager for `audience` and register it for disposal on close.
    pub(crate) async fn token_manager(
        self: &Arc<Self>,
        audience: &str,
        scopes: &str,
    ) -> AmqpResult<TokenRefreshManager> {
        let cbs = self.cbs_node().await?;
        let manager =
            TokenRefreshManager::new(cbs, audience, scopes).with_observer(self.observer.clone());

        if let Ok(mut managers) = self.token_managers.lock() {
            managers.retain(|existing| !existing.is_disposed());
            managers.push(manager.clone());
        }

        // close() sets the flag before draining, so a late manager is caught here
        if self.is_closed() {
            manager.close();
            return Err(self.closed_error());
        }

        Ok(manager)
    }

    pub(crate) async fn management_node(self: &Arc<Self>) -> AmqpResult<Arc<ManagementNode>> {
        self.ensure_open()?;

        let node = self
            .management
            .get_or_try_init(|| async {
                let audience = self.audience_for(
                    self.options
                        .entity_path()
                        .unwrap_or(MANAGEMENT_ADDRESS),
                );
                let manager = self.token_manager(&audience, &audience).await?;
                if let Err(e) = manager.authorize().await {
                    manager.close();
                    return Err(e);
                }

                let session = self.create_session(MANAGEMENT_SESSION_NAME).await?;
                let link = match session.open_request_response(MANAGEMENT_ADDRESS).await {
                    Ok(link) => link,
                    Err(e) => {
                        manager.close();
                        return Err(e);
                    }
                };

                log::info!(
                    "Management node ready on connection '{}' for '{audience}'",
                    self.connection_id
                );
                Ok::<_, AmqpError>(Arc::new(ManagementNode::new(
                    self.connection_id.clone(),
                    link,
                    manager,
                    self.options.operation_timeout(),
                )))
            })
            .await?;

        Ok(node.clone())
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        log::info!("Closing connection '{}'", self.connection_id);

        let managers = self
            .token_managers
            .lock()
            .map(|mut managers| std::mem::take(&mut *managers))
            .unwrap_or_default();
        for manager in managers {
            manager.close();
        }

        if let Some(node) = self.management.get() {
            if let Err(e) = node.close().await {
                log::warn!(
                    "Failed to close management node on connection '{}': {e}",
                    self.connection_id
                );
            }
        }

        if let Some(cbs) = self.cbs.get() {
            if let Err(e) = cbs.close().await {
                log::warn!(
                    "Failed to close CBS node on connection '{}': {e}",
                    self.connection_id
                );
            }
        }

        for session in self.sessions.drain() {
            self.end_detached(&session).await;
        }

        if let Some(physical) = self.physical.get() {
            physical.executor.close();
        }
        self.subscriptions.cancel();

        self.state.send_replace(ConnectionState::Closed);
        log::info!("Connection '{}' closed", self.connection_id);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.subscriptions.cancel();
    }
}
