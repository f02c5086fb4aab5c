//! # Connection Manager
//!
//! [`AmqpConnection`] owns one physical AMQP connection and everything
//! multiplexed on it: named sessions, the `$cbs` node, the `$management` node
//! and the token managers that keep audiences authorized.
//!
//! The physical connection is opened lazily by the first call that needs it
//! and at most once, even under concurrent first calls. Failures are terminal:
//! once the state reaches [`ConnectionState::Closed`] or
//! [`ConnectionState::Error`] a new connection must be built.
//!
//! ## Example
//!
//! ```no_run
//! use amqp::auth::{ConnectionStringProperties, SharedAccessKeyCredential};
//! use amqp::config::ConnectionOptions;
//! use amqp::connection_manager::AmqpConnection;
//! use amqp::transport::Transport;
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn Transport>, connection_string: &str) -> amqp::common::AmqpResult<()> {
//! let options = ConnectionOptions::from_connection_string(connection_string)?;
//! let properties = ConnectionStringProperties::parse(connection_string)?;
//! let credential = Arc::new(SharedAccessKeyCredential::from_connection_string(
//!     &properties,
//!     chrono::Duration::hours(1),
//! )?);
//!
//! let connection = AmqpConnection::new(options, transport, credential)?;
//! let session = connection.create_session("orders").await?;
//!
//! let audience = connection.audience_for("orders");
//! let tokens = connection.token_manager(&audience, &audience).await?;
//! tokens.authorize().await?;
//!
//! session.close().await?;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod session_table;
mod state;

pub(crate) use connection::ConnectionInner;
pub use state::ConnectionState;

use crate::auth::{TokenProvider, TokenRefreshManager};
use crate::cbs::ClaimsBasedSecurityNode;
use crate::common::{AmqpError, AmqpResult};
use crate::config::ConnectionOptions;
use crate::management::ManagementNode;
use crate::observer::{ConnectionObserver, NoopObserver};
use crate::session::AmqpSession;
use crate::transport::Transport;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Builder for [`AmqpConnection`] when the defaults need overriding.
pub struct ConnectionBuilder {
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    token_provider: Arc<dyn TokenProvider>,
    runtime: Option<Handle>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    connection_id: Option<String>,
}

impl ConnectionBuilder {
    pub fn new(
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            options,
            transport,
            token_provider,
            runtime: None,
            observer: None,
            connection_id: None,
        }
    }

    /// Runtime the protocol engine loop and state subscription run on.
    ///
    /// Defaults to the runtime `build` is called from.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Validate the options and create the connection. No I/O happens here.
    pub fn build(self) -> AmqpResult<AmqpConnection> {
        if let Err(errors) = self.options.validate() {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AmqpError::Configuration(message));
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                AmqpError::Configuration(format!("No tokio runtime available: {e}"))
            })?,
        };

        let connection_id = self
            .connection_id
            .unwrap_or_else(|| format!("MF_{}", uuid::Uuid::new_v4().simple()));

        log::debug!(
            "Created connection '{connection_id}' for {}",
            self.options.fully_qualified_namespace()
        );

        Ok(AmqpConnection {
            inner: Arc::new(ConnectionInner::new(
                connection_id,
                self.options,
                self.transport,
                self.token_provider,
                runtime,
                self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            )),
        })
    }
}

/// Handle to a managed AMQP connection. Clones share the same connection.
#[derive(Clone)]
pub struct AmqpConnection {
    inner: Arc<ConnectionInner>,
}

impl AmqpConnection {
    pub fn builder(
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> ConnectionBuilder {
        ConnectionBuilder::new(options, transport, token_provider)
    }

    /// Create a connection on the current tokio runtime with default settings.
    pub fn new(
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> AmqpResult<Self> {
        Self::builder(options, transport, token_provider).build()
    }

    pub fn connection_id(&self) -> &str {
        self.inner.connection_id()
    }

    pub fn fully_qualified_namespace(&self) -> &str {
        self.inner.options().fully_qualified_namespace()
    }

    pub fn options(&self) -> &ConnectionOptions {
        self.inner.options()
    }

    /// Get the session called `name`, beginning it on first use.
    ///
    /// Concurrent callers asking for the same name receive the same session.
    ///
    /// # Errors
    ///
    /// [`AmqpError::InvalidOperation`] for an empty name,
    /// [`AmqpError::ConnectionClosed`] once the connection is closed, the
    /// error that failed the connection once it is in the error state, and
    /// any error raised while opening the connection or session.
    pub async fn create_session(&self, name: &str) -> AmqpResult<AmqpSession> {
        self.inner.create_session(name).await
    }

    /// End and forget the session called `name`.
    ///
    /// Returns whether a session by that name existed. Empty names are ignored.
    pub async fn remove_session(&self, name: &str) -> bool {
        self.inner.remove_session(name).await
    }

    pub fn session(&self, name: &str) -> Option<AmqpSession> {
        self.inner.sessions().get(name)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.inner.sessions().names()
    }

    /// The connection's `$cbs` node.
    ///
    /// Waits for the connection to become active, bounded by the operation
    /// timeout, and fails with [`AmqpError::Timeout`] if it does not.
    pub async fn cbs_node(&self) -> AmqpResult<Arc<dyn ClaimsBasedSecurityNode>> {
        self.inner.cbs_node().await
    }

    /// Create a token manager authorizing `audience` over this connection.
    ///
    /// The manager is closed together with the connection.
    pub async fn token_manager(
        &self,
        audience: &str,
        scopes: &str,
    ) -> AmqpResult<TokenRefreshManager> {
        self.inner.token_manager(audience, scopes).await
    }

    /// The connection's `$management` node, created and authorized once.
    pub async fn management_node(&self) -> AmqpResult<Arc<ManagementNode>> {
        self.inner.management_node().await
    }

    /// Token audience for an entity in this namespace
    pub fn audience_for(&self, entity_path: &str) -> String {
        self.inner.audience_for(entity_path)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.subscribe_state()
    }

    /// Stream of connection states, starting with the current one.
    ///
    /// Intermediate states may be coalesced. The stream ends after yielding
    /// a terminal state.
    pub fn state_stream(&self) -> BoxStream<'static, ConnectionState> {
        let receiver = self.inner.subscribe_state();

        futures::stream::unfold(Some((receiver, true)), |next| async move {
            let (mut receiver, first) = next?;
            if !first && receiver.changed().await.is_err() {
                return None;
            }

            let state = receiver.borrow_and_update().clone();
            let next = if state.is_terminal() {
                None
            } else {
                Some((receiver, false))
            };
            Some((state, next))
        })
        .boxed()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close token managers, nodes, sessions and the protocol engine.
    ///
    /// Failures while ending individual sessions are logged and do not stop
    /// the rest of the shutdown. Safe to call repeatedly.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("connection_id", &self.connection_id())
            .field("namespace", &self.fully_qualified_namespace())
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}
