//! Named sessions multiplexed over one connection.

use crate::auth::TokenRefreshManager;
use crate::cbs::ClaimsBasedSecurityNode;
use crate::common::{AmqpError, AmqpResult};
use crate::connection_manager::ConnectionInner;
use crate::transport::{EndpointState, RequestResponseLink, SessionEndpoint, SessionHandler};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Access to the owning connection's CBS node and token managers.
///
/// Holds a weak reference so sessions never keep a closed connection alive.
#[derive(Clone)]
pub struct CbsProvider {
    connection_id: String,
    connection: Weak<ConnectionInner>,
}

impl CbsProvider {
    pub(crate) fn new(connection_id: String, connection: Weak<ConnectionInner>) -> Self {
        Self {
            connection_id,
            connection,
        }
    }

    pub(crate) fn connection(&self) -> AmqpResult<Arc<ConnectionInner>> {
        self.connection
            .upgrade()
            .ok_or_else(|| AmqpError::ConnectionClosed {
                connection_id: self.connection_id.clone(),
            })
    }

    pub async fn cbs_node(&self) -> AmqpResult<Arc<dyn ClaimsBasedSecurityNode>> {
        ConnectionInner::cbs_node(&self.connection()?).await
    }

    /// Create a token manager for `audience` bound to the connection's CBS node.
    pub async fn token_manager(
        &self,
        audience: &str,
        scopes: &str,
    ) -> AmqpResult<TokenRefreshManager> {
        ConnectionInner::token_manager(&self.connection()?, audience, scopes).await
    }
}

struct SessionInner {
    name: String,
    connection_id: String,
    endpoint: Arc<dyn SessionEndpoint>,
    handler: SessionHandler,
    cbs_provider: CbsProvider,
    closed: AtomicBool,
}

/// A begun session, shared by every caller that asked for its name.
///
/// Cloning is cheap; clones refer to the same session and compare equal.
#[derive(Clone)]
pub struct AmqpSession {
    inner: Arc<SessionInner>,
}

impl AmqpSession {
    pub(crate) fn new(
        name: impl Into<String>,
        connection_id: impl Into<String>,
        endpoint: Arc<dyn SessionEndpoint>,
        handler: SessionHandler,
        cbs_provider: CbsProvider,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                name: name.into(),
                connection_id: connection_id.into(),
                endpoint,
                handler,
                cbs_provider,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn state(&self) -> EndpointState {
        self.inner.handler.current_state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.inner.handler.subscribe()
    }

    /// Capability for links on this session that need to authorize.
    pub fn cbs_provider(&self) -> &CbsProvider {
        &self.inner.cbs_provider
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn open_request_response(
        &self,
        address: &str,
    ) -> AmqpResult<Arc<dyn RequestResponseLink>> {
        if self.is_closed() {
            return Err(AmqpError::disposed(format!("session '{}'", self.name())));
        }

        log::debug!(
            "Opening request/response link to '{address}' on session '{}'",
            self.name()
        );
        self.inner.endpoint.open_request_response(address).await
    }

    /// End the session and remove it from the connection's table.
    pub async fn close(&self) -> AmqpResult<()> {
        if let Ok(connection) = self.inner.cbs_provider.connection() {
            connection.forget_session(self);
        }
        self.end().await
    }

    /// End the session without touching the connection's table.
    pub(crate) async fn end(&self) -> AmqpResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log::debug!(
            "Ending session '{}' on connection '{}'",
            self.name(),
            self.connection_id()
        );
        let result = self.inner.endpoint.end().await;
        self.inner.handler.on_endpoint_state(EndpointState::Closed);
        result
    }
}

impl PartialEq for AmqpSession {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for AmqpSession {}

impl fmt::Debug for AmqpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpSession")
            .field("name", &self.inner.name)
            .field("connection_id", &self.inner.connection_id)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
