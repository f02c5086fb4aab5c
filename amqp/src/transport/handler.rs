use crate::common::AmqpError;
use tokio::sync::{mpsc, watch};

/// Lifecycle phase of an endpoint as reported by the protocol engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Uninitialized,
    Opening,
    Active,
    Closed,
}

/// Event emitted by the protocol engine for the connection endpoint.
#[derive(Clone, Debug)]
pub enum HandlerEvent {
    State(EndpointState),
    Error(AmqpError),
}

/// Sink the protocol engine uses to report connection-level events.
///
/// The handler is cheap to clone; every clone feeds the same stream. When the
/// last clone is dropped the stream ends, which the connection interprets as
/// the endpoint being closed.
#[derive(Clone, Debug)]
pub struct ConnectionHandler {
    connection_id: String,
    events: mpsc::UnboundedSender<HandlerEvent>,
}

impl ConnectionHandler {
    pub(crate) fn new(connection_id: String) -> (Self, mpsc::UnboundedReceiver<HandlerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                connection_id,
                events,
            },
            receiver,
        )
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn on_endpoint_state(&self, state: EndpointState) {
        log::debug!(
            "Connection '{}' endpoint state: {state:?}",
            self.connection_id
        );
        if self.events.send(HandlerEvent::State(state)).is_err() {
            log::debug!(
                "Connection '{}' no longer observes endpoint events",
                self.connection_id
            );
        }
    }

    pub fn on_error(&self, error: AmqpError) {
        log::warn!("Connection '{}' reported error: {error}", self.connection_id);
        if self.events.send(HandlerEvent::Error(error)).is_err() {
            log::debug!(
                "Connection '{}' no longer observes endpoint events",
                self.connection_id
            );
        }
    }
}

/// Per-session event sink handed to the protocol engine.
#[derive(Clone, Debug)]
pub struct SessionHandler {
    session_name: String,
    state: watch::Sender<EndpointState>,
}

impl SessionHandler {
    pub(crate) fn new(session_name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(EndpointState::Uninitialized);
        Self {
            session_name: session_name.into(),
            state,
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn on_endpoint_state(&self, state: EndpointState) {
        log::debug!("Session '{}' endpoint state: {state:?}", self.session_name);
        self.state.send_replace(state);
    }

    pub fn on_error(&self, error: AmqpError) {
        log::warn!("Session '{}' reported error: {error}", self.session_name);
        self.state.send_replace(EndpointState::Closed);
    }

    pub fn current_state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }
}
