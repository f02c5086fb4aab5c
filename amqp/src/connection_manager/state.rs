use crate::common::AmqpError;

/// Connection-level lifecycle phase.
///
/// `Closed` and `Error` are terminal: a connection never leaves them, and a
/// new [`AmqpConnection`](super::AmqpConnection) has to be built to retry.
#[derive(Clone, Debug, Default)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Connecting,
    Active,
    Closed,
    Error(AmqpError),
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error(_))
    }

    pub fn error(&self) -> Option<&AmqpError> {
        match self {
            ConnectionState::Error(error) => Some(error),
            _ => None,
        }
    }
}
