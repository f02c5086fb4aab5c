use crate::common::AmqpResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Token type announced in the CBS `put-token` request.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationType {
    /// Shared access signature generated from a namespace or entity key
    #[default]
    SharedAccessSignature,
    /// Azure AD bearer token
    JsonWebToken,
}

impl AuthorizationType {
    /// Value of the `type` application property expected by the `$cbs` node
    pub fn token_type(&self) -> &'static str {
        match self {
            AuthorizationType::SharedAccessSignature => "servicebus.windows.net:sastoken",
            AuthorizationType::JsonWebToken => "jwt",
        }
    }
}

/// A credential ready to be placed on the CBS node.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Source of tokens for claims-based-security authorization.
///
/// Implementations are invoked once per authorize round-trip with the
/// audience being authorized (for example
/// `amqp://my-ns.servicebus.windows.net/telemetry`).
///
/// # Examples
///
/// ```no_run
/// use amqp::auth::{AccessToken, TokenProvider};
/// use amqp::common::AmqpResult;
/// use async_trait::async_trait;
///
/// struct StaticToken(AccessToken);
///
/// #[async_trait]
/// impl TokenProvider for StaticToken {
///     async fn get_token(&self, _audience: &str) -> AmqpResult<AccessToken> {
///         Ok(self.0.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, audience: &str) -> AmqpResult<AccessToken>;
}
