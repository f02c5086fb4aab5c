//! Claims-based-security node.
//!
//! The `$cbs` node accepts `put-token` requests that attach a token to an
//! audience on an open connection, so credentials can be renewed without
//! tearing the connection down.

use crate::auth::{AuthorizationType, TokenProvider};
use crate::common::{AmqpError, AmqpResult};
use crate::transport::{AmqpRequest, RequestResponseLink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Address of the claims-based-security node
pub const CBS_ADDRESS: &str = "$cbs";

/// Session name used for the CBS request/response link
pub const CBS_SESSION_NAME: &str = "cbs-session";

pub const PUT_TOKEN_OPERATION: &str = "put-token";

/// Capability used by [`TokenRefreshManager`](crate::auth::TokenRefreshManager)
/// to authorize an audience.
#[async_trait]
pub trait ClaimsBasedSecurityNode: Send + Sync {
    /// Perform one authorization round-trip and return the token's expiry.
    async fn authorize(&self, audience: &str, scopes: &str) -> AmqpResult<DateTime<Utc>>;

    async fn close(&self) -> AmqpResult<()>;
}

impl fmt::Debug for dyn ClaimsBasedSecurityNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClaimsBasedSecurityNode")
    }
}

/// [`ClaimsBasedSecurityNode`] backed by a `$cbs` request/response link.
pub struct CbsChannel {
    link: Arc<dyn RequestResponseLink>,
    token_provider: Arc<dyn TokenProvider>,
    authorization_type: AuthorizationType,
    operation_timeout: Duration,
}

impl CbsChannel {
    pub fn new(
        link: Arc<dyn RequestResponseLink>,
        token_provider: Arc<dyn TokenProvider>,
        authorization_type: AuthorizationType,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            link,
            token_provider,
            authorization_type,
            operation_timeout,
        }
    }
}

impl fmt::Debug for CbsChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbsChannel")
            .field("authorization_type", &self.authorization_type)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ClaimsBasedSecurityNode for CbsChannel {
    async fn authorize(&self, audience: &str, scopes: &str) -> AmqpResult<DateTime<Utc>> {
        let token = self.token_provider.get_token(scopes).await?;

        let request = AmqpRequest::new(PUT_TOKEN_OPERATION)
            .with_property("operation", PUT_TOKEN_OPERATION)
            .with_property("type", self.authorization_type.token_type())
            .with_property("name", audience)
            .with_property("expiration", token.expires_at.timestamp().to_string())
            .with_body(token.token);

        log::debug!("Sending put-token for audience '{audience}'");

        let response = tokio::time::timeout(self.operation_timeout, self.link.request(request))
            .await
            .map_err(|_| AmqpError::timeout("cbs put-token", self.operation_timeout))??;

        let code = response.status_code;
        if code.is_success() {
            log::debug!(
                "Authorization accepted for '{audience}', token expires at {}",
                token.expires_at
            );
            return Ok(token.expires_at);
        }

        if code.is_retriable() {
            log::warn!("CBS node busy while authorizing '{audience}': {code}");
            return Err(AmqpError::transient(format!(
                "CBS node returned {code} for '{audience}': {}",
                response.description()
            )));
        }

        log::error!("Authorization rejected for '{audience}': {code}");
        Err(AmqpError::Authentication {
            audience: audience.to_string(),
            code,
            description: response.description().to_string(),
        })
    }

    async fn close(&self) -> AmqpResult<()> {
        self.link.close().await
    }
}
