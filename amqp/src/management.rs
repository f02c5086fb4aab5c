//! Management node used for entity metadata requests.

use crate::auth::TokenRefreshManager;
use crate::common::{AmqpError, AmqpResult};
use crate::transport::{AmqpRequest, AmqpResponse, RequestResponseLink};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Address of the management node
pub const MANAGEMENT_ADDRESS: &str = "$management";

/// Session name used for the management request/response link
pub const MANAGEMENT_SESSION_NAME: &str = "mgmt-session";

pub const READ_OPERATION: &str = "READ";

pub const EVENT_HUB_ENTITY_TYPE: &str = "com.microsoft:eventhub";

pub const PARTITION_ENTITY_TYPE: &str = "com.microsoft:partition";

/// Request/response channel to `$management`, cached per connection.
///
/// The node keeps its audience authorized through its own
/// [`TokenRefreshManager`], which is closed together with the node.
pub struct ManagementNode {
    connection_id: String,
    link: Arc<dyn RequestResponseLink>,
    token_manager: TokenRefreshManager,
    operation_timeout: Duration,
}

impl fmt::Debug for ManagementNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementNode")
            .field("connection_id", &self.connection_id)
            .field("audience", &self.audience())
            .field("operation_timeout", &self.operation_timeout)
            .field("closed", &self.token_manager.is_disposed())
            .finish()
    }
}

impl ManagementNode {
    pub(crate) fn new(
        connection_id: impl Into<String>,
        link: Arc<dyn RequestResponseLink>,
        token_manager: TokenRefreshManager,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            link,
            token_manager,
            operation_timeout,
        }
    }

    pub fn audience(&self) -> &str {
        self.token_manager.audience()
    }

    /// Send a raw management request, failing on a non-success status.
    pub async fn request(&self, request: AmqpRequest) -> AmqpResult<AmqpResponse> {
        if self.token_manager.is_disposed() {
            return Err(AmqpError::disposed(format!(
                "management node of connection '{}'",
                self.connection_id
            )));
        }

        let operation = request.operation.clone();
        let response = tokio::time::timeout(self.operation_timeout, self.link.request(request))
            .await
            .map_err(|_| {
                AmqpError::timeout(format!("management {operation}"), self.operation_timeout)
            })??;

        if response.status_code.is_success() {
            Ok(response)
        } else {
            log::warn!(
                "Management operation '{operation}' on connection '{}' returned {}",
                self.connection_id,
                response.status_code
            );
            Err(AmqpError::Management {
                operation,
                code: response.status_code,
                description: response.description().to_string(),
            })
        }
    }

    /// Read the metadata of an entity.
    pub async fn entity_properties(
        &self,
        entity_name: &str,
        entity_type: &str,
    ) -> AmqpResult<HashMap<String, String>> {
        let request = AmqpRequest::new(READ_OPERATION)
            .with_property("operation", READ_OPERATION)
            .with_property("name", entity_name)
            .with_property("type", entity_type);

        Ok(self.request(request).await?.properties)
    }

    pub async fn event_hub_properties(
        &self,
        event_hub_name: &str,
    ) -> AmqpResult<HashMap<String, String>> {
        self.entity_properties(event_hub_name, EVENT_HUB_ENTITY_TYPE)
            .await
    }

    pub async fn partition_properties(
        &self,
        event_hub_name: &str,
        partition_id: &str,
    ) -> AmqpResult<HashMap<String, String>> {
        let request = AmqpRequest::new(READ_OPERATION)
            .with_property("operation", READ_OPERATION)
            .with_property("name", event_hub_name)
            .with_property("type", PARTITION_ENTITY_TYPE)
            .with_property("partition", partition_id);

        Ok(self.request(request).await?.properties)
    }

    pub(crate) async fn close(&self) -> AmqpResult<()> {
        self.token_manager.close();
        self.link.close().await
    }
}
