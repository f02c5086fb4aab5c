//! # Transport Seams
//!
//! Traits the connection manager consumes from the layer below it. Framing,
//! sockets and message encoding live behind these traits; the core only drives
//! their lifecycle.
//!
//! - [`Transport`] - creates the physical connection for a set of parameters
//! - [`ProtocolEngine`] - the connection's I/O loop and session factory
//! - [`SessionEndpoint`] - a begun session able to attach request/response links
//! - [`RequestResponseLink`] - a link pair used by `$cbs` and `$management`

use crate::common::AmqpResult;
use crate::config::TransportType;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod handler;
pub mod request;

pub use handler::{ConnectionHandler, EndpointState, HandlerEvent, SessionHandler};
pub use request::{AmqpRequest, AmqpResponse, ResponseCode};

/// Everything the transport needs to open the physical connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionParameters {
    pub connection_id: String,
    pub host: String,
    pub port: u16,
    pub transport_type: TransportType,
    pub max_frame_size: u32,
    /// Properties announced in the AMQP `open` frame
    pub properties: HashMap<String, String>,
}

/// Factory for the physical connection.
///
/// Called at most once per [`AmqpConnection`](crate::connection_manager::AmqpConnection).
/// The returned engine must report endpoint transitions through `handler`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        parameters: &ConnectionParameters,
        handler: ConnectionHandler,
    ) -> AmqpResult<Arc<dyn ProtocolEngine>>;
}

/// The protocol engine bound to one physical connection.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Process reads, writes and timers until `shutdown` is cancelled.
    ///
    /// Returning `Err` signals an unrecoverable loop failure.
    async fn run(&self, shutdown: CancellationToken) -> AmqpResult<()>;

    /// Begin a new session on this connection.
    async fn begin_session(
        &self,
        name: &str,
        handler: SessionHandler,
    ) -> AmqpResult<Arc<dyn SessionEndpoint>>;
}

#[async_trait]
pub trait SessionEndpoint: Send + Sync {
    /// Attach a sender/receiver link pair addressed to a request/response node.
    async fn open_request_response(
        &self,
        address: &str,
    ) -> AmqpResult<Arc<dyn RequestResponseLink>>;

    /// End the session.
    async fn end(&self) -> AmqpResult<()>;
}

#[async_trait]
pub trait RequestResponseLink: Send + Sync {
    async fn request(&self, request: AmqpRequest) -> AmqpResult<AmqpResponse>;

    async fn close(&self) -> AmqpResult<()>;
}

impl fmt::Debug for dyn RequestResponseLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestResponseLink")
    }
}
