//! # Quetty AMQP Library
//!
//! Connection management and claims-based-security token refresh for AMQP
//! 1.0 brokers such as Azure Event Hubs and Service Bus.
//!
//! ## Modules
//!
//! - [`connection_manager`] - Lazily opened connection, session table and state stream
//! - [`session`] - Named sessions and the CBS capability handed to links
//! - [`cbs`] - `$cbs` node performing `put-token` authorization
//! - [`auth`] - Token providers, SAS signing and the token refresh manager
//! - [`management`] - `$management` node for entity metadata
//! - [`reactor`] - Executor driving the protocol engine loop
//! - [`transport`] - Traits implemented by the protocol layer below
//! - [`config`] - Connection options and their loader
//! - [`observer`] - Lifecycle hooks for tracing integration
//! - [`common`] - Error types shared by every module

pub mod auth;
pub mod cbs;
pub mod common;
pub mod config;
pub mod connection_manager;
pub mod management;
pub mod observer;
pub mod reactor;
pub mod session;
pub mod transport;
