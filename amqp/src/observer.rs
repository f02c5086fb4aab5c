//! Lifecycle hooks for tracing integration.
//!
//! The connection and token managers call a [`ConnectionObserver`] at fixed
//! points. Every hook has a no-op default so implementations only override
//! what they record.

use crate::common::AmqpError;
use std::time::Duration;

pub trait ConnectionObserver: Send + Sync {
    fn on_session_opened(&self, _connection_id: &str, _session_name: &str) {}

    fn on_session_closed(&self, _connection_id: &str, _session_name: &str) {}

    /// Called after every successful authorize round-trip with the delay until
    /// the next refresh.
    fn on_authorization_succeeded(&self, _audience: &str, _next_refresh: Duration) {}

    fn on_authorization_failed(&self, _audience: &str, _error: &AmqpError) {}
}

/// Observer that ignores every hook
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// Observer writing each hook to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_session_opened(&self, connection_id: &str, session_name: &str) {
        log::info!("Session '{session_name}' opened on connection '{connection_id}'");
    }

    fn on_session_closed(&self, connection_id: &str, session_name: &str) {
        log::info!("Session '{session_name}' closed on connection '{connection_id}'");
    }

    fn on_authorization_succeeded(&self, audience: &str, next_refresh: Duration) {
        log::info!("Authorized '{audience}', next refresh in {next_refresh:?}");
    }

    fn on_authorization_failed(&self, audience: &str, error: &AmqpError) {
        log::warn!("Authorization of '{audience}' failed: {error}");
    }
}
