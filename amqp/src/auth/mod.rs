//! Credentials and token refresh.
//!
//! - [`TokenProvider`] - source of tokens for an audience
//! - [`SharedAccessKeyCredential`] - signs SAS tokens from a shared access key
//! - [`ConnectionStringProperties`] - parsed `Endpoint=...;SharedAccessKey...` strings
//! - [`TokenRefreshManager`] - keeps one audience authorized on a connection

pub mod connection_string;
pub mod provider;
pub mod sas_token_generator;
pub mod token_refresh_manager;

pub use connection_string::ConnectionStringProperties;
pub use provider::{AccessToken, AuthorizationType, TokenProvider};
pub use sas_token_generator::{
    SasTokenGenerator, SharedAccessKeyCredential, SharedAccessSignatureCredential,
};
pub use token_refresh_manager::{AuthorizationOutcome, TokenRefreshManager, refresh_delay};
