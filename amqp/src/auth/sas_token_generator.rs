use super::connection_string::ConnectionStringProperties;
use super::provider::{AccessToken, TokenProvider};
use crate::common::{AmqpError, AmqpResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Generator for Shared Access Signature (SAS) tokens.
///
/// Creates time-limited authentication tokens using HMAC-SHA256 signing with
/// a shared access key. The signed string is the URL-encoded audience followed
/// by a newline and the expiry as a unix timestamp.
///
/// # Examples
///
/// ```no_run
/// use amqp::auth::SasTokenGenerator;
/// use chrono::{Duration, Utc};
///
/// let generator = SasTokenGenerator::new("RootManageSharedAccessKey", "secret-key");
/// let token = generator.generate(
///     "amqp://my-ns.servicebus.windows.net/telemetry",
///     Utc::now() + Duration::hours(1),
/// )?;
/// # Ok::<(), amqp::common::AmqpError>(())
/// ```
#[derive(Clone)]
pub struct SasTokenGenerator {
    key_name: String,
    key: Zeroizing<String>,
}

impl fmt::Debug for SasTokenGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasTokenGenerator")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SasTokenGenerator {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            key: Zeroizing::new(key.into()),
        }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Generates a SAS token granting access to `audience` until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::Configuration`] if the HMAC cannot be keyed.
    pub fn generate(&self, audience: &str, expires_at: DateTime<Utc>) -> AmqpResult<String> {
        let expiry_timestamp = expires_at.timestamp();
        let encoded_audience = urlencoding::encode(audience);
        let string_to_sign = format!("{encoded_audience}\n{expiry_timestamp}");

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| AmqpError::Configuration(format!("Failed to create HMAC: {e}")))?;

        mac.update(string_to_sign.as_bytes());
        let signature = mac.finalize();
        let signature_base64 = general_purpose::STANDARD.encode(signature.into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_audience,
            urlencoding::encode(&signature_base64),
            expiry_timestamp,
            self.key_name
        ))
    }
}

/// [`TokenProvider`] signing a fresh SAS token for every authorize call.
#[derive(Clone, Debug)]
pub struct SharedAccessKeyCredential {
    generator: SasTokenGenerator,
    validity: Duration,
}

impl SharedAccessKeyCredential {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>, validity: Duration) -> Self {
        Self {
            generator: SasTokenGenerator::new(key_name, key),
            validity,
        }
    }

    pub fn from_connection_string(
        properties: &ConnectionStringProperties,
        validity: Duration,
    ) -> AmqpResult<Self> {
        match (
            properties.shared_access_key_name(),
            properties.shared_access_key(),
        ) {
            (Some(key_name), Some(key)) => Ok(Self::new(key_name, key, validity)),
            _ => Err(AmqpError::InvalidConnectionString(
                "Connection string does not carry a shared access key".to_string(),
            )),
        }
    }
}

#[async_trait]
impl TokenProvider for SharedAccessKeyCredential {
    async fn get_token(&self, audience: &str) -> AmqpResult<AccessToken> {
        let expires_at = Utc::now() + self.validity;
        let token = self.generator.generate(audience, expires_at)?;
        log::debug!(
            "Generated SAS token for '{audience}' with key '{}'",
            self.generator.key_name()
        );
        Ok(AccessToken::new(token, expires_at))
    }
}

/// [`TokenProvider`] returning a signature computed elsewhere.
///
/// The expiry is read from the `se` field of the signature.
#[derive(Clone)]
pub struct SharedAccessSignatureCredential {
    signature: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for SharedAccessSignatureCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAccessSignatureCredential")
            .field("signature", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl SharedAccessSignatureCredential {
    pub fn new(signature: impl Into<String>) -> AmqpResult<Self> {
        let signature = signature.into();
        let expiry = signature
            .trim_start_matches("SharedAccessSignature")
            .trim()
            .split('&')
            .find_map(|field| field.strip_prefix("se="))
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| {
                AmqpError::InvalidConnectionString(
                    "Shared access signature has no valid 'se' expiry".to_string(),
                )
            })?;

        let expires_at = Utc.timestamp_opt(expiry, 0).single().ok_or_else(|| {
            AmqpError::InvalidConnectionString(format!(
                "Shared access signature expiry {expiry} is out of range"
            ))
        })?;

        Ok(Self {
            signature: Zeroizing::new(signature),
            expires_at,
        })
    }
}

#[async_trait]
impl TokenProvider for SharedAccessSignatureCredential {
    async fn get_token(&self, _audience: &str) -> AmqpResult<AccessToken> {
        Ok(AccessToken::new(self.signature.as_str(), self.expires_at))
    }
}
