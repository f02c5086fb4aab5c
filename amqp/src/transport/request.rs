use std::collections::HashMap;
use std::fmt;

/// Status codes returned by request/response nodes such as `$cbs` and
/// `$management`.
///
/// The broker reuses HTTP status semantics in the `status-code` application
/// property of its responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    Accepted,
    NoContent,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    Conflict,
    Gone,
    /// Quota or entity limits reached on the broker
    ResourceLimitExceeded,
    InternalServerError,
    ServiceUnavailable,
    Other(u16),
}

impl ResponseCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            200 => Self::Ok,
            202 => Self::Accepted,
            204 => Self::NoContent,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            408 => Self::RequestTimeout,
            409 => Self::Conflict,
            410 => Self::Gone,
            429 => Self::ResourceLimitExceeded,
            500 => Self::InternalServerError,
            503 => Self::ServiceUnavailable,
            other => Self::Other(other),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Accepted => 202,
            Self::NoContent => 204,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::RequestTimeout => 408,
            Self::Conflict => 409,
            Self::Gone => 410,
            Self::ResourceLimitExceeded => 429,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
            Self::Other(status) => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Accepted | Self::NoContent)
    }

    /// Codes the broker uses while busy; the same request may succeed later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout | Self::InternalServerError | Self::ServiceUnavailable
        )
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "Ok",
            Self::Accepted => "Accepted",
            Self::NoContent => "NoContent",
            Self::BadRequest => "BadRequest",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "NotFound",
            Self::RequestTimeout => "RequestTimeout",
            Self::Conflict => "Conflict",
            Self::Gone => "Gone",
            Self::ResourceLimitExceeded => "ResourceLimitExceeded",
            Self::InternalServerError => "InternalServerError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::Other(_) => "Other",
        };
        write!(f, "{name} ({})", self.status())
    }
}

/// A request sent over a request/response link.
///
/// Encoding into an AMQP message happens below this layer; the core only
/// fills in the operation, application properties and an optional string body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AmqpRequest {
    pub operation: String,
    pub application_properties: HashMap<String, String>,
    pub body: Option<String>,
}

impl AmqpRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.application_properties.get(key).map(String::as_str)
    }
}

/// The broker's reply to an [`AmqpRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct AmqpResponse {
    pub status_code: ResponseCode,
    pub status_description: Option<String>,
    pub properties: HashMap<String, String>,
}

impl AmqpResponse {
    pub fn new(status_code: ResponseCode) -> Self {
        Self {
            status_code,
            status_description: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.status_description = Some(description.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn description(&self) -> &str {
        self.status_description.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_both_ways() {
        for status in [200, 202, 204, 400, 401, 403, 404, 408, 409, 410, 429, 500, 503, 418] {
            assert_eq!(ResponseCode::from_status(status).status(), status);
        }
        assert_eq!(ResponseCode::from_status(418), ResponseCode::Other(418));
    }

    #[test]
    fn success_and_retriable_classification() {
        assert!(ResponseCode::Accepted.is_success());
        assert!(!ResponseCode::Unauthorized.is_success());
        assert!(ResponseCode::ServiceUnavailable.is_retriable());
        assert!(!ResponseCode::NotFound.is_retriable());
    }

    #[test]
    fn display_shows_name_and_status() {
        assert_eq!(ResponseCode::Unauthorized.to_string(), "Unauthorized (401)");
    }
}
