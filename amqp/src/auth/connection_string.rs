use crate::common::{AmqpError, AmqpResult};

/// Parsed form of a namespace or entity connection string.
///
/// Accepts the usual `Key=Value;` layout:
/// `Endpoint=sb://my-ns.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=...;EntityPath=hub`
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionStringProperties {
    endpoint: String,
    fully_qualified_namespace: String,
    shared_access_key_name: Option<String>,
    shared_access_key: Option<String>,
    shared_access_signature: Option<String>,
    entity_path: Option<String>,
}

impl ConnectionStringProperties {
    pub fn parse(connection_string: &str) -> AmqpResult<Self> {
        if connection_string.trim().is_empty() {
            return Err(AmqpError::InvalidConnectionString(
                "Connection string cannot be empty".to_string(),
            ));
        }

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut signature = None;
        let mut entity_path = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let Some((name, value)) = part.split_once('=') else {
                return Err(AmqpError::InvalidConnectionString(format!(
                    "Malformed segment '{part}'"
                )));
            };

            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim().to_string()),
                "sharedaccesskeyname" => key_name = Some(value.trim().to_string()),
                "sharedaccesskey" => key = Some(value.trim().to_string()),
                "sharedaccesssignature" => signature = Some(value.trim().to_string()),
                "entitypath" => entity_path = Some(value.trim().to_string()),
                other => log::debug!("Ignoring unknown connection string key '{other}'"),
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            AmqpError::InvalidConnectionString("Missing Endpoint in connection string".to_string())
        })?;

        // Extract host from endpoint like "sb://namespace.servicebus.windows.net/"
        let host = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&endpoint)
            .trim_end_matches('/')
            .to_string();
        if host.is_empty() {
            return Err(AmqpError::InvalidConnectionString(format!(
                "Endpoint '{endpoint}' does not name a host"
            )));
        }

        match (&key_name, &key, &signature) {
            (Some(_), Some(_), _) | (None, None, Some(_)) => {}
            (Some(_), None, _) => {
                return Err(AmqpError::InvalidConnectionString(
                    "Missing SharedAccessKey in connection string".to_string(),
                ));
            }
            (None, Some(_), _) => {
                return Err(AmqpError::InvalidConnectionString(
                    "Missing SharedAccessKeyName in connection string".to_string(),
                ));
            }
            (None, None, None) => {
                return Err(AmqpError::InvalidConnectionString(
                    "Connection string carries neither a shared access key nor a signature"
                        .to_string(),
                ));
            }
        }

        Ok(Self {
            endpoint,
            fully_qualified_namespace: host,
            shared_access_key_name: key_name,
            shared_access_key: key,
            shared_access_signature: signature,
            entity_path: entity_path.filter(|path| !path.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn fully_qualified_namespace(&self) -> &str {
        &self.fully_qualified_namespace
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    pub fn shared_access_key(&self) -> Option<&str> {
        self.shared_access_key.as_deref()
    }

    pub fn shared_access_signature(&self) -> Option<&str> {
        self.shared_access_signature.as_deref()
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_based_connection_string() {
        let parsed = ConnectionStringProperties::parse(
            "Endpoint=sb://my-ns.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0;EntityPath=orders",
        )
        .unwrap();

        assert_eq!(parsed.fully_qualified_namespace(), "my-ns.servicebus.windows.net");
        assert_eq!(parsed.shared_access_key_name(), Some("RootManageSharedAccessKey"));
        assert_eq!(parsed.shared_access_key(), Some("c2VjcmV0"));
        assert_eq!(parsed.entity_path(), Some("orders"));
    }

    #[test]
    fn key_values_may_contain_equals_signs() {
        let parsed = ConnectionStringProperties::parse(
            "endpoint=sb://ns.servicebus.windows.net;sharedaccesskeyname=k;sharedaccesskey=abc==",
        )
        .unwrap();
        assert_eq!(parsed.shared_access_key(), Some("abc=="));
        assert_eq!(parsed.entity_path(), None);
    }

    #[test]
    fn rejects_incomplete_credentials() {
        let missing_key = ConnectionStringProperties::parse(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=root",
        );
        assert!(matches!(
            missing_key,
            Err(AmqpError::InvalidConnectionString(_))
        ));

        let missing_endpoint =
            ConnectionStringProperties::parse("SharedAccessKeyName=root;SharedAccessKey=abc");
        assert!(missing_endpoint.is_err());
        assert!(ConnectionStringProperties::parse("   ").is_err());
    }

    #[test]
    fn accepts_precomputed_signature() {
        let parsed = ConnectionStringProperties::parse(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessSignature=SharedAccessSignature sr=x&sig=y&se=1&skn=k",
        )
        .unwrap();
        assert!(parsed.shared_access_signature().is_some());
    }
}
