//! Authority configuration

use const_oid::ObjectIdentifier;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy OID stamped into tokens when the request names none
pub const DEFAULT_POLICY_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.2");

/// Settings for issuing tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorityConfig {
    /// Default TSA policy
    #[serde(with = "oid_string")]
    pub policy_oid: ObjectIdentifier,
    /// Accuracy claimed in every token
    #[serde(with = "millis")]
    pub accuracy: Duration,
    /// Upper bound on signing when the caller gives no deadline
    #[serde(with = "millis")]
    pub signing_timeout: Duration,
    /// Put the leaf subject in the TSTInfo `tsa` field
    pub include_tsa_name: bool,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            policy_oid: DEFAULT_POLICY_OID,
            accuracy: Duration::from_secs(1),
            signing_timeout: Duration::from_secs(30),
            include_tsa_name: true,
        }
    }
}

impl AuthorityConfig {
    pub fn with_policy_oid(mut self, oid: ObjectIdentifier) -> Self {
        self.policy_oid = oid;
        self
    }

    pub fn with_accuracy(mut self, accuracy: Duration) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_signing_timeout(mut self, timeout: Duration) -> Self {
        self.signing_timeout = timeout;
        self
    }

    pub fn with_tsa_name(mut self, include: bool) -> Self {
        self.include_tsa_name = include;
        self
    }
}

mod oid_string {
    use const_oid::ObjectIdentifier;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(oid: &ObjectIdentifier, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(oid)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ObjectIdentifier, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectIdentifier::new(&s).map_err(serde::de::Error::custom)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthorityConfig::default();
        assert_eq!(config.policy_oid.to_string(), "1.3.6.1.4.1.57264.2");
        assert_eq!(config.accuracy, Duration::from_secs(1));
        assert_eq!(config.signing_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: AuthorityConfig =
            serde_json::from_str(r#"{"policyOid":"1.2.3","accuracy":500}"#).unwrap();
        assert_eq!(config.policy_oid, ObjectIdentifier::new_unwrap("1.2.3"));
        assert_eq!(config.accuracy, Duration::from_millis(500));
        assert_eq!(config.signing_timeout, Duration::from_secs(30));
        assert!(config.include_tsa_name);
    }

    #[test]
    fn test_invalid_oid_rejected() {
        assert!(serde_json::from_str::<AuthorityConfig>(r#"{"policyOid":"x.y"}"#).is_err());
    }
}
