//! Core identifier types for the BLB controller.
//!
//! Cloud resources are addressed by opaque vendor strings (`lb-…`, `i-…`,
//! `vpc-…`). Each kind gets its own newtype so a subnet ID can never be passed
//! where a load balancer ID is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length accepted for any vendor identifier.
const MAX_ID_LEN: usize = 128;

fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            max: MAX_ID_LEN,
            got: s.len(),
        });
    }
    if s.chars().any(char::is_whitespace) {
        return Err(IdError::Whitespace);
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier, validating its shape.
            ///
            /// # Errors
            ///
            /// Returns an error if the value is empty, too long or contains whitespace.
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                validate(&value)?;
                Ok(Self(value))
            }

            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of the Kubernetes cluster as known to the cloud vendor.
    ClusterId
}

string_id! {
    /// Identifier of a managed load balancer (BLB).
    LoadBalancerId
}

string_id! {
    /// Identifier of a compute instance backing a cluster node.
    InstanceId
}

string_id! {
    /// Identifier of a VPC.
    VpcId
}

string_id! {
    /// Identifier of a VPC subnet.
    SubnetId
}

string_id! {
    /// Identifier of a VPC route table.
    RouteTableId
}

string_id! {
    /// Identifier of a single route-table entry.
    RouteRuleId
}

/// An idempotency token attached to create requests.
///
/// The vendor API deduplicates creations carrying the same token, so a retried
/// request after a lost response does not produce a second resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientToken(uuid::Uuid);

impl ClientToken {
    /// Generate a new random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a token from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ClientToken {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientToken({})", self.0)
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ClientToken {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientToken> for String {
    fn from(token: ClientToken) -> Self {
        token.0.to_string()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier is empty.
    #[error("identifier is empty")]
    Empty,

    /// The identifier exceeds the maximum length.
    #[error("identifier too long: max {max} characters, got {got}")]
    TooLong {
        /// The maximum number of characters.
        max: usize,
        /// The actual number of characters.
        got: usize,
    },

    /// The identifier contains whitespace.
    #[error("identifier contains whitespace")]
    Whitespace,

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_balancer_id_accepts_vendor_ids() {
        let id = LoadBalancerId::new("lb-0a1b2c3d").unwrap();
        assert_eq!(id.as_str(), "lb-0a1b2c3d");
        assert_eq!(id.to_string(), "lb-0a1b2c3d");
        assert_eq!(format!("{id:?}"), "LoadBalancerId(lb-0a1b2c3d)");
    }

    #[test]
    fn empty_id_rejected() {
        assert_eq!(InstanceId::new(""), Err(IdError::Empty));
    }

    #[test]
    fn whitespace_rejected() {
        assert_eq!(SubnetId::new("sbn 1"), Err(IdError::Whitespace));
    }

    #[test]
    fn overlong_id_rejected() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        assert!(matches!(
            VpcId::new(long),
            Err(IdError::TooLong { max: MAX_ID_LEN, .. })
        ));
    }

    #[test]
    fn instance_id_serde_json() {
        let id = InstanceId::new("i-abc").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"i-abc\"");
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_id_fails_deserialization() {
        let parsed: Result<RouteRuleId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn client_token_unique() {
        assert_ne!(ClientToken::generate(), ClientToken::generate());
    }

    #[test]
    fn client_token_parse() {
        let token = ClientToken::generate();
        let parsed: ClientToken = token.to_string().parse().unwrap();
        assert_eq!(token, parsed);
        assert!(matches!(
            "not-a-uuid".parse::<ClientToken>(),
            Err(IdError::InvalidUuid)
        ));
    }
}
