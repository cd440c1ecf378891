//! Order references and the URIs derived from them.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Path prefix under which orders are addressed.
pub const ORDERS_URI_PREFIX: &str = "/orders/";

/// Reference of a single order (e.g. `ORD-123456-123456`).
///
/// Accepts ASCII letters, digits, `-` and `_` only, so that the derived URI
/// always has exactly one path segment after [`ORDERS_URI_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderReference(String);

impl OrderReference {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_reference("order reference is empty"));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(DomainError::invalid_reference(format!(
                "order reference {trimmed:?} contains unsupported character {bad:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URI identifying this order, e.g. `/orders/ORD-1`.
    pub fn uri(&self) -> String {
        format!("{ORDERS_URI_PREFIX}{}", self.0)
    }

    /// Extract the reference from an order URI produced by [`OrderReference::uri`].
    pub fn from_uri(uri: &str) -> DomainResult<Self> {
        let rest = uri.trim().strip_prefix(ORDERS_URI_PREFIX).ok_or_else(|| {
            DomainError::invalid_reference(format!("{uri:?} is not an order URI"))
        })?;
        Self::parse(rest)
    }
}

impl core::fmt::Display for OrderReference {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderReference {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderReference {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderReference> for String {
    fn from(value: OrderReference) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_and_builds_uri() {
        let reference = OrderReference::parse("  ORD-1  ").unwrap();
        assert_eq!(reference.as_str(), "ORD-1");
        assert_eq!(reference.uri(), "/orders/ORD-1");
    }

    #[test]
    fn parse_rejects_empty_and_path_segments() {
        assert!(matches!(
            OrderReference::parse("   "),
            Err(DomainError::InvalidReference(_))
        ));
        assert!(OrderReference::parse("ORD-1/items").is_err());
        assert!(OrderReference::parse("ORD 1").is_err());
    }

    #[test]
    fn from_uri_requires_orders_prefix() {
        assert_eq!(
            OrderReference::from_uri("/orders/ORD-42").unwrap().as_str(),
            "ORD-42"
        );
        assert!(OrderReference::from_uri("/order/ORD-42").is_err());
        assert!(OrderReference::from_uri("/orders/").is_err());
    }

    #[test]
    fn serde_goes_through_validation() {
        let ok: OrderReference = serde_json::from_str("\"ORD-7\"").unwrap();
        assert_eq!(ok.as_str(), "ORD-7");
        assert!(serde_json::from_str::<OrderReference>("\"a/b\"").is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: any well-formed reference survives uri -> from_uri.
            #[test]
            fn uri_round_trips(raw in "[A-Za-z0-9_-]{1,40}") {
                let reference = OrderReference::parse(&raw).unwrap();
                let back = OrderReference::from_uri(&reference.uri()).unwrap();
                prop_assert_eq!(back, reference);
            }

            /// Property: a slash anywhere in the reference is rejected.
            #[test]
            fn slash_is_rejected(left in "[A-Z0-9]{0,10}", right in "[A-Z0-9]{0,10}") {
                let raw = format!("{left}/{right}");
                prop_assert!(OrderReference::parse(&raw).is_err());
            }
        }
    }
}
