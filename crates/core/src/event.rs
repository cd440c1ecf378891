//! The `order-received` business event.

use serde::{Deserialize, Serialize};

use crate::reference::OrderReference;

/// An order has been received and needs downstream processing.
///
/// Carries only the URI of the order; handlers resolve the rest. Immutable
/// once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderReceived {
    reference_uri: String,
}

impl OrderReceived {
    pub fn new(reference_uri: impl Into<String>) -> Self {
        Self {
            reference_uri: reference_uri.into(),
        }
    }

    pub fn for_order(reference: &OrderReference) -> Self {
        Self::new(reference.uri())
    }

    pub fn reference_uri(&self) -> &str {
        &self.reference_uri
    }

    /// Same event with surrounding whitespace removed from the URI.
    pub fn trimmed(self) -> Self {
        let trimmed = self.reference_uri.trim();
        if trimmed.len() == self.reference_uri.len() {
            return self;
        }
        Self::new(trimmed)
    }
}
