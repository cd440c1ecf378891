//! Business handler for `order-received` events.

use thiserror::Error;
use tracing::info;

use orderflow_core::{OrderReceived, OrderReference};
use orderflow_events::{EventHandler, Retryable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderHandlingError {
    #[error("unrecognised order reference URI {0:?}")]
    UnknownReferenceUri(String),
}

impl Retryable for OrderHandlingError {
    fn is_retryable(&self) -> bool {
        match self {
            OrderHandlingError::UnknownReferenceUri(_) => false,
        }
    }
}

/// Accepts `/orders/<reference>` URIs; anything else cannot be routed.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderReceivedHandler;

impl EventHandler<OrderReceived> for OrderReceivedHandler {
    type Error = OrderHandlingError;

    fn handle(&self, event: &OrderReceived) -> Result<(), OrderHandlingError> {
        let uri = event.reference_uri();
        let reference = OrderReference::from_uri(uri.trim())
            .map_err(|_| OrderHandlingError::UnknownReferenceUri(uri.to_string()))?;

        info!(reference = %reference, uri, "processing received order");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use orderflow_events::{FailureClassifier, FailureKind, RetryableClassifier};

    use super::*;

    #[test]
    fn accepts_order_uris() {
        let handler = OrderReceivedHandler;
        assert!(handler.handle(&OrderReceived::new("/orders/ORD-123456")).is_ok());
        assert!(handler.handle(&OrderReceived::new(" /orders/ORD-1 ")).is_ok());
    }

    #[test]
    fn other_uris_fail_permanently() {
        let err = OrderReceivedHandler
            .handle(&OrderReceived::new("/order/ORDER-12345"))
            .unwrap_err();
        assert_eq!(
            err,
            OrderHandlingError::UnknownReferenceUri("/order/ORDER-12345".to_string())
        );
        assert_eq!(RetryableClassifier.classify(&err), FailureKind::Permanent);
    }
}
