//! Event traits the pipeline relies on.

use orderflow_core::OrderReceived;

/// An event that identifies the business object it is about.
///
/// The reference is what operators grep for, so every log line about an
/// event carries it.
pub trait ReferencedEvent {
    fn reference_uri(&self) -> &str;

    /// Normalised copy used when the event is re-encoded for another tier.
    fn for_republish(self) -> Self
    where
        Self: Sized,
    {
        self
    }
}

impl ReferencedEvent for OrderReceived {
    fn reference_uri(&self) -> &str {
        OrderReceived::reference_uri(self)
    }

    fn for_republish(self) -> Self {
        self.trimmed()
    }
}
