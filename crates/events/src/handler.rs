use std::sync::Arc;

/// Result of handling one event. Every handler invocation yields exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Success => "success",
            ProcessingOutcome::TransientFailure(_) => "transient_failure",
            ProcessingOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }

    pub fn failure(kind: FailureKind, cause: impl Into<String>) -> Self {
        match kind {
            FailureKind::Transient => ProcessingOutcome::TransientFailure(cause.into()),
            FailureKind::Permanent => ProcessingOutcome::PermanentFailure(cause.into()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Worth another attempt on a slower tier.
    Transient,
    /// Retrying cannot help; surface and move on.
    Permanent,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// Business logic applied to each decoded event.
///
/// Handlers must not retry on their own: escalation across tiers is the
/// retry mechanism. Side effects may run more than once (at-least-once).
pub trait EventHandler<E>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn handle(&self, event: &E) -> Result<(), Self::Error>;
}

impl<E, H> EventHandler<E> for Arc<H>
where
    H: EventHandler<E> + ?Sized,
{
    type Error = H::Error;

    fn handle(&self, event: &E) -> Result<(), Self::Error> {
        (**self).handle(event)
    }
}

/// Business policy deciding whether a handler error is worth escalating.
///
/// Must be pure: the same error always classifies the same way.
pub trait FailureClassifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> FailureKind;
}

impl<E, F> FailureClassifier<E> for F
where
    F: Fn(&E) -> FailureKind + Send + Sync,
{
    fn classify(&self, error: &E) -> FailureKind {
        self(error)
    }
}

/// Errors that know whether they are explicitly retryable.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Default policy: errors tagged retryable are transient, everything else
/// is permanent.
#[derive(Debug, Default, Copy, Clone)]
pub struct RetryableClassifier;

impl<E> FailureClassifier<E> for RetryableClassifier
where
    E: Retryable,
{
    fn classify(&self, error: &E) -> FailureKind {
        if error.is_retryable() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        }
    }
}
