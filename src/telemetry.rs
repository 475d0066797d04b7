//! Pipeline counters.
//!
//! Backed by the `metrics` facade when the `metrics` feature is enabled and
//! compiled to nothing otherwise.

use crate::topic::Topic;

/// How a dispatched message ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Forwarded,
    /// Handled, but the follow-on publish was dropped
    PublishDropped,
    Completed,
    Failed,
    Unroutable,
}

impl DispatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchOutcome::Forwarded => "forwarded",
            DispatchOutcome::PublishDropped => "publish_dropped",
            DispatchOutcome::Completed => "completed",
            DispatchOutcome::Failed => "failed",
            DispatchOutcome::Unroutable => "unroutable",
        }
    }
}

#[cfg(feature = "metrics")]
pub fn record_dispatch(topic: &str, outcome: DispatchOutcome) {
    ::metrics::counter!(
        "pixelrelay_messages_total",
        "topic" => topic.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn record_dispatch(_topic: &str, _outcome: DispatchOutcome) {}

#[cfg(feature = "metrics")]
pub fn record_publish(topic: Topic, delivered: bool) {
    ::metrics::counter!(
        "pixelrelay_publishes_total",
        "topic" => topic.as_str(),
        "outcome" => if delivered { "delivered" } else { "dropped" }
    )
    .increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn record_publish(_topic: Topic, _delivered: bool) {}
