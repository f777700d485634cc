//! The tool-span attribute contract.

use tracing::Span;

use butlers_core::ErrorClass;

/// Outcome attribute of a tool span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    /// Handler returned a result.
    Ok,
    /// Handler returned a classified error.
    Error,
    /// Handler parked the call pending human approval.
    PendingApproval,
}

impl ToolOutcome {
    /// The attribute value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::PendingApproval => "pending_approval",
        }
    }
}

/// Builder for the span every tool handler wraps execution in.
///
/// Only low-cardinality attributes become span fields; `outcome` and
/// `error_class` are recorded when the handler finishes.
#[derive(Debug)]
pub struct ToolSpan {
    span: Span,
}

impl ToolSpan {
    /// Open a span for one tool invocation.
    #[must_use]
    pub fn new(butler: &str, tool_name: &str) -> Self {
        let span = tracing::info_span!(
            "tool_call",
            butler = %butler,
            tool_name = %tool_name,
            outcome = tracing::field::Empty,
            trigger_source = tracing::field::Empty,
            error_class = tracing::field::Empty,
            source_channel = tracing::field::Empty,
        );
        Self { span }
    }

    /// Record the trigger source attribute.
    #[must_use]
    pub fn with_trigger_source(self, trigger_source: &str) -> Self {
        self.span.record("trigger_source", trigger_source);
        self
    }

    /// Record the source channel attribute.
    #[must_use]
    pub fn with_source_channel(self, source_channel: &str) -> Self {
        self.span.record("source_channel", source_channel);
        self
    }

    /// Record the terminal outcome.
    pub fn record_outcome(&self, outcome: ToolOutcome) {
        self.span.record("outcome", outcome.as_str());
    }

    /// Record the terminal outcome of a failed call.
    pub fn record_error(&self, class: ErrorClass) {
        self.span.record("outcome", ToolOutcome::Error.as_str());
        self.span.record("error_class", class.as_str());
    }

    /// Enter the span, returning a guard.
    #[must_use]
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    /// The underlying span, for instrumenting futures.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_attribute_values() {
        assert_eq!(ToolOutcome::Ok.as_str(), "ok");
        assert_eq!(ToolOutcome::Error.as_str(), "error");
        assert_eq!(ToolOutcome::PendingApproval.as_str(), "pending_approval");
    }

    #[test]
    fn span_builds_without_subscriber() {
        // Fields record as no-ops when no subscriber is installed.
        let span = ToolSpan::new("health", "trigger")
            .with_trigger_source("external")
            .with_source_channel("telegram");
        span.record_outcome(ToolOutcome::Ok);
        span.record_error(ErrorClass::Timeout);
        let _guard = span.enter();
    }
}
