//! Trace propagation for enqueue and publish.

use tracing::Span;
use tracing::field::Empty;

use brushwork_events::broker::headers;
use brushwork_events::{Headers, TraceContext, trace};

use crate::message::OutboxMessage;

/// Injected tracing dependency of the enqueuer and dispatcher.
pub trait TraceSink: Send + Sync {
    /// The producer's ambient context, captured onto the outbox row.
    fn current_context(&self) -> Option<TraceContext>;

    /// Start the span for publishing `message`. The span belongs to a new trace
    /// and records `link` as a link rather than a parent.
    fn start_publish_span(&self, message: &OutboxMessage, link: Option<&TraceContext>)
    -> PublishSpan;
}

/// Span and propagated context of one publish.
#[derive(Debug, Clone)]
pub struct PublishSpan {
    span: Span,
    context: Option<TraceContext>,
}

impl PublishSpan {
    pub fn new(span: Span, context: Option<TraceContext>) -> Self {
        Self { span, context }
    }

    pub fn disabled() -> Self {
        Self {
            span: Span::none(),
            context: None,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn context(&self) -> Option<&TraceContext> {
        self.context.as_ref()
    }

    /// Write `traceparent` and `tracestate` for this span into `headers`.
    pub fn inject(&self, out: &mut Headers) {
        let Some(ctx) = &self.context else {
            return;
        };
        out.insert(headers::TRACEPARENT.to_string(), ctx.to_traceparent());
        if let Some(state) = ctx.state() {
            out.insert(headers::TRACESTATE.to_string(), state.to_string());
        }
    }
}

/// Reads the task-local context set by [`trace::scope`] and emits
/// `outbox.publish` spans through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn current_context(&self) -> Option<TraceContext> {
        trace::current()
    }

    fn start_publish_span(
        &self,
        message: &OutboxMessage,
        link: Option<&TraceContext>,
    ) -> PublishSpan {
        let context = TraceContext::new_root();

        let span = tracing::info_span!(
            "outbox.publish",
            message_id = %message.id,
            event = %message.name,
            version = message.version,
            trace_id = %context.trace_id_hex(),
            span_id = %context.span_id_hex(),
            link.trace_id = Empty,
            link.span_id = Empty,
        );
        if let Some(link) = link {
            span.record("link.trace_id", link.trace_id_hex().as_str());
            span.record("link.span_id", link.span_id_hex().as_str());
        }

        PublishSpan::new(span, Some(context))
    }
}

/// Disables propagation entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn current_context(&self) -> Option<TraceContext> {
        None
    }

    fn start_publish_span(
        &self,
        _message: &OutboxMessage,
        _link: Option<&TraceContext>,
    ) -> PublishSpan {
        PublishSpan::disabled()
    }
}
