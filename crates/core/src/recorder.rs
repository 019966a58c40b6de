use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::context::TraceContext;
use crate::span::{AttrValue, ClosedSpan, Span, SpanEvent, SpanStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    Accepted,
    Rejected,
}

/// Hands ended spans off to wherever they go next. Implementations must not
/// block the caller; a slow backend reports `Rejected` instead of waiting.
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: &ClosedSpan) -> ExportOutcome;
}

/// Accepts and discards everything. Useful when tracing output is not wired
/// up, e.g. in handler unit tests.
#[derive(Debug, Default)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn export(&self, _span: &ClosedSpan) -> ExportOutcome {
        ExportOutcome::Accepted
    }
}

/// Span lifecycle front door. All mutations run through the recorder so
/// misuse (writes after end, a second end, a rejected export) degrades to a
/// warning and a counter bump instead of touching the request path.
#[derive(Clone)]
pub struct SpanRecorder {
    exporter: Arc<dyn SpanExporter>,
    suppressed: Arc<AtomicU64>,
}

impl SpanRecorder {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            exporter,
            suppressed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopExporter))
    }

    pub fn start(&self, ctx: &TraceContext, service: &str, operation: &str) -> Span {
        Span::open(ctx, service, operation)
    }

    /// Merges attributes into the span; a repeated key overwrites the
    /// previous value.
    pub fn set_attributes<K>(&self, span: &mut Span, pairs: impl IntoIterator<Item = (K, AttrValue)>)
    where
        K: Into<String>,
    {
        if self.reject_if_closed(span, "set_attributes") {
            return;
        }
        span.merge_attributes(pairs.into_iter().map(|(k, v)| (k.into(), v)));
    }

    pub fn add_event<K>(&self, span: &mut Span, name: &str, pairs: impl IntoIterator<Item = (K, AttrValue)>)
    where
        K: Into<String>,
    {
        if self.reject_if_closed(span, "add_event") {
            return;
        }
        let attributes: BTreeMap<String, AttrValue> =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        span.push_event(SpanEvent {
            ts: Utc::now(),
            name: name.to_string(),
            attributes,
        });
    }

    /// Ends the span and exports it once. A second call is a no-op that
    /// returns the original closed form.
    pub fn end(&self, span: &mut Span, status: SpanStatus) -> ClosedSpan {
        if let Some(closed) = span.closed() {
            self.suppress(span, "end", "span already ended");
            return closed.clone();
        }
        let closed = span.close(status);
        if span.sampled() && self.exporter.export(&closed) == ExportOutcome::Rejected {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                trace_id = %closed.trace_id,
                span_id = %closed.span_id,
                "span export rejected"
            );
        }
        closed
    }

    /// Count of tracing operations dropped instead of surfacing to callers.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    fn reject_if_closed(&self, span: &Span, op: &str) -> bool {
        if span.is_closed() {
            self.suppress(span, op, "span already ended");
            return true;
        }
        false
    }

    fn suppress(&self, span: &Span, op: &str, why: &str) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            trace_id = %span.trace_id(),
            span_id = %span.span_id(),
            op,
            "{why}"
        );
    }
}
