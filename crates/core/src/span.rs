use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::context::TraceContext;
use crate::ids::{SpanId, TraceId};

/// Scalar attribute value. Variant order matters: serde tries untagged
/// variants in declaration order, and integers must win over floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub ts: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpanStatus {
    Ok,
    Error { reason: String },
}

impl SpanStatus {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error { .. } => "ERROR",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Error { reason } => Some(reason),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// One unit of work at one hop, open for mutation until ended. Construction
/// and lifecycle transitions go through `SpanRecorder`; only reads are public.
#[derive(Debug, Clone)]
pub struct Span {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    service: String,
    operation: String,
    sampled: bool,
    start_ts: DateTime<Utc>,
    started: Instant,
    attributes: BTreeMap<String, AttrValue>,
    events: Vec<SpanEvent>,
    closed: Option<ClosedSpan>,
}

impl Span {
    pub(crate) fn open(ctx: &TraceContext, service: &str, operation: &str) -> Self {
        Self {
            trace_id: ctx.trace_id.clone(),
            span_id: SpanId::generate(),
            parent_span_id: ctx.parent_span_id.clone(),
            service: service.to_string(),
            operation: operation.to_string(),
            sampled: ctx.sampled,
            start_ts: Utc::now(),
            started: Instant::now(),
            attributes: BTreeMap::new(),
            events: Vec::new(),
            closed: None,
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn span_id(&self) -> &SpanId {
        &self.span_id
    }

    pub fn parent_span_id(&self) -> Option<&SpanId> {
        self.parent_span_id.as_ref()
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn start_ts(&self) -> DateTime<Utc> {
        self.start_ts
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttrValue> {
        &self.attributes
    }

    pub fn events(&self) -> &[SpanEvent] {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub(crate) fn merge_attributes(
        &mut self,
        pairs: impl IntoIterator<Item = (String, AttrValue)>,
    ) {
        for (key, value) in pairs {
            self.attributes.insert(key, value);
        }
    }

    pub(crate) fn push_event(&mut self, event: SpanEvent) {
        self.events.push(event);
    }

    pub(crate) fn closed(&self) -> Option<&ClosedSpan> {
        self.closed.as_ref()
    }

    /// Freezes the span. The monotonic clock drives the duration so a wall
    /// clock step can never produce a negative interval; `end_ts` is derived
    /// from `start_ts` plus that duration.
    pub(crate) fn close(&mut self, status: SpanStatus) -> ClosedSpan {
        let duration_ms = self.started.elapsed().as_millis() as i64;
        let closed = ClosedSpan {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
            service: self.service.clone(),
            operation: self.operation.clone(),
            start_ts: self.start_ts,
            end_ts: self.start_ts + Duration::milliseconds(duration_ms),
            duration_ms,
            status,
            attributes: self.attributes.clone(),
            events: self.events.clone(),
        };
        self.closed = Some(closed.clone());
        closed
    }
}

/// Immutable export form of an ended span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub service: String,
    pub operation: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, AttrValue>,
    pub events: Vec<SpanEvent>,
}

impl ClosedSpan {
    pub fn attrs_json(&self) -> String {
        serde_json::to_string(&self.attributes).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn events_json(&self) -> String {
        serde_json::to_string(&self.events).unwrap_or_else(|_| "[]".to_string())
    }
}
