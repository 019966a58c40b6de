use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use hopline_core::chain::{ChainRequest, TraceRecord};
use hopline_core::ids::{SpanId, TraceId};
use hopline_core::span::{AttrValue, ClosedSpan, SpanStatus};
use serde_json::json;

pub fn base_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// Deterministic well-formed trace id; `seed` must be nonzero.
pub fn trace_id(seed: u64) -> TraceId {
    TraceId::parse(&format!("{seed:032x}")).unwrap()
}

/// Deterministic well-formed span id; `seed` must be nonzero.
pub fn span_id(seed: u64) -> SpanId {
    SpanId::parse(&format!("{seed:016x}")).unwrap()
}

pub fn checkout_request() -> ChainRequest {
    ChainRequest {
        user_id: Some(1001),
        action: Some("checkout".to_string()),
        service_chain: Vec::new(),
        data: serde_json::Map::new(),
    }
}

pub fn sample_record(trace: &TraceId, service: &str, offset_ms: i64) -> TraceRecord {
    TraceRecord {
        trace_id: trace.as_str().to_string(),
        service: service.to_string(),
        request_ts: base_ts() + Duration::milliseconds(offset_ms),
        request_json: serde_json::to_string(&checkout_request()).unwrap(),
        response_json: json!({
            "status": "ok",
            "trace_id": trace.as_str(),
            "service": service,
            "message": "chain completed",
        })
        .to_string(),
        processing_time_ms: 12,
    }
}

/// One record per hop of the default chain, ordered by request time.
pub fn sample_chain_records(trace: &TraceId) -> Vec<TraceRecord> {
    vec![
        sample_record(trace, "user-service", 0),
        sample_record(trace, "order-service", 5),
        sample_record(trace, "audit-service", 10),
    ]
}

pub fn sample_span(
    trace: &TraceId,
    span: &SpanId,
    parent: Option<&SpanId>,
    service: &str,
    status: SpanStatus,
) -> ClosedSpan {
    let mut attributes = BTreeMap::new();
    attributes.insert("request.action".to_string(), AttrValue::from("checkout"));
    ClosedSpan {
        trace_id: trace.clone(),
        span_id: span.clone(),
        parent_span_id: parent.cloned(),
        service: service.to_string(),
        operation: "process_request".to_string(),
        start_ts: base_ts(),
        end_ts: base_ts() + Duration::milliseconds(25),
        duration_ms: 25,
        status,
        attributes,
        events: Vec::new(),
    }
}
