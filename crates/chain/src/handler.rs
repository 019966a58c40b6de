use std::sync::Arc;

use hopline_core::chain::ChainRequest;
use hopline_core::error::{HoplineError, Result};
use hopline_core::recorder::SpanRecorder;
use hopline_core::span::{AttrValue, Span};
use serde_json::{Map, Value, json};

/// Business logic of one hop. Returns the fields this hop contributes to
/// the payload; validation failures come back as `InvalidRequest` and turn
/// into a 400 at the HTTP edge.
pub trait ServiceHandler: Send + Sync {
    fn apply(
        &self,
        request: &mut ChainRequest,
        span: &mut Span,
        recorder: &SpanRecorder,
    ) -> Result<Map<String, Value>>;
}

pub fn handler_for(service: &str) -> Arc<dyn ServiceHandler> {
    match service {
        "user-service" => Arc::new(UserHandler),
        "order-service" => Arc::new(OrderHandler),
        "audit-service" => Arc::new(AuditHandler),
        _ => Arc::new(RelayHandler),
    }
}

/// Entry validation: the external request must identify a user and an
/// action before anything else runs.
pub struct UserHandler;

impl ServiceHandler for UserHandler {
    fn apply(
        &self,
        request: &mut ChainRequest,
        span: &mut Span,
        recorder: &SpanRecorder,
    ) -> Result<Map<String, Value>> {
        let (user_id, action) = request.require_user_fields()?;
        if action.is_empty() {
            return Err(HoplineError::InvalidRequest("action cannot be empty".into()));
        }

        recorder.set_attributes(
            span,
            [
                ("user.id", AttrValue::Int(user_id)),
                ("request.action", AttrValue::from(action)),
            ],
        );
        recorder.add_event(span, "user validated", [("user.id", AttrValue::Int(user_id))]);

        let mut out = Map::new();
        out.insert("user_name".into(), Value::from(format!("user-{user_id:04}")));
        Ok(out)
    }
}

/// Creates the order for the request. Values are derived from the trace id
/// so a given trace always produces the same order.
pub struct OrderHandler;

impl ServiceHandler for OrderHandler {
    fn apply(
        &self,
        request: &mut ChainRequest,
        span: &mut Span,
        recorder: &SpanRecorder,
    ) -> Result<Map<String, Value>> {
        let user_id = request
            .user_id
            .ok_or_else(|| HoplineError::InvalidRequest("user_id is required".into()))?;

        let seed = trace_seed(span.trace_id().as_str());
        let order_id = 2000 + (seed % 1000) as i64;
        // Totals stay inside 10.99..=299.99.
        let total_cents = 1099 + ((seed >> 16) % 28901) as i64;
        let order_total = total_cents as f64 / 100.0;
        let items = order_items(seed);

        recorder.set_attributes(
            span,
            [
                ("order.id", AttrValue::Int(order_id)),
                ("order.total", AttrValue::Float(order_total)),
                ("order.user_id", AttrValue::Int(user_id)),
            ],
        );
        recorder.add_event(
            span,
            "order created",
            [
                ("order.id", AttrValue::Int(order_id)),
                ("order.item_count", AttrValue::Int(items.len() as i64)),
            ],
        );

        let mut out = Map::new();
        out.insert("order_id".into(), Value::from(order_id));
        out.insert("order_total".into(), Value::from(order_total));
        out.insert("order_items".into(), Value::Array(items));
        Ok(out)
    }
}

/// Terminal compliance check over what the upstream hops produced.
pub struct AuditHandler;

impl ServiceHandler for AuditHandler {
    fn apply(
        &self,
        request: &mut ChainRequest,
        span: &mut Span,
        recorder: &SpanRecorder,
    ) -> Result<Map<String, Value>> {
        recorder.add_event::<&str>(span, "compliance checks started", []);

        let user_id = request
            .user_id
            .ok_or_else(|| HoplineError::InvalidRequest("user_id is required for audit".into()))?;
        let order_id = request
            .data_i64("order_id")
            .ok_or_else(|| HoplineError::InvalidRequest("order_id is required for audit".into()))?;
        let order_total = request
            .data_f64("order_total")
            .ok_or_else(|| HoplineError::InvalidRequest("order_total is required for audit".into()))?;
        if order_total <= 0.0 {
            return Err(HoplineError::InvalidRequest(format!(
                "order_total must be positive, got {order_total}"
            )));
        }

        recorder.set_attributes(
            span,
            [
                ("audit.user_id", AttrValue::Int(user_id)),
                ("audit.order_id", AttrValue::Int(order_id)),
                ("audit.order_total", AttrValue::Float(order_total)),
            ],
        );
        recorder.add_event(
            span,
            "compliance checks passed",
            [("audit.order_id", AttrValue::Int(order_id))],
        );

        let mut out = Map::new();
        out.insert("audit_status".into(), Value::from("passed"));
        out.insert(
            "services_completed".into(),
            Value::from(request.service_chain.len()),
        );
        Ok(out)
    }
}

/// Default for chain positions with no dedicated business logic.
pub struct RelayHandler;

impl ServiceHandler for RelayHandler {
    fn apply(
        &self,
        _request: &mut ChainRequest,
        span: &mut Span,
        recorder: &SpanRecorder,
    ) -> Result<Map<String, Value>> {
        recorder.add_event::<&str>(span, "request relayed", []);
        Ok(Map::new())
    }
}

fn trace_seed(trace_hex: &str) -> u64 {
    // FNV-1a over the hex form; stable across runs and processes.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in trace_hex.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn order_items(seed: u64) -> Vec<Value> {
    if seed % 10 < 6 {
        vec![json!({"sku": "widget-a", "quantity": 1})]
    } else {
        vec![json!({"sku": "widget-b", "quantity": 2})]
    }
}
