use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use hopline_core::chain::{ChainRequest, ChainResponse, ChainStatus, TraceRecord};
use hopline_core::config::{ChainTopology, DownstreamPolicy, ServiceConfig, TimeoutPolicy};
use hopline_core::context::{SamplingPolicy, TraceContext};
use hopline_core::error::HoplineError;
use hopline_core::recorder::SpanRecorder;
use hopline_core::sink::PersistenceSink;
use hopline_core::span::{AttrValue, Span, SpanStatus};
use hopline_store::Store;
use serde_json::Value;
use tracing::warn;

use crate::dispatch::ChainDispatcher;
use crate::handler::ServiceHandler;

/// Everything one service needs to play its position in the chain. Shared
/// pieces (recorder, dispatcher, sink) are cloned across services; `store`
/// is set only on the service that answers trace queries.
pub struct ServiceState {
    pub service: ServiceConfig,
    pub topology: ChainTopology,
    pub recorder: SpanRecorder,
    pub dispatcher: ChainDispatcher,
    pub handler: Arc<dyn ServiceHandler>,
    pub sink: Arc<dyn PersistenceSink>,
    pub store: Option<Store>,
    pub forward_timeout: Duration,
    pub persist_budget: Duration,
    pub sampling: SamplingPolicy,
}

impl ServiceState {
    pub fn name(&self) -> &str {
        &self.service.name
    }
}

enum HopOutcome {
    Completed { downstream: Option<Box<ChainResponse>> },
    DegradedTimeout { reason: String },
    FailedTimeout { reason: String },
    AbsorbedDownstream { reason: String },
    FailedDownstream { status: u16, reason: String },
    Invalid { reason: String },
    Internal { reason: String },
}

/// Runs one hop end to end: resolve the inbound context, apply this
/// service's handler, forward once if there is a next hop, close the span,
/// persist the audit row. The returned body always carries the trace id,
/// whatever happened in between.
pub async fn process_hop(
    state: &ServiceState,
    header: Option<&str>,
    mut request: ChainRequest,
) -> (StatusCode, ChainResponse) {
    let started = Instant::now();
    let request_ts = Utc::now();
    let ctx = resolve_context(header, state.sampling);
    let mut span = state.recorder.start(&ctx, state.name(), "process_request");
    request.service_chain.push(state.name().to_string());

    let outcome = run_hop(state, &ctx, &mut span, &mut request).await;

    let mut data = request.data.clone();
    let (http_status, chain_status, message, downstream, span_status) = match outcome {
        HopOutcome::Completed { downstream } => {
            let degraded = downstream
                .as_deref()
                .is_some_and(|d| d.status != ChainStatus::Ok);
            let message = if state.topology.is_terminal(state.name()) {
                "chain completed".to_string()
            } else if degraded {
                "downstream degraded; partial result".to_string()
            } else {
                "hop completed".to_string()
            };
            let status = if degraded {
                ChainStatus::Degraded
            } else {
                ChainStatus::Ok
            };
            (StatusCode::OK, status, message, downstream, SpanStatus::Ok)
        }
        HopOutcome::DegradedTimeout { reason } => (
            StatusCode::OK,
            ChainStatus::Degraded,
            "downstream timeout; returning partial result".to_string(),
            None,
            SpanStatus::error(format!("downstream timeout: {reason}")),
        ),
        HopOutcome::FailedTimeout { reason } => (
            StatusCode::GATEWAY_TIMEOUT,
            ChainStatus::Error,
            format!("downstream timeout: {reason}"),
            None,
            SpanStatus::error(format!("downstream timeout: {reason}")),
        ),
        HopOutcome::AbsorbedDownstream { reason } => {
            data.insert("fallback_applied".into(), Value::Bool(true));
            (
                StatusCode::OK,
                ChainStatus::Ok,
                format!("downstream error absorbed: {reason}"),
                None,
                SpanStatus::Ok,
            )
        }
        HopOutcome::FailedDownstream { status, reason } => (
            StatusCode::BAD_GATEWAY,
            ChainStatus::Error,
            format!("downstream failure ({status}): {reason}"),
            None,
            SpanStatus::error(format!("downstream failure ({status}): {reason}")),
        ),
        HopOutcome::Invalid { reason } => (
            StatusCode::BAD_REQUEST,
            ChainStatus::Error,
            reason.clone(),
            None,
            SpanStatus::error(reason),
        ),
        HopOutcome::Internal { reason } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ChainStatus::Error,
            "internal error".to_string(),
            None,
            SpanStatus::error(reason),
        ),
    };

    let response = ChainResponse {
        status: chain_status,
        trace_id: ctx.trace_id.to_string(),
        service: state.name().to_string(),
        message,
        service_chain: request.service_chain.clone(),
        data,
        downstream,
        processing_time_ms: started.elapsed().as_millis() as i64,
    };

    state.recorder.end(&mut span, span_status);
    persist(state, &ctx, request_ts, &request, &response).await;

    (http_status, response)
}

async fn run_hop(
    state: &ServiceState,
    ctx: &TraceContext,
    span: &mut Span,
    request: &mut ChainRequest,
) -> HopOutcome {
    let contribution = match state.handler.apply(request, span, &state.recorder) {
        Ok(contribution) => contribution,
        Err(HoplineError::InvalidRequest(reason)) => return HopOutcome::Invalid { reason },
        Err(e) => {
            return HopOutcome::Internal {
                reason: e.to_string(),
            };
        }
    };
    for (key, value) in contribution {
        request.data.insert(key, value);
    }

    let Some(next) = state.topology.next_hop(state.name()) else {
        return HopOutcome::Completed { downstream: None };
    };

    let fwd_ctx = ctx.extend(span.span_id().clone());
    state.recorder.add_event(
        span,
        "forwarding downstream",
        [("peer.service", AttrValue::from(next.name.as_str()))],
    );

    match state
        .dispatcher
        .forward(&next.listen_addr, request, &fwd_ctx, state.forward_timeout)
        .await
    {
        Ok(downstream) => {
            state.recorder.set_attributes(
                span,
                [("downstream.service", AttrValue::from(downstream.service.as_str()))],
            );
            HopOutcome::Completed {
                downstream: Some(Box::new(downstream)),
            }
        }
        Err(HoplineError::Timeout(reason)) => {
            warn!(trace_id = %ctx.trace_id, next = %next.name, %reason, "downstream timeout");
            state.recorder.add_event(
                span,
                "downstream timeout",
                [("peer.service", AttrValue::from(next.name.as_str()))],
            );
            match state.service.on_timeout {
                TimeoutPolicy::Degrade => HopOutcome::DegradedTimeout { reason },
                TimeoutPolicy::Propagate => HopOutcome::FailedTimeout { reason },
            }
        }
        Err(HoplineError::Downstream { status, reason }) => {
            warn!(trace_id = %ctx.trace_id, next = %next.name, status, %reason, "downstream error");
            state.recorder.add_event(
                span,
                "downstream error",
                [
                    ("peer.service", AttrValue::from(next.name.as_str())),
                    ("downstream.http_status", AttrValue::Int(i64::from(status))),
                ],
            );
            match state.service.on_downstream_error {
                DownstreamPolicy::Absorb => HopOutcome::AbsorbedDownstream { reason },
                DownstreamPolicy::Propagate => HopOutcome::FailedDownstream { status, reason },
            }
        }
        Err(e) => HopOutcome::Internal {
            reason: e.to_string(),
        },
    }
}

/// A missing or unparseable header never fails the request; the hop starts
/// a fresh context and the break in lineage shows up as a new trace id.
fn resolve_context(header: Option<&str>, sampling: SamplingPolicy) -> TraceContext {
    match header {
        None => TraceContext::new(sampling),
        Some(raw) => match TraceContext::decode(raw) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(error = %e, "malformed inbound trace context; starting fresh");
                TraceContext::new(sampling)
            }
        },
    }
}

/// Best-effort audit write with a hard budget. Sink errors and overruns are
/// logged and swallowed; the HTTP response is already decided by now.
async fn persist(
    state: &ServiceState,
    ctx: &TraceContext,
    request_ts: DateTime<Utc>,
    request: &ChainRequest,
    response: &ChainResponse,
) {
    let record = TraceRecord {
        trace_id: ctx.trace_id.to_string(),
        service: state.name().to_string(),
        request_ts,
        request_json: serde_json::to_string(request).unwrap_or_else(|_| "{}".to_string()),
        response_json: serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string()),
        processing_time_ms: response.processing_time_ms,
    };

    let sink = state.sink.clone();
    let write = tokio::task::spawn_blocking(move || sink.record(&record));
    match tokio::time::timeout(state.persist_budget, write).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => {
            warn!(trace_id = %ctx.trace_id, error = ?e, "trace record write failed");
        }
        Ok(Err(e)) => {
            warn!(trace_id = %ctx.trace_id, error = ?e, "trace record task failed");
        }
        Err(_) => {
            warn!(trace_id = %ctx.trace_id, "trace record write exceeded budget");
        }
    }
}

#[cfg(test)]
mod tests {
    use hopline_core::ids::SpanId;

    use super::*;

    #[test]
    fn valid_header_is_adopted() {
        let upstream = TraceContext::new(SamplingPolicy::Always).extend(SpanId::generate());
        let encoded = upstream.encode();
        let resolved = resolve_context(Some(&encoded), SamplingPolicy::Always);
        assert_eq!(resolved, upstream);
    }

    #[test]
    fn garbage_header_starts_fresh() {
        let resolved = resolve_context(Some("not-a-context"), SamplingPolicy::Always);
        assert!(resolved.parent_span_id.is_none());
        assert!(resolved.sampled);
    }

    #[test]
    fn missing_header_uses_sampling_policy() {
        let resolved = resolve_context(None, SamplingPolicy::Never);
        assert!(!resolved.sampled);
    }
}
