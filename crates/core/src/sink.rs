use crate::chain::TraceRecord;
use crate::error::Result;

/// Durable home for per-hop audit rows. Writes must be idempotent on the
/// record's `(trace_id, service, request_ts)` key; callers treat a failure
/// as loggable, never as a reason to fail the request.
pub trait PersistenceSink: Send + Sync {
    fn record(&self, record: &TraceRecord) -> Result<()>;
}
