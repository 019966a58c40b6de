use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::params;
use hopline_core::chain::TraceRecord;
use hopline_core::error::{HoplineError, Result};
use hopline_core::ids::{SpanId, TraceId};
use hopline_core::span::{ClosedSpan, SpanStatus};

use crate::Store;

impl Store {
    /// All hop records for one trace, oldest first. Request time is the
    /// chain order: hop N's record precedes hop N+1's.
    pub fn records_for_trace(&self, trace_id: &str) -> Result<Vec<TraceRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT trace_id, service, request_ts, request_json, response_json, processing_time_ms
                 FROM trace_records
                 WHERE trace_id = ?
                 ORDER BY request_ts ASC",
            )
            .map_err(|e| HoplineError::Store(format!("prepare trace records failed: {e}")))?;

        let rows = stmt
            .query_map(params![trace_id], map_record_row)
            .map_err(|e| HoplineError::Store(format!("query trace records failed: {e}")))?;

        collect_rows(rows, "map trace record failed")
    }

    /// Most recent records across all traces, newest first.
    pub fn recent_records(&self, limit: usize) -> Result<Vec<TraceRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT trace_id, service, request_ts, request_json, response_json, processing_time_ms
                 FROM trace_records
                 ORDER BY request_ts DESC
                 LIMIT ?",
            )
            .map_err(|e| HoplineError::Store(format!("prepare recent records failed: {e}")))?;

        let rows = stmt
            .query_map(params![limit as i64], map_record_row)
            .map_err(|e| HoplineError::Store(format!("query recent records failed: {e}")))?;

        collect_rows(rows, "map recent record failed")
    }

    pub fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<ClosedSpan>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT trace_id, span_id, parent_span_id, service, operation, start_ts, end_ts, duration_ms, status, status_reason, attrs_json, events_json
                 FROM spans
                 WHERE trace_id = ?
                 ORDER BY start_ts ASC",
            )
            .map_err(|e| HoplineError::Store(format!("prepare trace spans failed: {e}")))?;

        let rows = stmt
            .query_map(params![trace_id], |row| {
                Ok(SpanRow {
                    trace_id: row.get::<_, String>(0)?,
                    span_id: row.get::<_, String>(1)?,
                    parent_span_id: row.get::<_, Option<String>>(2)?,
                    service: row.get::<_, String>(3)?,
                    operation: row.get::<_, String>(4)?,
                    start_ts: row.get::<_, NaiveDateTime>(5)?.and_utc(),
                    end_ts: row.get::<_, NaiveDateTime>(6)?.and_utc(),
                    duration_ms: row.get::<_, i64>(7)?,
                    status: row.get::<_, String>(8)?,
                    status_reason: row.get::<_, Option<String>>(9)?,
                    attrs_json: row.get::<_, String>(10)?,
                    events_json: row.get::<_, String>(11)?,
                })
            })
            .map_err(|e| HoplineError::Store(format!("query trace spans failed: {e}")))?;

        let mut spans = Vec::new();
        for row in rows {
            let row = row.map_err(|e| HoplineError::Store(format!("map trace span failed: {e}")))?;
            spans.push(row.into_closed_span()?);
        }
        Ok(spans)
    }
}

struct SpanRow {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    service: String,
    operation: String,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
    duration_ms: i64,
    status: String,
    status_reason: Option<String>,
    attrs_json: String,
    events_json: String,
}

impl SpanRow {
    fn into_closed_span(self) -> Result<ClosedSpan> {
        let status = match (self.status.as_str(), self.status_reason) {
            ("OK", _) => SpanStatus::Ok,
            ("ERROR", reason) => SpanStatus::error(reason.unwrap_or_default()),
            (other, _) => {
                return Err(HoplineError::Store(format!("unknown span status: {other}")));
            }
        };
        Ok(ClosedSpan {
            trace_id: TraceId::parse(&self.trace_id)?,
            span_id: SpanId::parse(&self.span_id)?,
            parent_span_id: self.parent_span_id.as_deref().map(SpanId::parse).transpose()?,
            service: self.service,
            operation: self.operation,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            duration_ms: self.duration_ms,
            status,
            attributes: serde_json::from_str(&self.attrs_json)
                .map_err(|e| HoplineError::Store(format!("bad attrs_json in span row: {e}")))?,
            events: serde_json::from_str(&self.events_json)
                .map_err(|e| HoplineError::Store(format!("bad events_json in span row: {e}")))?,
        })
    }
}

fn map_record_row(row: &duckdb::Row<'_>) -> duckdb::Result<TraceRecord> {
    Ok(TraceRecord {
        trace_id: row.get::<_, String>(0)?,
        service: row.get::<_, String>(1)?,
        request_ts: row.get::<_, NaiveDateTime>(2)?.and_utc(),
        request_json: row.get::<_, String>(3)?,
        response_json: row.get::<_, String>(4)?,
        processing_time_ms: row.get::<_, i64>(5)?,
    })
}

fn collect_rows<'a>(
    rows: impl Iterator<Item = duckdb::Result<TraceRecord>> + 'a,
    context: &str,
) -> Result<Vec<TraceRecord>> {
    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(|e| HoplineError::Store(format!("{context}: {e}")))?);
    }
    Ok(records)
}
