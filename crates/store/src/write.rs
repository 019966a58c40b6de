use duckdb::params;
use hopline_core::chain::TraceRecord;
use hopline_core::error::{HoplineError, Result};
use hopline_core::span::ClosedSpan;

use crate::Store;

impl Store {
    /// Idempotent on `(trace_id, service, request_ts)`: a replayed record
    /// replaces its earlier copy instead of appending a duplicate.
    pub fn insert_trace_record(&self, record: &TraceRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO trace_records
             (trace_id, service, request_ts, request_json, response_json, processing_time_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.trace_id,
                record.service,
                record.request_ts.to_rfc3339(),
                record.request_json,
                record.response_json,
                record.processing_time_ms,
            ],
        )
        .map_err(|e| HoplineError::Store(format!("insert trace record failed: {e}")))?;
        Ok(())
    }

    pub fn insert_spans(&self, spans: &[ClosedSpan]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| HoplineError::Store(format!("begin tx failed: {e}")))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO spans
                     (trace_id, span_id, parent_span_id, service, operation, start_ts, end_ts, duration_ms, status, status_reason, attrs_json, events_json)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .map_err(|e| HoplineError::Store(format!("prepare insert spans failed: {e}")))?;

            for span in spans {
                stmt.execute(params![
                    span.trace_id.as_str(),
                    span.span_id.as_str(),
                    span.parent_span_id.as_ref().map(|p| p.as_str().to_string()),
                    span.service,
                    span.operation,
                    span.start_ts.to_rfc3339(),
                    span.end_ts.to_rfc3339(),
                    span.duration_ms,
                    span.status.label(),
                    span.status.reason().map(str::to_string),
                    span.attrs_json(),
                    span.events_json(),
                ])
                .map_err(|e| HoplineError::Store(format!("insert span failed: {e}")))?;
            }
        }

        tx.commit()
            .map_err(|e| HoplineError::Store(format!("commit spans failed: {e}")))
    }
}
