pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trace_records (
  trace_id TEXT NOT NULL,
  service TEXT NOT NULL,
  request_ts TIMESTAMP NOT NULL,
  request_json TEXT NOT NULL,
  response_json TEXT NOT NULL,
  processing_time_ms BIGINT NOT NULL,
  PRIMARY KEY(trace_id, service, request_ts)
);

CREATE TABLE IF NOT EXISTS spans (
  trace_id TEXT NOT NULL,
  span_id TEXT NOT NULL,
  parent_span_id TEXT,
  service TEXT NOT NULL,
  operation TEXT NOT NULL,
  start_ts TIMESTAMP NOT NULL,
  end_ts TIMESTAMP NOT NULL,
  duration_ms BIGINT NOT NULL,
  status TEXT NOT NULL,
  status_reason TEXT,
  attrs_json TEXT NOT NULL,
  events_json TEXT NOT NULL,
  PRIMARY KEY(trace_id, span_id)
);

CREATE INDEX IF NOT EXISTS idx_trace_records_trace ON trace_records(trace_id);
CREATE INDEX IF NOT EXISTS idx_trace_records_ts ON trace_records(request_ts);

CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
CREATE INDEX IF NOT EXISTS idx_spans_service_start ON spans(service, start_ts);
"#;
