use chrono::SecondsFormat;
use hopline_core::chain::{ChainResponse, ChainStatus, TraceRecord};

pub fn print_send_human(http_status: u16, response: &ChainResponse) {
    println!(
        "status={} http={http_status} trace={}",
        status_label(response.status),
        response.trace_id
    );
    if !response.service_chain.is_empty() {
        println!("chain={}", response.service_chain.join(" -> "));
    }
    print_hop(response, 0);
}

fn print_hop(response: &ChainResponse, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}{} {} ({}ms) | {}",
        response.service,
        status_label(response.status),
        response.processing_time_ms,
        response.message
    );
    if let Some(downstream) = &response.downstream {
        print_hop(downstream, depth + 1);
    }
}

pub fn print_trace_human(trace_id: &str, records: &[TraceRecord]) {
    println!("TRACE {trace_id} records={}", records.len());
    let first_ts = records.first().map(|r| r.request_ts);
    for record in records {
        let offset_ms = first_ts
            .map(|f| (record.request_ts - f).num_milliseconds())
            .unwrap_or(0);
        println!(
            "  {} +{offset_ms}ms {} ({}ms) {}",
            record.request_ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            record.service,
            record.processing_time_ms,
            record_status(&record.response_json)
        );
    }
    println!("-- {} records --", records.len());
}

fn status_label(status: ChainStatus) -> &'static str {
    match status {
        ChainStatus::Ok => "ok",
        ChainStatus::Degraded => "degraded",
        ChainStatus::Error => "error",
    }
}

fn record_status(response_json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(response_json)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
