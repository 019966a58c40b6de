use std::sync::Arc;
use std::time::Duration;

use hopline_core::recorder::{ExportOutcome, SpanExporter};
use hopline_core::span::ClosedSpan;
use hopline_store::Store;
use tokio::sync::mpsc;
use tracing::warn;

pub struct CollectorConfig {
    pub channel_capacity: usize,
    pub flush_interval: Duration,
    pub batch_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 512,
            flush_interval: Duration::from_millis(200),
            batch_size: 256,
        }
    }
}

/// Buffers ended spans and writes them to the store in batches off the
/// request path.
#[derive(Clone)]
pub struct Collector {
    spans_tx: mpsc::Sender<ClosedSpan>,
}

impl Collector {
    pub fn new(store: Store, cfg: CollectorConfig) -> Self {
        let (spans_tx, spans_rx) = mpsc::channel(cfg.channel_capacity);
        tokio::spawn(run_span_writer(
            store,
            spans_rx,
            cfg.batch_size,
            cfg.flush_interval,
        ));
        Self { spans_tx }
    }

    pub fn exporter(&self) -> Arc<dyn SpanExporter> {
        Arc::new(QueueExporter {
            tx: self.spans_tx.clone(),
        })
    }
}

struct QueueExporter {
    tx: mpsc::Sender<ClosedSpan>,
}

impl SpanExporter for QueueExporter {
    fn export(&self, span: &ClosedSpan) -> ExportOutcome {
        // try_send keeps the request path non-blocking; a full queue means
        // the span is dropped and reported as rejected.
        match self.tx.try_send(span.clone()) {
            Ok(()) => ExportOutcome::Accepted,
            Err(_) => ExportOutcome::Rejected,
        }
    }
}

async fn run_span_writer(
    store: Store,
    mut rx: mpsc::Receiver<ClosedSpan>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    let mut buffer = Vec::new();
    loop {
        tokio::select! {
            Some(span) = rx.recv() => {
                buffer.push(span);
                if buffer.len() >= batch_size {
                    flush_spans(&store, &mut buffer);
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_spans(&store, &mut buffer);
                }
            }
            else => break,
        }
    }
}

fn flush_spans(store: &Store, buffer: &mut Vec<ClosedSpan>) {
    if let Err(e) = store.insert_spans(buffer) {
        warn!(error = ?e, "failed to write span batch");
    }
    buffer.clear();
}
