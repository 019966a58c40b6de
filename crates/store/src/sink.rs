use hopline_core::chain::TraceRecord;
use hopline_core::error::Result;
use hopline_core::sink::PersistenceSink;

use crate::Store;

/// `PersistenceSink` backed by the shared DuckDB store.
#[derive(Clone)]
pub struct StoreSink {
    store: Store,
}

impl StoreSink {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl PersistenceSink for StoreSink {
    fn record(&self, record: &TraceRecord) -> Result<()> {
        self.store.insert_trace_record(record)
    }
}
