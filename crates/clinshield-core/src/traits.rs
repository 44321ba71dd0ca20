use crate::{RecordBatch, Result};

/// Supplies parsed records, one batch per input unit.
pub trait RecordSource {
    fn load(&self) -> Result<Vec<RecordBatch>>;
}

/// Persists anonymized records.
pub trait RecordSink {
    fn store(&self, batches: &[RecordBatch]) -> Result<()>;
}
