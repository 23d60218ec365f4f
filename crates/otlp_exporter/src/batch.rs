/// An ordered, immutable group of records of one signal.
///
/// Created only by [`BatchBuffer::drain`](crate::BatchBuffer::drain), which
/// assigns the sequence number. The sequence number travels with the batch
/// through retries and a requeue so a collector can recognise duplicates.
#[derive(Debug)]
pub struct Batch<T> {
    sequence: u64,
    records: Vec<T>,
    requeued: bool,
}

impl<T> Batch<T> {
    pub(crate) fn new(sequence: u64, records: Vec<T>) -> Self {
        Self {
            sequence,
            records,
            requeued: false,
        }
    }

    /// Sequence number, unique per exporter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Records in buffer insertion order.
    pub fn records(&self) -> &[T] {
        &self.records
    }

    /// Returns the number of records in the batch
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `true` once the batch has been put back into its buffer after failing.
    pub fn is_requeued(&self) -> bool {
        self.requeued
    }

    /// Keeps only the records for which `keep` returns `true`, preserving order.
    pub(crate) fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.records.retain(keep);
    }

    pub(crate) fn mark_requeued(&mut self) {
        self.requeued = true;
    }

    /// Consumes the batch, releasing its records.
    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}
