//! In-memory buffer between sensor arrival and the periodic flush tick.

use crate::store::Sample;

/// Unbounded ordered buffer of samples awaiting the next flush tick.
///
/// Growth is bounded only by the flush-tick frequency; the acquisition
/// daemon produces at human-scale rates, so no backpressure is applied.
#[derive(Debug, Default)]
pub struct IngressQueue {
    buffer: Vec<Sample>,
}

impl IngressQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sample. Never fails, never blocks.
    pub fn offer(&mut self, sample: Sample) {
        self.buffer.push(sample);
    }

    /// Atomically empties the queue and returns its contents in arrival order.
    pub fn drain_all(&mut self) -> Vec<Sample> {
        std::mem::take(&mut self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SampleValue;

    fn sample(ts: i64) -> Sample {
        Sample {
            sensor: "DI1".to_string(),
            value: SampleValue::Number(1.0),
            ts,
        }
    }

    #[test]
    fn drain_empties_and_preserves_order() {
        let mut queue = IngressQueue::new();
        queue.offer(sample(100));
        queue.offer(sample(130));
        queue.offer(sample(160));
        assert_eq!(queue.len(), 3);

        let drained = queue.drain_all();
        assert_eq!(
            drained.iter().map(|s| s.ts).collect::<Vec<_>>(),
            vec![100, 130, 160]
        );
        assert!(queue.is_empty());

        // Offers after a drain land in the next flush.
        queue.offer(sample(190));
        assert_eq!(queue.drain_all().len(), 1);
    }
}
