//! Preallocated, fixed-capacity sample storage for one sensor.
//!
//! A [`RingBuffer`] is sized once at controller start and then reused for
//! every burst. Only the first `len()` slots (or, after a wrap, the most
//! recent `capacity` samples) hold data from the current burst; anything
//! else is left over from an earlier burst and is never handed out.

/// Contiguous byte storage split into equal-sized sample slots.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    sample_size: usize,
    capacity: usize,
    sample_count: u64,
}

impl RingBuffer {
    /// Allocate `capacity` slots of `sample_size` bytes each.
    pub fn new(capacity: usize, sample_size: usize) -> Self {
        assert!(capacity > 0 && sample_size > 0, "empty ring buffer");
        RingBuffer {
            data: vec![0; capacity * sample_size],
            sample_size,
            capacity,
            sample_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Total samples written since the last reset, including overwritten ones.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Number of valid samples currently held.
    pub fn len(&self) -> usize {
        self.sample_count.min(self.capacity as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Samples lost to wrapping during this burst.
    pub fn overwritten(&self) -> u64 {
        self.sample_count - self.len() as u64
    }

    /// Hand out the next slot for the caller to fill in place, advancing the
    /// sample count. The slot may contain stale bytes.
    pub fn next_slot(&mut self) -> &mut [u8] {
        let index = (self.sample_count % self.capacity as u64) as usize;
        self.sample_count += 1;
        let start = index * self.sample_size;
        &mut self.data[start..start + self.sample_size]
    }

    /// Copy one sample into the buffer. Short samples are zero padded and
    /// long ones truncated to the slot size.
    pub fn push(&mut self, sample: &[u8]) {
        let slot = self.next_slot();
        let n = sample.len().min(slot.len());
        slot[..n].copy_from_slice(&sample[..n]);
        slot[n..].fill(0);
    }

    /// The most recently written sample.
    pub fn last(&self) -> Option<&[u8]> {
        if self.sample_count == 0 {
            return None;
        }
        let index = ((self.sample_count - 1) % self.capacity as u64) as usize;
        let start = index * self.sample_size;
        Some(&self.data[start..start + self.sample_size])
    }

    /// The valid samples in capture order, as at most two contiguous runs.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        let len = self.len();
        if self.sample_count <= self.capacity as u64 {
            return (&self.data[..len * self.sample_size], &[]);
        }
        let split = (self.sample_count % self.capacity as u64) as usize * self.sample_size;
        let (head, tail) = self.data.split_at(split);
        (tail, head)
    }

    /// Append the valid samples, in capture order, to `out`.
    pub fn copy_valid_into(&self, out: &mut Vec<u8>) {
        let (first, second) = self.as_slices();
        out.reserve(first.len() + second.len());
        out.extend_from_slice(first);
        out.extend_from_slice(second);
    }

    /// Forget the current burst. The storage is kept as-is.
    pub fn reset(&mut self) {
        self.sample_count = 0;
    }
}
