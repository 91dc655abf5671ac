//! Mic sample ring
//!
//! A fixed-capacity FIFO of interleaved f32 samples shared between the mic
//! handler (producer) and the loopback handler (consumer). Unlike an SPSC
//! ring, both sides need a consistent view of read/write/len to implement
//! overwrite-oldest and grow, so the ring is a plain struct guarded by a
//! short-hold mutex at the call sites. The critical section covers one
//! block's push or pop, never any I/O.

/// Initial capacity: ~4 seconds at 48 kHz stereo, rounded up to a power
/// of two. `grow` only fires if a device delivers blocks larger than this.
pub const DEFAULT_RING_CAPACITY: usize = (4 * 48_000 * 2usize).next_power_of_two();

pub struct SampleRing {
    buf: Vec<f32>,
    read: usize,
    write: usize,
    len: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        Self {
            buf: vec![0.0; capacity],
            read: 0,
            write: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of live samples waiting to be popped.
    pub fn backlog_samples(&self) -> usize {
        self.len
    }

    /// Append samples, overwriting the oldest when there is not enough room.
    pub fn push(&mut self, samples: &[f32]) {
        let cap = self.buf.len();
        if samples.len() >= cap {
            // Only the newest `cap` samples can survive
            let tail = &samples[samples.len() - cap..];
            self.buf.copy_from_slice(&tail[..cap]);
            self.read = 0;
            self.write = 0;
            self.len = cap;
            return;
        }

        let room = cap - self.len;
        if samples.len() > room {
            // Advance the read cursor over the samples being overwritten
            let discard = samples.len() - room;
            self.read = (self.read + discard) & (cap - 1);
            self.len -= discard;
        }

        let first = (cap - self.write).min(samples.len());
        self.buf[self.write..self.write + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&samples[first..]);
        }
        self.write = (self.write + samples.len()) & (cap - 1);
        self.len += samples.len();
    }

    /// Copy up to `dst.len()` samples out, returning how many were delivered.
    pub fn pop(&mut self, dst: &mut [f32]) -> usize {
        let cap = self.buf.len();
        let n = dst.len().min(self.len);
        if n == 0 {
            return 0;
        }

        let first = (cap - self.read).min(n);
        dst[..first].copy_from_slice(&self.buf[self.read..self.read + first]);
        let rest = n - first;
        if rest > 0 {
            dst[first..n].copy_from_slice(&self.buf[..rest]);
        }
        self.read = (self.read + n) & (cap - 1);
        self.len -= n;
        n
    }

    /// Drop all buffered samples.
    pub fn clear(&mut self) {
        self.read = self.write;
        self.len = 0;
    }

    /// Reallocate to the next power of two >= `min_capacity`, preserving
    /// buffered samples. No-op if already large enough.
    pub fn grow(&mut self, min_capacity: usize) {
        if min_capacity <= self.buf.len() {
            return;
        }
        let new_cap = min_capacity.next_power_of_two();
        let mut new_buf = vec![0.0; new_cap];
        let live = self.len;
        let popped = self.pop_into(&mut new_buf[..live]);
        debug_assert_eq!(popped, live);
        self.buf = new_buf;
        self.read = 0;
        self.write = live & (new_cap - 1);
        self.len = live;
    }

    fn pop_into(&mut self, dst: &mut [f32]) -> usize {
        let cap = self.buf.len();
        let n = dst.len().min(self.len);
        let first = (cap - self.read).min(n);
        dst[..first].copy_from_slice(&self.buf[self.read..self.read + first]);
        let rest = n - first;
        if rest > 0 {
            dst[first..n].copy_from_slice(&self.buf[..rest]);
        }
        n
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_roundtrip() {
        let mut ring = SampleRing::new(8);
        ring.push(&[1.0, 2.0, 3.0]);
        assert_eq!(ring.backlog_samples(), 3);

        let mut out = [0.0; 3];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert_eq!(ring.backlog_samples(), 0);
    }

    #[test]
    fn test_partial_pop_on_underflow() {
        let mut ring = SampleRing::new(8);
        ring.push(&[1.0, 2.0]);

        let mut out = [9.0; 4];
        assert_eq!(ring.pop(&mut out), 2);
        assert_eq!(&out[..2], &[1.0, 2.0]);
        // Remainder untouched; caller zero-fills
        assert_eq!(&out[2..], &[9.0, 9.0]);
    }

    #[test]
    fn test_overwrite_oldest_when_full() {
        let mut ring = SampleRing::new(4);
        ring.push(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.backlog_samples(), 4);

        // One more push advances the read cursor; count stays at capacity
        ring.push(&[5.0]);
        assert_eq!(ring.backlog_samples(), 4);

        let mut out = [0.0; 4];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_push_larger_than_capacity_keeps_newest() {
        let mut ring = SampleRing::new(4);
        ring.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(ring.backlog_samples(), 4);

        let mut out = [0.0; 4];
        ring.pop(&mut out);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_wraparound() {
        let mut ring = SampleRing::new(4);
        ring.push(&[1.0, 2.0, 3.0]);
        let mut out = [0.0; 2];
        ring.pop(&mut out);

        // Write wraps past the end of the backing store
        ring.push(&[4.0, 5.0, 6.0]);
        let mut all = [0.0; 4];
        assert_eq!(ring.pop(&mut all), 4);
        assert_eq!(all, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_clear() {
        let mut ring = SampleRing::new(8);
        ring.push(&[1.0, 2.0, 3.0]);
        ring.clear();
        assert_eq!(ring.backlog_samples(), 0);

        let mut out = [0.0; 3];
        assert_eq!(ring.pop(&mut out), 0);

        // Still usable after a clear
        ring.push(&[7.0]);
        assert_eq!(ring.pop(&mut out[..1]), 1);
        assert_eq!(out[0], 7.0);
    }

    #[test]
    fn test_grow_preserves_contents() {
        let mut ring = SampleRing::new(4);
        ring.push(&[1.0, 2.0, 3.0]);
        let mut out = [0.0; 1];
        ring.pop(&mut out); // move read cursor so grow has to unwrap
        ring.push(&[4.0, 5.0]);

        ring.grow(16);
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.backlog_samples(), 4);

        let mut all = [0.0; 4];
        assert_eq!(ring.pop(&mut all), 4);
        assert_eq!(all, [2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_grow_rounds_to_power_of_two() {
        let mut ring = SampleRing::new(4);
        ring.grow(9);
        assert_eq!(ring.capacity(), 16);
    }

    #[test]
    fn test_default_capacity_covers_four_seconds() {
        let ring = SampleRing::default();
        assert!(ring.capacity() >= 4 * 48_000 * 2);
        assert!(ring.capacity().is_power_of_two());
    }
}
