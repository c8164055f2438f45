use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Single-producer single-consumer ring of PCM samples.
///
/// Cursors are expressed in samples (one sample = one frame of
/// `sample_size` bytes, i.e. all channels). One slot is left unused so
/// that `head == tail` always means "empty".
///
/// The fast paths are lock-free: the producer writes then publishes
/// `head`, the consumer reads then publishes `tail`. The producer may
/// additionally drop old samples (advance `tail`), but callers must
/// serialise that against a concurrent reader with an external lock; see
/// the regulator.
pub struct AudioBuffer {
    data: Box<[UnsafeCell<u8>]>,
    /// capacity + 1, in samples
    alloc_size: u32,
    sample_size: usize,
    /// Writer cursor, published after the data is written.
    head: AtomicU32,
    /// Reader cursor, published after the data is consumed.
    tail: AtomicU32,
}

unsafe impl Send for AudioBuffer {}
unsafe impl Sync for AudioBuffer {}

impl AudioBuffer {
    pub fn new(sample_size: usize, capacity: u32) -> Self {
        assert!(sample_size > 0);
        assert!(capacity > 0);

        let alloc_size = capacity + 1;
        let bytes = alloc_size as usize * sample_size;
        let data = (0..bytes).map(|_| UnsafeCell::new(0)).collect();

        Self {
            data,
            alloc_size,
            sample_size,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.alloc_size - 1
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn to_bytes(&self, samples: u32) -> usize {
        samples as usize * self.sample_size
    }

    pub fn can_read(&self) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (self.alloc_size + head - tail) % self.alloc_size
    }

    pub fn can_write(&self) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Relaxed);
        (self.alloc_size + tail - head - 1) % self.alloc_size
    }

    unsafe fn copy_out(&self, tail: u32, to: *mut u8, samples: u32) {
        let right_count = (self.alloc_size - tail).min(samples);
        let left_count = samples - right_count;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data[self.to_bytes(tail)].get(),
                to,
                self.to_bytes(right_count),
            );
            if left_count > 0 {
                std::ptr::copy_nonoverlapping(
                    self.data[0].get(),
                    to.add(self.to_bytes(right_count)),
                    self.to_bytes(left_count),
                );
            }
        }
    }

    /// Read up to `to.len() / sample_size` samples. Returns the number of
    /// samples actually copied.
    pub fn read(&self, to: &mut [u8]) -> u32 {
        debug_assert!(to.len() % self.sample_size == 0);
        let mut samples = (to.len() / self.sample_size) as u32;

        // The tail cursor may have been advanced by the producer to drop
        // samples, so it must be re-read here.
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        let can_read = (self.alloc_size + head - tail) % self.alloc_size;
        if samples > can_read {
            samples = can_read;
        }
        if samples == 0 {
            return 0;
        }

        unsafe { self.copy_out(tail, to.as_mut_ptr(), samples) };

        let new_tail = (tail + samples) % self.alloc_size;
        self.tail.store(new_tail, Ordering::Release);

        samples
    }

    /// Consumer-side drop of up to `samples` samples without copying them.
    pub fn skip(&self, samples: u32) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        let can_read = (self.alloc_size + head - tail) % self.alloc_size;
        let samples = samples.min(can_read);

        let new_tail = (tail + samples) % self.alloc_size;
        self.tail.store(new_tail, Ordering::Release);

        samples
    }

    /// Write up to `from.len() / sample_size` samples. Returns the number
    /// of samples actually stored; the rest did not fit.
    pub fn write(&self, from: &[u8]) -> u32 {
        debug_assert!(from.len() % self.sample_size == 0);
        let mut samples = (from.len() / self.sample_size) as u32;

        // Only the producer writes head, relaxed is enough for it.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let can_write = (self.alloc_size + tail - head - 1) % self.alloc_size;
        if samples > can_write {
            samples = can_write;
        }
        if samples == 0 {
            return 0;
        }

        let right_count = (self.alloc_size - head).min(samples);
        let left_count = samples - right_count;
        unsafe {
            std::ptr::copy_nonoverlapping(
                from.as_ptr(),
                self.data[self.to_bytes(head)].get(),
                self.to_bytes(right_count),
            );
            if left_count > 0 {
                std::ptr::copy_nonoverlapping(
                    from.as_ptr().add(self.to_bytes(right_count)),
                    self.data[0].get(),
                    self.to_bytes(left_count),
                );
            }
        }

        let new_head = (head + samples) % self.alloc_size;
        self.head.store(new_head, Ordering::Release);

        samples
    }

    /// Producer-initiated truncation: drop the oldest samples so that at
    /// most `samples_limit` remain buffered. Returns the number of samples
    /// dropped. The compare-exchange loop never advances `tail` past
    /// `head`.
    pub fn truncate(&self, samples_limit: u32) -> u32 {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);

            let can_read = (self.alloc_size + head - tail) % self.alloc_size;
            if can_read <= samples_limit {
                // Nothing to truncate
                return 0;
            }

            let skip = can_read - samples_limit;
            let new_tail = (tail + skip) % self.alloc_size;
            if self
                .tail
                .compare_exchange_weak(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return skip;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(samples: &[u16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let buf = AudioBuffer::new(2, 20);

        assert_eq!(buf.write(&bytes(&[1, 2, 3, 4, 5])), 5);
        assert_eq!(buf.can_read(), 5);

        let mut out = [0u8; 6];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(out, bytes(&[1, 2, 3])[..]);

        assert_eq!(buf.write(&bytes(&[6, 7])), 2);

        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(out, bytes(&[4, 5, 6, 7])[..]);
        assert_eq!(buf.can_read(), 0);
    }

    #[test]
    fn test_write_caps_at_capacity() {
        let buf = AudioBuffer::new(2, 4);
        assert_eq!(buf.write(&bytes(&[1, 2, 3, 4, 5, 6])), 4);
        assert_eq!(buf.can_read(), 4);
        assert_eq!(buf.can_write(), 0);
    }

    #[test]
    fn test_wrap_around() {
        let buf = AudioBuffer::new(2, 4);

        // Advance the cursors so that subsequent writes wrap
        assert_eq!(buf.write(&bytes(&[1, 2, 3])), 3);
        let mut out = [0u8; 6];
        assert_eq!(buf.read(&mut out), 3);

        assert_eq!(buf.write(&bytes(&[4, 5, 6, 7])), 4);
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(out, bytes(&[4, 5, 6, 7])[..]);
    }

    #[test]
    fn test_can_read_plus_can_write_is_constant() {
        let buf = AudioBuffer::new(4, 10);
        assert_eq!(buf.can_read() + buf.can_write(), 10);

        buf.write(&[0u8; 4 * 6]);
        assert_eq!(buf.can_read() + buf.can_write(), 10);

        let mut out = [0u8; 4 * 2];
        buf.read(&mut out);
        assert_eq!(buf.can_read() + buf.can_write(), 10);
    }

    #[test]
    fn test_truncate_exact_content_is_noop() {
        let buf = AudioBuffer::new(2, 10);
        buf.write(&bytes(&[1, 2, 3]));

        assert_eq!(buf.truncate(3), 0);
        assert_eq!(buf.can_read(), 3);
    }

    #[test]
    fn test_truncate_drops_oldest() {
        let buf = AudioBuffer::new(2, 10);
        buf.write(&bytes(&[1, 2, 3, 4, 5]));

        assert_eq!(buf.truncate(2), 3);
        assert_eq!(buf.can_read(), 2);

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(out, bytes(&[4, 5])[..]);
    }

    #[test]
    fn test_skip_counts_as_read() {
        let buf = AudioBuffer::new(2, 10);
        buf.write(&bytes(&[1, 2, 3, 4]));

        assert_eq!(buf.skip(2), 2);
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(out[..4], bytes(&[3, 4])[..]);
    }

    #[test]
    fn test_spsc_threads_preserve_stream() {
        use std::sync::Arc;

        let buf = Arc::new(AudioBuffer::new(2, 64));
        let writer = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                let mut next: u16 = 0;
                while next < 1000 {
                    let chunk: Vec<u16> = (next..(next + 10).min(1000)).collect();
                    let written = buf.write(&bytes(&chunk));
                    next += written as u16;
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 1000 {
            let mut out = [0u8; 2 * 16];
            let n = buf.read(&mut out);
            for i in 0..n as usize {
                received.push(u16::from_le_bytes([out[2 * i], out[2 * i + 1]]));
            }
        }

        writer.join().unwrap();
        let expected: Vec<u16> = (0..1000).collect();
        assert_eq!(received, expected);
    }
}
