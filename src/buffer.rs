use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Condvar, Mutex,
    },
    time::Duration,
};

use crate::Sample;

// -------------------------------------------------------------------------------------------------

/// How long a blocked writer naps before re-checking for free space. The consumer side is
/// lock-free and therefore never notifies.
const WRITE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// -------------------------------------------------------------------------------------------------

/// Something a decoder can push converted engine-rate samples into.
pub trait SampleSink: Send + Sync {
    /// Append samples. Returns the number accepted; zero tells the producer to stop
    /// (sink closed, or out of room in a non-blocking sink).
    fn push(&self, samples: &[Sample]) -> usize;
}

// -------------------------------------------------------------------------------------------------

/// Fixed-capacity interleaved stereo sample ring between one decoder thread and the audio
/// callback.
///
/// Reads are all-or-nothing: a request larger than what is buffered returns zero samples, so
/// the audio callback can treat an underrun as "output silence for this block" without a
/// partial-zero policy. The read path uses atomics only and never blocks.
///
/// Writes either block until the consumer caught up (`overwrite == false`, used for
/// full-track buffers), or overwrite the oldest samples (`overwrite == true`, used for live
/// stream rings where stale audio is better than a stalled decoder).
pub struct PlayBuffer {
    storage: UnsafeCell<Vec<Sample>>,
    capacity: AtomicUsize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    size: AtomicUsize,
    overwrite: AtomicBool,
    closed: AtomicBool,
    total_read: AtomicU64,
    total_written: AtomicU64,
    space_lock: Mutex<()>,
    space_cond: Condvar,
}

// SAFETY: single-producer/single-consumer protocol. The producer is the only thread mutating
// `write_pos` and writing storage past the read position; the consumer is the only thread
// mutating `read_pos` (except in overwrite mode, where the producer may push it forward and
// the consumer tolerates overwritten samples). `resize` reallocates storage and is only
// called while the owning player is loading, i.e. before the audio thread was told (via the
// player state, released after the resize) to start consuming.
unsafe impl Send for PlayBuffer {}
unsafe impl Sync for PlayBuffer {}

impl PlayBuffer {
    pub fn new() -> Self {
        Self {
            storage: UnsafeCell::new(Vec::new()),
            capacity: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            overwrite: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            total_read: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            space_lock: Mutex::new(()),
            space_cond: Condvar::new(),
        }
    }

    /// Allocate for the given capacity, discarding any content.
    pub fn resize(&self, capacity: usize, overwrite: bool) {
        let _guard = self.space_lock.lock().unwrap();
        // SAFETY: see struct comment; callers resize only while no other thread touches us.
        unsafe {
            *self.storage.get() = vec![0; capacity];
        }
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
        self.overwrite.store(overwrite, Ordering::Relaxed);
        self.closed.store(false, Ordering::Relaxed);
        self.total_read.store(0, Ordering::Relaxed);
        self.total_written.store(0, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Release);
        self.space_cond.notify_all();
    }

    /// Drop all buffered content, keeping the allocation.
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Release);
        self.closed.store(false, Ordering::Relaxed);
        self.total_read.store(0, Ordering::Relaxed);
        self.total_written.store(0, Ordering::Relaxed);
        self.space_cond.notify_all();
    }

    /// Makes pending and future writes return zero, unblocking a waiting producer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.space_cond.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn read_position(&self) -> usize {
        self.read_pos.load(Ordering::Relaxed)
    }

    pub fn write_position(&self) -> usize {
        self.write_pos.load(Ordering::Relaxed)
    }

    /// Total samples ever consumed (monotonic, survives ring wraps).
    pub fn total_read(&self) -> u64 {
        self.total_read.load(Ordering::Relaxed)
    }

    /// Total samples ever produced (monotonic, survives ring wraps).
    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }

    pub fn memory_size_mb(&self) -> f32 {
        const MIBI: f32 = 1024.0 * 1024.0;
        (self.capacity() * std::mem::size_of::<Sample>()) as f32 / MIBI
    }

    /// Copy `src` into the ring. Returns `src.len()`, or 0 when the request exceeds the
    /// capacity or the buffer was closed while waiting for room.
    pub fn write(&self, src: &[Sample]) -> usize {
        let len = src.len();
        if len == 0 {
            return 0;
        }
        let capacity = self.capacity.load(Ordering::Acquire);
        if capacity == 0 || len > capacity {
            return 0;
        }

        if !self.overwrite.load(Ordering::Relaxed) {
            let mut guard = self.space_lock.lock().unwrap();
            loop {
                if self.closed.load(Ordering::Relaxed) {
                    return 0;
                }
                let free = capacity - self.size.load(Ordering::Acquire);
                if free >= len {
                    break;
                }
                let (next, _) = self
                    .space_cond
                    .wait_timeout(guard, WRITE_POLL_INTERVAL)
                    .unwrap();
                guard = next;
            }
        } else {
            let free = capacity - self.size.load(Ordering::Acquire).min(capacity);
            if len > free {
                // push the reader past the oldest samples instead of blocking
                let read_pos = self.read_pos.load(Ordering::Relaxed);
                self.read_pos
                    .store((read_pos + len) % capacity, Ordering::Relaxed);
                let _ = self
                    .size
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |size| {
                        Some(size.saturating_sub(len))
                    });
            }
        }

        let write_pos = self.write_pos.load(Ordering::Relaxed);
        // SAFETY: we are the single producer; the region past `size` is not read concurrently.
        unsafe {
            let data = (*self.storage.get()).as_mut_ptr();
            let first = len.min(capacity - write_pos);
            std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(write_pos), first);
            if len > first {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), data, len - first);
            }
        }
        self.write_pos
            .store((write_pos + len) % capacity, Ordering::Relaxed);
        self.total_written.fetch_add(len as u64, Ordering::Relaxed);
        self.size.fetch_add(len, Ordering::Release);
        len
    }

    /// Copy exactly `dst.len()` samples out of the ring, or nothing at all.
    pub fn read(&self, dst: &mut [Sample]) -> usize {
        let len = dst.len();
        if len == 0 {
            return 0;
        }
        let available = self.size.load(Ordering::Acquire);
        if len > available {
            return 0;
        }
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            return 0;
        }
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        // SAFETY: we are the single consumer; `available` samples are published (release on
        // the producer's size increment, acquired above).
        unsafe {
            let data = (*self.storage.get()).as_ptr();
            let first = len.min(capacity - read_pos);
            std::ptr::copy_nonoverlapping(data.add(read_pos), dst.as_mut_ptr(), first);
            if len > first {
                std::ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(first), len - first);
            }
        }
        self.read_pos
            .store((read_pos + len) % capacity, Ordering::Relaxed);
        self.total_read.fetch_add(len as u64, Ordering::Relaxed);
        let _ = self
            .size
            .fetch_update(Ordering::Release, Ordering::Relaxed, |size| {
                Some(size.saturating_sub(len))
            });
        len
    }
}

impl Default for PlayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSink for PlayBuffer {
    fn push(&self, samples: &[Sample]) -> usize {
        self.write(samples)
    }
}

// -------------------------------------------------------------------------------------------------

struct CrossFadeZone {
    begin: usize,
    end: usize,
    fade_in: Vec<f32>,
    fade_out: Vec<f32>,
    fade_in_idx: usize,
    fade_out_idx: usize,
}

impl CrossFadeZone {
    fn unarmed() -> Self {
        Self {
            begin: usize::MAX,
            end: 0,
            fade_in: Vec::new(),
            fade_out: Vec::new(),
            fade_in_idx: 0,
            fade_out_idx: 0,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Linear (non-wrapping) stereo sample buffer which bakes equal-power cross-fades into the
/// content as tracks are appended.
///
/// Before appending a new track, the loader arms a cross-fade window around the current write
/// position via [`set_cross_fade_zone`](Self::set_cross_fade_zone); writes falling into the
/// window are summed onto the existing samples with x²-taper curves (-6 dB at the centre),
/// so by the time the consumer arrives, the transition already sits in the buffer.
///
/// Reads have the same all-or-nothing contract as [`PlayBuffer`].
pub struct PremixBuffer {
    storage: UnsafeCell<Vec<Sample>>,
    capacity: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    xfade: Mutex<CrossFadeZone>,
}

// SAFETY: one loader thread appends through `write`/`set_cross_fade_zone`/`eject` (the xfade
// mutex also serializes them), one consumer reads; published sample ranges never overlap with
// the region still being written. `eject` is only called while the consumer is inactive.
unsafe impl Send for PremixBuffer {}
unsafe impl Sync for PremixBuffer {}

impl PremixBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: UnsafeCell::new(vec![0; capacity]),
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            xfade: Mutex::new(CrossFadeZone::unarmed()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn read_position(&self) -> usize {
        self.read_pos.load(Ordering::Relaxed)
    }

    pub fn write_position(&self) -> usize {
        self.write_pos.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.write_pos
            .load(Ordering::Relaxed)
            .saturating_sub(self.read_pos.load(Ordering::Relaxed))
    }

    pub fn memory_size_mb(&self) -> f32 {
        const MIBI: f32 = 1024.0 * 1024.0;
        (self.capacity * std::mem::size_of::<Sample>()) as f32 / MIBI
    }

    /// Rewind to empty and disarm any cross-fade window.
    pub fn eject(&self) {
        let mut xfade = self.xfade.lock().unwrap();
        *xfade = CrossFadeZone::unarmed();
        self.write_pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Release);
    }

    /// Arm the cross-fade window `[begin, end)` and move the write position back to its
    /// start, so the next track overlaps the tail of the previous one.
    pub fn set_cross_fade_zone(&self, begin: usize, end: usize) {
        let mut xfade = self.xfade.lock().unwrap();
        let frames = end.saturating_sub(begin) / 2;
        if frames < 2 {
            *xfade = CrossFadeZone::unarmed();
            return;
        }
        let denominator = (frames - 1) as f32;
        if xfade.fade_in.len() != frames {
            xfade.fade_in = (0..frames)
                .map(|i| {
                    let vol = i as f32 / denominator;
                    vol * vol
                })
                .collect();
        }
        if xfade.fade_out.len() != frames {
            xfade.fade_out = (0..frames)
                .map(|i| {
                    let vol = (denominator - i as f32) / denominator;
                    vol * vol
                })
                .collect();
        }
        xfade.begin = begin;
        xfade.end = end;
        xfade.fade_in_idx = 0;
        xfade.fade_out_idx = 0;
        self.write_pos.store(begin, Ordering::Relaxed);
    }

    /// Append samples, mixing with the equal-power curves inside an armed window.
    /// Returns the number of samples accepted; less than `src.len()` once the buffer is full.
    pub fn write(&self, src: &[Sample]) -> usize {
        let mut xfade = self.xfade.lock().unwrap();
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let writable = src.len().min(self.capacity - write_pos);
        if writable == 0 {
            return 0;
        }
        let in_window = write_pos >= xfade.begin && write_pos + src.len() <= xfade.end;
        // SAFETY: loader-only region beyond the published read range.
        unsafe {
            let data = (*self.storage.get()).as_mut_ptr();
            if in_window {
                for frame in 0..writable / 2 {
                    let fade_in = xfade.fade_in[xfade.fade_in_idx.min(xfade.fade_in.len() - 1)];
                    let fade_out =
                        xfade.fade_out[xfade.fade_out_idx.min(xfade.fade_out.len() - 1)];
                    xfade.fade_in_idx += 1;
                    xfade.fade_out_idx += 1;
                    let left = frame * 2;
                    let right = left + 1;
                    let mixed_l = *data.add(write_pos + left) as f32 * fade_out
                        + src[left] as f32 * fade_in;
                    let mixed_r = *data.add(write_pos + right) as f32 * fade_out
                        + src[right] as f32 * fade_in;
                    *data.add(write_pos + left) =
                        mixed_l.clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample;
                    *data.add(write_pos + right) =
                        mixed_r.clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample;
                }
            } else {
                std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(write_pos), writable);
            }
        }
        self.write_pos.store(write_pos + writable, Ordering::Release);
        writable
    }

    /// Copy exactly `dst.len()` samples, or nothing when less is buffered.
    pub fn read(&self, dst: &mut [Sample]) -> usize {
        let len = dst.len();
        if len == 0 {
            return 0;
        }
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        if read_pos + len > write_pos {
            return 0;
        }
        // SAFETY: `[read_pos, write_pos)` has been published by the loader.
        unsafe {
            let data = (*self.storage.get()).as_ptr();
            std::ptr::copy_nonoverlapping(data.add(read_pos), dst.as_mut_ptr(), len);
        }
        self.read_pos.store(read_pos + len, Ordering::Release);
        len
    }
}

impl SampleSink for PremixBuffer {
    fn push(&self, samples: &[Sample]) -> usize {
        self.write(samples)
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn round_trip_is_exact() {
        let buffer = PlayBuffer::new();
        buffer.resize(16, false);
        let data: Vec<Sample> = (1..=8).collect();
        assert_eq!(buffer.write(&data), 8);
        let mut out = vec![0; 8];
        assert_eq!(buffer.read(&mut out), 8);
        assert_eq!(out, data);
    }

    #[test]
    fn refuses_partial_reads() {
        let buffer = PlayBuffer::new();
        buffer.resize(16, false);
        buffer.write(&[1, 2, 3, 4]);
        let mut out = vec![0; 6];
        assert_eq!(buffer.read(&mut out), 0);
        let mut out = vec![0; 4];
        assert_eq!(buffer.read(&mut out), 4);
    }

    #[test]
    fn wraps_around() {
        let buffer = PlayBuffer::new();
        buffer.resize(8, false);
        buffer.write(&[1, 2, 3, 4, 5, 6]);
        let mut out = vec![0; 4];
        assert_eq!(buffer.read(&mut out), 4);
        // write 4 more, which wraps past the end of the ring
        assert_eq!(buffer.write(&[7, 8, 9, 10]), 4);
        let mut out = vec![0; 6];
        assert_eq!(buffer.read(&mut out), 6);
        assert_eq!(out, vec![5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn rejects_oversized_writes() {
        let buffer = PlayBuffer::new();
        buffer.resize(4, false);
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5, 6]), 0);
    }

    #[test]
    fn overwrite_mode_advances_the_reader() {
        let buffer = PlayBuffer::new();
        buffer.resize(8, true);
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5, 6, 7, 8]), 8);
        // full: the next write drops the oldest four samples
        assert_eq!(buffer.write(&[9, 10, 11, 12]), 4);
        let mut out = vec![0; 8];
        assert_eq!(buffer.read(&mut out), 8);
        assert_eq!(out, vec![5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn blocked_writer_resumes_after_read() {
        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(8, false);
        buffer.write(&[0; 8]);
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.write(&[1, 2, 3, 4]))
        };
        std::thread::sleep(Duration::from_millis(50));
        let mut out = vec![0; 4];
        assert_eq!(buffer.read(&mut out), 4);
        assert_eq!(writer.join().unwrap(), 4);
    }

    #[test]
    fn close_unblocks_a_pending_writer() {
        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(4, false);
        buffer.write(&[0; 4]);
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.write(&[1, 2]))
        };
        std::thread::sleep(Duration::from_millis(50));
        buffer.close();
        assert_eq!(writer.join().unwrap(), 0);
    }

    #[test]
    fn premix_appends_and_reads_linearly() {
        let buffer = PremixBuffer::new(16);
        assert_eq!(buffer.write(&[1, 2, 3, 4]), 4);
        assert_eq!(buffer.write(&[5, 6]), 2);
        let mut out = vec![0; 6];
        assert_eq!(buffer.read(&mut out), 6);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
        // nothing left: all-or-nothing read refuses
        let mut out = vec![0; 2];
        assert_eq!(buffer.read(&mut out), 0);
    }

    #[test]
    fn premix_stops_at_capacity() {
        let buffer = PremixBuffer::new(4);
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(buffer.write(&[7, 8]), 0);
    }

    #[test]
    fn premix_cross_fade_is_equal_power_at_the_centre() {
        // 100 frames of old content, fade window over all of it
        let frames = 100usize;
        let buffer = PremixBuffer::new(frames * 4);
        let level = 10_000 as Sample;
        buffer.write(&vec![level; frames * 2]);
        buffer.set_cross_fade_zone(0, frames * 2);
        buffer.write(&vec![level; frames * 2]);

        let mut out = vec![0; frames * 2];
        assert_eq!(buffer.read(&mut out), frames * 2);
        // first sample: pure old content; last: pure new content
        assert!((out[0] as f32 - level as f32).abs() / level as f32 <= 0.05);
        assert!((out[frames * 2 - 2] as f32 - level as f32).abs() / level as f32 <= 0.05);
        // centre: both x² tapers at 0.25, summing to half level
        let centre = out[frames / 2 * 2] as f32;
        let expected = level as f32 * 0.5;
        assert!(
            (centre - expected).abs() / expected <= 0.06,
            "centre {} expected {}",
            centre,
            expected
        );
    }

    #[test]
    fn premix_eject_disarms_and_rewinds() {
        let buffer = PremixBuffer::new(16);
        buffer.write(&[1, 2, 3, 4]);
        buffer.set_cross_fade_zone(0, 4);
        buffer.eject();
        assert_eq!(buffer.write_position(), 0);
        assert_eq!(buffer.read_position(), 0);
        assert_eq!(buffer.write(&[9, 9]), 2);
        let mut out = vec![0; 2];
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(out, vec![9, 9]);
    }
}
