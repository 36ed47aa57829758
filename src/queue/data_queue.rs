//! Single-writer/single-reader byte ring carrying variable-length records.
//!
//! Each record is stored contiguously as a little-endian `u32` length header
//! followed by the payload. When a record does not fit at the tail, the rest
//! of the tail is skipped and the record is written at the start of the ring.

use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{CaptureError, Result};

const HEADER: usize = 4;

struct DataState {
    buf: Vec<u8>,
    rp: usize,
    wp: usize,
    /// End of valid data at the tail once the writer has wrapped.
    fill_end: usize,
    records: usize,
    /// Start and total size of the record currently held by the reader.
    locked: Option<(usize, usize)>,
    quit: bool,
}

impl DataState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn reset(&mut self) {
        self.rp = 0;
        self.wp = 0;
        self.fill_end = self.capacity();
        self.records = 0;
        self.locked = None;
    }

    /// Finds a contiguous region of `total` bytes for the next record.
    ///
    /// Returns the start and, when the record wraps to the front, the tail
    /// position that becomes `fill_end` once the record is committed.
    fn reserve(&mut self, total: usize) -> Option<(usize, Option<usize>)> {
        if self.records == 0 {
            self.reset();
            return (total <= self.capacity()).then_some((0, None));
        }
        if self.wp > self.rp {
            if total <= self.capacity() - self.wp {
                return Some((self.wp, None));
            }
            if total <= self.rp {
                return Some((0, Some(self.wp)));
            }
            return None;
        }
        (total <= self.rp - self.wp).then_some((self.wp, None))
    }

    /// Position of the oldest record, wrapping past the skipped tail.
    fn front(&mut self) -> usize {
        if self.rp >= self.fill_end || self.rp + HEADER > self.capacity() {
            self.rp = 0;
            self.fill_end = self.capacity();
        }
        self.rp
    }

    fn record_len(&self, at: usize) -> usize {
        let mut header = [0u8; HEADER];
        header.copy_from_slice(&self.buf[at..at + HEADER]);
        u32::from_le_bytes(header) as usize
    }

    fn used(&self) -> usize {
        if self.records == 0 {
            0
        } else if self.wp > self.rp {
            self.wp - self.rp
        } else {
            self.fill_end - self.rp + self.wp
        }
    }
}

/// Bounded byte ring used to hand encoded output to a reader without
/// allocating per record.
///
/// The writer reserves space with [`get_buffer`](DataQueue::get_buffer),
/// fills it and commits; the reader takes the oldest record with
/// [`read_lock`](DataQueue::read_lock) and frees its space with
/// [`read_unlock`](DataQueue::read_unlock). A record keeps its ring space
/// until it is unlocked, so a slow reader applies backpressure to the writer.
///
/// # Example
///
/// ```
/// use stream_capture::queue::DataQueue;
///
/// let q = DataQueue::new(64);
/// q.push(b"hello").unwrap();
/// let record = q.read_lock().unwrap();
/// assert_eq!(&record[..], b"hello");
/// q.read_unlock().unwrap();
/// assert!(!q.have_data());
/// ```
pub struct DataQueue {
    state: Mutex<DataState>,
    readable: Condvar,
    writable: Condvar,
}

/// Reserved space in a [`DataQueue`], released on drop unless committed.
pub struct WriteBuffer<'a> {
    queue: &'a DataQueue,
    state: MutexGuard<'a, DataState>,
    start: usize,
    size: usize,
    wrap_end: Option<usize>,
}

impl WriteBuffer<'_> {
    /// Publishes the first `len` bytes of the buffer as one record.
    pub fn commit(mut self, len: usize) -> Result<()> {
        if len > self.size {
            return Err(CaptureError::invalid_arg(format!(
                "commit of {len} bytes exceeds reserved {}",
                self.size
            )));
        }
        let start = self.start;
        self.state.buf[start..start + HEADER].copy_from_slice(&(len as u32).to_le_bytes());
        if let Some(end) = self.wrap_end {
            self.state.fill_end = end;
        }
        self.state.wp = start + HEADER + len;
        self.state.records += 1;
        let queue = self.queue;
        drop(self);
        queue.readable.notify_all();
        Ok(())
    }
}

impl Deref for WriteBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.state.buf[self.start + HEADER..self.start + HEADER + self.size]
    }
}

impl DerefMut for WriteBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let (start, size) = (self.start, self.size);
        &mut self.state.buf[start + HEADER..start + HEADER + size]
    }
}

impl DataQueue {
    /// Creates a ring of `capacity` bytes, headers included.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(HEADER + 1);
        Self {
            state: Mutex::new(DataState {
                buf: vec![0; capacity],
                rp: 0,
                wp: 0,
                fill_end: capacity,
                records: 0,
                locked: None,
                quit: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Total ring size in bytes.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Reserves `size` contiguous payload bytes, blocking until the reader
    /// frees enough space.
    pub fn get_buffer(&self, size: usize) -> Result<WriteBuffer<'_>> {
        let mut state = self.state.lock();
        let total = size + HEADER;
        if total > state.capacity() {
            return Err(CaptureError::invalid_arg(format!(
                "record of {size} bytes exceeds queue capacity {}",
                state.capacity()
            )));
        }
        loop {
            if state.quit {
                return Err(CaptureError::Interrupted);
            }
            if let Some((start, wrap_end)) = state.reserve(total) {
                return Ok(WriteBuffer {
                    queue: self,
                    state,
                    start,
                    size,
                    wrap_end,
                });
            }
            self.writable.wait(&mut state);
        }
    }

    /// Copies `data` into the queue as one record.
    pub fn push(&self, data: &[u8]) -> Result<()> {
        let mut buffer = self.get_buffer(data.len())?;
        buffer.copy_from_slice(data);
        buffer.commit(data.len())
    }

    /// Copies several slices into the queue as a single record.
    pub fn push_parts(&self, parts: &[&[u8]]) -> Result<()> {
        let size = parts.iter().map(|p| p.len()).sum();
        let mut buffer = self.get_buffer(size)?;
        let mut at = 0;
        for part in parts {
            buffer[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        buffer.commit(size)
    }

    /// Returns the oldest record, blocking until one is available.
    ///
    /// The record stays in the ring until [`read_unlock`](DataQueue::read_unlock).
    pub fn read_lock(&self) -> Result<Bytes> {
        let mut state = self.state.lock();
        loop {
            if state.quit {
                return Err(CaptureError::Interrupted);
            }
            if state.records > 0 && state.locked.is_none() {
                return Ok(Self::lock_front(&mut state));
            }
            self.readable.wait(&mut state);
        }
    }

    /// Returns the oldest record if one is available.
    pub fn try_read_lock(&self) -> Result<Option<Bytes>> {
        let mut state = self.state.lock();
        if state.quit {
            return Err(CaptureError::Interrupted);
        }
        if state.locked.is_some() {
            return Err(CaptureError::invalid_state("a record is already locked"));
        }
        if state.records == 0 {
            return Ok(None);
        }
        Ok(Some(Self::lock_front(&mut state)))
    }

    fn lock_front(state: &mut DataState) -> Bytes {
        let at = state.front();
        let len = state.record_len(at);
        state.locked = Some((at, HEADER + len));
        Bytes::copy_from_slice(&state.buf[at + HEADER..at + HEADER + len])
    }

    /// Frees the record returned by the last `read_lock`.
    pub fn read_unlock(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some((at, total)) = state.locked.take() else {
            return Err(CaptureError::invalid_state("no record is locked"));
        };
        state.rp = at + total;
        state.records -= 1;
        if state.records == 0 {
            state.reset();
        }
        drop(state);
        self.writable.notify_all();
        Ok(())
    }

    /// Releases the lock on the current record without consuming it.
    pub fn peek_unlock(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.locked.take().is_none() {
            return Err(CaptureError::invalid_state("no record is locked"));
        }
        drop(state);
        self.readable.notify_all();
        Ok(())
    }

    /// Returns `true` if a record is ready to be locked.
    pub fn have_data(&self) -> bool {
        let state = self.state.lock();
        state.records > 0 && state.locked.is_none()
    }

    /// Returns `(record count, bytes in use)`.
    pub fn query(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.records, state.used())
    }

    /// Drops every queued record, including a locked one.
    pub fn consume_all(&self) {
        self.state.lock().reset();
        self.writable.notify_all();
    }

    /// Interrupts current and future blocking calls.
    pub fn wakeup(&self) {
        self.state.lock().quit = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_push_and_read_in_order() {
        let q = DataQueue::new(128);
        q.push(b"one").unwrap();
        q.push(b"two").unwrap();
        assert_eq!(q.query(), (2, 14));

        assert_eq!(&q.read_lock().unwrap()[..], b"one");
        q.read_unlock().unwrap();
        assert_eq!(&q.read_lock().unwrap()[..], b"two");
        q.read_unlock().unwrap();
        assert_eq!(q.query(), (0, 0));
    }

    #[test]
    fn test_get_buffer_commit_shorter() {
        let q = DataQueue::new(64);
        let mut buffer = q.get_buffer(16).unwrap();
        buffer[..3].copy_from_slice(b"abc");
        buffer.commit(3).unwrap();
        assert_eq!(&q.read_lock().unwrap()[..], b"abc");
    }

    #[test]
    fn test_dropped_buffer_is_cancelled() {
        let q = DataQueue::new(64);
        {
            let _buffer = q.get_buffer(8).unwrap();
        }
        assert!(!q.have_data());
    }

    #[test]
    fn test_record_too_large() {
        let q = DataQueue::new(16);
        assert!(matches!(
            q.get_buffer(13),
            Err(CaptureError::InvalidArg { .. })
        ));
        assert!(q.get_buffer(12).is_ok());
    }

    #[test]
    fn test_wraps_around_tail() {
        let q = DataQueue::new(32);
        q.push(&[1; 10]).unwrap(); // 0..14
        q.push(&[2; 10]).unwrap(); // 14..28
        assert_eq!(&q.read_lock().unwrap()[..], &[1; 10]);
        q.read_unlock().unwrap();

        // 4 bytes left at the tail, so this record goes to the front.
        q.push(&[3; 8]).unwrap();
        assert_eq!(&q.read_lock().unwrap()[..], &[2; 10]);
        q.read_unlock().unwrap();
        assert_eq!(&q.read_lock().unwrap()[..], &[3; 8]);
        q.read_unlock().unwrap();
    }

    #[test]
    fn test_cancelled_wrap_keeps_tail() {
        let q = DataQueue::new(32);
        q.push(&[1; 10]).unwrap();
        q.push(&[2; 10]).unwrap();
        assert_eq!(&q.read_lock().unwrap()[..], &[1; 10]);
        q.read_unlock().unwrap();

        // Would wrap to the front, but is dropped uncommitted.
        drop(q.get_buffer(8).unwrap());
        // Fits in the 4 bytes left at the tail.
        q.push(b"").unwrap();

        assert_eq!(&q.read_lock().unwrap()[..], &[2; 10]);
        q.read_unlock().unwrap();
        assert!(q.read_lock().unwrap().is_empty());
        q.read_unlock().unwrap();
        assert_eq!(q.query(), (0, 0));
    }

    #[test]
    fn test_try_read_lock_empty() {
        let q = DataQueue::new(32);
        assert_eq!(q.try_read_lock().unwrap(), None);
        q.push(b"x").unwrap();
        assert_eq!(q.try_read_lock().unwrap().as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn test_peek_unlock_keeps_record() {
        let q = DataQueue::new(32);
        q.push(b"keep").unwrap();
        q.read_lock().unwrap();
        assert!(!q.have_data());
        q.peek_unlock().unwrap();
        assert!(q.have_data());
        assert_eq!(&q.read_lock().unwrap()[..], b"keep");
    }

    #[test]
    fn test_unlock_without_lock() {
        let q = DataQueue::new(32);
        assert!(q.read_unlock().is_err());
    }

    #[test]
    fn test_writer_blocks_until_reader_frees_space() {
        let q = Arc::new(DataQueue::new(24));
        q.push(&[0; 16]).unwrap();

        let writer = {
            let q = q.clone();
            thread::spawn(move || q.push(&[9; 16]))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.query().0, 1);

        q.read_lock().unwrap();
        q.read_unlock().unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(&q.read_lock().unwrap()[..], &[9; 16]);
    }

    #[test]
    fn test_wakeup_interrupts_reader() {
        let q = Arc::new(DataQueue::new(32));
        let reader = {
            let q = q.clone();
            thread::spawn(move || q.read_lock())
        };
        thread::sleep(Duration::from_millis(20));
        q.wakeup();
        assert_eq!(reader.join().unwrap(), Err(CaptureError::Interrupted));
    }

    #[test]
    fn test_consume_all() {
        let q = DataQueue::new(64);
        q.push(b"a").unwrap();
        q.push(b"b").unwrap();
        q.consume_all();
        assert!(!q.have_data());
        assert_eq!(q.query(), (0, 0));
    }

    #[test]
    fn test_push_parts() {
        let q = DataQueue::new(64);
        q.push_parts(&[&7u32.to_le_bytes(), b"data"]).unwrap();
        let record = q.read_lock().unwrap();
        assert_eq!(record.len(), 8);
        assert_eq!(&record[4..], b"data");
    }
}
