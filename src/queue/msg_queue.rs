//! Fixed-capacity blocking message queue.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use crate::error::{CaptureError, Result};

struct MsgState<T> {
    ring: HeapRb<T>,
    /// Bumped by `wakeup`; waiters that observe a change return `Interrupted`.
    epoch: u64,
    closed: bool,
}

/// A bounded FIFO handing messages between threads.
///
/// Senders block while the queue is full and receivers block while it is
/// empty. [`wakeup`](MsgQueue::wakeup) interrupts every call blocked at that
/// moment without poisoning later calls; [`close`](MsgQueue::close) interrupts
/// all current and future blocking calls.
///
/// # Example
///
/// ```
/// use stream_capture::queue::MsgQueue;
///
/// let q = MsgQueue::new(2);
/// q.send(1u32).unwrap();
/// q.send(2u32).unwrap();
/// assert!(q.try_send(3).is_err());
/// assert_eq!(q.recv().unwrap(), 1);
/// assert_eq!(q.try_recv(), Some(2));
/// assert_eq!(q.try_recv(), None);
/// ```
pub struct MsgQueue<T> {
    state: Mutex<MsgState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> MsgQueue<T> {
    /// Creates a queue holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(MsgState {
                ring: HeapRb::new(capacity),
                epoch: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sends a message, blocking while the queue is full.
    pub fn send(&self, msg: T) -> Result<()> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        let mut msg = msg;
        loop {
            if state.closed || state.epoch != epoch {
                return Err(CaptureError::Interrupted);
            }
            match state.ring.try_push(msg) {
                Ok(()) => {
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                Err(back) => {
                    msg = back;
                    self.not_full.wait(&mut state);
                }
            }
        }
    }

    /// Sends a message without blocking, handing it back if the queue is full or closed.
    pub fn try_send(&self, msg: T) -> std::result::Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(msg);
        }
        state.ring.try_push(msg)?;
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Receives a message, blocking while the queue is empty.
    pub fn recv(&self) -> Result<T> {
        self.recv_inner(None)
    }

    /// Receives a message, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        self.recv_inner(Some(timeout))
    }

    fn recv_inner(&self, timeout: Option<Duration>) -> Result<T> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        loop {
            if state.closed || state.epoch != epoch {
                return Err(CaptureError::Interrupted);
            }
            if let Some(msg) = state.ring.try_pop() {
                drop(state);
                self.not_full.notify_one();
                return Ok(msg);
            }
            match timeout {
                Some(limit) => {
                    if self.not_empty.wait_for(&mut state, limit).timed_out() {
                        return Err(CaptureError::Timeout);
                    }
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Receives a message if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        let msg = self.state.lock().ring.try_pop();
        if msg.is_some() {
            self.not_full.notify_one();
        }
        msg
    }

    /// Removes and returns every queued message.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(state.ring.occupied_len());
        while let Some(msg) = state.ring.try_pop() {
            out.push(msg);
        }
        drop(state);
        self.not_full.notify_all();
        out
    }

    /// Interrupts every call currently blocked on this queue.
    ///
    /// Queued messages are kept, and later calls behave normally.
    pub fn wakeup(&self) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Interrupts current and future blocking calls.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Returns `true` once [`close`](MsgQueue::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().ring.occupied_len()
    }

    /// Returns `true` if no message is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = MsgQueue::new(4);
        for i in 0..4 {
            q.send(i).unwrap();
        }
        assert_eq!(q.len(), 4);
        for i in 0..4 {
            assert_eq!(q.recv().unwrap(), i);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_try_send_full() {
        let q = MsgQueue::new(1);
        q.try_send(1).unwrap();
        assert_eq!(q.try_send(2), Err(2));
    }

    #[test]
    fn test_zero_capacity_rounds_up() {
        let q = MsgQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.try_send(1).unwrap();
    }

    #[test]
    fn test_recv_timeout() {
        let q: MsgQueue<u8> = MsgQueue::new(1);
        let err = q.recv_timeout(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err, CaptureError::Timeout);
    }

    #[test]
    fn test_send_blocks_until_recv() {
        let q = Arc::new(MsgQueue::new(1));
        q.send(1).unwrap();

        let q2 = q.clone();
        let handle = thread::spawn(move || q2.send(2));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.recv().unwrap(), 1);
        handle.join().unwrap().unwrap();
        assert_eq!(q.recv().unwrap(), 2);
    }

    #[test]
    fn test_wakeup_interrupts_blocked_recv() {
        let q: Arc<MsgQueue<u8>> = Arc::new(MsgQueue::new(1));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.recv());

        thread::sleep(Duration::from_millis(20));
        q.wakeup();
        assert_eq!(handle.join().unwrap(), Err(CaptureError::Interrupted));

        // Later calls are not affected.
        q.send(5).unwrap();
        assert_eq!(q.recv().unwrap(), 5);
    }

    #[test]
    fn test_close_rejects_future_calls() {
        let q = MsgQueue::new(2);
        q.send(1).unwrap();
        q.close();
        assert!(q.is_closed());
        assert_eq!(q.recv(), Err(CaptureError::Interrupted));
        assert_eq!(q.send(2), Err(CaptureError::Interrupted));
        assert_eq!(q.try_send(3), Err(3));
    }

    #[test]
    fn test_drain() {
        let q = MsgQueue::new(3);
        q.send('a').unwrap();
        q.send('b').unwrap();
        assert_eq!(q.drain(), vec!['a', 'b']);
        assert!(q.is_empty());
    }
}
