//! Reference-counted fan-out of one producer to several consumer ports.
//!
//! Every item added to a [`ShareQueue`] is tracked in a fixed arena of slots.
//! Each enabled port receives a [`Shared`] copy carrying the slot's
//! [`Ticket`]; the producer's release callback runs once the last port has
//! handed its ticket back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::MsgQueue;
use crate::error::{CaptureError, Result};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a tracked item: the owning queue, its arena slot, and the
/// generation the slot had when the item was added.
///
/// Releasing a ticket whose slot has since been recycled, or that belongs to
/// another queue, is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    queue: u64,
    slot: usize,
    generation: u64,
}

/// An item handed out by a [`ShareQueue`] port.
#[derive(Debug, Clone)]
pub struct Shared<T> {
    ticket: Ticket,
    item: T,
}

impl<T> Shared<T> {
    /// Ticket to pass to [`ShareQueue::release`].
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Borrows the item.
    pub fn item(&self) -> &T {
        &self.item
    }

    /// Splits into ticket and item.
    pub fn into_parts(self) -> (Ticket, T) {
        (self.ticket, self.item)
    }
}

/// Callback invoked exactly once per item when its last reference is released.
pub type ReleaseFn<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Slot<T> {
    generation: u64,
    refs: usize,
    item: Option<T>,
}

struct Port<T> {
    queue: Arc<MsgQueue<Shared<T>>>,
    /// Queue installed by `set_port_queue`; drained by its owner, not here.
    external: bool,
    enabled: bool,
    once: bool,
    once_finished: bool,
}

struct ShareState<T> {
    slots: Vec<Slot<T>>,
    ports: Vec<Port<T>>,
}

impl<T> ShareState<T> {
    fn enabled_count(&self) -> usize {
        self.ports.iter().filter(|p| p.enabled).count()
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.item.is_none())
    }

    fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.item.is_some()).count()
    }
}

/// One-producer, N-consumer frame distributor.
///
/// - [`add`](ShareQueue::add) pushes a copy of the item to every enabled port
///   and tracks a reference count equal to the number of ports it reached.
///   With no enabled port the item is released at once and never queued.
/// - [`release`](ShareQueue::release) decrements the count; the release
///   callback runs when it reaches zero. Unknown or stale tickets are ignored.
/// - Disabling a port drains and releases everything still queued for it and
///   wakes a consumer blocked in [`recv`](ShareQueue::recv).
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use stream_capture::queue::ShareQueue;
///
/// let released = Arc::new(AtomicUsize::new(0));
/// let counter = released.clone();
/// let q = ShareQueue::new(2, 4, move |_item: u32| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
/// q.enable(0, true).unwrap();
/// q.enable(1, true).unwrap();
///
/// q.add(7).unwrap();
/// let a = q.recv(0).unwrap();
/// let b = q.recv(1).unwrap();
/// q.release(a.ticket());
/// assert_eq!(released.load(Ordering::SeqCst), 0);
/// q.release(b.ticket());
/// assert_eq!(released.load(Ordering::SeqCst), 1);
/// ```
pub struct ShareQueue<T> {
    id: u64,
    state: Mutex<ShareState<T>>,
    slot_freed: Condvar,
    release_fn: ReleaseFn<T>,
    add_timeout: Duration,
}

impl<T: Clone + Send> ShareQueue<T> {
    /// Default bounded wait of [`add`](ShareQueue::add) when every slot is in flight.
    pub const DEFAULT_ADD_TIMEOUT: Duration = Duration::from_millis(100);

    /// Creates a queue with `ports` consumer ports, tracking at most `depth`
    /// items in flight. All ports start disabled.
    pub fn new<F>(ports: usize, depth: usize, release: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let depth = depth.max(1);
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ShareState {
                slots: (0..depth)
                    .map(|_| Slot {
                        generation: 0,
                        refs: 0,
                        item: None,
                    })
                    .collect(),
                ports: (0..ports)
                    .map(|_| Port {
                        queue: Arc::new(MsgQueue::new(depth)),
                        external: false,
                        enabled: false,
                        once: false,
                        once_finished: false,
                    })
                    .collect(),
            }),
            slot_freed: Condvar::new(),
            release_fn: Arc::new(release),
            add_timeout: Self::DEFAULT_ADD_TIMEOUT,
        }
    }

    /// Sets how long [`add`](ShareQueue::add) waits for a free slot.
    #[must_use]
    pub fn with_add_timeout(mut self, timeout: Duration) -> Self {
        self.add_timeout = timeout;
        self
    }

    /// Number of consumer ports.
    pub fn port_count(&self) -> usize {
        self.state.lock().ports.len()
    }

    fn check_port(state: &ShareState<T>, index: usize) -> Result<()> {
        if index >= state.ports.len() {
            return Err(CaptureError::invalid_arg(format!(
                "port {index} out of range ({} ports)",
                state.ports.len()
            )));
        }
        Ok(())
    }

    /// Replaces the message queue behind a port.
    ///
    /// Lets several share queues feed one consumer thread. The queue must be
    /// able to hold one entry per slot of every queue feeding it. Disabling
    /// the port only wakes the external queue; its owner drains it.
    pub fn set_port_queue(&self, index: usize, queue: Arc<MsgQueue<Shared<T>>>) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_port(&state, index)?;
        let port = &mut state.ports[index];
        port.queue = queue;
        port.external = true;
        Ok(())
    }

    /// Returns the message queue behind a port.
    pub fn port_queue(&self, index: usize) -> Result<Arc<MsgQueue<Shared<T>>>> {
        let state = self.state.lock();
        Self::check_port(&state, index)?;
        Ok(state.ports[index].queue.clone())
    }

    /// Enables or disables a port.
    ///
    /// Disabling releases every item still queued for the port and wakes a
    /// consumer blocked on it.
    pub fn enable(&self, index: usize, enable: bool) -> Result<()> {
        let queue = {
            let mut state = self.state.lock();
            Self::check_port(&state, index)?;
            let port = &mut state.ports[index];
            port.enabled = enable;
            if enable {
                return Ok(());
            }
            if port.external {
                port.queue.wakeup();
                return Ok(());
            }
            port.queue.clone()
        };
        let pending = queue.drain();
        let drained = pending.len();
        for shared in pending {
            self.release(shared.ticket);
        }
        queue.wakeup();
        if drained > 0 {
            tracing::debug!(port = index, drained, "share queue port disabled");
        }
        Ok(())
    }

    /// Interrupts a consumer blocked on a port without touching its items.
    pub fn wake(&self, index: usize) -> Result<()> {
        self.port_queue(index)?.wakeup();
        Ok(())
    }

    /// Arms or disarms fetch-once mode: an armed port receives exactly one
    /// more item and is then skipped until re-armed.
    pub fn enable_once(&self, index: usize, enable: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_port(&state, index)?;
        let port = &mut state.ports[index];
        port.once = enable;
        port.once_finished = false;
        Ok(())
    }

    /// Returns `true` if the port is enabled.
    pub fn is_enabled(&self, index: usize) -> bool {
        self.state
            .lock()
            .ports
            .get(index)
            .is_some_and(|p| p.enabled)
    }

    /// Fans an item out to every enabled port.
    ///
    /// With no enabled port the release callback runs before this returns.
    /// When every slot is in flight the call waits up to the add timeout for a
    /// consumer to release one; on expiry the item is released and
    /// [`CaptureError::Timeout`] is returned.
    pub fn add(&self, item: T) -> Result<()> {
        let mut state = self.state.lock();
        if state.enabled_count() == 0 {
            drop(state);
            (self.release_fn)(item);
            return Ok(());
        }

        let deadline = Instant::now() + self.add_timeout;
        let slot = loop {
            if let Some(slot) = state.free_slot() {
                break slot;
            }
            if self.slot_freed.wait_until(&mut state, deadline).timed_out() {
                match state.free_slot() {
                    Some(slot) => break slot,
                    None => {
                        drop(state);
                        tracing::warn!("share queue full, dropping item");
                        (self.release_fn)(item);
                        return Err(CaptureError::Timeout);
                    }
                }
            }
        };

        // Ports may have been disabled while waiting.
        let targets: Vec<usize> = state
            .ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.enabled && !p.once_finished)
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            drop(state);
            (self.release_fn)(item);
            return Ok(());
        }

        let generation = state.slots[slot].generation.wrapping_add(1);
        let ticket = Ticket {
            queue: self.id,
            slot,
            generation,
        };
        state.slots[slot] = Slot {
            generation,
            refs: targets.len(),
            item: Some(item.clone()),
        };

        let mut missed = 0;
        for &index in &targets {
            let port = &mut state.ports[index];
            let shared = Shared {
                ticket,
                item: item.clone(),
            };
            if port.queue.try_send(shared).is_err() {
                missed += 1;
                tracing::warn!(port = index, "share queue port rejected item");
                continue;
            }
            if port.once {
                port.once_finished = true;
            }
        }

        let finished = if missed > 0 {
            let entry = &mut state.slots[slot];
            entry.refs -= missed;
            if entry.refs == 0 {
                entry.item.take()
            } else {
                None
            }
        } else {
            None
        };
        drop(state);
        if let Some(item) = finished {
            self.slot_freed.notify_all();
            (self.release_fn)(item);
        }
        Ok(())
    }

    /// Blocking receive from one port.
    ///
    /// Returns [`CaptureError::Interrupted`] when the port is disabled, or is
    /// disabled or woken while waiting.
    pub fn recv(&self, index: usize) -> Result<Shared<T>> {
        self.enabled_port_queue(index)?.recv()
    }

    /// Receive from one port, waiting at most `timeout`.
    pub fn recv_timeout(&self, index: usize, timeout: Duration) -> Result<Shared<T>> {
        self.enabled_port_queue(index)?.recv_timeout(timeout)
    }

    fn enabled_port_queue(&self, index: usize) -> Result<Arc<MsgQueue<Shared<T>>>> {
        let state = self.state.lock();
        Self::check_port(&state, index)?;
        let port = &state.ports[index];
        if !port.enabled {
            return Err(CaptureError::Interrupted);
        }
        Ok(port.queue.clone())
    }

    /// Non-blocking receive from one port.
    pub fn try_recv(&self, index: usize) -> Result<Option<Shared<T>>> {
        Ok(self.port_queue(index)?.try_recv())
    }

    /// Drops one reference to a tracked item.
    ///
    /// Returns `true` if this was the last reference and the release callback ran.
    /// Tickets for items no longer tracked are ignored.
    pub fn release(&self, ticket: Ticket) -> bool {
        if ticket.queue != self.id {
            return false;
        }
        let mut state = self.state.lock();
        let Some(entry) = state.slots.get_mut(ticket.slot) else {
            return false;
        };
        if entry.generation != ticket.generation || entry.item.is_none() || entry.refs == 0 {
            return false;
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        let item = entry.item.take();
        drop(state);
        self.slot_freed.notify_all();
        if let Some(item) = item {
            (self.release_fn)(item);
        }
        true
    }

    /// Drains every enabled port without blocking, releasing what was queued.
    /// External port queues are left to their owner.
    ///
    /// Returns the number of references released.
    pub fn recv_all(&self) -> usize {
        let queues: Vec<Arc<MsgQueue<Shared<T>>>> = self
            .state
            .lock()
            .ports
            .iter()
            .filter(|p| p.enabled && !p.external)
            .map(|p| p.queue.clone())
            .collect();
        let mut count = 0;
        for queue in queues {
            for shared in queue.drain() {
                self.release(shared.ticket);
                count += 1;
            }
        }
        count
    }

    /// Number of items currently tracked (added but not fully released).
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight()
    }

    /// Waits until every tracked item has been released, up to `timeout`.
    pub fn wait_empty(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.in_flight() > 0 {
            if self.slot_freed.wait_until(&mut state, deadline).timed_out() && state.in_flight() > 0 {
                return Err(CaptureError::Timeout);
            }
        }
        Ok(())
    }
}

impl<T> Drop for ShareQueue<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for port in &state.ports {
            port.queue.wakeup();
        }
        // Items still in flight are handed back to the producer.
        for slot in &mut state.slots {
            if let Some(item) = slot.item.take() {
                (self.release_fn)(item);
            }
        }
    }
}
