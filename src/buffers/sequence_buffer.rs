use crate::buffers::delivery_gate::DeliveryGate;
use crate::seqno_list::SeqnoList;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// the buffer reached its capacity and is still open, space may become available
    Full,
    /// the buffer reached its capacity and was closed, the element is dropped
    Closed,
}

impl Display for InsertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InsertError::Full => write!(f, "buffer is full"),
            InsertError::Closed => write!(f, "buffer is full and closed"),
        }
    }
}

impl std::error::Error for InsertError {}

/// Per-peer store of in-flight messages, keyed by sequence number.
///
/// Watermarks (all monotonically non-decreasing, `low <= highest_delivered <= high`):
/// * `low`: the highest purged seqno; nothing at or below it is stored
/// * `highest_delivered`: the highest seqno removed for delivery, or acknowledged on the sending side
/// * `high`: the highest seqno ever added
///
/// Every seqno in `(low, highest_delivered]` is stored (it was delivered and retained), so gaps
///  can only exist above `highest_delivered`.
///
/// The buffer is used on both sides of a connection. A sender adds outgoing messages and purges
///  them when they are acknowledged; a receiver adds incoming messages in any order, removes the
///  contiguous prefix for delivery, and reports the gaps for retransmission.
pub struct SequenceBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: Option<usize>,
    gate: DeliveryGate,
    space_available: Notify,
    send_lock: tokio::sync::Mutex<()>,
}

struct Inner<T> {
    entries: BTreeMap<u64, T>,
    low: u64,
    highest_delivered: u64,
    high: u64,
    open: bool,
}

impl<T> Inner<T> {
    fn highest_deliverable(&self) -> u64 {
        let mut result = self.highest_delivered;
        for &seqno in self.entries.range(self.highest_delivered + 1..).map(|(k, _)| k) {
            if seqno != result + 1 {
                break;
            }
            result = seqno;
        }
        result
    }
}

impl<T> Debug for SequenceBuffer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        write!(f, "[{} | {} | {}] (size={}, open={})", inner.low, inner.highest_delivered, inner.high, inner.entries.len(), inner.open)
    }
}

impl<T> SequenceBuffer<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> SequenceBuffer<T> {
    /// creates a buffer whose first expected seqno is `offset + 1`
    pub fn new(offset: u64) -> SequenceBuffer<T> {
        SequenceBuffer::with_capacity(offset, None)
    }

    /// A buffer with capacity accepts seqnos up to `low + capacity`, i.e. it bounds the number of
    ///  unpurged seqnos including gaps.
    pub fn with_capacity(offset: u64, capacity: Option<usize>) -> SequenceBuffer<T> {
        SequenceBuffer {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                low: offset,
                highest_delivered: offset,
                high: offset,
                open: true,
            }),
            capacity,
            gate: DeliveryGate::new(),
            space_available: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Adds an element. Returns `Ok(false)` if the seqno was already purged or is present, which
    ///  callers treat as a duplicate rather than an error.
    pub fn add(&self, seqno: u64, elem: T) -> Result<bool, InsertError> {
        let mut inner = self.lock();
        if seqno <= inner.low || inner.entries.contains_key(&seqno) {
            return Ok(false);
        }
        if let Some(capacity) = self.capacity {
            if seqno - inner.low > capacity as u64 {
                return Err(if inner.open { InsertError::Full } else { InsertError::Closed });
            }
        }

        inner.entries.insert(seqno, elem);
        inner.high = inner.high.max(seqno);
        Ok(true)
    }

    /// `true` if `seqno` is within capacity right now
    pub fn has_space_for(&self, seqno: u64) -> bool {
        match self.capacity {
            None => true,
            Some(capacity) => seqno.saturating_sub(self.lock().low) <= capacity as u64,
        }
    }

    /// Adds an element, waiting up to `max_wait` for space if the buffer is full. A waiter is woken
    ///  by a purge or by closing the buffer; a `Full` result means the caller should retry.
    pub async fn add_waiting(&self, seqno: u64, elem: T, max_wait: Duration) -> Result<bool, InsertError> {
        let notified = self.space_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match self.add(seqno, elem) {
            Err(InsertError::Full) => {
                let _ = tokio::time::timeout(max_wait, notified).await;
                Err(InsertError::Full)
            }
            other => other,
        }
    }

    pub fn get(&self, seqno: u64) -> Option<T> {
        self.lock().entries.get(&seqno).cloned()
    }

    pub fn contains(&self, seqno: u64) -> bool {
        self.lock().entries.contains_key(&seqno)
    }

    /// applies `f` to a stored element in place, under the buffer's lock
    pub fn update<R>(&self, seqno: u64, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock().entries.get_mut(&seqno).map(f)
    }

    /// Removes up to `max` elements of the deliverable prefix, advancing `highest_delivered`.
    ///
    /// With `nullify`, removed elements are dropped from the buffer and `low` follows; otherwise
    ///  they are retained (e.g. for retransmission to other members) until purged. Consumed
    ///  elements for which `filter` returns `false` advance the watermarks without being returned.
    ///
    /// Returns `None` if nothing was deliverable.
    pub fn remove_many(&self, nullify: bool, max: usize, mut filter: impl FnMut(&T) -> bool) -> Option<Vec<T>> {
        let mut inner = self.lock();
        let mut result = Vec::new();
        let mut consumed = 0;

        while consumed < max {
            let next = inner.highest_delivered + 1;
            let elem = if nullify {
                inner.entries.remove(&next)
            }
            else {
                inner.entries.get(&next).cloned()
            };
            let Some(elem) = elem else {
                break;
            };

            inner.highest_delivered = next;
            consumed += 1;
            if filter(&elem) {
                result.push(elem);
            }
        }

        if consumed == 0 {
            return None;
        }
        if nullify {
            inner.low = inner.highest_delivered;
            drop(inner);
            self.space_available.notify_waiters();
        }
        Some(result)
    }

    /// The gaps above `highest_delivered`, sorted ascending and capped at `limit` entries.
    ///  Returns `None` if there are no gaps.
    pub fn missing(&self, limit: usize) -> Option<SeqnoList> {
        let inner = self.lock();
        let mut result = SeqnoList::new();
        let mut expected = inner.highest_delivered + 1;
        if expected > inner.high {
            return None;
        }

        'outer: for &seqno in inner.entries.range(expected..=inner.high).map(|(k, _)| k) {
            while expected < seqno {
                if result.len() >= limit {
                    break 'outer;
                }
                result.add(expected);
                expected += 1;
            }
            expected = seqno + 1;
        }

        if result.is_empty() {
            None
        }
        else {
            Some(result)
        }
    }

    pub fn num_missing(&self) -> u64 {
        let inner = self.lock();
        let stored_above = inner.entries.range(inner.highest_delivered + 1..).count() as u64;
        inner.high - inner.highest_delivered - stored_above
    }

    /// Drops all elements `<= seqno` and advances `low`, returning the number of dropped elements.
    ///
    /// A regular purge never goes beyond `highest_delivered`, so it cannot drop undelivered
    ///  messages. A forced purge (an acknowledgment on the sending side) can go up to `high`.
    pub fn purge(&self, seqno: u64, force: bool) -> usize {
        let mut inner = self.lock();
        let target = if force {
            seqno.min(inner.high)
        }
        else {
            seqno.min(inner.highest_delivered)
        };
        if target <= inner.low {
            return 0;
        }

        let retained = inner.entries.split_off(&(target + 1));
        let num_purged = std::mem::replace(&mut inner.entries, retained).len();
        inner.low = target;
        inner.highest_delivered = inner.highest_delivered.max(target);
        drop(inner);

        self.space_available.notify_waiters();
        num_purged
    }

    pub fn low(&self) -> u64 {
        self.lock().low
    }

    pub fn high(&self) -> u64 {
        self.lock().high
    }

    pub fn highest_delivered(&self) -> u64 {
        self.lock().highest_delivered
    }

    /// the highest seqno such that all seqnos from `low + 1` up to it are present or delivered
    pub fn highest_deliverable(&self) -> u64 {
        self.lock().highest_deliverable()
    }

    /// Overwrites `highest_delivered`, used when a digest is installed for the local member. The
    ///  value is kept within `[low, high]`.
    pub fn set_highest_delivered(&self, seqno: u64) {
        let mut inner = self.lock();
        inner.highest_delivered = seqno.clamp(inner.low, inner.high);
    }

    /// `(highest_delivered, high)`
    pub fn digest(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.highest_delivered, inner.high)
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// A closed buffer releases tasks waiting for space, and inserts beyond capacity are dropped
    ///  instead of waiting.
    pub fn open(&self, open: bool) {
        self.lock().open = open;
        if !open {
            self.space_available.notify_waiters();
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn gate(&self) -> &DeliveryGate {
        &self.gate
    }

    /// held across seqno assignment, insertion and transport hand-off for atomic sends
    pub fn send_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.send_lock
    }
}
