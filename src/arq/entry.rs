use crate::buffers::sequence_buffer::SequenceBuffer;
use crate::message::Message;
use crate::node_addr::NodeAddr;
use crate::util::clock::Clock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    /// idle or peer left: the buffer no longer blocks senders, traffic reopens the connection
    Closing = 1,
    /// terminal, the entry is about to be removed
    Closed = 2,
}

impl ConnectionState {
    fn can_transition_to(self, new: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!((self, new), (Open, Closing) | (Closing, Open) | (Closing, Closed))
    }
}

/// Deferred acknowledgment bookkeeping of a receiving connection
#[derive(Default, Debug)]
pub struct AckState {
    pending: AtomicBool,
    delivered_since_ack: AtomicUsize,
}

impl AckState {
    pub fn mark_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// clears the pending flag, returning whether it was set
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Counts `num` newly delivered messages. Returns `true` (and resets the count) when the count
    ///  reaches `threshold`.
    pub fn count_delivered(&self, num: usize, threshold: usize) -> bool {
        let mut reached = false;
        let _ = self.delivered_since_ack.fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
            let sum = prev + num;
            reached = sum >= threshold;
            Some(if reached { 0 } else { sum })
        });
        reached
    }
}

/// State of the sending side of a connection
#[derive(Debug)]
pub struct SenderState {
    next_seqno: AtomicU64,
    /// `(highest acked, highest sent)` as seen by the previous retransmission run
    watermark: Mutex<Option<(u64, u64)>>,
    last_ack_timestamp: Mutex<Option<u32>>,
    ack_received: AtomicBool,
}

impl SenderState {
    fn new(first_seqno: u64) -> SenderState {
        SenderState {
            next_seqno: AtomicU64::new(first_seqno),
            watermark: Mutex::new(None),
            last_ack_timestamp: Mutex::new(None),
            ack_received: AtomicBool::new(false),
        }
    }

    /// assigns the next seqno
    pub fn next_seqno(&self) -> u64 {
        self.next_seqno.fetch_add(1, Ordering::AcqRel)
    }

    /// the seqno the next call to [SenderState::next_seqno] will assign
    pub fn peek_next_seqno(&self) -> u64 {
        self.next_seqno.load(Ordering::Acquire)
    }

    /// Accepts a logical timestamp from an ACK or SEND_FIRST_SEQNO if it is newer than the last
    ///  accepted one, guarding against stale messages overtaking newer ones. Timestamps wrap.
    pub fn update_last_timestamp(&self, timestamp: u32) -> bool {
        let mut last = self.last_ack_timestamp.lock().unwrap_or_else(|e| e.into_inner());
        let is_newer = match *last {
            None => true,
            Some(prev) => (timestamp.wrapping_sub(prev) as i32) > 0,
        };
        if is_newer {
            *last = Some(timestamp);
        }
        is_newer
    }

    pub fn mark_ack_received(&self) {
        self.ack_received.store(true, Ordering::Release);
    }

    pub fn is_ack_received(&self) -> bool {
        self.ack_received.load(Ordering::Acquire)
    }

    /// Compares the current `(highest acked, highest sent)` with the previous run's. A stall is
    ///  reported if something is unacknowledged and nothing changed. After reporting, the
    ///  observation starts over, so a persistent stall is reported every other run.
    pub fn check_stalled(&self, highest_acked: u64, highest_sent: u64) -> bool {
        let mut watermark = self.watermark.lock().unwrap_or_else(|e| e.into_inner());
        let current = (highest_acked, highest_sent);

        if highest_acked < highest_sent && *watermark == Some(current) {
            *watermark = None;
            return true;
        }
        *watermark = Some(current);
        false
    }
}

/// State of the receiving side of a connection
#[derive(Debug, Default)]
pub struct ReceiverState {
    /// highest received seqno of this sender reported by the previous stability round
    last_stable_highest_received: AtomicU64,
}

impl ReceiverState {
    /// records the value of the current stability round, returning the previous round's
    pub fn swap_stable_highest_received(&self, seqno: u64) -> u64 {
        self.last_stable_highest_received.swap(seqno, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub enum Role {
    Sender(SenderState),
    Receiver(ReceiverState),
}

/// One side of a connection with a peer: the buffer plus lifecycle and bookkeeping.
///
/// A connection id distinguishes successive connections between the same pair of peers. A sender
///  picks a new id whenever it (re)creates its entry, and the receiver ties its entry to that id.
pub struct ConnectionEntry {
    peer: NodeAddr,
    conn_id: u16,
    buf: SequenceBuffer<Message>,
    state: AtomicU8,
    last_activity: AtomicU64,
    clock: Clock,
    ack: AckState,
    role: Role,
}

impl Debug for ConnectionEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let role = match &self.role {
            Role::Sender(s) => format!("sender, next seqno={}, acked={}", s.peek_next_seqno(), s.is_ack_received()),
            Role::Receiver(_) => "receiver".to_string(),
        };
        write!(f, "{:?}: {:?} conn_id={} {:?} ({}), idle {:?}",
               self.peer, self.buf, self.conn_id, self.state(), role, self.idle_time())
    }
}

impl ConnectionEntry {
    /// a sending entry that assigns seqnos starting at `first_seqno`
    pub fn new_sender(peer: NodeAddr, conn_id: u16, first_seqno: u64, capacity: Option<usize>, clock: Clock) -> ConnectionEntry {
        Self::new(peer, conn_id, first_seqno - 1, capacity, clock, Role::Sender(SenderState::new(first_seqno)))
    }

    /// a receiving entry that expects `offset + 1` as its first seqno
    pub fn new_receiver(peer: NodeAddr, conn_id: u16, offset: u64, capacity: Option<usize>, clock: Clock) -> ConnectionEntry {
        Self::new(peer, conn_id, offset, capacity, clock, Role::Receiver(ReceiverState::default()))
    }

    fn new(peer: NodeAddr, conn_id: u16, offset: u64, capacity: Option<usize>, clock: Clock, role: Role) -> ConnectionEntry {
        ConnectionEntry {
            peer,
            conn_id,
            buf: SequenceBuffer::with_capacity(offset, capacity),
            state: AtomicU8::new(ConnectionState::Open.into()),
            last_activity: AtomicU64::new(clock.now_millis()),
            clock,
            ack: AckState::default(),
            role,
        }
    }

    pub fn peer(&self) -> NodeAddr {
        self.peer
    }

    pub fn conn_id(&self) -> u16 {
        self.conn_id
    }

    pub fn buf(&self) -> &SequenceBuffer<Message> {
        &self.buf
    }

    pub fn ack(&self) -> &AckState {
        &self.ack
    }

    pub fn sender(&self) -> Option<&SenderState> {
        match &self.role {
            Role::Sender(s) => Some(s),
            Role::Receiver(_) => None,
        }
    }

    pub fn receiver(&self) -> Option<&ReceiverState> {
        match &self.role {
            Role::Sender(_) => None,
            Role::Receiver(r) => Some(r),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Closed)
    }

    /// Moves to `new` if the transition is allowed (OPEN -> CLOSING -> CLOSED, CLOSING -> OPEN).
    ///  The buffer stops blocking senders unless the new state is OPEN.
    pub fn set_state(&self, new: ConnectionState) -> bool {
        let result = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let old = ConnectionState::try_from(raw).ok()?;
            if old.can_transition_to(new) {
                Some(new.into())
            }
            else {
                None
            }
        });

        match result {
            Ok(_) => {
                debug!("connection {:?} (conn_id={}): -> {:?}", self.peer, self.conn_id, new);
                self.buf.open(new == ConnectionState::Open);
                self.touch();
                true
            }
            Err(_) => false,
        }
    }

    /// moves to CLOSED, passing through CLOSING if the entry is open
    pub fn close(&self) -> bool {
        self.set_state(ConnectionState::Closing);
        self.set_state(ConnectionState::Closed)
    }

    /// reopens a closing entry
    pub fn reopen(&self) -> bool {
        self.state() == ConnectionState::Closing && self.set_state(ConnectionState::Open)
    }

    /// records activity, resetting the idle time
    pub fn touch(&self) {
        self.last_activity.store(self.clock.now_millis(), Ordering::Release);
    }

    pub fn idle_time(&self) -> Duration {
        self.clock.elapsed_since(self.last_activity.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ConnectionState::*;

    fn receiver() -> ConnectionEntry {
        ConnectionEntry::new_receiver(NodeAddr::localhost(1), 3, 0, None, Clock::new())
    }

    fn sender() -> ConnectionEntry {
        ConnectionEntry::new_sender(NodeAddr::localhost(1), 3, 1, None, Clock::new())
    }

    #[rstest]
    #[case::open_closing(Open, Closing, true)]
    #[case::closing_open(Closing, Open, true)]
    #[case::closing_closed(Closing, Closed, true)]
    #[case::open_closed(Open, Closed, false)]
    #[case::closed_open(Closed, Open, false)]
    #[case::closed_closing(Closed, Closing, false)]
    #[case::open_open(Open, Open, false)]
    fn test_transitions(#[case] from: ConnectionState, #[case] to: ConnectionState, #[case] expected: bool) {
        assert_eq!(from.can_transition_to(to), expected);
    }

    #[test]
    fn test_lifecycle_controls_buffer_blocking() {
        let entry = receiver();
        assert_eq!(entry.state(), Open);
        assert!(entry.buf().is_open());

        assert!(entry.set_state(Closing));
        assert!(!entry.buf().is_open());

        assert!(entry.reopen());
        assert_eq!(entry.state(), Open);
        assert!(entry.buf().is_open());

        assert!(entry.close());
        assert_eq!(entry.state(), Closed);
        assert!(!entry.reopen());
        assert!(!entry.set_state(Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_resets_idle_time() {
        let entry = receiver();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(entry.idle_time(), Duration::from_secs(5));
        entry.set_state(Closing);
        assert_eq!(entry.idle_time(), Duration::ZERO);
        tokio::time::advance(Duration::from_secs(1)).await;
        entry.touch();
        assert_eq!(entry.idle_time(), Duration::ZERO);
    }

    #[test]
    fn test_seqno_assignment() {
        let entry = sender();
        let s = entry.sender().unwrap();
        assert_eq!(s.peek_next_seqno(), 1);
        assert_eq!(s.next_seqno(), 1);
        assert_eq!(s.next_seqno(), 2);
        assert_eq!(s.peek_next_seqno(), 3);
        assert_eq!(entry.buf().low(), 0);
        assert!(entry.receiver().is_none());
    }

    #[rstest]
    #[case::first(None, 5, true)]
    #[case::newer(Some(5), 6, true)]
    #[case::same(Some(5), 5, false)]
    #[case::older(Some(5), 4, false)]
    #[case::wrapped(Some(u32::MAX), 0, true)]
    #[case::older_across_wrap(Some(0), u32::MAX, false)]
    fn test_update_last_timestamp(#[case] initial: Option<u32>, #[case] timestamp: u32, #[case] expected: bool) {
        let entry = sender();
        let s = entry.sender().unwrap();
        if let Some(t) = initial {
            assert!(s.update_last_timestamp(t));
        }
        assert_eq!(s.update_last_timestamp(timestamp), expected);
    }

    #[test]
    fn test_check_stalled_reports_every_other_run() {
        let entry = sender();
        let s = entry.sender().unwrap();

        assert!(!s.check_stalled(0, 1));
        assert!(s.check_stalled(0, 1));
        assert!(!s.check_stalled(0, 1));
        assert!(s.check_stalled(0, 1));

        // progress resets the observation
        assert!(!s.check_stalled(1, 2));
        assert!(!s.check_stalled(1, 3));
        assert!(s.check_stalled(1, 3));

        // everything acked is not a stall
        assert!(!s.check_stalled(3, 3));
        assert!(!s.check_stalled(3, 3));
    }

    #[rstest]
    #[case::threshold_one(1, vec![1], vec![true])]
    #[case::below(3, vec![1, 1], vec![false, false])]
    #[case::reached(3, vec![1, 2, 1], vec![false, true, false])]
    #[case::batch_exceeds(3, vec![5, 1], vec![true, false])]
    fn test_count_delivered(#[case] threshold: usize, #[case] counts: Vec<usize>, #[case] expected: Vec<bool>) {
        let ack = AckState::default();
        let actual: Vec<bool> = counts.into_iter().map(|n| ack.count_delivered(n, threshold)).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_pending_ack() {
        let ack = AckState::default();
        assert!(!ack.take_pending());
        ack.mark_pending();
        assert!(ack.is_pending());
        assert!(ack.take_pending());
        assert!(!ack.take_pending());
    }

    #[test]
    fn test_stable_highest_received() {
        let entry = receiver();
        let r = entry.receiver().unwrap();
        assert_eq!(r.swap_stable_highest_received(5), 0);
        assert_eq!(r.swap_stable_highest_received(7), 5);
    }
}
