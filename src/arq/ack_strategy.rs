use crate::arq::entry::ConnectionEntry;
use crate::headers::{Header, UnicastHeader};
#[cfg(test)] use mockall::automock;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};

/// How receivers let senders know which messages can be dropped from the send buffer.
///
/// The retransmission machinery is the same for point-to-point and one-to-many delivery. They
///  differ in how senders learn that messages arrived: a point-to-point receiver acknowledges
///  explicitly, while one-to-many receivers rely on periodic digest exchange to find messages that
///  were delivered everywhere.
#[cfg_attr(test, automock)]
pub trait AckStrategy: Debug + Send + Sync + 'static {
    /// Called after `num_delivered` messages from `entry` were removed for delivery. Returns
    ///  `true` if an ack should be sent right away, otherwise the strategy may defer the ack to
    ///  the next retransmission run by marking it pending.
    fn need_to_send_ack(&self, entry: &ConnectionEntry, num_delivered: usize) -> bool;

    /// The header acknowledging everything up to and including `seqno` for `entry`, or `None` if
    ///  this strategy does not send acks
    fn ack_header(&self, entry: &ConnectionEntry, seqno: u64) -> Option<Header>;
}

/// Explicit acks, sent immediately once `ack_threshold` messages were delivered, otherwise with
///  the next retransmission run
#[derive(Debug)]
pub struct PerMessageAck {
    ack_threshold: usize,
    timestamper: AtomicU32,
}

impl PerMessageAck {
    pub fn new(ack_threshold: usize) -> PerMessageAck {
        PerMessageAck {
            ack_threshold,
            timestamper: AtomicU32::new(0),
        }
    }

    /// the next logical timestamp, wrapping on overflow
    pub fn next_timestamp(&self) -> u32 {
        self.timestamper.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

impl AckStrategy for PerMessageAck {
    fn need_to_send_ack(&self, entry: &ConnectionEntry, num_delivered: usize) -> bool {
        if entry.ack().count_delivered(num_delivered, self.ack_threshold) {
            return true;
        }
        entry.ack().mark_pending();
        false
    }

    fn ack_header(&self, entry: &ConnectionEntry, seqno: u64) -> Option<Header> {
        Some(Header::Unicast(UnicastHeader::Ack {
            seqno,
            conn_id: entry.conn_id(),
            timestamp: self.next_timestamp(),
        }))
    }
}

/// No acks: messages are purged when a stability round found them delivered by all members
#[derive(Debug, Default)]
pub struct StabilityAck;

impl AckStrategy for StabilityAck {
    fn need_to_send_ack(&self, _entry: &ConnectionEntry, _num_delivered: usize) -> bool {
        false
    }

    fn ack_header(&self, _entry: &ConnectionEntry, _seqno: u64) -> Option<Header> {
        None
    }
}
