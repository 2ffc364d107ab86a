use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a reliability protocol instance
#[derive(Default, Debug)]
pub struct ArqStats {
    pub msgs_sent: AtomicU64,
    pub msgs_received: AtomicU64,
    pub msgs_delivered: AtomicU64,
    pub batches_delivered: AtomicU64,
    pub loopbacks: AtomicU64,
    pub acks_sent: AtomicU64,
    pub acks_received: AtomicU64,
    pub xmit_reqs_sent: AtomicU64,
    pub xmit_reqs_received: AtomicU64,
    pub xmits_sent: AtomicU64,
    pub xmit_rsps_received: AtomicU64,
    pub stalled_resends: AtomicU64,
    pub first_seqno_reqs_sent: AtomicU64,
    pub first_seqno_reqs_received: AtomicU64,
    pub closes_sent: AtomicU64,
    pub closes_received: AtomicU64,
    pub dropped: AtomicU64,
}

impl ArqStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ArqStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ArqStatsSnapshot {
            msgs_sent: get(&self.msgs_sent),
            msgs_received: get(&self.msgs_received),
            msgs_delivered: get(&self.msgs_delivered),
            batches_delivered: get(&self.batches_delivered),
            loopbacks: get(&self.loopbacks),
            acks_sent: get(&self.acks_sent),
            acks_received: get(&self.acks_received),
            xmit_reqs_sent: get(&self.xmit_reqs_sent),
            xmit_reqs_received: get(&self.xmit_reqs_received),
            xmits_sent: get(&self.xmits_sent),
            xmit_rsps_received: get(&self.xmit_rsps_received),
            stalled_resends: get(&self.stalled_resends),
            first_seqno_reqs_sent: get(&self.first_seqno_reqs_sent),
            first_seqno_reqs_received: get(&self.first_seqno_reqs_received),
            closes_sent: get(&self.closes_sent),
            closes_received: get(&self.closes_received),
            dropped: get(&self.dropped),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.msgs_sent, &self.msgs_received, &self.msgs_delivered, &self.batches_delivered,
            &self.loopbacks, &self.acks_sent, &self.acks_received, &self.xmit_reqs_sent,
            &self.xmit_reqs_received, &self.xmits_sent, &self.xmit_rsps_received,
            &self.stalled_resends, &self.first_seqno_reqs_sent, &self.first_seqno_reqs_received,
            &self.closes_sent, &self.closes_received, &self.dropped,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArqStatsSnapshot {
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub msgs_delivered: u64,
    pub batches_delivered: u64,
    pub loopbacks: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub xmit_reqs_sent: u64,
    pub xmit_reqs_received: u64,
    pub xmits_sent: u64,
    pub xmit_rsps_received: u64,
    pub stalled_resends: u64,
    pub first_seqno_reqs_sent: u64,
    pub first_seqno_reqs_received: u64,
    pub closes_sent: u64,
    pub closes_received: u64,
    pub dropped: u64,
}
