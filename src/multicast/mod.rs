//! Reliable one-to-many delivery.
//!
//! Every member numbers its broadcasts and keeps them in its own send buffer; every other member
//!  of the view has a receive buffer per sender. There are no acks: receivers request gaps from
//!  the original sender, and a periodic exchange of digests finds out which messages were
//!  delivered everywhere so that all buffers can drop them. A lost last message does not leave a
//!  gap, so senders broadcast their highest seqno when idle, and stable digests carry the highest
//!  seqno anybody received.

pub mod stability;

use crate::arq::ack_strategy::StabilityAck;
use crate::arq::core::{ArqCore, ArqSettings};
use crate::arq::entry::{ConnectionEntry, ConnectionState};
use crate::arq::scheduler::{PeriodicTask, Retransmitter};
use crate::arq::stats::{ArqStats, ArqStatsSnapshot};
use crate::buffers::atomic_map::AtomicMap;
use crate::config::MulticastConfig;
use crate::digest::Digest;
use crate::headers::{Header, MulticastHeader, StableHeader};
use crate::message::{Message, MessageFlags, TransientFlags};
use crate::message_dispatcher::MessageDispatcher;
use crate::multicast::stability::StabilityTracker;
use crate::node_addr::NodeAddr;
use crate::seqno_list::SeqnoList;
use crate::transport::{DatagramHandler, DatagramTransport, MessageSender};
use crate::util::random::pick_random;
use crate::util::suppress_log::SuppressLog;
use crate::view::{Membership, View};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Broadcasts the highest sent seqno on retransmission runs in which nothing was sent. The same
///  seqno is broadcast at most `max_times` times.
struct LastSeqnoResender {
    max_times: u32,
    sent_since_last_run: AtomicBool,
    resent: Mutex<LastResent>,
}

#[derive(Default)]
struct LastResent {
    seqno: u64,
    num_resends: u32,
}

impl LastSeqnoResender {
    fn new(max_times: u32) -> LastSeqnoResender {
        LastSeqnoResender {
            max_times,
            sent_since_last_run: AtomicBool::new(false),
            resent: Default::default(),
        }
    }

    fn on_send(&self) {
        self.sent_since_last_run.store(true, Ordering::Release);
    }

    /// `true` if the highest seqno should be broadcast in this run
    fn should_resend(&self, highest_sent: u64, has_unstable_msgs: bool) -> bool {
        let sent = self.sent_since_last_run.swap(false, Ordering::AcqRel);
        if sent || highest_sent == 0 || !has_unstable_msgs {
            return false;
        }

        let mut resent = self.resent.lock().unwrap_or_else(|e| e.into_inner());
        if highest_sent > resent.seqno {
            resent.seqno = highest_sent;
            resent.num_resends = 1;
            return true;
        }
        if resent.num_resends >= self.max_times {
            return false;
        }
        resent.num_resends += 1;
        true
    }
}

pub struct ReliableMulticast {
    config: MulticastConfig,
    core: ArqCore<StabilityAck>,
    /// one entry per sender; the entry for this node is its send buffer
    xmit_table: AtomicMap<NodeAddr, Arc<ConnectionEntry>>,
    /// messages are processed once the first view was installed, and queued until then
    is_server: AtomicBool,
    become_server_queue: Mutex<VecDeque<Message>>,
    suppress_non_member_log: SuppressLog,
    last_seqno_resender: LastSeqnoResender,
    stability: StabilityTracker,
    xmit_task: Mutex<Option<PeriodicTask>>,
    gossip_task: Mutex<Option<PeriodicTask>>,
}

impl ReliableMulticast {
    pub fn new(local_addr: NodeAddr, config: MulticastConfig, transport: Arc<dyn DatagramTransport>, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<Arc<ReliableMulticast>> {
        config.validate()?;

        let settings = ArqSettings {
            max_batch_size: config.max_batch_size,
            send_atomically: config.send_atomically,
            max_xmit_req_size: config.max_xmit_req_size,
            log_not_found_msgs: config.log_not_found_msgs,
        };
        let core = ArqCore::new(local_addr, MessageSender::new(transport), dispatcher, StabilityAck, settings);

        let xmit_table = AtomicMap::new();
        xmit_table.insert(local_addr, Arc::new(ConnectionEntry::new_sender(local_addr, 0, 1, config.send_window_capacity, core.clock())));

        Ok(Arc::new(ReliableMulticast {
            suppress_non_member_log: SuppressLog::new(config.suppress_time_non_member_warnings),
            last_seqno_resender: LastSeqnoResender::new(config.resend_last_seqno_max_times),
            config,
            core,
            xmit_table,
            is_server: AtomicBool::new(false),
            become_server_queue: Mutex::new(VecDeque::new()),
            stability: StabilityTracker::new(),
            xmit_task: Mutex::new(None),
            gossip_task: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.core.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn is_server(&self) -> bool {
        self.is_server.load(Ordering::Acquire)
    }

    pub fn start(self: &Arc<Self>) {
        for entry in self.xmit_table.snapshot().values() {
            entry.reopen();
        }
        self.core.set_running(true);

        let mut xmit_task = self.xmit_task.lock().unwrap_or_else(|e| e.into_inner());
        if !xmit_task.as_ref().map(|t| t.is_running()).unwrap_or(false) {
            *xmit_task = Some(PeriodicTask::spawn_retransmitter("multicast-xmit", self.config.xmit_interval, Arc::downgrade(self)));
        }
        drop(xmit_task);

        if self.config.stability.enabled {
            let mut gossip_task = self.gossip_task.lock().unwrap_or_else(|e| e.into_inner());
            if !gossip_task.as_ref().map(|t| t.is_running()).unwrap_or(false) {
                let weak = Arc::downgrade(self);
                *gossip_task = Some(PeriodicTask::spawn("stability-gossip", self.config.stability.desired_avg_gossip, move || {
                    let multicast = weak.upgrade();
                    async move {
                        match multicast {
                            Some(m) => {
                                m.send_stability_gossip().await;
                                true
                            }
                            None => false,
                        }
                    }
                }));
            }
        }
    }

    /// Stops the periodic tasks. Senders waiting for space in the send buffer give up.
    pub fn stop(&self) {
        self.core.set_running(false);
        for task in [&self.xmit_task, &self.gossip_task] {
            if let Some(task) = task.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task.stop();
            }
        }
        for entry in self.xmit_table.snapshot().values() {
            entry.set_state(ConnectionState::Closing);
        }
        self.core.xmit_watermarks().clear_all();
    }

    /// Broadcasts a message to all members of the view, including this node unless the message
    ///  is flagged `DONT_LOOPBACK`
    pub async fn send(&self, mut msg: Message) {
        msg.dest = None;
        if msg.src.is_none() {
            msg.src = Some(self.local_addr());
        }

        if msg.is_flag_set(MessageFlags::NO_RELIABILITY) {
            self.core.down(&msg).await;
            return;
        }
        if !self.is_running() {
            trace!("{:?}: discarding broadcast as the engine is not running", self.local_addr());
            return;
        }
        let Some(entry) = self.xmit_table.get(&self.local_addr()) else {
            return;
        };

        if self.core.send_sequenced(&entry, msg, |seqno| Header::Multicast(MulticastHeader::Msg { seqno })).await.is_some() {
            self.last_seqno_resender.on_send();
        }
    }

    /// Handles a message received from the transport
    pub async fn receive(&self, msg: Message) {
        if msg.is_flag_set(MessageFlags::NO_RELIABILITY) {
            self.core.deliver(msg).await;
            return;
        }
        let Some(sender) = msg.src else {
            warn!("{:?}: dropping message without sender: {:?}", self.local_addr(), msg.header);
            return;
        };

        match msg.header.clone() {
            Some(Header::Multicast(header)) => {
                if !self.is_server() {
                    self.queue_message(msg);
                    return;
                }
                match header {
                    MulticastHeader::Msg { seqno } => self.handle_message(sender, seqno, msg).await,
                    MulticastHeader::XmitReq { original_sender, missing } => self.handle_xmit_req(sender, original_sender, missing).await,
                    MulticastHeader::XmitRsp { seqno } => self.handle_xmit_rsp(sender, seqno, msg).await,
                    MulticastHeader::HighestSeqno { seqno } => self.handle_highest_seqno(sender, seqno).await,
                }
            }
            Some(Header::Stable(header)) => self.handle_stable(sender, header).await,
            _ => self.core.deliver(msg).await,
        }
    }

    fn queue_message(&self, msg: Message) {
        if self.config.become_server_queue_size == 0 {
            trace!("{:?}: discarding message from {:?}, no view yet", self.local_addr(), msg.src);
            return;
        }
        let mut queue = self.become_server_queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.config.become_server_queue_size {
            queue.pop_front();
        }
        trace!("{:?}: queueing message from {:?} until the first view is installed", self.local_addr(), msg.src);
        queue.push_back(msg);
    }

    async fn flush_become_server_queue(&self) {
        let queued: Vec<Message> = self.become_server_queue.lock().unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if !queued.is_empty() {
            trace!("{:?}: processing {} messages queued before the first view", self.local_addr(), queued.len());
        }
        for msg in queued {
            self.receive(msg).await;
        }
    }

    async fn handle_message(&self, sender: NodeAddr, seqno: u64, msg: Message) {
        let Some(entry) = self.xmit_table.get(&sender) else {
            self.unknown_member(sender, seqno);
            return;
        };
        trace!("{:?} <-- {:?}: #{}", self.local_addr(), sender, seqno);

        if sender == self.local_addr() {
            // own messages are in the send buffer already, and they are retained for retransmission
            ArqStats::inc(&self.core.stats().msgs_received);
            if msg.is_oob() {
                let oob = entry.buf().update(seqno, |m| {
                    if m.is_oob() && m.set_transient_flag_if_absent(TransientFlags::OOB_DELIVERED) {
                        Some(m.clone())
                    }
                    else {
                        None
                    }
                });
                if let Some(Some(mut oob)) = oob {
                    oob.transient_flags.remove(TransientFlags::OOB_DELIVERED);
                    if self.core.is_deliverable(&oob) {
                        self.core.deliver(oob).await;
                    }
                }
            }
            self.core.remove_and_deliver(&entry, sender, None, false).await;
            return;
        }

        self.core.add_received(&entry, sender, seqno, msg).await;
        self.core.remove_and_deliver(&entry, sender, None, self.config.discard_delivered_msgs).await;
    }

    fn unknown_member(&self, sender: NodeAddr, seqno: u64) {
        ArqStats::inc(&self.core.stats().dropped);
        if self.config.log_discard_msgs && self.suppress_non_member_log.should_log(&sender) {
            let view_id = self.core.view().current_view().map(|v| v.view_id);
            warn!("{:?}: dropped message #{} from non-member {:?} (view {:?})", self.local_addr(), seqno, sender, view_id);
        }
    }

    async fn handle_xmit_req(&self, requester: NodeAddr, original_sender: NodeAddr, missing: SeqnoList) {
        trace!("{:?} <-- {:?}: XMIT_REQ({:?}{:?})", self.local_addr(), requester, original_sender, missing);
        ArqStats::add(&self.core.stats().xmit_reqs_received, missing.len() as u64);

        let Some(entry) = self.xmit_table.get(&original_sender) else {
            warn!("{:?}: retransmission requested by {:?} for unknown sender {:?}", self.local_addr(), requester, original_sender);
            return;
        };

        for seqno in missing.iter() {
            match entry.buf().get(seqno) {
                Some(msg) => self.send_xmit_rsp(requester, msg, seqno).await,
                None => {
                    if self.config.log_not_found_msgs && requester != self.local_addr() && seqno > entry.buf().low() {
                        warn!("{:?}: message {:?}#{} requested by {:?} not found", self.local_addr(), original_sender, seqno, requester);
                    }
                }
            }
        }
    }

    /// Resends a buffered message. It keeps its original sender, so it is wrapped into an
    ///  XMIT_RSP unless retransmissions are broadcast.
    async fn send_xmit_rsp(&self, requester: NodeAddr, mut msg: Message, seqno: u64) {
        ArqStats::inc(&self.core.stats().xmits_sent);
        if msg.src.is_none() {
            msg.src = Some(self.local_addr());
        }
        msg.transient_flags = TransientFlags::empty();

        if self.config.use_mcast_xmit {
            trace!("{:?} --> [all]: resending {:?}#{}", self.local_addr(), msg.src, seqno);
            self.core.down(&msg).await;
            return;
        }

        trace!("{:?} --> {:?}: XMIT_RSP({:?}#{})", self.local_addr(), requester, msg.src, seqno);
        msg.dest = Some(requester);
        msg.header = Some(Header::Multicast(MulticastHeader::XmitRsp { seqno }));
        self.core.down(&msg).await;
    }

    async fn handle_xmit_rsp(&self, sender: NodeAddr, seqno: u64, mut msg: Message) {
        ArqStats::inc(&self.core.stats().xmit_rsps_received);
        msg.dest = None;
        msg.header = Some(Header::Multicast(MulticastHeader::Msg { seqno }));
        self.handle_message(sender, seqno, msg).await;
    }

    /// the sender's highest seqno is beyond what we received: its last message(s) got lost
    async fn handle_highest_seqno(&self, sender: NodeAddr, seqno: u64) {
        if sender == self.local_addr() {
            return;
        }
        let Some(entry) = self.xmit_table.get(&sender) else {
            return;
        };
        let my_highest_received = entry.buf().high();
        if seqno > my_highest_received {
            trace!("{:?}: my highest received ({:?}#{}) < highest sent (#{}), requesting retransmission", self.local_addr(), sender, my_highest_received, seqno);
            self.retransmit([seqno].into_iter().collect(), sender, false).await;
        }
    }

    async fn retransmit(&self, missing: SeqnoList, original_sender: NodeAddr, multicast_request: bool) {
        let mut dest = if multicast_request || self.config.use_mcast_xmit_req {
            None
        }
        else {
            Some(original_sender)
        };

        if self.config.xmit_from_random_member && original_sender != self.local_addr() {
            let members = self.core.view().members();
            if let Some(&random) = pick_random(&members) {
                if random != self.local_addr() {
                    dest = Some(random);
                }
            }
        }

        trace!("{:?} --> {:?}: XMIT_REQ({:?}{:?})", self.local_addr(), dest, original_sender, missing);
        ArqStats::add(&self.core.stats().xmit_reqs_sent, missing.len() as u64);
        self.core.send_control(dest, Header::Multicast(MulticastHeader::XmitReq { original_sender, missing })).await;
    }

    async fn handle_stable(&self, sender: NodeAddr, header: StableHeader) {
        if !self.core.view().has_view() || !self.core.view().is_member(&sender) {
            trace!("{:?}: ignoring stability message from {:?}", self.local_addr(), sender);
            return;
        }

        match header {
            StableHeader::Gossip { digest } => {
                if sender == self.local_addr() {
                    return;
                }
                trace!("{:?} <-- {:?}: STABLE_GOSSIP({})", self.local_addr(), sender, digest);
                if let Some(stable) = self.stability.add_digest(sender, digest) {
                    self.on_round_complete(stable).await;
                }
            }
            StableHeader::Stability { digest } => {
                if sender == self.local_addr() {
                    return;
                }
                trace!("{:?} <-- {:?}: STABILITY({})", self.local_addr(), sender, digest);
                self.stability.reset_round();
                self.stable(&digest).await;
            }
        }
    }

    /// Broadcasts this node's digest for the current stability round
    pub async fn send_stability_gossip(&self) {
        if !self.is_running() || !self.core.view().has_view() {
            return;
        }
        let digest = self.get_digest();
        trace!("{:?} --> [all]: STABLE_GOSSIP({})", self.local_addr(), digest);

        let msg = Message::control(self.local_addr(), None, Header::Stable(StableHeader::Gossip { digest: digest.clone() }))
            .with_flags(MessageFlags::DONT_LOOPBACK);
        self.core.down(&msg).await;

        match self.stability.add_digest(self.local_addr(), digest) {
            Some(stable) => self.on_round_complete(stable).await,
            None => trace!("{:?}: waiting for digests from {:?}", self.local_addr(), self.stability.missing()),
        }
    }

    async fn on_round_complete(&self, stable: Digest) {
        debug!("{:?}: stability round complete, stable digest {}", self.local_addr(), stable);
        let msg = Message::control(self.local_addr(), None, Header::Stable(StableHeader::Stability { digest: stable.clone() }))
            .with_flags(MessageFlags::DONT_LOOPBACK);
        self.core.down(&msg).await;
        self.stable(&stable).await;
    }

    /// Purges everything the stable digest reports as delivered by all members. A sender's
    ///  highest received seqno that stays ahead of ours for two stable rounds means its last
    ///  message(s) never reached us.
    pub async fn stable(&self, digest: &Digest) {
        trace!("{:?}: stable digest {}", self.local_addr(), digest);
        for (member, stable_entry) in digest.iter() {
            let Some(entry) = self.xmit_table.get(member) else {
                continue;
            };

            if let Some(receiver) = entry.receiver() {
                let my_highest_received = entry.buf().high();
                let previous = receiver.swap_stable_highest_received(stable_entry.highest_received);
                if stable_entry.highest_received > my_highest_received && previous >= stable_entry.highest_received {
                    trace!("{:?}: my highest received ({:?}#{}) < stable highest received (#{}), requesting retransmission",
                        self.local_addr(), member, my_highest_received, stable_entry.highest_received);
                    self.retransmit([stable_entry.highest_received].into_iter().collect(), *member, false).await;
                }
            }

            let num_purged = entry.buf().purge(stable_entry.highest_delivered, false);
            if num_purged > 0 {
                trace!("{:?}: purged {} messages <= #{} from {:?}", self.local_addr(), num_purged, stable_entry.highest_delivered, member);
            }
        }
    }

    pub async fn on_view_change(&self, view: &View) {
        if !self.core.view().install(view.clone()) {
            debug!("{:?}: ignoring view {} as it is older than the current view", self.local_addr(), view.view_id);
            return;
        }
        self.adjust_receivers(view).await;
        self.core.xmit_watermarks().retain(|addr| view.contains(addr));
        self.suppress_non_member_log.remove_expired();
        self.stability.reset_for_view(view);

        if !self.is_server.swap(true, Ordering::AcqRel) {
            self.flush_become_server_queue().await;
        }
    }

    /// Drops the buffers of members that left, after delivering what is deliverable, and adds
    ///  empty receive buffers for new members
    async fn adjust_receivers(&self, view: &View) {
        let local = self.local_addr();
        for (member, entry) in self.xmit_table.snapshot().iter() {
            if *member == local || view.contains(member) {
                continue;
            }
            self.core.remove_and_deliver(entry, *member, None, true).await;
            if self.xmit_table.remove_if(member, |e| Arc::ptr_eq(e, entry)).is_some() {
                entry.close();
                debug!("{:?}: removed {:?} from the retransmission table (not a member anymore)", local, member);
            }
        }

        for member in &view.members {
            self.xmit_table.get_or_insert_with(member, || {
                Arc::new(ConnectionEntry::new_receiver(*member, 0, 0, None, self.core.clock()))
            });
        }
    }

    /// `(highest delivered, highest received)` for all senders
    pub fn get_digest(&self) -> Digest {
        self.xmit_table.snapshot().iter()
            .map(|(member, entry)| {
                let (highest_delivered, highest_received) = entry.buf().digest();
                (*member, highest_delivered, highest_received)
            })
            .collect()
    }

    pub fn get_digest_for(&self, member: &NodeAddr) -> Option<Digest> {
        let entry = self.xmit_table.get(member)?;
        let (highest_delivered, highest_received) = entry.buf().digest();
        Some([(*member, highest_delivered, highest_received)].into_iter().collect())
    }

    /// Creates receive buffers for members of the digest that have none, starting after their
    ///  highest delivered seqno. Existing buffers are left alone.
    pub fn set_digest(&self, digest: &Digest) {
        self.apply_digest(digest, false);
    }

    /// Like [ReliableMulticast::set_digest], but also replaces existing buffers that are behind
    ///  the digest. This node's own buffer is never replaced.
    pub fn merge_digest(&self, digest: &Digest) {
        self.apply_digest(digest, true);
    }

    fn apply_digest(&self, digest: &Digest, merge: bool) {
        let local = self.local_addr();
        for (member, digest_entry) in digest.iter() {
            if let Some(existing) = self.xmit_table.get(member) {
                if !merge || *member == local || existing.buf().highest_delivered() >= digest_entry.highest_delivered {
                    continue;
                }
                existing.close();
            }
            self.xmit_table.insert(*member, Arc::new(ConnectionEntry::new_receiver(*member, 0, digest_entry.highest_delivered, None, self.core.clock())));
        }
        debug!("{:?}: {} digest {}, resulting digest {}", local, if merge { "merged" } else { "set" }, digest, self.get_digest());
    }

    /// Replaces the buffers of all members in the digest, e.g. when joining with the view's
    ///  starting digest. Members not in the digest keep their buffers. For this node, only the
    ///  highest delivered seqno is adjusted.
    pub fn overwrite_digest(&self, digest: &Digest) {
        let local = self.local_addr();
        for (member, digest_entry) in digest.iter() {
            if let Some(existing) = self.xmit_table.get(member) {
                if *member == local {
                    existing.buf().set_highest_delivered(digest_entry.highest_delivered);
                    continue;
                }
                existing.close();
            }
            self.xmit_table.insert(*member, Arc::new(ConnectionEntry::new_receiver(*member, 0, digest_entry.highest_delivered, None, self.core.clock())));
        }
        debug!("{:?}: overwrote digest with {}, resulting digest {}", local, digest, self.get_digest());
    }

    pub fn print_digest(&self) -> String {
        self.get_digest().to_string()
    }

    /// a human readable dump of all buffers
    pub fn print_connections(&self) -> String {
        let mut result = String::new();
        let table = self.xmit_table.snapshot();
        let mut members: Vec<&NodeAddr> = table.keys().collect();
        members.sort();
        for member in members {
            if let Some(entry) = table.get(member) {
                let _ = writeln!(result, "{:?}", entry);
            }
        }
        result
    }

    pub fn entry(&self, sender: &NodeAddr) -> Option<Arc<ConnectionEntry>> {
        self.xmit_table.get(sender)
    }

    pub fn num_senders(&self) -> usize {
        self.xmit_table.len()
    }

    pub fn num_queued(&self) -> usize {
        self.become_server_queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> ArqStatsSnapshot {
        self.core.stats().snapshot()
    }

    pub fn reset_stats(&self) {
        self.core.stats().reset();
    }
}

#[async_trait]
impl Retransmitter for ReliableMulticast {
    async fn trigger_xmit(&self) {
        let run = self.core.next_xmit_run();
        let local = self.local_addr();

        for (sender, entry) in self.xmit_table.snapshot().iter() {
            if *sender == local {
                continue;
            }
            if let Some(missing) = self.core.missing_to_request(entry, run) {
                self.retransmit(missing, *sender, false).await;
            }
        }

        if self.config.resend_last_seqno {
            if let Some(own) = self.xmit_table.get(&local) {
                let buf = own.buf();
                let highest_sent = buf.high();
                if self.last_seqno_resender.should_resend(highest_sent, buf.low() < highest_sent) {
                    trace!("{:?} --> [all]: HIGHEST_SEQNO(#{})", local, highest_sent);
                    let msg = Message::control(local, None, Header::Multicast(MulticastHeader::HighestSeqno { seqno: highest_sent }))
                        .with_flags(MessageFlags::DONT_LOOPBACK);
                    self.core.down(&msg).await;
                }
            }
        }
    }
}

#[async_trait]
impl DatagramHandler for ReliableMulticast {
    async fn on_datagram(&self, datagram: &[u8]) {
        let mut buf = datagram;
        match Message::deser(&mut buf) {
            Ok(msg) => self.receive(msg).await,
            Err(e) => warn!("{:?}: dropping undecodable datagram: {}", self.local_addr(), e),
        }
    }
}
