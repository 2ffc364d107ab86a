use crate::arq::ack_strategy::AckStrategy;
use crate::arq::backoff::ExponentialBackoff;
use crate::arq::entry::ConnectionEntry;
use crate::arq::stats::ArqStats;
use crate::arq::xmit_watermarks::XmitWatermarks;
use crate::buffers::sequence_buffer::InsertError;
use crate::headers::Header;
use crate::message::{Message, MessageBatch, MessageFlags, TransientFlags};
use crate::message_dispatcher::MessageDispatcher;
use crate::node_addr::NodeAddr;
use crate::seqno_list::SeqnoList;
use crate::transport::MessageSender;
use crate::util::clock::Clock;
use crate::view::ViewHolder;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Room for everything in a retransmission request except the seqnos
const XMIT_REQ_OVERHEAD: usize = 128;

#[derive(Debug, Clone)]
pub struct ArqSettings {
    pub max_batch_size: usize,
    pub send_atomically: bool,
    pub max_xmit_req_size: usize,
    pub log_not_found_msgs: bool,
}

/// The machinery shared by point-to-point and one-to-many reliable delivery: sequenced sending
///  with flow control, gated batch delivery, acknowledgment and gap bookkeeping.
///
/// The two protocols differ in how peers are addressed and in how senders learn what can be
///  purged. The former is their own business, the latter is the [AckStrategy].
pub struct ArqCore<A: AckStrategy> {
    local_addr: NodeAddr,
    sender: MessageSender,
    dispatcher: Arc<dyn MessageDispatcher>,
    ack_strategy: A,
    view: ViewHolder,
    stats: ArqStats,
    clock: Clock,
    xmit_watermarks: XmitWatermarks,
    running: AtomicBool,
    xmit_runs: AtomicU64,
    settings: ArqSettings,
}

impl<A: AckStrategy> ArqCore<A> {
    pub fn new(local_addr: NodeAddr, sender: MessageSender, dispatcher: Arc<dyn MessageDispatcher>, ack_strategy: A, settings: ArqSettings) -> ArqCore<A> {
        ArqCore {
            local_addr,
            sender,
            dispatcher,
            ack_strategy,
            view: ViewHolder::new(),
            stats: ArqStats::default(),
            clock: Clock::new(),
            xmit_watermarks: XmitWatermarks::new(),
            running: AtomicBool::new(false),
            xmit_runs: AtomicU64::new(0),
            settings,
        }
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.local_addr
    }

    pub fn view(&self) -> &ViewHolder {
        &self.view
    }

    pub fn stats(&self) -> &ArqStats {
        &self.stats
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn ack_strategy(&self) -> &A {
        &self.ack_strategy
    }

    pub fn dispatcher(&self) -> &Arc<dyn MessageDispatcher> {
        &self.dispatcher
    }

    pub fn xmit_watermarks(&self) -> &XmitWatermarks {
        &self.xmit_watermarks
    }

    pub fn settings(&self) -> &ArqSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// starts a new retransmission run, returning its number
    pub fn next_xmit_run(&self) -> u64 {
        self.xmit_runs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// hands a message to the transport
    pub async fn down(&self, msg: &Message) {
        self.sender.send(msg).await;
    }

    /// sends a header-only message from this node
    pub async fn send_control(&self, dest: Option<NodeAddr>, header: Header) {
        let msg = Message::control(self.local_addr, dest, header);
        self.down(&msg).await;
    }

    /// Inserts into a send buffer, waiting with growing intervals while the buffer is full. Gives
    ///  up (dropping the message) when the engine stops or the connection is closed.
    pub async fn add_to_send_buffer(&self, entry: &ConnectionEntry, seqno: u64, msg: &Message) -> bool {
        let mut backoff = ExponentialBackoff::default();
        loop {
            match entry.buf().add_waiting(seqno, msg.clone(), backoff.next_delay()).await {
                Ok(_) => return true,
                Err(InsertError::Closed) => {
                    debug!("send buffer for {:?} is closed, dropping message #{}", entry.peer(), seqno);
                    ArqStats::inc(&self.stats.dropped);
                    return false;
                }
                Err(InsertError::Full) => {
                    if !self.is_running() {
                        debug!("stopped while waiting for space in the send buffer for {:?}, dropping message #{}", entry.peer(), seqno);
                        ArqStats::inc(&self.stats.dropped);
                        return false;
                    }
                    trace!("send buffer for {:?} is full, retrying message #{}", entry.peer(), seqno);
                }
            }
        }
    }

    /// Assigns the next seqno of a sending entry, buffers the message for retransmission and
    ///  sends it. Returns the seqno, or `None` if the message was dropped.
    ///
    /// A `DONT_BLOCK` message is dropped if the send window is full, before a seqno is assigned:
    ///  once a seqno is taken, the message must be buffered, or receivers would wait for it forever.
    pub async fn send_sequenced(&self, entry: &ConnectionEntry, mut msg: Message, make_header: impl FnOnce(u64) -> Header) -> Option<u64> {
        let Some(sender_state) = entry.sender() else {
            warn!("{:?} is not a sending connection - this is a bug", entry.peer());
            return None;
        };

        let _send_guard = if self.settings.send_atomically {
            Some(entry.buf().send_lock().lock().await)
        }
        else {
            None
        };

        if msg.is_flag_set(MessageFlags::DONT_BLOCK) && !entry.buf().has_space_for(sender_state.peek_next_seqno()) {
            debug!("send window for {:?} is full, dropping DONT_BLOCK message", entry.peer());
            ArqStats::inc(&self.stats.dropped);
            return None;
        }

        let seqno = sender_state.next_seqno();
        msg.src = Some(self.local_addr);
        msg.header = Some(make_header(seqno));

        if !self.add_to_send_buffer(entry, seqno, &msg).await {
            return None;
        }
        trace!("sending #{} to {:?}", seqno, msg.dest);
        self.down(&msg).await;
        ArqStats::inc(&self.stats.msgs_sent);
        entry.touch();
        Some(seqno)
    }

    /// A message is handed to the application on ordered removal unless it was delivered out of
    ///  band already, or it is a message from this node that must not be looped back.
    pub fn is_deliverable(&self, msg: &Message) -> bool {
        if msg.is_transient_flag_set(TransientFlags::OOB_DELIVERED) {
            return false;
        }
        !(msg.is_flag_set(MessageFlags::DONT_LOOPBACK) && msg.src == Some(self.local_addr))
    }

    /// Inserts a received message. OOB messages are delivered right away; the buffered copy is
    ///  marked so that ordered removal skips it. Returns `false` for a duplicate.
    pub async fn add_received(&self, entry: &ConnectionEntry, sender: NodeAddr, seqno: u64, msg: Message) -> bool {
        let oob = msg.is_oob();
        let mut stored = msg.clone();
        if oob {
            stored.set_transient_flag_if_absent(TransientFlags::OOB_DELIVERED);
        }

        let added = match entry.buf().add(seqno, stored) {
            Ok(added) => added,
            Err(e) => {
                warn!("dropping message #{} from {:?}: {}", seqno, sender, e);
                false
            }
        };
        ArqStats::inc(&self.stats.msgs_received);
        entry.touch();

        if !added {
            trace!("dropping duplicate #{} from {:?}", seqno, sender);
            // the sender may have missed our ack
            entry.ack().mark_pending();
            return false;
        }

        if oob && self.is_deliverable(&msg) {
            self.deliver(msg).await;
        }
        true
    }

    /// inserts a received message and delivers whatever became deliverable
    pub async fn add_and_deliver(&self, entry: &ConnectionEntry, sender: NodeAddr, dest: Option<NodeAddr>, seqno: u64, msg: Message, nullify: bool) -> bool {
        if !self.add_received(entry, sender, seqno, msg).await {
            return false;
        }
        self.remove_and_deliver(entry, sender, dest, nullify).await;
        true
    }

    /// Drains the deliverable prefix of `entry`'s buffer in batches. Only one task at a time
    ///  drains a buffer: a task arriving while another one is draining returns immediately, and
    ///  the draining task picks up its messages.
    pub async fn remove_and_deliver(&self, entry: &ConnectionEntry, sender: NodeAddr, dest: Option<NodeAddr>, nullify: bool) -> usize {
        let buf = entry.buf();
        if !buf.gate().enter() {
            return 0;
        }

        let mut num_delivered = 0;
        loop {
            let mut consumed = 0;
            let removed = buf.remove_many(nullify, self.settings.max_batch_size, |msg| {
                consumed += 1;
                self.is_deliverable(msg)
            });

            match removed {
                Some(msgs) => {
                    num_delivered += msgs.len();
                    self.deliver_batch(entry, sender, dest, msgs, consumed).await;
                }
                None => {
                    if !buf.gate().leave() {
                        break;
                    }
                }
            }
        }
        num_delivered
    }

    async fn deliver_batch(&self, entry: &ConnectionEntry, sender: NodeAddr, dest: Option<NodeAddr>, mut msgs: Vec<Message>, num_consumed: usize) {
        if self.ack_strategy.need_to_send_ack(entry, num_consumed) {
            self.send_ack(entry).await;
        }

        match msgs.len() {
            0 => {}
            1 => {
                if let Some(msg) = msgs.pop() {
                    self.deliver(msg).await;
                }
            }
            n => {
                trace!("delivering batch of {} messages from {:?}", n, sender);
                ArqStats::add(&self.stats.msgs_delivered, n as u64);
                ArqStats::inc(&self.stats.batches_delivered);
                self.dispatcher.deliver_batch(MessageBatch::new(sender, dest, msgs)).await;
            }
        }
    }

    pub async fn deliver(&self, msg: Message) {
        ArqStats::inc(&self.stats.msgs_delivered);
        self.dispatcher.deliver(msg).await;
    }

    /// Acknowledges the contiguous prefix of `entry`'s buffer, if the strategy sends acks
    pub async fn send_ack(&self, entry: &ConnectionEntry) {
        let seqno = entry.buf().highest_deliverable();
        if seqno == 0 || entry.peer() == self.local_addr {
            return;
        }
        if let Some(header) = self.ack_strategy.ack_header(entry, seqno) {
            trace!("acking #{} to {:?}", seqno, entry.peer());
            self.send_control(Some(entry.peer()), header).await;
            ArqStats::inc(&self.stats.acks_sent);
        }
    }

    /// sends acks that were deferred for any of `entries`
    pub async fn send_pending_acks(&self, entries: impl IntoIterator<Item = &Arc<ConnectionEntry>>) {
        for entry in entries {
            if entry.ack().take_pending() {
                self.send_ack(entry).await;
            }
        }
    }

    /// The gaps in `entry`'s buffer to request in retransmission run `run`, if any
    pub fn missing_to_request(&self, entry: &ConnectionEntry, run: u64) -> Option<SeqnoList> {
        let Some(missing) = entry.buf().missing(self.max_xmit_req_size()) else {
            self.xmit_watermarks.clear(&entry.peer());
            return None;
        };
        self.xmit_watermarks.to_request(entry.peer(), run, missing, entry.buf().highest_deliverable())
    }

    /// The configured limit, further limited so that a request fits into a datagram
    pub fn max_xmit_req_size(&self) -> usize {
        let fitting = self.sender.max_datagram_size().saturating_sub(XMIT_REQ_OVERHEAD) / SeqnoList::MAX_BYTES_PER_SEQNO;
        self.settings.max_xmit_req_size.min(fitting).max(1)
    }

    /// Resends a buffered message unchanged. Returns `false` if it is not buffered (anymore).
    pub async fn resend(&self, entry: &ConnectionEntry, seqno: u64) -> bool {
        match entry.buf().get(seqno) {
            Some(msg) => {
                self.down(&msg).await;
                ArqStats::inc(&self.stats.xmits_sent);
                true
            }
            None => {
                if self.settings.log_not_found_msgs && seqno > entry.buf().low() {
                    warn!("{:?}: message #{} requested for retransmission by {:?} was not found", self.local_addr, seqno, entry.peer());
                }
                false
            }
        }
    }
}
