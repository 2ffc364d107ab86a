//! Reliable point-to-point delivery.
//!
//! Every pair of peers has a sending connection on one side and a receiving connection on the
//!  other. The sender numbers messages per connection, starting at 1 and flagging the first
//!  message, and keeps them until they are acknowledged. The receiver delivers in seqno order,
//!  acknowledges the highest contiguous seqno, and requests gaps. Connection ids tell successive
//!  connections between the same peers apart: a receiver that sees a connection id it does not
//!  know asks the sender to resend its first message, which re-synchronizes the two sides.

pub mod expiry_cache;
pub mod message_cache;

use crate::arq::ack_strategy::PerMessageAck;
use crate::arq::core::{ArqCore, ArqSettings};
use crate::arq::entry::{ConnectionEntry, ConnectionState};
use crate::arq::scheduler::{PeriodicTask, Retransmitter};
use crate::arq::stats::{ArqStats, ArqStatsSnapshot};
use crate::config::UnicastConfig;
use crate::headers::{Header, UnicastHeader};
use crate::message::{Message, MessageBatch, MessageFlags, TransientFlags};
use crate::message_dispatcher::MessageDispatcher;
use crate::node_addr::NodeAddr;
use crate::seqno_list::SeqnoList;
use crate::transport::{DatagramHandler, DatagramTransport, MessageSender};
use crate::buffers::atomic_map::AtomicMap;
use crate::unicast::expiry_cache::ExpiryCache;
use crate::unicast::message_cache::MessageCache;
use crate::view::{Membership, View};
use anyhow::bail;
use async_trait::async_trait;
use std::fmt::Write;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// the seqno of the first message of a connection
const FIRST_SEQNO: u64 = 1;

enum ReceiverLookup {
    Found(Arc<ConnectionEntry>),
    /// the message belongs to an older connection
    Stale,
    /// no connection matches, the sender must resend its first message
    Unsynchronized,
}

pub struct ReliableUnicast {
    config: UnicastConfig,
    core: ArqCore<PerMessageAck>,
    send_table: AtomicMap<NodeAddr, Arc<ConnectionEntry>>,
    recv_table: AtomicMap<NodeAddr, Arc<ConnectionEntry>>,
    /// serializes creation and replacement of receiving connections
    recv_table_lock: Mutex<()>,
    last_conn_id: AtomicU16,
    msg_cache: MessageCache,
    last_sync_sent: ExpiryCache<NodeAddr>,
    /// connections to non-members, closed when they expire
    age_out_cache: Option<ExpiryCache<NodeAddr>>,
    xmit_task: Mutex<Option<PeriodicTask>>,
}

impl ReliableUnicast {
    pub fn new(local_addr: NodeAddr, config: UnicastConfig, transport: Arc<dyn DatagramTransport>, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<Arc<ReliableUnicast>> {
        config.validate()?;

        let settings = ArqSettings {
            max_batch_size: config.max_batch_size,
            send_atomically: config.send_atomically,
            max_xmit_req_size: config.max_xmit_req_size,
            log_not_found_msgs: config.log_not_found_msgs,
        };
        let core = ArqCore::new(local_addr, MessageSender::new(transport), dispatcher, PerMessageAck::new(config.ack_threshold), settings);

        let age_out_cache = if config.max_retransmit_time.is_zero() {
            None
        }
        else {
            Some(ExpiryCache::new(config.max_retransmit_time))
        };

        Ok(Arc::new(ReliableUnicast {
            msg_cache: MessageCache::new(config.max_cached_msgs_per_sender),
            last_sync_sent: ExpiryCache::new(config.sync_min_interval),
            age_out_cache,
            config,
            core,
            send_table: AtomicMap::new(),
            recv_table: AtomicMap::new(),
            recv_table_lock: Mutex::new(()),
            last_conn_id: AtomicU16::new(0),
            xmit_task: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.core.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn start(self: &Arc<Self>) {
        self.msg_cache.clear();
        self.core.set_running(true);

        let mut xmit_task = self.xmit_task.lock().unwrap_or_else(|e| e.into_inner());
        if xmit_task.as_ref().map(|t| t.is_running()).unwrap_or(false) {
            return;
        }
        *xmit_task = Some(PeriodicTask::spawn_retransmitter("unicast-xmit", self.config.xmit_interval, Arc::downgrade(self)));
    }

    pub async fn stop(&self) {
        self.send_pending_acks().await;
        self.core.set_running(false);
        let xmit_task = self.xmit_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(xmit_task) = xmit_task {
            xmit_task.stop_and_wait().await;
        }
        self.core.xmit_watermarks().clear_all();
        self.remove_all_connections();
        self.msg_cache.clear();
    }

    /// Sends a message to its destination. Sending is fire-and-forget: messages that cannot be
    ///  sent (e.g. because the engine is stopped) are dropped.
    pub async fn send(&self, mut msg: Message) -> anyhow::Result<()> {
        let Some(dest) = msg.dest else {
            bail!("unicast message without destination");
        };
        if msg.src.is_none() {
            msg.src = Some(self.local_addr());
        }

        if msg.is_flag_set(MessageFlags::NO_RELIABILITY) {
            self.core.down(&msg).await;
            return Ok(());
        }
        if !self.is_running() {
            trace!("discarding message to {:?} as the engine is not running", dest);
            return Ok(());
        }

        if self.config.loopback && dest == self.local_addr() {
            if !msg.is_flag_set(MessageFlags::DONT_LOOPBACK) {
                ArqStats::inc(&self.core.stats().loopbacks);
                self.core.deliver(msg).await;
            }
            return Ok(());
        }

        let entry = self.get_sender_entry(dest);
        self.reopen_on_traffic(&entry);
        let conn_id = entry.conn_id();
        self.core.send_sequenced(&entry, msg, |seqno| Header::Unicast(UnicastHeader::Data {
            seqno,
            conn_id,
            first: seqno == FIRST_SEQNO,
        })).await;
        Ok(())
    }

    /// Handles a message received from the transport
    pub async fn receive(&self, msg: Message) {
        let Some(sender) = msg.src else {
            warn!("dropping message without sender: {:?}", msg.header);
            return;
        };
        let header = if msg.is_flag_set(MessageFlags::NO_RELIABILITY) {
            None
        }
        else {
            msg.unicast_header().cloned()
        };
        let Some(header) = header else {
            self.core.deliver(msg).await;
            return;
        };

        match header {
            UnicastHeader::Data { seqno, conn_id, first } => {
                trace!("{:?} <-- {:?}: DATA(#{}, conn_id={}{})", self.local_addr(), sender, seqno, conn_id, if first { ", first" } else { "" });
                if sender == self.local_addr() {
                    self.handle_data_from_self(seqno, msg).await;
                }
                else {
                    self.handle_data(sender, seqno, conn_id, first, msg).await;
                }
            }
            other => self.handle_control(sender, other).await,
        }
    }

    /// Handles messages from a single sender that arrived together. Data messages are inserted
    ///  first and delivered in one pass.
    pub async fn receive_batch(&self, batch: MessageBatch) {
        let sender = batch.sender;
        let mut data = Vec::new();
        for msg in batch.messages {
            let data_header = match msg.unicast_header() {
                Some(&UnicastHeader::Data { seqno, conn_id, first }) if !msg.is_flag_set(MessageFlags::NO_RELIABILITY) && msg.src == Some(sender) => {
                    Some((seqno, conn_id, first))
                }
                _ => None,
            };
            match data_header {
                Some((seqno, conn_id, first)) => data.push((seqno, conn_id, first, msg)),
                None => self.receive(msg).await,
            }
        }
        if data.is_empty() {
            return;
        }

        if sender == self.local_addr() {
            for (seqno, _, _, msg) in data {
                self.handle_data_from_self(seqno, msg).await;
            }
            return;
        }

        // messages from an older connection can be mixed in, only the newest connection counts
        let Some(conn_id) = data.iter().map(|(_, conn_id, _, _)| *conn_id).max() else {
            return;
        };
        data.retain(|(_, c, _, _)| *c == conn_id);
        let Some(&(lowest_seqno, _, first, _)) = data.iter().min_by_key(|(seqno, _, _, _)| *seqno) else {
            return;
        };

        let entry = match self.get_receiver_entry(sender, lowest_seqno, first, conn_id) {
            ReceiverLookup::Found(entry) => entry,
            ReceiverLookup::Stale => {
                trace!("dropping batch from {:?} for stale conn_id {}", sender, conn_id);
                return;
            }
            ReceiverLookup::Unsynchronized => {
                for (_, _, _, msg) in data {
                    self.msg_cache.add(sender, msg);
                }
                self.send_request_for_first_seqno(sender).await;
                return;
            }
        };

        self.reopen_on_traffic(&entry);
        self.add_cached_messages(sender, &entry).await;
        for (seqno, _, _, msg) in data {
            self.core.add_received(&entry, sender, seqno, msg).await;
        }
        self.core.remove_and_deliver(&entry, sender, Some(self.local_addr()), true).await;
    }

    pub async fn on_view_change(&self, view: &View) {
        if !self.core.view().install(view.clone()) {
            debug!("ignoring view {} as it is older than the current view", view.view_id);
            return;
        }

        let mut non_members: Vec<NodeAddr> = self.send_table.snapshot().keys()
            .chain(self.recv_table.snapshot().keys())
            .filter(|addr| !view.contains(addr))
            .copied()
            .collect();
        non_members.sort();
        non_members.dedup();
        if !non_members.is_empty() {
            trace!("{:?}: closing connections to non-members {:?}", self.local_addr(), non_members);
            for addr in &non_members {
                self.close_connection(addr);
            }
        }

        for member in &view.members {
            for table in [&self.send_table, &self.recv_table] {
                if let Some(entry) = table.get(member) {
                    entry.reopen();
                }
            }
        }

        if let Some(age_out_cache) = &self.age_out_cache {
            age_out_cache.retain(|addr| !view.contains(addr));
        }
        self.core.xmit_watermarks().retain(|addr| view.contains(addr));
        self.last_sync_sent.remove_expired();
        self.msg_cache.retain(|addr| view.contains(addr));
    }

    async fn handle_data(&self, sender: NodeAddr, seqno: u64, conn_id: u16, first: bool, msg: Message) {
        let entry = match self.get_receiver_entry(sender, seqno, first, conn_id) {
            ReceiverLookup::Found(entry) => entry,
            ReceiverLookup::Stale => {
                trace!("{:?}: dropping #{} from {:?} for stale conn_id {}", self.local_addr(), seqno, sender, conn_id);
                return;
            }
            ReceiverLookup::Unsynchronized => {
                if self.msg_cache.add(sender, msg) {
                    trace!("{:?}: cached {:?}#{}", self.local_addr(), sender, seqno);
                }
                self.send_request_for_first_seqno(sender).await;
                return;
            }
        };

        self.reopen_on_traffic(&entry);
        self.add_cached_messages(sender, &entry).await;
        self.core.add_and_deliver(&entry, sender, Some(self.local_addr()), seqno, msg, true).await;
    }

    /// A message sent to self through the transport: it is in the sending connection's buffer
    ///  already, so it only needs to be delivered from there.
    async fn handle_data_from_self(&self, seqno: u64, msg: Message) {
        let local = self.local_addr();
        let Some(entry) = self.send_table.get(&local).filter(|e| e.state() != ConnectionState::Closed) else {
            warn!("{:?}: no connection to self found, dropping message #{}", local, seqno);
            return;
        };
        entry.touch();

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
        self.core.remove_and_deliver(&entry, local, Some(local), true).await;
    }

    async fn handle_control(&self, sender: NodeAddr, header: UnicastHeader) {
        match header {
            UnicastHeader::Ack { seqno, conn_id, timestamp } => self.handle_ack(sender, seqno, conn_id, timestamp),
            UnicastHeader::SendFirstSeqno { timestamp } => self.handle_resend_first_message(sender, timestamp).await,
            UnicastHeader::XmitReq { missing } => self.handle_xmit_req(sender, missing).await,
            UnicastHeader::Close { conn_id } => self.handle_close(sender, conn_id),
            UnicastHeader::Data { .. } => {}
        }
    }

    fn handle_ack(&self, sender: NodeAddr, seqno: u64, conn_id: u16, timestamp: u32) {
        trace!("{:?} <-- {:?}: ACK(#{}, conn_id={}, ts={})", self.local_addr(), sender, seqno, conn_id, timestamp);
        let Some(entry) = self.send_table.get(&sender) else {
            return;
        };
        if entry.conn_id() != conn_id {
            trace!("{:?}: my conn_id ({}) != received conn_id ({}), discarding ACK", self.local_addr(), entry.conn_id(), conn_id);
            return;
        }
        entry.touch();
        let Some(sender_state) = entry.sender() else {
            return;
        };

        if sender_state.update_last_timestamp(timestamp) {
            entry.buf().purge(seqno, true);
            sender_state.mark_ack_received();
            ArqStats::inc(&self.core.stats().acks_received);
        }
    }

    /// the receiver lost track of our connection: resend the oldest unacknowledged message,
    ///  flagged as the first one
    async fn handle_resend_first_message(&self, sender: NodeAddr, timestamp: u32) {
        trace!("{:?} <-- {:?}: SEND_FIRST_SEQNO", self.local_addr(), sender);
        ArqStats::inc(&self.core.stats().first_seqno_reqs_received);
        let Some(entry) = self.send_table.get(&sender) else {
            warn!("{:?}: sender connection to {:?} not found", self.local_addr(), sender);
            return;
        };
        let Some(sender_state) = entry.sender() else {
            return;
        };
        if !sender_state.update_last_timestamp(timestamp) {
            return;
        }

        let buf = entry.buf();
        if let Some(mut msg) = buf.get(buf.low() + 1) {
            if let Some(Header::Unicast(UnicastHeader::Data { first, .. })) = &mut msg.header {
                *first = true;
            }
            self.core.down(&msg).await;
            ArqStats::inc(&self.core.stats().xmits_sent);
        }
    }

    async fn handle_xmit_req(&self, sender: NodeAddr, missing: SeqnoList) {
        trace!("{:?} <-- {:?}: XMIT_REQ({:?})", self.local_addr(), sender, missing);
        ArqStats::add(&self.core.stats().xmit_reqs_received, missing.len() as u64);
        let Some(entry) = self.send_table.get(&sender) else {
            return;
        };
        for seqno in missing.iter() {
            self.core.resend(&entry, seqno).await;
        }
    }

    fn handle_close(&self, sender: NodeAddr, conn_id: u16) {
        ArqStats::inc(&self.core.stats().closes_received);
        match self.recv_table.remove_if(&sender, |e| e.conn_id() == conn_id) {
            Some(entry) => {
                debug!("{:?} <-- {:?}: CLOSE(conn_id={}), removing receiver connection", self.local_addr(), sender, conn_id);
                entry.close();
            }
            None => trace!("{:?}: ignoring CLOSE(conn_id={}) from {:?} for unknown connection", self.local_addr(), conn_id, sender),
        }
    }

    fn get_receiver_entry(&self, sender: NodeAddr, seqno: u64, first: bool, conn_id: u16) -> ReceiverLookup {
        if let Some(entry) = self.recv_table.get(&sender) {
            if entry.conn_id() == conn_id {
                return ReceiverLookup::Found(entry);
            }
        }

        let _guard = self.recv_table_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.recv_table.get(&sender) {
            None if first => ReceiverLookup::Found(self.create_receiver_entry(sender, seqno, conn_id)),
            None => ReceiverLookup::Unsynchronized,
            Some(entry) if entry.conn_id() == conn_id => ReceiverLookup::Found(entry),
            Some(entry) if conn_id < entry.conn_id() => ReceiverLookup::Stale,
            Some(entry) if first => {
                trace!("{:?}: conn_id {} from {:?} is newer than mine ({}), creating new receiver connection", self.local_addr(), conn_id, sender, entry.conn_id());
                entry.close();
                ReceiverLookup::Found(self.create_receiver_entry(sender, seqno, conn_id))
            }
            Some(_) => ReceiverLookup::Unsynchronized,
        }
    }

    fn create_receiver_entry(&self, sender: NodeAddr, seqno: u64, conn_id: u16) -> Arc<ConnectionEntry> {
        let entry = Arc::new(ConnectionEntry::new_receiver(sender, conn_id, seqno.saturating_sub(1), None, self.core.clock()));
        self.recv_table.insert(sender, entry.clone());
        // gaps of a previous connection say nothing about this one
        self.core.xmit_watermarks().clear(&sender);
        trace!("{:?}: created receiver connection for {:?} at seqno #{} for conn_id {}", self.local_addr(), sender, seqno, conn_id);
        entry
    }

    async fn add_cached_messages(&self, sender: NodeAddr, entry: &ConnectionEntry) {
        if self.msg_cache.is_empty() {
            return;
        }
        for msg in self.msg_cache.drain(&sender) {
            let Some(&UnicastHeader::Data { seqno, conn_id, .. }) = msg.unicast_header() else {
                continue;
            };
            if conn_id == entry.conn_id() {
                self.core.add_received(entry, sender, seqno, msg).await;
            }
            else {
                warn!("{:?}: dropped cached message {:?}#{} as its conn_id ({}) did not match (entry conn_id={})", self.local_addr(), sender, seqno, conn_id, entry.conn_id());
            }
        }
    }

    async fn send_request_for_first_seqno(&self, dest: NodeAddr) {
        if self.last_sync_sent.add_if_absent_or_expired(dest) {
            trace!("{:?} --> {:?}: SEND_FIRST_SEQNO", self.local_addr(), dest);
            let timestamp = self.core.ack_strategy().next_timestamp();
            self.core.send_control(Some(dest), Header::Unicast(UnicastHeader::SendFirstSeqno { timestamp })).await;
            ArqStats::inc(&self.core.stats().first_seqno_reqs_sent);
        }
    }

    fn next_conn_id(&self) -> u16 {
        let result = self.last_conn_id.fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
            Some(if id >= i16::MAX as u16 { 0 } else { id + 1 })
        });
        // the closure never returns None
        result.unwrap_or_else(|id| id)
    }

    fn get_sender_entry(&self, dest: NodeAddr) -> Arc<ConnectionEntry> {
        if let Some(entry) = self.send_table.get(&dest) {
            if entry.state() != ConnectionState::Closed {
                return entry;
            }
            self.send_table.remove_if(&dest, |e| Arc::ptr_eq(e, &entry));
        }

        let entry = self.send_table.get_or_insert_with(&dest, || {
            let entry = ConnectionEntry::new_sender(dest, self.next_conn_id(), FIRST_SEQNO, self.config.send_window_capacity, self.core.clock());
            trace!("{:?}: created sender connection for {:?} (conn_id={})", self.local_addr(), dest, entry.conn_id());
            Arc::new(entry)
        });
        if let Some(age_out_cache) = &self.age_out_cache {
            if !self.is_view_member(&dest) {
                age_out_cache.add_if_absent(dest);
            }
        }
        entry
    }

    /// a closing connection is reopened by traffic, unless the peer left
    fn reopen_on_traffic(&self, entry: &ConnectionEntry) {
        if entry.state() == ConnectionState::Closing && self.core.view().is_member(&entry.peer()) {
            entry.reopen();
        }
    }

    /// `true` only if a view was installed and contains `addr`
    fn is_view_member(&self, addr: &NodeAddr) -> bool {
        self.core.view().current_view()
            .map(|v| v.contains(addr))
            .unwrap_or(false)
    }

    /// no more retransmission traffic to peers that left
    fn should_retransmit_to(&self, entry: &ConnectionEntry) -> bool {
        entry.state() == ConnectionState::Open || self.core.view().is_member(&entry.peer())
    }

    pub async fn send_pending_acks(&self) {
        self.core.send_pending_acks(self.recv_table.snapshot().values()).await;
    }

    /// closes both directions of the connection to `peer`, they are removed after `conn_close_timeout`
    pub fn close_connection(&self, peer: &NodeAddr) {
        self.close_send_connection(peer);
        self.close_receive_connection(peer);
    }

    pub fn close_send_connection(&self, peer: &NodeAddr) {
        if let Some(entry) = self.send_table.get(peer) {
            entry.set_state(ConnectionState::Closing);
        }
    }

    pub fn close_receive_connection(&self, peer: &NodeAddr) {
        if let Some(entry) = self.recv_table.get(peer) {
            entry.set_state(ConnectionState::Closing);
        }
    }

    /// Removes the sending connection. The peer is told to remove its receiving connection if it
    ///  is still a member, otherwise it is left to expire there.
    pub async fn remove_send_connection(&self, peer: &NodeAddr) {
        if let Some(entry) = self.send_table.remove(peer) {
            entry.close();
            if self.is_view_member(peer) {
                trace!("{:?} --> {:?}: CLOSE(conn_id={})", self.local_addr(), peer, entry.conn_id());
                self.core.send_control(Some(*peer), Header::Unicast(UnicastHeader::Close { conn_id: entry.conn_id() })).await;
                ArqStats::inc(&self.core.stats().closes_sent);
            }
        }
    }

    pub async fn remove_receive_connection(&self, peer: &NodeAddr) {
        self.send_pending_acks().await;
        if let Some(entry) = self.recv_table.remove(peer) {
            entry.close();
        }
    }

    pub fn remove_all_connections(&self) {
        for (_, entry) in self.send_table.clear() {
            entry.close();
        }
        for (_, entry) in self.recv_table.clear() {
            entry.close();
        }
    }

    /// moves open connections without traffic for `conn_expiry_timeout` to CLOSING
    pub fn close_idle_connections(&self) {
        for table in [&self.send_table, &self.recv_table] {
            for (peer, entry) in table.snapshot().iter() {
                if entry.state() == ConnectionState::Open && entry.idle_time() >= self.config.conn_expiry_timeout {
                    debug!("{:?}: closing idle connection to {:?} ({:?} idle)", self.local_addr(), peer, entry.idle_time());
                    entry.set_state(ConnectionState::Closing);
                }
            }
        }
    }

    /// removes connections that were closing for `conn_close_timeout`, returning their number
    pub async fn remove_expired_connections(&self) -> usize {
        let mut num_removed = 0;
        for (peer, entry) in self.send_table.snapshot().iter() {
            if entry.state() != ConnectionState::Open && entry.idle_time() >= self.config.conn_close_timeout {
                debug!("{:?}: removing expired sender connection to {:?}", self.local_addr(), peer);
                self.remove_send_connection(peer).await;
                num_removed += 1;
            }
        }
        for (peer, entry) in self.recv_table.snapshot().iter() {
            if entry.state() != ConnectionState::Open && entry.idle_time() >= self.config.conn_close_timeout {
                debug!("{:?}: removing expired receiver connection to {:?}", self.local_addr(), peer);
                self.remove_receive_connection(peer).await;
                num_removed += 1;
            }
        }
        num_removed
    }

    pub fn send_entry(&self, peer: &NodeAddr) -> Option<Arc<ConnectionEntry>> {
        self.send_table.get(peer)
    }

    pub fn recv_entry(&self, peer: &NodeAddr) -> Option<Arc<ConnectionEntry>> {
        self.recv_table.get(peer)
    }

    pub fn num_send_connections(&self) -> usize {
        self.send_table.len()
    }

    pub fn num_receive_connections(&self) -> usize {
        self.recv_table.len()
    }

    pub fn num_unacked_messages(&self) -> usize {
        self.send_table.snapshot().values().map(|e| e.buf().size()).sum()
    }

    pub fn stats(&self) -> ArqStatsSnapshot {
        self.core.stats().snapshot()
    }

    pub fn reset_stats(&self) {
        self.core.stats().reset();
    }

    /// a human readable dump of all connections
    pub fn print_connections(&self) -> String {
        let mut result = String::new();
        let send_table = self.send_table.snapshot();
        if !send_table.is_empty() {
            let _ = writeln!(result, "send connections:");
            for entry in send_table.values() {
                let _ = writeln!(result, "  {:?}", entry);
            }
        }
        let recv_table = self.recv_table.snapshot();
        if !recv_table.is_empty() {
            let _ = writeln!(result, "receive connections:");
            for entry in recv_table.values() {
                let _ = writeln!(result, "  {:?}", entry);
            }
        }
        result
    }
}

#[async_trait]
impl Retransmitter for ReliableUnicast {
    async fn trigger_xmit(&self) {
        let run = self.core.next_xmit_run();

        for (target, entry) in self.recv_table.snapshot().iter() {
            if entry.ack().take_pending() {
                self.core.send_ack(entry).await;
            }
            if !self.should_retransmit_to(entry) {
                continue;
            }
            if let Some(missing) = self.core.missing_to_request(entry, run) {
                trace!("{:?} --> {:?}: XMIT_REQ({:?})", self.local_addr(), target, missing);
                ArqStats::add(&self.core.stats().xmit_reqs_sent, missing.len() as u64);
                self.core.send_control(Some(*target), Header::Unicast(UnicastHeader::XmitReq { missing })).await;
            }
        }

        // the last message may have been lost, with no later message to reveal the gap
        for (target, entry) in self.send_table.snapshot().iter() {
            if !self.should_retransmit_to(entry) {
                continue;
            }
            let Some(sender_state) = entry.sender() else {
                continue;
            };
            let (highest_acked, highest_sent) = (entry.buf().highest_delivered(), entry.buf().high());
            if sender_state.check_stalled(highest_acked, highest_sent) {
                trace!("{:?} --> {:?}: resending #{} (highest acked: #{})", self.local_addr(), target, highest_sent, highest_acked);
                ArqStats::inc(&self.core.stats().stalled_resends);
                self.core.resend(entry, highest_sent).await;
            }
        }

        if let Some(age_out_cache) = &self.age_out_cache {
            for peer in age_out_cache.take_expired() {
                debug!("{:?}: closing expired connection to non-member {:?}", self.local_addr(), peer);
                self.close_connection(&peer);
            }
        }
        if !self.config.conn_expiry_timeout.is_zero() {
            self.close_idle_connections();
        }
        self.remove_expired_connections().await;

        // senders that did not answer SEND_FIRST_SEQNO in time are asked again with their next message
        self.last_sync_sent.remove_expired();
        self.msg_cache.retain(|sender| self.last_sync_sent.contains(sender));
    }
}

#[async_trait]
impl DatagramHandler for ReliableUnicast {
    async fn on_datagram(&self, datagram: &[u8]) {
        let mut buf = datagram;
        match Message::deser(&mut buf) {
            Ok(msg) => self.receive(msg).await,
            Err(e) => warn!("{:?}: dropping undecodable datagram: {}", self.local_addr(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::collecting_dispatcher::{CollectingDispatcher, Delivery};
    use crate::test_util::network::SimulatedNetwork;
    use crate::test_util::test_node_addr_from_number;
    use crate::test_util::tracking_transport::TrackingTransport;
    use std::sync::atomic::AtomicBool;
    use std::sync::Weak;
    use std::time::Duration;

    struct Node {
        addr: NodeAddr,
        unicast: Arc<ReliableUnicast>,
        transport: Arc<TrackingTransport>,
        dispatcher: Arc<CollectingDispatcher>,
    }

    fn config() -> UnicastConfig {
        UnicastConfig {
            xmit_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn node(number: u16, config: UnicastConfig) -> Node {
        let addr = test_node_addr_from_number(number);
        let transport = Arc::new(TrackingTransport::new());
        let dispatcher = Arc::new(CollectingDispatcher::new());
        let unicast = ReliableUnicast::new(addr, config, transport.clone(), dispatcher.clone()).unwrap();
        unicast.start();
        Node { addr, unicast, transport, dispatcher }
    }

    fn seqno_of(msg: &Message) -> Option<u64> {
        match msg.unicast_header() {
            Some(&UnicastHeader::Data { seqno, .. }) => Some(seqno),
            _ => None,
        }
    }

    /// hands everything `from` sent to `to`, except messages for which `drop` returns `true`
    async fn forward(from: &Node, to: &Node, drop: impl Fn(&Message) -> bool) {
        for (dest, msg) in from.transport.take_sent() {
            assert_eq!(dest, Some(to.addr));
            if !drop(&msg) {
                to.unicast.receive(msg).await;
            }
        }
    }

    async fn send(from: &Node, to: &Node, payload: &str) {
        from.unicast.send(Message::new(Some(to.addr), payload.to_string())).await.unwrap();
    }

    fn xmit_reqs(sent: &[(Option<NodeAddr>, Message)]) -> Vec<SeqnoList> {
        sent.iter()
            .filter_map(|(_, msg)| match msg.unicast_header() {
                Some(UnicastHeader::XmitReq { missing }) => Some(missing.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_lost_message_is_requested_and_delivered_with_successors() {
        let a = node(1, config());
        let b = node(2, config());

        for i in 1..=5 {
            send(&a, &b, &format!("m{}", i)).await;
        }
        forward(&a, &b, |msg| seqno_of(msg) == Some(3)).await;
        assert_eq!(b.dispatcher.delivered_payloads(), vec!["m1", "m2"]);

        // the gap is not requested on first sight
        b.unicast.trigger_xmit().await;
        assert!(xmit_reqs(&b.transport.take_sent()).is_empty());

        b.unicast.trigger_xmit().await;
        let sent = b.transport.take_sent();
        assert_eq!(xmit_reqs(&sent), vec![[3].into_iter().collect::<SeqnoList>()]);

        for (_, msg) in sent {
            a.unicast.receive(msg).await;
        }
        forward(&a, &b, |_| false).await;

        assert_eq!(b.dispatcher.delivered_payloads(), vec!["m1", "m2", "m3", "m4", "m5"]);
        match b.dispatcher.deliveries().last() {
            Some(Delivery::Batch(batch)) => {
                assert_eq!(batch.sender, a.addr);
                assert_eq!(batch.len(), 3);
            }
            other => panic!("expected a batch, got {:?}", other),
        }

        b.unicast.trigger_xmit().await;
        assert!(xmit_reqs(&b.transport.take_sent()).is_empty());
    }

    #[tokio::test]
    async fn test_ack_threshold_one_purges_sender() {
        let a = node(1, config());
        let b = node(2, UnicastConfig { ack_threshold: 1, ..config() });

        for i in 1..=3 {
            send(&a, &b, &format!("m{}", i)).await;
        }
        assert_eq!(a.unicast.num_unacked_messages(), 3);

        forward(&a, &b, |_| false).await;
        let sent = b.transport.take_sent();
        let acks: Vec<u64> = sent.iter()
            .filter_map(|(_, msg)| match msg.unicast_header() {
                Some(&UnicastHeader::Ack { seqno, conn_id: 0, .. }) => Some(seqno),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![1, 2, 3]);
        assert_eq!(b.unicast.stats().acks_sent, 3);

        for (_, msg) in sent {
            a.unicast.receive(msg).await;
        }

        assert_eq!(a.unicast.num_unacked_messages(), 0);
        let entry = a.unicast.send_entry(&b.addr).unwrap();
        assert_eq!(entry.buf().low(), 3);
        assert!(entry.sender().unwrap().is_ack_received());
    }

    #[tokio::test]
    async fn test_stalled_tail_is_resent_once_per_detection() {
        let a = node(1, config());
        let b = node(2, UnicastConfig { ack_threshold: 1, ..config() });

        for i in 1..=3 {
            send(&a, &b, &format!("m{}", i)).await;
        }
        forward(&a, &b, |msg| seqno_of(msg) == Some(3)).await;
        forward(&b, &a, |_| false).await;
        assert_eq!(a.unicast.send_entry(&b.addr).unwrap().buf().low(), 2);

        a.unicast.trigger_xmit().await;
        assert!(a.transport.take_sent().is_empty());

        a.unicast.trigger_xmit().await;
        let resent = a.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(seqno_of(&resent[0].1), Some(3));
        assert_eq!(a.unicast.stats().stalled_resends, 1);

        a.unicast.trigger_xmit().await;
        assert!(a.transport.take_sent().is_empty());

        for (_, msg) in resent {
            b.unicast.receive(msg).await;
        }
        forward(&b, &a, |_| false).await;
        assert_eq!(b.dispatcher.delivered_payloads(), vec!["m1", "m2", "m3"]);

        a.unicast.trigger_xmit().await;
        a.unicast.trigger_xmit().await;
        assert!(a.transport.take_sent().is_empty());
        assert_eq!(a.unicast.num_unacked_messages(), 0);
    }

    #[tokio::test]
    async fn test_view_change_stops_retransmission_to_departed_peer() {
        let a = node(1, config());
        let b = node(2, config());
        let view = View::new(1, vec![a.addr, b.addr]);
        a.unicast.on_view_change(&view).await;
        b.unicast.on_view_change(&view).await;

        for i in 1..=3 {
            send(&a, &b, &format!("m{}", i)).await;
        }
        forward(&a, &b, |msg| seqno_of(msg) == Some(2)).await;

        a.unicast.on_view_change(&View::new(2, vec![a.addr])).await;
        b.unicast.on_view_change(&View::new(2, vec![b.addr])).await;
        assert_eq!(b.unicast.recv_entry(&a.addr).unwrap().state(), ConnectionState::Closing);
        assert_eq!(a.unicast.send_entry(&b.addr).unwrap().state(), ConnectionState::Closing);

        for _ in 0..3 {
            b.unicast.trigger_xmit().await;
            a.unicast.trigger_xmit().await;
        }
        assert!(xmit_reqs(&b.transport.take_sent()).is_empty());
        assert!(a.transport.take_sent().is_empty());

        // traffic from a non-member does not reopen the connection
        send(&a, &b, "m4").await;
        forward(&a, &b, |_| false).await;
        assert_eq!(b.unicast.recv_entry(&a.addr).unwrap().state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_rejoining_member_reopens_connection() {
        let a = node(1, config());
        let b = node(2, config());
        b.unicast.on_view_change(&View::new(1, vec![a.addr, b.addr])).await;

        send(&a, &b, "m1").await;
        forward(&a, &b, |_| false).await;

        b.unicast.on_view_change(&View::new(2, vec![b.addr])).await;
        assert_eq!(b.unicast.recv_entry(&a.addr).unwrap().state(), ConnectionState::Closing);

        b.unicast.on_view_change(&View::new(3, vec![a.addr, b.addr])).await;
        assert_eq!(b.unicast.recv_entry(&a.addr).unwrap().state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_ack_for_previous_connection_is_ignored() {
        let a = node(1, config());
        let b = node(2, config());

        send(&a, &b, "old").await;
        forward(&a, &b, |_| false).await;
        a.unicast.remove_send_connection(&b.addr).await;

        send(&a, &b, "new").await;
        let entry = a.unicast.send_entry(&b.addr).unwrap();
        assert_eq!(entry.conn_id(), 1);

        let stale_ack = Message::control(b.addr, Some(a.addr), Header::Unicast(UnicastHeader::Ack { seqno: 1, conn_id: 0, timestamp: 100 }));
        a.unicast.receive(stale_ack).await;
        assert_eq!(entry.buf().size(), 1);
        assert!(!entry.sender().unwrap().is_ack_received());

        // the receiver replaces its connection when it sees the first message of the new one
        forward(&a, &b, |_| false).await;
        assert_eq!(b.unicast.recv_entry(&a.addr).unwrap().conn_id(), 1);
        assert_eq!(b.dispatcher.delivered_payloads(), vec!["old", "new"]);
    }

    #[tokio::test]
    async fn test_data_for_older_connection_is_dropped() {
        let a = node(1, config());
        let b = node(2, config());

        let data = |conn_id: u16, seqno: u64, payload: &str| Message::new(Some(b.addr), payload.to_string())
            .with_src(a.addr)
            .with_header(Header::Unicast(UnicastHeader::Data { seqno, conn_id, first: seqno == 1 }));

        b.unicast.receive(data(5, 1, "current")).await;
        b.unicast.receive(data(4, 2, "stale")).await;
        assert_eq!(b.dispatcher.delivered_payloads(), vec!["current"]);
        assert!(b.transport.take_sent().iter().all(|(_, m)| !matches!(m.unicast_header(), Some(UnicastHeader::SendFirstSeqno { .. }))));
    }

    fn data_from(from: &Node, to: &Node, conn_id: u16, seqno: u64, first: bool) -> Message {
        Message::new(Some(to.addr), format!("{}:{}", conn_id, seqno))
            .with_src(from.addr)
            .with_header(Header::Unicast(UnicastHeader::Data { seqno, conn_id, first }))
    }

    #[tokio::test]
    async fn test_gap_of_new_connection_waits_one_run() {
        let a = node(1, config());
        let b = node(2, config());

        b.unicast.receive(data_from(&a, &b, 0, 1, true)).await;
        b.unicast.receive(data_from(&a, &b, 0, 5, false)).await;
        b.unicast.trigger_xmit().await;
        assert!(xmit_reqs(&b.transport.take_sent()).is_empty());

        // the sender starts a new connection, which has a gap of its own
        b.unicast.receive(data_from(&a, &b, 1, 1, true)).await;
        b.unicast.receive(data_from(&a, &b, 1, 3, false)).await;
        assert_eq!(b.unicast.recv_entry(&a.addr).unwrap().conn_id(), 1);

        b.unicast.trigger_xmit().await;
        assert!(xmit_reqs(&b.transport.take_sent()).is_empty());
        b.unicast.trigger_xmit().await;
        assert_eq!(xmit_reqs(&b.transport.take_sent()), vec![[2].into_iter().collect::<SeqnoList>()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_first_seqno_request_releases_cached_messages() {
        let a = node(1, config());
        let b = node(2, config());

        b.unicast.receive(data_from(&a, &b, 0, 5, false)).await;
        b.unicast.receive(data_from(&a, &b, 0, 6, false)).await;
        assert!(!b.unicast.msg_cache.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        b.unicast.trigger_xmit().await;
        assert!(!b.unicast.msg_cache.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        b.unicast.trigger_xmit().await;
        assert!(b.unicast.msg_cache.is_empty());
        assert!(!b.unicast.last_sync_sent.contains(&a.addr));

        // the next message asks again
        b.transport.take_sent();
        b.unicast.receive(data_from(&a, &b, 0, 7, false)).await;
        let sent = b.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1.unicast_header(), Some(UnicastHeader::SendFirstSeqno { .. })));
    }

    #[tokio::test]
    async fn test_missing_first_message_is_requested_and_cached_messages_replayed() {
        let a = node(1, config());
        let b = node(2, config());

        for i in 1..=3 {
            send(&a, &b, &format!("m{}", i)).await;
        }
        forward(&a, &b, |msg| seqno_of(msg) == Some(1)).await;
        assert!(b.dispatcher.delivered().is_empty());
        assert!(b.unicast.recv_entry(&a.addr).is_none());

        // rate limited: two unsynchronized messages, one request
        let sent = b.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1.unicast_header(), Some(UnicastHeader::SendFirstSeqno { .. })));

        for (_, msg) in sent {
            a.unicast.receive(msg).await;
        }
        let resent = a.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1.unicast_header(), Some(&UnicastHeader::Data { seqno: 1, conn_id: 0, first: true }));

        for (_, msg) in resent {
            b.unicast.receive(msg).await;
        }
        assert_eq!(b.dispatcher.delivered_payloads(), vec!["m1", "m2", "m3"]);
        assert_eq!(b.dispatcher.num_batches(), 1);
    }

    #[tokio::test]
    async fn test_first_message_resend_rejects_stale_timestamp() {
        let a = node(1, config());
        let b = node(2, config());
        send(&a, &b, "m1").await;
        a.transport.take_sent();

        let request = |timestamp| Message::control(b.addr, Some(a.addr), Header::Unicast(UnicastHeader::SendFirstSeqno { timestamp }));
        a.unicast.receive(request(5)).await;
        a.unicast.receive(request(4)).await;
        assert_eq!(a.transport.take_sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_connection_is_removed_and_peer_told() {
        let a = node(1, UnicastConfig { conn_expiry_timeout: Duration::ZERO, conn_close_timeout: Duration::from_secs(10), ..config() });
        let b = node(2, config());
        let view = View::new(1, vec![a.addr, b.addr]);
        a.unicast.on_view_change(&view).await;
        b.unicast.on_view_change(&view).await;

        send(&a, &b, "m1").await;
        forward(&a, &b, |_| false).await;

        a.unicast.close_send_connection(&b.addr);
        tokio::time::advance(Duration::from_secs(11)).await;
        a.unicast.trigger_xmit().await;
        assert!(a.unicast.send_entry(&b.addr).is_none());

        a.transport.assert_message_sent(Some(b.addr), Header::Unicast(UnicastHeader::Close { conn_id: 0 }));
        a.transport.assert_no_remaining_messages();

        b.unicast.receive(Message::control(a.addr, Some(b.addr), Header::Unicast(UnicastHeader::Close { conn_id: 0 }))).await;
        assert!(b.unicast.recv_entry(&a.addr).is_none());
        assert_eq!(b.unicast.stats().closes_received, 1);
    }

    #[tokio::test]
    async fn test_close_for_other_connection_is_ignored() {
        let a = node(1, config());
        let b = node(2, config());
        send(&a, &b, "m1").await;
        forward(&a, &b, |_| false).await;

        b.unicast.receive(Message::control(a.addr, Some(b.addr), Header::Unicast(UnicastHeader::Close { conn_id: 7 }))).await;
        assert!(b.unicast.recv_entry(&a.addr).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connections_are_closed_then_removed() {
        let config = UnicastConfig {
            conn_expiry_timeout: Duration::from_secs(5),
            conn_close_timeout: Duration::from_secs(10),
            ack_threshold: 1,
            ..config()
        };
        let a = node(1, config.clone());
        let b = node(2, config);

        send(&a, &b, "m1").await;
        forward(&a, &b, |_| false).await;
        forward(&b, &a, |_| false).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        a.unicast.trigger_xmit().await;
        b.unicast.trigger_xmit().await;
        assert_eq!(a.unicast.send_entry(&b.addr).unwrap().state(), ConnectionState::Closing);
        assert_eq!(b.unicast.recv_entry(&a.addr).unwrap().state(), ConnectionState::Closing);

        tokio::time::advance(Duration::from_secs(11)).await;
        a.unicast.trigger_xmit().await;
        b.unicast.trigger_xmit().await;
        assert_eq!(a.unicast.num_send_connections(), 0);
        assert_eq!(b.unicast.num_receive_connections(), 0);

        // without a view, the peer is not told
        assert!(a.transport.take_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_keep_connection_alive() {
        let config = UnicastConfig {
            conn_expiry_timeout: Duration::from_secs(5),
            conn_close_timeout: Duration::from_secs(10),
            ack_threshold: 1,
            ..config()
        };
        let a = node(1, config.clone());
        let b = node(2, config);

        send(&a, &b, "m1").await;
        tokio::time::advance(Duration::from_secs(4)).await;
        forward(&a, &b, |_| false).await;
        forward(&b, &a, |_| false).await;
        assert!(a.unicast.send_entry(&b.addr).unwrap().sender().unwrap().is_ack_received());

        tokio::time::advance(Duration::from_secs(2)).await;
        a.unicast.trigger_xmit().await;
        assert_eq!(a.unicast.send_entry(&b.addr).unwrap().state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_to_non_member_ages_out() {
        let a = node(1, UnicastConfig { max_retransmit_time: Duration::from_secs(30), ..config() });
        let b = node(2, config());
        a.unicast.on_view_change(&View::new(1, vec![a.addr])).await;

        send(&a, &b, "m1").await;
        a.unicast.trigger_xmit().await;
        assert_eq!(a.unicast.send_entry(&b.addr).unwrap().state(), ConnectionState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        a.unicast.trigger_xmit().await;
        assert_eq!(a.unicast.send_entry(&b.addr).unwrap().state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_loopback_delivers_directly() {
        let a = node(1, UnicastConfig { loopback: true, ..config() });

        a.unicast.send(Message::new(Some(a.addr), "self")).await.unwrap();
        a.unicast.send(Message::new(Some(a.addr), "hidden").with_flags(MessageFlags::DONT_LOOPBACK)).await.unwrap();

        assert_eq!(a.dispatcher.delivered_payloads(), vec!["self"]);
        assert!(a.transport.take_sent().is_empty());
        assert_eq!(a.unicast.stats().loopbacks, 1);
    }

    #[tokio::test]
    async fn test_message_to_self_through_transport() {
        let a = node(1, config());

        a.unicast.send(Message::new(Some(a.addr), "m1")).await.unwrap();
        a.unicast.send(Message::new(Some(a.addr), "m2")).await.unwrap();
        for (dest, msg) in a.transport.take_sent() {
            assert_eq!(dest, Some(a.addr));
            a.unicast.receive(msg).await;
        }

        assert_eq!(a.dispatcher.delivered_payloads(), vec!["m1", "m2"]);
        assert!(a.unicast.send_entry(&a.addr).unwrap().buf().is_empty());
        a.transport.assert_no_remaining_messages();
    }

    #[tokio::test]
    async fn test_no_reliability_bypasses_sequencing() {
        let a = node(1, config());
        let b = node(2, config());

        a.unicast.send(Message::new(Some(b.addr), "raw").with_flags(MessageFlags::NO_RELIABILITY)).await.unwrap();
        assert!(a.unicast.send_entry(&b.addr).is_none());

        forward(&a, &b, |_| false).await;
        assert_eq!(b.dispatcher.delivered_payloads(), vec!["raw"]);
        assert!(b.unicast.recv_entry(&a.addr).is_none());
    }

    #[tokio::test]
    async fn test_send_without_destination_fails() {
        let a = node(1, config());
        assert!(a.unicast.send(Message::new(None, "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_stopped_engine_drops_messages() {
        let a = node(1, config());
        let b = node(2, config());
        a.unicast.stop().await;

        send(&a, &b, "m1").await;
        a.transport.assert_no_remaining_messages();
        assert_eq!(a.unicast.num_send_connections(), 0);
    }

    #[tokio::test]
    async fn test_batch_is_delivered_in_order() {
        let a = node(1, config());
        let b = node(2, config());

        for i in 1..=4 {
            send(&a, &b, &format!("m{}", i)).await;
        }
        let mut msgs: Vec<Message> = a.transport.take_sent().into_iter().map(|(_, m)| m).collect();
        msgs.reverse();
        b.unicast.receive_batch(MessageBatch::new(a.addr, Some(b.addr), msgs)).await;

        assert_eq!(b.dispatcher.delivered_payloads(), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(b.dispatcher.num_batches(), 1);
    }

    #[rstest::rstest]
    #[case::zero_interval(UnicastConfig { xmit_interval: Duration::ZERO, ..Default::default() })]
    #[case::close_before_expiry(UnicastConfig { conn_close_timeout: Duration::from_secs(1), conn_expiry_timeout: Duration::from_secs(2), ..Default::default() })]
    #[case::zero_ack_threshold(UnicastConfig { ack_threshold: 0, ..Default::default() })]
    fn test_invalid_config_is_rejected(#[case] config: UnicastConfig) {
        let result = ReliableUnicast::new(test_node_addr_from_number(1), config, Arc::new(TrackingTransport::new()), Arc::new(CollectingDispatcher::new()));
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossy_network_delivers_everything_in_order() {
        let network = SimulatedNetwork::new();
        let config = UnicastConfig { xmit_interval: Duration::from_millis(100), ..Default::default() };

        let a_addr = test_node_addr_from_number(1);
        let b_addr = test_node_addr_from_number(2);
        let b_dispatcher = Arc::new(CollectingDispatcher::new());
        let a = ReliableUnicast::new(a_addr, config.clone(), network.transport(a_addr), Arc::new(CollectingDispatcher::new())).unwrap();
        let b = ReliableUnicast::new(b_addr, config, network.transport(b_addr), b_dispatcher.clone()).unwrap();
        let a_handler: Weak<dyn DatagramHandler> = Arc::downgrade(&a) as Weak<dyn DatagramHandler>;
        let b_handler: Weak<dyn DatagramHandler> = Arc::downgrade(&b) as Weak<dyn DatagramHandler>;
        network.register(a_addr, a_handler);
        network.register(b_addr, b_handler);
        a.start();
        b.start();

        let dropped_once = AtomicBool::new(false);
        network.set_drop_filter(move |_, _, msg| {
            matches!(msg.unicast_header(), Some(UnicastHeader::Data { seqno: 2, .. }))
                && !dropped_once.swap(true, Ordering::AcqRel)
        });

        for i in 1..=5 {
            a.send(Message::new(Some(b_addr), format!("m{}", i))).await.unwrap();
        }
        network.settle().await;
        assert_eq!(b_dispatcher.delivered_payloads(), vec!["m1"]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        network.settle().await;
        assert_eq!(b_dispatcher.delivered_payloads(), vec!["m1", "m2", "m3", "m4", "m5"]);
        assert!(b.stats().xmit_reqs_sent >= 1);
    }
}
