use anyhow::bail;
use std::time::Duration;

/// Configuration of the point-to-point reliability protocol
#[derive(Debug, Clone)]
pub struct UnicastConfig {
    /// Interval between runs of the retransmission task. Each run requests missing messages,
    ///  sends deferred acks, probes stalled connections and reaps idle connections.
    pub xmit_interval: Duration,

    /// An open connection without traffic for this long is closed (but not removed, a message
    ///  from or to the peer reopens it). Zero disables idle expiry.
    pub conn_expiry_timeout: Duration,

    /// A closing connection is removed after this long. On the sending side, this sends a CLOSE
    ///  message to the peer if it is still a member.
    pub conn_close_timeout: Duration,

    /// Connections to peers that are not members of the current view are closed after this long,
    ///  bounding retransmission to peers that left. Zero disables this.
    pub max_retransmit_time: Duration,

    /// Number of delivered messages after which an ack is sent right away. Below this threshold,
    ///  acks are deferred to the next run of the retransmission task. 1 acks every message.
    pub ack_threshold: usize,

    /// Minimum interval between two requests to the same peer to resend its first message
    pub sync_min_interval: Duration,

    /// Upper bound for the number of seqnos in a single retransmission request. The effective
    ///  limit is lower if the request would not fit into a datagram.
    pub max_xmit_req_size: usize,

    /// Upper bound for the number of messages delivered in a single batch
    pub max_batch_size: usize,

    /// Deliver messages to self directly instead of passing them through the transport
    pub loopback: bool,

    /// Hold the connection's send lock across seqno assignment, buffering and handing the message
    ///  to the transport, so the transport sees messages in seqno order. Without this, concurrent
    ///  senders may hand messages to the transport slightly out of order, which costs a
    ///  retransmission round on the receiving side.
    pub send_atomically: bool,

    /// Log a warning when a retransmission is requested for a message that is no longer buffered
    pub log_not_found_msgs: bool,

    /// Maximum number of unacknowledged seqnos per connection. Senders wait (or drop messages
    ///  flagged `DONT_BLOCK`) when the window is full. `None` means unbounded.
    pub send_window_capacity: Option<usize>,

    /// Maximum number of messages cached per sender while waiting for the first message of a
    ///  connection
    pub max_cached_msgs_per_sender: usize,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        UnicastConfig {
            xmit_interval: Duration::from_millis(500),
            conn_expiry_timeout: Duration::from_secs(120),
            conn_close_timeout: Duration::from_secs(240),
            max_retransmit_time: Duration::from_secs(60),
            ack_threshold: 100,
            sync_min_interval: Duration::from_secs(2),
            max_xmit_req_size: 1024,
            max_batch_size: 512,
            loopback: false,
            send_atomically: false,
            log_not_found_msgs: true,
            send_window_capacity: None,
            max_cached_msgs_per_sender: 1024,
        }
    }
}

impl UnicastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.xmit_interval.is_zero() {
            bail!("xmit_interval must be greater than zero");
        }
        if !self.conn_expiry_timeout.is_zero() && self.conn_close_timeout <= self.conn_expiry_timeout {
            bail!("conn_close_timeout ({:?}) must be greater than conn_expiry_timeout ({:?})", self.conn_close_timeout, self.conn_expiry_timeout);
        }
        if self.conn_close_timeout.is_zero() {
            bail!("conn_close_timeout must be greater than zero");
        }
        if self.ack_threshold == 0 {
            bail!("ack_threshold must be at least 1");
        }
        if self.max_xmit_req_size == 0 {
            bail!("max_xmit_req_size must be at least 1");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be at least 1");
        }
        if self.send_window_capacity == Some(0) {
            bail!("send_window_capacity must be at least 1 if it is set");
        }
        Ok(())
    }
}

/// Configuration of the digest exchange that purges delivered multicast messages
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    pub enabled: bool,

    /// Interval at which every member broadcasts its digest. A round completes when a member has
    ///  received the digests of all members of the current view.
    pub desired_avg_gossip: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        StabilityConfig {
            enabled: true,
            desired_avg_gossip: Duration::from_secs(20),
        }
    }
}

/// Configuration of the one-to-many reliability protocol
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Interval between runs of the retransmission task
    pub xmit_interval: Duration,

    /// Upper bound for the number of seqnos in a single retransmission request
    pub max_xmit_req_size: usize,

    /// Upper bound for the number of messages delivered in a single batch
    pub max_batch_size: usize,

    /// Retransmit by broadcasting the original message instead of sending it to the requester
    ///  only. This helps if many members miss the same messages.
    pub use_mcast_xmit: bool,

    /// Broadcast retransmission requests instead of sending them to the original sender
    pub use_mcast_xmit_req: bool,

    /// Ask a random member instead of the original sender for retransmission, spreading the
    ///  load. Requires `discard_delivered_msgs` to be `false` on other members to be useful.
    pub xmit_from_random_member: bool,

    /// Receivers drop messages from other senders right after delivering them, leaving
    ///  retransmission to the original sender. Otherwise they are kept until a stability round
    ///  purges them.
    pub discard_delivered_msgs: bool,

    /// Log a warning for dropped messages from non-members
    pub log_discard_msgs: bool,

    /// Log a warning when a retransmission is requested for a message that is no longer buffered
    pub log_not_found_msgs: bool,

    /// see [UnicastConfig::send_atomically]
    pub send_atomically: bool,

    /// see [UnicastConfig::send_window_capacity]
    pub send_window_capacity: Option<usize>,

    /// Number of messages queued before the first view is installed. Zero disables queueing, such
    ///  messages are dropped.
    pub become_server_queue_size: usize,

    /// Minimum interval between two warnings about messages from the same non-member
    pub suppress_time_non_member_warnings: Duration,

    /// Broadcast the highest sent seqno when idle, so receivers can detect a lost last message
    pub resend_last_seqno: bool,

    /// Number of times the same highest seqno is broadcast before the sender falls silent
    pub resend_last_seqno_max_times: u32,

    pub stability: StabilityConfig,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            xmit_interval: Duration::from_secs(1),
            max_xmit_req_size: 1024,
            max_batch_size: 512,
            use_mcast_xmit: false,
            use_mcast_xmit_req: false,
            xmit_from_random_member: false,
            discard_delivered_msgs: true,
            log_discard_msgs: true,
            log_not_found_msgs: true,
            send_atomically: false,
            send_window_capacity: None,
            become_server_queue_size: 50,
            suppress_time_non_member_warnings: Duration::from_secs(60),
            resend_last_seqno: true,
            resend_last_seqno_max_times: 1,
            stability: StabilityConfig::default(),
        }
    }
}

impl MulticastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.xmit_interval.is_zero() {
            bail!("xmit_interval must be greater than zero");
        }
        if self.max_xmit_req_size == 0 {
            bail!("max_xmit_req_size must be at least 1");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be at least 1");
        }
        if self.send_window_capacity == Some(0) {
            bail!("send_window_capacity must be at least 1 if it is set");
        }
        if self.stability.enabled && self.stability.desired_avg_gossip.is_zero() {
            bail!("stability.desired_avg_gossip must be greater than zero");
        }
        if self.resend_last_seqno && self.resend_last_seqno_max_times == 0 {
            bail!("resend_last_seqno_max_times must be at least 1 if resend_last_seqno is set");
        }
        if self.xmit_from_random_member && self.use_mcast_xmit_req {
            bail!("xmit_from_random_member and use_mcast_xmit_req are mutually exclusive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub unicast: UnicastConfig,
    pub multicast: MulticastConfig,
}

impl ChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.unicast.validate()?;
        self.multicast.validate()
    }
}
