use crate::message::Message;
use crate::node_addr::NodeAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tracing::trace;

/// The unreliable datagram transport below the reliability layer. Datagrams may be lost,
///  reordered or duplicated, and a broadcast may reach any subset of the current members.
///
/// Sending is fire-and-forget: implementations log failures rather than returning them, since
///  the protocols recover from a failed send the same way they recover from a lost datagram.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// sends to a single peer, or to all members if `to` is `None`
    async fn send_datagram(&self, to: Option<NodeAddr>, datagram: &[u8]);

    /// the largest datagram the transport can send, used to size retransmission requests
    fn max_datagram_size(&self) -> usize;
}

/// The upward side of the transport: whatever reads datagrams from the network hands them to a
///  handler
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, datagram: &[u8]);
}

/// Serializes messages and hands them to the transport
#[derive(Clone)]
pub struct MessageSender {
    transport: Arc<dyn DatagramTransport>,
}

impl MessageSender {
    pub fn new(transport: Arc<dyn DatagramTransport>) -> MessageSender {
        MessageSender { transport }
    }

    pub async fn send(&self, msg: &Message) {
        trace!("sending {:?} to {:?}", msg.header, msg.dest);
        let buf = msg.to_bytes();
        self.transport.send_datagram(msg.dest, &buf).await;
    }

    pub fn max_datagram_size(&self) -> usize {
        self.transport.max_datagram_size()
    }
}
