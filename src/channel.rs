use crate::config::ChannelConfig;
use crate::headers::ProtocolId;
use crate::message::{Message, MessageFlags};
use crate::message_dispatcher::MessageDispatcher;
use crate::multicast::ReliableMulticast;
use crate::node_addr::NodeAddr;
use crate::transport::{DatagramHandler, DatagramTransport};
use crate::unicast::ReliableUnicast;
use crate::view::View;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Both reliability protocols on top of a single transport. Messages with a destination go
///  point-to-point, messages without one are broadcast; incoming datagrams are handed to the
///  protocol their header belongs to.
pub struct ReliableChannel {
    local_addr: NodeAddr,
    unicast: Arc<ReliableUnicast>,
    multicast: Arc<ReliableMulticast>,
    dispatcher: Arc<dyn MessageDispatcher>,
}

impl ReliableChannel {
    pub fn new(local_addr: NodeAddr, config: ChannelConfig, transport: Arc<dyn DatagramTransport>, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<Arc<ReliableChannel>> {
        config.validate()?;
        Ok(Arc::new(ReliableChannel {
            local_addr,
            unicast: ReliableUnicast::new(local_addr, config.unicast, transport.clone(), dispatcher.clone())?,
            multicast: ReliableMulticast::new(local_addr, config.multicast, transport, dispatcher.clone())?,
            dispatcher,
        }))
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.local_addr
    }

    pub fn unicast(&self) -> &Arc<ReliableUnicast> {
        &self.unicast
    }

    pub fn multicast(&self) -> &Arc<ReliableMulticast> {
        &self.multicast
    }

    pub fn start(&self) {
        info!("{:?}: starting reliable channel", self.local_addr);
        self.unicast.start();
        self.multicast.start();
    }

    pub async fn stop(&self) {
        info!("{:?}: stopping reliable channel", self.local_addr);
        self.multicast.stop();
        self.unicast.stop().await;
    }

    pub async fn send(&self, msg: Message) -> anyhow::Result<()> {
        match msg.dest {
            Some(_) => self.unicast.send(msg).await,
            None => {
                self.multicast.send(msg).await;
                Ok(())
            }
        }
    }

    pub async fn receive(&self, msg: Message) {
        let protocol = match &msg.header {
            Some(header) if !msg.is_flag_set(MessageFlags::NO_RELIABILITY) => header.protocol_id(),
            _ => ProtocolId::None,
        };

        match protocol {
            ProtocolId::Unicast => self.unicast.receive(msg).await,
            ProtocolId::Multicast | ProtocolId::Stable => self.multicast.receive(msg).await,
            ProtocolId::None => self.dispatcher.deliver(msg).await,
        }
    }

    pub async fn on_view_change(&self, view: &View) {
        debug!("{:?}: view {} {:?}", self.local_addr, view.view_id, view.members);
        self.unicast.on_view_change(view).await;
        self.multicast.on_view_change(view).await;
        self.dispatcher.on_view_change(view).await;
    }
}

#[async_trait]
impl DatagramHandler for ReliableChannel {
    async fn on_datagram(&self, datagram: &[u8]) {
        let mut buf = datagram;
        match Message::deser(&mut buf) {
            Ok(msg) => self.receive(msg).await,
            Err(e) => warn!("{:?}: dropping undecodable datagram: {}", self.local_addr, e),
        }
    }
}
