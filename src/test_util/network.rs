use crate::message::Message;
use crate::node_addr::NodeAddr;
use crate::transport::{DatagramHandler, DatagramTransport};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// Decides whether a datagram from the first to the second address is lost
pub type DropFilter = Box<dyn Fn(&NodeAddr, &NodeAddr, &Message) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Transmission {
    pub from: NodeAddr,
    pub to: NodeAddr,
    pub msg: Message,
    pub dropped: bool,
}

/// An in-memory network between nodes. Every node has a receive queue drained by its own task,
///  so delivery is asynchronous like on a real network. Datagrams can be dropped selectively.
pub struct SimulatedNetwork {
    nodes: RwLock<FxHashMap<NodeAddr, mpsc::UnboundedSender<Bytes>>>,
    drop_filter: RwLock<Option<DropFilter>>,
    log: Mutex<Vec<Transmission>>,
    in_flight: Arc<AtomicUsize>,
    max_datagram_size: usize,
}

impl SimulatedNetwork {
    pub fn new() -> Arc<SimulatedNetwork> {
        Arc::new(SimulatedNetwork {
            nodes: Default::default(),
            drop_filter: Default::default(),
            log: Default::default(),
            in_flight: Default::default(),
            max_datagram_size: 65_000,
        })
    }

    /// the transport for a node with address `local`
    pub fn transport(self: &Arc<Self>, local: NodeAddr) -> Arc<NetworkTransport> {
        Arc::new(NetworkTransport {
            network: self.clone(),
            local,
        })
    }

    /// Connects a node's receiving side. The handler is held weakly, so dropping the node
    ///  disconnects it.
    pub fn register(&self, addr: NodeAddr, handler: Weak<dyn DatagramHandler>) {
        let (send, mut recv) = mpsc::unbounded_channel::<Bytes>();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            while let Some(datagram) = recv.recv().await {
                if let Some(handler) = handler.upgrade() {
                    handler.on_datagram(&datagram).await;
                }
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        });

        self.nodes.write().unwrap_or_else(|e| e.into_inner())
            .insert(addr, send);
    }

    /// disconnects a node: datagrams to it are lost from now on
    pub fn unregister(&self, addr: &NodeAddr) {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }

    /// `filter(from, to, msg)` returns `true` for datagrams that are lost
    pub fn set_drop_filter(&self, filter: impl Fn(&NodeAddr, &NodeAddr, &Message) -> bool + Send + Sync + 'static) {
        *self.drop_filter.write().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// removes and returns all transmissions so far, including dropped ones
    pub fn take_log(&self) -> Vec<Transmission> {
        std::mem::take(&mut *self.log.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Waits until all datagrams in flight were handled, including the ones sent while handling
    ///  others.
    pub async fn settle(&self) {
        for _ in 0..100_000 {
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
        }
        panic!("network did not settle, {} datagrams in flight", self.in_flight.load(Ordering::Acquire));
    }

    fn transmit(&self, from: NodeAddr, to: Option<NodeAddr>, datagram: &[u8]) {
        let mut buf = datagram;
        let msg = match Message::deser(&mut buf) {
            Ok(msg) => msg,
            Err(e) => panic!("sent an undecodable datagram: {}", e),
        };

        let targets: Vec<(NodeAddr, mpsc::UnboundedSender<Bytes>)> = {
            let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
            match to {
                Some(to) => nodes.get(&to).map(|s| vec![(to, s.clone())]).unwrap_or_default(),
                None => nodes.iter().map(|(a, s)| (*a, s.clone())).collect(),
            }
        };

        let drop_filter = self.drop_filter.read().unwrap_or_else(|e| e.into_inner());
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        for (target, sender) in targets {
            let dropped = drop_filter.as_ref()
                .map(|f| f(&from, &target, &msg))
                .unwrap_or(false);
            trace!("{:?} -> {:?}: {:?}{}", from, target, msg.header, if dropped { " (dropped)" } else { "" });

            if !dropped {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                if sender.send(Bytes::copy_from_slice(datagram)).is_err() {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }
            log.push(Transmission { from, to: target, msg: msg.clone(), dropped });
        }
    }
}

/// A node's access to a [SimulatedNetwork]
pub struct NetworkTransport {
    network: Arc<SimulatedNetwork>,
    local: NodeAddr,
}

#[async_trait]
impl DatagramTransport for NetworkTransport {
    async fn send_datagram(&self, to: Option<NodeAddr>, datagram: &[u8]) {
        self.network.transmit(self.local, to, datagram);
    }

    fn max_datagram_size(&self) -> usize {
        self.network.max_datagram_size
    }
}
