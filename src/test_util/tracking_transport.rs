use crate::headers::Header;
use crate::message::Message;
use crate::node_addr::NodeAddr;
use crate::transport::DatagramTransport;
use async_trait::async_trait;
use std::sync::Mutex;

/// A transport that records the messages it is asked to send instead of sending them
#[derive(Debug)]
pub struct TrackingTransport {
    tracker: Mutex<Vec<(Option<NodeAddr>, Message)>>,
    max_datagram_size: usize,
}

impl Default for TrackingTransport {
    fn default() -> Self {
        TrackingTransport::with_max_datagram_size(65_000)
    }
}

impl TrackingTransport {
    pub fn new() -> TrackingTransport {
        TrackingTransport::default()
    }

    pub fn with_max_datagram_size(max_datagram_size: usize) -> TrackingTransport {
        TrackingTransport {
            tracker: Default::default(),
            max_datagram_size,
        }
    }

    /// removes and returns everything sent so far
    pub fn take_sent(&self) -> Vec<(Option<NodeAddr>, Message)> {
        std::mem::take(&mut *self.tracker.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// removes and returns the headers of everything sent so far
    pub fn take_sent_headers(&self) -> Vec<(Option<NodeAddr>, Option<Header>)> {
        self.take_sent().into_iter()
            .map(|(to, msg)| (to, msg.header))
            .collect()
    }

    /// removes the oldest sent message, asserting its destination and header
    pub fn assert_message_sent(&self, to: Option<NodeAddr>, header: Header) -> Message {
        let mut lock = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if lock.is_empty() {
            panic!("no message was sent, expected {:?} to {:?}", header, to);
        }

        let (actual_to, actual_msg) = lock.remove(0);
        assert_eq!(actual_msg.header.as_ref(), Some(&header));
        assert_eq!(actual_to, to);
        actual_msg
    }

    pub fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        assert!(lock.is_empty(), "unexpected messages: {:?}", lock);
    }
}

#[async_trait]
impl DatagramTransport for TrackingTransport {
    async fn send_datagram(&self, to: Option<NodeAddr>, datagram: &[u8]) {
        let mut buf = datagram;
        let msg = match Message::deser(&mut buf) {
            Ok(msg) => msg,
            Err(e) => panic!("sent an undecodable datagram: {}", e),
        };
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
            .push((to, msg));
    }

    fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }
}
