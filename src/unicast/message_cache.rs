use crate::message::Message;
use crate::node_addr::NodeAddr;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tracing::trace;

/// Messages received from a sender before the connection to it was established, kept until the
///  sender resent its first message
pub struct MessageCache {
    max_per_sender: usize,
    messages: Mutex<FxHashMap<NodeAddr, Vec<Message>>>,
}

impl MessageCache {
    pub fn new(max_per_sender: usize) -> MessageCache {
        MessageCache {
            max_per_sender,
            messages: Mutex::new(FxHashMap::default()),
        }
    }

    /// caches a message, dropping it if the sender's cache is full
    pub fn add(&self, sender: NodeAddr, msg: Message) -> bool {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        let cached = messages.entry(sender).or_default();
        if cached.len() >= self.max_per_sender {
            trace!("message cache for {:?} is full, dropping message", sender);
            return false;
        }
        cached.push(msg);
        true
    }

    /// removes and returns the messages cached for `sender`
    pub fn drain(&self, sender: &NodeAddr) -> Vec<Message> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
            .remove(sender)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub fn retain(&self, mut f: impl FnMut(&NodeAddr) -> bool) {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
            .retain(|sender, _| f(sender));
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
