use crate::message::{Message, MessageBatch};
use crate::message_dispatcher::MessageDispatcher;
use crate::node_addr::NodeAddr;
use crate::view::View;
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum Delivery {
    Single(Message),
    Batch(MessageBatch),
}

/// A dispatcher that records deliveries and view changes
#[derive(Debug, Default)]
pub struct CollectingDispatcher {
    deliveries: Mutex<Vec<Delivery>>,
    views: Mutex<Vec<View>>,
}

impl CollectingDispatcher {
    pub fn new() -> CollectingDispatcher {
        CollectingDispatcher::default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// all delivered messages in delivery order, batches flattened
    pub fn delivered(&self) -> Vec<Message> {
        self.deliveries().into_iter()
            .flat_map(|d| match d {
                Delivery::Single(msg) => vec![msg],
                Delivery::Batch(batch) => batch.messages,
            })
            .collect()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        self.delivered().iter()
            .map(|msg| String::from_utf8_lossy(&msg.payload).to_string())
            .collect()
    }

    pub fn delivered_payloads_from(&self, sender: NodeAddr) -> Vec<String> {
        self.delivered().iter()
            .filter(|msg| msg.src == Some(sender))
            .map(|msg| String::from_utf8_lossy(&msg.payload).to_string())
            .collect()
    }

    pub fn num_batches(&self) -> usize {
        self.deliveries().iter()
            .filter(|d| matches!(d, Delivery::Batch(_)))
            .count()
    }

    pub fn views(&self) -> Vec<View> {
        self.views.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl MessageDispatcher for CollectingDispatcher {
    async fn deliver(&self, msg: Message) {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
            .push(Delivery::Single(msg));
    }

    async fn deliver_batch(&self, batch: MessageBatch) {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
            .push(Delivery::Batch(batch));
    }

    async fn on_view_change(&self, view: &View) {
        self.views.lock().unwrap_or_else(|e| e.into_inner())
            .push(view.clone());
    }
}
