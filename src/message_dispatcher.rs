use crate::message::{Message, MessageBatch};
use crate::view::View;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// The application above the reliability layer. Delivery calls are made from whichever task
///  completed extraction from a receive buffer; calls for messages from the same sender never
///  overlap, and they arrive in sequence order (except for OOB messages).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn deliver(&self, msg: Message);

    async fn deliver_batch(&self, batch: MessageBatch);

    async fn on_view_change(&self, view: &View);
}
