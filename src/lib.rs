pub mod arq;
pub mod buffers;
pub mod channel;
pub mod config;
pub mod digest;
pub mod headers;
pub mod message;
pub mod message_dispatcher;
pub mod multicast;
pub mod node_addr;
pub mod seqno_list;
pub mod test_util;
pub mod transport;
pub mod unicast;
pub mod util;
pub mod view;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
