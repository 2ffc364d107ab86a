pub mod ack_strategy;
pub mod backoff;
pub mod core;
pub mod entry;
pub mod scheduler;
pub mod stats;
pub mod xmit_watermarks;
