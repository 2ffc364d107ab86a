pub mod clock;
pub mod random;
pub mod suppress_log;
