//! Utilities for testing code built on the reliability layer: a transport that records what was
//!  sent, a dispatcher that records what was delivered, and an in-memory network with
//!  configurable message loss connecting several nodes.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so applications can use them for
//!  their own tests.

use crate::node_addr::NodeAddr;
use std::net::{Ipv4Addr, SocketAddrV4};

pub mod collecting_dispatcher;
pub mod network;
pub mod tracking_transport;

/// convenience method for unit test code: create a [NodeAddr] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_node_addr_from_number(number: u16) -> NodeAddr {
    NodeAddr::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into(), number.into())
}
