use anyhow::anyhow;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut};


/// A group member's address. The same network address can be reused by a process that restarted,
///  so `unique` (typically the millis since epoch at startup) distinguishes incarnations: peer
///  tables are keyed by the full `NodeAddr`, and a restarted peer gets fresh connection entries.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeAddr {
    pub unique: u64,
    pub socket_addr: SocketAddr,
}
impl Hash for NodeAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique.hash(state);
        match self.socket_addr {
            SocketAddr::V4(s) => s.ip().to_bits().hash(state),
            SocketAddr::V6(s) => s.ip().to_bits().hash(state),
        };
        self.socket_addr.port().hash(state);
    }
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{}]", self.socket_addr, self.unique)
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.socket_addr, self.unique)
    }
}

impl NodeAddr {
    pub fn new(socket_addr: SocketAddr, unique: u64) -> NodeAddr {
        NodeAddr { unique, socket_addr }
    }

    #[cfg(test)]
    pub fn localhost(unique: u64) -> NodeAddr {
        let addr: SocketAddr = std::str::FromStr::from_str("127.0.0.1:16385").unwrap();

        NodeAddr {
            unique,
            socket_addr: addr,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.unique);

        match &self.socket_addr {
            SocketAddr::V4(data) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        let unique = buf.try_get_u64()?;

        let addr = match buf.try_get_u8()? {
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => {
                return Err(anyhow!("invalid socket address discriminator: {}", n));
            }
        };
        Ok(NodeAddr {
            unique,
            socket_addr: addr,
        })
    }

    pub fn try_deser_opt(buf: &mut impl Buf) -> anyhow::Result<Option<NodeAddr>> {
        match buf.try_get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(NodeAddr::try_deser(buf)?)),
            n => Err(anyhow!("invalid optional address marker: {}", n)),
        }
    }

    pub fn ser_opt(addr: Option<&NodeAddr>, buf: &mut impl BufMut) {
        match addr {
            None => buf.put_u8(0),
            Some(addr) => {
                buf.put_u8(1);
                addr.ser(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[rstest]
    #[case::v4_localhost(NodeAddr { unique: 5, socket_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9876).into() })]
    #[case::v4(NodeAddr { unique: 758964, socket_addr: "4.5.6.7:89".parse().unwrap() })]
    #[case::v6(NodeAddr { unique: 3456, socket_addr: "[2001:db8::1]:8080".parse().unwrap() })]
    #[case::large_unique(NodeAddr { unique: u64::MAX, socket_addr: "10.0.0.1:7800".parse().unwrap() })]
    fn test_ser_deser(#[case] addr: NodeAddr) {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf);
        let deser = NodeAddr::try_deser(&mut buf);
        assert_eq!(deser.unwrap(), addr);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::none(None)]
    #[case::some(Some(NodeAddr::localhost(3)))]
    fn test_ser_deser_opt(#[case] addr: Option<NodeAddr>) {
        let mut buf = BytesMut::new();
        NodeAddr::ser_opt(addr.as_ref(), &mut buf);
        assert_eq!(NodeAddr::try_deser_opt(&mut buf).unwrap(), addr);
    }

    #[test]
    fn test_deser_invalid_discriminator() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u8(5);
        assert!(NodeAddr::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_deser_truncated() {
        let mut buf = BytesMut::new();
        NodeAddr::localhost(7).ser(&mut buf);
        let mut truncated = buf.split_to(buf.len() - 1);
        assert!(NodeAddr::try_deser(&mut truncated).is_err());
    }
}
