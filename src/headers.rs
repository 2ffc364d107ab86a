use crate::digest::Digest;
use crate::node_addr::NodeAddr;
use crate::seqno_list::SeqnoList;
use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Identifies which protocol layer a message's header belongs to
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtocolId {
    None = 0,
    Unicast = 1,
    Multicast = 2,
    Stable = 3,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Header {
    Unicast(UnicastHeader),
    Multicast(MulticastHeader),
    Stable(StableHeader),
}

impl Header {
    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            Header::Unicast(_) => ProtocolId::Unicast,
            Header::Multicast(_) => ProtocolId::Multicast,
            Header::Stable(_) => ProtocolId::Stable,
        }
    }

    pub fn ser_opt(header: Option<&Header>, buf: &mut impl BufMut) {
        match header {
            None => buf.put_u8(ProtocolId::None.into()),
            Some(header) => {
                buf.put_u8(header.protocol_id().into());
                match header {
                    Header::Unicast(h) => h.ser(buf),
                    Header::Multicast(h) => h.ser(buf),
                    Header::Stable(h) => h.ser(buf),
                }
            }
        }
    }

    pub fn deser_opt(buf: &mut impl Buf) -> anyhow::Result<Option<Header>> {
        let raw = buf.try_get_u8()?;
        let protocol_id = ProtocolId::try_from(raw)
            .map_err(|_| anyhow!("invalid protocol id {}", raw))?;

        Ok(match protocol_id {
            ProtocolId::None => None,
            ProtocolId::Unicast => Some(Header::Unicast(UnicastHeader::deser(buf)?)),
            ProtocolId::Multicast => Some(Header::Multicast(MulticastHeader::deser(buf)?)),
            ProtocolId::Stable => Some(Header::Stable(StableHeader::deser(buf)?)),
        })
    }
}

fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(anyhow!("invalid value for a boolean: {}", b)),
    }
}


const ID_DATA: u8 = 0;
const ID_ACK: u8 = 1;
const ID_SEND_FIRST_SEQNO: u8 = 2;
const ID_XMIT_REQ: u8 = 3;
const ID_CLOSE: u8 = 4;

/// Header of the point-to-point protocol
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UnicastHeader {
    /// application data; `first` marks the first message of a connection
    Data { seqno: u64, conn_id: u16, first: bool },
    /// everything up to and including `seqno` was received contiguously
    Ack { seqno: u64, conn_id: u16, timestamp: u32 },
    /// asks the sender to resend its first unacknowledged message with the `first` flag set
    SendFirstSeqno { timestamp: u32 },
    XmitReq { missing: SeqnoList },
    /// the sender closed its connection, the receiver can remove its matching entry
    Close { conn_id: u16 },
}

impl UnicastHeader {
    pub fn id(&self) -> u8 {
        match self {
            UnicastHeader::Data { .. } => ID_DATA,
            UnicastHeader::Ack { .. } => ID_ACK,
            UnicastHeader::SendFirstSeqno { .. } => ID_SEND_FIRST_SEQNO,
            UnicastHeader::XmitReq { .. } => ID_XMIT_REQ,
            UnicastHeader::Close { .. } => ID_CLOSE,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id());
        match self {
            UnicastHeader::Data { seqno, conn_id, first } => {
                buf.put_u64_varint(*seqno);
                buf.put_u16(*conn_id);
                buf.put_u8(if *first { 1 } else { 0 });
            }
            UnicastHeader::Ack { seqno, conn_id, timestamp } => {
                buf.put_u64_varint(*seqno);
                buf.put_u16(*conn_id);
                buf.put_u32(*timestamp);
            }
            UnicastHeader::SendFirstSeqno { timestamp } => {
                buf.put_u32(*timestamp);
            }
            UnicastHeader::XmitReq { missing } => {
                missing.ser(buf);
            }
            UnicastHeader::Close { conn_id } => {
                buf.put_u16(*conn_id);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<UnicastHeader> {
        Ok(match buf.try_get_u8()? {
            ID_DATA => UnicastHeader::Data {
                seqno: buf.try_get_u64_varint()?,
                conn_id: buf.try_get_u16()?,
                first: try_get_bool(buf)?,
            },
            ID_ACK => UnicastHeader::Ack {
                seqno: buf.try_get_u64_varint()?,
                conn_id: buf.try_get_u16()?,
                timestamp: buf.try_get_u32()?,
            },
            ID_SEND_FIRST_SEQNO => UnicastHeader::SendFirstSeqno {
                timestamp: buf.try_get_u32()?,
            },
            ID_XMIT_REQ => UnicastHeader::XmitReq {
                missing: SeqnoList::deser(buf)?,
            },
            ID_CLOSE => UnicastHeader::Close {
                conn_id: buf.try_get_u16()?,
            },
            id => return Err(anyhow!("invalid unicast header discriminator {}", id)),
        })
    }
}


const ID_MSG: u8 = 0;
const ID_MCAST_XMIT_REQ: u8 = 1;
const ID_XMIT_RSP: u8 = 2;
const ID_HIGHEST_SEQNO: u8 = 3;

/// Header of the one-to-many protocol
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MulticastHeader {
    Msg { seqno: u64 },
    /// requests retransmission of messages originally sent by `original_sender`
    XmitReq { original_sender: NodeAddr, missing: SeqnoList },
    /// a retransmitted message, sent point-to-point to the requester. The message's `src` is the
    ///  original sender.
    XmitRsp { seqno: u64 },
    /// the highest seqno the message's sender sent so far
    HighestSeqno { seqno: u64 },
}

impl MulticastHeader {
    pub fn id(&self) -> u8 {
        match self {
            MulticastHeader::Msg { .. } => ID_MSG,
            MulticastHeader::XmitReq { .. } => ID_MCAST_XMIT_REQ,
            MulticastHeader::XmitRsp { .. } => ID_XMIT_RSP,
            MulticastHeader::HighestSeqno { .. } => ID_HIGHEST_SEQNO,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id());
        match self {
            MulticastHeader::Msg { seqno } |
            MulticastHeader::XmitRsp { seqno } |
            MulticastHeader::HighestSeqno { seqno } => {
                buf.put_u64_varint(*seqno);
            }
            MulticastHeader::XmitReq { original_sender, missing } => {
                original_sender.ser(buf);
                missing.ser(buf);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MulticastHeader> {
        Ok(match buf.try_get_u8()? {
            ID_MSG => MulticastHeader::Msg { seqno: buf.try_get_u64_varint()? },
            ID_MCAST_XMIT_REQ => MulticastHeader::XmitReq {
                original_sender: NodeAddr::try_deser(buf)?,
                missing: SeqnoList::deser(buf)?,
            },
            ID_XMIT_RSP => MulticastHeader::XmitRsp { seqno: buf.try_get_u64_varint()? },
            ID_HIGHEST_SEQNO => MulticastHeader::HighestSeqno { seqno: buf.try_get_u64_varint()? },
            id => return Err(anyhow!("invalid multicast header discriminator {}", id)),
        })
    }
}


const ID_STABLE_GOSSIP: u8 = 0;
const ID_STABILITY: u8 = 1;

/// Header of the digest exchange that determines which multicast messages can be purged
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StableHeader {
    /// a member's own digest, collected by every member for the current round
    Gossip { digest: Digest },
    /// the aggregated digest of a completed round
    Stability { digest: Digest },
}

impl StableHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            StableHeader::Gossip { digest } => {
                buf.put_u8(ID_STABLE_GOSSIP);
                digest.ser(buf);
            }
            StableHeader::Stability { digest } => {
                buf.put_u8(ID_STABILITY);
                digest.ser(buf);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<StableHeader> {
        Ok(match buf.try_get_u8()? {
            ID_STABLE_GOSSIP => StableHeader::Gossip { digest: Digest::deser(buf)? },
            ID_STABILITY => StableHeader::Stability { digest: Digest::deser(buf)? },
            id => return Err(anyhow!("invalid stable header discriminator {}", id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::none(None)]
    #[case::data(Some(Header::Unicast(UnicastHeader::Data { seqno: 1, conn_id: 0, first: true })))]
    #[case::data_large(Some(Header::Unicast(UnicastHeader::Data { seqno: u64::MAX, conn_id: i16::MAX as u16, first: false })))]
    #[case::ack(Some(Header::Unicast(UnicastHeader::Ack { seqno: 25, conn_id: 3, timestamp: u32::MAX })))]
    #[case::send_first_seqno(Some(Header::Unicast(UnicastHeader::SendFirstSeqno { timestamp: 17 })))]
    #[case::unicast_xmit_req(Some(Header::Unicast(UnicastHeader::XmitReq { missing: vec![3, 5, 6].into_iter().collect() })))]
    #[case::close(Some(Header::Unicast(UnicastHeader::Close { conn_id: 9 })))]
    #[case::msg(Some(Header::Multicast(MulticastHeader::Msg { seqno: 12 })))]
    #[case::mcast_xmit_req(Some(Header::Multicast(MulticastHeader::XmitReq { original_sender: NodeAddr::localhost(4), missing: vec![1].into_iter().collect() })))]
    #[case::xmit_rsp(Some(Header::Multicast(MulticastHeader::XmitRsp { seqno: 8 })))]
    #[case::highest_seqno(Some(Header::Multicast(MulticastHeader::HighestSeqno { seqno: 100 })))]
    #[case::gossip(Some(Header::Stable(StableHeader::Gossip { digest: vec![(NodeAddr::localhost(1), 2, 3)].into_iter().collect() })))]
    #[case::stability(Some(Header::Stable(StableHeader::Stability { digest: Digest::new() })))]
    fn test_ser_deser(#[case] header: Option<Header>) {
        let mut buf = BytesMut::new();
        Header::ser_opt(header.as_ref(), &mut buf);
        assert_eq!(Header::deser_opt(&mut buf).unwrap(), header);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::protocol_id(vec![9])]
    #[case::unicast_type(vec![1, 7])]
    #[case::multicast_type(vec![2, 4])]
    #[case::stable_type(vec![3, 2])]
    #[case::boolean(vec![1, 0, 1, 0, 0, 5])]
    #[case::truncated(vec![1, 1, 5])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut buf: &[u8] = &raw;
        assert!(Header::deser_opt(&mut buf).is_err());
    }
}
