use crate::headers::{Header, MulticastHeader, UnicastHeader};
use crate::node_addr::NodeAddr;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

const WIRE_VERSION: u8 = 1;

bitflags! {
    /// Flags that travel with the message
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct MessageFlags: u16 {
        /// out-of-band: delivered as soon as it is received, without waiting for earlier messages
        const OOB            = 0b0000_0001;
        /// bypasses sequencing and retransmission
        const NO_RELIABILITY = 0b0000_0010;
        /// a message sent to self (or broadcast) is not delivered locally
        const DONT_LOOPBACK  = 0b0000_0100;
        /// the sender gives up instead of waiting when the send window is full
        const DONT_BLOCK     = 0b0000_1000;
    }
}

bitflags! {
    /// Local bookkeeping flags, never serialized
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct TransientFlags: u8 {
        /// an OOB message was already delivered, ordered removal must skip it
        const OOB_DELIVERED = 0b0000_0001;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub src: Option<NodeAddr>,
    /// `None` for broadcast
    pub dest: Option<NodeAddr>,
    pub flags: MessageFlags,
    pub transient_flags: TransientFlags,
    pub header: Option<Header>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(dest: Option<NodeAddr>, payload: impl Into<Bytes>) -> Message {
        Message {
            src: None,
            dest,
            flags: MessageFlags::empty(),
            transient_flags: TransientFlags::empty(),
            header: None,
            payload: payload.into(),
        }
    }

    /// a payload-less message carrying only a protocol header
    pub fn control(src: NodeAddr, dest: Option<NodeAddr>, header: Header) -> Message {
        Message {
            src: Some(src),
            dest,
            flags: MessageFlags::OOB,
            transient_flags: TransientFlags::empty(),
            header: Some(header),
            payload: Bytes::new(),
        }
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Message {
        self.flags |= flags;
        self
    }

    pub fn with_src(mut self, src: NodeAddr) -> Message {
        self.src = Some(src);
        self
    }

    pub fn with_header(mut self, header: Header) -> Message {
        self.header = Some(header);
        self
    }

    pub fn is_flag_set(&self, flag: MessageFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_oob(&self) -> bool {
        self.is_flag_set(MessageFlags::OOB)
    }

    pub fn is_transient_flag_set(&self, flag: TransientFlags) -> bool {
        self.transient_flags.contains(flag)
    }

    /// sets the flag and returns `true` if it was not set before
    pub fn set_transient_flag_if_absent(&mut self, flag: TransientFlags) -> bool {
        if self.transient_flags.contains(flag) {
            return false;
        }
        self.transient_flags |= flag;
        true
    }

    pub fn unicast_header(&self) -> Option<&UnicastHeader> {
        match &self.header {
            Some(Header::Unicast(h)) => Some(h),
            _ => None,
        }
    }

    pub fn multicast_header(&self) -> Option<&MulticastHeader> {
        match &self.header {
            Some(Header::Multicast(h)) => Some(h),
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(WIRE_VERSION);
        buf.put_u16(self.flags.bits());
        NodeAddr::ser_opt(self.src.as_ref(), buf);
        NodeAddr::ser_opt(self.dest.as_ref(), buf);
        Header::ser_opt(self.header.as_ref(), buf);
        buf.put_usize_varint(self.payload.len());
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let version = buf.try_get_u8()?;
        if version != WIRE_VERSION {
            bail!("unsupported wire version {}", version);
        }
        let raw_flags = buf.try_get_u16()?;
        let flags = match MessageFlags::from_bits(raw_flags) {
            Some(flags) => flags,
            None => bail!("invalid message flags {:#x}", raw_flags),
        };
        let src = NodeAddr::try_deser_opt(buf)?;
        let dest = NodeAddr::try_deser_opt(buf)?;
        let header = Header::deser_opt(buf)?;

        let len = buf.try_get_usize_varint()?;
        if len > buf.remaining() {
            bail!("payload length {} exceeds remaining buffer size {}", len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(len);

        Ok(Message {
            src,
            dest,
            flags,
            transient_flags: TransientFlags::empty(),
            header,
            payload,
        })
    }
}

/// Messages from a single sender, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub sender: NodeAddr,
    pub dest: Option<NodeAddr>,
    pub messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(sender: NodeAddr, dest: Option<NodeAddr>, messages: Vec<Message>) -> MessageBatch {
        MessageBatch { sender, dest, messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::UnicastHeader;
    use rstest::rstest;

    #[rstest]
    #[case::plain(Message::new(None, "abc"))]
    #[case::unicast(Message::new(Some(NodeAddr::localhost(2)), vec![1u8, 2, 3])
        .with_src(NodeAddr::localhost(1))
        .with_flags(MessageFlags::OOB | MessageFlags::DONT_LOOPBACK)
        .with_header(Header::Unicast(UnicastHeader::Data { seqno: 7, conn_id: 2, first: false })))]
    #[case::control(Message::control(NodeAddr::localhost(1), Some(NodeAddr::localhost(2)), Header::Unicast(UnicastHeader::Close { conn_id: 1 })))]
    fn test_ser_deser(#[case] msg: Message) {
        let mut buf = msg.to_bytes();
        assert_eq!(Message::deser(&mut buf).unwrap(), msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_transient_flags_are_not_serialized() {
        let mut msg = Message::new(None, "x").with_flags(MessageFlags::OOB);
        msg.set_transient_flag_if_absent(TransientFlags::OOB_DELIVERED);
        let mut buf = msg.to_bytes();
        let deser = Message::deser(&mut buf).unwrap();
        assert!(!deser.is_transient_flag_set(TransientFlags::OOB_DELIVERED));
        assert!(deser.is_oob());
    }

    #[test]
    fn test_set_transient_flag_if_absent() {
        let mut msg = Message::new(None, "x");
        assert!(msg.set_transient_flag_if_absent(TransientFlags::OOB_DELIVERED));
        assert!(!msg.set_transient_flag_if_absent(TransientFlags::OOB_DELIVERED));
        assert!(msg.is_transient_flag_set(TransientFlags::OOB_DELIVERED));
    }

    #[rstest]
    #[case::version(vec![2, 0, 0, 0, 0, 0, 0])]
    #[case::flags(vec![1, 0xff, 0xff, 0, 0, 0, 0])]
    #[case::payload_length(vec![1, 0, 0, 0, 0, 0, 5, 1])]
    #[case::empty(vec![])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut buf: &[u8] = &raw;
        assert!(Message::deser(&mut buf).is_err());
    }
}
