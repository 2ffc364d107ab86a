use crate::node_addr::NodeAddr;
use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DigestEntry {
    pub highest_delivered: u64,
    pub highest_received: u64,
}

/// Per-sender watermarks of a member's multicast receive buffers.
///
/// A member's own digest reports what it delivered and received. A *stable* digest is aggregated
///  from the digests of all members of a view: its highest-delivered values were delivered
///  everywhere, so buffers can purge up to them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Digest {
    entries: BTreeMap<NodeAddr, DigestEntry>,
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (addr, entry) in &self.entries {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}: [{} ({})]", addr, entry.highest_delivered, entry.highest_received)?;
        }
        Ok(())
    }
}

impl Digest {
    pub fn new() -> Digest {
        Digest::default()
    }

    pub fn insert(&mut self, sender: NodeAddr, highest_delivered: u64, highest_received: u64) {
        self.entries.insert(sender, DigestEntry { highest_delivered, highest_received });
    }

    pub fn get(&self, sender: &NodeAddr) -> Option<DigestEntry> {
        self.entries.get(sender).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeAddr, &DigestEntry)> {
        self.entries.iter()
    }

    /// Aggregates digests into a stable digest: the minimum highest-delivered and maximum
    ///  highest-received per sender. A sender missing from any of the digests is not stable anywhere
    ///  yet, and it is left out.
    pub fn stable_of<'a>(digests: impl IntoIterator<Item = &'a Digest>) -> Digest {
        let mut iter = digests.into_iter();
        let mut result = match iter.next() {
            Some(d) => d.clone(),
            None => return Digest::new(),
        };

        for digest in iter {
            result.entries.retain(|sender, entry| {
                match digest.entries.get(sender) {
                    Some(other) => {
                        entry.highest_delivered = entry.highest_delivered.min(other.highest_delivered);
                        entry.highest_received = entry.highest_received.max(other.highest_received);
                        true
                    }
                    None => false,
                }
            });
        }
        result
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.entries.len());
        for (sender, entry) in &self.entries {
            sender.ser(buf);
            buf.put_u64_varint(entry.highest_delivered);
            buf.put_u64_varint(entry.highest_received);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Digest> {
        let len = buf.try_get_usize_varint()?;
        if len > buf.remaining() {
            bail!("digest length {} exceeds remaining buffer size {}", len, buf.remaining());
        }

        let mut entries = BTreeMap::new();
        for _ in 0..len {
            let sender = NodeAddr::try_deser(buf)?;
            let highest_delivered = buf.try_get_u64_varint()?;
            let highest_received = buf.try_get_u64_varint()?;
            if highest_delivered > highest_received {
                bail!("digest entry for {:?} has highest delivered {} > highest received {}", sender, highest_delivered, highest_received);
            }
            entries.insert(sender, DigestEntry { highest_delivered, highest_received });
        }
        Ok(Digest { entries })
    }
}

impl FromIterator<(NodeAddr, u64, u64)> for Digest {
    fn from_iter<T: IntoIterator<Item = (NodeAddr, u64, u64)>>(iter: T) -> Self {
        let mut result = Digest::new();
        for (sender, hd, hr) in iter {
            result.insert(sender, hd, hr);
        }
        result
    }
}
