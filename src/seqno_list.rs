use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use std::fmt::{Debug, Formatter};

/// A sorted, duplicate-free list of sequence numbers, typically the gaps in a receive buffer that
///  are requested for retransmission.
///
/// On the wire, the first seqno is written as a varint and every following seqno as the varint
///  delta to its predecessor. Gaps are usually clustered, so most deltas fit into a single byte.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SeqnoList {
    seqnos: Vec<u64>,
}

impl Debug for SeqnoList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.seqnos)
    }
}

impl SeqnoList {
    /// upper bound for the encoded size of a single entry, used to fit requests into a datagram
    pub const MAX_BYTES_PER_SEQNO: usize = 10;

    pub fn new() -> SeqnoList {
        SeqnoList::default()
    }

    /// appends a seqno, which must be greater than all seqnos already in the list
    pub fn add(&mut self, seqno: u64) {
        debug_assert!(self.seqnos.last().map(|&l| l < seqno).unwrap_or(true));
        self.seqnos.push(seqno);
    }

    pub fn len(&self) -> usize {
        self.seqnos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqnos.is_empty()
    }

    pub fn last(&self) -> Option<u64> {
        self.seqnos.last().copied()
    }

    pub fn contains(&self, seqno: u64) -> bool {
        self.seqnos.binary_search(&seqno).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.seqnos.iter().copied()
    }

    pub fn remove_higher_than(&mut self, seqno: u64) {
        let idx = self.seqnos.partition_point(|&s| s <= seqno);
        self.seqnos.truncate(idx);
    }

    /// removes all seqnos `<= seqno`
    pub fn remove_up_to(&mut self, seqno: u64) {
        let idx = self.seqnos.partition_point(|&s| s <= seqno);
        self.seqnos.drain(..idx);
    }

    pub fn retain(&mut self, f: impl FnMut(&u64) -> bool) {
        self.seqnos.retain(f);
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.seqnos.len());
        let mut prev = 0;
        for &seqno in &self.seqnos {
            buf.put_u64_varint(seqno - prev);
            prev = seqno;
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SeqnoList> {
        let len = buf.try_get_usize_varint()?;
        if len > buf.remaining() {
            bail!("seqno list length {} exceeds remaining buffer size {}", len, buf.remaining());
        }

        let mut seqnos = Vec::with_capacity(len);
        let mut prev = 0u64;
        for i in 0..len {
            let delta = buf.try_get_u64_varint()?;
            if delta == 0 && i > 0 {
                bail!("duplicate seqno {} in seqno list", prev);
            }
            prev = match prev.checked_add(delta) {
                Some(s) => s,
                None => bail!("seqno overflow in seqno list"),
            };
            seqnos.push(prev);
        }
        Ok(SeqnoList { seqnos })
    }
}

impl FromIterator<u64> for SeqnoList {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        let mut seqnos: Vec<u64> = iter.into_iter().collect();
        seqnos.sort_unstable();
        seqnos.dedup();
        SeqnoList { seqnos }
    }
}
