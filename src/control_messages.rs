use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::sequence_number::SequenceNumber;

/// Payload of ACK and NAK packets: a list of sequence numbers.
///
/// For ACK, these are the sequence numbers the receiver holds in its out-of-order buffer
///  (selective acknowledgement). For NAK, they are the sequence numbers the receiver is missing
///  and requests to be re-sent.
///
/// ```ascii
/// 0: number of sequence numbers (varint usize)
/// *: (repeated) sequence number (u64 BE)
/// ```
///
/// NB: This is a control message, so it must fit into a single packet. It is the sender's
///      responsibility to bound the list, see [SequenceList::truncated]
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SequenceList {
    pub sequences: Vec<SequenceNumber>,
}

impl SequenceList {
    pub fn new(sequences: Vec<SequenceNumber>) -> SequenceList {
        SequenceList { sequences }
    }

    /// Upper bound for the serialized size of a list of `max_len` entries
    pub fn max_serialized_len(max_len: usize) -> usize {
        // a usize varint takes at most 10 bytes
        10 + max_len * size_of::<u64>()
    }

    pub fn truncated(mut self, max_len: usize) -> SequenceList {
        self.sequences.truncate(max_len);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.sequences.len());
        for sequence in &self.sequences {
            buf.put_u64(sequence.to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf, max_len: usize) -> anyhow::Result<SequenceList> {
        let num_sequences = buf.try_get_usize_varint()
            .map_err(|e| anyhow!("invalid sequence list length: {:?}", e))?;

        if num_sequences > max_len {
            bail!("sequence list has {} entries, exceeding the maximum of {}", num_sequences, max_len);
        }
        if num_sequences * size_of::<u64>() > buf.remaining() {
            bail!("sequence list with {} entries does not fit the remaining {} bytes", num_sequences, buf.remaining());
        }

        let mut sequences = Vec::with_capacity(num_sequences);
        for _ in 0..num_sequences {
            sequences.push(SequenceNumber::from_raw(buf.get_u64()));
        }
        Ok(SequenceList { sequences })
    }
}
