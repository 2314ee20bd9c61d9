use crate::address::Address;
use crate::codec::read_presence_vector;
use crate::error::WireError;
use crate::header::{DataControl, Header};
use crate::stream::Stream;
use crate::{HEADER_SIZE, MAX_BODY_SIZE, MAX_PACKET_SIZE};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Identity of a fragmented message: who sent it, what it is, and which
/// optional fields it carries. Two concurrent transfers differing in any of
/// the three reassemble independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LargeDataSetKey {
    pub source: Address,
    pub code: u16,
    pub presence_vector: u32,
}

impl LargeDataSetKey {
    pub fn of(stream: &Stream, header: &Header) -> Self {
        Self {
            source: header.source,
            code: header.command_code,
            presence_vector: read_presence_vector(stream),
        }
    }
}

/// Split a serialized message longer than the wire MTU into an ordered
/// fragment sequence. Fragment bodies are `MAX_BODY_SIZE` slices of the
/// original body; sequence numbers start at zero.
pub fn split(stream: &Stream) -> Result<Vec<Stream>, WireError> {
    let header = stream.peek_header()?;
    if stream.len() <= MAX_PACKET_SIZE {
        return Err(WireError::InvalidValue("message fits in a single packet"));
    }

    let body = stream.body();
    let chunks: Vec<&[u8]> = body.chunks(MAX_BODY_SIZE).collect();
    let last = chunks.len() - 1;

    let mut fragments = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let mut fragment_header = header;
        fragment_header.data_control = if index == 0 {
            DataControl::First
        } else if index == last {
            DataControl::Last
        } else {
            DataControl::Middle
        };
        fragment_header.sequence_number = index as u16;
        fragment_header.data_size = chunk.len() as u16;

        let mut fragment = Stream::with_capacity(HEADER_SIZE + chunk.len());
        fragment.write_header(&fragment_header)?;
        fragment.write_bytes(chunk);
        fragments.push(fragment);
    }
    Ok(fragments)
}

/// Reassembly state for one fragmented message.
///
/// Complete iff it holds a `First` fragment, a `Last` fragment, and every
/// sequence number in between without gap.
#[derive(Debug, Clone)]
pub struct LargeDataSet {
    header: Header,
    fragments: BTreeMap<u16, Vec<u8>>,
    first_seq: Option<u16>,
    last_seq: Option<u16>,
    updated_at: Instant,
}

impl LargeDataSet {
    /// Initialize a set from any fragment, not necessarily the first.
    pub fn start(stream: &Stream, header: &Header, now: Instant) -> Result<Self, WireError> {
        if header.data_control == DataControl::Single {
            return Err(WireError::InvalidValue("single packet is not a fragment"));
        }
        let mut set = Self {
            header: *header,
            fragments: BTreeMap::new(),
            first_seq: None,
            last_seq: None,
            updated_at: now,
        };
        set.add(stream, header, now);
        Ok(set)
    }

    /// Merge a fragment into the set. Returns whether it was accepted.
    /// A `Retransmit` fragment replaces the one it duplicates; any other
    /// duplicate sequence number is rejected.
    pub fn add(&mut self, stream: &Stream, header: &Header, now: Instant) -> bool {
        let seq = header.sequence_number;
        match header.data_control {
            DataControl::First => {
                if self.first_seq.is_some_and(|existing| existing != seq) {
                    return false;
                }
                self.first_seq = Some(seq);
            }
            DataControl::Last => {
                if self.last_seq.is_some_and(|existing| existing != seq) {
                    return false;
                }
                self.last_seq = Some(seq);
            }
            DataControl::Middle => {}
            DataControl::Retransmit => {
                self.fragments.insert(seq, stream.body().to_vec());
                self.updated_at = now;
                return true;
            }
            DataControl::Single => return false,
        }

        if self.fragments.contains_key(&seq) {
            return false;
        }
        self.fragments.insert(seq, stream.body().to_vec());
        self.updated_at = now;
        true
    }

    pub fn is_complete(&self) -> bool {
        let (Some(first), Some(last)) = (self.first_seq, self.last_seq) else {
            return false;
        };
        if last < first {
            return false;
        }
        let expected = (last - first) as usize + 1;
        self.fragments.len() == expected
            && self.fragments.range(first..=last).count() == expected
    }

    /// Concatenate the fragment bodies in sequence order under a single
    /// header with corrected size.
    pub fn merge(self) -> Result<Stream, WireError> {
        if !self.is_complete() {
            return Err(WireError::BadPacket("merge of incomplete data set"));
        }
        let total: usize = self.fragments.values().map(Vec::len).sum();
        if total > u16::MAX as usize {
            return Err(WireError::MessageTooLarge);
        }

        let mut header = self.header;
        header.data_control = DataControl::Single;
        header.data_size = total as u16;
        header.sequence_number = self.first_seq.unwrap_or(0);

        let mut merged = Stream::with_capacity(HEADER_SIZE + total);
        merged.write_header(&header)?;
        for body in self.fragments.values() {
            merged.write_bytes(body);
        }
        Ok(merged)
    }

    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }
}

/// Table of in-progress reassemblies, keyed by `(source, code, presence
/// vector)`.
#[derive(Debug, Default)]
pub struct LargeDataSetMap {
    sets: HashMap<LargeDataSetKey, LargeDataSet>,
}

impl LargeDataSetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Whether this packet is reassembly traffic. A `Retransmit` packet
    /// only belongs here when a set with its key is already open; with no
    /// open set it is a retransmitted single-packet message.
    pub fn accepts(&self, stream: &Stream, header: &Header) -> bool {
        match header.data_control {
            DataControl::Single => false,
            DataControl::Retransmit => self.sets.contains_key(&LargeDataSetKey::of(stream, header)),
            _ => true,
        }
    }

    /// Feed one fragment through the table. Returns the merged stream when
    /// the fragment completes its set.
    pub fn process(
        &mut self,
        stream: &Stream,
        header: &Header,
        now: Instant,
    ) -> Result<Option<Stream>, WireError> {
        let key = LargeDataSetKey::of(stream, header);
        match self.sets.get_mut(&key) {
            Some(set) => {
                set.add(stream, header, now);
                if set.is_complete() {
                    let set = self.sets.remove(&key).expect("set exists");
                    return Ok(Some(set.merge()?));
                }
            }
            None => {
                let set = LargeDataSet::start(stream, header, now)?;
                if set.is_complete() {
                    return Ok(Some(set.merge()?));
                }
                self.sets.insert(key, set);
            }
        }
        Ok(None)
    }

    /// Discard sets whose last update is older than `timeout`. Returns how
    /// many were dropped.
    pub fn prune(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.sets.len();
        self.sets.retain(|_, set| now.duration_since(set.updated_at()) <= timeout);
        before - self.sets.len()
    }
}
