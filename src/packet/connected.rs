use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::CodecError;
use crate::packet::{ensure, read_u16, read_u32, read_u8};

/// `uint24` little-endian but actually occupies 4 bytes.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) struct Uint24le(pub(crate) u32);

impl Uint24le {
    fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        ensure(buf, 3)?;
        // safe cast because only 3 bytes will not overflow
        Ok(Self(buf.get_uint_le(3) as u32))
    }

    fn write(self, buf: &mut BytesMut) {
        buf.put_uint_le(self.0 as u64, 3);
    }
}

/// Top 3 bits are the reliability type, fourth bit is 1 when the frame is a
/// fragment of a compound.
#[derive(Debug, Clone, Copy)]
struct Flags(u8);

const FRAGMENT_FLAG: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reliability {
    Unreliable = 0x00,
    UnreliableSequenced = 0x01,
    Reliable = 0x02,
    ReliableOrdered = 0x03,
    ReliableSequenced = 0x04,
}

impl Reliability {
    fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable | Reliability::ReliableOrdered | Reliability::ReliableSequenced
        )
    }

    fn is_ordered(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
        )
    }

    fn is_sequenced(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }
}

impl Flags {
    fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self(read_u8(buf)?))
    }

    fn write(self, buf: &mut BytesMut) {
        buf.put_u8(self.0);
    }

    /// Reliability encoded in the top 3 bits. Tags above `ReliableSequenced`
    /// carry delivery receipts, which this transport does not speak.
    fn reliability(self) -> Result<Reliability, CodecError> {
        match self.0 >> 5 {
            0x00 => Ok(Reliability::Unreliable),
            0x01 => Ok(Reliability::UnreliableSequenced),
            0x02 => Ok(Reliability::Reliable),
            0x03 => Ok(Reliability::ReliableOrdered),
            0x04 => Ok(Reliability::ReliableSequenced),
            tag => Err(CodecError::InvalidReliability(tag)),
        }
    }

    fn fragmented(self) -> bool {
        self.0 & FRAGMENT_FLAG != 0
    }
}

/// Compound header shared by all fragments of one oversized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub(crate) count: u32,
    pub(crate) chan: u16,
    pub(crate) idx: u32,
}

impl Fragment {
    fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            count: read_u32(buf)?,
            chan: read_u16(buf)?,
            idx: read_u32(buf)?,
        })
    }

    fn write(self, buf: &mut BytesMut) {
        buf.put_u32(self.count);
        buf.put_u16(self.chan);
        buf.put_u32(self.idx);
    }
}

/// One application message, or one fragment of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub(crate) payload: Bytes,
    pub(crate) reliable_idx: Option<u32>,
    pub(crate) order_idx: Option<u32>,
    pub(crate) fragment: Option<Fragment>,
}

impl Frame {
    pub(crate) fn unreliable(payload: Bytes) -> Self {
        Self {
            payload,
            reliable_idx: None,
            order_idx: None,
            fragment: None,
        }
    }

    pub(crate) fn reliable(&self) -> bool {
        self.reliable_idx.is_some()
    }

    pub(crate) fn ordered(&self) -> bool {
        self.order_idx.is_some()
    }

    pub(crate) fn fragmented(&self) -> bool {
        self.fragment.is_some()
    }

    /// Combine a complete fragment run back into one frame. The compound
    /// inherits its indices from the first fragment.
    pub(crate) fn from_fragments(fragments: Vec<Frame>) -> Self {
        debug_assert!(!fragments.is_empty());
        let mut payload = BytesMut::new();
        for fragment in &fragments {
            payload.extend_from_slice(&fragment.payload);
        }
        Self {
            payload: payload.freeze(),
            reliable_idx: fragments[0].reliable_idx,
            order_idx: fragments[0].order_idx,
            fragment: None,
        }
    }

    pub(crate) fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        let flags = Flags::read(buf)?;
        // length on the wire is in bits
        let length = (read_u16(buf)? >> 3) as usize;
        let reliability = flags.reliability()?;
        if reliability.is_sequenced() {
            return Err(CodecError::InvalidReliability(reliability as u8));
        }
        let mut reliable_idx = None;
        let mut order_idx = None;
        let mut fragment = None;

        if reliability.is_reliable() {
            reliable_idx = Some(Uint24le::read(buf)?.0);
        }
        if reliability.is_ordered() {
            order_idx = Some(Uint24le::read(buf)?.0);
            let chan = read_u8(buf)?;
            if chan != 0 {
                return Err(CodecError::InvalidOrderChannel(chan));
            }
        }
        if flags.fragmented() {
            fragment = Some(Fragment::read(buf)?);
        }
        ensure(buf, length)?;
        Ok(Self {
            payload: buf.split_to(length),
            reliable_idx,
            order_idx,
            fragment,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) {
        let reliability = if self.reliable() {
            if self.ordered() {
                Reliability::ReliableOrdered
            } else {
                Reliability::Reliable
            }
        } else {
            debug_assert!(!self.ordered(), "ordered frames must be reliable");
            Reliability::Unreliable
        };
        let mut flags = (reliability as u8) << 5;
        if self.fragmented() {
            flags |= FRAGMENT_FLAG;
        }
        Flags(flags).write(buf);
        // length in bits
        debug_assert!(
            self.payload.len() < (u16::MAX >> 3) as usize,
            "frame payload should be constructed based on mtu"
        );
        buf.put_u16((self.payload.len() << 3) as u16);
        if let Some(idx) = self.reliable_idx {
            Uint24le(idx).write(buf);
        }
        if let Some(idx) = self.order_idx {
            Uint24le(idx).write(buf);
            // order channel, always 0
            buf.put_u8(0);
        }
        if let Some(fragment) = self.fragment {
            fragment.write(buf);
        }
        buf.put_slice(&self.payload);
    }

    /// Encoded size, used for packing frames under the MTU.
    pub(crate) fn size(&self) -> usize {
        let mut size = 3 + self.payload.len();
        if self.reliable() {
            size += 3;
        }
        if self.ordered() {
            size += 4;
        }
        if self.fragmented() {
            size += 10;
        }
        size
    }
}

/// A batch of frames sharing one sequence index, one UDP datagram on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSet {
    pub(crate) idx: u32,
    pub(crate) frames: Vec<Frame>,
}

impl FrameSet {
    pub(crate) fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        read_u8(buf)?;
        let idx = Uint24le::read(buf)?.0;
        let mut frames = Vec::new();
        while buf.has_remaining() {
            match Frame::read(buf) {
                Ok(frame) => frames.push(frame),
                // truncated trailing bytes end the set
                Err(CodecError::Underrun) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(Self { idx, frames })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(0x88);
        Uint24le(self.idx).write(buf);
        for frame in &self.frames {
            frame.write(buf);
        }
    }
}

const RECORD_RANGE: u8 = 0;
const RECORD_SINGLE: u8 = 1;

const MAX_ACKNOWLEDGEMENT_PACKETS: u32 = 8192;

/// Frame set indices named by an ACK or NACK, run-length encoded. Range
/// bounds are inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOrNack {
    records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Range(Uint24le, Uint24le),
    Single(Uint24le),
}

impl AckOrNack {
    /// Coalesce a strictly increasing sequence of frame set indices into
    /// records.
    pub(crate) fn from_sorted(mut sorted: impl Iterator<Item = u32>) -> Option<Self> {
        let mut first = sorted.next()?;
        let mut last = first;
        let mut records = Vec::new();
        for idx in sorted {
            if idx == last + 1 {
                last = idx;
                continue;
            }
            records.push(Record::from_span(first, last));
            first = idx;
            last = idx;
        }
        records.push(Record::from_span(first, last));
        Some(Self { records })
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.records.iter().flat_map(|record| match record {
            Record::Range(first, last) => first.0..=last.0,
            Record::Single(idx) => idx.0..=idx.0,
        })
    }

    pub(crate) fn total_cnt(&self) -> u32 {
        self.records.iter().map(Record::ack_cnt).sum()
    }

    pub(crate) fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        let record_cnt = read_u16(buf)?;
        let mut ack_cnt = 0;
        let mut records = Vec::with_capacity(record_cnt as usize);
        for _ in 0..record_cnt {
            let record = Record::read(buf)?;
            ack_cnt += record.ack_cnt();
            if ack_cnt > MAX_ACKNOWLEDGEMENT_PACKETS {
                return Err(CodecError::AckCountExceed);
            }
            records.push(record);
        }
        Ok(Self { records })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) {
        debug_assert!(
            self.records.len() < u16::MAX as usize,
            "records should be constructed based on mtu"
        );
        buf.put_u16(self.records.len() as u16);
        for record in &self.records {
            record.write(buf);
        }
    }
}

impl Record {
    fn from_span(first: u32, last: u32) -> Self {
        if first == last {
            Record::Single(Uint24le(first))
        } else {
            Record::Range(Uint24le(first), Uint24le(last))
        }
    }

    fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        match read_u8(buf)? {
            RECORD_RANGE => Ok(Record::Range(Uint24le::read(buf)?, Uint24le::read(buf)?)),
            RECORD_SINGLE => Ok(Record::Single(Uint24le::read(buf)?)),
            record_type => Err(CodecError::InvalidRecordType(record_type)),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Record::Range(first, last) => {
                buf.put_u8(RECORD_RANGE);
                first.write(buf);
                last.write(buf);
            }
            Record::Single(idx) => {
                buf.put_u8(RECORD_SINGLE);
                idx.write(buf);
            }
        }
    }

    fn ack_cnt(&self) -> u32 {
        match self {
            Record::Range(first, last) => last.0.saturating_sub(first.0) + 1,
            Record::Single(_) => 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn game_frame(payload: &'static [u8]) -> Frame {
        Frame {
            payload: Bytes::from_static(payload),
            reliable_idx: Some(7),
            order_idx: Some(3),
            fragment: None,
        }
    }

    #[test]
    fn test_frame_flag_bits_and_bit_length() {
        let mut buf = BytesMut::new();
        game_frame(b"hello").write(&mut buf);
        // reliable + ordered is tag 3
        assert_eq!(buf[0], 0x03 << 5);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 8 * 5);

        buf.clear();
        Frame::unreliable(Bytes::from_static(b"hi")).write(&mut buf);
        assert_eq!(buf[0], 0x00);

        buf.clear();
        Frame {
            fragment: Some(Fragment {
                count: 2,
                chan: 1,
                idx: 0,
            }),
            ..game_frame(b"x")
        }
        .write(&mut buf);
        assert_eq!(buf[0], (0x03 << 5) | FRAGMENT_FLAG);
    }

    #[test]
    fn test_frame_roundtrip_and_size() {
        let frames = [
            Frame::unreliable(Bytes::from_static(b"ping")),
            game_frame(b"ordered payload"),
            Frame {
                payload: Bytes::from_static(b"part"),
                reliable_idx: Some(11),
                order_idx: Some(4),
                fragment: Some(Fragment {
                    count: 3,
                    chan: 9,
                    idx: 2,
                }),
            },
        ];
        for frame in frames {
            let mut buf = BytesMut::new();
            frame.write(&mut buf);
            assert_eq!(buf.len(), frame.size());
            let decoded = Frame::read(&mut buf.freeze()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_frame_rejects_sequenced_and_receipt_tags() {
        // tag 4 is reliable sequenced
        let mut data = Bytes::from_static(&[0x04 << 5, 0x00, 0x08, 1, 0, 0, 2, 0, 0, 0, 0xaa]);
        assert!(matches!(
            Frame::read(&mut data),
            Err(CodecError::InvalidReliability(_))
        ));
        // tags 5..=7 carry receipts
        let mut data = Bytes::from_static(&[0x05 << 5, 0x00, 0x08, 0xaa]);
        assert!(matches!(
            Frame::read(&mut data),
            Err(CodecError::InvalidReliability(5))
        ));
    }

    #[test]
    fn test_frame_rejects_nonzero_order_channel() {
        let mut buf = BytesMut::new();
        game_frame(b"y").write(&mut buf);
        // order channel byte sits after flags, length and both indices
        buf[9] = 2;
        assert_eq!(
            Frame::read(&mut buf.freeze()),
            Err(CodecError::InvalidOrderChannel(2))
        );
    }

    #[test]
    fn test_frame_set_roundtrip_and_truncated_tail() {
        let set = FrameSet {
            idx: 0x0a0b0c,
            frames: vec![
                game_frame(b"one"),
                Frame::unreliable(Bytes::from_static(b"two")),
            ],
        };
        let mut buf = BytesMut::new();
        set.write(&mut buf);
        assert_eq!(buf[0], 0x88);
        assert_eq!(&buf[1..4], &[0x0c, 0x0b, 0x0a]);

        let decoded = FrameSet::read(&mut buf.clone().freeze()).unwrap();
        assert_eq!(decoded, set);

        // a frame cut short ends the set instead of failing it
        buf.truncate(buf.len() - 2);
        let decoded = FrameSet::read(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.idx, set.idx);
        assert_eq!(decoded.frames, set.frames[..1]);
    }

    #[test]
    fn test_ack_roundtrip_coalesces_runs() {
        let cases: [&[u32]; 4] = [
            &[0],
            &[0, 1, 2, 4, 5, 7],
            &[3, 9, 10, 11, 12],
            &[0, 2, 4, 6, 8, 10, 12],
        ];
        for indices in cases {
            let ack = AckOrNack::from_sorted(indices.iter().copied()).unwrap();
            let mut buf = BytesMut::new();
            ack.write(&mut buf);
            let decoded = AckOrNack::read(&mut buf.freeze()).unwrap();
            assert_eq!(decoded, ack);
            assert_eq!(decoded.indices().collect::<Vec<_>>(), indices);
        }

        let ack = AckOrNack::from_sorted([4, 5, 6].into_iter()).unwrap();
        assert_eq!(ack.records, vec![Record::Range(Uint24le(4), Uint24le(6))]);
        assert_eq!(ack.total_cnt(), 3);
    }

    #[test]
    fn test_ack_count_limit() {
        let mut buf = BytesMut::new();
        AckOrNack::from_sorted(0..20_000).unwrap().write(&mut buf);
        assert_eq!(
            AckOrNack::read(&mut buf.freeze()),
            Err(CodecError::AckCountExceed)
        );
    }

    #[test]
    fn test_invalid_record_type() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u8(2);
        buf.put_slice(&[0, 0, 0]);
        assert_eq!(
            AckOrNack::read(&mut buf.freeze()),
            Err(CodecError::InvalidRecordType(2))
        );
    }
}
