use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub mod ie;
pub use ie::{Ie, IeCode, IeKind, IeList, IeValue};

#[cfg(test)]
mod tests;

/// Protocol version carried in the VERSION element.
pub const PROTOCOL_VERSION: u16 = 0x0002;

/// Call numbers are 15-bit and non-zero.
pub const MAX_CALL_NO: u16 = 32767;

/// Full frame header length.
pub const FULL_FRAME_HEADER_LEN: usize = 12;

/// Mini frame header length.
pub const MINI_FRAME_HEADER_LEN: usize = 4;

/// Meta trunk frame header length: leader, meta type, flags, timestamp.
pub const META_TRUNK_HEADER_LEN: usize = 7;

const META_LEADER: u8 = 0x00;
const META_TYPE_TRUNK: u8 = 0x01;

/// Media format bitmasks and their names.
pub mod format {
    pub const G723_1: u32 = 1 << 0;
    pub const GSM: u32 = 1 << 1;
    pub const ULAW: u32 = 1 << 2;
    pub const ALAW: u32 = 1 << 3;
    pub const MP3: u32 = 1 << 4;
    pub const ADPCM: u32 = 1 << 5;
    pub const SLIN: u32 = 1 << 6;
    pub const LPC10: u32 = 1 << 7;
    pub const G729A: u32 = 1 << 8;
    pub const SPEEX: u32 = 1 << 9;
    pub const ILBC: u32 = 1 << 10;

    pub const JPEG: u32 = 1 << 16;
    pub const PNG: u32 = 1 << 17;
    pub const H261: u32 = 1 << 18;
    pub const H263: u32 = 1 << 19;

    pub const AUDIO_MASK: u32 =
        G723_1 | GSM | ULAW | ALAW | MP3 | ADPCM | SLIN | LPC10 | G729A | SPEEX | ILBC;
    pub const VIDEO_MASK: u32 = JPEG | PNG | H261 | H263;

    pub fn audio_name(format: u32) -> Option<&'static str> {
        match format {
            G723_1 => Some("g723.1"),
            GSM => Some("gsm"),
            ULAW => Some("mulaw"),
            ALAW => Some("alaw"),
            MP3 => Some("mp3"),
            ADPCM => Some("adpcm"),
            SLIN => Some("slin"),
            LPC10 => Some("lpc10"),
            G729A => Some("g729a"),
            SPEEX => Some("speex"),
            ILBC => Some("ilbc"),
            _ => None,
        }
    }

    pub fn video_name(format: u32) -> Option<&'static str> {
        match format {
            JPEG => Some("jpeg"),
            PNG => Some("png"),
            H261 => Some("h261"),
            H263 => Some("h263"),
            _ => None,
        }
    }
}

/// IAX2 frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Dtmf = 0x01,
    Voice = 0x02,
    Video = 0x03,
    Control = 0x04,
    Null = 0x05,
    Iax = 0x06,
    Text = 0x07,
    Image = 0x08,
    Html = 0x09,
    Noise = 0x0a,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use FrameType::*;
        let t = match value {
            0x01 => Dtmf,
            0x02 => Voice,
            0x03 => Video,
            0x04 => Control,
            0x05 => Null,
            0x06 => Iax,
            0x07 => Text,
            0x08 => Image,
            0x09 => Html,
            0x0a => Noise,
            _ => return Err(Error::MalformedFrame(format!("unknown frame type 0x{:02x}", value))),
        };
        Ok(t)
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Subclasses of frames of type IAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IaxControl {
    New = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    Ack = 0x04,
    Hangup = 0x05,
    Reject = 0x06,
    Accept = 0x07,
    AuthReq = 0x08,
    AuthRep = 0x09,
    Inval = 0x0a,
    LagRq = 0x0b,
    LagRp = 0x0c,
    RegReq = 0x0d,
    RegAuth = 0x0e,
    RegAck = 0x0f,
    RegRej = 0x10,
    RegRel = 0x11,
    Vnak = 0x12,
    DpReq = 0x13,
    DpRep = 0x14,
    Dial = 0x15,
    TxReq = 0x16,
    TxCnt = 0x17,
    TxAcc = 0x18,
    TxReady = 0x19,
    TxRel = 0x1a,
    TxRej = 0x1b,
    Quelch = 0x1c,
    Unquelch = 0x1d,
    Poke = 0x1e,
    Mwi = 0x20,
    Unsupport = 0x21,
    Transfer = 0x22,
    Provision = 0x23,
    FwDownl = 0x24,
    FwData = 0x25,
}

impl TryFrom<u32> for IaxControl {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        use IaxControl::*;
        let c = match value {
            0x01 => New,
            0x02 => Ping,
            0x03 => Pong,
            0x04 => Ack,
            0x05 => Hangup,
            0x06 => Reject,
            0x07 => Accept,
            0x08 => AuthReq,
            0x09 => AuthRep,
            0x0a => Inval,
            0x0b => LagRq,
            0x0c => LagRp,
            0x0d => RegReq,
            0x0e => RegAuth,
            0x0f => RegAck,
            0x10 => RegRej,
            0x11 => RegRel,
            0x12 => Vnak,
            0x13 => DpReq,
            0x14 => DpRep,
            0x15 => Dial,
            0x16 => TxReq,
            0x17 => TxCnt,
            0x18 => TxAcc,
            0x19 => TxReady,
            0x1a => TxRel,
            0x1b => TxRej,
            0x1c => Quelch,
            0x1d => Unquelch,
            0x1e => Poke,
            0x20 => Mwi,
            0x21 => Unsupport,
            0x22 => Transfer,
            0x23 => Provision,
            0x24 => FwDownl,
            0x25 => FwData,
            _ => {
                return Err(Error::MalformedFrame(format!(
                    "unknown IAX control subclass 0x{:02x}",
                    value
                )))
            }
        };
        Ok(c)
    }
}

impl std::fmt::Display for IaxControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Subclasses of frames of type Control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlType {
    Hangup = 0x01,
    Ringing = 0x03,
    Answer = 0x04,
    Busy = 0x05,
    Congestion = 0x08,
    FlashHook = 0x09,
    Option = 0x0b,
    KeyRadio = 0x0c,
    UnkeyRadio = 0x0d,
    Progressing = 0x0e,
    Proceeding = 0x0f,
    Hold = 0x10,
    Unhold = 0x11,
    VidUpdate = 0x12,
}

impl TryFrom<u32> for ControlType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        use ControlType::*;
        let c = match value {
            0x01 => Hangup,
            0x03 => Ringing,
            0x04 => Answer,
            0x05 => Busy,
            0x08 => Congestion,
            0x09 => FlashHook,
            0x0b => Option,
            0x0c => KeyRadio,
            0x0d => UnkeyRadio,
            0x0e => Progressing,
            0x0f => Proceeding,
            0x10 => Hold,
            0x11 => Unhold,
            0x12 => VidUpdate,
            _ => {
                return Err(Error::MalformedFrame(format!(
                    "unknown control subclass 0x{:02x}",
                    value
                )))
            }
        };
        Ok(c)
    }
}

/// Pack a subclass value into its single wire byte. Values up to 127 are
/// stored directly; a value that is a single power of two is stored as its
/// bit index with the high bit set. Anything else has no representation.
pub fn pack_subclass(value: u32) -> Result<u8> {
    if value <= 0x7f {
        Ok(value as u8)
    } else if value.is_power_of_two() {
        Ok(0x80 | value.trailing_zeros() as u8)
    } else {
        Err(Error::Subclass(value))
    }
}

/// Inverse of [`pack_subclass`]. Bit indexes beyond 31 cannot fit a u32
/// and are rejected.
pub fn unpack_subclass(value: u8) -> Result<u32> {
    if value & 0x80 == 0 {
        Ok(value as u32)
    } else {
        let index = (value & 0x7f) as u32;
        if index > 31 {
            return Err(Error::MalformedFrame(format!("subclass bit index {}", index)));
        }
        Ok(1u32 << index)
    }
}

/// Reliable frame with sequence numbers, carrying either an IE list
/// (type IAX) or media/event data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullFrame {
    pub src_call: u16,
    pub dst_call: u16,
    pub retrans: bool,
    pub timestamp: u32,
    pub o_seq: u8,
    pub i_seq: u8,
    pub frame_type: FrameType,
    pub subclass: u32,
    pub payload: Bytes,
}

impl FullFrame {
    pub fn encode(&self) -> Result<Bytes> {
        let subclass = pack_subclass(self.subclass)?;
        let mut buf = BytesMut::with_capacity(FULL_FRAME_HEADER_LEN + self.payload.len());
        buf.put_u16(0x8000 | (self.src_call & 0x7fff));
        buf.put_u16(if self.retrans { 0x8000 } else { 0 } | (self.dst_call & 0x7fff));
        buf.put_u32(self.timestamp);
        buf.put_u8(self.o_seq);
        buf.put_u8(self.i_seq);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(subclass);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode the payload as an IE list. Only meaningful for IAX frames.
    pub fn ies(&self) -> Result<IeList> {
        IeList::decode(&self.payload)
    }
}

impl std::fmt::Display for FullFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}) {}->{} ts {} oseq {} iseq {}",
            self.frame_type, self.subclass, self.src_call, self.dst_call, self.timestamp,
            self.o_seq, self.i_seq
        )
    }
}

/// Unreliable media frame with a truncated timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniFrame {
    pub src_call: u16,
    pub timestamp: u16,
    pub payload: Bytes,
}

impl MiniFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MINI_FRAME_HEADER_LEN + self.payload.len());
        buf.put_u16(self.src_call & 0x7fff);
        buf.put_u16(self.timestamp);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// One aggregated mini-frame payload inside a meta trunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkEntry {
    pub src_call: u16,
    pub payload: Bytes,
}

/// Aggregation envelope: many calls' media to one peer under a single
/// absolute timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTrunkFrame {
    pub timestamp: u32,
    pub entries: Vec<TrunkEntry>,
}

impl MetaTrunkFrame {
    pub fn encode(&self) -> Bytes {
        let data_len: usize = self.entries.iter().map(|e| 4 + e.payload.len()).sum();
        let mut buf = BytesMut::with_capacity(META_TRUNK_HEADER_LEN + data_len);
        buf.put_u8(META_LEADER);
        buf.put_u8(META_TYPE_TRUNK);
        buf.put_u8(0);
        buf.put_u32(self.timestamp);
        for entry in &self.entries {
            buf.put_u16(entry.src_call & 0x7fff);
            buf.put_u16(entry.payload.len() as u16);
            buf.put_slice(&entry.payload);
        }
        buf.freeze()
    }

    fn parse(buf: &[u8]) -> Result<MetaTrunkFrame> {
        if buf.len() < META_TRUNK_HEADER_LEN {
            return Err(Error::ShortDatagram(buf.len()));
        }
        if buf[1] != META_TYPE_TRUNK {
            return Err(Error::MalformedFrame(format!("meta type 0x{:02x}", buf[1])));
        }
        let timestamp = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        let mut entries = Vec::new();
        let mut rest = &buf[META_TRUNK_HEADER_LEN..];
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(Error::MalformedFrame("truncated trunk entry".to_string()));
            }
            let src_call = u16::from_be_bytes([rest[0], rest[1]]) & 0x7fff;
            let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if rest.len() < 4 + len {
                return Err(Error::MalformedFrame(format!(
                    "trunk entry length {} exceeds buffer",
                    len
                )));
            }
            entries.push(TrunkEntry {
                src_call,
                payload: Bytes::copy_from_slice(&rest[4..4 + len]),
            });
            rest = &rest[4 + len..];
        }
        Ok(MetaTrunkFrame { timestamp, entries })
    }
}

/// A parsed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Full(FullFrame),
    Mini(MiniFrame),
    MetaTrunk(MetaTrunkFrame),
}

impl Frame {
    /// Parse one datagram. The meta trunk leader is checked before the
    /// mini/full discrimination bit, since a mini frame from call number 1
    /// shares its first two bytes with the trunk leader.
    pub fn parse(buf: &[u8]) -> Result<Frame> {
        if buf.len() < MINI_FRAME_HEADER_LEN {
            return Err(Error::ShortDatagram(buf.len()));
        }
        if buf[0] == META_LEADER && buf[1] == META_TYPE_TRUNK {
            return MetaTrunkFrame::parse(buf).map(Frame::MetaTrunk);
        }
        let first = u16::from_be_bytes([buf[0], buf[1]]);
        if first & 0x8000 == 0 {
            return Ok(Frame::Mini(MiniFrame {
                src_call: first & 0x7fff,
                timestamp: u16::from_be_bytes([buf[2], buf[3]]),
                payload: Bytes::copy_from_slice(&buf[MINI_FRAME_HEADER_LEN..]),
            }));
        }
        if buf.len() < FULL_FRAME_HEADER_LEN {
            return Err(Error::ShortDatagram(buf.len()));
        }
        let second = u16::from_be_bytes([buf[2], buf[3]]);
        Ok(Frame::Full(FullFrame {
            src_call: first & 0x7fff,
            retrans: second & 0x8000 != 0,
            dst_call: second & 0x7fff,
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            o_seq: buf[8],
            i_seq: buf[9],
            frame_type: FrameType::try_from(buf[10])?,
            subclass: unpack_subclass(buf[11])?,
            payload: Bytes::copy_from_slice(&buf[FULL_FRAME_HEADER_LEN..]),
        }))
    }

    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Frame::Full(f) => f.encode(),
            Frame::Mini(m) => Ok(m.encode()),
            Frame::MetaTrunk(t) => Ok(t.encode()),
        }
    }
}
