use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::PROTOCOL_VERSION;

/// Wire width of the APPARENT_ADDR blob: a sockaddr_in-shaped buffer.
pub const APPARENT_ADDR_LEN: usize = 16;

const AF_INET: u16 = 2;

/// Information Element type codes with their fixed wire kinds.
///
/// Text payloads are raw bytes without a terminator, numeric payloads are
/// big-endian and exactly 1, 2 or 4 bytes wide depending on the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IeCode {
    CalledNumber = 0x01,
    CallingNumber = 0x02,
    CallingAni = 0x03,
    CallingName = 0x04,
    CalledContext = 0x05,
    Username = 0x06,
    Password = 0x07,
    Capability = 0x08,
    Format = 0x09,
    Language = 0x0a,
    Version = 0x0b,
    AdsiCpe = 0x0c,
    Dnid = 0x0d,
    AuthMethods = 0x0e,
    Challenge = 0x0f,
    Md5Result = 0x10,
    RsaResult = 0x11,
    ApparentAddr = 0x12,
    Refresh = 0x13,
    DpStatus = 0x14,
    CallNo = 0x15,
    Cause = 0x16,
    IaxUnknown = 0x17,
    MsgCount = 0x18,
    AutoAnswer = 0x19,
    MusicOnHold = 0x1a,
    TransferId = 0x1b,
    Rdnis = 0x1c,
    Provisioning = 0x1d,
    AesProvisioning = 0x1e,
    DateTime = 0x1f,
    DeviceType = 0x20,
    ServiceIdent = 0x21,
    FirmwareVer = 0x22,
    FwBlockDesc = 0x23,
    FwBlockData = 0x24,
    ProvVer = 0x25,
    CallingPres = 0x26,
    CallingTon = 0x27,
    CallingTns = 0x28,
    SamplingRate = 0x29,
    CauseCode = 0x2a,
    Encryption = 0x2b,
    EnKey = 0x2c,
    CodecPrefs = 0x2d,
    RrJitter = 0x2e,
    RrLoss = 0x2f,
    RrPkts = 0x30,
    RrDelay = 0x31,
    RrDropped = 0x32,
    RrOoo = 0x33,
}

/// Payload shape of an IE on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IeKind {
    Null,
    Text,
    U8,
    U16,
    U32,
    Bin,
}

impl IeCode {
    pub fn kind(self) -> IeKind {
        use IeCode::*;
        match self {
            CalledNumber | CallingNumber | CallingAni | CallingName | CalledContext
            | Username | Password | Language | Dnid | Challenge | Md5Result | RsaResult
            | Cause | MusicOnHold | Rdnis | DeviceType | CodecPrefs => IeKind::Text,
            Capability | Format | TransferId | DateTime | FwBlockDesc | ProvVer
            | SamplingRate | RrJitter | RrLoss | RrPkts | RrDropped | RrOoo => IeKind::U32,
            Version | AdsiCpe | AuthMethods | Refresh | DpStatus | CallNo | MsgCount
            | FirmwareVer | CallingTns | RrDelay => IeKind::U16,
            IaxUnknown | CallingPres | CallingTon | CauseCode | Encryption => IeKind::U8,
            ApparentAddr | Provisioning | AesProvisioning | ServiceIdent | FwBlockData
            | EnKey => IeKind::Bin,
            AutoAnswer => IeKind::Null,
        }
    }

    pub fn name(self) -> &'static str {
        use IeCode::*;
        match self {
            CalledNumber => "CALLED_NUMBER",
            CallingNumber => "CALLING_NUMBER",
            CallingAni => "CALLING_ANI",
            CallingName => "CALLING_NAME",
            CalledContext => "CALLED_CONTEXT",
            Username => "USERNAME",
            Password => "PASSWORD",
            Capability => "CAPABILITY",
            Format => "FORMAT",
            Language => "LANGUAGE",
            Version => "VERSION",
            AdsiCpe => "ADSICPE",
            Dnid => "DNID",
            AuthMethods => "AUTHMETHODS",
            Challenge => "CHALLENGE",
            Md5Result => "MD5_RESULT",
            RsaResult => "RSA_RESULT",
            ApparentAddr => "APPARENT_ADDR",
            Refresh => "REFRESH",
            DpStatus => "DPSTATUS",
            CallNo => "CALLNO",
            Cause => "CAUSE",
            IaxUnknown => "UNKNOWN",
            MsgCount => "MSGCOUNT",
            AutoAnswer => "AUTOANSWER",
            MusicOnHold => "MUSICONHOLD",
            TransferId => "TRANSFERID",
            Rdnis => "RDNIS",
            Provisioning => "PROVISIONING",
            AesProvisioning => "AESPROVISIONING",
            DateTime => "DATETIME",
            DeviceType => "DEVICETYPE",
            ServiceIdent => "SERVICEIDENT",
            FirmwareVer => "FIRMWAREVER",
            FwBlockDesc => "FWBLOCKDESC",
            FwBlockData => "FWBLOCKDATA",
            ProvVer => "PROVVER",
            CallingPres => "CALLINGPRES",
            CallingTon => "CALLINGTON",
            CallingTns => "CALLINGTNS",
            SamplingRate => "SAMPLINGRATE",
            CauseCode => "CAUSECODE",
            Encryption => "ENCRYPTION",
            EnKey => "ENKEY",
            CodecPrefs => "CODEC_PREFS",
            RrJitter => "RR_JITTER",
            RrLoss => "RR_LOSS",
            RrPkts => "RR_PKTS",
            RrDelay => "RR_DELAY",
            RrDropped => "RR_DROPPED",
            RrOoo => "RR_OOO",
        }
    }
}

impl TryFrom<u8> for IeCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use IeCode::*;
        let code = match value {
            0x01 => CalledNumber,
            0x02 => CallingNumber,
            0x03 => CallingAni,
            0x04 => CallingName,
            0x05 => CalledContext,
            0x06 => Username,
            0x07 => Password,
            0x08 => Capability,
            0x09 => Format,
            0x0a => Language,
            0x0b => Version,
            0x0c => AdsiCpe,
            0x0d => Dnid,
            0x0e => AuthMethods,
            0x0f => Challenge,
            0x10 => Md5Result,
            0x11 => RsaResult,
            0x12 => ApparentAddr,
            0x13 => Refresh,
            0x14 => DpStatus,
            0x15 => CallNo,
            0x16 => Cause,
            0x17 => IaxUnknown,
            0x18 => MsgCount,
            0x19 => AutoAnswer,
            0x1a => MusicOnHold,
            0x1b => TransferId,
            0x1c => Rdnis,
            0x1d => Provisioning,
            0x1e => AesProvisioning,
            0x1f => DateTime,
            0x20 => DeviceType,
            0x21 => ServiceIdent,
            0x22 => FirmwareVer,
            0x23 => FwBlockDesc,
            0x24 => FwBlockData,
            0x25 => ProvVer,
            0x26 => CallingPres,
            0x27 => CallingTon,
            0x28 => CallingTns,
            0x29 => SamplingRate,
            0x2a => CauseCode,
            0x2b => Encryption,
            0x2c => EnKey,
            0x2d => CodecPrefs,
            0x2e => RrJitter,
            0x2f => RrLoss,
            0x30 => RrPkts,
            0x31 => RrDelay,
            0x32 => RrDropped,
            0x33 => RrOoo,
            _ => return Err(Error::InvalidIeList(format!("unknown IE code 0x{:02x}", value))),
        };
        Ok(code)
    }
}

/// Decoded IE payload. The tag mirrors the wire kind of the code it
/// travels with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IeValue {
    Null,
    Text(String),
    U8(u8),
    U16(u16),
    U32(u32),
    Bin(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ie {
    pub code: IeCode,
    pub value: IeValue,
}

/// Ordered list of Information Elements.
///
/// The wire does not mandate an order, but encode preserves the order the
/// elements were appended or decoded in, for the benefit of peers that care.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IeList {
    items: Vec<Ie>,
}

impl IeList {
    pub fn new() -> Self {
        IeList { items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ie> {
        self.items.iter()
    }

    pub fn append(&mut self, ie: Ie) {
        self.items.push(ie);
    }

    pub fn append_null(&mut self, code: IeCode) {
        self.items.push(Ie { code, value: IeValue::Null });
    }

    pub fn append_text(&mut self, code: IeCode, text: impl Into<String>) {
        self.items.push(Ie { code, value: IeValue::Text(text.into()) });
    }

    pub fn append_numeric(&mut self, code: IeCode, value: u32) {
        let value = match code.kind() {
            IeKind::U8 => IeValue::U8(value as u8),
            IeKind::U16 => IeValue::U16(value as u16),
            _ => IeValue::U32(value),
        };
        self.items.push(Ie { code, value });
    }

    pub fn append_binary(&mut self, code: IeCode, data: Bytes) {
        self.items.push(Ie { code, value: IeValue::Bin(data) });
    }

    pub fn get(&self, code: IeCode) -> Option<&Ie> {
        self.items.iter().find(|ie| ie.code == code)
    }

    pub fn remove(&mut self, code: IeCode) -> Option<Ie> {
        let pos = self.items.iter().position(|ie| ie.code == code)?;
        Some(self.items.remove(pos))
    }

    pub fn get_text(&self, code: IeCode) -> Option<&str> {
        match self.get(code)?.value {
            IeValue::Text(ref s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric accessor, widened to u32 whatever the wire width was.
    pub fn get_numeric(&self, code: IeCode) -> Option<u32> {
        match self.get(code)?.value {
            IeValue::U8(v) => Some(v as u32),
            IeValue::U16(v) => Some(v as u32),
            IeValue::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_binary(&self, code: IeCode) -> Option<&Bytes> {
        match self.get(code)?.value {
            IeValue::Bin(ref b) => Some(b),
            _ => None,
        }
    }

    /// Append a VERSION element if the list does not carry one yet.
    pub fn insert_version(&mut self) {
        if self.get(IeCode::Version).is_none() {
            self.append_numeric(IeCode::Version, PROTOCOL_VERSION as u32);
        }
    }

    /// True iff the list carries a VERSION element equal to the protocol
    /// version this stack speaks.
    pub fn valid_version(&self) -> bool {
        self.get_numeric(IeCode::Version) == Some(PROTOCOL_VERSION as u32)
    }

    pub fn decode(mut buf: &[u8]) -> Result<IeList> {
        let mut list = IeList::new();
        while !buf.is_empty() {
            if buf.len() < 2 {
                return Err(Error::InvalidIeList("truncated IE header".to_string()));
            }
            let code = IeCode::try_from(buf[0])?;
            let len = buf[1] as usize;
            if buf.len() < 2 + len {
                return Err(Error::InvalidIeList(format!(
                    "{} length {} exceeds buffer",
                    code.name(),
                    len
                )));
            }
            let data = &buf[2..2 + len];
            let value = match (code.kind(), len) {
                (IeKind::Null, 0) => IeValue::Null,
                (IeKind::Text, _) => IeValue::Text(String::from_utf8_lossy(data).into_owned()),
                (IeKind::U8, 1) => IeValue::U8(data[0]),
                (IeKind::U16, 2) => IeValue::U16(u16::from_be_bytes([data[0], data[1]])),
                (IeKind::U32, 4) => {
                    IeValue::U32(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
                }
                (IeKind::Bin, _) => IeValue::Bin(Bytes::copy_from_slice(data)),
                _ => {
                    return Err(Error::InvalidIeList(format!(
                        "{} has bad payload length {}",
                        code.name(),
                        len
                    )))
                }
            };
            list.append(Ie { code, value });
            buf = &buf[2 + len..];
        }
        Ok(list)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for ie in &self.items {
            buf.put_u8(ie.code as u8);
            match &ie.value {
                IeValue::Null => buf.put_u8(0),
                IeValue::Text(s) => {
                    let data = &s.as_bytes()[..s.len().min(255)];
                    buf.put_u8(data.len() as u8);
                    buf.put_slice(data);
                }
                IeValue::U8(v) => {
                    buf.put_u8(1);
                    buf.put_u8(*v);
                }
                IeValue::U16(v) => {
                    buf.put_u8(2);
                    buf.put_u16(*v);
                }
                IeValue::U32(v) => {
                    buf.put_u8(4);
                    buf.put_u32(*v);
                }
                IeValue::Bin(b) => {
                    let data = &b[..b.len().min(255)];
                    buf.put_u8(data.len() as u8);
                    buf.put_slice(data);
                }
            }
        }
        buf.freeze()
    }
}

impl FromIterator<Ie> for IeList {
    fn from_iter<T: IntoIterator<Item = Ie>>(iter: T) -> Self {
        IeList { items: iter.into_iter().collect() }
    }
}

/// Pack a socket address into an APPARENT_ADDR element. The blob is a
/// 16-byte sockaddr_in image: family, port and address in network order,
/// padded with zeros. Only IPv4 peers exist on the IAX2 wire.
pub fn pack_ip(addr: SocketAddr) -> Result<Ie> {
    let v4 = match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => {
            return Err(Error::MalformedFrame("APPARENT_ADDR is IPv4 only".to_string()))
        }
    };
    let mut buf = BytesMut::with_capacity(APPARENT_ADDR_LEN);
    buf.put_u16(AF_INET);
    buf.put_u16(addr.port());
    buf.put_slice(&v4.octets());
    buf.put_bytes(0, 8);
    Ok(Ie { code: IeCode::ApparentAddr, value: IeValue::Bin(buf.freeze()) })
}

/// Decode an APPARENT_ADDR blob back into a socket address.
pub fn unpack_ip(data: &[u8]) -> Result<SocketAddr> {
    if data.len() != APPARENT_ADDR_LEN {
        return Err(Error::MalformedFrame(format!(
            "APPARENT_ADDR blob is {} bytes",
            data.len()
        )));
    }
    let family = u16::from_be_bytes([data[0], data[1]]);
    if family != AF_INET {
        return Err(Error::MalformedFrame(format!("APPARENT_ADDR family {}", family)));
    }
    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}
