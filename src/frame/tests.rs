use super::ie::{pack_ip, unpack_ip, IeCode, IeList, IeValue};
use super::*;

#[test]
fn test_ie_list_round_trip() {
    let mut list = IeList::new();
    list.append_text(IeCode::CalledNumber, "100");
    list.append_text(IeCode::Username, "alice");
    list.append_numeric(IeCode::Format, format::ULAW);
    list.append_numeric(IeCode::Capability, format::ULAW | format::ALAW);
    list.append_numeric(IeCode::Refresh, 60);
    list.append_numeric(IeCode::CauseCode, 16);
    list.append_null(IeCode::AutoAnswer);
    list.insert_version();

    let encoded = list.encode();
    let decoded = IeList::decode(&encoded).unwrap();
    assert_eq!(decoded, list);
    assert_eq!(decoded.encode(), encoded);

    assert_eq!(decoded.get_text(IeCode::Username), Some("alice"));
    assert_eq!(decoded.get_numeric(IeCode::Refresh), Some(60));
    assert_eq!(decoded.get_numeric(IeCode::CauseCode), Some(16));
    assert!(decoded.valid_version());
}

#[test]
fn test_ie_numeric_widths() {
    // VERSION is a 2-byte element; 4 bytes of payload must be rejected
    let bad = [0x0b, 4, 0, 0, 0, 2];
    assert!(IeList::decode(&bad).is_err());
    // CAPABILITY is 4 bytes wide
    let bad = [0x08, 2, 0, 4];
    assert!(IeList::decode(&bad).is_err());
    let good = [0x08, 4, 0, 0, 0, 4];
    let list = IeList::decode(&good).unwrap();
    assert_eq!(list.get_numeric(IeCode::Capability), Some(4));
}

#[test]
fn test_ie_truncated_rejected() {
    // CHALLENGE claiming 10 bytes with 3 present
    let bad = [0x0f, 10, b'1', b'2', b'3'];
    assert!(IeList::decode(&bad).is_err());
    // lone type byte
    assert!(IeList::decode(&[0x0f]).is_err());
}

#[test]
fn test_ie_unknown_code_rejected() {
    assert!(IeList::decode(&[0x7f, 0]).is_err());
}

#[test]
fn test_insert_version_is_idempotent() {
    let mut list = IeList::new();
    list.insert_version();
    list.insert_version();
    assert_eq!(list.len(), 1);
    assert!(list.valid_version());

    let mut stale = IeList::new();
    stale.append_numeric(IeCode::Version, 1);
    assert!(!stale.valid_version());
}

#[test]
fn test_apparent_addr_round_trip() {
    let addr: std::net::SocketAddr = "192.168.1.20:4569".parse().unwrap();
    let ie = pack_ip(addr).unwrap();
    let blob = match &ie.value {
        IeValue::Bin(b) => b.clone(),
        other => panic!("unexpected value {:?}", other),
    };
    assert_eq!(blob.len(), 16);
    assert_eq!(&blob[..2], &[0, 2]);
    assert_eq!(unpack_ip(&blob).unwrap(), addr);
    // byte-level symmetry
    let ie2 = pack_ip(unpack_ip(&blob).unwrap()).unwrap();
    assert_eq!(ie2, ie);
}

#[test]
fn test_subclass_packing() {
    assert_eq!(pack_subclass(0).unwrap(), 0);
    assert_eq!(pack_subclass(3).unwrap(), 3);
    assert_eq!(pack_subclass(127).unwrap(), 127);
    assert_eq!(pack_subclass(128).unwrap(), 0x87);
    assert_eq!(pack_subclass(format::ULAW).unwrap(), 4);
    assert_eq!(pack_subclass(format::JPEG).unwrap(), 0x90);
    assert_eq!(pack_subclass(1 << 31).unwrap(), 0x9f);
    // above 127 and not a power of two: no representation
    assert!(pack_subclass(384).is_err());
    assert!(pack_subclass(0x180).is_err());

    assert_eq!(unpack_subclass(0x87).unwrap(), 128);
    assert_eq!(unpack_subclass(0x90).unwrap(), format::JPEG);
    assert_eq!(unpack_subclass(3).unwrap(), 3);
    assert!(unpack_subclass(0x80 | 32).is_err());
}

#[test]
fn test_short_datagrams_rejected() {
    assert!(Frame::parse(&[]).is_err());
    assert!(Frame::parse(&[0x80, 0x01, 0x00]).is_err());
    // full frame bit set but fewer than 12 bytes
    assert!(Frame::parse(&[0x80, 0x01, 0x00, 0x02, 0, 0, 0, 1]).is_err());
}

#[test]
fn test_full_frame_round_trip() {
    let mut ies = IeList::new();
    ies.append_text(IeCode::CalledNumber, "100");
    ies.insert_version();
    let frame = FullFrame {
        src_call: 7,
        dst_call: 0,
        retrans: false,
        timestamp: 1234,
        o_seq: 0,
        i_seq: 0,
        frame_type: FrameType::Iax,
        subclass: IaxControl::New as u32,
        payload: ies.encode(),
    };
    let buf = frame.encode().unwrap();
    assert_eq!(buf[0] & 0x80, 0x80);
    match Frame::parse(&buf).unwrap() {
        Frame::Full(parsed) => {
            assert_eq!(parsed, frame);
            assert_eq!(parsed.encode().unwrap(), buf);
            assert_eq!(parsed.ies().unwrap(), ies);
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[test]
fn test_full_frame_retrans_bit() {
    let frame = FullFrame {
        src_call: 1,
        dst_call: 2,
        retrans: true,
        timestamp: 9,
        o_seq: 3,
        i_seq: 4,
        frame_type: FrameType::Iax,
        subclass: IaxControl::Ping as u32,
        payload: Bytes::new(),
    };
    let buf = frame.encode().unwrap();
    assert_eq!(buf[2] & 0x80, 0x80);
    match Frame::parse(&buf).unwrap() {
        Frame::Full(parsed) => assert!(parsed.retrans),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[test]
fn test_mini_frame_round_trip() {
    let frame = MiniFrame {
        src_call: 42,
        timestamp: 0xbeef,
        payload: Bytes::from_static(&[1, 2, 3, 4]),
    };
    let buf = frame.encode();
    assert_eq!(buf.len(), 8);
    match Frame::parse(&buf).unwrap() {
        Frame::Mini(parsed) => {
            assert_eq!(parsed, frame);
            assert_eq!(parsed.encode(), buf);
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[test]
fn test_meta_trunk_round_trip() {
    let frame = MetaTrunkFrame {
        timestamp: 0x01020304,
        entries: vec![
            TrunkEntry { src_call: 5, payload: Bytes::from_static(&[0xaa; 20]) },
            TrunkEntry { src_call: 9, payload: Bytes::from_static(&[0xbb; 11]) },
        ],
    };
    let buf = frame.encode();
    assert_eq!(&buf[..2], &[0x00, 0x01]);
    match Frame::parse(&buf).unwrap() {
        Frame::MetaTrunk(parsed) => {
            assert_eq!(parsed, frame);
            assert_eq!(parsed.encode(), buf);
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[test]
fn test_meta_trunk_takes_precedence_over_mini_from_call_one() {
    // 0x00 0x01 leads both a trunk frame and a mini frame from call 1
    let buf = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
    assert!(matches!(Frame::parse(&buf).unwrap(), Frame::MetaTrunk(_)));
}

#[test]
fn test_meta_trunk_truncated_entry_rejected() {
    let mut buf = MetaTrunkFrame {
        timestamp: 1,
        entries: vec![TrunkEntry { src_call: 2, payload: Bytes::from_static(&[0; 8]) }],
    }
    .encode()
    .to_vec();
    buf.truncate(buf.len() - 2);
    assert!(Frame::parse(&buf).is_err());
}
