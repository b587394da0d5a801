use super::*;
use crate::frame::Frame;

fn vnaks(datagrams: &[Bytes]) -> Vec<FullFrame> {
    datagrams
        .iter()
        .filter_map(|buf| match Frame::parse(buf) {
            Ok(Frame::Full(f)) if f.subclass == IaxControl::Vnak as u32 => Some(f),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_out_of_order_recovery() {
    let conn = ChannelConnection::create_connection(test_addr());
    let mut peer = RawPeer::create();
    conn.link(&peer.conn);
    let engine = build_engine(conn);

    let (trans, call_no) = connect_raw_call(&engine, &peer).await;
    let to = engine.local_addr();

    // 1 and 2 in order, then 4 ahead of 3
    peer.send_frame(&control_full(1, call_no, 10, 1, 1, ControlType::Ringing), to);
    peer.send_frame(&control_full(1, call_no, 11, 2, 1, ControlType::Answer), to);
    peer.send_frame(&control_full(1, call_no, 13, 4, 1, ControlType::Progressing), to);

    assert_eq!(next_event(&engine).await.kind, EventKind::Ringing);
    assert_eq!(next_event(&engine).await.kind, EventKind::Answer);

    // the retransmission closes the gap; both frames deliver in order
    peer.send_frame(&control_full(1, call_no, 12, 3, 1, ControlType::Busy), to);
    assert_eq!(next_event(&engine).await.kind, EventKind::Busy);
    assert_eq!(next_event(&engine).await.kind, EventKind::Progressing);
    assert_eq!(trans.lock().unwrap().iseq_no(), 5);

    let datagrams = peer.drain().await;
    let vnaks = vnaks(&datagrams);
    assert_eq!(vnaks.len(), 1);
    assert_eq!(vnaks[0].i_seq, 3);

    let (_, out_of_order, _) = trans.lock().unwrap().frame_stats();
    assert_eq!(out_of_order, 1);
}

#[tokio::test]
async fn test_reorder_window_overflow_emits_one_vnak() {
    let conn = ChannelConnection::create_connection(test_addr());
    let mut peer = RawPeer::create();
    conn.link(&peer.conn);
    let engine = build_engine(conn);

    let (trans, call_no) = connect_raw_call(&engine, &peer).await;
    let to = engine.local_addr();

    // 128 consecutive frames ahead of the expected sequence 1
    for seq in 2..=129u32 {
        peer.send_frame(&control_full(1, call_no, 100 + seq, seq as u8, 1, ControlType::Ringing), to);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let datagrams = peer.drain().await;
    assert_eq!(vnaks(&datagrams).len(), 1);
    // nothing was delivered and the window stayed bounded
    assert_eq!(trans.lock().unwrap().iseq_no(), 1);
    let (_, out_of_order, dropped) = trans.lock().unwrap().frame_stats();
    assert_eq!(out_of_order, 128);
    assert_eq!(dropped, 1);
}

#[tokio::test]
async fn test_duplicate_frame_is_reacked_and_dropped() {
    let conn = ChannelConnection::create_connection(test_addr());
    let mut peer = RawPeer::create();
    conn.link(&peer.conn);
    let engine = build_engine(conn);

    let (trans, call_no) = connect_raw_call(&engine, &peer).await;
    let to = engine.local_addr();

    peer.send_frame(&control_full(1, call_no, 10, 1, 1, ControlType::Ringing), to);
    assert_eq!(next_event(&engine).await.kind, EventKind::Ringing);
    peer.drain().await;

    // the same frame again: an ACK goes out, no second event
    peer.send_frame(&control_full(1, call_no, 10, 1, 1, ControlType::Ringing), to);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.get_event().is_none());
    assert_eq!(trans.lock().unwrap().iseq_no(), 2);

    let datagrams = peer.drain().await;
    let acks: Vec<_> = datagrams
        .iter()
        .filter_map(|buf| match Frame::parse(buf) {
            Ok(Frame::Full(f)) if f.subclass == IaxControl::Ack as u32 => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].timestamp, 10);
}
