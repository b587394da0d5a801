use super::*;

#[tokio::test]
async fn test_trunked_media_aggregation() {
    let conn_a = ChannelConnection::create_connection(test_addr());
    let conn_b = ChannelConnection::create_connection(test_addr());
    conn_a.link(&conn_b);
    let a = build_engine_with(conn_a, |builder| {
        builder.trunk_interval(5);
    });
    let b = build_engine(conn_b);

    // two simultaneous trunked calls to the same peer
    let mut a_calls = Vec::new();
    for _ in 0..2 {
        let trans = a
            .start_local_transaction(TransactionType::New, b.local_addr(), IeList::new(), true)
            .unwrap();
        let ev = wait_for(&b, EventKind::New).await;
        ev.transaction.lock().unwrap().send_accept().unwrap();
        let ev = wait_for(&a, EventKind::Accept).await;
        assert!(!ev.local);
        a_calls.push(trans);
    }

    for trans in &a_calls {
        trans.lock().unwrap().send_media(&[0x11; 80], format::ULAW).unwrap();
    }

    // one flush carries both calls' media under one timestamp
    let first = wait_for(&b, EventKind::Voice).await;
    let second = wait_for(&b, EventKind::Voice).await;
    assert_eq!(first.timestamp, second.timestamp);
    assert_eq!(first.data.len(), 80);
    assert_eq!(second.data.len(), 80);
    let call_a = first.transaction.lock().unwrap().local_call_no();
    let call_b = second.transaction.lock().unwrap().local_call_no();
    assert_ne!(call_a, call_b);
}
