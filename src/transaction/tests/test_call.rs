use super::*;
use crate::transaction::TransactionState;

#[tokio::test]
async fn test_call_setup_media_and_hangup() {
    let (a, b) = engine_pair();
    let mut ies = IeList::new();
    ies.append_text(IeCode::CalledNumber, "100");
    ies.append_numeric(IeCode::Format, format::ULAW);
    ies.append_numeric(IeCode::Capability, format::ULAW | format::ALAW);
    let a_trans = a
        .start_local_transaction(TransactionType::New, b.local_addr(), ies, false)
        .unwrap();

    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::New);
    assert_eq!(ev.ies.get_text(IeCode::CalledNumber), Some("100"));
    let b_trans = ev.transaction.clone();
    {
        let mut t = b_trans.lock().unwrap();
        assert_eq!(t.called_no(), "100");
        assert_eq!(t.format(), format::ULAW);
        t.send_accept().unwrap();
    }

    let ev = next_event(&a).await;
    assert_eq!(ev.kind, EventKind::Accept);
    assert_eq!(a_trans.lock().unwrap().state(), TransactionState::Connected);
    assert_eq!(a_trans.lock().unwrap().format_out(), format::ULAW);

    b_trans.lock().unwrap().send_ringing().unwrap();
    let ev = wait_for(&a, EventKind::Ringing).await;
    assert!(!ev.is_final);

    // matching format flows as mini frames
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(3)).await;
        a_trans.lock().unwrap().send_media(&[0x55; 160], format::ULAW).unwrap();
    }
    let mut last_ts = 0;
    for _ in 0..5 {
        let ev = wait_for(&b, EventKind::Voice).await;
        assert_eq!(ev.subclass, format::ULAW);
        assert_eq!(ev.data.len(), 160);
        assert!(ev.timestamp >= last_ts);
        last_ts = ev.timestamp;
    }

    // a format change rides a full Voice frame
    a_trans.lock().unwrap().send_media(&[0x2a; 160], format::ALAW).unwrap();
    let ev = wait_for(&b, EventKind::Voice).await;
    assert_eq!(ev.subclass, format::ALAW);
    assert_eq!(b_trans.lock().unwrap().format_in(), format::ALAW);

    a_trans.lock().unwrap().send_dtmf(b'5').unwrap();
    let ev = wait_for(&b, EventKind::Dtmf).await;
    assert_eq!(ev.subclass, b'5' as u32);

    b_trans.lock().unwrap().send_text("hello").unwrap();
    let ev = wait_for(&a, EventKind::Text).await;
    assert_eq!(&ev.data[..], b"hello");

    a_trans.lock().unwrap().send_hangup(Some("Normal"), 16).unwrap();
    let ev = wait_for(&b, EventKind::Hangup).await;
    assert!(ev.is_final);
    assert_eq!(ev.ies.get_text(IeCode::Cause), Some("Normal"));
    assert_eq!(ev.ies.get_numeric(IeCode::CauseCode), Some(16));

    let ev = wait_for(&a, EventKind::Terminated).await;
    assert!(ev.is_final);
    assert_eq!(a.transaction_count(), 0);
    assert_eq!(b.transaction_count(), 0);
}

#[tokio::test]
async fn test_call_reject() {
    let (a, b) = engine_pair();
    let a_trans = a
        .start_local_transaction(TransactionType::New, b.local_addr(), IeList::new(), false)
        .unwrap();

    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::New);
    ev.transaction.lock().unwrap().send_reject(Some("Busy here"), 17).unwrap();

    let ev = wait_for(&a, EventKind::Reject).await;
    assert!(ev.is_final);
    assert_eq!(ev.ies.get_text(IeCode::Cause), Some("Busy here"));
    assert_eq!(a_trans.lock().unwrap().state(), TransactionState::Terminated);
}

#[tokio::test]
async fn test_call_with_md5_auth() {
    let (a, b) = engine_pair();
    let mut ies = IeList::new();
    ies.append_text(IeCode::Username, "alice");
    ies.append_text(IeCode::Password, "secret");
    ies.append_text(IeCode::CalledNumber, "200");
    let a_trans = a
        .start_local_transaction(TransactionType::New, b.local_addr(), ies, false)
        .unwrap();

    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::New);
    ev.transaction.lock().unwrap().send_auth("secret").unwrap();

    let ev = next_event(&a).await;
    assert_eq!(ev.kind, EventKind::AuthReq);

    // on a verified reply the call is accepted internally
    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::AuthRep);

    let ev = wait_for(&a, EventKind::Accept).await;
    assert!(!ev.local);
    assert_eq!(a_trans.lock().unwrap().state(), TransactionState::Connected);
}
