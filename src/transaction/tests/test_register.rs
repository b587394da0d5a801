use super::*;

#[tokio::test]
async fn test_register_with_md5_challenge() {
    let (a, b) = engine_pair();
    let mut ies = IeList::new();
    ies.append_text(IeCode::Username, "alice");
    ies.append_text(IeCode::Password, "secret");
    ies.append_numeric(IeCode::Refresh, 60);
    a.start_local_transaction(TransactionType::RegReq, b.local_addr(), ies, false)
        .unwrap();

    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::New);
    {
        let mut t = ev.transaction.lock().unwrap();
        assert_eq!(t.trans_type(), TransactionType::RegReq);
        assert_eq!(t.username(), "alice");
        t.send_auth("secret").unwrap();
    }

    // the challenge is answered internally with the stored password
    let ev = next_event(&a).await;
    assert_eq!(ev.kind, EventKind::AuthReq);
    assert!(ev.ies.get_text(IeCode::Challenge).is_some());

    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::AuthRep);

    let ev = next_event(&a).await;
    assert_eq!(ev.kind, EventKind::Accept);
    assert_eq!(ev.ies.get_numeric(IeCode::Refresh), Some(60));
    assert_eq!(ev.transaction.lock().unwrap().expire(), 60);
    let ev = next_event(&a).await;
    assert_eq!(ev.kind, EventKind::Terminated);
    assert!(ev.is_final);

    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::Terminated);
    assert!(ev.is_final);
    assert_eq!(a.transaction_count(), 0);
    assert_eq!(b.transaction_count(), 0);
}

#[tokio::test]
async fn test_register_wrong_password_rejected() {
    let (a, b) = engine_pair();
    let mut ies = IeList::new();
    ies.append_text(IeCode::Username, "alice");
    ies.append_text(IeCode::Password, "wrong");
    a.start_local_transaction(TransactionType::RegReq, b.local_addr(), ies, false)
        .unwrap();

    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::New);
    ev.transaction.lock().unwrap().send_auth("secret").unwrap();

    let ev = next_event(&a).await;
    assert_eq!(ev.kind, EventKind::AuthReq);

    // verification fails, the registrar rejects
    let ev = next_event(&b).await;
    assert_eq!(ev.kind, EventKind::Reject);
    assert!(ev.local);

    let ev = wait_for(&a, EventKind::Reject).await;
    assert!(ev.is_final);
}
