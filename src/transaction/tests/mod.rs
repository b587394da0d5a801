//! Scenario tests driving engine pairs over in-memory channel connections.

use crate::engine::{Engine, EngineBuilder};
use crate::frame::{format, ControlType, FullFrame, FrameType, IaxControl, IeCode, IeList};
use crate::transaction::{EventKind, IaxEvent, TransactionRef, TransactionType};
use crate::transport::{ChannelConnection, TransportEvent};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

mod test_call;
mod test_out_of_order;
mod test_register;
mod test_trunk;

static NEXT_PORT: AtomicU16 = AtomicU16::new(40000);

pub(crate) fn test_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Build an engine over a channel connection and run its serve loop.
pub(crate) fn build_engine_with(
    conn: ChannelConnection,
    tune: impl FnOnce(&mut EngineBuilder),
) -> Engine {
    let mut builder = EngineBuilder::new();
    builder.connection(conn.into());
    tune(&mut builder);
    let engine = builder.build().unwrap();
    let serving = engine.clone();
    tokio::spawn(async move { serving.serve().await });
    engine
}

pub(crate) fn build_engine(conn: ChannelConnection) -> Engine {
    build_engine_with(conn, |_| {})
}

/// Two served engines wired back to back.
pub(crate) fn engine_pair() -> (Engine, Engine) {
    let conn_a = ChannelConnection::create_connection(test_addr());
    let conn_b = ChannelConnection::create_connection(test_addr());
    conn_a.link(&conn_b);
    (build_engine(conn_a), build_engine(conn_b))
}

/// Poll until the engine produces any event.
pub(crate) async fn next_event(engine: &Engine) -> IaxEvent {
    for _ in 0..500 {
        if let Some(ev) = engine.get_event() {
            return ev;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for an event");
}

/// Poll until an event of the wanted kind shows up, discarding others.
pub(crate) async fn wait_for(engine: &Engine, kind: EventKind) -> IaxEvent {
    for _ in 0..500 {
        while let Some(ev) = engine.get_event() {
            if ev.kind == kind {
                return ev;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {:?}", kind);
}

/// A bare channel endpoint for hand-crafting frames towards an engine and
/// inspecting everything it sends back.
pub(crate) struct RawPeer {
    pub conn: ChannelConnection,
    pub rx: UnboundedReceiver<TransportEvent>,
    pub addr: SocketAddr,
}

impl RawPeer {
    pub fn create() -> Self {
        let addr = test_addr();
        let conn = ChannelConnection::create_connection(addr);
        let (tx, rx) = unbounded_channel();
        let serving = conn.clone();
        tokio::spawn(async move { serving.serve_loop(tx).await });
        RawPeer { conn, rx, addr }
    }

    pub fn send_frame(&self, frame: &FullFrame, to: SocketAddr) {
        self.conn.send(&frame.encode().unwrap(), to).unwrap();
    }

    pub async fn recv(&mut self) -> Bytes {
        match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
            Ok(Some(TransportEvent::Datagram(buf, _))) => buf,
            _ => panic!("no datagram from engine"),
        }
    }

    /// Collect datagrams until the line goes quiet.
    pub async fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(Some(TransportEvent::Datagram(buf, _))) =
            tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await
        {
            out.push(buf);
        }
        out
    }
}

pub(crate) fn iax_full(
    src_call: u16,
    dst_call: u16,
    timestamp: u32,
    o_seq: u8,
    i_seq: u8,
    subclass: IaxControl,
    ies: &IeList,
) -> FullFrame {
    FullFrame {
        src_call,
        dst_call,
        retrans: false,
        timestamp,
        o_seq,
        i_seq,
        frame_type: FrameType::Iax,
        subclass: subclass as u32,
        payload: ies.encode(),
    }
}

pub(crate) fn control_full(
    src_call: u16,
    dst_call: u16,
    timestamp: u32,
    o_seq: u8,
    i_seq: u8,
    control: ControlType,
) -> FullFrame {
    FullFrame {
        src_call,
        dst_call,
        retrans: false,
        timestamp,
        o_seq,
        i_seq,
        frame_type: FrameType::Control,
        subclass: control as u32,
        payload: Bytes::new(),
    }
}

/// Raw peer opens a call towards the engine and the test code accepts it.
/// Returns the connected engine-side transaction and its call number.
pub(crate) async fn connect_raw_call(engine: &Engine, peer: &RawPeer) -> (TransactionRef, u16) {
    let mut ies = IeList::new();
    ies.insert_version();
    ies.append_numeric(IeCode::Format, format::ULAW);
    ies.append_numeric(IeCode::Capability, format::ULAW);
    peer.send_frame(&iax_full(1, 0, 1, 0, 0, IaxControl::New, &ies), engine.local_addr());
    let ev = wait_for(engine, EventKind::New).await;
    let trans = ev.transaction.clone();
    trans.lock().unwrap().send_accept().unwrap();
    let call_no = trans.lock().unwrap().local_call_no();
    (trans, call_no)
}
