use crate::frame::{MetaTrunkFrame, TrunkEntry, META_TRUNK_HEADER_LEN};
use crate::transport::Connection;
use crate::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type TrunkBufferRef = Arc<TrunkBuffer>;

struct TrunkInner {
    entries: Vec<TrunkEntry>,
    data_len: usize,
    timestamp: u32,
    next_send_at: u64,
}

/// Aggregation buffer for trunked media towards one remote peer, shared by
/// every transaction that has trunking enabled to that peer.
///
/// The serialized buffer never exceeds the engine's max payload: an add
/// that would overflow flushes first. All entries in one flush share the
/// single absolute timestamp recorded when the buffer started filling.
pub struct TrunkBuffer {
    conn: Connection,
    addr: SocketAddr,
    max_len: usize,
    send_interval: u64,
    inner: Mutex<TrunkInner>,
}

impl TrunkBuffer {
    pub fn new(
        conn: Connection,
        addr: SocketAddr,
        max_len: usize,
        send_interval: u64,
        now: u64,
    ) -> TrunkBufferRef {
        Arc::new(TrunkBuffer {
            conn,
            addr,
            max_len,
            send_interval,
            inner: Mutex::new(TrunkInner {
                entries: Vec::new(),
                data_len: 0,
                timestamp: 0,
                next_send_at: now + send_interval,
            }),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Append one call's media. Flushes first if the entry would push the
    /// serialized frame past the maximum payload.
    pub fn add(&self, src_call: u16, data: Bytes, timestamp: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry_len = 4 + data.len();
        if !inner.entries.is_empty()
            && META_TRUNK_HEADER_LEN + inner.data_len + entry_len > self.max_len
        {
            self.send_locked(&mut inner)?;
        }
        if inner.entries.is_empty() {
            inner.timestamp = timestamp;
        }
        inner.entries.push(TrunkEntry { src_call, payload: data });
        inner.data_len += entry_len;
        Ok(())
    }

    /// Flush if the send interval elapsed. Driven by the engine timer.
    pub fn flush_due(&self, now: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if now < inner.next_send_at {
            return Ok(());
        }
        inner.next_send_at = now + self.send_interval;
        self.send_locked(&mut inner)
    }

    /// Unconditional flush of whatever is buffered.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.send_locked(&mut inner)
    }

    fn send_locked(&self, inner: &mut TrunkInner) -> Result<()> {
        if inner.entries.is_empty() {
            return Ok(());
        }
        let frame = MetaTrunkFrame {
            timestamp: inner.timestamp,
            entries: std::mem::take(&mut inner.entries),
        };
        inner.data_len = 0;
        let buf = frame.encode();
        if let Err(e) = self.conn.send(&buf, self.addr) {
            warn!("trunk send to {} failed: {}", self.addr, e);
            return Err(e);
        }
        Ok(())
    }
}
