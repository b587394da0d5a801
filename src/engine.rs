use crate::frame::{format, Frame, FrameType, FullFrame, IaxControl, IeList, MAX_CALL_NO};
use crate::transaction::{
    IaxEvent, Transaction, TransactionConfig, TransactionRef, TransactionType,
};
use crate::transport::{Connection, TransportEvent, TransportReceiver, TransportSender};
use crate::trunk::{TrunkBuffer, TrunkBufferRef};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const TIMER_INTERVAL: Duration = Duration::from_millis(20);

/// Monotonic engine clock: milliseconds since the engine started. Wire
/// timestamps derive from this, never from wall-clock time.
#[derive(Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

/// Engine-wide counters. Send failures are counted, not propagated;
/// retransmission covers the loss.
#[derive(Debug, Default)]
pub struct EngineStats {
    datagrams_in: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_write(&self, ok: bool) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_datagram_in(&self) {
        self.datagrams_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagrams_in(&self) -> u64 {
        self.datagrams_in.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

/// Bitmap allocator for the 15-bit local call number space. Allocation
/// scans forward from a moving cursor so freed numbers are not reused
/// immediately.
struct CallNoAllocator {
    used: Vec<u64>,
    next: u16,
    count: u32,
}

impl CallNoAllocator {
    fn new() -> Self {
        CallNoAllocator { used: vec![0u64; (MAX_CALL_NO as usize + 1) / 64 + 1], next: 1, count: 0 }
    }

    fn is_used(&self, n: u16) -> bool {
        self.used[n as usize / 64] & (1u64 << (n % 64)) != 0
    }

    fn set(&mut self, n: u16, used: bool) {
        let mask = 1u64 << (n % 64);
        if used {
            self.used[n as usize / 64] |= mask;
        } else {
            self.used[n as usize / 64] &= !mask;
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        for i in 0..MAX_CALL_NO as u32 {
            let n = ((self.next as u32 - 1 + i) % MAX_CALL_NO as u32 + 1) as u16;
            if !self.is_used(n) {
                self.set(n, true);
                self.count += 1;
                self.next = if n == MAX_CALL_NO { 1 } else { n + 1 };
                return Some(n);
            }
        }
        None
    }

    fn release(&mut self, n: u16) {
        if self.is_used(n) {
            self.set(n, false);
            self.count -= 1;
        }
    }

    fn in_use(&self) -> u32 {
        self.count
    }
}

/// Builder for [`Engine`] with the standard IAX2 timing defaults.
pub struct EngineBuilder {
    connection: Option<Connection>,
    cancel_token: Option<CancellationToken>,
    retrans_count: u16,
    retrans_interval: u64,
    auth_timeout: u64,
    trans_timeout: u64,
    max_full_frame_len: usize,
    format: u32,
    capability: u32,
    trunk_interval: u64,
    timer_interval: Duration,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            connection: None,
            cancel_token: None,
            retrans_count: 4,
            retrans_interval: 500,
            auth_timeout: 30,
            trans_timeout: 10,
            max_full_frame_len: 1400,
            format: format::ULAW,
            capability: format::AUDIO_MASK,
            trunk_interval: 20,
            timer_interval: TIMER_INTERVAL,
        }
    }

    pub fn connection(&mut self, connection: Connection) -> &mut Self {
        self.connection.replace(connection);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    /// Retransmissions before a reliable frame gives up.
    pub fn retrans_count(&mut self, count: u16) -> &mut Self {
        self.retrans_count = count;
        self
    }

    /// Base retransmission interval in milliseconds.
    pub fn retrans_interval(&mut self, ms: u64) -> &mut Self {
        self.retrans_interval = ms;
        self
    }

    /// Timeout in seconds for acknowledged auth frames awaiting the next
    /// protocol step.
    pub fn auth_timeout(&mut self, secs: u64) -> &mut Self {
        self.auth_timeout = secs;
        self
    }

    /// Timeout in seconds for terminating transactions.
    pub fn trans_timeout(&mut self, secs: u64) -> &mut Self {
        self.trans_timeout = secs;
        self
    }

    /// Largest full frame, and trunk datagram, the engine will emit.
    pub fn max_full_frame_len(&mut self, len: usize) -> &mut Self {
        self.max_full_frame_len = len;
        self
    }

    /// Default media format.
    pub fn format(&mut self, format: u32) -> &mut Self {
        self.format = format;
        self
    }

    /// Media capability mask.
    pub fn capability(&mut self, capability: u32) -> &mut Self {
        self.capability = capability;
        self
    }

    /// Trunk flush interval in milliseconds.
    pub fn trunk_interval(&mut self, ms: u64) -> &mut Self {
        self.trunk_interval = ms;
        self
    }

    pub fn timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.timer_interval = timer_interval;
        self
    }

    pub fn build(&mut self) -> Result<Engine> {
        let connection = self
            .connection
            .take()
            .ok_or(Error::EngineError("connection is required".to_string()))?;
        let (transport_tx, transport_rx) = unbounded_channel();
        let trans_cfg = TransactionConfig {
            retrans_count: self.retrans_count,
            retrans_interval: self.retrans_interval,
            auth_timeout: self.auth_timeout * 1000,
            trans_timeout: self.trans_timeout * 1000,
            max_full_frame_len: self.max_full_frame_len,
            format: self.format,
            capability: self.capability,
            ping_interval: self.retrans_interval * self.retrans_count.max(1) as u64,
        };
        Ok(Engine {
            inner: Arc::new(EngineInner {
                conn: connection,
                clock: Clock::new(),
                stats: Arc::new(EngineStats::default()),
                trans_cfg,
                trunk_interval: self.trunk_interval,
                timer_interval: self.timer_interval,
                call_nos: Mutex::new(CallNoAllocator::new()),
                transactions: Mutex::new(HashMap::new()),
                trunks: Mutex::new(HashMap::new()),
                last_served: Mutex::new(0),
                cancel_token: self.cancel_token.take().unwrap_or_default(),
                transport_rx: Mutex::new(Some(transport_rx)),
                transport_tx,
            }),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        EngineBuilder::new()
    }
}

struct EngineInner {
    conn: Connection,
    clock: Clock,
    stats: Arc<EngineStats>,
    trans_cfg: TransactionConfig,
    trunk_interval: u64,
    timer_interval: Duration,
    call_nos: Mutex<CallNoAllocator>,
    transactions: Mutex<HashMap<u16, TransactionRef>>,
    trunks: Mutex<HashMap<SocketAddr, TrunkBufferRef>>,
    last_served: Mutex<u16>,
    cancel_token: CancellationToken,
    transport_rx: Mutex<Option<TransportReceiver>>,
    transport_tx: TransportSender,
}

/// The IAX2 engine: owns the socket, the call number space and the
/// transaction table, demultiplexes datagrams and hands events to the
/// consumer.
///
/// Consumers drive the protocol by calling [`Engine::get_event`] in a
/// loop: polling a transaction is what runs its retransmission, ping and
/// termination timers.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open a transaction towards a peer: a call (New), a registration
    /// (RegReq/RegRel) or a poke. A PASSWORD element seeds authentication
    /// and is never sent on the wire.
    pub fn start_local_transaction(
        &self,
        trans_type: TransactionType,
        addr: SocketAddr,
        ies: IeList,
        trunking: bool,
    ) -> Result<TransactionRef> {
        let l_call_no = self
            .inner
            .call_nos
            .lock()
            .unwrap()
            .allocate()
            .ok_or(Error::CallNoExhausted)?;
        let trans = match Transaction::factory_out(
            self.inner.conn.clone(),
            self.inner.clock.clone(),
            self.inner.stats.clone(),
            self.inner.trans_cfg.clone(),
            trans_type,
            l_call_no,
            addr,
            ies,
        ) {
            Ok(trans) => trans,
            Err(e) => {
                self.inner.call_nos.lock().unwrap().release(l_call_no);
                return Err(e);
            }
        };
        self.inner.transactions.lock().unwrap().insert(l_call_no, trans.clone());
        debug!("started {} transaction {} -> {}", trans_type, l_call_no, addr);
        if trunking {
            self.enable_trunking(&trans);
        }
        Ok(trans)
    }

    /// Parse and dispatch one received datagram.
    pub fn process_datagram(&self, buf: &[u8], addr: SocketAddr) {
        self.inner.stats.record_datagram_in();
        let frame = match Frame::parse(buf) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", addr, e);
                return;
            }
        };
        match frame {
            Frame::MetaTrunk(trunk) => {
                for entry in trunk.entries {
                    match self.find_by_remote(entry.src_call, addr) {
                        Some(trans) => trans
                            .lock()
                            .unwrap()
                            .process_trunk_media(entry.payload, trunk.timestamp),
                        None => trace!("trunk media for unknown call {}", entry.src_call),
                    }
                }
            }
            Frame::Mini(mini) => match self.find_by_remote(mini.src_call, addr) {
                Some(trans) => trans.lock().unwrap().process_mini(mini),
                None => trace!("mini frame for unknown call {}", mini.src_call),
            },
            Frame::Full(full) => self.dispatch_full(full, addr),
        }
    }

    fn dispatch_full(&self, frame: FullFrame, addr: SocketAddr) {
        if frame.dst_call != 0 {
            let trans = self.inner.transactions.lock().unwrap().get(&frame.dst_call).cloned();
            if let Some(trans) = trans {
                let mut t = trans.lock().unwrap();
                if t.remote_addr() == addr
                    && (t.remote_call_no() == 0 || t.remote_call_no() == frame.src_call)
                {
                    t.process_full(frame);
                    return;
                }
            }
            self.reply_inval(&frame, addr);
            return;
        }
        // a zero destination is either a retransmitted opener or a frame
        // for a transaction that does not know our call number yet
        if let Some(trans) = self.find_by_remote(frame.src_call, addr) {
            trans.lock().unwrap().process_full(frame);
            return;
        }
        if frame.frame_type == FrameType::Iax {
            match IaxControl::try_from(frame.subclass) {
                Ok(IaxControl::New)
                | Ok(IaxControl::RegReq)
                | Ok(IaxControl::RegRel)
                | Ok(IaxControl::Poke) => {
                    self.create_inbound(frame, addr);
                    return;
                }
                // never answered, to avoid INVAL ping-pong
                Ok(IaxControl::Ack) | Ok(IaxControl::Inval) | Ok(IaxControl::Vnak) => return,
                _ => {}
            }
        }
        self.reply_inval(&frame, addr);
    }

    fn create_inbound(&self, frame: FullFrame, addr: SocketAddr) {
        if frame.subclass == IaxControl::New as u32 {
            match frame.ies() {
                Ok(ies) if ies.valid_version() => {}
                Ok(_) => {
                    debug!("rejecting New from {} with bad protocol version", addr);
                    self.reply_inval(&frame, addr);
                    return;
                }
                Err(e) => {
                    debug!("rejecting New from {}: {}", addr, e);
                    self.reply_inval(&frame, addr);
                    return;
                }
            }
        }
        let l_call_no = match self.inner.call_nos.lock().unwrap().allocate() {
            Some(n) => n,
            None => {
                warn!("call numbers exhausted, dropping new transaction from {}", addr);
                return;
            }
        };
        match Transaction::factory_in(
            self.inner.conn.clone(),
            self.inner.clock.clone(),
            self.inner.stats.clone(),
            self.inner.trans_cfg.clone(),
            frame,
            l_call_no,
            addr,
        ) {
            Ok(trans) => {
                debug!("accepted inbound transaction {} from {}", l_call_no, addr);
                self.inner.transactions.lock().unwrap().insert(l_call_no, trans);
            }
            Err(e) => {
                self.inner.call_nos.lock().unwrap().release(l_call_no);
                debug!("cannot create inbound transaction from {}: {}", addr, e);
            }
        }
    }

    fn find_by_remote(&self, src_call: u16, addr: SocketAddr) -> Option<TransactionRef> {
        let table = self.inner.transactions.lock().unwrap();
        for trans in table.values() {
            let t = trans.lock().unwrap();
            if t.remote_call_no() == src_call && t.remote_addr() == addr {
                drop(t);
                return Some(trans.clone());
            }
        }
        None
    }

    /// INVAL with zeroed call numbers: the unknown-transaction reply,
    /// doubling as an explicit keepalive.
    fn reply_inval(&self, frame: &FullFrame, addr: SocketAddr) {
        trace!("INVAL to {} for unknown call {}", addr, frame.dst_call);
        self.send_zero_inval(frame.timestamp, addr);
    }

    fn send_zero_inval(&self, timestamp: u32, addr: SocketAddr) {
        let inval = FullFrame {
            src_call: 0,
            dst_call: 0,
            retrans: false,
            timestamp,
            o_seq: 0,
            i_seq: 0,
            frame_type: FrameType::Iax,
            subclass: IaxControl::Inval as u32,
            payload: Bytes::new(),
        };
        match inval.encode() {
            Ok(buf) => {
                let ok = self.inner.conn.send(&buf, addr).is_ok();
                self.inner.stats.record_write(ok);
            }
            Err(e) => warn!("cannot encode INVAL: {}", e),
        }
    }

    /// Send a keepalive INVAL to a peer.
    pub fn keep_alive(&self, addr: SocketAddr) {
        self.send_zero_inval(0, addr);
    }

    /// Poll transactions for one event, round-robin from the slot after
    /// the last one served. Polling also drives each transaction's
    /// retransmission, ping and termination timers. A final event removes
    /// the transaction; its memory lives as long as the event does.
    pub fn get_event(&self) -> Option<IaxEvent> {
        let now = self.inner.clock.now_ms();
        let mut keys: Vec<u16> =
            self.inner.transactions.lock().unwrap().keys().copied().collect();
        if keys.is_empty() {
            return None;
        }
        keys.sort_unstable();
        let last = *self.inner.last_served.lock().unwrap();
        let start = keys.iter().position(|&k| k > last).unwrap_or(0);
        for i in 0..keys.len() {
            let key = keys[(start + i) % keys.len()];
            let trans = self.inner.transactions.lock().unwrap().get(&key).cloned();
            let Some(trans) = trans else { continue };
            let body = trans.lock().unwrap().get_event(now);
            if let Some(body) = body {
                *self.inner.last_served.lock().unwrap() = key;
                if body.is_final {
                    self.remove_transaction(key);
                }
                return Some(body.into_event(trans));
            }
        }
        None
    }

    fn remove_transaction(&self, l_call_no: u16) {
        self.inner.transactions.lock().unwrap().remove(&l_call_no);
        self.inner.call_nos.lock().unwrap().release(l_call_no);
        trace!("removed transaction {}", l_call_no);
    }

    /// Route the transaction's media through the shared trunk buffer for
    /// its peer, creating the buffer on first use.
    pub fn enable_trunking(&self, trans: &TransactionRef) -> bool {
        let addr = trans.lock().unwrap().remote_addr();
        let trunk = {
            let mut trunks = self.inner.trunks.lock().unwrap();
            trunks
                .entry(addr)
                .or_insert_with(|| {
                    TrunkBuffer::new(
                        self.inner.conn.clone(),
                        addr,
                        self.inner.trans_cfg.max_full_frame_len,
                        self.inner.trunk_interval,
                        self.inner.clock.now_ms(),
                    )
                })
                .clone()
        };
        trans.lock().unwrap().enable_trunking(trunk)
    }

    /// Flush every trunk buffer whose interval elapsed.
    pub fn process_trunk_frames(&self) {
        let now = self.inner.clock.now_ms();
        let trunks: Vec<TrunkBufferRef> =
            self.inner.trunks.lock().unwrap().values().cloned().collect();
        for trunk in trunks {
            if let Err(e) = trunk.flush_due(now) {
                debug!("trunk flush to {} failed: {}", trunk.addr(), e);
            }
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.transactions.lock().unwrap().len()
    }

    /// Set bits in the call number bitmap; always equals the table size
    /// plus transactions kept alive by outstanding events.
    pub fn call_numbers_in_use(&self) -> u32 {
        self.inner.call_nos.lock().unwrap().in_use()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.conn.get_addr()
    }

    /// Run the receive loop and the trunk flush tick until cancelled.
    pub async fn serve(&self) -> Result<()> {
        let mut transport_rx = self
            .inner
            .transport_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::EngineError("engine already serving".to_string()))?;
        let conn = self.inner.conn.clone();
        let transport_tx = self.inner.transport_tx.clone();
        let datagrams = async {
            while let Some(TransportEvent::Datagram(buf, addr)) = transport_rx.recv().await {
                self.process_datagram(&buf, addr);
            }
        };
        let trunk_tick = async {
            loop {
                tokio::time::sleep(self.inner.timer_interval).await;
                self.process_trunk_frames();
            }
        };
        select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("engine cancelled");
            }
            r = conn.serve_loop(transport_tx) => {
                if let Err(e) = r {
                    warn!("transport loop ended: {}", e);
                }
            }
            _ = datagrams => {}
            _ = trunk_tick => {}
        }
        info!("engine shutdown");
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("engine shutdown requested");
        self.inner.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::CallNoAllocator;
    use crate::frame::MAX_CALL_NO;

    #[test]
    fn test_call_no_round_robin() {
        let mut alloc = CallNoAllocator::new();
        let n1 = alloc.allocate().unwrap();
        let n2 = alloc.allocate().unwrap();
        assert_ne!(n1, n2);
        assert!(n1 >= 1 && n2 <= MAX_CALL_NO);
        alloc.release(n1);
        // freed numbers are not handed back immediately
        let n3 = alloc.allocate().unwrap();
        assert_ne!(n3, n1);
        assert_eq!(alloc.in_use(), 2);
    }

    #[test]
    fn test_call_no_exhaustion_and_reuse() {
        let mut alloc = CallNoAllocator::new();
        for _ in 0..MAX_CALL_NO {
            assert!(alloc.allocate().is_some());
        }
        assert_eq!(alloc.in_use(), MAX_CALL_NO as u32);
        assert!(alloc.allocate().is_none());
        alloc.release(1234);
        assert_eq!(alloc.allocate(), Some(1234));
        assert!(alloc.allocate().is_none());
    }

    #[test]
    fn test_call_no_zero_never_allocated() {
        let mut alloc = CallNoAllocator::new();
        for _ in 0..100 {
            let n = alloc.allocate().unwrap();
            assert_ne!(n, 0);
        }
    }
}
