use super::{seq_before, EventBody, EventKind, TransactionState, TransactionType, MAX_IN_FRAMES};
use crate::auth;
use crate::engine::{Clock, EngineStats};
use crate::frame::ie::pack_ip;
use crate::frame::{
    ControlType, FrameType, FullFrame, IaxControl, IeCode, IeList, MiniFrame,
    FULL_FRAME_HEADER_LEN,
};
use crate::transport::Connection;
use crate::trunk::TrunkBufferRef;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

pub type TransactionRef = Arc<Mutex<Transaction>>;

/// Cap on the doubling retransmission interval.
const MAX_RETRANS_INTERVAL: u64 = 32_000;

/// Standardized cause strings.
pub const CAUSE_NO_AUTH_METHOD: &str = "Unsupported or missing authentication method";
pub const CAUSE_NO_MEDIA_FORMAT: &str = "Unsupported or missing media format";
pub const CAUSE_INVALID_AUTH: &str = "Invalid authentication request";

/// Per-transaction slice of the engine configuration.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Retransmissions before a frame times the transaction out.
    pub retrans_count: u16,
    /// Starting retransmission interval in ms; doubles per retry.
    pub retrans_interval: u64,
    /// Deadline in ms for the protocol step after an acknowledged auth frame.
    pub auth_timeout: u64,
    /// Deadline in ms for Terminating transactions and acknowledged requests.
    pub trans_timeout: u64,
    /// Largest full frame the engine will emit.
    pub max_full_frame_len: usize,
    /// Default media format.
    pub format: u32,
    /// Media capability mask.
    pub capability: u32,
    /// Connected-state keepalive ping interval in ms.
    pub ping_interval: u64,
}

/// A posted full frame awaiting acknowledgment.
#[derive(Debug)]
struct FrameOut {
    frame: FullFrame,
    /// Satisfied by a bare ACK; removed as soon as one covers it.
    ack_only: bool,
    acked: bool,
    auth_adjusted: bool,
    retrans_left: u16,
    interval: u64,
    next_at: u64,
}

/// One IAX2 transaction: a call leg, a registration exchange or a poke,
/// identified by (local call number, remote call number, peer address).
pub struct Transaction {
    conn: Connection,
    clock: Clock,
    stats: Arc<EngineStats>,
    cfg: TransactionConfig,
    local_init: bool,
    local_req_end: bool,
    trans_type: TransactionType,
    state: TransactionState,
    created_at: u64,
    addr: SocketAddr,
    l_call_no: u16,
    r_call_no: u16,
    o_seq: u8,
    i_seq: u8,
    last_full_ts_out: u32,
    last_ts_in: u32,
    // outgoing frames awaiting acknowledgment
    out_frames: VecDeque<FrameOut>,
    // accepted frames awaiting processing, in sequence order
    in_frames: VecDeque<FullFrame>,
    // frames received ahead of the expected sequence
    ooo_frames: VecDeque<FullFrame>,
    // expected sequence a VNAK was already emitted for
    vnak_sent_for: Option<u8>,
    queue: VecDeque<EventBody>,
    next_ping_at: u64,
    terminate_at: u64,
    // statistics
    in_frames_total: u64,
    in_out_of_order: u64,
    in_dropped: u64,
    // call identity
    username: String,
    password: String,
    calling_no: String,
    calling_name: String,
    called_no: String,
    called_context: String,
    challenge: String,
    auth_data: String,
    expire: u32,
    format: u32,
    format_in: u32,
    format_out: u32,
    capability: u32,
    trunk: Option<TrunkBufferRef>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    fn new(
        conn: Connection,
        clock: Clock,
        stats: Arc<EngineStats>,
        cfg: TransactionConfig,
        trans_type: TransactionType,
        state: TransactionState,
        local_init: bool,
        l_call_no: u16,
        r_call_no: u16,
        addr: SocketAddr,
    ) -> Self {
        let now = clock.now_ms();
        let format = cfg.format;
        let capability = cfg.capability;
        Transaction {
            conn,
            clock,
            stats,
            cfg,
            local_init,
            local_req_end: false,
            trans_type,
            state,
            created_at: now,
            addr,
            l_call_no,
            r_call_no,
            o_seq: 0,
            i_seq: 0,
            last_full_ts_out: 0,
            last_ts_in: 0,
            out_frames: VecDeque::new(),
            in_frames: VecDeque::new(),
            ooo_frames: VecDeque::new(),
            vnak_sent_for: None,
            queue: VecDeque::new(),
            next_ping_at: 0,
            terminate_at: 0,
            in_frames_total: 0,
            in_out_of_order: 0,
            in_dropped: 0,
            username: String::new(),
            password: String::new(),
            calling_no: String::new(),
            calling_name: String::new(),
            called_no: String::new(),
            called_context: String::new(),
            challenge: String::new(),
            auth_data: String::new(),
            expire: 60,
            format,
            format_in: format,
            format_out: format,
            capability,
            trunk: None,
        }
    }

    /// Build an outgoing transaction and post its opening control frame.
    /// A PASSWORD element in the list stays local: it seeds the MD5
    /// exchange and never travels.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn factory_out(
        conn: Connection,
        clock: Clock,
        stats: Arc<EngineStats>,
        cfg: TransactionConfig,
        trans_type: TransactionType,
        l_call_no: u16,
        addr: SocketAddr,
        mut ies: IeList,
    ) -> Result<TransactionRef> {
        let mut t = Transaction::new(
            conn,
            clock,
            stats,
            cfg,
            trans_type,
            TransactionState::NewLocalInvite,
            true,
            l_call_no,
            0,
            addr,
        );
        let now = t.clock.now_ms();
        if let Some(ie) = ies.remove(IeCode::Password) {
            if let crate::frame::IeValue::Text(pwd) = ie.value {
                t.password = pwd;
            }
        }
        let subclass = match trans_type {
            TransactionType::New => {
                ies.insert_version();
                if ies.get(IeCode::Format).is_none() {
                    ies.append_numeric(IeCode::Format, t.cfg.format);
                }
                if ies.get(IeCode::Capability).is_none() {
                    ies.append_numeric(IeCode::Capability, t.cfg.capability);
                }
                IaxControl::New
            }
            TransactionType::RegReq => {
                if ies.get(IeCode::Refresh).is_none() {
                    ies.append_numeric(IeCode::Refresh, t.expire);
                }
                IaxControl::RegReq
            }
            TransactionType::RegRel => IaxControl::RegRel,
            TransactionType::Poke => IaxControl::Poke,
        };
        t.init_from_ies(&ies);
        t.post_frame(FrameType::Iax, subclass as u32, ies.encode(), None, false, now);
        Ok(Arc::new(Mutex::new(t)))
    }

    /// Build an incoming transaction from a received transaction-opening
    /// frame. The frame goes through the normal sequenced path so the New
    /// event comes out of the first poll.
    pub(crate) fn factory_in(
        conn: Connection,
        clock: Clock,
        stats: Arc<EngineStats>,
        cfg: TransactionConfig,
        frame: FullFrame,
        l_call_no: u16,
        addr: SocketAddr,
    ) -> Result<TransactionRef> {
        let trans_type = match IaxControl::try_from(frame.subclass) {
            Ok(IaxControl::New) => TransactionType::New,
            Ok(IaxControl::RegReq) => TransactionType::RegReq,
            Ok(IaxControl::RegRel) => TransactionType::RegRel,
            Ok(IaxControl::Poke) => TransactionType::Poke,
            _ => {
                return Err(Error::TransactionError(
                    format!("subclass {} cannot open a transaction", frame.subclass),
                    l_call_no,
                ))
            }
        };
        let mut t = Transaction::new(
            conn,
            clock,
            stats,
            cfg,
            trans_type,
            TransactionState::NewRemoteInvite,
            false,
            l_call_no,
            frame.src_call,
            addr,
        );
        t.process_full(frame);
        Ok(Arc::new(Mutex::new(t)))
    }

    pub fn trans_type(&self) -> TransactionType {
        self.trans_type
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// True if this transaction was initiated locally.
    pub fn outgoing(&self) -> bool {
        self.local_init
    }

    pub fn local_call_no(&self) -> u16 {
        self.l_call_no
    }

    pub fn remote_call_no(&self) -> u16 {
        self.r_call_no
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn calling_no(&self) -> &str {
        &self.calling_no
    }

    pub fn calling_name(&self) -> &str {
        &self.calling_name
    }

    pub fn called_no(&self) -> &str {
        &self.called_no
    }

    pub fn called_context(&self) -> &str {
        &self.called_context
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn auth_data(&self) -> &str {
        &self.auth_data
    }

    /// Registration expiry in seconds.
    pub fn expire(&self) -> u32 {
        self.expire
    }

    /// Media format negotiated at setup.
    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn format_in(&self) -> u32 {
        self.format_in
    }

    pub fn format_out(&self) -> u32 {
        self.format_out
    }

    pub fn capability(&self) -> u32 {
        self.capability
    }

    /// Total received, out-of-order and dropped full frame counts.
    pub fn frame_stats(&self) -> (u64, u64, u64) {
        (self.in_frames_total, self.in_out_of_order, self.in_dropped)
    }

    pub(crate) fn oseq_no(&self) -> u8 {
        self.o_seq
    }

    pub(crate) fn iseq_no(&self) -> u8 {
        self.i_seq
    }

    pub(crate) fn pending_out_frames(&self) -> usize {
        self.out_frames.len()
    }

    fn init_from_ies(&mut self, ies: &IeList) {
        if let Some(v) = ies.get_text(IeCode::Username) {
            self.username = v.to_string();
        }
        if let Some(v) = ies.get_text(IeCode::CallingNumber) {
            self.calling_no = v.to_string();
        }
        if let Some(v) = ies.get_text(IeCode::CallingName) {
            self.calling_name = v.to_string();
        }
        if let Some(v) = ies.get_text(IeCode::CalledNumber) {
            self.called_no = v.to_string();
        }
        if let Some(v) = ies.get_text(IeCode::CalledContext) {
            self.called_context = v.to_string();
        }
        if let Some(v) = ies.get_numeric(IeCode::Refresh) {
            self.expire = v;
        }
        if let Some(v) = ies.get_numeric(IeCode::Format) {
            self.format = v;
            self.format_in = v;
            self.format_out = v;
        }
    }

    // ---- receive path, called from the engine with the lock held ----

    /// Sequence screening for one received full frame. In-order frames are
    /// queued for [`Transaction::get_event`]; duplicates are re-ACKed and
    /// dropped; frames ahead of the window are buffered and answered with a
    /// single VNAK naming the expected sequence.
    pub(crate) fn process_full(&mut self, frame: FullFrame) {
        let now = self.clock.now_ms();
        if self.state == TransactionState::Terminated {
            return;
        }
        self.in_frames_total += 1;
        if self.r_call_no == 0 && frame.src_call != 0 {
            self.r_call_no = frame.src_call;
        }
        if frame.frame_type == FrameType::Iax {
            match IaxControl::try_from(frame.subclass) {
                Ok(IaxControl::Ack) => {
                    self.ack_out_frames(frame.i_seq, now);
                    return;
                }
                Ok(IaxControl::Inval) => {
                    trace!("transaction {} got INVAL", self.l_call_no);
                    self.out_frames.clear();
                    self.push_event(EventKind::Invalid, false, true);
                    self.state = TransactionState::Terminated;
                    return;
                }
                Ok(IaxControl::Vnak) => {
                    self.retransmit_from(frame.i_seq);
                    return;
                }
                _ => {}
            }
        }
        self.ack_out_frames(frame.i_seq, now);
        if frame.o_seq == self.i_seq {
            self.i_seq = self.i_seq.wrapping_add(1);
            self.vnak_sent_for = None;
            self.in_frames.push_back(frame);
            // drain the reorder buffer while it continues the sequence
            loop {
                let i_seq = self.i_seq;
                self.ooo_frames.retain(|g| !seq_before(g.o_seq, i_seq));
                let pos = self.ooo_frames.iter().position(|g| g.o_seq == i_seq);
                match pos.and_then(|pos| self.ooo_frames.remove(pos)) {
                    Some(g) => {
                        self.i_seq = self.i_seq.wrapping_add(1);
                        self.in_frames.push_back(g);
                    }
                    None => break,
                }
            }
        } else if seq_before(frame.o_seq, self.i_seq) {
            self.in_dropped += 1;
            self.send_ack(&frame);
        } else {
            self.in_out_of_order += 1;
            if self.ooo_frames.iter().any(|g| g.o_seq == frame.o_seq) {
                self.in_dropped += 1;
                return;
            }
            if self.ooo_frames.len() >= MAX_IN_FRAMES {
                self.ooo_frames.pop_front();
                self.in_dropped += 1;
            }
            self.ooo_frames.push_back(frame);
            if self.vnak_sent_for != Some(self.i_seq) {
                self.send_vnak(now);
                self.vnak_sent_for = Some(self.i_seq);
            }
        }
    }

    /// Received mini frame: reconstruct the 32-bit timestamp by pinning the
    /// high half to the most recent full timestamp, bumping an epoch on
    /// wraparound.
    pub(crate) fn process_mini(&mut self, mini: MiniFrame) {
        if self.state != TransactionState::Connected {
            self.in_dropped += 1;
            return;
        }
        let mut ts = (self.last_ts_in & 0xffff_0000) | mini.timestamp as u32;
        if ts < self.last_ts_in {
            ts = ts.wrapping_add(0x1_0000);
        }
        self.last_ts_in = ts;
        self.push_media(mini.payload, ts);
    }

    /// Media arriving inside a meta trunk frame carries the sender's
    /// absolute timestamp already.
    pub(crate) fn process_trunk_media(&mut self, data: Bytes, timestamp: u32) {
        if self.state != TransactionState::Connected {
            self.in_dropped += 1;
            return;
        }
        if timestamp > self.last_ts_in {
            self.last_ts_in = timestamp;
        }
        self.push_media(data, timestamp);
    }

    // ---- event loop, called from the engine poller ----

    /// Process timers and queued frames, returning at most one event.
    pub(crate) fn get_event(&mut self, now: u64) -> Option<EventBody> {
        if let Some(ev) = self.queue.pop_front() {
            return Some(ev);
        }
        if self.state == TransactionState::Terminated {
            return None;
        }
        while let Some(frame) = self.in_frames.pop_front() {
            self.handle_in_frame(frame, now);
            if self.state == TransactionState::Terminated {
                break;
            }
        }
        self.process_out_frames(now);
        if self.state == TransactionState::Terminating
            && self.terminate_at != 0
            && now >= self.terminate_at
        {
            self.finalize();
        }
        if self.state == TransactionState::Connected && now >= self.next_ping_at {
            self.post_frame(FrameType::Iax, IaxControl::Ping as u32, Bytes::new(), None, false, now);
            self.next_ping_at = now + self.cfg.ping_interval;
        }
        self.queue.pop_front()
    }

    fn handle_in_frame(&mut self, frame: FullFrame, now: u64) {
        trace!("transaction {} processing {}", self.l_call_no, frame);
        let posted_before = self.o_seq;
        let accepted = match frame.frame_type {
            FrameType::Iax => self.handle_iax(&frame, now),
            FrameType::Control => self.handle_control(&frame),
            FrameType::Voice => self.handle_voice(&frame),
            FrameType::Dtmf => self.handle_event_frame(&frame, EventKind::Dtmf),
            FrameType::Text => self.handle_event_frame(&frame, EventKind::Text),
            FrameType::Noise => self.handle_event_frame(&frame, EventKind::Noise),
            FrameType::Null => true,
            FrameType::Video | FrameType::Image | FrameType::Html => {
                self.push_frame_event(EventKind::NotImplemented, false, false, &frame, IeList::new());
                true
            }
        };
        // anything accepted and not answered with a full frame gets a bare ACK
        if accepted && self.o_seq == posted_before {
            self.send_ack(&frame);
        }
    }

    fn handle_iax(&mut self, frame: &FullFrame, now: u64) -> bool {
        let sub = match IaxControl::try_from(frame.subclass) {
            Ok(sub) => sub,
            Err(_) => {
                self.push_frame_event(EventKind::NotImplemented, false, false, frame, IeList::new());
                return true;
            }
        };
        match sub {
            IaxControl::Ping => {
                self.post_frame(
                    FrameType::Iax,
                    IaxControl::Pong as u32,
                    Bytes::new(),
                    Some(frame.timestamp),
                    true,
                    now,
                );
                true
            }
            IaxControl::LagRq => {
                self.post_frame(
                    FrameType::Iax,
                    IaxControl::LagRp as u32,
                    Bytes::new(),
                    Some(frame.timestamp),
                    true,
                    now,
                );
                true
            }
            IaxControl::Pong => self.on_pong(frame),
            IaxControl::New => self.on_new(frame, now),
            IaxControl::Poke => self.on_poke(frame, now),
            IaxControl::AuthReq | IaxControl::RegAuth => self.on_auth_req(frame, now),
            IaxControl::AuthRep => self.on_auth_rep(frame, now),
            IaxControl::RegReq | IaxControl::RegRel => self.on_reg_req(frame, now),
            IaxControl::Accept => self.on_accept(frame, now),
            IaxControl::RegAck => self.on_reg_ack(frame),
            IaxControl::Reject | IaxControl::RegRej => self.on_reject(frame),
            IaxControl::Hangup => self.on_remote_hangup(frame),
            IaxControl::Quelch => {
                if self.state == TransactionState::Connected {
                    self.push_frame_event(EventKind::Quelch, false, false, frame, IeList::new());
                }
                true
            }
            IaxControl::Unquelch => {
                if self.state == TransactionState::Connected {
                    self.push_frame_event(EventKind::Unquelch, false, false, frame, IeList::new());
                }
                true
            }
            // screened out before queuing
            IaxControl::Ack | IaxControl::Inval | IaxControl::Vnak => true,
            _ => {
                self.push_frame_event(EventKind::NotImplemented, false, false, frame, IeList::new());
                true
            }
        }
    }

    fn on_new(&mut self, frame: &FullFrame, now: u64) -> bool {
        if self.local_init || self.state != TransactionState::NewRemoteInvite {
            return true;
        }
        let ies = match frame.ies() {
            Ok(ies) => ies,
            Err(e) => {
                debug!("transaction {} invalid IE list: {}", self.l_call_no, e);
                self.send_inval(frame);
                return false;
            }
        };
        self.init_from_ies(&ies);
        let peer_format = ies.get_numeric(IeCode::Format).unwrap_or(0);
        let peer_cap = ies.get_numeric(IeCode::Capability).unwrap_or(peer_format);
        self.capability = peer_cap & self.cfg.capability;
        let format = if peer_format & self.cfg.capability != 0 {
            peer_format
        } else if self.capability != 0 {
            1 << self.capability.trailing_zeros()
        } else {
            0
        };
        if format == 0 {
            self.reject_with_event(CAUSE_NO_MEDIA_FORMAT, 0, now);
            return true;
        }
        self.format = format;
        self.format_in = format;
        self.format_out = format;
        self.push_frame_event(EventKind::New, false, false, frame, ies);
        true
    }

    fn on_poke(&mut self, frame: &FullFrame, now: u64) -> bool {
        if self.local_init || self.state != TransactionState::NewRemoteInvite {
            return true;
        }
        self.push_frame_event(EventKind::New, false, false, frame, IeList::new());
        self.post_frame(
            FrameType::Iax,
            IaxControl::Pong as u32,
            Bytes::new(),
            Some(frame.timestamp),
            true,
            now,
        );
        self.local_req_end = true;
        self.state = TransactionState::Terminating;
        self.terminate_at = now + self.cfg.trans_timeout;
        true
    }

    fn on_pong(&mut self, frame: &FullFrame) -> bool {
        self.remove_out(&[IaxControl::Ping, IaxControl::Poke]);
        if self.local_init
            && self.trans_type == TransactionType::Poke
            && self.state == TransactionState::NewLocalInvite
        {
            self.push_frame_event(EventKind::Accept, true, false, frame, IeList::new());
            self.push_event(EventKind::Terminated, true, true);
            self.state = TransactionState::Terminated;
            // the bare ACK for the Pong still goes out from handle_in_frame
        }
        true
    }

    fn on_auth_req(&mut self, frame: &FullFrame, now: u64) -> bool {
        if !self.local_init || self.state != TransactionState::NewLocalInvite {
            return true;
        }
        let ies = match frame.ies() {
            Ok(ies) => ies,
            Err(e) => {
                debug!("transaction {} invalid IE list: {}", self.l_call_no, e);
                self.send_inval(frame);
                return false;
            }
        };
        self.remove_out(&[IaxControl::New, IaxControl::RegReq, IaxControl::RegRel]);
        self.state = TransactionState::NewLocalInviteAuthRecv;
        let methods = ies.get_numeric(IeCode::AuthMethods).unwrap_or(0);
        self.challenge = ies.get_text(IeCode::Challenge).unwrap_or_default().to_string();
        self.push_frame_event(EventKind::AuthReq, false, false, frame, ies);
        if methods & auth::AUTH_MD5 == 0 || self.challenge.is_empty() {
            self.reject_with_event(CAUSE_NO_AUTH_METHOD, 0, now);
        } else {
            self.send_auth_reply_at(now);
        }
        true
    }

    fn on_auth_rep(&mut self, frame: &FullFrame, now: u64) -> bool {
        if self.local_init || self.state != TransactionState::NewRemoteInviteAuthSent {
            return true;
        }
        let ies = match frame.ies() {
            Ok(ies) => ies,
            Err(e) => {
                debug!("transaction {} invalid IE list: {}", self.l_call_no, e);
                self.send_inval(frame);
                return false;
            }
        };
        self.remove_out(&[IaxControl::AuthReq]);
        self.auth_data = ies.get_text(IeCode::Md5Result).unwrap_or_default().to_string();
        if auth::challenge_ok(&self.auth_data, &self.challenge, &self.password) {
            self.state = TransactionState::NewRemoteInviteRepRecv;
            self.push_frame_event(EventKind::AuthRep, false, false, frame, ies);
            self.accept_call(now);
        } else {
            self.reject_with_event(CAUSE_INVALID_AUTH, 0, now);
        }
        true
    }

    /// On the answering side a REGREQ/REGREL is either the opening frame or
    /// the authenticated reply to our REGAUTH.
    fn on_reg_req(&mut self, frame: &FullFrame, now: u64) -> bool {
        if self.local_init {
            return true;
        }
        let ies = match frame.ies() {
            Ok(ies) => ies,
            Err(e) => {
                debug!("transaction {} invalid IE list: {}", self.l_call_no, e);
                self.send_inval(frame);
                return false;
            }
        };
        match self.state {
            TransactionState::NewRemoteInvite => {
                self.init_from_ies(&ies);
                self.push_frame_event(EventKind::New, false, false, frame, ies);
            }
            TransactionState::NewRemoteInviteAuthSent => {
                self.remove_out(&[IaxControl::RegAuth]);
                self.auth_data =
                    ies.get_text(IeCode::Md5Result).unwrap_or_default().to_string();
                if auth::challenge_ok(&self.auth_data, &self.challenge, &self.password) {
                    self.state = TransactionState::NewRemoteInviteRepRecv;
                    self.push_frame_event(EventKind::AuthRep, false, false, frame, ies);
                    self.send_reg_ack(now);
                } else {
                    self.reject_with_event(CAUSE_INVALID_AUTH, 0, now);
                }
            }
            _ => {}
        }
        true
    }

    fn on_accept(&mut self, frame: &FullFrame, now: u64) -> bool {
        if !self.local_init
            || self.trans_type != TransactionType::New
            || !matches!(
                self.state,
                TransactionState::NewLocalInvite | TransactionState::NewLocalInviteRepSent
            )
        {
            return true;
        }
        let ies = match frame.ies() {
            Ok(ies) => ies,
            Err(e) => {
                debug!("transaction {} invalid IE list: {}", self.l_call_no, e);
                self.send_inval(frame);
                return false;
            }
        };
        self.remove_out(&[IaxControl::New, IaxControl::AuthRep]);
        let format = ies.get_numeric(IeCode::Format).unwrap_or(0);
        if format == 0 || format & self.cfg.capability == 0 {
            self.reject_with_event(CAUSE_NO_MEDIA_FORMAT, 0, now);
            return true;
        }
        self.format = format;
        self.format_in = format;
        self.format_out = format;
        self.state = TransactionState::Connected;
        self.next_ping_at = now + self.cfg.ping_interval;
        self.push_frame_event(EventKind::Accept, false, false, frame, ies);
        true
    }

    fn on_reg_ack(&mut self, frame: &FullFrame) -> bool {
        if !self.local_init
            || !matches!(self.trans_type, TransactionType::RegReq | TransactionType::RegRel)
            || !matches!(
                self.state,
                TransactionState::NewLocalInvite | TransactionState::NewLocalInviteRepSent
            )
        {
            return true;
        }
        let ies = match frame.ies() {
            Ok(ies) => ies,
            Err(e) => {
                debug!("transaction {} invalid IE list: {}", self.l_call_no, e);
                self.send_inval(frame);
                return false;
            }
        };
        self.remove_out(&[IaxControl::RegReq, IaxControl::RegRel]);
        if let Some(refresh) = ies.get_numeric(IeCode::Refresh) {
            self.expire = refresh;
        }
        self.push_frame_event(EventKind::Accept, false, false, frame, ies);
        self.push_event(EventKind::Terminated, true, true);
        self.state = TransactionState::Terminated;
        true
    }

    fn on_reject(&mut self, frame: &FullFrame) -> bool {
        let ies = frame.ies().unwrap_or_default();
        self.out_frames.clear();
        self.push_frame_event(EventKind::Reject, false, true, frame, ies);
        self.state = TransactionState::Terminated;
        true
    }

    fn on_remote_hangup(&mut self, frame: &FullFrame) -> bool {
        let ies = frame.ies().unwrap_or_default();
        self.out_frames.clear();
        self.push_frame_event(EventKind::Hangup, false, true, frame, ies);
        self.state = TransactionState::Terminated;
        true
    }

    fn handle_control(&mut self, frame: &FullFrame) -> bool {
        if self.state != TransactionState::Connected {
            return true;
        }
        let kind = match ControlType::try_from(frame.subclass) {
            Ok(ControlType::Hangup) => {
                self.out_frames.clear();
                self.push_frame_event(EventKind::Hangup, false, true, frame, IeList::new());
                self.state = TransactionState::Terminated;
                return true;
            }
            Ok(ControlType::Ringing) => EventKind::Ringing,
            Ok(ControlType::Answer) => EventKind::Answer,
            Ok(ControlType::Busy) | Ok(ControlType::Congestion) => EventKind::Busy,
            Ok(ControlType::Progressing) | Ok(ControlType::Proceeding) => EventKind::Progressing,
            _ => EventKind::NotImplemented,
        };
        self.push_frame_event(kind, false, false, frame, IeList::new());
        true
    }

    fn handle_voice(&mut self, frame: &FullFrame) -> bool {
        if self.state != TransactionState::Connected {
            return true;
        }
        if frame.subclass != self.format_in {
            if frame.subclass & self.cfg.capability != 0 {
                trace!(
                    "transaction {} voice format change {:x} -> {:x}",
                    self.l_call_no,
                    self.format_in,
                    frame.subclass
                );
                self.format_in = frame.subclass;
            } else {
                debug!(
                    "transaction {} unsupported voice format {:x}",
                    self.l_call_no, frame.subclass
                );
            }
        }
        if frame.timestamp > self.last_ts_in {
            self.last_ts_in = frame.timestamp;
        }
        self.push_media(frame.payload.clone(), frame.timestamp);
        true
    }

    fn handle_event_frame(&mut self, frame: &FullFrame, kind: EventKind) -> bool {
        if self.state != TransactionState::Connected {
            return true;
        }
        self.push_frame_event(kind, false, false, frame, IeList::new());
        true
    }

    // ---- reliable delivery ----

    /// Post one full frame: send it and park it for retransmission.
    fn post_frame(
        &mut self,
        frame_type: FrameType,
        subclass: u32,
        payload: Bytes,
        ts: Option<u32>,
        ack_only: bool,
        now: u64,
    ) {
        let timestamp = match ts {
            Some(t) => t,
            None => {
                let t = (now.saturating_sub(self.created_at)) as u32;
                t.max(self.last_full_ts_out.wrapping_add(1))
            }
        };
        if timestamp > self.last_full_ts_out {
            self.last_full_ts_out = timestamp;
        }
        if FULL_FRAME_HEADER_LEN + payload.len() > self.cfg.max_full_frame_len {
            warn!(
                "transaction {} frame payload {} over limit {}",
                self.l_call_no,
                payload.len(),
                self.cfg.max_full_frame_len
            );
        }
        let frame = FullFrame {
            src_call: self.l_call_no,
            dst_call: self.r_call_no,
            retrans: false,
            timestamp,
            o_seq: self.o_seq,
            i_seq: self.i_seq,
            frame_type,
            subclass,
            payload,
        };
        self.o_seq = self.o_seq.wrapping_add(1);
        self.send_full(&frame);
        self.out_frames.push_back(FrameOut {
            frame,
            ack_only,
            acked: false,
            auth_adjusted: false,
            retrans_left: self.cfg.retrans_count,
            interval: self.cfg.retrans_interval,
            next_at: now + self.cfg.retrans_interval,
        });
    }

    /// Mark parked frames the remote has seen. The remote's incoming
    /// sequence number names the next sequence it expects, so coverage is
    /// strictly-before in serial order. Acknowledged frames that still
    /// await a protocol response stop retransmitting and get a response
    /// deadline instead; the auth handshake gets the longer auth timeout
    /// to leave room for user-driven credential entry.
    fn ack_out_frames(&mut self, i_seq: u8, now: u64) {
        let auth_timeout = self.cfg.auth_timeout;
        let trans_timeout = self.cfg.trans_timeout;
        self.out_frames.retain_mut(|fo| {
            if !fo.acked && seq_before(fo.frame.o_seq, i_seq) {
                fo.acked = true;
                if fo.ack_only {
                    return false;
                }
                if !fo.auth_adjusted {
                    let is_auth = fo.frame.frame_type == FrameType::Iax
                        && (fo.frame.subclass == IaxControl::AuthReq as u32
                            || fo.frame.subclass == IaxControl::RegAuth as u32);
                    fo.retrans_left = 1;
                    fo.interval = if is_auth { auth_timeout } else { trans_timeout };
                    fo.next_at = now + fo.interval;
                    fo.auth_adjusted = true;
                }
            }
            true
        });
        if self.state == TransactionState::Terminating
            && self.local_req_end
            && self.out_frames.is_empty()
        {
            self.finalize();
        }
    }

    /// Drop parked frames a response just answered.
    fn remove_out(&mut self, subclasses: &[IaxControl]) {
        self.out_frames.retain(|fo| {
            fo.frame.frame_type != FrameType::Iax
                || !subclasses.iter().any(|s| fo.frame.subclass == *s as u32)
        });
    }

    /// VNAK from the remote: resend everything from the named sequence on.
    fn retransmit_from(&mut self, seq: u8) {
        let mut bufs = Vec::new();
        for fo in self.out_frames.iter_mut() {
            if !seq_before(fo.frame.o_seq, seq) {
                fo.frame.retrans = true;
                if let Ok(buf) = fo.frame.encode() {
                    bufs.push(buf);
                }
            }
        }
        for buf in bufs {
            self.send_bytes(&buf);
        }
    }

    /// Retransmit due frames with a doubling interval; a frame out of
    /// retries finalizes the transaction with Timeout.
    fn process_out_frames(&mut self, now: u64) {
        let mut bufs = Vec::new();
        let mut timed_out = false;
        for fo in self.out_frames.iter_mut() {
            if now < fo.next_at {
                continue;
            }
            if fo.retrans_left == 0 {
                timed_out = true;
                break;
            }
            fo.retrans_left -= 1;
            fo.frame.retrans = true;
            fo.interval = (fo.interval * 2).min(MAX_RETRANS_INTERVAL);
            fo.next_at = now + fo.interval;
            if let Ok(buf) = fo.frame.encode() {
                bufs.push(buf);
            }
        }
        for buf in bufs {
            self.send_bytes(&buf);
        }
        if timed_out {
            debug!("transaction {} timed out", self.l_call_no);
            self.out_frames.clear();
            if self.state == TransactionState::Terminating {
                self.push_event(EventKind::Terminated, true, true);
            } else {
                self.push_event(EventKind::Timeout, true, true);
            }
            self.state = TransactionState::Terminated;
        }
    }

    fn finalize(&mut self) {
        self.out_frames.clear();
        self.push_event(EventKind::Terminated, true, true);
        self.state = TransactionState::Terminated;
    }

    // ---- wire helpers ----

    fn send_full(&self, frame: &FullFrame) {
        match frame.encode() {
            Ok(buf) => self.send_bytes(&buf),
            Err(e) => warn!("transaction {} cannot encode frame: {}", self.l_call_no, e),
        }
    }

    fn send_bytes(&self, buf: &[u8]) {
        match self.conn.send(buf, self.addr) {
            Ok(()) => self.stats.record_write(true),
            Err(e) => {
                self.stats.record_write(false);
                debug!("transaction {} send failed: {}", self.l_call_no, e);
            }
        }
    }

    /// Bare ACK for a received frame: echoes its timestamp, consumes no
    /// sequence number, is never parked.
    fn send_ack(&self, frame: &FullFrame) {
        let ack = FullFrame {
            src_call: self.l_call_no,
            dst_call: self.r_call_no,
            retrans: false,
            timestamp: frame.timestamp,
            o_seq: self.o_seq,
            i_seq: self.i_seq,
            frame_type: FrameType::Iax,
            subclass: IaxControl::Ack as u32,
            payload: Bytes::new(),
        };
        self.send_full(&ack);
    }

    fn send_inval(&self, frame: &FullFrame) {
        let inval = FullFrame {
            src_call: self.l_call_no,
            dst_call: self.r_call_no,
            retrans: false,
            timestamp: frame.timestamp,
            o_seq: self.o_seq,
            i_seq: self.i_seq,
            frame_type: FrameType::Iax,
            subclass: IaxControl::Inval as u32,
            payload: Bytes::new(),
        };
        self.send_full(&inval);
    }

    /// VNAK naming the sequence we expect; the remote retransmits from it.
    fn send_vnak(&self, now: u64) {
        let vnak = FullFrame {
            src_call: self.l_call_no,
            dst_call: self.r_call_no,
            retrans: false,
            timestamp: (now.saturating_sub(self.created_at)) as u32,
            o_seq: self.o_seq,
            i_seq: self.i_seq,
            frame_type: FrameType::Iax,
            subclass: IaxControl::Vnak as u32,
            payload: Bytes::new(),
        };
        self.send_full(&vnak);
    }

    // ---- events ----

    fn push_event(&mut self, kind: EventKind, local: bool, is_final: bool) {
        self.queue.push_back(EventBody {
            kind,
            local,
            is_final,
            frame_type: 0,
            subclass: 0,
            timestamp: 0,
            ies: IeList::new(),
            data: Bytes::new(),
        });
    }

    fn push_frame_event(
        &mut self,
        kind: EventKind,
        local: bool,
        is_final: bool,
        frame: &FullFrame,
        ies: IeList,
    ) {
        let data = match frame.frame_type {
            FrameType::Iax => Bytes::new(),
            _ => frame.payload.clone(),
        };
        self.queue.push_back(EventBody {
            kind,
            local,
            is_final,
            frame_type: frame.frame_type as u8,
            subclass: frame.subclass,
            timestamp: frame.timestamp,
            ies,
            data,
        });
    }

    fn push_media(&mut self, data: Bytes, timestamp: u32) {
        self.queue.push_back(EventBody {
            kind: EventKind::Voice,
            local: false,
            is_final: false,
            frame_type: FrameType::Voice as u8,
            subclass: self.format_in,
            timestamp,
            ies: IeList::new(),
            data,
        });
    }

    // ---- local requests ----

    /// Send media, switching to a full Voice frame whenever the outgoing
    /// format changes and to the trunk buffer when trunking is enabled.
    pub fn send_media(&mut self, data: &[u8], format: u32) -> Result<()> {
        let now = self.clock.now_ms();
        if self.state != TransactionState::Connected {
            return Err(Error::TransactionError("not connected".to_string(), self.l_call_no));
        }
        let ts = (now.saturating_sub(self.created_at)) as u32;
        if format != self.format_out {
            self.format_out = format;
            self.post_frame(
                FrameType::Voice,
                format,
                Bytes::copy_from_slice(data),
                Some(ts),
                true,
                now,
            );
        } else if let Some(trunk) = self.trunk.clone() {
            trunk.add(self.l_call_no, Bytes::copy_from_slice(data), now as u32)?;
        } else {
            let mini = MiniFrame {
                src_call: self.l_call_no,
                timestamp: ts as u16,
                payload: Bytes::copy_from_slice(data),
            };
            self.send_bytes(&mini.encode());
        }
        Ok(())
    }

    /// Send a frame valid only on an established call leg.
    pub fn send_connected(&mut self, control: ControlType) -> Result<()> {
        let now = self.clock.now_ms();
        if self.state != TransactionState::Connected {
            return Err(Error::TransactionError("not connected".to_string(), self.l_call_no));
        }
        self.post_frame(FrameType::Control, control as u32, Bytes::new(), None, true, now);
        Ok(())
    }

    pub fn send_answer(&mut self) -> Result<()> {
        self.send_connected(ControlType::Answer)
    }

    pub fn send_ringing(&mut self) -> Result<()> {
        self.send_connected(ControlType::Ringing)
    }

    pub fn send_dtmf(&mut self, digit: u8) -> Result<()> {
        let now = self.clock.now_ms();
        if self.state != TransactionState::Connected || digit > 127 {
            return Err(Error::TransactionError("cannot send DTMF".to_string(), self.l_call_no));
        }
        self.post_frame(FrameType::Dtmf, digit as u32, Bytes::new(), None, true, now);
        Ok(())
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        let now = self.clock.now_ms();
        if self.state != TransactionState::Connected {
            return Err(Error::TransactionError("not connected".to_string(), self.l_call_no));
        }
        self.post_frame(
            FrameType::Text,
            0,
            Bytes::copy_from_slice(text.as_bytes()),
            None,
            true,
            now,
        );
        Ok(())
    }

    pub fn send_noise(&mut self, level: u8) -> Result<()> {
        let now = self.clock.now_ms();
        if self.state != TransactionState::Connected || level > 127 {
            return Err(Error::TransactionError("cannot send noise".to_string(), self.l_call_no));
        }
        self.post_frame(FrameType::Noise, level as u32, Bytes::new(), None, true, now);
        Ok(())
    }

    /// Accept an incoming transaction: ACCEPT for calls, REGACK for
    /// registrations.
    pub fn send_accept(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        if self.local_init
            || !matches!(
                self.state,
                TransactionState::NewRemoteInvite | TransactionState::NewRemoteInviteRepRecv
            )
        {
            return Err(Error::TransactionError("cannot accept".to_string(), self.l_call_no));
        }
        match self.trans_type {
            TransactionType::New => {
                self.accept_call(now);
                Ok(())
            }
            TransactionType::RegReq | TransactionType::RegRel => {
                self.send_reg_ack(now);
                Ok(())
            }
            TransactionType::Poke => {
                Err(Error::TransactionError("poke is auto-accepted".to_string(), self.l_call_no))
            }
        }
    }

    fn accept_call(&mut self, now: u64) {
        let mut ies = IeList::new();
        ies.append_numeric(IeCode::Format, self.format);
        self.post_frame(FrameType::Iax, IaxControl::Accept as u32, ies.encode(), None, true, now);
        self.state = TransactionState::Connected;
        self.next_ping_at = now + self.cfg.ping_interval;
    }

    fn send_reg_ack(&mut self, now: u64) {
        let mut ies = IeList::new();
        if !self.username.is_empty() {
            ies.append_text(IeCode::Username, self.username.clone());
        }
        ies.append_numeric(IeCode::Refresh, self.expire);
        if let Ok(ie) = pack_ip(self.addr) {
            ies.append(ie);
        }
        self.post_frame(FrameType::Iax, IaxControl::RegAck as u32, ies.encode(), None, true, now);
        self.local_req_end = true;
        self.state = TransactionState::Terminating;
        self.terminate_at = now + self.cfg.trans_timeout;
    }

    /// Challenge the remote: AUTHREQ for calls, REGAUTH for registrations.
    /// The password seeds the later MD5 verification.
    pub fn send_auth(&mut self, password: &str) -> Result<()> {
        let now = self.clock.now_ms();
        if self.local_init || self.state != TransactionState::NewRemoteInvite {
            return Err(Error::TransactionError("cannot send auth".to_string(), self.l_call_no));
        }
        self.password = password.to_string();
        self.challenge = auth::make_challenge();
        let mut ies = IeList::new();
        ies.append_numeric(IeCode::AuthMethods, auth::AUTH_MD5);
        ies.append_text(IeCode::Challenge, self.challenge.clone());
        if !self.username.is_empty() {
            ies.append_text(IeCode::Username, self.username.clone());
        }
        let subclass = match self.trans_type {
            TransactionType::New => IaxControl::AuthReq,
            TransactionType::RegReq | TransactionType::RegRel => IaxControl::RegAuth,
            TransactionType::Poke => {
                return Err(Error::TransactionError(
                    "poke needs no authentication".to_string(),
                    self.l_call_no,
                ))
            }
        };
        self.post_frame(FrameType::Iax, subclass as u32, ies.encode(), None, false, now);
        self.state = TransactionState::NewRemoteInviteAuthSent;
        Ok(())
    }

    /// Answer a received challenge with the MD5 digest. Called internally
    /// when the challenge arrives carrying a usable method.
    pub fn send_auth_reply(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        if !self.local_init || self.state != TransactionState::NewLocalInviteAuthRecv {
            return Err(Error::TransactionError(
                "no authentication request pending".to_string(),
                self.l_call_no,
            ));
        }
        self.send_auth_reply_at(now);
        Ok(())
    }

    fn send_auth_reply_at(&mut self, now: u64) {
        let digest = auth::md5_from_challenge(&self.challenge, &self.password);
        self.auth_data = digest.clone();
        let mut ies = IeList::new();
        let subclass = match self.trans_type {
            TransactionType::New | TransactionType::Poke => {
                ies.append_text(IeCode::Md5Result, digest);
                IaxControl::AuthRep
            }
            TransactionType::RegReq => {
                if !self.username.is_empty() {
                    ies.append_text(IeCode::Username, self.username.clone());
                }
                ies.append_text(IeCode::Md5Result, digest);
                ies.append_numeric(IeCode::Refresh, self.expire);
                IaxControl::RegReq
            }
            TransactionType::RegRel => {
                if !self.username.is_empty() {
                    ies.append_text(IeCode::Username, self.username.clone());
                }
                ies.append_text(IeCode::Md5Result, digest);
                IaxControl::RegRel
            }
        };
        self.post_frame(FrameType::Iax, subclass as u32, ies.encode(), None, false, now);
        self.state = TransactionState::NewLocalInviteRepSent;
    }

    /// Hang a call up. The transaction terminates once the remote ACKs or
    /// the termination deadline passes.
    pub fn send_hangup(&mut self, cause: Option<&str>, code: u8) -> Result<()> {
        let now = self.clock.now_ms();
        if self.trans_type != TransactionType::New
            || matches!(self.state, TransactionState::Terminating | TransactionState::Terminated)
        {
            return Err(Error::TransactionError("cannot hang up".to_string(), self.l_call_no));
        }
        let mut ies = IeList::new();
        if let Some(cause) = cause {
            ies.append_text(IeCode::Cause, cause);
        }
        if code != 0 {
            ies.append_numeric(IeCode::CauseCode, code as u32);
        }
        self.post_frame(FrameType::Iax, IaxControl::Hangup as u32, ies.encode(), None, true, now);
        self.local_req_end = true;
        self.state = TransactionState::Terminating;
        self.terminate_at = now + self.cfg.trans_timeout;
        Ok(())
    }

    /// Reject an incoming transaction.
    pub fn send_reject(&mut self, cause: Option<&str>, code: u8) -> Result<()> {
        let now = self.clock.now_ms();
        if matches!(self.state, TransactionState::Terminating | TransactionState::Terminated) {
            return Err(Error::TransactionError("cannot reject".to_string(), self.l_call_no));
        }
        self.post_reject(cause, code, now);
        Ok(())
    }

    fn post_reject(&mut self, cause: Option<&str>, code: u8, now: u64) {
        let mut ies = IeList::new();
        if let Some(cause) = cause {
            ies.append_text(IeCode::Cause, cause);
        }
        if code != 0 {
            ies.append_numeric(IeCode::CauseCode, code as u32);
        }
        let subclass = match self.trans_type {
            TransactionType::RegReq | TransactionType::RegRel => IaxControl::RegRej,
            _ => IaxControl::Reject,
        };
        self.post_frame(FrameType::Iax, subclass as u32, ies.encode(), None, true, now);
        self.local_req_end = true;
        self.state = TransactionState::Terminating;
        self.terminate_at = now + self.cfg.trans_timeout;
    }

    /// Internal rejection with a standardized cause, surfaced as a local
    /// Reject event.
    fn reject_with_event(&mut self, cause: &str, code: u8, now: u64) {
        self.push_event(EventKind::Reject, true, false);
        self.post_reject(Some(cause), code, now);
    }

    /// Force a registration transaction into Terminating. It still ACKs
    /// remote frames but sends nothing new.
    pub fn abort_reg(&mut self) -> bool {
        if !matches!(self.trans_type, TransactionType::RegReq | TransactionType::RegRel)
            || matches!(self.state, TransactionState::Terminating | TransactionState::Terminated)
        {
            return false;
        }
        self.out_frames.clear();
        self.local_req_end = true;
        self.state = TransactionState::Terminating;
        self.terminate_at = self.clock.now_ms();
        true
    }

    /// Route this transaction's media through a shared per-peer trunk
    /// buffer instead of standalone mini frames.
    pub fn enable_trunking(&mut self, trunk: TrunkBufferRef) -> bool {
        if self.trunk.is_some() {
            return false;
        }
        self.trunk = Some(trunk);
        true
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("type", &self.trans_type)
            .field("state", &self.state)
            .field("local_call_no", &self.l_call_no)
            .field("remote_call_no", &self.r_call_no)
            .field("addr", &self.addr)
            .field("o_seq", &self.o_seq)
            .field("i_seq", &self.i_seq)
            .finish()
    }
}
