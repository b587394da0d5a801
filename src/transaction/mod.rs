use crate::frame::IeList;
use bytes::Bytes;

pub mod transaction;
pub use transaction::{Transaction, TransactionConfig, TransactionRef};

#[cfg(test)]
mod tests;

/// Upper bound on the out-of-order reorder buffer.
pub const MAX_IN_FRAMES: usize = 127;

/// IAX2 Transaction Type
///
/// A transaction is one call leg, one registration exchange or one poke
/// (liveness probe). The type is fixed by the control message that opened
/// the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Media exchange call
    New,
    /// Registration
    RegReq,
    /// Registration release
    RegRel,
    /// Liveness probe answered with a Pong
    Poke,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::New => write!(f, "New"),
            TransactionType::RegReq => write!(f, "RegReq"),
            TransactionType::RegRel => write!(f, "RegRel"),
            TransactionType::Poke => write!(f, "Poke"),
        }
    }
}

/// IAX2 Transaction State
///
/// # State Transitions
///
/// ## Outgoing (local invite)
/// ```text
/// NewLocalInvite → Connected | Terminated            (Accept / RegAck)
/// NewLocalInvite → NewLocalInviteAuthRecv            (AuthReq / RegAuth)
///                → NewLocalInviteRepSent             (auth reply sent)
///                → Connected | Terminated | Terminating
/// ```
///
/// ## Incoming (remote invite)
/// ```text
/// NewRemoteInvite → Connected | Terminating          (accepted / rejected)
/// NewRemoteInvite → NewRemoteInviteAuthSent          (challenge sent)
///                 → NewRemoteInviteRepRecv           (auth reply received)
///                 → Connected | Terminating
/// ```
///
/// Terminating still acknowledges remote frames but emits no new protocol
/// messages; Terminated drops everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Unknown,
    NewLocalInvite,
    NewLocalInviteAuthRecv,
    NewLocalInviteRepSent,
    NewRemoteInvite,
    NewRemoteInviteAuthSent,
    NewRemoteInviteRepRecv,
    Connected,
    Terminating,
    Terminated,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What an event reports to the engine consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Invalid frame or INVAL received
    Invalid,
    /// Transaction terminated
    Terminated,
    /// Retransmission exhausted
    Timeout,
    /// Feature not implemented
    NotImplemented,
    /// New remote transaction
    New,
    /// Auth request received (processed internally)
    AuthReq,
    /// Auth reply received
    AuthRep,
    /// Request accepted
    Accept,
    /// Remote hangup
    Hangup,
    /// Remote reject
    Reject,
    /// Call busy
    Busy,
    /// Text frame received
    Text,
    /// DTMF frame received
    Dtmf,
    /// Noise frame received
    Noise,
    /// Call answered
    Answer,
    /// Quelch the call
    Quelch,
    /// Unquelch the call
    Unquelch,
    /// Call progressing
    Progressing,
    /// Ringing
    Ringing,
    /// Media data received
    Voice,
}

/// Event delivered from [`crate::engine::Engine::get_event`].
///
/// The event keeps the transaction alive: the engine drops its table entry
/// when the final event is dequeued, and the memory goes when the last
/// event referencing it is released.
#[derive(Debug, Clone)]
pub struct IaxEvent {
    pub kind: EventKind,
    /// Locally generated; the receiver must not respond on the wire.
    pub local: bool,
    /// Transaction has finalized; no further events will follow.
    pub is_final: bool,
    /// Type of the frame that generated the event, 0 for internal events.
    pub frame_type: u8,
    pub subclass: u32,
    pub timestamp: u32,
    pub ies: IeList,
    /// Media, text or DTMF payload when the event carries one.
    pub data: Bytes,
    pub transaction: TransactionRef,
}

/// Event contents produced inside a transaction, before the engine attaches
/// the transaction handle.
#[derive(Debug, Clone)]
pub(crate) struct EventBody {
    pub kind: EventKind,
    pub local: bool,
    pub is_final: bool,
    pub frame_type: u8,
    pub subclass: u32,
    pub timestamp: u32,
    pub ies: IeList,
    pub data: Bytes,
}

impl EventBody {
    pub(crate) fn into_event(self, transaction: TransactionRef) -> IaxEvent {
        IaxEvent {
            kind: self.kind,
            local: self.local,
            is_final: self.is_final,
            frame_type: self.frame_type,
            subclass: self.subclass,
            timestamp: self.timestamp,
            ies: self.ies,
            data: self.data,
            transaction,
        }
    }
}

/// Serial-number comparison (RFC 1982) over the 8-bit sequence space with a
/// window of 128: `a` is before `b` iff `b - a` is 1..=127 modulo 256.
pub(crate) fn seq_before(a: u8, b: u8) -> bool {
    a != b && b.wrapping_sub(a) < 128
}

#[cfg(test)]
mod seq_tests {
    use super::seq_before;

    #[test]
    fn test_seq_before() {
        assert!(seq_before(0, 1));
        assert!(seq_before(0, 127));
        assert!(!seq_before(0, 128));
        assert!(!seq_before(0, 0));
        assert!(seq_before(250, 2));
        assert!(!seq_before(2, 250));
        assert!(seq_before(255, 0));
    }
}
