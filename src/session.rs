//! Sessions and session slots.
//!
//! A session is a connected channel between two endpoints. Each session
//! owns a fixed window of slots; a slot is the per-request state machine,
//! reused across requests with a request number that advances by the window
//! size on every reuse.

use std::sync::{Arc, Mutex};

use minstant::Instant;

use crate::buffer::MsgBuffer;
use crate::rpc::Continuation;
use crate::sm::SessionEndpoint;

/// Request window size per session (`W`): maximum outstanding requests.
pub const SESSION_REQ_WINDOW: usize = 8;

/// Session credits (`C`): maximum in-flight request-side packets.
pub const SESSION_CREDITS: usize = 8;

/// Maximum simultaneously active sessions per endpoint.
pub const MAX_ACTIVE_SESSIONS: usize = 1024;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    ConnectInProgress,
    Connected,
    DisconnectInProgress,
}

/// Which side of the session this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRole {
    Client,
    Server,
}

/// Slot state.
///
/// The tags read from the request's point of view on both sides:
/// `ReqTxPending` means the request is still in transfer (client: packets
/// left to queue; server: packets still arriving); `AwaitingResp` means the
/// request is fully transferred and the response does not exist yet
/// (client: nothing received; server: handler still running);
/// `RespTxPending` means the response is in transfer (server: packets left
/// to send; client: packets still arriving); `Complete` means the exchange
/// finished (client: continuation dispatched; server: response fully sent
/// and retained until the next-generation request retires it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SSlotState {
    Idle,
    ReqTxPending,
    AwaitingResp,
    RespTxPending,
    Complete,
}

/// A session slot: the per-request state machine.
pub(crate) struct SSlot {
    /// Slot index within the session.
    pub index: usize,
    /// Request number of the current (or last) request in this slot.
    pub req_num: u64,
    /// Client: request number the next reuse will take.
    pub next_req_num: u64,
    /// Server: whether this slot has carried a request yet.
    pub used: bool,
    pub state: SSlotState,
    /// Client: the request buffer. Server: the response buffer.
    pub tx_msgbuf: Option<MsgBuffer>,
    /// Dynamic reassembly buffer for a multi-packet inbound message.
    pub rx_msgbuf: Option<MsgBuffer>,
    /// Client: continuation to invoke on response completion.
    pub cont: Option<Continuation>,
    /// Client: run the continuation on a background worker.
    pub cont_bg: bool,
    pub req_type: u8,
    pub tag: u64,
    /// Inbound packets received for the message in transfer.
    pub pkts_rcvd: usize,
    /// Client: request packets acknowledged by explicit credit returns.
    pub req_pkts_acked: usize,
    /// Total size of the inbound message, learned from its first packet.
    pub rx_msg_size: usize,
    /// Packets the inbound message spans.
    pub rx_num_pkts: usize,
    /// Last meaningful progress, for the loss detector.
    pub progress_ts: Instant,
    /// Guard against double-insertion into the request TX queue.
    pub in_txq: bool,
}

impl SSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            req_num: index as u64,
            next_req_num: index as u64,
            used: false,
            state: SSlotState::Idle,
            tx_msgbuf: None,
            rx_msgbuf: None,
            cont: None,
            cont_bg: false,
            req_type: 0,
            tag: 0,
            pkts_rcvd: 0,
            req_pkts_acked: 0,
            rx_msg_size: 0,
            rx_num_pkts: 0,
            progress_ts: Instant::now(),
            in_txq: false,
        }
    }

    /// Client: begin a new request in this slot, taking the next request
    /// number for the slot's generation sequence.
    pub fn start_request(&mut self, req_type: u8, tag: u64, cont: Continuation, cont_bg: bool) {
        debug_assert_eq!(self.state, SSlotState::Idle);
        self.req_num = self.next_req_num;
        self.next_req_num += SESSION_REQ_WINDOW as u64;
        self.used = true;
        self.state = SSlotState::ReqTxPending;
        self.cont = Some(cont);
        self.cont_bg = cont_bg;
        self.req_type = req_type;
        self.tag = tag;
        self.pkts_rcvd = 0;
        self.req_pkts_acked = 0;
        self.rx_msg_size = 0;
        self.rx_num_pkts = 0;
        self.progress_ts = Instant::now();
    }

    /// Server: the request number a brand-new request for this slot must
    /// carry.
    #[inline]
    pub fn expected_new_req_num(&self) -> u64 {
        if self.used {
            self.req_num + SESSION_REQ_WINDOW as u64
        } else {
            self.index as u64
        }
    }

    #[inline]
    pub fn touch(&mut self) {
        self.progress_ts = Instant::now();
    }
}

/// A session: a connected channel and its request window.
pub(crate) struct Session<R> {
    pub role: SessionRole,
    pub state: SessionState,
    /// This endpoint's identity for the session.
    pub local: SessionEndpoint,
    /// The peer's identity, including its session number and routing blob.
    pub remote: SessionEndpoint,
    /// Resolved transport routing info for the peer.
    pub routing: Option<R>,
    pub slots: Vec<SSlot>,
    /// Client: slot indices available for new requests. Locked because
    /// background completions return indices from worker threads.
    pub free_slots: Arc<Mutex<Vec<usize>>>,
    /// Client-side credits; `credits + in-flight request packets = C`.
    pub credits: usize,
    /// Generation token of the connect handshake.
    pub sm_token: u64,
    /// When the connect was initiated (client), for the SM timeout.
    pub sm_start: Instant,
    /// Whether the disconnect request has been handed to the broker.
    pub disconnect_sent: bool,
}

impl<R> Session<R> {
    pub fn new(
        role: SessionRole,
        local: SessionEndpoint,
        remote: SessionEndpoint,
        sm_token: u64,
    ) -> Self {
        let slots = (0..SESSION_REQ_WINDOW).map(SSlot::new).collect();
        // LIFO stack; initialized so slot 0 pops first.
        let free: Vec<usize> = (0..SESSION_REQ_WINDOW).rev().collect();
        Self {
            role,
            state: SessionState::Disconnected,
            local,
            remote,
            routing: None,
            slots,
            free_slots: Arc::new(Mutex::new(free)),
            credits: SESSION_CREDITS,
            sm_token,
            sm_start: Instant::now(),
            disconnect_sent: false,
        }
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Pop a free slot index for a new request.
    pub fn alloc_sslot(&self) -> Option<usize> {
        self.free_slots.lock().unwrap().pop()
    }

    #[inline]
    pub fn has_credits(&self) -> bool {
        self.credits > 0
    }

    #[inline]
    pub fn consume_credit(&mut self) {
        debug_assert!(self.credits > 0);
        self.credits -= 1;
    }

    /// Return one credit; never exceeds `C` (duplicate CRs under
    /// retransmission would otherwise overshoot).
    #[inline]
    pub fn bump_credits(&mut self) {
        if self.credits < SESSION_CREDITS {
            self.credits += 1;
        }
    }

    /// Number of slots currently carrying a request.
    pub fn active_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SSlotState::Idle)
            .count()
    }

    /// Client: true when every slot has been returned to the free stack.
    pub fn drained(&self) -> bool {
        self.free_slots.lock().unwrap().len() == SESSION_REQ_WINDOW
    }
}

/// Append-only session index. Freed entries become permanent null holes, so
/// a session number is never reused and late packets for dead sessions can
/// be recognized and dropped.
pub(crate) struct SessionTable<R> {
    sessions: Vec<Option<Box<Session<R>>>>,
}

impl<R> SessionTable<R> {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    /// Insert a session, assigning the next session number.
    pub fn insert(&mut self, mut session: Session<R>) -> Option<u16> {
        if self.sessions.len() >= u16::MAX as usize || self.active_count() >= MAX_ACTIVE_SESSIONS {
            return None;
        }
        let num = self.sessions.len() as u16;
        session.local.session_num = num;
        self.sessions.push(Some(Box::new(session)));
        Some(num)
    }

    pub fn get(&self, num: u16) -> Option<&Session<R>> {
        self.sessions.get(num as usize).and_then(|s| s.as_deref())
    }

    pub fn get_mut(&mut self, num: u16) -> Option<&mut Session<R>> {
        self.sessions
            .get_mut(num as usize)
            .and_then(|s| s.as_deref_mut())
    }

    /// Null out a session, leaving a hole.
    pub fn remove(&mut self, num: u16) -> Option<Box<Session<R>>> {
        self.sessions.get_mut(num as usize).and_then(|s| s.take())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<R>> {
        self.sessions.iter_mut().filter_map(|s| s.as_deref_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::SessionEndpoint;

    fn endpoint() -> SessionEndpoint {
        SessionEndpoint {
            hostname: "127.0.0.1:0".into(),
            endpoint_id: 0,
            phy_port: 0,
            session_num: 0,
            routing: Vec::new(),
        }
    }

    fn client_session() -> Session<()> {
        Session::new(SessionRole::Client, endpoint(), endpoint(), 1)
    }

    #[test]
    fn test_credit_accounting() {
        let mut s = client_session();
        assert_eq!(s.credits, SESSION_CREDITS);
        for _ in 0..SESSION_CREDITS {
            assert!(s.has_credits());
            s.consume_credit();
        }
        assert!(!s.has_credits());
        for _ in 0..SESSION_CREDITS + 3 {
            s.bump_credits();
        }
        // Saturates at C even under duplicate credit returns.
        assert_eq!(s.credits, SESSION_CREDITS);
    }

    #[test]
    fn test_slot_req_num_advances_by_window() {
        let mut slot = SSlot::new(3);
        let mut nums = Vec::new();
        for _ in 0..4 {
            slot.start_request(0, 0, Box::new(|_| {}), false);
            nums.push(slot.req_num);
            slot.state = SSlotState::Idle;
        }
        assert_eq!(nums, vec![3, 11, 19, 27]);
        for w in nums.windows(2) {
            assert_eq!(w[1] - w[0], SESSION_REQ_WINDOW as u64);
        }
    }

    #[test]
    fn test_server_expected_new_req_num() {
        let mut slot = SSlot::new(2);
        assert_eq!(slot.expected_new_req_num(), 2);
        slot.used = true;
        slot.req_num = 2;
        assert_eq!(slot.expected_new_req_num(), 2 + SESSION_REQ_WINDOW as u64);
    }

    #[test]
    fn test_slot_alloc_exhaustion() {
        let s = client_session();
        for _ in 0..SESSION_REQ_WINDOW {
            assert!(s.alloc_sslot().is_some());
        }
        assert!(s.alloc_sslot().is_none());
        s.free_slots.lock().unwrap().push(5);
        assert_eq!(s.alloc_sslot(), Some(5));
    }

    #[test]
    fn test_session_table_holes() {
        let mut table: SessionTable<()> = SessionTable::new();
        let a = table.insert(client_session()).unwrap();
        let b = table.insert(client_session()).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.active_count(), 2);

        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert_eq!(table.active_count(), 1);

        // Session numbers are never reused.
        let c = table.insert(client_session()).unwrap();
        assert_eq!(c, 2);
        assert!(table.get(a).is_none());
    }
}
