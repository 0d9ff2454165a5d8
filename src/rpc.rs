//! The per-thread RPC endpoint.
//!
//! An `Rpc<T>` owns one transport channel and a population of sessions, and
//! drives everything through a cooperative event loop on its creator thread.
//! All datapath state is single-threaded; background workers interact with
//! it only through the shared allocator, the locked per-session free-slot
//! stacks, and the background completion queues.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use minstant::Instant;
use tracing::{debug, info, trace, warn};

use crate::alloc::MAX_CLASS_SIZE;
use crate::broker::{BgWorkItem, Broker, HandlerEntry, HandlerKind, ReqHandlerFn};
use crate::buffer::{MsgAllocator, MsgBuffer};
use crate::error::{Error, Result};
use crate::packet::{PktHdr, PktType, MAX_MSG_SIZE_FIELD, MAX_PKT_NUM, PKT_HDR_SIZE};
use crate::session::{
    Session, SessionRole, SessionState, SessionTable, SSlotState, SESSION_REQ_WINDOW,
};
use crate::sm::{SessionEndpoint, SmErrType, SmEvent, SmEventType, SmPkt, SmPktType};
use crate::transport::{RxDesc, Transport, TxBurstItem};

/// A client continuation, invoked once with the completed response.
pub type Continuation = Box<dyn FnOnce(RespHandle) + Send + 'static>;

/// The user's session-management callback.
pub type SmHandler = Box<dyn FnMut(SmEvent) + 'static>;

/// Identifies one request incarnation in one slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotToken {
    pub(crate) session_num: u16,
    pub(crate) sslot_idx: usize,
    pub(crate) req_num: u64,
}

/// Error returned by `enqueue_request`, handing the request buffer back.
pub struct EnqueueError {
    pub error: Error,
    pub msg_buffer: MsgBuffer,
}

impl fmt::Debug for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnqueueError({:?})", self.error)
    }
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl EnqueueError {
    /// Split into the error and the returned request buffer.
    pub fn into_parts(self) -> (Error, MsgBuffer) {
        (self.error, self.msg_buffer)
    }
}

/// Handle for an in-progress request at the server.
///
/// The registered handler reads the request payload, fills in a response
/// (via [`ReqHandle::alloc_response`]), and returns; the runtime enqueues
/// the response. Handlers that need more than a few microseconds should be
/// registered as [`HandlerKind::Background`].
pub struct ReqHandle {
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
    req_msgbuf: Option<MsgBuffer>,
    resp_msgbuf: Option<MsgBuffer>,
    alloc: Arc<MsgAllocator>,
    max_data_per_pkt: usize,
}

impl ReqHandle {
    /// The request type from the packet header.
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// The request payload.
    ///
    /// For foreground handlers of single-packet requests this aliases the
    /// transport's receive ring and is valid only until the handler returns.
    #[inline]
    pub fn req(&self) -> &[u8] {
        self.req_msgbuf.as_ref().map(|m| m.data()).unwrap_or(&[])
    }

    /// Allocate the response buffer for up to `max_data_size` bytes and
    /// return it for filling. Returns `None` on allocator exhaustion.
    pub fn alloc_response(&mut self, max_data_size: usize) -> Option<&mut MsgBuffer> {
        if let Some(old) = self.resp_msgbuf.take() {
            self.alloc.bury(old);
        }
        let buf = self
            .alloc
            .alloc_msg_buffer(max_data_size, self.max_data_per_pkt)?;
        self.resp_msgbuf = Some(buf);
        self.resp_msgbuf.as_mut()
    }

    /// The response buffer, if one has been allocated.
    pub fn resp_mut(&mut self) -> Option<&mut MsgBuffer> {
        self.resp_msgbuf.as_mut()
    }

    /// Shrink the response to its final size.
    pub fn resize_response(&mut self, new_data_size: usize) {
        let per_pkt = self.max_data_per_pkt;
        if let Some(resp) = self.resp_msgbuf.as_mut() {
            resp.resize(new_data_size, per_pkt);
        }
    }
}

impl Drop for ReqHandle {
    fn drop(&mut self) {
        if let Some(req) = self.req_msgbuf.take() {
            self.alloc.bury(req);
        }
        if let Some(resp) = self.resp_msgbuf.take() {
            self.alloc.bury(resp);
        }
    }
}

/// Handle for a completed response at the client, passed to the
/// continuation.
///
/// Dropping the handle releases the response: a dynamic receive buffer goes
/// back to the allocator and the slot index returns to the session's free
/// stack (safe from any thread). For single-packet responses delivered to
/// foreground continuations the payload aliases the transport's receive
/// ring and must be copied out before the continuation returns.
pub struct RespHandle {
    resp_msgbuf: Option<MsgBuffer>,
    req_msgbuf: Option<MsgBuffer>,
    tag: u64,
    sslot_idx: usize,
    alloc: Arc<MsgAllocator>,
    free_slots: Arc<Mutex<Vec<usize>>>,
}

impl RespHandle {
    /// The response payload.
    #[inline]
    pub fn resp(&self) -> &[u8] {
        self.resp_msgbuf.as_ref().map(|m| m.data()).unwrap_or(&[])
    }

    /// The tag given at `enqueue_request`.
    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Reclaim the request buffer for reuse. If not taken, it is freed to
    /// the allocator on release.
    pub fn take_req_msg_buffer(&mut self) -> Option<MsgBuffer> {
        self.req_msgbuf.take()
    }

    /// Release the response explicitly (equivalent to dropping the handle).
    pub fn release(self) {}
}

impl Drop for RespHandle {
    fn drop(&mut self) {
        if let Some(resp) = self.resp_msgbuf.take() {
            self.alloc.bury(resp);
        }
        if let Some(req) = self.req_msgbuf.take() {
            self.alloc.bury(req);
        }
        self.free_slots.lock().unwrap().push(self.sslot_idx);
    }
}

/// Datapath statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DpathStats {
    pub ev_loop_calls: u64,
    pub rx_pkts: u64,
    pub tx_req_pkts: u64,
    pub tx_resp_pkts: u64,
    pub tx_cr_pkts: u64,
    pub tx_rfr_pkts: u64,
    pub retransmits: u64,
    pub dropped_bad_hdr: u64,
    pub dropped_stale: u64,
    pub dropped_unknown_session: u64,
    pub tx_faults_dropped: u64,
}

/// Injectable faults.
#[derive(Default)]
struct Faults {
    /// Fail routing-info resolution for subsequent connect responses.
    resolve_rinfo_fail: bool,
    /// Drop one local TX packet after a countdown.
    drop_tx_local: bool,
    drop_tx_countdown: u64,
}

/// Work deferred out of the RX dispatch borrow scope.
enum Deferred {
    Handler { func: ReqHandlerFn, handle: ReqHandle },
    Cont { cont: Continuation, resp: RespHandle, token: SlotToken },
}

/// A per-thread RPC endpoint over transport `T`.
pub struct Rpc<T: Transport> {
    broker: Arc<Broker>,
    endpoint_id: u8,
    phy_port: u8,
    #[allow(dead_code)]
    numa_node: usize,
    creator_thread: ThreadId,

    transport: RefCell<T>,
    alloc: Arc<MsgAllocator>,
    local_routing_blob: Vec<u8>,

    sessions: RefCell<SessionTable<T::RoutingInfo>>,
    req_handlers: HashMap<u8, HandlerEntry>,
    unknown_req_handler: ReqHandlerFn,
    sm_handler: RefCell<SmHandler>,
    sm_inbox: Receiver<SmPkt>,

    /// Slots with queued-incomplete TX, drained each loop pass.
    req_txq: RefCell<VecDeque<(u16, usize)>>,
    /// Deferred transmit batch, flushed at `kPostlist` or end of pass.
    tx_batch: RefCell<Vec<TxBurstItem<T::RoutingInfo>>>,
    /// Scratch header-only buffer for immediate CR/RFR bursts; aliases
    /// `ctrl_backing`, which pins the bytes for the endpoint's lifetime.
    ctrl_msgbuf: RefCell<MsgBuffer>,
    #[allow(dead_code)]
    ctrl_backing: Box<[u8; 64]>,

    /// Responses completed by background handlers.
    bg_resp_rx: Receiver<ReqHandle>,
    bg_resp_tx: Sender<ReqHandle>,
    /// Continuations completed by background workers.
    bg_cont_rx: Receiver<SlotToken>,
    bg_cont_tx: Sender<SlotToken>,

    prev_epoch_ts: Cell<Instant>,
    faults: RefCell<Faults>,
    stats: RefCell<DpathStats>,
}

impl<T: Transport> Rpc<T> {
    /// Duration of a packet-loss detection epoch.
    pub const PKT_LOSS_EPOCH_MS: u64 = 50;

    /// Inactivity after which a slot's request is suspected lost.
    pub const PKT_LOSS_TIMEOUT_MS: u64 = 500;

    /// Initial reservation of the hugepage allocator.
    pub const INITIAL_HUGE_ALLOC_SIZE: usize = 128 * 1024 * 1024;

    /// Wallclock timeout for an unanswered connect.
    pub const SM_TIMEOUT_MS: u64 = 5000;

    /// Maximum message data size for this transport: the largest size class
    /// must fit the payload plus one header slot per packet.
    pub fn max_msg_size() -> usize {
        MAX_CLASS_SIZE - (MAX_CLASS_SIZE / T::MAX_DATA_PER_PKT) * PKT_HDR_SIZE
    }

    /// Maximum data bytes per packet for this transport.
    pub fn max_data_per_pkt() -> usize {
        T::MAX_DATA_PER_PKT
    }

    /// Construct an endpoint on the calling thread.
    ///
    /// `endpoint_id` must be unique on the host; the SM callback receives
    /// connect/disconnect events. Request handlers are copied from the
    /// broker's registry at this point.
    pub fn new<F>(
        broker: &Arc<Broker>,
        endpoint_id: u8,
        sm_handler: F,
        phy_port: u8,
        numa_node: usize,
    ) -> Result<Self>
    where
        F: FnMut(SmEvent) + 'static,
    {
        // The header's size and packet-number fields must cover the largest
        // message the allocator can back.
        assert!(Self::max_msg_size() <= MAX_MSG_SIZE_FIELD);
        assert!((MAX_PKT_NUM as usize) * T::MAX_DATA_PER_PKT >= Self::max_msg_size());

        let transport = T::open(phy_port, numa_node)?;
        let local_routing_blob = T::serialize_routing_info(&transport.routing_info());

        let alloc = Arc::new(MsgAllocator::new(Self::INITIAL_HUGE_ALLOC_SIZE)?);

        // The header-only scratch buffer lives outside the allocator so
        // buffer accounting reflects user-visible allocations only.
        let mut ctrl_backing = Box::new([0u8; 64]);
        let ctrl_msgbuf = MsgBuffer::fake_from_rx(ctrl_backing.as_mut_ptr(), 0);

        let sm_inbox = broker.register_endpoint(endpoint_id)?;
        let (bg_resp_tx, bg_resp_rx) = unbounded();
        let (bg_cont_tx, bg_cont_rx) = unbounded();

        info!(endpoint_id, uri = broker.uri(), "endpoint created");

        Ok(Self {
            broker: broker.clone(),
            endpoint_id,
            phy_port,
            numa_node,
            creator_thread: std::thread::current().id(),
            transport: RefCell::new(transport),
            alloc,
            local_routing_blob,
            sessions: RefCell::new(SessionTable::new()),
            req_handlers: broker.handler_snapshot(),
            unknown_req_handler: Arc::new(|_: &mut ReqHandle| {}),
            sm_handler: RefCell::new(Box::new(sm_handler)),
            sm_inbox,
            req_txq: RefCell::new(VecDeque::new()),
            tx_batch: RefCell::new(Vec::with_capacity(T::POSTLIST)),
            ctrl_msgbuf: RefCell::new(ctrl_msgbuf),
            ctrl_backing,
            bg_resp_rx,
            bg_resp_tx,
            bg_cont_rx,
            bg_cont_tx,
            prev_epoch_ts: Cell::new(Instant::now()),
            faults: RefCell::new(Faults::default()),
            stats: RefCell::new(DpathStats::default()),
        })
    }

    /// This endpoint's id.
    #[inline]
    pub fn endpoint_id(&self) -> u8 {
        self.endpoint_id
    }

    /// A snapshot of the datapath statistics.
    pub fn dpath_stats(&self) -> DpathStats {
        *self.stats.borrow()
    }

    /// The shared message-buffer allocator.
    pub fn allocator(&self) -> &Arc<MsgAllocator> {
        &self.alloc
    }

    // -------------------------------------------------------------------
    // MsgBuffer management
    // -------------------------------------------------------------------

    /// Allocate a message buffer for up to `max_data_size` payload bytes.
    /// Returns `None` when the allocator is out of memory.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> Option<MsgBuffer> {
        self.alloc.alloc_msg_buffer(max_data_size, T::MAX_DATA_PER_PKT)
    }

    /// Free a message buffer created by [`Rpc::alloc_msg_buffer`].
    pub fn free_msg_buffer(&self, msg_buffer: MsgBuffer) {
        self.alloc.free_msg_buffer(msg_buffer);
    }

    /// Shrink a message buffer's data size. Does not touch packet headers.
    pub fn resize_msg_buffer(&self, msg_buffer: &mut MsgBuffer, new_data_size: usize) -> Result<()> {
        if new_data_size > msg_buffer.max_data_size() {
            return Err(Error::BadArg("resize beyond buffer capacity"));
        }
        msg_buffer.resize(new_data_size, T::MAX_DATA_PER_PKT);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Session management API
    // -------------------------------------------------------------------

    /// Create a client session to `remote_hostname` (a broker URI) and
    /// initiate the connect handshake. Returns the local session number; a
    /// `Connected` or `ConnectFailed` SM event follows.
    pub fn create_session(
        &self,
        remote_hostname: &str,
        remote_endpoint_id: u8,
        remote_phy_port: u8,
    ) -> Result<u16> {
        if remote_hostname.is_empty() {
            return Err(Error::BadArg("empty remote hostname"));
        }

        let local = SessionEndpoint {
            hostname: self.broker.uri().to_string(),
            endpoint_id: self.endpoint_id,
            phy_port: self.phy_port,
            session_num: 0,
            routing: self.local_routing_blob.clone(),
        };
        let remote = SessionEndpoint {
            hostname: remote_hostname.to_string(),
            endpoint_id: remote_endpoint_id,
            phy_port: remote_phy_port,
            session_num: 0,
            routing: Vec::new(),
        };

        let token: u64 = rand::random();
        let mut session = Session::new(SessionRole::Client, local, remote, token);
        session.state = SessionState::ConnectInProgress;
        session.sm_start = Instant::now();

        let session_num = {
            let mut sessions = self.sessions.borrow_mut();
            let num = sessions
                .insert(session)
                .ok_or(Error::BadArg("session limit reached"))?;
            let sess = sessions.get(num).unwrap();
            let pkt = SmPkt {
                kind: SmPktType::ConnectReq,
                err: SmErrType::NoError,
                token,
                fault_arg: 0,
                client: sess.local.clone(),
                server: sess.remote.clone(),
            };
            self.broker.enqueue_sm(pkt);
            num
        };

        debug!(session_num, remote = remote_hostname, "connect initiated");
        Ok(session_num)
    }

    /// Disconnect and destroy a client session. Pending requests drain
    /// first; the `Disconnected` SM event fires when the handshake
    /// completes.
    pub fn destroy_session(&self, session_num: u16) -> Result<()> {
        let mut sessions = self.sessions.borrow_mut();
        let sess = sessions
            .get_mut(session_num)
            .ok_or(Error::NoSuchSession(session_num))?;
        if !sess.is_client() {
            return Err(Error::BadArg("not a client session"));
        }
        if sess.state != SessionState::Connected {
            return Err(Error::SessionNotConnected(session_num));
        }
        sess.state = SessionState::DisconnectInProgress;
        debug!(session_num, "disconnect initiated");
        Ok(())
    }

    /// Number of sessions (client and server side) currently active.
    pub fn num_active_sessions(&self) -> usize {
        self.sessions.borrow().active_count()
    }

    /// Available credits of a session. Test and debugging aid.
    pub fn session_credits(&self, session_num: u16) -> Result<usize> {
        self.sessions
            .borrow()
            .get(session_num)
            .map(|s| s.credits)
            .ok_or(Error::NoSuchSession(session_num))
    }

    /// Connection state of a session. Test and debugging aid.
    pub fn session_state(&self, session_num: u16) -> Result<SessionState> {
        self.sessions
            .borrow()
            .get(session_num)
            .map(|s| s.state)
            .ok_or(Error::NoSuchSession(session_num))
    }

    // -------------------------------------------------------------------
    // Datapath API
    // -------------------------------------------------------------------

    /// Enqueue a request on a connected session.
    ///
    /// On success the endpoint owns `msg_buffer` until the continuation
    /// fires; the buffer comes back through the [`RespHandle`]. On failure
    /// the buffer is returned inside the error.
    pub fn enqueue_request<F>(
        &self,
        session_num: u16,
        req_type: u8,
        msg_buffer: MsgBuffer,
        cont: F,
        tag: u64,
    ) -> std::result::Result<(), EnqueueError>
    where
        F: FnOnce(RespHandle) + Send + 'static,
    {
        self.enqueue_request_inner(session_num, req_type, msg_buffer, Box::new(cont), tag, false)
    }

    /// Like [`Rpc::enqueue_request`], but the continuation runs on a
    /// background worker thread.
    pub fn enqueue_request_bg_cont<F>(
        &self,
        session_num: u16,
        req_type: u8,
        msg_buffer: MsgBuffer,
        cont: F,
        tag: u64,
    ) -> std::result::Result<(), EnqueueError>
    where
        F: FnOnce(RespHandle) + Send + 'static,
    {
        self.enqueue_request_inner(session_num, req_type, msg_buffer, Box::new(cont), tag, true)
    }

    fn enqueue_request_inner(
        &self,
        session_num: u16,
        req_type: u8,
        mut msg_buffer: MsgBuffer,
        cont: Continuation,
        tag: u64,
        cont_bg: bool,
    ) -> std::result::Result<(), EnqueueError> {
        let fail = |error, msg_buffer| Err(EnqueueError { error, msg_buffer });

        if !msg_buffer.is_dynamic() || !msg_buffer.check_magic() {
            return fail(Error::BadArg("invalid request buffer"), msg_buffer);
        }
        if msg_buffer.data_size() > Self::max_msg_size() {
            return fail(
                Error::MsgBufTooLarge {
                    size: msg_buffer.data_size(),
                    max: Self::max_msg_size(),
                },
                msg_buffer,
            );
        }

        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(session_num) else {
            drop(sessions);
            return fail(Error::NoSuchSession(session_num), msg_buffer);
        };
        if !sess.is_client() || !sess.is_connected() {
            drop(sessions);
            return fail(Error::SessionNotConnected(session_num), msg_buffer);
        }
        let Some(sslot_idx) = sess.alloc_sslot() else {
            drop(sessions);
            return fail(Error::NoSlotAvailable, msg_buffer);
        };

        msg_buffer.set_pkts_queued(0);
        let slot = &mut sess.slots[sslot_idx];
        slot.state = SSlotState::Idle;
        slot.start_request(req_type, tag, cont, cont_bg);
        slot.tx_msgbuf = Some(msg_buffer);
        slot.rx_msgbuf = None;
        slot.in_txq = true;

        self.req_txq.borrow_mut().push_back((session_num, sslot_idx));
        Ok(())
    }

    /// Enqueue a response for transmission at the server.
    ///
    /// Called by the runtime when a handler returns; public for symmetry
    /// with the rest of the datapath API.
    pub fn enqueue_response(&self, mut req_handle: ReqHandle) {
        // The server's copy of the request is no longer needed.
        if let Some(req) = req_handle.req_msgbuf.take() {
            self.alloc.bury(req);
        }

        let mut resp = match req_handle.resp_msgbuf.take() {
            Some(resp) => resp,
            // No response filled in (or unknown request type): answer with
            // an empty error response.
            None => match self.alloc.alloc_msg_buffer(0, T::MAX_DATA_PER_PKT) {
                Some(resp) => resp,
                None => {
                    warn!("allocator exhausted; dropping response");
                    return;
                }
            },
        };

        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(req_handle.session_num) else {
            drop(sessions);
            self.alloc.bury(resp);
            return;
        };
        let slot = &mut sess.slots[req_handle.sslot_idx];
        if slot.req_num != req_handle.req_num {
            // The request was superseded while the handler ran.
            drop(sessions);
            self.alloc.bury(resp);
            return;
        }

        resp.set_pkts_queued(0);
        slot.tx_msgbuf = Some(resp);
        slot.state = SSlotState::RespTxPending;
        slot.touch();
        if !slot.in_txq {
            slot.in_txq = true;
            self.req_txq
                .borrow_mut()
                .push_back((req_handle.session_num, req_handle.sslot_idx));
        }
    }

    /// Release a response from a continuation: frees the receive buffer and
    /// returns the slot to the session. Equivalent to dropping the handle.
    pub fn release_response(&self, resp_handle: RespHandle) {
        drop(resp_handle);
    }

    // -------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------

    /// Run one iteration of the event loop: SM processing, TX draining,
    /// RX dispatch, background-completion draining, and the periodic loss
    /// scan.
    pub fn run_event_loop_once(&self) {
        self.stats.borrow_mut().ev_loop_calls += 1;
        self.handle_sm();
        self.process_req_txq();
        self.process_comps();
        self.process_bg_queues();
        self.pkt_loss_scan();
    }

    /// Run the event loop forever.
    pub fn run_event_loop_forever(&self) -> ! {
        loop {
            self.run_event_loop_once();
        }
    }

    /// Busy-poll the event loop for `ms` milliseconds.
    pub fn run_event_loop_timeout(&self, ms: u64) {
        let start = Instant::now();
        let dur = Duration::from_millis(ms);
        while start.elapsed() < dur {
            self.run_event_loop_once();
        }
    }

    // -------------------------------------------------------------------
    // Session management processing
    // -------------------------------------------------------------------

    fn handle_sm(&self) {
        let mut events: Vec<SmEvent> = Vec::new();

        while let Ok(pkt) = self.sm_inbox.try_recv() {
            match pkt.kind {
                SmPktType::ConnectReq => self.handle_connect_req(pkt),
                SmPktType::ConnectResp => self.handle_connect_resp(pkt, &mut events),
                SmPktType::DisconnectReq => self.handle_disconnect_req(pkt),
                SmPktType::DisconnectResp => self.handle_disconnect_resp(pkt, &mut events),
                SmPktType::FaultResetPeer => self.handle_fault_reset_peer(pkt, &mut events),
                SmPktType::FaultDropTxRemote => {
                    let mut faults = self.faults.borrow_mut();
                    faults.drop_tx_local = true;
                    faults.drop_tx_countdown = pkt.fault_arg;
                }
            }
        }

        self.check_sm_timeouts(&mut events);
        self.process_disconnect_requests();

        // Callbacks run with no internal borrows held; they may re-enter
        // the session management API.
        let mut handler = self.sm_handler.borrow_mut();
        for ev in events {
            (*handler)(ev);
        }
    }

    fn handle_connect_req(&self, pkt: SmPkt) {
        let mut sessions = self.sessions.borrow_mut();

        let routing = match T::resolve_routing_info(&pkt.client.routing) {
            Ok(r) => r,
            Err(_) => {
                drop(sessions);
                warn!("connect request with unresolvable routing info");
                self.broker.enqueue_sm(
                    pkt.response(SmPktType::ConnectResp, SmErrType::RoutingResolutionFailed),
                );
                return;
            }
        };

        let local = SessionEndpoint {
            hostname: self.broker.uri().to_string(),
            endpoint_id: self.endpoint_id,
            phy_port: self.phy_port,
            session_num: 0,
            routing: self.local_routing_blob.clone(),
        };
        let mut session = Session::new(SessionRole::Server, local, pkt.client.clone(), pkt.token);
        session.state = SessionState::Connected;
        session.routing = Some(routing);

        let Some(session_num) = sessions.insert(session) else {
            drop(sessions);
            self.broker
                .enqueue_sm(pkt.response(SmPktType::ConnectResp, SmErrType::TooManySessions));
            return;
        };

        let server_endpoint = sessions.get(session_num).unwrap().local.clone();
        drop(sessions);

        info!(session_num, client = %pkt.client.hostname, "accepted session");
        let mut resp = pkt.response(SmPktType::ConnectResp, SmErrType::NoError);
        resp.server = server_endpoint;
        self.broker.enqueue_sm(resp);
    }

    fn handle_connect_resp(&self, pkt: SmPkt, events: &mut Vec<SmEvent>) {
        let session_num = pkt.client.session_num;
        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(session_num) else {
            return;
        };
        if sess.state != SessionState::ConnectInProgress || sess.sm_token != pkt.token {
            return;
        }

        if pkt.err != SmErrType::NoError {
            sessions.remove(session_num);
            events.push(SmEvent {
                session_num,
                event: SmEventType::ConnectFailed,
                err: pkt.err,
            });
            return;
        }

        let resolve_failed = self.faults.borrow().resolve_rinfo_fail;
        let routing = if resolve_failed {
            Err(Error::BadArg("injected routing resolution failure"))
        } else {
            T::resolve_routing_info(&pkt.server.routing)
        };

        match routing {
            Ok(r) => {
                sess.remote = pkt.server.clone();
                sess.routing = Some(r);
                sess.state = SessionState::Connected;
                info!(session_num, server = %pkt.server.hostname, "session connected");
                events.push(SmEvent {
                    session_num,
                    event: SmEventType::Connected,
                    err: SmErrType::NoError,
                });
            }
            Err(_) => {
                sessions.remove(session_num);
                warn!(session_num, "failed to resolve server routing info");
                events.push(SmEvent {
                    session_num,
                    event: SmEventType::ConnectFailed,
                    err: SmErrType::RoutingResolutionFailed,
                });
            }
        }
    }

    fn handle_disconnect_req(&self, pkt: SmPkt) {
        let session_num = pkt.server.session_num;
        let mut sessions = self.sessions.borrow_mut();
        let token_matches = sessions
            .get(session_num)
            .map(|s| s.sm_token == pkt.token)
            .unwrap_or(false);
        if token_matches {
            if let Some(session) = sessions.remove(session_num) {
                self.bury_session(*session);
            }
            debug!(session_num, "server session reaped");
        }
        drop(sessions);
        self.broker
            .enqueue_sm(pkt.response(SmPktType::DisconnectResp, SmErrType::NoError));
    }

    fn handle_disconnect_resp(&self, pkt: SmPkt, events: &mut Vec<SmEvent>) {
        let session_num = pkt.client.session_num;
        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get(session_num) else {
            return;
        };
        if sess.state != SessionState::DisconnectInProgress {
            return;
        }
        if let Some(session) = sessions.remove(session_num) {
            self.bury_session(*session);
        }
        events.push(SmEvent {
            session_num,
            event: SmEventType::Disconnected,
            err: SmErrType::NoError,
        });
    }

    fn handle_fault_reset_peer(&self, pkt: SmPkt, events: &mut Vec<SmEvent>) {
        let session_num = pkt.server.session_num;
        let mut sessions = self.sessions.borrow_mut();
        if let Some(session) = sessions.remove(session_num) {
            self.bury_session(*session);
            warn!(session_num, "session torn down by injected peer reset");
            events.push(SmEvent {
                session_num,
                event: SmEventType::Disconnected,
                err: SmErrType::NoError,
            });
        }
    }

    fn check_sm_timeouts(&self, events: &mut Vec<SmEvent>) {
        let mut timed_out: Vec<u16> = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            for sess in sessions.iter_mut() {
                if sess.is_client()
                    && sess.state == SessionState::ConnectInProgress
                    && sess.sm_start.elapsed() >= Duration::from_millis(Self::SM_TIMEOUT_MS)
                {
                    timed_out.push(sess.local.session_num);
                }
            }
            for num in &timed_out {
                sessions.remove(*num);
            }
        }
        for session_num in timed_out {
            warn!(session_num, "connect timed out");
            events.push(SmEvent {
                session_num,
                event: SmEventType::ConnectFailed,
                err: SmErrType::ConnectTimeout,
            });
        }
    }

    /// Send the disconnect request once a disconnecting session has
    /// drained all of its slots.
    fn process_disconnect_requests(&self) {
        let mut sessions = self.sessions.borrow_mut();
        for sess in sessions.iter_mut() {
            if sess.is_client()
                && sess.state == SessionState::DisconnectInProgress
                && !sess.disconnect_sent
                && sess.drained()
            {
                sess.disconnect_sent = true;
                let pkt = SmPkt {
                    kind: SmPktType::DisconnectReq,
                    err: SmErrType::NoError,
                    token: sess.sm_token,
                    fault_arg: 0,
                    client: sess.local.clone(),
                    server: sess.remote.clone(),
                };
                self.broker.enqueue_sm(pkt);
            }
        }
    }

    /// Free every buffer a reaped session still holds.
    fn bury_session(&self, mut session: Session<T::RoutingInfo>) {
        for slot in &mut session.slots {
            if let Some(tx) = slot.tx_msgbuf.take() {
                self.alloc.bury(tx);
            }
            if let Some(rx) = slot.rx_msgbuf.take() {
                self.alloc.bury(rx);
            }
        }
    }

    // -------------------------------------------------------------------
    // TX path
    // -------------------------------------------------------------------

    /// Consult the drop-TX fault for the next datapath packet.
    fn fault_should_drop(&self) -> bool {
        let mut faults = self.faults.borrow_mut();
        if !faults.drop_tx_local {
            return false;
        }
        if faults.drop_tx_countdown == 0 {
            faults.drop_tx_local = false;
            self.stats.borrow_mut().tx_faults_dropped += 1;
            debug!("dropping one TX packet (injected fault)");
            true
        } else {
            faults.drop_tx_countdown -= 1;
            false
        }
    }

    /// Queue one data packet into the deferred burst, flushing at
    /// `kPostlist`.
    fn enqueue_pkt(
        &self,
        routing: T::RoutingInfo,
        msgbuf: *const MsgBuffer,
        offset: usize,
        data_bytes: usize,
    ) {
        let drop = self.fault_should_drop();
        let mut batch = self.tx_batch.borrow_mut();
        batch.push(TxBurstItem {
            routing,
            msgbuf,
            offset,
            data_bytes,
            drop,
        });
        if batch.len() == T::POSTLIST {
            self.transport.borrow_mut().tx_burst(&batch);
            batch.clear();
        }
    }

    /// Flush any deferred burst items.
    fn flush_tx_batch(&self) {
        let mut batch = self.tx_batch.borrow_mut();
        if !batch.is_empty() {
            self.transport.borrow_mut().tx_burst(&batch);
            batch.clear();
        }
    }

    /// Transmit a header-only control packet immediately, together with any
    /// deferred items so wire order is preserved. Control packets bypass
    /// the TX fault.
    fn tx_ctrl_now(&self, routing: T::RoutingInfo, hdr: &PktHdr) {
        let mut ctrl = self.ctrl_msgbuf.borrow_mut();
        ctrl.write_pkthdr(0, hdr);
        let mut batch = self.tx_batch.borrow_mut();
        batch.push(TxBurstItem {
            routing,
            msgbuf: &*ctrl as *const MsgBuffer,
            offset: 0,
            data_bytes: 0,
            drop: false,
        });
        self.transport.borrow_mut().tx_burst(&batch);
        batch.clear();
    }

    /// Transmit one data packet of `msgbuf` immediately.
    fn tx_data_pkt_now(&self, routing: T::RoutingInfo, msgbuf: &MsgBuffer, pkt_idx: usize) {
        let data_bytes = msgbuf.pkt_data_len(pkt_idx, T::MAX_DATA_PER_PKT);
        self.enqueue_pkt(
            routing,
            msgbuf as *const MsgBuffer,
            pkt_idx * T::MAX_DATA_PER_PKT,
            data_bytes,
        );
        self.flush_tx_batch();
    }

    /// Walk the request TX queue, transmitting as many packets as credits
    /// and the burst budget allow. Slots leave the queue once fully queued.
    fn process_req_txq(&self) {
        let queued = self.req_txq.borrow().len();
        if queued == 0 {
            return;
        }

        let mut sessions = self.sessions.borrow_mut();
        for _ in 0..queued {
            let Some((session_num, sslot_idx)) = self.req_txq.borrow_mut().pop_front() else {
                break;
            };
            let Some(sess) = sessions.get_mut(session_num) else {
                continue; // session reaped with the slot in queue
            };

            let done = if sess.is_client() {
                let single = sess.slots[sslot_idx]
                    .tx_msgbuf
                    .as_ref()
                    .map(|m| m.num_pkts() == 1)
                    .unwrap_or(true);
                if single {
                    self.process_req_txq_small_one(sess, sslot_idx)
                } else {
                    self.process_req_txq_large_one(sess, sslot_idx)
                }
            } else {
                self.process_resp_txq_one(sess, sslot_idx)
            };

            if done {
                if let Some(sess) = sessions.get_mut(session_num) {
                    sess.slots[sslot_idx].in_txq = false;
                }
            } else {
                self.req_txq.borrow_mut().push_back((session_num, sslot_idx));
            }
        }

        // The flush must happen while the session borrow pins the buffers
        // the batch items point into.
        self.flush_tx_batch();
        drop(sessions);
    }

    /// Fast path: single-packet request. Returns true when the slot is done
    /// with the queue.
    fn process_req_txq_small_one(
        &self,
        sess: &mut Session<T::RoutingInfo>,
        sslot_idx: usize,
    ) -> bool {
        if !sess.has_credits() {
            return false;
        }
        let Some(routing) = sess.routing.clone() else {
            return false;
        };
        let remote_session = sess.remote.session_num;

        let slot = &mut sess.slots[sslot_idx];
        let Some(msgbuf) = slot.tx_msgbuf.as_mut() else {
            return true;
        };
        if msgbuf.pkts_queued() == 1 {
            return true;
        }

        let hdr = PktHdr::new(
            slot.req_type,
            msgbuf.data_size(),
            remote_session,
            PktType::Req,
            0,
            slot.req_num,
        );
        msgbuf.write_pkthdr(0, &hdr);
        let data_bytes = msgbuf.data_size();
        let ptr = msgbuf as *const MsgBuffer;
        msgbuf.bump_pkts_queued();

        slot.state = SSlotState::AwaitingResp;
        slot.touch();

        sess.consume_credit();
        self.enqueue_pkt(routing, ptr, 0, data_bytes);
        self.stats.borrow_mut().tx_req_pkts += 1;
        true
    }

    /// Slow path: multi-packet request. Queues as many packets as credits
    /// allow.
    fn process_req_txq_large_one(
        &self,
        sess: &mut Session<T::RoutingInfo>,
        sslot_idx: usize,
    ) -> bool {
        let Some(routing) = sess.routing.clone() else {
            return false;
        };
        let remote_session = sess.remote.session_num;
        let mut credits = sess.credits;

        let mut queued_now: Vec<(usize, usize)> = Vec::new(); // (pkt_idx, data_bytes)
        let all_queued;
        {
            let slot = &mut sess.slots[sslot_idx];
            let Some(msgbuf) = slot.tx_msgbuf.as_mut() else {
                return true;
            };

            while msgbuf.pkts_queued() < msgbuf.num_pkts() && credits > 0 {
                let pkt_idx = msgbuf.pkts_queued();
                let hdr = PktHdr::new(
                    slot.req_type,
                    msgbuf.data_size(),
                    remote_session,
                    PktType::Req,
                    pkt_idx as u16,
                    slot.req_num,
                );
                msgbuf.write_pkthdr(pkt_idx, &hdr);
                queued_now.push((pkt_idx, msgbuf.pkt_data_len(pkt_idx, T::MAX_DATA_PER_PKT)));
                msgbuf.bump_pkts_queued();
                credits -= 1;
            }
            all_queued = msgbuf.pkts_queued() == msgbuf.num_pkts();
            if !queued_now.is_empty() {
                slot.touch();
            }
            if all_queued {
                slot.state = SSlotState::AwaitingResp;
            }
        }

        if !queued_now.is_empty() {
            let n = queued_now.len();
            let msgbuf_ptr = sess.slots[sslot_idx].tx_msgbuf.as_ref().unwrap() as *const MsgBuffer;
            for (pkt_idx, data_bytes) in queued_now {
                self.enqueue_pkt(
                    routing.clone(),
                    msgbuf_ptr,
                    pkt_idx * T::MAX_DATA_PER_PKT,
                    data_bytes,
                );
            }
            sess.credits -= n;
            self.stats.borrow_mut().tx_req_pkts += n as u64;
        }

        all_queued
    }

    /// Server response TX: only the first packet goes through the queue;
    /// the rest are pulled by RFRs.
    fn process_resp_txq_one(&self, sess: &mut Session<T::RoutingInfo>, sslot_idx: usize) -> bool {
        let Some(routing) = sess.routing.clone() else {
            return false;
        };
        let remote_session = sess.remote.session_num;

        let slot = &mut sess.slots[sslot_idx];
        let Some(msgbuf) = slot.tx_msgbuf.as_mut() else {
            return true;
        };
        if msgbuf.pkts_queued() > 0 {
            return true;
        }

        let hdr = PktHdr::new(
            slot.req_type,
            msgbuf.data_size(),
            remote_session,
            PktType::Resp,
            0,
            slot.req_num,
        );
        msgbuf.write_pkthdr(0, &hdr);
        let data_bytes = msgbuf.pkt_data_len(0, T::MAX_DATA_PER_PKT);
        let single = msgbuf.num_pkts() == 1;
        let ptr = msgbuf as *const MsgBuffer;
        msgbuf.bump_pkts_queued();

        slot.state = if single {
            SSlotState::Complete
        } else {
            SSlotState::RespTxPending
        };
        slot.touch();

        self.enqueue_pkt(routing, ptr, 0, data_bytes);
        self.stats.borrow_mut().tx_resp_pkts += 1;
        true
    }

    // -------------------------------------------------------------------
    // Background completion queues
    // -------------------------------------------------------------------

    fn process_bg_queues(&self) {
        while let Ok(handle) = self.bg_resp_rx.try_recv() {
            self.enqueue_response(handle);
        }
        while let Ok(token) = self.bg_cont_rx.try_recv() {
            self.finalize_cont_slot(token);
        }
    }

    /// Once a continuation has returned, move its slot out of `Complete`.
    fn finalize_cont_slot(&self, token: SlotToken) {
        let mut sessions = self.sessions.borrow_mut();
        if let Some(sess) = sessions.get_mut(token.session_num) {
            let slot = &mut sess.slots[token.sslot_idx];
            if slot.req_num == token.req_num && slot.state == SSlotState::Complete {
                slot.state = SSlotState::Idle;
            }
        }
    }

    // -------------------------------------------------------------------
    // RX path
    // -------------------------------------------------------------------

    /// Poll the receive ring and dispatch a batch, then repost exactly the
    /// drained count so the ring depth is preserved.
    fn process_comps(&self) {
        let mut descs: Vec<RxDesc> = Vec::with_capacity(T::POSTLIST);
        let n = self
            .transport
            .borrow_mut()
            .rx_burst(T::POSTLIST, &mut descs);
        if n == 0 {
            return;
        }
        self.stats.borrow_mut().rx_pkts += n as u64;

        let mut deferred: Vec<Deferred> = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            for desc in &descs {
                self.process_comps_one(&mut sessions, desc, &mut deferred);
            }
        }

        // Handlers and continuations run outside every internal borrow, and
        // before the ring slots they may alias are reposted.
        for d in deferred {
            match d {
                Deferred::Handler { func, mut handle } => {
                    func(&mut handle);
                    self.enqueue_response(handle);
                }
                Deferred::Cont { cont, resp, token } => {
                    cont(resp);
                    self.finalize_cont_slot(token);
                }
            }
        }

        self.transport.borrow_mut().post_recvs(n);
    }

    fn process_comps_one(
        &self,
        sessions: &mut SessionTable<T::RoutingInfo>,
        desc: &RxDesc,
        deferred: &mut Vec<Deferred>,
    ) {
        if desc.len < PKT_HDR_SIZE {
            self.stats.borrow_mut().dropped_bad_hdr += 1;
            return;
        }
        let hdr = unsafe { PktHdr::read_from(desc.ptr) };
        if hdr.validate().is_err() {
            self.stats.borrow_mut().dropped_bad_hdr += 1;
            return;
        }

        let Some(sess) = sessions.get_mut(hdr.dest_session_num()) else {
            self.stats.borrow_mut().dropped_unknown_session += 1;
            return;
        };
        // Sessions still draining after destroy_session() keep receiving;
        // anything else is a stale or premature packet.
        if sess.state != SessionState::Connected
            && sess.state != SessionState::DisconnectInProgress
        {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }

        match hdr.pkt_type() {
            PktType::ExplCr => self.process_cr(sess, &hdr),
            PktType::Rfr => self.process_rfr(sess, &hdr),
            PktType::Req => self.process_req_pkt(sess, &hdr, desc, deferred),
            PktType::Resp => self.process_resp_pkt(sess, &hdr, desc, deferred),
        }
    }

    /// Explicit credit return at the client.
    fn process_cr(&self, sess: &mut Session<T::RoutingInfo>, hdr: &PktHdr) {
        if !sess.is_client() {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }
        let sslot_idx = (hdr.req_num() % SESSION_REQ_WINDOW as u64) as usize;
        let slot = &mut sess.slots[sslot_idx];
        if slot.req_num != hdr.req_num()
            || !matches!(
                slot.state,
                SSlotState::ReqTxPending | SSlotState::AwaitingResp
            )
        {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }
        let acked = hdr.pkt_num() as usize + 1;
        if acked > slot.req_pkts_acked {
            slot.req_pkts_acked = acked;
        }
        slot.touch();
        sess.bump_credits();
    }

    /// Request-for-response at the server: send (or re-send) the named
    /// response packet.
    fn process_rfr(&self, sess: &mut Session<T::RoutingInfo>, hdr: &PktHdr) {
        if sess.is_client() {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }
        let Some(routing) = sess.routing.clone() else {
            return;
        };
        let sslot_idx = (hdr.req_num() % SESSION_REQ_WINDOW as u64) as usize;
        let slot = &mut sess.slots[sslot_idx];
        if slot.req_num != hdr.req_num() {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }
        let Some(msgbuf) = slot.tx_msgbuf.as_mut() else {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        };

        let requested = hdr.pkt_num() as usize;
        if requested >= msgbuf.num_pkts() {
            self.stats.borrow_mut().dropped_bad_hdr += 1;
            return;
        }

        let remote_session = sess.remote.session_num;
        let retransmit = requested < msgbuf.pkts_queued();
        if !retransmit {
            // Normal pull of the next packet.
            let resp_hdr = PktHdr::new(
                slot.req_type,
                msgbuf.data_size(),
                remote_session,
                PktType::Resp,
                requested as u16,
                slot.req_num,
            );
            msgbuf.write_pkthdr(requested, &resp_hdr);
            msgbuf.set_pkts_queued(requested + 1);
        }
        let complete = msgbuf.pkts_queued() == msgbuf.num_pkts();
        slot.touch();

        let msgbuf_ref: &MsgBuffer = slot.tx_msgbuf.as_ref().unwrap();
        self.tx_data_pkt_now(routing, msgbuf_ref, requested);
        {
            let mut stats = self.stats.borrow_mut();
            stats.tx_resp_pkts += 1;
            if retransmit {
                stats.retransmits += 1;
            }
        }

        let slot = &mut sess.slots[sslot_idx];
        if complete {
            slot.state = SSlotState::Complete;
        }
    }

    /// A request data packet at the server.
    fn process_req_pkt(
        &self,
        sess: &mut Session<T::RoutingInfo>,
        hdr: &PktHdr,
        desc: &RxDesc,
        deferred: &mut Vec<Deferred>,
    ) {
        if sess.is_client() {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }

        let msg_size = hdr.msg_size();
        let num_pkts = PktHdr::calc_num_pkts(msg_size, T::MAX_DATA_PER_PKT);
        let pkt_num = hdr.pkt_num() as usize;
        let pkt_bytes = Self::pkt_bytes_at(msg_size, pkt_num, num_pkts);
        if desc.len < PKT_HDR_SIZE + pkt_bytes {
            self.stats.borrow_mut().dropped_bad_hdr += 1;
            return;
        }

        let sslot_idx = (hdr.req_num() % SESSION_REQ_WINDOW as u64) as usize;
        let expected_new = sess.slots[sslot_idx].expected_new_req_num();

        if hdr.req_num() == expected_new {
            if pkt_num != 0 {
                // A later packet of a request whose first packet we missed;
                // in-order delivery means it cannot be accepted.
                self.stats.borrow_mut().dropped_stale += 1;
                return;
            }
            self.start_new_server_request(sess, sslot_idx, hdr, desc, num_pkts, deferred);
        } else if hdr.req_num() == sess.slots[sslot_idx].req_num && sess.slots[sslot_idx].used {
            self.process_dup_or_followup_req_pkt(sess, sslot_idx, hdr, desc, deferred);
        } else {
            // Older generation (retransmit duplicate) or an impossible gap.
            self.stats.borrow_mut().dropped_stale += 1;
        }
    }

    /// First packet of a new request generation at the server.
    fn start_new_server_request(
        &self,
        sess: &mut Session<T::RoutingInfo>,
        sslot_idx: usize,
        hdr: &PktHdr,
        desc: &RxDesc,
        num_pkts: usize,
        deferred: &mut Vec<Deferred>,
    ) {
        let msg_size = hdr.msg_size();
        let routing = sess.routing.clone();
        let remote_session = sess.remote.session_num;
        let session_num = sess.local.session_num;

        // Retire the previous generation's response.
        {
            let slot = &mut sess.slots[sslot_idx];
            if let Some(old_resp) = slot.tx_msgbuf.take() {
                self.alloc.bury(old_resp);
            }
            if let Some(old_rx) = slot.rx_msgbuf.take() {
                self.alloc.bury(old_rx);
            }
            slot.req_num = hdr.req_num();
            slot.used = true;
            slot.req_type = hdr.req_type();
            slot.pkts_rcvd = 0;
            slot.rx_msg_size = msg_size;
            slot.rx_num_pkts = num_pkts;
            slot.in_txq = false;
            slot.touch();
        }

        if num_pkts == 1 {
            sess.slots[sslot_idx].state = SSlotState::AwaitingResp;
            self.dispatch_req_handler(
                session_num,
                sslot_idx,
                hdr,
                desc,
                msg_size,
                /* rx_msgbuf */ None,
                deferred,
            );
            return;
        }

        // Multi-packet request: set up reassembly and acknowledge the first
        // packet with a credit return.
        let Some(mut rx) = self.alloc.alloc_msg_buffer(msg_size, T::MAX_DATA_PER_PKT) else {
            warn!("allocator exhausted; dropping multi-packet request");
            return;
        };
        let payload = unsafe {
            std::slice::from_raw_parts(desc.ptr.add(PKT_HDR_SIZE), Self::pkt_bytes_at(msg_size, 0, num_pkts))
        };
        rx.data_mut()[..payload.len()].copy_from_slice(payload);

        let slot = &mut sess.slots[sslot_idx];
        slot.rx_msgbuf = Some(rx);
        slot.pkts_rcvd = 1;
        slot.state = SSlotState::ReqTxPending;

        if let Some(routing) = routing {
            let cr = PktHdr::new(
                hdr.req_type(),
                msg_size,
                remote_session,
                PktType::ExplCr,
                0,
                hdr.req_num(),
            );
            self.tx_ctrl_now(routing, &cr);
            self.stats.borrow_mut().tx_cr_pkts += 1;
        }
    }

    /// A current-generation request packet: either the next packet of a
    /// multi-packet request, or a duplicate from a client retransmit.
    fn process_dup_or_followup_req_pkt(
        &self,
        sess: &mut Session<T::RoutingInfo>,
        sslot_idx: usize,
        hdr: &PktHdr,
        desc: &RxDesc,
        deferred: &mut Vec<Deferred>,
    ) {
        let Some(routing) = sess.routing.clone() else {
            return;
        };
        let remote_session = sess.remote.session_num;
        let session_num = sess.local.session_num;
        let pkt_num = hdr.pkt_num() as usize;
        let msg_size = hdr.msg_size();

        let state = sess.slots[sslot_idx].state;
        match state {
            SSlotState::ReqTxPending => {
                // Receiving the request body.
                let (expected, num_pkts) = {
                    let slot = &sess.slots[sslot_idx];
                    (slot.pkts_rcvd, slot.rx_num_pkts)
                };
                if pkt_num == expected {
                    let pkt_bytes = Self::pkt_bytes_at(msg_size, pkt_num, num_pkts);
                    let payload = unsafe {
                        std::slice::from_raw_parts(desc.ptr.add(PKT_HDR_SIZE), pkt_bytes)
                    };
                    let offset = pkt_num * T::MAX_DATA_PER_PKT;
                    let slot = &mut sess.slots[sslot_idx];
                    if let Some(rx) = slot.rx_msgbuf.as_mut() {
                        rx.data_mut()[offset..offset + pkt_bytes].copy_from_slice(payload);
                    }
                    slot.pkts_rcvd += 1;
                    slot.touch();

                    if slot.pkts_rcvd == num_pkts {
                        // Request complete; the first response packet will
                        // acknowledge this final request packet.
                        slot.state = SSlotState::AwaitingResp;
                        let rx = slot.rx_msgbuf.take();
                        self.dispatch_req_handler(
                            session_num, sslot_idx, hdr, desc, msg_size, rx, deferred,
                        );
                    } else {
                        let cr = PktHdr::new(
                            hdr.req_type(),
                            msg_size,
                            remote_session,
                            PktType::ExplCr,
                            pkt_num as u16,
                            hdr.req_num(),
                        );
                        self.tx_ctrl_now(routing, &cr);
                        self.stats.borrow_mut().tx_cr_pkts += 1;
                    }
                } else if pkt_num < expected {
                    // Duplicate: the client lost our credit return.
                    let cr = PktHdr::new(
                        hdr.req_type(),
                        msg_size,
                        remote_session,
                        PktType::ExplCr,
                        pkt_num as u16,
                        hdr.req_num(),
                    );
                    self.tx_ctrl_now(routing, &cr);
                    let mut stats = self.stats.borrow_mut();
                    stats.tx_cr_pkts += 1;
                    stats.retransmits += 1;
                } else {
                    // Out of order within the message; not accepted.
                    self.stats.borrow_mut().dropped_stale += 1;
                }
            }
            SSlotState::AwaitingResp => {
                // Handler still running; the response will restore progress.
                self.stats.borrow_mut().dropped_stale += 1;
            }
            SSlotState::RespTxPending | SSlotState::Complete => {
                // Duplicate of a served request: the client missed the first
                // response packet; re-send it.
                let slot = &mut sess.slots[sslot_idx];
                if let Some(msgbuf) = slot.tx_msgbuf.as_ref() {
                    if msgbuf.pkts_queued() > 0 {
                        slot.touch();
                        let msgbuf_ref: &MsgBuffer = slot.tx_msgbuf.as_ref().unwrap();
                        self.tx_data_pkt_now(routing, msgbuf_ref, 0);
                        let mut stats = self.stats.borrow_mut();
                        stats.tx_resp_pkts += 1;
                        stats.retransmits += 1;
                    }
                }
            }
            SSlotState::Idle => {
                self.stats.borrow_mut().dropped_stale += 1;
            }
        }
    }

    /// Hand a complete request to its handler: inline for foreground
    /// handlers, via the broker's worker pool for background ones.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_req_handler(
        &self,
        session_num: u16,
        sslot_idx: usize,
        hdr: &PktHdr,
        desc: &RxDesc,
        msg_size: usize,
        rx_msgbuf: Option<MsgBuffer>,
        deferred: &mut Vec<Deferred>,
    ) {
        let entry = self.req_handlers.get(&hdr.req_type());
        if entry.is_none() {
            warn!(req_type = hdr.req_type(), "request with unregistered type");
        }

        let background = entry
            .map(|e| e.kind == HandlerKind::Background && self.broker.num_bg_threads() > 0)
            .unwrap_or(false);
        let func = entry
            .map(|e| e.func.clone())
            .unwrap_or_else(|| self.unknown_req_handler.clone());

        let req_msgbuf = match rx_msgbuf {
            Some(rx) => Some(rx), // multi-packet: already a dynamic buffer
            None if background => {
                // Single-packet requests headed to a worker must not alias
                // the receive ring; copy into a dynamic buffer.
                let Some(mut rx) = self.alloc.alloc_msg_buffer(msg_size, T::MAX_DATA_PER_PKT)
                else {
                    warn!("allocator exhausted; dropping request");
                    return;
                };
                let payload =
                    unsafe { std::slice::from_raw_parts(desc.ptr.add(PKT_HDR_SIZE), msg_size) };
                rx.data_mut().copy_from_slice(payload);
                Some(rx)
            }
            None => Some(MsgBuffer::fake_from_rx(desc.ptr, msg_size)),
        };

        let handle = ReqHandle {
            session_num,
            sslot_idx,
            req_num: hdr.req_num(),
            req_type: hdr.req_type(),
            req_msgbuf,
            resp_msgbuf: None,
            alloc: self.alloc.clone(),
            max_data_per_pkt: T::MAX_DATA_PER_PKT,
        };

        if background {
            debug_assert!(handle.req_msgbuf.as_ref().map(|m| m.is_dynamic()).unwrap_or(true));
            let submitted = self.broker.submit_bg(BgWorkItem::Request {
                func,
                handle,
                done: self.bg_resp_tx.clone(),
            });
            if !submitted {
                warn!("background submission failed; request dropped");
            }
        } else {
            deferred.push(Deferred::Handler { func, handle });
        }
    }

    /// A response data packet at the client.
    fn process_resp_pkt(
        &self,
        sess: &mut Session<T::RoutingInfo>,
        hdr: &PktHdr,
        desc: &RxDesc,
        deferred: &mut Vec<Deferred>,
    ) {
        if !sess.is_client() {
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }

        let msg_size = hdr.msg_size();
        let num_pkts = PktHdr::calc_num_pkts(msg_size, T::MAX_DATA_PER_PKT);
        let pkt_num = hdr.pkt_num() as usize;
        let pkt_bytes = Self::pkt_bytes_at(msg_size, pkt_num, num_pkts);
        if pkt_num >= num_pkts || desc.len < PKT_HDR_SIZE + pkt_bytes {
            self.stats.borrow_mut().dropped_bad_hdr += 1;
            return;
        }

        let sslot_idx = (hdr.req_num() % SESSION_REQ_WINDOW as u64) as usize;
        {
            let slot = &sess.slots[sslot_idx];
            if slot.req_num != hdr.req_num()
                || !matches!(
                    slot.state,
                    SSlotState::AwaitingResp | SSlotState::RespTxPending
                )
            {
                self.stats.borrow_mut().dropped_stale += 1;
                return;
            }
        }

        // Every response packet acknowledges one in-flight request-side
        // packet.
        sess.bump_credits();

        if num_pkts == 1 {
            let slot = &mut sess.slots[sslot_idx];
            slot.touch();
            let resp = MsgBuffer::fake_from_rx(desc.ptr, msg_size);
            self.complete_client_response(sess, sslot_idx, resp, deferred);
            return;
        }

        // Multi-packet response.
        let routing = sess.routing.clone();
        let remote_session = sess.remote.session_num;
        let (expected, first) = {
            let slot = &sess.slots[sslot_idx];
            (slot.pkts_rcvd, slot.pkts_rcvd == 0)
        };

        if pkt_num != expected {
            // Duplicate or out-of-order; not accepted. The credit bump above
            // still stands: the packet did arrive.
            self.stats.borrow_mut().dropped_stale += 1;
            return;
        }

        if first {
            if pkt_num != 0 {
                self.stats.borrow_mut().dropped_stale += 1;
                return;
            }
            let Some(rx) = self.alloc.alloc_msg_buffer(msg_size, T::MAX_DATA_PER_PKT) else {
                warn!("allocator exhausted; dropping multi-packet response");
                return;
            };
            let slot = &mut sess.slots[sslot_idx];
            slot.rx_msgbuf = Some(rx);
            slot.rx_msg_size = msg_size;
            slot.rx_num_pkts = num_pkts;
            slot.state = SSlotState::RespTxPending;
        }

        let payload = unsafe { std::slice::from_raw_parts(desc.ptr.add(PKT_HDR_SIZE), pkt_bytes) };
        let offset = pkt_num * T::MAX_DATA_PER_PKT;
        let complete;
        {
            let slot = &mut sess.slots[sslot_idx];
            if let Some(rx) = slot.rx_msgbuf.as_mut() {
                rx.data_mut()[offset..offset + pkt_bytes].copy_from_slice(payload);
            }
            slot.pkts_rcvd += 1;
            slot.touch();
            complete = slot.pkts_rcvd == num_pkts;
        }

        if complete {
            let resp = sess.slots[sslot_idx].rx_msgbuf.take().unwrap();
            self.complete_client_response(sess, sslot_idx, resp, deferred);
        } else if let Some(routing) = routing {
            // Pull the next response packet. The RFR consumes the credit the
            // packet above just returned, so one is always available.
            sess.consume_credit();
            let slot = &sess.slots[sslot_idx];
            let rfr = PktHdr::new(
                slot.req_type,
                msg_size,
                remote_session,
                PktType::Rfr,
                (pkt_num + 1) as u16,
                slot.req_num,
            );
            self.tx_ctrl_now(routing, &rfr);
            self.stats.borrow_mut().tx_rfr_pkts += 1;
        }
    }

    /// Bury the request buffer into the handle, build the response handle,
    /// and dispatch the continuation.
    fn complete_client_response(
        &self,
        sess: &mut Session<T::RoutingInfo>,
        sslot_idx: usize,
        resp_msgbuf: MsgBuffer,
        deferred: &mut Vec<Deferred>,
    ) {
        let session_num = sess.local.session_num;
        let free_slots = sess.free_slots.clone();
        let slot = &mut sess.slots[sslot_idx];

        let req_msgbuf = slot.tx_msgbuf.take();
        let cont = slot.cont.take();
        slot.state = SSlotState::Complete;
        let token = SlotToken {
            session_num,
            sslot_idx,
            req_num: slot.req_num,
        };

        let Some(cont) = cont else {
            trace!("response for a slot with no continuation");
            return;
        };

        let cont_bg = slot.cont_bg && self.broker.num_bg_threads() > 0;
        let resp_msgbuf = if cont_bg && !resp_msgbuf.is_dynamic() {
            // Worker threads must not see ring-aliasing buffers.
            let data = resp_msgbuf.data();
            match self.alloc.alloc_msg_buffer(data.len(), T::MAX_DATA_PER_PKT) {
                Some(mut dynamic) => {
                    dynamic.data_mut().copy_from_slice(data);
                    dynamic
                }
                None => {
                    warn!("allocator exhausted; delivering response inline");
                    resp_msgbuf
                }
            }
        } else {
            resp_msgbuf
        };

        let resp = RespHandle {
            resp_msgbuf: Some(resp_msgbuf),
            req_msgbuf,
            tag: slot.tag,
            sslot_idx,
            alloc: self.alloc.clone(),
            free_slots,
        };

        if cont_bg && resp.resp_msgbuf.as_ref().map(|m| m.is_dynamic()).unwrap_or(true) {
            let submitted = self.broker.submit_bg(BgWorkItem::Continuation {
                cont,
                resp,
                token,
                done: self.bg_cont_tx.clone(),
            });
            if !submitted {
                warn!("background submission failed; continuation lost");
            }
        } else {
            deferred.push(Deferred::Cont { cont, resp, token });
        }
    }

    /// Payload bytes of packet `pkt_num` in a `msg_size`-byte message.
    #[inline]
    fn pkt_bytes_at(msg_size: usize, pkt_num: usize, num_pkts: usize) -> usize {
        if pkt_num >= num_pkts {
            return 0;
        }
        (msg_size - pkt_num * T::MAX_DATA_PER_PKT).min(T::MAX_DATA_PER_PKT)
    }

    // -------------------------------------------------------------------
    // Loss detection
    // -------------------------------------------------------------------

    /// Epoch scan of outstanding client slots. Recovery is client-driven:
    /// the newest unacknowledged transmission for the slot is re-emitted,
    /// and the server answers duplicates idempotently.
    fn pkt_loss_scan(&self) {
        let now = Instant::now();
        if now.duration_since(self.prev_epoch_ts.get())
            < Duration::from_millis(Self::PKT_LOSS_EPOCH_MS)
        {
            return;
        }
        self.prev_epoch_ts.set(now);

        let timeout = Duration::from_millis(Self::PKT_LOSS_TIMEOUT_MS);
        let mut sessions = self.sessions.borrow_mut();
        for sess in sessions.iter_mut() {
            if !sess.is_client()
                || (sess.state != SessionState::Connected
                    && sess.state != SessionState::DisconnectInProgress)
            {
                continue;
            }
            let Some(routing) = sess.routing.clone() else {
                continue;
            };
            let remote_session = sess.remote.session_num;

            for sslot_idx in 0..SESSION_REQ_WINDOW {
                let slot = &mut sess.slots[sslot_idx];
                let stale = matches!(
                    slot.state,
                    SSlotState::ReqTxPending | SSlotState::AwaitingResp | SSlotState::RespTxPending
                ) && slot.progress_ts.elapsed() >= timeout;
                if !stale {
                    continue;
                }

                slot.touch();
                self.stats.borrow_mut().retransmits += 1;

                match slot.state {
                    SSlotState::ReqTxPending => {
                        // Re-send the first unacknowledged request packet to
                        // re-elicit the credit returns that restart TX.
                        let Some(msgbuf) = slot.tx_msgbuf.as_ref() else {
                            continue;
                        };
                        if msgbuf.pkts_queued() == 0 {
                            continue; // still waiting in the TX queue
                        }
                        let idx = slot.req_pkts_acked.min(msgbuf.pkts_queued() - 1);
                        debug!(req_num = slot.req_num, pkt = idx, "retransmitting request packet");
                        self.tx_data_pkt_now(routing.clone(), msgbuf, idx);
                    }
                    SSlotState::AwaitingResp => {
                        // The final request packet is only acknowledged by
                        // the response; re-send it.
                        let Some(msgbuf) = slot.tx_msgbuf.as_ref() else {
                            continue;
                        };
                        let idx = msgbuf.num_pkts() - 1;
                        debug!(req_num = slot.req_num, pkt = idx, "retransmitting request packet");
                        self.tx_data_pkt_now(routing.clone(), msgbuf, idx);
                    }
                    SSlotState::RespTxPending => {
                        // Mid-response: re-issue the RFR for the next
                        // expected response packet.
                        let rfr = PktHdr::new(
                            slot.req_type,
                            slot.rx_msg_size,
                            remote_session,
                            PktType::Rfr,
                            slot.pkts_rcvd as u16,
                            slot.req_num,
                        );
                        debug!(req_num = slot.req_num, pkt = slot.pkts_rcvd, "re-sending RFR");
                        self.tx_ctrl_now(routing.clone(), &rfr);
                        self.stats.borrow_mut().tx_rfr_pkts += 1;
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------

    fn fault_inject_check(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.creator_thread,
            "fault injection outside the creator thread"
        );
    }

    /// Fail routing-info resolution for subsequent connect attempts at this
    /// endpoint.
    pub fn fault_inject_resolve_rinfo(&self) {
        self.fault_inject_check();
        self.faults.borrow_mut().resolve_rinfo_fail = true;
    }

    /// Transmit `pkt_countdown` more datapath packets, then drop exactly
    /// one.
    pub fn fault_inject_drop_tx_local(&self, pkt_countdown: u64) {
        self.fault_inject_check();
        let mut faults = self.faults.borrow_mut();
        faults.drop_tx_local = true;
        faults.drop_tx_countdown = pkt_countdown;
    }

    /// Ask the remote endpoint of a session to arm its local TX-drop
    /// countdown.
    pub fn fault_inject_drop_tx_remote(&self, session_num: u16, pkt_countdown: u64) -> Result<()> {
        self.fault_inject_check();
        let pkt = self.fault_sm_pkt(session_num, SmPktType::FaultDropTxRemote, pkt_countdown)?;
        self.broker.enqueue_sm(pkt);
        Ok(())
    }

    /// Tear down the remote side of a session as if its peer had reset,
    /// exercising the disconnect-callback paths.
    pub fn fault_inject_reset_remote_peer(&self, session_num: u16) -> Result<()> {
        self.fault_inject_check();
        let pkt = self.fault_sm_pkt(session_num, SmPktType::FaultResetPeer, 0)?;
        self.broker.enqueue_sm(pkt);
        Ok(())
    }

    fn fault_sm_pkt(&self, session_num: u16, kind: SmPktType, fault_arg: u64) -> Result<SmPkt> {
        let sessions = self.sessions.borrow();
        let sess = sessions
            .get(session_num)
            .ok_or(Error::NoSuchSession(session_num))?;
        if !sess.is_client() || !sess.is_connected() {
            return Err(Error::SessionNotConnected(session_num));
        }
        Ok(SmPkt {
            kind,
            err: SmErrType::NoError,
            token: sess.sm_token,
            fault_arg,
            client: sess.local.clone(),
            server: sess.remote.clone(),
        })
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        self.broker.unregister_endpoint(self.endpoint_id);
        // Free session-held buffers so allocator accounting stays exact.
        let mut to_bury = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            for sess in sessions.iter_mut() {
                for slot in &mut sess.slots {
                    if let Some(tx) = slot.tx_msgbuf.take() {
                        to_bury.push(tx);
                    }
                    if let Some(rx) = slot.rx_msgbuf.take() {
                        to_bury.push(rx);
                    }
                }
            }
        }
        for buf in to_bury {
            self.alloc.bury(buf);
        }
    }
}
