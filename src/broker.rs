//! Per-host broker.
//!
//! The broker is the one-per-host coordination point shared by all
//! endpoints: it relays session-management packets between hosts over a TCP
//! control plane, delivers them into per-endpoint inboxes, hosts the
//! request-handler registry, and runs the background worker pool that heavy
//! handlers and continuations are offloaded to.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rpc::{Continuation, ReqHandle, RespHandle, SlotToken};
use crate::sm::{SmErrType, SmPkt, SmPktType};

/// Whether a request handler runs on the endpoint thread or on the broker's
/// worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Run inline in the endpoint's event loop. For short handlers only.
    Foreground,
    /// Run on a background worker thread.
    Background,
}

/// A registered request handler.
pub(crate) type ReqHandlerFn = Arc<dyn Fn(&mut ReqHandle) + Send + Sync + 'static>;

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) func: ReqHandlerFn,
    pub(crate) kind: HandlerKind,
}

/// Work submitted to the background pool.
pub(crate) enum BgWorkItem {
    /// Run a request handler; send the filled handle back for response TX.
    Request {
        func: ReqHandlerFn,
        handle: ReqHandle,
        done: Sender<ReqHandle>,
    },
    /// Run a client continuation; send the slot token back for slot
    /// finalization on the endpoint thread.
    Continuation {
        cont: Continuation,
        resp: RespHandle,
        token: SlotToken,
        done: Sender<SlotToken>,
    },
}

struct BrokerShared {
    /// endpoint id -> SM inbox.
    inboxes: Mutex<HashMap<u8, Sender<SmPkt>>>,
    /// Outgoing SM queue, also used for broker-level error replies.
    sm_tx: Sender<SmPkt>,
    /// Local broker URI ("ip:port" of the SM listener).
    uri: String,
    shutdown: AtomicBool,
}

/// The per-host broker.
pub struct Broker {
    shared: Arc<BrokerShared>,
    handlers: Mutex<HashMap<u8, HandlerEntry>>,
    bg_tx: Option<Sender<BgWorkItem>>,
    num_bg_threads: usize,
    sm_thread: Option<JoinHandle<()>>,
    listener_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Create a broker, binding its SM listener to `bind_addr`
    /// (e.g. `"127.0.0.1:0"`), with `num_bg_threads` background workers
    /// shared by all endpoints on this host.
    pub fn new(bind_addr: &str, num_bg_threads: usize) -> Result<Broker> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let uri = listener.local_addr()?.to_string();

        let (sm_tx, sm_rx) = unbounded::<SmPkt>();
        let shared = Arc::new(BrokerShared {
            inboxes: Mutex::new(HashMap::new()),
            sm_tx,
            uri,
            shutdown: AtomicBool::new(false),
        });

        let sm_thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("udrpc-sm".into())
                .spawn(move || sm_thread_main(shared, sm_rx))
                .map_err(|e| Error::Construction(format!("sm thread: {}", e)))?
        };

        let listener_thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("udrpc-sm-listener".into())
                .spawn(move || listener_thread_main(shared, listener))
                .map_err(|e| Error::Construction(format!("sm listener: {}", e)))?
        };

        let mut workers = Vec::new();
        let bg_tx = if num_bg_threads > 0 {
            let (tx, rx) = unbounded::<BgWorkItem>();
            for i in 0..num_bg_threads {
                let rx: Receiver<BgWorkItem> = rx.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("udrpc-bg-{}", i))
                    .spawn(move || worker_thread_main(rx))
                    .map_err(|e| Error::Construction(format!("bg worker: {}", e)))?;
                workers.push(handle);
            }
            Some(tx)
        } else {
            None
        };

        Ok(Broker {
            shared,
            handlers: Mutex::new(HashMap::new()),
            bg_tx,
            num_bg_threads,
            sm_thread: Some(sm_thread),
            listener_thread: Some(listener_thread),
            workers,
        })
    }

    /// The broker's control-plane URI. Remote hosts name sessions to this
    /// host by it.
    pub fn uri(&self) -> &str {
        &self.shared.uri
    }

    /// Number of background worker threads.
    pub fn num_bg_threads(&self) -> usize {
        self.num_bg_threads
    }

    /// Register the handler for a request type.
    ///
    /// Endpoints copy the registry at construction time, so handlers must be
    /// registered before the endpoints that serve them are created.
    pub fn register_req_handler<F>(&self, req_type: u8, kind: HandlerKind, func: F)
    where
        F: Fn(&mut ReqHandle) + Send + Sync + 'static,
    {
        if kind == HandlerKind::Background && self.num_bg_threads == 0 {
            warn!(req_type, "background handler registered on a broker without workers");
        }
        self.handlers.lock().unwrap().insert(
            req_type,
            HandlerEntry {
                func: Arc::new(func),
                kind,
            },
        );
    }

    pub(crate) fn handler_snapshot(&self) -> HashMap<u8, HandlerEntry> {
        self.handlers.lock().unwrap().clone()
    }

    /// Claim an endpoint id and create its SM inbox.
    pub(crate) fn register_endpoint(&self, endpoint_id: u8) -> Result<Receiver<SmPkt>> {
        let mut inboxes = self.shared.inboxes.lock().unwrap();
        if inboxes.contains_key(&endpoint_id) {
            return Err(Error::EndpointIdInUse(endpoint_id));
        }
        let (tx, rx) = unbounded();
        inboxes.insert(endpoint_id, tx);
        Ok(rx)
    }

    pub(crate) fn unregister_endpoint(&self, endpoint_id: u8) {
        self.shared.inboxes.lock().unwrap().remove(&endpoint_id);
    }

    /// Hand an outgoing SM packet to the SM thread.
    pub(crate) fn enqueue_sm(&self, pkt: SmPkt) {
        let _ = self.shared.sm_tx.send(pkt);
    }

    /// Submit work to the background pool. Returns `false` when the broker
    /// has no workers.
    pub(crate) fn submit_bg(&self, item: BgWorkItem) -> bool {
        match &self.bg_tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        // Closing the work channel lets the workers drain and exit.
        self.bg_tx = None;
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        if let Some(t) = self.sm_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.listener_thread.take() {
            let _ = t.join();
        }
    }
}

/// Deliver an SM packet into the target endpoint's inbox, or answer with a
/// broker-level error when no such endpoint exists.
fn deliver_local(shared: &BrokerShared, pkt: SmPkt) {
    let dest_id = pkt.dest_endpoint_id();
    let inboxes = shared.inboxes.lock().unwrap();
    match inboxes.get(&dest_id) {
        Some(tx) => {
            let _ = tx.send(pkt);
        }
        None => {
            debug!(dest_id, kind = ?pkt.kind, "SM packet for unknown endpoint");
            if pkt.kind == SmPktType::ConnectReq {
                let resp = pkt.response(SmPktType::ConnectResp, SmErrType::InvalidRemoteEndpoint);
                let _ = shared.sm_tx.send(resp);
            }
        }
    }
}

fn sm_thread_main(shared: Arc<BrokerShared>, sm_rx: Receiver<SmPkt>) {
    loop {
        match sm_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(pkt) => {
                if pkt.dest_hostname() == shared.uri {
                    deliver_local(&shared, pkt);
                } else {
                    send_remote(&pkt);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Serialize one SM packet onto a short-lived TCP connection to the remote
/// broker.
fn send_remote(pkt: &SmPkt) {
    let dest = pkt.dest_hostname().to_string();
    let bytes = pkt.encode();
    match TcpStream::connect(&dest) {
        Ok(mut stream) => {
            let len = (bytes.len() as u32).to_le_bytes();
            if stream.write_all(&len).and_then(|_| stream.write_all(&bytes)).is_err() {
                warn!(dest = %dest, "failed to write SM packet");
            }
        }
        Err(e) => warn!(dest = %dest, err = %e, "failed to reach remote broker"),
    }
}

fn listener_thread_main(shared: Arc<BrokerShared>, listener: TcpListener) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((mut stream, _peer)) => {
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
                loop {
                    let mut len_bytes = [0u8; 4];
                    if stream.read_exact(&mut len_bytes).is_err() {
                        break;
                    }
                    let len = u32::from_le_bytes(len_bytes) as usize;
                    if len > 64 * 1024 {
                        warn!(len, "oversized SM frame");
                        break;
                    }
                    let mut frame = vec![0u8; len];
                    if stream.read_exact(&mut frame).is_err() {
                        break;
                    }
                    match SmPkt::decode(&frame) {
                        Ok(pkt) => deliver_local(&shared, pkt),
                        Err(e) => {
                            warn!(err = %e, "undecodable SM frame");
                            break;
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                warn!(err = %e, "SM listener accept failed");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn worker_thread_main(rx: Receiver<BgWorkItem>) {
    // Exits when every sender is gone (broker drop).
    for item in rx.iter() {
        match item {
            BgWorkItem::Request {
                func,
                mut handle,
                done,
            } => {
                func(&mut handle);
                let _ = done.send(handle);
            }
            BgWorkItem::Continuation {
                cont,
                resp,
                token,
                done,
            } => {
                cont(resp);
                let _ = done.send(token);
            }
        }
    }
}
