//! # udrpc - microsecond-scale RPC over unreliable datagrams
//!
//! This crate implements a datacenter-class RPC runtime in the style of
//! eRPC (NSDI 2019): per-thread endpoints over a lossy packet transport,
//! with credit-based flow control, pull-mode response transfer, and
//! detect-and-resend loss recovery.
//!
//! ## Features
//!
//! - **Pluggable datagram transport**: endpoints are generic over a burst
//!   send / receive-ring [`transport::Transport`]; a non-blocking UDP
//!   driver is included as the reference transport
//! - **Request multiplexing**: a fixed window of request slots per session
//! - **Credit-based flow control**: explicit credit returns bound the
//!   in-flight request packets per session
//! - **Pull-mode responses**: multi-packet responses are paced by
//!   request-for-response packets from the client
//! - **Loss recovery**: an epoch scan retransmits the newest
//!   unacknowledged packet of stalled requests
//! - **Background workers**: heavy handlers and continuations run on a
//!   broker-wide worker pool without touching datapath state
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use udrpc::{Broker, HandlerKind, Rpc, UdpTransport};
//!
//! // One broker per host; handlers are registered before endpoints.
//! let broker = Arc::new(Broker::new("127.0.0.1:0", 0)?);
//! broker.register_req_handler(7, HandlerKind::Foreground, |req| {
//!     let payload = req.req().to_vec();
//!     let resp = req.alloc_response(payload.len()).unwrap();
//!     resp.data_mut().copy_from_slice(&payload);
//! });
//!
//! // A server endpoint and a client endpoint (often on different hosts).
//! let server = Rpc::<UdpTransport>::new(&broker, 0, |_| {}, 0, 0)?;
//! let client = Rpc::<UdpTransport>::new(&broker, 1, |ev| println!("{ev:?}"), 0, 0)?;
//!
//! let session = client.create_session(broker.uri(), 0, 0)?;
//! // ... run both event loops until the Connected event ...
//!
//! let mut req = client.alloc_msg_buffer(5).unwrap();
//! req.data_mut().copy_from_slice(b"hello");
//! client.enqueue_request(session, 7, req, |resp| {
//!     println!("echoed: {:?}", resp.resp());
//! }, 0)?;
//!
//! loop {
//!     client.run_event_loop_once();
//!     server.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`packet`]: the bit-exact 16-byte packet header
//! - [`alloc`]: the hugepage-backed size-class allocator
//! - [`buffer`]: message buffers with per-packet header headroom
//! - [`transport`]: the transport capability interface
//! - [`udp`]: the UDP reference transport
//! - [`sm`]: session-management packets and events
//! - [`broker`]: the per-host broker (SM control plane, worker pool)
//! - [`session`]: sessions, slots, credits
//! - [`rpc`]: the endpoint and its event loop

pub mod alloc;
pub mod broker;
pub mod buffer;
pub mod error;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod transport;
pub mod udp;

// Re-export main types
pub use broker::{Broker, HandlerKind};
pub use buffer::{MsgAllocator, MsgBuffer};
pub use error::{Error, Result};
pub use packet::{PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{Continuation, DpathStats, EnqueueError, ReqHandle, RespHandle, Rpc};
pub use session::{SSlotState, SessionState, SESSION_CREDITS, SESSION_REQ_WINDOW};
pub use sm::{SmErrType, SmEvent, SmEventType, SmPkt, SmPktType};
pub use transport::{RxDesc, Transport, TxBurstItem};
pub use udp::UdpTransport;
