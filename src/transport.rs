//! Transport capability interface.
//!
//! The endpoint is generic over a datagram transport that provides burst
//! transmission, a pre-posted receive ring, and routing-info serialization.
//! The transport is unreliable and unordered across paths; the protocol
//! above it is self-reliable.

use crate::buffer::MsgBuffer;
use crate::error::Result;

/// One packet in a transmit burst.
///
/// `offset` is the payload byte offset of this packet within the message
/// buffer; `data_bytes` is zero for header-only control packets. The header
/// for the packet lives in the buffer's header slot
/// `offset / MAX_DATA_PER_PKT`.
pub struct TxBurstItem<R> {
    /// Routing info of the destination endpoint.
    pub routing: R,
    /// The message buffer to transmit from.
    pub msgbuf: *const MsgBuffer,
    /// Payload byte offset of this packet.
    pub offset: usize,
    /// Payload bytes in this packet (0 for header-only packets).
    pub data_bytes: usize,
    /// Honored by the fault injector: enqueue nothing for this item.
    pub drop: bool,
}

/// A filled receive-ring slot returned by `rx_burst`.
///
/// The slot stays valid until the same number of receives is re-posted via
/// `post_recvs`.
#[derive(Debug, Clone, Copy)]
pub struct RxDesc {
    /// Pointer to the packet header.
    pub ptr: *mut u8,
    /// Received length including the header.
    pub len: usize,
}

/// An unreliable datagram transport.
///
/// Guarantees: packets within one `tx_burst` are enqueued to the wire in
/// order; transmit completion is asynchronous and unobservable. Delivery and
/// cross-burst ordering are not guaranteed.
///
/// # Safety contract
///
/// `tx_burst` dereferences the raw `MsgBuffer` pointers in the items; the
/// caller keeps every referenced buffer alive and unmodified for the
/// duration of the call. The datapath satisfies this by flushing bursts
/// while the owning slots are borrowed.
pub trait Transport: Sized {
    /// Maximum payload bytes carried by one packet.
    const MAX_DATA_PER_PKT: usize;
    /// Maximum items per TX or RX burst.
    const POSTLIST: usize;
    /// Depth of the pre-posted receive ring.
    const RECV_QUEUE_DEPTH: usize;

    /// Opaque routing info naming a remote endpoint.
    type RoutingInfo: Clone + std::fmt::Debug;

    /// Open the transport on a physical port.
    fn open(phy_port: u8, numa_node: usize) -> Result<Self>;

    /// Routing info other endpoints use to reach this transport.
    fn routing_info(&self) -> Self::RoutingInfo;

    /// Serialize routing info into a blob for session-management packets.
    fn serialize_routing_info(ri: &Self::RoutingInfo) -> Vec<u8>;

    /// Resolve a routing-info blob received from a peer.
    fn resolve_routing_info(raw: &[u8]) -> Result<Self::RoutingInfo>;

    /// Enqueue a burst of packets to the wire.
    fn tx_burst(&mut self, items: &[TxBurstItem<Self::RoutingInfo>]);

    /// Poll the receive ring, appending up to `max` descriptors to `out`.
    /// Returns the number received.
    fn rx_burst(&mut self, max: usize, out: &mut Vec<RxDesc>) -> usize;

    /// Re-post `count` receives, freeing the oldest `count` ring slots for
    /// reuse by the transport.
    fn post_recvs(&mut self, count: usize);
}
