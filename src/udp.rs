//! Non-blocking UDP datagram transport.
//!
//! The reference transport driver: a loopback-friendly stand-in for a
//! kernel-bypass NIC with the same burst-oriented interface. Datagrams are
//! one packet each (16-byte header plus up to `MAX_DATA_PER_PKT` payload
//! bytes). Sends that would block are dropped; the protocol's loss recovery
//! absorbs them like any other loss.

use std::net::{SocketAddr, UdpSocket};

use tracing::trace;

use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;
use crate::transport::{RxDesc, Transport, TxBurstItem};

/// Datagram size: header plus maximum payload.
const DGRAM_SIZE: usize = PKT_HDR_SIZE + UdpTransport::MAX_DATA_PER_PKT;

/// UDP transport bound to an ephemeral localhost-visible port.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Pre-posted receive ring.
    ring: Vec<Box<[u8; DGRAM_SIZE]>>,
    /// Next ring slot a received packet lands in.
    head: usize,
    /// Receives currently posted.
    posted: usize,
    /// Scratch buffer for assembling outgoing datagrams.
    tx_scratch: Box<[u8; DGRAM_SIZE]>,
}

impl Transport for UdpTransport {
    const MAX_DATA_PER_PKT: usize = 1024;
    const POSTLIST: usize = 16;
    const RECV_QUEUE_DEPTH: usize = 256;

    type RoutingInfo = SocketAddr;

    fn open(_phy_port: u8, _numa_node: usize) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let ring = (0..Self::RECV_QUEUE_DEPTH)
            .map(|_| Box::new([0u8; DGRAM_SIZE]))
            .collect();

        Ok(Self {
            socket,
            local_addr,
            ring,
            head: 0,
            posted: Self::RECV_QUEUE_DEPTH,
            tx_scratch: Box::new([0u8; DGRAM_SIZE]),
        })
    }

    fn routing_info(&self) -> SocketAddr {
        self.local_addr
    }

    fn serialize_routing_info(ri: &SocketAddr) -> Vec<u8> {
        ri.to_string().into_bytes()
    }

    fn resolve_routing_info(raw: &[u8]) -> Result<SocketAddr> {
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::BadArg("unresolvable routing info"))
    }

    fn tx_burst(&mut self, items: &[TxBurstItem<SocketAddr>]) {
        debug_assert!(items.len() <= Self::POSTLIST);
        for item in items {
            if item.drop {
                continue;
            }

            // Safety: the caller keeps the referenced MsgBuffer alive for
            // the duration of this call (see the Transport contract).
            let msgbuf = unsafe { &*item.msgbuf };
            let pkt_idx = item.offset / Self::MAX_DATA_PER_PKT;
            let len = PKT_HDR_SIZE + item.data_bytes;
            debug_assert!(len <= DGRAM_SIZE);

            unsafe {
                std::ptr::copy_nonoverlapping(
                    msgbuf.pkthdr_ptr(pkt_idx) as *const u8,
                    self.tx_scratch.as_mut_ptr(),
                    PKT_HDR_SIZE,
                );
                if item.data_bytes > 0 {
                    std::ptr::copy_nonoverlapping(
                        msgbuf.pkt_data_ptr(pkt_idx, Self::MAX_DATA_PER_PKT),
                        self.tx_scratch.as_mut_ptr().add(PKT_HDR_SIZE),
                        item.data_bytes,
                    );
                }
            }

            match self.socket.send_to(&self.tx_scratch[..len], item.routing) {
                Ok(_) => {}
                Err(e) => {
                    // Unreliable by contract; a full socket buffer is a loss.
                    trace!(dst = %item.routing, err = %e, "udp tx dropped");
                }
            }
        }
    }

    fn rx_burst(&mut self, max: usize, out: &mut Vec<RxDesc>) -> usize {
        let budget = max.min(self.posted);
        let mut n = 0;
        while n < budget {
            let slot = &mut self.ring[self.head];
            match self.socket.recv_from(slot.as_mut_slice()) {
                Ok((len, _src)) => {
                    out.push(RxDesc {
                        ptr: slot.as_mut_ptr(),
                        len,
                    });
                    self.head = (self.head + 1) % Self::RECV_QUEUE_DEPTH;
                    self.posted -= 1;
                    n += 1;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    trace!(err = %e, "udp rx error");
                    break;
                }
            }
        }
        n
    }

    fn post_recvs(&mut self, count: usize) {
        self.posted += count;
        debug_assert!(self.posted <= Self::RECV_QUEUE_DEPTH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MsgAllocator;
    use crate::packet::{PktHdr, PktType};

    #[test]
    fn test_routing_info_roundtrip() {
        let t = UdpTransport::open(0, 0).unwrap();
        let ri = t.routing_info();
        let blob = UdpTransport::serialize_routing_info(&ri);
        assert_eq!(UdpTransport::resolve_routing_info(&blob).unwrap(), ri);
    }

    #[test]
    fn test_resolve_garbage_fails() {
        assert!(UdpTransport::resolve_routing_info(b"not an addr").is_err());
        assert!(UdpTransport::resolve_routing_info(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_burst_roundtrip() {
        let mut a = UdpTransport::open(0, 0).unwrap();
        let mut b = UdpTransport::open(0, 0).unwrap();

        let alloc = MsgAllocator::new(16 * 1024 * 1024).unwrap();
        let mut msgbuf = alloc
            .alloc_msg_buffer(8, UdpTransport::MAX_DATA_PER_PKT)
            .unwrap();
        msgbuf.data_mut().copy_from_slice(b"pingpong");
        let hdr = PktHdr::new(7, 8, 3, PktType::Req, 0, 11);
        msgbuf.write_pkthdr(0, &hdr);

        let items = [TxBurstItem {
            routing: b.routing_info(),
            msgbuf: &msgbuf as *const _,
            offset: 0,
            data_bytes: 8,
            drop: false,
        }];
        a.tx_burst(&items);

        let mut descs = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while descs.is_empty() && std::time::Instant::now() < deadline {
            b.rx_burst(UdpTransport::POSTLIST, &mut descs);
        }
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].len, PKT_HDR_SIZE + 8);

        let got = unsafe { PktHdr::read_from(descs[0].ptr) };
        assert_eq!(got, hdr);
        let payload =
            unsafe { std::slice::from_raw_parts(descs[0].ptr.add(PKT_HDR_SIZE), 8) };
        assert_eq!(payload, b"pingpong");
        b.post_recvs(1);

        alloc.free_msg_buffer(msgbuf);
    }

    #[test]
    fn test_drop_flag_honored() {
        let mut a = UdpTransport::open(0, 0).unwrap();
        let b = UdpTransport::open(0, 0).unwrap();

        let alloc = MsgAllocator::new(16 * 1024 * 1024).unwrap();
        let mut msgbuf = alloc
            .alloc_msg_buffer(4, UdpTransport::MAX_DATA_PER_PKT)
            .unwrap();
        msgbuf.write_pkthdr(0, &PktHdr::new(0, 4, 0, PktType::Req, 0, 0));

        let items = [TxBurstItem {
            routing: b.routing_info(),
            msgbuf: &msgbuf as *const _,
            offset: 0,
            data_bytes: 4,
            drop: true,
        }];
        a.tx_burst(&items);

        // Nothing should arrive.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut b = b;
        let mut descs = Vec::new();
        assert_eq!(b.rx_burst(UdpTransport::POSTLIST, &mut descs), 0);

        alloc.free_msg_buffer(msgbuf);
    }
}
