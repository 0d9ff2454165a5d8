//! Message buffers with packet-header headroom.
//!
//! A `MsgBuffer` is a contiguous payload region bracketed by packet-header
//! slots: one header ahead of the payload, plus one trailing slot per
//! additional packet the payload spans at the transport's packet size.
//! Dynamic buffers own a size-class allocation; fake buffers alias a
//! received ring slot and are never freed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::alloc::{Buffer, HugeAlloc};
use crate::error::{Error, Result};
use crate::packet::{PktHdr, PKT_HDR_SIZE, PKT_MAGIC};

/// A message buffer.
///
/// Layout of the backing allocation:
/// ```text
/// [ hdr 0 ][ payload (max_data_size) ][ hdr 1 ] ... [ hdr max_num_pkts-1 ]
/// ```
/// Header slot 0 carries the magic byte from allocation time. The trailing
/// header slots are positioned off `max_data_size`, so shrinking the data
/// size never moves them.
#[derive(Debug)]
pub struct MsgBuffer {
    /// Owning allocation; `None` for fake buffers built over an RX ring slot.
    buffer: Option<Buffer>,
    /// Payload pointer (one header past the start of the region).
    buf: *mut u8,
    /// Current payload length in bytes.
    data_size: usize,
    /// Maximum payload length this buffer was sized for.
    max_data_size: usize,
    /// Packets spanned by the current payload length.
    num_pkts: usize,
    /// Packets spanned at `max_data_size`.
    max_num_pkts: usize,
    /// Packets queued for transmission so far.
    pkts_queued: usize,
}

// MsgBuffer hands out access to allocator-owned (or ring-owned) memory; the
// datapath rules keep each buffer single-owner at any instant.
unsafe impl Send for MsgBuffer {}

impl MsgBuffer {
    /// Build a dynamic buffer over an owned allocation.
    ///
    /// Stamps the magic byte into header slot 0.
    pub(crate) fn dynamic(buffer: Buffer, max_data_size: usize, max_num_pkts: usize) -> Self {
        debug_assert!(buffer.class_size() >= max_data_size + max_num_pkts * PKT_HDR_SIZE);
        let buf = unsafe { buffer.as_ptr().add(PKT_HDR_SIZE) };
        unsafe {
            std::ptr::write_bytes(buffer.as_ptr(), 0, PKT_HDR_SIZE);
            *buffer.as_ptr() = PKT_MAGIC;
        }
        Self {
            buffer: Some(buffer),
            buf,
            data_size: max_data_size,
            max_data_size,
            num_pkts: max_num_pkts,
            max_num_pkts,
            pkts_queued: 0,
        }
    }

    /// Build a fake single-packet buffer aliasing a received packet.
    ///
    /// `pkt` must point at the packet header; the payload follows it.
    /// The buffer borrows the ring slot and must be dropped before the
    /// underlying receive is reposted.
    pub(crate) fn fake_from_rx(pkt: *mut u8, data_size: usize) -> Self {
        Self {
            buffer: None,
            buf: unsafe { pkt.add(PKT_HDR_SIZE) },
            data_size,
            max_data_size: data_size,
            num_pkts: 1,
            max_num_pkts: 1,
            pkts_queued: 0,
        }
    }

    /// True iff this buffer owns its allocation.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.buffer.is_some()
    }

    /// Check the magic byte in header slot 0.
    #[inline]
    pub fn check_magic(&self) -> bool {
        unsafe { *self.pkthdr_ptr(0) == PKT_MAGIC }
    }

    /// Current payload length.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Maximum payload length.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Packets spanned by the current payload.
    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    #[inline]
    pub(crate) fn pkts_queued(&self) -> usize {
        self.pkts_queued
    }

    #[inline]
    pub(crate) fn set_pkts_queued(&mut self, n: usize) {
        debug_assert!(n <= self.num_pkts);
        self.pkts_queued = n;
    }

    #[inline]
    pub(crate) fn bump_pkts_queued(&mut self) {
        debug_assert!(self.pkts_queued < self.num_pkts);
        self.pkts_queued += 1;
    }

    /// The payload as a slice.
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf, self.data_size) }
    }

    /// The payload as a mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.buf, self.data_size) }
    }

    /// Copy `src` into the payload and set the data size accordingly.
    pub fn copy_from(&mut self, src: &[u8], max_data_per_pkt: usize) -> Result<()> {
        if src.len() > self.max_data_size {
            return Err(Error::BufferTooSmall {
                required: src.len(),
                available: self.max_data_size,
            });
        }
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.buf, src.len()) };
        self.resize(src.len(), max_data_per_pkt);
        Ok(())
    }

    /// Shrink (or re-expand, up to the allocation) the payload length and
    /// recompute the packet count. Headers are not modified.
    pub(crate) fn resize(&mut self, new_data_size: usize, max_data_per_pkt: usize) {
        debug_assert!(new_data_size <= self.max_data_size);
        self.data_size = new_data_size;
        self.num_pkts = PktHdr::calc_num_pkts(new_data_size, max_data_per_pkt);
        debug_assert!(self.num_pkts <= self.max_num_pkts);
    }

    /// Pointer to the `n`-th packet-header slot.
    #[inline]
    pub(crate) fn pkthdr_ptr(&self, n: usize) -> *mut u8 {
        debug_assert!(n < self.max_num_pkts.max(1));
        if n == 0 {
            unsafe { self.buf.sub(PKT_HDR_SIZE) }
        } else {
            unsafe { self.buf.add(self.max_data_size + (n - 1) * PKT_HDR_SIZE) }
        }
    }

    /// Write the `n`-th packet header.
    #[inline]
    pub(crate) fn write_pkthdr(&mut self, n: usize, hdr: &PktHdr) {
        unsafe { hdr.write_to(self.pkthdr_ptr(n)) };
    }

    /// Pointer to the payload bytes of packet `n`.
    #[inline]
    pub(crate) fn pkt_data_ptr(&self, n: usize, max_data_per_pkt: usize) -> *const u8 {
        unsafe { self.buf.add(n * max_data_per_pkt) }
    }

    /// Payload length of packet `n` at the current data size.
    #[inline]
    pub(crate) fn pkt_data_len(&self, n: usize, max_data_per_pkt: usize) -> usize {
        let start = n * max_data_per_pkt;
        debug_assert!(start <= self.data_size || self.data_size == 0);
        self.data_size.saturating_sub(start).min(max_data_per_pkt)
    }

    /// Take the owning allocation out, leaving the buffer unusable.
    pub(crate) fn take_allocation(&mut self) -> Option<Buffer> {
        self.buffer.take()
    }
}

/// The shared message-buffer allocator.
///
/// All entry points lock an internal mutex: the allocator is the one piece
/// of endpoint state that background workers touch directly. Live-buffer
/// statistics back the ownership-uniqueness checks in the test-suite.
pub struct MsgAllocator {
    inner: Mutex<HugeAlloc>,
    user_alloc_tot: AtomicUsize,
    live_bufs: AtomicUsize,
}

impl MsgAllocator {
    /// Create an allocator with `initial_size` bytes reserved.
    pub fn new(initial_size: usize) -> Result<Self> {
        let huge = HugeAlloc::new(initial_size)
            .map_err(|e| Error::Construction(format!("hugepage allocator: {}", e)))?;
        Ok(Self {
            inner: Mutex::new(huge),
            user_alloc_tot: AtomicUsize::new(0),
            live_bufs: AtomicUsize::new(0),
        })
    }

    /// Allocate a message buffer for up to `max_data_size` payload bytes.
    ///
    /// Reserves `max_data_size + ceil(max_data_size / max_data_per_pkt) *
    /// PKT_HDR_SIZE` bytes, rounded to a size class. Returns `None` when the
    /// allocator is out of memory; that is not a fatal condition.
    pub fn alloc_msg_buffer(
        &self,
        max_data_size: usize,
        max_data_per_pkt: usize,
    ) -> Option<MsgBuffer> {
        let max_num_pkts = PktHdr::calc_num_pkts(max_data_size, max_data_per_pkt);
        let total = max_data_size + max_num_pkts * PKT_HDR_SIZE;

        let buffer = self.inner.lock().unwrap().alloc(total)?;
        self.user_alloc_tot.fetch_add(total, Ordering::Relaxed);
        self.live_bufs.fetch_add(1, Ordering::Relaxed);
        Some(MsgBuffer::dynamic(buffer, max_data_size, max_num_pkts))
    }

    /// Free a dynamic message buffer.
    pub fn free_msg_buffer(&self, mut msg_buffer: MsgBuffer) {
        debug_assert!(msg_buffer.check_magic());
        let Some(buffer) = msg_buffer.take_allocation() else {
            debug_assert!(false, "freeing a fake MsgBuffer");
            return;
        };
        let total = msg_buffer.max_data_size + msg_buffer.max_num_pkts * PKT_HDR_SIZE;
        self.user_alloc_tot.fetch_sub(total, Ordering::Relaxed);
        self.live_bufs.fetch_sub(1, Ordering::Relaxed);
        self.inner.lock().unwrap().free(buffer);
    }

    /// Free a buffer that may be fake; fake buffers are a no-op.
    pub(crate) fn bury(&self, msg_buffer: MsgBuffer) {
        if msg_buffer.is_dynamic() {
            self.free_msg_buffer(msg_buffer);
        }
    }

    /// Total payload-plus-headroom bytes currently allocated to buffers.
    pub fn stat_user_alloc_tot(&self) -> usize {
        self.user_alloc_tot.load(Ordering::Relaxed)
    }

    /// Number of live dynamic buffers.
    pub fn live_bufs(&self) -> usize {
        self.live_bufs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PER_PKT: usize = 1024;

    fn allocator() -> MsgAllocator {
        MsgAllocator::new(16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn test_single_packet_headroom() {
        let alloc = allocator();
        let buf = alloc.alloc_msg_buffer(100, PER_PKT).unwrap();
        assert!(buf.is_dynamic());
        assert!(buf.check_magic());
        assert_eq!(buf.num_pkts(), 1);
        assert_eq!(buf.pkthdr_ptr(0) as usize + PKT_HDR_SIZE, buf.data().as_ptr() as usize);
        alloc.free_msg_buffer(buf);
        assert_eq!(alloc.live_bufs(), 0);
        assert_eq!(alloc.stat_user_alloc_tot(), 0);
    }

    #[test]
    fn test_multi_packet_header_slots() {
        let alloc = allocator();
        let buf = alloc.alloc_msg_buffer(3200, PER_PKT).unwrap();
        assert_eq!(buf.num_pkts(), 4);

        // Trailing headers sit after the payload region, back to back.
        let payload_end = buf.data().as_ptr() as usize + buf.max_data_size();
        for n in 1..4 {
            assert_eq!(buf.pkthdr_ptr(n) as usize, payload_end + (n - 1) * PKT_HDR_SIZE);
        }
        assert_eq!(buf.pkt_data_len(0, PER_PKT), 1024);
        assert_eq!(buf.pkt_data_len(3, PER_PKT), 128);
        alloc.free_msg_buffer(buf);
    }

    #[test]
    fn test_resize_keeps_headers() {
        let alloc = allocator();
        let mut buf = alloc.alloc_msg_buffer(5000, PER_PKT).unwrap();
        let hdr3 = buf.pkthdr_ptr(3);
        buf.resize(1500, PER_PKT);
        assert_eq!(buf.num_pkts(), 2);
        assert_eq!(buf.data_size(), 1500);
        // Trailing slots are laid out off max_data_size and do not move.
        assert_eq!(buf.pkthdr_ptr(3), hdr3);
        alloc.free_msg_buffer(buf);
    }

    #[test]
    fn test_fake_buffer() {
        let mut pkt = vec![0u8; PKT_HDR_SIZE + 32];
        pkt[0] = PKT_MAGIC;
        let buf = MsgBuffer::fake_from_rx(pkt.as_mut_ptr(), 32);
        assert!(!buf.is_dynamic());
        assert!(buf.check_magic());
        assert_eq!(buf.data().len(), 32);
    }

    #[test]
    fn test_empty_message() {
        let alloc = allocator();
        let buf = alloc.alloc_msg_buffer(0, PER_PKT).unwrap();
        assert_eq!(buf.num_pkts(), 1);
        assert_eq!(buf.data(), &[] as &[u8]);
        alloc.free_msg_buffer(buf);
    }

    #[test]
    fn test_oom_is_none() {
        let alloc = allocator();
        assert!(alloc
            .alloc_msg_buffer(crate::alloc::MAX_CLASS_SIZE + 1, PER_PKT)
            .is_none());
    }
}
