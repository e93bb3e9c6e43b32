//! Serial Link: a fixed-capacity SPSC ring buffer for ISR-fed bytes, and the
//! frame-delimited state machine that turns a drained buffer into an
//! application request and, eventually, a framed response.
//!
//! Length, address and CRC are checked in that order, so a frame addressed
//! to another slave never counts against the bad-frame counter.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::app::Dispatcher;
use crate::crc::crc16_modbus;
use crate::error::LinkError;
use crate::register::RegisterStore;

const ADDR_SIZE: usize = 1;
const CRC_SIZE: usize = 2;
const APDU_LEN_MIN: usize = ADDR_SIZE + CRC_SIZE + 2;

/// Fixed-capacity single-producer/single-consumer byte ring buffer. `N` must
/// be a power of two; the producer (`push`, ISR context) and the consumer
/// (`drain_into`, main-loop context) never block each other.
pub struct RingBuffer<const N: usize> {
    buf: Box<[std::cell::UnsafeCell<u8>; N]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Safety: `push` is the sole writer of `head` and of the cells between the
// old and new head; `drain_into` is the sole writer of `tail` and the sole
// reader of cells between tail and head. A single producer and single
// consumer never touch the same cell concurrently.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        assert!(N.is_power_of_two(), "ring buffer capacity must be a power of two");
        RingBuffer {
            buf: Box::new(std::array::from_fn(|_| std::cell::UnsafeCell::new(0))),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }
}

impl<const N: usize> RingBuffer<N> {
    pub fn new() -> Self {
        Self::default()
    }

    fn mask(index: usize) -> usize {
        index & (N - 1)
    }

    /// Space available for the producer, `0..=N-1`. One slot is always kept
    /// reserved so a full buffer (`head == tail + N - 1`) is distinguishable
    /// from an empty one (`head == tail`).
    fn space(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        N - 1 - head.wrapping_sub(tail)
    }

    /// Push one byte. Silently dropped if the buffer is full.
    pub fn push(&self, byte: u8) -> bool {
        if self.space() == 0 {
            return false;
        }
        let head = self.head.load(Ordering::Relaxed);
        // Safety: sole producer; slot is not in the consumer's live range
        // because `space()` confirmed room beyond the current tail.
        unsafe { *self.buf[Self::mask(head)].get() = byte };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Drain everything currently buffered into `out`, returning the number
    /// of bytes drained (capped at `out.len()`; excess bytes are left
    /// queued for the next drain).
    pub fn drain_into(&self, out: &mut [u8]) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let mut tail = self.tail.load(Ordering::Relaxed);
        let mut n = 0;
        while tail != head && n < out.len() {
            // Safety: sole consumer; cell at `tail` was published by the
            // producer's Release store of `head` past this index.
            out[n] = unsafe { *self.buf[Self::mask(tail)].get() };
            tail = tail.wrapping_add(1);
            n += 1;
        }
        self.tail.store(tail, Ordering::Release);
        n
    }
}

/// Running byte/frame counters, mirroring `serial_link_stats_t`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    pub rx_chars: u64,
    pub tx_chars: u64,
    pub bad_frames: u64,
    pub good_frames: u64,
}

/// Host glue for a [`SerialLink`]: how a composed response frame reaches the
/// wire.
pub trait LinkContext {
    fn send_frame(&mut self, frame: &[u8]);
}

/// The serial link state machine: owns the ingress ring buffer, the
/// in-progress frame, and the application [`Dispatcher`] it hands completed
/// requests to.
pub struct SerialLink<S: RegisterStore + 'static, C: LinkContext, const N: usize = 512> {
    recv: RingBuffer<N>,
    slave_id: u8,
    dispatcher: Dispatcher<S>,
    registers: crate::register::RegisterTable<S>,
    context: C,
    stats: LinkStats,
}

impl<S: RegisterStore + 'static, C: LinkContext, const N: usize> SerialLink<S, C, N> {
    pub fn new(slave_id: u8, registers: crate::register::RegisterTable<S>, context: C) -> Self {
        SerialLink {
            recv: RingBuffer::new(),
            slave_id,
            dispatcher: Dispatcher::default(),
            registers,
            context,
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn set_slave_id(&mut self, slave_id: u8) {
        self.slave_id = slave_id;
    }

    pub fn set_context(&mut self, context: C) {
        self.context = context;
    }

    /// ISR-safe: enqueue one received byte. Dropped silently if the ring
    /// buffer is full.
    pub fn putchar(&mut self, byte: u8) {
        if self.recv.push(byte) {
            self.stats.rx_chars += 1;
        }
    }

    /// Called by the host after it has decided, by its own idle-timeout
    /// logic, that a full frame has arrived. Drains the ring buffer, checks
    /// length/address/CRC (in that order), dispatches to the application
    /// layer on success, and sends the composed response through
    /// [`LinkContext::send_frame`].
    ///
    /// Returns the reason a malformed or foreign-address frame was dropped;
    /// none of these produce a reply.
    pub fn frame_delimited(&mut self) -> Result<(), LinkError> {
        let mut frame = [0u8; 256];
        let len = self.recv.drain_into(&mut frame);
        let frame = &frame[..len];

        if frame.len() < APDU_LEN_MIN {
            self.stats.bad_frames += 1;
            return Err(LinkError::Frame);
        }

        if frame[0] != self.slave_id {
            return Err(LinkError::Addr);
        }

        let crc = crc16_modbus(&frame[..frame.len() - CRC_SIZE]);
        let [lo, hi] = crc.to_le_bytes();
        if frame[frame.len() - CRC_SIZE] != lo || frame[frame.len() - 1] != hi {
            self.stats.bad_frames += 1;
            return Err(LinkError::Frame);
        }

        self.stats.good_frames += 1;

        let pdu = &frame[ADDR_SIZE..frame.len() - CRC_SIZE];
        let response_pdu = self.dispatcher.dispatch(&mut self.registers, pdu);

        let mut out = Vec::with_capacity(1 + response_pdu.len() + CRC_SIZE);
        out.push(self.slave_id);
        out.extend_from_slice(&response_pdu);
        let crc = crc16_modbus(&out);
        out.extend_from_slice(&crc.to_le_bytes());

        self.stats.tx_chars += out.len() as u64;
        self.context.send_frame(&out);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RegValue, ValueTag};
    use crate::error::StoreError;
    use crate::register::{Permission, Ref, RegisterDescriptor, RegisterTable};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct MapStore(HashMap<Ref, RegValue>);

    impl RegisterStore for MapStore {
        fn load(&mut self, reference: Ref, _tag: ValueTag) -> Result<RegValue, StoreError> {
            self.0.get(&reference).copied().ok_or(StoreError::NotFound)
        }

        fn save(&mut self, reference: Ref, value: RegValue) -> Result<(), StoreError> {
            self.0.insert(reference, value);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct CapturingContext(Arc<Mutex<Vec<Vec<u8>>>>);

    impl LinkContext for CapturingContext {
        fn send_frame(&mut self, frame: &[u8]) {
            self.0.lock().unwrap().push(frame.to_vec());
        }
    }

    static HOLDING: [RegisterDescriptor; 1] =
        [RegisterDescriptor::new(40001, 1, ValueTag::Integer, 0, Permission::READ_WRITE)];

    fn link() -> (SerialLink<MapStore, CapturingContext>, CapturingContext) {
        let mut store = HashMap::new();
        store.insert(40001, RegValue::Integer(0x1234));
        let table = RegisterTable::new(&HOLDING, MapStore(store));
        let ctx = CapturingContext::default();
        (SerialLink::new(0x01, table, ctx.clone()), ctx)
    }

    fn push_frame(link: &mut SerialLink<MapStore, CapturingContext>, pdu_with_addr: &[u8]) {
        let crc = crc16_modbus(pdu_with_addr);
        for &b in pdu_with_addr {
            link.putchar(b);
        }
        for &b in &crc.to_le_bytes() {
            link.putchar(b);
        }
    }

    #[test]
    fn ring_buffer_fifo_order() {
        let ring: RingBuffer<8> = RingBuffer::new();
        for b in [1, 2, 3] {
            assert!(ring.push(b));
        }
        let mut out = [0u8; 8];
        assert_eq!(ring.drain_into(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn ring_buffer_drops_on_full() {
        let ring: RingBuffer<4> = RingBuffer::new();
        for _ in 0..3 {
            assert!(ring.push(0xAA));
        }
        assert!(!ring.push(0xBB));
    }

    #[test]
    fn valid_frame_dispatches_and_sends_response() {
        let (mut link, ctx) = link();
        // function 3 (read holding), ref 40001 (offset 0), count 1
        push_frame(&mut link, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        link.frame_delimited().unwrap();
        let sent = ctx.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        assert_eq!(&frame[..4], &[0x01, 0x03, 0x02, 0x12]);
        assert_eq!(link.stats().good_frames, 1);
    }

    #[test]
    fn foreign_address_is_dropped_without_reply() {
        let (mut link, ctx) = link();
        push_frame(&mut link, &[0x02, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(link.frame_delimited(), Err(LinkError::Addr));
        assert!(ctx.0.lock().unwrap().is_empty());
    }

    #[test]
    fn bad_crc_is_dropped() {
        let (mut link, ctx) = link();
        link.putchar(0x01);
        link.putchar(0x03);
        link.putchar(0x00);
        link.putchar(0x00);
        link.putchar(0x00);
        link.putchar(0x01);
        link.putchar(0xDE);
        link.putchar(0xAD);
        assert_eq!(link.frame_delimited(), Err(LinkError::Frame));
        assert_eq!(link.stats().bad_frames, 1);
        assert!(ctx.0.lock().unwrap().is_empty());
    }

    #[test]
    fn too_short_frame_is_dropped() {
        let (mut link, _ctx) = link();
        link.putchar(0x01);
        link.putchar(0x03);
        assert_eq!(link.frame_delimited(), Err(LinkError::Frame));
        assert_eq!(link.stats().bad_frames, 1);
    }
}
