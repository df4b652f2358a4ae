//! Ring primitives: the cycle-bit protocol shared by the Command Ring and
//! every Transfer Ring, and the consumer-side Event Ring.
//!
//! Unlike the teacher's device-emulation rings (which *consume*
//! driver-written Command/Transfer TRBs and *produce* Event TRBs), this
//! crate implements the driver side: [`CommandRing`] and [`TransferRing`]
//! are producers here, [`EventRing`] is the consumer. The bookkeeping
//! (cursor, PCS/CCS, LINK-TRB traversal) mirrors the teacher's `rings.rs`
//! with the direction of every operation reversed.

use tracing::trace;

use crate::capability::HostMemRef;
use crate::xhci::context::EP0_ID;
use crate::xhci::trb::{trb_type, Trb, TRB_SIZE};

/// Segments of a transfer descriptor never cross this boundary, matching the
/// 64 KiB limit the xHCI specification places on a single TRB's data buffer.
const SEGMENT_BOUNDARY: u64 = 0x1_0000;

/// A producer-side cycle ring: the shared implementation behind
/// [`CommandRing`] and [`TransferRing`]. The last of `capacity` slots is a
/// permanent LINK TRB back to the ring base, with Toggle Cycle set.
#[derive(Debug)]
pub(crate) struct ProducerRing {
    mem: HostMemRef,
    base: u64,
    capacity: usize,
    cursor: usize,
    pcs: bool,
}

impl ProducerRing {
    /// Allocate-and-initialize a new producer ring of `capacity` TRB slots
    /// (including the trailing LINK slot) at a 64-byte-aligned, `capacity *
    /// 16`-byte DMA allocation.
    pub(crate) fn new(mem: HostMemRef, capacity: usize) -> Self {
        assert!(capacity >= 2, "a ring needs at least one usable slot");
        let base = mem.alloc_dma((capacity * TRB_SIZE) as u64, 64);

        let mut ring = Self {
            mem,
            base,
            capacity,
            cursor: 0,
            pcs: true,
        };

        let mut link = Trb::make(trb_type::LINK);
        link.set_parameter(ring.base);
        link.set_toggle_cycle(true);
        link.set_cycle(false);
        ring.write_trb(ring.slot_addr(capacity - 1), link);
        ring
    }

    /// The base address of the ring's DMA allocation.
    pub(crate) const fn base(&self) -> u64 {
        self.base
    }

    fn slot_addr(&self, index: usize) -> u64 {
        self.base + (index * TRB_SIZE) as u64
    }

    fn write_trb(&self, addr: u64, trb: Trb) {
        self.mem.write_bytes(addr, &trb.to_bytes());
    }

    /// Enqueue `trb`, returning the address it was written to. The cycle bit
    /// is written last (set to the ring's current PCS) regardless of
    /// whatever the caller left in it. If this enqueue fills the last usable
    /// slot, the trailing LINK TRB's cycle bit is refreshed to match the new
    /// PCS and the cursor wraps to the ring head, flipping PCS exactly once.
    pub(crate) fn enqueue(&mut self, mut trb: Trb) -> u64 {
        let addr = self.slot_addr(self.cursor);
        trb.set_cycle(self.pcs);
        self.write_trb(addr, trb);

        self.cursor += 1;
        if self.cursor == self.capacity - 1 {
            let link_addr = self.slot_addr(self.capacity - 1);
            let mut link = Trb::make(trb_type::LINK);
            link.set_parameter(self.base);
            link.set_toggle_cycle(true);
            link.set_cycle(self.pcs);
            self.write_trb(link_addr, link);

            trace!(ring_base = %format_args!("{:#x}", self.base), "ring wrapped, PCS flipped");
            self.pcs = !self.pcs;
            self.cursor = 0;
        }

        addr
    }

    /// Number of usable (non-LINK) slots.
    pub(crate) const fn usable_capacity(&self) -> usize {
        self.capacity - 1
    }

    /// The address the *next* [`Self::enqueue`] will write to, without
    /// mutating any state. Used to compute a TRB's own address before it is
    /// written (the EVENT_DATA TRB's pointer field points at itself).
    pub(crate) fn next_address(&self) -> u64 {
        self.slot_addr(self.cursor)
    }

    /// Current producer cycle state, exposed for tests.
    #[cfg(test)]
    pub(crate) const fn pcs(&self) -> bool {
        self.pcs
    }

    /// Current cursor position, exposed for tests.
    #[cfg(test)]
    pub(crate) const fn cursor(&self) -> usize {
        self.cursor
    }
}

/// The Command Ring: carries Command TRBs from driver to controller.
#[derive(Debug)]
pub struct CommandRing {
    ring: ProducerRing,
}

impl CommandRing {
    /// Default number of TRB slots, including the trailing LINK.
    pub const DEFAULT_CAPACITY: usize = 32;

    /// Allocate a new command ring of `capacity` slots.
    #[must_use]
    pub fn new(mem: HostMemRef, capacity: usize) -> Self {
        Self {
            ring: ProducerRing::new(mem, capacity),
        }
    }

    /// The ring's DMA base address, published to `CRCR`.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.ring.base()
    }

    /// Enqueue a single command TRB, returning its DMA address (used to
    /// correlate the eventual `EV_CMD_CMPL`).
    pub fn enqueue(&mut self, trb: Trb) -> u64 {
        self.ring.enqueue(trb)
    }
}

/// A Transfer Ring: carries Normal/Setup/Data/Status Stage TRBs for a single
/// endpoint from driver to controller.
#[derive(Debug)]
pub struct TransferRing {
    ring: ProducerRing,
}

impl TransferRing {
    /// Default number of TRB slots, including the trailing LINK.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Allocate a new transfer ring of `capacity` slots.
    #[must_use]
    pub fn new(mem: HostMemRef, capacity: usize) -> Self {
        Self {
            ring: ProducerRing::new(mem, capacity),
        }
    }

    /// The ring's DMA base address, used as the endpoint context's TR
    /// Dequeue Pointer.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.ring.base()
    }

    /// Enqueue a single transfer-ring TRB, returning its DMA address.
    pub fn enqueue(&mut self, trb: Trb) -> u64 {
        self.ring.enqueue(trb)
    }

    /// Largest transfer this ring can cover in one TD without running out of
    /// segments, purely informational (segmentation itself has no cap other
    /// than the 64 KiB-boundary rule).
    #[must_use]
    pub const fn usable_capacity(&self) -> usize {
        self.ring.usable_capacity()
    }

    /// Build and enqueue a Transfer Descriptor moving `len` bytes starting at
    /// DMA address `addr`, for endpoint `ep_id` with max packet size `mps`
    /// and direction `dir_in`.
    ///
    /// The buffer is split into segments that never cross a 64 KiB boundary.
    /// `ep_id == EP0_ID` builds a control-transfer Data Stage (the first
    /// segment is a DATA_STAGE TRB, direction-tagged; any further segments
    /// are NORMAL); any other endpoint builds an all-NORMAL bulk TD. Every
    /// segment carries the chain bit; the last additionally carries
    /// Evaluate Next TRB. A trailing EVENT_DATA TRB with IOC set closes the
    /// TD; its own address (self-referential, per the xHCI Event Data
    /// convention) is returned so the caller can correlate the eventual
    /// EV_TRANSFER event.
    pub fn enqueue_td(&mut self, ep_id: u8, mps: u16, addr: u64, len: u32, dir_in: bool) -> u64 {
        let is_control = ep_id == EP0_ID;
        let mps = u32::from(mps).max(1);
        let total_packets = len.div_ceil(mps).max(1);

        let mut segments: Vec<(u64, u32)> = Vec::new();
        if len == 0 {
            segments.push((addr, 0));
        } else {
            let mut cur = addr;
            let mut remaining = len;
            while remaining > 0 {
                let until_boundary = (SEGMENT_BOUNDARY - (cur % SEGMENT_BOUNDARY)) as u32;
                let seg_len = remaining.min(until_boundary);
                segments.push((cur, seg_len));
                cur += u64::from(seg_len);
                remaining -= seg_len;
            }
        }

        let last_index = segments.len() - 1;
        let mut consumed_packets = 0u32;
        for (i, (seg_addr, seg_len)) in segments.iter().enumerate() {
            let ty = if is_control && i == 0 {
                trb_type::DATA_STAGE
            } else {
                trb_type::NORMAL
            };
            let mut trb = Trb::make(ty);
            trb.set_parameter(*seg_addr);
            trb.set_transfer_length(*seg_len);

            consumed_packets += seg_len.div_ceil(mps);
            let remaining_packets = total_packets.saturating_sub(consumed_packets);
            trb.set_td_size(remaining_packets.min(31));

            if is_control && i == 0 {
                trb.set_transfer_type_or_direction(u8::from(dir_in));
            } else if !is_control {
                trb.set_transfer_type_or_direction(u8::from(dir_in));
            }

            trb.set_chain(true);
            if i == last_index {
                trb.set_evaluate_next_trb(true);
            }

            self.enqueue(trb);
        }

        let event_data_addr = self.ring.next_address();
        let mut event_data = Trb::make(trb_type::EVENT_DATA);
        event_data.set_parameter(event_data_addr);
        event_data.set_interrupt_on_completion(true);
        self.enqueue(event_data);
        event_data_addr
    }
}

/// One entry of the Event Ring Segment Table. This crate only ever
/// publishes a single segment.
#[must_use]
pub fn erst_entry_bytes(segment_base: u64, trb_count: u32) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&segment_base.to_le_bytes());
    bytes[8..12].copy_from_slice(&trb_count.to_le_bytes());
    bytes
}

/// The Event Ring: the controller's sole channel for reporting command
/// completions, transfer completions, and port status changes back to the
/// driver.
#[derive(Debug)]
pub struct EventRing {
    mem: HostMemRef,
    base: u64,
    capacity: usize,
    dequeue: usize,
    ccs: bool,
}

impl EventRing {
    /// Default number of TRB slots in the single segment.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Allocate a new, empty event ring of `capacity` TRB slots.
    #[must_use]
    pub fn new(mem: HostMemRef, capacity: usize) -> Self {
        let base = mem.alloc_dma((capacity * TRB_SIZE) as u64, 64);
        Self {
            mem,
            base,
            capacity,
            dequeue: 0,
            ccs: true,
        }
    }

    /// The ring's DMA base address, the sole entry of the ERST.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Number of TRB slots in the segment, published via `ERSTSZ`'s
    /// companion segment-size field.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn slot_addr(&self, index: usize) -> u64 {
        self.base + (index * TRB_SIZE) as u64
    }

    /// The address the driver should currently publish via `ERDP`: the
    /// dequeue pointer, which trails the last-processed event by at most
    /// one slot (the ordering guarantee in the specification's concurrency
    /// section).
    #[must_use]
    pub fn dequeue_pointer(&self) -> u64 {
        self.slot_addr(self.dequeue)
    }

    /// Read the TRB at the dequeue pointer without consuming it. Returns
    /// `None` if its cycle bit does not match CCS (the ring is empty from
    /// the driver's point of view).
    #[must_use]
    pub fn peek(&self) -> Option<Trb> {
        let mut bytes = [0u8; TRB_SIZE];
        self.mem.read_bytes(self.slot_addr(self.dequeue), &mut bytes);
        let trb = Trb::from_bytes(bytes);
        (trb.cycle() == self.ccs).then_some(trb)
    }

    /// Advance past the event at the dequeue pointer. Must only be called
    /// after the event returned by [`Self::peek`] has been fully consumed,
    /// per the ordering guarantee that ERDP trails processing by at most
    /// one slot.
    pub fn advance(&mut self) {
        self.dequeue += 1;
        if self.dequeue == self.capacity {
            self.dequeue = 0;
            self.ccs = !self.ccs;
            trace!("event ring wrapped, CCS flipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeHostMem;
    use crate::xhci::trb::trb_type as tt;
    use std::sync::Arc;

    fn mem() -> HostMemRef {
        Arc::new(FakeHostMem::new(1 << 20))
    }

    #[test]
    fn ring_wraps_after_usable_capacity_enqueues() {
        let mut ring = ProducerRing::new(mem(), 4);
        assert_eq!(ring.usable_capacity(), 3);
        assert!(ring.pcs());

        for _ in 0..3 {
            ring.enqueue(Trb::make(tt::NORMAL));
        }

        // exactly usable_capacity() enqueues land us back at the ring head
        // with PCS flipped exactly once.
        assert_eq!(ring.cursor(), 0);
        assert!(!ring.pcs());
    }

    #[test]
    fn enqueue_writes_cycle_bit_matching_pcs_before_wrap() {
        let mem = mem();
        let mut ring = ProducerRing::new(mem.clone(), 4);
        let addr = ring.enqueue(Trb::make(tt::NORMAL));

        let mut bytes = [0u8; TRB_SIZE];
        mem.read_bytes(addr, &mut bytes);
        let trb = Trb::from_bytes(bytes);
        assert!(trb.cycle());
    }

    #[test]
    fn command_ring_base_is_64_byte_aligned() {
        let ring = CommandRing::new(mem(), CommandRing::DEFAULT_CAPACITY);
        assert_eq!(ring.base() % 64, 0);
    }

    #[test]
    fn event_ring_empty_until_controller_writes_matching_cycle() {
        let mem = mem();
        let ring = EventRing::new(mem.clone(), 4);
        assert!(ring.peek().is_none());

        let mut trb = Trb::make(tt::EV_COMMAND_COMPLETION);
        trb.set_cycle(true);
        mem.write_bytes(ring.base(), &trb.to_bytes());

        assert!(ring.peek().is_some());
    }

    #[test]
    fn event_ring_advance_wraps_and_flips_ccs() {
        let mem = mem();
        let mut ring = EventRing::new(mem.clone(), 2);
        for i in 0..2u64 {
            let mut trb = Trb::make(tt::EV_COMMAND_COMPLETION);
            trb.set_cycle(true);
            mem.write_bytes(ring.base() + i * TRB_SIZE as u64, &trb.to_bytes());
        }

        assert!(ring.peek().is_some());
        ring.advance();
        assert!(ring.peek().is_some());
        ring.advance();

        // wrapped: CCS flipped, so the same (cycle=true) TRBs no longer
        // look fresh.
        assert!(ring.peek().is_none());
    }

    #[test]
    fn control_td_emits_data_stage_then_event_data() {
        let mem = mem();
        let mut ring = TransferRing::new(mem.clone(), TransferRing::DEFAULT_CAPACITY);
        let event_addr = ring.enqueue_td(EP0_ID, 8, 0x1000, 8, true);

        let mut bytes = [0u8; TRB_SIZE];
        mem.read_bytes(ring.base(), &mut bytes);
        let data_stage = Trb::from_bytes(bytes);
        assert_eq!(data_stage.trb_type(), tt::DATA_STAGE);
        assert_eq!(data_stage.parameter(), 0x1000);
        assert_eq!(data_stage.transfer_length(), 8);
        assert!(data_stage.evaluate_next_trb());

        mem.read_bytes(ring.base() + TRB_SIZE as u64, &mut bytes);
        let event_data = Trb::from_bytes(bytes);
        assert_eq!(event_data.trb_type(), tt::EVENT_DATA);
        assert!(event_data.interrupt_on_completion());
        assert_eq!(event_data.parameter(), event_addr);
        assert_eq!(event_addr, ring.base() + TRB_SIZE as u64);
    }

    #[test]
    fn bulk_td_splits_exactly_on_64kib_boundary() {
        let mem = mem();
        let mut ring = TransferRing::new(mem.clone(), TransferRing::DEFAULT_CAPACITY);
        // A transfer starting one byte before a 64 KiB boundary must split
        // into a 1-byte segment and the remainder, never crossing it.
        let addr = SEGMENT_BOUNDARY - 1;
        ring.enqueue_td(2, 512, addr, 2, false);

        let mut bytes = [0u8; TRB_SIZE];
        mem.read_bytes(ring.base(), &mut bytes);
        let first = Trb::from_bytes(bytes);
        assert_eq!(first.trb_type(), tt::NORMAL);
        assert_eq!(first.parameter(), addr);
        assert_eq!(first.transfer_length(), 1);
        assert!(first.chain());
        assert!(!first.evaluate_next_trb());

        mem.read_bytes(ring.base() + TRB_SIZE as u64, &mut bytes);
        let second = Trb::from_bytes(bytes);
        assert_eq!(second.trb_type(), tt::NORMAL);
        assert_eq!(second.parameter(), SEGMENT_BOUNDARY);
        assert_eq!(second.transfer_length(), 1);
        assert!(second.evaluate_next_trb());
    }

    #[test]
    fn bulk_td_one_byte_past_boundary_still_splits() {
        let mem = mem();
        let mut ring = TransferRing::new(mem.clone(), TransferRing::DEFAULT_CAPACITY);
        let addr = SEGMENT_BOUNDARY - 1;
        ring.enqueue_td(2, 512, addr, 3, false);

        let mut bytes = [0u8; TRB_SIZE];
        mem.read_bytes(ring.base(), &mut bytes);
        let first = Trb::from_bytes(bytes);
        assert_eq!(first.transfer_length(), 1);

        mem.read_bytes(ring.base() + TRB_SIZE as u64, &mut bytes);
        let second = Trb::from_bytes(bytes);
        assert_eq!(second.transfer_length(), 2);
    }
}
