//! The Device Context / Input Context / Endpoint Context memory model.
//!
//! These are 32-byte records the controller reads and writes via DMA.
//! Reimplemented here as statically checked bitfield views (per the
//! specification's design note on replacing the original's dynamic
//! bit-slice `Data` class), each backed by a plain `[u32; 8]` the caller
//! reads from or writes to `HostMem` wholesale.

use crate::capability::HostMemRef;

/// Size in bytes of a single Slot or Endpoint Context.
pub const CONTEXT_SIZE: usize = 0x20;

/// Endpoint ID for EP0 (control), the only endpoint whose ID does not
/// depend on direction.
pub const EP0_ID: u8 = 1;

/// Compute the endpoint ID the controller expects: `2 * number +
/// (direction == IN)`, with EP0 always `1`.
#[must_use]
pub const fn endpoint_id(number: u8, is_in: bool) -> u8 {
    if number == 0 {
        EP0_ID
    } else {
        2 * number + is_in as u8
    }
}

/// Endpoint Type values (xHCI spec table 6.9).
#[allow(missing_docs)]
pub mod endpoint_type {
    pub const ISOCH_OUT: u32 = 1;
    pub const BULK_OUT: u32 = 2;
    pub const INTERRUPT_OUT: u32 = 3;
    pub const CONTROL: u32 = 4;
    pub const ISOCH_IN: u32 = 5;
    pub const BULK_IN: u32 = 6;
    pub const INTERRUPT_IN: u32 = 7;
}

/// Endpoint State values (xHCI spec table 6.8).
#[allow(missing_docs)]
pub mod endpoint_state {
    pub const DISABLED: u32 = 0;
    pub const RUNNING: u32 = 1;
    pub const HALTED: u32 = 2;
    pub const STOPPED: u32 = 3;
    pub const ERROR: u32 = 4;
}

fn bits(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1u32 << width) - 1)
}

fn set_bits(word: &mut u32, shift: u32, width: u32, value: u32) {
    let mask = ((1u32 << width) - 1) << shift;
    *word = (*word & !mask) | ((value << shift) & mask);
}

/// A 32-byte Slot Context: topology, speed, and state of one device slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotContext {
    words: [u32; 8],
}

impl SlotContext {
    /// A zeroed slot context.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { words: [0; 8] }
    }

    /// Decode from a 32-byte DMA read.
    #[must_use]
    pub fn from_bytes(bytes: [u8; CONTEXT_SIZE]) -> Self {
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Self { words }
    }

    /// Encode to the 32-byte DMA representation.
    #[must_use]
    pub fn to_bytes(self) -> [u8; CONTEXT_SIZE] {
        let mut bytes = [0u8; CONTEXT_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Route String (20 bits): identifies the path from the root hub to
    /// this device through intermediate hub ports, one nibble per tier.
    #[must_use]
    pub const fn route_string(&self) -> u32 {
        bits(self.words[0], 0, 20)
    }

    /// Set the Route String.
    pub fn set_route_string(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[0], 0, 20, value);
        self
    }

    /// Speed plus one (`0` means "use Port Speed instead").
    #[must_use]
    pub const fn speed1(&self) -> u32 {
        bits(self.words[0], 20, 4)
    }

    /// Set the Speed field.
    pub fn set_speed1(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[0], 20, 4, value);
        self
    }

    /// Context Entries: number of valid endpoint contexts following this
    /// one (1 = EP0 only).
    #[must_use]
    pub const fn context_entries(&self) -> u32 {
        bits(self.words[0], 27, 5)
    }

    /// Set Context Entries.
    pub fn set_context_entries(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[0], 27, 5, value);
        self
    }

    /// Root Hub Port Number this device (or its topmost ancestor hub) is
    /// attached to.
    #[must_use]
    pub const fn root_hub_port(&self) -> u32 {
        bits(self.words[1], 16, 8)
    }

    /// Set the Root Hub Port Number.
    pub fn set_root_hub_port(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[1], 16, 8, value);
        self
    }

    /// TT Hub Slot ID, valid only when this device hangs off a
    /// Transaction Translator.
    #[must_use]
    pub const fn tt_hub_slot_id(&self) -> u32 {
        bits(self.words[2], 0, 8)
    }

    /// Set the TT Hub Slot ID.
    pub fn set_tt_hub_slot_id(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[2], 0, 8, value);
        self
    }

    /// TT Port Number.
    #[must_use]
    pub const fn tt_port_number(&self) -> u32 {
        bits(self.words[2], 8, 8)
    }

    /// Set the TT Port Number.
    pub fn set_tt_port_number(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[2], 8, 8, value);
        self
    }

    /// USB Device Address assigned by `Address Device`, valid after the
    /// controller has written this context back.
    #[must_use]
    pub const fn usb_device_address(&self) -> u32 {
        bits(self.words[3], 0, 8)
    }

    /// Slot State (xHCI spec table 4.3): `0` Disabled/Enabled, `1`
    /// Default, `2` Addressed, `3` Configured.
    #[must_use]
    pub const fn slot_state(&self) -> u32 {
        bits(self.words[3], 27, 8)
    }
}

/// A 32-byte Endpoint Context: transfer-ring linkage and scheduling
/// parameters for one endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointContext {
    words: [u32; 8],
}

impl EndpointContext {
    /// A zeroed endpoint context.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { words: [0; 8] }
    }

    /// Decode from a 32-byte DMA read.
    #[must_use]
    pub fn from_bytes(bytes: [u8; CONTEXT_SIZE]) -> Self {
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Self { words }
    }

    /// Encode to the 32-byte DMA representation.
    #[must_use]
    pub fn to_bytes(self) -> [u8; CONTEXT_SIZE] {
        let mut bytes = [0u8; CONTEXT_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Endpoint State (see [`endpoint_state`]).
    #[must_use]
    pub const fn state(&self) -> u32 {
        bits(self.words[0], 0, 3)
    }

    /// Interval, as `125us * 2^interval`.
    #[must_use]
    pub const fn interval(&self) -> u32 {
        bits(self.words[0], 16, 8)
    }

    /// Set the Interval field.
    pub fn set_interval(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[0], 16, 8, value);
        self
    }

    /// Error Count: retries remaining before the endpoint halts on error.
    #[must_use]
    pub const fn error_count(&self) -> u32 {
        bits(self.words[1], 1, 2)
    }

    /// Set the Error Count field.
    pub fn set_error_count(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[1], 1, 2, value);
        self
    }

    /// Endpoint Type (see [`endpoint_type`]).
    #[must_use]
    pub const fn endpoint_type(&self) -> u32 {
        bits(self.words[1], 3, 3)
    }

    /// Set the Endpoint Type field.
    pub fn set_endpoint_type(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[1], 3, 3, value);
        self
    }

    /// Max Burst Size.
    #[must_use]
    pub const fn max_burst_size(&self) -> u32 {
        bits(self.words[1], 8, 8)
    }

    /// Set the Max Burst Size field.
    pub fn set_max_burst_size(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[1], 8, 8, value);
        self
    }

    /// Max Packet Size.
    #[must_use]
    pub const fn max_packet_size(&self) -> u32 {
        bits(self.words[1], 16, 16)
    }

    /// Set the Max Packet Size field.
    pub fn set_max_packet_size(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[1], 16, 16, value);
        self
    }

    /// The TR Dequeue Pointer (64-bit, low 4 bits reused for DCS), and the
    /// Dequeue Cycle State bit packed into bit 0.
    #[must_use]
    pub const fn dequeue_pointer_and_cycle(&self) -> (u64, bool) {
        let low = self.words[2] as u64;
        let high = self.words[3] as u64;
        let raw = low | (high << 32);
        (raw & !0xf, raw & 1 != 0)
    }

    /// Set the TR Dequeue Pointer and Dequeue Cycle State.
    pub fn set_dequeue_pointer_and_cycle(&mut self, pointer: u64, cycle: bool) -> &mut Self {
        let raw = (pointer & !0xf) | (cycle as u64);
        self.words[2] = raw as u32;
        self.words[3] = (raw >> 32) as u32;
        self
    }

    /// Average TRB Length, used by the controller's bandwidth scheduler.
    #[must_use]
    pub const fn average_trb_length(&self) -> u32 {
        bits(self.words[4], 0, 16)
    }

    /// Set the Average TRB Length field.
    pub fn set_average_trb_length(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[4], 0, 16, value);
        self
    }

    /// Max ESIT Payload: `MPS * (MaxBurstSize + 1)`.
    #[must_use]
    pub const fn max_esit_payload(&self) -> u32 {
        bits(self.words[4], 16, 16)
    }

    /// Set the Max ESIT Payload field.
    pub fn set_max_esit_payload(&mut self, value: u32) -> &mut Self {
        set_bits(&mut self.words[4], 16, 16, value);
        self
    }
}

/// Number of endpoint context slots in a device's context (EP0 plus 30
/// direction-qualified endpoints, matching `epid` range `1..=31`).
pub const MAX_ENDPOINT_CONTEXTS: usize = 31;

/// An Input Context: the driver-prepared template consumed by Address
/// Device / Configure Endpoint / Evaluate Context commands. Laid out as
/// `{control context}{slot context}{endpoint contexts[1..=31]}`, each entry
/// `CONTEXT_SIZE` bytes, exactly as the controller expects to read it via
/// DMA.
#[derive(Debug)]
pub struct InputContext {
    mem: HostMemRef,
    base: u64,
}

impl InputContext {
    /// Offset of the Input Control Context (add/drop bitmaps) from `base`.
    pub const CONTROL_OFFSET: u64 = 0;
    /// Offset of the Slot Context from `base`.
    pub const SLOT_OFFSET: u64 = CONTEXT_SIZE as u64;
    /// Offset of endpoint context `epid` (`1..=31`) from `base`.
    #[must_use]
    pub const fn endpoint_offset(epid: u8) -> u64 {
        (2 + epid as u64 - 1) * CONTEXT_SIZE as u64
    }

    /// Total size of an Input Context.
    pub const SIZE: u64 = (2 + MAX_ENDPOINT_CONTEXTS as u64) * CONTEXT_SIZE as u64;

    /// Allocate a fresh, zeroed Input Context.
    #[must_use]
    pub fn allocate(mem: HostMemRef) -> Self {
        let base = mem.alloc_dma(Self::SIZE, 64);
        Self { mem, base }
    }

    /// The DMA address of the Input Context, passed to Address Device /
    /// Configure Endpoint commands.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Set bit `index` (`0` = slot, `epid` = endpoint) in the Add Context
    /// flags (`dword0`).
    pub fn set_add_flag(&self, index: u8) {
        let mut dword0 = self.mem.read_u32(self.base);
        dword0 |= 1 << index;
        self.mem.write_u32(self.base, dword0);
    }

    /// Set bit `index` in the Drop Context flags (`dword1`).
    pub fn set_drop_flag(&self, index: u8) {
        let mut dword1 = self.mem.read_u32(self.base + 4);
        dword1 |= 1 << index;
        self.mem.write_u32(self.base + 4, dword1);
    }

    /// Write the Slot Context.
    pub fn write_slot(&self, slot: SlotContext) {
        self.mem
            .write_bytes(self.base + Self::SLOT_OFFSET, &slot.to_bytes());
    }

    /// Write endpoint context `epid` (`1..=31`).
    pub fn write_endpoint(&self, epid: u8, ep: EndpointContext) {
        self.mem.write_bytes(
            self.base + Self::endpoint_offset(epid),
            &ep.to_bytes(),
        );
    }
}

/// The Device Context Array: the `max_slots + 1`-entry table of pointers
/// to per-slot Device Contexts (entry `0` points to the scratchpad-buffer
/// pointer array), published to the controller via `DCBAAP`.
#[derive(Debug)]
pub struct DeviceContextArray {
    mem: HostMemRef,
    base: u64,
    max_slots: u8,
}

impl DeviceContextArray {
    /// Allocate a zeroed DCBAA for `max_slots` device slots.
    #[must_use]
    pub fn allocate(mem: HostMemRef, max_slots: u8) -> Self {
        let entries = max_slots as u64 + 1;
        let base = mem.alloc_dma(entries * 8, 64);
        Self {
            mem,
            base,
            max_slots,
        }
    }

    /// The DMA address of the array, published via `DCBAAP`.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Publish entry `0`: the scratchpad-buffer pointer array address.
    pub fn set_scratchpad_array(&self, pointer: u64) {
        self.mem.write_u64(self.base, pointer);
    }

    /// Publish the Device Context pointer for `slot_id` (`1..=max_slots`).
    ///
    /// This resolves Open Question (a): a single aligned 64-bit write,
    /// performed before Address Device is issued, with no separate
    /// flush/barrier — `HostMem` writes are specified as immediately
    /// observable.
    pub fn publish_slot(&self, slot_id: u8, device_context_ptr: u64) {
        assert!(slot_id >= 1 && slot_id <= self.max_slots, "slot out of range");
        self.mem
            .write_u64(self.base + slot_id as u64 * 8, device_context_ptr);
    }

    /// Read back the Device Context pointer published for `slot_id`.
    #[must_use]
    pub fn slot_pointer(&self, slot_id: u8) -> u64 {
        assert!(slot_id >= 1 && slot_id <= self.max_slots, "slot out of range");
        self.mem.read_u64(self.base + slot_id as u64 * 8)
    }

    /// Read the live Slot Context for `slot_id` out of its Device Context.
    #[must_use]
    pub fn read_slot_context(&self, slot_id: u8) -> SlotContext {
        let device_ctx = self.slot_pointer(slot_id);
        let mut bytes = [0u8; CONTEXT_SIZE];
        self.mem.read_bytes(device_ctx, &mut bytes);
        SlotContext::from_bytes(bytes)
    }

    /// Read the live Endpoint Context `epid` for `slot_id` out of its
    /// Device Context.
    #[must_use]
    pub fn read_endpoint_context(&self, slot_id: u8, epid: u8) -> EndpointContext {
        let device_ctx = self.slot_pointer(slot_id);
        let offset = epid as u64 * CONTEXT_SIZE as u64;
        let mut bytes = [0u8; CONTEXT_SIZE];
        self.mem.read_bytes(device_ctx + offset, &mut bytes);
        EndpointContext::from_bytes(bytes)
    }

    /// Allocate a fresh, zeroed Device Context (slot + up to 31 endpoint
    /// contexts) the controller will write into as it processes Address
    /// Device / Configure Endpoint.
    #[must_use]
    pub fn allocate_device_context(&self) -> u64 {
        self.mem
            .alloc_dma((1 + MAX_ENDPOINT_CONTEXTS) as u64 * CONTEXT_SIZE as u64, 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeHostMem;
    use std::sync::Arc;

    #[test]
    fn slot_context_fields_round_trip() {
        let mut slot = SlotContext::zeroed();
        slot.set_route_string(0x1_2345 & 0xf_ffff)
            .set_speed1(2)
            .set_context_entries(1)
            .set_root_hub_port(3);

        let decoded = SlotContext::from_bytes(slot.to_bytes());
        assert_eq!(decoded.route_string(), 0x1_2345 & 0xf_ffff);
        assert_eq!(decoded.speed1(), 2);
        assert_eq!(decoded.context_entries(), 1);
        assert_eq!(decoded.root_hub_port(), 3);
    }

    #[test]
    fn endpoint_context_dequeue_pointer_round_trips_with_cycle() {
        let mut ep = EndpointContext::zeroed();
        ep.set_dequeue_pointer_and_cycle(0x1000, true);
        let (ptr, cycle) = ep.dequeue_pointer_and_cycle();
        assert_eq!(ptr, 0x1000);
        assert!(cycle);

        ep.set_dequeue_pointer_and_cycle(0x2000, false);
        let (ptr, cycle) = ep.dequeue_pointer_and_cycle();
        assert_eq!(ptr, 0x2000);
        assert!(!cycle);
    }

    #[test]
    fn endpoint_id_matches_spec_formula() {
        assert_eq!(endpoint_id(0, false), 1);
        assert_eq!(endpoint_id(0, true), 1);
        assert_eq!(endpoint_id(1, false), 2);
        assert_eq!(endpoint_id(1, true), 3);
        assert_eq!(endpoint_id(2, false), 4);
    }

    #[test]
    fn dcbaa_publish_slot_is_readable_back() {
        let mem: HostMemRef = Arc::new(FakeHostMem::new(1 << 16));
        let dcbaa = DeviceContextArray::allocate(mem, 8);
        dcbaa.publish_slot(3, 0x4000);
        assert_eq!(dcbaa.slot_pointer(3), 0x4000);
    }

    #[test]
    fn input_context_add_flags_accumulate() {
        let mem: HostMemRef = Arc::new(FakeHostMem::new(1 << 16));
        let ic = InputContext::allocate(mem.clone());
        ic.set_add_flag(0);
        ic.set_add_flag(1);
        assert_eq!(mem.read_u32(ic.base()), 0b11);
    }
}
