//! Controller reset/init, the DCBAA and scratchpad buffers, the ERST, and
//! the small set of register-level operations (doorbells, status polling)
//! every higher layer builds on.
//!
//! This is the "explicit Controller context" the specification's design
//! notes ask for in place of the original source's global `xhci`/`t`
//! singletons: every call site that needs the controller receives `&mut
//! Controller` (or `&Controller` for read-only register access) rather than
//! reaching for ambient state.

use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::capability::{BarBusRef, HostMemRef};
use crate::error::{DriverError, Result};
use crate::xhci::context::DeviceContextArray;
use crate::xhci::registers::{self as reg, portsc};
use crate::xhci::rings::{erst_entry_bytes, CommandRing, EventRing};
use crate::xhci::trb::Trb;

/// Timeouts governing every blocking point in the driver, all in
/// microseconds except the two millisecond fields inherited verbatim from
/// the USB 2.0 timing constants the specification cites.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Controller handshake (CNR clear on reset, HCH clear on run), in µs.
    pub handshake_us: u64,
    /// Command-completion wait, in µs, before the command ring is aborted.
    pub command_us: u64,
    /// Single event-ring poll, in µs.
    pub event_us: u64,
    /// Port debounce stability window (USB 2.0 §7.1.7.3).
    pub debounce_stable_ms: u64,
    /// Port debounce overall timeout (USB 2.0 §7.1.7.3).
    pub debounce_total_ms: u64,
    /// Port reset wait (USB 2.0 §7.1.7.5 allows up to 150 ms).
    pub port_reset_ms: u64,
    /// Reset-recovery sleep after a successful reset (USB 2.0 §7.1.7.5).
    pub reset_recovery_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake_us: 100_000,
            command_us: 100_000,
            event_us: 100_000,
            debounce_stable_ms: 100,
            debounce_total_ms: 1500,
            port_reset_ms: 150,
            reset_recovery_ms: 10,
        }
    }
}

/// Number of TRB slots in the allocated Command/Transfer/Event rings.
/// Large enough for the single-device topology this crate targets.
const DEFAULT_EP0_BOUNCE_SIZE: u64 = 4096;
const DEFAULT_BULK_BOUNCE_SIZE: u64 = 64 * 1024;

/// The driver-side handle for one xHCI host controller.
///
/// Owns every piece of DMA memory the controller reads or writes (DCBAA,
/// scratchpads, rings, bounce buffers) and the two capabilities
/// ([`BarBus`](crate::capability::BarBus) and
/// [`HostMem`](crate::capability::HostMem)) needed to reach it. Per the
/// specification's concurrency model this is used from a single thread of
/// control; nothing here is internally synchronized beyond what the
/// capability traits themselves require (`Send + Sync` so a caller may move
/// the whole driver, not so two threads may drive it at once).
#[derive(Debug)]
pub struct Controller {
    pub(crate) bar: BarBusRef,
    pub(crate) mem: HostMemRef,
    pub(crate) max_slots: u8,
    pub(crate) max_ports: u8,
    pub(crate) command_ring: CommandRing,
    pub(crate) event_ring: EventRing,
    pub(crate) dcbaa: DeviceContextArray,
    pub(crate) ep0_bounce: (u64, u64),
    pub(crate) bulk_bounce: (u64, u64),
    pub(crate) timeouts: Timeouts,
}

impl Controller {
    /// Reset and initialize the controller: HCRST, DCBAA/scratchpads, the
    /// command ring (CRCR), the event ring (a single-entry ERST, ERSTBA,
    /// ERDP), `CONFIG.MaxSlotsEn`, and finally Run/Stop.
    pub fn new(bar: BarBusRef, mem: HostMemRef, timeouts: Timeouts) -> Result<Self> {
        let hcsparams1 = bar.read32(reg::HCSPARAMS1);
        let max_slots = (hcsparams1 & 0xff) as u8;
        let max_ports = ((hcsparams1 >> 24) & 0xff) as u8;
        let hcsparams2 = bar.read32(reg::HCSPARAMS2);
        let max_scratchpads =
            (((hcsparams2 >> 21) & 0x1f) | ((hcsparams2 >> 27) & 0x1f) << 5) as u64;

        debug!(max_slots, max_ports, max_scratchpads, "controller capabilities read");

        Self::reset_controller(&bar, timeouts.handshake_us)?;

        let dcbaa = DeviceContextArray::allocate(mem.clone(), max_slots);
        if max_scratchpads > 0 {
            let array = mem.alloc_dma(max_scratchpads * 8, 64);
            for i in 0..max_scratchpads {
                let buf = mem.alloc_dma(4096, 4096);
                mem.write_u64(array + i * 8, buf);
            }
            dcbaa.set_scratchpad_array(array);
        }
        bar.write64(reg::DCBAAP, dcbaa.base());

        let command_ring = CommandRing::new(mem.clone(), CommandRing::DEFAULT_CAPACITY);
        // CRCR.RCS is consumed only on this initial write; it must match the
        // ring's initial PCS of 1.
        bar.write64(reg::CRCR, command_ring.base() | reg::CRCR_RCS);

        let event_ring = EventRing::new(mem.clone(), EventRing::DEFAULT_CAPACITY);
        let erst_base = mem.alloc_dma(16, 64);
        mem.write_bytes(
            erst_base,
            &erst_entry_bytes(event_ring.base(), event_ring.capacity()),
        );
        bar.write32(reg::ERSTSZ, 1);
        bar.write64(reg::ERDP, event_ring.dequeue_pointer());
        bar.write64(reg::ERSTBA, erst_base);

        bar.write32(reg::CONFIG, u32::from(max_slots));

        let ep0_bounce = (mem.alloc_dma(DEFAULT_EP0_BOUNCE_SIZE, 64), DEFAULT_EP0_BOUNCE_SIZE);
        let bulk_bounce = (mem.alloc_dma(DEFAULT_BULK_BOUNCE_SIZE, 64), DEFAULT_BULK_BOUNCE_SIZE);

        let mut controller = Self {
            bar,
            mem,
            max_slots,
            max_ports,
            command_ring,
            event_ring,
            dcbaa,
            ep0_bounce,
            bulk_bounce,
            timeouts,
        };

        controller.run()?;
        Ok(controller)
    }

    fn reset_controller(bar: &BarBusRef, handshake_us: u64) -> Result<()> {
        bar.write32(reg::USBCMD, reg::USBCMD_HCRST);
        poll_until(handshake_us, || bar.read32(reg::USBSTS) & reg::USBSTS_CNR == 0)
            .then_some(())
            .ok_or(DriverError::Timeout)
    }

    fn run(&mut self) -> Result<()> {
        let cmd = self.bar.read32(reg::USBCMD);
        self.bar.write32(reg::USBCMD, cmd | reg::USBCMD_RUN);
        let bar = &self.bar;
        poll_until(self.timeouts.handshake_us, || {
            bar.read32(reg::USBSTS) & reg::USBSTS_HCH == 0
        })
        .then_some(())
        .ok_or(DriverError::Timeout)
    }

    /// Number of device slots the controller enabled (`CONFIG.MaxSlotsEn`).
    #[must_use]
    pub const fn max_slots(&self) -> u8 {
        self.max_slots
    }

    /// Number of root hub ports (`HCSPARAMS1.MaxPorts`).
    #[must_use]
    pub const fn max_ports(&self) -> u8 {
        self.max_ports
    }

    /// Access the Device Context Base Address Array.
    #[must_use]
    pub const fn dcbaa(&self) -> &DeviceContextArray {
        &self.dcbaa
    }

    /// Access the physical-memory capability, for allocating Input Contexts
    /// and Transfer Rings outside this module.
    #[must_use]
    pub fn mem(&self) -> HostMemRef {
        self.mem.clone()
    }

    /// The EP0/control-transfer DMA bounce buffer `(addr, size)`.
    #[must_use]
    pub const fn ep0_bounce(&self) -> (u64, u64) {
        self.ep0_bounce
    }

    /// The bulk-transfer DMA bounce buffer `(addr, size)`.
    #[must_use]
    pub const fn bulk_bounce(&self) -> (u64, u64) {
        self.bulk_bounce
    }

    /// The configured timeouts.
    #[must_use]
    pub const fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Ring a doorbell: `slot_id == 0` targets the Command Ring doorbell
    /// (value must be 0); any other slot targets that device's doorbell
    /// array entry (value selects the endpoint/stream).
    pub fn ring_doorbell(&self, slot_id: u8, value: u32) {
        trace!(slot_id, value, "ringing doorbell");
        self.bar
            .write32(reg::DOORBELL_BASE + u64::from(slot_id) * reg::DOORBELL_STRIDE, value);
    }

    /// Read a port's raw `PORTSC` register.
    #[must_use]
    pub fn read_portsc(&self, port: u8) -> u32 {
        self.bar.read32(Self::portsc_offset(port))
    }

    /// Write a port's raw `PORTSC` register verbatim (no RW1C handling).
    pub fn write_portsc(&self, port: u8, value: u32) {
        self.bar.write32(Self::portsc_offset(port), value);
    }

    fn portsc_offset(port: u8) -> u64 {
        reg::PORTSC_BASE + u64::from(port - 1) * reg::PORTSC_STRIDE
    }

    /// Clear `PORTSC`'s RW1C change bits without disturbing the
    /// non-RW1C writable bits (currently just Port Power), per the
    /// read-modify-write contract in the specification's root-hub section.
    pub fn acknowledge_port_changes(&self, port: u8) {
        let current = self.read_portsc(port);
        let preserved = current & portsc::PRESERVE_MASK;
        self.write_portsc(port, preserved | portsc::ALL_CHANGE_BITS);
    }

    /// Poll the Event Ring once. Returns the next unconsumed event without
    /// advancing the dequeue pointer; the caller must call
    /// [`Self::advance_event`] once it has fully processed the event, per
    /// the ordering guarantee that ERDP trails the last-processed event by
    /// at most one slot.
    #[must_use]
    pub fn peek_event(&self) -> Option<Trb> {
        self.event_ring.peek()
    }

    /// Advance past the event returned by [`Self::peek_event`] and publish
    /// the new dequeue pointer via `ERDP`.
    pub fn advance_event(&mut self) {
        self.event_ring.advance();
        self.bar.write64(reg::ERDP, self.event_ring.dequeue_pointer());
    }

    /// Block until an event satisfying `matches` appears on the Event Ring
    /// (consuming and advancing past every event along the way, dispatching
    /// unmatched ones to `on_unmatched`), or `timeout_us` elapses.
    pub fn wait_for_event(
        &mut self,
        timeout_us: u64,
        mut matches: impl FnMut(&Trb) -> bool,
        mut on_unmatched: impl FnMut(&mut Self, Trb),
    ) -> Result<Trb> {
        let deadline = Instant::now() + Duration::from_micros(timeout_us);
        loop {
            if let Some(trb) = self.peek_event() {
                if matches(&trb) {
                    self.advance_event();
                    return Ok(trb);
                }
                self.advance_event();
                on_unmatched(self, trb);
                continue;
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout);
            }
            sleep(Duration::from_micros(1));
        }
    }

    /// The default, no-op unmatched-event handler: logs and moves on. Used
    /// by callers that only care about one specific event and are content
    /// to let [`crate::xhci::controller::dispatch_unhandled`] absorb the
    /// rest.
    pub fn log_unmatched_event(&mut self, trb: Trb) {
        dispatch_unhandled(self, trb);
    }
}

/// The event dispatcher for events neither the command engine nor the
/// transfer engine's synchronous correlator claimed.
///
/// This is Open Question (b) from the specification: the interrupt-queue
/// delivery path that would fan `EV_TRANSFER` events for non-control
/// endpoints out to queued URBs is intentionally not built. Every event
/// reaching this function has already been dequeued (ERDP already
/// advanced); this is purely a classify-and-log sink so the event ring
/// never stalls behind work nobody is waiting for.
pub fn dispatch_unhandled(_controller: &mut Controller, trb: Trb) {
    use crate::xhci::trb::trb_type;
    match trb.trb_type() {
        trb_type::EV_TRANSFER => {
            debug!(
                slot_id = trb.slot_id(),
                endpoint_id = trb.endpoint_id(),
                cc = ?trb.completion_code(),
                "unclaimed transfer event (no interrupt-queue delivery)"
            );
        }
        trb_type::EV_PORT_STATUS_CHANGE => {
            debug!(port_id = trb.port_id(), "port status change event");
        }
        trb_type::EV_HOST_CONTROLLER => {
            warn!(cc = ?trb.completion_code(), "host controller event");
        }
        other => {
            warn!(trb_type = other, "unrecognized event TRB type, ignoring");
        }
    }
}

/// Busy-poll `condition` at 1 µs granularity until it is true or
/// `timeout_us` elapses. Returns whether it became true in time.
fn poll_until(timeout_us: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_micros(timeout_us);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_micros(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeBarBus, FakeHostMem};
    use std::sync::Arc;

    fn new_controller_fixture(max_slots: u8, max_ports: u8) -> Controller {
        let bar = Arc::new(FakeBarBus::new(0x4000));
        bar.write32(reg::HCSPARAMS1, u32::from(max_slots) | (u32::from(max_ports) << 24));
        // CNR clears immediately and HCH clears immediately in this fixture
        // (no real reset latency to model).
        let mem = Arc::new(FakeHostMem::new(1 << 20));
        Controller::new(bar, mem, Timeouts::default()).unwrap()
    }

    #[test]
    fn new_reads_capabilities_and_starts_the_controller() {
        let controller = new_controller_fixture(8, 4);
        assert_eq!(controller.max_slots(), 8);
        assert_eq!(controller.max_ports(), 4);
        assert_eq!(controller.bar.read32(reg::USBSTS) & reg::USBSTS_HCH, 0);
    }

    #[test]
    fn dcbaap_points_at_allocated_array() {
        let controller = new_controller_fixture(4, 1);
        assert_eq!(controller.bar.read64(reg::DCBAAP), controller.dcbaa.base());
    }

    #[test]
    fn acknowledge_port_changes_preserves_port_power_and_clears_change_bits() {
        let controller = new_controller_fixture(4, 1);
        controller.write_portsc(1, portsc::PP | portsc::CSC | portsc::PRC);
        controller.acknowledge_port_changes(1);
        let after = controller.read_portsc(1);
        assert_eq!(after & portsc::PP, portsc::PP);
        assert_eq!(after & portsc::ALL_CHANGE_BITS, portsc::ALL_CHANGE_BITS);

        // A second acknowledge is idempotent: the change bits are already
        // clear in hardware terms, so nothing should change in the fixture
        // beyond what this read-modify-write always writes.
        let before = controller.read_portsc(1);
        controller.acknowledge_port_changes(1);
        assert_eq!(controller.read_portsc(1), before);
    }

    #[test]
    fn ring_doorbell_writes_expected_offset() {
        let controller = new_controller_fixture(4, 1);
        controller.ring_doorbell(3, 1);
        assert_eq!(
            controller.bar.read32(reg::DOORBELL_BASE + 3 * reg::DOORBELL_STRIDE),
            1
        );
    }
}
