//! The transfer engine: control transfers over EP0 and single-TD bulk
//! transfers over any other endpoint.
//!
//! Every byte that crosses into DMA memory goes through one of the two
//! bounce buffers the controller allocated at init time (`ep0_bounce`,
//! `bulk_bounce`); callers never need to hand this layer a DMA-visible
//! buffer of their own.

use tracing::trace;

use crate::error::{DriverError, Result};
use crate::xhci::context::{endpoint_state, EP0_ID};
use crate::xhci::controller::Controller;
use crate::xhci::rings::TransferRing;
use crate::xhci::trb::{transfer_type, trb_type, Trb};

/// The 8-byte Setup Stage payload carried as immediate data in a Setup
/// Stage TRB's parameter field: `bmRequestType`, `bRequest`, `wValue`,
/// `wIndex`, `wLength`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupPacket {
    /// `bmRequestType`: direction (bit 7), type (bits 5-6), recipient
    /// (bits 0-4).
    pub request_type: u8,
    /// `bRequest`.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
    /// `wLength`: the data-stage byte count this request expects.
    pub length: u16,
}

impl SetupPacket {
    /// Encode to the little-endian 8-byte wire layout.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        [
            self.request_type,
            self.request,
            (self.value & 0xff) as u8,
            (self.value >> 8) as u8,
            (self.index & 0xff) as u8,
            (self.index >> 8) as u8,
            (self.length & 0xff) as u8,
            (self.length >> 8) as u8,
        ]
    }
}

impl Controller {
    /// Issue a control transfer on `slot_id`'s EP0.
    ///
    /// `dir_in` is the data stage's direction (ignored when
    /// `setup.length == 0`). `buf` supplies the OUT payload or receives the
    /// IN payload; its length must be at least `setup.length`.
    ///
    /// Follows the eight-step contract: reset EP0 first if its live state
    /// is past Running (Halted/Stopped/Error, e.g. after a prior stall),
    /// stage OUT data into the EP0 bounce buffer, enqueue Setup/Data/Status
    /// stage TRBs (IOC set on every stage, so each posts its own
    /// `EV_TRANSFER`), ring the doorbell, collect `2 + 𝟙{data_len>0}`
    /// transfer events correlated to `(slot_id, EP0_ID)`, then read IN data
    /// back out of the bounce buffer.
    pub fn control(
        &mut self,
        slot_id: u8,
        ep0_ring: &mut TransferRing,
        ep0_mps: u16,
        dir_in: bool,
        setup: SetupPacket,
        buf: &mut [u8],
    ) -> Result<u32> {
        if self.dcbaa.read_endpoint_context(slot_id, EP0_ID).state() > endpoint_state::RUNNING {
            self.reset_endpoint(slot_id, EP0_ID)?;
        }

        let data_len = u32::from(setup.length);
        let (bounce_addr, bounce_size) = self.ep0_bounce();
        if u64::from(data_len) > bounce_size {
            return Err(DriverError::ResourceError(format!(
                "control transfer of {data_len} bytes exceeds EP0 bounce buffer ({bounce_size} bytes)"
            )));
        }
        if !dir_in && data_len > 0 {
            self.mem.write_bytes(bounce_addr, &buf[..data_len as usize]);
        }

        let mut setup_trb = Trb::make(trb_type::SETUP_STAGE);
        setup_trb.set_parameter(u64::from_le_bytes(setup.to_bytes()));
        setup_trb.set_transfer_length(8);
        setup_trb.set_immediate_data(true);
        setup_trb.set_interrupt_on_completion(true);
        setup_trb.set_transfer_type_or_direction(if data_len == 0 {
            transfer_type::NO_DATA
        } else if dir_in {
            transfer_type::IN_DATA
        } else {
            transfer_type::OUT_DATA
        });
        ep0_ring.enqueue(setup_trb);

        let data_event_addr = (data_len > 0)
            .then(|| ep0_ring.enqueue_td(EP0_ID, ep0_mps, bounce_addr, data_len, dir_in));

        let mut status_trb = Trb::make(trb_type::STATUS_STAGE);
        // Opposite of the data stage's direction; IN when there is no data
        // stage at all.
        let status_dir_in = data_len == 0 || !dir_in;
        status_trb.set_transfer_type_or_direction(u8::from(status_dir_in));
        status_trb.set_interrupt_on_completion(true);
        ep0_ring.enqueue(status_trb);

        self.ring_doorbell(slot_id, u32::from(EP0_ID));

        let n_stages = 2 + u32::from(data_len > 0);
        let timeout_us = self.timeouts().event_us;
        let mut transferred = 0u32;
        for _ in 0..n_stages {
            let ev = self.wait_for_event(
                timeout_us,
                |ev| {
                    ev.trb_type() == trb_type::EV_TRANSFER
                        && ev.slot_id() == slot_id
                        && ev.endpoint_id() == EP0_ID
                },
                Self::log_unmatched_event,
            )?;
            let cc = ev.completion_code();
            if !cc.is_success() {
                return Err(DriverError::CompletionError(cc));
            }
            if Some(ev.parameter()) == data_event_addr {
                let residual = ev.completion_parameter();
                transferred = data_len.saturating_sub(residual);
            }
        }

        if dir_in && data_len > 0 {
            self.mem.read_bytes(bounce_addr, &mut buf[..transferred as usize]);
        }

        trace!(slot_id, request = setup.request, transferred, "control transfer complete");
        Ok(transferred)
    }

    /// Issue a single-TD bulk transfer on `endpoint_id` of `slot_id`,
    /// staging through the bulk bounce buffer in either direction.
    pub fn bulk(
        &mut self,
        slot_id: u8,
        endpoint_id: u8,
        ring: &mut TransferRing,
        mps: u16,
        dir_in: bool,
        buf: &mut [u8],
    ) -> Result<u32> {
        let len = buf.len() as u32;
        let (bounce_addr, bounce_size) = self.bulk_bounce();
        if u64::from(len) > bounce_size {
            return Err(DriverError::ResourceError(format!(
                "bulk transfer of {len} bytes exceeds bulk bounce buffer ({bounce_size} bytes)"
            )));
        }
        if !dir_in {
            self.mem.write_bytes(bounce_addr, buf);
        }

        ring.enqueue_td(endpoint_id, mps, bounce_addr, len, dir_in);
        self.ring_doorbell(slot_id, u32::from(endpoint_id));

        let timeout_us = self.timeouts().event_us;
        let ev = self.wait_for_event(
            timeout_us,
            |ev| {
                ev.trb_type() == trb_type::EV_TRANSFER
                    && ev.slot_id() == slot_id
                    && ev.endpoint_id() == endpoint_id
            },
            Self::log_unmatched_event,
        )?;
        let cc = ev.completion_code();
        if !cc.is_success() {
            return Err(DriverError::CompletionError(cc));
        }
        let residual = ev.completion_parameter();
        let transferred = len.saturating_sub(residual);

        if dir_in {
            self.mem.read_bytes(bounce_addr, &mut buf[..transferred as usize]);
        }

        trace!(slot_id, endpoint_id, transferred, "bulk transfer complete");
        Ok(transferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BarBus, HostMem};
    use crate::testutils::{FakeBarBus, FakeHostMem};
    use crate::xhci::controller::Timeouts;
    use crate::xhci::registers as reg;
    use crate::xhci::trb::{trb_type as tt, CompletionCode};
    use std::sync::Arc;

    fn fixture() -> Controller {
        let bar = Arc::new(FakeBarBus::new(0x4000));
        bar.write32(reg::HCSPARAMS1, 8 | (1 << 24));
        let mem = Arc::new(FakeHostMem::new(1 << 20));
        Controller::new(bar, mem, Timeouts::default()).unwrap()
    }

    /// Write a transfer event into event-ring slot `slot_index` (`0`-based,
    /// from the ring's still-untouched dequeue pointer). Tests pre-seed
    /// every event a call under test will consume before making that call,
    /// so each needs its own slot rather than overwriting the first.
    fn post_transfer_event(
        controller: &mut Controller,
        slot_index: u64,
        trb_addr: u64,
        slot_id: u8,
        endpoint_id: u8,
        residual: u32,
        cc: CompletionCode,
    ) {
        let mut ev = Trb::make(tt::EV_TRANSFER);
        ev.set_parameter(trb_addr);
        ev.set_completion_parameter(residual);
        ev.set_completion_code(cc);
        ev.set_slot_id(slot_id);
        ev.set_endpoint_id(endpoint_id);
        ev.set_cycle(true);
        let addr = controller.event_ring.dequeue_pointer() + slot_index * crate::xhci::trb::TRB_SIZE as u64;
        controller.mem.write_bytes(addr, &ev.to_bytes());
    }

    #[test]
    fn no_data_control_transfer_collects_two_events() {
        let mut controller = fixture();
        let mut ring = TransferRing::new(controller.mem(), TransferRing::DEFAULT_CAPACITY);
        let setup_addr = ring.base();
        let status_addr = setup_addr + crate::xhci::trb::TRB_SIZE as u64;

        post_transfer_event(&mut controller, 0, setup_addr, 2, EP0_ID, 0, CompletionCode::Success);
        post_transfer_event(&mut controller, 1, status_addr, 2, EP0_ID, 0, CompletionCode::Success);

        let setup = SetupPacket {
            request_type: 0x00,
            request: 9, // SET_CONFIGURATION
            value: 1,
            index: 0,
            length: 0,
        };
        let mut buf = [];
        let transferred = controller
            .control(2, &mut ring, 8, false, setup, &mut buf)
            .unwrap();
        assert_eq!(transferred, 0);
    }

    #[test]
    fn in_data_control_transfer_reads_back_bounce_buffer() {
        let mut controller = fixture();
        let mut ring = TransferRing::new(controller.mem(), TransferRing::DEFAULT_CAPACITY);
        let setup_addr = ring.base();
        let data_trb_addr = setup_addr + crate::xhci::trb::TRB_SIZE as u64;
        let event_data_addr = data_trb_addr + crate::xhci::trb::TRB_SIZE as u64;
        let status_addr = event_data_addr + crate::xhci::trb::TRB_SIZE as u64;

        let (bounce_addr, _) = controller.ep0_bounce();
        controller.mem.write_bytes(bounce_addr, &[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]);

        post_transfer_event(&mut controller, 0, setup_addr, 3, EP0_ID, 0, CompletionCode::Success);
        post_transfer_event(&mut controller, 1, event_data_addr, 3, EP0_ID, 0, CompletionCode::Success);
        post_transfer_event(&mut controller, 2, status_addr, 3, EP0_ID, 0, CompletionCode::Success);

        let setup = SetupPacket {
            request_type: 0x80,
            request: 6, // GET_DESCRIPTOR
            value: 0x0100,
            index: 0,
            length: 8,
        };
        let mut buf = [0u8; 8];
        let transferred = controller.control(3, &mut ring, 8, true, setup, &mut buf).unwrap();
        assert_eq!(transferred, 8);
        assert_eq!(&buf[..4], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn control_transfer_propagates_stall_as_completion_error() {
        let mut controller = fixture();
        let mut ring = TransferRing::new(controller.mem(), TransferRing::DEFAULT_CAPACITY);
        let setup_addr = ring.base();

        post_transfer_event(&mut controller, 0, setup_addr, 4, EP0_ID, 0, CompletionCode::StallError);

        let setup = SetupPacket {
            request_type: 0x00,
            request: 5,
            value: 0,
            index: 0,
            length: 0,
        };
        let mut buf = [];
        let err = controller.control(4, &mut ring, 8, false, setup, &mut buf).unwrap_err();
        assert_eq!(err, DriverError::CompletionError(CompletionCode::StallError));
    }

    #[test]
    fn control_transfer_resets_halted_ep0_before_issuing_setup() {
        let mut controller = fixture();
        let mut ring = TransferRing::new(controller.mem(), TransferRing::DEFAULT_CAPACITY);

        let slot_id = 5;
        let device_ctx = controller.dcbaa.allocate_device_context();
        controller.dcbaa.publish_slot(slot_id, device_ctx);
        let mut halted = [0u8; crate::xhci::context::CONTEXT_SIZE];
        halted[0] = endpoint_state::HALTED as u8;
        controller.mem.write_bytes(
            device_ctx + u64::from(EP0_ID) * crate::xhci::context::CONTEXT_SIZE as u64,
            &halted,
        );

        // RESET_ENDPOINT is the very first command issued on a fresh
        // command ring, so its completion is addressed at the ring base.
        let reset_cmd_addr = controller.command_ring.base();
        let mut reset_completion = Trb::make(tt::EV_COMMAND_COMPLETION);
        reset_completion.set_parameter(reset_cmd_addr);
        reset_completion.set_completion_code(CompletionCode::Success);
        reset_completion.set_cycle(true);
        controller
            .mem
            .write_bytes(controller.event_ring.base(), &reset_completion.to_bytes());

        let setup_addr = ring.base();
        let status_addr = setup_addr + crate::xhci::trb::TRB_SIZE as u64;
        post_transfer_event(&mut controller, 1, setup_addr, slot_id, EP0_ID, 0, CompletionCode::Success);
        post_transfer_event(&mut controller, 2, status_addr, slot_id, EP0_ID, 0, CompletionCode::Success);

        let setup = SetupPacket {
            request_type: 0x00,
            request: 9, // SET_CONFIGURATION
            value: 1,
            index: 0,
            length: 0,
        };
        let mut buf = [];
        let transferred = controller
            .control(slot_id, &mut ring, 8, false, setup, &mut buf)
            .unwrap();
        assert_eq!(transferred, 0);
    }

    #[test]
    fn bulk_out_transfer_stages_buffer_into_bounce_memory() {
        let mut controller = fixture();
        let mut ring = TransferRing::new(controller.mem(), TransferRing::DEFAULT_CAPACITY);
        let data_trb_addr = ring.base();
        let event_data_addr = data_trb_addr + crate::xhci::trb::TRB_SIZE as u64;

        post_transfer_event(&mut controller, 0, event_data_addr, 2, 2, 0, CompletionCode::Success);

        let mut buf = [1u8, 2, 3, 4];
        let transferred = controller.bulk(2, 2, &mut ring, 64, false, &mut buf).unwrap();
        assert_eq!(transferred, 4);

        let (bounce_addr, _) = controller.bulk_bounce();
        let mut written = [0u8; 4];
        controller.mem.read_bytes(bounce_addr, &mut written);
        assert_eq!(written, buf);
    }
}
