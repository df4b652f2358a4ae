//! The command engine: issuing Command TRBs on the Command Ring and
//! correlating their completions on the Event Ring.
//!
//! Every command here follows the same two-step shape: enqueue a TRB,
//! ring the Command Ring doorbell (slot 0, value 0), then wait for the
//! matching `EV_CMD_CMPL` by address. On timeout the command ring is
//! aborted per xHCI spec section 4.6.1.2 and the driver waits for the
//! resulting `COMMAND_RING_STOPPED` completion before giving up, so a
//! slow-but-eventually-successful command never leaves the ring wedged
//! for the next caller.

use tracing::{debug, warn};

use crate::error::{DriverError, Result};
use crate::xhci::context::CONTEXT_SIZE;
use crate::xhci::controller::Controller;
use crate::xhci::registers as reg;
use crate::xhci::trb::{trb_type, CompletionCode, Trb};

impl Controller {
    /// Issue a command TRB and block until its `EV_CMD_CMPL` arrives,
    /// returning the completion TRB on success. Unmatched events observed
    /// while waiting are forwarded to
    /// [`crate::xhci::controller::dispatch_unhandled`].
    fn issue_command(&mut self, trb: Trb) -> Result<Trb> {
        let addr = self.command_ring.enqueue(trb);
        self.ring_doorbell(0, 0);

        let timeout_us = self.timeouts().command_us;
        match self.wait_for_event(
            timeout_us,
            |ev| ev.trb_type() == trb_type::EV_COMMAND_COMPLETION && ev.parameter() == addr,
            Self::log_unmatched_event,
        ) {
            Ok(completion) => {
                let cc = completion.completion_code();
                if cc.is_success() {
                    Ok(completion)
                } else {
                    Err(DriverError::CompletionError(cc))
                }
            }
            Err(DriverError::Timeout) => self.abort_command_ring(addr),
            Err(other) => Err(other),
        }
    }

    /// Abort the command ring after a timeout (xHCI spec section 4.6.1.2):
    /// set `CRCR.CS|CA`, then wait for the `COMMAND_RING_STOPPED` completion
    /// that the controller is required to post in response, distinguishing
    /// it from the original command's own (now presumably lost) completion
    /// by its `COMMAND_RING_STOPPED` completion code rather than by address.
    /// Surfaces that completion code to the caller rather than a generic
    /// timeout, since the abort itself succeeded.
    fn abort_command_ring(&mut self, original_addr: u64) -> Result<Trb> {
        warn!(addr = %format_args!("{original_addr:#x}"), "command timed out, aborting command ring");
        let crcr = self.bar.read64(reg::CRCR);
        self.bar.write64(reg::CRCR, crcr | reg::CRCR_CS | reg::CRCR_CA);

        let stop_timeout_us = self.timeouts().command_us;
        let stopped = self.wait_for_event(
            stop_timeout_us,
            |ev| {
                ev.trb_type() == trb_type::EV_COMMAND_COMPLETION
                    && ev.completion_code() == CompletionCode::CommandRingStopped
            },
            Self::log_unmatched_event,
        )?;
        Err(DriverError::CompletionError(stopped.completion_code()))
    }

    /// `NOOP`: exercises the command ring and completion path without
    /// touching device state. Used as a liveness probe.
    pub fn noop(&mut self) -> Result<()> {
        self.issue_command(Trb::make(trb_type::CMD_NOOP))?;
        Ok(())
    }

    /// `ENABLE_SLOT`: reserve a device slot, returning its Slot ID.
    pub fn enable_slot(&mut self) -> Result<u8> {
        let completion = self.issue_command(Trb::make(trb_type::CMD_ENABLE_SLOT))?;
        let slot_id = completion.slot_id();
        debug!(slot_id, "slot enabled");
        Ok(slot_id)
    }

    /// `DISABLE_SLOT`: release a previously enabled slot.
    pub fn disable_slot(&mut self, slot_id: u8) -> Result<()> {
        let mut trb = Trb::make(trb_type::CMD_DISABLE_SLOT);
        trb.set_slot_id(slot_id);
        self.issue_command(trb)?;
        debug!(slot_id, "slot disabled");
        Ok(())
    }

    /// `ADDRESS_DEVICE`: assign a USB device address to `slot_id`, consuming
    /// the Input Context at `input_context_ptr` (its Slot Context and EP0
    /// Endpoint Context must already be populated by the caller). On
    /// success the controller has written the live Device Context back
    /// into the slot the DCBAA already points at.
    pub fn address_device(&mut self, slot_id: u8, input_context_ptr: u64) -> Result<()> {
        let mut trb = Trb::make(trb_type::CMD_ADDRESS_DEVICE);
        trb.set_parameter(input_context_ptr);
        trb.set_slot_id(slot_id);
        self.issue_command(trb)?;
        debug!(slot_id, "device addressed");
        Ok(())
    }

    /// `CONFIGURE_ENDPOINT`: apply the endpoint contexts added/dropped in
    /// the Input Context at `input_context_ptr` to `slot_id`. A
    /// `config_id` of `0` is the USB "deconfigure" shorthand, matching the
    /// controller's Deconfigure TRB bit.
    pub fn configure_endpoint(
        &mut self,
        slot_id: u8,
        input_context_ptr: u64,
        deconfigure: bool,
    ) -> Result<()> {
        let mut trb = Trb::make(trb_type::CMD_CONFIGURE_ENDPOINT);
        trb.set_parameter(input_context_ptr);
        trb.set_slot_id(slot_id);
        trb.set_deconfigure(deconfigure);
        self.issue_command(trb)?;
        debug!(slot_id, deconfigure, "endpoints configured");
        Ok(())
    }

    /// `EVALUATE_CONTEXT`: apply a partial Input Context update (e.g. EP0's
    /// Max Packet Size after reading the real device descriptor) without
    /// the full semantics of Configure Endpoint.
    pub fn evaluate_context(&mut self, slot_id: u8, input_context_ptr: u64) -> Result<()> {
        let mut trb = Trb::make(trb_type::CMD_EVALUATE_CONTEXT);
        trb.set_parameter(input_context_ptr);
        trb.set_slot_id(slot_id);
        self.issue_command(trb)?;
        Ok(())
    }

    /// `RESET_ENDPOINT`: clear the Halted state of an endpoint after a
    /// `STALL_ERROR` or similar completion, before the endpoint can be used
    /// again.
    pub fn reset_endpoint(&mut self, slot_id: u8, endpoint_id: u8) -> Result<()> {
        let mut trb = Trb::make(trb_type::CMD_RESET_ENDPOINT);
        trb.set_slot_id(slot_id);
        trb.set_endpoint_id(endpoint_id);
        self.issue_command(trb)?;
        Ok(())
    }

    /// `STOP_ENDPOINT`: halt an endpoint's transfer ring, e.g. before
    /// `SET_TR_DEQUEUE_POINTER` recovers it after an error.
    pub fn stop_endpoint(&mut self, slot_id: u8, endpoint_id: u8) -> Result<()> {
        let mut trb = Trb::make(trb_type::CMD_STOP_ENDPOINT);
        trb.set_slot_id(slot_id);
        trb.set_endpoint_id(endpoint_id);
        self.issue_command(trb)?;
        Ok(())
    }

    /// `SET_TR_DEQUEUE_POINTER`: reposition an endpoint's dequeue pointer,
    /// used to skip a TD the driver has given up on after
    /// [`Self::reset_endpoint`].
    pub fn set_tr_dequeue_pointer(
        &mut self,
        slot_id: u8,
        endpoint_id: u8,
        dequeue_ptr: u64,
        dequeue_cycle: bool,
    ) -> Result<()> {
        let mut trb = Trb::make(trb_type::CMD_SET_TR_DEQUEUE_POINTER);
        trb.set_parameter(dequeue_ptr | u64::from(dequeue_cycle));
        trb.set_slot_id(slot_id);
        trb.set_endpoint_id(endpoint_id);
        self.issue_command(trb)?;
        Ok(())
    }
}

/// Byte size of a Slot or Endpoint Context, re-exported for callers that
/// size Input Context regions without pulling in `crate::xhci::context`
/// directly.
pub const SLOT_CONTEXT_SIZE: usize = CONTEXT_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BarBus, HostMem};
    use crate::testutils::{FakeBarBus, FakeHostMem};
    use crate::xhci::controller::Timeouts;
    use crate::xhci::trb::trb_type as tt;
    use std::sync::Arc;

    fn fixture() -> Controller {
        let bar = Arc::new(FakeBarBus::new(0x4000));
        bar.write32(reg::HCSPARAMS1, 8 | (1 << 24));
        let mem = Arc::new(FakeHostMem::new(1 << 20));
        Controller::new(bar, mem, Timeouts::default()).unwrap()
    }

    /// Pre-seed the event ring with the completion a real controller would
    /// post for the very first command issued on a freshly initialized
    /// command ring (whose first slot is always the ring's base address).
    fn seed_first_command_completion(controller: &mut Controller, cc: CompletionCode, slot_id: u8) {
        let cmd_addr = controller.command_ring.base();
        let mut completion = Trb::make(tt::EV_COMMAND_COMPLETION);
        completion.set_parameter(cmd_addr);
        completion.set_completion_code(cc);
        completion.set_slot_id(slot_id);
        completion.set_cycle(true);
        controller
            .mem
            .write_bytes(controller.event_ring.base(), &completion.to_bytes());
    }

    #[test]
    fn enable_slot_returns_slot_id_from_completion() {
        let mut controller = fixture();
        seed_first_command_completion(&mut controller, CompletionCode::Success, 5);

        let slot_id = controller.enable_slot().unwrap();
        assert_eq!(slot_id, 5);
    }

    #[test]
    fn command_completion_error_propagates_as_driver_error() {
        let mut controller = fixture();
        seed_first_command_completion(&mut controller, CompletionCode::TrbError, 0);

        let err = controller.enable_slot().unwrap_err();
        assert_eq!(err, DriverError::CompletionError(CompletionCode::TrbError));
    }

    #[test]
    fn noop_times_out_and_aborts_when_no_completion_ever_arrives() {
        let mut controller = fixture();
        controller.timeouts.command_us = 200;
        let err = controller.noop().unwrap_err();
        assert_eq!(err, DriverError::Timeout);
    }
}
