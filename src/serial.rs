//! USB-serial port abstraction and the URB submit path.
//!
//! Grounded in `examples/original_source/serial.py`'s `USBSerialPort` /
//! `USBSerialGeneric`: endpoint discovery at construction time, a single
//! write URB, and (when present) an interrupt-in URB this crate never
//! submits (the read/interrupt-queue delivery path is Open Question (b),
//! not implemented here).

use crate::error::{DriverError, Result};
use crate::usb::device::{ep_type, UsbDevice};
use crate::xhci::controller::Controller;

/// One in-flight (or about-to-be-submitted) USB Request Block. Unlike a
/// kernel URB this carries no completion callback: [`Urb::submit`] blocks
/// until the transfer finishes or times out, matching this crate's
/// cooperative, callback-free scheduling model.
#[derive(Debug)]
pub struct Urb {
    /// Bare endpoint number this URB targets.
    pub endpoint_number: u8,
    /// `true` for IN.
    pub is_in: bool,
    /// The buffer this transfer reads from (OUT) or fills (IN).
    pub transfer_buffer: Vec<u8>,
}

impl Urb {
    /// Create an URB bound to a specific endpoint, with an empty transfer
    /// buffer (callers fill it before [`Urb::submit`]).
    #[must_use]
    pub fn new(endpoint_number: u8, is_in: bool) -> Self {
        Self {
            endpoint_number,
            is_in,
            transfer_buffer: Vec::new(),
        }
    }

    /// `URB::submit`: dispatch to the controller's bulk transfer engine.
    /// Only BULK endpoints are supported by this crate's `submit_urb`
    /// path (the CH341 write path is the only caller); submitting against
    /// a non-bulk endpoint is a [`DriverError::ResourceError`].
    pub fn submit(&mut self, controller: &mut Controller, dev: &mut UsbDevice) -> Result<u32> {
        let slot_id = dev.slot_id;
        let endpoint = dev
            .endpoint(self.endpoint_number, self.is_in)
            .ok_or_else(|| {
                DriverError::ResourceError(format!(
                    "no endpoint {} ({}) configured",
                    self.endpoint_number,
                    if self.is_in { "IN" } else { "OUT" }
                ))
            })?;
        if endpoint.transfer_type != ep_type::BULK {
            return Err(DriverError::ResourceError(format!(
                "submit_urb only supports BULK endpoints, endpoint {} is type {}",
                self.endpoint_number, endpoint.transfer_type
            )));
        }

        let endpoint_id = endpoint.endpoint_id();
        let mps = endpoint.max_packet_size;
        controller.bulk(
            slot_id,
            endpoint_id,
            &mut endpoint.ring,
            mps,
            self.is_in,
            &mut self.transfer_buffer,
        )
    }
}

/// A USB-serial port bound to one enumerated device: the BULK-OUT write
/// pipe every CH341 write goes through, plus the INTERRUPT-IN pipe when
/// the device exposes one (never submitted by this crate, see
/// [`Urb`]'s docs).
#[derive(Debug)]
pub struct USBSerialPort {
    /// The enumerated device this port is bound to.
    pub device: UsbDevice,
    /// The BULK-OUT write URB, if the configuration exposed one.
    pub write_urb: Option<Urb>,
    /// The INTERRUPT-IN URB, if the configuration exposed one.
    pub interrupt_in_urb: Option<Urb>,
}

impl USBSerialPort {
    /// `init_urbs`: discover the first BULK-OUT endpoint (write URB) and
    /// the first INTERRUPT-IN endpoint (interrupt URB, if any) among
    /// `device`'s configured endpoints.
    #[must_use]
    pub fn new(device: UsbDevice) -> Self {
        let write_urb = device
            .endpoints
            .iter()
            .find(|ep| ep.transfer_type == ep_type::BULK && !ep.is_in)
            .map(|ep| Urb::new(ep.number, false));
        let interrupt_in_urb = device
            .endpoints
            .iter()
            .find(|ep| ep.transfer_type == ep_type::INTERRUPT && ep.is_in)
            .map(|ep| Urb::new(ep.number, true));

        Self {
            device,
            write_urb,
            interrupt_in_urb,
        }
    }

    /// `USBSerialGeneric::write` → `write_start`: stage `data` into the
    /// write URB's transfer buffer and submit it.
    pub fn write(&mut self, controller: &mut Controller, data: &[u8]) -> Result<u32> {
        let urb = self
            .write_urb
            .as_mut()
            .ok_or_else(|| DriverError::ResourceError("no BULK-OUT endpoint on this port".into()))?;
        urb.transfer_buffer.clear();
        urb.transfer_buffer.extend_from_slice(data);
        urb.submit(controller, &mut self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeHostMem;
    use crate::usb::device::{Endpoint, Speed};
    use crate::xhci::rings::TransferRing;
    use std::sync::Arc;

    fn device_with_endpoints(endpoints: Vec<Endpoint>) -> UsbDevice {
        let mem = Arc::new(FakeHostMem::new(1 << 16));
        UsbDevice {
            slot_id: 1,
            port: 1,
            speed: Speed::Full,
            mps0: 8,
            ep0_ring: TransferRing::new(mem, TransferRing::DEFAULT_CAPACITY),
            descriptor: None,
            configuration: None,
            endpoints,
        }
    }

    #[test]
    fn new_finds_bulk_out_and_interrupt_in_endpoints() {
        let mem = Arc::new(FakeHostMem::new(1 << 16));
        let endpoints = vec![
            Endpoint {
                number: 2,
                is_in: true,
                transfer_type: ep_type::BULK,
                max_packet_size: 0x20,
                ring: TransferRing::new(mem.clone(), TransferRing::DEFAULT_CAPACITY),
            },
            Endpoint {
                number: 2,
                is_in: false,
                transfer_type: ep_type::BULK,
                max_packet_size: 0x20,
                ring: TransferRing::new(mem.clone(), TransferRing::DEFAULT_CAPACITY),
            },
            Endpoint {
                number: 1,
                is_in: true,
                transfer_type: ep_type::INTERRUPT,
                max_packet_size: 8,
                ring: TransferRing::new(mem, TransferRing::DEFAULT_CAPACITY),
            },
        ];
        let port = USBSerialPort::new(device_with_endpoints(endpoints));
        let write_urb = port.write_urb.as_ref().unwrap();
        assert_eq!(write_urb.endpoint_number, 2);
        assert!(!write_urb.is_in);
        let interrupt_urb = port.interrupt_in_urb.as_ref().unwrap();
        assert_eq!(interrupt_urb.endpoint_number, 1);
    }

    #[test]
    fn new_without_bulk_out_endpoint_has_no_write_urb() {
        let port = USBSerialPort::new(device_with_endpoints(Vec::new()));
        assert!(port.write_urb.is_none());
        assert!(port.interrupt_in_urb.is_none());
    }
}
