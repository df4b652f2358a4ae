//! Top-level memory-dump flow: bring up the controller, enumerate the
//! root hub's attached CH341 adapter, and stream a memdump packet over
//! its bulk-out pipe.
//!
//! Grounded in `examples/original_source/ramdump.py`'s `RAMDump`: the
//! constructor's setup/poll/probe/open sequence and `memdump`'s wire
//! packet layout are carried over field-for-field, with the packet built
//! by a typed encoder instead of the original's dynamic bit-slice
//! assignments.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::capability::{BarBusRef, HostMemRef};
use crate::ch341::Ch341;
use crate::error::{DriverError, Result};
use crate::serial::USBSerialPort;
use crate::usb::usb_attach_device;
use crate::xhci::controller::{Controller, Timeouts};
use crate::xhci::hub::poll_ports;

/// `MEMDUMP_HEADER_LEN`: packet type (1 byte) + reserved (3 bytes) +
/// base address (4 bytes) + length (4 bytes) + timestamp (4 bytes).
pub const MEMDUMP_HEADER_LEN: usize = 16;

/// Packet type value for a memory-dump payload (the only type this
/// crate ever emits).
pub const PACKET_TYPE_MEMDUMP: u8 = 1;

/// The little-endian memdump wire packet: a fixed 16-byte header
/// followed by the raw memory payload.
#[derive(Debug, Clone)]
pub struct MemdumpPacket {
    /// `base_addr`: the host physical address the payload was read from.
    pub base_addr: u32,
    /// `length`: payload length in bytes.
    pub length: u32,
    /// Unix timestamp the packet was assembled at.
    pub timestamp: u32,
    /// The memory payload itself, `length` bytes.
    pub payload: Vec<u8>,
}

impl MemdumpPacket {
    /// Assemble a packet, reading `length` bytes starting at `base_addr`
    /// out of `mem`.
    #[must_use]
    pub fn capture(mem: &HostMemRef, base_addr: u32, length: u32, timestamp: u32) -> Self {
        let mut payload = vec![0u8; length as usize];
        mem.read_bytes(u64::from(base_addr), &mut payload);
        Self {
            base_addr,
            length,
            timestamp,
            payload,
        }
    }

    /// Encode to the wire layout: `type:8 | reserved:24 | base_addr:32 |
    /// length:32 | timestamp:32 | payload`, all multi-byte fields
    /// little-endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MEMDUMP_HEADER_LEN + self.payload.len());
        out.push(PACKET_TYPE_MEMDUMP);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.base_addr.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// The end-to-end memdump driver: controller bring-up, CH341 enumeration
/// and probing, and the `memdump` write path.
#[derive(Debug)]
pub struct RamDump {
    controller: Controller,
    port: USBSerialPort,
    ch341: Ch341,
}

impl RamDump {
    /// `RAMDump.__init__`: reset/initialize the controller, poll the root
    /// hub until a device attaches, wrap it in a [`USBSerialPort`], then
    /// probe and open the CH341 driver on it.
    ///
    /// Unlike the original source's hardcoded `xhci.devices[1]`, this
    /// attaches whichever single device `poll_ports` first reports; the
    /// crate targets exactly one attached device (§1), so the first
    /// attach is always the right one.
    pub fn new(bar: BarBusRef, mem: HostMemRef, timeouts: Timeouts) -> Result<Self> {
        info!("setting up host controller");
        let mut controller = Controller::new(bar, mem, timeouts)?;

        info!("polling root hub in search of an attached device");
        let mut attached = None;
        poll_ports(&mut controller, |controller, port_num, speed| {
            let dev = usb_attach_device(controller, port_num, speed)?;
            attached = Some(dev);
            Ok(())
        })?;
        let dev = attached.ok_or_else(|| {
            DriverError::ResourceError("no device attached to any root hub port".into())
        })?;

        info!("allocating serial port for CH341");
        let mut port = USBSerialPort::new(dev);
        let mut ch341 = Ch341::new();

        info!("probing CH341");
        ch341.port_probe(&mut controller, &mut port)?;
        info!("opening CH341 port");
        ch341.open(&mut controller, &mut port)?;

        Ok(Self {
            controller,
            port,
            ch341,
        })
    }

    /// `memdump`: capture `data_len` bytes starting at `base` out of host
    /// physical memory, wrap them in a [`MemdumpPacket`], and write it
    /// out over the CH341's bulk-out pipe.
    ///
    /// Partial writes are not retried (§7): a short or failed write
    /// surfaces its error to the caller, which per this crate's scope
    /// logs and aborts rather than retrying the dump.
    pub fn memdump(&mut self, base: u32, data_len: u32) -> Result<()> {
        let timestamp = unix_timestamp();
        let packet = MemdumpPacket::capture(&self.controller.mem(), base, data_len, timestamp);
        info!(
            base = packet.base_addr,
            length = packet.length,
            timestamp = packet.timestamp,
            "sending memdump packet"
        );
        let bytes = packet.to_bytes();
        self.ch341.write(&mut self.controller, &mut self.port, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeHostMem;
    use std::sync::Arc;

    #[test]
    fn packet_encodes_header_fields_little_endian() {
        let mem: HostMemRef = Arc::new(FakeHostMem::new(0x1000));
        mem.write_bytes(0x100, &[0xaa, 0xbb, 0xcc, 0xdd]);

        let packet = MemdumpPacket::capture(&mem, 0x100, 4, 0x1234_5678);
        assert_eq!(packet.payload, vec![0xaa, 0xbb, 0xcc, 0xdd]);

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), MEMDUMP_HEADER_LEN + 4);
        assert_eq!(bytes[0], PACKET_TYPE_MEMDUMP);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 0x100);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 4);
        assert_eq!(
            u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            0x1234_5678
        );
        assert_eq!(&bytes[16..], &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn packet_with_empty_payload_is_header_only() {
        let mem: HostMemRef = Arc::new(FakeHostMem::new(0x100));
        let packet = MemdumpPacket::capture(&mem, 0, 0, 0);
        assert_eq!(packet.to_bytes().len(), MEMDUMP_HEADER_LEN);
    }
}
