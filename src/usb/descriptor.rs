//! USB standard descriptor layouts and request encoding.
//!
//! Descriptors are flat, byte-aligned records (unlike the dword-packed
//! xHCI contexts in [`crate::xhci::context`]), so each type here is a
//! thin wrapper around a fixed-size byte array with accessor methods
//! reading the field offsets USB 2.0 chapter 9 defines, rather than the
//! original source's dynamic bit-sliced `Data` class.

use crate::error::{DriverError, Result};

/// `bRequest` values used by this driver (USB 2.0 table 9-4). Only
/// `SET_DESCRIPTOR`, `GET_INTERFACE`, `SET_INTERFACE`, and `SYNCH_FRAME`
/// are never issued, but are kept alongside the rest for completeness.
#[allow(missing_docs)]
pub mod brequest {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

/// Standard descriptor type codes (`wValue` high byte of `GET_DESCRIPTOR`).
#[allow(missing_docs)]
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
}

/// `bmRequestType` Data Transfer Direction (bit 7).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub enum RequestDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

/// `bmRequestType` Type (bits 5..7).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// `bmRequestType` Recipient (bits 0..5).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub enum RequestRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
}

/// Pack a `bmRequestType` byte from its three fields (xHCI figure 4-14 /
/// USB 2.0 table 9-2).
#[must_use]
pub const fn bm_request_type(
    dir: RequestDirection,
    rtype: RequestType,
    recipient: RequestRecipient,
) -> u8 {
    ((dir as u8) << 7) | ((rtype as u8) << 5) | (recipient as u8)
}

fn require_len(bytes: &[u8], min: usize, what: &str) -> Result<()> {
    if bytes.len() < min {
        return Err(DriverError::ProtocolError(format!(
            "{what} descriptor too short: got {} bytes, need at least {min}",
            bytes.len()
        )));
    }
    Ok(())
}

/// The 18-byte Device Descriptor (USB 2.0 table 9-8).
#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    bytes: [u8; 18],
}

impl DeviceDescriptor {
    /// Parse from a raw `GET_DESCRIPTOR(DEVICE)` response. `raw` must be
    /// at least 18 bytes; extra trailing bytes are ignored.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require_len(raw, 18, "device")?;
        let mut bytes = [0u8; 18];
        bytes.copy_from_slice(&raw[..18]);
        Ok(Self { bytes })
    }

    /// `bLength`.
    #[must_use]
    pub const fn length(&self) -> u8 {
        self.bytes[0]
    }

    /// `bDescriptorType`.
    #[must_use]
    pub const fn descriptor_type(&self) -> u8 {
        self.bytes[1]
    }

    /// `bcdUSB`.
    #[must_use]
    pub fn bcd_usb(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    /// `bDeviceClass`.
    #[must_use]
    pub const fn device_class(&self) -> u8 {
        self.bytes[4]
    }

    /// `bMaxPacketSize0`.
    #[must_use]
    pub const fn max_packet_size0(&self) -> u8 {
        self.bytes[7]
    }

    /// `idVendor`.
    #[must_use]
    pub fn vendor_id(&self) -> u16 {
        u16::from_le_bytes([self.bytes[8], self.bytes[9]])
    }

    /// `idProduct`.
    #[must_use]
    pub fn product_id(&self) -> u16 {
        u16::from_le_bytes([self.bytes[10], self.bytes[11]])
    }

    /// `bcdDevice`.
    #[must_use]
    pub fn bcd_device(&self) -> u16 {
        u16::from_le_bytes([self.bytes[12], self.bytes[13]])
    }

    /// `bNumConfigurations`.
    #[must_use]
    pub const fn num_configurations(&self) -> u8 {
        self.bytes[17]
    }
}

/// The 9-byte Configuration Descriptor header (USB 2.0 table 9-10). The
/// interface/endpoint descriptors that follow it in a full
/// `GET_DESCRIPTOR(CONFIGURATION)` response are walked separately; see
/// [`crate::usb::parse_endpoints`].
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationDescriptor {
    bytes: [u8; 9],
}

impl ConfigurationDescriptor {
    /// Parse the 9-byte header. `raw` must be at least 9 bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require_len(raw, 9, "configuration")?;
        let mut bytes = [0u8; 9];
        bytes.copy_from_slice(&raw[..9]);
        Ok(Self { bytes })
    }

    /// `wTotalLength`: size of the full configuration blob, header plus
    /// every interface/endpoint descriptor.
    #[must_use]
    pub fn total_length(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    /// `bNumInterfaces`.
    #[must_use]
    pub const fn num_interfaces(&self) -> u8 {
        self.bytes[4]
    }

    /// `bConfigurationValue`, the value `SET_CONFIGURATION` expects back.
    #[must_use]
    pub const fn configuration_value(&self) -> u8 {
        self.bytes[5]
    }
}

/// A 9-byte Interface Descriptor (USB 2.0 table 9-12), as found inline in
/// a configuration blob.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptor {
    bytes: [u8; 9],
}

impl InterfaceDescriptor {
    /// Parse from a 9-byte slice taken out of a configuration blob.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require_len(raw, 9, "interface")?;
        let mut bytes = [0u8; 9];
        bytes.copy_from_slice(&raw[..9]);
        Ok(Self { bytes })
    }

    /// `bInterfaceNumber`.
    #[must_use]
    pub const fn interface_number(&self) -> u8 {
        self.bytes[2]
    }

    /// `bNumEndpoints`.
    #[must_use]
    pub const fn num_endpoints(&self) -> u8 {
        self.bytes[4]
    }

    /// `bInterfaceClass`.
    #[must_use]
    pub const fn interface_class(&self) -> u8 {
        self.bytes[5]
    }
}

/// A 7-byte Endpoint Descriptor (USB 2.0 table 9-13), as found inline in
/// a configuration blob.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    bytes: [u8; 7],
}

impl EndpointDescriptor {
    /// Parse from a 7-byte slice taken out of a configuration blob.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        require_len(raw, 7, "endpoint")?;
        let mut bytes = [0u8; 7];
        bytes.copy_from_slice(&raw[..7]);
        Ok(Self { bytes })
    }

    /// `bEndpointAddress` bits 0..4: the bare endpoint number.
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.bytes[2] & 0x0f
    }

    /// `bEndpointAddress` bit 7: `true` for IN.
    #[must_use]
    pub const fn is_in(&self) -> bool {
        self.bytes[2] & 0x80 != 0
    }

    /// `bmAttributes` bits 0..2: the transfer type (see [`super::device::ep_type`]).
    #[must_use]
    pub const fn transfer_type(&self) -> u8 {
        self.bytes[3] & 0x3
    }

    /// `wMaxPacketSize` (bits 0..11 only; the high bits encode
    /// high-bandwidth transaction counts this crate does not negotiate).
    #[must_use]
    pub fn max_packet_size(&self) -> u16 {
        u16::from_le_bytes([self.bytes[4], self.bytes[5]]) & 0x7ff
    }

    /// `bInterval`, still in its raw wire encoding (decoded per-speed by
    /// [`super::device::decode_interval`]).
    #[must_use]
    pub const fn interval_raw(&self) -> u8 {
        self.bytes[6]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bm_request_type_matches_get_descriptor_device_encoding() {
        // The standard "device-to-host, standard, device" encoding used
        // for every GET_DESCRIPTOR this driver issues.
        let value = bm_request_type(
            RequestDirection::DeviceToHost,
            RequestType::Standard,
            RequestRecipient::Device,
        );
        assert_eq!(value, 0x80);
    }

    #[test]
    fn device_descriptor_reads_vendor_and_product_id() {
        let mut raw = [0u8; 18];
        raw[0] = 18;
        raw[1] = descriptor_type::DEVICE;
        raw[7] = 8;
        raw[8..10].copy_from_slice(&0x1a86u16.to_le_bytes());
        raw[10..12].copy_from_slice(&0x7523u16.to_le_bytes());
        raw[17] = 1;

        let desc = DeviceDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(desc.vendor_id(), 0x1a86);
        assert_eq!(desc.product_id(), 0x7523);
        assert_eq!(desc.max_packet_size0(), 8);
        assert_eq!(desc.num_configurations(), 1);
    }

    #[test]
    fn short_descriptor_is_rejected() {
        let raw = [0u8; 4];
        assert!(DeviceDescriptor::from_bytes(&raw).is_err());
    }

    #[test]
    fn endpoint_descriptor_decodes_address_and_attributes() {
        let raw = [7, descriptor_type::ENDPOINT, 0x82, 0x02, 0x20, 0x00, 0x00];
        let ep = EndpointDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(ep.number(), 2);
        assert!(ep.is_in());
        assert_eq!(ep.transfer_type(), 2);
        assert_eq!(ep.max_packet_size(), 0x20);
    }
}
