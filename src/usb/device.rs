//! Device-side bookkeeping: negotiated speed, per-endpoint state, and the
//! live `UsbDevice` handle enumeration hands back to the caller.

use tracing::warn;

use crate::error::{DriverError, Result};
use crate::xhci::rings::TransferRing;

use super::descriptor::{ConfigurationDescriptor, DeviceDescriptor};

/// Endpoint transfer types, as encoded in `bmAttributes` bits 0..2 (USB
/// 2.0 table 9-13). Distinct from [`crate::xhci::context::endpoint_type`],
/// which additionally encodes direction.
#[allow(missing_docs)]
pub mod ep_type {
    pub const CONTROL: u8 = 0;
    pub const ISOCHRONOUS: u8 = 1;
    pub const BULK: u8 = 2;
    pub const INTERRUPT: u8 = 3;
}

/// Negotiated link speed (USB 2.0 / xHCI Port Speed ID), determining the
/// default EP0 max packet size and how `bInterval` is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl Speed {
    /// Decode a `PORTSC.Speed` / Protocol Speed ID field value. This
    /// crate only targets controllers using the default USB2/USB3 speed
    /// ID assignment (`1..=5`); a controller publishing a non-default
    /// Supported Protocol Capability would need its PSI table consulted
    /// instead, which is out of scope here.
    pub fn from_psiv(psiv: u8) -> Result<Self> {
        match psiv {
            1 => Ok(Self::Full),
            2 => Ok(Self::Low),
            3 => Ok(Self::High),
            4 => Ok(Self::Super),
            5 => Ok(Self::SuperPlus),
            other => Err(DriverError::ProtocolError(format!(
                "unrecognized port speed id {other}"
            ))),
        }
    }

    /// The Slot Context `Speed` field value (`speed + 1` over the
    /// zero-based `FULL_SPEED == 0` enumeration the original source
    /// used), which for the default PSI assignment is simply the PSIV
    /// this [`Speed`] was decoded from.
    #[must_use]
    pub const fn slot_speed1(self) -> u32 {
        match self {
            Self::Full => 1,
            Self::Low => 2,
            Self::High => 3,
            Self::Super => 4,
            Self::SuperPlus => 5,
        }
    }

    /// The default EP0 max packet size to use before the real device
    /// descriptor has been read.
    ///
    /// Low-speed devices always use 8 (USB 2.0 section 5.5.3); the
    /// original source's table omitted this case entirely (falling
    /// through to a "no usable configuration!"-style warning and a
    /// guessed 512), which this crate corrects rather than reproduces.
    #[must_use]
    pub const fn default_mps0(self) -> u16 {
        match self {
            Self::Full | Self::High => 64,
            Self::Low => 8,
            Self::Super | Self::SuperPlus => 512,
        }
    }

    /// Decode the real `bMaxPacketSize0` byte out of the first 8 bytes of
    /// the device descriptor, validating it against what this speed
    /// allows and logging (but tolerating) an out-of-spec value.
    #[must_use]
    pub fn decode_mps0(self, raw: u8) -> u16 {
        match self {
            Self::Full => match raw {
                8 | 16 | 32 | 64 => u16::from(raw),
                _ => {
                    warn!(raw, "invalid full-speed MPS0, defaulting to 8");
                    8
                }
            },
            Self::Low => {
                if raw != 8 {
                    warn!(raw, "invalid low-speed MPS0, defaulting to 8");
                }
                8
            }
            Self::High => {
                if raw != 64 {
                    warn!(raw, "invalid high-speed MPS0, forcing 64");
                }
                64
            }
            Self::Super | Self::SuperPlus => {
                if raw != 9 {
                    warn!(raw, "invalid SuperSpeed MPS0 exponent, forcing 512");
                    512
                } else {
                    1u16 << raw
                }
            }
        }
    }
}

/// Decode an Endpoint Descriptor's raw `bInterval` into the xHCI
/// Endpoint Context `Interval` field (`125us * 2^interval`), per xHCI
/// spec section 6.2.3.6.
///
/// The original source's `usb_decode_interval` only handled High Speed
/// and SuperSpeed, raising on anything else; Full/Low speed is filled in
/// here (`Interval = 3 + LOG2(bInterval)` for Interrupt/Isochronous, `0`
/// for Control/Bulk, where those fields go unused) since the CH341
/// adapter this driver targets is itself a full-speed device.
#[must_use]
pub fn decode_interval(speed: Speed, transfer_type: u8, b_interval: u8) -> u8 {
    let periodic = transfer_type == ep_type::ISOCHRONOUS || transfer_type == ep_type::INTERRUPT;
    let log2_frames = u32::from(b_interval.max(1)).ilog2() as u8;
    match speed {
        Speed::High | Speed::Super | Speed::SuperPlus if periodic => b_interval.saturating_sub(1),
        Speed::High => log2_frames,
        Speed::Super | Speed::SuperPlus => 0,
        Speed::Full | Speed::Low if periodic => 3 + log2_frames,
        Speed::Full | Speed::Low => 0,
    }
}

/// One non-EP0 endpoint discovered while walking the configuration
/// descriptor, before its Transfer Ring has been allocated.
#[derive(Debug, Clone, Copy)]
pub struct ParsedEndpoint {
    /// Bare endpoint number (1..=15).
    pub number: u8,
    /// `true` for IN.
    pub is_in: bool,
    /// Transfer type, see [`ep_type`].
    pub transfer_type: u8,
    /// `wMaxPacketSize`.
    pub max_packet_size: u16,
    /// Decoded Endpoint Context `Interval` field.
    pub interval: u8,
}

/// A configured, non-EP0 endpoint with its own Transfer Ring, ready for
/// [`crate::xhci::controller::Controller::bulk`].
#[derive(Debug)]
pub struct Endpoint {
    /// Bare endpoint number (1..=15).
    pub number: u8,
    /// `true` for IN.
    pub is_in: bool,
    /// Transfer type, see [`ep_type`].
    pub transfer_type: u8,
    /// `wMaxPacketSize`.
    pub max_packet_size: u16,
    /// This endpoint's Transfer Ring.
    pub ring: TransferRing,
}

impl Endpoint {
    /// The xHCI Endpoint ID the controller and transfer engine expect
    /// (`2 * number + is_in`).
    #[must_use]
    pub const fn endpoint_id(&self) -> u8 {
        crate::xhci::context::endpoint_id(self.number, self.is_in)
    }
}

/// A single enumerated USB device: its negotiated speed, descriptors,
/// EP0 state, and the non-EP0 endpoints `finish_device_config` set up.
#[derive(Debug)]
pub struct UsbDevice {
    /// The xHCI Slot ID this device occupies.
    pub slot_id: u8,
    /// Root hub port number the device is attached to.
    pub port: u8,
    /// Negotiated link speed.
    pub speed: Speed,
    /// The EP0 max packet size currently programmed into the live
    /// Endpoint Context (the speed default until the real device
    /// descriptor is read, the true value afterwards).
    pub mps0: u16,
    /// EP0's Transfer Ring.
    pub ep0_ring: TransferRing,
    /// The 18-byte device descriptor, once read.
    pub descriptor: Option<DeviceDescriptor>,
    /// The 9-byte configuration descriptor header, once read.
    pub configuration: Option<ConfigurationDescriptor>,
    /// Non-EP0 endpoints configured by `finish_device_config`.
    pub endpoints: Vec<Endpoint>,
}

impl UsbDevice {
    /// Find a configured endpoint by its bare number and direction.
    #[must_use]
    pub fn endpoint(&mut self, number: u8, is_in: bool) -> Option<&mut Endpoint> {
        self.endpoints
            .iter_mut()
            .find(|ep| ep.number == number && ep.is_in == is_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_from_psiv_round_trips_through_slot_speed1() {
        for (psiv, expected) in [
            (1, Speed::Full),
            (2, Speed::Low),
            (3, Speed::High),
            (4, Speed::Super),
            (5, Speed::SuperPlus),
        ] {
            let speed = Speed::from_psiv(psiv).unwrap();
            assert_eq!(speed, expected);
            assert_eq!(speed.slot_speed1(), u32::from(psiv));
        }
        assert!(Speed::from_psiv(0).is_err());
        assert!(Speed::from_psiv(6).is_err());
    }

    #[test]
    fn decode_interval_high_speed_interrupt_is_biased_by_one() {
        assert_eq!(decode_interval(Speed::High, ep_type::INTERRUPT, 4), 3);
    }

    #[test]
    fn decode_interval_full_speed_interrupt_adds_frame_bias() {
        // A 1 ms (bInterval == 1) full-speed interrupt endpoint: 3 +
        // floor(log2(1)) == 3.
        assert_eq!(decode_interval(Speed::Full, ep_type::INTERRUPT, 1), 3);
        // 8 ms: 3 + floor(log2(8)) == 6.
        assert_eq!(decode_interval(Speed::Full, ep_type::INTERRUPT, 8), 6);
    }

    #[test]
    fn decode_mps0_rejects_bad_full_speed_value_but_keeps_going() {
        assert_eq!(Speed::Full.decode_mps0(13), 8);
        assert_eq!(Speed::Full.decode_mps0(32), 32);
    }
}
