//! # Transfer Request Block (TRB) codec
//!
//! A TRB is a 16-byte record shared by every xHCI ring. This module gives it
//! a statically typed accessor surface instead of the dynamic bit-slice view
//! the original source used, so that field widths and offsets are checked
//! at compile time rather than by inspection.
//!
//! The four 32-bit words are, in order: `ptr_lo`, `ptr_hi`, `status`,
//! `control`. Which bits of `status`/`control` mean what depends on the TRB
//! type; the accessors below name the field, not the bit position, and are
//! only meaningful for the TRB types documented on them.

use crate::error::{DriverError, Result};

/// The size in bytes of a single TRB. All rings are contiguous arrays of
/// this size.
pub const TRB_SIZE: usize = 16;

/// TRB type values (xHCI spec table 6.5, "TRB Types").
#[allow(missing_docs)]
pub mod trb_type {
    pub const NORMAL: u8 = 1;
    pub const SETUP_STAGE: u8 = 2;
    pub const DATA_STAGE: u8 = 3;
    pub const STATUS_STAGE: u8 = 4;
    pub const LINK: u8 = 6;
    pub const EVENT_DATA: u8 = 7;
    pub const CMD_ENABLE_SLOT: u8 = 9;
    pub const CMD_DISABLE_SLOT: u8 = 10;
    pub const CMD_ADDRESS_DEVICE: u8 = 11;
    pub const CMD_CONFIGURE_ENDPOINT: u8 = 12;
    pub const CMD_EVALUATE_CONTEXT: u8 = 13;
    pub const CMD_RESET_ENDPOINT: u8 = 14;
    pub const CMD_STOP_ENDPOINT: u8 = 15;
    pub const CMD_SET_TR_DEQUEUE_POINTER: u8 = 16;
    pub const CMD_NOOP: u8 = 23;
    pub const EV_TRANSFER: u8 = 32;
    pub const EV_COMMAND_COMPLETION: u8 = 33;
    pub const EV_PORT_STATUS_CHANGE: u8 = 34;
    pub const EV_HOST_CONTROLLER: u8 = 37;
}

/// Setup Stage TRB Transfer Type (TRT) values.
#[allow(missing_docs)]
pub mod transfer_type {
    pub const NO_DATA: u8 = 0;
    pub const OUT_DATA: u8 = 2;
    pub const IN_DATA: u8 = 3;
}

/// Completion codes the controller reports on Event TRBs (xHCI spec table
/// 6.32, "TRB Completion Codes"). Reused from the same enumeration the
/// teacher's device-emulation code defines, because both sides of the wire
/// agree on these values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs, clippy::upper_case_acronyms)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetectedError = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    BandwidthError = 8,
    NoSlotsAvailableError = 9,
    InvalidStreamTypeError = 10,
    SlotNotEnabledError = 11,
    EndpointNotEnabledError = 12,
    ShortPacket = 13,
    RingUnderrun = 14,
    RingOverrun = 15,
    VfEventRingFullError = 16,
    ParameterError = 17,
    BandwidthOverrunError = 18,
    ContextStateError = 19,
    NoPingResponseError = 20,
    EventRingFullError = 21,
    IncompatibleDeviceError = 22,
    MissedServiceError = 23,
    CommandRingStopped = 24,
    CommandAborted = 25,
    Stopped = 26,
    StoppedLengthInvalid = 27,
    StoppedShortPacket = 28,
    MaxExitLatencyTooLargeError = 29,
    Reserved = 30,
    IsochBufferOverrun = 31,
    EventLostError = 32,
    UndefinedError = 33,
    InvalidStreamIdError = 34,
    SecondaryBandwidthError = 35,
    SplitTransactionError = 36,
}

impl CompletionCode {
    /// Decode a raw completion code byte. Unknown values map to `UndefinedError`
    /// rather than failing, since a forward-compatible controller may report
    /// codes this crate doesn't know about yet.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Success,
            2 => Self::DataBufferError,
            3 => Self::BabbleDetectedError,
            4 => Self::UsbTransactionError,
            5 => Self::TrbError,
            6 => Self::StallError,
            7 => Self::ResourceError,
            8 => Self::BandwidthError,
            9 => Self::NoSlotsAvailableError,
            10 => Self::InvalidStreamTypeError,
            11 => Self::SlotNotEnabledError,
            12 => Self::EndpointNotEnabledError,
            13 => Self::ShortPacket,
            14 => Self::RingUnderrun,
            15 => Self::RingOverrun,
            16 => Self::VfEventRingFullError,
            17 => Self::ParameterError,
            18 => Self::BandwidthOverrunError,
            19 => Self::ContextStateError,
            20 => Self::NoPingResponseError,
            21 => Self::EventRingFullError,
            22 => Self::IncompatibleDeviceError,
            23 => Self::MissedServiceError,
            24 => Self::CommandRingStopped,
            25 => Self::CommandAborted,
            26 => Self::Stopped,
            27 => Self::StoppedLengthInvalid,
            28 => Self::StoppedShortPacket,
            29 => Self::MaxExitLatencyTooLargeError,
            31 => Self::IsochBufferOverrun,
            32 => Self::EventLostError,
            34 => Self::InvalidStreamIdError,
            35 => Self::SecondaryBandwidthError,
            36 => Self::SplitTransactionError,
            _ => Self::UndefinedError,
        }
    }

    /// True for the two codes that represent a (possibly partial) success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}

/// A single 16-byte TRB, stored as four native-endian 32-bit words but
/// always serialized little-endian on the wire (matching DMA memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trb {
    words: [u32; 4],
}

impl Trb {
    /// A TRB with every field zero, including the cycle bit.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { words: [0; 4] }
    }

    /// Decode a TRB from its 16-byte little-endian wire representation.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TRB_SIZE]) -> Self {
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Self { words }
    }

    /// Encode the TRB to its 16-byte little-endian wire representation.
    #[must_use]
    pub fn to_bytes(self) -> [u8; TRB_SIZE] {
        let mut bytes = [0u8; TRB_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// The 64-bit parameter field (`ptr_lo`/`ptr_hi`), used as a DMA pointer
    /// by most TRB types and as up-to-8-bytes of immediate data when `IDT`
    /// is set on a Setup Stage TRB.
    #[must_use]
    pub const fn parameter(&self) -> u64 {
        (self.words[0] as u64) | ((self.words[1] as u64) << 32)
    }

    /// Set the 64-bit parameter field.
    pub fn set_parameter(&mut self, value: u64) -> &mut Self {
        self.words[0] = value as u32;
        self.words[1] = (value >> 32) as u32;
        self
    }

    /// Port ID carried by a Port Status Change Event, in bits `24..32` of
    /// `ptr_lo`. Only meaningful on that TRB type.
    #[must_use]
    pub const fn port_id(&self) -> u8 {
        ((self.words[0] >> 24) & 0xff) as u8
    }

    /// Set the port ID field of a Port Status Change Event.
    pub fn set_port_id(&mut self, port_id: u8) -> &mut Self {
        self.words[0] = (self.words[0] & 0x00ff_ffff) | ((port_id as u32) << 24);
        self
    }

    const fn status_bits(&self, shift: u32, width: u32) -> u32 {
        (self.words[2] >> shift) & ((1 << width) - 1)
    }

    fn set_status_bits(&mut self, shift: u32, width: u32, value: u32) -> &mut Self {
        let mask = ((1u32 << width) - 1) << shift;
        self.words[2] = (self.words[2] & !mask) | ((value << shift) & mask);
        self
    }

    /// `TRB Transfer Length`: bytes transferred or requested (17 bits).
    #[must_use]
    pub const fn transfer_length(&self) -> u32 {
        self.status_bits(0, 17)
    }

    /// Set the `TRB Transfer Length` field.
    pub fn set_transfer_length(&mut self, length: u32) -> &mut Self {
        self.set_status_bits(0, 17, length)
    }

    /// `TD Size`: remaining packets in the TD, capped at 31 (5 bits).
    #[must_use]
    pub const fn td_size(&self) -> u32 {
        self.status_bits(17, 5)
    }

    /// Set the `TD Size` field.
    pub fn set_td_size(&mut self, td_size: u32) -> &mut Self {
        self.set_status_bits(17, 5, td_size.min(31))
    }

    /// `Completion Parameter`: command- or transfer-specific payload on an
    /// Event TRB (24 bits).
    #[must_use]
    pub const fn completion_parameter(&self) -> u32 {
        self.status_bits(0, 24)
    }

    /// Set the `Completion Parameter` field.
    pub fn set_completion_parameter(&mut self, value: u32) -> &mut Self {
        self.set_status_bits(0, 24, value)
    }

    /// `Completion Code`, valid on Event TRBs only (top byte of `status`).
    #[must_use]
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw(self.status_bits(24, 8) as u8)
    }

    /// Set the `Completion Code` field.
    pub fn set_completion_code(&mut self, code: CompletionCode) -> &mut Self {
        self.set_status_bits(24, 8, code as u32)
    }

    const fn control_bits(&self, shift: u32, width: u32) -> u32 {
        (self.words[3] >> shift) & ((1 << width) - 1)
    }

    fn set_control_bits(&mut self, shift: u32, width: u32, value: u32) -> &mut Self {
        let mask = ((1u32 << width) - 1) << shift;
        self.words[3] = (self.words[3] & !mask) | ((value << shift) & mask);
        self
    }

    /// The cycle bit `C`. Ownership of a ring slot is determined solely by
    /// comparing this bit against the ring's producer/consumer cycle state.
    #[must_use]
    pub const fn cycle(&self) -> bool {
        self.control_bits(0, 1) != 0
    }

    /// Set the cycle bit. Per the ring-enqueue contract, this must be the
    /// last field written before the TRB is handed to the controller.
    pub fn set_cycle(&mut self, cycle: bool) -> &mut Self {
        self.set_control_bits(0, 1, cycle as u32)
    }

    /// Toggle Cycle (`TC`), meaningful only on LINK TRBs: when set, crossing
    /// this TRB flips the ring's producer cycle state.
    #[must_use]
    pub const fn toggle_cycle(&self) -> bool {
        self.control_bits(1, 1) != 0
    }

    /// Set the Toggle Cycle bit.
    pub fn set_toggle_cycle(&mut self, tc: bool) -> &mut Self {
        self.set_control_bits(1, 1, tc as u32)
    }

    /// Evaluate Next TRB (`ENT`), meaningful on Normal/Data/Setup/Status
    /// Stage TRBs. Shares a bit position with `TC` (the two never coexist
    /// on the same TRB type).
    #[must_use]
    pub const fn evaluate_next_trb(&self) -> bool {
        self.control_bits(1, 1) != 0
    }

    /// Set the Evaluate Next TRB bit.
    pub fn set_evaluate_next_trb(&mut self, ent: bool) -> &mut Self {
        self.set_control_bits(1, 1, ent as u32)
    }

    /// Interrupt-on-Short-Packet (`ISP`).
    #[must_use]
    pub const fn interrupt_on_short_packet(&self) -> bool {
        self.control_bits(2, 1) != 0
    }

    /// Set the Interrupt-on-Short-Packet bit.
    pub fn set_interrupt_on_short_packet(&mut self, isp: bool) -> &mut Self {
        self.set_control_bits(2, 1, isp as u32)
    }

    /// Chain bit (`CH`): links this TRB to the next one as part of the same
    /// TD.
    #[must_use]
    pub const fn chain(&self) -> bool {
        self.control_bits(4, 1) != 0
    }

    /// Set the chain bit.
    pub fn set_chain(&mut self, chain: bool) -> &mut Self {
        self.set_control_bits(4, 1, chain as u32)
    }

    /// Interrupt-on-Completion (`IOC`).
    #[must_use]
    pub const fn interrupt_on_completion(&self) -> bool {
        self.control_bits(5, 1) != 0
    }

    /// Set the Interrupt-on-Completion bit.
    pub fn set_interrupt_on_completion(&mut self, ioc: bool) -> &mut Self {
        self.set_control_bits(5, 1, ioc as u32)
    }

    /// Immediate Data (`IDT`): the parameter field holds up to 8 bytes of
    /// data directly instead of a DMA pointer. Only meaningful on Setup
    /// Stage TRBs.
    #[must_use]
    pub const fn immediate_data(&self) -> bool {
        self.control_bits(6, 1) != 0
    }

    /// Set the Immediate Data bit.
    pub fn set_immediate_data(&mut self, idt: bool) -> &mut Self {
        self.set_control_bits(6, 1, idt as u32)
    }

    /// Deconfigure (`DC`), meaningful only on a Configure Endpoint Command
    /// TRB: requests the controller deconfigure the device instead of
    /// applying the supplied Input Context.
    #[must_use]
    pub const fn deconfigure(&self) -> bool {
        self.control_bits(9, 1) != 0
    }

    /// Set the Deconfigure bit.
    pub fn set_deconfigure(&mut self, dc: bool) -> &mut Self {
        self.set_control_bits(9, 1, dc as u32)
    }

    /// The 6-bit TRB Type field.
    #[must_use]
    pub const fn trb_type(&self) -> u8 {
        self.control_bits(10, 6) as u8
    }

    /// Set the TRB Type field.
    pub fn set_trb_type(&mut self, trb_type: u8) -> &mut Self {
        self.set_control_bits(10, 6, trb_type as u32)
    }

    /// Setup Stage Transfer Type (`TRT`, 2 bits) or Data/Status Stage
    /// Direction (1 bit, `DIR`); both live in the low bits of the upper
    /// halfword and are interpreted according to `trb_type()`.
    #[must_use]
    pub const fn transfer_type_or_direction(&self) -> u8 {
        self.control_bits(16, 2) as u8
    }

    /// Set the Setup Stage Transfer Type / Data-Status Stage Direction field.
    pub fn set_transfer_type_or_direction(&mut self, value: u8) -> &mut Self {
        self.set_control_bits(16, 2, value as u32)
    }

    /// Endpoint ID (5 bits): `2*endpoint_number + (direction==IN)`.
    #[must_use]
    pub const fn endpoint_id(&self) -> u8 {
        self.control_bits(16, 5) as u8
    }

    /// Set the Endpoint ID field.
    pub fn set_endpoint_id(&mut self, endpoint_id: u8) -> &mut Self {
        self.set_control_bits(16, 5, endpoint_id as u32)
    }

    /// Slot ID (8 bits): identifies the device slot a command or event is
    /// associated with.
    #[must_use]
    pub const fn slot_id(&self) -> u8 {
        self.control_bits(24, 8) as u8
    }

    /// Set the Slot ID field.
    pub fn set_slot_id(&mut self, slot_id: u8) -> &mut Self {
        self.set_control_bits(24, 8, slot_id as u32)
    }

    /// Build a fresh TRB of the given type with the cycle bit left at 0;
    /// the ring is responsible for setting it last as part of enqueuing.
    #[must_use]
    pub fn make(trb_type: u8) -> Self {
        let mut trb = Self::zeroed();
        trb.set_trb_type(trb_type);
        trb
    }

    /// Decode this TRB's type into a `DriverError::ProtocolError` if it is
    /// not one of the known [`trb_type`] constants expected in `allowed`.
    pub fn expect_type(&self, allowed: &[u8]) -> Result<u8> {
        let ty = self.trb_type();
        if allowed.contains(&ty) {
            Ok(ty)
        } else {
            Err(DriverError::ProtocolError(format!(
                "unexpected TRB type {ty}, expected one of {allowed:?}"
            )))
        }
    }
}
