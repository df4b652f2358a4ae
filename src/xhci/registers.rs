//! xHCI MMIO register offsets.
//!
//! Offsets are relative to the start of the controller's single MMIO BAR, as
//! required by [`crate::capability::BarBus`]. Capability registers sit at the
//! start of the BAR; operational registers begin at [`CAPLENGTH`]'s value
//! (fixed at [`OPERATIONAL_BASE`] for the controllers this crate targets);
//! runtime and doorbell registers are each relative to their own offset.

/// `CAPLENGTH` (8 bits) / `HCIVERSION` (16 bits at +2).
pub const CAPLENGTH: u64 = 0x00;
/// `HCSPARAMS1`: bits `0..8` MaxSlots, `8..16` MaxIntrs, `24..32` MaxPorts.
pub const HCSPARAMS1: u64 = 0x04;
/// `HCSPARAMS2`: bits `21..26` / `27..32` Max Scratchpad Buffers (hi/lo).
pub const HCSPARAMS2: u64 = 0x08;
/// `DBOFF`: doorbell array offset from the BAR start.
pub const DBOFF: u64 = 0x14;
/// `RTSOFF`: runtime register offset from the BAR start.
pub const RTSOFF: u64 = 0x18;

/// Fixed operational register base used by the controllers this crate
/// targets (equivalently, the `CAPLENGTH` this crate expects to read).
pub const OPERATIONAL_BASE: u64 = 0x80;

/// `USBCMD`, bit 0 Run/Stop, bit 1 Host Controller Reset.
pub const USBCMD: u64 = OPERATIONAL_BASE + 0x00;
/// `USBSTS`, bit 0 HCHalted, bit 11 Controller Not Ready.
pub const USBSTS: u64 = OPERATIONAL_BASE + 0x04;
/// `PAGESIZE`.
pub const PAGESIZE: u64 = OPERATIONAL_BASE + 0x08;
/// `CRCR` (64-bit): Command Ring Control Register.
pub const CRCR: u64 = OPERATIONAL_BASE + 0x18;
/// `DCBAAP` (64-bit): Device Context Base Address Array Pointer.
pub const DCBAAP: u64 = OPERATIONAL_BASE + 0x30;
/// `CONFIG`: bits `0..8` MaxSlotsEn.
pub const CONFIG: u64 = OPERATIONAL_BASE + 0x38;
/// Per-port `PORTSC` base; port `i` (1-based) lives at
/// `PORTSC_BASE + 0x10 * (i - 1)`.
pub const PORTSC_BASE: u64 = OPERATIONAL_BASE + 0x400;
/// Byte stride between consecutive ports' register quartets.
pub const PORTSC_STRIDE: u64 = 0x10;

/// `USBCMD.R/S`.
pub const USBCMD_RUN: u32 = 1 << 0;
/// `USBCMD.HCRST`.
pub const USBCMD_HCRST: u32 = 1 << 1;
/// `USBSTS.HCH`.
pub const USBSTS_HCH: u32 = 1 << 0;
/// `USBSTS.CNR`.
pub const USBSTS_CNR: u32 = 1 << 11;

/// `CRCR.RCS` (Ring Cycle State), consumed only on the initial write.
pub const CRCR_RCS: u64 = 1 << 0;
/// `CRCR.CS` (Command Stop).
pub const CRCR_CS: u64 = 1 << 1;
/// `CRCR.CA` (Command Abort).
pub const CRCR_CA: u64 = 1 << 2;
/// `CRCR.CRR` (Command Ring Running, read-only).
pub const CRCR_CRR: u64 = 1 << 3;
/// Mask of the 64-bit ring-segment pointer inside `CRCR`.
pub const CRCR_POINTER_MASK: u64 = !0x3f;

/// Runtime register set base, relative to the BAR (the controllers this
/// crate targets place it at a fixed offset; `RTSOFF` confirms it).
pub const RUNTIME_BASE: u64 = 0x2000;
/// `ERSTSZ` of interrupter 0.
pub const ERSTSZ: u64 = RUNTIME_BASE + 0x28;
/// `ERSTBA` of interrupter 0 (64-bit).
pub const ERSTBA: u64 = RUNTIME_BASE + 0x30;
/// `ERDP` of interrupter 0 (64-bit).
pub const ERDP: u64 = RUNTIME_BASE + 0x38;

/// `ERDP.EHB` (Event Handler Busy), cleared by writing 1.
pub const ERDP_EHB: u64 = 1 << 3;
/// Mask of the 64-bit dequeue pointer inside `ERDP`.
pub const ERDP_POINTER_MASK: u64 = !0xf;

/// Doorbell array base, relative to the BAR.
pub const DOORBELL_BASE: u64 = 0x3000;
/// Byte stride between consecutive doorbell registers.
pub const DOORBELL_STRIDE: u64 = 4;

/// PORTSC bit positions and widths (xHCI spec section 5.4.8).
pub mod portsc {
    /// Current Connect Status.
    pub const CCS: u32 = 1 << 0;
    /// Port Enabled/Disabled.
    pub const PED: u32 = 1 << 1;
    /// Port Reset.
    pub const PR: u32 = 1 << 4;
    /// Port Link State, bits `5..9`.
    pub const PLS_SHIFT: u32 = 5;
    /// Width of the Port Link State field.
    pub const PLS_WIDTH: u32 = 4;
    /// Port Power.
    pub const PP: u32 = 1 << 9;
    /// Port Speed, bits `10..14`.
    pub const SPEED_SHIFT: u32 = 10;
    /// Width of the Port Speed field.
    pub const SPEED_WIDTH: u32 = 4;
    /// Warm Port Reset (USB3 only).
    pub const WPR: u32 = 1 << 16;
    /// Connect Status Change (RW1C).
    pub const CSC: u32 = 1 << 17;
    /// Port Enabled/Disabled Change (RW1C).
    pub const PEC: u32 = 1 << 18;
    /// Warm Port Reset Change (RW1C, USB3 only).
    pub const WRC: u32 = 1 << 19;
    /// Over-current Change (RW1C).
    pub const OCC: u32 = 1 << 20;
    /// Port Reset Change (RW1C).
    pub const PRC: u32 = 1 << 21;
    /// Port Link State Change (RW1C).
    pub const PLC: u32 = 1 << 22;
    /// Port Config Error Change (RW1C).
    pub const CEC: u32 = 1 << 23;

    /// All RW1C change bits; writing this mask back acknowledges every
    /// pending status change in one read-modify-write.
    pub const ALL_CHANGE_BITS: u32 = CSC | PEC | WRC | OCC | PRC | PLC | CEC;

    /// Bits that are neither RW1C nor pure read-only and must be preserved
    /// verbatim across a read-modify-write (Port Power, and in principle
    /// Port Indicator Control / Port Link State writes for link-state
    /// transitions this crate never issues).
    pub const PRESERVE_MASK: u32 = PP;
}
