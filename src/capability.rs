//! # Hardware access capabilities
//!
//! The driver core never touches hardware directly. It is built against two
//! small capability traits that callers implement for whatever transport
//! actually reaches the controller (a sideband channel, a mapped BAR, a
//! hypervisor pass-through API, ...). Production implementations of these
//! traits are out of scope for this crate; only the interface lives here.
//!
//! Test code in this crate backs both traits with in-memory fakes, see
//! `crate::testutils`.

use std::fmt::Debug;
use std::sync::Arc;

/// The width of a single MMIO or physical-memory access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AccessWidth {
    Width8 = 1,
    Width16 = 2,
    Width32 = 4,
    Width64 = 8,
}

/// Access to the controller's MMIO BAR and PCI configuration space.
///
/// Offsets passed to the `read*`/`write*` methods are relative to the start
/// of the controller's single MMIO BAR, matching the register map in this
/// crate's specification (`USBCMD` at `0x80`, and so on).
pub trait BarBus: Debug {
    /// Read 8 bits from the MMIO BAR at `offset`.
    fn read8(&self, offset: u64) -> u8;
    /// Read 16 bits from the MMIO BAR at `offset`.
    fn read16(&self, offset: u64) -> u16;
    /// Read 32 bits from the MMIO BAR at `offset`.
    fn read32(&self, offset: u64) -> u32;
    /// Read 64 bits from the MMIO BAR at `offset`.
    fn read64(&self, offset: u64) -> u64;

    /// Write 8 bits to the MMIO BAR at `offset`.
    fn write8(&self, offset: u64, value: u8);
    /// Write 16 bits to the MMIO BAR at `offset`.
    fn write16(&self, offset: u64, value: u16);
    /// Write 32 bits to the MMIO BAR at `offset`.
    fn write32(&self, offset: u64, value: u32);
    /// Write 64 bits to the MMIO BAR at `offset`.
    fn write64(&self, offset: u64, value: u64);

    /// Read a 32-bit value from PCI configuration space at `offset`.
    fn pci_config_read32(&self, offset: u16) -> u32;
    /// Write a 32-bit value to PCI configuration space at `offset`.
    fn pci_config_write32(&self, offset: u16, value: u32);
}

/// Byte-addressable access to host physical memory, used for all DMA
/// structures the controller reads and writes (rings, contexts, DCBAA,
/// scratchpads, bounce buffers).
///
/// Implementations are expected to make writes immediately observable to a
/// concurrently DMA-ing controller; this crate does not model a separate
/// flush or write-combining-buffer primitive (see Open Question (a) in
/// `SPEC_FULL.md`).
pub trait HostMem: Debug {
    /// Read `buf.len()` bytes starting at physical address `addr`.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]);
    /// Write `buf` to physical address `addr`.
    fn write_bytes(&self, addr: u64, buf: &[u8]);

    /// Read a little-endian `u32` at `addr`.
    fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Read a little-endian `u64` at `addr`.
    fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    /// Write a little-endian `u32` at `addr`.
    fn write_u32(&self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// Write a little-endian `u64` at `addr`.
    fn write_u64(&self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// Allocate a zeroed, DMA-aligned block of `size` bytes and return its
    /// physical address. `align` is the required alignment in bytes (the
    /// ring and context structures in this crate need 64-byte alignment).
    fn alloc_dma(&self, size: u64, align: u64) -> u64;
}

/// A reference-counted, thread-safe handle to the controller's MMIO BAR.
pub type BarBusRef = Arc<dyn BarBus + Send + Sync>;

/// A reference-counted, thread-safe handle to host physical memory.
pub type HostMemRef = Arc<dyn HostMem + Send + Sync>;
