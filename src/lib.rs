//! # Out-of-host xHCI driver stack
//!
//! This crate programs an xHCI host controller from the driver side: it owns
//! the Command/Event/Transfer rings, drives the root-hub port state machine,
//! enumerates a single attached device, and speaks the CH341 USB-serial
//! protocol on top of the resulting control and bulk pipes.
//!
//! The crate never talks to real hardware directly. All MMIO and physical
//! memory access is expressed through the [`capability::BarBus`] and
//! [`capability::HostMem`] traits; callers supply implementations that are
//! appropriate for their environment (a sideband channel, `/dev/mem`, a
//! hypervisor-exposed BAR, ...). Test code backs both with in-memory fakes.
#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![allow(rustdoc::private_doc_tests)]
#![deny(missing_debug_implementations)]

pub mod capability;
pub mod ch341;
pub mod error;
pub mod memdump;
pub mod serial;
pub mod usb;
pub mod xhci;

#[cfg(test)]
pub(crate) mod testutils;
