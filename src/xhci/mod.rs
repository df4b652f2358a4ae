//! The xHCI host-controller driver: register layout, ring primitives,
//! device-context memory model, the command engine, the control/bulk
//! transfer engine, and root-hub port management.

pub mod command;
pub mod context;
pub mod controller;
pub mod hub;
pub mod registers;
pub mod rings;
pub mod transfer;
pub mod trb;
