//! Asynchronous transaction engine for IEEE 1394 OHCI host controllers.
//!
//! This crate implements the asynchronous request/response machinery of an
//! OHCI 1.1 FireWire link controller: construction of AT descriptor chains,
//! submission to the AT Request/Response DMA contexts, parsing and routing of
//! the AR receive streams, and the bookkeeping in between (transaction labels,
//! outstanding-transaction tracking, timeouts, retries, speed fallback and
//! bus-generation invalidation).
//!
//! The crate deliberately ends where the bus-attach layer begins. Register
//! access and DMA allocation are consumed through [`hw::HardwareInterface`],
//! topology knowledge through [`hw::BusInfo`], and the engine is offered to
//! upper protocols as the [`bus::BusOps`] facade. Isochronous DMA, self-ID
//! parsing and Config-ROM interpretation live elsewhere.
//!
//! For the DMA programming model see OHCI 1.1 chapters 7 (asynchronous
//! transmit) and 8 (asynchronous receive); packet formats follow
//! IEEE 1394-1995 clause 6.

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

pub mod bus;
mod completion;
pub mod config;
pub mod defs;
pub mod descriptor;
pub mod diag;
mod error;
pub mod hw;
pub mod label;
pub mod packet;
pub mod payload;
pub mod receive;
pub mod regs;
pub mod retry;
pub mod ring;
pub mod timeout;
pub mod transaction;
pub mod transmit;
pub mod wire;

mod generation;

pub use self::bus::{AsyncSubsystem, BusOps};
pub use self::config::EngineConfig;
pub use self::defs::{
	AsyncHandle, CompletionCallback, FwAddress, FwSpeed, Generation, LockOp, NodeId, RCode, TCode,
	TransactionStatus,
};
pub use self::error::EngineError;
pub use self::retry::RetryPolicy;
