//! OHCI 1.1 register layout, limited to what the async engine touches.
//!
//! Offsets are relative to the controller's register base; the bus-attach
//! layer resolves the base through its [`crate::hw::HardwareInterface`].

use bitflags::bitflags;

/// AT Request context register block (OHCI 1.1 table 4-1).
pub const AT_REQUEST_BASE: u32 = 0x180;
/// AT Response context register block.
pub const AT_RESPONSE_BASE: u32 = 0x1A0;
/// AR Request context register block.
pub const AR_REQUEST_BASE: u32 = 0x1C0;
/// AR Response context register block.
pub const AR_RESPONSE_BASE: u32 = 0x1E0;

/// ContextControlSet, relative to a context register block.
pub const CONTEXT_CONTROL_SET: u32 = 0x0;
/// ContextControlClear, relative to a context register block.
pub const CONTEXT_CONTROL_CLEAR: u32 = 0x4;
/// CommandPtr, relative to a context register block.
pub const COMMAND_PTR: u32 = 0xC;

pub const INT_EVENT_SET: u32 = 0x80;
pub const INT_EVENT_CLEAR: u32 = 0x84;
pub const INT_MASK_SET: u32 = 0x88;
pub const INT_MASK_CLEAR: u32 = 0x8C;

/// NodeID register; bit 31 flags a valid id.
pub const NODE_ID: u32 = 0xE8;
pub const NODE_ID_VALID: u32 = 1 << 31;

bitflags! {
	/// ContextControl bits (OHCI 1.1 section 5.5).
	///
	/// The low 5 bits of a completed descriptor's `xferStatus` carry the
	/// event code copied from here; see [`crate::descriptor::AtEvent`].
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct ContextControl: u32 {
		const RUN = 1 << 15;
		const WAKE = 1 << 12;
		const DEAD = 1 << 11;
		const ACTIVE = 1 << 10;
	}
}

bitflags! {
	/// IntEvent bits consumed by the async engine (OHCI 1.1 section 6.1).
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct IntEvent: u32 {
		const REQ_TX_COMPLETE = 1 << 0;
		const RESP_TX_COMPLETE = 1 << 1;
		const ARRQ = 1 << 2;
		const ARRS = 1 << 3;
		const RQ_PKT = 1 << 4;
		const RS_PKT = 1 << 5;
		const BUS_RESET = 1 << 17;
		const MASTER_ENABLE = 1 << 31;
	}
}
