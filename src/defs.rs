//! Core IEEE 1394 types shared across the engine.

use core::fmt;

use alloc::boxed::Box;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 48-bit IEEE 1394 address together with the 16-bit node id.
///
/// The node id packs `bus[15:10] | node[5:0]`. The default value is the
/// conventional invalid sentinel `0xdead:cafebabe`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FwAddress {
	/// Bus/node identifier (`bus[15:10] | node[5:0]`).
	pub node_id: u16,
	/// Upper 16 bits of the 48-bit address space.
	pub hi: u16,
	/// Lower 32 bits of the 48-bit address space.
	pub lo: u32,
}

impl FwAddress {
	/// The invalid sentinel address.
	pub const INVALID: FwAddress = FwAddress {
		node_id: 0,
		hi: 0xdead,
		lo: 0xcafe_babe,
	};

	/// First quadlet of the Config ROM (base of the bus-info block).
	pub const CONFIG_ROM: FwAddress = FwAddress::new(0xFFFF, 0xF000_0400);

	/// Quadlets in a bus-info block, starting at [`FwAddress::CONFIG_ROM`].
	pub const BIB_QUADLETS: usize = 5;

	pub const fn new(hi: u16, lo: u32) -> Self {
		FwAddress { node_id: 0, hi, lo }
	}

	/// Packs into 64 bits: `node_id[63:48] | hi[47:32] | lo[31:0]`.
	pub const fn to_u64(self) -> u64 {
		((self.node_id as u64) << 48) | ((self.hi as u64) << 32) | self.lo as u64
	}

	/// Unpacks the 64-bit form produced by [`FwAddress::to_u64`].
	pub const fn from_u64(target: u64) -> Self {
		FwAddress {
			node_id: (target >> 48) as u16,
			hi: (target >> 32) as u16,
			lo: target as u32,
		}
	}

	pub const fn is_valid(self) -> bool {
		!(self.hi == Self::INVALID.hi && self.lo == Self::INVALID.lo)
	}
}

impl Default for FwAddress {
	fn default() -> Self {
		Self::INVALID
	}
}

impl fmt::Display for FwAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:#06x}:{:08x} (node={:#06x})", self.hi, self.lo, self.node_id)
	}
}

/// A 6-bit node number. 63 is the broadcast node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u8);

impl NodeId {
	pub const BROADCAST: NodeId = NodeId(63);

	pub const fn new(node: u8) -> Self {
		NodeId(node & 0x3F)
	}

	pub const fn get(self) -> u8 {
		self.0
	}

	pub const fn is_broadcast(self) -> bool {
		self.0 == Self::BROADCAST.0
	}
}

impl From<u8> for NodeId {
	fn from(value: u8) -> Self {
		NodeId::new(value)
	}
}

impl From<NodeId> for u8 {
	fn from(value: NodeId) -> Self {
		value.get()
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// 8-bit monotonic bus generation. 0 means "unknown".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Generation(pub u8);

impl Generation {
	pub const UNKNOWN: Generation = Generation(0);

	pub const fn get(self) -> u8 {
		self.0
	}

	/// The successor generation; wraps but never lands on "unknown".
	pub const fn next(self) -> Generation {
		let n = self.0.wrapping_add(1);
		Generation(if n == 0 { 1 } else { n })
	}
}

impl fmt::Display for Generation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// IEEE 1394 transmission speed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FwSpeed {
	S100 = 0,
	S200 = 1,
	S400 = 2,
	S800 = 3,
}

impl FwSpeed {
	/// The next slower speed, used by the fallback ladder S800→S400→S200→S100.
	pub const fn step_down(self) -> Option<FwSpeed> {
		match self {
			FwSpeed::S800 => Some(FwSpeed::S400),
			FwSpeed::S400 => Some(FwSpeed::S200),
			FwSpeed::S200 => Some(FwSpeed::S100),
			FwSpeed::S100 => None,
		}
	}
}

/// IEEE 1394 transaction codes (IEEE 1394-1995 clause 6.2, table 6-1).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TCode {
	WriteQuadletRequest = 0x0,
	WriteBlockRequest = 0x1,
	WriteResponse = 0x2,
	ReadQuadletRequest = 0x4,
	ReadBlockRequest = 0x5,
	ReadQuadletResponse = 0x6,
	ReadBlockResponse = 0x7,
	CycleStart = 0x8,
	LockRequest = 0x9,
	AsyncStream = 0xA,
	LockResponse = 0xB,
	LinkInternal = 0xD,
	PhyPacket = 0xE,
}

impl TCode {
	/// Header length in the AR DMA stream.
	///
	/// Matches the Linux `handle_ar_packet()` assignments; quadlet data of
	/// write-quadlet requests and read-quadlet responses counts as header.
	pub const fn ar_header_length(self) -> usize {
		match self {
			TCode::WriteQuadletRequest
			| TCode::WriteBlockRequest
			| TCode::ReadBlockRequest
			| TCode::ReadQuadletResponse
			| TCode::ReadBlockResponse
			| TCode::CycleStart
			| TCode::LockRequest
			| TCode::LockResponse => 16,
			TCode::WriteResponse
			| TCode::ReadQuadletRequest
			| TCode::LinkInternal
			| TCode::PhyPacket => 12,
			TCode::AsyncStream => 8,
		}
	}

	/// Whether a separate payload follows the header, with its length taken
	/// from quadlet 3 bits [31:16] (quadlet 1 for async streams).
	pub const fn has_payload(self) -> bool {
		matches!(
			self,
			TCode::WriteBlockRequest
				| TCode::ReadBlockResponse
				| TCode::LockRequest
				| TCode::LockResponse
				| TCode::AsyncStream
		)
	}

	pub const fn is_response(self) -> bool {
		matches!(
			self,
			TCode::WriteResponse
				| TCode::ReadQuadletResponse
				| TCode::ReadBlockResponse
				| TCode::LockResponse
		)
	}
}

/// IEEE 1394 response codes (IEEE 1394-1995 table 6-3).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RCode {
	Complete = 0x0,
	ConflictError = 0x4,
	DataError = 0x5,
	TypeError = 0x6,
	AddressError = 0x7,
}

/// Lock operations, named by their extended tCode value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum LockOp {
	MaskSwap = 0x1,
	CompareSwap = 0x2,
	FetchAdd = 0x3,
	LittleAdd = 0x4,
	BoundedAdd = 0x5,
	WrapAdd = 0x6,
}

impl LockOp {
	pub const fn extended_tcode(self) -> u16 {
		self as u16
	}
}

/// How a transaction reaches its terminal state.
///
/// Read and lock requests need the response packet (and its payload), a
/// quadlet write is done once the target acks it, and a block write that was
/// acked with ack-pending needs both legs. PHY packets are acked by the local
/// link only and never see a response, so they keep their own strategy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompletionStrategy {
	/// Terminal on ack-complete from the AT descriptor.
	CompleteOnAt,
	/// The AT ack is recorded, the AR response completes.
	CompleteOnAr,
	/// Both legs: the AT ack must be pending/complete, the AR response
	/// completes.
	RequireBoth,
	/// PHY packets: terminal on AT, with no response ever expected.
	CompleteOnPhy,
}

impl CompletionStrategy {
	pub const fn expects_response(self) -> bool {
		matches!(self, CompletionStrategy::CompleteOnAr | CompletionStrategy::RequireBoth)
	}
}

/// Terminal outcome of an asynchronous transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TransactionStatus {
	/// Transaction completed; the payload (if any) was delivered.
	Success,
	/// Deadline exceeded after all retries.
	Timeout,
	/// The response carried less data than requested.
	ShortRead,
	/// ack-busy observed after all retries.
	BusyRetryExhausted,
	/// Canceled by the caller.
	Aborted,
	/// An OHCI event or rCode indicating a packet, data or address error.
	HardwareError,
	/// A lock completed but the compare step did not take effect. Never
	/// synthesized by the engine itself; the old value is opaque to it.
	LockCompareFail,
	/// The transaction belonged to a previous bus generation.
	StaleGeneration,
}

/// Completion callback: terminal status plus the response payload (empty for
/// writes and failures). Invoked exactly once per submitted transaction.
pub type CompletionCallback = Box<dyn FnOnce(TransactionStatus, &[u8]) + Send>;

/// An opaque handle for an in-flight transaction.
///
/// Low 12 bits index the outstanding table, bits [15:12] carry a reuse tag so
/// stale handles are detected. The all-zero value is invalid; when index and
/// tag would both be zero the tag is forced to 1.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AsyncHandle(u32);

impl AsyncHandle {
	pub const INVALID: AsyncHandle = AsyncHandle(0);

	const INDEX_MASK: u32 = 0x0FFF;
	const TAG_SHIFT: u32 = 12;
	const TAG_MASK: u32 = 0xF000;

	pub const fn pack(index: u16, tag: u8) -> Self {
		let mut v = (((tag as u32) & 0xF) << Self::TAG_SHIFT) | (index as u32 & Self::INDEX_MASK);
		if v == 0 {
			v = 1 << Self::TAG_SHIFT;
		}
		AsyncHandle(v)
	}

	pub const fn index(self) -> usize {
		(self.0 & Self::INDEX_MASK) as usize
	}

	pub const fn tag(self) -> u8 {
		((self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT) as u8
	}

	pub const fn is_valid(self) -> bool {
		self.0 != 0
	}

	pub const fn raw(self) -> u32 {
		self.0
	}
}

impl Default for AsyncHandle {
	fn default() -> Self {
		Self::INVALID
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn address_packs_and_unpacks() {
		let addr = FwAddress {
			node_id: 0xFFC1,
			hi: 0xFFFF,
			lo: 0xF000_0400,
		};
		assert_eq!(FwAddress::from_u64(addr.to_u64()), addr);
		assert!(!FwAddress::INVALID.is_valid());
		assert!(FwAddress::CONFIG_ROM.is_valid());
	}

	#[test]
	fn handle_zero_is_never_produced() {
		let h = AsyncHandle::pack(0, 0);
		assert!(h.is_valid());
		assert_eq!(h.index(), 0);
		assert_eq!(h.tag(), 1);

		let h = AsyncHandle::pack(5, 3);
		assert_eq!(h.index(), 5);
		assert_eq!(h.tag(), 3);
	}

	#[test]
	fn speed_fallback_ladder() {
		assert_eq!(FwSpeed::S800.step_down(), Some(FwSpeed::S400));
		assert_eq!(FwSpeed::S400.step_down(), Some(FwSpeed::S200));
		assert_eq!(FwSpeed::S200.step_down(), Some(FwSpeed::S100));
		assert_eq!(FwSpeed::S100.step_down(), None);
	}

	#[test]
	fn generation_never_wraps_to_unknown() {
		assert_eq!(Generation(255).next(), Generation(1));
		assert_eq!(Generation(1).next(), Generation(2));
	}

	#[test]
	fn ar_header_lengths_match_the_linux_table() {
		assert_eq!(TCode::WriteQuadletRequest.ar_header_length(), 16);
		assert_eq!(TCode::WriteBlockRequest.ar_header_length(), 16);
		assert_eq!(TCode::WriteResponse.ar_header_length(), 12);
		assert_eq!(TCode::ReadQuadletRequest.ar_header_length(), 12);
		assert_eq!(TCode::ReadBlockRequest.ar_header_length(), 16);
		assert_eq!(TCode::ReadQuadletResponse.ar_header_length(), 16);
		assert_eq!(TCode::ReadBlockResponse.ar_header_length(), 16);
		assert_eq!(TCode::LockRequest.ar_header_length(), 16);
		assert_eq!(TCode::LockResponse.ar_header_length(), 16);
		assert_eq!(TCode::AsyncStream.ar_header_length(), 8);
		assert_eq!(TCode::PhyPacket.ar_header_length(), 12);
	}
}
