//! Construction of OHCI-internal AT packet headers.
//!
//! AT headers are written in *host* byte order; the controller translates to
//! the big-endian wire format on transmit (OHCI 1.1 section 7.8). Quadlet 0
//! uses the OHCI-internal layout, which differs from the wire layout:
//!
//! ```text
//! [srcBusID:1] .. [spd:3]   [tLabel:6] [rt:2] [tCode:4] [priority:4]
//!  bit 23         bits 18:16  15:10      9:8    7:4        3:0
//! ```
//!
//! The tLabel position here is load-bearing: it must equal the position the
//! receive path extracts from (quadlet 0 bits [15:10]), or responses stop
//! matching requests.

use crate::defs::{FwAddress, FwSpeed, Generation, NodeId, RCode, TCode};
use crate::error::EngineError;
use crate::wire::{host_quadlet_at, put_host_quadlet, WireQuadlet};

/// Largest AT header (4 quadlets).
pub const AT_HEADER_MAX: usize = 16;

/// Retry code "retry-X", the default for fresh requests.
const RETRY_X: u32 = 0b01;

const TLABEL_SHIFT: u32 = 10;
const RETRY_SHIFT: u32 = 8;
const TCODE_SHIFT: u32 = 4;
const SPEED_SHIFT: u32 = 16;
const SPEED_MASK: u32 = 0x7 << SPEED_SHIFT;

/// Per-submission bus state the builder stamps into every header.
#[derive(Clone, Copy, Debug)]
pub struct PacketContext {
	/// Full 16-bit local node id (`bus[15:10] | node[5:0]`); must be valid.
	pub source_node_id: u16,
	pub generation: Generation,
	/// Speed used when the caller does not override it.
	pub speed: FwSpeed,
}

fn validate_context(ctx: &PacketContext, operation: &'static str) -> Result<(), EngineError> {
	if ctx.source_node_id == 0 {
		warn!("packet builder: {operation} without a valid source node id");
		return Err(EngineError::MalformedPacket("source node id not set"));
	}
	if ctx.generation == Generation::UNKNOWN {
		debug!("packet builder: {operation} while the bus generation is unknown");
	}
	Ok(())
}

/// Destination id seen on the wire: the local bus number combined with the
/// target node number.
fn destination_id(ctx: &PacketContext, dest: NodeId) -> u16 {
	let bus = (ctx.source_node_id >> 6) & 0x03FF;
	(bus << 6) | u16::from(dest.get())
}

fn quadlet0(tcode: TCode, label: u8, speed: FwSpeed) -> u32 {
	(u32::from(u8::from(speed)) << SPEED_SHIFT)
		| (u32::from(label & 0x3F) << TLABEL_SHIFT)
		| (RETRY_X << RETRY_SHIFT)
		| (u32::from(u8::from(tcode)) << TCODE_SHIFT)
}

fn put_request_head(
	out: &mut [u8; AT_HEADER_MAX],
	tcode: TCode,
	label: u8,
	speed: FwSpeed,
	ctx: &PacketContext,
	dest: NodeId,
	addr: FwAddress,
) {
	put_host_quadlet(out, 0, quadlet0(tcode, label, speed));
	put_host_quadlet(
		out,
		4,
		(u32::from(destination_id(ctx, dest)) << 16) | u32::from(addr.hi),
	);
	put_host_quadlet(out, 8, addr.lo);
}

/// Builds a read-quadlet request. 3 quadlets; no data.
pub fn build_read_quadlet(
	dest: NodeId,
	addr: FwAddress,
	label: u8,
	speed: FwSpeed,
	ctx: &PacketContext,
	out: &mut [u8; AT_HEADER_MAX],
) -> Result<usize, EngineError> {
	validate_context(ctx, "read-quadlet")?;
	*out = [0; AT_HEADER_MAX];
	put_request_head(out, TCode::ReadQuadletRequest, label, speed, ctx, dest, addr);
	Ok(12)
}

/// Builds a read-block request. Quadlet 3 carries the requested length.
pub fn build_read_block(
	dest: NodeId,
	addr: FwAddress,
	length: u32,
	label: u8,
	speed: FwSpeed,
	ctx: &PacketContext,
	out: &mut [u8; AT_HEADER_MAX],
) -> Result<usize, EngineError> {
	if length == 0 || length > 0xFFFF {
		return Err(EngineError::MalformedPacket("read length out of range"));
	}
	validate_context(ctx, "read-block")?;
	*out = [0; AT_HEADER_MAX];
	put_request_head(out, TCode::ReadBlockRequest, label, speed, ctx, dest, addr);
	put_host_quadlet(out, 12, length << 16);
	Ok(16)
}

/// Builds a write-quadlet request; the four payload bytes are embedded in
/// quadlet 3 exactly as given (they are wire bytes, not a host value).
pub fn build_write_quadlet(
	dest: NodeId,
	addr: FwAddress,
	data: &[u8; 4],
	label: u8,
	speed: FwSpeed,
	ctx: &PacketContext,
	out: &mut [u8; AT_HEADER_MAX],
) -> Result<usize, EngineError> {
	validate_context(ctx, "write-quadlet")?;
	*out = [0; AT_HEADER_MAX];
	put_request_head(out, TCode::WriteQuadletRequest, label, speed, ctx, dest, addr);
	out[12..16].copy_from_slice(data);
	Ok(16)
}

/// Builds a write-block request header; the payload itself travels through a
/// separate data descriptor.
pub fn build_write_block(
	dest: NodeId,
	addr: FwAddress,
	length: u32,
	label: u8,
	speed: FwSpeed,
	ctx: &PacketContext,
	out: &mut [u8; AT_HEADER_MAX],
) -> Result<usize, EngineError> {
	if length == 0 || length > 0xFFFF {
		return Err(EngineError::MalformedPacket("write length out of range"));
	}
	validate_context(ctx, "write-block")?;
	*out = [0; AT_HEADER_MAX];
	put_request_head(out, TCode::WriteBlockRequest, label, speed, ctx, dest, addr);
	put_host_quadlet(out, 12, length << 16);
	Ok(16)
}

/// Builds a lock request header. Quadlet 3 carries the operand length and the
/// extended tCode selecting the lock function.
pub fn build_lock(
	dest: NodeId,
	addr: FwAddress,
	operand_length: u32,
	extended_tcode: u16,
	label: u8,
	speed: FwSpeed,
	ctx: &PacketContext,
	out: &mut [u8; AT_HEADER_MAX],
) -> Result<usize, EngineError> {
	if operand_length == 0 || operand_length > 0xFFFF {
		return Err(EngineError::MalformedPacket("lock operand length out of range"));
	}
	validate_context(ctx, "lock")?;
	*out = [0; AT_HEADER_MAX];
	put_request_head(out, TCode::LockRequest, label, speed, ctx, dest, addr);
	put_host_quadlet(out, 12, (operand_length << 16) | u32::from(extended_tcode));
	Ok(16)
}

/// Builds a write-response header addressed back at a requester.
///
/// `requester_id` is the 16-bit source id taken from the inbound request;
/// quadlet 1 carries it along with the rCode in bits [15:12].
pub fn build_write_response(
	requester_id: u16,
	label: u8,
	rcode: RCode,
	speed: FwSpeed,
	ctx: &PacketContext,
	out: &mut [u8; AT_HEADER_MAX],
) -> Result<usize, EngineError> {
	validate_context(ctx, "write-response")?;
	*out = [0; AT_HEADER_MAX];
	put_host_quadlet(out, 0, quadlet0(TCode::WriteResponse, label, speed));
	put_host_quadlet(
		out,
		4,
		(u32::from(requester_id) << 16) | (u32::from(u8::from(rcode)) << 12),
	);
	Ok(12)
}

/// Builds a PHY packet: a big-endian control quadlet (tCode 0xE) followed by
/// the PHY quadlet and its ones' complement (OHCI figure 7-14).
pub fn build_phy_packet(quadlet: u32, out: &mut [u8; AT_HEADER_MAX]) -> usize {
	*out = [0; AT_HEADER_MAX];
	let control = WireQuadlet::new(u32::from(u8::from(TCode::PhyPacket)) << 4);
	out[0..4].copy_from_slice(&control.to_bytes());
	put_host_quadlet(out, 4, quadlet);
	put_host_quadlet(out, 8, !quadlet);
	12
}

/// Extracts the tLabel from a built header (quadlet 0 bits [15:10]).
pub fn tlabel_of(header: &[u8]) -> Option<u8> {
	host_quadlet_at(header, 0).map(|q0| ((q0 >> TLABEL_SHIFT) & 0x3F) as u8)
}

/// Extracts the tCode from a built header (quadlet 0 bits [7:4]).
pub fn tcode_of(header: &[u8]) -> Option<u8> {
	host_quadlet_at(header, 0).map(|q0| ((q0 >> TCODE_SHIFT) & 0xF) as u8)
}

/// Extracts the speed code from a built header (quadlet 0 bits [18:16]).
pub fn speed_of(header: &[u8]) -> Option<u8> {
	host_quadlet_at(header, 0).map(|q0| ((q0 >> SPEED_SHIFT) & 0x7) as u8)
}

/// Extracts the destination id from a built request header (quadlet 1
/// bits [31:16]).
pub fn destination_of(header: &[u8]) -> Option<u16> {
	host_quadlet_at(header, 4).map(|q1| (q1 >> 16) as u16)
}

/// Rewrites the speed field of an already-built header, used when a retry
/// falls back to a slower speed.
pub fn set_speed(header: &mut [u8], speed: FwSpeed) {
	if let Some(q0) = host_quadlet_at(header, 0) {
		let patched = (q0 & !SPEED_MASK) | (u32::from(u8::from(speed)) << SPEED_SHIFT);
		put_host_quadlet(header, 0, patched);
	}
}
