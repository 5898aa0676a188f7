//! Asynchronous receive: stream parsing, routing and buffer recycling.
//!
//! The AR DMA contexts deposit packets back to back into receive buffers.
//! Each packet is a header (8..16 bytes depending on tCode), an optional
//! quadlet-aligned payload, and a 4-byte trailer `xferStatus[31:16] |
//! timeStamp[15:0]`. Every quadlet is stored little-endian in memory
//! (OHCI 1.1 section 8.4.2); [`crate::wire::ArQuadlet`] does the conversion
//! and all field extraction happens on host-order values, mirroring the
//! positions the transmit side encodes at.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use hermit_sync::SpinMutex;

use crate::config::TRACE;
use crate::defs::{RCode, TCode};
use crate::descriptor::{
	build_control, make_branch_word_ar, OhciDescriptor, BRANCH_ALWAYS, CMD_INPUT_MORE,
	INT_ALWAYS, KEY_STANDARD,
};
use crate::error::EngineError;
use crate::hw::{DmaDirection, DmaRegion, HardwareInterface};
use crate::regs::{ContextControl, COMMAND_PTR, CONTEXT_CONTROL_CLEAR, CONTEXT_CONTROL_SET};
use crate::ring::DescriptorRing;
use crate::wire::ar_quadlet_at;

/// Parsed shape of one packet inside an AR buffer.
#[derive(Clone, Copy, Debug)]
pub struct ArPacketInfo {
	/// Byte offset of the packet inside the buffer.
	pub offset: usize,
	pub header_length: usize,
	pub data_length: usize,
	/// Header + padded payload + trailer (when present).
	pub total_length: usize,
	pub tcode: TCode,
	/// Response code for response tCodes.
	pub rcode: Option<u8>,
	pub xfer_status: u16,
	pub time_stamp: u16,
}

/// Zero-copy view of one routed packet.
pub struct ArPacketView<'a> {
	pub header: &'a [u8],
	pub payload: &'a [u8],
	pub tcode: TCode,
	pub source_id: u16,
	pub dest_id: u16,
	pub tlabel: u8,
	pub rcode: Option<u8>,
	pub xfer_status: u16,
	pub time_stamp: u16,
}

impl ArPacketView<'_> {
	/// Source node number (low 6 bits of the source id).
	pub fn source_node(&self) -> u8 {
		(self.source_id & 0x3F) as u8
	}
}

/// Payload length for `tcode`, taken from the packet header.
///
/// Block forms carry it in quadlet 3 bits [31:16]; async streams in quadlet 1
/// bits [31:16]. Everything else has no separate payload (quadlet data counts
/// as header).
fn data_length(buffer: &[u8], offset: usize, tcode: TCode) -> usize {
	match tcode {
		TCode::WriteBlockRequest | TCode::ReadBlockResponse | TCode::LockRequest
		| TCode::LockResponse => ar_quadlet_at(buffer, offset + 12)
			.map(|q3| (q3 >> 16) as usize)
			.unwrap_or(0),
		TCode::AsyncStream => ar_quadlet_at(buffer, offset + 4)
			.map(|q1| (q1 >> 16) as usize)
			.unwrap_or(0),
		_ => 0,
	}
}

/// Extracts the next packet from an AR buffer, or `None` when the buffer is
/// exhausted, truncated mid-packet, or contains garbage.
///
/// The trailer is optional at the very end of a buffer; its absence is not an
/// error. An all-zero header with a zero/absent trailer is treated as unused
/// buffer space.
pub fn parse_next(buffer: &[u8], offset: usize) -> Option<ArPacketInfo> {
	if buffer.len() < 8 || offset + 8 > buffer.len() {
		return None;
	}

	let q0 = ar_quadlet_at(buffer, offset)?;
	let q1 = ar_quadlet_at(buffer, offset + 4)?;

	if TRACE.hex_dump() {
		hex_dump(&buffer[offset..buffer.len().min(offset + 32)], offset);
	}

	let tcode_raw = ((q0 >> 4) & 0xF) as u8;
	let Ok(tcode) = TCode::try_from(tcode_raw) else {
		debug!("AR parser: unknown tCode {tcode_raw:#x} at offset {offset}, dropping buffer");
		return None;
	};

	let header_length = tcode.ar_header_length();
	if offset + header_length > buffer.len() {
		return None;
	}

	let data_len = data_length(buffer, offset, tcode);
	let aligned = (header_length + data_len + 3) & !3usize;
	if offset + aligned > buffer.len() {
		return None;
	}

	let have_trailer = offset + aligned + 4 <= buffer.len();
	let (xfer_status, time_stamp) = if have_trailer {
		let trailer = ar_quadlet_at(buffer, offset + aligned)?;
		((trailer >> 16) as u16, (trailer & 0xFFFF) as u16)
	} else {
		(0, 0)
	};

	let rcode = if tcode.is_response() {
		Some(((q1 >> 12) & 0xF) as u8)
	} else {
		None
	};

	// Guard against unused (zeroed) buffer space.
	if q0 == 0 && q1 == 0 && (!have_trailer || (xfer_status == 0 && time_stamp == 0)) {
		return None;
	}

	Some(ArPacketInfo {
		offset,
		header_length,
		data_length: data_len,
		total_length: aligned + if have_trailer { 4 } else { 0 },
		tcode,
		rcode,
		xfer_status,
		time_stamp,
	})
}

fn hex_dump(bytes: &[u8], offset: usize) {
	for (i, chunk) in bytes.chunks(16).enumerate() {
		let mut line = alloc::string::String::new();
		for b in chunk {
			use core::fmt::Write;
			let _ = write!(line, "{b:02X} ");
		}
		trace!("AR rx +{:#x}: {}", offset + i * 16, line);
	}
}

/// Whether a packet came in on the AR Request or AR Response context.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArContextKind {
	Request,
	Response,
}

/// Handler for inbound requests. Returning `Some(rcode)` asks the engine to
/// transmit a matching write response; `None` suppresses it.
pub type RequestHandler = Box<dyn Fn(&ArPacketView<'_>) -> Option<RCode> + Send + Sync>;

/// Handler for inbound responses.
pub type ResponseHandler = Box<dyn Fn(&ArPacketView<'_>) + Send + Sync>;

/// tCode-indexed dispatch tables for the two AR streams.
///
/// Handlers run synchronously on the caller's (IRQ) context and must not
/// block.
pub struct PacketRouter {
	request: [Option<RequestHandler>; 16],
	response: [Option<ResponseHandler>; 16],
}

impl PacketRouter {
	pub fn new() -> Self {
		PacketRouter {
			request: core::array::from_fn(|_| None),
			response: core::array::from_fn(|_| None),
		}
	}

	/// Installs (or replaces) the request handler for `tcode`.
	pub fn register_request_handler(&mut self, tcode: u8, handler: RequestHandler) {
		self.request[usize::from(tcode & 0xF)] = Some(handler);
	}

	/// Installs (or replaces) the response handler for `tcode`.
	pub fn register_response_handler(&mut self, tcode: u8, handler: ResponseHandler) {
		self.response[usize::from(tcode & 0xF)] = Some(handler);
	}

	pub fn clear_handlers(&mut self) {
		self.request = core::array::from_fn(|_| None);
		self.response = core::array::from_fn(|_| None);
	}

	/// Walks a packet stream and dispatches every packet to its handler.
	///
	/// `respond` is invoked for each request whose handler asked for a write
	/// response. Returns the number of packets dispatched.
	pub fn route(
		&self,
		kind: ArContextKind,
		buffer: &[u8],
		respond: &mut dyn FnMut(&ArPacketView<'_>, RCode),
	) -> usize {
		let mut offset = 0;
		let mut routed = 0;

		while let Some(info) = parse_next(buffer, offset) {
			let q0 = ar_quadlet_at(buffer, info.offset).unwrap_or(0);
			let q1 = ar_quadlet_at(buffer, info.offset + 4).unwrap_or(0);
			let header = &buffer[info.offset..info.offset + info.header_length];
			let payload_start = info.offset + info.header_length;
			let payload = &buffer[payload_start..payload_start + info.data_length];

			let view = ArPacketView {
				header,
				payload,
				tcode: info.tcode,
				source_id: (q1 >> 16) as u16,
				dest_id: (q0 >> 16) as u16,
				tlabel: ((q0 >> 10) & 0x3F) as u8,
				rcode: info.rcode,
				xfer_status: info.xfer_status,
				time_stamp: info.time_stamp,
			};

			let index = usize::from(u8::from(info.tcode));
			match kind {
				ArContextKind::Request => match &self.request[index] {
					Some(handler) => {
						if let Some(rcode) = handler(&view) {
							respond(&view, rcode);
						}
						routed += 1;
					}
					None => {
						debug!(
							"AR request: no handler for tCode {:#x} from {:#06x}",
							u8::from(info.tcode),
							view.source_id
						);
					}
				},
				ArContextKind::Response => match &self.response[index] {
					Some(handler) => {
						handler(&view);
						routed += 1;
					}
					None => {
						debug!(
							"AR response: no handler for tCode {:#x} from {:#06x}",
							u8::from(info.tcode),
							view.source_id
						);
					}
				},
			}

			if info.total_length == 0 {
				break;
			}
			offset = info.offset + info.total_length;
		}

		routed
	}
}

impl Default for PacketRouter {
	fn default() -> Self {
		Self::new()
	}
}

struct ArBuffers {
	regions: Vec<DmaRegion>,
	next: usize,
}

/// One OHCI AR DMA context: a ring of INPUT_MORE descriptors, each pointing
/// at one receive buffer. Buffers are handed to the router once the
/// controller retires their descriptor and are recycled immediately after.
pub struct ArContext {
	name: &'static str,
	reg_base: u32,
	hw: Arc<dyn HardwareInterface>,
	ring: DescriptorRing,
	buffer_len: usize,
	buffers: SpinMutex<ArBuffers>,
}

// Buffer pointers are exclusively owned and only touched under the lock.
unsafe impl Send for ArContext {}
unsafe impl Sync for ArContext {}

impl ArContext {
	pub fn new(
		name: &'static str,
		reg_base: u32,
		hw: Arc<dyn HardwareInterface>,
		buffer_count: usize,
		buffer_len: usize,
	) -> Result<Self, EngineError> {
		let ring = DescriptorRing::new(Arc::clone(&hw), buffer_count)?;

		let mut regions = Vec::with_capacity(buffer_count);
		for _ in 0..buffer_count {
			match hw.alloc_dma(buffer_len, DmaDirection::FromDevice) {
				Some(region) if region.device_addr + (buffer_len as u64) <= u64::from(u32::MAX) + 1 => {
					regions.push(region)
				}
				Some(region) => {
					hw.release_dma(region.handle);
					for r in &regions {
						hw.release_dma(r.handle);
					}
					return Err(EngineError::AddressRange(region.device_addr));
				}
				None => {
					for r in &regions {
						hw.release_dma(r.handle);
					}
					return Err(EngineError::DmaAllocFailed(buffer_len));
				}
			}
		}

		let ctx = ArContext {
			name,
			reg_base,
			hw,
			ring,
			buffer_len,
			buffers: SpinMutex::new(ArBuffers { regions, next: 0 }),
		};
		ctx.program_descriptors();
		Ok(ctx)
	}

	fn program_descriptors(&self) {
		let buffers = self.buffers.lock();
		let count = buffers.regions.len();
		for (i, region) in buffers.regions.iter().enumerate() {
			let next = (i + 1) % count;
			self.ring.write_descriptor(
				i,
				OhciDescriptor {
					control: build_control(
						self.buffer_len as u16,
						CMD_INPUT_MORE,
						KEY_STANDARD,
						INT_ALWAYS,
						BRANCH_ALWAYS,
						false,
					),
					data_address: region.device_addr as u32,
					// Circular: software must recycle ahead of the fill level.
					branch_word: make_branch_word_ar(
						u64::from(self.ring.device_address(next)),
						true,
					),
					status_word: self.buffer_len as u32 & 0xFFFF,
				},
			);
		}
	}

	/// Programs CommandPtr at the first descriptor and starts the context.
	pub fn start(&self) {
		fence(Ordering::SeqCst);
		let command_ptr = (self.ring.device_address(0) & 0xFFFF_FFF0) | 1;
		self.hw.write_register(self.reg_base + COMMAND_PTR, command_ptr);
		self.hw.write_register(
			self.reg_base + CONTEXT_CONTROL_SET,
			ContextControl::RUN.bits(),
		);
		debug!("{}: started, CommandPtr={command_ptr:#010x}", self.name);
	}

	pub fn stop(&self) {
		self.hw.write_register(
			self.reg_base + CONTEXT_CONTROL_CLEAR,
			ContextControl::RUN.bits(),
		);
	}

	/// Drains retired receive buffers, handing each filled byte range to
	/// `deliver`, then recycles the buffer for the controller.
	pub fn process(&self, deliver: &mut dyn FnMut(&[u8])) {
		let mut buffers = self.buffers.lock();
		fence(Ordering::SeqCst);

		loop {
			let index = buffers.next;
			let desc = self.ring.read_descriptor(index);
			if desc.xfer_status() == 0 {
				break;
			}
			let filled = self.buffer_len - usize::from(desc.res_count()).min(self.buffer_len);
			if filled > 0 {
				let region = &buffers.regions[index];
				let bytes = unsafe { core::slice::from_raw_parts(region.host, filled) };
				if TRACE.rx_verbosity() >= 3 {
					trace!("{}: buffer {index} delivered {filled} bytes", self.name);
				}
				deliver(bytes);
			}

			// Recycle: full residual count, status cleared.
			let mut recycled = desc;
			recycled.status_word = self.buffer_len as u32 & 0xFFFF;
			self.ring.write_descriptor(index, recycled);
			fence(Ordering::SeqCst);

			buffers.next = (index + 1) % buffers.regions.len();
		}
	}

	pub fn buffer_count(&self) -> usize {
		self.buffers.lock().regions.len()
	}

	pub fn buffer_len(&self) -> usize {
		self.buffer_len
	}

	pub fn ring(&self) -> &DescriptorRing {
		&self.ring
	}

	pub fn buffer_device_base(&self) -> u64 {
		let buffers = self.buffers.lock();
		buffers.regions.first().map(|r| r.device_addr).unwrap_or(0)
	}
}

impl Drop for ArContext {
	fn drop(&mut self) {
		let buffers = self.buffers.lock();
		for region in &buffers.regions {
			self.hw.release_dma(region.handle);
		}
	}
}
