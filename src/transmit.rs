//! Asynchronous transmit contexts.
//!
//! One [`AtContext`] drives one OHCI AT DMA context (Request or Response).
//! A submission is a descriptor *chain*: an immediate descriptor carrying the
//! packet header, plus one standard OUTPUT_LAST descriptor when a payload
//! follows. Chains are linked to a running context on the fly:
//!
//! * Path 1 (arm): the ring has nothing in flight, so CommandPtr is written
//!   with the chain's address and Z, then the RUN bit is set.
//! * Path 2 (append): the previous chain's terminal descriptor gets its
//!   branch word patched to the new chain and its branch control set to
//!   "always", then the WAKE bit tells the controller to re-fetch.
//!
//! The descriptor stores are flushed with a fence before CommandPtr/WAKE so
//! the controller never observes a half-written chain.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{fence, Ordering};

use hermit_sync::SpinMutex;

use crate::defs::AsyncHandle;
use crate::descriptor::{
	build_control, make_branch_word_at, OhciDescriptor, BRANCH_ALWAYS, BRANCH_NEVER,
	CMD_OUTPUT_LAST, CMD_OUTPUT_MORE, DESCRIPTOR_SIZE, INT_ALWAYS, INT_NEVER, KEY_IMMEDIATE,
	KEY_STANDARD,
};
use crate::error::EngineError;
use crate::hw::HardwareInterface;
use crate::regs::{ContextControl, COMMAND_PTR, CONTEXT_CONTROL_CLEAR, CONTEXT_CONTROL_SET};
use crate::ring::DescriptorRing;

/// Which AT context a transmission went out on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AtKind {
	Request,
	Response,
}

/// A descriptor chain to transmit.
pub struct ChainSpec<'a> {
	/// Packet header in host byte order, 12 or 16 bytes (4 for raw PHY
	/// quadlets, padded inside the immediate descriptor).
	pub header: &'a [u8],
	/// Optional payload: device address and length.
	pub payload: Option<(u32, u16)>,
}

/// Completion pulled out of a retired chain.
#[derive(Clone, Copy, Debug)]
pub struct AtCompletion {
	pub handle: AsyncHandle,
	/// Event/ack code from the terminal descriptor's `xferStatus`.
	pub event: u8,
	/// Cycle-timer snapshot at completion.
	pub timestamp: u16,
}

struct PendingChain {
	handle: AsyncHandle,
	/// Ring index of the terminal descriptor (hardware writes status here).
	last_index: usize,
	/// Head value once this chain has retired.
	end_index: usize,
}

struct AtState {
	pending: VecDeque<PendingChain>,
	last_command_ptr: u32,
}

pub struct AtContext {
	name: &'static str,
	kind: AtKind,
	reg_base: u32,
	hw: Arc<dyn HardwareInterface>,
	ring: DescriptorRing,
	state: SpinMutex<AtState>,
}

impl AtContext {
	pub fn new(
		name: &'static str,
		kind: AtKind,
		reg_base: u32,
		hw: Arc<dyn HardwareInterface>,
		capacity: usize,
	) -> Result<Self, EngineError> {
		let ring = DescriptorRing::new(Arc::clone(&hw), capacity)?;
		Ok(AtContext {
			name,
			kind,
			reg_base,
			hw,
			ring,
			state: SpinMutex::new(AtState {
				pending: VecDeque::new(),
				last_command_ptr: 0,
			}),
		})
	}

	pub fn kind(&self) -> AtKind {
		self.kind
	}

	pub fn ring(&self) -> &DescriptorRing {
		&self.ring
	}

	/// Submits one chain, arming the context or appending to it.
	pub fn submit(&self, handle: AsyncHandle, spec: &ChainSpec<'_>) -> Result<(), EngineError> {
		debug_assert!(spec.header.len() <= DESCRIPTOR_SIZE);
		let mut state = self.state.lock();

		let z: usize = if spec.payload.is_some() { 3 } else { 2 };
		let cap = self.ring.capacity();
		let tail = self.ring.tail();

		// Chains must be physically contiguous; when the tail would cross the
		// ring end, the chain starts over at slot 0 and the skipped slots
		// stay dead until head passes them.
		let start = if tail + z > cap { 0 } else { tail };
		let needed = if start == tail { z } else { (cap - tail) + z };
		if self.ring.available() < needed {
			debug!("{}: ring full ({} slots needed)", self.name, needed);
			return Err(EngineError::RingFull);
		}

		self.write_chain(start, spec);
		// Descriptor stores must be visible to the controller before the
		// branch patch, CommandPtr or WAKE below.
		fence(Ordering::SeqCst);

		match self.ring.locate_previous_last(tail) {
			None => {
				// Path 1: first chain since the context went idle.
				let command_ptr = self.ring.command_ptr(start, z as u8);
				if command_ptr == 0 {
					return Err(EngineError::AddressRange(u64::from(
						self.ring.device_address(start),
					)));
				}
				self.hw
					.write_register(self.reg_base + COMMAND_PTR, command_ptr);
				self.hw.write_register(
					self.reg_base + CONTEXT_CONTROL_SET,
					ContextControl::RUN.bits(),
				);
				state.last_command_ptr = command_ptr;
				if crate::config::TRACE.tx_verbosity() >= 2 {
					trace!("{}: armed, CommandPtr={command_ptr:#010x}", self.name);
				}
			}
			Some((prev_index, _blocks)) => {
				// Path 2: link behind the previous chain and wake the context.
				let mut prev = self.ring.read_descriptor(prev_index);
				prev.branch_word =
					make_branch_word_at(u64::from(self.ring.device_address(start)), z as u8);
				prev.patch_branch(BRANCH_ALWAYS);
				self.ring.write_descriptor(prev_index, prev);
				fence(Ordering::SeqCst);
				self.hw.write_register(
					self.reg_base + CONTEXT_CONTROL_SET,
					ContextControl::WAKE.bits(),
				);
				if crate::config::TRACE.tx_verbosity() >= 2 {
					trace!("{}: appended chain at slot {start}, wake", self.name);
				}
			}
		}

		let end_index = (start + z) % cap;
		self.ring.set_tail(end_index);
		self.ring.set_prev_last_blocks(z as u8);

		state.pending.push_back(PendingChain {
			handle,
			last_index: if z == 2 { start } else { start + 2 },
			end_index,
		});
		Ok(())
	}

	fn write_chain(&self, start: usize, spec: &ChainSpec<'_>) {
		let req_count = spec.header.len() as u16;
		match spec.payload {
			None => {
				// Single OUTPUT_LAST_Immediate block: descriptor + header.
				self.ring.write_descriptor(
					start,
					OhciDescriptor {
						control: build_control(
							req_count,
							CMD_OUTPUT_LAST,
							KEY_IMMEDIATE,
							INT_ALWAYS,
							BRANCH_NEVER,
							false,
						),
						data_address: 0,
						branch_word: 0,
						status_word: 0,
					},
				);
				self.ring.write_immediate_header(start, spec.header);
			}
			Some((payload_addr, payload_len)) => {
				// OUTPUT_MORE_Immediate header block + OUTPUT_LAST payload.
				self.ring.write_descriptor(
					start,
					OhciDescriptor {
						control: build_control(
							req_count,
							CMD_OUTPUT_MORE,
							KEY_IMMEDIATE,
							INT_NEVER,
							BRANCH_NEVER,
							false,
						),
						data_address: 0,
						branch_word: 0,
						status_word: 0,
					},
				);
				self.ring.write_immediate_header(start, spec.header);
				self.ring.write_descriptor(
					start + 2,
					OhciDescriptor {
						control: build_control(
							payload_len,
							CMD_OUTPUT_LAST,
							KEY_STANDARD,
							INT_ALWAYS,
							BRANCH_NEVER,
							false,
						),
						data_address: payload_addr,
						branch_word: 0,
						status_word: 0,
					},
				);
			}
		}
	}

	/// Collects retired chains in submission order.
	///
	/// A chain has retired once the controller wrote a nonzero `xferStatus`
	/// into its terminal descriptor. Scanning stops at the first chain still
	/// in flight; the ring head advances past everything collected.
	pub fn poll_completions(&self) -> alloc::vec::Vec<AtCompletion> {
		let mut state = self.state.lock();
		let mut completed = vec![];

		// Pair with the controller's status stores.
		fence(Ordering::SeqCst);
		while let Some(front) = state.pending.front() {
			let last = self.ring.read_descriptor(front.last_index);
			if last.xfer_status() == 0 {
				break;
			}
			completed.push(AtCompletion {
				handle: front.handle,
				event: last.at_event(),
				timestamp: last.timestamp(),
			});
			self.ring.set_head(front.end_index);
			state.pending.pop_front();
		}

		completed
	}

	/// Number of chains submitted but not yet retired.
	pub fn in_flight(&self) -> usize {
		self.state.lock().pending.len()
	}

	pub fn last_command_ptr(&self) -> u32 {
		self.state.lock().last_command_ptr
	}

	/// Stops the context (RUN cleared). The ring contents stay untouched.
	pub fn stop(&self) {
		self.hw.write_register(
			self.reg_base + CONTEXT_CONTROL_CLEAR,
			ContextControl::RUN.bits(),
		);
	}
}
