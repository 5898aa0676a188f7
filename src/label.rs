//! Transaction label allocation.
//!
//! IEEE 1394 gives a requester 64 labels; a label identifies at most one
//! in-flight transaction towards a node per generation. The allocator is a
//! single 64-bit bitmap driven by CAS, so it can be shared between submit
//! paths without a lock. A 16-bit generation stamp travels with the pool so
//! consumers can detect allocations that predate a reset.

use core::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};

pub const MAX_LABELS: u8 = 64;

pub struct LabelAllocator {
	bitmap: AtomicU64,
	generation: AtomicU16,
	next_hint: AtomicU8,
}

impl LabelAllocator {
	pub const fn new() -> Self {
		LabelAllocator {
			bitmap: AtomicU64::new(0),
			generation: AtomicU16::new(0),
			next_hint: AtomicU8::new(0),
		}
	}

	/// Claims the lowest free label, or `None` when all 64 are in flight.
	pub fn allocate(&self) -> Option<u8> {
		let mut current = self.bitmap.load(Ordering::Relaxed);
		loop {
			let available = !current;
			if available == 0 {
				return None;
			}
			let index = available.trailing_zeros();
			if index >= u32::from(MAX_LABELS) {
				return None;
			}
			let desired = current | (1u64 << index);
			match self.bitmap.compare_exchange_weak(
				current,
				desired,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return Some(index as u8),
				// The CAS loaded a fresh snapshot into `current`.
				Err(observed) => current = observed,
			}
		}
	}

	pub fn free(&self, label: u8) {
		if label >= MAX_LABELS {
			return;
		}
		self.bitmap.fetch_and(!(1u64 << label), Ordering::Release);
	}

	pub fn is_in_use(&self, label: u8) -> bool {
		if label >= MAX_LABELS {
			return false;
		}
		self.bitmap.load(Ordering::Acquire) & (1u64 << label) != 0
	}

	pub fn in_use_count(&self) -> u32 {
		self.bitmap.load(Ordering::Acquire).count_ones()
	}

	/// Round-robin label hint for callers that cycle labels without tracking
	/// individual ownership (e.g. unified response packets).
	pub fn next_hint(&self) -> u8 {
		self.next_hint.fetch_add(1, Ordering::Relaxed) & 0x3F
	}

	pub fn generation(&self) -> u16 {
		self.generation.load(Ordering::Acquire)
	}

	pub fn set_generation(&self, generation: u16) {
		self.generation.store(generation, Ordering::Release);
	}

	/// Drops all allocations and stamps. Only valid while no transaction is
	/// in flight (bus bring-up and tests).
	pub fn reset(&self) {
		self.bitmap.store(0, Ordering::Relaxed);
		self.generation.store(0, Ordering::Relaxed);
		self.next_hint.store(0, Ordering::Relaxed);
	}
}

impl Default for LabelAllocator {
	fn default() -> Self {
		Self::new()
	}
}
