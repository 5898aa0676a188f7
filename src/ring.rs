//! Fixed-capacity circular slab of OHCI descriptors.
//!
//! The ring owns a DMA allocation holding `capacity` 16-byte descriptors.
//! `head` (oldest in-flight) and `tail` (next to write) are atomics so the
//! IRQ consumer and diagnostic scanners can read them lock free; all writer
//! calls (`set_*`, descriptor stores) require external serialization by the
//! owning context. One slot stays reserved so `head == tail` unambiguously
//! means empty.

use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::descriptor::{OhciDescriptor, DESCRIPTOR_SIZE};
use crate::error::EngineError;
use crate::hw::{DmaDirection, DmaRegion, HardwareInterface};

pub struct DescriptorRing {
	hw: Arc<dyn HardwareInterface>,
	region: DmaRegion,
	capacity: usize,
	head: AtomicUsize,
	tail: AtomicUsize,
	/// Block count (2 or 3) of the previously submitted chain's terminal
	/// descriptor; 0 while nothing has been submitted.
	prev_last_blocks: AtomicU8,
}

// The raw DMA pointer is owned exclusively by this ring and all mutation is
// serialized by the owning context's lock.
unsafe impl Send for DescriptorRing {}
unsafe impl Sync for DescriptorRing {}

impl DescriptorRing {
	/// Allocates and zeroes a ring of `capacity` descriptors.
	pub fn new(hw: Arc<dyn HardwareInterface>, capacity: usize) -> Result<Self, EngineError> {
		let len = capacity * DESCRIPTOR_SIZE;
		let region = hw
			.alloc_dma(len, DmaDirection::Bidirectional)
			.ok_or(EngineError::DmaAllocFailed(len))?;

		if (region.host as usize) & 0xF != 0 || region.device_addr & 0xF != 0 {
			hw.release_dma(region.handle);
			return Err(EngineError::MisalignedDma);
		}
		let end = region.device_addr + len as u64;
		if end > u64::from(u32::MAX) + 1 {
			hw.release_dma(region.handle);
			return Err(EngineError::AddressRange(region.device_addr));
		}

		unsafe {
			ptr::write_bytes(region.host, 0, len);
		}

		Ok(DescriptorRing {
			hw,
			region,
			capacity,
			head: AtomicUsize::new(0),
			tail: AtomicUsize::new(0),
			prev_last_blocks: AtomicU8::new(0),
		})
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn head(&self) -> usize {
		self.head.load(Ordering::Acquire)
	}

	pub fn tail(&self) -> usize {
		self.tail.load(Ordering::Acquire)
	}

	pub fn prev_last_blocks(&self) -> u8 {
		self.prev_last_blocks.load(Ordering::Acquire)
	}

	/// Writer call; requires the context lock.
	pub fn set_head(&self, head: usize) {
		debug_assert!(head < self.capacity);
		self.head.store(head, Ordering::Release);
	}

	/// Writer call; requires the context lock.
	pub fn set_tail(&self, tail: usize) {
		debug_assert!(tail < self.capacity);
		self.tail.store(tail, Ordering::Release);
	}

	/// Writer call; requires the context lock.
	pub fn set_prev_last_blocks(&self, blocks: u8) {
		self.prev_last_blocks.store(blocks, Ordering::Release);
	}

	pub fn is_empty(&self) -> bool {
		self.head() == self.tail()
	}

	pub fn is_full(&self) -> bool {
		(self.tail() + 1) % self.capacity == self.head()
	}

	/// Number of in-flight descriptor slots. May be stale by the time the
	/// caller looks at it.
	pub fn count(&self) -> usize {
		(self.capacity + self.tail() - self.head()) % self.capacity
	}

	/// Free slots, with the full/empty sentinel slot already subtracted.
	pub fn available(&self) -> usize {
		self.capacity - 1 - self.count()
	}

	/// Device-visible address of the descriptor at `index`.
	pub fn device_address(&self, index: usize) -> u32 {
		debug_assert!(index < self.capacity);
		(self.region.device_addr + (index * DESCRIPTOR_SIZE) as u64) as u32
	}

	pub fn device_base(&self) -> u64 {
		self.region.device_addr
	}

	fn slot_ptr(&self, index: usize) -> *mut OhciDescriptor {
		debug_assert!(index < self.capacity);
		unsafe { self.region.host.add(index * DESCRIPTOR_SIZE) as *mut OhciDescriptor }
	}

	/// Volatile read of the descriptor at `index`. The status word may be
	/// written by the controller at any time.
	pub fn read_descriptor(&self, index: usize) -> OhciDescriptor {
		unsafe { ptr::read_volatile(self.slot_ptr(index)) }
	}

	/// Volatile store of a whole descriptor. Writer call.
	pub fn write_descriptor(&self, index: usize, desc: OhciDescriptor) {
		unsafe { ptr::write_volatile(self.slot_ptr(index), desc) }
	}

	/// Stores the 16 inline header bytes of an immediate descriptor into the
	/// slot *after* `index`. Writer call.
	pub fn write_immediate_header(&self, index: usize, header: &[u8]) {
		debug_assert!(header.len() <= DESCRIPTOR_SIZE);
		debug_assert!(index + 1 < self.capacity);
		let mut padded = [0u8; DESCRIPTOR_SIZE];
		padded[..header.len()].copy_from_slice(header);
		unsafe {
			ptr::write_volatile(self.slot_ptr(index + 1) as *mut [u8; DESCRIPTOR_SIZE], padded);
		}
	}

	/// Reads back the inline header bytes stored after `index`.
	pub fn read_immediate_header(&self, index: usize) -> [u8; DESCRIPTOR_SIZE] {
		debug_assert!(index + 1 < self.capacity);
		unsafe { ptr::read_volatile(self.slot_ptr(index + 1) as *const [u8; DESCRIPTOR_SIZE]) }
	}

	/// The OHCI CommandPtr word for the descriptor at `index` with block
	/// count `z`: `address[31:4] | Z[3:0]`. Returns 0 when the address would
	/// violate the 32-bit/16-byte-aligned contract.
	pub fn command_ptr(&self, index: usize, z: u8) -> u32 {
		crate::descriptor::make_branch_word_at(
			self.region.device_addr + (index * DESCRIPTOR_SIZE) as u64,
			z,
		)
	}

	/// Locates the previous chain's terminal descriptor given the tail at
	/// which the next submission occurs.
	///
	/// The previous chain occupies `[(tail - prev_blocks) mod cap, tail)`.
	/// Two-block chains terminate in their immediate descriptor (the header
	/// block); three-block chains in the trailing standard descriptor. If a
	/// two-block window does not start with an immediate descriptor, rewind
	/// one slot to reach the header.
	pub fn locate_previous_last(&self, tail: usize) -> Option<(usize, u8)> {
		let prev_blocks = self.prev_last_blocks();
		if prev_blocks == 0 {
			// Nothing submitted yet: the caller arms via CommandPtr instead.
			return None;
		}
		if prev_blocks != 2 && prev_blocks != 3 {
			return None;
		}

		let cap = self.capacity;
		let prev_start = (tail + cap - prev_blocks as usize) % cap;
		let offset = if prev_blocks == 2 { 0 } else { prev_blocks as usize - 1 };
		let mut index = (prev_start + offset) % cap;

		if prev_blocks == 2 && !self.read_descriptor(index).is_immediate() {
			let header = (index + cap - 1) % cap;
			if !self.read_descriptor(header).is_immediate() {
				return None;
			}
			index = header;
		}

		Some((index, prev_blocks))
	}
}

impl Drop for DescriptorRing {
	fn drop(&mut self) {
		self.hw.release_dma(self.region.handle);
	}
}
