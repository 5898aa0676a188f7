//! Outbound payload buffers.
//!
//! Block writes and locks carry their payload in a dedicated DMA buffer that
//! the controller reads while the packet is in flight. The buffer is copied
//! from caller memory at submit time, owned by the transaction's slot, and
//! released only after the terminal callback has run. Quadlet writes embed
//! their data in the immediate header and reads receive into the AR stream,
//! so neither allocates here.

use alloc::sync::Arc;
use core::ptr;

use crate::error::EngineError;
use crate::hw::{DmaDirection, DmaRegion, HardwareInterface};

pub struct PayloadBuffer {
	hw: Arc<dyn HardwareInterface>,
	region: DmaRegion,
	len: usize,
}

// Exclusively owned; the host pointer is never aliased after `create`.
unsafe impl Send for PayloadBuffer {}
unsafe impl Sync for PayloadBuffer {}

impl PayloadBuffer {
	/// Allocates a device-readable buffer and copies `data` into it.
	pub fn create(hw: &Arc<dyn HardwareInterface>, data: &[u8]) -> Result<Self, EngineError> {
		let region = hw
			.alloc_dma(data.len(), DmaDirection::ToDevice)
			.ok_or(EngineError::DmaAllocFailed(data.len()))?;

		// OHCI data addresses are 32 bit.
		let end = region.device_addr + data.len() as u64;
		if end > u64::from(u32::MAX) + 1 {
			hw.release_dma(region.handle);
			return Err(EngineError::AddressRange(region.device_addr));
		}

		unsafe {
			ptr::copy_nonoverlapping(data.as_ptr(), region.host, data.len());
		}

		Ok(PayloadBuffer {
			hw: Arc::clone(hw),
			region,
			len: data.len(),
		})
	}

	/// Device-visible address for the descriptor's `dataAddress` field.
	pub fn device_address(&self) -> u32 {
		self.region.device_addr as u32
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl Drop for PayloadBuffer {
	fn drop(&mut self) {
		self.hw.release_dma(self.region.handle);
	}
}
