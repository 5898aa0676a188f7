//! Read-only diagnostics snapshots for higher layers.

/// State of one DMA context's descriptor ring.
#[derive(Clone, Copy, Default, Debug)]
pub struct ContextSnapshot {
	/// Device-visible base address of the descriptor slab.
	pub descriptor_device_base: u64,
	pub descriptor_count: u32,
	/// Bytes per descriptor slot.
	pub descriptor_stride: u32,
	pub head: u32,
	pub tail: u32,
	pub prev_last_blocks: u8,
	/// Last CommandPtr value written while arming (AT contexts).
	pub command_ptr: u32,
}

/// State of an AR context's receive buffer pool.
#[derive(Clone, Copy, Default, Debug)]
pub struct BufferPoolSnapshot {
	pub device_base: u64,
	pub buffer_count: u32,
	pub buffer_len: u32,
}

/// Point-in-time status of the whole async engine.
#[derive(Clone, Copy, Default, Debug)]
pub struct AsyncStatusSnapshot {
	pub at_request: ContextSnapshot,
	pub at_response: ContextSnapshot,
	pub ar_request: ContextSnapshot,
	pub ar_response: ContextSnapshot,
	pub ar_request_buffers: BufferPoolSnapshot,
	pub ar_response_buffers: BufferPoolSnapshot,
	pub current_generation: u8,
	pub transactions_in_flight: u32,
	pub labels_in_use: u32,
	pub timers_armed: u32,
}
