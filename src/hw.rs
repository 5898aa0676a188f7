//! Contracts towards the bus-attach layer.
//!
//! The engine never maps MMIO or programs an IOMMU itself. The embedding
//! driver hands it a [`HardwareInterface`] for register access and DMA
//! allocation, a [`BusInfo`] view of the current topology, and a [`Timebase`]
//! for deadlines. All three are object-safe so the bus-attach layer can hand
//! out trait objects.

use crate::defs::{FwSpeed, Generation, NodeId};

/// Direction of a DMA allocation, from the device's point of view.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DmaDirection {
	/// The device reads (descriptor chains, outbound payloads).
	ToDevice,
	/// The device writes (AR receive buffers).
	FromDevice,
	/// Both (descriptor rings: fetched and status-written).
	Bidirectional,
}

/// Opaque token identifying a DMA allocation towards [`HardwareInterface::release_dma`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DmaHandle(pub u64);

/// A DMA allocation with its paired host and device views.
///
/// `host` stays valid and the mapping stays programmed until the region is
/// released. OHCI consumes 32-bit device addresses only; allocations used for
/// descriptors or payloads must fit below 4 GiB and the engine re-checks this.
#[derive(Clone, Copy, Debug)]
pub struct DmaRegion {
	pub handle: DmaHandle,
	/// CPU-visible base address of the allocation.
	pub host: *mut u8,
	pub len: usize,
	/// Device-visible (IOVA) base address.
	pub device_addr: u64,
}

/// MMIO and DMA services of the host controller.
pub trait HardwareInterface: Send + Sync {
	/// Reads an OHCI register at `offset` bytes from the register base.
	fn read_register(&self, offset: u32) -> u32;

	/// Writes an OHCI register at `offset` bytes from the register base.
	fn write_register(&self, offset: u32, value: u32);

	/// Allocates DMA-capable memory. Descriptor allocations must be 16-byte
	/// aligned in both address spaces.
	fn alloc_dma(&self, len: usize, direction: DmaDirection) -> Option<DmaRegion>;

	/// Releases an allocation returned by [`HardwareInterface::alloc_dma`].
	fn release_dma(&self, handle: DmaHandle);
}

/// Read-only topology view maintained by the self-ID/topology layer.
pub trait BusInfo: Send + Sync {
	/// Best usable speed between the local node and `node`.
	fn speed_to(&self, node: NodeId) -> FwSpeed;

	/// Tree distance between two nodes; `u32::MAX` if unknown.
	fn hop_count(&self, a: NodeId, b: NodeId) -> u32;

	/// Current bus generation.
	fn generation(&self) -> Generation;

	/// The full 16-bit local node id (`bus[15:10] | node[5:0]`), as read from
	/// the NodeID register. Zero while the id is not yet valid.
	fn local_node_id(&self) -> u16;
}

/// Monotonic time source for deadlines and the timer wheel.
pub trait Timebase: Send + Sync {
	fn monotonic_ns(&self) -> u64;
}
