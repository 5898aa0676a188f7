//! Engine-level errors.
//!
//! These surface on the synchronous paths only (construction and submission).
//! Per-transaction failures travel through the completion callback as a
//! [`crate::defs::TransactionStatus`] instead.

use thiserror::Error;

#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum EngineError {
	#[error("descriptor ring is full")]
	RingFull,
	#[error("all 64 transaction labels are in flight")]
	LabelsExhausted,
	#[error("outstanding transaction table is full")]
	TableFull,
	#[error("DMA allocation of {0} bytes failed")]
	DmaAllocFailed(usize),
	#[error("DMA memory is not 16-byte aligned")]
	MisalignedDma,
	#[error("device address {0:#x} does not fit the 32-bit OHCI address range")]
	AddressRange(u64),
	#[error("packet rejected: {0}")]
	MalformedPacket(&'static str),
	#[error("submitted generation is stale")]
	StaleGeneration,
	#[error("invalid configuration: {0}")]
	InvalidConfig(&'static str),
}
