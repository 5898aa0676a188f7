//! Outstanding transaction tracking.
//!
//! A flat, handle-indexed slot array with one spin lock per bucket of 64
//! slots. The slot state lives in an `AtomicU8` so cancellation can claim a
//! transition with a CAS while the IRQ path holds the bucket lock. A
//! secondary `(node, label)` index matches inbound responses to their
//! originating slot.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use hermit_sync::SpinMutex;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::defs::{AsyncHandle, CompletionCallback, CompletionStrategy, FwSpeed, Generation, TCode};
use crate::error::EngineError;
use crate::packet::AT_HEADER_MAX;
use crate::payload::PayloadBuffer;
use crate::transmit::AtKind;

const BUCKET_SIZE: usize = 64;

/// Life cycle of one transaction slot.
///
/// `Free → Allocated → AtPosted → AtCompleted → AwaitingAr → ArReceived →
/// Completed`, with the terminal branches `TimedOut`, `Aborted`, `Stale` and
/// `Failed`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TxState {
	Free = 0,
	Allocated,
	AtPosted,
	AtCompleted,
	AwaitingAr,
	ArReceived,
	Completed,
	TimedOut,
	Aborted,
	Stale,
	Failed,
}

impl TxState {
	pub const fn is_terminal(self) -> bool {
		matches!(
			self,
			TxState::Completed | TxState::TimedOut | TxState::Aborted | TxState::Stale | TxState::Failed
		)
	}

	pub const fn is_in_flight(self) -> bool {
		matches!(
			self,
			TxState::Allocated
				| TxState::AtPosted
				| TxState::AtCompleted
				| TxState::AwaitingAr
				| TxState::ArReceived
		)
	}
}

/// Immutable facts about a transaction, captured at submit.
#[derive(Clone, Copy, Debug)]
pub struct TxMetadata {
	pub generation: Generation,
	pub source_node_id: u16,
	pub destination_node_id: u16,
	pub tcode: TCode,
	/// Expected response payload length in bytes (0 for writes).
	pub expected_response_len: usize,
	pub strategy: CompletionStrategy,
}

/// Mutable per-transaction state, guarded by the bucket lock.
pub(crate) struct SlotBody {
	pub meta: TxMetadata,
	pub label: u8,
	pub speed: FwSpeed,
	pub submitted_ns: u64,
	pub deadline_ns: u64,
	pub retries_left: u8,
	/// Bumped whenever a timer entry is armed; stale wheel entries are
	/// recognized by a mismatch.
	pub wheel_seq: u32,
	pub header: [u8; AT_HEADER_MAX],
	pub header_len: u8,
	pub payload: Option<PayloadBuffer>,
	pub callback: Option<CompletionCallback>,
	pub context: AtKind,
	/// AT ack recorded while waiting for the response leg.
	pub ack: Option<u8>,
}

struct Slot {
	state: AtomicU8,
	/// Reuse tag; cycles through 1..=15 so a packed handle is never zero.
	tag: u8,
	body: Option<SlotBody>,
}

impl Slot {
	fn new() -> Self {
		Slot {
			state: AtomicU8::new(TxState::Free.into()),
			tag: 1,
			body: None,
		}
	}
}

pub(crate) struct TransactionTable {
	buckets: Box<[SpinMutex<Vec<Slot>>]>,
	slot_count: usize,
	scan_cursor: AtomicUsize,
	in_flight: AtomicUsize,
	label_index: SpinMutex<HashMap<(u8, u8), u16, RandomState>>,
}

pub(crate) fn state_of(state: &AtomicU8) -> TxState {
	TxState::try_from(state.load(Ordering::Acquire)).unwrap_or(TxState::Free)
}

impl TransactionTable {
	pub fn new(slot_count: usize) -> Self {
		let bucket_count = slot_count.div_ceil(BUCKET_SIZE);
		let mut buckets = Vec::with_capacity(bucket_count);
		for bucket in 0..bucket_count {
			let len = BUCKET_SIZE.min(slot_count - bucket * BUCKET_SIZE);
			buckets.push(SpinMutex::new((0..len).map(|_| Slot::new()).collect()));
		}
		TransactionTable {
			buckets: buckets.into_boxed_slice(),
			slot_count,
			scan_cursor: AtomicUsize::new(0),
			in_flight: AtomicUsize::new(0),
			label_index: SpinMutex::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))),
		}
	}

	pub fn slot_count(&self) -> usize {
		self.slot_count
	}

	pub fn in_flight_count(&self) -> usize {
		self.in_flight.load(Ordering::Relaxed)
	}

	/// Claims a free slot, moves it to `Allocated` and indexes its label.
	pub fn register(&self, body: SlotBody) -> Result<AsyncHandle, EngineError> {
		let start = self.scan_cursor.fetch_add(1, Ordering::Relaxed);
		for probe in 0..self.slot_count {
			let index = (start + probe) % self.slot_count;
			let mut bucket = self.buckets[index / BUCKET_SIZE].lock();
			let slot = &mut bucket[index % BUCKET_SIZE];
			if state_of(&slot.state) != TxState::Free {
				continue;
			}

			let node = (body.meta.destination_node_id & 0x3F) as u8;
			let label = body.label;
			// Only requester-side transactions own their label; responses
			// echo the requester's label and must not shadow it in the index.
			let index_label = body.context == AtKind::Request;
			slot.body = Some(body);
			slot.state.store(TxState::Allocated.into(), Ordering::Release);
			let handle = AsyncHandle::pack(index as u16, slot.tag);
			drop(bucket);

			self.in_flight.fetch_add(1, Ordering::Relaxed);
			if index_label {
				self.label_index.lock().insert((node, label), index as u16);
			}
			return Ok(handle);
		}
		Err(EngineError::TableFull)
	}

	/// Runs `f` on a live slot, validating the handle's reuse tag.
	pub fn with_slot<R>(
		&self,
		handle: AsyncHandle,
		f: impl FnOnce(&AtomicU8, &mut SlotBody) -> R,
	) -> Option<R> {
		if !handle.is_valid() || handle.index() >= self.slot_count {
			return None;
		}
		let index = handle.index();
		let mut bucket = self.buckets[index / BUCKET_SIZE].lock();
		let slot = &mut bucket[index % BUCKET_SIZE];
		if slot.tag != handle.tag() || state_of(&slot.state) == TxState::Free {
			return None;
		}
		let body = slot.body.as_mut()?;
		// Field-wise split so the closure can CAS the state while mutating
		// the body.
		Some(f(&slot.state, body))
	}

	/// Frees a slot, un-indexes its label and returns the body so the caller
	/// can release label and payload after dropping the lock.
	pub fn release(&self, handle: AsyncHandle) -> Option<SlotBody> {
		if !handle.is_valid() || handle.index() >= self.slot_count {
			return None;
		}
		let index = handle.index();
		let mut bucket = self.buckets[index / BUCKET_SIZE].lock();
		let slot = &mut bucket[index % BUCKET_SIZE];
		if slot.tag != handle.tag() || state_of(&slot.state) == TxState::Free {
			return None;
		}
		let body = slot.body.take()?;
		slot.state.store(TxState::Free.into(), Ordering::Release);
		slot.tag = slot.tag % 15 + 1;
		drop(bucket);

		self.in_flight.fetch_sub(1, Ordering::Relaxed);
		if body.context == AtKind::Request {
			let node = (body.meta.destination_node_id & 0x3F) as u8;
			let mut labels = self.label_index.lock();
			if labels.get(&(node, body.label)) == Some(&(index as u16)) {
				labels.remove(&(node, body.label));
			}
		}
		Some(body)
	}

	/// Matches an inbound response by `(source node, tLabel)`.
	pub fn lookup_by_label(&self, node: u8, label: u8) -> Option<AsyncHandle> {
		let index = usize::from(*self.label_index.lock().get(&(node, label))?);
		let mut bucket = self.buckets[index / BUCKET_SIZE].lock();
		let slot = &mut bucket[index % BUCKET_SIZE];
		let state = state_of(&slot.state);
		if state == TxState::Free {
			return None;
		}
		let body = slot.body.as_ref()?;
		if body.label != label || (body.meta.destination_node_id & 0x3F) as u8 != node {
			return None;
		}
		Some(AsyncHandle::pack(index as u16, slot.tag))
	}

	/// Handles of every transaction that is not yet terminal. Used by the
	/// generation tracker and diagnostics.
	pub fn in_flight_handles(&self) -> Vec<AsyncHandle> {
		let mut handles = Vec::new();
		for (b, bucket) in self.buckets.iter().enumerate() {
			let bucket = bucket.lock();
			for (s, slot) in bucket.iter().enumerate() {
				if state_of(&slot.state).is_in_flight() {
					handles.push(AsyncHandle::pack((b * BUCKET_SIZE + s) as u16, slot.tag));
				}
			}
		}
		handles
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::defs::TransactionStatus;

	fn body(dest: u16, label: u8) -> SlotBody {
		SlotBody {
			meta: TxMetadata {
				generation: Generation(1),
				source_node_id: 0xFFC0,
				destination_node_id: dest,
				tcode: TCode::ReadQuadletRequest,
				expected_response_len: 4,
				strategy: CompletionStrategy::CompleteOnAr,
			},
			label,
			speed: FwSpeed::S100,
			submitted_ns: 0,
			deadline_ns: 0,
			retries_left: 3,
			wheel_seq: 0,
			header: [0; AT_HEADER_MAX],
			header_len: 12,
			payload: None,
			callback: Some(Box::new(|_: TransactionStatus, _: &[u8]| {})),
			context: AtKind::Request,
			ack: None,
		}
	}

	#[test]
	fn register_lookup_release_round_trip() {
		let table = TransactionTable::new(64);
		let handle = table.register(body(0xFFC5, 9)).unwrap();
		assert!(handle.is_valid());
		assert_eq!(table.in_flight_count(), 1);

		assert_eq!(table.lookup_by_label(5, 9), Some(handle));
		assert_eq!(table.lookup_by_label(5, 8), None);
		assert_eq!(table.lookup_by_label(6, 9), None);

		let released = table.release(handle).unwrap();
		assert_eq!(released.label, 9);
		assert_eq!(table.in_flight_count(), 0);
		assert_eq!(table.lookup_by_label(5, 9), None);

		// The stale handle no longer resolves.
		assert!(table.with_slot(handle, |_, _| ()).is_none());
		assert!(table.release(handle).is_none());
	}

	#[test]
	fn slot_reuse_bumps_the_tag() {
		let table = TransactionTable::new(64);
		let first = table.register(body(1, 0)).unwrap();
		table.release(first).unwrap();

		// Force reuse of the same slot index.
		let mut second = None;
		for _ in 0..64 {
			let h = table.register(body(1, 1)).unwrap();
			if h.index() == first.index() {
				second = Some(h);
				break;
			}
			table.release(h).unwrap();
		}
		let second = second.expect("slot was not reused");
		assert_ne!(second.tag(), first.tag());
	}

	#[test]
	fn table_full_is_reported() {
		let table = TransactionTable::new(64);
		let handles: Vec<_> = (0..64).map(|i| table.register(body(1, i as u8)).unwrap()).collect();
		assert!(matches!(table.register(body(1, 63)), Err(EngineError::TableFull)));
		for h in handles {
			table.release(h).unwrap();
		}
	}

	#[test]
	fn in_flight_enumeration_sees_live_slots_only() {
		let table = TransactionTable::new(64);
		let a = table.register(body(1, 0)).unwrap();
		let b = table.register(body(2, 0)).unwrap();
		assert_eq!(table.in_flight_handles().len(), 2);
		table.release(a).unwrap();
		let left = table.in_flight_handles();
		assert_eq!(left, vec![b]);
	}
}
