//! Transaction timer wheel.
//!
//! One wheel with 1 ms resolution and a 16 s horizon schedules every
//! transaction deadline and retry delay. Entries are not removed eagerly:
//! each carries the slot's wheel sequence number at arm time, and the engine
//! discards entries whose sequence no longer matches when they fire. An
//! entry landing beyond the horizon is parked in the furthest bucket and
//! re-inserted when it comes up early.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::defs::AsyncHandle;

/// Wheel resolution.
pub const RESOLUTION_NS: u64 = 1_000_000;
/// Bucket count; resolution × buckets = 16.384 s horizon.
pub const BUCKETS: usize = 16_384;
/// Largest representable delay in milliseconds.
pub const HORIZON_MS: u64 = (RESOLUTION_NS * BUCKETS as u64 / 2) / 1_000_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerKind {
	/// The transaction's deadline.
	Deadline,
	/// A delayed resubmission (retry back-off).
	Retry,
}

#[derive(Clone, Copy, Debug)]
pub struct TimerEntry {
	pub deadline_ns: u64,
	pub handle: AsyncHandle,
	pub seq: u32,
	pub kind: TimerKind,
}

pub struct TimerWheel {
	buckets: Box<[Vec<TimerEntry>]>,
	/// Bucket the next advance starts from.
	cursor: usize,
	/// Absolute time of the cursor bucket's lower edge.
	cursor_ns: u64,
	armed: usize,
}

impl TimerWheel {
	pub fn new(now_ns: u64) -> Self {
		TimerWheel {
			buckets: (0..BUCKETS).map(|_| Vec::new()).collect(),
			cursor: 0,
			cursor_ns: now_ns - now_ns % RESOLUTION_NS,
			armed: 0,
		}
	}

	pub fn armed(&self) -> usize {
		self.armed
	}

	pub fn insert(&mut self, entry: TimerEntry) {
		let ticks = if entry.deadline_ns <= self.cursor_ns {
			// Already due; fires on the next advance.
			0
		} else {
			((entry.deadline_ns - self.cursor_ns) / RESOLUTION_NS).min(BUCKETS as u64 - 1)
		};
		let bucket = (self.cursor + ticks as usize) % BUCKETS;
		self.buckets[bucket].push(entry);
		self.armed += 1;
	}

	/// Moves time forward to `now_ns`, returning every entry that became due.
	pub fn advance(&mut self, now_ns: u64) -> Vec<TimerEntry> {
		let mut due = Vec::new();
		while self.cursor_ns + RESOLUTION_NS <= now_ns {
			let bucket = core::mem::take(&mut self.buckets[self.cursor]);
			for entry in bucket {
				self.armed -= 1;
				if entry.deadline_ns <= now_ns {
					due.push(entry);
				} else {
					// Parked beyond the horizon; goes around again.
					self.armed += 1;
					let ticks = ((entry.deadline_ns - self.cursor_ns) / RESOLUTION_NS)
						.clamp(1, BUCKETS as u64 - 1);
					let target = (self.cursor + ticks as usize) % BUCKETS;
					self.buckets[target].push(entry);
				}
			}
			self.cursor = (self.cursor + 1) % BUCKETS;
			self.cursor_ns += RESOLUTION_NS;
		}
		due
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(deadline_ns: u64, seq: u32) -> TimerEntry {
		TimerEntry {
			deadline_ns,
			handle: AsyncHandle::pack(1, 1),
			seq,
			kind: TimerKind::Deadline,
		}
	}

	#[test]
	fn fires_at_the_right_tick() {
		let mut wheel = TimerWheel::new(0);
		wheel.insert(entry(5 * RESOLUTION_NS, 1));

		assert!(wheel.advance(4 * RESOLUTION_NS).is_empty());
		let due = wheel.advance(6 * RESOLUTION_NS);
		assert_eq!(due.len(), 1);
		assert_eq!(due[0].seq, 1);
		assert_eq!(wheel.armed(), 0);
	}

	#[test]
	fn multiple_entries_in_one_advance() {
		let mut wheel = TimerWheel::new(1_000 * RESOLUTION_NS);
		wheel.insert(entry(1_001 * RESOLUTION_NS, 1));
		wheel.insert(entry(1_004 * RESOLUTION_NS, 2));
		wheel.insert(entry(1_900 * RESOLUTION_NS, 3));

		let due = wheel.advance(1_010 * RESOLUTION_NS);
		let seqs: Vec<u32> = due.iter().map(|e| e.seq).collect();
		assert_eq!(seqs, vec![1, 2]);
		assert_eq!(wheel.armed(), 1);
	}

	#[test]
	fn beyond_horizon_entries_go_around_again() {
		let mut wheel = TimerWheel::new(0);
		let far = (BUCKETS as u64 + 100) * RESOLUTION_NS;
		wheel.insert(entry(far, 7));

		// A pass over the whole wheel does not fire it early.
		let due = wheel.advance((BUCKETS as u64 - 1) * RESOLUTION_NS);
		assert!(due.is_empty());
		assert_eq!(wheel.armed(), 1);

		let due = wheel.advance(far + RESOLUTION_NS);
		assert_eq!(due.len(), 1);
		assert_eq!(due[0].seq, 7);
	}

	#[test]
	fn past_deadlines_fire_on_the_next_advance() {
		let mut wheel = TimerWheel::new(50 * RESOLUTION_NS);
		wheel.insert(entry(10 * RESOLUTION_NS, 1));
		let due = wheel.advance(51 * RESOLUTION_NS);
		assert_eq!(due.len(), 1);
	}
}
