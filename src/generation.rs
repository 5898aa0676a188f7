//! Bus generation tracking.
//!
//! The 8-bit generation increments on every bus reset. Submissions stamp the
//! current generation into their metadata; a caller-supplied generation that
//! does not match the tracker fails immediately with
//! [`crate::defs::TransactionStatus::StaleGeneration`]. While a reset is
//! being processed a flag briefly refuses new submissions, so no transaction
//! can slip in between the bump and the invalidation sweep.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::defs::Generation;

pub(crate) struct GenerationTracker {
	current: AtomicU8,
	reset_in_progress: AtomicBool,
}

impl GenerationTracker {
	pub const fn new() -> Self {
		GenerationTracker {
			current: AtomicU8::new(0),
			reset_in_progress: AtomicBool::new(false),
		}
	}

	pub fn current(&self) -> Generation {
		Generation(self.current.load(Ordering::Acquire))
	}

	pub fn set(&self, generation: Generation) {
		self.current.store(generation.get(), Ordering::Release);
	}

	/// Whether a submission with `generation` may proceed right now.
	pub fn admits(&self, generation: Generation) -> bool {
		!self.reset_in_progress.load(Ordering::Acquire) && generation == self.current()
	}

	/// Starts reset processing: bumps the generation and blocks submissions
	/// until [`GenerationTracker::end_reset`].
	pub fn begin_reset(&self) -> Generation {
		self.reset_in_progress.store(true, Ordering::Release);
		let next = Generation(self.current.load(Ordering::Acquire)).next();
		self.current.store(next.get(), Ordering::Release);
		next
	}

	pub fn end_reset(&self) {
		self.reset_in_progress.store(false, Ordering::Release);
	}
}
