//! Retry and speed-fallback policy.
//!
//! Ack-busy and timeouts consume retries at the current speed first. Once a
//! node has exhausted them, a policy with speed fallback enabled records the
//! failure, drops to the next slower speed (S800→S400→S200→S100) and starts
//! a fresh retry budget there. A success at a speed clears the failure
//! history the fallback decision was based on.

use ahash::RandomState;
use hashbrown::HashMap;

use crate::defs::FwSpeed;

/// Retry tuning for one transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RetryPolicy {
	pub max_retries: u8,
	/// Delay before a resubmission, in microseconds.
	pub retry_delay_us: u64,
	pub retry_on_busy: bool,
	pub retry_on_timeout: bool,
	/// Fall back to slower speeds once retries are exhausted (ROM quirk
	/// handling).
	pub speed_fallback: bool,
}

impl RetryPolicy {
	/// 3 retries, 1 ms apart, on busy and timeout.
	pub const fn standard() -> Self {
		RetryPolicy {
			max_retries: 3,
			retry_delay_us: 1000,
			retry_on_busy: true,
			retry_on_timeout: true,
			speed_fallback: false,
		}
	}

	/// 2 retries, 500 µs apart, busy only.
	pub const fn reduced() -> Self {
		RetryPolicy {
			max_retries: 2,
			retry_delay_us: 500,
			retry_on_busy: true,
			retry_on_timeout: false,
			speed_fallback: false,
		}
	}

	/// No retries at all.
	pub const fn none() -> Self {
		RetryPolicy {
			max_retries: 0,
			retry_delay_us: 0,
			retry_on_busy: false,
			retry_on_timeout: false,
			speed_fallback: false,
		}
	}

	/// 6 retries with speed fallback, for nodes with fragile ROMs.
	pub const fn increased() -> Self {
		RetryPolicy {
			max_retries: 6,
			retry_delay_us: 1000,
			retry_on_busy: true,
			retry_on_timeout: true,
			speed_fallback: true,
		}
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::standard()
	}
}

/// Outcome of one retry decision.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RetryDecision {
	/// Resubmit unchanged.
	RetrySameSpeed,
	/// Resubmit at the contained (slower) speed with a fresh retry budget.
	RetryWithFallback(FwSpeed),
	/// Out of options.
	FailedExhausted,
}

#[derive(Clone, Copy, Default)]
struct NodeSpeedState {
	best: Option<FwSpeed>,
	timeouts: [u8; 4],
}

/// Per-node speed knowledge accumulated from timeouts and successes.
pub struct SpeedPolicy {
	nodes: HashMap<u8, NodeSpeedState, RandomState>,
}

impl SpeedPolicy {
	pub fn new() -> Self {
		SpeedPolicy {
			nodes: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
		}
	}

	/// Best speed to use towards `node`, starting from `current` knowledge.
	pub fn for_node(&mut self, node: u8, current: FwSpeed) -> FwSpeed {
		let state = self.nodes.entry(node).or_default();
		let mut best = state.best.unwrap_or(current).min(current);
		while state.timeouts[u8::from(best) as usize] > 0 {
			match best.step_down() {
				Some(slower) => best = slower,
				None => break,
			}
		}
		state.best = Some(best);
		best
	}

	pub fn record_timeout(&mut self, node: u8, speed: FwSpeed) {
		let state = self.nodes.entry(node).or_default();
		let count = &mut state.timeouts[u8::from(speed) as usize];
		*count = count.saturating_add(1);
	}

	/// A success at `speed` clears the failure history at that speed.
	pub fn record_success(&mut self, node: u8, speed: FwSpeed) {
		let state = self.nodes.entry(node).or_default();
		state.timeouts[u8::from(speed) as usize] = 0;
		if state.best.is_none() || state.best < Some(speed) {
			state.best = Some(speed);
		}
	}

	/// The retry decision: consume a retry at the same speed, else attempt a
	/// speed fallback, else fail.
	pub fn apply(
		&mut self,
		node: u8,
		policy: &RetryPolicy,
		retries_left: &mut u8,
		current_speed: &mut FwSpeed,
	) -> RetryDecision {
		if *retries_left > 0 {
			*retries_left -= 1;
			return RetryDecision::RetrySameSpeed;
		}

		self.record_timeout(node, *current_speed);
		if policy.speed_fallback {
			let best = self.for_node(node, *current_speed);
			if best != *current_speed {
				*current_speed = best;
				*retries_left = policy.max_retries;
				return RetryDecision::RetryWithFallback(best);
			}
		}
		RetryDecision::FailedExhausted
	}
}

impl Default for SpeedPolicy {
	fn default() -> Self {
		Self::new()
	}
}
