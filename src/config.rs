//! Engine configuration and runtime trace verbosity.
//!
//! The configuration is assembled once by the bus-attach layer and is
//! immutable afterwards. Only trace verbosity may change at runtime, through
//! the per-subsystem atomic cells in [`TraceConfig`].

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Tunables of the async engine. [`EngineConfig::default`] matches the values
/// a stock controller is brought up with.
#[derive(Clone, Debug)]
pub struct EngineConfig {
	/// Retry policy applied to transactions that do not override it.
	pub retry_policy: RetryPolicy,
	/// AT Request descriptor ring capacity (64..=4096 descriptors).
	pub at_request_capacity: usize,
	/// AT Response descriptor ring capacity (64..=4096 descriptors).
	pub at_response_capacity: usize,
	/// Receive buffers per AR context.
	pub ar_buffers: usize,
	/// Size of each AR receive buffer in bytes (quadlet aligned).
	pub ar_buffer_len: usize,
	/// Outstanding transaction slots; power of two, at most 4096.
	pub outstanding_slots: usize,
	/// Default transaction timeout in milliseconds.
	pub timeout_ms: u32,
}

impl Default for EngineConfig {
	fn default() -> Self {
		EngineConfig {
			retry_policy: RetryPolicy::default(),
			at_request_capacity: 256,
			at_response_capacity: 256,
			ar_buffers: 8,
			ar_buffer_len: 4096,
			outstanding_slots: 256,
			timeout_ms: 1000,
		}
	}
}

impl EngineConfig {
	pub fn validate(&self) -> Result<(), EngineError> {
		let ring_ok = |cap: usize| (64..=4096).contains(&cap);
		if !ring_ok(self.at_request_capacity) || !ring_ok(self.at_response_capacity) {
			return Err(EngineError::InvalidConfig("AT ring capacity out of 64..=4096"));
		}
		if !self.outstanding_slots.is_power_of_two() || self.outstanding_slots > 4096 {
			return Err(EngineError::InvalidConfig(
				"outstanding slot count must be a power of two <= 4096",
			));
		}
		if self.ar_buffers == 0 || self.ar_buffer_len < 64 || self.ar_buffer_len % 4 != 0 {
			return Err(EngineError::InvalidConfig("bad AR buffer geometry"));
		}
		if self.timeout_ms == 0 || u64::from(self.timeout_ms) > crate::timeout::HORIZON_MS {
			return Err(EngineError::InvalidConfig("timeout outside the timer wheel horizon"));
		}
		Ok(())
	}
}

/// Per-subsystem trace verbosity (0..=4) plus a hex-dump toggle.
///
/// Verbosity gates the *chatty* diagnostics only; errors and warnings always
/// go through `log` unfiltered.
pub struct TraceConfig {
	tx: AtomicU8,
	rx: AtomicU8,
	hex_dump: AtomicBool,
}

impl TraceConfig {
	const fn new() -> Self {
		TraceConfig {
			tx: AtomicU8::new(0),
			rx: AtomicU8::new(0),
			hex_dump: AtomicBool::new(false),
		}
	}

	pub fn set_tx_verbosity(&self, level: u8) {
		self.tx.store(level.min(4), Ordering::Relaxed);
	}

	pub fn set_rx_verbosity(&self, level: u8) {
		self.rx.store(level.min(4), Ordering::Relaxed);
	}

	pub fn set_hex_dump(&self, enabled: bool) {
		self.hex_dump.store(enabled, Ordering::Relaxed);
	}

	pub fn tx_verbosity(&self) -> u8 {
		self.tx.load(Ordering::Relaxed)
	}

	pub fn rx_verbosity(&self) -> u8 {
		self.rx.load(Ordering::Relaxed)
	}

	pub fn hex_dump(&self) -> bool {
		self.hex_dump.load(Ordering::Relaxed)
	}
}

/// Process-wide trace switches.
pub static TRACE: TraceConfig = TraceConfig::new();
