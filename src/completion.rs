//! Completion engine: moves transactions through their state machine.
//!
//! The strategy recorded at submit decides which leg is terminal: a quadlet
//! write completes on its AT ack, reads and locks complete on the AR
//! response, block writes acked with ack-pending need both, and PHY packets
//! complete on AT with no response ever expected. Ack-busy, missing-ack and
//! type-error events are funneled into the retry/speed-fallback policy; the
//! timer wheel backstops everything with the transaction deadline.
//!
//! Callbacks are always invoked after the table locks have been dropped and
//! before the slot (and with it the payload DMA) is released.

use core::sync::atomic::Ordering;

use crate::bus::EngineInner;
use crate::defs::{
	AsyncHandle, CompletionStrategy, NodeId, RCode, TCode, TransactionStatus,
};
use crate::descriptor::AtEvent;
use crate::packet::{self, PacketContext, AT_HEADER_MAX};
use crate::receive::ArPacketView;
use crate::retry::RetryDecision;
use crate::timeout::{TimerEntry, TimerKind};
use crate::transaction::{state_of, SlotBody, TxMetadata, TxState};
use crate::transmit::{AtCompletion, AtKind, ChainSpec};
use crate::wire::ar_quadlet_at;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RetryTrigger {
	Busy,
	Timeout,
	TypeError,
}

enum Decision {
	Nothing,
	Finish(TransactionStatus),
	Retry(RetryTrigger),
}

enum RetryStep {
	Ignore,
	Schedule(u64, u32),
	Fail,
	Abort,
}

enum TimerAction {
	Ignore,
	Timeout,
	Resubmit,
	Abort,
}

impl EngineInner {
	pub(crate) fn schedule(&self, handle: AsyncHandle, deadline_ns: u64, kind: TimerKind, seq: u32) {
		self.wheel.lock().insert(TimerEntry {
			deadline_ns,
			handle,
			seq,
			kind,
		});
	}

	/// Applies an AT descriptor's ack/event code to its transaction.
	pub(crate) fn on_at_completion(&self, completion: AtCompletion) {
		let event = AtEvent::try_from(completion.event);
		let decision = self
			.table
			.with_slot(completion.handle, |state, body| {
				let st = state_of(state);
				if st == TxState::Aborted {
					return Decision::Finish(TransactionStatus::Aborted);
				}
				if st.is_terminal() {
					return Decision::Nothing;
				}

				body.ack = Some(completion.event);
				state.store(TxState::AtCompleted.into(), Ordering::Release);

				match event {
					Ok(AtEvent::AckComplete) => match body.meta.strategy {
						CompletionStrategy::CompleteOnAt
						| CompletionStrategy::CompleteOnPhy
						| CompletionStrategy::RequireBoth => {
							Decision::Finish(TransactionStatus::Success)
						}
						CompletionStrategy::CompleteOnAr => {
							state.store(TxState::AwaitingAr.into(), Ordering::Release);
							Decision::Nothing
						}
					},
					Ok(AtEvent::AckPending) => {
						if body.meta.strategy == CompletionStrategy::CompleteOnPhy {
							// The local link acked the PHY packet; nothing
							// else will ever arrive for it.
							Decision::Finish(TransactionStatus::Success)
						} else {
							state.store(TxState::AwaitingAr.into(), Ordering::Release);
							Decision::Nothing
						}
					}
					Ok(AtEvent::AckBusy) => Decision::Retry(RetryTrigger::Busy),
					Ok(AtEvent::MissingAck) => Decision::Retry(RetryTrigger::Timeout),
					Ok(AtEvent::AckTypeError) => Decision::Retry(RetryTrigger::TypeError),
					Ok(AtEvent::AckDataError) | Ok(AtEvent::AckAddressError) => {
						Decision::Finish(TransactionStatus::HardwareError)
					}
					Err(_) => {
						warn!(
							"AT completion with unknown event {:#04x}, failing the transaction",
							completion.event
						);
						Decision::Finish(TransactionStatus::HardwareError)
					}
				}
			})
			.unwrap_or(Decision::Nothing);

		match decision {
			Decision::Nothing => {}
			Decision::Finish(status) => self.finish(completion.handle, status, &[]),
			Decision::Retry(trigger) => self.apply_retry(completion.handle, trigger),
		}
	}

	/// Matches an inbound response packet to its outstanding request.
	pub(crate) fn on_ar_response(&self, view: &ArPacketView<'_>) {
		if !view.tcode.is_response() {
			return;
		}
		let node = view.source_node();
		let Some(handle) = self.table.lookup_by_label(node, view.tlabel) else {
			debug!(
				"AR response: no outstanding transaction for node {node} label {} (tCode {:#x})",
				view.tlabel,
				u8::from(view.tcode)
			);
			return;
		};

		// Read-quadlet responses embed their data in header quadlet 3; the
		// payload is delivered in wire byte order.
		let quad_data = ar_quadlet_at(view.header, 12).unwrap_or(0).to_be_bytes();
		let payload: &[u8] = match view.tcode {
			TCode::ReadQuadletResponse => &quad_data,
			TCode::ReadBlockResponse | TCode::LockResponse => view.payload,
			_ => &[],
		};

		let rcode = view.rcode.unwrap_or_else(|| u8::from(RCode::Complete));
		let decision = self
			.table
			.with_slot(handle, |state, body| {
				let st = state_of(state);
				if st == TxState::Aborted {
					return Decision::Finish(TransactionStatus::Aborted);
				}
				if st.is_terminal() {
					return Decision::Nothing;
				}
				if !body.meta.strategy.expects_response() {
					debug!(
						"AR response for a unified transaction (tCode {:#x}), accepting anyway",
						u8::from(body.meta.tcode)
					);
				}
				state.store(TxState::ArReceived.into(), Ordering::Release);

				match RCode::try_from(rcode) {
					Ok(RCode::Complete) => {
						if payload.len() < body.meta.expected_response_len {
							Decision::Finish(TransactionStatus::ShortRead)
						} else {
							Decision::Finish(TransactionStatus::Success)
						}
					}
					Ok(RCode::TypeError) => Decision::Retry(RetryTrigger::TypeError),
					Ok(RCode::ConflictError) | Ok(RCode::DataError) | Ok(RCode::AddressError) => {
						Decision::Finish(TransactionStatus::HardwareError)
					}
					Err(_) => {
						debug!("AR response with reserved rCode {rcode:#x}");
						Decision::Finish(TransactionStatus::HardwareError)
					}
				}
			})
			.unwrap_or(Decision::Nothing);

		match decision {
			Decision::Nothing => {}
			Decision::Finish(TransactionStatus::Success) => {
				// Length-match the delivery; an over-long response is clipped
				// to what the caller asked for.
				let expected = self
					.table
					.with_slot(handle, |_, body| body.meta.expected_response_len)
					.unwrap_or(0);
				self.finish(
					handle,
					TransactionStatus::Success,
					&payload[..expected.min(payload.len())],
				);
			}
			Decision::Finish(status) => self.finish(handle, status, payload),
			Decision::Retry(trigger) => self.apply_retry(handle, trigger),
		}
	}

	/// A timer entry fired; sequence numbers filter out stale ones.
	pub(crate) fn on_timer(&self, entry: TimerEntry) {
		let action = self
			.table
			.with_slot(entry.handle, |state, body| {
				if body.wheel_seq != entry.seq {
					return TimerAction::Ignore;
				}
				let st = state_of(state);
				if st == TxState::Aborted {
					return TimerAction::Abort;
				}
				if st.is_terminal() {
					return TimerAction::Ignore;
				}
				match entry.kind {
					TimerKind::Deadline => TimerAction::Timeout,
					TimerKind::Retry => TimerAction::Resubmit,
				}
			})
			.unwrap_or(TimerAction::Ignore);

		match action {
			TimerAction::Ignore => {}
			TimerAction::Timeout => {
				debug!("transaction {:#010x} hit its deadline", entry.handle.raw());
				self.apply_retry(entry.handle, RetryTrigger::Timeout);
			}
			TimerAction::Resubmit => self.resubmit(entry.handle),
			TimerAction::Abort => self.finish(entry.handle, TransactionStatus::Aborted, &[]),
		}
	}

	/// Claims the abort transition; the callback is delivered by whichever
	/// completion or timer pass observes the aborted slot next.
	pub(crate) fn cancel(&self, handle: AsyncHandle) -> bool {
		self.table
			.with_slot(handle, |state, _| loop {
				let st = state_of(state);
				if !st.is_in_flight() {
					return false;
				}
				if state
					.compare_exchange(
						st.into(),
						TxState::Aborted.into(),
						Ordering::AcqRel,
						Ordering::Acquire,
					)
					.is_ok()
				{
					return true;
				}
			})
			.unwrap_or(false)
	}

	/// Runs the retry decision for one trigger, scheduling the resubmission
	/// or failing the transaction.
	fn apply_retry(&self, handle: AsyncHandle, trigger: RetryTrigger) {
		let policy = self.config.retry_policy;
		let allowed = match trigger {
			RetryTrigger::Busy => policy.retry_on_busy,
			RetryTrigger::Timeout => policy.retry_on_timeout,
			RetryTrigger::TypeError => policy.speed_fallback,
		};
		let exhausted = match trigger {
			RetryTrigger::Busy => TransactionStatus::BusyRetryExhausted,
			RetryTrigger::Timeout => TransactionStatus::Timeout,
			RetryTrigger::TypeError => TransactionStatus::HardwareError,
		};
		if !allowed {
			self.finish(handle, exhausted, &[]);
			return;
		}

		let step = self
			.table
			.with_slot(handle, |state, body| {
				let st = state_of(state);
				if st == TxState::Aborted {
					return RetryStep::Abort;
				}
				if st.is_terminal() {
					return RetryStep::Ignore;
				}
				if trigger == RetryTrigger::TypeError {
					// Type errors skip straight to the speed ladder.
					body.retries_left = 0;
				}
				let node = (body.meta.destination_node_id & 0x3F) as u8;
				let decision = self.speeds.lock().apply(
					node,
					&policy,
					&mut body.retries_left,
					&mut body.speed,
				);
				match decision {
					RetryDecision::RetrySameSpeed => {}
					RetryDecision::RetryWithFallback(speed) => {
						info!("node {node}: speed fallback to {speed:?}");
						packet::set_speed(&mut body.header[..usize::from(body.header_len)], speed);
					}
					RetryDecision::FailedExhausted => return RetryStep::Fail,
				}
				body.wheel_seq = body.wheel_seq.wrapping_add(1);
				RetryStep::Schedule(
					self.time.monotonic_ns() + policy.retry_delay_us * 1000,
					body.wheel_seq,
				)
			})
			.unwrap_or(RetryStep::Ignore);

		match step {
			RetryStep::Ignore => {}
			RetryStep::Schedule(_, _) if policy.retry_delay_us == 0 => self.resubmit(handle),
			RetryStep::Schedule(at, seq) => self.schedule(handle, at, TimerKind::Retry, seq),
			RetryStep::Fail => self.finish(handle, exhausted, &[]),
			RetryStep::Abort => self.finish(handle, TransactionStatus::Aborted, &[]),
		}
	}

	/// Re-transmits a transaction's stored chain on its original context.
	fn resubmit(&self, handle: AsyncHandle) {
		let info = self
			.table
			.with_slot(handle, |state, body| {
				let st = state_of(state);
				if st == TxState::Aborted || st.is_terminal() {
					return None;
				}
				state.store(TxState::AtPosted.into(), Ordering::Release);
				Some((
					body.header,
					usize::from(body.header_len),
					body.payload.as_ref().map(|p| (p.device_address(), p.len() as u16)),
					body.context,
				))
			})
			.flatten();
		let Some((header, header_len, payload, context)) = info else {
			return;
		};

		let chain = ChainSpec {
			header: &header[..header_len],
			payload,
		};
		let at = match context {
			AtKind::Request => &self.at_request,
			AtKind::Response => &self.at_response,
		};
		if let Err(err) = at.submit(handle, &chain) {
			warn!("resubmission failed: {err}");
			self.finish(handle, TransactionStatus::HardwareError, &[]);
			return;
		}

		let armed = self.table.with_slot(handle, |_, body| {
			body.deadline_ns = self.time.monotonic_ns() + self.timeout_ns;
			body.wheel_seq = body.wheel_seq.wrapping_add(1);
			(body.deadline_ns, body.wheel_seq)
		});
		if let Some((deadline, seq)) = armed {
			self.schedule(handle, deadline, TimerKind::Deadline, seq);
		}
	}

	/// Moves a transaction to its terminal state, invokes the callback (once,
	/// outside all locks) and releases slot, label and payload.
	///
	/// If the slot was aborted in the meantime the status degrades to
	/// `Aborted`, regardless of what the hardware reported.
	pub(crate) fn finish(&self, handle: AsyncHandle, status: TransactionStatus, response: &[u8]) {
		let taken = self.table.with_slot(handle, |state, body| {
			let st = state_of(state);
			if st.is_terminal() && st != TxState::Aborted {
				return None;
			}
			let final_status = if st == TxState::Aborted {
				TransactionStatus::Aborted
			} else {
				status
			};
			let terminal = match final_status {
				TransactionStatus::Success => TxState::Completed,
				TransactionStatus::Timeout => TxState::TimedOut,
				TransactionStatus::Aborted => TxState::Aborted,
				TransactionStatus::StaleGeneration => TxState::Stale,
				_ => TxState::Failed,
			};
			state.store(terminal.into(), Ordering::Release);
			body.wheel_seq = body.wheel_seq.wrapping_add(1);
			Some((body.callback.take(), final_status))
		});
		let Some(Some((callback, final_status))) = taken else {
			return;
		};

		if final_status != TransactionStatus::Success && final_status != TransactionStatus::ShortRead
		{
			debug!("transaction {:#010x} finished: {final_status:?}", handle.raw());
		}

		// The payload context is still owned by the slot here, so the DMA it
		// backs outlives the callback.
		if let Some(callback) = callback {
			let delivered = match final_status {
				TransactionStatus::Success | TransactionStatus::ShortRead => response,
				_ => &[],
			};
			callback(final_status, delivered);
		}

		if let Some(body) = self.table.release(handle) {
			if body.context == AtKind::Request {
				self.labels.free(body.label);
				if final_status == TransactionStatus::Success {
					self.speeds
						.lock()
						.record_success((body.meta.destination_node_id & 0x3F) as u8, body.speed);
				}
			}
			// `body` (and any payload DMA) drops here.
		}
	}

	/// Builds and transmits a write response for an inbound request.
	/// Broadcast requests (destination id 0xFFFF) are never answered.
	pub(crate) fn send_write_response(&self, view: &ArPacketView<'_>, rcode: RCode) {
		if view.dest_id == 0xFFFF {
			debug!("write response suppressed for broadcast request");
			return;
		}

		let source = self.info.local_node_id();
		let speed = self.info.speed_to(NodeId::new(view.source_node()));
		let ctx = PacketContext {
			source_node_id: source,
			generation: self.generation.current(),
			speed,
		};
		let mut header = [0u8; AT_HEADER_MAX];
		let len = match packet::build_write_response(
			view.source_id,
			view.tlabel,
			rcode,
			speed,
			&ctx,
			&mut header,
		) {
			Ok(len) => len,
			Err(err) => {
				warn!("write response: {err}");
				return;
			}
		};

		let now = self.time.monotonic_ns();
		let body = SlotBody {
			meta: TxMetadata {
				generation: ctx.generation,
				source_node_id: source,
				destination_node_id: view.source_id,
				tcode: TCode::WriteResponse,
				expected_response_len: 0,
				strategy: CompletionStrategy::CompleteOnAt,
			},
			// Echoes the requester's label; not taken from our pool.
			label: view.tlabel,
			speed,
			submitted_ns: now,
			deadline_ns: now + self.timeout_ns,
			retries_left: self.config.retry_policy.max_retries,
			wheel_seq: 0,
			header,
			header_len: len as u8,
			payload: None,
			callback: None,
			context: AtKind::Response,
			ack: None,
		};
		let handle = match self.table.register(body) {
			Ok(handle) => handle,
			Err(err) => {
				warn!("write response: {err}");
				return;
			}
		};

		let chain = ChainSpec {
			header: &header[..len],
			payload: None,
		};
		if let Err(err) = self.at_response.submit(handle, &chain) {
			warn!("write response: {err}");
			self.table.release(handle);
			return;
		}

		let armed = self.table.with_slot(handle, |state, body| {
			state.store(TxState::AtPosted.into(), Ordering::Release);
			body.wheel_seq = body.wheel_seq.wrapping_add(1);
			(body.deadline_ns, body.wheel_seq)
		});
		if let Some((deadline, seq)) = armed {
			self.schedule(handle, deadline, TimerKind::Deadline, seq);
		}
	}
}
