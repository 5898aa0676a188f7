//! The asynchronous subsystem and its bus-ops facade.
//!
//! [`AsyncSubsystem`] wires the transmit contexts, the receive machinery and
//! the transaction bookkeeping together and offers the [`BusOps`] operations
//! to upper protocols (Config-ROM scanning, IRM, FCP). Submissions may come
//! from any thread; completions are driven by the IRQ dispatch entry points
//! and a periodic call to [`AsyncSubsystem::process_timeouts`].
//!
//! Every operation either returns a valid handle whose callback will fire
//! exactly once with a terminal status, or returns [`AsyncHandle::INVALID`].
//! The facade never panics on hardware-state grounds and never blocks on the
//! hardware.

use alloc::boxed::Box;
use alloc::sync::Arc;

use hermit_sync::SpinMutex;

use crate::config::EngineConfig;
use crate::defs::{
	AsyncHandle, CompletionCallback, CompletionStrategy, FwAddress, FwSpeed, Generation, LockOp,
	NodeId, TCode, TransactionStatus,
};
use crate::descriptor::DESCRIPTOR_SIZE;
use crate::diag::{AsyncStatusSnapshot, BufferPoolSnapshot, ContextSnapshot};
use crate::error::EngineError;
use crate::generation::GenerationTracker;
use crate::hw::{BusInfo, HardwareInterface, Timebase};
use crate::label::LabelAllocator;
use crate::packet::{self, PacketContext, AT_HEADER_MAX};
use crate::payload::PayloadBuffer;
use crate::receive::{
	ArContext, ArContextKind, ArPacketView, PacketRouter, RequestHandler, ResponseHandler,
};
use crate::regs;
use crate::retry::SpeedPolicy;
use crate::ring::DescriptorRing;
use crate::timeout::{TimerKind, TimerWheel};
use crate::transaction::{SlotBody, TransactionTable, TxMetadata, TxState};
use crate::transmit::{AtContext, AtKind, ChainSpec};

/// Asynchronous bus operations offered to upper protocols.
///
/// `speed` is `None` to let the topology view pick the best speed for the
/// target node. Callbacks receive the terminal status and the response
/// payload (empty for writes and failures) and fire exactly once.
pub trait BusOps: Send + Sync {
	fn read_block(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		length: usize,
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle;

	fn write_block(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		data: &[u8],
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle;

	fn lock(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		op: LockOp,
		operand: &[u8],
		response_len: usize,
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle;

	/// Transmits a PHY packet. No response is ever expected.
	fn send_phy_packet(&self, quadlet: u32, callback: CompletionCallback) -> AsyncHandle;

	/// Cancels an in-flight transaction. Returns `true` iff this call
	/// performed the transition; the callback then fires with
	/// [`TransactionStatus::Aborted`] from the next completion or timer pass.
	fn cancel(&self, handle: AsyncHandle) -> bool;

	/// Quadlet read; thin wrapper over a 4-byte [`BusOps::read_block`].
	fn read_quad(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle {
		self.read_block(generation, node, addr, 4, speed, callback)
	}

	/// Quadlet write; thin wrapper over a 4-byte [`BusOps::write_block`].
	fn write_quad(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		value: u32,
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle {
		self.write_block(generation, node, addr, &value.to_be_bytes(), speed, callback)
	}
}

/// Everything the IRQ/timer paths need, shared behind one `Arc` so router
/// handlers can capture it.
pub(crate) struct EngineInner {
	pub(crate) hw: Arc<dyn HardwareInterface>,
	pub(crate) info: Arc<dyn BusInfo>,
	pub(crate) time: Arc<dyn Timebase>,
	pub(crate) config: EngineConfig,
	pub(crate) at_request: AtContext,
	pub(crate) at_response: AtContext,
	pub(crate) ar_request: ArContext,
	pub(crate) ar_response: ArContext,
	pub(crate) labels: LabelAllocator,
	pub(crate) table: TransactionTable,
	pub(crate) generation: GenerationTracker,
	pub(crate) wheel: SpinMutex<TimerWheel>,
	pub(crate) speeds: SpinMutex<SpeedPolicy>,
	pub(crate) timeout_ns: u64,
}

/// The asynchronous transaction engine of one OHCI controller.
pub struct AsyncSubsystem {
	inner: Arc<EngineInner>,
	router: SpinMutex<PacketRouter>,
}

enum Command<'a> {
	Read { length: usize },
	Write { data: &'a [u8] },
	Lock { op: LockOp, operand: &'a [u8], response_len: usize },
	Phy { quadlet: u32 },
}

impl AsyncSubsystem {
	/// Builds the engine: allocates both AT descriptor rings and both AR
	/// buffer pools. No context is started yet; call
	/// [`AsyncSubsystem::start`] once IRQ routing is in place.
	pub fn new(
		hw: Arc<dyn HardwareInterface>,
		info: Arc<dyn BusInfo>,
		time: Arc<dyn Timebase>,
		config: EngineConfig,
	) -> Result<Self, EngineError> {
		config.validate()?;

		let at_request = AtContext::new(
			"AT request",
			AtKind::Request,
			regs::AT_REQUEST_BASE,
			Arc::clone(&hw),
			config.at_request_capacity,
		)?;
		let at_response = AtContext::new(
			"AT response",
			AtKind::Response,
			regs::AT_RESPONSE_BASE,
			Arc::clone(&hw),
			config.at_response_capacity,
		)?;
		let ar_request = ArContext::new(
			"AR request",
			regs::AR_REQUEST_BASE,
			Arc::clone(&hw),
			config.ar_buffers,
			config.ar_buffer_len,
		)?;
		let ar_response = ArContext::new(
			"AR response",
			regs::AR_RESPONSE_BASE,
			Arc::clone(&hw),
			config.ar_buffers,
			config.ar_buffer_len,
		)?;

		let now = time.monotonic_ns();
		let generation = GenerationTracker::new();
		generation.set(info.generation());

		let timeout_ns = u64::from(config.timeout_ms) * 1_000_000;
		let slots = config.outstanding_slots;
		let inner = Arc::new(EngineInner {
			hw,
			info,
			time,
			config,
			at_request,
			at_response,
			ar_request,
			ar_response,
			labels: LabelAllocator::new(),
			table: TransactionTable::new(slots),
			generation,
			wheel: SpinMutex::new(TimerWheel::new(now)),
			speeds: SpinMutex::new(SpeedPolicy::new()),
			timeout_ns,
		});

		let mut router = PacketRouter::new();
		for tcode in [
			TCode::WriteResponse,
			TCode::ReadQuadletResponse,
			TCode::ReadBlockResponse,
			TCode::LockResponse,
		] {
			let engine = Arc::clone(&inner);
			router.register_response_handler(
				tcode.into(),
				Box::new(move |view: &ArPacketView<'_>| engine.on_ar_response(view)),
			);
		}

		Ok(AsyncSubsystem {
			inner,
			router: SpinMutex::new(router),
		})
	}

	/// Starts both AR contexts and unmasks the async interrupt sources.
	pub fn start(&self) {
		self.inner.ar_request.start();
		self.inner.ar_response.start();
		let mask = regs::IntEvent::REQ_TX_COMPLETE
			| regs::IntEvent::RESP_TX_COMPLETE
			| regs::IntEvent::RQ_PKT
			| regs::IntEvent::RS_PKT
			| regs::IntEvent::BUS_RESET
			| regs::IntEvent::MASTER_ENABLE;
		self.inner.hw.write_register(regs::INT_MASK_SET, mask.bits());
		info!(
			"async engine started: gen={}, node={:#06x}",
			self.inner.generation.current(),
			self.inner.info.local_node_id()
		);
	}

	/// Stops all four DMA contexts and masks the async interrupts.
	pub fn stop(&self) {
		self.inner.at_request.stop();
		self.inner.at_response.stop();
		self.inner.ar_request.stop();
		self.inner.ar_response.stop();
		let mask = regs::IntEvent::REQ_TX_COMPLETE
			| regs::IntEvent::RESP_TX_COMPLETE
			| regs::IntEvent::RQ_PKT
			| regs::IntEvent::RS_PKT;
		self.inner.hw.write_register(regs::INT_MASK_CLEAR, mask.bits());
	}

	/// Reads and acknowledges IntEvent, then fans out to the processing
	/// entry points. The bus-attach layer may call this from its interrupt
	/// handler, or call the individual entry points itself.
	pub fn handle_interrupt(&self) {
		let raw = self.inner.hw.read_register(regs::INT_EVENT_CLEAR);
		let events = regs::IntEvent::from_bits_truncate(raw);
		if events.is_empty() {
			return;
		}
		self.inner.hw.write_register(regs::INT_EVENT_CLEAR, raw);

		if events.contains(regs::IntEvent::BUS_RESET) {
			self.bus_reset();
		}
		if events.contains(regs::IntEvent::REQ_TX_COMPLETE) {
			self.process_at_request_completions();
		}
		if events.contains(regs::IntEvent::RESP_TX_COMPLETE) {
			self.process_at_response_completions();
		}
		if events.intersects(regs::IntEvent::RQ_PKT | regs::IntEvent::ARRQ) {
			self.process_ar_request();
		}
		if events.intersects(regs::IntEvent::RS_PKT | regs::IntEvent::ARRS) {
			self.process_ar_response();
		}
	}

	/// Collects retired AT Request chains and advances their transactions.
	pub fn process_at_request_completions(&self) {
		for completion in self.inner.at_request.poll_completions() {
			self.inner.on_at_completion(completion);
		}
	}

	/// Collects retired AT Response chains (write responses we transmitted).
	pub fn process_at_response_completions(&self) {
		for completion in self.inner.at_response.poll_completions() {
			self.inner.on_at_completion(completion);
		}
	}

	/// Drains the AR Request DMA buffers through the router.
	pub fn process_ar_request(&self) {
		let router = self.router.lock();
		let inner = &self.inner;
		self.inner.ar_request.process(&mut |bytes: &[u8]| {
			router.route(ArContextKind::Request, bytes, &mut |view: &ArPacketView<'_>, rcode| {
				inner.send_write_response(view, rcode);
			});
		});
	}

	/// Drains the AR Response DMA buffers through the router.
	pub fn process_ar_response(&self) {
		let router = self.router.lock();
		self.inner.ar_response.process(&mut |bytes: &[u8]| {
			router.route(ArContextKind::Response, bytes, &mut |_, _| {});
		});
	}

	/// Routes a raw AR Request byte stream (testing and polled operation).
	pub fn process_ar_request_stream(&self, bytes: &[u8]) -> usize {
		let router = self.router.lock();
		let inner = &self.inner;
		router.route(ArContextKind::Request, bytes, &mut |view: &ArPacketView<'_>, rcode| {
			inner.send_write_response(view, rcode);
		})
	}

	/// Routes a raw AR Response byte stream (testing and polled operation).
	pub fn process_ar_response_stream(&self, bytes: &[u8]) -> usize {
		let router = self.router.lock();
		router.route(ArContextKind::Response, bytes, &mut |_, _| {})
	}

	/// Fires due timers: timeouts and delayed retries.
	pub fn process_timeouts(&self) {
		let now = self.inner.time.monotonic_ns();
		let due = self.inner.wheel.lock().advance(now);
		for entry in due {
			self.inner.on_timer(entry);
		}
	}

	/// Handles a bus reset: bumps the generation and completes every
	/// in-flight transaction of an older generation with
	/// [`TransactionStatus::StaleGeneration`].
	pub fn bus_reset(&self) {
		let next = self.inner.generation.begin_reset();
		info!("bus reset: now generation {next}");
		self.inner.labels.set_generation(u16::from(next.get()));

		for handle in self.inner.table.in_flight_handles() {
			let stale = self
				.inner
				.table
				.with_slot(handle, |_, body| body.meta.generation != next)
				.unwrap_or(false);
			if stale {
				self.inner.finish(handle, TransactionStatus::StaleGeneration, &[]);
			}
		}
		self.inner.generation.end_reset();
	}

	/// Installs a handler for inbound requests with the given tCode. The
	/// handler's rCode return value drives the write-response transmission.
	pub fn register_request_handler(&self, tcode: u8, handler: RequestHandler) {
		self.router.lock().register_request_handler(tcode, handler);
	}

	/// Installs a handler for inbound responses with the given tCode.
	///
	/// The engine pre-installs handlers for tCodes 0x2/0x6/0x7/0xB that
	/// match responses to outstanding requests; replacing those disconnects
	/// transaction completion.
	pub fn register_response_handler(&self, tcode: u8, handler: ResponseHandler) {
		self.router.lock().register_response_handler(tcode, handler);
	}

	/// Current bus generation as seen by the engine.
	pub fn generation(&self) -> Generation {
		self.inner.generation.current()
	}

	/// Read-only status snapshot for diagnostics.
	pub fn snapshot(&self) -> AsyncStatusSnapshot {
		let inner = &self.inner;
		AsyncStatusSnapshot {
			at_request: at_snapshot(&inner.at_request),
			at_response: at_snapshot(&inner.at_response),
			ar_request: ring_snapshot(inner.ar_request.ring(), 0),
			ar_response: ring_snapshot(inner.ar_response.ring(), 0),
			ar_request_buffers: pool_snapshot(&inner.ar_request),
			ar_response_buffers: pool_snapshot(&inner.ar_response),
			current_generation: inner.generation.current().get(),
			transactions_in_flight: inner.table.in_flight_count() as u32,
			labels_in_use: inner.labels.in_use_count(),
			timers_armed: inner.wheel.lock().armed() as u32,
		}
	}

	fn submit(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		speed: Option<FwSpeed>,
		command: Command<'_>,
		callback: CompletionCallback,
	) -> AsyncHandle {
		let inner = &self.inner;

		if !inner.generation.admits(generation) {
			debug!(
				"submit to node {node}: stale generation {generation} (current {})",
				inner.generation.current()
			);
			callback(TransactionStatus::StaleGeneration, &[]);
			return AsyncHandle::INVALID;
		}

		let source = inner.info.local_node_id();
		let speed = speed.unwrap_or_else(|| inner.info.speed_to(node));
		let ctx = PacketContext {
			source_node_id: source,
			generation,
			speed,
		};

		let Some(label) = inner.labels.allocate() else {
			warn!("submit to node {node}: all transaction labels in flight");
			return AsyncHandle::INVALID;
		};

		let mut header = [0u8; AT_HEADER_MAX];
		let built = self.build_command(&command, node, addr, label, speed, &ctx, &mut header);
		let (header_len, tcode, expected, strategy, payload) = match built {
			Ok(parts) => parts,
			Err(err) => {
				debug!("submit to node {node}: {err}");
				inner.labels.free(label);
				return AsyncHandle::INVALID;
			}
		};

		let payload_ref = payload.as_ref().map(|p| (p.device_address(), p.len() as u16));
		let now = inner.time.monotonic_ns();
		let body = SlotBody {
			meta: TxMetadata {
				generation,
				source_node_id: source,
				destination_node_id: packet::destination_of(&header).unwrap_or(0),
				tcode,
				expected_response_len: expected,
				strategy,
			},
			label,
			speed,
			submitted_ns: now,
			deadline_ns: now + inner.timeout_ns,
			retries_left: inner.config.retry_policy.max_retries,
			wheel_seq: 0,
			header,
			header_len: header_len as u8,
			payload,
			callback: Some(callback),
			context: AtKind::Request,
			ack: None,
		};

		let handle = match inner.table.register(body) {
			Ok(handle) => handle,
			Err(err) => {
				debug!("submit to node {node}: {err}");
				inner.labels.free(label);
				return AsyncHandle::INVALID;
			}
		};

		let chain = ChainSpec {
			header: &header[..header_len],
			payload: payload_ref,
		};
		if let Err(err) = inner.at_request.submit(handle, &chain) {
			debug!("submit to node {node}: {err}");
			if let Some(body) = inner.table.release(handle) {
				inner.labels.free(body.label);
			}
			return AsyncHandle::INVALID;
		}

		let armed = inner.table.with_slot(handle, |state, body| {
			state.store(TxState::AtPosted.into(), core::sync::atomic::Ordering::Release);
			body.wheel_seq = body.wheel_seq.wrapping_add(1);
			(body.deadline_ns, body.wheel_seq)
		});
		if let Some((deadline, seq)) = armed {
			inner.schedule(handle, deadline, TimerKind::Deadline, seq);
		}

		if crate::config::TRACE.tx_verbosity() >= 1 {
			trace!(
				"submitted tCode {:#x} to node {node}, label {label}, handle {:#010x}",
				u8::from(tcode),
				handle.raw()
			);
		}
		handle
	}

	#[allow(clippy::too_many_arguments)]
	fn build_command(
		&self,
		command: &Command<'_>,
		node: NodeId,
		addr: FwAddress,
		label: u8,
		speed: FwSpeed,
		ctx: &PacketContext,
		header: &mut [u8; AT_HEADER_MAX],
	) -> Result<(usize, TCode, usize, CompletionStrategy, Option<PayloadBuffer>), EngineError> {
		match *command {
			Command::Read { length } => {
				if length == 4 {
					let len = packet::build_read_quadlet(node, addr, label, speed, ctx, header)?;
					Ok((len, TCode::ReadQuadletRequest, 4, CompletionStrategy::CompleteOnAr, None))
				} else {
					let len =
						packet::build_read_block(node, addr, length as u32, label, speed, ctx, header)?;
					Ok((
						len,
						TCode::ReadBlockRequest,
						length,
						CompletionStrategy::CompleteOnAr,
						None,
					))
				}
			}
			Command::Write { data } => {
				if data.len() == 4 {
					let quadlet: &[u8; 4] = data.try_into().unwrap();
					let len = packet::build_write_quadlet(node, addr, quadlet, label, speed, ctx, header)?;
					Ok((len, TCode::WriteQuadletRequest, 0, CompletionStrategy::CompleteOnAt, None))
				} else {
					let len =
						packet::build_write_block(node, addr, data.len() as u32, label, speed, ctx, header)?;
					let payload = PayloadBuffer::create(&self.inner.hw, data)?;
					Ok((
						len,
						TCode::WriteBlockRequest,
						0,
						CompletionStrategy::RequireBoth,
						Some(payload),
					))
				}
			}
			Command::Lock { op, operand, response_len } => {
				let len = packet::build_lock(
					node,
					addr,
					operand.len() as u32,
					op.extended_tcode(),
					label,
					speed,
					ctx,
					header,
				)?;
				let payload = PayloadBuffer::create(&self.inner.hw, operand)?;
				// A zero response length means "infer": lock responses carry
				// half the operand (the old value).
				let expected = if response_len == 0 { operand.len() / 2 } else { response_len };
				Ok((len, TCode::LockRequest, expected, CompletionStrategy::CompleteOnAr, Some(payload)))
			}
			Command::Phy { quadlet } => {
				let len = packet::build_phy_packet(quadlet, header);
				Ok((len, TCode::PhyPacket, 0, CompletionStrategy::CompleteOnPhy, None))
			}
		}
	}
}

impl BusOps for AsyncSubsystem {
	fn read_block(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		length: usize,
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle {
		if length == 0 || length > 0xFFFF {
			debug!("read_block: length {length} out of range");
			return AsyncHandle::INVALID;
		}
		self.submit(generation, node, addr, speed, Command::Read { length }, callback)
	}

	fn write_block(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		data: &[u8],
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle {
		if data.is_empty() || data.len() > 0xFFFF {
			debug!("write_block: length {} out of range", data.len());
			return AsyncHandle::INVALID;
		}
		self.submit(generation, node, addr, speed, Command::Write { data }, callback)
	}

	fn lock(
		&self,
		generation: Generation,
		node: NodeId,
		addr: FwAddress,
		op: LockOp,
		operand: &[u8],
		response_len: usize,
		speed: Option<FwSpeed>,
		callback: CompletionCallback,
	) -> AsyncHandle {
		if operand.is_empty() || operand.len() % 4 != 0 {
			debug!("lock: operand length {} not quadlet aligned", operand.len());
			return AsyncHandle::INVALID;
		}
		self.submit(
			generation,
			node,
			addr,
			speed,
			Command::Lock { op, operand, response_len },
			callback,
		)
	}

	fn send_phy_packet(&self, quadlet: u32, callback: CompletionCallback) -> AsyncHandle {
		self.submit(
			self.inner.generation.current(),
			NodeId::new(0),
			FwAddress::new(0, 0),
			Some(FwSpeed::S100),
			Command::Phy { quadlet },
			callback,
		)
	}

	fn cancel(&self, handle: AsyncHandle) -> bool {
		self.inner.cancel(handle)
	}
}

fn at_snapshot(context: &AtContext) -> ContextSnapshot {
	let mut snapshot = ring_snapshot(context.ring(), context.last_command_ptr());
	snapshot.prev_last_blocks = context.ring().prev_last_blocks();
	snapshot
}

fn ring_snapshot(ring: &DescriptorRing, command_ptr: u32) -> ContextSnapshot {
	ContextSnapshot {
		descriptor_device_base: ring.device_base(),
		descriptor_count: ring.capacity() as u32,
		descriptor_stride: DESCRIPTOR_SIZE as u32,
		head: ring.head() as u32,
		tail: ring.tail() as u32,
		prev_last_blocks: ring.prev_last_blocks(),
		command_ptr,
	}
}

fn pool_snapshot(context: &ArContext) -> BufferPoolSnapshot {
	BufferPoolSnapshot {
		device_base: context.buffer_device_base(),
		buffer_count: context.buffer_count() as u32,
		buffer_len: context.buffer_len() as u32,
	}
}
