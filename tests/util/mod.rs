//! Shared fixtures: a mock controller, a mock topology view and a manual
//! clock, plus builders for synthetic AR streams.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use firewire_ohci::config::EngineConfig;
use firewire_ohci::defs::{FwSpeed, Generation, NodeId, TransactionStatus};
use firewire_ohci::hw::{BusInfo, DmaDirection, DmaHandle, DmaRegion, HardwareInterface, Timebase};
use firewire_ohci::regs;
use firewire_ohci::AsyncSubsystem;

/// 16-byte aligned backing storage so descriptor rings satisfy the OHCI
/// alignment contract.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct AlignedBlock([u8; 16]);

struct Allocation {
	mem: Vec<AlignedBlock>,
	device_addr: u64,
	len: usize,
}

#[derive(Default)]
struct MockState {
	registers: HashMap<u32, u32>,
	register_log: Vec<(u32, u32)>,
	allocations: HashMap<u64, Allocation>,
	next_handle: u64,
	next_device: u64,
}

/// Register file + DMA arena standing in for the controller.
pub struct MockHardware {
	state: Mutex<MockState>,
}

impl MockHardware {
	pub fn new() -> Arc<Self> {
		Arc::new(MockHardware {
			state: Mutex::new(MockState {
				next_device: 0x0010_0000,
				..MockState::default()
			}),
		})
	}

	/// All values written to `offset`, in order.
	pub fn writes_to(&self, offset: u32) -> Vec<u32> {
		self.state
			.lock()
			.unwrap()
			.register_log
			.iter()
			.filter(|(o, _)| *o == offset)
			.map(|(_, v)| *v)
			.collect()
	}

	/// Writes to `base + CONTEXT_CONTROL_SET` that had the WAKE bit set.
	pub fn wake_writes(&self, base: u32) -> usize {
		self.writes_to(base + regs::CONTEXT_CONTROL_SET)
			.iter()
			.filter(|v| *v & regs::ContextControl::WAKE.bits() != 0)
			.count()
	}

	pub fn command_ptr_writes(&self, base: u32) -> Vec<u32> {
		self.writes_to(base + regs::COMMAND_PTR)
	}

	pub fn register_write_count(&self) -> usize {
		self.state.lock().unwrap().register_log.len()
	}

	pub fn set_register(&self, offset: u32, value: u32) {
		self.state.lock().unwrap().registers.insert(offset, value);
	}

	pub fn read_dma(&self, device_addr: u64, len: usize) -> Vec<u8> {
		let state = self.state.lock().unwrap();
		let alloc = find(&state, device_addr).expect("no DMA allocation at address");
		let offset = (device_addr - alloc.device_addr) as usize;
		assert!(offset + len <= alloc.len, "DMA read crosses the allocation");
		(0..len).map(|i| byte_at(alloc, offset + i)).collect()
	}

	pub fn read_dma_u32(&self, device_addr: u64) -> u32 {
		u32::from_ne_bytes(self.read_dma(device_addr, 4).try_into().unwrap())
	}

	pub fn write_dma(&self, device_addr: u64, bytes: &[u8]) {
		let mut state = self.state.lock().unwrap();
		let alloc = find_mut(&mut state, device_addr).expect("no DMA allocation at address");
		let offset = (device_addr - alloc.device_addr) as usize;
		assert!(offset + bytes.len() <= alloc.len, "DMA write crosses the allocation");
		for (i, b) in bytes.iter().enumerate() {
			let at = offset + i;
			alloc.mem[at / 16].0[at % 16] = *b;
		}
	}

	pub fn write_dma_u32(&self, device_addr: u64, value: u32) {
		self.write_dma(device_addr, &value.to_ne_bytes());
	}

	pub fn live_allocations(&self) -> usize {
		self.state.lock().unwrap().allocations.len()
	}
}

fn find<'a>(state: &'a MockState, device_addr: u64) -> Option<&'a Allocation> {
	state
		.allocations
		.values()
		.find(|a| device_addr >= a.device_addr && device_addr < a.device_addr + a.len as u64)
}

fn find_mut<'a>(state: &'a mut MockState, device_addr: u64) -> Option<&'a mut Allocation> {
	state
		.allocations
		.values_mut()
		.find(|a| device_addr >= a.device_addr && device_addr < a.device_addr + a.len as u64)
}

fn byte_at(alloc: &Allocation, offset: usize) -> u8 {
	alloc.mem[offset / 16].0[offset % 16]
}

impl HardwareInterface for MockHardware {
	fn read_register(&self, offset: u32) -> u32 {
		*self.state.lock().unwrap().registers.get(&offset).unwrap_or(&0)
	}

	fn write_register(&self, offset: u32, value: u32) {
		let mut state = self.state.lock().unwrap();
		state.register_log.push((offset, value));
		state.registers.insert(offset, value);
	}

	fn alloc_dma(&self, len: usize, _direction: DmaDirection) -> Option<DmaRegion> {
		let mut state = self.state.lock().unwrap();
		let blocks = len.div_ceil(16).max(1);
		let mut mem = vec![AlignedBlock([0; 16]); blocks];
		let host = mem.as_mut_ptr() as *mut u8;

		let handle = state.next_handle;
		state.next_handle += 1;
		let device_addr = state.next_device;
		state.next_device += (blocks as u64 + 1) * 16;

		state.allocations.insert(
			handle,
			Allocation {
				mem,
				device_addr,
				len,
			},
		);
		Some(DmaRegion {
			handle: DmaHandle(handle),
			host,
			len,
			device_addr,
		})
	}

	fn release_dma(&self, handle: DmaHandle) {
		self.state.lock().unwrap().allocations.remove(&handle.0);
	}
}

/// Fixed topology: every node at `speed`, generation and local id settable.
pub struct MockBusInfo {
	local: u16,
	generation: AtomicU8,
	speed: AtomicU8,
}

impl MockBusInfo {
	pub fn new(local: u16, generation: u8) -> Arc<Self> {
		Arc::new(MockBusInfo {
			local,
			generation: AtomicU8::new(generation),
			speed: AtomicU8::new(FwSpeed::S400.into()),
		})
	}

	pub fn set_generation(&self, generation: u8) {
		self.generation.store(generation, Ordering::Relaxed);
	}

	pub fn set_speed(&self, speed: FwSpeed) {
		self.speed.store(speed.into(), Ordering::Relaxed);
	}
}

impl BusInfo for MockBusInfo {
	fn speed_to(&self, _node: NodeId) -> FwSpeed {
		FwSpeed::try_from(self.speed.load(Ordering::Relaxed)).unwrap()
	}

	fn hop_count(&self, _a: NodeId, _b: NodeId) -> u32 {
		1
	}

	fn generation(&self) -> Generation {
		Generation(self.generation.load(Ordering::Relaxed))
	}

	fn local_node_id(&self) -> u16 {
		self.local
	}
}

/// Manually advanced monotonic clock.
pub struct MockClock(AtomicU64);

impl MockClock {
	pub fn new() -> Arc<Self> {
		Arc::new(MockClock(AtomicU64::new(0)))
	}

	pub fn advance_ms(&self, ms: u64) {
		self.0.fetch_add(ms * 1_000_000, Ordering::Relaxed);
	}

	pub fn advance_us(&self, us: u64) {
		self.0.fetch_add(us * 1_000, Ordering::Relaxed);
	}
}

impl Timebase for MockClock {
	fn monotonic_ns(&self) -> u64 {
		self.0.load(Ordering::Relaxed)
	}
}

pub struct TestRig {
	pub hw: Arc<MockHardware>,
	pub info: Arc<MockBusInfo>,
	pub clock: Arc<MockClock>,
	pub engine: AsyncSubsystem,
}

/// Local node 0xFFC0 (bus 0x3FF, node 0), generation 1, default config.
pub fn rig() -> TestRig {
	rig_with(EngineConfig::default(), 1)
}

pub fn rig_with(config: EngineConfig, generation: u8) -> TestRig {
	let hw = MockHardware::new();
	let info = MockBusInfo::new(0xFFC0, generation);
	let clock = MockClock::new();
	let hw_if: Arc<dyn HardwareInterface> = hw.clone();
	let info_if: Arc<dyn BusInfo> = info.clone();
	let clock_if: Arc<dyn Timebase> = clock.clone();
	let engine =
		AsyncSubsystem::new(hw_if, info_if, clock_if, config).expect("engine construction failed");
	TestRig {
		hw,
		info,
		clock,
		engine,
	}
}

/// Collects `(status, payload)` from a completion callback.
pub type Completions = Arc<Mutex<Vec<(TransactionStatus, Vec<u8>)>>>;

pub fn recorder() -> (Completions, Box<dyn FnOnce(TransactionStatus, &[u8]) + Send>) {
	let record: Completions = Arc::new(Mutex::new(Vec::new()));
	let sink = record.clone();
	let callback = Box::new(move |status: TransactionStatus, payload: &[u8]| {
		sink.lock().unwrap().push((status, payload.to_vec()));
	});
	(record, callback)
}

/// Location of the newest AT chain in a context's ring.
pub struct ChainLocation {
	pub start_addr: u64,
	pub last_addr: u64,
	pub z: u8,
}

pub fn newest_chain(rig: &TestRig, at_request: bool) -> ChainLocation {
	let snap = rig.engine.snapshot();
	let ctx = if at_request { snap.at_request } else { snap.at_response };
	let cap = ctx.descriptor_count as u64;
	let z = u64::from(ctx.prev_last_blocks);
	assert!(z == 2 || z == 3, "no chain submitted yet");
	let start = (u64::from(ctx.tail) + cap - z) % cap;
	let last = if z == 2 { start } else { start + 2 };
	ChainLocation {
		start_addr: ctx.descriptor_device_base + start * 16,
		last_addr: ctx.descriptor_device_base + last * 16,
		z: z as u8,
	}
}

/// Retires the newest AT Request chain with `event` and lets the engine
/// process the completion.
pub fn complete_newest_at_request(rig: &TestRig, event: u8) {
	let chain = newest_chain(rig, true);
	rig.hw
		.write_dma_u32(chain.last_addr + 12, (0x8400 | u32::from(event)) << 16);
	rig.engine.process_at_request_completions();
}

pub fn complete_newest_at_response(rig: &TestRig, event: u8) {
	let chain = newest_chain(rig, false);
	rig.hw
		.write_dma_u32(chain.last_addr + 12, (0x8400 | u32::from(event)) << 16);
	rig.engine.process_at_response_completions();
}

/// Reads the immediate packet header of the newest AT Request chain.
pub fn newest_at_request_header(rig: &TestRig) -> Vec<u8> {
	let chain = newest_chain(rig, true);
	rig.hw.read_dma(chain.start_addr + 16, 16)
}

/// Serializes an AR packet the way the controller deposits it: little-endian
/// quadlets, raw payload, quadlet padding, little-endian trailer.
pub fn ar_packet(header_quadlets: &[u32], payload: &[u8], trailer: u32) -> Vec<u8> {
	let mut bytes = Vec::new();
	for q in header_quadlets {
		bytes.extend_from_slice(&q.to_le_bytes());
	}
	bytes.extend_from_slice(payload);
	while bytes.len() % 4 != 0 {
		bytes.push(0);
	}
	bytes.extend_from_slice(&trailer.to_le_bytes());
	bytes
}

/// An inbound response packet towards our requester.
pub fn response_packet(
	tcode: u8,
	tlabel: u8,
	source_id: u16,
	dest_id: u16,
	rcode: u8,
	q3: Option<u32>,
	payload: &[u8],
) -> Vec<u8> {
	let q0 = (u32::from(dest_id) << 16) | (u32::from(tlabel) << 10) | (1 << 8) | (u32::from(tcode) << 4);
	let q1 = (u32::from(source_id) << 16) | (u32::from(rcode) << 12);
	let mut quadlets = vec![q0, q1, 0];
	if let Some(q3) = q3 {
		quadlets.push(q3);
	}
	ar_packet(&quadlets, payload, 0x8011_0000)
}

/// An inbound request packet addressed at us.
pub fn request_packet(
	tcode: u8,
	tlabel: u8,
	source_id: u16,
	dest_id: u16,
	addr_hi: u16,
	addr_lo: u32,
	q3: Option<u32>,
	payload: &[u8],
) -> Vec<u8> {
	let q0 = (u32::from(dest_id) << 16) | (u32::from(tlabel) << 10) | (1 << 8) | (u32::from(tcode) << 4);
	let q1 = (u32::from(source_id) << 16) | u32::from(addr_hi);
	let mut quadlets = vec![q0, q1, addr_lo];
	if let Some(q3) = q3 {
		quadlets.push(q3);
	}
	ar_packet(&quadlets, payload, 0x8011_0000)
}
