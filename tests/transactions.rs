//! End-to-end transaction flows against the mock controller.

mod util;

use firewire_ohci::bus::BusOps;
use firewire_ohci::defs::{
	AsyncHandle, FwAddress, FwSpeed, Generation, LockOp, NodeId, RCode, TransactionStatus,
};
use firewire_ohci::regs;

use util::*;

/// Scenario A: quadlet read of the Config-ROM bus-info block header.
#[test]
fn read_quadlet_of_the_config_rom_header() {
	let rig = rig();
	let (record, callback) = recorder();

	let handle = rig.engine.read_block(
		Generation(1),
		NodeId::new(1),
		FwAddress::CONFIG_ROM,
		4,
		Some(FwSpeed::S100),
		callback,
	);
	assert!(handle.is_valid());

	// One armed context: a single CommandPtr write with Z=2.
	let ptrs = rig.hw.command_ptr_writes(regs::AT_REQUEST_BASE);
	assert_eq!(ptrs.len(), 1);
	assert_eq!(ptrs[0] & 0xF, 2);

	// The immediate header is a 12-byte read-quadlet request.
	let header = newest_at_request_header(&rig);
	let q0 = u32::from_ne_bytes(header[0..4].try_into().unwrap());
	assert_eq!((q0 >> 4) & 0xF, 0x4);
	assert_eq!((q0 >> 16) & 0x7, 0, "S100");
	let label = ((q0 >> 10) & 0x3F) as u8;
	let q1 = u32::from_ne_bytes(header[4..8].try_into().unwrap());
	assert_eq!(q1 >> 16, 0xFFC1);
	assert_eq!(q1 & 0xFFFF, 0xFFFF);
	assert_eq!(u32::from_ne_bytes(header[8..12].try_into().unwrap()), 0xF000_0400);

	// Target acks the request; nothing completes yet.
	complete_newest_at_request(&rig, 0x12);
	assert!(record.lock().unwrap().is_empty());

	// The read response arrives with the BIB header quadlet.
	let pkt = response_packet(0x6, label, 0xFFC1, 0xFFC0, 0, Some(0x0404_EABF), &[]);
	assert_eq!(rig.engine.process_ar_response_stream(&pkt), 1);

	let completions = record.lock().unwrap();
	assert_eq!(completions.len(), 1);
	assert_eq!(completions[0].0, TransactionStatus::Success);
	assert_eq!(completions[0].1, vec![0x04, 0x04, 0xEA, 0xBF]);
	drop(completions);

	let snap = rig.engine.snapshot();
	assert_eq!(snap.transactions_in_flight, 0);
	assert_eq!(snap.labels_in_use, 0);
}

/// Scenario B: 24-byte block write, acked pending, completed by WrResp.
#[test]
fn write_block_completes_on_both_legs() {
	let rig = rig();
	let (record, callback) = recorder();
	let data: Vec<u8> = (0..24u8).collect();

	let handle = rig.engine.write_block(
		Generation(1),
		NodeId::new(2),
		FwAddress::new(0xECC0, 0),
		&data,
		Some(FwSpeed::S400),
		callback,
	);
	assert!(handle.is_valid());

	// Chain has a payload descriptor: Z=3.
	let ptrs = rig.hw.command_ptr_writes(regs::AT_REQUEST_BASE);
	assert_eq!(ptrs.len(), 1);
	assert_eq!(ptrs[0] & 0xF, 3);

	let header = newest_at_request_header(&rig);
	let q0 = u32::from_ne_bytes(header[0..4].try_into().unwrap());
	assert_eq!((q0 >> 4) & 0xF, 0x1);
	let label = ((q0 >> 10) & 0x3F) as u8;
	let q3 = u32::from_ne_bytes(header[12..16].try_into().unwrap());
	assert_eq!(q3, 0x0018_0000);

	// The OUTPUT_LAST descriptor points at a DMA copy of the payload.
	let chain = newest_chain(&rig, true);
	let payload_addr = rig.hw.read_dma_u32(chain.last_addr + 4);
	assert_eq!(rig.hw.read_dma(u64::from(payload_addr), 24), data);

	// ack-pending: not terminal for a block write.
	complete_newest_at_request(&rig, 0x12);
	assert!(record.lock().unwrap().is_empty());

	let pkt = response_packet(0x2, label, 0xFFC2, 0xFFC0, 0, None, &[]);
	rig.engine.process_ar_response_stream(&pkt);

	let completions = record.lock().unwrap();
	assert_eq!(completions.len(), 1);
	assert_eq!(completions[0].0, TransactionStatus::Success);
	assert!(completions[0].1.is_empty());
	drop(completions);
	assert_eq!(rig.engine.snapshot().transactions_in_flight, 0);
}

/// A block write acked complete needs no response leg.
#[test]
fn write_block_acked_complete_is_terminal() {
	let rig = rig();
	let (record, callback) = recorder();
	let data = [0u8; 16];

	rig.engine.write_block(
		Generation(1),
		NodeId::new(2),
		FwAddress::new(0xECC0, 0),
		&data,
		None,
		callback,
	);
	complete_newest_at_request(&rig, 0x11);

	let completions = record.lock().unwrap();
	assert_eq!(completions.len(), 1);
	assert_eq!(completions[0].0, TransactionStatus::Success);
}

/// Scenario C: compare-swap lock returning the old value.
#[test]
fn compare_swap_lock_round_trip() {
	let rig = rig();
	let (record, callback) = recorder();
	let operand = [0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00];

	let handle = rig.engine.lock(
		Generation(1),
		NodeId::new(0x3F),
		FwAddress::new(0xFFFF, 0xF000_0234),
		LockOp::CompareSwap,
		&operand,
		4,
		Some(FwSpeed::S100),
		callback,
	);
	assert!(handle.is_valid());

	let header = newest_at_request_header(&rig);
	let q0 = u32::from_ne_bytes(header[0..4].try_into().unwrap());
	assert_eq!((q0 >> 4) & 0xF, 0x9);
	let label = ((q0 >> 10) & 0x3F) as u8;
	let q3 = u32::from_ne_bytes(header[12..16].try_into().unwrap());
	assert_eq!(q3, 0x0008_0002, "length 8, extended tCode compare-swap");

	complete_newest_at_request(&rig, 0x12);

	let old_value = [0xFF, 0xFF, 0xFF, 0xFF];
	let pkt = response_packet(0xB, label, 0xFFFF, 0xFFC0, 0, Some(0x0004_0002), &old_value);
	rig.engine.process_ar_response_stream(&pkt);

	let completions = record.lock().unwrap();
	assert_eq!(completions.len(), 1);
	assert_eq!(completions[0].0, TransactionStatus::Success);
	assert_eq!(completions[0].1, old_value);
}

/// A response shorter than requested surfaces as a short read.
#[test]
fn short_block_read_is_reported() {
	let rig = rig();
	let (record, callback) = recorder();

	rig.engine.read_block(
		Generation(1),
		NodeId::new(1),
		FwAddress::CONFIG_ROM,
		16,
		None,
		callback,
	);
	let header = newest_at_request_header(&rig);
	let label = ((u32::from_ne_bytes(header[0..4].try_into().unwrap()) >> 10) & 0x3F) as u8;

	complete_newest_at_request(&rig, 0x12);
	let pkt = response_packet(0x7, label, 0xFFC1, 0xFFC0, 0, Some(0x0008_0000), &[1, 2, 3, 4, 5, 6, 7, 8]);
	rig.engine.process_ar_response_stream(&pkt);

	let completions = record.lock().unwrap();
	assert_eq!(completions.len(), 1);
	assert_eq!(completions[0].0, TransactionStatus::ShortRead);
	assert_eq!(completions[0].1, vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

/// Appending to a running context patches the previous chain and wakes the
/// controller instead of rewriting CommandPtr.
#[test]
fn second_submission_appends_with_wake() {
	let rig = rig();
	let (_r1, cb1) = recorder();
	let (_r2, cb2) = recorder();

	rig.engine
		.read_quad(Generation(1), NodeId::new(1), FwAddress::CONFIG_ROM, None, cb1);
	let first = newest_chain(&rig, true);

	rig.engine
		.read_quad(Generation(1), NodeId::new(2), FwAddress::CONFIG_ROM, None, cb2);
	let second = newest_chain(&rig, true);

	assert_eq!(rig.hw.command_ptr_writes(regs::AT_REQUEST_BASE).len(), 1);
	assert_eq!(rig.hw.wake_writes(regs::AT_REQUEST_BASE), 1);

	// The first chain's terminal descriptor now branches to the second.
	let branch = rig.hw.read_dma_u32(first.last_addr + 8);
	assert_eq!(u64::from(branch & 0xFFFF_FFF0), second.start_addr);
	assert_eq!(branch & 0xF, 2);
	let control = rig.hw.read_dma_u32(first.last_addr);
	assert_eq!((control >> 18) & 0x3, 0x3, "branch control patched to always");
}

/// An inbound write request gets a write response on the AT Response
/// context, echoing the requester's label; broadcasts stay unanswered.
#[test]
fn inbound_request_drives_the_response_sender() {
	let rig = rig();
	rig.engine
		.register_request_handler(0x0, Box::new(|_| Some(RCode::Complete)));

	let pkt = request_packet(0x0, 11, 0xFFC2, 0xFFC0, 0xFFFF, 0xF000_0400, Some(0xDEAD_BEEF), &[]);
	assert_eq!(rig.engine.process_ar_request_stream(&pkt), 1);

	let ptrs = rig.hw.command_ptr_writes(regs::AT_RESPONSE_BASE);
	assert_eq!(ptrs.len(), 1, "write response armed the AT Response context");

	let chain = newest_chain(&rig, false);
	let header = rig.hw.read_dma(chain.start_addr + 16, 12);
	let q0 = u32::from_ne_bytes(header[0..4].try_into().unwrap());
	assert_eq!((q0 >> 4) & 0xF, 0x2, "write response tCode");
	assert_eq!((q0 >> 10) & 0x3F, 11, "echoed tLabel");
	let q1 = u32::from_ne_bytes(header[4..8].try_into().unwrap());
	assert_eq!(q1 >> 16, 0xFFC2, "addressed back at the requester");
	assert_eq!((q1 >> 12) & 0xF, u32::from(u8::from(RCode::Complete)));

	// Retire it so the slot drains.
	complete_newest_at_response(&rig, 0x11);
	assert_eq!(rig.engine.snapshot().transactions_in_flight, 0);

	// Broadcast request: suppressed.
	let broadcast = request_packet(0x0, 12, 0xFFC3, 0xFFFF, 0xFFFF, 0xF000_0400, Some(0), &[]);
	rig.engine.process_ar_request_stream(&broadcast);
	assert_eq!(rig.hw.command_ptr_writes(regs::AT_RESPONSE_BASE).len(), 1);
}

/// PHY packets complete on the AT ack alone.
#[test]
fn phy_packet_completes_on_at() {
	let rig = rig();
	let (record, callback) = recorder();

	let handle = rig.engine.send_phy_packet(0x0000_01E0, callback);
	assert!(handle.is_valid());

	let header = newest_at_request_header(&rig);
	// Big-endian control quadlet with tCode 0xE.
	assert_eq!(&header[0..4], &[0x00, 0x00, 0x00, 0xE0]);
	let quadlet = u32::from_ne_bytes(header[4..8].try_into().unwrap());
	let complement = u32::from_ne_bytes(header[8..12].try_into().unwrap());
	assert_eq!(quadlet, 0x0000_01E0);
	assert_eq!(complement, !0x0000_01E0);

	complete_newest_at_request(&rig, 0x11);
	let completions = record.lock().unwrap();
	assert_eq!(completions.len(), 1);
	assert_eq!(completions[0].0, TransactionStatus::Success);
}

/// Cancel claims the transition once; the callback fires exactly once with
/// `Aborted`, even though a completion arrives afterwards.
#[test]
fn cancel_aborts_exactly_once() {
	let rig = rig();
	let (record, callback) = recorder();

	let handle = rig.engine.read_quad(
		Generation(1),
		NodeId::new(1),
		FwAddress::CONFIG_ROM,
		None,
		callback,
	);
	assert!(rig.engine.cancel(handle));
	assert!(!rig.engine.cancel(handle), "second cancel finds no transition");
	assert!(record.lock().unwrap().is_empty(), "callback waits for a pass");

	// The late AT ack observes the aborted slot.
	complete_newest_at_request(&rig, 0x11);
	{
		let completions = record.lock().unwrap();
		assert_eq!(completions.len(), 1);
		assert_eq!(completions[0].0, TransactionStatus::Aborted);
	}

	// Nothing further fires, not even the deadline.
	rig.clock.advance_ms(2000);
	rig.engine.process_timeouts();
	assert_eq!(record.lock().unwrap().len(), 1);
	assert_eq!(rig.engine.snapshot().transactions_in_flight, 0);
}

/// Responses that match no outstanding label are dropped quietly.
#[test]
fn orphan_response_is_discarded() {
	let rig = rig();
	let pkt = response_packet(0x6, 17, 0xFFC1, 0xFFC0, 0, Some(0), &[]);
	assert_eq!(rig.engine.process_ar_response_stream(&pkt), 1);
	assert_eq!(rig.engine.snapshot().transactions_in_flight, 0);
}

/// The AR Response DMA path: a packet deposited in a receive buffer is
/// routed once the descriptor retires, and the buffer is recycled.
#[test]
fn ar_dma_buffer_delivery_and_recycle() {
	let rig = rig();
	rig.engine.start();
	let (record, callback) = recorder();

	rig.engine
		.read_quad(Generation(1), NodeId::new(1), FwAddress::CONFIG_ROM, None, callback);
	let header = newest_at_request_header(&rig);
	let label = ((u32::from_ne_bytes(header[0..4].try_into().unwrap()) >> 10) & 0x3F) as u8;
	complete_newest_at_request(&rig, 0x12);

	let snap = rig.engine.snapshot();
	let pkt = response_packet(0x6, label, 0xFFC1, 0xFFC0, 0, Some(0x1234_5678), &[]);
	rig.hw.write_dma(snap.ar_response_buffers.device_base, &pkt);

	// Retire the first INPUT_MORE descriptor: status written, resCount
	// reduced by the packet size.
	let desc0 = snap.ar_response.descriptor_device_base;
	let res_count = snap.ar_response_buffers.buffer_len - pkt.len() as u32;
	rig.hw.write_dma_u32(desc0 + 12, (0x8011 << 16) | res_count);
	rig.engine.process_ar_response();

	let completions = record.lock().unwrap();
	assert_eq!(completions.len(), 1);
	assert_eq!(completions[0].0, TransactionStatus::Success);
	assert_eq!(completions[0].1, 0x1234_5678u32.to_be_bytes());
	drop(completions);

	// Recycled: full residual count, status cleared.
	assert_eq!(rig.hw.read_dma_u32(desc0 + 12), snap.ar_response_buffers.buffer_len);
}

/// Invalid parameters are rejected synchronously with no side effects.
#[test]
fn invalid_lengths_return_the_invalid_handle() {
	let rig = rig();
	let writes_before = rig.hw.register_write_count();

	let (_r, cb) = recorder();
	let h = rig.engine.read_block(
		Generation(1),
		NodeId::new(1),
		FwAddress::CONFIG_ROM,
		0,
		None,
		cb,
	);
	assert_eq!(h, AsyncHandle::INVALID);

	let (_r, cb) = recorder();
	let h = rig
		.engine
		.write_block(Generation(1), NodeId::new(1), FwAddress::CONFIG_ROM, &[], None, cb);
	assert_eq!(h, AsyncHandle::INVALID);

	let (_r, cb) = recorder();
	let h = rig.engine.lock(
		Generation(1),
		NodeId::new(1),
		FwAddress::CONFIG_ROM,
		LockOp::CompareSwap,
		&[1, 2, 3],
		4,
		None,
		cb,
	);
	assert_eq!(h, AsyncHandle::INVALID);

	assert_eq!(rig.hw.register_write_count(), writes_before);
	assert_eq!(rig.engine.snapshot().transactions_in_flight, 0);
}
