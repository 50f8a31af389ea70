//! Per-endpoint transfer engine
//!
//! Each active endpoint owns a software FIFO of queued URBs and exactly
//! two hardware transfer slots, created lazily on the first submission.
//! A slot always pulls the next queued URB in FIFO order, so completions
//! preserve submission order within an endpoint. Completion callbacks run
//! with the giant lock dropped; a thread-local no-resubmit guard keeps a
//! resubmit from inside a completion from recursing into the slot kick.
//!
//! The backend exposes synchronous transfers only, so a slot executes its
//! URB in bounded time slices with a stop flag checked in between; that
//! bounds how long an unlink can lag behind an in-flight transfer.

use crate::tree::{UsbHostEndpoint, UsbSpeed};
use crate::urb::{SetupPacket, TransferKind, UrbFlags, UrbRef, UrbState, UrbStatus};
use bytes::BytesMut;
use common::{Errno, UsbSettings};
use kcore::{GiantLock, WaitQueue};
use rusb::{Context, DeviceHandle};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Hardware transfer slots per endpoint.
pub const SLOTS_PER_ENDPOINT: usize = 2;

/// Fixed buffer ceiling for control slots: the largest wLength plus the
/// 8-byte setup header.
const CONTROL_SLOT_CAPACITY: usize = 64 * 1024 + 8;

/// Bulk/interrupt floor at high speed and above.
const FLOOR_HIGH_SPEED: usize = 16 * 1024;

/// Bulk/interrupt floor for full-speed pipes and interrupt pipes.
const FLOOR_FULL_SPEED_OR_INTERRUPT: usize = 4096;

/// Maximum interval-exponent shift applied when deriving the per-frame
/// interval.
const MAX_INTERVAL_SHIFT: u32 = 3;

thread_local! {
    static COMPLETION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the calling thread is inside a completion callback.
fn in_completion() -> bool {
    COMPLETION_DEPTH.with(|d| d.get()) > 0
}

struct CompletionScope;

impl CompletionScope {
    fn enter() -> Self {
        COMPLETION_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for CompletionScope {
    fn drop(&mut self) {
        COMPLETION_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Per-frame interval in microseconds for a periodic endpoint, derived
/// from the negotiated speed and the descriptor interval exponent
/// (clamped to a shift of [`MAX_INTERVAL_SHIFT`]).
pub fn frame_interval_us(speed: UsbSpeed, interval: u8) -> u64 {
    let shift = u32::from(interval.saturating_sub(1)).min(MAX_INTERVAL_SHIFT);
    if speed >= UsbSpeed::High {
        // Microframes
        125u64 << shift
    } else {
        1000u64 << shift
    }
}

/// Frames buffered per isochronous slot for the configured latency target.
pub fn iso_frame_count(speed: UsbSpeed, interval: u8, latency_ms: u64) -> usize {
    let per_frame = frame_interval_us(speed, interval);
    ((latency_ms * 1000) / per_frame).max(1) as usize
}

/// Buffer bytes allocated to each of an endpoint's two slots.
pub fn slot_capacity(
    kind: TransferKind,
    speed: UsbSpeed,
    max_packet: usize,
    requested: usize,
    settings: &UsbSettings,
) -> usize {
    match kind {
        TransferKind::Control => CONTROL_SLOT_CAPACITY,
        TransferKind::Isochronous => {
            iso_frame_count(speed, 1, settings.iso_latency_ms).max(1) * max_packet.max(1)
        }
        TransferKind::Bulk | TransferKind::Interrupt => {
            let floor = if speed >= UsbSpeed::High {
                FLOOR_HIGH_SPEED
            } else if kind == TransferKind::Interrupt || speed == UsbSpeed::Full {
                FLOOR_FULL_SPEED_OR_INTERRUPT
            } else {
                0
            };
            requested.max(floor)
        }
    }
}

struct ActiveXfer {
    urb: UrbRef,
    seq: u64,
    stop: Arc<AtomicBool>,
}

#[derive(Default)]
struct Slot {
    buf: BytesMut,
    active: Option<ActiveXfer>,
}

#[derive(Default)]
struct EpState {
    fifo: VecDeque<UrbRef>,
    slots: [Slot; SLOTS_PER_ENDPOINT],
    next_seq: u64,
    shutdown: bool,
}

struct EpShared {
    lock: Arc<GiantLock>,
    address: u8,
    kind: TransferKind,
    max_packet: usize,
    capacity: usize,
    frame_us: u64,
    slice: Duration,
    handle: Option<Arc<DeviceHandle<Context>>>,
    state: Mutex<EpState>,
    work: WaitQueue,
}

/// One endpoint's FIFO, slot pair, and pump thread.
pub struct EndpointEngine {
    shared: Arc<EpShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointEngine {
    /// Set up the endpoint: allocate the two slot buffers and, when a
    /// backend handle is present, start the pump.
    pub fn new(
        lock: Arc<GiantLock>,
        handle: Option<Arc<DeviceHandle<Context>>>,
        descriptor: &UsbHostEndpoint,
        speed: UsbSpeed,
        requested: usize,
        settings: &UsbSettings,
    ) -> Self {
        let capacity = slot_capacity(
            descriptor.kind,
            speed,
            descriptor.max_packet_size as usize,
            requested,
            settings,
        );
        let mut state = EpState::default();
        for slot in state.slots.iter_mut() {
            slot.buf = BytesMut::zeroed(capacity);
        }

        let shared = Arc::new(EpShared {
            lock,
            address: descriptor.address,
            kind: descriptor.kind,
            max_packet: descriptor.max_packet_size as usize,
            capacity,
            frame_us: frame_interval_us(speed, descriptor.interval),
            slice: Duration::from_millis(settings.transfer_slice_ms.max(1)),
            handle,
            state: Mutex::new(state),
            work: WaitQueue::new(),
        });

        let pump = shared.handle.as_ref().map(|_| {
            let pump_shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("ep{:02x}-pump", shared.address))
                .spawn(move || pump_loop(pump_shared))
                .expect("spawn endpoint pump")
        });

        debug!(
            "endpoint {:02x} set up: {:?}, {} byte slots",
            shared.address, shared.kind, capacity
        );
        Self {
            shared,
            pump: Mutex::new(pump),
        }
    }

    /// Queue a URB and kick the slots.
    ///
    /// A request longer than the slot capacity never reaches hardware: it
    /// is failed fast with an error completion. Kicking is suppressed
    /// when the caller is itself inside a completion callback; the pump
    /// picks the work up instead.
    pub fn submit(&self, urb: &UrbRef) -> Result<(), Errno> {
        let shared = &self.shared;
        shared.lock.lock();

        let (length, resubmittable, is_control_without_setup) = {
            let u = urb.lock().unwrap();
            (
                u.buffer.len(),
                matches!(u.state, UrbState::Idle | UrbState::Completed),
                u.kind == TransferKind::Control && u.setup.is_none(),
            )
        };
        if !resubmittable {
            shared.lock.unlock();
            return Err(Errno::Busy);
        }
        if is_control_without_setup {
            shared.lock.unlock();
            return Err(Errno::Inval);
        }
        if length > shared.capacity {
            warn!(
                "oversize request on endpoint {:02x}: {} > {}",
                shared.address, length, shared.capacity
            );
            deliver_synthetic(shared, urb, UrbStatus::Overflow, false);
            shared.lock.unlock();
            return Ok(());
        }

        {
            let mut u = urb.lock().unwrap();
            u.status = UrbStatus::Pending;
            u.actual_length = 0;
            u.state = UrbState::Queued;
        }
        shared.state.lock().unwrap().fifo.push_back(urb.clone());
        trace!("urb queued on endpoint {:02x}", shared.address);

        if !in_completion() {
            kick_slots(shared);
        }
        shared.lock.wake_all(&shared.work);
        shared.lock.unlock();
        Ok(())
    }

    /// Unlink a URB.
    ///
    /// Still only in the software FIFO: unlink it and synchronously
    /// deliver a cancelled completion before returning. Already owned by
    /// a hardware slot: request early termination of that slot, and with
    /// `drain`, spin (yielding, lock dropped) until the slot no longer
    /// identifies this exact URB.
    pub fn unlink(&self, urb: &UrbRef, drain: bool) {
        let shared = &self.shared;
        shared.lock.lock();

        let was_queued = {
            let mut st = shared.state.lock().unwrap();
            match st.fifo.iter().position(|q| Arc::ptr_eq(q, urb)) {
                Some(pos) => {
                    st.fifo.remove(pos);
                    true
                }
                None => false,
            }
        };
        if was_queued {
            deliver_synthetic(shared, urb, UrbStatus::Cancelled, true);
            shared.lock.unlock();
            return;
        }

        {
            let st = shared.state.lock().unwrap();
            for slot in st.slots.iter() {
                if let Some(active) = &slot.active {
                    if Arc::ptr_eq(&active.urb, urb) {
                        active.stop.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
        shared.lock.wake_all(&shared.work);

        if drain {
            while slot_holds(shared, urb) {
                shared.lock.yield_unlocked();
            }
        }
        shared.lock.unlock();
    }

    /// Tear the endpoint down: close both slots, implicitly cancelling
    /// anything in flight, and flush the FIFO with cancelled completions.
    ///
    /// The caller must not hold the giant lock.
    pub fn close(&self) {
        let shared = &self.shared;
        shared.lock.lock();
        {
            let st = shared.state.lock().unwrap();
            for slot in st.slots.iter() {
                if let Some(active) = &slot.active {
                    active.stop.store(true, Ordering::SeqCst);
                }
            }
        }
        shared.state.lock().unwrap().shutdown = true;
        shared.lock.wake_all(&shared.work);
        shared.lock.unlock();

        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.join();
        }

        shared.lock.lock();
        let leftover: Vec<UrbRef> = shared.state.lock().unwrap().fifo.drain(..).collect();
        for urb in &leftover {
            deliver_synthetic(shared, urb, UrbStatus::Cancelled, true);
        }
        shared.lock.unlock();
        debug!("endpoint {:02x} closed", shared.address);
    }

    /// URBs waiting in the software FIFO.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().fifo.len()
    }

    /// Whether either slot currently owns `urb`.
    pub fn holds(&self, urb: &UrbRef) -> bool {
        slot_holds(&self.shared, urb)
    }

    #[cfg(test)]
    fn queue_only_for_test(&self, urb: &UrbRef) {
        self.shared.lock.lock();
        urb.lock().unwrap().state = UrbState::Queued;
        self.shared.state.lock().unwrap().fifo.push_back(urb.clone());
        self.shared.lock.unlock();
    }
}

fn slot_holds(shared: &EpShared, urb: &UrbRef) -> bool {
    let st = shared.state.lock().unwrap();
    st.slots.iter().any(|slot| {
        slot.active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.urb, urb))
    })
}

/// Pull queued URBs into idle slots, FIFO order. Giant lock held.
fn kick_slots(shared: &EpShared) {
    let mut guard = shared.state.lock().unwrap();
    let state = &mut *guard;
    if state.shutdown {
        return;
    }
    for slot in state.slots.iter_mut() {
        if slot.active.is_some() {
            continue;
        }
        let Some(urb) = state.fifo.pop_front() else {
            break;
        };
        urb.lock().unwrap().state = UrbState::InFlight;
        let seq = state.next_seq;
        state.next_seq += 1;
        slot.active = Some(ActiveXfer {
            urb,
            seq,
            stop: Arc::new(AtomicBool::new(false)),
        });
    }
}

/// Deliver a completion that never touched hardware. Giant lock held;
/// the callback itself runs with it dropped.
fn deliver_synthetic(shared: &EpShared, urb: &UrbRef, status: UrbStatus, zero_iso_lengths: bool) {
    let callback = {
        let mut u = urb.lock().unwrap();
        u.status = status;
        u.actual_length = 0;
        for packet in u.iso_packets.iter_mut() {
            packet.actual = 0;
            packet.status = status;
            if zero_iso_lengths {
                packet.length = 0;
            }
        }
        u.state = UrbState::Completed;
        u.complete.clone()
    };
    if let Some(callback) = callback {
        let _scope = CompletionScope::enter();
        shared.lock.unlocked(|| callback(urb));
    }
}

/// What a slot execution needs once the lock is dropped.
struct XferParams {
    kind: TransferKind,
    endpoint: u8,
    is_in: bool,
    length: usize,
    max_packet: usize,
    out_data: Vec<u8>,
    setup: Option<SetupPacket>,
    iso: Vec<(usize, usize)>,
    zero_packet: bool,
    short_not_ok: bool,
}

fn extract_params(shared: &EpShared, urb: &UrbRef) -> XferParams {
    let u = urb.lock().unwrap();
    XferParams {
        kind: u.kind,
        endpoint: u.endpoint,
        is_in: u.is_in(),
        length: u.buffer.len(),
        max_packet: shared.max_packet,
        out_data: if u.is_in() { Vec::new() } else { u.buffer.clone() },
        setup: u.setup,
        iso: u.iso_packets.iter().map(|p| (p.offset, p.length)).collect(),
        zero_packet: u.flags.contains(UrbFlags::ZERO_PACKET),
        short_not_ok: u.flags.contains(UrbFlags::SHORT_NOT_OK),
    }
}

/// Result of one slot execution.
struct XferOutcome {
    status: UrbStatus,
    actual: usize,
    iso: Vec<(usize, UrbStatus)>,
}

impl XferOutcome {
    fn cancelled() -> Self {
        Self {
            status: UrbStatus::Cancelled,
            actual: 0,
            iso: Vec::new(),
        }
    }
}

fn pump_loop(shared: Arc<EpShared>) {
    let handle = shared
        .handle
        .clone()
        .expect("endpoint pump without a backend handle");

    shared.lock.lock();
    loop {
        let next = {
            let st = shared.state.lock().unwrap();
            let mut best: Option<(usize, u64)> = None;
            for (index, slot) in st.slots.iter().enumerate() {
                if let Some(active) = &slot.active {
                    if best.is_none_or(|(_, seq)| active.seq < seq) {
                        best = Some((index, active.seq));
                    }
                }
            }
            match best {
                Some((index, _)) => {
                    let active = st.slots[index].active.as_ref().unwrap();
                    Some((index, active.urb.clone(), active.stop.clone()))
                }
                None if st.shutdown => None,
                None => {
                    drop(st);
                    shared.lock.wait_event(&shared.work, || {
                        let st = shared.state.lock().unwrap();
                        st.shutdown || st.slots.iter().any(|s| s.active.is_some())
                    });
                    continue;
                }
            }
        };
        let Some((index, urb, stop)) = next else {
            break;
        };

        let shutting = shared.state.lock().unwrap().shutdown;
        let mut buf = std::mem::take(&mut shared.state.lock().unwrap().slots[index].buf);
        let params = extract_params(&shared, &urb);

        let outcome = if shutting || stop.load(Ordering::SeqCst) {
            XferOutcome::cancelled()
        } else {
            shared.lock.unlocked(|| {
                run_transfer(
                    &handle,
                    &params,
                    &mut buf,
                    &stop,
                    shared.slice,
                    shared.frame_us,
                )
            })
        };

        finish_slot(&shared, index, &urb, &params, outcome, buf);
    }
    shared.lock.unlock();
    trace!("endpoint {:02x} pump stopped", shared.address);
}

/// Write results back into the URB, free the slot, deliver the
/// completion (lock dropped), then pull the next queued URB in.
fn finish_slot(
    shared: &Arc<EpShared>,
    index: usize,
    urb: &UrbRef,
    params: &XferParams,
    outcome: XferOutcome,
    buf: BytesMut,
) {
    let callback = {
        let mut u = urb.lock().unwrap();
        let mut status = outcome.status;

        if params.is_in && outcome.actual > 0 {
            match params.kind {
                TransferKind::Isochronous => {
                    // Packet payloads land at their offsets in the slot
                    // buffer; copy the whole spanned region in one go.
                    let span = u.buffer.len().min(buf.len());
                    u.buffer[..span].copy_from_slice(&buf[..span]);
                }
                _ => {
                    let n = outcome.actual.min(u.buffer.len()).min(buf.len());
                    u.buffer[..n].copy_from_slice(&buf[..n]);
                }
            }
        }

        u.actual_length = outcome.actual;
        for (packet, (actual, packet_status)) in
            u.iso_packets.iter_mut().zip(outcome.iso.iter())
        {
            packet.actual = *actual;
            packet.status = *packet_status;
        }

        if status == UrbStatus::Ok
            && params.short_not_ok
            && params.is_in
            && outcome.actual < params.length
        {
            status = UrbStatus::Short;
        }

        u.status = status;
        u.state = UrbState::Completed;
        u.complete.clone()
    };

    {
        let mut guard = shared.state.lock().unwrap();
        let state = &mut *guard;
        state.slots[index].buf = buf;
        state.slots[index].active = None;
    }

    if let Some(callback) = callback {
        let _scope = CompletionScope::enter();
        shared.lock.unlocked(|| callback(urb));
    }

    // The now-idle slot immediately pulls the next queued URB
    kick_slots(shared);
}

fn map_transfer_status(error: rusb::Error) -> UrbStatus {
    match error {
        rusb::Error::Timeout => UrbStatus::TimedOut,
        rusb::Error::Pipe => UrbStatus::Stall,
        rusb::Error::NoDevice => UrbStatus::NoDevice,
        rusb::Error::Interrupted => UrbStatus::Cancelled,
        rusb::Error::Overflow => UrbStatus::Overflow,
        _ => UrbStatus::Io,
    }
}

/// Execute one URB against the backend. Runs with the giant lock
/// dropped; only `buf` and the stop flag are shared with the submitter.
fn run_transfer(
    handle: &DeviceHandle<Context>,
    params: &XferParams,
    buf: &mut BytesMut,
    stop: &AtomicBool,
    slice: Duration,
    frame_us: u64,
) -> XferOutcome {
    match params.kind {
        TransferKind::Control => run_control(handle, params, buf, stop, slice),
        TransferKind::Bulk | TransferKind::Interrupt => {
            run_stream(handle, params, buf, stop, slice)
        }
        TransferKind::Isochronous => run_iso(handle, params, buf, stop, frame_us),
    }
}

fn run_control(
    handle: &DeviceHandle<Context>,
    params: &XferParams,
    buf: &mut BytesMut,
    stop: &AtomicBool,
    slice: Duration,
) -> XferOutcome {
    let setup = params.setup.expect("control urb without setup");
    let length = (setup.length as usize).min(buf.len());

    loop {
        if stop.load(Ordering::SeqCst) {
            return XferOutcome::cancelled();
        }
        let result = if setup.is_in() {
            handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut buf[..length],
                slice,
            )
        } else {
            handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &params.out_data,
                slice,
            )
        };
        match result {
            Ok(n) => {
                return XferOutcome {
                    status: UrbStatus::Ok,
                    actual: n,
                    iso: Vec::new(),
                };
            }
            Err(rusb::Error::Timeout) => continue,
            Err(error) => {
                return XferOutcome {
                    status: map_transfer_status(error),
                    actual: 0,
                    iso: Vec::new(),
                };
            }
        }
    }
}

fn run_stream(
    handle: &DeviceHandle<Context>,
    params: &XferParams,
    buf: &mut BytesMut,
    stop: &AtomicBool,
    slice: Duration,
) -> XferOutcome {
    let done = |status, actual| XferOutcome {
        status,
        actual,
        iso: Vec::new(),
    };

    if params.is_in {
        let length = params.length.min(buf.len());
        loop {
            if stop.load(Ordering::SeqCst) {
                return done(UrbStatus::Cancelled, 0);
            }
            let result = match params.kind {
                TransferKind::Bulk => handle.read_bulk(params.endpoint, &mut buf[..length], slice),
                _ => handle.read_interrupt(params.endpoint, &mut buf[..length], slice),
            };
            match result {
                Ok(n) => return done(UrbStatus::Ok, n),
                Err(rusb::Error::Timeout) => continue,
                Err(error) => return done(map_transfer_status(error), 0),
            }
        }
    } else {
        let mut written = 0;
        while written < params.out_data.len() {
            if stop.load(Ordering::SeqCst) {
                return done(UrbStatus::Cancelled, written);
            }
            let result = match params.kind {
                TransferKind::Bulk => {
                    handle.write_bulk(params.endpoint, &params.out_data[written..], slice)
                }
                _ => handle.write_interrupt(params.endpoint, &params.out_data[written..], slice),
            };
            match result {
                Ok(n) => written += n,
                Err(rusb::Error::Timeout) => continue,
                Err(error) => return done(map_transfer_status(error), written),
            }
        }
        // A transfer that fills a whole number of packets may need an
        // explicit zero-length terminator
        if params.zero_packet
            && written > 0
            && params.max_packet > 0
            && written % params.max_packet == 0
        {
            let _ = handle.write_bulk(params.endpoint, &[], slice);
        }
        done(UrbStatus::Ok, written)
    }
}

/// Isochronous execution over the synchronous backend: one attempt per
/// packet, paced by the derived frame interval. A timed-out packet is a
/// benign zero-length success, matching isochronous semantics.
fn run_iso(
    handle: &DeviceHandle<Context>,
    params: &XferParams,
    buf: &mut BytesMut,
    stop: &AtomicBool,
    frame_us: u64,
) -> XferOutcome {
    let frame = Duration::from_micros(frame_us.max(1000));
    let mut iso = Vec::with_capacity(params.iso.len());
    let mut total = 0usize;
    let mut status = UrbStatus::Ok;

    for (offset, length) in &params.iso {
        if stop.load(Ordering::SeqCst) {
            status = UrbStatus::Cancelled;
            break;
        }
        let end = (*offset + *length).min(buf.len());
        if end <= *offset {
            iso.push((0, UrbStatus::Ok));
            continue;
        }
        let result = if params.is_in {
            handle.read_interrupt(params.endpoint, &mut buf[*offset..end], frame)
        } else {
            handle.write_interrupt(params.endpoint, &params.out_data[*offset..end], frame)
        };
        match result {
            Ok(n) => {
                iso.push((n, UrbStatus::Ok));
                total += n;
            }
            Err(rusb::Error::Timeout) => iso.push((0, UrbStatus::Ok)),
            Err(rusb::Error::Pipe) => {
                iso.push((0, UrbStatus::Stall));
                status = UrbStatus::Stall;
                break;
            }
            Err(rusb::Error::NoDevice) => {
                status = UrbStatus::NoDevice;
                break;
            }
            Err(error) => {
                warn!("isochronous packet error: {}", error);
                iso.push((0, UrbStatus::Io));
            }
        }
    }

    while iso.len() < params.iso.len() {
        iso.push((0, status));
    }
    XferOutcome {
        status,
        actual: total,
        iso,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urb::Urb;
    use std::sync::atomic::AtomicUsize;

    fn endpoint_desc(kind: TransferKind, address: u8, max_packet: u16) -> UsbHostEndpoint {
        UsbHostEndpoint {
            address,
            kind,
            max_packet_size: max_packet,
            interval: 1,
        }
    }

    fn engine(kind: TransferKind, address: u8) -> EndpointEngine {
        EndpointEngine::new(
            Arc::new(GiantLock::new()),
            None,
            &endpoint_desc(kind, address, 512),
            UsbSpeed::High,
            4096,
            &UsbSettings::default(),
        )
    }

    #[test]
    fn test_frame_interval_derivation() {
        // High speed counts microframes; the exponent shift saturates at 3
        assert_eq!(frame_interval_us(UsbSpeed::High, 1), 125);
        assert_eq!(frame_interval_us(UsbSpeed::High, 4), 1000);
        assert_eq!(frame_interval_us(UsbSpeed::High, 10), 1000);
        // Full speed counts whole frames
        assert_eq!(frame_interval_us(UsbSpeed::Full, 1), 1000);
        assert_eq!(frame_interval_us(UsbSpeed::Full, 3), 4000);
    }

    #[test]
    fn test_iso_frame_count_latency_target() {
        // 30 ms of 125 us microframes
        assert_eq!(iso_frame_count(UsbSpeed::High, 1, 30), 240);
        // 30 ms of 1 ms frames
        assert_eq!(iso_frame_count(UsbSpeed::Full, 1, 30), 30);
        // Never zero
        assert_eq!(iso_frame_count(UsbSpeed::Full, 10, 1), 1);
    }

    #[test]
    fn test_slot_capacity_policy() {
        let settings = UsbSettings::default();
        assert_eq!(
            slot_capacity(TransferKind::Control, UsbSpeed::High, 64, 0, &settings),
            CONTROL_SLOT_CAPACITY
        );
        // Bulk at high speed: floor dominates small requests
        assert_eq!(
            slot_capacity(TransferKind::Bulk, UsbSpeed::High, 512, 1024, &settings),
            FLOOR_HIGH_SPEED
        );
        assert_eq!(
            slot_capacity(TransferKind::Bulk, UsbSpeed::High, 512, 65536, &settings),
            65536
        );
        // Full-speed bulk and any interrupt share the smaller floor
        assert_eq!(
            slot_capacity(TransferKind::Bulk, UsbSpeed::Full, 64, 64, &settings),
            FLOOR_FULL_SPEED_OR_INTERRUPT
        );
        assert_eq!(
            slot_capacity(TransferKind::Interrupt, UsbSpeed::Low, 8, 8, &settings),
            FLOOR_FULL_SPEED_OR_INTERRUPT
        );
        // Low-speed bulk has no floor
        assert_eq!(
            slot_capacity(TransferKind::Bulk, UsbSpeed::Low, 8, 64, &settings),
            64
        );
        // Isochronous sizes by latency target
        assert_eq!(
            slot_capacity(TransferKind::Isochronous, UsbSpeed::High, 1024, 0, &settings),
            240 * 1024
        );
    }

    #[test]
    fn test_unlink_from_fifo_synthesizes_cancelled_completion() {
        let engine = engine(TransferKind::Isochronous, 0x82);
        let completions = Arc::new(AtomicUsize::new(0));

        let seen = completions.clone();
        let urb = Urb::isochronous(
            0x82,
            512,
            4,
            1,
            Some(Arc::new(move |urb: &UrbRef| {
                let u = urb.lock().unwrap();
                assert_eq!(u.status, UrbStatus::Cancelled);
                assert_eq!(u.actual_length, 0);
                for packet in &u.iso_packets {
                    assert_eq!(packet.actual, 0);
                    assert_eq!(packet.length, 0);
                    assert_eq!(packet.status, UrbStatus::Cancelled);
                }
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );

        engine.queue_only_for_test(&urb);
        assert_eq!(engine.queued(), 1);

        // Synchronous: the completion has run before unlink returns
        engine.unlink(&urb, false);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(engine.queued(), 0);
        assert_eq!(urb.lock().unwrap().state(), UrbState::Completed);
    }

    #[test]
    fn test_unlink_of_unknown_urb_is_noop() {
        let engine = engine(TransferKind::Bulk, 0x81);
        let urb = Urb::bulk(0x81, vec![0; 64], None);
        engine.unlink(&urb, false);
        assert_eq!(urb.lock().unwrap().status, UrbStatus::Pending);
    }

    #[test]
    fn test_oversize_submit_fails_fast() {
        let engine = engine(TransferKind::Bulk, 0x81);
        let completions = Arc::new(AtomicUsize::new(0));
        let seen = completions.clone();

        // Slot capacity for this engine is FLOOR_HIGH_SPEED
        let urb = Urb::bulk(
            0x81,
            vec![0; FLOOR_HIGH_SPEED + 1],
            Some(Arc::new(move |urb: &UrbRef| {
                assert_eq!(urb.lock().unwrap().status, UrbStatus::Overflow);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );

        engine.submit(&urb).unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        // Never queued, never handed to a slot
        assert_eq!(engine.queued(), 0);
        assert!(!engine.holds(&urb));
    }

    #[test]
    fn test_double_submit_rejected_while_linked() {
        let engine = engine(TransferKind::Bulk, 0x01);
        let urb = Urb::bulk(0x01, vec![0; 64], None);
        engine.queue_only_for_test(&urb);
        assert_eq!(engine.submit(&urb).err(), Some(Errno::Busy));
    }

    #[test]
    fn test_control_without_setup_rejected() {
        let engine = engine(TransferKind::Control, 0x00);
        let urb = Urb::bulk(0x00, vec![0; 8], None);
        {
            let mut u = urb.lock().unwrap();
            u.kind = TransferKind::Control;
        }
        assert_eq!(engine.submit(&urb).err(), Some(Errno::Inval));
    }

    #[test]
    fn test_close_flushes_fifo_with_cancellations() {
        let engine = engine(TransferKind::Bulk, 0x81);
        let completions = Arc::new(AtomicUsize::new(0));

        let mut urbs = Vec::new();
        for _ in 0..3 {
            let seen = completions.clone();
            let urb = Urb::bulk(
                0x81,
                vec![0; 64],
                Some(Arc::new(move |urb: &UrbRef| {
                    assert_eq!(urb.lock().unwrap().status, UrbStatus::Cancelled);
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            );
            engine.queue_only_for_test(&urb);
            urbs.push(urb);
        }

        engine.close();
        assert_eq!(completions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_resubmit_from_completion_does_not_recurse() {
        // An unlink-synthesized completion resubmits its own URB; the
        // no-resubmit guard must keep that from kicking the slots, so
        // the URB lands back in the FIFO and submit returns cleanly.
        let engine = Arc::new(engine(TransferKind::Bulk, 0x81));
        let resubmitted = Arc::new(AtomicUsize::new(0));

        let engine_for_cb = engine.clone();
        let counter = resubmitted.clone();
        let urb = Urb::bulk(
            0x81,
            vec![0; 64],
            Some(Arc::new(move |urb: &UrbRef| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    engine_for_cb.submit(urb).unwrap();
                }
            })),
        );

        engine.queue_only_for_test(&urb);
        engine.unlink(&urb, false);

        assert_eq!(resubmitted.load(Ordering::SeqCst), 1);
        assert_eq!(engine.queued(), 1);
        assert_eq!(urb.lock().unwrap().state(), UrbState::Queued);
    }

    #[test]
    fn test_iso_packet_zeroing_on_cancel() {
        let engine = engine(TransferKind::Isochronous, 0x82);
        let urb = Urb::isochronous(0x82, 256, 8, 1, None);
        {
            // Simulate a partially filled packet table from an earlier run
            let mut u = urb.lock().unwrap();
            u.iso_packets[2].actual = 100;
        }
        engine.queue_only_for_test(&urb);
        engine.unlink(&urb, false);

        let u = urb.lock().unwrap();
        assert!(u.iso_packets.iter().all(|p| p.actual == 0 && p.length == 0));
    }
}
