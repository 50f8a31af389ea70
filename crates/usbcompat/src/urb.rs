//! USB Request Blocks
//!
//! A URB is one asynchronous transfer request: target pipe, buffer,
//! completion callback, status, and (for isochronous pipes) a per-packet
//! table. Lifecycle: Idle → Queued (endpoint FIFO) → InFlight (hardware
//! slot) → Completed. A URB is referenced by at most one FIFO or slot at
//! a time; the state field is what enforces it.

use common::Errno;
use std::sync::{Arc, Mutex};

bitflags::bitflags! {
    /// Transfer flags carried by a URB.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UrbFlags: u32 {
        /// A short IN transfer is an error, not a normal completion
        const SHORT_NOT_OK = 0x1;
        /// Start isochronous streaming at the next opportunity
        const ISO_ASAP     = 0x2;
        /// Terminate an OUT transfer with a zero-length packet
        const ZERO_PACKET  = 0x4;
    }
}

/// Transfer type of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Completion status of a URB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    /// Not yet completed
    Pending,
    Ok,
    /// Short IN transfer under `SHORT_NOT_OK`
    Short,
    /// Unlinked before or during flight
    Cancelled,
    /// Endpoint stalled; recover with an explicit clear-halt
    Stall,
    TimedOut,
    /// Underlying device is gone
    NoDevice,
    /// Request exceeded the endpoint's negotiated maximum
    Overflow,
    /// Unclassified hardware error
    Io,
}

impl UrbStatus {
    /// The status a driver-facing synchronous wrapper reports.
    pub fn to_result(self) -> Result<(), Errno> {
        match self {
            UrbStatus::Ok => Ok(()),
            UrbStatus::Pending => Err(Errno::InProgress),
            UrbStatus::Short => Err(Errno::Io),
            UrbStatus::Cancelled => Err(Errno::ConnReset),
            UrbStatus::Stall => Err(Errno::Pipe),
            UrbStatus::TimedOut => Err(Errno::TimedOut),
            UrbStatus::NoDevice => Err(Errno::NoDev),
            UrbStatus::Overflow => Err(Errno::Inval),
            UrbStatus::Io => Err(Errno::Io),
        }
    }
}

/// Lifecycle state; who references the URB right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbState {
    Idle,
    /// Linked into an endpoint's software FIFO
    Queued,
    /// Owned by one of the two hardware slots
    InFlight,
    Completed,
}

/// Control-transfer setup packet.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// One isochronous packet's slice of the URB buffer.
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket {
    pub offset: usize,
    pub length: usize,
    pub actual: usize,
    pub status: UrbStatus,
}

pub type UrbComplete = Arc<dyn Fn(&UrbRef) + Send + Sync>;

/// Shared handle to a URB. The completion callback receives this handle
/// (not a borrow) so it may resubmit the same URB from inside itself.
pub type UrbRef = Arc<Mutex<Urb>>;

pub struct Urb {
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
    pub status: UrbStatus,
    pub flags: UrbFlags,
    /// Polling interval exponent for interrupt/isochronous pipes
    pub interval: u8,
    /// Present on control pipes only
    pub setup: Option<SetupPacket>,
    pub iso_packets: Vec<IsoPacket>,
    pub complete: Option<UrbComplete>,
    pub(crate) state: UrbState,
}

impl Urb {
    pub fn is_in(&self) -> bool {
        match self.kind {
            TransferKind::Control => self.setup.map(|s| s.is_in()).unwrap_or(false),
            _ => self.endpoint & 0x80 != 0,
        }
    }

    pub fn state(&self) -> UrbState {
        self.state
    }

    /// A bulk URB for `endpoint` over `buffer`.
    pub fn bulk(endpoint: u8, buffer: Vec<u8>, complete: Option<UrbComplete>) -> UrbRef {
        Arc::new(Mutex::new(Self {
            endpoint,
            kind: TransferKind::Bulk,
            buffer,
            actual_length: 0,
            status: UrbStatus::Pending,
            flags: UrbFlags::empty(),
            interval: 0,
            setup: None,
            iso_packets: Vec::new(),
            complete,
            state: UrbState::Idle,
        }))
    }

    /// An interrupt URB polled at `interval`.
    pub fn interrupt(
        endpoint: u8,
        buffer: Vec<u8>,
        interval: u8,
        complete: Option<UrbComplete>,
    ) -> UrbRef {
        Arc::new(Mutex::new(Self {
            endpoint,
            kind: TransferKind::Interrupt,
            buffer,
            actual_length: 0,
            status: UrbStatus::Pending,
            flags: UrbFlags::empty(),
            interval,
            setup: None,
            iso_packets: Vec::new(),
            complete,
            state: UrbState::Idle,
        }))
    }

    /// A control URB on the default pipe.
    pub fn control(setup: SetupPacket, buffer: Vec<u8>, complete: Option<UrbComplete>) -> UrbRef {
        Arc::new(Mutex::new(Self {
            endpoint: 0,
            kind: TransferKind::Control,
            buffer,
            actual_length: 0,
            status: UrbStatus::Pending,
            flags: UrbFlags::empty(),
            interval: 0,
            setup: Some(setup),
            iso_packets: Vec::new(),
            complete,
            state: UrbState::Idle,
        }))
    }

    /// An isochronous URB of `packets` packets of `packet_length` bytes,
    /// with the packet table laid out contiguously over the buffer.
    pub fn isochronous(
        endpoint: u8,
        packet_length: usize,
        packets: usize,
        interval: u8,
        complete: Option<UrbComplete>,
    ) -> UrbRef {
        let iso_packets = (0..packets)
            .map(|n| IsoPacket {
                offset: n * packet_length,
                length: packet_length,
                actual: 0,
                status: UrbStatus::Pending,
            })
            .collect();
        Arc::new(Mutex::new(Self {
            endpoint,
            kind: TransferKind::Isochronous,
            buffer: vec![0u8; packet_length * packets],
            actual_length: 0,
            status: UrbStatus::Pending,
            flags: UrbFlags::ISO_ASAP,
            interval,
            setup: None,
            iso_packets,
            complete,
            state: UrbState::Idle,
        }))
    }
}
