//! USB compatibility shim
//!
//! Presents the asynchronous USB Request Block (URB) API that hosted
//! drivers were written against, bridged onto the native transfer
//! facility. An attached device carries an in-memory mirror of its
//! enumerated descriptor tree; each endpoint manages a software FIFO of
//! queued URBs drained through exactly two hardware transfer slots
//! ("double buffering"), so one slot can be refilled while the other is
//! in flight.

pub mod endpoint;
pub mod ids;
pub mod pump;
pub mod shim;
pub mod tree;
pub mod urb;

pub use endpoint::{EndpointEngine, SLOTS_PER_ENDPOINT, frame_interval_us, iso_frame_count, slot_capacity};
pub use ids::{MatchFlags, UsbDeviceId, filter_allows, match_interface};
pub use shim::{AttachedDevice, UsbCompat, map_usb_error};
pub use tree::{
    InterfaceAssociation, UsbDevice, UsbHostEndpoint, UsbHostInterface, UsbInterface, UsbSpeed,
};
pub use urb::{IsoPacket, SetupPacket, TransferKind, Urb, UrbFlags, UrbRef, UrbState, UrbStatus};
