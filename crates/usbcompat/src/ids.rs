//! Driver match tables
//!
//! A driver declares an ordered table of match entries; the first entry
//! whose populated fields all hold claims the interface. A device whose
//! device class is vendor-specific is never claimed through interface
//! fields alone: the entry must also pin vendor and product, so a
//! generic interface-class driver cannot silently grab an unrelated
//! vendor-specific composite device.

use crate::tree::{UsbDevice, UsbHostInterface};

/// Vendor-specific device class code.
pub const CLASS_VENDOR_SPEC: u8 = 0xff;

bitflags::bitflags! {
    /// Which fields of a [`UsbDeviceId`] participate in matching.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MatchFlags: u16 {
        const VENDOR       = 0x0001;
        const PRODUCT      = 0x0002;
        const DEV_LO       = 0x0004;
        const DEV_HI       = 0x0008;
        const DEV_CLASS    = 0x0010;
        const DEV_SUBCLASS = 0x0020;
        const DEV_PROTOCOL = 0x0040;
        const INT_CLASS    = 0x0080;
        const INT_SUBCLASS = 0x0100;
        const INT_PROTOCOL = 0x0200;
    }
}

impl MatchFlags {
    /// The interface-level fields.
    pub fn interface_fields() -> Self {
        MatchFlags::INT_CLASS | MatchFlags::INT_SUBCLASS | MatchFlags::INT_PROTOCOL
    }

    /// Vendor and product together.
    pub fn device_identity() -> Self {
        MatchFlags::VENDOR | MatchFlags::PRODUCT
    }
}

/// One entry of a driver's match table.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsbDeviceId {
    pub match_flags: MatchFlags,
    pub vendor: u16,
    pub product: u16,
    pub bcd_device_lo: u16,
    pub bcd_device_hi: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// Opaque per-entry driver data
    pub driver_info: u64,
}

impl UsbDeviceId {
    /// An entry pinning exactly vendor and product.
    pub fn device(vendor: u16, product: u16) -> Self {
        Self {
            match_flags: MatchFlags::device_identity(),
            vendor,
            product,
            ..Default::default()
        }
    }

    /// An entry matching an interface class triple.
    pub fn interface_info(class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            match_flags: MatchFlags::interface_fields(),
            interface_class: class,
            interface_subclass: subclass,
            interface_protocol: protocol,
            ..Default::default()
        }
    }
}

/// Accept the first table entry matching `interface` of `device`.
pub fn match_interface<'a>(
    table: &'a [UsbDeviceId],
    device: &UsbDevice,
    interface: &UsbHostInterface,
) -> Option<&'a UsbDeviceId> {
    table
        .iter()
        .find(|id| match_one(id, device, interface))
}

fn match_one(id: &UsbDeviceId, device: &UsbDevice, interface: &UsbHostInterface) -> bool {
    let flags = id.match_flags;

    if flags.contains(MatchFlags::VENDOR) && id.vendor != device.vendor_id {
        return false;
    }
    if flags.contains(MatchFlags::PRODUCT) && id.product != device.product_id {
        return false;
    }
    if flags.contains(MatchFlags::DEV_LO) && device.bcd_device < id.bcd_device_lo {
        return false;
    }
    if flags.contains(MatchFlags::DEV_HI) && device.bcd_device > id.bcd_device_hi {
        return false;
    }
    if flags.contains(MatchFlags::DEV_CLASS) && id.device_class != device.class {
        return false;
    }
    if flags.contains(MatchFlags::DEV_SUBCLASS) && id.device_subclass != device.subclass {
        return false;
    }
    if flags.contains(MatchFlags::DEV_PROTOCOL) && id.device_protocol != device.protocol {
        return false;
    }

    // A vendor-specific device cannot be claimed on interface fields
    // alone; the entry must pin vendor+product explicitly.
    if device.class == CLASS_VENDOR_SPEC
        && !flags.contains(MatchFlags::device_identity())
        && flags.intersects(MatchFlags::interface_fields())
    {
        return false;
    }

    if flags.contains(MatchFlags::INT_CLASS) && id.interface_class != interface.class {
        return false;
    }
    if flags.contains(MatchFlags::INT_SUBCLASS) && id.interface_subclass != interface.subclass {
        return false;
    }
    if flags.contains(MatchFlags::INT_PROTOCOL) && id.interface_protocol != interface.protocol {
        return false;
    }

    true
}

/// Whether the configured VID:PID patterns admit this device.
///
/// Patterns look like `0x2040:*` or `0x0fd9:0x0066`; an empty filter
/// list admits everything.
pub fn filter_allows(filters: &[String], vendor: u16, product: u16) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|filter| {
        let Some((vid, pid)) = filter.split_once(':') else {
            return false;
        };
        matches_part(vid, vendor) && matches_part(pid, product)
    })
}

fn matches_part(pattern: &str, value: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let digits = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(digits, 16).is_ok_and(|parsed| parsed == value)
}
