//! In-memory mirror of an enumerated device
//!
//! Built once per attach by walking the native backend's descriptor
//! tables: device → interfaces → one host interface per alternate
//! setting → endpoints. Interface-association groupings are resolved
//! from the configuration's extra descriptor bytes, and the string
//! descriptors are duplicated up front so they live as long as the
//! attachment.

use crate::urb::TransferKind;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Interface-association descriptor type in the config extra bytes.
const DT_INTERFACE_ASSOCIATION: u8 = 0x0b;

/// Timeout for the one-time string descriptor reads.
const STRING_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Negotiated device speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

/// Map the backend speed code, defaulting to full speed when unreported.
pub fn map_device_speed(speed: rusb::Speed) -> UsbSpeed {
    match speed {
        rusb::Speed::Low => UsbSpeed::Low,
        rusb::Speed::Full => UsbSpeed::Full,
        rusb::Speed::High => UsbSpeed::High,
        rusb::Speed::Super => UsbSpeed::Super,
        rusb::Speed::SuperPlus => UsbSpeed::SuperPlus,
        _ => UsbSpeed::Full,
    }
}

/// One endpoint of an alternate setting.
#[derive(Debug, Clone)]
pub struct UsbHostEndpoint {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub kind: TransferKind,
    pub max_packet_size: u16,
    /// Interval exponent from the descriptor
    pub interval: u8,
}

impl UsbHostEndpoint {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

/// One alternate setting of an interface.
#[derive(Debug, Clone)]
pub struct UsbHostInterface {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<UsbHostEndpoint>,
}

/// One interface with all of its alternate settings.
#[derive(Debug, Clone)]
pub struct UsbInterface {
    pub number: u8,
    /// Index into [`UsbDevice::associations`] when grouped
    pub assoc_index: Option<usize>,
    pub alt_settings: Vec<UsbHostInterface>,
}

impl UsbInterface {
    pub fn alt(&self, setting: u8) -> Option<&UsbHostInterface> {
        self.alt_settings.iter().find(|a| a.alt_setting == setting)
    }
}

/// An interface-association grouping.
#[derive(Debug, Clone)]
pub struct InterfaceAssociation {
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
}

impl InterfaceAssociation {
    pub fn contains(&self, interface: u8) -> bool {
        interface >= self.first_interface
            && interface < self.first_interface + self.interface_count
    }
}

/// The mirrored device tree.
#[derive(Debug, Clone)]
pub struct UsbDevice {
    pub bus: u8,
    pub address: u8,
    pub speed: UsbSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number, BCD
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub num_configurations: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub associations: Vec<InterfaceAssociation>,
    pub interfaces: Vec<UsbInterface>,
}

impl UsbDevice {
    pub fn interface(&self, number: u8) -> Option<&UsbInterface> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    /// Find the endpoint `address` within the given alternate settings
    /// (interface number → active alt), falling back to alt 0.
    pub fn endpoint(
        &self,
        address: u8,
        active_alt: impl Fn(u8) -> u8,
    ) -> Option<&UsbHostEndpoint> {
        for interface in &self.interfaces {
            let alt = interface
                .alt(active_alt(interface.number))
                .or_else(|| interface.alt_settings.first())?;
            if let Some(ep) = alt.endpoints.iter().find(|e| e.address == address) {
                return Some(ep);
            }
        }
        None
    }
}

/// Walk the backend descriptors and build the mirror.
pub fn build_device_tree(
    device: &Device<Context>,
    handle: &DeviceHandle<Context>,
) -> Result<UsbDevice, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;

    let associations = parse_interface_associations(config.extra());
    let (manufacturer, product, serial) = read_string_descriptors(handle, &descriptor);

    let mut interfaces = Vec::new();
    for interface in config.interfaces() {
        let number = interface.number();
        let mut alt_settings = Vec::new();
        for alt in interface.descriptors() {
            let endpoints = alt
                .endpoint_descriptors()
                .map(|ep| UsbHostEndpoint {
                    address: ep.address(),
                    kind: map_transfer_type(ep.transfer_type()),
                    max_packet_size: ep.max_packet_size(),
                    interval: ep.interval(),
                })
                .collect();
            alt_settings.push(UsbHostInterface {
                number: alt.interface_number(),
                alt_setting: alt.setting_number(),
                class: alt.class_code(),
                subclass: alt.sub_class_code(),
                protocol: alt.protocol_code(),
                endpoints,
            });
        }
        let assoc_index = associations.iter().position(|a| a.contains(number));
        interfaces.push(UsbInterface {
            number,
            assoc_index,
            alt_settings,
        });
    }

    let version = descriptor.device_version();
    let bcd_device = ((version.major() as u16) << 8)
        | ((version.minor() as u16) << 4)
        | version.sub_minor() as u16;

    debug!(
        "mirrored device {:04x}:{:04x} at {}:{} with {} interfaces, {} associations",
        descriptor.vendor_id(),
        descriptor.product_id(),
        device.bus_number(),
        device.address(),
        interfaces.len(),
        associations.len()
    );

    Ok(UsbDevice {
        bus: device.bus_number(),
        address: device.address(),
        speed: map_device_speed(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device,
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        num_configurations: descriptor.num_configurations(),
        manufacturer,
        product,
        serial,
        associations,
        interfaces,
    })
}

fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Extract interface-association descriptors from the configuration's
/// extra bytes. Malformed trailing bytes are skipped with a warning.
pub fn parse_interface_associations(extra: &[u8]) -> Vec<InterfaceAssociation> {
    let mut associations = Vec::new();
    let mut offset = 0;
    while offset + 2 <= extra.len() {
        let len = extra[offset] as usize;
        if len < 2 || offset + len > extra.len() {
            warn!("malformed descriptor at extra offset {}", offset);
            break;
        }
        let kind = extra[offset + 1];
        if kind == DT_INTERFACE_ASSOCIATION && len >= 8 {
            associations.push(InterfaceAssociation {
                first_interface: extra[offset + 2],
                interface_count: extra[offset + 3],
                function_class: extra[offset + 4],
                function_subclass: extra[offset + 5],
                function_protocol: extra[offset + 6],
            });
        }
        offset += len;
    }
    associations
}

fn read_string_descriptors(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let language = match handle.read_languages(STRING_READ_TIMEOUT) {
        Ok(languages) if !languages.is_empty() => languages[0],
        _ => return (None, None, None),
    };
    // Each descriptor read once; the strings then belong to the tree
    let manufacturer = descriptor.manufacturer_string_index().and_then(|_| {
        handle
            .read_manufacturer_string(language, descriptor, STRING_READ_TIMEOUT)
            .ok()
    });
    let product = descriptor.product_string_index().and_then(|_| {
        handle
            .read_product_string(language, descriptor, STRING_READ_TIMEOUT)
            .ok()
    });
    let serial = descriptor.serial_number_string_index().and_then(|_| {
        handle
            .read_serial_number_string(language, descriptor, STRING_READ_TIMEOUT)
            .ok()
    });
    (manufacturer, product, serial)
}
