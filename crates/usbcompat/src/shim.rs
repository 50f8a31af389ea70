//! The driver-facing shim facade
//!
//! [`UsbCompat`] owns the backend context and the set of attached
//! devices. An [`AttachedDevice`] carries the mirrored descriptor tree,
//! the claimed interfaces, the per-endpoint transfer engines (created
//! lazily on first submission), and the liveness pump that makes device
//! loss fatal. The synchronous `*_msg` helpers wrap the URB machinery
//! behind a completion for drivers that want blocking semantics.

use crate::endpoint::EndpointEngine;
use crate::ids::filter_allows;
use crate::pump::LivenessPump;
use crate::tree::{UsbDevice, UsbHostEndpoint, build_device_tree};
use crate::urb::{SetupPacket, TransferKind, Urb, UrbRef};
use common::{Errno, UsbSettings};
use kcore::{Completion, GiantLock};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Map a backend error onto the kernel-style status set.
pub fn map_usb_error(error: rusb::Error) -> Errno {
    match error {
        rusb::Error::Timeout => Errno::TimedOut,
        rusb::Error::Pipe => Errno::Pipe,
        rusb::Error::NoDevice => Errno::NoDev,
        rusb::Error::NotFound => Errno::NoEnt,
        rusb::Error::Busy => Errno::Busy,
        rusb::Error::InvalidParam => Errno::Inval,
        rusb::Error::Access => Errno::Perm,
        rusb::Error::NoMem => Errno::NoMem,
        rusb::Error::Interrupted => Errno::Intr,
        _ => Errno::Io,
    }
}

/// The shim entry point: backend context plus attached devices.
pub struct UsbCompat {
    lock: Arc<GiantLock>,
    settings: UsbSettings,
    context: Context,
    devices: Mutex<HashMap<(u8, u8), Arc<AttachedDevice>>>,
}

impl UsbCompat {
    pub fn new(lock: Arc<GiantLock>, settings: UsbSettings) -> Result<Self, Errno> {
        let context = Context::new().map_err(map_usb_error)?;
        Ok(Self {
            lock,
            settings,
            context,
            devices: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Enumerate `(bus, address, vendor, product)` of every device the
    /// configured filters admit.
    pub fn list_devices(&self) -> Result<Vec<(u8, u8, u16, u16)>, Errno> {
        let devices = self.context.devices().map_err(map_usb_error)?;
        let mut out = Vec::new();
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            let (vendor, product) = (descriptor.vendor_id(), descriptor.product_id());
            if filter_allows(&self.settings.filters, vendor, product) {
                out.push((device.bus_number(), device.address(), vendor, product));
            }
        }
        Ok(out)
    }

    /// Attach the device at `(bus, address)`: open it, mirror its
    /// descriptor tree, claim its interfaces, start its liveness pump.
    pub fn attach(&self, bus: u8, address: u8) -> Result<Arc<AttachedDevice>, Errno> {
        if let Some(existing) = self.devices.lock().unwrap().get(&(bus, address)) {
            return Ok(existing.clone());
        }

        let devices = self.context.devices().map_err(map_usb_error)?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or(Errno::NoDev)?;

        let descriptor = device.device_descriptor().map_err(map_usb_error)?;
        if !filter_allows(
            &self.settings.filters,
            descriptor.vendor_id(),
            descriptor.product_id(),
        ) {
            warn!(
                "device {:04x}:{:04x} excluded by filters",
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            return Err(Errno::Perm);
        }

        let handle = device.open().map_err(map_usb_error)?;
        let _ = handle.set_auto_detach_kernel_driver(true);

        let tree = build_device_tree(&device, &handle).map_err(map_usb_error)?;

        let mut claimed = Vec::new();
        for interface in &tree.interfaces {
            match handle.claim_interface(interface.number) {
                Ok(()) => claimed.push(interface.number),
                Err(error) => {
                    warn!("failed to claim interface {}: {}", interface.number, error);
                    for number in &claimed {
                        let _ = handle.release_interface(*number);
                    }
                    return Err(map_usb_error(error));
                }
            }
        }

        let handle = Arc::new(handle);
        let label = format!("{:04x}:{:04x}", tree.vendor_id, tree.product_id);
        let liveness = LivenessPump::spawn(handle.clone(), label.clone());

        let attached = Arc::new(AttachedDevice {
            lock: self.lock.clone(),
            settings: self.settings.clone(),
            tree,
            handle,
            claimed,
            current_alts: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            liveness,
        });
        self.devices
            .lock()
            .unwrap()
            .insert((bus, address), attached.clone());

        info!("attached {} at {}:{}", label, bus, address);
        Ok(attached)
    }

    /// Detach a device, tearing down its endpoints and releasing its
    /// interfaces.
    pub fn detach(&self, bus: u8, address: u8) {
        let removed = self.devices.lock().unwrap().remove(&(bus, address));
        if let Some(device) = removed {
            device.shutdown();
            info!("detached device at {}:{}", bus, address);
        }
    }

    pub fn attached_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }
}

/// One attached device: mirrored tree, claimed interfaces, endpoint
/// engines, liveness pump.
pub struct AttachedDevice {
    lock: Arc<GiantLock>,
    settings: UsbSettings,
    tree: UsbDevice,
    handle: Arc<DeviceHandle<Context>>,
    claimed: Vec<u8>,
    /// Active alternate setting per interface number (absent ⇒ 0)
    current_alts: Mutex<HashMap<u8, u8>>,
    endpoints: Mutex<HashMap<u8, Arc<EndpointEngine>>>,
    liveness: LivenessPump,
}

impl AttachedDevice {
    pub fn tree(&self) -> &UsbDevice {
        &self.tree
    }

    fn active_alt(&self, interface: u8) -> u8 {
        *self.current_alts.lock().unwrap().get(&interface).unwrap_or(&0)
    }

    fn endpoint_descriptor(&self, address: u8) -> Option<UsbHostEndpoint> {
        self.tree
            .endpoint(address, |intf| self.active_alt(intf))
            .cloned()
    }

    /// Submit a URB, setting its endpoint up on demand.
    pub fn submit(&self, urb: &UrbRef) -> Result<(), Errno> {
        let address = urb.lock().unwrap().endpoint;
        let engine = self.engine_for(address, urb)?;
        engine.submit(urb)
    }

    /// Unlink a URB from its endpoint; see [`EndpointEngine::unlink`].
    pub fn unlink(&self, urb: &UrbRef, drain: bool) {
        let address = urb.lock().unwrap().endpoint;
        let engine = self.endpoints.lock().unwrap().get(&address).cloned();
        if let Some(engine) = engine {
            engine.unlink(urb, drain);
        }
    }

    fn engine_for(&self, address: u8, urb: &UrbRef) -> Result<Arc<EndpointEngine>, Errno> {
        if let Some(engine) = self.endpoints.lock().unwrap().get(&address) {
            return Ok(engine.clone());
        }

        // The default pipe carries no endpoint descriptor of its own
        let descriptor = if address & 0x7f == 0 {
            UsbHostEndpoint {
                address: 0,
                kind: TransferKind::Control,
                max_packet_size: 64,
                interval: 0,
            }
        } else {
            self.endpoint_descriptor(address).ok_or(Errno::NoEnt)?
        };
        let requested = urb.lock().unwrap().buffer.len();

        self.lock.lock();
        let engine = {
            let mut endpoints = self.endpoints.lock().unwrap();
            match endpoints.get(&address) {
                Some(engine) => engine.clone(),
                None => {
                    let engine = Arc::new(EndpointEngine::new(
                        self.lock.clone(),
                        Some(self.handle.clone()),
                        &descriptor,
                        self.tree.speed,
                        requested,
                        &self.settings,
                    ));
                    endpoints.insert(address, engine.clone());
                    engine
                }
            }
        };
        self.lock.unlock();
        Ok(engine)
    }

    /// Select an alternate setting, tearing down the endpoints of the
    /// one it replaces (which implicitly cancels anything in flight).
    pub fn set_interface(&self, interface: u8, alt: u8) -> Result<(), Errno> {
        let intf = self.tree.interface(interface).ok_or(Errno::NoEnt)?;
        intf.alt(alt).ok_or(Errno::NoEnt)?;

        let old_alt = self.active_alt(interface);
        if let Some(old) = intf.alt(old_alt) {
            self.close_endpoints(old.endpoints.iter().map(|e| e.address));
        }

        self.handle
            .set_alternate_setting(interface, alt)
            .map_err(map_usb_error)?;
        self.current_alts.lock().unwrap().insert(interface, alt);
        debug!("interface {} switched to alt {}", interface, alt);
        Ok(())
    }

    /// Release one interface, tearing down its endpoints first.
    pub fn release_interface(&self, interface: u8) -> Result<(), Errno> {
        if let Some(intf) = self.tree.interface(interface) {
            let alt = self.active_alt(interface);
            if let Some(host) = intf.alt(alt).or_else(|| intf.alt_settings.first()) {
                self.close_endpoints(host.endpoints.iter().map(|e| e.address));
            }
        }
        self.handle
            .release_interface(interface)
            .map_err(map_usb_error)
    }

    fn close_endpoints(&self, addresses: impl Iterator<Item = u8>) {
        let engines: Vec<Arc<EndpointEngine>> = {
            let mut endpoints = self.endpoints.lock().unwrap();
            addresses.filter_map(|a| endpoints.remove(&a)).collect()
        };
        for engine in engines {
            engine.close();
        }
    }

    /// Explicit stall recovery for one endpoint.
    pub fn clear_halt(&self, endpoint: u8) -> Result<(), Errno> {
        self.handle.clear_halt(endpoint).map_err(map_usb_error)
    }

    /// Synchronous control transfer over the URB machinery.
    pub fn control_msg(
        &self,
        setup: SetupPacket,
        data: &mut [u8],
        timeout_ms: u64,
    ) -> Result<usize, Errno> {
        let buffer = if setup.is_in() {
            vec![0u8; data.len().max(setup.length as usize)]
        } else {
            data.to_vec()
        };
        let (urb, done) = self.completed_urb(Urb::control(setup, buffer, None));
        self.submit(&urb)?;
        self.wait_msg(&urb, &done, timeout_ms, setup.is_in(), data)
    }

    /// Synchronous bulk transfer.
    pub fn bulk_msg(&self, endpoint: u8, data: &mut [u8], timeout_ms: u64) -> Result<usize, Errno> {
        let is_in = endpoint & 0x80 != 0;
        let buffer = if is_in {
            vec![0u8; data.len()]
        } else {
            data.to_vec()
        };
        let (urb, done) = self.completed_urb(Urb::bulk(endpoint, buffer, None));
        self.submit(&urb)?;
        self.wait_msg(&urb, &done, timeout_ms, is_in, data)
    }

    /// Synchronous interrupt transfer.
    pub fn interrupt_msg(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout_ms: u64,
    ) -> Result<usize, Errno> {
        let is_in = endpoint & 0x80 != 0;
        let buffer = if is_in {
            vec![0u8; data.len()]
        } else {
            data.to_vec()
        };
        let (urb, done) = self.completed_urb(Urb::interrupt(endpoint, buffer, 1, None));
        self.submit(&urb)?;
        self.wait_msg(&urb, &done, timeout_ms, is_in, data)
    }

    fn completed_urb(&self, urb: UrbRef) -> (UrbRef, Arc<Completion>) {
        let done = Arc::new(Completion::new(self.lock.clone()));
        let signal = done.clone();
        urb.lock().unwrap().complete = Some(Arc::new(move |_urb: &UrbRef| signal.complete()));
        (urb, done)
    }

    fn wait_msg(
        &self,
        urb: &UrbRef,
        done: &Completion,
        timeout_ms: u64,
        is_in: bool,
        data: &mut [u8],
    ) -> Result<usize, Errno> {
        if !done.wait_timeout(timeout_ms) {
            // Force early termination and wait out the slot before the
            // caller's buffer goes away
            self.unlink(urb, true);
            return Err(Errno::TimedOut);
        }
        let u = urb.lock().unwrap();
        u.status.to_result()?;
        if is_in {
            let n = u.actual_length.min(data.len());
            data[..n].copy_from_slice(&u.buffer[..n]);
        }
        Ok(u.actual_length)
    }

    /// Tear everything down: endpoints, liveness pump, interfaces.
    pub fn shutdown(&self) {
        let engines: Vec<Arc<EndpointEngine>> = {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints.drain().map(|(_, engine)| engine).collect()
        };
        for engine in engines {
            engine.close();
        }
        self.liveness.stop();
        for interface in &self.claimed {
            let _ = self.handle.release_interface(*interface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_usb_error() {
        assert_eq!(map_usb_error(rusb::Error::Timeout), Errno::TimedOut);
        assert_eq!(map_usb_error(rusb::Error::Pipe), Errno::Pipe);
        assert_eq!(map_usb_error(rusb::Error::NoDevice), Errno::NoDev);
        assert_eq!(map_usb_error(rusb::Error::NotFound), Errno::NoEnt);
        assert_eq!(map_usb_error(rusb::Error::Busy), Errno::Busy);
        assert_eq!(map_usb_error(rusb::Error::Access), Errno::Perm);
        assert_eq!(map_usb_error(rusb::Error::Other), Errno::Io);
    }
}
